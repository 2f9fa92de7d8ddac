use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

use crate::services::lease::LeasePolicy;
use crate::services::sweeper::SweepSchedule;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Source(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// Main configuration, one section per concern
#[derive(Debug, Clone)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub leasing: LeasingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(ConfigError::Invalid(format!("LOG_FORMAT must be pretty or json, got '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub rust_log: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
}

// Redis is optional; without it the details endpoint always reads through
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: Option<String>,
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct LeasingConfig {
    pub hold_duration_minutes: i64,
    pub max_seats_per_booking: usize,
    pub sweep_interval_secs: u64,
    pub sweep_batch_size: i64,
    pub sweep_max_runs_per_tick: u32,
    pub max_event_capacity: i64,
}

impl LeasingConfig {
    pub fn policy(&self) -> LeasePolicy {
        LeasePolicy {
            hold_duration: chrono::Duration::minutes(self.hold_duration_minutes),
            max_seats_per_lease: self.max_seats_per_booking,
        }
    }

    pub fn schedule(&self) -> SweepSchedule {
        SweepSchedule {
            interval: Duration::from_secs(self.sweep_interval_secs),
            max_runs_per_tick: self.sweep_max_runs_per_tick,
        }
    }
}

/// Flat view of the environment, keys lowercased by `config::Environment`.
#[derive(Debug, Deserialize)]
struct EnvVars {
    host: String,
    port: u16,
    environment: String,
    rust_log: String,
    log_format: String,
    database_url: Option<String>,
    db_pool_size: u32,
    redis_url: Option<String>,
    cache_ttl_secs: u64,
    hold_duration_minutes: i64,
    max_seats_per_booking: usize,
    sweep_interval_secs: u64,
    sweep_batch_size: i64,
    sweep_max_runs_per_tick: u32,
    max_event_capacity: i64,
}

impl Config {
    /// Reads the process environment (after `.env` has been loaded).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(config::Environment::default())
    }

    pub fn load(env: config::Environment) -> Result<Self, ConfigError> {
        let vars: EnvVars = config::Config::builder()
            .set_default("host", "0.0.0.0")?
            .set_default("port", 8000_i64)?
            .set_default("environment", "development")?
            .set_default("rust_log", "seat_lease=debug,tower_http=debug")?
            .set_default("log_format", "pretty")?
            .set_default("db_pool_size", 20_i64)?
            .set_default("cache_ttl_secs", 30_i64)?
            .set_default("hold_duration_minutes", 5_i64)?
            .set_default("max_seats_per_booking", 10_i64)?
            .set_default("sweep_interval_secs", 60_i64)?
            .set_default("sweep_batch_size", 500_i64)?
            .set_default("sweep_max_runs_per_tick", 10_i64)?
            .set_default("max_event_capacity", 10_000_i64)?
            .add_source(env.try_parsing(true))
            .build()?
            .try_deserialize()?;

        let database_url = vars
            .database_url
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| ConfigError::Invalid("DATABASE_URL must be set".into()))?;

        positive("DB_POOL_SIZE", vars.db_pool_size as i64)?;
        positive("HOLD_DURATION_MINUTES", vars.hold_duration_minutes)?;
        positive("MAX_SEATS_PER_BOOKING", vars.max_seats_per_booking as i64)?;
        positive("SWEEP_INTERVAL_SECS", vars.sweep_interval_secs as i64)?;
        positive("SWEEP_BATCH_SIZE", vars.sweep_batch_size)?;
        positive("SWEEP_MAX_RUNS_PER_TICK", vars.sweep_max_runs_per_tick as i64)?;
        positive("MAX_EVENT_CAPACITY", vars.max_event_capacity)?;

        Ok(Config {
            app: AppConfig {
                host: vars.host,
                port: vars.port,
                environment: vars.environment,
                rust_log: vars.rust_log,
                log_format: vars.log_format.parse()?,
            },
            database: DatabaseConfig {
                url: database_url,
                pool_size: vars.db_pool_size,
            },
            redis: RedisConfig {
                url: vars.redis_url.filter(|url| !url.trim().is_empty()),
                cache_ttl_secs: vars.cache_ttl_secs,
            },
            leasing: LeasingConfig {
                hold_duration_minutes: vars.hold_duration_minutes,
                max_seats_per_booking: vars.max_seats_per_booking,
                sweep_interval_secs: vars.sweep_interval_secs,
                sweep_batch_size: vars.sweep_batch_size,
                sweep_max_runs_per_tick: vars.sweep_max_runs_per_tick,
                max_event_capacity: vars.max_event_capacity,
            },
        })
    }
}

fn positive(name: &str, value: i64) -> Result<(), ConfigError> {
    if value <= 0 {
        return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
    }
    Ok(())
}
