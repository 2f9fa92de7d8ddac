use crate::redis_client::RedisClient;

pub mod events;

/// Read-through cache for event details. Purely an optimisation: every
/// failure is logged and the caller falls back to the ledger.
#[derive(Clone)]
pub struct CacheService {
    redis: RedisClient,
    ttl_secs: u64,
}

impl CacheService {
    pub fn new(redis: RedisClient, ttl_secs: u64) -> Self {
        Self {
            redis,
            ttl_secs: ttl_secs.max(1),
        }
    }
}
