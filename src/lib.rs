pub mod cache;
pub mod clock;
pub mod config;
pub mod controllers;
pub mod database;
pub mod error;
pub mod ledger;
pub mod models;
pub mod redis_client;
pub mod services;

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::CacheService;
use crate::clock::Clock;
use crate::ledger::{LedgerStore, PgLedger};
use crate::models::EventId;
use crate::services::catalog::Catalog;
use crate::services::lease::{LeaseManager, LeasePolicy};
use crate::services::sweeper::{ExpirySweeper, SweepSchedule};

// Shared state for the whole application
pub struct AppState<S: LedgerStore = PgLedger> {
    pub store: S,
    pub leases: LeaseManager<S>,
    pub catalog: Catalog<S>,
    pub cache: Option<CacheService>,
    pub clock: Arc<dyn Clock>,
}

impl<S: LedgerStore> AppState<S> {
    pub fn new(
        store: S,
        clock: Arc<dyn Clock>,
        policy: LeasePolicy,
        max_event_capacity: i64,
        cache: Option<CacheService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            leases: LeaseManager::new(store.clone(), clock.clone(), policy),
            catalog: Catalog::new(store.clone(), clock.clone(), max_event_capacity),
            store,
            cache,
            clock,
        })
    }

    /// Drops cached details after a write touched the event's seats.
    pub async fn invalidate_event(&self, event_id: EventId) {
        if let Some(cache) = &self.cache {
            cache.invalidate_event(event_id).await;
        }
    }

    /// Starts the expiry sweeper; every event it touches loses its cached details.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        batch_size: i64,
        schedule: SweepSchedule,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let sweeper = ExpirySweeper::new(self.store.clone(), self.clock.clone(), batch_size);
        let state = Arc::clone(self);

        sweeper.spawn(schedule, shutdown, move |report| {
            let state = Arc::clone(&state);
            async move {
                if let Some(cache) = &state.cache {
                    cache.invalidate_events(report.touched_events()).await;
                }
            }
        })
    }
}
