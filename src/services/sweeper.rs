use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::StoreError;
use crate::ledger::{LedgerStore, LedgerTx, Transition};
use crate::models::{CountDelta, EventId, Seat, SeatId};

/// How often the sweep runs and how hard it drains a backlog.
#[derive(Debug, Clone, Copy)]
pub struct SweepSchedule {
    pub interval: Duration,
    /// Consecutive full batches allowed within one tick.
    pub max_runs_per_tick: u32,
}

impl Default for SweepSchedule {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_runs_per_tick: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRelease {
    pub event_id: EventId,
    pub released: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Expired seats fetched in this run's batch.
    pub scanned: usize,
    /// Seats actually returned to AVAILABLE.
    pub released: u64,
    pub events: Vec<EventRelease>,
    pub failed_events: Vec<EventId>,
}

impl SweepReport {
    pub fn is_noop(&self) -> bool {
        self.scanned == 0
    }

    /// Events whose counters changed in this run.
    pub fn touched_events(&self) -> impl Iterator<Item = EventId> + '_ {
        self.events.iter().filter(|e| e.released > 0).map(|e| e.event_id)
    }
}

/// Reclaims holds whose expiry has passed.
///
/// Each run scans one bounded batch, oldest expiry first, and reclaims it in
/// one transaction per event. A failing event group is logged and skipped;
/// the other groups of the same run still commit.
pub struct ExpirySweeper<S> {
    store: S,
    clock: Arc<dyn Clock>,
    batch_size: i64,
}

impl<S: LedgerStore> ExpirySweeper<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, batch_size: i64) -> Self {
        Self {
            store,
            clock,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn run_once(&self) -> Result<SweepReport, StoreError> {
        let now = self.clock.now();

        let expired: Vec<Seat> = self.store.find_expired(now, self.batch_size).try_collect().await?;
        if expired.is_empty() {
            debug!("No expired holds to release");
            return Ok(SweepReport::default());
        }

        info!("Found {} expired holds to release", expired.len());

        let mut by_event: BTreeMap<EventId, Vec<SeatId>> = BTreeMap::new();
        for seat in &expired {
            by_event.entry(seat.event_id).or_default().push(seat.id);
        }

        let mut report = SweepReport {
            scanned: expired.len(),
            ..SweepReport::default()
        };

        for (event_id, seat_ids) in by_event {
            match self.reclaim_group(event_id, &seat_ids, now).await {
                Ok(released) => {
                    if released < seat_ids.len() as u64 {
                        // Confirmed or released between the scan and this transaction.
                        debug!(
                            "Event {}: {} of {} expired seats already resolved",
                            event_id,
                            seat_ids.len() as u64 - released,
                            seat_ids.len()
                        );
                    }
                    info!("Released {} expired seats for event {}", released, event_id);
                    report.released += released;
                    report.events.push(EventRelease { event_id, released });
                }
                Err(e) => {
                    error!("Failed to release expired holds for event {}: {}", event_id, e);
                    report.failed_events.push(event_id);
                }
            }
        }

        Ok(report)
    }

    async fn reclaim_group(&self, event_id: EventId, seat_ids: &[SeatId], now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tx = self.store.begin().await?;
        match reclaim_in(&mut tx, event_id, seat_ids, now).await {
            Ok(released) => {
                tx.commit().await?;
                Ok(released)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("Rollback of sweep for event {} failed: {}", event_id, rollback_err);
                }
                Err(e)
            }
        }
    }

    /// Runs until `shutdown` flips or its sender is dropped. `on_report` sees
    /// every run that found something.
    pub fn spawn<F, Fut>(self, schedule: SweepSchedule, mut shutdown: watch::Receiver<bool>, on_report: F) -> JoinHandle<()>
    where
        F: Fn(SweepReport) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        tokio::spawn(async move {
            info!(
                "Expiry sweeper started: every {:?}, batch {}",
                schedule.interval, self.batch_size
            );
            let mut ticker = tokio::time::interval(schedule.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                self.tick(&schedule, &on_report).await;
            }

            info!("Expiry sweeper stopped");
        })
    }

    async fn tick<F, Fut>(&self, schedule: &SweepSchedule, on_report: &F)
    where
        F: Fn(SweepReport) -> Fut,
        Fut: Future<Output = ()>,
    {
        for _ in 0..schedule.max_runs_per_tick.max(1) {
            match self.run_once().await {
                Ok(report) => {
                    let batch_full = report.scanned as i64 >= self.batch_size;
                    if !report.is_noop() {
                        on_report(report).await;
                    }
                    if !batch_full {
                        break;
                    }
                }
                Err(e) => {
                    error!("Expiry sweep failed: {}", e);
                    break;
                }
            }
        }
    }
}

async fn reclaim_in<T: LedgerTx>(
    tx: &mut T,
    event_id: EventId,
    seat_ids: &[SeatId],
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let released = tx.transition_many(seat_ids, &Transition::Reclaim { now }).await?;
    if released > 0 {
        tx.adjust_counts(event_id, CountDelta::release(released)).await?;
    }
    Ok(released)
}
