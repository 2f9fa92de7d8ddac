mod common;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::{mpsc, watch};

use common::{labels, Fixture};
use seat_lease::error::StoreError;
use seat_lease::ledger::{LedgerStore, LedgerTx, MemoryLedger, SeatQuery, Transition};
use seat_lease::ledger::memory::MemoryTx;
use seat_lease::models::{CountDelta, Event, EventId, LeaseOwner, NewEvent, Seat, SeatCounts, SeatId, SeatState};
use seat_lease::services::sweeper::{ExpirySweeper, SweepSchedule};

#[tokio::test]
async fn sweep_is_idempotent() {
    let fx = Fixture::new();
    let event_id = fx.event(10).await;
    for label in ["A1", "A2", "A3"] {
        fx.leases
            .hold(event_id, &labels(&[label]), LeaseOwner::generate(), Duration::minutes(1))
            .await
            .unwrap();
    }

    fx.clock.advance(Duration::minutes(2));
    let sweeper = fx.sweeper(100);

    let first = sweeper.run_once().await.unwrap();
    assert_eq!(first.scanned, 3);
    assert_eq!(first.released, 3);
    assert_eq!(first.touched_events().collect::<Vec<_>>(), vec![event_id]);

    let second = sweeper.run_once().await.unwrap();
    assert!(second.is_noop());
    assert_eq!(fx.counts(event_id).await, SeatCounts { available: 10, held: 0, booked: 0 });
    fx.assert_invariants(event_id).await;
}

#[tokio::test]
async fn only_expired_holds_are_reclaimed() {
    let fx = Fixture::new();
    let event_id = fx.event(10).await;
    let short = LeaseOwner::generate();
    let long = LeaseOwner::generate();
    let booked = LeaseOwner::generate();

    fx.leases.hold(event_id, &labels(&["A1"]), short, Duration::minutes(1)).await.unwrap();
    fx.leases.hold(event_id, &labels(&["A2"]), long, Duration::minutes(30)).await.unwrap();
    fx.leases.hold(event_id, &labels(&["A3"]), booked, Duration::minutes(1)).await.unwrap();
    fx.leases.confirm(booked).await.unwrap();

    fx.clock.advance(Duration::minutes(5));
    let report = fx.sweeper(100).run_once().await.unwrap();

    assert_eq!(report.released, 1);
    assert_eq!(fx.state_of(event_id, "A1"), SeatState::Available);
    assert_eq!(fx.state_of(event_id, "A2"), SeatState::Held);
    assert_eq!(fx.state_of(event_id, "A3"), SeatState::Booked);
    assert_eq!(fx.counts(event_id).await, SeatCounts { available: 8, held: 1, booked: 1 });
}

#[tokio::test]
async fn batches_are_bounded_and_oldest_first() {
    let fx = Fixture::new();
    let event_id = fx.event(10).await;
    for (minutes, label) in [(3, "A1"), (1, "A2"), (2, "A3")] {
        fx.leases
            .hold(event_id, &labels(&[label]), LeaseOwner::generate(), Duration::minutes(minutes))
            .await
            .unwrap();
    }

    fx.clock.advance(Duration::minutes(10));
    let sweeper = fx.sweeper(2);

    let first = sweeper.run_once().await.unwrap();
    assert_eq!(first.scanned, 2);
    assert_eq!(fx.state_of(event_id, "A1"), SeatState::Held);
    assert_eq!(fx.state_of(event_id, "A2"), SeatState::Available);
    assert_eq!(fx.state_of(event_id, "A3"), SeatState::Available);

    let second = sweeper.run_once().await.unwrap();
    assert_eq!(second.released, 1);
    fx.assert_invariants(event_id).await;
}

#[tokio::test]
async fn groups_are_swept_per_event() {
    let fx = Fixture::new();
    let first_event = fx.event(5).await;
    let second_event = fx.event(5).await;

    fx.leases
        .hold(first_event, &labels(&["A1", "A2"]), LeaseOwner::generate(), Duration::minutes(1))
        .await
        .unwrap();
    fx.leases
        .hold(second_event, &labels(&["A4"]), LeaseOwner::generate(), Duration::minutes(1))
        .await
        .unwrap();

    fx.clock.advance(Duration::minutes(2));
    let report = fx.sweeper(100).run_once().await.unwrap();

    assert_eq!(report.released, 3);
    assert_eq!(report.events.len(), 2);
    assert!(report.failed_events.is_empty());
    fx.assert_invariants(first_event).await;
    fx.assert_invariants(second_event).await;
}

#[tokio::test]
async fn a_failing_event_group_does_not_block_the_others() {
    let fx = Fixture::new();
    let healthy = fx.event(5).await;
    let broken = fx.event(5).await;

    fx.leases
        .hold(healthy, &labels(&["A1"]), LeaseOwner::generate(), Duration::minutes(1))
        .await
        .unwrap();
    fx.leases
        .hold(broken, &labels(&["A1"]), LeaseOwner::generate(), Duration::minutes(1))
        .await
        .unwrap();
    fx.clock.advance(Duration::minutes(2));

    let store = FailingCounters { inner: fx.ledger.clone(), broken };
    let sweeper = ExpirySweeper::new(store, Arc::new(fx.clock.clone()), 100);
    let report = sweeper.run_once().await.unwrap();

    assert_eq!(report.failed_events, vec![broken]);
    assert_eq!(report.released, 1);
    assert_eq!(fx.state_of(healthy, "A1"), SeatState::Available);
    // Rolled back as a unit: seat still HELD and counters untouched.
    assert_eq!(fx.state_of(broken, "A1"), SeatState::Held);
    fx.assert_invariants(broken).await;

    // The plain ledger picks it up on the next run.
    let retry = fx.sweeper(100).run_once().await.unwrap();
    assert_eq!(retry.released, 1);
    fx.assert_invariants(broken).await;
}

#[tokio::test]
async fn spawned_sweeper_drains_backlog_and_stops_on_shutdown() {
    let fx = Fixture::new();
    let event_id = fx.event(10).await;
    for label in ["A1", "A2", "A3", "A4", "A5"] {
        fx.leases
            .hold(event_id, &labels(&[label]), LeaseOwner::generate(), Duration::minutes(1))
            .await
            .unwrap();
    }
    fx.clock.advance(Duration::minutes(2));

    let (report_tx, mut report_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let schedule = SweepSchedule {
        interval: StdDuration::from_millis(20),
        max_runs_per_tick: 10,
    };
    let handle = fx.sweeper(2).spawn(schedule, shutdown_rx, move |report| {
        let report_tx = report_tx.clone();
        async move {
            let _ = report_tx.send(report);
        }
    });

    let mut released = 0;
    while released < 5 {
        let report = tokio::time::timeout(StdDuration::from_secs(5), report_rx.recv())
            .await
            .expect("sweeper report")
            .expect("channel open");
        released += report.released;
    }
    assert_eq!(released, 5);
    fx.assert_invariants(event_id).await;

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(StdDuration::from_secs(5), handle)
        .await
        .expect("sweeper stops")
        .unwrap();
}

/// Ledger whose counter updates fail for one event.
#[derive(Clone)]
struct FailingCounters {
    inner: MemoryLedger,
    broken: EventId,
}

struct FailingTx {
    inner: MemoryTx,
    broken: EventId,
}

#[async_trait]
impl LedgerStore for FailingCounters {
    type Tx = FailingTx;

    async fn begin(&self) -> Result<FailingTx, StoreError> {
        Ok(FailingTx {
            inner: self.inner.begin().await?,
            broken: self.broken,
        })
    }

    async fn get_event(&self, event_id: EventId) -> Result<Option<Event>, StoreError> {
        self.inner.get_event(event_id).await
    }

    async fn list_events(&self, offset: i64, limit: i64) -> Result<(Vec<Event>, i64), StoreError> {
        self.inner.list_events(offset, limit).await
    }

    async fn list_seats(&self, event_id: EventId, query: SeatQuery) -> Result<(Vec<Seat>, i64), StoreError> {
        self.inner.list_seats(event_id, query).await
    }

    fn find_expired(&self, now: DateTime<Utc>, limit: i64) -> BoxStream<'_, Result<Seat, StoreError>> {
        self.inner.find_expired(now, limit)
    }
}

#[async_trait]
impl LedgerTx for FailingTx {
    async fn get_event(&mut self, event_id: EventId) -> Result<Option<Event>, StoreError> {
        self.inner.get_event(event_id).await
    }

    async fn lock_event(&mut self, event_id: EventId) -> Result<Option<Event>, StoreError> {
        self.inner.lock_event(event_id).await
    }

    async fn find_available(&mut self, event_id: EventId, labels: &[String]) -> Result<Vec<Seat>, StoreError> {
        self.inner.find_available(event_id, labels).await
    }

    async fn find_leased(&mut self, owner: LeaseOwner, state: SeatState) -> Result<Vec<Seat>, StoreError> {
        self.inner.find_leased(owner, state).await
    }

    async fn owner_in_use(&mut self, owner: LeaseOwner) -> Result<bool, StoreError> {
        self.inner.owner_in_use(owner).await
    }

    async fn transition_many(&mut self, seat_ids: &[SeatId], transition: &Transition) -> Result<u64, StoreError> {
        self.inner.transition_many(seat_ids, transition).await
    }

    async fn adjust_counts(&mut self, event_id: EventId, delta: CountDelta) -> Result<(), StoreError> {
        if event_id == self.broken {
            return Err(StoreError::Corrupt(format!("counter row of event {event_id} is locked")));
        }
        self.inner.adjust_counts(event_id, delta).await
    }

    async fn count_seats(&mut self, event_id: EventId) -> Result<SeatCounts, StoreError> {
        self.inner.count_seats(event_id).await
    }

    async fn overwrite_counts(&mut self, event_id: EventId, counts: SeatCounts) -> Result<(), StoreError> {
        self.inner.overwrite_counts(event_id, counts).await
    }

    async fn insert_event(&mut self, new_event: &NewEvent) -> Result<Event, StoreError> {
        self.inner.insert_event(new_event).await
    }

    async fn insert_seats(&mut self, event_id: EventId, labels: &[String]) -> Result<u64, StoreError> {
        self.inner.insert_seats(event_id, labels).await
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.inner.commit().await
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.inner.rollback().await
    }
}
