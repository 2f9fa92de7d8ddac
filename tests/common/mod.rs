#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

use seat_lease::clock::ManualClock;
use seat_lease::ledger::{LedgerStore, MemoryLedger};
use seat_lease::models::{EventId, NewEvent, SeatCounts, SeatState};
use seat_lease::services::catalog::Catalog;
use seat_lease::services::lease::{LeaseManager, LeasePolicy};
use seat_lease::services::sweeper::ExpirySweeper;

pub struct Fixture {
    pub ledger: MemoryLedger,
    pub clock: ManualClock,
    pub leases: LeaseManager<MemoryLedger>,
    pub catalog: Catalog<MemoryLedger>,
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 18, 0, 0).unwrap()
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_policy(LeasePolicy::default())
    }

    pub fn with_policy(policy: LeasePolicy) -> Self {
        let ledger = MemoryLedger::new();
        let clock = ManualClock::new(t0());
        Self {
            leases: LeaseManager::new(ledger.clone(), Arc::new(clock.clone()), policy),
            catalog: Catalog::new(ledger.clone(), Arc::new(clock.clone()), 10_000),
            ledger,
            clock,
        }
    }

    pub async fn event(&self, capacity: i64) -> EventId {
        self.catalog
            .create_event(NewEvent {
                title: "Evening show".into(),
                starts_at: t0() + Duration::days(7),
                capacity,
            })
            .await
            .unwrap()
            .id
    }

    pub fn sweeper(&self, batch_size: i64) -> ExpirySweeper<MemoryLedger> {
        ExpirySweeper::new(self.ledger.clone(), Arc::new(self.clock.clone()), batch_size)
    }

    pub async fn counts(&self, event_id: EventId) -> SeatCounts {
        self.ledger.get_event(event_id).await.unwrap().unwrap().counts()
    }

    pub fn state_of(&self, event_id: EventId, label: &str) -> SeatState {
        self.ledger.seat_by_label(event_id, label).unwrap().state
    }

    /// Stored counters match the seats, sum to capacity, and every seat is
    /// internally consistent.
    pub async fn assert_invariants(&self, event_id: EventId) {
        let event = self.ledger.get_event(event_id).await.unwrap().unwrap();
        let seats = self.ledger.seats_of(event_id);

        let mut derived = SeatCounts::default();
        for seat in &seats {
            assert!(seat.is_consistent(), "inconsistent seat {seat:?}");
            match seat.state {
                SeatState::Available => derived.available += 1,
                SeatState::Held => derived.held += 1,
                SeatState::Booked => derived.booked += 1,
            }
        }

        assert_eq!(event.counts(), derived, "counters drifted for event {event_id}");
        assert_eq!(derived.total(), event.capacity);
    }
}

pub fn labels(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
