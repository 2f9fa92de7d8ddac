//! Storage seam for seats and per-event counters.
//!
//! A [`LedgerStore`] hands out [`LedgerTx`] units of work. Everything a lease
//! operation writes (seat transitions and the matching counter deltas) goes
//! through one `LedgerTx` and is committed or rolled back together.
//!
//! Races are resolved by the guarded bulk update in
//! [`LedgerTx::transition_many`]: it only touches rows that still satisfy the
//! transition's guard and reports how many it changed. Callers compare that
//! count with what they expected instead of trusting an earlier read.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Deserialize;

use crate::error::StoreError;
use crate::models::{CountDelta, Event, EventId, LeaseOwner, NewEvent, Seat, SeatCounts, SeatId, SeatState};

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

/// Guarded seat transitions. Each variant names the only source state it
/// accepts plus any extra guard it re-checks at write time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// AVAILABLE -> HELD.
    Hold { owner: LeaseOwner, expiry: DateTime<Utc> },
    /// HELD by `owner` and not expired at `now` -> BOOKED. Keeps the owner.
    Book { owner: LeaseOwner, now: DateTime<Utc> },
    /// HELD by `owner` -> AVAILABLE, regardless of expiry.
    Release { owner: LeaseOwner },
    /// HELD and expired before `now` -> AVAILABLE.
    Reclaim { now: DateTime<Utc> },
}

impl Transition {
    pub fn from_state(&self) -> SeatState {
        match self {
            Transition::Hold { .. } => SeatState::Available,
            _ => SeatState::Held,
        }
    }

    pub fn to_state(&self) -> SeatState {
        match self {
            Transition::Hold { .. } => SeatState::Held,
            Transition::Book { .. } => SeatState::Booked,
            Transition::Release { .. } | Transition::Reclaim { .. } => SeatState::Available,
        }
    }

    /// Whether `seat`, as it is right now, may take this transition.
    pub fn admits(&self, seat: &Seat) -> bool {
        if seat.state != self.from_state() {
            return false;
        }
        match self {
            Transition::Hold { .. } => true,
            Transition::Book { owner, now } => {
                seat.lease_owner.as_ref() == Some(owner) && seat.lease_expiry.is_some_and(|e| e >= *now)
            }
            Transition::Release { owner } => seat.lease_owner.as_ref() == Some(owner),
            Transition::Reclaim { now } => seat.is_expired_at(*now),
        }
    }

    pub fn apply(&self, seat: &mut Seat) {
        seat.state = self.to_state();
        match self {
            Transition::Hold { owner, expiry } => {
                seat.lease_owner = Some(*owner);
                seat.lease_expiry = Some(*expiry);
            }
            Transition::Book { .. } => {
                seat.lease_expiry = None;
            }
            Transition::Release { .. } | Transition::Reclaim { .. } => {
                seat.lease_owner = None;
                seat.lease_expiry = None;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Read-only seat listing filter, already validated by the catalog.
#[derive(Debug, Clone, Copy)]
pub struct SeatQuery {
    pub state: Option<SeatState>,
    pub offset: i64,
    pub limit: i64,
    pub order: SortOrder,
}

#[async_trait]
pub trait LedgerStore: Clone + Send + Sync + 'static {
    type Tx: LedgerTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    async fn get_event(&self, event_id: EventId) -> Result<Option<Event>, StoreError>;

    async fn event_exists(&self, event_id: EventId) -> Result<bool, StoreError> {
        Ok(self.get_event(event_id).await?.is_some())
    }

    /// Events ordered by start time, plus the total number of events.
    async fn list_events(&self, offset: i64, limit: i64) -> Result<(Vec<Event>, i64), StoreError>;

    /// Seats of one event sorted by label, plus the total matching the filter.
    async fn list_seats(&self, event_id: EventId, query: SeatQuery) -> Result<(Vec<Seat>, i64), StoreError>;

    /// HELD seats with `lease_expiry < now` across all events, oldest expiry
    /// first, at most `limit` of them.
    fn find_expired(&self, now: DateTime<Utc>, limit: i64) -> BoxStream<'_, Result<Seat, StoreError>>;
}

#[async_trait]
pub trait LedgerTx: Send + Sized {
    async fn get_event(&mut self, event_id: EventId) -> Result<Option<Event>, StoreError>;

    /// Reads the event and holds its counter row until the transaction ends.
    /// Counter writes from other transactions wait for it (or fail to commit).
    async fn lock_event(&mut self, event_id: EventId) -> Result<Option<Event>, StoreError>;

    /// The subset of `labels` that is currently AVAILABLE for the event.
    async fn find_available(&mut self, event_id: EventId, labels: &[String]) -> Result<Vec<Seat>, StoreError>;

    /// Seats carrying `owner` that are in `state`, sorted by label.
    async fn find_leased(&mut self, owner: LeaseOwner, state: SeatState) -> Result<Vec<Seat>, StoreError>;

    /// Whether any seat, in any state, still carries `owner`.
    async fn owner_in_use(&mut self, owner: LeaseOwner) -> Result<bool, StoreError>;

    /// Applies `transition` to those of `seat_ids` that satisfy its guard at
    /// write time and returns how many rows changed.
    async fn transition_many(&mut self, seat_ids: &[SeatId], transition: &Transition) -> Result<u64, StoreError>;

    /// Must only be called in the same transaction as the seat transitions
    /// that justify the delta.
    async fn adjust_counts(&mut self, event_id: EventId, delta: CountDelta) -> Result<(), StoreError>;

    /// Counts the event's seats per state from the seat rows themselves.
    async fn count_seats(&mut self, event_id: EventId) -> Result<SeatCounts, StoreError>;

    async fn overwrite_counts(&mut self, event_id: EventId, counts: SeatCounts) -> Result<(), StoreError>;

    async fn insert_event(&mut self, new_event: &NewEvent) -> Result<Event, StoreError>;

    async fn insert_seats(&mut self, event_id: EventId, labels: &[String]) -> Result<u64, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}
