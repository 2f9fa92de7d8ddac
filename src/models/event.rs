use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::EventId;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EventId,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub capacity: i64,
    pub available_count: i64,
    pub held_count: i64,
    pub booked_count: i64,
}

impl Event {
    pub fn counts(&self) -> SeatCounts {
        SeatCounts {
            available: self.available_count,
            held: self.held_count,
            booked: self.booked_count,
        }
    }
}

/// Input for the catalog when an event and its seats are created together.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub capacity: i64,
}

/// Number of seats of an event in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatCounts {
    pub available: i64,
    pub held: i64,
    pub booked: i64,
}

impl SeatCounts {
    pub fn total(&self) -> i64 {
        self.available + self.held + self.booked
    }

    /// Returns `None` if the delta would drive any counter negative.
    pub fn apply(self, delta: CountDelta) -> Option<SeatCounts> {
        let next = SeatCounts {
            available: self.available + delta.available,
            held: self.held + delta.held,
            booked: self.booked + delta.booked,
        };
        (next.available >= 0 && next.held >= 0 && next.booked >= 0).then_some(next)
    }
}

/// Signed adjustment of the three per-event counters.
///
/// Every delta built through the constructors below is zero-sum, so applying
/// it never changes the total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountDelta {
    pub available: i64,
    pub held: i64,
    pub booked: i64,
}

impl CountDelta {
    /// AVAILABLE -> HELD for `n` seats.
    pub fn hold(n: u64) -> Self {
        let n = n as i64;
        Self { available: -n, held: n, booked: 0 }
    }

    /// HELD -> BOOKED for `n` seats.
    pub fn book(n: u64) -> Self {
        let n = n as i64;
        Self { available: 0, held: -n, booked: n }
    }

    /// HELD -> AVAILABLE for `n` seats, used by both release and reclaim.
    pub fn release(n: u64) -> Self {
        let n = n as i64;
        Self { available: n, held: -n, booked: 0 }
    }

    pub fn merge(self, other: CountDelta) -> CountDelta {
        CountDelta {
            available: self.available + other.available,
            held: self.held + other.held,
            booked: self.booked + other.booked,
        }
    }
}
