use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

use super::{EventId, LeaseOwner, SeatId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "seat_state", rename_all = "UPPERCASE")]
pub enum SeatState {
    Available,
    Held,
    Booked,
}

impl SeatState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeatState::Available => "AVAILABLE",
            SeatState::Held => "HELD",
            SeatState::Booked => "BOOKED",
        }
    }
}

impl fmt::Display for SeatState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Seat {
    pub id: SeatId,
    pub event_id: EventId,
    pub label: String,
    pub state: SeatState,
    pub lease_owner: Option<LeaseOwner>,
    pub lease_expiry: Option<DateTime<Utc>>,
}

impl Seat {
    pub fn available(id: SeatId, event_id: EventId, label: String) -> Self {
        Self {
            id,
            event_id,
            label,
            state: SeatState::Available,
            lease_owner: None,
            lease_expiry: None,
        }
    }

    /// Checks that the lease fields agree with the state.
    pub fn is_consistent(&self) -> bool {
        match self.state {
            SeatState::Available => self.lease_owner.is_none() && self.lease_expiry.is_none(),
            SeatState::Held => self.lease_owner.is_some() && self.lease_expiry.is_some(),
            SeatState::Booked => self.lease_owner.is_some() && self.lease_expiry.is_none(),
        }
    }

    /// A hold counts as expired only strictly after its expiry instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.state == SeatState::Held && self.lease_expiry.is_some_and(|expiry| expiry < now)
    }

    /// Whole seconds left on a hold, clamped at zero. `None` unless HELD.
    pub fn expires_in_secs(&self, now: DateTime<Utc>) -> Option<i64> {
        match (self.state, self.lease_expiry) {
            (SeatState::Held, Some(expiry)) => Some((expiry - now).num_seconds().max(0)),
            _ => None,
        }
    }
}
