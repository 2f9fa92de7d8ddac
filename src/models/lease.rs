use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::EventId;

/// Opaque token identifying a lease across the seats it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct LeaseOwner(Uuid);

impl LeaseOwner {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for LeaseOwner {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for LeaseOwner {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for LeaseOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Returned by a successful hold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HoldReceipt {
    pub lease_owner: LeaseOwner,
    pub event_id: EventId,
    pub labels: Vec<String>,
    pub lease_expiry: DateTime<Utc>,
}

/// Returned by a successful confirm.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Confirmation {
    pub lease_owner: LeaseOwner,
    pub confirmed_count: u64,
    pub event_id: EventId,
}

/// Returned by a successful explicit release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Released {
    pub lease_owner: LeaseOwner,
    pub released_count: u64,
    pub event_id: EventId,
}
