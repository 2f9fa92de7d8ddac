//! Event catalog: the collaborator that creates events with their seats and
//! serves read-only listings. It never mutates seat state or counters after
//! creation; that belongs to the lease manager and the sweeper.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::finish;
use crate::clock::Clock;
use crate::error::{LeaseError, LeaseResult};
use crate::ledger::{LedgerStore, LedgerTx, SeatQuery, SortOrder};
use crate::models::{Event, EventId, LeaseOwner, NewEvent, Seat, SeatCounts, SeatId, SeatState};

pub const SEATS_PER_ROW: u32 = 10;
pub const DEFAULT_SEAT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 100;
pub const DEFAULT_EVENT_PAGE_SIZE: i64 = 10;

/// Label of the seat at 1-based `position`: ten seats per row, rows lettered
/// A..Z then AA, AB, ... (1 -> A1, 11 -> B1, 261 -> AA1).
pub fn seat_label(position: u32) -> Option<String> {
    if position == 0 {
        return None;
    }
    let row = (position - 1) / SEATS_PER_ROW;
    let number = (position - 1) % SEATS_PER_ROW + 1;
    Some(format!("{}{}", row_letters(row), number))
}

fn row_letters(mut row: u32) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push(char::from(b'A' + (row % 26) as u8));
        if row < 26 {
            break;
        }
        row = row / 26 - 1;
    }
    letters.iter().rev().collect()
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub total_pages: i64,
}

impl Pagination {
    fn new(total: i64, page: i64, limit: i64) -> Self {
        Self {
            total,
            page,
            limit,
            total_pages: (total + limit - 1) / limit,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDetails {
    pub event: Event,
    pub is_active: bool,
    /// Counters re-derived from the seat rows.
    pub seat_summary: SeatCounts,
    /// Stored counters disagree with `seat_summary`.
    pub drift: bool,
}

/// One row of the seat listing, with remaining hold time for HELD seats.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SeatView {
    pub id: SeatId,
    pub label: String,
    pub state: SeatState,
    pub lease_owner: Option<LeaseOwner>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub expires_in_secs: Option<i64>,
    pub is_expired: bool,
}

impl SeatView {
    fn at(seat: Seat, now: DateTime<Utc>) -> Self {
        Self {
            expires_in_secs: seat.expires_in_secs(now),
            is_expired: seat.is_expired_at(now),
            id: seat.id,
            label: seat.label,
            state: seat.state,
            lease_owner: seat.lease_owner,
            lease_expiry: seat.lease_expiry,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SeatListParams {
    pub state: Option<SeatState>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub order: Option<SortOrder>,
}

#[derive(Clone)]
pub struct Catalog<S> {
    store: S,
    clock: Arc<dyn Clock>,
    max_capacity: i64,
}

impl<S: LedgerStore> Catalog<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, max_capacity: i64) -> Self {
        Self { store, clock, max_capacity }
    }

    /// Creates the event and all of its AVAILABLE seats in one transaction.
    pub async fn create_event(&self, new_event: NewEvent) -> LeaseResult<Event> {
        let title = new_event.title.trim();
        if title.is_empty() {
            return Err(LeaseError::invalid("title is required"));
        }
        if !(1..=self.max_capacity).contains(&new_event.capacity) {
            return Err(LeaseError::invalid(format!(
                "capacity must be between 1 and {}",
                self.max_capacity
            )));
        }

        let labels: Vec<String> = (1..=new_event.capacity as u32).filter_map(seat_label).collect();
        let new_event = NewEvent {
            title: title.to_string(),
            ..new_event
        };

        let mut tx = self.store.begin().await?;
        let result = insert_event_with_seats(&mut tx, &new_event, &labels).await;
        let event = finish(tx, result).await?;

        info!("Created event {} '{}' with {} seats", event.id, event.title, labels.len());
        Ok(event)
    }

    pub async fn get_event(&self, event_id: EventId) -> LeaseResult<Event> {
        self.store
            .get_event(event_id)
            .await?
            .ok_or(LeaseError::NotFound(event_id))
    }

    pub async fn event_exists(&self, event_id: EventId) -> LeaseResult<bool> {
        Ok(self.store.event_exists(event_id).await?)
    }

    pub async fn list_events(&self, page: Option<i64>, limit: Option<i64>) -> LeaseResult<Page<Event>> {
        let (page, limit, offset) = page_window(page, limit, DEFAULT_EVENT_PAGE_SIZE)?;
        let (items, total) = self.store.list_events(offset, limit).await?;
        Ok(Page {
            items,
            pagination: Pagination::new(total, page, limit),
        })
    }

    /// Stored counters alongside counters re-derived from the seats.
    pub async fn event_details(&self, event_id: EventId) -> LeaseResult<EventDetails> {
        // Both reads share one transaction; under READ COMMITTED they may still
        // straddle a commit, so `drift` is advisory. `reconcile` locks first.
        let mut tx = self.store.begin().await?;
        let event = tx.get_event(event_id).await;
        let derived = tx.count_seats(event_id).await;
        tx.rollback().await?;

        let event = event?.ok_or(LeaseError::NotFound(event_id))?;
        let seat_summary = derived?;
        Ok(EventDetails {
            is_active: event.starts_at > self.clock.now(),
            drift: event.counts() != seat_summary,
            seat_summary,
            event,
        })
    }

    pub async fn list_seats(&self, event_id: EventId, params: SeatListParams) -> LeaseResult<Page<SeatView>> {
        let (page, limit, offset) = page_window(params.page, params.limit, DEFAULT_SEAT_PAGE_SIZE)?;
        if !self.store.event_exists(event_id).await? {
            return Err(LeaseError::NotFound(event_id));
        }

        let query = SeatQuery {
            state: params.state,
            offset,
            limit,
            order: params.order.unwrap_or_default(),
        };
        let (seats, total) = self.store.list_seats(event_id, query).await?;

        let now = self.clock.now();
        Ok(Page {
            items: seats.into_iter().map(|seat| SeatView::at(seat, now)).collect(),
            pagination: Pagination::new(total, page, limit),
        })
    }
}

async fn insert_event_with_seats<T: LedgerTx>(tx: &mut T, new_event: &NewEvent, labels: &[String]) -> LeaseResult<Event> {
    let event = tx.insert_event(new_event).await?;
    tx.insert_seats(event.id, labels).await?;
    Ok(event)
}

/// Validated `(page, limit, offset)`.
fn page_window(page: Option<i64>, limit: Option<i64>, default_limit: i64) -> LeaseResult<(i64, i64, i64)> {
    let page = page.unwrap_or(1);
    let limit = limit.unwrap_or(default_limit);
    if page < 1 {
        return Err(LeaseError::invalid("page must be at least 1"));
    }
    if !(1..=MAX_PAGE_SIZE).contains(&limit) {
        return Err(LeaseError::invalid(format!("limit must be between 1 and {MAX_PAGE_SIZE}")));
    }
    let offset = (page - 1)
        .checked_mul(limit)
        .ok_or_else(|| LeaseError::invalid("page is out of range"))?;
    Ok((page, limit, offset))
}
