//! In-process ledger.
//!
//! Transactions read the latest committed rows overlaid with their own
//! writes. Guards are evaluated against that view at write time, and commit
//! re-validates every written seat against the version it was read at:
//! the first committer wins, later ones fail with [`StoreError::Conflict`].
//! Counter rows taken with `lock_event` are versioned the same way.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{LedgerStore, LedgerTx, SeatQuery, SortOrder, Transition};
use crate::error::StoreError;
use crate::models::{CountDelta, Event, EventId, LeaseOwner, NewEvent, Seat, SeatCounts, SeatId, SeatState};

#[derive(Debug, Clone)]
struct SeatRow {
    seat: Seat,
    version: u64,
}

#[derive(Debug, Default)]
struct Tables {
    events: BTreeMap<EventId, Event>,
    seats: BTreeMap<SeatId, SeatRow>,
    /// Bumped on every committed counter change.
    event_versions: BTreeMap<EventId, u64>,
    last_event_id: EventId,
    last_seat_id: SeatId,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Committed seats of one event, by id.
    pub fn seats_of(&self, event_id: EventId) -> Vec<Seat> {
        self.lock()
            .seats
            .values()
            .filter(|row| row.seat.event_id == event_id)
            .map(|row| row.seat.clone())
            .collect()
    }

    pub fn seat_by_label(&self, event_id: EventId, label: &str) -> Option<Seat> {
        self.lock()
            .seats
            .values()
            .find(|row| row.seat.event_id == event_id && row.seat.label == label)
            .map(|row| row.seat.clone())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        Ok(MemoryTx {
            tables: self.tables.clone(),
            seat_writes: BTreeMap::new(),
            new_events: BTreeMap::new(),
            new_seats: BTreeMap::new(),
            deltas: BTreeMap::new(),
            overwrites: BTreeMap::new(),
            locked_events: BTreeMap::new(),
        })
    }

    async fn get_event(&self, event_id: EventId) -> Result<Option<Event>, StoreError> {
        Ok(self.lock().events.get(&event_id).cloned())
    }

    async fn list_events(&self, offset: i64, limit: i64) -> Result<(Vec<Event>, i64), StoreError> {
        let tables = self.lock();
        let mut events: Vec<Event> = tables.events.values().cloned().collect();
        events.sort_by(|a, b| a.starts_at.cmp(&b.starts_at).then(a.id.cmp(&b.id)));
        let total = events.len() as i64;
        let page = events
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn list_seats(&self, event_id: EventId, query: SeatQuery) -> Result<(Vec<Seat>, i64), StoreError> {
        let tables = self.lock();
        let mut seats: Vec<Seat> = tables
            .seats
            .values()
            .map(|row| &row.seat)
            .filter(|seat| seat.event_id == event_id)
            .filter(|seat| query.state.map_or(true, |state| seat.state == state))
            .cloned()
            .collect();
        seats.sort_by(|a, b| a.label.as_bytes().cmp(b.label.as_bytes()));
        if query.order == SortOrder::Desc {
            seats.reverse();
        }
        let total = seats.len() as i64;
        let page = seats
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    fn find_expired(&self, now: DateTime<Utc>, limit: i64) -> BoxStream<'_, Result<Seat, StoreError>> {
        let mut expired: Vec<Seat> = self
            .lock()
            .seats
            .values()
            .filter(|row| row.seat.is_expired_at(now))
            .map(|row| row.seat.clone())
            .collect();
        expired.sort_by(|a, b| a.lease_expiry.cmp(&b.lease_expiry).then(a.id.cmp(&b.id)));
        expired.truncate(limit.max(0) as usize);
        stream::iter(expired.into_iter().map(Ok)).boxed()
    }
}

pub struct MemoryTx {
    tables: Arc<Mutex<Tables>>,
    /// Written committed seats: version they were read at, and the new row.
    seat_writes: BTreeMap<SeatId, (u64, Seat)>,
    new_events: BTreeMap<EventId, Event>,
    new_seats: BTreeMap<SeatId, Seat>,
    deltas: BTreeMap<EventId, CountDelta>,
    overwrites: BTreeMap<EventId, SeatCounts>,
    /// Counter versions seen by `lock_event`.
    locked_events: BTreeMap<EventId, u64>,
}

impl MemoryTx {
    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every seat as this transaction sees it.
    fn visible_seats(&self) -> Vec<Seat> {
        let tables = self.lock();
        let committed = tables.seats.values().map(|row| {
            self.seat_writes
                .get(&row.seat.id)
                .map(|(_, seat)| seat.clone())
                .unwrap_or_else(|| row.seat.clone())
        });
        committed.chain(self.new_seats.values().cloned()).collect()
    }

    fn visible_event(&self, event_id: EventId) -> Option<Event> {
        let mut event = self
            .new_events
            .get(&event_id)
            .cloned()
            .or_else(|| self.lock().events.get(&event_id).cloned())?;
        if let Some(counts) = self.overwrites.get(&event_id) {
            set_counts(&mut event, *counts);
        }
        if let Some(delta) = self.deltas.get(&event_id) {
            let counts = event.counts();
            set_counts(
                &mut event,
                SeatCounts {
                    available: counts.available + delta.available,
                    held: counts.held + delta.held,
                    booked: counts.booked + delta.booked,
                },
            );
        }
        Some(event)
    }
}

fn set_counts(event: &mut Event, counts: SeatCounts) {
    event.available_count = counts.available;
    event.held_count = counts.held;
    event.booked_count = counts.booked;
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn get_event(&mut self, event_id: EventId) -> Result<Option<Event>, StoreError> {
        Ok(self.visible_event(event_id))
    }

    async fn lock_event(&mut self, event_id: EventId) -> Result<Option<Event>, StoreError> {
        if !self.locked_events.contains_key(&event_id) && !self.new_events.contains_key(&event_id) {
            let version = self.lock().event_versions.get(&event_id).copied().unwrap_or_default();
            self.locked_events.insert(event_id, version);
        }
        Ok(self.visible_event(event_id))
    }

    async fn find_available(&mut self, event_id: EventId, labels: &[String]) -> Result<Vec<Seat>, StoreError> {
        let wanted: HashSet<&str> = labels.iter().map(String::as_str).collect();
        Ok(self
            .visible_seats()
            .into_iter()
            .filter(|seat| {
                seat.event_id == event_id
                    && seat.state == SeatState::Available
                    && wanted.contains(seat.label.as_str())
            })
            .collect())
    }

    async fn find_leased(&mut self, owner: LeaseOwner, state: SeatState) -> Result<Vec<Seat>, StoreError> {
        let mut seats: Vec<Seat> = self
            .visible_seats()
            .into_iter()
            .filter(|seat| seat.state == state && seat.lease_owner == Some(owner))
            .collect();
        seats.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(seats)
    }

    async fn owner_in_use(&mut self, owner: LeaseOwner) -> Result<bool, StoreError> {
        Ok(self.visible_seats().iter().any(|seat| seat.lease_owner == Some(owner)))
    }

    async fn transition_many(&mut self, seat_ids: &[SeatId], transition: &Transition) -> Result<u64, StoreError> {
        let tables = self.tables.clone();
        let tables = tables.lock().unwrap_or_else(PoisonError::into_inner);
        let mut changed = 0;

        for id in seat_ids.iter().collect::<HashSet<_>>() {
            if let Some(seat) = self.new_seats.get_mut(id) {
                if transition.admits(seat) {
                    transition.apply(seat);
                    changed += 1;
                }
                continue;
            }
            let Some(row) = tables.seats.get(id) else {
                continue;
            };
            let (base_version, mut seat) = match self.seat_writes.get(id) {
                Some((version, seat)) => (*version, seat.clone()),
                None => (row.version, row.seat.clone()),
            };
            if transition.admits(&seat) {
                transition.apply(&mut seat);
                self.seat_writes.insert(*id, (base_version, seat));
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn adjust_counts(&mut self, event_id: EventId, delta: CountDelta) -> Result<(), StoreError> {
        if self.visible_event(event_id).is_none() {
            return Err(StoreError::Corrupt(format!("event {event_id} has no counter row")));
        }
        let entry = self.deltas.entry(event_id).or_default();
        *entry = entry.merge(delta);
        Ok(())
    }

    async fn count_seats(&mut self, event_id: EventId) -> Result<SeatCounts, StoreError> {
        let mut counts = SeatCounts::default();
        for seat in self.visible_seats().iter().filter(|seat| seat.event_id == event_id) {
            match seat.state {
                SeatState::Available => counts.available += 1,
                SeatState::Held => counts.held += 1,
                SeatState::Booked => counts.booked += 1,
            }
        }
        Ok(counts)
    }

    async fn overwrite_counts(&mut self, event_id: EventId, counts: SeatCounts) -> Result<(), StoreError> {
        if self.visible_event(event_id).is_none() {
            return Err(StoreError::Corrupt(format!("event {event_id} has no counter row")));
        }
        // An absolute write supersedes deltas made earlier in this transaction.
        self.deltas.remove(&event_id);
        self.overwrites.insert(event_id, counts);
        Ok(())
    }

    async fn insert_event(&mut self, new_event: &NewEvent) -> Result<Event, StoreError> {
        let id = {
            let mut tables = self.lock();
            tables.last_event_id += 1;
            tables.last_event_id
        };
        let event = Event {
            id,
            title: new_event.title.clone(),
            starts_at: new_event.starts_at,
            capacity: new_event.capacity,
            available_count: new_event.capacity,
            held_count: 0,
            booked_count: 0,
        };
        self.new_events.insert(id, event.clone());
        Ok(event)
    }

    async fn insert_seats(&mut self, event_id: EventId, labels: &[String]) -> Result<u64, StoreError> {
        if self.visible_event(event_id).is_none() {
            return Err(StoreError::Corrupt(format!("event {event_id} does not exist")));
        }
        let mut taken: HashSet<String> = self
            .visible_seats()
            .into_iter()
            .filter(|seat| seat.event_id == event_id)
            .map(|seat| seat.label)
            .collect();
        for label in labels {
            if !taken.insert(label.clone()) {
                return Err(StoreError::Corrupt(format!("duplicate label {label} for event {event_id}")));
            }
        }

        let first_id = {
            let mut tables = self.lock();
            let first = tables.last_seat_id + 1;
            tables.last_seat_id += labels.len() as i64;
            first
        };
        for (offset, label) in labels.iter().enumerate() {
            let id = first_id + offset as i64;
            self.new_seats.insert(id, Seat::available(id, event_id, label.clone()));
        }
        Ok(labels.len() as u64)
    }

    async fn commit(self) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);

        for (id, (base_version, _)) in &self.seat_writes {
            match tables.seats.get(id) {
                Some(row) if row.version == *base_version => {}
                _ => return Err(StoreError::Conflict),
            }
        }
        for (event_id, version) in &self.locked_events {
            if tables.event_versions.get(event_id).copied().unwrap_or_default() != *version {
                return Err(StoreError::Conflict);
            }
        }

        // Counter rows are checked before anything is written so a failed
        // commit leaves no trace.
        let mut next_counts = BTreeMap::new();
        for event_id in self.overwrites.keys().chain(self.deltas.keys()) {
            let Some(event) = self.new_events.get(event_id).or_else(|| tables.events.get(event_id)) else {
                return Err(StoreError::Corrupt(format!("event {event_id} has no counter row")));
            };
            let base = self.overwrites.get(event_id).copied().unwrap_or_else(|| event.counts());
            let delta = self.deltas.get(event_id).copied().unwrap_or_default();
            let Some(counts) = base.apply(delta) else {
                return Err(StoreError::Corrupt(format!("counter underflow on event {event_id}")));
            };
            next_counts.insert(*event_id, counts);
        }

        for (id, event) in self.new_events {
            tables.events.insert(id, event);
        }
        for (id, seat) in self.new_seats {
            tables.seats.insert(id, SeatRow { seat, version: 0 });
        }
        for (id, (_, seat)) in self.seat_writes {
            if let Some(row) = tables.seats.get_mut(&id) {
                row.seat = seat;
                row.version += 1;
            }
        }
        for (event_id, counts) in next_counts {
            if let Some(event) = tables.events.get_mut(&event_id) {
                set_counts(event, counts);
                *tables.event_versions.entry(event_id).or_default() += 1;
            }
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    async fn seeded(capacity: i64) -> (MemoryLedger, Event) {
        let ledger = MemoryLedger::new();
        let mut tx = ledger.begin().await.unwrap();
        let event = tx
            .insert_event(&NewEvent { title: "Matinee".into(), starts_at: t0(), capacity })
            .await
            .unwrap();
        let labels: Vec<String> = (1..=capacity).map(|n| format!("A{n}")).collect();
        tx.insert_seats(event.id, &labels).await.unwrap();
        tx.commit().await.unwrap();
        (ledger, event)
    }

    fn ids(seats: &[Seat]) -> Vec<SeatId> {
        seats.iter().map(|s| s.id).collect()
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible() {
        let (ledger, event) = seeded(3).await;
        let mut tx = ledger.begin().await.unwrap();
        let seats = tx.find_available(event.id, &["A1".into()]).await.unwrap();
        let hold = Transition::Hold { owner: LeaseOwner::generate(), expiry: t0() };
        assert_eq!(tx.transition_many(&ids(&seats), &hold).await.unwrap(), 1);
        tx.adjust_counts(event.id, CountDelta::hold(1)).await.unwrap();

        assert_eq!(ledger.seat_by_label(event.id, "A1").unwrap().state, SeatState::Available);
        tx.rollback().await.unwrap();

        let stored = ledger.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.available_count, 3);
        assert_eq!(ledger.seat_by_label(event.id, "A1").unwrap().state, SeatState::Available);
    }

    #[tokio::test]
    async fn guard_sees_committed_rows_at_write_time() {
        let (ledger, event) = seeded(2).await;
        let labels = vec!["A1".to_string(), "A2".to_string()];

        let mut slow = ledger.begin().await.unwrap();
        let seen = slow.find_available(event.id, &labels).await.unwrap();
        assert_eq!(seen.len(), 2);

        let mut fast = ledger.begin().await.unwrap();
        let a2 = fast.find_available(event.id, &labels[1..]).await.unwrap();
        let hold = Transition::Hold { owner: LeaseOwner::generate(), expiry: t0() };
        fast.transition_many(&ids(&a2), &hold).await.unwrap();
        fast.commit().await.unwrap();

        let hold = Transition::Hold { owner: LeaseOwner::generate(), expiry: t0() };
        assert_eq!(slow.transition_many(&ids(&seen), &hold).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn first_committer_wins() {
        let (ledger, event) = seeded(1).await;
        let labels = vec!["A1".to_string()];

        let mut first = ledger.begin().await.unwrap();
        let mut second = ledger.begin().await.unwrap();
        for tx in [&mut first, &mut second] {
            let seats = tx.find_available(event.id, &labels).await.unwrap();
            let hold = Transition::Hold { owner: LeaseOwner::generate(), expiry: t0() };
            assert_eq!(tx.transition_many(&ids(&seats), &hold).await.unwrap(), 1);
            tx.adjust_counts(event.id, CountDelta::hold(1)).await.unwrap();
        }

        first.commit().await.unwrap();
        assert!(matches!(second.commit().await, Err(StoreError::Conflict)));

        let stored = ledger.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.counts(), SeatCounts { available: 0, held: 1, booked: 0 });
    }

    #[tokio::test]
    async fn locked_counters_changed_by_another_commit_conflict() {
        let (ledger, event) = seeded(2).await;

        let mut locker = ledger.begin().await.unwrap();
        locker.lock_event(event.id).await.unwrap().unwrap();
        let counted = locker.count_seats(event.id).await.unwrap();

        let mut writer = ledger.begin().await.unwrap();
        let seats = writer.find_available(event.id, &["A1".into()]).await.unwrap();
        let hold = Transition::Hold { owner: LeaseOwner::generate(), expiry: t0() };
        writer.transition_many(&ids(&seats), &hold).await.unwrap();
        writer.adjust_counts(event.id, CountDelta::hold(1)).await.unwrap();
        writer.commit().await.unwrap();

        locker.overwrite_counts(event.id, counted).await.unwrap();
        assert!(matches!(locker.commit().await, Err(StoreError::Conflict)));

        let stored = ledger.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.counts(), SeatCounts { available: 1, held: 1, booked: 0 });
    }

    #[tokio::test]
    async fn counter_underflow_fails_commit() {
        let (ledger, event) = seeded(1).await;
        let mut tx = ledger.begin().await.unwrap();
        tx.adjust_counts(event.id, CountDelta::book(1)).await.unwrap();

        assert!(matches!(tx.commit().await, Err(StoreError::Corrupt(_))));
        let stored = ledger.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.available_count, 1);
    }

    #[tokio::test]
    async fn expired_scan_is_oldest_first_and_bounded() {
        let (ledger, event) = seeded(3).await;
        let mut tx = ledger.begin().await.unwrap();
        for (label, minutes) in [("A1", 3), ("A2", 1), ("A3", 2)] {
            let seats = tx.find_available(event.id, &[label.to_string()]).await.unwrap();
            let hold = Transition::Hold {
                owner: LeaseOwner::generate(),
                expiry: t0() + Duration::minutes(minutes),
            };
            tx.transition_many(&ids(&seats), &hold).await.unwrap();
        }
        tx.adjust_counts(event.id, CountDelta::hold(3)).await.unwrap();
        tx.commit().await.unwrap();

        let expired: Vec<Seat> = ledger
            .find_expired(t0() + Duration::minutes(10), 2)
            .map(Result::unwrap)
            .collect()
            .await;
        let labels: Vec<&str> = expired.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["A2", "A3"]);

        let none: Vec<_> = ledger.find_expired(t0(), 10).collect().await;
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn duplicate_labels_are_rejected() {
        let (ledger, event) = seeded(1).await;
        let mut tx = ledger.begin().await.unwrap();
        let err = tx.insert_seats(event.id, &["A1".to_string()]).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }
}
