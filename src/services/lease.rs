//! Hold, confirm and release of seat leases, plus counter reconciliation.
//!
//! Every operation runs inside one ledger transaction: the seat transitions
//! and the matching counter delta commit together or not at all. Lost races
//! are detected from the row count of the guarded transition, never from an
//! earlier read.

use chrono::{Duration, SubsecRound};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::finish;
use crate::clock::Clock;
use crate::error::{LeaseError, LeaseResult, StoreError};
use crate::ledger::{LedgerStore, LedgerTx, Transition};
use crate::models::{
    Confirmation, CountDelta, EventId, HoldReceipt, LeaseOwner, Released, Seat, SeatCounts, SeatId, SeatState,
};

const RECONCILE_ATTEMPTS: u32 = 3;

/// Tunables for hold requests.
#[derive(Debug, Clone, Copy)]
pub struct LeasePolicy {
    pub hold_duration: Duration,
    pub max_seats_per_lease: usize,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            hold_duration: Duration::minutes(5),
            max_seats_per_lease: 10,
        }
    }
}

/// Result of recomputing an event's counters from its seats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub event_id: EventId,
    pub before: SeatCounts,
    pub after: SeatCounts,
    pub drifted: bool,
}

#[derive(Clone)]
pub struct LeaseManager<S> {
    store: S,
    clock: Arc<dyn Clock>,
    policy: LeasePolicy,
}

impl<S: LedgerStore> LeaseManager<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, policy: LeasePolicy) -> Self {
        Self { store, clock, policy }
    }

    /// Holds every seat in `labels` for `owner`, or none of them.
    pub async fn hold(
        &self,
        event_id: EventId,
        labels: &[String],
        owner: LeaseOwner,
        hold_duration: Duration,
    ) -> LeaseResult<HoldReceipt> {
        self.check_hold_request(labels, hold_duration)?;

        let mut tx = self.store.begin().await?;
        let result = self.hold_in(&mut tx, event_id, labels, owner, hold_duration).await;
        let receipt = finish(tx, result).await.map_err(|err| match err {
            // Serialization failure or deadlock: somebody else got there first.
            LeaseError::Internal(StoreError::Conflict) => LeaseError::SeatUnavailable { labels: labels.to_vec() },
            other => other,
        })?;

        info!(
            "Held {} seats for lease {} on event {} until {}",
            receipt.labels.len(),
            owner,
            event_id,
            receipt.lease_expiry
        );
        Ok(receipt)
    }

    /// Holds with the configured default duration.
    pub async fn hold_default(
        &self,
        event_id: EventId,
        labels: &[String],
        owner: LeaseOwner,
    ) -> LeaseResult<HoldReceipt> {
        self.hold(event_id, labels, owner, self.policy.hold_duration).await
    }

    fn check_hold_request(&self, labels: &[String], hold_duration: Duration) -> LeaseResult<()> {
        if labels.is_empty() {
            return Err(LeaseError::invalid("at least one seat label is required"));
        }
        if labels.len() > self.policy.max_seats_per_lease {
            return Err(LeaseError::invalid(format!(
                "at most {} seats may be held at once",
                self.policy.max_seats_per_lease
            )));
        }
        if labels.iter().any(|label| label.trim().is_empty()) {
            return Err(LeaseError::invalid("seat labels must not be blank"));
        }
        let mut seen = HashSet::with_capacity(labels.len());
        if let Some(duplicate) = labels.iter().find(|label| !seen.insert(label.as_str())) {
            return Err(LeaseError::invalid(format!("duplicate seat label {duplicate}")));
        }
        if hold_duration <= Duration::zero() {
            return Err(LeaseError::invalid("hold duration must be positive"));
        }
        Ok(())
    }

    async fn hold_in(
        &self,
        tx: &mut S::Tx,
        event_id: EventId,
        labels: &[String],
        owner: LeaseOwner,
        hold_duration: Duration,
    ) -> LeaseResult<HoldReceipt> {
        let requested = labels.len() as u64;

        let event = tx.get_event(event_id).await?.ok_or(LeaseError::NotFound(event_id))?;
        if labels.len() as i64 > event.available_count {
            return Err(LeaseError::InsufficientAvailability {
                requested,
                available: event.available_count,
            });
        }

        // Owner tokens are single-use so a lease can never span two events.
        if tx.owner_in_use(owner).await? {
            return Err(LeaseError::invalid(format!("lease owner {owner} is already in use")));
        }

        let seats = tx.find_available(event_id, labels).await?;
        if seats.len() < labels.len() {
            let found: HashSet<&str> = seats.iter().map(|seat| seat.label.as_str()).collect();
            let missing: Vec<String> = labels.iter().filter(|label| !found.contains(label.as_str())).cloned().collect();
            debug!("Hold on event {} rejected, unavailable: {:?}", event_id, missing);
            return Err(LeaseError::SeatUnavailable { labels: missing });
        }

        // TIMESTAMPTZ keeps microseconds; the receipt must match what is stored.
        let lease_expiry = (self.clock.now() + hold_duration).trunc_subsecs(6);
        let changed = tx
            .transition_many(&seat_ids(&seats), &Transition::Hold { owner, expiry: lease_expiry })
            .await?;
        if changed != requested {
            warn!(
                "Lost race holding seats on event {}: {} of {} transitioned",
                event_id, changed, requested
            );
            return Err(LeaseError::SeatUnavailable { labels: labels.to_vec() });
        }

        tx.adjust_counts(event_id, CountDelta::hold(requested)).await?;

        Ok(HoldReceipt {
            lease_owner: owner,
            event_id,
            labels: labels.to_vec(),
            lease_expiry,
        })
    }

    /// Books every seat of a live lease.
    ///
    /// A hold is live while `lease_expiry >= now`; past that the lease is
    /// gone even if the sweeper has not reclaimed it yet.
    pub async fn confirm(&self, owner: LeaseOwner) -> LeaseResult<Confirmation> {
        let mut tx = self.store.begin().await?;
        let result = self.confirm_in(&mut tx, owner).await;
        let confirmation = finish(tx, result).await.map_err(|err| lease_conflict(err, owner))?;

        info!(
            "Confirmed lease {}: {} seats booked on event {}",
            owner, confirmation.confirmed_count, confirmation.event_id
        );
        Ok(confirmation)
    }

    async fn confirm_in(&self, tx: &mut S::Tx, owner: LeaseOwner) -> LeaseResult<Confirmation> {
        let now = self.clock.now();
        let seats = tx.find_leased(owner, SeatState::Held).await?;
        if seats.is_empty() || seats.iter().any(|seat| seat.is_expired_at(now)) {
            return Err(LeaseError::LeaseNotFound(owner));
        }

        let event_id = single_event(&seats, owner)?;
        let count = seats.len() as u64;
        let changed = tx.transition_many(&seat_ids(&seats), &Transition::Book { owner, now }).await?;
        if changed != count {
            warn!("Lease {} changed under confirm: {} of {} seats booked", owner, changed, count);
            return Err(LeaseError::LeaseNotFound(owner));
        }

        tx.adjust_counts(event_id, CountDelta::book(count)).await?;

        Ok(Confirmation {
            lease_owner: owner,
            confirmed_count: count,
            event_id,
        })
    }

    /// Returns every HELD seat of the lease to the pool, expired or not.
    pub async fn release(&self, owner: LeaseOwner) -> LeaseResult<Released> {
        let mut tx = self.store.begin().await?;
        let result = self.release_in(&mut tx, owner).await;
        let released = finish(tx, result).await.map_err(|err| lease_conflict(err, owner))?;

        info!(
            "Released lease {}: {} seats back on event {}",
            owner, released.released_count, released.event_id
        );
        Ok(released)
    }

    async fn release_in(&self, tx: &mut S::Tx, owner: LeaseOwner) -> LeaseResult<Released> {
        let seats = tx.find_leased(owner, SeatState::Held).await?;
        if seats.is_empty() {
            return Err(LeaseError::LeaseNotFound(owner));
        }

        let event_id = single_event(&seats, owner)?;
        let count = seats.len() as u64;
        let changed = tx.transition_many(&seat_ids(&seats), &Transition::Release { owner }).await?;
        if changed != count {
            warn!("Lease {} changed under release: {} of {} seats freed", owner, changed, count);
            return Err(LeaseError::LeaseNotFound(owner));
        }

        tx.adjust_counts(event_id, CountDelta::release(count)).await?;

        Ok(Released {
            lease_owner: owner,
            released_count: count,
            event_id,
        })
    }

    /// Recomputes an event's counters from its seat rows and overwrites them.
    ///
    /// Repair path only; nothing on the hot path calls this.
    pub async fn reconcile(&self, event_id: EventId) -> LeaseResult<ReconcileReport> {
        let mut attempt = 1;
        let report = loop {
            let mut tx = self.store.begin().await?;
            let result = reconcile_in(&mut tx, event_id).await;
            match finish(tx, result).await {
                Err(LeaseError::Internal(StoreError::Conflict)) if attempt < RECONCILE_ATTEMPTS => {
                    debug!("Reconcile of event {} raced a counter update, retrying", event_id);
                    attempt += 1;
                }
                other => break other?,
            }
        };

        if report.drifted {
            warn!(
                "Reconciled event {}: counters {:?} corrected to {:?}",
                event_id, report.before, report.after
            );
        } else {
            debug!("Reconciled event {}: no drift", event_id);
        }
        Ok(report)
    }
}

async fn reconcile_in<T: LedgerTx>(tx: &mut T, event_id: EventId) -> LeaseResult<ReconcileReport> {
    // Counter writers queue behind this lock, so the count below cannot
    // straddle one of their commits.
    let event = tx.lock_event(event_id).await?.ok_or(LeaseError::NotFound(event_id))?;
    let before = event.counts();
    let after = tx.count_seats(event_id).await?;

    if after.total() != event.capacity {
        return Err(StoreError::Corrupt(format!(
            "event {} has {} seat rows for capacity {}",
            event_id,
            after.total(),
            event.capacity
        ))
        .into());
    }

    let drifted = before != after;
    if drifted {
        tx.overwrite_counts(event_id, after).await?;
    }

    Ok(ReconcileReport {
        event_id,
        before,
        after,
        drifted,
    })
}

/// A conflict while resolving a lease means another writer resolved it first.
fn lease_conflict(err: LeaseError, owner: LeaseOwner) -> LeaseError {
    match err {
        LeaseError::Internal(StoreError::Conflict) => LeaseError::LeaseNotFound(owner),
        other => other,
    }
}

fn seat_ids(seats: &[Seat]) -> Vec<SeatId> {
    seats.iter().map(|seat| seat.id).collect()
}

fn single_event(seats: &[Seat], owner: LeaseOwner) -> LeaseResult<EventId> {
    let events: BTreeSet<EventId> = seats.iter().map(|seat| seat.event_id).collect();
    match events.len() {
        1 => Ok(seats[0].event_id),
        _ => Err(StoreError::Corrupt(format!("lease {owner} spans events {events:?}")).into()),
    }
}
