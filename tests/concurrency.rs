mod common;

use chrono::Duration;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

use common::{labels, Fixture};
use seat_lease::clock::Clock;
use seat_lease::error::LeaseError;
use seat_lease::models::{LeaseOwner, SeatState};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_holds_on_the_same_seats_have_one_winner() {
    let fx = Arc::new(Fixture::new());
    let event_id = fx.event(10).await;

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let fx = Arc::clone(&fx);
        tasks.push(tokio::spawn(async move {
            let owner = LeaseOwner::generate();
            fx.leases
                .hold(event_id, &labels(&["A1", "A2"]), owner, Duration::minutes(5))
                .await
                .map(|_| owner)
        }));
    }

    let mut winners = Vec::new();
    for task in tasks {
        match task.await.unwrap() {
            Ok(owner) => winners.push(owner),
            Err(LeaseError::SeatUnavailable { .. }) => {}
            Err(other) => panic!("unexpected hold failure: {other:?}"),
        }
    }

    assert_eq!(winners.len(), 1);
    let a1 = fx.ledger.seat_by_label(event_id, "A1").unwrap();
    let a2 = fx.ledger.seat_by_label(event_id, "A2").unwrap();
    assert_eq!(a1.lease_owner, Some(winners[0]));
    assert_eq!(a2.lease_owner, Some(winners[0]));
    fx.assert_invariants(event_id).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_holds_never_share_a_seat() {
    let fx = Arc::new(Fixture::new());
    let event_id = fx.event(10).await;

    let mut tasks = Vec::new();
    for start in 1..=9 {
        let fx = Arc::clone(&fx);
        tasks.push(tokio::spawn(async move {
            let requested = vec![format!("A{}", start), format!("A{}", start + 1)];
            let owner = LeaseOwner::generate();
            fx.leases
                .hold(event_id, &requested, owner, Duration::minutes(5))
                .await
                .map(|_| (owner, requested))
        }));
    }

    let mut held = HashSet::new();
    for task in tasks {
        if let Ok((owner, requested)) = task.await.unwrap() {
            for label in requested {
                assert!(held.insert(label.clone()), "{label} granted twice");
                assert_eq!(fx.ledger.seat_by_label(event_id, &label).unwrap().lease_owner, Some(owner));
            }
        }
    }

    let counts = fx.counts(event_id).await;
    assert_eq!(counts.held as usize, held.len());
    fx.assert_invariants(event_id).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn confirm_racing_the_sweeper_never_double_counts() {
    let fx = Arc::new(Fixture::new());
    let event_id = fx.event(10).await;
    let owners: Vec<LeaseOwner> = (0..5).map(|_| LeaseOwner::generate()).collect();
    for (i, owner) in owners.iter().enumerate() {
        fx.leases
            .hold(event_id, &[format!("A{}", i + 1)], *owner, Duration::minutes(5))
            .await
            .unwrap();
    }
    // Exactly at expiry: confirm still allowed, sweeper must not reclaim.
    fx.clock.advance(Duration::minutes(5));

    let sweeper = fx.sweeper(100);
    let sweep = tokio::spawn(async move { sweeper.run_once().await });
    let mut confirms = Vec::new();
    for owner in owners.clone() {
        let fx = Arc::clone(&fx);
        confirms.push(tokio::spawn(async move { fx.leases.confirm(owner).await }));
    }

    for confirm in confirms {
        confirm.await.unwrap().unwrap();
    }
    assert!(sweep.await.unwrap().unwrap().is_noop());
    assert_eq!(fx.counts(event_id).await.booked, 5);
    fx.assert_invariants(event_id).await;
}

#[derive(Debug, Clone)]
enum Op {
    Hold { first: usize, len: usize, minutes: i64 },
    Confirm(usize),
    Release(usize),
    Sweep,
    Advance(i64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..8, 1usize..=3, 1i64..=10).prop_map(|(first, len, minutes)| Op::Hold { first, len, minutes }),
        2 => (0usize..16).prop_map(Op::Confirm),
        1 => (0usize..16).prop_map(Op::Release),
        1 => Just(Op::Sweep),
        2 => (1i64..=6).prop_map(Op::Advance),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn counters_always_match_seats(ops in proptest::collection::vec(op(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let fx = Fixture::new();
            let event_id = fx.event(10).await;
            let mut owners: Vec<(LeaseOwner, chrono::DateTime<chrono::Utc>)> = Vec::new();

            for op in ops {
                match op {
                    Op::Hold { first, len, minutes } => {
                        let requested: Vec<String> =
                            (first..(first + len).min(10)).map(|n| format!("A{}", n + 1)).collect();
                        let owner = LeaseOwner::generate();
                        let now = fx.clock.now();
                        if fx.leases.hold(event_id, &requested, owner, Duration::minutes(minutes)).await.is_ok() {
                            owners.push((owner, now + Duration::minutes(minutes)));
                        }
                    }
                    Op::Confirm(i) if !owners.is_empty() => {
                        let (owner, expiry) = owners[i % owners.len()];
                        let result = fx.leases.confirm(owner).await;
                        if expiry < fx.clock.now() {
                            assert!(matches!(result, Err(LeaseError::LeaseNotFound(_))));
                        }
                    }
                    Op::Release(i) if !owners.is_empty() => {
                        let (owner, _) = owners[i % owners.len()];
                        let _ = fx.leases.release(owner).await;
                    }
                    Op::Sweep => {
                        let now = fx.clock.now();
                        fx.sweeper(4).run_once().await.unwrap();
                        fx.sweeper(100).run_once().await.unwrap();
                        assert!(fx.ledger.seats_of(event_id).iter().all(|s| !s.is_expired_at(now)));
                    }
                    Op::Advance(minutes) => fx.clock.advance(Duration::minutes(minutes)),
                    _ => {}
                }
                fx.assert_invariants(event_id).await;
            }

            for seat in fx.ledger.seats_of(event_id) {
                if seat.state == SeatState::Booked {
                    assert!(seat.lease_owner.is_some());
                }
            }
        });
    }
}
