use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use super::{LedgerStore, LedgerTx, SeatQuery, Transition};
use crate::error::StoreError;
use crate::models::{CountDelta, Event, EventId, LeaseOwner, NewEvent, Seat, SeatCounts, SeatId, SeatState};

const EVENT_COLUMNS: &str = "id, title, starts_at, capacity, available_count, held_count, booked_count";
const SEAT_COLUMNS: &str = "id, event_id, label, state, lease_owner, lease_expiry";

/// Ledger backed by the `events` and `seats` tables.
///
/// Runs at READ COMMITTED: the guarded `UPDATE ... WHERE state = ...`
/// statements re-evaluate their predicate after waiting on a row lock, so two
/// transitions on the same seat can never both count it.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgLedger {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(PgTx { tx })
    }

    async fn get_event(&self, event_id: EventId) -> Result<Option<Event>, StoreError> {
        let event = sqlx::query_as::<_, Event>(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"))
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(event)
    }

    async fn event_exists(&self, event_id: EventId) -> Result<bool, StoreError> {
        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM events WHERE id = $1)")
            .bind(event_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn list_events(&self, offset: i64, limit: i64) -> Result<(Vec<Event>, i64), StoreError> {
        let events = sqlx::query_as::<_, Event>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events ORDER BY starts_at, id LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;

        Ok((events, total))
    }

    async fn list_seats(&self, event_id: EventId, query: SeatQuery) -> Result<(Vec<Seat>, i64), StoreError> {
        // Byte-order collation keeps label ordering identical across locales.
        let sql = format!(
            "SELECT {SEAT_COLUMNS} FROM seats
             WHERE event_id = $1 AND ($2::seat_state IS NULL OR state = $2)
             ORDER BY label COLLATE \"C\" {}
             LIMIT $3 OFFSET $4",
            query.order.as_sql()
        );
        let seats = sqlx::query_as::<_, Seat>(&sql)
            .bind(event_id)
            .bind(query.state)
            .bind(query.limit)
            .bind(query.offset)
            .fetch_all(&self.pool)
            .await?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM seats WHERE event_id = $1 AND ($2::seat_state IS NULL OR state = $2)",
        )
        .bind(event_id)
        .bind(query.state)
        .fetch_one(&self.pool)
        .await?;

        Ok((seats, total))
    }

    fn find_expired(&self, now: DateTime<Utc>, limit: i64) -> BoxStream<'_, Result<Seat, StoreError>> {
        // Served by the (state, lease_expiry) index.
        sqlx::query_as::<_, Seat>(
            "SELECT id, event_id, label, state, lease_owner, lease_expiry FROM seats
             WHERE state = 'HELD' AND lease_expiry < $1
             ORDER BY lease_expiry, id
             LIMIT $2",
        )
        .bind(now)
        .bind(limit)
        .fetch(&self.pool)
        .map_err(StoreError::from)
        .boxed()
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgTx {
    async fn get_event(&mut self, event_id: EventId) -> Result<Option<Event>, StoreError> {
        let event = sqlx::query_as::<_, Event>(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"))
            .bind(event_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(event)
    }

    async fn lock_event(&mut self, event_id: EventId) -> Result<Option<Event>, StoreError> {
        let event = sqlx::query_as::<_, Event>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE id = $1 FOR UPDATE"
        ))
        .bind(event_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(event)
    }

    async fn find_available(&mut self, event_id: EventId, labels: &[String]) -> Result<Vec<Seat>, StoreError> {
        let seats = sqlx::query_as::<_, Seat>(&format!(
            "SELECT {SEAT_COLUMNS} FROM seats
             WHERE event_id = $1 AND label = ANY($2) AND state = 'AVAILABLE'"
        ))
        .bind(event_id)
        .bind(labels)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(seats)
    }

    async fn find_leased(&mut self, owner: LeaseOwner, state: SeatState) -> Result<Vec<Seat>, StoreError> {
        let seats = sqlx::query_as::<_, Seat>(&format!(
            "SELECT {SEAT_COLUMNS} FROM seats
             WHERE lease_owner = $1 AND state = $2
             ORDER BY label"
        ))
        .bind(owner)
        .bind(state)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(seats)
    }

    async fn owner_in_use(&mut self, owner: LeaseOwner) -> Result<bool, StoreError> {
        let in_use = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM seats WHERE lease_owner = $1)")
            .bind(owner)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(in_use)
    }

    async fn transition_many(&mut self, seat_ids: &[SeatId], transition: &Transition) -> Result<u64, StoreError> {
        let query = match transition {
            Transition::Hold { owner, expiry } => sqlx::query(
                "UPDATE seats
                 SET state = 'HELD', lease_owner = $2, lease_expiry = $3, updated_at = NOW()
                 WHERE id = ANY($1) AND state = 'AVAILABLE'",
            )
            .bind(seat_ids)
            .bind(*owner)
            .bind(*expiry),
            Transition::Book { owner, now } => sqlx::query(
                "UPDATE seats
                 SET state = 'BOOKED', lease_expiry = NULL, updated_at = NOW()
                 WHERE id = ANY($1) AND state = 'HELD' AND lease_owner = $2 AND lease_expiry >= $3",
            )
            .bind(seat_ids)
            .bind(*owner)
            .bind(*now),
            Transition::Release { owner } => sqlx::query(
                "UPDATE seats
                 SET state = 'AVAILABLE', lease_owner = NULL, lease_expiry = NULL, updated_at = NOW()
                 WHERE id = ANY($1) AND state = 'HELD' AND lease_owner = $2",
            )
            .bind(seat_ids)
            .bind(*owner),
            Transition::Reclaim { now } => sqlx::query(
                "UPDATE seats
                 SET state = 'AVAILABLE', lease_owner = NULL, lease_expiry = NULL, updated_at = NOW()
                 WHERE id = ANY($1) AND state = 'HELD' AND lease_expiry < $2",
            )
            .bind(seat_ids)
            .bind(*now),
        };

        let changed = query.execute(&mut *self.tx).await?.rows_affected();
        debug!(
            "{} -> {}: {} of {} seats changed",
            transition.from_state(),
            transition.to_state(),
            changed,
            seat_ids.len()
        );
        Ok(changed)
    }

    async fn adjust_counts(&mut self, event_id: EventId, delta: CountDelta) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE events
             SET available_count = available_count + $2,
                 held_count = held_count + $3,
                 booked_count = booked_count + $4,
                 updated_at = NOW()
             WHERE id = $1",
        )
        .bind(event_id)
        .bind(delta.available)
        .bind(delta.held)
        .bind(delta.booked)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Corrupt(format!("event {event_id} has no counter row")));
        }
        Ok(())
    }

    async fn count_seats(&mut self, event_id: EventId) -> Result<SeatCounts, StoreError> {
        let rows: Vec<(SeatState, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM seats WHERE event_id = $1 GROUP BY state")
                .bind(event_id)
                .fetch_all(&mut *self.tx)
                .await?;

        let mut counts = SeatCounts::default();
        for (state, count) in rows {
            match state {
                SeatState::Available => counts.available = count,
                SeatState::Held => counts.held = count,
                SeatState::Booked => counts.booked = count,
            }
        }
        Ok(counts)
    }

    async fn overwrite_counts(&mut self, event_id: EventId, counts: SeatCounts) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE events
             SET available_count = $2, held_count = $3, booked_count = $4, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(event_id)
        .bind(counts.available)
        .bind(counts.held)
        .bind(counts.booked)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Corrupt(format!("event {event_id} has no counter row")));
        }
        Ok(())
    }

    async fn insert_event(&mut self, new_event: &NewEvent) -> Result<Event, StoreError> {
        let event = sqlx::query_as::<_, Event>(&format!(
            "INSERT INTO events (title, starts_at, capacity, available_count, held_count, booked_count)
             VALUES ($1, $2, $3, $3, 0, 0)
             RETURNING {EVENT_COLUMNS}"
        ))
        .bind(&new_event.title)
        .bind(new_event.starts_at)
        .bind(new_event.capacity)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(event)
    }

    async fn insert_seats(&mut self, event_id: EventId, labels: &[String]) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO seats (event_id, label)
             SELECT $1, label FROM UNNEST($2::text[]) AS label",
        )
        .bind(event_id)
        .bind(labels)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
