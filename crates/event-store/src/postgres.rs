use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use common::{AggregateId, CommandId, EventId};

use crate::{
    EventEnvelope, Result, StoreError,
    store::{AggregateEventStore, LockingMode, validate_batch},
};

/// Name of the unique constraint that implements optimistic locking.
const ORDINAL_CONSTRAINT: &str = "uq_aggregate_events_ordinal";

/// PostgreSQL-backed aggregate event store.
///
/// The `(aggregate_id, ordinal)` unique constraint acts as a compare-and-swap:
/// a racing insert raises a duplicate-key error, which is recognized and
/// re-raised as [`StoreError::LockViolation`]. Raw driver errors never reach
/// callers as conflicts.
#[derive(Clone)]
pub struct PostgresAggregateEventStore {
    pool: PgPool,
    locking: LockingMode,
}

impl PostgresAggregateEventStore {
    /// Creates a new PostgreSQL event store.
    pub fn new(pool: PgPool, locking: LockingMode) -> Self {
        Self { pool, locking }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_envelope(row: PgRow) -> Result<EventEnvelope> {
        let issuer: Option<Uuid> = row.try_get("issuer_command_id")?;
        Ok(EventEnvelope {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
            aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
            issuer_command_id: issuer.map(CommandId::from_uuid),
            type_tag: row.try_get("event_type")?,
            created_time: row.try_get("event_created_time")?,
            committed_time: row.try_get("event_committed_time")?,
            payload: row.try_get("event_content")?,
            ordinal: row.try_get("ordinal")?,
        })
    }

    async fn insert_event(
        tx: &mut Transaction<'_, Postgres>,
        event: &EventEnvelope,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO aggregate_events (
                event_id, aggregate_id, issuer_command_id, event_created_time,
                event_committed_time, event_type, event_content, ordinal
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.event_id.as_uuid())
        .bind(event.aggregate_id.as_uuid())
        .bind(event.issuer_command_id.map(|c| c.as_uuid()))
        .bind(event.created_time)
        .bind(Utc::now())
        .bind(&event.type_tag)
        .bind(&event.payload)
        .bind(event.ordinal)
        .execute(&mut **tx)
        .await
        .map_err(|e| Self::map_insert_error(e, event))?;
        Ok(())
    }

    fn map_insert_error(e: sqlx::Error, event: &EventEnvelope) -> StoreError {
        if let sqlx::Error::Database(ref db_err) = e
            && db_err.constraint() == Some(ORDINAL_CONSTRAINT)
        {
            return StoreError::LockViolation {
                aggregate_id: event.aggregate_id,
                ordinal: event.ordinal,
                source: Some(std::sync::Arc::new(e)),
            };
        }
        StoreError::from(e)
    }
}

#[async_trait]
impl AggregateEventStore for PostgresAggregateEventStore {
    async fn get_events_of(&self, aggregate_id: AggregateId) -> Result<Vec<EventEnvelope>> {
        let order_by = match self.locking {
            LockingMode::Optimistic => "ordinal ASC NULLS LAST, event_committed_time ASC",
            LockingMode::Off => "event_committed_time ASC",
        };
        let sql = format!(
            r#"
            SELECT event_id, aggregate_id, issuer_command_id, event_created_time,
                   event_committed_time, event_type, event_content, ordinal
            FROM aggregate_events
            WHERE aggregate_id = $1
            ORDER BY {order_by}
            "#,
        );

        let rows = sqlx::query(&sql)
            .bind(aggregate_id.as_uuid())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_envelope).collect()
    }

    async fn commit_event(&self, event: EventEnvelope) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_event(&mut tx, &event).await?;
        tx.commit().await?;
        tracing::debug!(
            aggregate_id = %event.aggregate_id,
            event_type = %event.type_tag,
            ordinal = ?event.ordinal,
            "committed event"
        );
        Ok(())
    }

    async fn commit_all_events(&self, events: Vec<EventEnvelope>) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        validate_batch(&events)?;

        let mut tx = self.pool.begin().await?;
        for event in &events {
            Self::insert_event(&mut tx, event).await?;
        }
        tx.commit().await?;
        tracing::info!(count = events.len(), "committed event batch");
        Ok(())
    }
}
