//! PostgreSQL repository.
//!
//! Uses runtime-checked `sqlx` queries. Claims are conditional updates on
//! `status`, fan-out inserts run in one transaction with
//! `ON CONFLICT DO NOTHING`, and destination counters are incremented in
//! SQL.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};
use tracing::debug;

use super::{DeliveryRepository, RepoFuture};
use crate::{
    error::{CoreError, Result},
    models::{
        Delivery, DeliveryId, DeliveryLog, DeliveryStatus, Destination, DestinationId, EventId,
    },
};

const DELIVERY_COLUMNS: &str = r"
    id, destination_id, event_id, event_type, payload, signature, status,
    attempts, max_attempts, response_status, response_body, response_headers,
    latency_ms, error_message, error_kind, next_retry_at, delivered_at,
    last_attempt_at, created_at, updated_at
";

const DESTINATION_COLUMNS: &str = r"
    id, owner_id, url, secret, event_types, is_active, timeout_ms, max_attempts,
    rate_limit, headers, success_count, failure_count, consecutive_failures,
    status, last_success_at, last_failure_at, created_at, updated_at
";

const SCHEMA: &[(&str, &str)] = &[
    (
        "destinations table",
        r"
        CREATE TABLE IF NOT EXISTS destinations (
            id UUID PRIMARY KEY,
            owner_id TEXT NOT NULL,
            url TEXT NOT NULL,
            secret TEXT NOT NULL,
            event_types TEXT[] NOT NULL DEFAULT '{}',
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            timeout_ms BIGINT NOT NULL DEFAULT 30000 CHECK (timeout_ms > 0),
            max_attempts INTEGER NOT NULL DEFAULT 5 CHECK (max_attempts > 0),
            rate_limit INTEGER CHECK (rate_limit IS NULL OR rate_limit > 0),
            headers JSONB NOT NULL DEFAULT '{}'::jsonb,
            success_count BIGINT NOT NULL DEFAULT 0,
            failure_count BIGINT NOT NULL DEFAULT 0,
            consecutive_failures BIGINT NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'ACTIVE',
            last_success_at TIMESTAMPTZ,
            last_failure_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    ),
    (
        "deliveries table",
        r"
        CREATE TABLE IF NOT EXISTS deliveries (
            id UUID PRIMARY KEY,
            destination_id UUID NOT NULL REFERENCES destinations(id),
            event_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            signature TEXT NOT NULL,
            status TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
            max_attempts INTEGER NOT NULL,
            response_status INTEGER,
            response_body TEXT,
            response_headers JSONB,
            latency_ms BIGINT,
            error_message TEXT,
            error_kind TEXT,
            next_retry_at TIMESTAMPTZ,
            delivered_at TIMESTAMPTZ,
            last_attempt_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE (destination_id, event_id)
        )
        ",
    ),
    (
        "delivery_logs table",
        r"
        CREATE TABLE IF NOT EXISTS delivery_logs (
            id UUID PRIMARY KEY,
            destination_id UUID NOT NULL,
            delivery_id UUID,
            action TEXT NOT NULL,
            message TEXT NOT NULL,
            metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    ),
    (
        "pending deliveries index",
        r"
        CREATE INDEX IF NOT EXISTS idx_deliveries_pending
        ON deliveries (next_retry_at)
        WHERE status = 'PENDING'
        ",
    ),
    (
        "deliveries event index",
        r"
        CREATE INDEX IF NOT EXISTS idx_deliveries_event
        ON deliveries (event_id)
        ",
    ),
    (
        "delivery logs index",
        r"
        CREATE INDEX IF NOT EXISTS idx_delivery_logs_destination
        ON delivery_logs (destination_id, created_at DESC)
        ",
    ),
];

/// Repository backed by a PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PostgresRepository {
    pool: Arc<PgPool>,
}

impl PostgresRepository {
    /// Creates a repository over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Creates tables and indexes that do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns the first statement that fails.
    pub async fn migrate(&self) -> Result<()> {
        for (name, statement) in SCHEMA {
            sqlx::query(statement).execute(&*self.pool).await.map_err(|e| {
                CoreError::Database(format!("failed to create {name}: {e}"))
            })?;
            debug!(object = *name, "schema object ensured");
        }
        Ok(())
    }

    async fn insert_delivery<'e, E>(executor: E, delivery: &Delivery) -> Result<bool>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        let inserted: Option<DeliveryId> = sqlx::query_scalar(
            r"
            INSERT INTO deliveries (
                id, destination_id, event_id, event_type, payload, signature, status,
                attempts, max_attempts, next_retry_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (destination_id, event_id) DO NOTHING
            RETURNING id
            ",
        )
        .bind(delivery.id)
        .bind(delivery.destination_id)
        .bind(&delivery.event_id)
        .bind(&delivery.event_type)
        .bind(&delivery.payload)
        .bind(&delivery.signature)
        .bind(delivery.status)
        .bind(to_i32(delivery.attempts)?)
        .bind(to_i32(delivery.max_attempts)?)
        .bind(delivery.next_retry_at)
        .bind(delivery.created_at)
        .bind(delivery.updated_at)
        .fetch_optional(executor)
        .await?;

        Ok(inserted.is_some())
    }
}

impl DeliveryRepository for PostgresRepository {
    fn create_delivery(&self, delivery: Delivery) -> RepoFuture<'_, Option<Delivery>> {
        Box::pin(async move {
            let inserted = Self::insert_delivery(&*self.pool, &delivery).await?;
            Ok(inserted.then_some(delivery))
        })
    }

    fn create_deliveries(&self, deliveries: Vec<Delivery>) -> RepoFuture<'_, Vec<Delivery>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            let mut created = Vec::with_capacity(deliveries.len());
            for delivery in deliveries {
                if Self::insert_delivery(&mut *tx, &delivery).await? {
                    created.push(delivery);
                }
            }
            tx.commit().await?;
            Ok(created)
        })
    }

    fn update_delivery<'a>(&'a self, delivery: &'a Delivery) -> RepoFuture<'a, ()> {
        Box::pin(async move {
            let response_status = delivery.response_status.map(i32::from);
            let latency_ms = delivery.latency_ms.map(to_i64).transpose()?;
            let response_headers = delivery.response_headers.as_ref().map(Json);

            let result = sqlx::query(
                r"
                UPDATE deliveries SET
                    signature = $2,
                    status = $3,
                    attempts = $4,
                    response_status = $5,
                    response_body = $6,
                    response_headers = $7,
                    latency_ms = $8,
                    error_message = $9,
                    error_kind = $10,
                    next_retry_at = $11,
                    delivered_at = $12,
                    last_attempt_at = $13,
                    updated_at = $14,
                    max_attempts = $15
                WHERE id = $1
                ",
            )
            .bind(delivery.id)
            .bind(&delivery.signature)
            .bind(delivery.status)
            .bind(to_i32(delivery.attempts)?)
            .bind(response_status)
            .bind(&delivery.response_body)
            .bind(response_headers)
            .bind(latency_ms)
            .bind(&delivery.error_message)
            .bind(delivery.error_kind)
            .bind(delivery.next_retry_at)
            .bind(delivery.delivered_at)
            .bind(delivery.last_attempt_at)
            .bind(delivery.updated_at)
            .bind(to_i32(delivery.max_attempts)?)
            .execute(&*self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(CoreError::NotFound(format!("delivery {}", delivery.id)));
            }
            Ok(())
        })
    }

    fn find_delivery_by_id(&self, id: DeliveryId) -> RepoFuture<'_, Option<Delivery>> {
        Box::pin(async move {
            let query = format!("SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE id = $1");
            let delivery = sqlx::query_as::<_, Delivery>(&query)
                .bind(id)
                .fetch_optional(&*self.pool)
                .await?;
            Ok(delivery)
        })
    }

    fn find_pending_deliveries(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> RepoFuture<'_, Vec<Delivery>> {
        Box::pin(async move {
            let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);
            let query = format!(
                r"
                SELECT {DELIVERY_COLUMNS} FROM deliveries
                WHERE status = 'PENDING'
                  AND attempts < max_attempts
                  AND (next_retry_at IS NULL OR next_retry_at <= $1)
                ORDER BY next_retry_at ASC NULLS FIRST, created_at ASC
                LIMIT $2
                "
            );
            let deliveries = sqlx::query_as::<_, Delivery>(&query)
                .bind(now)
                .bind(limit)
                .fetch_all(&*self.pool)
                .await?;
            Ok(deliveries)
        })
    }

    fn claim_delivery(
        &self,
        id: DeliveryId,
        now: DateTime<Utc>,
    ) -> RepoFuture<'_, Option<Delivery>> {
        Box::pin(async move {
            let query = format!(
                r"
                UPDATE deliveries
                SET status = $3, last_attempt_at = $2, updated_at = $2
                WHERE id = $1 AND status = $4
                  AND (next_retry_at IS NULL OR next_retry_at <= $2)
                RETURNING {DELIVERY_COLUMNS}
                "
            );
            let delivery = sqlx::query_as::<_, Delivery>(&query)
                .bind(id)
                .bind(now)
                .bind(DeliveryStatus::Delivering)
                .bind(DeliveryStatus::Pending)
                .fetch_optional(&*self.pool)
                .await?;
            Ok(delivery)
        })
    }

    fn release_stale_deliveries(&self, claimed_before: DateTime<Utc>) -> RepoFuture<'_, u64> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE deliveries
                SET status = 'PENDING', updated_at = NOW()
                WHERE status = 'DELIVERING'
                  AND (last_attempt_at IS NULL OR last_attempt_at < $1)
                ",
            )
            .bind(claimed_before)
            .execute(&*self.pool)
            .await?;
            Ok(result.rows_affected())
        })
    }

    fn find_destination_by_id(&self, id: DestinationId) -> RepoFuture<'_, Option<Destination>> {
        Box::pin(async move {
            let query = format!("SELECT {DESTINATION_COLUMNS} FROM destinations WHERE id = $1");
            let destination = sqlx::query_as::<_, Destination>(&query)
                .bind(id)
                .fetch_optional(&*self.pool)
                .await?;
            Ok(destination)
        })
    }

    fn find_active_destinations_by_event_type<'a>(
        &'a self,
        event_type: &'a str,
    ) -> RepoFuture<'a, Vec<Destination>> {
        Box::pin(async move {
            let query = format!(
                r"
                SELECT {DESTINATION_COLUMNS} FROM destinations
                WHERE is_active AND status = 'ACTIVE'
                  AND EXISTS (
                      SELECT 1 FROM unnest(event_types) AS pattern
                      WHERE pattern = $1
                         OR (right(pattern, 1) = '*' AND starts_with($1, left(pattern, -1)))
                  )
                ORDER BY created_at ASC
                "
            );
            let destinations = sqlx::query_as::<_, Destination>(&query)
                .bind(event_type)
                .fetch_all(&*self.pool)
                .await?;
            Ok(destinations)
        })
    }

    fn is_event_processed<'a>(&'a self, event_id: &'a EventId) -> RepoFuture<'a, bool> {
        Box::pin(async move {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM deliveries WHERE event_id = $1)")
                    .bind(event_id)
                    .fetch_one(&*self.pool)
                    .await?;
            Ok(exists)
        })
    }

    fn increment_failure_count(
        &self,
        id: DestinationId,
        at: DateTime<Utc>,
    ) -> RepoFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                UPDATE destinations SET
                    failure_count = failure_count + 1,
                    consecutive_failures = consecutive_failures + 1,
                    last_failure_at = $2,
                    updated_at = $2
                WHERE id = $1
                ",
            )
            .bind(id)
            .bind(at)
            .execute(&*self.pool)
            .await?;
            Ok(())
        })
    }

    fn record_success(&self, id: DestinationId, at: DateTime<Utc>) -> RepoFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                UPDATE destinations SET
                    success_count = success_count + 1,
                    consecutive_failures = 0,
                    last_success_at = $2,
                    updated_at = $2
                WHERE id = $1
                ",
            )
            .bind(id)
            .bind(at)
            .execute(&*self.pool)
            .await?;
            Ok(())
        })
    }

    fn create_log(&self, log: DeliveryLog) -> RepoFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO delivery_logs (
                    id, destination_id, delivery_id, action, message, metadata, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                ",
            )
            .bind(log.id)
            .bind(log.destination_id)
            .bind(log.delivery_id)
            .bind(log.action)
            .bind(&log.message)
            .bind(Json(&log.metadata))
            .bind(log.created_at)
            .execute(&*self.pool)
            .await?;
            Ok(())
        })
    }
}

fn to_i32(value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|_| CoreError::InvalidInput(format!("{value} exceeds INTEGER")))
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| CoreError::InvalidInput(format!("{value} exceeds BIGINT")))
}
