// Postgres implementation of the pipelines' Store.
//
// Dequeues are single `DELETE ... RETURNING` statements over a
// `FOR UPDATE SKIP LOCKED` subselect, so concurrent pollers (in this process
// or another) never receive the same row.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::debug;

use vigil_common::{
    BlockRecord, DisputeResolution, EventFilter, Notification, PendingDisputeItem,
    PendingModerationItem, PendingVerification, RelayEvent, Store, VerificationOutcomeRecord,
};

pub struct PgStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct ModerationRow {
    event_id: String,
    media_urls: Vec<String>,
    added_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct DisputeRow {
    dispute_id: String,
    ticket_id: String,
    event_id: String,
    user_pubkey: String,
    dispute_reason: String,
}

#[derive(sqlx::FromRow)]
struct VerificationRow {
    pubkey: String,
    external_handle: String,
    created_at: DateTime<Utc>,
    last_attempt_at: Option<DateTime<Utc>>,
    attempts: i32,
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    pubkey: String,
    kind: i32,
    created_at: i64,
    tags: Json<Vec<Vec<String>>>,
    content: String,
}

impl From<EventRow> for RelayEvent {
    fn from(row: EventRow) -> Self {
        RelayEvent {
            id: row.id,
            pubkey: row.pubkey,
            kind: row.kind.max(0) as u32,
            created_at: row.created_at,
            tags: row.tags.0,
            content: row.content,
        }
    }
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("Failed to connect to Postgres")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;
        Ok(())
    }

    // --- Ingestion-side helpers (enqueueing lives outside the pipelines) ---

    pub async fn insert_event(&self, event: &RelayEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events (id, pubkey, kind, created_at, tags, content)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&event.id)
        .bind(&event.pubkey)
        .bind(event.kind as i32)
        .bind(event.created_at)
        .bind(Json(&event.tags))
        .bind(&event.content)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn enqueue_moderation(&self, event_id: &str, media_urls: &[String]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO moderation_queue (event_id, media_urls)
            VALUES ($1, $2)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(media_urls)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn enqueue_dispute(&self, dispute: &PendingDisputeItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dispute_queue (dispute_id, ticket_id, event_id, user_pubkey, dispute_reason)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (dispute_id) DO NOTHING
            "#,
        )
        .bind(&dispute.dispute_id)
        .bind(&dispute.ticket_id)
        .bind(&dispute.event_id)
        .bind(&dispute.user_pubkey)
        .bind(&dispute.dispute_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn dequeue_moderation_batch(&self, limit: usize) -> Result<Vec<PendingModerationItem>> {
        let rows = sqlx::query_as::<_, ModerationRow>(
            r#"
            DELETE FROM moderation_queue
            WHERE event_id IN (
                SELECT event_id FROM moderation_queue
                ORDER BY added_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING event_id, media_urls, added_at
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to dequeue moderation batch")?;

        Ok(rows
            .into_iter()
            .map(|r| PendingModerationItem {
                event_id: r.event_id,
                media_urls: r.media_urls,
                added_at: r.added_at,
            })
            .collect())
    }

    async fn remove_from_moderation_queue(&self, event_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM moderation_queue WHERE event_id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn is_blocked(&self, event_id: &str) -> Result<bool> {
        let blocked = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM blocked_events WHERE event_id = $1)",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(blocked)
    }

    async fn mark_blocked(&self, record: BlockRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO blocked_events (event_id, blocked_at, reason, content_level, offending_url)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&record.event_id)
        .bind(record.blocked_at)
        .bind(&record.reason)
        .bind(record.content_level as i16)
        .bind(&record.offending_url)
        .execute(&self.pool)
        .await
        .context("Failed to mark event blocked")?;
        Ok(())
    }

    async fn unblock_event(&self, event_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM blocked_events WHERE event_id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_blocked_older_than(&self, age: Duration) -> Result<u64> {
        let cutoff = Utc::now() - age;
        let purged = sqlx::query_scalar::<_, i64>(
            r#"
            WITH purged AS (
                DELETE FROM blocked_events WHERE blocked_at <= $1 RETURNING event_id
            ),
            removed AS (
                DELETE FROM events WHERE id IN (SELECT event_id FROM purged)
            )
            SELECT count(*) FROM purged
            "#,
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .context("Failed to purge blocked events")?;

        debug!(purged, %cutoff, "Purged blocked events");
        Ok(purged.max(0) as u64)
    }

    async fn dequeue_dispute_batch(&self, limit: usize) -> Result<Vec<PendingDisputeItem>> {
        let rows = sqlx::query_as::<_, DisputeRow>(
            r#"
            DELETE FROM dispute_queue
            WHERE dispute_id IN (
                SELECT dispute_id FROM dispute_queue
                ORDER BY added_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING dispute_id, ticket_id, event_id, user_pubkey, dispute_reason
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to dequeue dispute batch")?;

        Ok(rows
            .into_iter()
            .map(|r| PendingDisputeItem {
                dispute_id: r.dispute_id,
                ticket_id: r.ticket_id,
                event_id: r.event_id,
                user_pubkey: r.user_pubkey,
                dispute_reason: r.dispute_reason,
            })
            .collect())
    }

    async fn record_dispute_resolution(&self, resolution: DisputeResolution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dispute_resolutions
                (dispute_id, ticket_id, event_id, user_pubkey, approved, explanation, resolved_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (dispute_id) DO UPDATE SET
                approved = EXCLUDED.approved,
                explanation = EXCLUDED.explanation,
                resolved_at = EXCLUDED.resolved_at
            "#,
        )
        .bind(&resolution.dispute_id)
        .bind(&resolution.ticket_id)
        .bind(&resolution.event_id)
        .bind(&resolution.user_pubkey)
        .bind(resolution.approved)
        .bind(&resolution.explanation)
        .bind(resolution.resolved_at)
        .execute(&self.pool)
        .await
        .context("Failed to record dispute resolution")?;
        Ok(())
    }

    async fn purge_resolutions_older_than(&self, age: Duration) -> Result<u64> {
        let result = sqlx::query("DELETE FROM dispute_resolutions WHERE resolved_at <= $1")
            .bind(Utc::now() - age)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn dequeue_verification_batch(
        &self,
        limit: usize,
        eligible_before: DateTime<Utc>,
    ) -> Result<Vec<PendingVerification>> {
        sqlx::query("DELETE FROM verification_queue WHERE btrim(external_handle) = ''")
            .execute(&self.pool)
            .await?;

        let rows = sqlx::query_as::<_, VerificationRow>(
            r#"
            DELETE FROM verification_queue
            WHERE pubkey IN (
                SELECT pubkey FROM verification_queue
                WHERE last_attempt_at IS NULL OR last_attempt_at <= $2
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING pubkey, external_handle, created_at, last_attempt_at, attempts
            "#,
        )
        .bind(limit as i64)
        .bind(eligible_before)
        .fetch_all(&self.pool)
        .await
        .context("Failed to dequeue verification batch")?;

        Ok(rows
            .into_iter()
            .map(|r| PendingVerification {
                pubkey: r.pubkey,
                external_handle: r.external_handle,
                created_at: r.created_at,
                last_attempt_at: r.last_attempt_at,
                attempts: r.attempts.max(0) as u32,
            })
            .collect())
    }

    async fn enqueue_verification(&self, pubkey: &str, handle: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO verification_queue (pubkey, external_handle)
            VALUES ($1, $2)
            ON CONFLICT (pubkey) DO UPDATE SET
                external_handle = EXCLUDED.external_handle,
                created_at = now(),
                last_attempt_at = NULL,
                attempts = 0
            WHERE verification_queue.external_handle <> EXCLUDED.external_handle
            "#,
        )
        .bind(pubkey)
        .bind(handle)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn requeue_verification(&self, pubkey: &str, handle: &str, attempts: u32) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO verification_queue (pubkey, external_handle, attempts, last_attempt_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (pubkey) DO UPDATE SET
                external_handle = EXCLUDED.external_handle,
                attempts = EXCLUDED.attempts,
                last_attempt_at = now()
            "#,
        )
        .bind(pubkey)
        .bind(handle)
        .bind(attempts as i32)
        .execute(&self.pool)
        .await
        .context("Failed to requeue verification")?;
        Ok(())
    }

    async fn publish_verification_outcome(&self, record: VerificationOutcomeRecord) -> Result<()> {
        let payload = serde_json::to_value(&record)?;
        sqlx::query(
            r#"
            INSERT INTO verification_outcomes (pubkey, verified, payload)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(&record.pubkey)
        .bind(record.verified)
        .bind(payload)
        .execute(&self.pool)
        .await
        .context("Failed to publish verification outcome")?;
        Ok(())
    }

    async fn query_events(&self, filter: &EventFilter) -> Result<Vec<RelayEvent>> {
        let kinds: Vec<i32> = filter.kinds.iter().map(|k| *k as i32).collect();
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, pubkey, kind, created_at, tags, content
            FROM events
            WHERE (cardinality($1::text[]) = 0 OR id = ANY($1))
              AND (cardinality($2::text[]) = 0 OR pubkey = ANY($2))
              AND (cardinality($3::int[]) = 0 OR kind = ANY($3))
            ORDER BY created_at DESC
            LIMIT $4
            "#,
        )
        .bind(&filter.ids)
        .bind(&filter.authors)
        .bind(&kinds)
        .bind(filter.limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await
        .context("Failed to query events")?;

        Ok(rows.into_iter().map(RelayEvent::from).collect())
    }

    async fn create_notification(&self, notification: Notification) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (recipient, event_id, kind, message, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&notification.recipient)
        .bind(&notification.event_id)
        .bind(notification.kind.to_string())
        .bind(&notification.message)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
