// Store: the persistence capability both pipelines call into.
//
// Queue dequeues are atomic get-and-remove: every item is handed to exactly
// one caller. Nothing else about ordering is promised. Implementations:
// `vigil_store::PgStore` (Postgres) and `testing::MemoryStore` (tests).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::types::{
    BlockRecord, DisputeResolution, EventFilter, Notification, PendingDisputeItem,
    PendingModerationItem, PendingVerification, RelayEvent, VerificationOutcomeRecord,
};

#[async_trait]
pub trait Store: Send + Sync {
    // --- Moderation queue ---

    /// Remove and return up to `limit` pending moderation items.
    async fn dequeue_moderation_batch(&self, limit: usize) -> Result<Vec<PendingModerationItem>>;

    /// Drop an item from the moderation queue. No-op when already gone.
    async fn remove_from_moderation_queue(&self, event_id: &str) -> Result<()>;

    async fn is_blocked(&self, event_id: &str) -> Result<bool>;

    /// Suppress an event. Re-marking an already blocked event keeps the first record.
    async fn mark_blocked(&self, record: BlockRecord) -> Result<()>;

    /// Lift a block. Returns whether a block existed.
    async fn unblock_event(&self, event_id: &str) -> Result<bool>;

    /// Permanently delete block records (and their events) at least `age` old.
    async fn purge_blocked_older_than(&self, age: Duration) -> Result<u64>;

    // --- Disputes ---

    async fn dequeue_dispute_batch(&self, limit: usize) -> Result<Vec<PendingDisputeItem>>;

    async fn record_dispute_resolution(&self, resolution: DisputeResolution) -> Result<()>;

    async fn purge_resolutions_older_than(&self, age: Duration) -> Result<u64>;

    // --- Verification queue ---

    /// Remove and return up to `limit` entries last attempted at or before
    /// `eligible_before` (or never). Entries with an empty handle are
    /// discarded. Entries attempted more recently stay queued.
    async fn dequeue_verification_batch(
        &self,
        limit: usize,
        eligible_before: DateTime<Utc>,
    ) -> Result<Vec<PendingVerification>>;

    /// Queue a verification. One entry per pubkey: a changed handle replaces
    /// the entry and resets attempts, an unchanged handle is a no-op.
    async fn enqueue_verification(&self, pubkey: &str, handle: &str) -> Result<()>;

    /// Put an entry back with a new attempt count, stamping `last_attempt_at = now`.
    async fn requeue_verification(&self, pubkey: &str, handle: &str, attempts: u32) -> Result<()>;

    async fn publish_verification_outcome(&self, record: VerificationOutcomeRecord) -> Result<()>;

    // --- Events ---

    async fn query_events(&self, filter: &EventFilter) -> Result<Vec<RelayEvent>>;

    async fn create_notification(&self, notification: Notification) -> Result<()>;
}
