// In-memory Store for tests.
//
// Honors the same contract as the Postgres store: dequeues remove under one
// lock so concurrent callers never see the same item twice. Builder methods
// seed state, accessor methods snapshot it for assertions.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::store::Store;
use crate::types::{
    BlockRecord, DisputeResolution, EventFilter, Notification, PendingDisputeItem,
    PendingModerationItem, PendingVerification, RelayEvent, VerificationOutcomeRecord,
};

#[derive(Default)]
struct Inner {
    moderation_queue: Vec<PendingModerationItem>,
    dequeued_moderation: Vec<String>,
    disputes: Vec<PendingDisputeItem>,
    blocks: HashMap<String, BlockRecord>,
    resolutions: Vec<DisputeResolution>,
    verifications: Vec<PendingVerification>,
    outcomes: Vec<VerificationOutcomeRecord>,
    events: Vec<RelayEvent>,
    notifications: Vec<Notification>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- Seeding ---

    pub fn with_moderation_item(self, event_id: &str, media_urls: &[&str]) -> Self {
        self.lock().moderation_queue.push(PendingModerationItem {
            event_id: event_id.to_string(),
            media_urls: media_urls.iter().map(|u| u.to_string()).collect(),
            added_at: Utc::now(),
        });
        self
    }

    pub fn with_dispute(self, dispute: PendingDisputeItem) -> Self {
        self.lock().disputes.push(dispute);
        self
    }

    pub fn with_block(self, record: BlockRecord) -> Self {
        self.lock().blocks.insert(record.event_id.clone(), record);
        self
    }

    pub fn with_resolution(self, resolution: DisputeResolution) -> Self {
        self.lock().resolutions.push(resolution);
        self
    }

    pub fn with_verification(self, entry: PendingVerification) -> Self {
        self.lock().verifications.push(entry);
        self
    }

    pub fn with_event(self, event: RelayEvent) -> Self {
        self.lock().events.push(event);
        self
    }

    // --- Snapshots ---

    pub fn moderation_queue(&self) -> Vec<PendingModerationItem> {
        self.lock().moderation_queue.clone()
    }

    /// Event IDs in the order they were handed out by `dequeue_moderation_batch`.
    pub fn dequeued_moderation(&self) -> Vec<String> {
        self.lock().dequeued_moderation.clone()
    }

    pub fn block(&self, event_id: &str) -> Option<BlockRecord> {
        self.lock().blocks.get(event_id).cloned()
    }

    pub fn blocks(&self) -> Vec<BlockRecord> {
        self.lock().blocks.values().cloned().collect()
    }

    pub fn resolutions(&self) -> Vec<DisputeResolution> {
        self.lock().resolutions.clone()
    }

    pub fn verification_queue(&self) -> Vec<PendingVerification> {
        self.lock().verifications.clone()
    }

    pub fn outcomes(&self) -> Vec<VerificationOutcomeRecord> {
        self.lock().outcomes.clone()
    }

    pub fn events(&self) -> Vec<RelayEvent> {
        self.lock().events.clone()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.lock().notifications.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn dequeue_moderation_batch(&self, limit: usize) -> Result<Vec<PendingModerationItem>> {
        let mut inner = self.lock();
        let n = limit.min(inner.moderation_queue.len());
        let batch: Vec<_> = inner.moderation_queue.drain(..n).collect();
        inner
            .dequeued_moderation
            .extend(batch.iter().map(|i| i.event_id.clone()));
        Ok(batch)
    }

    async fn remove_from_moderation_queue(&self, event_id: &str) -> Result<()> {
        self.lock()
            .moderation_queue
            .retain(|i| i.event_id != event_id);
        Ok(())
    }

    async fn is_blocked(&self, event_id: &str) -> Result<bool> {
        Ok(self.lock().blocks.contains_key(event_id))
    }

    async fn mark_blocked(&self, record: BlockRecord) -> Result<()> {
        self.lock()
            .blocks
            .entry(record.event_id.clone())
            .or_insert(record);
        Ok(())
    }

    async fn unblock_event(&self, event_id: &str) -> Result<bool> {
        Ok(self.lock().blocks.remove(event_id).is_some())
    }

    async fn purge_blocked_older_than(&self, age: Duration) -> Result<u64> {
        let now = Utc::now();
        let mut inner = self.lock();
        let expired: Vec<String> = inner
            .blocks
            .values()
            .filter(|b| b.is_purgeable_at(now, age))
            .map(|b| b.event_id.clone())
            .collect();
        for id in &expired {
            inner.blocks.remove(id);
        }
        inner.events.retain(|e| !expired.contains(&e.id));
        Ok(expired.len() as u64)
    }

    async fn dequeue_dispute_batch(&self, limit: usize) -> Result<Vec<PendingDisputeItem>> {
        let mut inner = self.lock();
        let n = limit.min(inner.disputes.len());
        Ok(inner.disputes.drain(..n).collect())
    }

    async fn record_dispute_resolution(&self, resolution: DisputeResolution) -> Result<()> {
        self.lock().resolutions.push(resolution);
        Ok(())
    }

    async fn purge_resolutions_older_than(&self, age: Duration) -> Result<u64> {
        let cutoff = Utc::now() - age;
        let mut inner = self.lock();
        let before = inner.resolutions.len();
        inner.resolutions.retain(|r| r.resolved_at > cutoff);
        Ok((before - inner.resolutions.len()) as u64)
    }

    async fn dequeue_verification_batch(
        &self,
        limit: usize,
        eligible_before: DateTime<Utc>,
    ) -> Result<Vec<PendingVerification>> {
        let mut inner = self.lock();
        inner
            .verifications
            .retain(|v| !v.external_handle.trim().is_empty());

        let mut batch = Vec::new();
        let mut kept = Vec::new();
        for entry in inner.verifications.drain(..) {
            if batch.len() < limit && entry.is_eligible(eligible_before) {
                batch.push(entry);
            } else {
                kept.push(entry);
            }
        }
        inner.verifications = kept;
        Ok(batch)
    }

    async fn enqueue_verification(&self, pubkey: &str, handle: &str) -> Result<()> {
        let mut inner = self.lock();
        match inner.verifications.iter_mut().find(|v| v.pubkey == pubkey) {
            Some(existing) if existing.external_handle == handle => {}
            Some(existing) => *existing = PendingVerification::new(pubkey, handle),
            None => inner
                .verifications
                .push(PendingVerification::new(pubkey, handle)),
        }
        Ok(())
    }

    async fn requeue_verification(&self, pubkey: &str, handle: &str, attempts: u32) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.lock();
        let created_at = inner
            .verifications
            .iter()
            .find(|v| v.pubkey == pubkey)
            .map(|v| v.created_at)
            .unwrap_or(now);
        inner.verifications.retain(|v| v.pubkey != pubkey);
        inner.verifications.push(PendingVerification {
            pubkey: pubkey.to_string(),
            external_handle: handle.to_string(),
            created_at,
            last_attempt_at: Some(now),
            attempts,
        });
        Ok(())
    }

    async fn publish_verification_outcome(&self, record: VerificationOutcomeRecord) -> Result<()> {
        self.lock().outcomes.push(record);
        Ok(())
    }

    async fn query_events(&self, filter: &EventFilter) -> Result<Vec<RelayEvent>> {
        let inner = self.lock();
        let mut events: Vec<RelayEvent> = inner
            .events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    async fn create_notification(&self, notification: Notification) -> Result<()> {
        self.lock().notifications.push(notification);
        Ok(())
    }
}
