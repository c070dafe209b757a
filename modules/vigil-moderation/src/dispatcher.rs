//! Moderation dispatcher.
//!
//! Each poll dequeues a batch, skips events that are already blocked, and
//! spawns one task per remaining item under a semaphore bounding worker
//! concurrency. A task classifies the item's media in order and blocks the
//! event on the first BLOCK verdict. Classifier failures never block: the
//! pipeline fails open.
//!
//! ```text
//! Unevaluated ──► Passed
//!      └────────► Blocked ──► Disputed ──► Approved ──► Unblocked
//!                    │                └──► Rejected ──► Blocked
//!                    └──────────────────────────────────────────► Purged (48h)
//! ```

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use classifier_client::{ModerationVerdict, VerdictSource};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use vigil_common::config::ModerationConfig;
use vigil_common::{
    catch_panic, BlockRecord, DisputeResolution, EventFilter, Notification, NotificationKind,
    PendingDisputeItem, PendingModerationItem, PeriodicTask, Scheduler, Store,
};

use crate::classifier::MediaClassifier;
use crate::cleanup::cleanup_temp_files;

pub const NO_MEDIA_EXPLANATION: &str = "no media available for re-evaluation";

/// Terminal state of one moderation item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Passed,
    Blocked { offending_url: String },
}

pub struct ModerationDispatcher {
    store: Arc<dyn Store>,
    classifier: Arc<dyn MediaClassifier>,
    config: ModerationConfig,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl ModerationDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        classifier: Arc<dyn MediaClassifier>,
        config: ModerationConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.worker_concurrency.max(1)));
        Self {
            store,
            classifier,
            config,
            permits,
            tracker: TaskTracker::new(),
        }
    }

    /// One poll cycle. Returns the number of items handed to workers.
    pub async fn poll_once(&self) -> Result<usize> {
        let batch = self
            .store
            .dequeue_moderation_batch(self.config.batch_size)
            .await?;
        if batch.is_empty() {
            return Ok(0);
        }
        debug!(count = batch.len(), "Dequeued moderation batch");

        let mut spawned = 0;
        for item in batch {
            match self.store.is_blocked(&item.event_id).await {
                Ok(true) => {
                    debug!(event_id = %item.event_id, "Already blocked, skipping");
                    if let Err(e) = self.store.remove_from_moderation_queue(&item.event_id).await {
                        warn!(event_id = %item.event_id, error = %e, "Failed to drop skipped item");
                    }
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(event_id = %item.event_id, error = %e, "Block check failed, evaluating anyway");
                }
            }

            let permit = self.permits.clone().acquire_owned().await?;
            let store = self.store.clone();
            let classifier = self.classifier.clone();
            self.tracker.spawn(async move {
                let _permit = permit;
                let event_id = item.event_id.clone();
                let result =
                    catch_panic(process_item(store.as_ref(), classifier.as_ref(), &item)).await;
                if let Err(e) = result {
                    error!(event_id = %event_id, error = %e, "Moderation task failed");
                }
                if let Err(e) = store.remove_from_moderation_queue(&event_id).await {
                    warn!(event_id = %event_id, error = %e, "Failed to remove item from queue");
                }
            });
            spawned += 1;
        }

        Ok(spawned)
    }

    /// Wait until every spawned item task has finished.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Resolve one batch of disputes. Returns the number resolved.
    pub async fn resolve_disputes_once(&self) -> Result<usize> {
        let batch = self
            .store
            .dequeue_dispute_batch(self.config.batch_size)
            .await?;

        let mut resolved = 0;
        for dispute in batch {
            match catch_panic(self.resolve_dispute(&dispute)).await {
                Ok(Some(_)) => resolved += 1,
                Ok(None) => {}
                Err(e) => error!(
                    dispute_id = %dispute.dispute_id,
                    event_id = %dispute.event_id,
                    error = %e,
                    "Dispute resolution failed"
                ),
            }
        }
        Ok(resolved)
    }

    /// Re-evaluate a disputed block. `None` when the dispute is stale.
    pub async fn resolve_dispute(
        &self,
        dispute: &PendingDisputeItem,
    ) -> Result<Option<DisputeResolution>> {
        if !self.store.is_blocked(&dispute.event_id).await? {
            info!(
                dispute_id = %dispute.dispute_id,
                event_id = %dispute.event_id,
                "Event no longer blocked, dropping stale dispute"
            );
            return Ok(None);
        }

        let media_urls = self
            .store
            .query_events(&EventFilter::by_id(&dispute.event_id))
            .await?
            .first()
            .map(|e| e.media_urls())
            .unwrap_or_default();

        let (approved, explanation) = if media_urls.is_empty() {
            (false, NO_MEDIA_EXPLANATION.to_string())
        } else {
            self.reevaluate(dispute, &media_urls).await
        };

        if approved {
            self.store.unblock_event(&dispute.event_id).await?;
        }

        let resolution = DisputeResolution {
            dispute_id: dispute.dispute_id.clone(),
            ticket_id: dispute.ticket_id.clone(),
            event_id: dispute.event_id.clone(),
            user_pubkey: dispute.user_pubkey.clone(),
            approved,
            explanation,
            resolved_at: Utc::now(),
        };
        self.store
            .record_dispute_resolution(resolution.clone())
            .await?;
        self.store
            .create_notification(Notification {
                recipient: Some(dispute.user_pubkey.clone()),
                event_id: Some(dispute.event_id.clone()),
                kind: NotificationKind::DisputeResolved,
                message: format!(
                    "Your dispute was {}: {}",
                    resolution.status(),
                    resolution.explanation
                ),
                created_at: resolution.resolved_at,
            })
            .await?;

        info!(
            dispute_id = %dispute.dispute_id,
            event_id = %dispute.event_id,
            status = resolution.status(),
            "Dispute resolved"
        );
        Ok(Some(resolution))
    }

    /// The first non-BLOCK verdict the classifier actually produced approves.
    /// Fail-open and disabled verdicts count as neither, like classifier errors.
    async fn reevaluate(&self, dispute: &PendingDisputeItem, urls: &[String]) -> (bool, String) {
        let mut explanation = String::new();
        for url in urls {
            match self
                .classifier
                .classify_dispute(url, &dispute.dispute_reason)
                .await
            {
                Ok(verdict) if verdict.source != VerdictSource::Classifier => {
                    warn!(
                        dispute_id = %dispute.dispute_id,
                        url = %url,
                        explanation = %verdict.explanation,
                        "Dispute media not evaluated"
                    );
                    if explanation.is_empty() {
                        explanation = format!("re-evaluation failed: {}", verdict.explanation);
                    }
                }
                Ok(verdict) if !verdict.is_block() => return (true, verdict.explanation),
                Ok(verdict) => explanation = verdict.explanation,
                Err(e) => {
                    warn!(dispute_id = %dispute.dispute_id, url = %url, error = %e, "Dispute re-evaluation failed");
                    if explanation.is_empty() {
                        explanation = format!("re-evaluation failed: {e}");
                    }
                }
            }
        }
        (false, explanation)
    }

    pub async fn cleanup_temp_files(&self) -> Result<usize> {
        let removed =
            cleanup_temp_files(&self.config.temp_dir, self.config.temp_max_age()).await?;
        if removed > 0 {
            info!(removed, "Removed stale temp files");
        }
        Ok(removed)
    }

    pub async fn purge_blocked(&self) -> Result<u64> {
        let purged = self
            .store
            .purge_blocked_older_than(self.config.block_retention())
            .await?;
        if purged > 0 {
            info!(purged, "Purged blocked events past retention");
        }
        Ok(purged)
    }

    pub async fn purge_resolutions(&self) -> Result<u64> {
        let purged = self
            .store
            .purge_resolutions_older_than(self.config.resolution_retention())
            .await?;
        if purged > 0 {
            info!(purged, "Purged old dispute resolutions");
        }
        Ok(purged)
    }

    /// The pipeline's periodic tasks.
    pub fn scheduler(self: &Arc<Self>) -> Scheduler {
        let config = &self.config;
        Scheduler::new("moderation")
            .register(self.task("moderation-poll", config.poll_interval(), |d| async move {
                d.poll_once().await.map(|_| ())
            }))
            .register(self.task("dispute-resolution", config.dispute_interval(), |d| async move {
                d.resolve_disputes_once().await.map(|_| ())
            }))
            .register(self.task(
                "temp-cleanup",
                std::time::Duration::from_secs(config.temp_cleanup_interval_secs),
                |d| async move { d.cleanup_temp_files().await.map(|_| ()) },
            ))
            .register(self.task(
                "block-purge",
                std::time::Duration::from_secs(config.block_purge_interval_secs),
                |d| async move { d.purge_blocked().await.map(|_| ()) },
            ))
            .register(self.task(
                "resolution-purge",
                std::time::Duration::from_secs(config.resolution_purge_interval_secs),
                |d| async move { d.purge_resolutions().await.map(|_| ()) },
            ))
    }

    fn task<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        period: std::time::Duration,
        body: F,
    ) -> PeriodicTask
    where
        F: Fn(Arc<Self>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let dispatcher = self.clone();
        PeriodicTask::new(name, period, move || body(dispatcher.clone()))
    }

    /// Run the pipeline until `shutdown`, then wait for in-flight items.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        self.scheduler().run(shutdown).await;
        self.wait_idle().await;
    }
}

/// Classify an item's media in order, blocking on the first BLOCK verdict.
pub async fn process_item(
    store: &dyn Store,
    classifier: &dyn MediaClassifier,
    item: &PendingModerationItem,
) -> Result<ItemOutcome> {
    for url in &item.media_urls {
        let verdict = match classifier.classify(url).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(event_id = %item.event_id, url = %url, error = %e, "Classifier error, failing open");
                continue;
            }
        };
        log_verdict(&item.event_id, url, &verdict);

        if verdict.is_block() {
            let author = match store.query_events(&EventFilter::by_id(&item.event_id)).await {
                Ok(events) => events.into_iter().next().map(|e| e.pubkey),
                Err(e) => {
                    warn!(event_id = %item.event_id, error = %e, "Author lookup failed");
                    None
                }
            };
            store
                .mark_blocked(BlockRecord {
                    event_id: item.event_id.clone(),
                    blocked_at: Utc::now(),
                    reason: verdict.explanation.clone(),
                    content_level: verdict.content_level,
                    offending_url: url.clone(),
                })
                .await?;
            store
                .create_notification(Notification {
                    recipient: author,
                    event_id: Some(item.event_id.clone()),
                    kind: NotificationKind::ContentBlocked,
                    message: format!("Your post was blocked: {}", verdict.explanation),
                    created_at: Utc::now(),
                })
                .await?;
            info!(
                event_id = %item.event_id,
                url = %url,
                content_level = verdict.content_level,
                "Blocked event"
            );
            return Ok(ItemOutcome::Blocked {
                offending_url: url.clone(),
            });
        }
    }

    debug!(event_id = %item.event_id, "Event passed moderation");
    Ok(ItemOutcome::Passed)
}

fn log_verdict(event_id: &str, url: &str, verdict: &ModerationVerdict) {
    match verdict.source {
        VerdictSource::Classifier => debug!(
            event_id,
            url,
            decision = %verdict.decision,
            content_level = verdict.content_level,
            confidence = verdict.confidence,
            "Classifier verdict"
        ),
        VerdictSource::FailOpen => warn!(
            event_id,
            url,
            explanation = %verdict.explanation,
            "Allowed without evaluation (fail-open)"
        ),
        VerdictSource::Disabled => debug!(event_id, url, "Moderation disabled, allowing"),
    }
}
