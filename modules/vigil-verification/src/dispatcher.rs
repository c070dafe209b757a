//! Verification dispatcher.
//!
//! Each poll dequeues entries whose cooldown has passed and spawns one task
//! per entry under a worker semaphore. A task resolves the handle the subject
//! currently claims, loads the profile through a pooled browser session on
//! the best mirror, and looks for the subject's key first in the bio, then in
//! tagged posts. Every attempt publishes an outcome record. Failed attempts
//! are requeued until `max_attempts`, then abandoned.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use vigil_common::config::VerificationConfig;
use vigil_common::scheduler::panic_message;
use vigil_common::{
    catch_panic, claimed_handle, normalize_handle, EventFilter, HandleClaim, PendingVerification,
    PeriodicTask, RelayEvent, Scheduler, Store, VerificationOutcome, VerificationOutcomeRecord,
    VerificationSource,
};

use crate::error::VerificationError;
use crate::extraction::ExtractionPipeline;
use crate::keys::npub_matches_pubkey;
use crate::pool::SessionPool;
use crate::selector::EndpointSelector;
use crate::session::BrowserSession;

pub const NO_MATCH_ERROR: &str = "no matching key found";

/// What happened to one queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    Verified(VerificationSource),
    Requeued { attempts: u32 },
    Abandoned,
    /// Dropped without an attempt or after a non-retryable error.
    Discarded,
}

pub struct VerificationDispatcher {
    store: Arc<dyn Store>,
    pool: Arc<SessionPool>,
    selector: Arc<EndpointSelector>,
    pipeline: Arc<ExtractionPipeline>,
    config: VerificationConfig,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl VerificationDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        pool: Arc<SessionPool>,
        selector: Arc<EndpointSelector>,
        pipeline: Arc<ExtractionPipeline>,
        config: VerificationConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.worker_concurrency.max(1)));
        Self {
            store,
            pool,
            selector,
            pipeline,
            config,
            permits,
            tracker: TaskTracker::new(),
        }
    }

    /// One poll cycle. Returns the number of entries handed to workers.
    pub async fn poll_once(self: &Arc<Self>) -> Result<usize> {
        let eligible_before = Utc::now() - self.config.cooldown();
        let batch = self
            .store
            .dequeue_verification_batch(self.config.batch_size, eligible_before)
            .await?;
        if batch.is_empty() {
            return Ok(0);
        }
        debug!(count = batch.len(), "Dequeued verification batch");

        let mut spawned = 0;
        for item in batch {
            if item.external_handle.trim().is_empty() {
                debug!(pubkey = %item.pubkey, "Dropping entry with empty handle");
                continue;
            }

            let permit = self.permits.clone().acquire_owned().await?;
            let dispatcher = self.clone();
            self.tracker.spawn(async move {
                let _permit = permit;
                if let Err(e) = catch_panic(dispatcher.process(&item)).await {
                    error!(pubkey = %item.pubkey, error = %e, "Verification task failed");
                    dispatcher.requeue_after_failure(&item).await;
                }
            });
            spawned += 1;
        }

        Ok(spawned)
    }

    /// Wait until every spawned verification task has finished.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Run one verification attempt for a dequeued entry.
    pub async fn process(&self, item: &PendingVerification) -> Result<AttemptResult> {
        let Some(handle) = self.resolve_handle(item).await? else {
            return Ok(AttemptResult::Discarded);
        };

        let result = self.verify(&item.pubkey, &handle).await;
        self.finish(item, &handle, result).await
    }

    /// The handle to check: the one the latest profile claims, or the queued
    /// one when no profile is stored.
    async fn resolve_handle(&self, item: &PendingVerification) -> Result<Option<String>> {
        let profile = self
            .store
            .query_events(&EventFilter::profile_of(&item.pubkey))
            .await?
            .into_iter()
            .next();

        let claim = match &profile {
            Some(event) => claimed_handle(event),
            None => normalize_handle(&item.external_handle),
        };

        match claim {
            HandleClaim::Valid(handle) => {
                if handle != item.external_handle {
                    debug!(
                        pubkey = %item.pubkey,
                        queued = %item.external_handle,
                        claimed = %handle,
                        "Profile claims a different handle"
                    );
                }
                Ok(Some(handle))
            }
            HandleClaim::Missing => {
                info!(pubkey = %item.pubkey, "Handle claim withdrawn, discarding");
                Ok(None)
            }
            HandleClaim::Malformed(raw) => {
                warn!(pubkey = %item.pubkey, handle = %raw, "Malformed handle, discarding");
                Ok(None)
            }
        }
    }

    async fn verify(
        &self,
        pubkey: &str,
        handle: &str,
    ) -> crate::error::Result<VerificationOutcome> {
        let mut session = self.pool.acquire().await?;
        let result = AssertUnwindSafe(self.verify_with(&mut *session, pubkey, handle))
            .catch_unwind()
            .await;
        match result {
            Ok(result) => {
                self.pool.release(session).await;
                result
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(pubkey, handle, panic = %message, "Verification panicked, discarding session");
                self.pool.discard(session).await;
                Err(VerificationError::SessionUnavailable(format!(
                    "session panicked: {message}"
                )))
            }
        }
    }

    async fn verify_with(
        &self,
        session: &mut dyn BrowserSession,
        pubkey: &str,
        handle: &str,
    ) -> crate::error::Result<VerificationOutcome> {
        let endpoint = self.selector.select().await?;
        self.visit(session, &endpoint, &format!("{endpoint}/{handle}"))
            .await?;
        let profile = self.pipeline.extract(session).await?;
        debug!(
            handle,
            strategy = ?profile.strategy,
            has_key = profile.identity_key.is_some(),
            follower_count = ?profile.follower_count,
            "Profile extracted"
        );

        // A key in the bio settles it; tagged posts are only searched without one.
        if let Some(key) = &profile.identity_key {
            if npub_matches_pubkey(key, pubkey)? {
                return Ok(verified(VerificationSource::Bio, profile.follower_count));
            }
            debug!(handle, "Bio key belongs to someone else");
            return Ok(no_match(profile.follower_count));
        }

        let endpoint = self.selector.select().await?;
        let search = search_url(&endpoint, handle, &self.config.tag)?;
        self.visit(session, &endpoint, &search).await?;
        if let Some(key) = self.pipeline.find_tagged_key(session, &self.config.tag).await? {
            if npub_matches_pubkey(&key, pubkey)? {
                return Ok(verified(
                    VerificationSource::TaggedPost,
                    profile.follower_count,
                ));
            }
            debug!(handle, "Tagged key belongs to someone else");
        }

        Ok(no_match(profile.follower_count))
    }

    /// Navigate and wait for the page, recording the mirror's health.
    async fn visit(
        &self,
        session: &mut dyn BrowserSession,
        endpoint: &str,
        url: &str,
    ) -> crate::error::Result<()> {
        let started = Instant::now();
        let result = match session.navigate(url).await {
            Ok(()) => session.wait_loaded().await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => self.selector.record_success(endpoint, started.elapsed()),
            Err(e) => {
                warn!(endpoint, url, error = %e, "Mirror request failed");
                self.selector.record_failure(endpoint, started.elapsed());
            }
        }
        result
    }

    async fn finish(
        &self,
        item: &PendingVerification,
        handle: &str,
        result: crate::error::Result<VerificationOutcome>,
    ) -> Result<AttemptResult> {
        let (outcome, retryable) = match result {
            Ok(outcome) => (outcome, true),
            Err(e) => (VerificationOutcome::failed(e.to_string()), e.is_retryable()),
        };

        let attempt_count = item.attempts + 1;
        let retry = !outcome.is_verified && retryable && item.attempts < self.config.max_attempts;
        let next_retry_at = retry.then(|| Utc::now() + self.config.cooldown());

        self.store
            .publish_verification_outcome(VerificationOutcomeRecord::from_outcome(
                item,
                handle,
                &outcome,
                attempt_count,
                next_retry_at,
            ))
            .await?;

        if outcome.is_verified {
            info!(
                pubkey = %item.pubkey,
                handle,
                source = %outcome.verification_source,
                follower_count = ?outcome.external_follower_count,
                "Identity verified"
            );
            return Ok(AttemptResult::Verified(outcome.verification_source));
        }

        let reason = outcome.error.as_deref().unwrap_or(NO_MATCH_ERROR);
        if retry {
            self.store
                .requeue_verification(&item.pubkey, handle, attempt_count)
                .await?;
            info!(
                pubkey = %item.pubkey,
                handle,
                attempts = attempt_count,
                reason,
                "Verification failed, requeued"
            );
            Ok(AttemptResult::Requeued {
                attempts: attempt_count,
            })
        } else if !retryable {
            warn!(pubkey = %item.pubkey, handle, reason, "Verification failed permanently, discarding");
            Ok(AttemptResult::Discarded)
        } else {
            error!(
                pubkey = %item.pubkey,
                handle,
                attempts = item.attempts,
                reason,
                "Verification abandoned after max attempts"
            );
            Ok(AttemptResult::Abandoned)
        }
    }

    /// Put an entry back after its task failed before recording an outcome.
    async fn requeue_after_failure(&self, item: &PendingVerification) {
        if item.attempts >= self.config.max_attempts {
            error!(pubkey = %item.pubkey, "Verification abandoned after max attempts");
            return;
        }
        if let Err(e) = self
            .store
            .requeue_verification(&item.pubkey, &item.external_handle, item.attempts + 1)
            .await
        {
            error!(pubkey = %item.pubkey, error = %e, "Failed to requeue verification");
        }
    }

    /// Queue every profile that claims a valid handle. Returns the number queued.
    pub async fn sweep_once(&self) -> Result<usize> {
        let profiles = self
            .store
            .query_events(&EventFilter::all_profiles())
            .await?;

        let mut latest: HashMap<&str, &RelayEvent> = HashMap::new();
        for event in &profiles {
            latest
                .entry(event.pubkey.as_str())
                .and_modify(|current| {
                    if event.created_at > current.created_at {
                        *current = event;
                    }
                })
                .or_insert(event);
        }

        let mut queued = 0;
        for (pubkey, event) in latest {
            match claimed_handle(event) {
                HandleClaim::Valid(handle) => {
                    self.store.enqueue_verification(pubkey, &handle).await?;
                    queued += 1;
                }
                HandleClaim::Missing => {}
                HandleClaim::Malformed(raw) => {
                    debug!(pubkey, handle = %raw, "Skipping malformed handle in sweep")
                }
            }
        }

        info!(profiles = profiles.len(), queued, "Verification sweep finished");
        Ok(queued)
    }

    /// The pipeline's periodic tasks.
    pub fn scheduler(self: &Arc<Self>) -> Scheduler {
        let poll = self.clone();
        let sweep = self.clone();
        Scheduler::new("verification")
            .register(PeriodicTask::new(
                "verification-poll",
                self.config.poll_interval(),
                move || {
                    let d = poll.clone();
                    async move { d.poll_once().await.map(|_| ()) }
                },
            ))
            .register(
                PeriodicTask::new(
                    "verification-sweep",
                    self.config.sweep_interval(),
                    move || {
                        let d = sweep.clone();
                        async move { d.sweep_once().await.map(|_| ()) }
                    },
                )
                .run_at_startup(),
            )
    }

    /// Run the pipeline until `shutdown`, then drain tasks and close sessions.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        self.scheduler().run(shutdown).await;
        self.wait_idle().await;
        self.pool.shutdown().await;
    }
}

fn verified(source: VerificationSource, follower_count: Option<u64>) -> VerificationOutcome {
    VerificationOutcome {
        is_verified: true,
        external_follower_count: follower_count,
        verification_source: source,
        error: None,
    }
}

fn no_match(follower_count: Option<u64>) -> VerificationOutcome {
    VerificationOutcome {
        external_follower_count: follower_count,
        ..VerificationOutcome::failed(NO_MATCH_ERROR)
    }
}

/// `{endpoint}/search?f=tweets&q=from:<handle> #<tag>`, query-encoded.
pub fn search_url(endpoint: &str, handle: &str, tag: &str) -> crate::error::Result<String> {
    let query = format!("from:{handle} #{tag}");
    url::Url::parse_with_params(
        &format!("{endpoint}/search"),
        &[("f", "tweets"), ("q", query.as_str())],
    )
    .map(String::from)
    .map_err(|e| VerificationError::Navigation(format!("invalid mirror URL {endpoint}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_url_encodes_query() {
        let url = search_url("https://mirror.example", "alice", "nostr").unwrap();
        assert!(url.starts_with("https://mirror.example/search?f=tweets&q=from%3Aalice"));
        assert!(url.contains("%23nostr"));
    }

    #[test]
    fn search_url_rejects_garbage_endpoint() {
        assert!(search_url("not a url", "alice", "nostr").is_err());
    }
}
