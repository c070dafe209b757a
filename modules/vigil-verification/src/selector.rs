//! Health-scored mirror selection.
//!
//! Each mirror front-end carries success/failure counters and a ring of
//! recent latencies. Selection picks the best-scoring enabled endpoint:
//!
//! ```text
//! score = (success_rate + recency_bonus) * 10 / (priority + 1)
//! ```
//!
//! where `recency_bonus` decays linearly from 1 to 0 over the hour after the
//! last success. Three consecutive failures with no success in the last hour
//! disable an endpoint; any success re-enables it. When every endpoint is
//! disabled, the highest-priority one is forced back on.
//!
//! Requests are rate limited with a fixed per-minute window shared by all
//! endpoints. The wait is computed under the lock and slept outside it.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use vigil_common::config::MirrorsConfig;

use crate::error::{Result, VerificationError};

const LATENCY_RING: usize = 10;
const DISABLE_AFTER_FAILURES: u32 = 3;
const RECENT: Duration = Duration::from_secs(3600);
const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct EndpointHealth {
    pub url: String,
    /// Lower is preferred.
    pub priority: u32,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub last_success: Option<Instant>,
    pub last_failure: Option<Instant>,
    pub recent_latencies: VecDeque<Duration>,
    pub disabled: bool,
}

impl EndpointHealth {
    pub fn new(url: impl Into<String>, priority: u32) -> Self {
        Self {
            url: url.into(),
            priority,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
            recent_latencies: VecDeque::with_capacity(LATENCY_RING),
            disabled: false,
        }
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    fn recency_bonus(&self, now: Instant) -> f64 {
        match self.last_success {
            Some(at) => {
                let age = now.saturating_duration_since(at);
                if age < RECENT {
                    1.0 - age.as_secs_f64() / RECENT.as_secs_f64()
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }

    pub fn score(&self, now: Instant) -> f64 {
        (self.success_rate() + self.recency_bonus(now)) * 10.0 / (self.priority as f64 + 1.0)
    }

    pub fn average_latency(&self) -> Option<Duration> {
        if self.recent_latencies.is_empty() {
            return None;
        }
        let total: Duration = self.recent_latencies.iter().sum();
        Some(total / self.recent_latencies.len() as u32)
    }

    fn had_recent_success(&self, now: Instant) -> bool {
        self.last_success
            .is_some_and(|at| now.saturating_duration_since(at) < RECENT)
    }

    fn push_latency(&mut self, latency: Duration) {
        if self.recent_latencies.len() == LATENCY_RING {
            self.recent_latencies.pop_front();
        }
        self.recent_latencies.push_back(latency);
    }
}

struct State {
    endpoints: Vec<EndpointHealth>,
    window_start: Instant,
    window_count: u32,
}

pub struct EndpointSelector {
    state: Mutex<State>,
    requests_per_minute: u32,
}

impl EndpointSelector {
    /// `requests_per_minute` of 0 disables rate limiting.
    pub fn new(endpoints: Vec<EndpointHealth>, requests_per_minute: u32) -> Self {
        Self {
            state: Mutex::new(State {
                endpoints,
                window_start: Instant::now(),
                window_count: 0,
            }),
            requests_per_minute,
        }
    }

    pub fn from_config(config: &MirrorsConfig) -> Self {
        let endpoints = config
            .endpoints
            .iter()
            .map(|e| EndpointHealth::new(e.url.trim_end_matches('/'), e.priority))
            .collect();
        Self::new(endpoints, config.requests_per_minute)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait for a rate-limit slot, then return the best endpoint.
    pub async fn select(&self) -> Result<String> {
        if self.lock().endpoints.is_empty() {
            return Err(VerificationError::NoEndpoints);
        }
        self.wait_for_slot().await;
        self.pick().ok_or(VerificationError::NoEndpoints)
    }

    async fn wait_for_slot(&self) {
        if self.requests_per_minute == 0 {
            return;
        }
        loop {
            let wait = {
                let mut state = self.lock();
                let now = Instant::now();
                if now.saturating_duration_since(state.window_start) >= WINDOW {
                    state.window_start = now;
                    state.window_count = 0;
                }
                if state.window_count < self.requests_per_minute {
                    state.window_count += 1;
                    None
                } else {
                    Some((state.window_start + WINDOW).saturating_duration_since(now))
                }
            };

            match wait {
                None => return,
                Some(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "Mirror rate limit reached, waiting");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    fn pick(&self) -> Option<String> {
        let mut state = self.lock();
        let now = Instant::now();

        let best = state
            .endpoints
            .iter()
            .filter(|e| !e.disabled)
            .max_by(|a, b| {
                a.score(now)
                    .partial_cmp(&b.score(now))
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| b.priority.cmp(&a.priority))
            })
            .map(|e| e.url.clone());
        if best.is_some() {
            return best;
        }

        let fallback = state.endpoints.iter_mut().min_by_key(|e| e.priority)?;
        fallback.disabled = false;
        fallback.consecutive_failures = 0;
        warn!(url = %fallback.url, "All mirrors disabled, force re-enabling");
        Some(fallback.url.clone())
    }

    pub fn record_success(&self, url: &str, latency: Duration) {
        let mut state = self.lock();
        let Some(endpoint) = state.endpoints.iter_mut().find(|e| e.url == url) else {
            return;
        };
        endpoint.success_count += 1;
        endpoint.consecutive_failures = 0;
        endpoint.last_success = Some(Instant::now());
        endpoint.push_latency(latency);
        if endpoint.disabled {
            endpoint.disabled = false;
            info!(url, "Mirror re-enabled after success");
        }
    }

    pub fn record_failure(&self, url: &str, latency: Duration) {
        let mut state = self.lock();
        let now = Instant::now();
        let Some(endpoint) = state.endpoints.iter_mut().find(|e| e.url == url) else {
            return;
        };
        endpoint.failure_count += 1;
        endpoint.consecutive_failures += 1;
        endpoint.last_failure = Some(now);
        endpoint.push_latency(latency);
        if !endpoint.disabled
            && endpoint.consecutive_failures >= DISABLE_AFTER_FAILURES
            && !endpoint.had_recent_success(now)
        {
            endpoint.disabled = true;
            warn!(
                url,
                consecutive_failures = endpoint.consecutive_failures,
                "Mirror disabled"
            );
        }
    }

    pub fn snapshot(&self) -> Vec<EndpointHealth> {
        self.lock().endpoints.clone()
    }
}
