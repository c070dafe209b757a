// Test doubles for the moderation pipeline.
//
// `MockClassifier` answers per URL from canned verdicts and records every
// call. Unknown URLs get a plain ALLOW.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use classifier_client::{ClassifierError, Decision, ModerationVerdict, Result, VerdictSource};

use crate::classifier::MediaClassifier;

pub fn allow(explanation: &str) -> ModerationVerdict {
    verdict(0, Decision::Allow, explanation)
}

pub fn block(content_level: u8, explanation: &str) -> ModerationVerdict {
    verdict(content_level, Decision::Block, explanation)
}

pub fn verdict(content_level: u8, decision: Decision, explanation: &str) -> ModerationVerdict {
    ModerationVerdict {
        content_level,
        decision,
        confidence: 0.9,
        explanation: explanation.to_string(),
        processing_time: 0.1,
        is_video: false,
        source: VerdictSource::Classifier,
    }
}

#[derive(Clone)]
enum Reply {
    Verdict(ModerationVerdict),
    Error,
    Panic,
}

#[derive(Default)]
pub struct MockClassifier {
    replies: HashMap<String, Reply>,
    dispute_replies: HashMap<String, Reply>,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
    dispute_calls: Mutex<Vec<(String, String)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_url(mut self, url: &str, verdict: ModerationVerdict) -> Self {
        self.replies.insert(url.to_string(), Reply::Verdict(verdict));
        self
    }

    pub fn failing(mut self, url: &str) -> Self {
        self.replies.insert(url.to_string(), Reply::Error);
        self
    }

    pub fn panicking(mut self, url: &str) -> Self {
        self.replies.insert(url.to_string(), Reply::Panic);
        self
    }

    pub fn on_dispute(mut self, url: &str, verdict: ModerationVerdict) -> Self {
        self.dispute_replies
            .insert(url.to_string(), Reply::Verdict(verdict));
        self
    }

    pub fn failing_dispute(mut self, url: &str) -> Self {
        self.dispute_replies.insert(url.to_string(), Reply::Error);
        self
    }

    /// Each call sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn dispute_calls(&self) -> Vec<(String, String)> {
        self.dispute_calls.lock().unwrap().clone()
    }

    /// Highest number of calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn answer(&self, reply: Option<Reply>) -> Result<ModerationVerdict> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match reply {
            Some(Reply::Verdict(v)) => Ok(v),
            Some(Reply::Error) => Err(ClassifierError::Api {
                status: 503,
                message: "unavailable".to_string(),
            }),
            Some(Reply::Panic) => panic!("classifier exploded"),
            None => Ok(allow("nothing detected")),
        }
    }
}

#[async_trait]
impl MediaClassifier for MockClassifier {
    async fn classify(&self, url: &str) -> Result<ModerationVerdict> {
        self.calls.lock().unwrap().push(url.to_string());
        let reply = self.replies.get(url).cloned();
        self.answer(reply).await
    }

    async fn classify_dispute(&self, url: &str, reason: &str) -> Result<ModerationVerdict> {
        self.dispute_calls
            .lock()
            .unwrap()
            .push((url.to_string(), reason.to_string()));
        let reply = self.dispute_replies.get(url).cloned();
        self.answer(reply).await
    }
}
