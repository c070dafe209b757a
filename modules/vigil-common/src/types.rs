use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// --- Relay events ---

/// Profile metadata event kind.
pub const KIND_METADATA: u32 = 0;

/// An event as stored by the relay. Only the fields the pipeline reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEvent {
    pub id: String,
    pub pubkey: String,
    pub kind: u32,
    pub created_at: i64,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
}

const MEDIA_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".webp", ".avif", ".bmp", ".mp4", ".webm", ".mov", ".m4v",
];

impl RelayEvent {
    /// Media URLs referenced by the event, in order of appearance, deduplicated.
    ///
    /// `imeta` and `url` tags come first, then media-looking URLs in the content.
    pub fn media_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        let mut push = |url: &str| {
            let url = url.trim();
            if (url.starts_with("http://") || url.starts_with("https://"))
                && !urls.iter().any(|u| u == url)
            {
                urls.push(url.to_string());
            }
        };

        for tag in &self.tags {
            match tag.first().map(String::as_str) {
                Some("imeta") => {
                    for entry in &tag[1..] {
                        if let Some(url) = entry.strip_prefix("url ") {
                            push(url);
                        }
                    }
                }
                Some("url") => {
                    if let Some(url) = tag.get(1) {
                        push(url);
                    }
                }
                _ => {}
            }
        }

        for word in self.content.split_whitespace() {
            if !(word.starts_with("http://") || word.starts_with("https://")) {
                continue;
            }
            let path = word.split(['?', '#']).next().unwrap_or(word).to_lowercase();
            if MEDIA_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
                push(word);
            }
        }

        urls
    }

    /// First value of the first tag with this name.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }
}

/// Query filter passed to the event store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub ids: Vec<String>,
    pub authors: Vec<String>,
    pub kinds: Vec<u32>,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            ids: vec![id.into()],
            limit: Some(1),
            ..Default::default()
        }
    }

    /// Latest profile metadata for one author.
    pub fn profile_of(pubkey: impl Into<String>) -> Self {
        Self {
            authors: vec![pubkey.into()],
            kinds: vec![KIND_METADATA],
            limit: Some(1),
            ..Default::default()
        }
    }

    /// Every profile metadata event.
    pub fn all_profiles() -> Self {
        Self {
            kinds: vec![KIND_METADATA],
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &RelayEvent) -> bool {
        (self.ids.is_empty() || self.ids.contains(&event.id))
            && (self.authors.is_empty() || self.authors.contains(&event.pubkey))
            && (self.kinds.is_empty() || self.kinds.contains(&event.kind))
    }
}

// --- Moderation ---

/// An event waiting for media screening.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingModerationItem {
    pub event_id: String,
    pub media_urls: Vec<String>,
    pub added_at: DateTime<Utc>,
}

/// A user's dispute of a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDisputeItem {
    pub dispute_id: String,
    pub ticket_id: String,
    pub event_id: String,
    pub user_pubkey: String,
    pub dispute_reason: String,
}

/// How long a blocked event is retained before it is permanently deleted.
pub fn block_retention() -> Duration {
    Duration::hours(48)
}

/// A suppressed event. Exists iff the event is hidden from queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub event_id: String,
    pub blocked_at: DateTime<Utc>,
    pub reason: String,
    pub content_level: u8,
    pub offending_url: String,
}

impl BlockRecord {
    pub fn is_purgeable_at(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        now - self.blocked_at >= retention
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisputeResolution {
    pub dispute_id: String,
    pub ticket_id: String,
    pub event_id: String,
    pub user_pubkey: String,
    pub approved: bool,
    pub explanation: String,
    pub resolved_at: DateTime<Utc>,
}

impl DisputeResolution {
    pub fn status(&self) -> &'static str {
        if self.approved {
            "approved"
        } else {
            "rejected"
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ContentBlocked,
    DisputeResolved,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationKind::ContentBlocked => write!(f, "content_blocked"),
            NotificationKind::DisputeResolved => write!(f, "dispute_resolved"),
        }
    }
}

/// A user-facing notice. `recipient` of `None` means "the event's author".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient: Option<String>,
    pub event_id: Option<String>,
    pub kind: NotificationKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

// --- Verification ---

/// An identity claim waiting to be checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingVerification {
    pub pubkey: String,
    pub external_handle: String,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub attempts: u32,
}

impl PendingVerification {
    pub fn new(pubkey: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            pubkey: pubkey.into(),
            external_handle: handle.into(),
            created_at: Utc::now(),
            last_attempt_at: None,
            attempts: 0,
        }
    }

    /// Eligible for pickup when never attempted or last attempted at or before `cutoff`.
    pub fn is_eligible(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_attempt_at.map_or(true, |t| t <= cutoff)
    }
}

/// Where a verified key was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationSource {
    #[serde(rename = "bio")]
    Bio,
    #[serde(rename = "tagged-post")]
    TaggedPost,
    #[serde(rename = "none")]
    None,
}

impl fmt::Display for VerificationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationSource::Bio => write!(f, "bio"),
            VerificationSource::TaggedPost => write!(f, "tagged-post"),
            VerificationSource::None => write!(f, "none"),
        }
    }
}

/// Result of one verification attempt. Not retained; serialized into
/// a [`VerificationOutcomeRecord`] right away.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationOutcome {
    pub is_verified: bool,
    pub external_follower_count: Option<u64>,
    pub verification_source: VerificationSource,
    pub error: Option<String>,
}

impl VerificationOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            is_verified: false,
            external_follower_count: None,
            verification_source: VerificationSource::None,
            error: Some(error.into()),
        }
    }
}

/// Durable outcome event published after every attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationOutcomeRecord {
    pub pubkey: String,
    pub external_handle: String,
    pub verified: bool,
    pub follower_count: Option<u64>,
    pub verified_at: DateTime<Utc>,
    pub verification_source: VerificationSource,
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VerificationOutcomeRecord {
    pub fn from_outcome(
        item: &PendingVerification,
        handle: &str,
        outcome: &VerificationOutcome,
        attempt_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            pubkey: item.pubkey.clone(),
            external_handle: handle.to_string(),
            verified: outcome.is_verified,
            follower_count: outcome.external_follower_count,
            verified_at: Utc::now(),
            verification_source: outcome.verification_source,
            attempt_count,
            next_retry_at: if outcome.is_verified { None } else { next_retry_at },
            error: outcome.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(content: &str, tags: Vec<Vec<&str>>) -> RelayEvent {
        RelayEvent {
            id: "e1".into(),
            pubkey: "p1".into(),
            kind: 1,
            created_at: 0,
            tags: tags
                .into_iter()
                .map(|t| t.into_iter().map(String::from).collect())
                .collect(),
            content: content.into(),
        }
    }

    #[test]
    fn media_urls_keep_tag_order_then_content() {
        let ev = event(
            "look https://cdn.example/b.png and https://example.com/page",
            vec![vec!["imeta", "url https://cdn.example/a.jpg", "m image/jpeg"]],
        );
        assert_eq!(
            ev.media_urls(),
            vec!["https://cdn.example/a.jpg", "https://cdn.example/b.png"]
        );
    }

    #[test]
    fn media_urls_deduplicate() {
        let ev = event(
            "https://cdn.example/a.jpg",
            vec![vec!["url", "https://cdn.example/a.jpg"]],
        );
        assert_eq!(ev.media_urls().len(), 1);
    }

    #[test]
    fn media_urls_accept_query_strings() {
        let ev = event("https://cdn.example/clip.MP4?sig=abc", vec![]);
        assert_eq!(ev.media_urls(), vec!["https://cdn.example/clip.MP4?sig=abc"]);
    }

    #[test]
    fn block_is_not_purgeable_before_retention() {
        let now = Utc::now();
        let record = BlockRecord {
            event_id: "e".into(),
            blocked_at: now - Duration::hours(48) + Duration::seconds(1),
            reason: "r".into(),
            content_level: 5,
            offending_url: "u".into(),
        };
        assert!(!record.is_purgeable_at(now, block_retention()));
    }

    #[test]
    fn block_is_purgeable_exactly_at_retention() {
        let now = Utc::now();
        let record = BlockRecord {
            event_id: "e".into(),
            blocked_at: now - Duration::hours(48),
            reason: "r".into(),
            content_level: 4,
            offending_url: "u".into(),
        };
        assert!(record.is_purgeable_at(now, block_retention()));
        assert!(record.is_purgeable_at(now + Duration::days(3), block_retention()));
    }

    #[test]
    fn outcome_record_serializes_source_names() {
        let item = PendingVerification::new("pk", "alice");
        let outcome = VerificationOutcome {
            is_verified: true,
            external_follower_count: Some(120),
            verification_source: VerificationSource::TaggedPost,
            error: None,
        };
        let record = VerificationOutcomeRecord::from_outcome(&item, "alice", &outcome, 1, None);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["verification_source"], "tagged-post");
        assert_eq!(json["follower_count"], 120);
        assert!(json.get("next_retry_at").is_none());
    }

    #[test]
    fn verified_outcome_drops_next_retry() {
        let item = PendingVerification::new("pk", "alice");
        let outcome = VerificationOutcome {
            is_verified: true,
            external_follower_count: None,
            verification_source: VerificationSource::Bio,
            error: None,
        };
        let record =
            VerificationOutcomeRecord::from_outcome(&item, "alice", &outcome, 1, Some(Utc::now()));
        assert_eq!(record.next_retry_at, None);
    }
}
