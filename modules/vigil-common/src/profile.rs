// Typed view of kind-0 profile content and claimed-handle resolution.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::types::RelayEvent;

/// Profile content. Every field is optional and unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub about: Option<String>,
    #[serde(default)]
    pub nip05: Option<String>,
    #[serde(default, alias = "x")]
    pub twitter: Option<String>,
}

impl ProfileMetadata {
    /// Parse profile content. Unparseable content yields `None`.
    pub fn parse(content: &str) -> Option<Self> {
        serde_json::from_str(content).ok()
    }
}

/// Why a claimed handle could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleClaim {
    /// A well-formed handle.
    Valid(String),
    /// The profile carries no handle at all.
    Missing,
    /// A handle is present but not a valid platform handle.
    Malformed(String),
}

fn handle_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]{1,15}$").expect("valid regex"))
}

/// Trim whitespace and a leading `@`, then validate the platform's handle rules.
pub fn normalize_handle(raw: &str) -> HandleClaim {
    let trimmed = raw.trim().trim_start_matches('@');
    if trimmed.is_empty() {
        return HandleClaim::Missing;
    }
    if handle_pattern().is_match(trimmed) {
        HandleClaim::Valid(trimmed.to_string())
    } else {
        HandleClaim::Malformed(trimmed.to_string())
    }
}

/// Resolve the handle a profile event claims.
///
/// An `["i", "twitter:<handle>", ...]` identity tag (or `x:`) wins over the
/// `twitter` / `x` content field.
pub fn claimed_handle(event: &RelayEvent) -> HandleClaim {
    for tag in &event.tags {
        if tag.first().map(String::as_str) != Some("i") {
            continue;
        }
        if let Some(value) = tag.get(1) {
            if let Some(handle) = value
                .strip_prefix("twitter:")
                .or_else(|| value.strip_prefix("x:"))
            {
                return normalize_handle(handle);
            }
        }
    }

    match ProfileMetadata::parse(&event.content).and_then(|m| m.twitter) {
        Some(handle) => normalize_handle(&handle),
        None => HandleClaim::Missing,
    }
}
