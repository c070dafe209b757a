//! Profile field extraction.
//!
//! Three strategies, tried in order until one yields either field:
//! structured `ProfilePage` markup, configured DOM selectors, then a vision
//! model over a screenshot with a per-field vote across passes. Each vision
//! pass runs under its own timeout.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use vigil_common::config::BrowserConfig;

use crate::consensus::consensus;
use crate::error::{Result, VerificationError};
use crate::keys::{find_npub, find_tagged_npub};
use crate::session::BrowserSession;
use crate::vision::{VisionModel, VisionReading};

const JSON_LD_SELECTOR: &str = r#"script[type="application/ld+json"]"#;
const DEFAULT_VISION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStrategy {
    StructuredData,
    Dom,
    Vision,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedProfile {
    pub identity_key: Option<String>,
    pub follower_count: Option<u64>,
    pub strategy: ExtractionStrategy,
}

impl ExtractedProfile {
    fn empty() -> Self {
        Self {
            identity_key: None,
            follower_count: None,
            strategy: ExtractionStrategy::None,
        }
    }

    fn found_anything(&self) -> bool {
        self.identity_key.is_some() || self.follower_count.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct DomSelectors {
    pub bio: String,
    pub followers: String,
    pub timeline: String,
}

impl From<&BrowserConfig> for DomSelectors {
    fn from(config: &BrowserConfig) -> Self {
        Self {
            bio: config.bio_selector.clone(),
            followers: config.followers_selector.clone(),
            timeline: config.timeline_selector.clone(),
        }
    }
}

// --- Structured markup ---

#[derive(Debug, Deserialize)]
struct ProfilePage {
    #[serde(rename = "@type", default)]
    kind: Option<String>,
    #[serde(rename = "mainEntity", default)]
    main_entity: Option<PersonEntity>,
}

#[derive(Debug, Deserialize)]
struct PersonEntity {
    #[serde(default)]
    description: Option<String>,
    #[serde(rename = "interactionStatistic", default)]
    interaction_statistic: Vec<InteractionCounter>,
}

#[derive(Debug, Deserialize)]
struct InteractionCounter {
    #[serde(rename = "interactionType", default)]
    interaction_type: Option<serde_json::Value>,
    #[serde(rename = "userInteractionCount", default)]
    user_interaction_count: Option<serde_json::Value>,
}

impl InteractionCounter {
    fn is_follow(&self) -> bool {
        let kind = match &self.interaction_type {
            Some(serde_json::Value::String(s)) => s.as_str(),
            Some(serde_json::Value::Object(o)) => {
                o.get("@type").and_then(|t| t.as_str()).unwrap_or_default()
            }
            _ => return false,
        };
        kind.ends_with("FollowAction")
    }

    fn count(&self) -> Option<u64> {
        match self.user_interaction_count.as_ref()? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => parse_count(s),
            _ => None,
        }
    }
}

fn from_structured_data(blocks: &[String]) -> ExtractedProfile {
    let mut result = ExtractedProfile::empty();
    for block in blocks {
        let Ok(page) = serde_json::from_str::<ProfilePage>(block) else {
            continue;
        };
        if page.kind.as_deref() != Some("ProfilePage") {
            continue;
        }
        let Some(person) = page.main_entity else {
            continue;
        };

        result.identity_key = person.description.as_deref().and_then(find_npub);
        result.follower_count = person
            .interaction_statistic
            .iter()
            .filter(|s| s.is_follow())
            .find_map(InteractionCounter::count);
        result.strategy = ExtractionStrategy::StructuredData;
        break;
    }
    result
}

/// Parse a displayed count: "1,234", "12.5K", "3M", "987".
pub fn parse_count(raw: &str) -> Option<u64> {
    let cleaned: String = raw
        .trim()
        .split_whitespace()
        .next()?
        .chars()
        .filter(|c| *c != ',')
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let (number, multiplier) = match cleaned.chars().last()?.to_ascii_uppercase() {
        'K' => (&cleaned[..cleaned.len() - 1], 1_000.0),
        'M' => (&cleaned[..cleaned.len() - 1], 1_000_000.0),
        'B' => (&cleaned[..cleaned.len() - 1], 1_000_000_000.0),
        _ => (cleaned.as_str(), 1.0),
    };

    if multiplier == 1.0 {
        return number.parse().ok();
    }
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * multiplier).round() as u64)
}

// --- Pipeline ---

pub struct ExtractionPipeline {
    selectors: DomSelectors,
    vision: Option<Arc<dyn VisionModel>>,
    passes: usize,
    vision_timeout: Duration,
}

impl ExtractionPipeline {
    pub fn new(
        selectors: DomSelectors,
        vision: Option<Arc<dyn VisionModel>>,
        passes: usize,
    ) -> Self {
        Self {
            selectors,
            vision,
            passes: passes.max(1),
            vision_timeout: DEFAULT_VISION_TIMEOUT,
        }
    }

    pub fn with_vision_timeout(mut self, timeout: Duration) -> Self {
        self.vision_timeout = timeout;
        self
    }

    /// Extract profile fields from the page the session is on.
    pub async fn extract(&self, session: &mut dyn BrowserSession) -> Result<ExtractedProfile> {
        session.wait_loaded().await?;

        let blocks = session.query_selector_all(JSON_LD_SELECTOR).await?;
        let structured = from_structured_data(&blocks);
        if structured.found_anything() {
            debug!(strategy = "structured", "Profile fields extracted");
            return Ok(structured);
        }

        let dom = self.from_dom(session).await?;
        if dom.found_anything() {
            debug!(strategy = "dom", "Profile fields extracted");
            return Ok(dom);
        }

        match &self.vision {
            Some(vision) => self.from_vision(session, vision.as_ref()).await,
            None => Ok(ExtractedProfile::empty()),
        }
    }

    /// Scan the current page's timeline for `#<tag>:npub1...`.
    pub async fn find_tagged_key(
        &self,
        session: &mut dyn BrowserSession,
        tag: &str,
    ) -> Result<Option<String>> {
        session.wait_loaded().await?;
        let posts = session.query_selector_all(&self.selectors.timeline).await?;
        Ok(posts.iter().find_map(|text| find_tagged_npub(text, tag)))
    }

    async fn from_dom(&self, session: &dyn BrowserSession) -> Result<ExtractedProfile> {
        let bio = session.query_selector(&self.selectors.bio).await?;
        let followers = session.query_selector(&self.selectors.followers).await?;

        let profile = ExtractedProfile {
            identity_key: bio.as_deref().and_then(find_npub),
            follower_count: followers.as_deref().and_then(parse_count),
            strategy: ExtractionStrategy::Dom,
        };
        Ok(if profile.found_anything() {
            profile
        } else {
            ExtractedProfile::empty()
        })
    }

    async fn from_vision(
        &self,
        session: &dyn BrowserSession,
        vision: &dyn VisionModel,
    ) -> Result<ExtractedProfile> {
        let png = session.screenshot().await?;

        let mut readings = Vec::with_capacity(self.passes);
        let mut failures = 0;
        let mut last_error = None;
        for pass in 0..self.passes {
            let result = tokio::time::timeout(self.vision_timeout, vision.read_profile(&png))
                .await
                .unwrap_or_else(|elapsed| Err(elapsed.into()));
            match result {
                Ok(reading) => readings.push(reading),
                Err(e) => {
                    warn!(pass = pass + 1, error = %e, "Vision pass failed");
                    readings.push(VisionReading::default());
                    failures += 1;
                    last_error = Some(e);
                }
            }
        }

        if failures == self.passes {
            return Err(match last_error {
                Some(VerificationError::Vision(msg)) => {
                    VerificationError::Vision(format!("all passes failed: {msg}"))
                }
                Some(other) => other,
                None => VerificationError::Vision("all passes failed".to_string()),
            });
        }

        let keys: Vec<Option<String>> = readings
            .iter()
            .map(|r| r.identity_key.as_deref().and_then(find_npub))
            .collect();
        let counts: Vec<Option<u64>> = readings
            .iter()
            .map(|r| r.follower_count.as_deref().and_then(parse_count))
            .collect();

        let profile = ExtractedProfile {
            identity_key: consensus(&keys),
            follower_count: consensus(&counts),
            strategy: ExtractionStrategy::Vision,
        };
        debug!(
            passes = self.passes,
            has_key = profile.identity_key.is_some(),
            follower_count = ?profile.follower_count,
            "Vision extraction finished"
        );
        Ok(if profile.found_anything() {
            profile
        } else {
            ExtractedProfile::empty()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockPage, MockSession, ScriptedVision};

    const KEY: &str = "npub1qqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqq";

    fn selectors() -> DomSelectors {
        DomSelectors::from(&BrowserConfig::default())
    }

    fn pipeline(vision: Option<Arc<dyn VisionModel>>) -> ExtractionPipeline {
        ExtractionPipeline::new(selectors(), vision, 3)
    }

    async fn session_on(page: MockPage) -> MockSession {
        let mut session = MockSession::with_page("https://mirror.example/alice", page);
        session.navigate("https://mirror.example/alice").await.unwrap();
        session
    }

    #[test]
    fn counts_parse_with_separators_and_suffixes() {
        assert_eq!(parse_count("1,234"), Some(1234));
        assert_eq!(parse_count("12.5K"), Some(12_500));
        assert_eq!(parse_count("3M"), Some(3_000_000));
        assert_eq!(parse_count(" 987 Followers"), Some(987));
        assert_eq!(parse_count("many"), None);
        assert_eq!(parse_count(""), None);
    }

    #[tokio::test]
    async fn structured_data_wins_first() {
        let json = format!(
            r#"{{"@context":"https://schema.org","@type":"ProfilePage",
                "mainEntity":{{"@type":"Person","description":"hi {KEY}",
                "interactionStatistic":[
                    {{"interactionType":"https://schema.org/FollowAction","userInteractionCount":"4,321"}},
                    {{"interactionType":"https://schema.org/WriteAction","userInteractionCount":99}}
                ]}}}}"#
        );
        let page = MockPage::new()
            .with_json_ld(&json)
            .with_element(".profile-bio", "something else entirely");
        let mut session = session_on(page).await;

        let profile = pipeline(None).extract(&mut session).await.unwrap();
        assert_eq!(profile.strategy, ExtractionStrategy::StructuredData);
        assert_eq!(profile.identity_key.as_deref(), Some(KEY));
        assert_eq!(profile.follower_count, Some(4321));
    }

    #[tokio::test]
    async fn dom_used_when_markup_missing() {
        let page = MockPage::new()
            .with_element(".profile-bio", &format!("my key: {KEY}"))
            .with_element(".profile-statlist .followers .profile-stat-num", "12.5K");
        let mut session = session_on(page).await;

        let profile = pipeline(None).extract(&mut session).await.unwrap();
        assert_eq!(profile.strategy, ExtractionStrategy::Dom);
        assert_eq!(profile.identity_key.as_deref(), Some(KEY));
        assert_eq!(profile.follower_count, Some(12_500));
    }

    #[tokio::test]
    async fn vision_votes_per_field() {
        let vision = ScriptedVision::new(vec![
            Ok(VisionReading {
                identity_key: None,
                follower_count: Some("120".into()),
            }),
            Ok(VisionReading {
                identity_key: None,
                follower_count: Some("125".into()),
            }),
            Ok(VisionReading {
                identity_key: None,
                follower_count: Some("120".into()),
            }),
        ]);
        let mut session = session_on(MockPage::new()).await;

        let profile = pipeline(Some(Arc::new(vision)))
            .extract(&mut session)
            .await
            .unwrap();
        assert_eq!(profile.strategy, ExtractionStrategy::Vision);
        assert_eq!(profile.follower_count, Some(120));
        assert_eq!(profile.identity_key, None);
    }

    #[tokio::test]
    async fn failed_vision_pass_is_an_empty_vote() {
        let vision = ScriptedVision::new(vec![
            Err(VerificationError::Vision("overloaded".into())),
            Ok(VisionReading {
                identity_key: Some(KEY.into()),
                follower_count: None,
            }),
            Ok(VisionReading::default()),
        ]);
        let mut session = session_on(MockPage::new()).await;

        let profile = pipeline(Some(Arc::new(vision)))
            .extract(&mut session)
            .await
            .unwrap();
        assert_eq!(profile.identity_key.as_deref(), Some(KEY));
    }

    #[tokio::test]
    async fn all_vision_passes_failing_is_an_error() {
        let vision = ScriptedVision::new(vec![
            Err(VerificationError::Vision("a".into())),
            Err(VerificationError::Vision("b".into())),
            Err(VerificationError::Vision("c".into())),
        ]);
        let mut session = session_on(MockPage::new()).await;

        let err = pipeline(Some(Arc::new(vision)))
            .extract(&mut session)
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::Vision(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_vision_passes_time_out() {
        let vision = Arc::new(ScriptedVision::new(vec![]).with_delay(Duration::from_secs(600)));
        let mut session = session_on(MockPage::new()).await;

        let started = tokio::time::Instant::now();
        let err = pipeline(Some(vision.clone()))
            .with_vision_timeout(Duration::from_secs(5))
            .extract(&mut session)
            .await
            .unwrap_err();

        assert!(matches!(err, VerificationError::Timeout(_)));
        assert_eq!(vision.calls(), 3);
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn empty_page_without_vision_finds_nothing() {
        let mut session = session_on(MockPage::new()).await;
        let profile = pipeline(None).extract(&mut session).await.unwrap();
        assert_eq!(profile.strategy, ExtractionStrategy::None);
        assert_eq!(profile.identity_key, None);
    }

    #[tokio::test]
    async fn tagged_key_found_in_timeline() {
        let page = MockPage::new().with_element(
            ".timeline",
            &format!("gm everyone #Nostr: {KEY} come find me"),
        );
        let mut session = session_on(page).await;

        let key = pipeline(None)
            .find_tagged_key(&mut session, "nostr")
            .await
            .unwrap();
        assert_eq!(key.as_deref(), Some(KEY));
    }
}
