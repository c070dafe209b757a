use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

/// Secrets and environment-specific values, read from the environment.
/// Pipeline tuning lives in the TOML [`FileConfig`].
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub browserless_url: String,
    pub browserless_token: Option<String>,
    pub classifier_api_key: Option<String>,
    /// Without it the visual extraction strategy is disabled.
    pub anthropic_api_key: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL is required")?,
            browserless_url: std::env::var("BROWSERLESS_URL")
                .context("BROWSERLESS_URL is required")?,
            browserless_token: std::env::var("BROWSERLESS_TOKEN").ok(),
            classifier_api_key: std::env::var("CLASSIFIER_API_KEY").ok(),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
        };

        config.log_keys();
        Ok(config)
    }

    fn log_keys(&self) {
        fn preview(val: &Option<String>) -> String {
            match val {
                Some(v) if !v.is_empty() => format!("{}...", v.chars().take(4).collect::<String>()),
                _ => "(unset)".to_string(),
            }
        }

        info!(
            browserless_url = %self.browserless_url,
            browserless_token = %preview(&self.browserless_token),
            classifier_api_key = %preview(&self.classifier_api_key),
            anthropic_api_key = %preview(&self.anthropic_api_key),
            "Loaded environment config"
        );
    }
}

/// TOML-backed tuning. Every section is optional and falls back to defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FileConfig {
    pub moderation: ModerationConfig,
    pub classifier: ClassifierConfig,
    pub verification: VerificationConfig,
    pub browser: BrowserConfig,
    pub mirrors: MirrorsConfig,
    pub vision: VisionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ModerationConfig {
    pub poll_interval_secs: u64,
    pub dispute_interval_secs: u64,
    pub batch_size: usize,
    pub worker_concurrency: usize,
    pub temp_dir: PathBuf,
    pub temp_max_age_hours: u64,
    pub temp_cleanup_interval_secs: u64,
    pub block_retention_hours: i64,
    pub block_purge_interval_secs: u64,
    pub resolution_retention_days: i64,
    pub resolution_purge_interval_secs: u64,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            dispute_interval_secs: 60,
            batch_size: 10,
            worker_concurrency: 3,
            temp_dir: std::env::temp_dir().join("vigil-media"),
            temp_max_age_hours: 24,
            temp_cleanup_interval_secs: 3600,
            block_retention_hours: 48,
            block_purge_interval_secs: 86_400,
            resolution_retention_days: 7,
            resolution_purge_interval_secs: 86_400,
        }
    }
}

impl ModerationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn dispute_interval(&self) -> Duration {
        Duration::from_secs(self.dispute_interval_secs)
    }

    pub fn temp_max_age(&self) -> Duration {
        Duration::from_secs(self.temp_max_age_hours * 3600)
    }

    pub fn block_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.block_retention_hours)
    }

    pub fn resolution_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.resolution_retention_days)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClassifierConfig {
    pub endpoint: String,
    pub enabled: bool,
    pub moderation_mode: String,
    pub threshold: f32,
    pub dispute_threshold: f32,
    pub request_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub max_download_bytes: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8000".to_string(),
            enabled: true,
            moderation_mode: "full".to_string(),
            threshold: 0.5,
            dispute_threshold: 0.35,
            request_timeout_secs: 120,
            download_timeout_secs: 30,
            max_download_bytes: 100 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct VerificationConfig {
    pub poll_interval_secs: u64,
    pub batch_size: usize,
    pub worker_concurrency: usize,
    pub max_attempts: u32,
    pub cooldown_hours: i64,
    pub sweep_interval_hours: u64,
    /// Hashtag that marks a key-bearing post, written as `#<tag>:npub1...`.
    pub tag: String,
    pub consensus_passes: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            batch_size: 10,
            worker_concurrency: 3,
            max_attempts: 5,
            cooldown_hours: 24,
            sweep_interval_hours: 24 * 7,
            tag: "nostr".to_string(),
            consensus_passes: 3,
        }
    }
}

impl VerificationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::hours(self.cooldown_hours)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_hours * 3600)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BrowserConfig {
    pub max_sessions: usize,
    pub max_idle: usize,
    pub probe_timeout_secs: u64,
    pub init_timeout_secs: u64,
    pub init_retries: u32,
    pub navigation_timeout_secs: u64,
    pub bio_selector: String,
    pub followers_selector: String,
    pub timeline_selector: String,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            max_sessions: 3,
            max_idle: 2,
            probe_timeout_secs: 5,
            init_timeout_secs: 60,
            init_retries: 3,
            navigation_timeout_secs: 30,
            bio_selector: ".profile-bio".to_string(),
            followers_selector: ".profile-statlist .followers .profile-stat-num".to_string(),
            timeline_selector: ".timeline".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MirrorEndpoint {
    pub url: String,
    #[serde(default)]
    pub priority: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MirrorsConfig {
    pub requests_per_minute: u32,
    pub endpoints: Vec<MirrorEndpoint>,
}

impl Default for MirrorsConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 30,
            endpoints: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct VisionConfig {
    pub model: String,
    /// Upper bound on one vision pass.
    pub request_timeout_secs: u64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            request_timeout_secs: 60,
        }
    }
}

impl VisionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Load and parse a TOML config file.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

pub fn parse_config(content: &str) -> Result<FileConfig> {
    Ok(toml::from_str(content)?)
}
