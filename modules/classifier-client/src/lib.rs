pub mod error;
pub mod media;
pub mod types;

pub use error::{ClassifierError, Result};
pub use media::TEMP_PREFIX;
pub use types::{Decision, ModerationVerdict, VerdictSource};

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use types::ClassifierResponse;

#[derive(Debug, Clone)]
pub struct ClassifierOptions {
    pub endpoint: String,
    pub api_key: Option<String>,
    /// When false every call returns a fixed ALLOW without touching the network.
    pub enabled: bool,
    pub moderation_mode: String,
    pub threshold: f32,
    /// Lower threshold used when re-evaluating a disputed block.
    pub dispute_threshold: f32,
    pub request_timeout: Duration,
    pub download_timeout: Duration,
    pub max_download_bytes: u64,
    pub temp_dir: PathBuf,
}

impl ClassifierOptions {
    pub fn new(endpoint: &str, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            api_key: None,
            enabled: true,
            moderation_mode: "full".to_string(),
            threshold: 0.5,
            dispute_threshold: 0.35,
            request_timeout: Duration::from_secs(120),
            download_timeout: Duration::from_secs(30),
            max_download_bytes: 100 * 1024 * 1024,
            temp_dir: temp_dir.into(),
        }
    }
}

/// Which classifier route and parameters a call uses.
struct Evaluation<'a> {
    route: &'static str,
    threshold: f32,
    dispute_reason: Option<&'a str>,
}

pub struct ClassifierClient {
    client: reqwest::Client,
    base_url: String,
    options: ClassifierOptions,
}

impl ClassifierClient {
    pub fn new(options: ClassifierOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: options.endpoint.trim_end_matches('/').to_string(),
            options,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.options.enabled
    }

    pub fn temp_dir(&self) -> &Path {
        &self.options.temp_dir
    }

    /// Download `url` and classify it.
    ///
    /// A failed download yields a fail-open ALLOW verdict rather than an error.
    pub async fn moderate_url(&self, url: &str) -> Result<ModerationVerdict> {
        self.evaluate_url(url, self.standard()).await
    }

    pub async fn moderate_file(&self, path: &Path) -> Result<ModerationVerdict> {
        self.evaluate_file(path, self.standard()).await
    }

    /// Re-evaluate a disputed item with the dispute route and lowered threshold.
    pub async fn moderate_dispute_url(&self, url: &str, reason: &str) -> Result<ModerationVerdict> {
        self.evaluate_url(url, self.dispute(reason)).await
    }

    pub async fn moderate_dispute_file(
        &self,
        path: &Path,
        reason: &str,
    ) -> Result<ModerationVerdict> {
        self.evaluate_file(path, self.dispute(reason)).await
    }

    fn standard(&self) -> Evaluation<'static> {
        Evaluation {
            route: "moderate",
            threshold: self.options.threshold,
            dispute_reason: None,
        }
    }

    fn dispute<'a>(&self, reason: &'a str) -> Evaluation<'a> {
        Evaluation {
            route: "moderate_dispute",
            threshold: self.options.dispute_threshold,
            dispute_reason: Some(reason),
        }
    }

    async fn evaluate_url(&self, url: &str, eval: Evaluation<'_>) -> Result<ModerationVerdict> {
        if !self.options.enabled {
            return Ok(ModerationVerdict::disabled());
        }

        let media = match media::download(
            &self.client,
            url,
            &self.options.temp_dir,
            self.options.max_download_bytes,
            self.options.download_timeout,
        )
        .await
        {
            Ok(media) => media,
            Err(ClassifierError::Download(reason)) => {
                tracing::warn!(url, reason = %reason, "Media download failed, allowing");
                return Ok(ModerationVerdict::fail_open(format!(
                    "Failed to download media: {reason}"
                )));
            }
            Err(e) => return Err(e),
        };

        self.classify(media.path(), media.declared_type.as_deref(), &eval)
            .await
    }

    async fn evaluate_file(&self, path: &Path, eval: Evaluation<'_>) -> Result<ModerationVerdict> {
        if !self.options.enabled {
            return Ok(ModerationVerdict::disabled());
        }
        let declared = media::guess_from_path(&path.to_string_lossy());
        self.classify(path, declared.as_deref(), &eval).await
    }

    async fn classify(
        &self,
        path: &Path,
        declared: Option<&str>,
        eval: &Evaluation<'_>,
    ) -> Result<ModerationVerdict> {
        let mime = media::validate(path, declared).await?;
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "media".to_string());

        let part = Part::bytes(bytes).file_name(file_name).mime_str(&mime)?;
        let mut form = Form::new()
            .part("file", part)
            .text("moderation_mode", self.options.moderation_mode.clone())
            .text("threshold", format!("{:.2}", eval.threshold));
        if let Some(reason) = eval.dispute_reason {
            form = form.text("dispute_reason", reason.to_string());
        }

        let url = format!("{}/{}", self.base_url, eval.route);
        let mut req = self.client.post(&url).multipart(form);
        if let Some(ref key) = self.options.api_key {
            req = req.bearer_auth(key);
        }

        let started = std::time::Instant::now();
        let resp = req.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ClassifierError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body = resp.text().await?;
        let parsed: ClassifierResponse = serde_json::from_str(&body)?;
        let verdict = ModerationVerdict::try_from(parsed)?;

        tracing::debug!(
            route = eval.route,
            mime = %mime,
            decision = %verdict.decision,
            content_level = verdict.content_level,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Classifier verdict"
        );

        Ok(verdict)
    }
}
