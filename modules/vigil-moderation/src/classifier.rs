use async_trait::async_trait;
use classifier_client::{ClassifierClient, ModerationVerdict, Result};

/// The classification capability the dispatcher depends on.
#[async_trait]
pub trait MediaClassifier: Send + Sync {
    async fn classify(&self, url: &str) -> Result<ModerationVerdict>;

    /// Re-evaluate a disputed item with the user's reason attached.
    async fn classify_dispute(&self, url: &str, reason: &str) -> Result<ModerationVerdict>;
}

#[async_trait]
impl MediaClassifier for ClassifierClient {
    async fn classify(&self, url: &str) -> Result<ModerationVerdict> {
        self.moderate_url(url).await
    }

    async fn classify_dispute(&self, url: &str, reason: &str) -> Result<ModerationVerdict> {
        self.moderate_dispute_url(url, reason).await
    }
}
