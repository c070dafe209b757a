use browserless_client::BrowserlessError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, VerificationError>;

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("Browser session unavailable: {0}")]
    SessionUnavailable(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("No mirror endpoints configured")]
    NoEndpoints,

    #[error("Vision model error: {0}")]
    Vision(String),

    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    #[error("Malformed key: {0}")]
    MalformedKey(String),
}

impl VerificationError {
    /// Transient failures are retried on a later attempt; the rest are discarded.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            VerificationError::InvalidSelector(_) | VerificationError::MalformedKey(_)
        )
    }
}

impl From<BrowserlessError> for VerificationError {
    fn from(err: BrowserlessError) -> Self {
        match err {
            BrowserlessError::Timeout(msg) => VerificationError::Timeout(msg),
            other => VerificationError::Navigation(other.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for VerificationError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        VerificationError::Timeout(err.to_string())
    }
}
