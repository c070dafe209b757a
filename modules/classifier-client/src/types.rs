use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ClassifierError;

/// The classifier's decision. Taken verbatim from the response, never
/// recomputed from the content level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Allow,
    Flag,
    Block,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allow => write!(f, "ALLOW"),
            Decision::Flag => write!(f, "FLAG"),
            Decision::Block => write!(f, "BLOCK"),
        }
    }
}

/// Where a verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    Classifier,
    /// The service is switched off; nothing was evaluated.
    Disabled,
    /// Evaluation failed and the content was let through.
    FailOpen,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModerationVerdict {
    pub content_level: u8,
    pub decision: Decision,
    pub confidence: f32,
    pub explanation: String,
    /// Seconds the classifier spent on the file.
    pub processing_time: f64,
    pub is_video: bool,
    pub source: VerdictSource,
}

impl ModerationVerdict {
    pub fn disabled() -> Self {
        Self {
            content_level: 0,
            decision: Decision::Allow,
            confidence: 1.0,
            explanation: "Moderation service is disabled".to_string(),
            processing_time: 0.0,
            is_video: false,
            source: VerdictSource::Disabled,
        }
    }

    pub fn fail_open(explanation: impl Into<String>) -> Self {
        Self {
            content_level: 0,
            decision: Decision::Allow,
            confidence: 0.0,
            explanation: explanation.into(),
            processing_time: 0.0,
            is_video: false,
            source: VerdictSource::FailOpen,
        }
    }

    pub fn is_block(&self) -> bool {
        self.decision == Decision::Block
    }
}

/// Response body of `/moderate` and `/moderate_dispute`. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ClassifierResponse {
    pub content_level: u8,
    pub decision: Decision,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub processing_time: f64,
    #[serde(default)]
    pub is_video: bool,
}

impl TryFrom<ClassifierResponse> for ModerationVerdict {
    type Error = ClassifierError;

    fn try_from(resp: ClassifierResponse) -> Result<Self, Self::Error> {
        if resp.content_level > 5 {
            return Err(ClassifierError::Parse(format!(
                "content_level {} out of range 0-5",
                resp.content_level
            )));
        }
        if !(0.0..=1.0).contains(&resp.confidence) {
            return Err(ClassifierError::Parse(format!(
                "confidence {} out of range 0-1",
                resp.confidence
            )));
        }
        Ok(Self {
            content_level: resp.content_level,
            decision: resp.decision,
            confidence: resp.confidence,
            explanation: resp.explanation,
            processing_time: resp.processing_time,
            is_video: resp.is_video,
            source: VerdictSource::Classifier,
        })
    }
}
