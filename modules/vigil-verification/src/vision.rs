// Screenshot reading with a vision model.
//
// `ClaudeVision` sends the screenshot as a base64 image block and forces a
// single tool call whose input schema is derived from `VisionReading`, so the
// answer comes back as structured JSON.

use async_trait::async_trait;
use base64::Engine;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::{Result, VerificationError};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const TOOL_NAME: &str = "record_profile";

const PROMPT: &str = "This is a screenshot of a social media profile page. \
Report the identity key (a token starting with npub1) if one appears in the \
profile bio, and the follower count exactly as displayed. Leave a field empty \
if it is not visible.";

/// What one pass over a screenshot read. Both fields are raw strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct VisionReading {
    /// The npub1... token shown in the bio, if any.
    #[serde(default)]
    pub identity_key: Option<String>,
    /// Follower count as displayed, e.g. "1,234" or "12.5K".
    #[serde(default)]
    pub follower_count: Option<String>,
}

#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn read_profile(&self, png: &[u8]) -> Result<VisionReading>;
}

pub struct ClaudeVision {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl ClaudeVision {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: ANTHROPIC_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    fn input_schema() -> serde_json::Value {
        let mut schema = serde_json::to_value(schema_for!(VisionReading)).unwrap_or_default();
        if let serde_json::Value::Object(map) = &mut schema {
            map.remove("$schema");
            map.remove("title");
        }
        schema
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[async_trait]
impl VisionModel for ClaudeVision {
    async fn read_profile(&self, png: &[u8]) -> Result<VisionReading> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(png);
        let request = json!({
            "model": self.model,
            "max_tokens": 1024,
            "temperature": 0.0,
            "tools": [{
                "name": TOOL_NAME,
                "description": "Record the fields read from the profile screenshot.",
                "input_schema": Self::input_schema(),
            }],
            "tool_choice": { "type": "tool", "name": TOOL_NAME },
            "messages": [{
                "role": "user",
                "content": [
                    {
                        "type": "image",
                        "source": { "type": "base64", "media_type": "image/png", "data": encoded },
                    },
                    { "type": "text", "text": PROMPT },
                ],
            }],
        });

        debug!(model = %self.model, bytes = png.len(), "Vision request");

        let resp = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| VerificationError::Vision(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(VerificationError::Vision(format!(
                "API error ({status}): {body}"
            )));
        }

        let parsed: MessagesResponse = resp
            .json()
            .await
            .map_err(|e| VerificationError::Vision(e.to_string()))?;

        parsed
            .content
            .into_iter()
            .find_map(|block| match block {
                ResponseBlock::ToolUse { name, input } if name == TOOL_NAME => Some(input),
                _ => None,
            })
            .ok_or_else(|| VerificationError::Vision("no tool call in response".to_string()))
            .and_then(|input| {
                serde_json::from_value(input).map_err(|e| VerificationError::Vision(e.to_string()))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::Value;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn schema_lists_both_fields() {
        let schema = ClaudeVision::input_schema();
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"]["identity_key"].is_object());
        assert!(schema["properties"]["follower_count"].is_object());
    }

    #[tokio::test]
    async fn tool_call_input_is_parsed() {
        let router = Router::new().route(
            "/messages",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["tool_choice"]["name"], TOOL_NAME);
                assert_eq!(body["messages"][0]["content"][0]["source"]["data"], "iVBORw==");
                Json(json!({
                    "id": "msg_1",
                    "content": [
                        { "type": "text", "text": "Reading the page." },
                        {
                            "type": "tool_use",
                            "id": "tu_1",
                            "name": TOOL_NAME,
                            "input": { "identity_key": null, "follower_count": "1,204" }
                        }
                    ],
                    "stop_reason": "tool_use"
                }))
            }),
        );
        let base = serve(router).await;

        let vision = ClaudeVision::new("sk-test", "claude-test").with_base_url(&base);
        let reading = vision.read_profile(&[0x89, b'P', b'N', b'G']).await.unwrap();

        assert_eq!(reading.identity_key, None);
        assert_eq!(reading.follower_count.as_deref(), Some("1,204"));
    }

    #[tokio::test]
    async fn missing_tool_call_is_an_error() {
        let router = Router::new().route(
            "/messages",
            post(|| async { Json(json!({ "content": [{ "type": "text", "text": "no" }] })) }),
        );
        let base = serve(router).await;

        let vision = ClaudeVision::new("sk-test", "claude-test").with_base_url(&base);
        let err = vision.read_profile(b"png").await.unwrap_err();
        assert!(matches!(err, VerificationError::Vision(_)));
        assert!(err.is_retryable());
    }
}
