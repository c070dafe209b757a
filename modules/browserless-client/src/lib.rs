pub mod error;

pub use error::{BrowserlessError, Result};

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Page lifecycle event Browserless waits for before capturing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitUntil {
    Load,
    #[serde(rename = "domcontentloaded")]
    DomContentLoaded,
    #[serde(rename = "networkidle0")]
    NetworkIdle0,
    #[serde(rename = "networkidle2")]
    NetworkIdle2,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GotoOptions {
    wait_until: WaitUntil,
    timeout: u64,
}

#[derive(Debug, Clone, Serialize)]
struct WaitForSelector<'a> {
    selector: &'a str,
    timeout: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContentBody<'a> {
    url: &'a str,
    goto_options: GotoOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    wait_for_selector: Option<WaitForSelector<'a>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScreenshotOptions {
    full_page: bool,
    #[serde(rename = "type")]
    format: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScreenshotBody<'a> {
    url: &'a str,
    goto_options: GotoOptions,
    options: ScreenshotOptions,
}

/// Load reported by `/pressure`. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Pressure {
    pub is_available: bool,
    pub running: u32,
    pub queued: u32,
    pub max_concurrent: u32,
    pub max_queued: u32,
}

#[derive(Debug, Deserialize)]
struct PressureResponse {
    pressure: Pressure,
}

pub struct BrowserlessClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    wait_until: WaitUntil,
    navigation_timeout: Duration,
}

impl BrowserlessClient {
    pub fn new(base_url: &str, token: Option<&str>, navigation_timeout: Duration) -> Result<Self> {
        // Browserless enforces the navigation timeout itself; the HTTP timeout
        // leaves room for the render to be serialized back.
        let client = reqwest::Client::builder()
            .timeout(navigation_timeout + Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            wait_until: WaitUntil::NetworkIdle2,
            navigation_timeout,
        })
    }

    pub fn with_wait_until(mut self, wait_until: WaitUntil) -> Self {
        self.wait_until = wait_until;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        match self.token {
            Some(ref token) => format!("{}/{path}?token={token}", self.base_url),
            None => format!("{}/{path}", self.base_url),
        }
    }

    fn goto_options(&self) -> GotoOptions {
        GotoOptions {
            wait_until: self.wait_until,
            timeout: self.navigation_timeout.as_millis() as u64,
        }
    }

    /// Fetch fully-rendered HTML for a URL via Browserless /content.
    ///
    /// With `wait_for` set, Browserless also waits for that selector to appear.
    pub async fn content(&self, url: &str, wait_for: Option<&str>) -> Result<String> {
        let body = ContentBody {
            url,
            goto_options: self.goto_options(),
            wait_for_selector: wait_for.map(|selector| WaitForSelector {
                selector,
                timeout: self.navigation_timeout.as_millis() as u64,
            }),
        };

        let resp = self
            .client
            .post(self.endpoint("content"))
            .json(&body)
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let html = resp.text().await?;
        tracing::debug!(url, bytes = html.len(), "Rendered page content");
        Ok(html)
    }

    /// Full-page PNG screenshot via Browserless /screenshot.
    pub async fn screenshot(&self, url: &str) -> Result<Vec<u8>> {
        let body = ScreenshotBody {
            url,
            goto_options: self.goto_options(),
            options: ScreenshotOptions {
                full_page: true,
                format: "png",
            },
        };

        let resp = self
            .client
            .post(self.endpoint("screenshot"))
            .json(&body)
            .send()
            .await?;
        let resp = check_status(resp).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    /// Current load of the Browserless instance. Doubles as a liveness probe.
    pub async fn pressure(&self) -> Result<Pressure> {
        let resp = self.client.get(self.endpoint("pressure")).send().await?;
        let resp = check_status(resp).await?;
        let body = resp.text().await?;
        let parsed: PressureResponse = serde_json::from_str(&body)?;
        Ok(parsed.pressure)
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(BrowserlessError::Api {
        status: status.as_u16(),
        message,
    })
}
