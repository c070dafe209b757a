// Browserless-backed sessions.
//
// Browserless renders each page server-side; the session keeps the rendered
// HTML and answers selector queries locally with `scraper`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use browserless_client::BrowserlessClient;
use scraper::{Html, Selector};
use tracing::{debug, info, warn};

use crate::error::{Result, VerificationError};
use crate::session::{BrowserSession, SessionBackend};

pub struct BrowserlessBackend {
    client: Arc<BrowserlessClient>,
    navigation_timeout: Duration,
    next_id: AtomicU64,
}

impl BrowserlessBackend {
    pub fn new(client: BrowserlessClient, navigation_timeout: Duration) -> Self {
        Self {
            client: Arc::new(client),
            navigation_timeout,
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl SessionBackend for BrowserlessBackend {
    async fn initialize(&self) -> Result<()> {
        let pressure = self.client.pressure().await?;
        if !pressure.is_available {
            warn!(
                running = pressure.running,
                queued = pressure.queued,
                "Browserless is at capacity"
            );
        }
        info!(
            max_concurrent = pressure.max_concurrent,
            "Browserless backend ready"
        );
        Ok(())
    }

    async fn open_session(&self) -> Result<Box<dyn BrowserSession>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(session = id, "Opening browserless session");
        Ok(Box::new(BrowserlessSession {
            id,
            client: self.client.clone(),
            navigation_timeout: self.navigation_timeout,
            current_url: None,
            html: None,
            healthy: true,
        }))
    }
}

pub struct BrowserlessSession {
    id: u64,
    client: Arc<BrowserlessClient>,
    navigation_timeout: Duration,
    current_url: Option<String>,
    html: Option<String>,
    healthy: bool,
}

impl BrowserlessSession {
    fn page(&self) -> Result<&str> {
        self.html
            .as_deref()
            .ok_or_else(|| VerificationError::Navigation("no page loaded".to_string()))
    }

    fn select(&self, selector: &str) -> Result<Vec<String>> {
        let selector = Selector::parse(selector)
            .map_err(|e| VerificationError::InvalidSelector(format!("{selector}: {e}")))?;
        let document = Html::parse_document(self.page()?);
        Ok(document
            .select(&selector)
            .map(|el| {
                el.text()
                    .collect::<String>()
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect())
    }
}

#[async_trait]
impl BrowserSession for BrowserlessSession {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        self.html = None;
        self.current_url = Some(url.to_string());

        let result = tokio::time::timeout(self.navigation_timeout, self.client.content(url, None))
            .await
            .map_err(VerificationError::from)
            .and_then(|r| r.map_err(VerificationError::from));

        match result {
            Ok(html) => {
                debug!(session = self.id, url, bytes = html.len(), "Page loaded");
                self.html = Some(html);
                Ok(())
            }
            Err(e) => {
                if matches!(e, VerificationError::Timeout(_)) {
                    self.healthy = false;
                }
                Err(e)
            }
        }
    }

    async fn wait_loaded(&mut self) -> Result<()> {
        // `/content` returns only after the page reached its idle state.
        self.page().map(|_| ())
    }

    async fn query_selector(&self, selector: &str) -> Result<Option<String>> {
        Ok(self.select(selector)?.into_iter().next())
    }

    async fn query_selector_all(&self, selector: &str) -> Result<Vec<String>> {
        self.select(selector)
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        let url = self
            .current_url
            .as_deref()
            .ok_or_else(|| VerificationError::Navigation("no page loaded".to_string()))?;
        let png = tokio::time::timeout(self.navigation_timeout, self.client.screenshot(url)).await??;
        Ok(png)
    }

    async fn probe(&self) -> Result<()> {
        self.client.pressure().await?;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }

    async fn close(&mut self) {
        debug!(session = self.id, "Closing browserless session");
        self.healthy = false;
        self.html = None;
        self.current_url = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with(html: &str) -> BrowserlessSession {
        let client =
            BrowserlessClient::new("http://127.0.0.1:9", None, Duration::from_secs(1)).unwrap();
        BrowserlessSession {
            id: 1,
            client: Arc::new(client),
            navigation_timeout: Duration::from_secs(1),
            current_url: Some("http://mirror.example/alice".to_string()),
            html: Some(html.to_string()),
            healthy: true,
        }
    }

    #[tokio::test]
    async fn queries_run_over_rendered_html() {
        let session = session_with(
            r#"<html><body>
                <div class="profile-bio"><p>hello <b>world</b></p></div>
                <script type="application/ld+json">{"@type":"ProfilePage"}</script>
                <span class="n">1</span><span class="n">2</span>
            </body></html>"#,
        );

        assert_eq!(
            session.query_selector(".profile-bio").await.unwrap().as_deref(),
            Some("hello world")
        );
        assert_eq!(
            session
                .query_selector(r#"script[type="application/ld+json"]"#)
                .await
                .unwrap()
                .as_deref(),
            Some(r#"{"@type":"ProfilePage"}"#)
        );
        assert_eq!(session.query_selector_all(".n").await.unwrap(), vec!["1", "2"]);
        assert_eq!(session.query_selector(".missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn bad_selector_is_not_retryable() {
        let session = session_with("<html></html>");
        let err = session.query_selector("div[").await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
