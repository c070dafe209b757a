// Browser automation capability.
//
// The pool and extraction pipeline only see these traits. The shipped
// backend drives a Browserless instance over HTTP; tests script pages.

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn navigate(&mut self, url: &str) -> Result<()>;

    /// Resolve once the current page has finished loading.
    async fn wait_loaded(&mut self) -> Result<()>;

    /// Text content of the first element matching `selector`.
    async fn query_selector(&self, selector: &str) -> Result<Option<String>>;

    /// Text content of every element matching `selector`, in document order.
    async fn query_selector_all(&self, selector: &str) -> Result<Vec<String>>;

    /// Full-page PNG of the current page.
    async fn screenshot(&self) -> Result<Vec<u8>>;

    /// Liveness check, run before an idle session is handed out again.
    async fn probe(&self) -> Result<()>;

    fn is_healthy(&self) -> bool;

    async fn close(&mut self);
}

#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// One-time setup before the first session is opened.
    async fn initialize(&self) -> Result<()>;

    async fn open_session(&self) -> Result<Box<dyn BrowserSession>>;
}
