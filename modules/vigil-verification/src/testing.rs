// Test doubles for the verification pipeline.
//
// `MockBackend` serves scripted pages: a navigation picks the page whose
// registered URL is the longest prefix of the target. Unscripted URLs load an
// empty page. Counters are shared with every session the backend opens.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, VerificationError};
use crate::session::{BrowserSession, SessionBackend};
use crate::vision::{VisionModel, VisionReading};

const JSON_LD_SELECTOR: &str = r#"script[type="application/ld+json"]"#;

/// One rendered page: selector → text content, plus a screenshot.
#[derive(Debug, Clone, Default)]
pub struct MockPage {
    elements: Vec<(String, String)>,
    screenshot: Vec<u8>,
}

impl MockPage {
    pub fn new() -> Self {
        Self {
            elements: Vec::new(),
            screenshot: b"\x89PNG mock".to_vec(),
        }
    }

    pub fn with_element(mut self, selector: &str, text: &str) -> Self {
        self.elements.push((selector.to_string(), text.to_string()));
        self
    }

    pub fn with_json_ld(self, json: &str) -> Self {
        self.with_element(JSON_LD_SELECTOR, json)
    }

    pub fn screenshot(mut self, png: &[u8]) -> Self {
        self.screenshot = png.to_vec();
        self
    }

    fn all(&self, selector: &str) -> Vec<String> {
        self.elements
            .iter()
            .filter(|(s, _)| s == selector)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[derive(Default)]
struct Shared {
    pages: Vec<(String, MockPage)>,
    failing_prefixes: Vec<String>,
    panicking_prefixes: Vec<String>,
    unhealthy_sessions: bool,
    probe_failures: AtomicUsize,
    navigations: Mutex<Vec<String>>,
    closed: AtomicUsize,
}

impl Shared {
    fn page_for(&self, url: &str) -> MockPage {
        self.pages
            .iter()
            .filter(|(prefix, _)| url.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, page)| page.clone())
            .unwrap_or_else(MockPage::new)
    }

    fn fails(&self, url: &str) -> bool {
        self.failing_prefixes
            .iter()
            .any(|p| url.starts_with(p.as_str()))
    }

    fn panics(&self, url: &str) -> bool {
        self.panicking_prefixes
            .iter()
            .any(|p| url.starts_with(p.as_str()))
    }
}

pub struct MockSession {
    shared: Arc<Shared>,
    page: Option<MockPage>,
    healthy: bool,
}

impl MockSession {
    /// A standalone session that serves `page` for URLs under `url`.
    pub fn with_page(url: &str, page: MockPage) -> Self {
        let shared = Shared {
            pages: vec![(url.to_string(), page)],
            ..Default::default()
        };
        Self {
            shared: Arc::new(shared),
            page: None,
            healthy: true,
        }
    }

    fn current(&self) -> Result<&MockPage> {
        self.page
            .as_ref()
            .ok_or_else(|| VerificationError::Navigation("no page loaded".to_string()))
    }
}

#[async_trait]
impl BrowserSession for MockSession {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        self.shared
            .navigations
            .lock()
            .unwrap()
            .push(url.to_string());
        if self.shared.panics(url) {
            panic!("renderer crashed on {url}");
        }
        if self.shared.fails(url) {
            self.page = None;
            return Err(VerificationError::Navigation(format!("{url}: 502 Bad Gateway")));
        }
        self.page = Some(self.shared.page_for(url));
        Ok(())
    }

    async fn wait_loaded(&mut self) -> Result<()> {
        self.current().map(|_| ())
    }

    async fn query_selector(&self, selector: &str) -> Result<Option<String>> {
        Ok(self.current()?.all(selector).into_iter().next())
    }

    async fn query_selector_all(&self, selector: &str) -> Result<Vec<String>> {
        Ok(self.current()?.all(selector))
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        Ok(self.current()?.screenshot.clone())
    }

    async fn probe(&self) -> Result<()> {
        let remaining = self.shared.probe_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.shared
                .probe_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(VerificationError::SessionUnavailable(
                "probe failed".to_string(),
            ));
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }

    async fn close(&mut self) {
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockBackend {
    shared: Arc<Shared>,
    init_failures: AtomicUsize,
    init_delay: Option<Duration>,
    init_calls: AtomicUsize,
    opened: AtomicUsize,
    initialized: AtomicBool,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            init_failures: AtomicUsize::new(0),
            init_delay: None,
            init_calls: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
            initialized: AtomicBool::new(false),
        }
    }

    fn shared_mut(&mut self) -> &mut Shared {
        Arc::get_mut(&mut self.shared).expect("configure backend before opening sessions")
    }

    pub fn page(mut self, url_prefix: &str, page: MockPage) -> Self {
        self.shared_mut()
            .pages
            .push((url_prefix.to_string(), page));
        self
    }

    /// Navigations to URLs under `url_prefix` fail.
    pub fn failing(mut self, url_prefix: &str) -> Self {
        self.shared_mut()
            .failing_prefixes
            .push(url_prefix.to_string());
        self
    }

    /// Navigations to URLs under `url_prefix` panic.
    pub fn panicking(mut self, url_prefix: &str) -> Self {
        self.shared_mut()
            .panicking_prefixes
            .push(url_prefix.to_string());
        self
    }

    /// The first `n` initialization attempts fail.
    pub fn failing_init(self, n: usize) -> Self {
        self.init_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = Some(delay);
        self
    }

    /// The next `n` probes fail, across all sessions.
    pub fn failing_probes(self, n: usize) -> Self {
        self.shared.probe_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Sessions report unhealthy as soon as they are opened.
    pub fn unhealthy_sessions(mut self) -> Self {
        self.shared_mut().unhealthy_sessions = true;
        self
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Every URL navigated to, in order.
    pub fn navigations(&self) -> Vec<String> {
        self.shared.navigations.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionBackend for MockBackend {
    async fn initialize(&self) -> Result<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.init_delay {
            tokio::time::sleep(delay).await;
        }
        let remaining = self.init_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.init_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(VerificationError::SessionUnavailable(
                "browser not reachable".to_string(),
            ));
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn open_session(&self) -> Result<Box<dyn BrowserSession>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            shared: self.shared.clone(),
            page: None,
            healthy: !self.shared.unhealthy_sessions,
        }))
    }
}

/// Vision model that replays scripted readings, then answers empty.
#[derive(Default)]
pub struct ScriptedVision {
    replies: Mutex<VecDeque<Result<VisionReading>>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedVision {
    pub fn new(replies: Vec<Result<VisionReading>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Each pass sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionModel for ScriptedVision {
    async fn read_profile(&self, _png: &[u8]) -> Result<VisionReading> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(VisionReading::default()))
    }
}
