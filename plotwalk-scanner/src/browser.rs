use crate::error::{Result, ScanError};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Viewport coordinate in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// One tab/window of a browser session.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    fn id(&self) -> &str;

    async fn navigate(&self, url: &str) -> Result<()>;

    async fn current_url(&self) -> Result<String>;

    /// Runs `script` as a function body; `args` are bound to `arguments`.
    /// Scripts passed here must not mutate application state unless they
    /// exist to scroll or focus.
    async fn evaluate(&self, script: &str, args: Vec<Value>) -> Result<Value>;

    async fn pointer_move(&self, at: Point) -> Result<()>;

    async fn click_at(&self, at: Point) -> Result<()>;

    async fn scroll_wheel(&self, at: Point, delta_y: f64) -> Result<()>;

    /// Clears the first element matching `css`, types `text`, optionally submits with Enter.
    async fn type_into(&self, css: &str, text: &str, submit: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Returns the index of the first selector in `css` that matches, polling until `timeout`.
    async fn wait_for_any(&self, css: &[String], timeout: Duration) -> Result<Option<usize>> {
        let deadline = Instant::now() + timeout;
        let script = "const sels = arguments[0];\
            for (let i = 0; i < sels.length; i++) {\
              try { if (document.querySelector(sels[i])) return i; } catch (e) {}\
            }\
            return -1;";
        let selectors = Value::from(css.to_vec());
        loop {
            let found = self.evaluate(script, vec![selectors.clone()]).await?;
            if let Some(i) = found.as_i64().filter(|i| *i >= 0) {
                return Ok(Some(i as usize));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// A page that answers a trivial script within `timeout` is considered alive.
    async fn is_responsive(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.evaluate("return document.readyState;", vec![]))
            .await
        {
            Ok(Ok(state)) => state.is_string(),
            Ok(Err(e)) => {
                debug!(page = self.id(), "Liveness probe failed: {}", e);
                false
            }
            Err(_) => false,
        }
    }
}

/// A browser that can hand out fresh pages without tearing itself down.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn new_page(&self) -> Result<Arc<dyn BrowserPage>>;

    /// Closes the whole browser and starts a new one, returning its first page.
    async fn relaunch(&self) -> Result<Arc<dyn BrowserPage>>;

    async fn shutdown(&self) -> Result<()>;
}

struct PageSlot {
    page: Arc<dyn BrowserPage>,
}

/// Atomically swappable reference to the active page.
///
/// Every helper resolves [`PageHandle::current`] at call time; recovery may
/// replace the page between any two steps.
#[derive(Clone)]
pub struct PageHandle {
    slot: Arc<ArcSwap<PageSlot>>,
    generation: Arc<AtomicU64>,
}

impl PageHandle {
    pub fn new(page: Arc<dyn BrowserPage>) -> Self {
        Self {
            slot: Arc::new(ArcSwap::from_pointee(PageSlot { page })),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn current(&self) -> Arc<dyn BrowserPage> {
        self.slot.load().page.clone()
    }

    /// How many times the page has been swapped out.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Installs `page` and hands back the previous one for disposal.
    pub fn replace(&self, page: Arc<dyn BrowserPage>) -> Arc<dyn BrowserPage> {
        let old = self.slot.swap(Arc::new(PageSlot { page }));
        self.generation.fetch_add(1, Ordering::SeqCst);
        old.page.clone()
    }

    /// Provisions a new page, verifies it responds, swaps it in and closes the old one.
    pub async fn swap_fresh(
        &self,
        session: &dyn BrowserSession,
        probe_timeout: Duration,
    ) -> Result<()> {
        let fresh = session.new_page().await?;
        if !fresh.is_responsive(probe_timeout).await {
            let _ = fresh.close().await;
            return Err(ScanError::SessionDead(format!(
                "fresh page {} did not respond",
                fresh.id()
            )));
        }
        let old = self.replace(fresh);
        info!(old = old.id(), new = self.current().id(), "Swapped in fresh page");
        if let Err(e) = old.close().await {
            warn!(page = old.id(), "Failed to close discarded page: {}", e);
        }
        Ok(())
    }

    /// Relaunches the whole browser and installs its first page.
    pub async fn recycle_session(&self, session: &dyn BrowserSession) -> Result<()> {
        let fresh = session.relaunch().await?;
        let old = self.replace(fresh);
        info!(old = old.id(), new = self.current().id(), "Recycled browser session");
        Ok(())
    }
}

pub async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_replace_returns_previous_page() {
        let first: Arc<dyn BrowserPage> = Arc::new(RecordingPage::new("first"));
        let handle = PageHandle::new(first);
        let second: Arc<dyn BrowserPage> = Arc::new(RecordingPage::new("second"));

        let old = handle.replace(second);

        assert_eq!(old.id(), "first");
        assert_eq!(handle.current().id(), "second");
        assert_eq!(handle.generation(), 1);
    }

    #[tokio::test]
    async fn test_clones_observe_swaps() {
        let handle = PageHandle::new(Arc::new(RecordingPage::new("first")));
        let helper_view = handle.clone();

        handle.replace(Arc::new(RecordingPage::new("second")));

        assert_eq!(helper_view.current().id(), "second");
    }

    #[tokio::test]
    async fn test_swap_fresh_closes_old_page() {
        let first = Arc::new(RecordingPage::new("first"));
        let handle = PageHandle::new(first.clone());
        let session = RecordingSession::new();

        handle
            .swap_fresh(&session, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(handle.current().id(), "page-1");
        assert_eq!(first.calls(), vec!["close".to_string()]);
    }

    #[tokio::test]
    async fn test_swap_fresh_rejects_unresponsive_page() {
        let handle = PageHandle::new(Arc::new(RecordingPage::new("first")));
        let mut session = RecordingSession::new();
        session.next_responsive = false;

        let result = handle.swap_fresh(&session, Duration::from_secs(1)).await;

        assert!(matches!(result, Err(ScanError::SessionDead(_))));
        assert_eq!(handle.current().id(), "first");
        assert_eq!(handle.generation(), 0);
    }

    #[tokio::test]
    async fn test_recycle_session_relaunches() {
        let handle = PageHandle::new(Arc::new(RecordingPage::new("first")));
        let session = RecordingSession::new();

        handle.recycle_session(&session).await.unwrap();

        assert_eq!(*session.relaunches.lock().unwrap(), 1);
        assert_eq!(handle.current().id(), "page-1");
    }
}
