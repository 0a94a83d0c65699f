use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chromiumoxide::element::Element;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use quarry_core::error::AppError;
use quarry_core::traits::{LiveElement, PageSource, PageSourceProvider};

const READY_POLL: Duration = Duration::from_millis(250);

/// Marks a parent element so it can be found again by CSS selector.
const MARK_PARENT_JS: &str = r#"function(token) {
    const p = this.parentElement;
    if (!p) { return null; }
    if (!p.dataset.quarryNode) { p.dataset.quarryNode = token; }
    return p.dataset.quarryNode;
}"#;

fn browser_error(context: &str, e: impl std::fmt::Display) -> AppError {
    AppError::BrowserError(format!("{context}: {e}"))
}

/// Headless Chromium shared by every page it opens.
///
/// Each [`PageSourceProvider::open`] creates a fresh tab; releasing the
/// page closes it.
#[derive(Clone)]
pub struct BrowserPageProvider {
    browser: Arc<Browser>,
    nav_timeout: Duration,
    marks: Arc<AtomicU64>,
}

impl BrowserPageProvider {
    /// Launch with a **30 s** navigation timeout.
    pub async fn launch() -> Result<Self, AppError> {
        Self::launch_with_timeout(Duration::from_secs(30)).await
    }

    pub async fn launch_with_timeout(nav_timeout: Duration) -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();
        if let Some(bin) = find_chrome_binary() {
            tracing::info!(binary = %bin.display(), "Using Chrome binary");
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--no-first-run")
            .arg("--window-size=1920,1080")
            .build()
            .map_err(|e| AppError::ConfigError(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| browser_error("Failed to launch browser", e))?;

        // CDP events must be drained for the connection to make progress.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!(error = %e, "Browser handler stopped");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
            nav_timeout,
            marks: Arc::new(AtomicU64::new(0)),
        })
    }
}

/// `CHROME_BIN`, then the usual install locations. `None` lets
/// chromiumoxide search on its own.
fn find_chrome_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }
    [
        // the snap wrapper drops headless flags, use the real binary
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ]
    .iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
}

impl PageSourceProvider for BrowserPageProvider {
    type Page = BrowserPage;

    async fn open(&self) -> Result<BrowserPage, AppError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| browser_error("Failed to open tab", e))?;
        Ok(BrowserPage {
            page,
            nav_timeout: self.nav_timeout,
            marks: Arc::clone(&self.marks),
        })
    }
}

pub struct BrowserPage {
    page: Page,
    nav_timeout: Duration,
    marks: Arc<AtomicU64>,
}

impl BrowserPage {
    fn wrap(&self, element: Element) -> BrowserElement {
        BrowserElement {
            element,
            page: self.page.clone(),
            marks: Arc::clone(&self.marks),
        }
    }
}

impl PageSource for BrowserPage {
    type Element = BrowserElement;

    async fn navigate(&self, url: &str) -> Result<bool, AppError> {
        match tokio::time::timeout(self.nav_timeout, self.page.goto(url)).await {
            Err(_) => Err(AppError::Timeout(self.nav_timeout.as_secs())),
            Ok(Err(e)) => Err(browser_error(&format!("Navigation to {url} failed"), e)),
            Ok(Ok(_)) => Ok(true),
        }
    }

    async fn wait_for_any(&self, selectors: &[&str], timeout: Duration) -> Result<bool, AppError> {
        let deadline = Instant::now() + timeout;
        loop {
            for selector in selectors {
                if let Ok(found) = self.page.find_elements(*selector).await
                    && !found.is_empty()
                {
                    tracing::debug!(selector, "Ready marker present");
                    return Ok(true);
                }
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    async fn snapshot_source(&self) -> Result<String, AppError> {
        self.page
            .content()
            .await
            .map_err(|e| AppError::SnapshotError(e.to_string()))
    }

    async fn query_live(&self, selector: &str) -> Result<Option<BrowserElement>, AppError> {
        Ok(self.query_live_all(selector).await?.into_iter().next())
    }

    async fn query_live_all(&self, selector: &str) -> Result<Vec<BrowserElement>, AppError> {
        let found = self
            .page
            .find_elements(selector)
            .await
            .map_err(|e| browser_error(selector, e))?;
        Ok(found.into_iter().map(|e| self.wrap(e)).collect())
    }

    async fn current_url(&self) -> Result<String, AppError> {
        self.page
            .url()
            .await
            .map_err(|e| browser_error("url", e))?
            .ok_or_else(|| AppError::BrowserError("page has no url".into()))
    }

    async fn release(self) -> Result<(), AppError> {
        self.page
            .close()
            .await
            .map_err(|e| browser_error("Failed to close tab", e))
    }
}

/// A node in a live tab.
pub struct BrowserElement {
    element: Element,
    page: Page,
    marks: Arc<AtomicU64>,
}

impl LiveElement for BrowserElement {
    async fn text(&self) -> Result<String, AppError> {
        let text = self
            .element
            .inner_text()
            .await
            .map_err(|e| AppError::StaleElement(e.to_string()))?;
        Ok(text.unwrap_or_default())
    }

    async fn attribute(&self, name: &str) -> Result<Option<String>, AppError> {
        self.element
            .attribute(name)
            .await
            .map_err(|e| AppError::StaleElement(e.to_string()))
    }

    async fn query_all(&self, selector: &str) -> Result<Vec<Self>, AppError> {
        let found = self
            .element
            .find_elements(selector)
            .await
            .map_err(|e| AppError::StaleElement(e.to_string()))?;
        Ok(found
            .into_iter()
            .map(|element| BrowserElement {
                element,
                page: self.page.clone(),
                marks: Arc::clone(&self.marks),
            })
            .collect())
    }

    async fn parent(&self) -> Result<Option<Self>, AppError> {
        let token = format!("q{}", self.marks.fetch_add(1, Ordering::Relaxed));
        let declaration = format!(
            "function() {{ return ({MARK_PARENT_JS}).call(this, {}); }}",
            serde_json::Value::String(token)
        );
        let returned = self
            .element
            .call_js_fn(declaration, false)
            .await
            .map_err(|e| AppError::StaleElement(e.to_string()))?;
        let Some(mark) = returned.result.value.as_ref().and_then(|v| v.as_str()) else {
            return Ok(None);
        };
        let selector = format!("[data-quarry-node=\"{mark}\"]");
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|e| AppError::StaleElement(e.to_string()))?;
        Ok(Some(BrowserElement {
            element,
            page: self.page.clone(),
            marks: Arc::clone(&self.marks),
        }))
    }

    async fn outer_html(&self) -> Result<String, AppError> {
        let html = self
            .element
            .outer_html()
            .await
            .map_err(|e| AppError::StaleElement(e.to_string()))?;
        Ok(html.unwrap_or_default())
    }
}
