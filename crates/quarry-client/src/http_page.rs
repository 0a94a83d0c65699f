//! Static page source over plain HTTP.
//!
//! The fetched markup is the snapshot. There is no live document, so
//! live queries always come back empty and extraction runs on the
//! snapshot tier alone.

use std::time::Duration;

use quarry_core::error::AppError;
use quarry_core::traits::{LiveElement, PageSource, PageSourceProvider};
use reqwest::Client;
use scraper::{Html, Selector};
use tokio::sync::Mutex;

use crate::net::{USER_AGENT, request_error, validate_url};

/// Opens [`HttpPage`]s sharing one connection pool.
#[derive(Clone)]
pub struct HttpPageProvider {
    client: Client,
    timeout_secs: u64,
    ssrf_protection: bool,
}

impl HttpPageProvider {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;
        Ok(Self {
            client,
            timeout_secs: timeout.as_secs(),
            ssrf_protection: true,
        })
    }

    /// Allow private and loopback addresses. For local use only.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }
}

impl PageSourceProvider for HttpPageProvider {
    type Page = HttpPage;

    async fn open(&self) -> Result<HttpPage, AppError> {
        Ok(HttpPage {
            provider: self.clone(),
            loaded: Mutex::new(None),
        })
    }
}

struct Loaded {
    url: String,
    markup: String,
}

pub struct HttpPage {
    provider: HttpPageProvider,
    loaded: Mutex<Option<Loaded>>,
}

/// Element type of a page with no live document; never constructed.
pub enum NoElement {}

impl LiveElement for NoElement {
    async fn text(&self) -> Result<String, AppError> {
        match *self {}
    }

    async fn attribute(&self, _name: &str) -> Result<Option<String>, AppError> {
        match *self {}
    }

    async fn query_all(&self, _selector: &str) -> Result<Vec<Self>, AppError> {
        match *self {}
    }

    async fn parent(&self) -> Result<Option<Self>, AppError> {
        match *self {}
    }

    async fn outer_html(&self) -> Result<String, AppError> {
        match *self {}
    }
}

fn any_selector_present(markup: &str, selectors: &[&str]) -> bool {
    let html = Html::parse_document(markup);
    selectors
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .any(|s| html.select(&s).next().is_some())
}

impl PageSource for HttpPage {
    type Element = NoElement;

    /// Fetch `url`. A non-success status is a refused load, not an error.
    async fn navigate(&self, url: &str) -> Result<bool, AppError> {
        let provider = &self.provider;
        if provider.ssrf_protection {
            validate_url(url).await?;
        }

        let response = provider
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| request_error(e, provider.timeout_secs))?;
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(%url, status = status.as_u16(), "Page request refused");
            return Ok(false);
        }

        let final_url = response.url().to_string();
        let markup = response
            .text()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to read response body: {e}")))?;
        tracing::debug!(%url, bytes = markup.len(), "Page fetched");
        *self.loaded.lock().await = Some(Loaded {
            url: final_url,
            markup,
        });
        Ok(true)
    }

    async fn wait_for_any(&self, selectors: &[&str], _timeout: Duration) -> Result<bool, AppError> {
        let loaded = self.loaded.lock().await;
        Ok(loaded
            .as_ref()
            .is_some_and(|l| any_selector_present(&l.markup, selectors)))
    }

    async fn snapshot_source(&self) -> Result<String, AppError> {
        self.loaded
            .lock()
            .await
            .as_ref()
            .map(|l| l.markup.clone())
            .ok_or_else(|| AppError::SnapshotError("no page loaded".into()))
    }

    async fn query_live(&self, _selector: &str) -> Result<Option<NoElement>, AppError> {
        Ok(None)
    }

    async fn query_live_all(&self, _selector: &str) -> Result<Vec<NoElement>, AppError> {
        Ok(Vec::new())
    }

    async fn current_url(&self) -> Result<String, AppError> {
        self.loaded
            .lock()
            .await
            .as_ref()
            .map(|l| l.url.clone())
            .ok_or_else(|| AppError::SnapshotError("no page loaded".into()))
    }

    async fn release(self) -> Result<(), AppError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::serve;

    const PAGE: &str = r#"<html><body><span id="productTitle">Kettle</span></body></html>"#;

    fn provider() -> HttpPageProvider {
        HttpPageProvider::with_timeout(Duration::from_secs(5))
            .unwrap()
            .allow_private_urls()
    }

    #[tokio::test]
    async fn fetched_markup_becomes_snapshot() {
        let base = serve(200, "text/html", PAGE.as_bytes().to_vec()).await;
        let page = provider().open().await.unwrap();
        let url = format!("{base}/dp/B0TEST0001");

        assert!(page.navigate(&url).await.unwrap());
        assert!(page.wait_for_any(&["#dp-container", "#productTitle"], Duration::ZERO).await.unwrap());
        assert!(!page.wait_for_any(&["#ppd"], Duration::ZERO).await.unwrap());
        assert_eq!(page.snapshot_source().await.unwrap(), PAGE);
        assert_eq!(page.current_url().await.unwrap(), url);
        assert!(page.query_live("#productTitle").await.unwrap().is_none());
        page.release().await.unwrap();
    }

    #[tokio::test]
    async fn error_status_is_a_refused_load() {
        let base = serve(503, "text/html", b"busy".to_vec()).await;
        let page = provider().open().await.unwrap();
        assert!(!page.navigate(&base).await.unwrap());
        assert!(matches!(
            page.snapshot_source().await,
            Err(AppError::SnapshotError(_))
        ));
    }

    #[tokio::test]
    async fn private_targets_blocked_by_default() {
        let page = HttpPageProvider::new().unwrap().open().await.unwrap();
        let err = page.navigate("http://127.0.0.1:9/dp/X").await.unwrap_err();
        assert!(matches!(err, AppError::HttpError(_)));
    }
}
