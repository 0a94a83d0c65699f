//! Element capability interface shared by the snapshot and the live page.
//!
//! Extractors and section locators are written once against
//! [`NodeSource`] / [`ElementHandle`]. Two adapters satisfy them:
//! [`crate::dom::DomSnapshot`] (cheap, no I/O) and [`LiveSource`], which
//! forwards to the task's [`PageSource`] with every call serialized
//! through one lock and bounded by a timeout.

use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::error::AppError;
use crate::traits::{LiveElement, PageSource};

/// Where a value was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Snapshot,
    Live,
}

/// Read access to one element, independent of where it lives.
pub trait ElementHandle: Sized {
    fn text(&self) -> impl Future<Output = Result<String, AppError>>;

    fn attribute(&self, name: &str) -> impl Future<Output = Result<Option<String>, AppError>>;

    /// Descendants matching `selector`, in document order.
    fn children(&self, selector: &str) -> impl Future<Output = Result<Vec<Self>, AppError>>;

    fn parent(&self) -> impl Future<Output = Result<Option<Self>, AppError>>;

    fn outer_html(&self) -> impl Future<Output = Result<String, AppError>>;
}

/// A queryable document.
pub trait NodeSource {
    type Node<'a>: ElementHandle
    where
        Self: 'a;

    fn tier(&self) -> Tier;

    fn select_all<'a>(
        &'a self,
        selector: &str,
    ) -> impl Future<Output = Result<Vec<Self::Node<'a>>, AppError>>;

    fn select_one<'a>(
        &'a self,
        selector: &str,
    ) -> impl Future<Output = Result<Option<Self::Node<'a>>, AppError>> {
        async move { Ok(self.select_all(selector).await?.into_iter().next()) }
    }

    fn page_url(&self) -> impl Future<Output = Result<String, AppError>>;
}

// ---------------------------------------------------------------------------
// Live adapter
// ---------------------------------------------------------------------------

/// Live-page view used for fallbacks.
///
/// Owns the lock that serializes every access to the page handle.
pub struct LiveSource<'p, P> {
    page: &'p P,
    gate: Mutex<()>,
    timeout: Duration,
}

impl<'p, P: PageSource> LiveSource<'p, P> {
    pub fn new(page: &'p P, timeout: Duration) -> Self {
        Self {
            page,
            gate: Mutex::new(()),
            timeout,
        }
    }
}

/// Live element bound to its page's lock.
pub struct LiveNode<'g, E> {
    inner: E,
    gate: &'g Mutex<()>,
    timeout: Duration,
}

impl<E> std::fmt::Debug for LiveNode<'_, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveNode")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

async fn guarded<T>(
    gate: &Mutex<()>,
    timeout: Duration,
    call: impl Future<Output = Result<T, AppError>>,
) -> Result<T, AppError> {
    let _guard = gate.lock().await;
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Timeout(timeout.as_secs())),
    }
}

impl<'g, E: LiveElement> LiveNode<'g, E> {
    fn wrap(&self, inner: E) -> Self {
        LiveNode {
            inner,
            gate: self.gate,
            timeout: self.timeout,
        }
    }
}

impl<E: LiveElement> ElementHandle for LiveNode<'_, E> {
    async fn text(&self) -> Result<String, AppError> {
        guarded(self.gate, self.timeout, self.inner.text()).await
    }

    async fn attribute(&self, name: &str) -> Result<Option<String>, AppError> {
        guarded(self.gate, self.timeout, self.inner.attribute(name)).await
    }

    async fn children(&self, selector: &str) -> Result<Vec<Self>, AppError> {
        let found = guarded(self.gate, self.timeout, self.inner.query_all(selector)).await?;
        Ok(found.into_iter().map(|e| self.wrap(e)).collect())
    }

    async fn parent(&self) -> Result<Option<Self>, AppError> {
        let parent = guarded(self.gate, self.timeout, self.inner.parent()).await?;
        Ok(parent.map(|e| self.wrap(e)))
    }

    async fn outer_html(&self) -> Result<String, AppError> {
        guarded(self.gate, self.timeout, self.inner.outer_html()).await
    }
}

impl<P: PageSource> NodeSource for LiveSource<'_, P> {
    type Node<'a>
        = LiveNode<'a, P::Element>
    where
        Self: 'a;

    fn tier(&self) -> Tier {
        Tier::Live
    }

    async fn select_all<'a>(
        &'a self,
        selector: &str,
    ) -> Result<Vec<LiveNode<'a, P::Element>>, AppError> {
        let found = guarded(&self.gate, self.timeout, self.page.query_live_all(selector)).await?;
        Ok(found
            .into_iter()
            .map(|inner| LiveNode {
                inner,
                gate: &self.gate,
                timeout: self.timeout,
            })
            .collect())
    }

    async fn select_one<'a>(
        &'a self,
        selector: &str,
    ) -> Result<Option<LiveNode<'a, P::Element>>, AppError> {
        let found = guarded(&self.gate, self.timeout, self.page.query_live(selector)).await?;
        Ok(found.map(|inner| LiveNode {
            inner,
            gate: &self.gate,
            timeout: self.timeout,
        }))
    }

    async fn page_url(&self) -> Result<String, AppError> {
        guarded(&self.gate, self.timeout, self.page.current_url()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockElement, MockPage};

    #[tokio::test]
    async fn live_source_forwards_queries() {
        let page = MockPage::new("<html></html>").with_live(
            "#productTitle",
            vec![MockElement::new("  Live Title ").with_attr("data-x", "1")],
        );
        let live = LiveSource::new(&page, Duration::from_secs(1));

        assert_eq!(live.tier(), Tier::Live);
        let node = live.select_one("#productTitle").await.unwrap().unwrap();
        assert_eq!(node.text().await.unwrap(), "  Live Title ");
        assert_eq!(node.attribute("data-x").await.unwrap().as_deref(), Some("1"));
        assert!(live.select_one("#missing").await.unwrap().is_none());
        assert_eq!(page.live_query_count(), 2);
    }

    #[tokio::test]
    async fn live_children_and_parent_stay_on_the_same_lock() {
        let child = MockElement::new("inner").with_attr("src", "https://a/b.jpg");
        let parent = MockElement::new("outer").with_attr("id", "carousel-1");
        let page = MockPage::new("<html></html>").with_live(
            "#box",
            vec![
                MockElement::new("box")
                    .with_children("img", vec![child.with_parent(parent)])
                    .with_attr("id", "box"),
            ],
        );
        let live = LiveSource::new(&page, Duration::from_secs(1));
        let node = live.select_one("#box").await.unwrap().unwrap();
        let imgs = node.children("img").await.unwrap();
        assert_eq!(imgs.len(), 1);
        let up = imgs[0].parent().await.unwrap().unwrap();
        assert_eq!(up.attribute("id").await.unwrap().as_deref(), Some("carousel-1"));
    }

    #[tokio::test]
    async fn live_errors_surface_to_caller() {
        let page = MockPage::new("<html></html>").with_live_error(AppError::StaleElement("gone".into()));
        let live = LiveSource::new(&page, Duration::from_secs(1));
        let err = live.select_all("#productTitle").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
