//! The per-task DOM snapshot.
//!
//! A [`DomSnapshot`] is parsed once from the markup the page source hands
//! over after navigation and is never mutated afterwards. Every extractor
//! of a task reads the same instance through the [`NodeSource`] interface,
//! so results are a pure function of the snapshot and the extractor.
//!
//! `scraper::Html` is not `Sync`; the snapshot is shared by reference
//! between futures polled on the task's own executor, never across threads.

use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};

use crate::element::{ElementHandle, NodeSource, Tier};
use crate::error::AppError;
use crate::util::clean_text;

/// Elements whose text never renders.
const HIDDEN_TEXT: [&str; 3] = ["script", "style", "noscript"];

/// Immutable parsed markup of one page load.
pub struct DomSnapshot {
    html: Html,
    url: String,
    captured_at: DateTime<Utc>,
}

impl DomSnapshot {
    /// Parse rendered markup captured from `url`.
    pub fn parse(markup: &str, url: impl Into<String>) -> Result<Self, AppError> {
        if markup.trim().is_empty() {
            return Err(AppError::SnapshotError("page returned empty markup".into()));
        }
        Ok(Self {
            html: Html::parse_document(markup),
            url: url.into(),
            captured_at: Utc::now(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Number of elements in the document.
    pub fn element_count(&self) -> usize {
        self.html
            .root_element()
            .descendants()
            .filter(|n| n.value().is_element())
            .count()
    }
}

impl std::fmt::Debug for DomSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomSnapshot")
            .field("url", &self.url)
            .field("captured_at", &self.captured_at)
            .finish_non_exhaustive()
    }
}

pub(crate) fn parse_selector(selector: &str) -> Result<Selector, AppError> {
    Selector::parse(selector).map_err(|_| AppError::SelectorError(selector.to_string()))
}

/// Snapshot-backed element.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotNode<'a> {
    el: ElementRef<'a>,
}

impl SnapshotNode<'_> {
    /// Rendered text: text nodes joined by a space, skipping anything
    /// under `script`, `style` or `noscript`.
    fn visible_text(&self) -> String {
        let root = self.el.id();
        let pieces: Vec<&str> = self
            .el
            .descendants()
            .filter_map(|node| {
                let text = node.value().as_text()?;
                let hidden = node
                    .ancestors()
                    .take_while(|a| a.id() != root)
                    .chain(std::iter::once(*self.el))
                    .filter_map(|a| a.value().as_element())
                    .any(|e| HIDDEN_TEXT.iter().any(|h| *h == e.name()));
                (!hidden).then_some(&**text)
            })
            .collect();
        clean_text(&pieces.join(" "))
    }
}

impl ElementHandle for SnapshotNode<'_> {
    async fn text(&self) -> Result<String, AppError> {
        Ok(self.visible_text())
    }

    async fn attribute(&self, name: &str) -> Result<Option<String>, AppError> {
        Ok(self.el.value().attr(name).map(str::to_string))
    }

    async fn children(&self, selector: &str) -> Result<Vec<Self>, AppError> {
        let selector = parse_selector(selector)?;
        Ok(self.el.select(&selector).map(|el| SnapshotNode { el }).collect())
    }

    async fn parent(&self) -> Result<Option<Self>, AppError> {
        Ok(self
            .el
            .parent()
            .and_then(ElementRef::wrap)
            .map(|el| SnapshotNode { el }))
    }

    async fn outer_html(&self) -> Result<String, AppError> {
        Ok(self.el.html())
    }
}

impl NodeSource for DomSnapshot {
    type Node<'a> = SnapshotNode<'a>;

    fn tier(&self) -> Tier {
        Tier::Snapshot
    }

    async fn select_all<'a>(&'a self, selector: &str) -> Result<Vec<SnapshotNode<'a>>, AppError> {
        let selector = parse_selector(selector)?;
        Ok(self
            .html
            .select(&selector)
            .map(|el| SnapshotNode { el })
            .collect())
    }

    async fn page_url(&self) -> Result<String, AppError> {
        Ok(self.url.clone())
    }
}
