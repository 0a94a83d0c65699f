use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use uuid::Uuid;

use crate::config::TaskConfig;
use crate::error::AppError;
use crate::models::ResultEnvelope;
use crate::task::{TaskRecord, TaskUpdate};

/// Hands out one live page per task.
pub trait PageSourceProvider: Send + Sync {
    type Page: PageSource;

    fn open(&self) -> impl Future<Output = Result<Self::Page, AppError>> + Send;
}

/// A live, navigable page owned by exactly one task.
///
/// `release` consumes the page; the orchestrator calls it once per task
/// whatever state the task ends in.
pub trait PageSource: Send + Sync {
    type Element: LiveElement;

    /// Navigate to `url`. `Ok(false)` means the page refused to load.
    fn navigate(&self, url: &str) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Wait until any of `selectors` is present, or `timeout` elapses.
    fn wait_for_any(
        &self,
        selectors: &[&str],
        timeout: Duration,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Full rendered markup of the current document.
    fn snapshot_source(&self) -> impl Future<Output = Result<String, AppError>> + Send;

    fn query_live(
        &self,
        selector: &str,
    ) -> impl Future<Output = Result<Option<Self::Element>, AppError>> + Send;

    fn query_live_all(
        &self,
        selector: &str,
    ) -> impl Future<Output = Result<Vec<Self::Element>, AppError>> + Send;

    fn current_url(&self) -> impl Future<Output = Result<String, AppError>> + Send;

    fn release(self) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// An element of the live document.
pub trait LiveElement: Send + Sync + Sized {
    fn text(&self) -> impl Future<Output = Result<String, AppError>> + Send;

    fn attribute(&self, name: &str)
    -> impl Future<Output = Result<Option<String>, AppError>> + Send;

    /// Descendants matching `selector`, in document order.
    fn query_all(&self, selector: &str) -> impl Future<Output = Result<Vec<Self>, AppError>> + Send;

    fn parent(&self) -> impl Future<Output = Result<Option<Self>, AppError>> + Send;

    fn outer_html(&self) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Bytes and declared type of a downloaded asset.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Downloads asset bytes.
pub trait ImageSource: Send + Sync {
    /// Download `url`, aborting with [`AppError::PayloadTooLarge`] as soon as
    /// more than `max_bytes` have been received.
    fn fetch(
        &self,
        url: &str,
        max_bytes: u64,
    ) -> impl Future<Output = Result<FetchedImage, AppError>> + Send;
}

/// Turns a finished envelope into a document on disk.
pub trait ReportSink: Send + Sync {
    /// Returns the path of the written report.
    fn generate(
        &self,
        envelope: &ResultEnvelope,
        asset_paths: &[PathBuf],
        output_dir: &Path,
    ) -> impl Future<Output = Result<PathBuf, AppError>> + Send;
}

/// Persists task status and history.
pub trait TaskStore: Send + Sync {
    fn create_task(
        &self,
        url: &str,
        config: &TaskConfig,
    ) -> impl Future<Output = Result<Uuid, AppError>> + Send;

    fn update_task(
        &self,
        id: Uuid,
        update: &TaskUpdate,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_task(&self, id: Uuid)
    -> impl Future<Output = Result<Option<TaskRecord>, AppError>> + Send;
}

/// A no-op TaskStore for use when persistence is not needed.
#[derive(Debug, Clone)]
pub struct NullTaskStore;

impl TaskStore for NullTaskStore {
    async fn create_task(&self, _url: &str, _config: &TaskConfig) -> Result<Uuid, AppError> {
        Ok(Uuid::new_v4())
    }

    async fn update_task(&self, _id: Uuid, _update: &TaskUpdate) -> Result<(), AppError> {
        Ok(())
    }

    async fn get_task(&self, _id: Uuid) -> Result<Option<TaskRecord>, AppError> {
        Ok(None)
    }
}
