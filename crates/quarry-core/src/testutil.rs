//! Test utilities: mock implementations of the collaborator traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` (or atomics) for interior mutability,
//! allowing test assertions on recorded calls.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::config::TaskConfig;
use crate::error::AppError;
use crate::models::ResultEnvelope;
use crate::task::{TaskRecord, TaskStatus, TaskUpdate};
use crate::traits::{
    FetchedImage, ImageSource, LiveElement, PageSource, PageSourceProvider, ReportSink, TaskStore,
};

/// Rebuild an equivalent error; `AppError` is not `Clone`.
pub fn replicate_error(e: &AppError) -> AppError {
    match e {
        AppError::HttpError(m) => AppError::HttpError(m.clone()),
        AppError::NetworkError(m) => AppError::NetworkError(m.clone()),
        AppError::Timeout(s) => AppError::Timeout(*s),
        AppError::BrowserError(m) => AppError::BrowserError(m.clone()),
        AppError::StaleElement(m) => AppError::StaleElement(m.clone()),
        AppError::SnapshotError(m) => AppError::SnapshotError(m.clone()),
        AppError::SelectorError(m) => AppError::SelectorError(m.clone()),
        AppError::ImageRejected(m) => AppError::ImageRejected(m.clone()),
        AppError::PayloadTooLarge { limit } => AppError::PayloadTooLarge { limit: *limit },
        AppError::IoError(io) => AppError::IoError(std::io::Error::new(io.kind(), io.to_string())),
        AppError::SerializationError(s) => AppError::Generic(s.to_string()),
        AppError::DatabaseError(m) => AppError::DatabaseError(m.clone()),
        AppError::ConfigError(m) => AppError::ConfigError(m.clone()),
        AppError::Cancelled => AppError::Cancelled,
        AppError::Generic(m) => AppError::Generic(m.clone()),
    }
}

// ---------------------------------------------------------------------------
// MockElement
// ---------------------------------------------------------------------------

/// A live element with canned text, attributes, children and parent.
#[derive(Debug, Clone, Default)]
pub struct MockElement {
    text: String,
    attrs: HashMap<String, String>,
    children: HashMap<String, Vec<MockElement>>,
    parent: Option<Box<MockElement>>,
}

impl MockElement {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_children(mut self, selector: &str, children: Vec<MockElement>) -> Self {
        self.children.insert(selector.to_string(), children);
        self
    }

    pub fn with_parent(mut self, parent: MockElement) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }
}

impl LiveElement for MockElement {
    async fn text(&self) -> Result<String, AppError> {
        Ok(self.text.clone())
    }

    async fn attribute(&self, name: &str) -> Result<Option<String>, AppError> {
        Ok(self.attrs.get(name).cloned())
    }

    async fn query_all(&self, selector: &str) -> Result<Vec<Self>, AppError> {
        Ok(self.children.get(selector).cloned().unwrap_or_default())
    }

    async fn parent(&self) -> Result<Option<Self>, AppError> {
        Ok(self.parent.as_deref().cloned())
    }

    async fn outer_html(&self) -> Result<String, AppError> {
        Ok(format!("<mock>{}</mock>", self.text))
    }
}

// ---------------------------------------------------------------------------
// MockPage / MockPageProvider
// ---------------------------------------------------------------------------

/// Lifecycle step at which a [`MockPage`] misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// `navigate` errors with a network error.
    Navigate,
    /// `navigate` returns `Ok(false)`.
    NavigateRefused,
    /// No ready marker ever appears.
    NeverReady,
    /// `snapshot_source` errors.
    Snapshot,
    /// `snapshot_source` returns blank markup.
    EmptySnapshot,
}

/// A scripted page. Clones share their call counters.
#[derive(Clone)]
pub struct MockPage {
    html: String,
    url: String,
    live: Arc<HashMap<String, Vec<MockElement>>>,
    live_error: Option<Arc<AppError>>,
    fail_at: Option<FailPoint>,
    navigate_delay: Duration,
    calls: Arc<Mutex<Vec<String>>>,
    releases: Arc<AtomicUsize>,
    live_queries: Arc<AtomicUsize>,
}

pub const MOCK_PAGE_URL: &str = "https://www.amazon.com/dp/B0TEST0001";

impl MockPage {
    pub fn new(html: &str) -> Self {
        Self {
            html: html.to_string(),
            url: MOCK_PAGE_URL.to_string(),
            live: Arc::new(HashMap::new()),
            live_error: None,
            fail_at: None,
            navigate_delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
            releases: Arc::new(AtomicUsize::new(0)),
            live_queries: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_url(mut self, url: &str) -> Self {
        self.url = url.to_string();
        self
    }

    pub fn with_live(mut self, selector: &str, elements: Vec<MockElement>) -> Self {
        Arc::make_mut(&mut self.live).insert(selector.to_string(), elements);
        self
    }

    /// Every live query fails with a copy of `error`.
    pub fn with_live_error(mut self, error: AppError) -> Self {
        self.live_error = Some(Arc::new(error));
        self
    }

    pub fn failing_at(mut self, point: FailPoint) -> Self {
        self.fail_at = Some(point);
        self
    }

    pub fn with_navigate_delay(mut self, delay: Duration) -> Self {
        self.navigate_delay = delay;
        self
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn live_query_count(&self) -> usize {
        self.live_queries.load(Ordering::SeqCst)
    }

    /// Lifecycle calls in order (`navigate`, `wait`, `snapshot`, `release`).
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    fn live_lookup(&self, selector: &str) -> Result<Vec<MockElement>, AppError> {
        self.live_queries.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = &self.live_error {
            return Err(replicate_error(e));
        }
        Ok(self.live.get(selector).cloned().unwrap_or_default())
    }
}

impl PageSource for MockPage {
    type Element = MockElement;

    async fn navigate(&self, url: &str) -> Result<bool, AppError> {
        self.record("navigate");
        if !self.navigate_delay.is_zero() {
            tokio::time::sleep(self.navigate_delay).await;
        }
        match self.fail_at {
            Some(FailPoint::Navigate) => Err(AppError::NetworkError(format!("unreachable: {url}"))),
            Some(FailPoint::NavigateRefused) => Ok(false),
            _ => Ok(true),
        }
    }

    async fn wait_for_any(&self, _selectors: &[&str], _timeout: Duration) -> Result<bool, AppError> {
        self.record("wait");
        Ok(self.fail_at != Some(FailPoint::NeverReady))
    }

    async fn snapshot_source(&self) -> Result<String, AppError> {
        self.record("snapshot");
        match self.fail_at {
            Some(FailPoint::Snapshot) => Err(AppError::SnapshotError("tab crashed".into())),
            Some(FailPoint::EmptySnapshot) => Ok("   ".into()),
            _ => Ok(self.html.clone()),
        }
    }

    async fn query_live(&self, selector: &str) -> Result<Option<MockElement>, AppError> {
        Ok(self.live_lookup(selector)?.into_iter().next())
    }

    async fn query_live_all(&self, selector: &str) -> Result<Vec<MockElement>, AppError> {
        self.live_lookup(selector)
    }

    async fn current_url(&self) -> Result<String, AppError> {
        Ok(self.url.clone())
    }

    async fn release(self) -> Result<(), AppError> {
        self.record("release");
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out clones of one scripted page.
#[derive(Clone)]
pub struct MockPageProvider {
    page: MockPage,
    open_error: Arc<Mutex<Option<AppError>>>,
    opened: Arc<AtomicUsize>,
}

impl MockPageProvider {
    pub fn new(page: MockPage) -> Self {
        Self {
            page,
            open_error: Arc::new(Mutex::new(None)),
            opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The next `open` fails with `error`.
    pub fn with_open_error(self, error: AppError) -> Self {
        *self.open_error.lock().unwrap() = Some(error);
        self
    }

    pub fn page(&self) -> &MockPage {
        &self.page
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl PageSourceProvider for MockPageProvider {
    type Page = MockPage;

    async fn open(&self) -> Result<MockPage, AppError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.open_error.lock().unwrap().take() {
            return Err(e);
        }
        Ok(self.page.clone())
    }
}

// ---------------------------------------------------------------------------
// Image fixtures and MockImageSource
// ---------------------------------------------------------------------------

/// A noisy RGB PNG; different seeds give different bytes.
pub fn png_bytes(width: u32, height: u32, seed: u64) -> Vec<u8> {
    let mut x = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    let img = image::RgbImage::from_fn(width, height, |_, _| {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        let b = x.to_le_bytes();
        image::Rgb([b[0], b[1], b[2]])
    });
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

pub fn fetched_png(width: u32, height: u32, seed: u64) -> FetchedImage {
    FetchedImage {
        content_type: Some("image/png".into()),
        bytes: png_bytes(width, height, seed),
    }
}

/// Seed derived from a URL so unconfigured URLs get distinct content.
fn url_seed(url: &str) -> u64 {
    url.bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ b as u64).wrapping_mul(0x100_0000_01b3))
}

/// Image source with per-URL scripted responses.
///
/// URLs without a script (or whose script ran out) get a distinct 64x64
/// PNG derived from the URL.
#[derive(Clone, Default)]
pub struct MockImageSource {
    responses: Arc<Mutex<HashMap<String, Vec<Result<FetchedImage, AppError>>>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockImageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, url: &str, response: Result<FetchedImage, AppError>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push(response);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl ImageSource for MockImageSource {
    async fn fetch(&self, url: &str, max_bytes: u64) -> Result<FetchedImage, AppError> {
        self.calls.lock().unwrap().push(url.to_string());
        let scripted = {
            let mut responses = self.responses.lock().unwrap();
            responses
                .get_mut(url)
                .filter(|queue| !queue.is_empty())
                .map(|queue| queue.remove(0))
        };
        let fetched = match scripted {
            Some(response) => response?,
            None => fetched_png(64, 64, url_seed(url)),
        };
        if fetched.bytes.len() as u64 > max_bytes {
            return Err(AppError::PayloadTooLarge { limit: max_bytes });
        }
        Ok(fetched)
    }
}

// ---------------------------------------------------------------------------
// MockReportSink
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReportCall {
    pub url: String,
    pub asset_paths: Vec<PathBuf>,
    pub output_dir: PathBuf,
}

/// Records `generate` calls without writing anything.
#[derive(Clone, Default)]
pub struct MockReportSink {
    calls: Arc<Mutex<Vec<ReportCall>>>,
    error: Arc<Mutex<Option<AppError>>>,
}

impl MockReportSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error(error: AppError) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            error: Arc::new(Mutex::new(Some(error))),
        }
    }

    pub fn calls(&self) -> Vec<ReportCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl ReportSink for MockReportSink {
    async fn generate(
        &self,
        envelope: &ResultEnvelope,
        asset_paths: &[PathBuf],
        output_dir: &Path,
    ) -> Result<PathBuf, AppError> {
        self.calls.lock().unwrap().push(ReportCall {
            url: envelope.url.clone(),
            asset_paths: asset_paths.to_vec(),
            output_dir: output_dir.to_path_buf(),
        });
        if let Some(e) = self.error.lock().unwrap().take() {
            return Err(e);
        }
        Ok(output_dir.join("report.md"))
    }
}

// ---------------------------------------------------------------------------
// MockTaskStore
// ---------------------------------------------------------------------------

/// In-memory task store recording every update.
#[derive(Clone, Default)]
pub struct MockTaskStore {
    tasks: Arc<Mutex<HashMap<Uuid, TaskRecord>>>,
    updates: Arc<Mutex<Vec<(Uuid, TaskUpdate)>>>,
}

impl MockTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<(Uuid, TaskUpdate)> {
        self.updates.lock().unwrap().clone()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn record(&self, id: Uuid) -> Option<TaskRecord> {
        self.tasks.lock().unwrap().get(&id).cloned()
    }
}

impl TaskStore for MockTaskStore {
    async fn create_task(&self, url: &str, config: &TaskConfig) -> Result<Uuid, AppError> {
        let id = Uuid::new_v4();
        let record = TaskRecord {
            id,
            url: url.to_string(),
            product_name: None,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            result_summary: None,
            error_message: None,
            config: serde_json::to_value(config)?,
        };
        self.tasks.lock().unwrap().insert(id, record);
        Ok(id)
    }

    async fn update_task(&self, id: Uuid, update: &TaskUpdate) -> Result<(), AppError> {
        self.updates.lock().unwrap().push((id, update.clone()));
        let mut tasks = self.tasks.lock().unwrap();
        let record = tasks
            .get_mut(&id)
            .ok_or_else(|| AppError::DatabaseError(format!("no task {id}")))?;
        if let Some(status) = update.status {
            record.status = status;
            if status.is_terminal() {
                record.completed_at = Some(Utc::now());
            }
        }
        if let Some(name) = &update.product_name {
            record.product_name = Some(name.clone());
        }
        if let Some(summary) = &update.result_summary {
            record.result_summary = Some(summary.clone());
        }
        if let Some(error) = &update.error {
            record.error_message = Some(error.clone());
        }
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>, AppError> {
        Ok(self.tasks.lock().unwrap().get(&id).cloned())
    }
}
