//! Content-addressed asset acquisition.
//!
//! [`ContentStore::acquire`] turns a URL into a validated file on disk at
//! most once per distinct payload per task. Every failure is local to the
//! asset: nothing is left on disk and no hash is recorded.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use image::ImageFormat;

use crate::config::Tunables;
use crate::error::AppError;
use crate::images::is_excluded_url;
use crate::models::compute_hash;
use crate::retry::RetryPolicy;
use crate::traits::{FetchedImage, ImageSource};

/// Payloads smaller than this are never real product images.
const MIN_PAYLOAD_BYTES: usize = 100;
/// Leading bytes inspected for markup.
const MARKUP_SNIFF_BYTES: usize = 512;

// ---------------------------------------------------------------------------
// Task hash set
// ---------------------------------------------------------------------------

/// Hashes of payloads already saved by one task.
///
/// Check-and-insert happens under one lock, so two concurrent downloads
/// of identical bytes cannot both be written.
#[derive(Debug)]
pub struct TaskHashSet {
    seen: Mutex<HashSet<String>>,
    capacity: usize,
}

/// Result of trying to claim a hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Claimed,
    Duplicate,
    Full,
}

impl TaskHashSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.seen.lock().map(|s| s.contains(hash)).unwrap_or(false)
    }

    pub fn reserve(&self, hash: &str) -> Reservation {
        let Ok(mut seen) = self.seen.lock() else {
            return Reservation::Full;
        };
        if seen.contains(hash) {
            Reservation::Duplicate
        } else if seen.len() >= self.capacity {
            Reservation::Full
        } else {
            seen.insert(hash.to_string());
            Reservation::Claimed
        }
    }

    /// Undo a reservation whose file could not be written.
    pub fn release(&self, hash: &str) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.remove(hash);
        }
    }
}

// ---------------------------------------------------------------------------
// Courtesy delay
// ---------------------------------------------------------------------------

/// Randomized pause after each download, uniform in `[min, max]`.
#[derive(Debug, Clone, Copy)]
pub struct CourtesyDelay {
    pub min: Duration,
    pub max: Duration,
}

impl CourtesyDelay {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    fn effective(&self) -> Duration {
        let spread = (self.max - self.min).as_millis() as u64;
        self.min + Duration::from_millis(rand_jitter_ms(spread + 1))
    }

    pub async fn pause(&self) {
        let delay = self.effective();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

// Xorshift seeded from the clock; good enough for jitter, not crypto.
fn rand_jitter_ms(max_ms: u64) -> u64 {
    if max_ms <= 1 {
        return 0;
    }
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % max_ms
}

// ---------------------------------------------------------------------------
// Content store
// ---------------------------------------------------------------------------

/// What happened to one acquisition.
#[derive(Debug)]
pub enum AcquireOutcome {
    Saved { content_hash: String },
    /// Same bytes already saved by this task; nothing written.
    Duplicate { content_hash: String },
    /// URL matched an exclusion pattern; nothing fetched.
    Excluded,
    Rejected(AppError),
}

impl AcquireOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, AcquireOutcome::Saved { .. })
    }
}

#[derive(Debug, Clone)]
pub struct StoreLimits {
    pub max_bytes: u64,
    pub min_width: u32,
    pub min_height: u32,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            min_width: 50,
            min_height: 50,
        }
    }
}

pub struct ContentStore<I> {
    source: I,
    limits: StoreLimits,
    retry: RetryPolicy,
    delay: CourtesyDelay,
}

impl<I: ImageSource> ContentStore<I> {
    pub fn new(source: I) -> Self {
        Self {
            source,
            limits: StoreLimits::default(),
            retry: RetryPolicy::default(),
            delay: CourtesyDelay::new(Duration::from_millis(100), Duration::from_millis(300)),
        }
    }

    pub fn from_tunables(source: I, tunables: &Tunables) -> Self {
        Self::new(source)
            .with_limits(StoreLimits {
                max_bytes: tunables.max_image_bytes,
                min_width: tunables.min_image_width,
                min_height: tunables.min_image_height,
            })
            .with_retry(RetryPolicy::new(tunables.max_retries, tunables.backoff_base))
            .with_delay(CourtesyDelay::new(tunables.delay_min, tunables.delay_max))
    }

    pub fn with_limits(mut self, limits: StoreLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_delay(mut self, delay: CourtesyDelay) -> Self {
        self.delay = delay;
        self
    }

    pub fn source(&self) -> &I {
        &self.source
    }

    /// Download `url` and save it at `output_path` unless its bytes were
    /// already saved under `hashes`.
    pub async fn acquire(&self, url: &str, output_path: &Path, hashes: &TaskHashSet) -> AcquireOutcome {
        let url = url.trim();
        if url.is_empty() {
            return AcquireOutcome::Rejected(AppError::ImageRejected("empty url".into()));
        }
        if is_excluded_url(url) {
            tracing::debug!(url, "Excluded asset URL, not fetching");
            return AcquireOutcome::Excluded;
        }

        let fetched = self
            .retry
            .run("asset_fetch", || self.source.fetch(url, self.limits.max_bytes))
            .await;
        self.delay.pause().await;

        let outcome = match fetched {
            Ok(fetched) => self.store(url, fetched, output_path, hashes).await,
            Err(e) => AcquireOutcome::Rejected(e),
        };
        match &outcome {
            AcquireOutcome::Saved { .. } => {
                tracing::debug!(url, path = %output_path.display(), "Asset saved");
            }
            AcquireOutcome::Duplicate { .. } => {
                tracing::debug!(url, "Duplicate asset content, skipped");
            }
            AcquireOutcome::Rejected(e) => {
                tracing::warn!(url, error = %e, "Asset rejected");
            }
            AcquireOutcome::Excluded => {}
        }
        outcome
    }

    async fn store(
        &self,
        url: &str,
        fetched: FetchedImage,
        output_path: &Path,
        hashes: &TaskHashSet,
    ) -> AcquireOutcome {
        let format = match self.validate(&fetched) {
            Ok(format) => format,
            Err(e) => return AcquireOutcome::Rejected(e),
        };

        let content_hash = compute_hash(&fetched.bytes);
        if hashes.contains(&content_hash) {
            return AcquireOutcome::Duplicate { content_hash };
        }

        let bytes = match self.check_dimensions(fetched.bytes, format).await {
            Ok(bytes) => bytes,
            Err(e) => return AcquireOutcome::Rejected(e),
        };

        match hashes.reserve(&content_hash) {
            Reservation::Claimed => {}
            Reservation::Duplicate => return AcquireOutcome::Duplicate { content_hash },
            Reservation::Full => {
                return AcquireOutcome::Rejected(AppError::ImageRejected(format!(
                    "hash set full, skipping {url}"
                )));
            }
        }

        if let Err(e) = write_atomically(output_path, &bytes).await {
            hashes.release(&content_hash);
            return AcquireOutcome::Rejected(e);
        }
        AcquireOutcome::Saved { content_hash }
    }

    fn validate(&self, fetched: &FetchedImage) -> Result<ImageFormat, AppError> {
        let content_type = fetched
            .content_type
            .as_deref()
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        if looks_like_markup(&fetched.bytes) || content_type.contains("html") {
            return Err(AppError::HttpError(
                "server returned markup instead of an image".into(),
            ));
        }
        if !content_type.starts_with("image/") {
            return Err(AppError::ImageRejected(format!(
                "not an image content-type: '{content_type}'"
            )));
        }
        if fetched.bytes.len() as u64 > self.limits.max_bytes {
            return Err(AppError::PayloadTooLarge {
                limit: self.limits.max_bytes,
            });
        }
        if fetched.bytes.len() < MIN_PAYLOAD_BYTES {
            return Err(AppError::ImageRejected(format!(
                "payload too small ({} bytes)",
                fetched.bytes.len()
            )));
        }
        sniff_format(&fetched.bytes)
    }

    async fn check_dimensions(&self, bytes: Vec<u8>, format: ImageFormat) -> Result<Vec<u8>, AppError> {
        let (bytes, decoded) = tokio::task::spawn_blocking(move || {
            let dims = image::load_from_memory_with_format(&bytes, format)
                .map(|img| (img.width(), img.height()));
            (bytes, dims)
        })
        .await
        .map_err(|e| AppError::Generic(format!("decode task failed: {e}")))?;

        let (width, height) =
            decoded.map_err(|e| AppError::ImageRejected(format!("undecodable {format:?}: {e}")))?;
        if width < self.limits.min_width || height < self.limits.min_height {
            return Err(AppError::ImageRejected(format!(
                "{width}x{height} below minimum {}x{}",
                self.limits.min_width, self.limits.min_height
            )));
        }
        Ok(bytes)
    }
}

/// True when the payload is an HTML page rather than image bytes.
pub fn looks_like_markup(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(MARKUP_SNIFF_BYTES)];
    let trimmed = head
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|i| &head[i..])
        .unwrap_or(&[]);
    if trimmed.starts_with(b"<") {
        return true;
    }
    let lower = String::from_utf8_lossy(head).to_ascii_lowercase();
    lower.contains("<!doctype") || lower.contains("<html")
}

/// Recognize a supported format by its magic number.
pub fn sniff_format(bytes: &[u8]) -> Result<ImageFormat, AppError> {
    match image::guess_format(bytes) {
        Ok(f @ (ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP | ImageFormat::Gif)) => Ok(f),
        Ok(other) => Err(AppError::ImageRejected(format!("unsupported format {other:?}"))),
        Err(_) => Err(AppError::ImageRejected("unrecognized magic number".into())),
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = partial_path(path);
    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockImageSource, fetched_png, png_bytes};

    fn store(source: MockImageSource) -> ContentStore<MockImageSource> {
        ContentStore::new(source)
            .with_retry(RetryPolicy::new(2, Duration::ZERO))
            .with_delay(CourtesyDelay::none())
    }

    #[tokio::test]
    async fn same_bytes_saved_once() {
        let tmp = tempfile::tempdir().unwrap();
        let source = MockImageSource::new()
            .with_response("https://x/a.jpg", Ok(fetched_png(80, 80, 1)))
            .with_response("https://x/b.jpg", Ok(fetched_png(80, 80, 1)));
        let store = store(source);
        let hashes = TaskHashSet::new(100);

        let first = store
            .acquire("https://x/a.jpg", &tmp.path().join("p1.jpg"), &hashes)
            .await;
        let second = store
            .acquire("https://x/b.jpg", &tmp.path().join("p2.jpg"), &hashes)
            .await;

        assert!(first.is_saved());
        assert!(matches!(second, AcquireOutcome::Duplicate { .. }));
        assert!(tmp.path().join("p1.jpg").exists());
        assert!(!tmp.path().join("p2.jpg").exists());
        assert_eq!(hashes.len(), 1);
    }

    #[tokio::test]
    async fn excluded_url_is_never_fetched() {
        let tmp = tempfile::tempdir().unwrap();
        let source = MockImageSource::new();
        let store = store(source.clone());
        let hashes = TaskHashSet::new(10);

        let outcome = store
            .acquire(
                "https://m.media-amazon.com/images/G/01/360_icon_73x73.png",
                &tmp.path().join("x.jpg"),
                &hashes,
            )
            .await;
        assert!(matches!(outcome, AcquireOutcome::Excluded));
        assert_eq!(source.call_count(), 0);
        assert!(hashes.is_empty());
    }

    #[tokio::test]
    async fn markup_payload_is_a_failed_fetch() {
        let tmp = tempfile::tempdir().unwrap();
        let source = MockImageSource::new().with_response(
            "https://x/a.jpg",
            Ok(FetchedImage {
                content_type: Some("image/jpeg".into()),
                bytes: b"<!DOCTYPE html><html><body>Robot check</body></html>".repeat(4),
            }),
        );
        let outcome = store(source)
            .acquire("https://x/a.jpg", &tmp.path().join("a.jpg"), &TaskHashSet::new(10))
            .await;
        assert!(matches!(outcome, AcquireOutcome::Rejected(AppError::HttpError(_))));
        assert!(!tmp.path().join("a.jpg").exists());
    }

    #[tokio::test]
    async fn rejects_wrong_type_bad_magic_and_tiny_images() {
        let tmp = tempfile::tempdir().unwrap();
        let png = png_bytes(80, 80, 3);
        let source = MockImageSource::new()
            .with_response(
                "https://x/type.jpg",
                Ok(FetchedImage {
                    content_type: Some("application/octet-stream".into()),
                    bytes: png.clone(),
                }),
            )
            .with_response(
                "https://x/magic.jpg",
                Ok(FetchedImage {
                    content_type: Some("image/jpeg".into()),
                    bytes: vec![7u8; 400],
                }),
            )
            .with_response("https://x/tiny.jpg", Ok(fetched_png(20, 20, 4)));
        let store = store(source.clone());
        let hashes = TaskHashSet::new(10);

        let cases = [
            ("https://x/type.jpg", "not an image content-type"),
            ("https://x/magic.jpg", "unrecognized magic number"),
            ("https://x/tiny.jpg", "20x20 below minimum 50x50"),
        ];
        for (url, reason) in cases {
            let outcome = store.acquire(url, &tmp.path().join("out.jpg"), &hashes).await;
            match outcome {
                AcquireOutcome::Rejected(AppError::ImageRejected(msg)) => {
                    assert!(msg.contains(reason), "{url}: {msg}")
                }
                other => panic!("{url}: {other:?}"),
            }
        }
        assert_eq!(source.call_count(), 3);
        assert!(hashes.is_empty());
        assert!(!tmp.path().join("out.jpg").exists());
    }

    #[tokio::test]
    async fn oversized_download_is_rejected_without_file() {
        let tmp = tempfile::tempdir().unwrap();
        let source = MockImageSource::new().with_response("https://x/big.jpg", Ok(fetched_png(200, 200, 5)));
        let store = store(source).with_limits(StoreLimits {
            max_bytes: 1024,
            ..Default::default()
        });
        let outcome = store
            .acquire("https://x/big.jpg", &tmp.path().join("big.jpg"), &TaskHashSet::new(10))
            .await;
        assert!(matches!(
            outcome,
            AcquireOutcome::Rejected(AppError::PayloadTooLarge { limit: 1024 })
        ));
    }

    #[tokio::test]
    async fn transient_fetch_errors_are_retried() {
        let tmp = tempfile::tempdir().unwrap();
        let source = MockImageSource::new()
            .with_response("https://x/a.jpg", Err(AppError::NetworkError("reset".into())))
            .with_response("https://x/a.jpg", Ok(fetched_png(60, 60, 6)));
        let store = store(source.clone());
        let outcome = store
            .acquire("https://x/a.jpg", &tmp.path().join("nested/a.jpg"), &TaskHashSet::new(10))
            .await;
        assert!(outcome.is_saved());
        assert_eq!(source.call_count(), 2);
        assert!(tmp.path().join("nested/a.jpg").exists());
        assert!(!tmp.path().join("nested/a.jpg.part").exists());
    }

    #[tokio::test]
    async fn full_hash_set_rejects_new_content() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(MockImageSource::new());
        let hashes = TaskHashSet::new(1);
        assert!(
            store
                .acquire("https://x/1.jpg", &tmp.path().join("1.jpg"), &hashes)
                .await
                .is_saved()
        );
        let second = store
            .acquire("https://x/2.jpg", &tmp.path().join("2.jpg"), &hashes)
            .await;
        assert!(matches!(second, AcquireOutcome::Rejected(_)));
        assert_eq!(hashes.len(), 1);
    }

    #[test]
    fn reservation_is_exclusive() {
        let hashes = TaskHashSet::new(10);
        assert_eq!(hashes.reserve("abc"), Reservation::Claimed);
        assert_eq!(hashes.reserve("abc"), Reservation::Duplicate);
        hashes.release("abc");
        assert_eq!(hashes.reserve("abc"), Reservation::Claimed);
    }

    #[test]
    fn markup_detection() {
        assert!(looks_like_markup(b"  <html><head>"));
        assert!(looks_like_markup(b"\xff\xd8junk<!DOCTYPE html>"));
        assert!(!looks_like_markup(&png_bytes(8, 8, 1)));
    }

    #[test]
    fn courtesy_delay_stays_in_bounds() {
        let delay = CourtesyDelay::new(Duration::from_millis(100), Duration::from_millis(300));
        for _ in 0..50 {
            let d = delay.effective();
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(300));
        }
        assert_eq!(CourtesyDelay::none().effective(), Duration::ZERO);
    }
}
