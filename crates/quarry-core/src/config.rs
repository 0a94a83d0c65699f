use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Which extraction categories a task runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub hero: bool,
    pub gallery: bool,
    pub aplus_brand: bool,
    pub aplus_product: bool,
    pub aplus_manufacturer: bool,
    pub text: bool,
    pub reviews: bool,
    /// Upper bound on individual reviews kept.
    pub max_reviews: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            hero: true,
            gallery: true,
            aplus_brand: true,
            aplus_product: true,
            aplus_manufacturer: true,
            text: true,
            reviews: true,
            max_reviews: 10,
        }
    }
}

impl TaskConfig {
    /// A configuration with every category switched off.
    pub fn none() -> Self {
        Self {
            hero: false,
            gallery: false,
            aplus_brand: false,
            aplus_product: false,
            aplus_manufacturer: false,
            text: false,
            reviews: false,
            max_reviews: 10,
        }
    }

    /// Reject configurations that would do nothing.
    pub fn validate(&self) -> Result<(), AppError> {
        let any = self.hero
            || self.gallery
            || self.aplus_brand
            || self.aplus_product
            || self.aplus_manufacturer
            || self.text
            || self.reviews;
        if !any {
            return Err(AppError::ConfigError(
                "at least one extraction category must be enabled".into(),
            ));
        }
        Ok(())
    }

    /// True if any image category is on.
    pub fn wants_images(&self) -> bool {
        self.hero || self.gallery || self.wants_sections()
    }

    pub fn wants_sections(&self) -> bool {
        self.aplus_brand || self.aplus_product || self.aplus_manufacturer
    }
}

/// Numeric knobs shared by every task of a run.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Retries after the first attempt of an extractor or download.
    pub max_retries: u32,
    /// Base of the exponential backoff (`base * 2^attempt`).
    pub backoff_base: Duration,
    /// Courtesy delay after each asset download, uniform in [min, max].
    pub delay_min: Duration,
    pub delay_max: Duration,
    pub max_image_bytes: u64,
    /// Upper bound on distinct hashes tracked per task.
    pub hash_set_capacity: usize,
    pub min_image_width: u32,
    pub min_image_height: u32,
    /// How long to wait for any content-ready marker after navigation.
    pub ready_timeout: Duration,
    /// Bound on a single live-handle query.
    pub live_query_timeout: Duration,
    /// Selector checks a section locator may spend before giving up.
    pub section_selector_budget: usize,
    /// Cap on the serialized result summary written to the task store.
    pub max_summary_bytes: usize,
    /// Concurrent asset downloads within one task.
    pub download_concurrency: usize,
    /// Locator statistics kept by the metrics tracker.
    pub metrics_capacity: usize,
    pub output_root: PathBuf,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(1500),
            delay_min: Duration::from_millis(100),
            delay_max: Duration::from_millis(300),
            max_image_bytes: 10 * 1024 * 1024,
            hash_set_capacity: 10_000,
            min_image_width: 50,
            min_image_height: 50,
            ready_timeout: Duration::from_secs(10),
            live_query_timeout: Duration::from_secs(5),
            section_selector_budget: 3,
            max_summary_bytes: 10 * 1024 * 1024,
            download_concurrency: 4,
            metrics_capacity: 50,
            output_root: PathBuf::from("outputs"),
        }
    }
}

impl Tunables {
    /// Read overrides from environment variables, falling back to defaults.
    ///
    /// - `QUARRY_MAX_RETRIES`
    /// - `QUARRY_DELAY_MIN_MS` / `QUARRY_DELAY_MAX_MS`
    /// - `QUARRY_MAX_IMAGE_BYTES`
    /// - `QUARRY_HASH_SET_MAX`
    /// - `QUARRY_READY_TIMEOUT_SECS`
    /// - `QUARRY_DOWNLOAD_CONCURRENCY`
    /// - `QUARRY_OUTPUT_DIR`
    pub fn from_env() -> Result<Self, AppError> {
        let mut tunables = Self::default();

        if let Some(v) = env_parse::<u32>("QUARRY_MAX_RETRIES")? {
            tunables.max_retries = v;
        }
        if let Some(v) = env_parse::<u64>("QUARRY_DELAY_MIN_MS")? {
            tunables.delay_min = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("QUARRY_DELAY_MAX_MS")? {
            tunables.delay_max = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("QUARRY_MAX_IMAGE_BYTES")? {
            tunables.max_image_bytes = v;
        }
        if let Some(v) = env_parse::<usize>("QUARRY_HASH_SET_MAX")? {
            tunables.hash_set_capacity = v;
        }
        if let Some(v) = env_parse::<u64>("QUARRY_READY_TIMEOUT_SECS")? {
            tunables.ready_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<usize>("QUARRY_DOWNLOAD_CONCURRENCY")? {
            tunables.download_concurrency = v;
        }
        if let Ok(dir) = std::env::var("QUARRY_OUTPUT_DIR") {
            tunables.output_root = PathBuf::from(dir);
        }

        tunables.validate()?;
        Ok(tunables)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.delay_min > self.delay_max {
            return Err(AppError::ConfigError(format!(
                "delay_min ({:?}) must not exceed delay_max ({:?})",
                self.delay_min, self.delay_max
            )));
        }
        if self.max_image_bytes == 0 {
            return Err(AppError::ConfigError(
                "max_image_bytes must be at least 1".into(),
            ));
        }
        if self.hash_set_capacity == 0 {
            return Err(AppError::ConfigError(
                "hash_set_capacity must be at least 1".into(),
            ));
        }
        if self.download_concurrency == 0 {
            return Err(AppError::ConfigError(
                "download_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Zero delays and backoff, for tests and dry runs.
    pub fn without_delays(mut self) -> Self {
        self.backoff_base = Duration::ZERO;
        self.delay_min = Duration::ZERO;
        self.delay_max = Duration::ZERO;
        self
    }

    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = root.into();
        self
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, AppError> {
    match std::env::var(key) {
        Err(_) => Ok(None),
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            AppError::ConfigError(format!("Invalid {key} '{raw}': expected a number"))
        }),
    }
}
