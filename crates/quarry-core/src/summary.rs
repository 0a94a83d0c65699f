//! Compact task summary persisted to the task store.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::models::ResultEnvelope;
use crate::util::format_duration;

/// Errors carried into the minimal fallback summary.
const FALLBACK_ERRORS: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCounts {
    pub hero: usize,
    pub gallery: usize,
    pub aplus_brand: usize,
    pub aplus_product: usize,
    pub aplus_manufacturer: usize,
    pub aplus: usize,
    pub review_images: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub product_name: Option<String>,
    pub asin: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub images: ImageCounts,
    pub reviews_count: usize,
    pub validation_score: f64,
    pub processing_time_seconds: f64,
    pub processing_time_formatted: String,
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
}

impl ResultSummary {
    pub fn from_envelope(
        envelope: &ResultEnvelope,
        output_dir: Option<&Path>,
        elapsed: Duration,
    ) -> Self {
        let images = &envelope.images;
        let counts = ImageCounts {
            hero: images.hero.len(),
            gallery: images.gallery.len(),
            aplus_brand: images.aplus_brand.len(),
            aplus_product: images.aplus_product.len(),
            aplus_manufacturer: images.aplus_manufacturer.len(),
            aplus: images.aplus_brand.len()
                + images.aplus_product.len()
                + images.aplus_manufacturer.len(),
            review_images: images.review_images.len(),
        };
        Self {
            product_name: envelope.text.title.clone(),
            asin: envelope.text.asin.clone(),
            output_dir: output_dir.map(Path::to_path_buf),
            images: counts,
            reviews_count: envelope.reviews.reviews.len(),
            validation_score: envelope.validation.as_ref().map_or(0.0, |v| v.score),
            processing_time_seconds: (elapsed.as_secs_f64() * 100.0).round() / 100.0,
            processing_time_formatted: format_duration(elapsed),
            errors: envelope.errors.clone(),
            report_path: None,
        }
    }

    pub fn with_report_path(mut self, path: PathBuf) -> Self {
        self.report_path = Some(path);
        self
    }

    fn minimal(&self, errors: usize) -> serde_json::Value {
        json!({
            "product_name": self.product_name,
            "asin": self.asin,
            "reviews_count": self.reviews_count,
            "validation_score": self.validation_score,
            "processing_time_seconds": self.processing_time_seconds,
            "errors": self.errors.iter().take(errors).collect::<Vec<_>>(),
            "truncated": true,
        })
    }

    /// JSON form no larger than `max_bytes` when serialized.
    ///
    /// Oversized summaries degrade to a minimal one with the first few
    /// errors, then with none.
    pub fn to_bounded_json(&self, max_bytes: usize) -> serde_json::Value {
        let full = match serde_json::to_value(self) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "Summary did not serialize, storing minimal form");
                return self.minimal(0);
            }
        };
        if serialized_len(&full) <= max_bytes {
            return full;
        }
        tracing::warn!(max_bytes, "Result summary too large, storing minimal form");
        let minimal = self.minimal(FALLBACK_ERRORS);
        if serialized_len(&minimal) <= max_bytes {
            minimal
        } else {
            self.minimal(0)
        }
    }
}

fn serialized_len(value: &serde_json::Value) -> usize {
    serde_json::to_vec(value).map_or(usize::MAX, |v| v.len())
}
