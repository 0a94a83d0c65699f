//! Locator success statistics used to bias strategy order across runs.
//!
//! The tracker is a plain value owned by whoever drives tasks; the
//! orchestrator borrows it mutably for the length of one task. Locator
//! entries live in a bounded LRU cache.

use std::collections::HashMap;
use std::path::Path;

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::extractor::ExtractionResult;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocatorStats {
    pub success: u64,
    pub failure: u64,
}

impl LocatorStats {
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.success + self.failure;
        (total > 0).then(|| self.success as f64 / total as f64)
    }
}

/// Per-category outcome of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryOutcome {
    Success,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts {
    pub success: u64,
    pub partial: u64,
    pub failed: u64,
}

/// Snapshot of the tracker for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub tracked_locators: usize,
    pub categories: HashMap<String, CategoryCounts>,
    /// `category:strategy` to success rate, for locators with data.
    pub locator_success: HashMap<String, f64>,
    pub fallback_usage: HashMap<String, u64>,
}

/// On-disk form of the tracker.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SavedMetrics {
    #[serde(default)]
    locators: HashMap<String, LocatorStats>,
    #[serde(default)]
    categories: HashMap<String, CategoryCounts>,
    #[serde(default)]
    fallbacks: HashMap<String, u64>,
}

pub struct MetricsTracker {
    locators: Cache<String, LocatorStats>,
    categories: HashMap<String, CategoryCounts>,
    fallbacks: HashMap<String, u64>,
}

const UNKNOWN_RATE: f64 = 0.5;

fn key(category: &str, strategy: &str) -> String {
    format!("{category}:{strategy}")
}

fn locator_cache(capacity: usize) -> Cache<String, LocatorStats> {
    Cache::builder()
        .max_capacity(capacity.max(1) as u64)
        .eviction_policy(EvictionPolicy::lru())
        .eviction_listener(|k, _, cause| {
            tracing::debug!(locator = %k, ?cause, "Evicted locator stats");
        })
        .build()
}

impl MetricsTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            locators: locator_cache(capacity),
            categories: HashMap::new(),
            fallbacks: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.locators.run_pending_tasks();
        self.locators.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self, category: &str, strategy: &str) -> Option<LocatorStats> {
        self.locators.get(&key(category, strategy))
    }

    /// Record one extraction: the winning strategy is a success, every
    /// other attempted strategy a failure.
    pub fn record_extraction<T>(&mut self, category: &str, result: &ExtractionResult<T>) {
        for id in &result.attempted {
            let succeeded = result.strategy_used == Some(*id);
            self.record_locator(category, id, succeeded);
        }
        for id in &result.live_fallbacks {
            *self.fallbacks.entry(key(category, id)).or_insert(0) += 1;
        }
    }

    pub fn record_locator(&mut self, category: &str, strategy: &str, succeeded: bool) {
        let k = key(category, strategy);
        let mut stats = self.locators.get(&k).unwrap_or_default();
        if succeeded {
            stats.success += 1;
        } else {
            stats.failure += 1;
        }
        self.locators.insert(k, stats);
        // Applied per write so recency follows call order.
        self.locators.run_pending_tasks();
    }

    pub fn record_outcome(&mut self, category: &str, outcome: CategoryOutcome) {
        let counts = self.categories.entry(category.to_string()).or_default();
        match outcome {
            CategoryOutcome::Success => counts.success += 1,
            CategoryOutcome::Partial => counts.partial += 1,
            CategoryOutcome::Failed => counts.failed += 1,
        }
    }

    /// Indices of `strategies` ordered by success rate, best first.
    ///
    /// Strategies without data rank as a coin flip; ties keep the
    /// configured order.
    pub fn rank(&self, category: &str, strategies: &[&str]) -> Vec<usize> {
        let rates: Vec<f64> = strategies
            .iter()
            .map(|id| {
                self.stats(category, id)
                    .and_then(|s| s.success_rate())
                    .unwrap_or(UNKNOWN_RATE)
            })
            .collect();
        let mut order: Vec<usize> = (0..strategies.len()).collect();
        order.sort_by(|a, b| rates[*b].total_cmp(&rates[*a]));
        order
    }

    fn locator_map(&self) -> HashMap<String, LocatorStats> {
        self.locators
            .iter()
            .map(|(k, v)| (k.as_ref().clone(), v))
            .collect()
    }

    pub fn summary(&self) -> MetricsSummary {
        let locators = self.locator_map();
        MetricsSummary {
            tracked_locators: locators.len(),
            categories: self.categories.clone(),
            locator_success: locators
                .iter()
                .filter_map(|(k, s)| s.success_rate().map(|r| (k.clone(), r)))
                .collect(),
            fallback_usage: self.fallbacks.clone(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), AppError> {
        let saved = SavedMetrics {
            locators: self.locator_map(),
            categories: self.categories.clone(),
            fallbacks: self.fallbacks.clone(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(&saved)?)?;
        Ok(())
    }

    /// Load saved statistics, or start empty if `path` does not exist.
    ///
    /// Loaded entries beyond `capacity` are evicted.
    pub fn load(path: &Path, capacity: usize) -> Result<Self, AppError> {
        if !path.exists() {
            return Ok(Self::new(capacity));
        }
        let saved: SavedMetrics = serde_json::from_slice(&std::fs::read(path)?)?;
        let tracker = Self {
            locators: locator_cache(capacity),
            categories: saved.categories,
            fallbacks: saved.fallbacks,
        };
        for (k, stats) in saved.locators {
            tracker.locators.insert(k, stats);
        }
        tracker.locators.run_pending_tasks();
        Ok(tracker)
    }
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new(50)
    }
}

impl std::fmt::Debug for MetricsTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsTracker")
            .field("locators", &self.locators.entry_count())
            .field("categories", &self.categories.len())
            .field("fallbacks", &self.fallbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(attempted: &[&'static str], used: Option<&'static str>) -> ExtractionResult<()> {
        let mut r = ExtractionResult::empty();
        r.attempted = attempted.to_vec();
        r.strategy_used = used;
        r.value = used.map(|_| ());
        r
    }

    #[test]
    fn records_success_and_failures() {
        let mut m = MetricsTracker::new(50);
        m.record_extraction("price", &result(&["a", "b"], Some("b")));
        assert_eq!(m.stats("price", "a").unwrap().failure, 1);
        assert_eq!(m.stats("price", "b").unwrap().success, 1);
        assert!(m.stats("title", "a").is_none());
    }

    #[test]
    fn rank_prefers_successful_and_is_stable() {
        let mut m = MetricsTracker::new(50);
        assert_eq!(m.rank("c", &["a", "b", "c"]), vec![0, 1, 2]);

        m.record_extraction("c", &result(&["a", "b", "c"], Some("c")));
        assert_eq!(m.rank("c", &["a", "b", "c"]), vec![2, 0, 1]);
    }

    #[test]
    fn eviction_drops_least_recently_used() {
        let mut m = MetricsTracker::new(2);
        m.record_locator("c", "a", true);
        m.record_locator("c", "b", true);
        m.record_locator("c", "a", true);
        m.record_locator("c", "z", false);
        assert_eq!(m.len(), 2);
        assert!(m.stats("c", "b").is_none());
        assert!(m.stats("c", "a").is_some());
        assert!(m.stats("c", "z").is_some());
    }

    #[test]
    fn fallbacks_and_outcomes_show_in_summary() {
        let mut m = MetricsTracker::new(10);
        let mut r = result(&["x"], Some("x"));
        r.live_fallbacks = vec!["x"];
        m.record_extraction("hero", &r);
        m.record_outcome("hero", CategoryOutcome::Success);
        m.record_outcome("reviews", CategoryOutcome::Failed);

        let s = m.summary();
        assert_eq!(s.tracked_locators, 1);
        assert_eq!(s.fallback_usage["hero:x"], 1);
        assert_eq!(s.categories["reviews"].failed, 1);
        assert_eq!(s.locator_success["hero:x"], 1.0);
    }

    #[test]
    fn save_and_load_roundtrip_respects_new_capacity() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("metrics/selectors.json");
        let mut m = MetricsTracker::new(10);
        for id in ["a", "b", "c"] {
            m.record_locator("title", id, true);
        }
        m.save(&path).unwrap();

        let loaded = MetricsTracker::load(&path, 2).unwrap();
        assert_eq!(loaded.len(), 2);
        let kept = ["a", "b", "c"]
            .iter()
            .filter(|id| loaded.stats("title", id).is_some())
            .count();
        assert_eq!(kept, 2);

        let roomy = MetricsTracker::load(&path, 10).unwrap();
        assert_eq!(roomy.stats("title", "c").unwrap().success, 1);

        let fresh = MetricsTracker::load(&tmp.path().join("missing.json"), 5).unwrap();
        assert!(fresh.is_empty());
    }
}
