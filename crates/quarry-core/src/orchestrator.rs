//! Runs one extraction task end to end.
//!
//! A task owns exactly one live page. It is navigated once, snapshotted
//! once, and released exactly once however the task ends: success,
//! fatal error or cancellation.
//!
//! The task future holds the parsed snapshot across awaits and is
//! therefore not `Send`; drive it from the caller's task rather than
//! spawning it.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{TaskConfig, Tunables};
use crate::dom::DomSnapshot;
use crate::element::LiveSource;
use crate::error::AppError;
use crate::extractor::Audit;
use crate::gallery::ProductImageExtractors;
use crate::grouper::{NamedImage, assign_names};
use crate::metrics::{CategoryOutcome, MetricsTracker};
use crate::models::{
    AssetCategory, ImageReference, ProductText, ResultEnvelope, ReviewsBlock, SavedAsset,
};
use crate::retry::RetryPolicy;
use crate::reviews::ReviewExtractors;
use crate::section::{BRAND_STORY, MANUFACTURER, PRODUCT_DESCRIPTION, SectionLocator, SectionOutcome};
use crate::store::{AcquireOutcome, ContentStore, TaskHashSet};
use crate::summary::ResultSummary;
use crate::task::{TaskState, TaskStatus, TaskUpdate};
use crate::text::{self, TextExtractors};
use crate::traits::{ImageSource, PageSource, PageSourceProvider, ReportSink, TaskStore};
use crate::util::create_output_dir;
use crate::validator;

/// Any of these marks the product page as ready for a snapshot.
pub const READY_SELECTORS: &[&str] = &[
    "#productTitle",
    "#dp-container",
    "#ppd",
    "#centerCol",
    "#landingImage",
];

const UNKNOWN_PRODUCT: &str = "Unknown Product";

/// Final state of one task.
#[derive(Debug)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub state: TaskState,
    /// Every state entered, in order.
    pub history: Vec<TaskState>,
    pub envelope: ResultEnvelope,
    pub output_dir: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
    /// Set when the task failed.
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        self.state == TaskState::Completed
    }
}

/// Directory name for a product: title, then ASIN from the URL, then
/// the last path segment, then a placeholder.
pub fn product_name(title: Option<&str>, url: &str) -> String {
    if let Some(title) = title.map(str::trim).filter(|t| !t.is_empty()) {
        return title.to_string();
    }
    if let Some(asin) = text::parse_asin(url) {
        return asin;
    }
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()?
                .filter(|s| !s.is_empty())
                .next_back()
                .map(str::to_string)
        })
        .unwrap_or_else(|| UNKNOWN_PRODUCT.to_string())
}

struct AssetJob {
    category: AssetCategory,
    image: NamedImage,
    path: PathBuf,
}

fn plan_assets(
    category: AssetCategory,
    refs: &[ImageReference],
    product_dir: &Path,
) -> Vec<AssetJob> {
    let dir = product_dir.join(category.dir_name());
    assign_names(category.file_prefix(), refs)
        .into_iter()
        .map(|image| AssetJob {
            category,
            path: dir.join(&image.file_name),
            image,
        })
        .collect()
}

fn audit_outcome(audits: &[Audit]) -> CategoryOutcome {
    let found = audits.iter().filter(|(_, a)| a.is_found()).count();
    match found {
        0 => CategoryOutcome::Failed,
        n if n == audits.len() => CategoryOutcome::Success,
        _ => CategoryOutcome::Partial,
    }
}

struct Driven {
    envelope: ResultEnvelope,
    output_dir: PathBuf,
    report_path: Option<PathBuf>,
}

/// What extraction produced, before any asset is downloaded.
#[derive(Default)]
struct Discovered {
    text: ProductText,
    reviews: ReviewsBlock,
    audits: Vec<Audit>,
    hero: Option<ImageReference>,
    gallery: Vec<ImageReference>,
    review_images: Vec<ImageReference>,
    sections: Vec<(AssetCategory, &'static str, SectionOutcome)>,
}

/// Drives tasks against injected collaborators.
pub struct Orchestrator<P, I, R, T> {
    provider: P,
    store: ContentStore<I>,
    reports: R,
    tasks: T,
    tunables: Tunables,
    text: TextExtractors,
    reviews: ReviewExtractors,
    product_images: ProductImageExtractors,
}

impl<P, I, R, T> Orchestrator<P, I, R, T>
where
    P: PageSourceProvider,
    I: ImageSource,
    R: ReportSink,
    T: TaskStore,
{
    pub fn new(provider: P, images: I, reports: R, tasks: T, tunables: Tunables) -> Self {
        Self {
            provider,
            store: ContentStore::from_tunables(images, &tunables),
            reports,
            tasks,
            tunables,
            text: TextExtractors::default(),
            reviews: ReviewExtractors::default(),
            product_images: ProductImageExtractors::default(),
        }
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub fn tasks(&self) -> &T {
        &self.tasks
    }

    fn retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.tunables.max_retries, self.tunables.backoff_base)
    }

    /// Run one task. Errors only for an invalid configuration or a task
    /// store that cannot create the task; every later failure is reported
    /// through the returned [`TaskOutcome`].
    pub async fn run(
        &self,
        url: &str,
        config: &TaskConfig,
        metrics: &mut MetricsTracker,
        cancel: &CancellationToken,
    ) -> Result<TaskOutcome, AppError> {
        config.validate()?;
        let task_id = self.tasks.create_task(url, config).await?;
        let started = Instant::now();
        tracing::info!(%task_id, %url, "Task created");
        self.store_update(task_id, TaskUpdate::status(TaskStatus::Running)).await;

        let mut history = vec![TaskState::Initializing];
        let driven = match self.provider.open().await {
            Err(e) => Err(e),
            Ok(page) => {
                let driven = tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(AppError::Cancelled),
                    r = self.drive(&page, url, config, metrics, cancel, &mut history) => r,
                };
                match page.release().await {
                    Ok(()) => tracing::debug!(%task_id, "Page released"),
                    Err(e) => tracing::warn!(%task_id, error = %e, "Page release failed"),
                }
                driven
            }
        };

        let elapsed = started.elapsed();
        let outcome = match driven {
            Ok(driven) => {
                history.push(TaskState::Completed);
                let summary = ResultSummary::from_envelope(
                    &driven.envelope,
                    Some(&driven.output_dir),
                    elapsed,
                );
                let summary = match &driven.report_path {
                    Some(path) => summary.with_report_path(path.clone()),
                    None => summary,
                };
                let name = product_name(driven.envelope.text.title.as_deref(), url);
                let update = TaskUpdate::status(TaskStatus::Completed)
                    .with_product_name(name)
                    .with_summary(summary.to_bounded_json(self.tunables.max_summary_bytes));
                self.store_update(task_id, update).await;
                tracing::info!(
                    %task_id,
                    images = driven.envelope.images.total(),
                    reviews = driven.envelope.reviews.reviews.len(),
                    score = driven.envelope.validation.as_ref().map_or(0.0, |v| v.score),
                    "Task completed"
                );
                TaskOutcome {
                    task_id,
                    state: TaskState::Completed,
                    history,
                    envelope: driven.envelope,
                    output_dir: Some(driven.output_dir),
                    report_path: driven.report_path,
                    error: None,
                    elapsed,
                }
            }
            Err(e) => {
                history.push(TaskState::Failed);
                let message = e.to_string();
                tracing::error!(%task_id, error = %message, "Task failed");
                self.store_update(task_id, TaskUpdate::status(TaskStatus::Failed).with_error(&message))
                    .await;
                TaskOutcome {
                    task_id,
                    state: TaskState::Failed,
                    history,
                    envelope: ResultEnvelope::new(url),
                    output_dir: None,
                    report_path: None,
                    error: Some(message),
                    elapsed,
                }
            }
        };
        Ok(outcome)
    }

    async fn store_update(&self, task_id: Uuid, update: TaskUpdate) {
        if let Err(e) = self.tasks.update_task(task_id, &update).await {
            tracing::error!(%task_id, error = %e, "Failed to update task");
        }
    }

    async fn drive(
        &self,
        page: &P::Page,
        url: &str,
        config: &TaskConfig,
        metrics: &mut MetricsTracker,
        cancel: &CancellationToken,
        history: &mut Vec<TaskState>,
    ) -> Result<Driven, AppError> {
        let retry = self.retry();

        // Initializing
        let loaded = retry.run("navigate", || page.navigate(url)).await?;
        if !loaded {
            return Err(AppError::BrowserError(format!("navigation to {url} failed")));
        }
        match page
            .wait_for_any(READY_SELECTORS, self.tunables.ready_timeout)
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!(%url, "No ready marker before timeout, continuing"),
            Err(e) => tracing::warn!(%url, error = %e, "Readiness wait failed, continuing"),
        }

        enter(history, TaskState::SnapshotCaptured, cancel)?;
        let markup = page.snapshot_source().await?;
        let page_url = page.current_url().await.unwrap_or_else(|_| url.to_string());
        let snapshot = DomSnapshot::parse(&markup, page_url)?;
        tracing::debug!(elements = snapshot.element_count(), "Snapshot captured");

        enter(history, TaskState::Extracting, cancel)?;
        let live = LiveSource::new(page, self.tunables.live_query_timeout);
        let discovered = self.extract(&snapshot, &live, config, metrics, &retry).await;

        let mut envelope = ResultEnvelope::new(url);
        envelope.text = discovered.text.clone();
        envelope.reviews = discovered.reviews.clone();
        for (category, audit) in &discovered.audits {
            metrics.record_extraction(category, audit);
            if let Some(failure) = &audit.failure {
                envelope.errors.push(format!("{category}: {}", failure.message));
            }
        }

        let name = product_name(envelope.text.title.as_deref(), url);
        let output_dir = create_output_dir(&self.tunables.output_root, &name).await?;
        tracing::info!(product = %name, dir = %output_dir.display(), "Output directory ready");

        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        self.acquire_assets(&discovered, config, &output_dir, &mut envelope, metrics)
            .await;
        self.record_outcomes(&discovered, config, &mut envelope, metrics);

        enter(history, TaskState::Validating, cancel)?;
        envelope.validation = Some(validator::score(&envelope));

        let mut report_path = None;
        if envelope.is_reportable() {
            enter(history, TaskState::ReportGenerated, cancel)?;
            let assets = envelope.images.paths();
            let generated = self.reports.generate(&envelope, &assets, &output_dir).await;
            match generated {
                Ok(path) => {
                    tracing::info!(report = %path.display(), "Report generated");
                    report_path = Some(path);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Report generation failed");
                    envelope.errors.push(format!("report: {e}"));
                }
            }
        } else {
            tracing::info!(%url, "Nothing extracted, skipping report");
        }

        Ok(Driven {
            envelope,
            output_dir,
            report_path,
        })
    }

    /// Identity fields first, then every enabled category concurrently.
    async fn extract<L>(
        &self,
        snapshot: &DomSnapshot,
        live: &L,
        config: &TaskConfig,
        metrics: &MetricsTracker,
        retry: &RetryPolicy,
    ) -> Discovered
    where
        L: crate::element::NodeSource,
    {
        let text_extractors = self.text.prioritized(metrics);
        let reviews = self.reviews.prioritized(metrics);
        let product_images = self.product_images.prioritized(metrics);
        let live = Some(live);
        let mut found = Discovered::default();

        found.text.title =
            text::run(&text_extractors.title, snapshot, live, retry, &mut found.audits).await;
        found.text.asin =
            text::run(&text_extractors.asin, snapshot, live, retry, &mut found.audits).await;

        let budget = self.tunables.section_selector_budget;
        let locators: Vec<SectionLocator> = [
            (config.aplus_brand, BRAND_STORY),
            (config.aplus_product, PRODUCT_DESCRIPTION),
            (config.aplus_manufacturer, MANUFACTURER),
        ]
        .into_iter()
        .filter(|(enabled, _)| *enabled)
        .map(|(_, spec)| SectionLocator::new(spec, budget))
        .collect();

        let (details, review_out, images_out, sections) = futures::join!(
            async {
                if config.text {
                    Some(text_extractors.extract_details(snapshot, live, retry).await)
                } else {
                    None
                }
            },
            async {
                if config.reviews {
                    Some(reviews.extract(snapshot, live, retry, config.max_reviews).await)
                } else {
                    None
                }
            },
            async {
                if config.hero || config.gallery {
                    Some(product_images.extract(snapshot, live, retry, config.gallery).await)
                } else {
                    None
                }
            },
            join_all(locators.iter().map(|locator| async move {
                let outcome = retry
                    .run(locator.spec().name, || locator.locate(snapshot, live))
                    .await;
                (locator.spec().category, locator.spec().name, outcome)
            })),
        );

        if let Some(details) = details {
            found.text = ProductText {
                title: found.text.title.take(),
                asin: found.text.asin.take(),
                ..details.text
            };
            found.audits.extend(details.audits);
        }
        if let Some(review_out) = review_out {
            found.reviews = review_out.block;
            found.review_images = review_out.images;
            found.audits.extend(review_out.audits);
        }
        if let Some(images_out) = images_out {
            found.hero = images_out.hero.filter(|_| config.hero);
            found.gallery = images_out.gallery;
            found.audits.extend(images_out.audits);
        }
        found.sections = sections;
        found
    }

    async fn acquire_assets(
        &self,
        discovered: &Discovered,
        config: &TaskConfig,
        product_dir: &Path,
        envelope: &mut ResultEnvelope,
        metrics: &mut MetricsTracker,
    ) {
        let mut jobs = Vec::new();
        if let Some(hero) = &discovered.hero {
            let dir = product_dir.join(AssetCategory::Hero.dir_name());
            jobs.push(AssetJob {
                category: AssetCategory::Hero,
                image: NamedImage {
                    reference: hero.clone(),
                    file_name: "hero.jpg".to_string(),
                },
                path: dir.join("hero.jpg"),
            });
        }
        jobs.extend(plan_assets(AssetCategory::Gallery, &discovered.gallery, product_dir));
        for (category, name, outcome) in &discovered.sections {
            for selector in &outcome.selectors_checked {
                metrics.record_locator(name, selector, outcome.matched_selector == Some(*selector));
            }
            jobs.extend(plan_assets(*category, &outcome.images, product_dir));
        }
        if config.reviews {
            jobs.extend(plan_assets(
                AssetCategory::ReviewImages,
                &discovered.review_images,
                product_dir,
            ));
        }
        if jobs.is_empty() {
            return;
        }

        tracing::info!(assets = jobs.len(), "Acquiring assets");
        let hashes = TaskHashSet::new(self.tunables.hash_set_capacity);
        let hashes = &hashes;
        let store = &self.store;
        let results: Vec<(AssetJob, AcquireOutcome)> = stream::iter(jobs)
            .map(|job| async move {
                let outcome = store
                    .acquire(&job.image.reference.url, &job.path, hashes)
                    .await;
                (job, outcome)
            })
            .buffered(self.tunables.download_concurrency.max(1))
            .collect()
            .await;

        let mut rejected = 0usize;
        for (job, outcome) in results {
            match outcome {
                AcquireOutcome::Saved { content_hash } => {
                    envelope.images.get_mut(job.category).push(SavedAsset {
                        content_hash,
                        output_path: job.path,
                        source_url: job.image.reference.url,
                        alt_text: job.image.reference.alt_text,
                    });
                }
                AcquireOutcome::Duplicate { .. } | AcquireOutcome::Excluded => {}
                AcquireOutcome::Rejected(_) => rejected += 1,
            }
        }
        tracing::info!(
            saved = envelope.images.total(),
            rejected,
            distinct = hashes.len(),
            "Assets acquired"
        );
    }

    fn record_outcomes(
        &self,
        discovered: &Discovered,
        config: &TaskConfig,
        envelope: &mut ResultEnvelope,
        metrics: &mut MetricsTracker,
    ) {
        let by_prefix = |prefixes: &[&str]| -> Vec<Audit> {
            discovered
                .audits
                .iter()
                .filter(|(c, _)| prefixes.iter().any(|p| c.starts_with(p)))
                .cloned()
                .collect()
        };

        if config.text {
            let audits = by_prefix(&[
                "title", "asin", "brand", "price", "original_price", "about", "product_",
                "technical", "ingredients",
            ]);
            metrics.record_outcome("text", audit_outcome(&audits));
            if envelope.text.title.is_none() && envelope.text.price.is_none() {
                envelope.errors.push("text: no title or price found".to_string());
            }
        }
        if config.reviews {
            let audits = by_prefix(&["review", "customers_say", "key_aspects"]);
            metrics.record_outcome("reviews", audit_outcome(&audits));
            if discovered.reviews.is_empty() {
                envelope.errors.push("reviews: no review data found".to_string());
            }
        }
        if config.hero {
            let outcome = if envelope.images.hero.is_empty() {
                CategoryOutcome::Failed
            } else {
                CategoryOutcome::Success
            };
            metrics.record_outcome("hero", outcome);
        }
        if config.gallery {
            metrics.record_outcome(
                "gallery",
                saved_outcome(discovered.gallery.len(), envelope.images.gallery.len()),
            );
        }
        for (category, name, outcome) in &discovered.sections {
            if let Some(failure) = &outcome.failure {
                envelope.errors.push(failure.message.clone());
            }
            if outcome.heading_found {
                let saved = envelope.images.get(*category).len();
                metrics.record_outcome(name, saved_outcome(outcome.images.len(), saved));
            }
        }
    }
}

fn saved_outcome(discovered: usize, saved: usize) -> CategoryOutcome {
    if saved == 0 {
        CategoryOutcome::Failed
    } else if saved >= discovered {
        CategoryOutcome::Success
    } else {
        CategoryOutcome::Partial
    }
}

fn enter(
    history: &mut Vec<TaskState>,
    state: TaskState,
    cancel: &CancellationToken,
) -> Result<(), AppError> {
    if cancel.is_cancelled() {
        return Err(AppError::Cancelled);
    }
    tracing::debug!(%state, "Entering state");
    history.push(state);
    Ok(())
}
