//! Locating named content sections ("From the brand", "Product
//! description", "From the manufacturer") and the images inside them.
//!
//! Search runs in three steps: a cheap heading scan on the snapshot, a
//! budgeted walk over known and generic container selectors, then an
//! in-order walk of the matched container's images with carousel
//! classification.

use std::collections::HashSet;

use crate::element::{ElementHandle, NodeSource, Tier};
use crate::error::AppError;
use crate::extractor::ExtractionFailure;
use crate::images;
use crate::models::{AssetCategory, ImageReference};
use crate::retry::Attempt;
use crate::util::prefix_chars;

const HEADING_SELECTOR: &str = "h1, h2, h3, h4";
/// Ancestor levels inspected when classifying carousel membership.
pub const MAX_CAROUSEL_DEPTH: usize = 10;
/// Prefix of a generic container's text checked for a marker phrase.
pub const TEXT_CHECK_CHARS: usize = 200;
/// Group key for carousel members whose container carries no id.
pub const DEFAULT_CAROUSEL_KEY: &str = "default_carousel";

const GENERIC_APLUS_SELECTORS: &[&str] = &[
    "#aplus_feature_div",
    "#aplus",
    ".aplus-module",
    "[data-feature-name=\"aplus\"]",
];

/// Description of one named section.
#[derive(Debug, Clone, Copy)]
pub struct SectionSpec {
    pub name: &'static str,
    pub category: AssetCategory,
    /// Lowercase marker phrases.
    pub markers: &'static [&'static str],
    /// Containers trusted without a text check.
    pub specific_selectors: &'static [&'static str],
    /// Containers that must mention a marker near their start.
    pub generic_selectors: &'static [&'static str],
}

pub const BRAND_STORY: SectionSpec = SectionSpec {
    name: "brand_story",
    category: AssetCategory::AplusBrand,
    markers: &["from the brand"],
    specific_selectors: &[
        "#aplusBrandStory_feature_div",
        "[data-feature-name=\"aplusBrandStory\"]",
    ],
    generic_selectors: GENERIC_APLUS_SELECTORS,
};

pub const PRODUCT_DESCRIPTION: SectionSpec = SectionSpec {
    name: "product_description",
    category: AssetCategory::AplusProduct,
    markers: &["product description"],
    specific_selectors: &[
        "#productDescription_feature_div",
        "[data-feature-name=\"productDescription\"]",
    ],
    generic_selectors: GENERIC_APLUS_SELECTORS,
};

pub const MANUFACTURER: SectionSpec = SectionSpec {
    name: "manufacturer",
    category: AssetCategory::AplusManufacturer,
    markers: &["from the manufacturer"],
    specific_selectors: &[
        "#manufacturer_feature_div",
        "[data-feature-name=\"manufacturer\"]",
        "[data-feature-name=\"fromTheManufacturer\"]",
    ],
    generic_selectors: GENERIC_APLUS_SELECTORS,
};

/// What a section search found.
#[derive(Debug, Clone, Default)]
pub struct SectionOutcome {
    pub images: Vec<ImageReference>,
    pub heading_found: bool,
    /// Selectors tried, in order, on the tier that produced the result.
    pub selectors_checked: Vec<&'static str>,
    pub matched_selector: Option<&'static str>,
    pub tier: Option<Tier>,
    pub failure: Option<ExtractionFailure>,
}

impl Attempt for SectionOutcome {
    fn transient_failure(&self) -> bool {
        self.failure.as_ref().is_some_and(|f| f.transient)
    }
}

struct Scan {
    images: Vec<ImageReference>,
    checked: Vec<&'static str>,
    matched: Option<&'static str>,
}

pub struct SectionLocator {
    spec: SectionSpec,
    budget: usize,
}

impl SectionLocator {
    pub fn new(spec: SectionSpec, budget: usize) -> Self {
        Self {
            spec,
            budget: budget.max(1),
        }
    }

    pub fn spec(&self) -> &SectionSpec {
        &self.spec
    }

    /// Find the section and enumerate its images.
    ///
    /// The snapshot is scanned first; the live page is scanned only when
    /// the heading exists but the snapshot produced no images.
    pub async fn locate<S, L>(&self, snapshot: &S, live: Option<&L>) -> SectionOutcome
    where
        S: NodeSource,
        L: NodeSource,
    {
        let section = self.spec.name;
        let mut outcome = SectionOutcome::default();

        match self.heading_present(snapshot).await {
            Ok(true) => outcome.heading_found = true,
            Ok(false) => {
                tracing::debug!(section, "No marker heading, skipping section");
                return outcome;
            }
            Err(e) => {
                tracing::debug!(section, error = %e, "Heading scan failed, searching anyway");
                outcome.heading_found = true;
            }
        }

        let mut last_error = None;
        match self.scan(snapshot).await {
            Ok(scan) if !scan.images.is_empty() => {
                return self.finish(outcome, scan, Tier::Snapshot);
            }
            Ok(scan) => outcome.selectors_checked = scan.checked,
            Err(e) => last_error = Some(e),
        }

        if let Some(live) = live {
            tracing::info!(section, "Section empty in snapshot, querying live page");
            match self.scan(live).await {
                Ok(scan) if !scan.images.is_empty() => {
                    return self.finish(outcome, scan, Tier::Live);
                }
                Ok(_) => last_error = None,
                Err(e) => last_error = Some(e),
            }
        }

        if let Some(e) = last_error {
            tracing::warn!(section, error = %e, "Section search raised");
            outcome.failure = Some(ExtractionFailure {
                message: format!("{section}: {e}"),
                transient: e.is_retryable(),
            });
        } else {
            tracing::debug!(
                section,
                checked = outcome.selectors_checked.len(),
                "Section not found"
            );
        }
        outcome
    }

    fn finish(&self, mut outcome: SectionOutcome, scan: Scan, tier: Tier) -> SectionOutcome {
        tracing::info!(
            section = self.spec.name,
            selector = scan.matched.unwrap_or("-"),
            images = scan.images.len(),
            ?tier,
            "Section images discovered"
        );
        outcome.images = scan.images;
        outcome.selectors_checked = scan.checked;
        outcome.matched_selector = scan.matched;
        outcome.tier = Some(tier);
        outcome
    }

    async fn heading_present<S: NodeSource>(&self, source: &S) -> Result<bool, AppError> {
        for heading in source.select_all(HEADING_SELECTOR).await? {
            let text = heading.text().await?.to_lowercase();
            if self.spec.markers.iter().any(|m| text.contains(m)) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn mentions_marker<E: ElementHandle>(&self, container: &E) -> Result<bool, AppError> {
        let text = container.text().await?;
        let head = prefix_chars(text.trim_start(), TEXT_CHECK_CHARS).to_lowercase();
        Ok(self.spec.markers.iter().any(|m| head.contains(m)))
    }

    async fn scan<S: NodeSource>(&self, source: &S) -> Result<Scan, AppError> {
        let candidates = self
            .spec
            .specific_selectors
            .iter()
            .map(|s| (*s, true))
            .chain(self.spec.generic_selectors.iter().map(|s| (*s, false)));

        let mut checked = Vec::new();
        let mut any_container = false;

        for (selector, trusted) in candidates {
            if !any_container && checked.len() >= self.budget {
                tracing::debug!(
                    section = self.spec.name,
                    budget = self.budget,
                    "Selector budget spent with no container"
                );
                break;
            }
            checked.push(selector);

            let containers = source.select_all(selector).await?;
            if containers.is_empty() {
                continue;
            }
            any_container = true;

            for container in &containers {
                if !trusted && !self.mentions_marker(container).await? {
                    continue;
                }
                let images = enumerate_images(container).await?;
                if !images.is_empty() {
                    return Ok(Scan {
                        images,
                        checked,
                        matched: Some(selector),
                    });
                }
            }
        }

        Ok(Scan {
            images: Vec::new(),
            checked,
            matched: None,
        })
    }
}

/// Images of `container` in document order, excluded and repeated URLs
/// dropped.
pub async fn enumerate_images<E: ElementHandle>(
    container: &E,
) -> Result<Vec<ImageReference>, AppError> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();

    for (position, img) in container.children("img").await?.iter().enumerate() {
        let Some(url) = images::section_image_url(img).await? else {
            continue;
        };
        if images::is_excluded_url(&url) || !seen.insert(url.clone()) {
            continue;
        }
        let alt = img
            .attribute("alt")
            .await?
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());

        let mut reference = match carousel_group(img).await? {
            Some(key) => ImageReference::carousel(url, key, position),
            None => ImageReference::standalone(url, position),
        };
        reference.alt_text = alt;
        found.push(reference);
    }
    Ok(found)
}

struct CarouselHint {
    by_class_or_id: bool,
    by_role: bool,
    id: Option<String>,
    role: String,
}

async fn carousel_hint<E: ElementHandle>(node: &E) -> Result<CarouselHint, AppError> {
    let class = node.attribute("class").await?.unwrap_or_default().to_lowercase();
    let id = node
        .attribute("id")
        .await?
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let role = node.attribute("role").await?.unwrap_or_default().to_lowercase();

    let id_hint = id
        .as_deref()
        .is_some_and(|i| i.to_lowercase().contains("carousel"));
    Ok(CarouselHint {
        by_class_or_id: class.contains("carousel") || id_hint,
        by_role: role.contains("carousel"),
        id,
        role,
    })
}

/// Carousel group key of `img`, or `None` for standalone images.
///
/// Walks at most [`MAX_CAROUSEL_DEPTH`] ancestors. The first
/// carousel-looking ancestor makes the image a member; the key is the id
/// of the nearest carousel ancestor that has one (role-qualified when
/// only its ARIA role marks it), else [`DEFAULT_CAROUSEL_KEY`].
pub async fn carousel_group<E: ElementHandle>(img: &E) -> Result<Option<String>, AppError> {
    let mut member = false;
    let mut current = img.parent().await?;

    for _ in 0..MAX_CAROUSEL_DEPTH {
        let Some(node) = current else {
            break;
        };
        let hint = carousel_hint(&node).await?;
        if hint.by_class_or_id || hint.by_role {
            member = true;
            if let Some(id) = hint.id {
                let key = if hint.by_class_or_id {
                    id
                } else {
                    format!("{}#{id}", hint.role)
                };
                return Ok(Some(key));
            }
        }
        current = node.parent().await?;
    }

    Ok(member.then(|| DEFAULT_CAROUSEL_KEY.to_string()))
}
