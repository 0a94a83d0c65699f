use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// An image discovered while walking a page region.
///
/// `discovery_order` is the document position inside the region the
/// image was found in; naming downstream sorts on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub url: String,
    pub alt_text: Option<String>,
    pub is_carousel_member: bool,
    pub carousel_group_key: Option<String>,
    pub discovery_order: usize,
}

impl ImageReference {
    /// A standalone (non-carousel) image.
    pub fn standalone(url: impl Into<String>, discovery_order: usize) -> Self {
        Self {
            url: url.into(),
            alt_text: None,
            is_carousel_member: false,
            carousel_group_key: None,
            discovery_order,
        }
    }

    /// An image inside the carousel identified by `group_key`.
    pub fn carousel(url: impl Into<String>, group_key: impl Into<String>, order: usize) -> Self {
        Self {
            url: url.into(),
            alt_text: None,
            is_carousel_member: true,
            carousel_group_key: Some(group_key.into()),
            discovery_order: order,
        }
    }

    pub fn with_alt(mut self, alt: impl Into<String>) -> Self {
        self.alt_text = Some(alt.into());
        self
    }
}

/// A validated, deduplicated image written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedAsset {
    /// SHA-256 of the full payload, 64-char hex.
    pub content_hash: String,
    pub output_path: PathBuf,
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_text: Option<String>,
}

/// Output folder each image category lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetCategory {
    Hero,
    Gallery,
    AplusBrand,
    AplusProduct,
    AplusManufacturer,
    ReviewImages,
}

impl AssetCategory {
    pub const ALL: [AssetCategory; 6] = [
        AssetCategory::Hero,
        AssetCategory::Gallery,
        AssetCategory::AplusBrand,
        AssetCategory::AplusProduct,
        AssetCategory::AplusManufacturer,
        AssetCategory::ReviewImages,
    ];

    /// Subdirectory name under the product folder.
    pub fn dir_name(&self) -> &'static str {
        match self {
            AssetCategory::Hero => "hero",
            AssetCategory::Gallery => "product",
            AssetCategory::AplusBrand => "aplus_brand",
            AssetCategory::AplusProduct => "aplus_product",
            AssetCategory::AplusManufacturer => "aplus_manufacturer",
            AssetCategory::ReviewImages => "review_images",
        }
    }

    /// Filename prefix for numbered files in this category.
    pub fn file_prefix(&self) -> &'static str {
        match self {
            AssetCategory::Hero => "hero",
            AssetCategory::Gallery => "product",
            AssetCategory::AplusBrand => "brand",
            AssetCategory::AplusProduct => "A+",
            AssetCategory::AplusManufacturer => "manufacturer",
            AssetCategory::ReviewImages => "review",
        }
    }
}

impl fmt::Display for AssetCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Saved images grouped by category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCollection {
    pub hero: Vec<SavedAsset>,
    pub gallery: Vec<SavedAsset>,
    pub aplus_brand: Vec<SavedAsset>,
    pub aplus_product: Vec<SavedAsset>,
    pub aplus_manufacturer: Vec<SavedAsset>,
    pub review_images: Vec<SavedAsset>,
}

impl ImageCollection {
    pub fn get(&self, category: AssetCategory) -> &[SavedAsset] {
        match category {
            AssetCategory::Hero => &self.hero,
            AssetCategory::Gallery => &self.gallery,
            AssetCategory::AplusBrand => &self.aplus_brand,
            AssetCategory::AplusProduct => &self.aplus_product,
            AssetCategory::AplusManufacturer => &self.aplus_manufacturer,
            AssetCategory::ReviewImages => &self.review_images,
        }
    }

    pub fn get_mut(&mut self, category: AssetCategory) -> &mut Vec<SavedAsset> {
        match category {
            AssetCategory::Hero => &mut self.hero,
            AssetCategory::Gallery => &mut self.gallery,
            AssetCategory::AplusBrand => &mut self.aplus_brand,
            AssetCategory::AplusProduct => &mut self.aplus_product,
            AssetCategory::AplusManufacturer => &mut self.aplus_manufacturer,
            AssetCategory::ReviewImages => &mut self.review_images,
        }
    }

    pub fn total(&self) -> usize {
        AssetCategory::ALL.iter().map(|c| self.get(*c).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Every saved path, in category order.
    pub fn paths(&self) -> Vec<PathBuf> {
        AssetCategory::ALL
            .iter()
            .flat_map(|c| self.get(*c).iter().map(|a| a.output_path.clone()))
            .collect()
    }
}

/// A parsed price string such as `$1,299.99`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub amount: f64,
    pub currency: Option<String>,
    /// The text as shown on the page.
    pub display: String,
}

/// One key/value row of a specification table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRow {
    pub key: String,
    pub value: String,
}

impl TableRow {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Text fields of a product page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductText {
    pub title: Option<String>,
    pub brand: Option<String>,
    pub price: Option<Price>,
    pub original_price: Option<Price>,
    /// Stable product identifier (ASIN).
    pub asin: Option<String>,
    pub about_this_item: Vec<String>,
    pub product_overview: Vec<TableRow>,
    pub technical_details: Vec<TableRow>,
    pub product_details: Vec<TableRow>,
    pub ingredients: Option<String>,
}

/// Share of ratings at one star level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarShare {
    pub stars: u8,
    pub percent: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewSummary {
    pub rating: Option<f32>,
    pub rating_count: Option<u32>,
    pub distribution: Vec<StarShare>,
    pub customers_say: Option<String>,
    pub key_aspects: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub reviewer: Option<String>,
    pub rating: Option<f32>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub date: Option<String>,
    pub variant: Option<String>,
    pub verified_purchase: bool,
    pub helpful_votes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewsBlock {
    pub summary: ReviewSummary,
    pub reviews: Vec<Review>,
}

impl ReviewsBlock {
    pub fn is_empty(&self) -> bool {
        self.reviews.is_empty() && self.summary.rating.is_none()
    }
}

/// Image counts inside a [`CompletenessReport`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStats {
    pub hero: usize,
    pub gallery: usize,
    pub aplus: usize,
    pub review: usize,
    pub total: usize,
}

/// Completeness scoring of one envelope. Derived, never mutated in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletenessReport {
    /// 0.0 to 100.0
    pub score: f64,
    pub missing_required: Vec<String>,
    pub missing_optional: Vec<String>,
    pub warnings: Vec<String>,
    pub image_stats: ImageStats,
}

/// Everything one task extracted. Built only by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub url: String,
    pub text: ProductText,
    pub images: ImageCollection,
    pub reviews: ReviewsBlock,
    pub validation: Option<CompletenessReport>,
    pub errors: Vec<String>,
}

impl ResultEnvelope {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// True when there is something worth writing a report about.
    pub fn is_reportable(&self) -> bool {
        let has_title = self
            .text
            .title
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty());
        has_title || !self.images.is_empty() || !self.reviews.reviews.is_empty()
    }
}

/// Compute a SHA-256 hash of a byte payload, returned as 64-char hex.
pub fn compute_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}
