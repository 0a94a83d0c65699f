//! Review summary, individual reviews and review-gallery images.

use std::sync::LazyLock;

use regex::Regex;

use crate::element::NodeSource;
use crate::extractor::{
    Audit, FieldExtractor, FieldRead, LocatorStrategy, RawValue, ReadMode, Record, RecordField,
    non_empty_list, non_empty_text,
};
use crate::images::is_excluded_url;
use crate::metrics::MetricsTracker;
use crate::models::{ImageReference, Review, ReviewSummary, ReviewsBlock, StarShare};
use crate::retry::RetryPolicy;
use crate::text::run;

static RATING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d(?:[.,]\d+)?)").expect("static regex"));
static COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d[\d,.\s]*)").expect("static regex"));
static HISTOGRAM_ROW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)([1-5])\s*stars?\D*?(\d{1,3})\s*%").expect("static regex"));

const RATING_STRATEGIES: &[LocatorStrategy] = &[
    LocatorStrategy::new("acr_popover", "#acrPopover", ReadMode::TitleOrText),
    LocatorStrategy::new("out_of_text", "[data-hook=\"rating-out-of-text\"]", ReadMode::Text),
    LocatorStrategy::new("star_icon", ".a-icon-star span", ReadMode::Text),
];

const COUNT_STRATEGIES: &[LocatorStrategy] = &[
    LocatorStrategy::new("acr_count", "#acrCustomerReviewText", ReadMode::Text),
    LocatorStrategy::new("total_count", "[data-hook=\"total-review-count\"]", ReadMode::Text),
];

const ROW_TEXT: &[RecordField] = &[RecordField {
    name: "row",
    selector: None,
    read: FieldRead::Text,
}];

const HISTOGRAM_STRATEGIES: &[LocatorStrategy] = &[
    LocatorStrategy::new("histogram_rows", "#histogramTable tr", ReadMode::Records(ROW_TEXT)),
    LocatorStrategy::new("histogram_items", "#histogramTable li", ReadMode::Records(ROW_TEXT)),
    LocatorStrategy::new("histogram_widget", ".cr-widget-Histogram .a-histogram-row", ReadMode::Records(ROW_TEXT)),
];

const SAY_STRATEGIES: &[LocatorStrategy] = &[
    LocatorStrategy::new("summarization", "[data-hook=\"cr-summarization-attribute\"]", ReadMode::Text),
    LocatorStrategy::new("product_summary", "#product-summary p", ReadMode::Text),
];

const ASPECT_STRATEGIES: &[LocatorStrategy] = &[
    LocatorStrategy::new("lighthouse_class", ".cr-lighthouse-term", ReadMode::EachText),
    LocatorStrategy::new("lighthouse_hook", "[data-hook=\"cr-lighthouse-term\"]", ReadMode::EachText),
];

const REVIEW_FIELDS: &[RecordField] = &[
    RecordField {
        name: "reviewer",
        selector: Some(".a-profile-name"),
        read: FieldRead::Text,
    },
    RecordField {
        name: "rating",
        selector: Some("[data-hook=\"review-star-rating\"] span, .a-icon-star span, .a-icon-alt"),
        read: FieldRead::Text,
    },
    RecordField {
        name: "title",
        selector: Some("[data-hook=\"review-title\"] span, .review-title"),
        read: FieldRead::Text,
    },
    RecordField {
        name: "body",
        selector: Some("[data-hook=\"review-body\"] span, .review-text"),
        read: FieldRead::Text,
    },
    RecordField {
        name: "date",
        selector: Some("[data-hook=\"review-date\"], .review-date"),
        read: FieldRead::Text,
    },
    RecordField {
        name: "variant",
        selector: Some("[data-hook=\"format-strip\"]"),
        read: FieldRead::Text,
    },
    RecordField {
        name: "verified",
        selector: Some("[data-hook=\"avp-badge\"]"),
        read: FieldRead::Presence,
    },
    RecordField {
        name: "helpful",
        selector: Some("[data-hook=\"helpful-vote-statement\"]"),
        read: FieldRead::Text,
    },
    RecordField {
        name: "html",
        selector: None,
        read: FieldRead::OuterHtml,
    },
];

const REVIEW_STRATEGIES: &[LocatorStrategy] = &[
    LocatorStrategy::new("review_hook", "[data-hook=\"review\"]", ReadMode::Records(REVIEW_FIELDS)),
    LocatorStrategy::new("review_class", "div.review", ReadMode::Records(REVIEW_FIELDS)),
    LocatorStrategy::new("review_section", ".a-section.review", ReadMode::Records(REVIEW_FIELDS)),
];

const REVIEW_IMAGE_STRATEGIES: &[LocatorStrategy] = &[
    LocatorStrategy::new("images_carousel", "#cm-cr-dp-review-images-carousel img", ReadMode::EachImageUrl),
    LocatorStrategy::new("media_gallery", "[data-hook=\"cr-media-gallery-images\"] img", ReadMode::EachImageUrl),
];

// ---------------------------------------------------------------------------
// Refiners
// ---------------------------------------------------------------------------

/// `"4.5 out of 5 stars"` or `"4,5 von 5"` to 4.5; outside 0..=5 is a misread.
pub fn parse_rating(text: &str) -> Option<f32> {
    let raw = RATING.captures(text)?.get(1)?.as_str().replace(',', ".");
    let rating: f32 = raw.parse().ok()?;
    (0.0..=5.0).contains(&rating).then_some(rating)
}

/// `"1,234 global ratings"` to 1234.
pub fn parse_count(text: &str) -> Option<u32> {
    let raw = COUNT.captures(text)?.get(1)?.as_str();
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    digits.parse().ok()
}

fn refine_rating(raw: RawValue) -> Option<f32> {
    non_empty_text(raw).and_then(|t| parse_rating(&t))
}

fn refine_count(raw: RawValue) -> Option<u32> {
    non_empty_text(raw).and_then(|t| parse_count(&t))
}

fn field<'r>(record: &'r Record, name: &str) -> Option<&'r str> {
    record
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, v)| v.as_str())
}

fn refine_histogram(raw: RawValue) -> Option<Vec<StarShare>> {
    let RawValue::Records(rows) = raw else {
        return None;
    };
    let mut shares: Vec<StarShare> = rows
        .iter()
        .filter_map(|r| field(r, "row"))
        .filter_map(|text| {
            let caps = HISTOGRAM_ROW.captures(text)?;
            Some(StarShare {
                stars: caps[1].parse().ok()?,
                percent: caps[2].parse::<u8>().ok().filter(|p| *p <= 100)?,
            })
        })
        .collect();
    shares.sort_by(|a, b| b.stars.cmp(&a.stars));
    shares.dedup_by_key(|s| s.stars);
    (!shares.is_empty()).then_some(shares)
}

fn is_sponsored(record: &Record) -> bool {
    field(record, "html").is_some_and(|html| {
        let html = html.to_lowercase();
        html.contains("sponsored") || html.contains("advertisement")
    })
}

fn to_review(record: &Record) -> Option<Review> {
    if is_sponsored(record) {
        tracing::debug!("Skipping sponsored review");
        return None;
    }
    let text = |name: &str| field(record, name).map(str::to_string);
    let review = Review {
        reviewer: text("reviewer"),
        rating: field(record, "rating").and_then(parse_rating),
        title: text("title"),
        body: text("body"),
        date: text("date"),
        variant: text("variant"),
        verified_purchase: field(record, "verified") == Some("true"),
        helpful_votes: text("helpful"),
    };
    (review.rating.is_some() || review.body.is_some()).then_some(review)
}

fn refine_reviews(raw: RawValue) -> Option<Vec<Review>> {
    let RawValue::Records(records) = raw else {
        return None;
    };
    let reviews: Vec<Review> = records.iter().filter_map(to_review).collect();
    (!reviews.is_empty()).then_some(reviews)
}

// ---------------------------------------------------------------------------
// Extractor set
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ReviewExtractors {
    rating: FieldExtractor<f32>,
    rating_count: FieldExtractor<u32>,
    distribution: FieldExtractor<Vec<StarShare>>,
    customers_say: FieldExtractor<String>,
    key_aspects: FieldExtractor<Vec<String>>,
    reviews: FieldExtractor<Vec<Review>>,
    images: FieldExtractor<Vec<String>>,
}

impl Default for ReviewExtractors {
    fn default() -> Self {
        Self {
            rating: FieldExtractor::new("review_rating", RATING_STRATEGIES, refine_rating),
            rating_count: FieldExtractor::new("review_count", COUNT_STRATEGIES, refine_count),
            distribution: FieldExtractor::new("review_histogram", HISTOGRAM_STRATEGIES, refine_histogram),
            customers_say: FieldExtractor::new("customers_say", SAY_STRATEGIES, non_empty_text),
            key_aspects: FieldExtractor::new("key_aspects", ASPECT_STRATEGIES, non_empty_list),
            reviews: FieldExtractor::new("reviews", REVIEW_STRATEGIES, refine_reviews),
            images: FieldExtractor::new("review_images", REVIEW_IMAGE_STRATEGIES, non_empty_list),
        }
    }
}

/// Reviews, the review images still to be acquired, and audits.
#[derive(Debug, Default)]
pub struct ReviewsOutcome {
    pub block: ReviewsBlock,
    pub images: Vec<ImageReference>,
    pub audits: Vec<Audit>,
}

impl ReviewExtractors {
    pub fn prioritized(&self, metrics: &MetricsTracker) -> Self {
        Self {
            rating: self.rating.prioritized(metrics),
            rating_count: self.rating_count.prioritized(metrics),
            distribution: self.distribution.prioritized(metrics),
            customers_say: self.customers_say.prioritized(metrics),
            key_aspects: self.key_aspects.prioritized(metrics),
            reviews: self.reviews.prioritized(metrics),
            images: self.images.prioritized(metrics),
        }
    }

    /// Extract the summary and at most `max_reviews` non-sponsored reviews.
    pub async fn extract<S, L>(
        &self,
        snapshot: &S,
        live: Option<&L>,
        retry: &RetryPolicy,
        max_reviews: usize,
    ) -> ReviewsOutcome
    where
        S: NodeSource,
        L: NodeSource,
    {
        let mut out = ReviewsOutcome::default();
        let audits = &mut out.audits;

        out.block.summary = ReviewSummary {
            rating: run(&self.rating, snapshot, live, retry, audits).await,
            rating_count: run(&self.rating_count, snapshot, live, retry, audits).await,
            distribution: run(&self.distribution, snapshot, live, retry, audits)
                .await
                .unwrap_or_default(),
            customers_say: run(&self.customers_say, snapshot, live, retry, audits).await,
            key_aspects: run(&self.key_aspects, snapshot, live, retry, audits)
                .await
                .unwrap_or_default(),
        };

        let mut reviews = run(&self.reviews, snapshot, live, retry, audits)
            .await
            .unwrap_or_default();
        reviews.truncate(max_reviews);
        out.block.reviews = reviews;

        let urls = run(&self.images, snapshot, live, retry, audits)
            .await
            .unwrap_or_default();
        let mut seen = std::collections::HashSet::new();
        out.images = urls
            .into_iter()
            .filter(|u| !is_excluded_url(u) && seen.insert(u.clone()))
            .enumerate()
            .map(|(i, url)| ImageReference::standalone(url, i))
            .collect();

        tracing::debug!(
            reviews = out.block.reviews.len(),
            images = out.images.len(),
            rating = ?out.block.summary.rating,
            "Reviews extracted"
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::DomSnapshot;
    use std::time::Duration;

    type NoLive = DomSnapshot;

    fn review(id: usize, extra: &str) -> String {
        format!(
            r#"<div data-hook="review" id="r{id}">
                 <span class="a-profile-name">Reviewer {id}</span>
                 <i data-hook="review-star-rating"><span class="a-icon-alt">{id}.0 out of 5 stars</span></i>
                 <a data-hook="review-title"><span>Title {id}</span></a>
                 <span data-hook="review-date">Reviewed on March {id}, 2025</span>
                 <span data-hook="review-body"><span>Body {id}</span></span>
                 {extra}
               </div>"#
        )
    }

    fn page() -> String {
        format!(
            r#"<html><body>
              <span id="acrPopover" title="4.4 out of 5 stars"><span>4.4</span></span>
              <span id="acrCustomerReviewText">1,234 ratings</span>
              <table id="histogramTable">
                <tr><td><a>5 star</a></td><td>70%</td></tr>
                <tr><td><a>1 star</a></td><td>5%</td></tr>
              </table>
              <span class="cr-lighthouse-term">Comfort</span>
              <span class="cr-lighthouse-term">Fit</span>
              {}{}{}{}
              <div id="cm-cr-dp-review-images-carousel">
                <img src="https://m.media-amazon.com/images/I/r1._SY88.jpg">
                <img src="https://m.media-amazon.com/images/I/r2._SY88.jpg">
              </div>
            </body></html>"#,
            review(1, r#"<span data-hook="avp-badge">Verified Purchase</span>"#),
            review(2, "<span>Sponsored</span>"),
            review(3, ""),
            review(4, ""),
        )
    }

    #[tokio::test]
    async fn extracts_summary_reviews_and_images() {
        let snap = DomSnapshot::parse(&page(), "u").unwrap();
        let out = ReviewExtractors::default()
            .extract(&snap, None::<&NoLive>, &RetryPolicy::new(0, Duration::ZERO), 2)
            .await;

        let summary = &out.block.summary;
        assert_eq!(summary.rating, Some(4.4));
        assert_eq!(summary.rating_count, Some(1234));
        assert_eq!(
            summary.distribution,
            vec![StarShare { stars: 5, percent: 70 }, StarShare { stars: 1, percent: 5 }]
        );
        assert_eq!(summary.key_aspects, vec!["Comfort", "Fit"]);

        let reviews = &out.block.reviews;
        assert_eq!(reviews.len(), 2);
        assert_eq!(reviews[0].reviewer.as_deref(), Some("Reviewer 1"));
        assert_eq!(reviews[0].rating, Some(1.0));
        assert!(reviews[0].verified_purchase);
        // the sponsored review is skipped
        assert_eq!(reviews[1].title.as_deref(), Some("Title 3"));
        assert!(!reviews[1].verified_purchase);

        assert_eq!(out.images.len(), 2);
        assert_eq!(out.audits.len(), 7);
    }

    #[test]
    fn rating_and_count_parsing() {
        assert_eq!(parse_rating("4,5 von 5 Sternen"), Some(4.5));
        assert_eq!(parse_rating("7.5 out of 10"), None);
        assert_eq!(parse_count("12.345 Bewertungen"), Some(12345));
        assert_eq!(parse_count("no ratings"), None);
    }

    #[test]
    fn review_needs_rating_or_body() {
        let record: Record = vec![("reviewer", "Anon".into()), ("verified", "false".into())];
        assert!(to_review(&record).is_none());
        let record: Record = vec![("body", "Great".into())];
        assert!(to_review(&record).is_some());
    }
}
