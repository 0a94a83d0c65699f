//! Completeness scoring of a finished envelope.

use std::collections::HashSet;

use crate::models::{CompletenessReport, ImageStats, ResultEnvelope};

const REQUIRED_WEIGHT: f64 = 40.0 / 3.0;
const OPTIONAL_WEIGHT: f64 = 10.0;
const IMAGE_WEIGHT: f64 = 5.0;
const REVIEW_WEIGHT: f64 = 5.0;

fn present(s: &Option<String>) -> bool {
    s.as_deref().is_some_and(|v| !v.trim().is_empty())
}

fn image_stats(envelope: &ResultEnvelope) -> ImageStats {
    let images = &envelope.images;
    ImageStats {
        hero: images.hero.len(),
        gallery: images.gallery.len(),
        aplus: images.aplus_brand.len()
            + images.aplus_product.len()
            + images.aplus_manufacturer.len(),
        review: images.review_images.len(),
        total: images.total(),
    }
}

/// Score `envelope` out of 100 and collect advisory warnings.
///
/// Warnings never change the score.
pub fn score(envelope: &ResultEnvelope) -> CompletenessReport {
    let text = &envelope.text;
    let mut report = CompletenessReport {
        image_stats: image_stats(envelope),
        ..Default::default()
    };
    let mut earned = 0.0;
    let mut possible = 0.0;

    let required = [
        ("title", present(&text.title)),
        ("asin", present(&text.asin)),
        ("price", text.price.is_some()),
    ];
    for (name, found) in required {
        possible += REQUIRED_WEIGHT;
        if found {
            earned += REQUIRED_WEIGHT;
        } else {
            report.missing_required.push(name.to_string());
        }
    }

    let optional = [
        ("brand", present(&text.brand)),
        ("about_this_item", !text.about_this_item.is_empty()),
        ("product_overview", !text.product_overview.is_empty()),
    ];
    for (name, found) in optional {
        possible += OPTIONAL_WEIGHT;
        if found {
            earned += OPTIONAL_WEIGHT;
        } else {
            report.missing_optional.push(name.to_string());
        }
    }

    let stats = &report.image_stats;
    for found in [stats.total > 0, stats.hero > 0, stats.gallery > 0] {
        possible += IMAGE_WEIGHT;
        if found {
            earned += IMAGE_WEIGHT;
        }
    }

    let reviews = &envelope.reviews;
    for found in [reviews.summary.rating.is_some(), !reviews.reviews.is_empty()] {
        possible += REVIEW_WEIGHT;
        if found {
            earned += REVIEW_WEIGHT;
        }
    }

    report.score = earned / possible * 100.0;
    report.warnings = warnings(envelope, &report.image_stats);

    tracing::debug!(
        score = format!("{:.1}", report.score),
        missing = ?report.missing_required,
        warnings = report.warnings.len(),
        "Envelope scored"
    );
    report
}

fn warnings(envelope: &ResultEnvelope, stats: &ImageStats) -> Vec<String> {
    let mut warnings = Vec::new();

    if stats.total == 0 {
        warnings.push("No images found".to_string());
    } else if stats.hero == 0 {
        warnings.push("No hero image found".to_string());
    }

    let reviews = &envelope.reviews;
    if let Some(rating) = reviews.summary.rating
        && !(0.0..=5.0).contains(&rating)
    {
        warnings.push(format!("Invalid rating value: {rating}"));
    }
    for (i, review) in reviews.reviews.iter().enumerate() {
        if let Some(rating) = review.rating
            && !(0.0..=5.0).contains(&rating)
        {
            warnings.push(format!("Review {} has invalid rating: {rating}", i + 1));
        }
    }

    let mut seen = HashSet::new();
    let duplicates = reviews
        .reviews
        .iter()
        .filter_map(|r| r.body.as_deref())
        .filter(|body| !seen.insert(*body))
        .count();
    if duplicates > 0 {
        warnings.push(format!("Found {duplicates} duplicate reviews"));
    }

    for error in &envelope.errors {
        warnings.push(format!("Extraction error: {error}"));
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Price, Review, SavedAsset, TableRow};
    use std::path::PathBuf;

    fn asset(path: &str) -> SavedAsset {
        SavedAsset {
            content_hash: path.to_string(),
            output_path: PathBuf::from(path),
            source_url: format!("https://m.media-amazon.com/{path}"),
            alt_text: None,
        }
    }

    fn complete() -> ResultEnvelope {
        let mut e = ResultEnvelope::new("https://www.amazon.com/dp/B0TEST0001");
        e.text.title = Some("Rocket Skates".into());
        e.text.asin = Some("B0TEST0001".into());
        e.text.price = Some(Price {
            amount: 19.99,
            currency: Some("$".into()),
            display: "$19.99".into(),
        });
        e.text.brand = Some("Acme".into());
        e.text.about_this_item = vec!["Fast".into()];
        e.text.product_overview = vec![TableRow::new("Colour", "Red")];
        e.images.hero.push(asset("hero/hero.jpg"));
        e.images.gallery.push(asset("product/product1.jpg"));
        e.reviews.summary.rating = Some(4.5);
        e.reviews.reviews.push(Review {
            body: Some("Works".into()),
            rating: Some(5.0),
            ..Default::default()
        });
        e
    }

    #[test]
    fn complete_envelope_scores_100() {
        let report = score(&complete());
        assert!((report.score - 100.0).abs() < 1e-9);
        assert!(report.missing_required.is_empty());
        assert!(report.warnings.is_empty());
        assert_eq!(report.image_stats.total, 2);
    }

    #[test]
    fn empty_envelope_scores_zero_and_lists_gaps() {
        let report = score(&ResultEnvelope::new("u"));
        assert_eq!(report.score, 0.0);
        assert_eq!(report.missing_required, vec!["title", "asin", "price"]);
        assert_eq!(
            report.missing_optional,
            vec!["brand", "about_this_item", "product_overview"]
        );
        assert_eq!(report.warnings, vec!["No images found"]);
    }

    #[test]
    fn required_fields_outweigh_images() {
        let mut title_only = ResultEnvelope::new("u");
        title_only.text.title = Some("T".into());
        let mut hero_only = ResultEnvelope::new("u");
        hero_only.images.hero.push(asset("hero/hero.jpg"));

        let title_score = score(&title_only).score;
        let hero_score = score(&hero_only).score;
        assert!(title_score > hero_score);
        assert!((hero_score - 10.0 / 95.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn warnings_do_not_change_score() {
        let clean = score(&complete()).score;

        let mut noisy = complete();
        noisy.reviews.summary.rating = Some(7.0);
        noisy.reviews.reviews.push(Review {
            body: Some("Works".into()),
            ..Default::default()
        });
        noisy.errors.push("reviews: timed out".into());
        let report = score(&noisy);

        assert_eq!(report.score, clean);
        assert!(report.warnings.contains(&"Invalid rating value: 7".to_string()));
        assert!(report.warnings.contains(&"Found 1 duplicate reviews".to_string()));
        assert!(report.warnings.iter().any(|w| w.starts_with("Extraction error")));
    }
}
