//! Markdown report written next to the saved assets.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use quarry_core::error::AppError;
use quarry_core::models::{AssetCategory, ResultEnvelope, TableRow};
use quarry_core::traits::ReportSink;

#[derive(Debug, Clone, Default)]
pub struct MarkdownReportSink;

impl MarkdownReportSink {
    pub fn new() -> Self {
        Self
    }
}

fn heading(category: AssetCategory) -> &'static str {
    match category {
        AssetCategory::Hero => "Hero Image",
        AssetCategory::Gallery => "Product Images",
        AssetCategory::AplusBrand => "From the Brand",
        AssetCategory::AplusProduct => "Product Description",
        AssetCategory::AplusManufacturer => "From the Manufacturer",
        AssetCategory::ReviewImages => "Review Images",
    }
}

fn relative(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn table(out: &mut String, title: &str, rows: &[TableRow]) {
    if rows.is_empty() {
        return;
    }
    let _ = writeln!(out, "## {title}\n\n| | |\n|---|---|");
    for row in rows {
        let _ = writeln!(out, "| {} | {} |", row.key.replace('|', "/"), row.value.replace('|', "/"));
    }
    out.push('\n');
}

/// Render `envelope` as Markdown. Asset links are relative to `output_dir`.
pub fn render(envelope: &ResultEnvelope, output_dir: &Path) -> String {
    let text = &envelope.text;
    let mut out = String::new();

    let title = text.title.as_deref().unwrap_or("Untitled product");
    let _ = writeln!(out, "# {title}\n");
    let _ = writeln!(out, "- **URL:** {}", envelope.url);
    if let Some(asin) = &text.asin {
        let _ = writeln!(out, "- **ASIN:** {asin}");
    }
    if let Some(brand) = &text.brand {
        let _ = writeln!(out, "- **Brand:** {brand}");
    }
    if let Some(price) = &text.price {
        let _ = write!(out, "- **Price:** {}", price.display);
        if let Some(list) = &text.original_price {
            let _ = write!(out, " (was {})", list.display);
        }
        out.push('\n');
    }
    out.push('\n');

    if !text.about_this_item.is_empty() {
        out.push_str("## About this item\n\n");
        for bullet in &text.about_this_item {
            let _ = writeln!(out, "- {bullet}");
        }
        out.push('\n');
    }
    table(&mut out, "Product overview", &text.product_overview);
    table(&mut out, "Technical details", &text.technical_details);
    table(&mut out, "Product details", &text.product_details);
    if let Some(ingredients) = &text.ingredients {
        let _ = writeln!(out, "## Ingredients\n\n{ingredients}\n");
    }

    for category in AssetCategory::ALL {
        let assets = envelope.images.get(category);
        if assets.is_empty() {
            continue;
        }
        let _ = writeln!(out, "## {}\n", heading(category));
        for asset in assets {
            let alt = asset.alt_text.as_deref().unwrap_or_default();
            let _ = writeln!(out, "![{alt}]({})", relative(&asset.output_path, output_dir));
        }
        out.push('\n');
    }

    let reviews = &envelope.reviews;
    if !reviews.is_empty() {
        out.push_str("## Reviews\n\n");
        let summary = &reviews.summary;
        if let Some(rating) = summary.rating {
            let _ = write!(out, "**{rating:.1} out of 5**");
            if let Some(count) = summary.rating_count {
                let _ = write!(out, " ({count} ratings)");
            }
            out.push_str("\n\n");
        }
        for share in &summary.distribution {
            let _ = writeln!(out, "- {} star: {}%", share.stars, share.percent);
        }
        if let Some(say) = &summary.customers_say {
            let _ = writeln!(out, "\n> {say}");
        }
        if !summary.key_aspects.is_empty() {
            let _ = writeln!(out, "\nKey aspects: {}", summary.key_aspects.join(", "));
        }
        for review in &reviews.reviews {
            let _ = write!(out, "\n### {}", review.title.as_deref().unwrap_or("Review"));
            if let Some(rating) = review.rating {
                let _ = write!(out, " ({rating:.1}/5)");
            }
            out.push('\n');
            let by = review.reviewer.as_deref().unwrap_or("Anonymous");
            let _ = write!(out, "\n*{by}");
            if let Some(date) = &review.date {
                let _ = write!(out, ", {date}");
            }
            if review.verified_purchase {
                out.push_str(", verified purchase");
            }
            out.push_str("*\n");
            if let Some(body) = &review.body {
                let _ = writeln!(out, "\n{body}");
            }
        }
        out.push('\n');
    }

    if let Some(validation) = &envelope.validation {
        let _ = writeln!(out, "## Validation\n\n- **Completeness:** {:.1}%", validation.score);
        if !validation.missing_required.is_empty() {
            let _ = writeln!(out, "- **Missing:** {}", validation.missing_required.join(", "));
        }
        for warning in &validation.warnings {
            let _ = writeln!(out, "- {warning}");
        }
    }
    out
}

impl ReportSink for MarkdownReportSink {
    async fn generate(
        &self,
        envelope: &ResultEnvelope,
        asset_paths: &[PathBuf],
        output_dir: &Path,
    ) -> Result<PathBuf, AppError> {
        let stem = output_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "report".to_string());
        let path = output_dir.join(format!("{stem}.md"));
        let markdown = render(envelope, output_dir);
        tokio::fs::write(&path, markdown).await?;
        tracing::debug!(path = %path.display(), assets = asset_paths.len(), "Report written");
        Ok(path)
    }
}
