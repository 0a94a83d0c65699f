//! Text field extractors: title, brand, prices, identifier, bullets,
//! tables and ingredients.

use std::sync::LazyLock;

use regex::Regex;

use crate::element::NodeSource;
use crate::extractor::{
    Audit, FieldExtractor, LocatorStrategy, RawValue, ReadMode, non_empty_text,
};
use crate::metrics::MetricsTracker;
use crate::models::{Price, ProductText, TableRow};
use crate::retry::RetryPolicy;
use crate::util::clean_text;

/// Phrases removed from bullets, table values and ingredients.
pub const AD_PHRASES: &[&str] = &[
    "Shop our products",
    "Visit the store",
    "From the brand",
    "Sponsored",
    "Ad",
    "See all reviews",
    "Report an issue",
    "How customer reviews and ratings work",
];

static AD_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    let alternatives: Vec<String> = AD_PHRASES.iter().map(|p| regex::escape(p)).collect();
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|"))).expect("static regex")
});
static PRICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<cur>[$€£¥₹]|USD|EUR|GBP)?\s*(?P<num>\d{1,3}(?:[,.]\d{3})*(?:[.,]\d{1,2})?|\d+(?:[.,]\d{1,2})?)")
        .expect("static regex")
});
static ASIN_IN_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:/dp/|/gp/product/|/product/|asin=)([A-Z0-9]{10})(?:[/?&#]|$)")
        .expect("static regex")
});
static BARE_ASIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9]{10}$").expect("static regex"));

/// Prices outside this range are treated as misreads.
const PLAUSIBLE_PRICE: std::ops::Range<f64> = 0.01..1_000_000.0;

// ---------------------------------------------------------------------------
// Strategy tables
// ---------------------------------------------------------------------------

const TITLE: &[LocatorStrategy] = &[
    LocatorStrategy::new("product_title", "#productTitle", ReadMode::Text),
    LocatorStrategy::new("title_block", "#title", ReadMode::Text),
    LocatorStrategy::new("og_title", "meta[property=\"og:title\"]", ReadMode::Attr("content")),
];

const ASIN: &[LocatorStrategy] = &[
    LocatorStrategy::new("url", "", ReadMode::PageUrl),
    LocatorStrategy::new("asin_input", "#ASIN", ReadMode::Attr("value")),
    LocatorStrategy::new("data_asin", "[data-asin]", ReadMode::Attr("data-asin")),
];

const BRAND: &[LocatorStrategy] = &[
    LocatorStrategy::new("byline", "#bylineInfo", ReadMode::Text),
    LocatorStrategy::new("store_link", ".a-link-normal[href*=\"/stores/\"]", ReadMode::Text),
    LocatorStrategy::new("brand_id", "#brand", ReadMode::Text),
    LocatorStrategy::new("byline_feature", "[data-feature-name=\"bylineInfo\"]", ReadMode::Text),
];

const PRICE_NOW: &[LocatorStrategy] = &[
    LocatorStrategy::new(
        "core_price",
        "#corePrice_feature_div .a-price:not(.a-text-price) .a-offscreen",
        ReadMode::Text,
    ),
    LocatorStrategy::new("offscreen", ".a-price .a-offscreen", ReadMode::Text),
    LocatorStrategy::new("our_price", "#priceblock_ourprice", ReadMode::Text),
    LocatorStrategy::new("deal_price", "#priceblock_dealprice", ReadMode::Text),
    LocatorStrategy::new("sale_price", "#priceblock_saleprice", ReadMode::Text),
    LocatorStrategy::new("price_whole", ".a-price-whole", ReadMode::Text),
    LocatorStrategy::new("color_price", "[data-a-color=\"price\"] .a-offscreen", ReadMode::Text),
];

const PRICE_LIST: &[LocatorStrategy] = &[
    LocatorStrategy::new("text_price", ".a-text-price .a-offscreen", ReadMode::Text),
    LocatorStrategy::new("list_price", "#listPrice", ReadMode::Text),
    LocatorStrategy::new("strike_price", ".a-price[data-a-strike=\"true\"] .a-offscreen", ReadMode::Text),
];

const ABOUT: &[LocatorStrategy] = &[
    LocatorStrategy::new("feature_bullets", "#feature-bullets ul", ReadMode::ListItems("li")),
    LocatorStrategy::new("facts_expander", "#productFactsDesktopExpander ul", ReadMode::ListItems("li")),
    LocatorStrategy::new(
        "bullets_feature",
        "[data-feature-name=\"featurebullets\"] ul",
        ReadMode::ListItems("li"),
    ),
];

const OVERVIEW: &[LocatorStrategy] = &[
    LocatorStrategy::new("overview_table", "#productOverview_feature_div table", ReadMode::Table),
    LocatorStrategy::new("prod_details_table", "#prodDetails table", ReadMode::Table),
    LocatorStrategy::new("micro_table", "table.a-normal.a-spacing-micro", ReadMode::Table),
];

const TECHNICAL: &[LocatorStrategy] = &[
    LocatorStrategy::new("tech_spec", "#productDetails_techSpec_section_1", ReadMode::Table),
    LocatorStrategy::new("tech_specifications", "#techSpecifications", ReadMode::Table),
    LocatorStrategy::new(
        "tech_feature",
        "[data-feature-name=\"technicalSpecifications\"]",
        ReadMode::Table,
    ),
];

const DETAILS: &[LocatorStrategy] = &[
    LocatorStrategy::new("detail_sections", "#productDetails_detailBullets_sections1", ReadMode::Table),
    LocatorStrategy::new("detail_bullets_table", "#detailBullets_feature_div", ReadMode::Table),
    LocatorStrategy::new("prod_details", "#prodDetails", ReadMode::Table),
    LocatorStrategy::new(
        "detail_bullets_items",
        "#detailBullets_feature_div",
        ReadMode::KeyValueItems("li"),
    ),
];

const INGREDIENTS: &[LocatorStrategy] = &[
    LocatorStrategy::new("important_info", "#important-information .content", ReadMode::Text),
    LocatorStrategy::new("important_section", "#important-information .a-section", ReadMode::Text),
    LocatorStrategy::new("ingredients_feature", "#ingredients_feature_div", ReadMode::Text),
    LocatorStrategy::new("ingredients_data", "[data-feature-name=\"ingredients\"]", ReadMode::Text),
];

// ---------------------------------------------------------------------------
// Refiners
// ---------------------------------------------------------------------------

/// Remove advertising phrases (whole words, any case).
pub fn strip_ad_phrases(text: &str) -> String {
    clean_text(&AD_PHRASE.replace_all(text, " "))
}

/// Parse the first price in `text`.
pub fn parse_price(text: &str) -> Option<Price> {
    let caps = PRICE.captures(text)?;
    let raw = caps.name("num")?.as_str();
    let amount = normalize_amount(raw)?;
    if !PLAUSIBLE_PRICE.contains(&amount) {
        return None;
    }
    let currency = caps.name("cur").map(|c| match c.as_str() {
        "$" => "USD".to_string(),
        "€" => "EUR".to_string(),
        "£" => "GBP".to_string(),
        "¥" => "JPY".to_string(),
        "₹" => "INR".to_string(),
        other => other.to_string(),
    });
    Some(Price {
        amount,
        currency,
        display: clean_text(caps.get(0)?.as_str()),
    })
}

/// `1,299.99`, `1.299,99` and `19,99` to a float.
fn normalize_amount(raw: &str) -> Option<f64> {
    let last_sep = raw.rfind([',', '.']);
    let normalized = match last_sep {
        Some(i) if raw.len() - i - 1 <= 2 => {
            let (int, frac) = raw.split_at(i);
            format!("{}.{}", int.replace([',', '.'], ""), &frac[1..])
        }
        _ => raw.replace([',', '.'], ""),
    };
    normalized.parse().ok()
}

/// Product identifier from a URL or a bare attribute value.
pub fn parse_asin(text: &str) -> Option<String> {
    let text = text.trim();
    if let Some(caps) = ASIN_IN_URL.captures(text) {
        return Some(caps[1].to_ascii_uppercase());
    }
    BARE_ASIN.is_match(text).then(|| text.to_string())
}

fn refine_brand(raw: RawValue) -> Option<String> {
    let text = non_empty_text(raw)?;
    let mut brand = text.as_str();
    if let Some(rest) = brand.strip_prefix("Visit the ") {
        brand = rest.strip_suffix(" Store").unwrap_or(rest);
    }
    if let Some(rest) = brand
        .strip_prefix("Brand")
        .and_then(|r| r.trim_start().strip_prefix(':'))
    {
        brand = rest;
    }
    let brand = brand.trim();
    (!brand.is_empty()).then(|| brand.to_string())
}

fn refine_price(raw: RawValue) -> Option<Price> {
    non_empty_text(raw).and_then(|t| parse_price(&t))
}

fn refine_asin(raw: RawValue) -> Option<String> {
    non_empty_text(raw).and_then(|t| parse_asin(&t))
}

fn refine_bullets(raw: RawValue) -> Option<Vec<String>> {
    let RawValue::List(items) = raw else {
        return None;
    };
    let kept: Vec<String> = items
        .iter()
        .map(|i| strip_ad_phrases(i))
        .filter(|i| !i.is_empty())
        .collect();
    (!kept.is_empty()).then_some(kept)
}

fn refine_rows(raw: RawValue) -> Option<Vec<TableRow>> {
    let RawValue::Pairs(rows) = raw else {
        return None;
    };
    let kept: Vec<TableRow> = rows
        .into_iter()
        .filter_map(|r| {
            let value = strip_ad_phrases(&r.value);
            (!value.is_empty()).then(|| TableRow::new(r.key, value))
        })
        .collect();
    (!kept.is_empty()).then_some(kept)
}

fn refine_ingredients(raw: RawValue) -> Option<String> {
    let text = non_empty_text(raw)?;
    if !text.to_lowercase().contains("ingredient") {
        return None;
    }
    let text = strip_ad_phrases(&text);
    (!text.is_empty()).then_some(text)
}

// ---------------------------------------------------------------------------
// Extractor set
// ---------------------------------------------------------------------------

/// Every text field extractor, in the order the orchestrator needs them.
#[derive(Clone)]
pub struct TextExtractors {
    pub title: FieldExtractor<String>,
    pub asin: FieldExtractor<String>,
    brand: FieldExtractor<String>,
    price: FieldExtractor<Price>,
    original_price: FieldExtractor<Price>,
    about_this_item: FieldExtractor<Vec<String>>,
    product_overview: FieldExtractor<Vec<TableRow>>,
    technical_details: FieldExtractor<Vec<TableRow>>,
    product_details: FieldExtractor<Vec<TableRow>>,
    ingredients: FieldExtractor<String>,
}

impl Default for TextExtractors {
    fn default() -> Self {
        Self {
            title: FieldExtractor::new("title", TITLE, non_empty_text),
            asin: FieldExtractor::new("asin", ASIN, refine_asin),
            brand: FieldExtractor::new("brand", BRAND, refine_brand),
            price: FieldExtractor::new("price", PRICE_NOW, refine_price),
            original_price: FieldExtractor::new("original_price", PRICE_LIST, refine_price),
            about_this_item: FieldExtractor::new("about_this_item", ABOUT, refine_bullets),
            product_overview: FieldExtractor::new("product_overview", OVERVIEW, refine_rows),
            technical_details: FieldExtractor::new("technical_details", TECHNICAL, refine_rows),
            product_details: FieldExtractor::new("product_details", DETAILS, refine_rows),
            ingredients: FieldExtractor::new("ingredients", INGREDIENTS, refine_ingredients),
        }
    }
}

/// Text fields plus the audit of every extraction that produced them.
#[derive(Debug, Default)]
pub struct TextOutcome {
    pub text: ProductText,
    pub audits: Vec<Audit>,
}

impl TextExtractors {
    /// A copy with each field's strategies ordered by past success.
    pub fn prioritized(&self, metrics: &MetricsTracker) -> Self {
        Self {
            title: self.title.prioritized(metrics),
            asin: self.asin.prioritized(metrics),
            brand: self.brand.prioritized(metrics),
            price: self.price.prioritized(metrics),
            original_price: self.original_price.prioritized(metrics),
            about_this_item: self.about_this_item.prioritized(metrics),
            product_overview: self.product_overview.prioritized(metrics),
            technical_details: self.technical_details.prioritized(metrics),
            product_details: self.product_details.prioritized(metrics),
            ingredients: self.ingredients.prioritized(metrics),
        }
    }

    /// Everything except title and identifier, which run earlier.
    pub async fn extract_details<S, L>(
        &self,
        snapshot: &S,
        live: Option<&L>,
        retry: &RetryPolicy,
    ) -> TextOutcome
    where
        S: NodeSource,
        L: NodeSource,
    {
        let mut out = TextOutcome::default();
        out.text.brand = run(&self.brand, snapshot, live, retry, &mut out.audits).await;
        out.text.price = run(&self.price, snapshot, live, retry, &mut out.audits).await;
        out.text.original_price =
            run(&self.original_price, snapshot, live, retry, &mut out.audits).await;
        out.text.about_this_item = run(&self.about_this_item, snapshot, live, retry, &mut out.audits)
            .await
            .unwrap_or_default();
        out.text.product_overview =
            run(&self.product_overview, snapshot, live, retry, &mut out.audits)
                .await
                .unwrap_or_default();
        out.text.technical_details =
            run(&self.technical_details, snapshot, live, retry, &mut out.audits)
                .await
                .unwrap_or_default();
        out.text.product_details =
            run(&self.product_details, snapshot, live, retry, &mut out.audits)
                .await
                .unwrap_or_default();
        out.text.ingredients = run(&self.ingredients, snapshot, live, retry, &mut out.audits).await;

        // A list price equal to the current one is not a discount.
        if out.text.original_price.as_ref().map(|p| p.amount)
            == out.text.price.as_ref().map(|p| p.amount)
        {
            out.text.original_price = None;
        }
        out
    }
}

/// Run one extractor under the retry policy, keeping its audit.
pub async fn run<T, S, L>(
    extractor: &FieldExtractor<T>,
    snapshot: &S,
    live: Option<&L>,
    retry: &RetryPolicy,
    audits: &mut Vec<Audit>,
) -> Option<T>
where
    S: NodeSource,
    L: NodeSource,
{
    let result = retry
        .run(extractor.category(), || extractor.extract(snapshot, live))
        .await;
    audits.push((extractor.category(), result.audit()));
    result.value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::DomSnapshot;
    use std::time::Duration;

    type NoLive = DomSnapshot;

    const PAGE: &str = r#"
      <html><body>
        <span id="productTitle">  Acme   Rocket Skates  </span>
        <a id="bylineInfo">Visit the Acme Store</a>
        <div id="corePrice_feature_div">
          <span class="a-price"><span class="a-offscreen">$1,299.99</span></span>
          <span class="a-price a-text-price" data-a-strike="true"><span class="a-offscreen">$1,499.00</span></span>
        </div>
        <div id="feature-bullets"><ul>
          <li>Fast wheels</li><li>Sponsored</li><li>Ad free and adjustable straps</li>
        </ul></div>
        <div id="productOverview_feature_div"><table>
          <tr><td>Brand</td><td>Acme</td></tr><tr><td>Color</td><td>Red</td></tr>
        </table></div>
        <div id="detailBullets_feature_div"><ul>
          <li>Item Weight : 2 pounds</li><li>Manufacturer : Acme Corp</li>
        </ul></div>
        <div id="important-information">
          <div class="a-section"><h4>Safety</h4> <p>Wear a helmet</p></div>
          <div class="a-section"><h4>Ingredients</h4> <p>Ingredients: steel, rubber</p></div>
        </div>
      </body></html>"#;

    fn retry() -> RetryPolicy {
        RetryPolicy::new(0, Duration::ZERO)
    }

    #[tokio::test]
    async fn extracts_detail_fields() {
        let snap = DomSnapshot::parse(PAGE, "https://www.amazon.com/dp/B0ACME0001").unwrap();
        let out = TextExtractors::default()
            .extract_details(&snap, None::<&NoLive>, &retry())
            .await;
        let text = out.text;

        assert_eq!(text.brand.as_deref(), Some("Acme"));
        let price = text.price.unwrap();
        assert_eq!(price.amount, 1299.99);
        assert_eq!(price.currency.as_deref(), Some("USD"));
        assert_eq!(text.original_price.unwrap().amount, 1499.0);
        assert_eq!(
            text.about_this_item,
            vec!["Fast wheels".to_string(), "free and adjustable straps".to_string()]
        );
        assert_eq!(text.product_overview.len(), 2);
        assert_eq!(text.product_details[0], TableRow::new("Item Weight", "2 pounds"));
        assert_eq!(text.ingredients.as_deref(), Some("Ingredients Ingredients: steel, rubber"));
        assert_eq!(out.audits.len(), 8);
    }

    #[tokio::test]
    async fn title_and_asin_from_url() {
        let snap = DomSnapshot::parse(PAGE, "https://www.amazon.com/Acme/dp/b0acme0001?th=1").unwrap();
        let ex = TextExtractors::default();
        let title = ex.title.extract(&snap, None::<&NoLive>).await;
        assert_eq!(title.value.as_deref(), Some("Acme Rocket Skates"));
        let asin = ex.asin.extract(&snap, None::<&NoLive>).await;
        assert_eq!(asin.value.as_deref(), Some("B0ACME0001"));
        assert_eq!(asin.strategy_used, Some("url"));
    }

    #[tokio::test]
    async fn asin_falls_back_to_page_attribute() {
        let snap = DomSnapshot::parse(
            r#"<div data-asin=""></div><input id="ASIN" value="B0FALLBACK">"#,
            "https://example.com/some/listing",
        )
        .unwrap();
        let asin = TextExtractors::default()
            .asin
            .extract(&snap, None::<&NoLive>)
            .await;
        assert_eq!(asin.value.as_deref(), Some("B0FALLBACK"));
        assert_eq!(asin.attempted, vec!["url", "asin_input"]);
    }

    #[test]
    fn price_parsing() {
        assert_eq!(parse_price("$19.99").unwrap().amount, 19.99);
        assert_eq!(parse_price("€1.299,50").unwrap().amount, 1299.5);
        assert_eq!(parse_price("£7").unwrap().currency.as_deref(), Some("GBP"));
        assert_eq!(parse_price("19,99 EUR").unwrap().amount, 19.99);
        assert!(parse_price("$0.00").is_none());
        assert!(parse_price("Currently unavailable").is_none());
    }

    #[test]
    fn ad_phrases_are_whole_words() {
        assert_eq!(strip_ad_phrases("Adjustable Ad strap"), "Adjustable strap");
        assert_eq!(strip_ad_phrases("See all reviews"), "");
    }

    #[test]
    fn brand_cleanup() {
        assert_eq!(
            refine_brand(RawValue::Text("Visit the Acme Store".into())).as_deref(),
            Some("Acme")
        );
        assert_eq!(refine_brand(RawValue::Text("Brand: Zeta".into())).as_deref(), Some("Zeta"));
        assert_eq!(refine_brand(RawValue::Text("Brand : Zeta".into())).as_deref(), Some("Zeta"));
        assert_eq!(refine_brand(RawValue::Text("Storeroom Co".into())).as_deref(), Some("Storeroom Co"));
    }
}
