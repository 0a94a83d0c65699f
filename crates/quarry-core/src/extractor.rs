//! Fallback-chained field extraction.
//!
//! A [`FieldExtractor`] owns an ordered list of [`LocatorStrategy`]s and a
//! refiner that turns raw page text into a typed, validated value. Each
//! strategy is tried against the snapshot first and, only when that yields
//! nothing, against the live page. The first strategy producing a valid
//! value wins; every strategy tried is recorded in
//! [`ExtractionResult::attempted`].

use crate::element::{ElementHandle, NodeSource, Tier};
use crate::error::AppError;
use crate::images;
use crate::metrics::MetricsTracker;
use crate::models::TableRow;
use crate::util::clean_text;

/// How a matched element is turned into a [`RawValue`].
#[derive(Debug, Clone, Copy)]
pub enum ReadMode {
    /// Visible text of the element.
    Text,
    /// Value of one attribute.
    Attr(&'static str),
    /// The `title` attribute if set, else the text.
    TitleOrText,
    /// Best product-image URL of the element or its first `img`.
    ImageUrl,
    /// The page URL; the selector is ignored.
    PageUrl,
    /// Key/value rows from `tr` (`th`/`td` cells) and `dt`/`dd` pairs.
    Table,
    /// Texts of descendants matching the selector.
    ListItems(&'static str),
    /// `key: value` texts of descendants matching the selector.
    KeyValueItems(&'static str),
    /// Texts of every match, gathered into one list.
    EachText,
    /// Image URLs of every match, gathered into one list.
    EachImageUrl,
    /// One record per match, fields read per [`RecordField`].
    Records(&'static [RecordField]),
}

impl ReadMode {
    /// Modes that read all matches at once instead of the first valid one.
    fn aggregates(&self) -> bool {
        matches!(
            self,
            ReadMode::EachText | ReadMode::EachImageUrl | ReadMode::Records(_)
        )
    }
}

/// How one field of a record is read.
#[derive(Debug, Clone, Copy)]
pub enum FieldRead {
    Text,
    TitleOrText,
    /// `"true"` when the selector matches anything.
    Presence,
    OuterHtml,
}

/// One named field inside a [`ReadMode::Records`] read.
#[derive(Debug, Clone, Copy)]
pub struct RecordField {
    pub name: &'static str,
    /// `None` reads the record element itself.
    pub selector: Option<&'static str>,
    pub read: FieldRead,
}

/// A record as read from the page: field name to cleaned text.
pub type Record = Vec<(&'static str, String)>;

/// Category name plus the value-less trail of one extraction.
pub type Audit = (&'static str, ExtractionResult<()>);

/// Unrefined output of a read.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Text(String),
    List(Vec<String>),
    Pairs(Vec<TableRow>),
    Records(Vec<Record>),
}

/// One rule for locating a field.
#[derive(Debug, Clone, Copy)]
pub struct LocatorStrategy {
    pub id: &'static str,
    pub selector: &'static str,
    pub read: ReadMode,
}

impl LocatorStrategy {
    pub const fn new(id: &'static str, selector: &'static str, read: ReadMode) -> Self {
        Self { id, selector, read }
    }
}

/// Why an extraction produced no value although strategies existed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionFailure {
    pub message: String,
    /// Eligible for the orchestrator's retry policy.
    pub transient: bool,
}

/// Outcome of one field extraction.
#[derive(Debug, Clone)]
pub struct ExtractionResult<T> {
    pub value: Option<T>,
    pub strategy_used: Option<&'static str>,
    pub attempted: Vec<&'static str>,
    pub tier: Option<Tier>,
    /// Strategies that were retried against the live page.
    pub live_fallbacks: Vec<&'static str>,
    /// Set only when every strategy raised instead of missing.
    pub failure: Option<ExtractionFailure>,
}

impl<T> ExtractionResult<T> {
    pub fn empty() -> Self {
        Self {
            value: None,
            strategy_used: None,
            attempted: Vec::new(),
            tier: None,
            live_fallbacks: Vec::new(),
            failure: None,
        }
    }

    pub fn is_found(&self) -> bool {
        self.value.is_some()
    }

    /// The audit trail without the value, for metrics recording.
    pub fn audit(&self) -> ExtractionResult<()> {
        ExtractionResult {
            value: self.value.as_ref().map(|_| ()),
            strategy_used: self.strategy_used,
            attempted: self.attempted.clone(),
            tier: self.tier,
            live_fallbacks: self.live_fallbacks.clone(),
            failure: self.failure.clone(),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ExtractionResult<U> {
        ExtractionResult {
            value: self.value.map(f),
            strategy_used: self.strategy_used,
            attempted: self.attempted,
            tier: self.tier,
            live_fallbacks: self.live_fallbacks,
            failure: self.failure,
        }
    }
}

/// A field extractor: ordered strategies plus a refiner.
pub struct FieldExtractor<T> {
    category: &'static str,
    strategies: Vec<LocatorStrategy>,
    refine: fn(RawValue) -> Option<T>,
}

impl<T> Clone for FieldExtractor<T> {
    fn clone(&self) -> Self {
        Self {
            category: self.category,
            strategies: self.strategies.clone(),
            refine: self.refine,
        }
    }
}

impl<T> FieldExtractor<T> {
    pub fn new(
        category: &'static str,
        strategies: &[LocatorStrategy],
        refine: fn(RawValue) -> Option<T>,
    ) -> Self {
        Self {
            category,
            strategies: strategies.to_vec(),
            refine,
        }
    }

    pub fn category(&self) -> &'static str {
        self.category
    }

    pub fn strategy_ids(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.id).collect()
    }

    /// A copy with strategies reordered by historical success.
    pub fn prioritized(&self, metrics: &MetricsTracker) -> Self {
        let order = metrics.rank(self.category, &self.strategy_ids());
        Self {
            category: self.category,
            strategies: order.into_iter().map(|i| self.strategies[i]).collect(),
            refine: self.refine,
        }
    }

    /// Run the strategy chain. Misses are ordinary control flow; a
    /// failure is reported only if every strategy raised.
    pub async fn extract<S, L>(&self, snapshot: &S, live: Option<&L>) -> ExtractionResult<T>
    where
        S: NodeSource,
        L: NodeSource,
    {
        let mut result = ExtractionResult::empty();
        let mut raised = 0usize;
        let mut last_error: Option<AppError> = None;

        for strategy in &self.strategies {
            result.attempted.push(strategy.id);
            let mut any_ok = false;

            match self.try_strategy(snapshot, strategy).await {
                Ok(Some(value)) => return self.found(result, strategy, Tier::Snapshot, value),
                Ok(None) => any_ok = true,
                Err(e) => {
                    tracing::debug!(category = self.category, strategy = strategy.id, error = %e, "Locator raised on snapshot");
                    last_error = Some(e);
                }
            }

            if let Some(live) = live {
                result.live_fallbacks.push(strategy.id);
                tracing::info!(
                    category = self.category,
                    strategy = strategy.id,
                    "Snapshot miss, querying live page"
                );
                match self.try_strategy(live, strategy).await {
                    Ok(Some(value)) => return self.found(result, strategy, Tier::Live, value),
                    Ok(None) => any_ok = true,
                    Err(e) => {
                        tracing::debug!(category = self.category, strategy = strategy.id, error = %e, "Locator raised on live page");
                        last_error = Some(e);
                    }
                }
            }

            if !any_ok {
                raised += 1;
            }
        }

        if raised > 0 && raised == self.strategies.len() {
            if let Some(e) = last_error {
                tracing::warn!(category = self.category, error = %e, "Every locator raised");
                result.failure = Some(ExtractionFailure {
                    message: e.to_string(),
                    transient: e.is_retryable(),
                });
            }
        } else {
            tracing::debug!(category = self.category, tried = result.attempted.len(), "Field not found");
        }
        result
    }

    fn found(
        &self,
        mut result: ExtractionResult<T>,
        strategy: &LocatorStrategy,
        tier: Tier,
        value: T,
    ) -> ExtractionResult<T> {
        tracing::debug!(category = self.category, strategy = strategy.id, ?tier, "Field found");
        result.value = Some(value);
        result.strategy_used = Some(strategy.id);
        result.tier = Some(tier);
        result
    }

    async fn try_strategy<S: NodeSource>(
        &self,
        source: &S,
        strategy: &LocatorStrategy,
    ) -> Result<Option<T>, AppError> {
        if let ReadMode::PageUrl = strategy.read {
            let url = source.page_url().await?;
            return Ok((self.refine)(RawValue::Text(url)));
        }

        let nodes = source.select_all(strategy.selector).await?;
        if nodes.is_empty() {
            return Ok(None);
        }
        if strategy.read.aggregates() {
            let raw = read_all(&nodes, strategy.read).await?;
            return Ok((self.refine)(raw));
        }
        for node in &nodes {
            let raw = read_one(node, strategy.read).await?;
            if let Some(value) = (self.refine)(raw) {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Reads, written once against the element capability interface
// ---------------------------------------------------------------------------

async fn title_or_text<E: ElementHandle>(node: &E) -> Result<String, AppError> {
    match node.attribute("title").await? {
        Some(title) if !title.trim().is_empty() => Ok(clean_text(&title)),
        _ => Ok(clean_text(&node.text().await?)),
    }
}

async fn image_url_of<E: ElementHandle>(node: &E) -> Result<Option<String>, AppError> {
    if let Some(url) = images::best_image_url(node).await? {
        return Ok(Some(url));
    }
    match node.children("img").await?.first() {
        Some(img) => images::best_image_url(img).await,
        None => Ok(None),
    }
}

async fn read_table<E: ElementHandle>(node: &E) -> Result<Vec<TableRow>, AppError> {
    let mut rows = Vec::new();
    for row in node.children("tr").await? {
        let cells = row.children("th, td").await?;
        if cells.len() < 2 {
            continue;
        }
        let key = clean_text(&cells[0].text().await?);
        let value = clean_text(&cells[1].text().await?);
        if !key.is_empty() && !value.is_empty() {
            rows.push(TableRow::new(key, value));
        }
    }
    let terms = node.children("dt").await?;
    let defs = node.children("dd").await?;
    for (dt, dd) in terms.iter().zip(defs.iter()) {
        let key = clean_text(&dt.text().await?);
        let value = clean_text(&dd.text().await?);
        if !key.is_empty() && !value.is_empty() {
            rows.push(TableRow::new(key, value));
        }
    }
    Ok(rows)
}

fn split_key_value(text: &str) -> Option<TableRow> {
    let (key, value) = text.split_once(':')?;
    let key = clean_text(key);
    let value = clean_text(value);
    (!key.is_empty() && !value.is_empty()).then(|| TableRow::new(key, value))
}

async fn read_record<E: ElementHandle>(
    node: &E,
    fields: &'static [RecordField],
) -> Result<Record, AppError> {
    let mut record = Vec::with_capacity(fields.len());
    for field in fields {
        let target = match field.selector {
            None => None,
            Some(sel) => Some(node.children(sel).await?),
        };
        let value = match (field.read, target) {
            (FieldRead::Presence, Some(found)) => (!found.is_empty()).to_string(),
            (FieldRead::Presence, None) => "true".to_string(),
            (read, Some(found)) => match found.first() {
                Some(el) => read_field(el, read).await?,
                None => continue,
            },
            (read, None) => read_field(node, read).await?,
        };
        if !value.is_empty() {
            record.push((field.name, value));
        }
    }
    Ok(record)
}

async fn read_field<E: ElementHandle>(el: &E, read: FieldRead) -> Result<String, AppError> {
    match read {
        FieldRead::Text => Ok(clean_text(&el.text().await?)),
        FieldRead::TitleOrText => title_or_text(el).await,
        FieldRead::OuterHtml => el.outer_html().await,
        FieldRead::Presence => Ok("true".to_string()),
    }
}

async fn read_all<E: ElementHandle>(nodes: &[E], mode: ReadMode) -> Result<RawValue, AppError> {
    match mode {
        ReadMode::EachText => {
            let mut texts = Vec::with_capacity(nodes.len());
            for node in nodes {
                let text = clean_text(&node.text().await?);
                if !text.is_empty() {
                    texts.push(text);
                }
            }
            Ok(RawValue::List(texts))
        }
        ReadMode::EachImageUrl => {
            let mut urls = Vec::with_capacity(nodes.len());
            for node in nodes {
                if let Some(url) = image_url_of(node).await? {
                    urls.push(url);
                }
            }
            Ok(RawValue::List(urls))
        }
        ReadMode::Records(fields) => {
            let mut records = Vec::with_capacity(nodes.len());
            for node in nodes {
                records.push(read_record(node, fields).await?);
            }
            Ok(RawValue::Records(records))
        }
        other => Err(AppError::Generic(format!(
            "{other:?} reads one element at a time"
        ))),
    }
}

async fn read_one<E: ElementHandle>(node: &E, mode: ReadMode) -> Result<RawValue, AppError> {
    match mode {
        ReadMode::Text => Ok(RawValue::Text(clean_text(&node.text().await?))),
        ReadMode::Attr(name) => Ok(RawValue::Text(
            node.attribute(name).await?.map(|v| clean_text(&v)).unwrap_or_default(),
        )),
        ReadMode::TitleOrText => Ok(RawValue::Text(title_or_text(node).await?)),
        ReadMode::ImageUrl => Ok(RawValue::Text(image_url_of(node).await?.unwrap_or_default())),
        ReadMode::Table => Ok(RawValue::Pairs(read_table(node).await?)),
        ReadMode::ListItems(item) => {
            let mut texts = Vec::new();
            for child in node.children(item).await? {
                let text = clean_text(&child.text().await?);
                if !text.is_empty() {
                    texts.push(text);
                }
            }
            Ok(RawValue::List(texts))
        }
        ReadMode::KeyValueItems(item) => {
            let mut rows = Vec::new();
            for child in node.children(item).await? {
                if let Some(row) = split_key_value(&child.text().await?) {
                    rows.push(row);
                }
            }
            Ok(RawValue::Pairs(rows))
        }
        ReadMode::PageUrl => Err(AppError::Generic("page URL is not read from an element".into())),
        aggregate => read_all(std::slice::from_ref(node), aggregate).await,
    }
}

// ---------------------------------------------------------------------------
// Common refiners
// ---------------------------------------------------------------------------

/// Non-empty text.
pub fn non_empty_text(raw: RawValue) -> Option<String> {
    match raw {
        RawValue::Text(t) if !t.trim().is_empty() => Some(t.trim().to_string()),
        _ => None,
    }
}

/// Non-empty list.
pub fn non_empty_list(raw: RawValue) -> Option<Vec<String>> {
    match raw {
        RawValue::List(items) if !items.is_empty() => Some(items),
        _ => None,
    }
}

/// Non-empty table.
pub fn non_empty_pairs(raw: RawValue) -> Option<Vec<TableRow>> {
    match raw {
        RawValue::Pairs(rows) if !rows.is_empty() => Some(rows),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::DomSnapshot;
    use crate::element::LiveSource;
    use crate::testutil::{MockElement, MockPage};
    use std::time::Duration;

    const STRATEGIES: &[LocatorStrategy] = &[
        LocatorStrategy::new("first", "#first", ReadMode::Text),
        LocatorStrategy::new("second", ".second", ReadMode::Text),
        LocatorStrategy::new("third", "h1.third", ReadMode::Text),
        LocatorStrategy::new("fourth", "[data-fourth]", ReadMode::Text),
    ];

    fn title_extractor() -> FieldExtractor<String> {
        FieldExtractor::new("title", STRATEGIES, non_empty_text)
    }

    type NoLive = DomSnapshot;

    #[tokio::test]
    async fn third_strategy_wins_and_attempted_stops_there() {
        let snap = DomSnapshot::parse(
            r#"<h1 class="third">  Widget  </h1><div data-fourth>Other</div>"#,
            "u",
        )
        .unwrap();
        let result = title_extractor().extract(&snap, None::<&NoLive>).await;

        assert_eq!(result.value.as_deref(), Some("Widget"));
        assert_eq!(result.strategy_used, Some("third"));
        assert_eq!(result.attempted, vec!["first", "second", "third"]);
        assert_eq!(result.tier, Some(Tier::Snapshot));
        assert!(result.live_fallbacks.is_empty());
        assert!(result.failure.is_none());
    }

    #[tokio::test]
    async fn whitespace_only_text_is_not_a_value() {
        let snap = DomSnapshot::parse(r#"<p id="first">   </p><p class="second">Real</p>"#, "u").unwrap();
        let result = title_extractor().extract(&snap, None::<&NoLive>).await;
        assert_eq!(result.strategy_used, Some("second"));
    }

    #[tokio::test]
    async fn total_miss_is_not_a_failure() {
        let snap = DomSnapshot::parse("<p>nothing here</p>", "u").unwrap();
        let result = title_extractor().extract(&snap, None::<&NoLive>).await;
        assert!(result.value.is_none());
        assert!(result.failure.is_none());
        assert_eq!(result.attempted.len(), 4);
    }

    #[tokio::test]
    async fn live_fallback_is_recorded() {
        let snap = DomSnapshot::parse("<p>static</p>", "u").unwrap();
        let page = MockPage::new("<p>static</p>")
            .with_live(".second", vec![MockElement::new("Rendered Title")]);
        let live = LiveSource::new(&page, Duration::from_secs(1));

        let result = title_extractor().extract(&snap, Some(&live)).await;
        assert_eq!(result.value.as_deref(), Some("Rendered Title"));
        assert_eq!(result.tier, Some(Tier::Live));
        assert_eq!(result.live_fallbacks, vec!["first", "second"]);
        assert_eq!(result.attempted, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn failure_only_when_every_strategy_raised() {
        let bad: &[LocatorStrategy] = &[
            LocatorStrategy::new("a", "[[", ReadMode::Text),
            LocatorStrategy::new("b", "]]", ReadMode::Text),
        ];
        let snap = DomSnapshot::parse("<p>x</p>", "u").unwrap();
        let result = FieldExtractor::new("t", bad, non_empty_text)
            .extract(&snap, None::<&NoLive>)
            .await;
        let failure = result.failure.unwrap();
        assert!(!failure.transient);

        let mixed: &[LocatorStrategy] = &[
            LocatorStrategy::new("a", "[[", ReadMode::Text),
            LocatorStrategy::new("b", "#missing", ReadMode::Text),
        ];
        let result = FieldExtractor::new("t", mixed, non_empty_text)
            .extract(&snap, None::<&NoLive>)
            .await;
        assert!(result.failure.is_none());
    }

    #[tokio::test]
    async fn transient_live_errors_mark_failure_transient() {
        let one: &[LocatorStrategy] = &[LocatorStrategy::new("a", "[[", ReadMode::Text)];
        let snap = DomSnapshot::parse("<p>x</p>", "u").unwrap();
        let page = MockPage::new("").with_live_error(AppError::Timeout(5));
        let live = LiveSource::new(&page, Duration::from_secs(1));
        let result = FieldExtractor::new("t", one, non_empty_text)
            .extract(&snap, Some(&live))
            .await;
        assert!(result.failure.unwrap().transient);
    }

    #[tokio::test]
    async fn table_and_key_value_reads() {
        let html = r#"
          <table id="t">
            <tr><th>Brand</th><td> Acme </td></tr>
            <tr><td>Colour</td><td>Red</td></tr>
            <tr><td>lonely</td></tr>
          </table>
          <ul id="kv"><li>Weight : 2 kg</li><li>no separator</li></ul>"#;
        let snap = DomSnapshot::parse(html, "u").unwrap();

        let table = FieldExtractor::new(
            "overview",
            &[LocatorStrategy::new("t", "#t", ReadMode::Table)],
            non_empty_pairs,
        )
        .extract(&snap, None::<&NoLive>)
        .await;
        assert_eq!(
            table.value.unwrap(),
            vec![TableRow::new("Brand", "Acme"), TableRow::new("Colour", "Red")]
        );

        let kv = FieldExtractor::new(
            "details",
            &[LocatorStrategy::new("kv", "#kv", ReadMode::KeyValueItems("li"))],
            non_empty_pairs,
        )
        .extract(&snap, None::<&NoLive>)
        .await;
        assert_eq!(kv.value.unwrap()[0], TableRow::new("Weight", "2 kg"));
    }

    #[tokio::test]
    async fn page_url_strategy_reads_url() {
        let snap = DomSnapshot::parse("<p></p>", "https://shop.example/dp/B0ABCDEFGH").unwrap();
        let result = FieldExtractor::new(
            "url",
            &[LocatorStrategy::new("url", "", ReadMode::PageUrl)],
            non_empty_text,
        )
        .extract(&snap, None::<&NoLive>)
        .await;
        assert_eq!(result.value.as_deref(), Some("https://shop.example/dp/B0ABCDEFGH"));
    }

    #[tokio::test]
    async fn prioritized_moves_successful_strategy_first() {
        let mut metrics = MetricsTracker::new(50);
        let mut seen = ExtractionResult::<String>::empty();
        seen.attempted = vec!["first", "second", "third"];
        seen.strategy_used = Some("third");
        seen.value = Some("x".into());
        metrics.record_extraction("title", &seen);

        let extractor = title_extractor().prioritized(&metrics);
        // proven first, untried next, known misses last
        assert_eq!(
            extractor.strategy_ids(),
            vec!["third", "fourth", "first", "second"]
        );
    }
}
