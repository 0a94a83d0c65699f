//! Hero image and product gallery discovery.
//!
//! The gallery comes from the page's image-block script when it has one.
//! Thumbnail strips are read only when the script yields nothing, first
//! from the snapshot and then from the live page.

use std::collections::HashSet;

use crate::element::{ElementHandle, NodeSource};
use crate::error::AppError;
use crate::extractor::{Audit, FieldExtractor, LocatorStrategy, RawValue, ReadMode, non_empty_text};
use crate::images::{self, high_res_url, is_excluded_url, normalize_url, usable_url};
use crate::metrics::MetricsTracker;
use crate::models::ImageReference;
use crate::retry::RetryPolicy;
use crate::text::run;

const HERO_STRATEGIES: &[LocatorStrategy] = &[
    LocatorStrategy::new("landing_image", "#landingImage", ReadMode::ImageUrl),
    LocatorStrategy::new("img_blk_front", "#imgBlkFront", ReadMode::ImageUrl),
    LocatorStrategy::new("ebooks_front", "#ebooksImgBlkFront", ReadMode::ImageUrl),
    LocatorStrategy::new("main_container", "#main-image-container img", ReadMode::ImageUrl),
    LocatorStrategy::new("image_block", "#imageBlock img", ReadMode::ImageUrl),
];

const SCRIPT_STRATEGIES: &[LocatorStrategy] = &[LocatorStrategy::new(
    "image_block_script",
    "script",
    ReadMode::EachText,
)];

const THUMBNAIL_SELECTORS: &[&str] = &["#altImages ul li.item", "#altImages li"];

fn refine_hero(raw: RawValue) -> Option<String> {
    non_empty_text(raw).filter(|url| !is_excluded_url(url))
}

fn refine_script(raw: RawValue) -> Option<Vec<String>> {
    let RawValue::List(scripts) = raw else {
        return None;
    };
    scripts
        .iter()
        .find_map(|s| images::parse_image_block(s))
        .filter(|urls| !urls.is_empty())
}

async fn is_video_thumbnail<E: ElementHandle>(item: &E) -> Result<bool, AppError> {
    let class = item.attribute("class").await?.unwrap_or_default().to_lowercase();
    if class.contains("video") {
        return Ok(true);
    }
    for img in item.children("img").await? {
        let src = img.attribute("src").await?.unwrap_or_default();
        if is_excluded_url(&src) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Full-size URL behind one thumbnail strip entry.
async fn thumbnail_url<E: ElementHandle>(item: &E) -> Result<Option<String>, AppError> {
    if let Some(url) = item
        .attribute("data-a-dynamic-image")
        .await?
        .as_deref()
        .and_then(images::largest_from_size_map)
    {
        return Ok(usable_url(&url).map(|u| high_res_url(&u)));
    }
    let Some(img) = item.children("img").await?.into_iter().next() else {
        return Ok(None);
    };
    for name in ["data-old-hires", "data-a-dynamic-image", "src"] {
        let Some(value) = img.attribute(name).await? else {
            continue;
        };
        let candidate = if name == "data-a-dynamic-image" {
            images::largest_from_size_map(&value)
        } else {
            Some(value)
        };
        if let Some(url) = candidate.as_deref().and_then(usable_url) {
            return Ok(Some(high_res_url(&url)));
        }
    }
    Ok(None)
}

/// Full-size URLs of the thumbnail strip, in strip order.
pub async fn thumbnail_urls<S: NodeSource>(source: &S) -> Result<Vec<String>, AppError> {
    for selector in THUMBNAIL_SELECTORS {
        let items = source.select_all(selector).await?;
        if items.is_empty() {
            continue;
        }
        let mut urls = Vec::with_capacity(items.len());
        for item in &items {
            if is_video_thumbnail(item).await? {
                continue;
            }
            if let Some(url) = thumbnail_url(item).await?.filter(|u| !is_excluded_url(u)) {
                urls.push(url);
            }
        }
        return Ok(urls);
    }
    Ok(Vec::new())
}

/// Drop hero renditions and repeats, comparing normalized URLs.
pub fn dedup_against_hero(urls: Vec<String>, hero: Option<&str>) -> Vec<String> {
    let hero = hero.map(normalize_url);
    let mut seen = HashSet::new();
    urls.into_iter()
        .filter(|u| {
            let key = normalize_url(u);
            hero.as_deref() != Some(key.as_str()) && seen.insert(key)
        })
        .collect()
}

#[derive(Clone)]
pub struct ProductImageExtractors {
    hero: FieldExtractor<String>,
    script: FieldExtractor<Vec<String>>,
}

impl Default for ProductImageExtractors {
    fn default() -> Self {
        Self {
            hero: FieldExtractor::new("hero_image", HERO_STRATEGIES, refine_hero),
            script: FieldExtractor::new("gallery_script", SCRIPT_STRATEGIES, refine_script),
        }
    }
}

/// Hero and gallery references still to be acquired.
#[derive(Debug, Default)]
pub struct ProductImagesOutcome {
    pub hero: Option<ImageReference>,
    pub gallery: Vec<ImageReference>,
    pub audits: Vec<Audit>,
}

impl ProductImageExtractors {
    pub fn prioritized(&self, metrics: &MetricsTracker) -> Self {
        Self {
            hero: self.hero.prioritized(metrics),
            script: self.script.prioritized(metrics),
        }
    }

    /// The hero URL is always located when either output is wanted; the
    /// gallery needs it to drop duplicates.
    pub async fn extract<S, L>(
        &self,
        snapshot: &S,
        live: Option<&L>,
        retry: &RetryPolicy,
        want_gallery: bool,
    ) -> ProductImagesOutcome
    where
        S: NodeSource,
        L: NodeSource,
    {
        let mut out = ProductImagesOutcome::default();
        let hero = run(&self.hero, snapshot, live, retry, &mut out.audits).await;

        if want_gallery {
            let mut urls: Vec<String> = run(&self.script, snapshot, live, retry, &mut out.audits)
                .await
                .map(|all| all.into_iter().skip(1).collect())
                .unwrap_or_default();

            if urls.is_empty() {
                urls = thumbnail_urls(snapshot).await.unwrap_or_else(|e| {
                    tracing::debug!(error = %e, "Thumbnail scan failed on snapshot");
                    Vec::new()
                });
            }
            if urls.is_empty()
                && let Some(live) = live
            {
                tracing::info!("No gallery in snapshot, scanning live thumbnails");
                urls = thumbnail_urls(live).await.unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "Live thumbnail scan failed");
                    Vec::new()
                });
            }

            out.gallery = dedup_against_hero(urls, hero.as_deref())
                .into_iter()
                .enumerate()
                .map(|(i, url)| ImageReference::standalone(url, i))
                .collect();
        }

        out.hero = hero.map(|url| ImageReference::standalone(url, 0));
        tracing::debug!(
            hero = out.hero.is_some(),
            gallery = out.gallery.len(),
            "Product images located"
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::DomSnapshot;
    use crate::element::LiveSource;
    use crate::testutil::{MockElement, MockPage};
    use std::time::Duration;

    type NoLive = DomSnapshot;

    fn no_retry() -> RetryPolicy {
        RetryPolicy::new(0, Duration::ZERO)
    }

    const SCRIPT_PAGE: &str = r#"<html><body>
      <div id="imgTagWrapperId">
        <img id="landingImage" data-old-hires="https://m.media-amazon.com/images/I/hero._AC_SL1500_.jpg"
             src="https://m.media-amazon.com/images/I/hero._AC_SX300_.jpg">
      </div>
      <script>var x = 1;</script>
      <script>
        P.when('A').register("ImageBlockATF", function(A){
          var data = {'colorImages': { 'initial': [
            {"hiRes":"https://m.media-amazon.com/images/I/hero._AC_SL1500_.jpg","large":"l0"},
            {"hiRes":"https://m.media-amazon.com/images/I/side._AC_SL1500_.jpg","large":"l1"},
            {"hiRes":null,"large":"https://m.media-amazon.com/images/I/back._AC_.jpg"}
          ]}};
          return data;
        });
      </script>
    </body></html>"#;

    #[tokio::test]
    async fn gallery_from_script_skips_hero_entry() {
        let snap = DomSnapshot::parse(SCRIPT_PAGE, "u").unwrap();
        let out = ProductImageExtractors::default()
            .extract(&snap, None::<&NoLive>, &no_retry(), true)
            .await;

        let hero = out.hero.unwrap();
        assert_eq!(hero.url, "https://m.media-amazon.com/images/I/hero._AC_.jpg");
        let urls: Vec<&str> = out.gallery.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://m.media-amazon.com/images/I/side._AC_.jpg",
                "https://m.media-amazon.com/images/I/back._AC_.jpg",
            ]
        );
        assert_eq!(out.gallery[1].discovery_order, 1);
        assert_eq!(out.audits.len(), 2);
    }

    #[tokio::test]
    async fn hero_only_skips_gallery_work() {
        let snap = DomSnapshot::parse(SCRIPT_PAGE, "u").unwrap();
        let out = ProductImageExtractors::default()
            .extract(&snap, None::<&NoLive>, &no_retry(), false)
            .await;
        assert!(out.hero.is_some());
        assert!(out.gallery.is_empty());
        assert_eq!(out.audits.len(), 1);
    }

    #[tokio::test]
    async fn thumbnails_fill_in_without_script() {
        let html = r#"<html><body>
          <img id="landingImage" src="https://m.media-amazon.com/images/I/hero._AC_SX500_.jpg">
          <div id="altImages"><ul>
            <li class="item"><img src="https://m.media-amazon.com/images/I/hero._AC_US40_.jpg"></li>
            <li class="item"><img src="https://m.media-amazon.com/images/I/two._AC_US40_.jpg"></li>
            <li class="item videoThumbnail"><img src="https://m.media-amazon.com/images/I/vid._AC_US40_.jpg"></li>
            <li class="item"><img src="https://m.media-amazon.com/images/I/two._AC_US40_.jpg"></li>
          </ul></div>
        </body></html>"#;
        let snap = DomSnapshot::parse(html, "u").unwrap();
        let out = ProductImageExtractors::default()
            .extract(&snap, None::<&NoLive>, &no_retry(), true)
            .await;

        let urls: Vec<&str> = out.gallery.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["https://m.media-amazon.com/images/I/two._AC_.jpg"]);
    }

    #[tokio::test]
    async fn live_thumbnails_are_last_resort() {
        let html = r#"<html><body><p>bare</p></body></html>"#;
        let snap = DomSnapshot::parse(html, "u").unwrap();
        let page = MockPage::new(html).with_live(
            "#altImages li",
            vec![MockElement::new("").with_children(
                "img",
                vec![MockElement::new("").with_attr(
                    "src",
                    "https://m.media-amazon.com/images/I/live._AC_US40_.jpg",
                )],
            )],
        );
        let live = LiveSource::new(&page, Duration::from_secs(1));

        let out = ProductImageExtractors::default()
            .extract(&snap, Some(&live), &no_retry(), true)
            .await;
        assert!(out.hero.is_none());
        assert_eq!(out.gallery.len(), 1);
        assert_eq!(out.gallery[0].url, "https://m.media-amazon.com/images/I/live._AC_.jpg");
    }

    #[test]
    fn hero_renditions_are_removed() {
        let urls = vec![
            "https://m.media-amazon.com/images/I/hero._AC_SL1500_.jpg".to_string(),
            "https://m.media-amazon.com/images/I/a.jpg?x=1".to_string(),
            "https://m.media-amazon.com/images/I/a.jpg".to_string(),
        ];
        let kept = dedup_against_hero(urls, Some("https://m.media-amazon.com/images/I/hero.jpg"));
        assert_eq!(kept, vec!["https://m.media-amazon.com/images/I/a.jpg?x=1"]);
    }
}
