//! Image URL discovery helpers shared by the hero, gallery and section paths.

use std::sync::LazyLock;

use regex::Regex;

use crate::element::ElementHandle;
use crate::error::AppError;

/// URL substrings marking assets that are never product imagery.
pub const EXCLUDED_URL_PATTERNS: &[&str] = &[
    "360",
    "video",
    "play-button",
    "sprite",
    "icon",
    "logo",
    "badge",
    "transparent",
    "grey-pixel",
    "blank",
    "loading",
    "spinner",
    "/sash/",
    ".svg",
];

static SIZE_TOKEN_AC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_AC_(?:S[LXY]\d+_)+").expect("static regex"));
static SIZE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| {
        Regex::new(r"_(?:(?:S[LXY]|U[SXY]|S[SR])\d+(?:,\d+)*_)+").expect("static regex")
    });
static DOUBLE_DOT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.\.+").expect("static regex"));
static THUMBNAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"_[A-Z]*[SLXY](?:40|50|75|100|150|200)_").expect("static regex")
});
static HIRES_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""hiRes"\s*:\s*"([^"]+)""#).expect("static regex"));
static MAIN_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(https://[^"]+\.jpg[^"]*)"\s*:\s*\[\d+,\s*\d+\]"#).expect("static regex")
});

/// True if `url` matches any exclusion pattern (case-insensitive).
pub fn is_excluded_url(url: &str) -> bool {
    let lower = url.to_lowercase();
    EXCLUDED_URL_PATTERNS.iter().any(|p| lower.contains(p))
}

/// True for the small preview renditions used in thumbnail strips.
pub fn is_thumbnail_url(url: &str) -> bool {
    THUMBNAIL.is_match(url)
}

/// Accept absolute http(s) URLs, upgrading protocol-relative ones.
pub fn usable_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.starts_with("//") {
        return Some(format!("https:{raw}"));
    }
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Some(raw.to_string());
    }
    None
}

/// Strip the size indicators so the CDN serves its largest rendition.
///
/// Media-library (A+) URLs carry crop geometry and are returned unchanged.
pub fn high_res_url(url: &str) -> String {
    if url.is_empty() || url.contains("aplus-media-library") {
        return url.to_string();
    }
    let stripped = SIZE_TOKEN_AC.replace_all(url, "_AC_");
    let stripped = SIZE_TOKEN.replace_all(&stripped, "_");
    let cleaned = DOUBLE_DOT.replace_all(&stripped, ".");
    cleaned.replace("._.", ".")
}

/// Canonical form used to compare two renditions of the same image.
pub fn normalize_url(url: &str) -> String {
    let base = url.split(['?', '#']).next().unwrap_or(url);
    high_res_url(base)
        .replace("._AC_.", ".")
        .to_lowercase()
}

/// Pick the largest-area entry of a `{"url": [w, h], ...}` size map.
pub fn largest_from_size_map(json: &str) -> Option<String> {
    let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json).ok()?;
    map.into_iter()
        .filter_map(|(url, size)| {
            let dims = size.as_array()?;
            let w = dims.first()?.as_u64()?;
            let h = dims.get(1)?.as_u64()?;
            Some((w * h, url))
        })
        .max_by_key(|(area, _)| *area)
        .map(|(_, url)| url)
}

fn acceptable_main_image(url: &str) -> bool {
    !is_thumbnail_url(url) && !url.contains("/sash/") && !url.to_lowercase().ends_with(".svg")
}

async fn attr_url<E: ElementHandle>(el: &E, name: &str) -> Result<Option<String>, AppError> {
    Ok(el.attribute(name).await?.as_deref().and_then(usable_url))
}

async fn size_map_url<E: ElementHandle>(el: &E) -> Result<Option<String>, AppError> {
    Ok(el
        .attribute("data-a-dynamic-image")
        .await?
        .as_deref()
        .and_then(largest_from_size_map)
        .as_deref()
        .and_then(usable_url))
}

/// Best full-resolution URL for a product (hero or gallery) image element.
///
/// Order: `data-old-hires` on the element then its parent, the largest
/// entry of `data-a-dynamic-image` on the element then its parent,
/// `data-src`, `src`. Thumbnails, badges and vector art are skipped.
pub async fn best_image_url<E: ElementHandle>(el: &E) -> Result<Option<String>, AppError> {
    let parent = el.parent().await?;
    let mut candidates = Vec::with_capacity(6);

    candidates.push(attr_url(el, "data-old-hires").await?);
    if let Some(p) = &parent {
        candidates.push(attr_url(p, "data-old-hires").await?);
    }
    candidates.push(size_map_url(el).await?);
    if let Some(p) = &parent {
        candidates.push(size_map_url(p).await?);
    }
    candidates.push(attr_url(el, "data-src").await?);
    candidates.push(attr_url(el, "src").await?);

    Ok(candidates
        .into_iter()
        .flatten()
        .find(|url| acceptable_main_image(url))
        .map(|url| high_res_url(&url)))
}

/// URL for an image inside a content section, kept exactly as served.
///
/// Order: `data-src`, `src`, `data-old-hires`, the same three on the
/// parent, then the largest entry of a size map on the element or parent.
pub async fn section_image_url<E: ElementHandle>(el: &E) -> Result<Option<String>, AppError> {
    const DIRECT: [&str; 3] = ["data-src", "src", "data-old-hires"];

    for name in DIRECT {
        if let Some(url) = attr_url(el, name).await? {
            return Ok(Some(url));
        }
    }
    let parent = el.parent().await?;
    if let Some(p) = &parent {
        for name in DIRECT {
            if let Some(url) = attr_url(p, name).await? {
                return Ok(Some(url));
            }
        }
    }
    if let Some(url) = size_map_url(el).await? {
        return Ok(Some(url));
    }
    match &parent {
        Some(p) => size_map_url(p).await,
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Image-block script parsing
// ---------------------------------------------------------------------------

/// Slice of `text` from the bracket at `open` to its matching close,
/// ignoring brackets inside string literals.
fn balanced_slice(text: &str, open: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    let (open_ch, close_ch) = match bytes.get(open)? {
        b'[' => (b'[', b']'),
        b'{' => (b'{', b'}'),
        _ => return None,
    };
    let mut depth = 0usize;
    let mut in_string: Option<u8> = None;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == quote {
                in_string = None;
            }
            continue;
        }
        match b {
            b'"' | b'\'' => in_string = Some(b),
            _ if b == open_ch => depth += 1,
            _ if b == close_ch => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[open..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn pick_entry_url(entry: &serde_json::Value) -> Option<String> {
    if let Some(url) = entry.get("hiRes").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) {
        return Some(url.to_string());
    }
    if let Some(main) = entry.get("main").and_then(|v| v.as_object()) {
        let best = main
            .iter()
            .filter_map(|(url, size)| {
                let dims = size.as_array()?;
                Some((dims.first()?.as_u64()? * dims.get(1)?.as_u64()?, url))
            })
            .max_by_key(|(area, _)| *area);
        if let Some((_, url)) = best {
            return Some(url.clone());
        }
    }
    entry
        .get("large")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// All image URLs listed in a page's image-block script, hero first.
///
/// Reads `colorImages.initial` (preferring `hiRes`, then the largest
/// `main` rendition, then `large`). When the array is not valid JSON the
/// `hiRes` fields, or failing that the `main` size-map keys, are pulled
/// out with a regex. Returns `None` if `script` is not an image block.
pub fn parse_image_block(script: &str) -> Option<Vec<String>> {
    if !script.contains("ImageBlockATF") || !script.contains("colorImages") {
        return None;
    }

    let from_json = script
        .find("colorImages")
        .and_then(|at| {
            let rest = &script[at..];
            let initial = rest.find("initial")?;
            let open = rest[initial..].find('[')? + initial;
            balanced_slice(rest, open)
        })
        .and_then(|array| serde_json::from_str::<Vec<serde_json::Value>>(array).ok())
        .map(|entries| entries.iter().filter_map(pick_entry_url).collect::<Vec<_>>())
        .filter(|urls| !urls.is_empty());

    let urls = match from_json {
        Some(urls) => urls,
        None => {
            let mut urls: Vec<String> = HIRES_FIELD
                .captures_iter(script)
                .map(|c| c[1].to_string())
                .collect();
            if urls.is_empty() {
                urls = MAIN_FIELD
                    .captures_iter(script)
                    .map(|c| c[1].to_string())
                    .collect();
            }
            urls
        }
    };

    let mut seen = std::collections::HashSet::new();
    Some(
        urls.into_iter()
            .map(|u| high_res_url(&u))
            .filter(|u| seen.insert(u.clone()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::DomSnapshot;
    use crate::element::NodeSource;

    #[test]
    fn test_exclusion_patterns() {
        assert!(is_excluded_url("https://m.media-amazon.com/images/G/01/x/play-button.png"));
        assert!(is_excluded_url("https://x/VIDEO/thumb.jpg"));
        assert!(is_excluded_url("https://x/images/sash/prime.png"));
        assert!(is_excluded_url("https://x/a.SVG"));
        assert!(!is_excluded_url("https://m.media-amazon.com/images/I/71abc.jpg"));
    }

    #[test]
    fn test_high_res_url_strips_size_tokens() {
        assert_eq!(
            high_res_url("https://m.media-amazon.com/images/I/71abc._AC_SL1500_.jpg"),
            "https://m.media-amazon.com/images/I/71abc._AC_.jpg"
        );
        assert_eq!(
            high_res_url("https://m.media-amazon.com/images/I/71abc._SX300_SY200_.jpg"),
            "https://m.media-amazon.com/images/I/71abc.jpg"
        );
    }

    #[test]
    fn test_high_res_keeps_media_library_urls() {
        let url = "https://m.media-amazon.com/images/S/aplus-media-library-service-media/x._CR0,0,2928,1200_PT0_SX1464_V1___.jpg";
        assert_eq!(high_res_url(url), url);
    }

    #[test]
    fn test_normalize_url_ignores_size_and_query() {
        assert_eq!(
            normalize_url("https://m.media-amazon.com/images/I/71abc._AC_SX679_.jpg?x=1"),
            normalize_url("https://m.media-amazon.com/images/I/71abc.jpg")
        );
    }

    #[test]
    fn test_thumbnail_detection() {
        assert!(is_thumbnail_url("https://x/I/71abc._AC_US40_.jpg"));
        assert!(is_thumbnail_url("https://x/I/71abc._SX200_.jpg"));
        assert!(!is_thumbnail_url("https://x/I/71abc._SL1500_.jpg"));
    }

    #[test]
    fn test_largest_from_size_map() {
        let json = r#"{"https://a/small.jpg":[100,100],"https://a/big.jpg":[1500,1500],"https://a/mid.jpg":[500,600]}"#;
        assert_eq!(largest_from_size_map(json).as_deref(), Some("https://a/big.jpg"));
        assert_eq!(largest_from_size_map("not json"), None);
    }

    #[test]
    fn test_usable_url() {
        assert_eq!(usable_url(" //m.x/a.jpg").as_deref(), Some("https://m.x/a.jpg"));
        assert_eq!(usable_url("data:image/gif;base64,R0lGOD"), None);
        assert_eq!(usable_url("/relative.jpg"), None);
    }

    const IMAGE_BLOCK: &str = r#"
        P.when('A').register("ImageBlockATF", function(A){
          var data = {
            'colorImages': { 'initial': [
              {"hiRes":"https://m.media-amazon.com/images/I/hero._AC_SL1500_.jpg","thumb":"t","large":"l1"},
              {"hiRes":null,"large":"https://m.media-amazon.com/images/I/two.jpg","main":{"https://m.media-amazon.com/images/I/two._SX300_.jpg":[300,300],"https://m.media-amazon.com/images/I/two._SX679_.jpg":[679,679]}},
              {"hiRes":"","large":"https://m.media-amazon.com/images/I/three.jpg"}
            ]},
            'colorToAsin': {'initial': {}}
          };
          A.trigger('P.AboveTheFold');
        });"#;

    #[test]
    fn test_parse_image_block_json_path() {
        let urls = parse_image_block(IMAGE_BLOCK).unwrap();
        assert_eq!(
            urls,
            vec![
                "https://m.media-amazon.com/images/I/hero._AC_.jpg",
                "https://m.media-amazon.com/images/I/two.jpg",
                "https://m.media-amazon.com/images/I/three.jpg",
            ]
        );
    }

    #[test]
    fn test_parse_image_block_regex_fallback() {
        let script = r#"ImageBlockATF colorImages 'initial': [ {"hiRes":"https://x/I/a.jpg", broken },
            {"hiRes":"https://x/I/b.jpg"} ]"#;
        let urls = parse_image_block(script).unwrap();
        assert_eq!(urls, vec!["https://x/I/a.jpg", "https://x/I/b.jpg"]);
    }

    #[test]
    fn test_parse_image_block_ignores_other_scripts() {
        assert!(parse_image_block("var x = 1;").is_none());
    }

    #[tokio::test]
    async fn test_best_image_url_priority() {
        let html = r#"<div data-old-hires="https://x/I/parent._SL1500_.jpg">
            <img id="a" src="https://x/I/a._SX38_.jpg"
                 data-a-dynamic-image='{"https://x/I/dyn._SX300_.jpg":[300,300],"https://x/I/dyn._SX600_.jpg":[600,600]}'>
          </div>
          <div><img id="b" src="https://x/I/b._AC_US40_.jpg" data-src="https://x/I/b-lazy.jpg"></div>"#;
        let snap = DomSnapshot::parse(html, "u").unwrap();

        let a = snap.select_one("#a").await.unwrap().unwrap();
        assert_eq!(
            best_image_url(&a).await.unwrap().as_deref(),
            Some("https://x/I/parent.jpg")
        );

        let b = snap.select_one("#b").await.unwrap().unwrap();
        assert_eq!(
            best_image_url(&b).await.unwrap().as_deref(),
            Some("https://x/I/b-lazy.jpg")
        );
    }

    #[tokio::test]
    async fn test_section_image_url_priority() {
        let html = r#"<div data-src="https://x/parent.jpg">
            <img id="lazy" src="https://x/src.jpg" data-src="https://x/lazy.jpg">
            <img id="plain" src="data:image/gif;base64,AAAA">
          </div>"#;
        let snap = DomSnapshot::parse(html, "u").unwrap();
        let lazy = snap.select_one("#lazy").await.unwrap().unwrap();
        assert_eq!(
            section_image_url(&lazy).await.unwrap().as_deref(),
            Some("https://x/lazy.jpg")
        );
        let plain = snap.select_one("#plain").await.unwrap().unwrap();
        assert_eq!(
            section_image_url(&plain).await.unwrap().as_deref(),
            Some("https://x/parent.jpg")
        );
    }
}
