use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AppError;

/// Collapse whitespace runs and drop invisible direction/zero-width marks.
pub fn clean_text(raw: &str) -> String {
    raw.split(|c: char| c.is_whitespace() || matches!(c, '\u{200b}' | '\u{200e}' | '\u{200f}'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// First `n` characters of `s`, respecting char boundaries.
pub fn prefix_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Make a product name safe to use as a directory name.
///
/// Strips `<>:"/\|?*`, collapses whitespace, trims spaces and dots and
/// caps the result at `max_len` characters. Empty input becomes `unnamed`.
pub fn sanitize_filename(name: &str, max_len: usize) -> String {
    let stripped: String = name
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .collect();
    let collapsed = clean_text(&stripped);
    let trimmed = collapsed.trim_matches(|c| c == ' ' || c == '.');
    let capped = prefix_chars(trimmed, max_len).trim();
    if capped.is_empty() {
        "unnamed".to_string()
    } else {
        capped.to_string()
    }
}

/// Create `root/<sanitized name>`, suffixing ` (2)`, ` (3)`, … when taken.
pub async fn create_output_dir(root: &Path, product_name: &str) -> Result<PathBuf, AppError> {
    let base = sanitize_filename(product_name, 100);
    tokio::fs::create_dir_all(root).await?;

    let mut counter = 1u32;
    loop {
        let name = if counter == 1 {
            base.clone()
        } else {
            format!("{base} ({counter})")
        };
        let candidate = root.join(name);
        match tokio::fs::create_dir(&candidate).await {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => counter += 1,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Human-readable elapsed time: `42s`, `1m 5s`, `2h 3m`.
pub fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_text() {
        assert_eq!(clean_text("  a \n\t b\u{200e} "), "a b");
        assert_eq!(clean_text("\u{200f}"), "");
    }

    #[test]
    fn test_prefix_chars_multibyte() {
        assert_eq!(prefix_chars("héllo", 2), "hé");
        assert_eq!(prefix_chars("ab", 10), "ab");
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("Foo: Bar/Baz?", 100), "Foo BarBaz");
        assert_eq!(sanitize_filename("  ..name.. ", 100), "name");
        assert_eq!(sanitize_filename("***", 100), "unnamed");
        assert_eq!(sanitize_filename(&"x".repeat(150), 100).len(), 100);
    }

    #[tokio::test]
    async fn test_create_output_dir_suffixes_on_collision() {
        let tmp = tempfile::tempdir().unwrap();
        let a = create_output_dir(tmp.path(), "Widget").await.unwrap();
        let b = create_output_dir(tmp.path(), "Widget").await.unwrap();
        let c = create_output_dir(tmp.path(), "Widget").await.unwrap();
        assert_eq!(a.file_name().unwrap(), "Widget");
        assert_eq!(b.file_name().unwrap(), "Widget (2)");
        assert_eq!(c.file_name().unwrap(), "Widget (3)");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_duration(Duration::from_secs(7380)), "2h 3m");
    }
}
