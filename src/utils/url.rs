// src/utils/url.rs

//! URL manipulation utilities.

use url::Url;

/// Placeholder substituted with the page number in paginated listing URLs.
pub const PAGE_PLACEHOLDER: &str = "{page}";

/// Derive a stable document identifier from a URL.
///
/// Uses the last non-empty path segment, or the whole URL when the path has
/// none (or the URL does not parse).
///
/// # Examples
/// ```
/// use ferc_scraper::utils::url::document_id_from_url;
///
/// assert_eq!(
///     document_id_from_url("https://x.gov/dataset/form-1-2024.zip"),
///     "form-1-2024.zip"
/// );
/// assert_eq!(document_id_from_url("https://x.gov/"), "https://x.gov/");
/// ```
pub fn document_id_from_url(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| url.to_string())
}

/// Build the URL of listing page `page` (zero-based).
///
/// A `{page}` placeholder is substituted; otherwise `page=<n>` is appended
/// to the query string.
pub fn build_page_url(base: &str, page: u32) -> String {
    if base.contains(PAGE_PLACEHOLDER) {
        return base.replace(PAGE_PLACEHOLDER, &page.to_string());
    }
    append_query(base, "page", &page.to_string())
}

/// Append `key=value` to a URL's query string.
pub fn append_query(base: &str, key: &str, value: &str) -> String {
    match Url::parse(base) {
        Ok(mut parsed) => {
            parsed.query_pairs_mut().append_pair(key, value);
            parsed.to_string()
        }
        Err(_) => {
            let sep = if base.contains('?') { '&' } else { '?' };
            format!("{base}{sep}{key}={value}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id_last_segment() {
        assert_eq!(
            document_id_from_url("https://x.gov/dataset/form-1-2024.zip"),
            "form-1-2024.zip"
        );
    }

    #[test]
    fn test_document_id_trailing_slash() {
        assert_eq!(
            document_id_from_url("https://x.gov/news-events/news/order-123/"),
            "order-123"
        );
    }

    #[test]
    fn test_document_id_no_path() {
        assert_eq!(document_id_from_url("https://x.gov"), "https://x.gov");
        assert_eq!(document_id_from_url("not a url"), "not a url");
    }

    #[test]
    fn test_build_page_url_placeholder() {
        assert_eq!(
            build_page_url("https://x.gov/news?page={page}", 2),
            "https://x.gov/news?page=2"
        );
    }

    #[test]
    fn test_build_page_url_appends_query() {
        assert_eq!(
            build_page_url("https://x.gov/news", 0),
            "https://x.gov/news?page=0"
        );
        assert_eq!(
            build_page_url("https://x.gov/news?type=order", 1),
            "https://x.gov/news?type=order&page=1"
        );
    }
}
