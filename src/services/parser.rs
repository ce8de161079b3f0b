// src/services/parser.rs

//! Listing and detail page parsing.
//!
//! Listing pages are scanned anchor by anchor rather than through fixed
//! row selectors, so layout changes on the target site degrade gracefully.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::error::{AppError, Result};
use crate::models::DocumentRecord;
use crate::services::dates::parse_fuzzy_date;
use crate::utils::{normalize_whitespace, resolve_url, truncate_chars};

/// File extensions that mark a link as a document or dataset. Longest first.
pub const DOCUMENT_EXTENSIONS: &[&str] = &[
    ".csv.gz", ".docx", ".xlsx", ".json", ".zip", ".csv", ".xls", ".xml", ".pdf", ".txt",
    ".doc", ".gz",
];

/// Path prefixes that mark a link as a document or dataset.
pub const DOCUMENT_PATH_PREFIXES: &[&str] = &[
    "/dataset",
    "/datasets",
    "/download",
    "/downloads",
    "/open/",
    "/data/",
    "/sites/default/files/",
    "/media/",
    "/document",
    "/news-events/news/",
];

const LINK_TEXT_HINTS: &[&str] = &["download", "dataset", "data set"];
const SKIPPED_SCHEMES: &[&str] = &["javascript:", "mailto:", "tel:"];
const DETAIL_CONTAINERS: &[&str] = &["main", "[role=main]", "article", "#main-content", ".main-content"];

const MAX_CONTEXT_CHARS: usize = 200;
const MAX_DETAIL_ELEMENTS: usize = 500;
const DATE_SEARCH_DEPTH: usize = 3;

static ANCHOR: LazyLock<Selector> = LazyLock::new(|| selector("a[href]"));
static TIME_WITH_DATETIME: LazyLock<Selector> = LazyLock::new(|| selector("time[datetime]"));
static DATE_CLASS: LazyLock<Selector> =
    LazyLock::new(|| selector("[class*=date], [class*=Date], [class*=time], [class*=Time]"));
static DETAIL_TEXT: LazyLock<Selector> = LazyLock::new(|| selector("p, li, td"));
static DETAIL_ROOTS: LazyLock<Vec<Selector>> =
    LazyLock::new(|| DETAIL_CONTAINERS.iter().map(|s| selector(s)).collect());

fn selector(s: &str) -> Selector {
    parse_selector(s).unwrap_or_else(|e| panic!("built-in selector is invalid: {e}"))
}

/// Parse a CSS selector, mapping failures to [`AppError::Selector`].
pub fn parse_selector(s: &str) -> Result<Selector> {
    Selector::parse(s).map_err(|e| AppError::selector(s, format!("{e:?}")))
}

/// Extract document records from a listing page.
///
/// Never fails: unparseable input or a page with no matching anchors
/// yields an empty list. Output is de-duplicated by URL in document order.
pub fn parse_list(html: &str, base_url: &str, source: &str) -> Vec<DocumentRecord> {
    let base = match Url::parse(base_url) {
        Ok(base) => base,
        Err(e) => {
            log::warn!("Cannot parse listing base URL {base_url}: {e}");
            return Vec::new();
        }
    };
    let listing_path = base.path().trim_end_matches('/').to_lowercase();

    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut records = Vec::new();

    for anchor in document.select(&ANCHOR) {
        let Some(href) = anchor.value().attr("href").map(str::trim) else {
            continue;
        };
        if is_skipped_href(href) {
            continue;
        }
        let Some(url) = resolve_url(&base, href) else {
            continue;
        };
        let Ok(target) = Url::parse(&url) else {
            continue;
        };
        if !matches!(target.scheme(), "http" | "https") {
            continue;
        }

        let text = normalize_whitespace(&anchor.text().collect::<String>());
        let path = target.path().to_lowercase();
        let file_type = matching_extension(&path);
        let nested = listing_path.len() > 1
            && target.host_str() == base.host_str()
            && path.starts_with(&format!("{listing_path}/"));

        let accepted = file_type.is_some()
            || DOCUMENT_PATH_PREFIXES.iter().any(|p| path.starts_with(p))
            || nested
            || has_link_text_hint(&text);
        if !accepted {
            continue;
        }

        let title = title_for(&anchor, text);
        if title.is_empty() || !seen.insert(url.clone()) {
            continue;
        }

        let ancestors = nearby_ancestors(&anchor);
        let mut record = DocumentRecord::new(source, url, title)
            .with_published_at(find_published_at(&ancestors));
        if let Some(context) = context_for(&ancestors, &record.title) {
            record.insert_extra("context", context);
        }
        if let Some(ext) = file_type {
            record.insert_extra("file_type", ext.trim_start_matches('.'));
        }
        records.push(record);
    }

    log::debug!("Parsed {} records from {base_url}", records.len());
    records
}

/// Visible text of a detail page, one line per paragraph, list item or cell.
pub fn parse_detail(html: &str) -> String {
    let document = Html::parse_document(html);
    let root = DETAIL_ROOTS
        .iter()
        .find_map(|sel| document.select(sel).next())
        .unwrap_or_else(|| document.root_element());

    root.select(&DETAIL_TEXT)
        .map(|el| normalize_whitespace(&el.text().collect::<Vec<_>>().join(" ")))
        .filter(|text| !text.is_empty())
        .take(MAX_DETAIL_ELEMENTS)
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_skipped_href(href: &str) -> bool {
    if href.is_empty() || href.starts_with('#') {
        return true;
    }
    let lower = href.to_lowercase();
    SKIPPED_SCHEMES.iter().any(|s| lower.starts_with(s))
}

fn matching_extension(path: &str) -> Option<&'static str> {
    DOCUMENT_EXTENSIONS
        .iter()
        .copied()
        .find(|ext| path.ends_with(ext))
}

fn has_link_text_hint(text: &str) -> bool {
    let lower = text.to_lowercase();
    LINK_TEXT_HINTS.iter().any(|h| lower.contains(h))
}

fn title_for(anchor: &ElementRef<'_>, text: String) -> String {
    if !text.is_empty() {
        return text;
    }
    ["title", "aria-label"]
        .iter()
        .filter_map(|attr| anchor.value().attr(attr))
        .map(normalize_whitespace)
        .find(|t| !t.is_empty())
        .unwrap_or_default()
}

/// Ancestors close enough to describe this anchor alone.
///
/// Climbing stops before an element that links to more than one target.
fn nearby_ancestors<'a>(anchor: &ElementRef<'a>) -> Vec<ElementRef<'a>> {
    let mut out = Vec::new();
    for ancestor in anchor.ancestors().filter_map(ElementRef::wrap) {
        if out.len() == DATE_SEARCH_DEPTH || ancestor.value().name() == "html" {
            break;
        }
        if links_to_several(&ancestor) {
            break;
        }
        out.push(ancestor);
    }
    out
}

/// Whether `element` contains links to at least two distinct targets.
///
/// Stops at the second target, so wide listing containers cost only as
/// much as the distance between their first two links.
fn links_to_several(element: &ElementRef<'_>) -> bool {
    let mut first = None;
    for href in element.select(&ANCHOR).filter_map(|a| a.value().attr("href")) {
        match first {
            None => first = Some(href),
            Some(seen) if seen != href => return true,
            Some(_) => {}
        }
    }
    false
}

fn find_published_at(ancestors: &[ElementRef<'_>]) -> Option<DateTime<Utc>> {
    for ancestor in ancestors {
        if let Some(time) = ancestor.select(&TIME_WITH_DATETIME).next() {
            let parsed = time
                .value()
                .attr("datetime")
                .and_then(parse_fuzzy_date)
                .or_else(|| parse_fuzzy_date(&time.text().collect::<String>()));
            if parsed.is_some() {
                return parsed;
            }
        }
        for el in ancestor.select(&DATE_CLASS) {
            if let Some(parsed) = parse_fuzzy_date(&el.text().collect::<Vec<_>>().join(" ")) {
                return Some(parsed);
            }
        }
        if let Some(parsed) = parse_fuzzy_date(&ancestor.text().collect::<Vec<_>>().join(" ")) {
            return Some(parsed);
        }
    }
    None
}

fn context_for(ancestors: &[ElementRef<'_>], title: &str) -> Option<String> {
    let parent = ancestors.first()?;
    let text = normalize_whitespace(&parent.text().collect::<Vec<_>>().join(" "));
    if text.is_empty() || text == title {
        return None;
    }
    Some(truncate_chars(&text, MAX_CONTEXT_CHARS).to_string())
}
