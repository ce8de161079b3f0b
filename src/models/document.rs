//! Document record data structures.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::utils::url::document_id_from_url;

/// Source tag used when none is configured.
pub const DEFAULT_SOURCE: &str = "FERC";

/// A scalar metadata value attached to a record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ExtraValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for ExtraValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ExtraValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for ExtraValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for ExtraValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Open-ended metadata keyed by name.
pub type Extra = BTreeMap<String, ExtraValue>;

/// Lowercase hex SHA-256 of the UTF-8 bytes of `text`.
pub fn content_sha256(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// A document scraped from a listing page.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRecord {
    /// Origin tag (e.g. the agency feed)
    pub source: String,

    /// Natural key derived from the URL
    pub document_id: String,

    /// Absolute URL
    pub url: String,

    /// Display text of the link
    pub title: String,

    /// Best-effort publication timestamp
    pub published_at: Option<DateTime<Utc>>,

    /// Free-form scalar metadata
    pub extra: Extra,

    content_text: Option<String>,
    content_hash: Option<String>,
}

impl DocumentRecord {
    /// Create a record, deriving `document_id` from `url`.
    pub fn new(source: impl Into<String>, url: impl Into<String>, title: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            source: source.into(),
            document_id: document_id_from_url(&url),
            url,
            title: title.into(),
            published_at: None,
            extra: Extra::new(),
            content_text: None,
            content_hash: None,
        }
    }

    /// Builder-style publication date setter.
    pub fn with_published_at(mut self, published_at: Option<DateTime<Utc>>) -> Self {
        self.published_at = published_at;
        self
    }

    /// Builder-style content setter.
    pub fn with_content(mut self, text: impl Into<String>) -> Self {
        self.set_content(text);
        self
    }

    /// Set the full text and its digest together.
    pub fn set_content(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.content_hash = Some(content_sha256(&text));
        self.content_text = Some(text);
    }

    /// Drop the full text and its digest.
    pub fn clear_content(&mut self) {
        self.content_text = None;
        self.content_hash = None;
    }

    pub fn content_text(&self) -> Option<&str> {
        self.content_text.as_deref()
    }

    pub fn content_hash(&self) -> Option<&str> {
        self.content_hash.as_deref()
    }

    /// Insert a metadata entry.
    pub fn insert_extra(&mut self, key: impl Into<String>, value: impl Into<ExtraValue>) {
        self.extra.insert(key.into(), value.into());
    }

    /// `extra` as a JSON object, or `None` when empty.
    pub fn extra_json(&self) -> Option<serde_json::Value> {
        if self.extra.is_empty() {
            return None;
        }
        serde_json::to_value(&self.extra).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_derives_document_id() {
        let record = DocumentRecord::new(
            DEFAULT_SOURCE,
            "https://x.gov/dataset/form-1-2024.zip",
            "Form 1",
        );
        assert_eq!(record.document_id, "form-1-2024.zip");
        assert!(record.content_text().is_none());
        assert!(record.content_hash().is_none());
    }

    #[test]
    fn test_content_and_hash_move_together() {
        let mut record = DocumentRecord::new("FERC", "https://x.gov/a", "A").with_content("hello");
        assert_eq!(record.content_text(), Some("hello"));
        assert_eq!(
            record.content_hash(),
            Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );

        record.clear_content();
        assert!(record.content_text().is_none());
        assert!(record.content_hash().is_none());
    }

    #[test]
    fn test_content_sha256_changes() {
        assert_ne!(content_sha256("hello"), content_sha256("hello!"));
    }

    #[test]
    fn test_extra_json() {
        let mut record = DocumentRecord::new("FERC", "https://x.gov/a", "A");
        assert!(record.extra_json().is_none());

        record.insert_extra("file_type", "zip");
        record.insert_extra("rows", 3_i64);
        let json = record.extra_json().unwrap();
        assert_eq!(json["file_type"], "zip");
        assert_eq!(json["rows"], 3);
    }
}
