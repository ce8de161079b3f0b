//! Change detection between a stored version and an incoming record.
//!
//! Only the material fields count: `url`, `title`, `published_at` and
//! `content_hash`. `source` and `extra` never trigger a new version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::DocumentRecord;

/// The fields of a stored version that change detection compares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    pub url: String,
    pub title: String,
    pub published_at: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
}

impl From<&DocumentRecord> for VersionSnapshot {
    fn from(record: &DocumentRecord) -> Self {
        Self {
            url: record.url.clone(),
            title: record.title.clone(),
            published_at: record.published_at,
            content_hash: record.content_hash().map(str::to_string),
        }
    }
}

/// How an incoming record relates to what is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    New,
    Changed,
    Unchanged,
}

impl ChangeKind {
    /// Classify `incoming` against the current stored version.
    pub fn classify(previous: Option<&VersionSnapshot>, incoming: &DocumentRecord) -> Self {
        match previous {
            None => Self::New,
            Some(_) if has_changed(previous, incoming) => Self::Changed,
            Some(_) => Self::Unchanged,
        }
    }

    /// Whether this outcome requires a write.
    pub fn needs_write(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// `true` when there is no previous version or any material field differs.
pub fn has_changed(previous: Option<&VersionSnapshot>, incoming: &DocumentRecord) -> bool {
    let Some(prev) = previous else {
        return true;
    };
    prev.url != incoming.url
        || prev.title != incoming.title
        || prev.published_at != incoming.published_at
        || prev.content_hash.as_deref() != incoming.content_hash()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn record() -> DocumentRecord {
        DocumentRecord::new("FERC", "https://x.gov/news/a", "Title A")
            .with_published_at(Some(Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()))
            .with_content("body")
    }

    #[test]
    fn test_no_previous_is_change() {
        assert!(has_changed(None, &record()));
        assert_eq!(ChangeKind::classify(None, &record()), ChangeKind::New);
    }

    #[test]
    fn test_identical_is_unchanged() {
        let rec = record();
        let snap = VersionSnapshot::from(&rec);
        assert!(!has_changed(Some(&snap), &rec));
        assert_eq!(ChangeKind::classify(Some(&snap), &rec), ChangeKind::Unchanged);
        assert!(!ChangeKind::Unchanged.needs_write());
    }

    #[test]
    fn test_single_field_differences() {
        let rec = record();
        let base = VersionSnapshot::from(&rec);

        let variants = [
            VersionSnapshot {
                url: "https://x.gov/news/b".into(),
                ..base.clone()
            },
            VersionSnapshot {
                title: "Title B".into(),
                ..base.clone()
            },
            VersionSnapshot {
                published_at: None,
                ..base.clone()
            },
            VersionSnapshot {
                content_hash: None,
                ..base.clone()
            },
        ];
        for snap in &variants {
            assert!(has_changed(Some(snap), &rec), "{snap:?}");
            assert_eq!(ChangeKind::classify(Some(snap), &rec), ChangeKind::Changed);
        }
    }

    #[test]
    fn test_extra_and_source_ignored() {
        let rec = record();
        let snap = VersionSnapshot::from(&rec);

        let mut other = rec.clone();
        other.source = "ELSEWHERE".into();
        other.insert_extra("context", "new context");
        assert!(!has_changed(Some(&snap), &other));
    }
}
