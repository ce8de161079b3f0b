//! Storage abstractions for document persistence.
//!
//! Records are reconciled into one of two tables:
//!
//! ```text
//! documents_scd1   one row per document_id, overwritten in place
//! documents_scd2   full version history, one current row per document_id
//! raw_<name>       append-only CSV rows from ingested datasets
//! ```
//!
//! Every upsert batch runs in a single transaction.

#[cfg(feature = "postgres")]
pub mod postgres;
pub mod sqlite;
pub mod table;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::models::{Config, DocumentRecord, ScdType, StorageBackend};
use crate::pipeline::diff::VersionSnapshot;
use crate::services::CsvRow;

// Re-export for convenience
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;
pub use table::{is_valid_ident, quote_ident, raw_table_name};

/// Raw rows are committed in chunks of this size.
pub const RAW_COMMIT_EVERY: usize = 1000;

/// Counts from one upsert batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    /// First version of a document
    pub inserted: usize,
    /// SCD2: a new version replaced the current one
    pub versioned: usize,
    /// SCD2: identical to the current version, nothing written
    pub unchanged: usize,
    /// SCD1: existing row overwritten
    pub overwritten: usize,
}

impl UpsertSummary {
    /// Records accepted by the store, whether or not a row was written.
    pub fn processed(&self) -> usize {
        self.inserted + self.versioned + self.unchanged + self.overwritten
    }

    pub fn merge(&mut self, other: UpsertSummary) {
        self.inserted += other.inserted;
        self.versioned += other.versioned;
        self.unchanged += other.unchanged;
        self.overwritten += other.overwritten;
    }
}

/// One row of the SCD2 table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredVersion {
    pub surrogate_id: i64,
    pub document_id: String,
    pub source: String,
    pub url: String,
    pub title: String,
    pub published_at: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
    pub content_text: Option<String>,
    pub extra: Option<serde_json::Value>,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub is_current: bool,
}

impl StoredVersion {
    /// Fields compared by change detection.
    pub fn snapshot(&self) -> VersionSnapshot {
        VersionSnapshot {
            url: self.url.clone(),
            title: self.title.clone(),
            published_at: self.published_at,
            content_hash: self.content_hash.clone(),
        }
    }
}

/// One row of the SCD1 table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRow {
    pub document_id: String,
    pub source: String,
    pub url: String,
    pub title: String,
    pub published_at: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
    pub content_text: Option<String>,
    pub extra: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Trait for document storage backends.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;

    /// SCD strategy applied by [`DocumentStore::upsert_documents`].
    fn scd_type(&self) -> ScdType;

    /// Create schema, document tables and indexes if absent.
    async fn ensure_schema(&self) -> Result<()>;

    /// Reconcile a batch in one transaction; any failure rolls back the batch.
    async fn upsert_documents(&self, records: &[DocumentRecord]) -> Result<UpsertSummary>;

    /// Create `raw_<name>` if absent.
    async fn ensure_raw_table(&self, name: &str) -> Result<()>;

    /// Append CSV rows to `raw_<name>`, creating it on demand.
    ///
    /// Commits every [`RAW_COMMIT_EVERY`] rows and returns the number inserted.
    async fn ingest_raw_rows(&self, name: &str, source_url: &str, rows: &[CsvRow])
    -> Result<usize>;

    /// Current SCD2 version of a document.
    async fn current_version(&self, document_id: &str) -> Result<Option<StoredVersion>>;

    /// All SCD2 versions of a document, oldest first.
    async fn version_history(&self, document_id: &str) -> Result<Vec<StoredVersion>>;

    /// SCD1 row of a document.
    async fn current_row(&self, document_id: &str) -> Result<Option<StoredRow>>;

    /// Number of rows in `raw_<name>`; zero when the table does not exist.
    async fn raw_row_count(&self, name: &str) -> Result<usize>;
}

/// Open the configured backend. Connection failures are returned as errors.
pub async fn open_store(config: &Config) -> Result<Box<dyn DocumentStore>> {
    let scd_type = config.storage.scd_type;
    match config.storage.backend {
        StorageBackend::Sqlite => {
            let store = SqliteStore::open(&config.storage.sqlite_path, scd_type)?;
            Ok(Box::new(store))
        }
        #[cfg(feature = "postgres")]
        StorageBackend::Postgres => {
            let store = PostgresStore::connect(&config.storage.db, scd_type).await?;
            Ok(Box::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StorageBackend::Postgres => Err(crate::error::AppError::config(
            "PostgreSQL backend requested but built without the `postgres` feature",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_merge_and_processed() {
        let mut total = UpsertSummary {
            inserted: 2,
            ..Default::default()
        };
        total.merge(UpsertSummary {
            versioned: 1,
            unchanged: 3,
            ..Default::default()
        });
        assert_eq!(total.inserted, 2);
        assert_eq!(total.versioned, 1);
        assert_eq!(total.processed(), 6);
    }

    #[tokio::test]
    async fn test_open_store_sqlite_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.sqlite_path = dir.path().join("nested/ferc.sqlite");

        let store = open_store(&config).await.unwrap();
        assert_eq!(store.backend_name(), "sqlite");
        store.ensure_schema().await.unwrap();
        assert!(config.storage.sqlite_path.exists());
    }
}
