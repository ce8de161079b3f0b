//! SQLite storage backend.
//!
//! Used for local runs and tests. Timestamps are stored as text, JSON
//! payloads as serialized text.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};

use crate::error::{AppError, Result};
use crate::models::{DocumentRecord, ScdType};
use crate::pipeline::diff::{ChangeKind, VersionSnapshot};
use crate::services::CsvRow;
use crate::storage::table::{DocumentTables, TableName};
use crate::storage::{DocumentStore, RAW_COMMIT_EVERY, StoredRow, StoredVersion, UpsertSummary};

const VERSION_COLUMNS: &str = "surrogate_id, document_id, source, url, title, published_at, \
     content_hash, content_text, extra, valid_from, valid_to, is_current";

const ROW_COLUMNS: &str = "document_id, source, url, title, published_at, content_hash, \
     content_text, extra, created_at, updated_at";

/// SQLite-backed document store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    tables: DocumentTables,
    scd_type: ScdType,
}

impl SqliteStore {
    /// Open (or create) a database file, creating parent directories.
    pub fn open(path: impl AsRef<Path>, scd_type: ScdType) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        log::debug!("Opening SQLite database {}", path.display());
        Self::with_connection(Connection::open(path)?, scd_type)
    }

    /// Private in-memory database.
    pub fn open_in_memory(scd_type: ScdType) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, scd_type)
    }

    fn with_connection(conn: Connection, scd_type: ScdType) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(conn),
            tables: DocumentTables::new(None)?,
            scd_type,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::storage("SQLite connection lock poisoned"))
    }

    fn create_raw_table(conn: &Connection, table: &TableName) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_url TEXT NOT NULL,
                row_data TEXT NOT NULL,
                ingested_at TEXT NOT NULL
            );",
            t = table.qualified()
        ))?;
        Ok(())
    }

    fn upsert_scd1(
        &self,
        tx: &Transaction<'_>,
        records: &[DocumentRecord],
        now: DateTime<Utc>,
    ) -> Result<UpsertSummary> {
        let table = self.tables.scd1.qualified();
        let mut exists = tx.prepare(&format!("SELECT 1 FROM {table} WHERE document_id = ?1"))?;
        let mut upsert = tx.prepare(&format!(
            "INSERT INTO {table} ({ROW_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT (document_id) DO UPDATE SET
                source = excluded.source,
                url = excluded.url,
                title = excluded.title,
                published_at = excluded.published_at,
                content_hash = excluded.content_hash,
                content_text = excluded.content_text,
                extra = excluded.extra,
                updated_at = excluded.updated_at"
        ))?;

        let mut summary = UpsertSummary::default();
        for record in records {
            let existed = exists
                .query_row([&record.document_id], |_| Ok(()))
                .optional()?
                .is_some();
            upsert.execute(params![
                record.document_id,
                record.source,
                record.url,
                record.title,
                record.published_at,
                record.content_hash(),
                record.content_text(),
                record.extra_json(),
                now,
            ])?;
            if existed {
                summary.overwritten += 1;
            } else {
                summary.inserted += 1;
            }
        }
        Ok(summary)
    }

    fn upsert_scd2(
        &self,
        tx: &Transaction<'_>,
        records: &[DocumentRecord],
        now: DateTime<Utc>,
    ) -> Result<UpsertSummary> {
        let table = self.tables.scd2.qualified();
        let mut current = tx.prepare(&format!(
            "SELECT surrogate_id, url, title, published_at, content_hash
             FROM {table} WHERE document_id = ?1 AND is_current = 1"
        ))?;
        let mut close = tx.prepare(&format!(
            "UPDATE {table} SET is_current = 0, valid_to = ?2 WHERE surrogate_id = ?1"
        ))?;
        let mut insert = tx.prepare(&format!(
            "INSERT INTO {table} (document_id, source, url, title, published_at,
                content_hash, content_text, extra, valid_from, valid_to, is_current)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, 1)"
        ))?;

        let mut summary = UpsertSummary::default();
        for record in records {
            let previous: Option<(i64, VersionSnapshot)> = current
                .query_row([&record.document_id], |row| {
                    Ok((
                        row.get(0)?,
                        VersionSnapshot {
                            url: row.get(1)?,
                            title: row.get(2)?,
                            published_at: row.get(3)?,
                            content_hash: row.get(4)?,
                        },
                    ))
                })
                .optional()?;

            let kind = ChangeKind::classify(previous.as_ref().map(|(_, s)| s), record);
            if let (ChangeKind::Changed, Some((surrogate_id, _))) = (kind, &previous) {
                close.execute(params![surrogate_id, now])?;
            }
            if kind.needs_write() {
                insert.execute(params![
                    record.document_id,
                    record.source,
                    record.url,
                    record.title,
                    record.published_at,
                    record.content_hash(),
                    record.content_text(),
                    record.extra_json(),
                    now,
                ])?;
            }
            match kind {
                ChangeKind::New => summary.inserted += 1,
                ChangeKind::Changed => summary.versioned += 1,
                ChangeKind::Unchanged => summary.unchanged += 1,
            }
        }
        Ok(summary)
    }
}

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<StoredVersion> {
    Ok(StoredVersion {
        surrogate_id: row.get(0)?,
        document_id: row.get(1)?,
        source: row.get(2)?,
        url: row.get(3)?,
        title: row.get(4)?,
        published_at: row.get(5)?,
        content_hash: row.get(6)?,
        content_text: row.get(7)?,
        extra: row.get(8)?,
        valid_from: row.get(9)?,
        valid_to: row.get(10)?,
        is_current: row.get(11)?,
    })
}

fn stored_row_from_row(row: &Row<'_>) -> rusqlite::Result<StoredRow> {
    Ok(StoredRow {
        document_id: row.get(0)?,
        source: row.get(1)?,
        url: row.get(2)?,
        title: row.get(3)?,
        published_at: row.get(4)?,
        content_hash: row.get(5)?,
        content_text: row.get(6)?,
        extra: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

#[async_trait]
impl DocumentStore for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn scd_type(&self) -> ScdType {
        self.scd_type
    }

    async fn ensure_schema(&self) -> Result<()> {
        let scd1 = &self.tables.scd1;
        let scd2 = &self.tables.scd2;
        let conn = self.lock()?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {scd1_t} (
                document_id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                url TEXT NOT NULL,
                title TEXT NOT NULL,
                published_at TEXT,
                content_hash TEXT,
                content_text TEXT,
                extra TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {scd2_t} (
                surrogate_id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id TEXT NOT NULL,
                source TEXT NOT NULL,
                url TEXT NOT NULL,
                title TEXT NOT NULL,
                published_at TEXT,
                content_hash TEXT,
                content_text TEXT,
                extra TEXT,
                valid_from TEXT NOT NULL,
                valid_to TEXT,
                is_current INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS {doc_idx} ON {scd2_t} (document_id);
            CREATE UNIQUE INDEX IF NOT EXISTS {current_idx}
                ON {scd2_t} (document_id) WHERE is_current = 1;",
            scd1_t = scd1.qualified(),
            scd2_t = scd2.qualified(),
            doc_idx = scd2.index_name("document_id_idx"),
            current_idx = scd2.index_name("current_idx"),
        ))?;
        log::info!("SQLite schema ready");
        Ok(())
    }

    async fn upsert_documents(&self, records: &[DocumentRecord]) -> Result<UpsertSummary> {
        if records.is_empty() {
            return Ok(UpsertSummary::default());
        }
        let now = Utc::now();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let summary = match self.scd_type {
            ScdType::Type1 => self.upsert_scd1(&tx, records, now)?,
            ScdType::Type2 => self.upsert_scd2(&tx, records, now)?,
        };
        tx.commit()?;
        Ok(summary)
    }

    async fn ensure_raw_table(&self, name: &str) -> Result<()> {
        let table = self.tables.raw(name)?;
        let conn = self.lock()?;
        Self::create_raw_table(&conn, &table)
    }

    async fn ingest_raw_rows(
        &self,
        name: &str,
        source_url: &str,
        rows: &[CsvRow],
    ) -> Result<usize> {
        let table = self.tables.raw(name)?;
        let mut conn = self.lock()?;
        Self::create_raw_table(&conn, &table)?;

        let sql = format!(
            "INSERT INTO {} (source_url, row_data, ingested_at) VALUES (?1, ?2, ?3)",
            table.qualified()
        );
        let now = Utc::now();
        let mut inserted = 0;
        for chunk in rows.chunks(RAW_COMMIT_EVERY) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&sql)?;
                for row in chunk {
                    stmt.execute(params![source_url, serde_json::to_string(row)?, now])?;
                }
            }
            tx.commit()?;
            inserted += chunk.len();
            log::debug!("Committed {inserted}/{} raw rows into {}", rows.len(), table.table());
        }
        Ok(inserted)
    }

    async fn current_version(&self, document_id: &str) -> Result<Option<StoredVersion>> {
        let conn = self.lock()?;
        let version = conn
            .query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM {} WHERE document_id = ?1 AND is_current = 1",
                    self.tables.scd2.qualified()
                ),
                [document_id],
                version_from_row,
            )
            .optional()?;
        Ok(version)
    }

    async fn version_history(&self, document_id: &str) -> Result<Vec<StoredVersion>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {VERSION_COLUMNS} FROM {} WHERE document_id = ?1
             ORDER BY valid_from, surrogate_id",
            self.tables.scd2.qualified()
        ))?;
        let versions = stmt
            .query_map([document_id], version_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(versions)
    }

    async fn current_row(&self, document_id: &str) -> Result<Option<StoredRow>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {ROW_COLUMNS} FROM {} WHERE document_id = ?1",
                    self.tables.scd1.qualified()
                ),
                [document_id],
                stored_row_from_row,
            )
            .optional()?;
        Ok(row)
    }

    async fn raw_row_count(&self, name: &str) -> Result<usize> {
        let table = self.tables.raw(name)?;
        let conn = self.lock()?;
        let exists = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table.table()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !exists {
            return Ok(0);
        }
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", table.qualified()),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::models::content_sha256;

    async fn store(scd_type: ScdType) -> SqliteStore {
        let store = SqliteStore::open_in_memory(scd_type).unwrap();
        store.ensure_schema().await.unwrap();
        store
    }

    fn record(id: &str, title: &str, body: &str) -> DocumentRecord {
        DocumentRecord::new("FERC", format!("https://x.gov/news/{id}"), title)
            .with_published_at(Some(Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()))
            .with_content(body)
    }

    #[tokio::test]
    async fn test_scd2_same_record_twice_single_version() {
        let store = store(ScdType::Type2).await;
        let rec = record("a", "A", "body");

        let first = store.upsert_documents(&[rec.clone()]).await.unwrap();
        let second = store.upsert_documents(&[rec]).await.unwrap();

        assert_eq!(first.inserted, 1);
        assert_eq!(second.unchanged, 1);
        assert_eq!(store.version_history("a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scd2_change_closes_previous_version() {
        let store = store(ScdType::Type2).await;
        store.upsert_documents(&[record("a", "A", "v1")]).await.unwrap();
        let summary = store
            .upsert_documents(&[record("a", "A revised", "v1")])
            .await
            .unwrap();
        assert_eq!(summary.versioned, 1);

        let history = store.version_history("a").await.unwrap();
        assert_eq!(history.len(), 2);
        let (old, new) = (&history[0], &history[1]);
        assert!(!old.is_current);
        assert_eq!(old.valid_to, Some(new.valid_from));
        assert!(new.is_current);
        assert!(new.valid_to.is_none());
        assert_eq!(new.title, "A revised");

        let current = store.current_version("a").await.unwrap().unwrap();
        assert_eq!(current.surrogate_id, new.surrogate_id);
    }

    #[tokio::test]
    async fn test_scd2_one_current_per_document() {
        let store = store(ScdType::Type2).await;
        for round in 0..3 {
            let batch: Vec<_> = ["a", "b", "c"]
                .iter()
                .map(|id| record(id, id, &format!("round {round}")))
                .collect();
            store.upsert_documents(&batch).await.unwrap();
        }
        for id in ["a", "b", "c"] {
            let history = store.version_history(id).await.unwrap();
            assert_eq!(history.len(), 3);
            assert_eq!(history.iter().filter(|v| v.is_current).count(), 1);
            assert!(history.iter().filter(|v| !v.is_current).all(|v| v.valid_to.is_some()));
        }
    }

    #[tokio::test]
    async fn test_scd2_extra_only_change_is_unchanged() {
        let store = store(ScdType::Type2).await;
        let rec = record("a", "A", "body");
        store.upsert_documents(&[rec.clone()]).await.unwrap();

        let mut with_extra = rec;
        with_extra.insert_extra("context", "new");
        let summary = store.upsert_documents(&[with_extra]).await.unwrap();
        assert_eq!(summary.unchanged, 1);
    }

    #[tokio::test]
    async fn test_stored_hash_matches_text() {
        let store = store(ScdType::Type2).await;
        store.upsert_documents(&[record("a", "A", "some text")]).await.unwrap();
        let current = store.current_version("a").await.unwrap().unwrap();
        assert_eq!(
            current.content_hash.as_deref(),
            Some(content_sha256(current.content_text.as_deref().unwrap()).as_str())
        );
    }

    #[tokio::test]
    async fn test_scd1_overwrites_and_keeps_created_at() {
        let store = store(ScdType::Type1).await;
        let first = store.upsert_documents(&[record("a", "A", "v1")]).await.unwrap();
        assert_eq!(first.inserted, 1);
        let before = store.current_row("a").await.unwrap().unwrap();

        let mut updated = record("a", "A2", "v2");
        updated.insert_extra("file_type", "pdf");
        let second = store.upsert_documents(&[updated]).await.unwrap();
        assert_eq!(second.overwritten, 1);

        let after = store.current_row("a").await.unwrap().unwrap();
        assert_eq!(after.title, "A2");
        assert_eq!(after.content_text.as_deref(), Some("v2"));
        assert_eq!(after.extra, Some(json!({"file_type": "pdf"})));
        assert_eq!(after.created_at, before.created_at);
        assert!(after.updated_at >= before.updated_at);
    }

    #[tokio::test]
    async fn test_null_content_round_trips() {
        let store = store(ScdType::Type1).await;
        let mut rec = record("a", "A", "x");
        rec.clear_content();
        rec.published_at = None;
        store.upsert_documents(&[rec]).await.unwrap();

        let row = store.current_row("a").await.unwrap().unwrap();
        assert!(row.content_text.is_none());
        assert!(row.content_hash.is_none());
        assert!(row.published_at.is_none());
        assert!(row.extra.is_none());
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back() {
        let store = store(ScdType::Type2).await;
        {
            let conn = store.lock().unwrap();
            conn.execute_batch(
                "CREATE TRIGGER reject_b BEFORE INSERT ON documents_scd2
                 WHEN NEW.document_id = 'b' BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();
        }

        let result = store
            .upsert_documents(&[record("a", "A", "x"), record("b", "B", "x")])
            .await;
        assert!(result.is_err());
        assert!(store.current_version("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_raw_ingest_created_on_demand() {
        let store = store(ScdType::Type2).await;
        assert_eq!(store.raw_row_count("ferc").await.unwrap(), 0);

        let rows: Vec<CsvRow> = (0..2500)
            .map(|i| {
                let mut row = CsvRow::new();
                row.insert("n".into(), json!(i.to_string()));
                row
            })
            .collect();
        let inserted = store
            .ingest_raw_rows("ferc", "https://x.gov/f.csv", &rows)
            .await
            .unwrap();
        assert_eq!(inserted, 2500);
        assert_eq!(store.raw_row_count("ferc").await.unwrap(), 2500);
        assert_eq!(store.raw_row_count("raw_ferc").await.unwrap(), 2500);
    }

    #[tokio::test]
    async fn test_raw_ingest_rejects_bad_name() {
        let store = store(ScdType::Type2).await;
        assert!(store.ingest_raw_rows("bad name", "u", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_ensure_schema_idempotent() {
        let store = store(ScdType::Type2).await;
        store.ensure_schema().await.unwrap();
        store.ensure_raw_table("ferc").await.unwrap();
        store.ensure_raw_table("ferc").await.unwrap();
    }
}
