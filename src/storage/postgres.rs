//! PostgreSQL storage backend.
//!
//! Tables live in the configured schema and use `timestamptz`, `jsonb`
//! and `bigserial` columns. Connections are plaintext (`NoTls`).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_postgres::config::SslMode;
use tokio_postgres::types::Json;
use tokio_postgres::{Client, NoTls, Row, Transaction};

use crate::error::Result;
use crate::models::{DbConfig, DocumentRecord, ScdType};
use crate::pipeline::diff::{ChangeKind, VersionSnapshot};
use crate::services::CsvRow;
use crate::storage::table::{DocumentTables, TableName, quote_ident};
use crate::storage::{DocumentStore, RAW_COMMIT_EVERY, StoredRow, StoredVersion, UpsertSummary};

const VERSION_COLUMNS: &str = "surrogate_id, document_id, source, url, title, published_at, \
     content_hash, content_text, extra, valid_from, valid_to, is_current";

const ROW_COLUMNS: &str = "document_id, source, url, title, published_at, content_hash, \
     content_text, extra, created_at, updated_at";

/// PostgreSQL-backed document store.
pub struct PostgresStore {
    client: Mutex<Client>,
    connection: JoinHandle<()>,
    tables: DocumentTables,
    schema: String,
    scd_type: ScdType,
}

impl PostgresStore {
    /// Connect using the configured parameters.
    pub async fn connect(db: &DbConfig, scd_type: ScdType) -> Result<Self> {
        let tables = DocumentTables::new(Some(&db.schema))?;

        let mut pg = tokio_postgres::Config::new();
        pg.host(&db.host)
            .port(db.port)
            .dbname(&db.name)
            .user(&db.user)
            .password(&db.password)
            .application_name(&db.application_name)
            .connect_timeout(Duration::from_secs(db.connect_timeout_secs))
            .ssl_mode(ssl_mode(&db.sslmode));

        let (client, connection) = pg.connect(NoTls).await?;
        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::error!("PostgreSQL connection error: {e}");
            }
        });

        log::info!(
            "Connected to PostgreSQL {}:{}/{} (schema {})",
            db.host,
            db.port,
            db.name,
            db.schema
        );
        Ok(Self {
            client: Mutex::new(client),
            connection,
            tables,
            schema: db.schema.clone(),
            scd_type,
        })
    }

    async fn create_raw_table(client: &Client, table: &TableName) -> Result<()> {
        client
            .batch_execute(&format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                    id BIGSERIAL PRIMARY KEY,
                    source_url TEXT NOT NULL,
                    row_data JSONB NOT NULL,
                    ingested_at TIMESTAMPTZ NOT NULL DEFAULT now()
                );",
                t = table.qualified()
            ))
            .await?;
        Ok(())
    }

    async fn upsert_scd1(
        &self,
        tx: &Transaction<'_>,
        records: &[DocumentRecord],
        now: DateTime<Utc>,
    ) -> Result<UpsertSummary> {
        let upsert = tx
            .prepare(&format!(
                "INSERT INTO {table} ({ROW_COLUMNS})
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
                 ON CONFLICT (document_id) DO UPDATE SET
                    source = EXCLUDED.source,
                    url = EXCLUDED.url,
                    title = EXCLUDED.title,
                    published_at = EXCLUDED.published_at,
                    content_hash = EXCLUDED.content_hash,
                    content_text = EXCLUDED.content_text,
                    extra = EXCLUDED.extra,
                    updated_at = EXCLUDED.updated_at
                 RETURNING (xmax = 0) AS inserted",
                table = self.tables.scd1.qualified()
            ))
            .await?;

        let mut summary = UpsertSummary::default();
        for record in records {
            let row = tx
                .query_one(
                    &upsert,
                    &[
                        &record.document_id,
                        &record.source,
                        &record.url,
                        &record.title,
                        &record.published_at,
                        &record.content_hash(),
                        &record.content_text(),
                        &record.extra_json(),
                        &now,
                    ],
                )
                .await?;
            if row.get::<_, bool>("inserted") {
                summary.inserted += 1;
            } else {
                summary.overwritten += 1;
            }
        }
        Ok(summary)
    }

    async fn upsert_scd2(
        &self,
        tx: &Transaction<'_>,
        records: &[DocumentRecord],
        now: DateTime<Utc>,
    ) -> Result<UpsertSummary> {
        let table = self.tables.scd2.qualified();
        let current = tx
            .prepare(&format!(
                "SELECT surrogate_id, url, title, published_at, content_hash
                 FROM {table} WHERE document_id = $1 AND is_current"
            ))
            .await?;
        let close = tx
            .prepare(&format!(
                "UPDATE {table} SET is_current = FALSE, valid_to = $2 WHERE surrogate_id = $1"
            ))
            .await?;
        let insert = tx
            .prepare(&format!(
                "INSERT INTO {table} (document_id, source, url, title, published_at,
                    content_hash, content_text, extra, valid_from, valid_to, is_current)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NULL, TRUE)"
            ))
            .await?;

        let mut summary = UpsertSummary::default();
        for record in records {
            let previous = tx
                .query_opt(&current, &[&record.document_id])
                .await?
                .map(|row| {
                    let surrogate_id: i64 = row.get(0);
                    let snapshot = VersionSnapshot {
                        url: row.get(1),
                        title: row.get(2),
                        published_at: row.get(3),
                        content_hash: row.get(4),
                    };
                    (surrogate_id, snapshot)
                });

            let kind = ChangeKind::classify(previous.as_ref().map(|(_, s)| s), record);
            if let (ChangeKind::Changed, Some((surrogate_id, _))) = (kind, &previous) {
                tx.execute(&close, &[surrogate_id, &now]).await?;
            }
            if kind.needs_write() {
                tx.execute(
                    &insert,
                    &[
                        &record.document_id,
                        &record.source,
                        &record.url,
                        &record.title,
                        &record.published_at,
                        &record.content_hash(),
                        &record.content_text(),
                        &record.extra_json(),
                        &now,
                    ],
                )
                .await?;
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

impl Drop for PostgresStore {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

/// Map a libpq-style `sslmode` onto what a plaintext connector can do.
fn ssl_mode(mode: &str) -> SslMode {
    match mode.to_lowercase().as_str() {
        "disable" | "allow" => SslMode::Disable,
        "require" | "verify-ca" | "verify-full" => {
            log::warn!("sslmode={mode} requested but TLS is not supported; connection will fail");
            SslMode::Require
        }
        _ => SslMode::Prefer,
    }
}

fn version_from_row(row: &Row) -> StoredVersion {
    StoredVersion {
        surrogate_id: row.get(0),
        document_id: row.get(1),
        source: row.get(2),
        url: row.get(3),
        title: row.get(4),
        published_at: row.get(5),
        content_hash: row.get(6),
        content_text: row.get(7),
        extra: row.get(8),
        valid_from: row.get(9),
        valid_to: row.get(10),
        is_current: row.get(11),
    }
}

fn stored_row_from_row(row: &Row) -> StoredRow {
    StoredRow {
        document_id: row.get(0),
        source: row.get(1),
        url: row.get(2),
        title: row.get(3),
        published_at: row.get(4),
        content_hash: row.get(5),
        content_text: row.get(6),
        extra: row.get(7),
        created_at: row.get(8),
        updated_at: row.get(9),
    }
}

#[async_trait]
impl DocumentStore for PostgresStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    fn scd_type(&self) -> ScdType {
        self.scd_type
    }

    async fn ensure_schema(&self) -> Result<()> {
        let client = self.client.lock().await;

        let create_schema = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&self.schema));
        if let Err(e) = client.batch_execute(&create_schema).await {
            log::warn!("Could not create schema {}: {e}", self.schema);
        }

        let scd1 = &self.tables.scd1;
        let scd2 = &self.tables.scd2;
        client
            .batch_execute(&format!(
                "CREATE TABLE IF NOT EXISTS {scd1_t} (
                    document_id TEXT PRIMARY KEY,
                    source TEXT NOT NULL,
                    url TEXT NOT NULL,
                    title TEXT NOT NULL,
                    published_at TIMESTAMPTZ NULL,
                    content_hash TEXT NULL,
                    content_text TEXT NULL,
                    extra JSONB NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
                );
                CREATE TABLE IF NOT EXISTS {scd2_t} (
                    surrogate_id BIGSERIAL PRIMARY KEY,
                    document_id TEXT NOT NULL,
                    source TEXT NOT NULL,
                    url TEXT NOT NULL,
                    title TEXT NOT NULL,
                    published_at TIMESTAMPTZ NULL,
                    content_hash TEXT NULL,
                    content_text TEXT NULL,
                    extra JSONB NULL,
                    valid_from TIMESTAMPTZ NOT NULL,
                    valid_to TIMESTAMPTZ NULL,
                    is_current BOOLEAN NOT NULL DEFAULT TRUE
                );
                CREATE INDEX IF NOT EXISTS {doc_idx} ON {scd2_t} (document_id);
                CREATE UNIQUE INDEX IF NOT EXISTS {current_idx}
                    ON {scd2_t} (document_id) WHERE is_current;",
                scd1_t = scd1.qualified(),
                scd2_t = scd2.qualified(),
                doc_idx = scd2.index_name("document_id_idx"),
                current_idx = scd2.index_name("current_idx"),
            ))
            .await?;
        log::info!("PostgreSQL schema {} ready", self.schema);
        Ok(())
    }

    async fn upsert_documents(&self, records: &[DocumentRecord]) -> Result<UpsertSummary> {
        if records.is_empty() {
            return Ok(UpsertSummary::default());
        }
        let now = Utc::now();
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        let summary = match self.scd_type {
            ScdType::Type1 => self.upsert_scd1(&tx, records, now).await?,
            ScdType::Type2 => self.upsert_scd2(&tx, records, now).await?,
        };
        tx.commit().await?;
        Ok(summary)
    }

    async fn ensure_raw_table(&self, name: &str) -> Result<()> {
        let table = self.tables.raw(name)?;
        let client = self.client.lock().await;
        Self::create_raw_table(&client, &table).await
    }

    async fn ingest_raw_rows(
        &self,
        name: &str,
        source_url: &str,
        rows: &[CsvRow],
    ) -> Result<usize> {
        let table = self.tables.raw(name)?;
        let mut client = self.client.lock().await;
        Self::create_raw_table(&client, &table).await?;

        let sql = format!(
            "INSERT INTO {} (source_url, row_data, ingested_at) VALUES ($1, $2, $3)",
            table.qualified()
        );
        let now = Utc::now();
        let mut inserted = 0;
        for chunk in rows.chunks(RAW_COMMIT_EVERY) {
            let tx = client.transaction().await?;
            let statement = tx.prepare(&sql).await?;
            for row in chunk {
                tx.execute(&statement, &[&source_url, &Json(row), &now])
                    .await?;
            }
            tx.commit().await?;
            inserted += chunk.len();
            log::debug!("Committed {inserted}/{} raw rows into {}", rows.len(), table.table());
        }
        Ok(inserted)
    }

    async fn current_version(&self, document_id: &str) -> Result<Option<StoredVersion>> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM {} WHERE document_id = $1 AND is_current",
                    self.tables.scd2.qualified()
                ),
                &[&document_id],
            )
            .await?;
        Ok(row.as_ref().map(version_from_row))
    }

    async fn version_history(&self, document_id: &str) -> Result<Vec<StoredVersion>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM {} WHERE document_id = $1
                     ORDER BY valid_from, surrogate_id",
                    self.tables.scd2.qualified()
                ),
                &[&document_id],
            )
            .await?;
        Ok(rows.iter().map(version_from_row).collect())
    }

    async fn current_row(&self, document_id: &str) -> Result<Option<StoredRow>> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {ROW_COLUMNS} FROM {} WHERE document_id = $1",
                    self.tables.scd1.qualified()
                ),
                &[&document_id],
            )
            .await?;
        Ok(row.as_ref().map(stored_row_from_row))
    }

    async fn raw_row_count(&self, name: &str) -> Result<usize> {
        let table = self.tables.raw(name)?;
        let client = self.client.lock().await;
        let exists: bool = client
            .query_one(
                "SELECT to_regclass($1::text) IS NOT NULL",
                &[&table.qualified()],
            )
            .await?
            .get(0);
        if !exists {
            return Ok(0);
        }
        let count: i64 = client
            .query_one(&format!("SELECT COUNT(*) FROM {}", table.qualified()), &[])
            .await?
            .get(0);
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssl_mode_mapping() {
        assert!(matches!(ssl_mode("disable"), SslMode::Disable));
        assert!(matches!(ssl_mode("prefer"), SslMode::Prefer));
        assert!(matches!(ssl_mode("REQUIRE"), SslMode::Require));
        assert!(matches!(ssl_mode(""), SslMode::Prefer));
    }
}
