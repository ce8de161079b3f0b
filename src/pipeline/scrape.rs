// src/pipeline/scrape.rs

//! Scrape pipeline: fetch listings, parse, reconcile into storage.
//!
//! Two modes share the same store and fetcher:
//!
//! - `dbindex` reads one index page, stores its links without content and
//!   optionally ingests linked CSV datasets into a raw table.
//! - `paged` walks `max_pages` listing pages, optionally fetching each
//!   document's detail page, and upserts one batch per page.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::models::{Config, DocumentRecord, ScraperMode};
use crate::services::{PageFetcher, dataset_kind, load_dataset, parse_detail, parse_list};
use crate::storage::{DocumentStore, UpsertSummary, open_store};
use crate::utils::http::jitter_sleep_ms;
use crate::utils::url::build_page_url;

/// Counters for one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub mode: ScraperMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub pages_fetched: usize,
    pub pages_failed: usize,
    pub details_failed: usize,
    pub batches_failed: usize,
    pub upserts: UpsertSummary,
    pub datasets_ingested: usize,
    pub datasets_failed: usize,
    pub rows_ingested: usize,
}

impl RunSummary {
    pub fn new(mode: ScraperMode) -> Self {
        Self {
            mode,
            started_at: Utc::now(),
            finished_at: None,
            pages_fetched: 0,
            pages_failed: 0,
            details_failed: 0,
            batches_failed: 0,
            upserts: UpsertSummary::default(),
            datasets_ingested: 0,
            datasets_failed: 0,
            rows_ingested: 0,
        }
    }

    /// Records accepted by committed batches.
    pub fn persisted(&self) -> usize {
        self.upserts.processed()
    }

    fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    fn log(&self) {
        let elapsed = self
            .finished_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
            .unwrap_or_default();

        log::info!(
            "Run finished ({} mode) in {elapsed:.1}s: {} pages fetched, {} failed",
            self.mode,
            self.pages_fetched,
            self.pages_failed
        );
        log::info!(
            "Documents: {} persisted ({} new, {} versioned, {} unchanged, {} overwritten)",
            self.persisted(),
            self.upserts.inserted,
            self.upserts.versioned,
            self.upserts.unchanged,
            self.upserts.overwritten
        );
        if self.details_failed > 0 || self.batches_failed > 0 {
            log::warn!(
                "{} detail fetches failed, {} batches rolled back",
                self.details_failed,
                self.batches_failed
            );
        }
        if self.datasets_ingested > 0 || self.datasets_failed > 0 {
            log::info!(
                "Datasets: {} ingested ({} rows), {} failed",
                self.datasets_ingested,
                self.rows_ingested,
                self.datasets_failed
            );
        }
    }
}

/// Open the configured store and run one scrape.
///
/// Returns the number of records persisted. A store that cannot be opened
/// is an error; pages that cannot be fetched are not.
pub async fn run(config: &Config) -> Result<usize> {
    config.validate()?;

    let store = open_store(config).await?;
    log::info!(
        "Opened {} store ({})",
        store.backend_name(),
        store.scd_type()
    );

    let fetcher = PageFetcher::from_config(config)?;
    let summary = run_with(config, store.as_ref(), &fetcher).await?;
    Ok(summary.persisted())
}

/// Run one scrape against an already opened store and fetcher.
pub async fn run_with(
    config: &Config,
    store: &dyn DocumentStore,
    fetcher: &PageFetcher,
) -> Result<RunSummary> {
    if config.storage.create_tables {
        store.ensure_schema().await?;
    }

    let mut summary = RunSummary::new(config.scraper.mode);
    log::info!(
        "Scraping {} ({} mode)",
        config.scraper.base_url,
        config.scraper.mode
    );

    match config.scraper.mode {
        ScraperMode::DbIndex => run_index(config, store, fetcher, &mut summary).await?,
        ScraperMode::Paged => run_paged(config, store, fetcher, &mut summary).await,
    }

    summary.finish();
    summary.log();
    Ok(summary)
}

async fn run_index(
    config: &Config,
    store: &dyn DocumentStore,
    fetcher: &PageFetcher,
    summary: &mut RunSummary,
) -> Result<()> {
    let index_url = &config.scraper.base_url;
    let html = match fetcher.fetch_text(index_url).await {
        Ok(html) => html,
        Err(e) => {
            log::warn!("Failed to fetch index {index_url}: {e}");
            summary.pages_failed += 1;
            return Ok(());
        }
    };
    summary.pages_fetched += 1;

    let mut records = parse_list(&html, index_url, &config.scraper.source);
    for record in &mut records {
        record.clear_content();
    }
    log::info!("Parsed {} links from {index_url}", records.len());

    let upserts = store.upsert_documents(&records).await?;
    summary.upserts.merge(upserts);

    if config.storage.ingest_datasets {
        ingest_datasets(config, store, fetcher, &records, summary).await;
    }
    Ok(())
}

async fn ingest_datasets(
    config: &Config,
    store: &dyn DocumentStore,
    fetcher: &PageFetcher,
    records: &[DocumentRecord],
    summary: &mut RunSummary,
) {
    let table = &config.storage.raw_table_name;

    for record in records {
        let Some(kind) = dataset_kind(&record.url) else {
            continue;
        };

        let dataset = match load_dataset(fetcher, &record.url, kind).await {
            Ok(dataset) => dataset,
            Err(e) => {
                log::warn!("Ingest failed for {}: {e}", record.url);
                summary.datasets_failed += 1;
                continue;
            }
        };
        log::info!("Downloaded {} ({} bytes)", record.url, dataset.size);

        match store.ingest_raw_rows(table, &record.url, &dataset.rows).await {
            Ok(count) => {
                log::info!("Ingested {count} rows from {}", record.url);
                summary.datasets_ingested += 1;
                summary.rows_ingested += count;
            }
            Err(e) => {
                log::warn!("Ingest failed for {}: {e}", record.url);
                summary.datasets_failed += 1;
            }
        }
    }
}

async fn run_paged(
    config: &Config,
    store: &dyn DocumentStore,
    fetcher: &PageFetcher,
    summary: &mut RunSummary,
) {
    let scraper = &config.scraper;
    let pacing = &config.pacing;

    for page in 0..scraper.max_pages {
        let page_url = build_page_url(&scraper.base_url, page);
        let html = match fetcher.fetch_text(&page_url).await {
            Ok(html) => html,
            Err(e) => {
                log::warn!("Failed to fetch list page {page_url}: {e}");
                summary.pages_failed += 1;
                continue;
            }
        };
        summary.pages_fetched += 1;

        let mut records = parse_list(&html, &page_url, &scraper.source);
        log::info!("Parsed {} items from {page_url}", records.len());

        if scraper.fetch_details {
            for record in &mut records {
                match fetcher.fetch_text(&record.url).await {
                    Ok(detail) => record.set_content(parse_detail(&detail)),
                    Err(e) => {
                        log::warn!("Failed to fetch detail {}: {e}", record.url);
                        summary.details_failed += 1;
                        record.clear_content();
                    }
                }
                jitter_sleep_ms(pacing.detail_jitter_ms).await;
            }
        } else {
            for record in &mut records {
                record.clear_content();
            }
        }

        match store.upsert_documents(&records).await {
            Ok(upserts) => summary.upserts.merge(upserts),
            Err(e) => {
                log::error!("Failed to persist page {page_url}: {e}");
                summary.batches_failed += 1;
            }
        }

        if page + 1 < scraper.max_pages {
            jitter_sleep_ms(pacing.page_jitter_ms).await;
        }
    }
}
