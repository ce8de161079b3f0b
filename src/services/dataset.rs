// src/services/dataset.rs

//! Downloadable dataset handling: streaming download, extraction, CSV rows.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use zip::ZipArchive;

use crate::error::{AppError, Result};
use crate::services::PageFetcher;
use crate::utils::http::FetchResponse;

/// One CSV row keyed by header name.
pub type CsvRow = Map<String, Value>;

/// Payload layouts the ingester understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Csv,
    CsvGz,
    Zip,
}

/// Classify a dataset URL by its case-insensitive suffix.
///
/// The whole URL is matched, so a trailing query string hides the suffix.
pub fn dataset_kind(url: &str) -> Option<DatasetKind> {
    let url = url.to_lowercase();
    if url.ends_with(".csv.gz") {
        Some(DatasetKind::CsvGz)
    } else if url.ends_with(".csv") {
        Some(DatasetKind::Csv)
    } else if url.ends_with(".zip") {
        Some(DatasetKind::Zip)
    } else {
        None
    }
}

/// A downloaded payload on disk. The file is removed when this drops.
#[derive(Debug)]
pub struct DownloadedFile {
    pub file: NamedTempFile,
    pub sha256: String,
    pub size: u64,
}

/// Parsed contents of one dataset.
#[derive(Debug)]
pub struct Dataset {
    pub rows: Vec<CsvRow>,
    pub sha256: String,
    pub size: u64,
}

/// Stream a response body into a temporary file, hashing as it goes.
pub async fn download_to_temp(mut response: FetchResponse) -> Result<DownloadedFile> {
    let mut file = NamedTempFile::new()?;
    let mut hasher = Sha256::new();
    let mut size = 0u64;

    while let Some(chunk) = response.next_chunk().await? {
        hasher.update(&chunk);
        file.write_all(&chunk)?;
        size += chunk.len() as u64;
    }
    file.flush()?;

    Ok(DownloadedFile {
        file,
        sha256: hex::encode(hasher.finalize()),
        size,
    })
}

/// Raw CSV bytes from a downloaded payload.
///
/// Gzip is decompressed; for zip archives the first `.csv` entry is used.
pub fn extract_csv_bytes(kind: DatasetKind, path: &Path, url: &str) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    match kind {
        DatasetKind::Csv => {
            File::open(path)?.read_to_end(&mut bytes)?;
        }
        DatasetKind::CsvGz => {
            GzDecoder::new(File::open(path)?).read_to_end(&mut bytes)?;
        }
        DatasetKind::Zip => {
            let mut archive = ZipArchive::new(File::open(path)?)?;
            let index = (0..archive.len())
                .find(|&i| {
                    archive.by_index(i).is_ok_and(|entry| {
                        !entry.is_dir() && entry.name().to_lowercase().ends_with(".csv")
                    })
                })
                .ok_or_else(|| AppError::ingest(url, "zip archive has no .csv entry"))?;
            archive.by_index(index)?.read_to_end(&mut bytes)?;
        }
    }
    Ok(bytes)
}

/// Parse CSV bytes into rows keyed by the header line.
///
/// Invalid UTF-8 is replaced. Cells past the header width are keyed
/// `column_<n>`; missing trailing cells are omitted.
pub fn parse_csv_rows(bytes: &[u8]) -> Result<Vec<CsvRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .byte_headers()?
        .iter()
        .enumerate()
        .map(|(i, h)| {
            let name = String::from_utf8_lossy(h).trim().to_string();
            if name.is_empty() {
                format!("column_{}", i + 1)
            } else {
                name
            }
        })
        .collect();

    let mut rows = Vec::new();
    for record in reader.byte_records() {
        let record = record?;
        let mut row = CsvRow::new();
        for (i, cell) in record.iter().enumerate() {
            let key = headers
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("column_{}", i + 1));
            row.insert(key, Value::String(String::from_utf8_lossy(cell).into_owned()));
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Download, extract and parse one dataset URL.
///
/// The temporary file is gone by the time this returns, on every path.
pub async fn load_dataset(fetcher: &PageFetcher, url: &str, kind: DatasetKind) -> Result<Dataset> {
    let response = fetcher.fetch_response(url).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(AppError::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let downloaded = download_to_temp(response).await?;
    log::debug!(
        "Downloaded {url}: {} bytes, sha256 {}",
        downloaded.size,
        downloaded.sha256
    );

    let bytes = extract_csv_bytes(kind, downloaded.file.path(), url)?;
    let rows = parse_csv_rows(&bytes)?;
    Ok(Dataset {
        rows,
        sha256: downloaded.sha256,
        size: downloaded.size,
    })
}
