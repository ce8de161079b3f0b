//! Service layer for the scraper.
//!
//! This module contains the business logic for:
//! - Page fetching with browser fallback (`PageFetcher`)
//! - Headless rendering of challenge pages (`RenderClient`)
//! - Listing/detail parsing (`parse_list`, `parse_detail`)
//! - Fuzzy date extraction (`parse_fuzzy_date`)
//! - Dataset download and CSV extraction (`load_dataset`)

pub mod dataset;
pub mod dates;
pub mod fetcher;
pub mod parser;
pub mod render;

pub use dataset::{CsvRow, Dataset, DatasetKind, dataset_kind, load_dataset};
pub use dates::parse_fuzzy_date;
pub use fetcher::PageFetcher;
pub use parser::{parse_detail, parse_list};
pub use render::{RenderBackend, RenderClient, RenderLauncher, RenderTiming};
