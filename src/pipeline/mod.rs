//! Pipeline entry points.
//!
//! - `run`: Open the configured store and scrape once
//! - `run_with`: Scrape with a caller-supplied store and fetcher
//! - `has_changed`: Decide whether a record differs from its stored version

pub mod diff;
pub mod scrape;

pub use diff::{ChangeKind, VersionSnapshot, has_changed};
pub use scrape::{RunSummary, run, run_with};
