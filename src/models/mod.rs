// src/models/mod.rs

//! Domain models for the scraper.
//!
//! Records produced by the parser and the configuration that drives a run.

mod config;
mod document;

// Re-export all public types
pub use config::{
    Config, DbConfig, LoggingConfig, PacingConfig, RenderConfig, ScdType, ScraperConfig,
    ScraperMode, StorageBackend, StorageConfig, parse_flag,
};
pub use document::{DEFAULT_SOURCE, DocumentRecord, Extra, ExtraValue, content_sha256};
