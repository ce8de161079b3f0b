//! FERC scraper CLI
//!
//! Local execution entry point.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ferc_scraper::{
    error::Result,
    models::{Config, ScdType, ScraperMode},
    pipeline,
    storage::open_store,
};

/// ferc-scraper - FERC document and dataset scraper
#[derive(Parser, Debug)]
#[command(
    name = "ferc-scraper",
    version,
    about = "Scrapes FERC listings into SCD1/SCD2 tables"
)]
struct Cli {
    /// Path to a TOML config file (defaults plus environment when omitted)
    #[arg(short, long, env = "FERC_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scrape once and persist the results
    Run {
        /// Listing or index URL (may contain a `{page}` placeholder)
        #[arg(long)]
        base_url: Option<String>,

        /// Number of listing pages to walk in paged mode
        #[arg(long)]
        max_pages: Option<u32>,

        /// 1 overwrites in place, 2 keeps version history
        #[arg(long)]
        scd_type: Option<ScdType>,

        /// `paged` or `dbindex`
        #[arg(long)]
        mode: Option<ScraperMode>,

        /// Skip detail pages
        #[arg(long)]
        no_details: bool,

        /// Download linked CSV datasets in dbindex mode
        #[arg(long)]
        ingest_datasets: bool,

        /// Create tables before scraping
        #[arg(long)]
        create_tables: bool,
    },

    /// Create schema, tables and indexes
    Init,

    /// Validate configuration
    Validate,

    /// Print the stored versions of one document
    History {
        /// Document identifier (last URL path segment)
        document_id: String,
    },
}

/// Initialize logging based on verbosity flag and configured level.
fn init_logging(verbose: bool, level: &str) {
    let level = if verbose { "debug" } else { level };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// File (if given) overlaid with environment variables.
fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    Ok(config)
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;
    init_logging(cli.verbose, &config.logging.level);

    if let Some(path) = &cli.config {
        log::info!("Loaded configuration from {}", path.display());
    }

    match cli.command {
        Command::Run {
            base_url,
            max_pages,
            scd_type,
            mode,
            no_details,
            ingest_datasets,
            create_tables,
        } => {
            if let Some(base_url) = base_url {
                config.scraper.base_url = base_url;
            }
            if let Some(max_pages) = max_pages {
                config.scraper.max_pages = max_pages;
            }
            if let Some(scd_type) = scd_type {
                config.storage.scd_type = scd_type;
            }
            if let Some(mode) = mode {
                config.scraper.mode = mode;
            }
            if no_details {
                config.scraper.fetch_details = false;
            }
            if ingest_datasets {
                config.storage.ingest_datasets = true;
            }
            if create_tables {
                config.storage.create_tables = true;
            }

            let persisted = pipeline::run(&config).await?;
            log::info!("Persisted {persisted} records");
        }

        Command::Init => {
            config.validate()?;
            let store = open_store(&config).await?;
            store.ensure_schema().await?;
            log::info!("Schema ready on {} backend", store.backend_name());
        }

        Command::Validate => {
            log::info!("Validating configuration...");

            if let Err(e) = config.validate() {
                log::error!("Config validation failed: {}", e);
                return Err(e);
            }
            log::info!(
                "Config OK: {} mode, {} backend, {}",
                config.scraper.mode,
                config.storage.backend,
                config.storage.scd_type
            );
        }

        Command::History { document_id } => {
            config.validate()?;
            let store = open_store(&config).await?;

            match store.scd_type() {
                ScdType::Type2 => {
                    let versions = store.version_history(&document_id).await?;
                    if versions.is_empty() {
                        log::info!("No versions stored for {document_id}");
                    }
                    for version in &versions {
                        println!("{}", serde_json::to_string(version)?);
                    }
                }
                ScdType::Type1 => match store.current_row(&document_id).await? {
                    Some(row) => println!("{}", serde_json::to_string(&row)?),
                    None => log::info!("No row stored for {document_id}"),
                },
            }
        }
    }

    Ok(())
}
