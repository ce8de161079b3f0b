//! Application configuration structures.

use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Upper bound for `scraper.request_timeout_secs`.
pub const MAX_REQUEST_TIMEOUT_SECS: f64 = 3600.0;

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// What to fetch and how
    #[serde(default)]
    pub scraper: ScraperConfig,

    /// Where and how records are persisted
    #[serde(default)]
    pub storage: StorageConfig,

    /// Jitter and backoff timings
    #[serde(default)]
    pub pacing: PacingConfig,

    /// Browser fallback settings
    #[serde(default)]
    pub render: RenderConfig,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Defaults overlaid with process environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values from an environment-style lookup.
    ///
    /// Unset keys leave the current value untouched.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let scraper = &mut self.scraper;
        if let Some(v) = get("BASE_URL") {
            scraper.base_url = v;
        }
        if let Some(v) = get("SOURCE_TAG") {
            scraper.source = v;
        }
        if let Some(v) = get("SCRAPER_MODE") {
            scraper.mode = v.parse()?;
        }
        if let Some(v) = get("MAX_PAGES") {
            scraper.max_pages = parse_env("MAX_PAGES", &v)?;
        }
        if let Some(v) = get("FETCH_DETAILS") {
            scraper.fetch_details = parse_flag(&v);
        }
        if let Some(v) = get("REQUEST_TIMEOUT_SECONDS") {
            scraper.request_timeout_secs = parse_env("REQUEST_TIMEOUT_SECONDS", &v)?;
        }
        if let Some(v) = get("MAX_RETRIES") {
            scraper.max_retries = parse_env("MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("SOURCE_IP") {
            scraper.source_ip = Some(parse_env("SOURCE_IP", &v)?);
        }
        if let Some(v) = get("OUTBOUND_PROXY_URL") {
            scraper.outbound_proxy_url = Some(v);
        }
        if let Some(v) = get("RENDER_FALLBACK") {
            scraper.render_fallback = parse_flag(&v);
        }

        let storage = &mut self.storage;
        if let Some(v) = get("SCD_TYPE") {
            storage.scd_type = v.parse()?;
        }
        if let Some(v) = get("CREATE_TABLES") {
            storage.create_tables = parse_flag(&v);
        }
        if let Some(v) = get("INGEST_DATASETS") {
            storage.ingest_datasets = parse_flag(&v);
        }
        if let Some(v) = get("RAW_TABLE") {
            storage.raw_table_name = v;
        }
        if let Some(v) = get("SQLITE_PATH") {
            storage.sqlite_path = PathBuf::from(v);
        }

        let db = &mut storage.db;
        if let Some(v) = get("DB_HOST") {
            db.host = v;
        }
        if let Some(v) = get("DB_PORT") {
            db.port = parse_env("DB_PORT", &v)?;
        }
        if let Some(v) = get("DB_NAME") {
            db.name = v;
        }
        if let Some(v) = get("DB_USER") {
            db.user = v;
        }
        if let Some(v) = get("DB_PASSWORD") {
            db.password = v;
        }
        if let Some(v) = get("DB_SSLMODE") {
            db.sslmode = v;
        }
        if let Some(v) = get("DB_CONNECT_TIMEOUT_SECONDS") {
            db.connect_timeout_secs = parse_env("DB_CONNECT_TIMEOUT_SECONDS", &v)?;
        }
        if let Some(v) = get("DB_SCHEMA") {
            db.schema = v;
        }
        if let Some(v) = get("APPLICATION_NAME") {
            db.application_name = v;
        }

        // A database host without an explicit backend means PostgreSQL.
        match get("STORAGE_BACKEND") {
            Some(v) => storage.backend = v.parse()?,
            None if !storage.db.host.is_empty() => storage.backend = StorageBackend::Postgres,
            None => {}
        }

        if let Some(v) = get("LOG_LEVEL") {
            self.logging.level = v.to_lowercase();
        }

        Ok(())
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        let scraper = &self.scraper;
        if !scraper.base_url.starts_with("http://") && !scraper.base_url.starts_with("https://") {
            return Err(AppError::validation(
                "scraper.base_url must start with http:// or https://",
            ));
        }
        if scraper.source.trim().is_empty() {
            return Err(AppError::validation("scraper.source is empty"));
        }
        if !(scraper.request_timeout_secs > 0.0
            && scraper.request_timeout_secs <= MAX_REQUEST_TIMEOUT_SECS)
        {
            return Err(AppError::validation(format!(
                "scraper.request_timeout_secs must be in (0, {MAX_REQUEST_TIMEOUT_SECS}]"
            )));
        }
        if scraper.max_retries == 0 {
            return Err(AppError::validation("scraper.max_retries must be > 0"));
        }
        if let Some(proxy) = &scraper.outbound_proxy_url {
            url::Url::parse(proxy).map_err(|e| {
                AppError::validation(format!("scraper.outbound_proxy_url is invalid: {e}"))
            })?;
        }

        let storage = &self.storage;
        if !crate::storage::is_valid_ident(&storage.raw_table_name) {
            return Err(AppError::validation(format!(
                "storage.raw_table_name '{}' must match [A-Za-z_][A-Za-z0-9_]*",
                storage.raw_table_name
            )));
        }
        if storage.backend == StorageBackend::Postgres {
            if storage.db.host.trim().is_empty() {
                return Err(AppError::validation("storage.db.host is empty"));
            }
            if !crate::storage::is_valid_ident(&storage.db.schema) {
                return Err(AppError::validation(format!(
                    "storage.db.schema '{}' must match [A-Za-z_][A-Za-z0-9_]*",
                    storage.db.schema
                )));
            }
        }

        for (name, range) in [
            ("pacing.request_jitter_ms", self.pacing.request_jitter_ms),
            ("pacing.detail_jitter_ms", self.pacing.detail_jitter_ms),
            ("pacing.page_jitter_ms", self.pacing.page_jitter_ms),
        ] {
            if range[0] > range[1] {
                return Err(AppError::validation(format!("{name}: min > max")));
            }
        }
        if self.pacing.initial_backoff_ms > self.pacing.max_backoff_ms {
            return Err(AppError::validation(
                "pacing.initial_backoff_ms must be <= pacing.max_backoff_ms",
            ));
        }
        Ok(())
    }
}

/// Which listing layout to scrape.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScraperMode {
    /// Single index page of downloadable datasets
    #[serde(rename = "dbindex")]
    DbIndex,

    /// Paginated listing with optional detail pages
    #[default]
    Paged,
}

impl FromStr for ScraperMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "dbindex" => Ok(Self::DbIndex),
            "paged" | "news" => Ok(Self::Paged),
            other => Err(AppError::config(format!(
                "unknown scraper mode '{other}' (expected dbindex or paged)"
            ))),
        }
    }
}

impl fmt::Display for ScraperMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DbIndex => f.write_str("dbindex"),
            Self::Paged => f.write_str("paged"),
        }
    }
}

/// Slowly-changing-dimension strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum ScdType {
    /// Overwrite in place
    Type1,

    /// Append a new version and close the previous one
    #[default]
    Type2,
}

impl TryFrom<u8> for ScdType {
    type Error = AppError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Type1),
            2 => Ok(Self::Type2),
            other => Err(AppError::config(format!(
                "SCD type must be 1 or 2, got {other}"
            ))),
        }
    }
}

impl From<ScdType> for u8 {
    fn from(value: ScdType) -> Self {
        match value {
            ScdType::Type1 => 1,
            ScdType::Type2 => 2,
        }
    }
}

impl fmt::Display for ScdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SCD{}", u8::from(*self))
    }
}

impl FromStr for ScdType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        let value: u8 = s
            .trim()
            .parse()
            .map_err(|_| AppError::config(format!("SCD type must be 1 or 2, got '{s}'")))?;
        Self::try_from(value)
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Local SQLite file
    #[default]
    Sqlite,

    /// PostgreSQL server
    Postgres,
}

impl FromStr for StorageBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(AppError::config(format!(
                "unknown storage backend '{other}' (expected sqlite or postgres)"
            ))),
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        })
    }
}

/// HTTP and scraping behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    /// Listing URL; may contain a `{page}` placeholder
    #[serde(default = "defaults::base_url")]
    pub base_url: String,

    /// Source tag stored on every record
    #[serde(default = "defaults::source")]
    pub source: String,

    /// Listing layout
    #[serde(default)]
    pub mode: ScraperMode,

    /// Number of listing pages in paged mode
    #[serde(default = "defaults::max_pages")]
    pub max_pages: u32,

    /// Fetch each item's detail page in paged mode
    #[serde(default = "defaults::enabled")]
    pub fetch_details: bool,

    /// Per-request timeout in seconds
    #[serde(default = "defaults::request_timeout")]
    pub request_timeout_secs: f64,

    /// Attempts per URL (HTTP and browser)
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Local address outgoing connections bind to
    #[serde(default)]
    pub source_ip: Option<IpAddr>,

    /// Proxy used for both HTTP and HTTPS
    #[serde(default)]
    pub outbound_proxy_url: Option<String>,

    /// Escalate blocked fetches to a headless browser
    #[serde(default = "defaults::enabled")]
    pub render_fallback: bool,
}

impl ScraperConfig {
    /// Per-read timeout, clamped to `(0, MAX_REQUEST_TIMEOUT_SECS]`.
    pub fn request_timeout(&self) -> Duration {
        let secs = self
            .request_timeout_secs
            .clamp(f64::EPSILON, MAX_REQUEST_TIMEOUT_SECS);
        Duration::try_from_secs_f64(secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(defaults::request_timeout()))
    }
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::base_url(),
            source: defaults::source(),
            mode: ScraperMode::default(),
            max_pages: defaults::max_pages(),
            fetch_details: true,
            request_timeout_secs: defaults::request_timeout(),
            max_retries: defaults::max_retries(),
            source_ip: None,
            outbound_proxy_url: None,
            render_fallback: true,
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    #[serde(default)]
    pub scd_type: ScdType,

    /// Create schema and tables before the run
    #[serde(default)]
    pub create_tables: bool,

    /// Download and land CSV datasets in index mode
    #[serde(default)]
    pub ingest_datasets: bool,

    /// Raw landing table suffix (`raw_<name>`)
    #[serde(default = "defaults::raw_table_name")]
    pub raw_table_name: String,

    /// SQLite database file
    #[serde(default = "defaults::sqlite_path")]
    pub sqlite_path: PathBuf,

    #[serde(default)]
    pub db: DbConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            scd_type: ScdType::default(),
            create_tables: false,
            ingest_datasets: false,
            raw_table_name: defaults::raw_table_name(),
            sqlite_path: defaults::sqlite_path(),
            db: DbConfig::default(),
        }
    }
}

/// PostgreSQL connection parameters.
#[derive(Clone, Serialize, Deserialize)]
pub struct DbConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "defaults::db_port")]
    pub port: u16,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "defaults::sslmode")]
    pub sslmode: String,
    #[serde(default = "defaults::connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "defaults::schema")]
    pub schema: String,
    #[serde(default = "defaults::application_name")]
    pub application_name: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: defaults::db_port(),
            name: String::new(),
            user: String::new(),
            password: String::new(),
            sslmode: defaults::sslmode(),
            connect_timeout_secs: defaults::connect_timeout(),
            schema: defaults::schema(),
            application_name: defaults::application_name(),
        }
    }
}

// Keep the password out of logs.
impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"***")
            .field("sslmode", &self.sslmode)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("schema", &self.schema)
            .field("application_name", &self.application_name)
            .finish()
    }
}

/// Sleep intervals between requests and retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Jitter before every HTTP attempt, `[min, max]` ms
    #[serde(default = "defaults::request_jitter")]
    pub request_jitter_ms: [u64; 2],

    /// Jitter after each detail fetch, `[min, max]` ms
    #[serde(default = "defaults::detail_jitter")]
    pub detail_jitter_ms: [u64; 2],

    /// Jitter after each listing page, `[min, max]` ms
    #[serde(default = "defaults::page_jitter")]
    pub page_jitter_ms: [u64; 2],

    /// First retry backoff
    #[serde(default = "defaults::initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Backoff cap
    #[serde(default = "defaults::max_backoff")]
    pub max_backoff_ms: u64,
}

impl PacingConfig {
    /// No sleeping at all; used by tests.
    pub fn none() -> Self {
        Self {
            request_jitter_ms: [0, 0],
            detail_jitter_ms: [0, 0],
            page_jitter_ms: [0, 0],
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            request_jitter_ms: defaults::request_jitter(),
            detail_jitter_ms: defaults::detail_jitter(),
            page_jitter_ms: defaults::page_jitter(),
            initial_backoff_ms: defaults::initial_backoff(),
            max_backoff_ms: defaults::max_backoff(),
        }
    }
}

/// Headless browser settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    #[serde(default = "defaults::enabled")]
    pub headless: bool,

    /// Chrome/Chromium executable; auto-detected when unset
    #[serde(default)]
    pub chrome_path: Option<PathBuf>,

    /// Wait after a challenge page is detected
    #[serde(default = "defaults::challenge_cooldown")]
    pub challenge_cooldown_secs: u64,

    /// Bodies shorter than this are treated as still blocked
    #[serde(default = "defaults::min_body_chars")]
    pub min_body_chars: usize,

    /// Base of the exponential delay between browser attempts
    #[serde(default = "defaults::render_backoff")]
    pub backoff_base_ms: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            challenge_cooldown_secs: defaults::challenge_cooldown(),
            min_body_chars: defaults::min_body_chars(),
            backoff_base_ms: defaults::render_backoff(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

/// `1`, `true` and `yes` (any case) are true; everything else is false.
pub fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}

fn parse_env<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| AppError::config(format!("{key}='{value}': {e}")))
}

mod defaults {
    use std::path::PathBuf;

    pub fn enabled() -> bool {
        true
    }

    // Scraper defaults
    pub fn base_url() -> String {
        "https://www.ferc.gov/news-events/news".into()
    }
    pub fn source() -> String {
        crate::models::DEFAULT_SOURCE.into()
    }
    pub fn max_pages() -> u32 {
        1
    }
    pub fn request_timeout() -> f64 {
        20.0
    }
    pub fn max_retries() -> u32 {
        6
    }

    // Storage defaults
    pub fn raw_table_name() -> String {
        "ferc".into()
    }
    pub fn sqlite_path() -> PathBuf {
        PathBuf::from("data/ferc.sqlite")
    }
    pub fn db_port() -> u16 {
        5432
    }
    pub fn sslmode() -> String {
        "prefer".into()
    }
    pub fn connect_timeout() -> u64 {
        20
    }
    pub fn schema() -> String {
        "test_external".into()
    }
    pub fn application_name() -> String {
        "ferc_scraper".into()
    }

    // Pacing defaults
    pub fn request_jitter() -> [u64; 2] {
        [200, 900]
    }
    pub fn detail_jitter() -> [u64; 2] {
        [100, 400]
    }
    pub fn page_jitter() -> [u64; 2] {
        [300, 1000]
    }
    pub fn initial_backoff() -> u64 {
        1_000
    }
    pub fn max_backoff() -> u64 {
        30_000
    }

    // Render defaults
    pub fn challenge_cooldown() -> u64 {
        10
    }
    pub fn min_body_chars() -> usize {
        1000
    }
    pub fn render_backoff() -> u64 {
        1_000
    }

    pub fn log_level() -> String {
        "info".into()
    }
}
