//! Ingestion configuration
//!
//! Everything is read from the environment (a `.env` file is honoured by [`IngestSettings::load`]).
//! Unset variables fall back to the `DEFAULT_*` constants below; set but malformed values are
//! rejected.

use ndl_common::{env, CommonError};
use std::fmt;
use std::time::Duration;

use crate::client::{
    ClientConfig, DEFAULT_BACKOFF_BASE_MS, DEFAULT_BASE_URL, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_REQUESTS_PER_SECOND, DEFAULT_STREAM_BUFFER, DEFAULT_TICKERS_PER_REQUEST,
    DEFAULT_TIMEOUT_SECS,
};
use crate::repository::DEFAULT_BATCH_SIZE;

// ============================================================================
// Defaults
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/ndl";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Cursor chains fetched at once by a streaming run.
pub const DEFAULT_FETCH_CONCURRENCY: usize = 5;

/// Upserts in flight at once by a streaming run.
pub const DEFAULT_WRITE_CONCURRENCY: usize = 3;

/// Fundamentals dimensions ingested when none are requested.
pub const DEFAULT_DIMENSIONS: &[&str] = &["ARQ", "MRQ"];

/// Complete configuration of the ingestion binary
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub api: ApiConfig,
    pub database: DatabaseConfig,
    pub pipeline: PipelineConfig,
}

/// Upstream API settings
#[derive(Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub requests_per_second: u32,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub tickers_per_request: usize,
}

// Keeps the key out of logs and error output.
impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("requests_per_second", &self.requests_per_second)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_attempts", &self.max_attempts)
            .field("backoff_base_ms", &self.backoff_base_ms)
            .field("tickers_per_request", &self.tickers_per_request)
            .finish()
    }
}

impl ApiConfig {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            requests_per_second: self.requests_per_second,
            timeout: Duration::from_secs(self.timeout_secs),
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            tickers_per_request: self.tickers_per_request,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Throughput knobs for streaming runs
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub fetch_concurrency: usize,
    pub write_concurrency: usize,
    pub batch_size: usize,
    pub dimensions: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            write_concurrency: DEFAULT_WRITE_CONCURRENCY,
            batch_size: DEFAULT_BATCH_SIZE,
            dimensions: DEFAULT_DIMENSIONS.iter().map(|d| d.to_string()).collect(),
        }
    }
}

impl IngestSettings {
    /// Read `.env` if present, then the environment
    pub fn load() -> ndl_common::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Read settings from the environment and validate them
    pub fn from_env() -> ndl_common::Result<Self> {
        let settings = IngestSettings {
            api: ApiConfig {
                base_url: env::string_or("NDL_BASE_URL", DEFAULT_BASE_URL),
                api_key: env::required("NASDAQ_API_KEY")?,
                requests_per_second: env::parse_or(
                    "NDL_REQUESTS_PER_SECOND",
                    DEFAULT_REQUESTS_PER_SECOND,
                )?,
                timeout_secs: env::parse_or("NDL_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?,
                max_attempts: env::parse_or("NDL_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?,
                backoff_base_ms: env::parse_or("NDL_BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS)?,
                tickers_per_request: env::parse_or(
                    "NDL_TICKERS_PER_REQUEST",
                    DEFAULT_TICKERS_PER_REQUEST,
                )?,
            },
            database: DatabaseConfig {
                url: env::string_or("DATABASE_URL", DEFAULT_DATABASE_URL),
                max_connections: env::parse_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                )?,
                min_connections: env::parse_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                )?,
                connect_timeout_secs: env::parse_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                )?,
            },
            pipeline: PipelineConfig {
                fetch_concurrency: env::parse_or(
                    "INGEST_FETCH_CONCURRENCY",
                    DEFAULT_FETCH_CONCURRENCY,
                )?,
                write_concurrency: env::parse_or(
                    "INGEST_WRITE_CONCURRENCY",
                    DEFAULT_WRITE_CONCURRENCY,
                )?,
                batch_size: env::parse_or("INGEST_BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
                dimensions: env::list_or("INGEST_DIMENSIONS", DEFAULT_DIMENSIONS),
            },
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration
    pub fn validate(&self) -> ndl_common::Result<()> {
        if self.api.api_key.trim().is_empty() {
            return Err(CommonError::MissingEnv("NASDAQ_API_KEY".to_string()));
        }

        if url::Url::parse(&self.api.base_url).is_err() {
            return Err(CommonError::config(format!(
                "API base URL is not a valid URL: {}",
                self.api.base_url
            )));
        }

        if self.api.requests_per_second == 0 {
            return Err(CommonError::config("Requests per second must be greater than 0"));
        }

        if self.api.max_attempts == 0 {
            return Err(CommonError::config("Max attempts must be at least 1"));
        }

        if self.api.tickers_per_request == 0 {
            return Err(CommonError::config("Tickers per request must be greater than 0"));
        }

        if self.database.url.is_empty() {
            return Err(CommonError::config("Database URL cannot be empty"));
        }

        if self.database.max_connections == 0 {
            return Err(CommonError::config("Database max_connections must be greater than 0"));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(CommonError::config(format!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }

        self.pipeline.validate()
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> ndl_common::Result<()> {
        if self.fetch_concurrency == 0 || self.write_concurrency == 0 {
            return Err(CommonError::config("Fetch and write concurrency must be at least 1"));
        }

        if self.batch_size == 0 {
            return Err(CommonError::config("Batch size must be greater than 0"));
        }

        if self.dimensions.is_empty() {
            return Err(CommonError::config("At least one fundamentals dimension is required"));
        }

        Ok(())
    }
}
