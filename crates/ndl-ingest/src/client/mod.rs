// Nasdaq Data Link datatables client
//
// Every request goes through one shared rate limiter and a bounded retry loop. Tables are
// read either page by page into a single `Datatable` (`fetch_all`) or as a stream of pages
// (`fetch_stream`), where the ticker filter is split into groups so several cursor chains
// can run side by side.

pub mod datatable;
pub mod rate_limit;

pub use datatable::{ApiResponse, Column, Datatable, Page, RawRow};
pub use rate_limit::RateLimiter;

use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::models::{DailyPriceRecord, FundamentalsRecord, IndexMembershipRecord, TickerRecord};
use crate::parser::{parse_rows, DatatableRecord};

pub const DEFAULT_BASE_URL: &str = "https://data.nasdaq.com/api/v3/datatables";
pub const DEFAULT_REQUESTS_PER_SECOND: u32 = 2;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1000;
pub const DEFAULT_TICKERS_PER_REQUEST: usize = 100;
pub const DEFAULT_STREAM_BUFFER: usize = 16;

/// Error bodies are cut to this many bytes before being kept in an error
const MAX_ERROR_BODY: usize = 512;

/// Query filters, kept sorted so generated URLs are stable
pub type Params = BTreeMap<String, String>;

pub type Result<T> = std::result::Result<T, FetchError>;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("{table} returned HTTP {status}: {body}")]
    Http {
        table: String,
        status: u16,
        body: String,
    },

    #[error("Request to {table} failed: {source}")]
    Transport {
        table: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Could not decode {table} response: {source}")]
    Decode {
        table: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{table}: giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        table: String,
        attempts: u32,
        last: Box<FetchError>,
    },

    #[error("Fetch cancelled")]
    Cancelled,

    #[error("Invalid request URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl FetchError {
    /// Transport failures and non-2xx answers (429 included) are worth another attempt;
    /// a body that arrived but cannot be decoded is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Http { .. } | FetchError::Transport { .. })
    }
}

/// Client settings
#[derive(Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub requests_per_second: u32,
    pub timeout: Duration,
    /// Attempts per page, first try included
    pub max_attempts: u32,
    /// Delay before retry `n` is `backoff_base * 2^n`
    pub backoff_base: Duration,
    /// Ticker group size for streaming fetches
    pub tickers_per_request: usize,
    /// Pages buffered between a streaming fetch and its consumer
    pub stream_buffer: usize,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("requests_per_second", &self.requests_per_second)
            .field("timeout", &self.timeout)
            .field("max_attempts", &self.max_attempts)
            .field("backoff_base", &self.backoff_base)
            .field("tickers_per_request", &self.tickers_per_request)
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            tickers_per_request: DEFAULT_TICKERS_PER_REQUEST,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_requests_per_second(mut self, rps: u32) -> Self {
        self.requests_per_second = rps;
        self
    }

    pub fn with_backoff_base(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = backoff_base;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_tickers_per_request(mut self, tickers_per_request: usize) -> Self {
        self.tickers_per_request = tickers_per_request;
        self
    }
}

/// Rate-limited, retrying client for the datatables API.
///
/// Cloning is cheap and clones share the rate limiter and cancellation token.
#[derive(Debug, Clone)]
pub struct NdlClient {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
    limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
}

impl NdlClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_cancellation(config, CancellationToken::new())
    }

    /// Client whose requests stop as soon as `cancel` fires
    pub fn with_cancellation(config: ClientConfig, cancel: CancellationToken) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(FetchError::InvalidRequest("API key is empty".to_string()));
        }
        Url::parse(&config.base_url)?;

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("ndl-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| FetchError::Transport {
                table: String::new(),
                source,
            })?;

        Ok(Self {
            http,
            limiter: Arc::new(RateLimiter::new(config.requests_per_second)),
            config: Arc::new(config),
            cancel,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ========================================================================
    // Paginated reads
    // ========================================================================

    /// Fetch every page of `table` and merge them.
    ///
    /// Columns come from the first page; rows from all pages are concatenated in order.
    pub async fn fetch_all(&self, table: &str, params: &Params) -> Result<Datatable> {
        let mut merged = Datatable::default();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let mut page = self.fetch_page(table, params, cursor.as_deref()).await?;
            pages += 1;

            if pages == 1 {
                merged.columns = std::mem::take(&mut page.datatable.columns);
            }
            let next = page.next_cursor().map(str::to_owned);
            merged.rows.append(&mut page.datatable.data);

            debug!(table, page = pages, rows = merged.len(), "Fetched page");

            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        info!(table, pages, rows = merged.len(), "Fetched table");
        Ok(merged)
    }

    /// Stream pages of `table` as they arrive.
    ///
    /// A `ticker` filter is split into groups of `tickers_per_request`; each group is its own
    /// cursor chain and at most `concurrency` chains (so at most `concurrency` requests) run
    /// at once. Once a chain fails no further chains are started, the error is delivered on
    /// the channel, and chains already running finish. The channel closes when every chain
    /// has ended.
    pub fn fetch_stream(
        &self,
        table: &str,
        params: &Params,
        concurrency: usize,
    ) -> mpsc::Receiver<Result<Page>> {
        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));
        let chains = self.split_ticker_groups(params);
        let client = self.clone();
        let table = table.to_string();

        tokio::spawn(async move {
            client.run_chains(table, chains, concurrency.max(1), tx).await;
        });

        rx
    }

    /// Streaming fetch parsed into typed rows, one `Vec` per page
    pub fn stream_rows<T>(
        &self,
        table: &str,
        params: &Params,
        concurrency: usize,
    ) -> mpsc::Receiver<Result<Vec<T>>>
    where
        T: DatatableRecord + Send + 'static,
    {
        let mut pages = self.fetch_stream(table, params, concurrency);
        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));

        tokio::spawn(async move {
            while let Some(page) = pages.recv().await {
                let batch = page.map(|page| parse_rows::<T>(&page.columns, &page.rows));
                if tx.send(batch).await.is_err() {
                    break;
                }
            }
        });

        rx
    }

    async fn run_chains(
        &self,
        table: String,
        chains: Vec<Params>,
        concurrency: usize,
        tx: mpsc::Sender<Result<Page>>,
    ) {
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let failed = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();
        let total = chains.len();

        for (chain_idx, chain_params) in chains.into_iter().enumerate() {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            if failed.load(Ordering::Acquire) || tx.is_closed() {
                debug!(table = %table, chain = chain_idx, "Not starting remaining chains");
                break;
            }

            let client = self.clone();
            let table = table.clone();
            let tx = tx.clone();
            let failed = Arc::clone(&failed);

            tasks.spawn(async move {
                let _permit = permit;
                if let Err(e) = client.run_chain(&table, &chain_params, &tx).await {
                    failed.store(true, Ordering::Release);
                    warn!(table = %table, chain = chain_idx, error = %e, "Cursor chain failed");
                    let _ = tx.send(Err(e)).await;
                }
            });
        }
        drop(tx);

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(table = %table, error = %e, "Cursor chain task panicked");
            }
        }

        debug!(table = %table, chains = total, "Streaming fetch finished");
    }

    /// Follow one cursor chain to its end, forwarding each page.
    async fn run_chain(
        &self,
        table: &str,
        params: &Params,
        tx: &mpsc::Sender<Result<Page>>,
    ) -> Result<()> {
        let mut columns: Option<Arc<[Column]>> = None;
        let mut cursor: Option<String> = None;

        loop {
            let page = self.fetch_page(table, params, cursor.as_deref()).await?;
            let next = page.next_cursor().map(str::to_owned);
            let columns = columns
                .get_or_insert_with(|| Arc::from(page.datatable.columns.clone()))
                .clone();

            let delivered = tx
                .send(Ok(Page {
                    columns,
                    rows: page.datatable.data,
                }))
                .await;
            if delivered.is_err() {
                debug!(table, "Consumer went away; stopping chain");
                return Ok(());
            }

            match next {
                Some(next) => cursor = Some(next),
                None => return Ok(()),
            }
        }
    }

    fn split_ticker_groups(&self, params: &Params) -> Vec<Params> {
        let Some(tickers) = params.get("ticker") else {
            return vec![params.clone()];
        };

        let tickers: Vec<&str> = tickers
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();
        let group_size = self.config.tickers_per_request.max(1);
        if tickers.len() <= group_size {
            return vec![params.clone()];
        }

        tickers
            .chunks(group_size)
            .map(|group| {
                let mut chain = params.clone();
                chain.insert("ticker".to_string(), group.join(","));
                chain
            })
            .collect()
    }

    // ========================================================================
    // Single page with retries
    // ========================================================================

    /// Fetch one page, retrying transient failures with exponential backoff
    pub async fn fetch_page(
        &self,
        table: &str,
        params: &Params,
        cursor: Option<&str>,
    ) -> Result<ApiResponse> {
        let url = self.page_url(table, params, cursor)?;

        tokio::select! {
            _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
            _ = self.limiter.acquire() => {}
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                outcome = self.request_once(table, &url) => outcome,
            };

            match outcome {
                Ok(response) => return Ok(response),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    return Err(FetchError::RetriesExhausted {
                        table: table.to_string(),
                        attempts: attempt,
                        last: Box::new(e),
                    });
                },
                Err(e) => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        table,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Request failed, retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                },
            }
        }
    }

    async fn request_once(&self, table: &str, url: &Url) -> Result<ApiResponse> {
        let transport = |source| FetchError::Transport {
            table: table.to_string(),
            source,
        };

        let response = self.http.get(url.clone()).send().await.map_err(transport)?;
        let status = response.status();
        let body = response.text().await.map_err(transport)?;

        if !status.is_success() {
            return Err(FetchError::Http {
                table: table.to_string(),
                status: status.as_u16(),
                body: truncate_body(body),
            });
        }

        serde_json::from_str(&body).map_err(|source| FetchError::Decode {
            table: table.to_string(),
            source,
        })
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based)
    fn backoff_delay(&self, attempt: u32) -> Duration {
        self.config.backoff_base * 2u32.saturating_pow(attempt)
    }

    /// `{base}/{table}.json?api_key=…&filters…[&qopts.cursor_id=…]`
    fn page_url(&self, table: &str, params: &Params, cursor: Option<&str>) -> Result<Url> {
        let mut url = Url::parse(&format!(
            "{}/{}.json",
            self.config.base_url.trim_end_matches('/'),
            table
        ))?;

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("api_key", &self.config.api_key);
            for (key, value) in params {
                query.append_pair(key, value);
            }
            if let Some(cursor) = cursor {
                query.append_pair("qopts.cursor_id", cursor);
            }
        }

        Ok(url)
    }

    // ========================================================================
    // Typed reads
    // ========================================================================

    /// Fetch every page of `T::TABLE` and parse it
    pub async fn fetch_rows<T: DatatableRecord>(&self, params: &Params) -> Result<Vec<T>> {
        let table = self.fetch_all(T::TABLE, params).await?;
        Ok(parse_rows(&table.columns, &table.rows))
    }

    /// Company metadata for SF1 tickers; all of them when `tickers` is empty
    pub async fn fetch_tickers(&self, tickers: &[String]) -> Result<Vec<TickerRecord>> {
        let mut params = Params::new();
        params.insert("table".to_string(), "SF1".to_string());
        with_tickers(&mut params, tickers);
        self.fetch_rows(&params).await
    }

    pub async fn fetch_fundamentals(
        &self,
        tickers: &[String],
        dimension: &str,
        since: Option<NaiveDate>,
    ) -> Result<Vec<FundamentalsRecord>> {
        self.fetch_rows(&fundamentals_params(tickers, dimension, since))
            .await
    }

    /// Daily prices; at least one ticker is required
    pub async fn fetch_daily(
        &self,
        tickers: &[String],
        since: Option<NaiveDate>,
    ) -> Result<Vec<DailyPriceRecord>> {
        if tickers.is_empty() {
            return Err(FetchError::InvalidRequest(
                "at least one ticker is required for a daily fetch".to_string(),
            ));
        }
        self.fetch_rows(&daily_params(tickers, since)).await
    }

    /// Current S&P 500 constituents
    pub async fn fetch_index_current(&self) -> Result<Vec<IndexMembershipRecord>> {
        let mut params = Params::new();
        params.insert("action".to_string(), "current".to_string());
        self.fetch_rows(&params).await
    }
}

/// Filters for an SF1 read of one dimension
pub fn fundamentals_params(
    tickers: &[String],
    dimension: &str,
    since: Option<NaiveDate>,
) -> Params {
    let mut params = Params::new();
    with_tickers(&mut params, tickers);
    if !dimension.is_empty() {
        params.insert("dimension".to_string(), dimension.to_string());
    }
    with_since(&mut params, since);
    params
}

/// Filters for a DAILY read
pub fn daily_params(tickers: &[String], since: Option<NaiveDate>) -> Params {
    let mut params = Params::new();
    with_tickers(&mut params, tickers);
    with_since(&mut params, since);
    params
}

fn with_tickers(params: &mut Params, tickers: &[String]) {
    if !tickers.is_empty() {
        params.insert("ticker".to_string(), tickers.join(","));
    }
}

fn with_since(params: &mut Params, since: Option<NaiveDate>) {
    if let Some(since) = since {
        params.insert(
            "lastupdated.gte".to_string(),
            since.format("%Y-%m-%d").to_string(),
        );
    }
}

fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push_str("...");
    }
    body
}
