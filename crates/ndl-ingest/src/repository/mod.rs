// PostgreSQL repository
//
// Writes are chunked multi-row upserts that survive a failing chunk; reads (counts,
// watermarks, ticker lists) propagate every error.

pub mod sanitize;
pub mod upsert;

pub use upsert::UpsertRow;

use async_trait::async_trait;
use chrono::NaiveDate;
use ndl_common::IngestStatus;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::models::{
    BenchmarkPriceRecord, DailyPriceRecord, FundamentalsRecord, IndexMembershipRecord,
    TickerRecord,
};
use crate::orchestrator::RowSink;
use upsert::{prepare_chunk, write_in_chunks};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

pub type Result<T> = std::result::Result<T, RepositoryError>;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("All {chunks} chunk(s) of {entity} failed; last error: {last}")]
    AllChunksFailed {
        entity: &'static str,
        chunks: usize,
        #[source]
        last: sqlx::Error,
    },
}

/// Open the connection pool
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect(&config.url)
        .await?;

    info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database connection pool created"
    );

    Ok(pool)
}

/// Repository over the ingestion tables
#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
    batch_size: usize,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(pool: PgPool, batch_size: usize) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    // ========================================================================
    // Upserts
    // ========================================================================

    /// Upsert `rows` in chunks and return how many rows were written.
    ///
    /// Record types that require a company are first checked against `companies`, and rows
    /// for unknown tickers are left out.
    pub async fn upsert<T: UpsertRow>(&self, rows: &[T]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let known = if T::REQUIRES_COMPANY {
            Some(self.known_tickers(rows).await?)
        } else {
            None
        };

        let written = write_in_chunks(T::ENTITY, rows, self.batch_size, |chunk| {
            self.upsert_chunk(chunk, known.as_ref())
        })
        .await?;

        debug!(entity = T::ENTITY, input = rows.len(), written, "Upsert finished");
        Ok(written)
    }

    async fn upsert_chunk<T: UpsertRow>(
        &self,
        chunk: &[T],
        known: Option<&HashSet<String>>,
    ) -> std::result::Result<u64, sqlx::Error> {
        let rows = prepare_chunk(chunk, known);
        if rows.is_empty() {
            return Ok(0);
        }

        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(T::INSERT);
        query_builder.push_values(rows, |b, row| row.push_tuple(b));
        query_builder.push(T::ON_CONFLICT);

        let result = query_builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Tickers among `rows` that exist in `companies`
    async fn known_tickers<T: UpsertRow>(&self, rows: &[T]) -> Result<HashSet<String>> {
        let wanted: Vec<String> = rows
            .iter()
            .map(|row| row.ticker())
            .collect::<HashSet<_>>()
            .into_iter()
            .map(str::to_owned)
            .collect();

        let found: Vec<String> =
            sqlx::query_scalar("SELECT ticker FROM companies WHERE ticker = ANY($1)")
                .bind(&wanted)
                .fetch_all(&self.pool)
                .await?;

        Ok(found.into_iter().collect())
    }

    pub async fn upsert_companies(&self, rows: &[TickerRecord]) -> Result<u64> {
        self.upsert(rows).await
    }

    pub async fn upsert_fundamentals(&self, rows: &[FundamentalsRecord]) -> Result<u64> {
        self.upsert(rows).await
    }

    pub async fn upsert_daily_prices(&self, rows: &[DailyPriceRecord]) -> Result<u64> {
        self.upsert(rows).await
    }

    pub async fn upsert_benchmark_prices(&self, rows: &[BenchmarkPriceRecord]) -> Result<u64> {
        self.upsert(rows).await
    }

    pub async fn upsert_index_memberships(&self, rows: &[IndexMembershipRecord]) -> Result<u64> {
        self.upsert(rows).await
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn company_exists(&self, ticker: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM companies WHERE ticker = $1)")
                .bind(ticker)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    /// Active companies, alphabetically
    pub async fn active_tickers(&self) -> Result<Vec<String>> {
        let tickers =
            sqlx::query_scalar("SELECT ticker FROM companies WHERE active = true ORDER BY ticker")
                .fetch_all(&self.pool)
                .await?;
        Ok(tickers)
    }

    pub async fn benchmark_tickers(&self) -> Result<Vec<String>> {
        let tickers = sqlx::query_scalar("SELECT ticker FROM benchmarks ORDER BY ticker")
            .fetch_all(&self.pool)
            .await?;
        Ok(tickers)
    }

    pub async fn company_count(&self) -> Result<i64> {
        self.count("SELECT COUNT(*) FROM companies").await
    }

    pub async fn metric_count(&self) -> Result<i64> {
        self.count("SELECT COUNT(*) FROM financial_metrics").await
    }

    pub async fn daily_price_count(&self) -> Result<i64> {
        self.count("SELECT COUNT(*) FROM daily_prices").await
    }

    pub async fn benchmark_price_count(&self) -> Result<i64> {
        self.count("SELECT COUNT(*) FROM benchmark_prices").await
    }

    pub async fn index_membership_count(&self) -> Result<i64> {
        self.count("SELECT COUNT(*) FROM index_memberships").await
    }

    async fn count(&self, sql: &'static str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(sql).fetch_one(&self.pool).await?;
        Ok(count)
    }

    /// Latest `last_updated` among fundamentals, 1970-01-01 when empty.
    ///
    /// Fundamentals are filtered upstream by `lastupdated`, so that is the watermark.
    pub async fn fundamentals_watermark(&self) -> Result<NaiveDate> {
        self.watermark(
            "SELECT COALESCE(MAX(last_updated), DATE '1970-01-01') FROM financial_metrics",
        )
        .await
    }

    /// Latest stored trading date for equities, 1970-01-01 when empty.
    ///
    /// The provider touches `lastupdated` on every daily row, so the trading date is used.
    pub async fn daily_watermark(&self) -> Result<NaiveDate> {
        self.watermark("SELECT COALESCE(MAX(date), DATE '1970-01-01') FROM daily_prices")
            .await
    }

    /// Latest stored trading date for benchmarks, 1970-01-01 when empty
    pub async fn benchmark_watermark(&self) -> Result<NaiveDate> {
        self.watermark("SELECT COALESCE(MAX(date), DATE '1970-01-01') FROM benchmark_prices")
            .await
    }

    async fn watermark(&self, sql: &'static str) -> Result<NaiveDate> {
        let date: NaiveDate = sqlx::query_scalar(sql).fetch_one(&self.pool).await?;
        Ok(date)
    }

    /// Row counts of every table plus the latest dates stored
    pub async fn status(&self) -> Result<IngestStatus> {
        let (last_metric_update, last_price_date, last_benchmark_date): (
            Option<NaiveDate>,
            Option<NaiveDate>,
            Option<NaiveDate>,
        ) = sqlx::query_as(
            r#"
            SELECT
                (SELECT MAX(last_updated) FROM financial_metrics),
                (SELECT MAX(date) FROM daily_prices),
                (SELECT MAX(date) FROM benchmark_prices)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(IngestStatus {
            companies: self.company_count().await?,
            financial_metrics: self.metric_count().await?,
            daily_prices: self.daily_price_count().await?,
            benchmark_prices: self.benchmark_price_count().await?,
            index_memberships: self.index_membership_count().await?,
            last_metric_update,
            last_price_date,
            last_benchmark_date,
        })
    }
}

#[async_trait]
impl<T> RowSink<T> for PgRepository
where
    T: UpsertRow + 'static,
{
    async fn write(&self, rows: Vec<T>) -> crate::error::Result<u64> {
        Ok(self.upsert(&rows).await?)
    }
}
