// Per-table ingestion entry points
//
// Each entry point returns an `IngestOutcome` whether it succeeded or not, so a caller can
// tell "nothing happened" from "mostly worked". Large tables (fundamentals, daily prices)
// go through the streaming orchestrator; the small ones are fetched whole.

use chrono::NaiveDate;
use ndl_common::{IngestOutcome, IngestStatus};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::client::{daily_params, fundamentals_params, NdlClient, Params};
use crate::config::{IngestSettings, PipelineConfig};
use crate::error::{IngestError, Result};
use crate::models::{BenchmarkPriceRecord, DailyPriceRecord, FundamentalsRecord};
use crate::orchestrator::{StreamingIngest, UnitSummary};
use crate::parser::DatatableRecord;
use crate::repository::{create_pool, PgRepository, UpsertRow};

/// Fundamentals run options
#[derive(Debug, Clone, Default)]
pub struct FundamentalsRequest {
    /// Empty means every active company
    pub tickers: Vec<String>,
    /// Empty means the configured dimensions
    pub dimensions: Vec<String>,
    /// Fetch full history instead of changes since the watermark
    pub full: bool,
}

/// Daily price run options
#[derive(Debug, Clone, Default)]
pub struct DailyRequest {
    /// Empty means every active company
    pub tickers: Vec<String>,
    pub full: bool,
}

pub struct IngestService {
    client: NdlClient,
    repository: Arc<PgRepository>,
    streaming: StreamingIngest<PgRepository>,
    pipeline: PipelineConfig,
}

impl IngestService {
    pub fn new(client: NdlClient, repository: PgRepository, pipeline: PipelineConfig) -> Self {
        let repository = Arc::new(repository);
        let streaming = StreamingIngest::new(Arc::clone(&repository), pipeline.write_concurrency);
        Self {
            client,
            repository,
            streaming,
            pipeline,
        }
    }

    /// Build the client and connection pool described by `settings`
    pub async fn connect(settings: &IngestSettings, cancel: CancellationToken) -> Result<Self> {
        let client = NdlClient::with_cancellation(settings.api.client_config(), cancel)?;
        let pool = create_pool(&settings.database).await?;
        let repository = PgRepository::with_batch_size(pool, settings.pipeline.batch_size);
        Ok(Self::new(client, repository, settings.pipeline.clone()))
    }

    pub fn repository(&self) -> &PgRepository {
        &self.repository
    }

    /// Refresh company metadata; every ticker when `tickers` is empty
    pub async fn ingest_tickers(&self, tickers: &[String]) -> IngestOutcome {
        report("tickers", async {
            let records = self.client.fetch_tickers(tickers).await?;
            let fetched = records.len();
            let written = self.repository.upsert_companies(&records).await?;
            Ok((written, format!("Upserted {written} of {fetched} companies")))
        })
        .await
    }

    /// Fundamentals, one streaming unit per dimension
    pub async fn ingest_fundamentals(&self, request: FundamentalsRequest) -> IngestOutcome {
        report("fundamentals", async {
            if self.repository.company_count().await? == 0 {
                return Err(IngestError::precondition(
                    "No companies stored; ingest tickers first",
                ));
            }

            let tickers = self.resolve_tickers(request.tickers).await?;
            let since = if request.full {
                None
            } else {
                Some(self.repository.fundamentals_watermark().await?)
            };
            let dimensions = if request.dimensions.is_empty() {
                self.pipeline.dimensions.clone()
            } else {
                request.dimensions
            };

            let mut units = Vec::with_capacity(dimensions.len());
            for dimension in &dimensions {
                let params = fundamentals_params(&tickers, dimension, since);
                let label = format!("SF1 {dimension}");
                units.push(self.stream::<FundamentalsRecord>(&label, &params).await);
            }

            summarize("fundamentals rows", &units, since)
        })
        .await
    }

    /// Daily prices for the requested (or all active) companies
    pub async fn ingest_daily(&self, request: DailyRequest) -> IngestOutcome {
        report("daily", async {
            let tickers = self.resolve_tickers(request.tickers).await?;
            let since = if request.full {
                None
            } else {
                Some(self.repository.daily_watermark().await?)
            };

            let params = daily_params(&tickers, since);
            let unit = self.stream::<DailyPriceRecord>("DAILY", &params).await;
            summarize("daily prices", &[unit], since)
        })
        .await
    }

    /// Benchmark prices for the tickers listed in `benchmarks`
    pub async fn ingest_benchmarks(&self, full: bool) -> IngestOutcome {
        report("benchmarks", async {
            let tickers = self.repository.benchmark_tickers().await?;
            if tickers.is_empty() {
                return Err(IngestError::precondition("No benchmarks configured"));
            }

            let since = if full {
                None
            } else {
                Some(self.repository.benchmark_watermark().await?)
            };
            let records: Vec<BenchmarkPriceRecord> =
                self.client.fetch_rows(&daily_params(&tickers, since)).await?;
            let written = self.repository.upsert_benchmark_prices(&records).await?;

            Ok((
                written,
                format!(
                    "Upserted {written} benchmark prices for {}",
                    tickers.join(", ")
                ),
            ))
        })
        .await
    }

    /// Current S&P 500 membership
    pub async fn ingest_index_membership(&self) -> IngestOutcome {
        report("index membership", async {
            let records = self.client.fetch_index_current().await?;
            let written = self.repository.upsert_index_memberships(&records).await?;
            Ok((written, format!("Upserted {written} S&P 500 memberships")))
        })
        .await
    }

    pub async fn status(&self) -> Result<IngestStatus> {
        Ok(self.repository.status().await?)
    }

    async fn stream<T>(&self, label: &str, params: &Params) -> UnitSummary
    where
        T: DatatableRecord + UpsertRow + 'static,
    {
        self.streaming
            .run::<T>(&self.client, label, params, self.pipeline.fetch_concurrency)
            .await
    }

    async fn resolve_tickers(&self, requested: Vec<String>) -> Result<Vec<String>> {
        if !requested.is_empty() {
            return Ok(requested);
        }
        let tickers = self.repository.active_tickers().await?;
        if tickers.is_empty() {
            return Err(IngestError::precondition("No active companies stored"));
        }
        Ok(tickers)
    }
}

/// Run one entry point and turn its result into an outcome
async fn report<F>(kind: &str, work: F) -> IngestOutcome
where
    F: Future<Output = Result<(u64, String)>>,
{
    let started = Instant::now();
    match work.await {
        Ok((count, message)) => {
            let outcome = IngestOutcome::ok(count, message, started.elapsed());
            info!(
                kind,
                count,
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                "{}",
                outcome.message
            );
            outcome
        },
        Err(e) => {
            error!(kind, error = %e, "Ingestion failed");
            IngestOutcome::failed(0, e.to_string(), started.elapsed())
        },
    }
}

/// Fold streaming units into a count and message, failing only if nothing was written
fn summarize(
    what: &str,
    units: &[UnitSummary],
    since: Option<NaiveDate>,
) -> Result<(u64, String)> {
    let written: u64 = units.iter().map(|u| u.rows_written).sum();
    let failed: Vec<&UnitSummary> = units.iter().filter(|u| !u.errors.is_empty()).collect();
    let scope = match since {
        Some(since) => format!(" (updated since {since})"),
        None => " (full history)".to_string(),
    };

    if let Some(unit) = failed.first() {
        let first = unit
            .first_error()
            .map(ToString::to_string)
            .unwrap_or_default();
        if written == 0 {
            return Err(IngestError::NothingWritten(format!(
                "No {what} written; {}: {first}",
                unit.label
            )));
        }
        return Ok((
            written,
            format!(
                "Upserted {written} {what}{scope}; {} unit(s) reported errors, first in {}: {first}",
                failed.len(),
                unit.label
            ),
        ));
    }

    Ok((written, format!("Upserted {written} {what}{scope}")))
}
