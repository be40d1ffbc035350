// Streaming ingestion
//
// Pages flow from a streaming fetch into a bounded set of concurrent writes. Fetch
// concurrency is capped inside the client; write concurrency is capped here by a semaphore
// whose permit is taken before a write task is spawned, so at most `write_concurrency`
// batches are ever held by in-flight writes.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::client::{FetchError, NdlClient, Params};
use crate::error::{IngestError, Result};
use crate::parser::DatatableRecord;

/// Destination for parsed batches
#[async_trait]
pub trait RowSink<T>: Send + Sync {
    /// Persist `rows`, returning how many were written
    async fn write(&self, rows: Vec<T>) -> Result<u64>;
}

/// Outcome of one streaming unit (one fundamentals dimension, one daily run, ...)
#[derive(Debug)]
pub struct UnitSummary {
    pub label: String,
    pub rows_written: u64,
    pub batches: usize,
    pub errors: Vec<IngestError>,
    pub elapsed: Duration,
}

impl UnitSummary {
    /// A unit fails only when something went wrong and nothing was written
    pub fn failed(&self) -> bool {
        !self.errors.is_empty() && self.rows_written == 0
    }

    pub fn first_error(&self) -> Option<&IngestError> {
        self.errors.first()
    }
}

/// Drains streaming fetches into a sink with bounded write concurrency
pub struct StreamingIngest<S> {
    sink: Arc<S>,
    write_concurrency: usize,
}

impl<S> StreamingIngest<S> {
    pub fn new(sink: Arc<S>, write_concurrency: usize) -> Self {
        Self {
            sink,
            write_concurrency: write_concurrency.max(1),
        }
    }

    pub fn write_concurrency(&self) -> usize {
        self.write_concurrency
    }

    /// Stream `T::TABLE` with `params` and write every page to the sink
    pub async fn run<T>(
        &self,
        client: &NdlClient,
        label: &str,
        params: &Params,
        fetch_concurrency: usize,
    ) -> UnitSummary
    where
        S: RowSink<T> + 'static,
        T: DatatableRecord + Send + 'static,
    {
        let batches = client.stream_rows::<T>(T::TABLE, params, fetch_concurrency);
        self.drain(label, batches).await
    }

    /// Write every batch received on `batches` until the channel closes.
    ///
    /// A fetch error is recorded and draining continues with whatever else arrives. All
    /// spawned writes are joined before returning.
    pub async fn drain<T>(
        &self,
        label: &str,
        mut batches: mpsc::Receiver<std::result::Result<Vec<T>, FetchError>>,
    ) -> UnitSummary
    where
        S: RowSink<T> + 'static,
        T: Send + 'static,
    {
        let started = Instant::now();
        let permits = Arc::new(Semaphore::new(self.write_concurrency));
        let written = Arc::new(AtomicU64::new(0));
        let mut writes: JoinSet<Result<()>> = JoinSet::new();
        let mut errors = Vec::new();
        let mut batch_count = 0usize;

        while let Some(batch) = batches.recv().await {
            let rows = match batch {
                Ok(rows) if rows.is_empty() => continue,
                Ok(rows) => rows,
                Err(e) => {
                    warn!(unit = label, error = %e, "Fetch failed; draining remaining batches");
                    errors.push(IngestError::from(e));
                    continue;
                },
            };

            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            batch_count += 1;

            let sink = Arc::clone(&self.sink);
            let written = Arc::clone(&written);
            writes.spawn(async move {
                let _permit = permit;
                let count = sink.write(rows).await?;
                written.fetch_add(count, Ordering::Relaxed);
                Ok(())
            });

            while let Some(done) = writes.try_join_next() {
                collect_write(label, done, &mut errors);
            }
        }

        while let Some(done) = writes.join_next().await {
            collect_write(label, done, &mut errors);
        }

        let summary = UnitSummary {
            label: label.to_string(),
            rows_written: written.load(Ordering::Relaxed),
            batches: batch_count,
            errors,
            elapsed: started.elapsed(),
        };

        info!(
            unit = label,
            rows = summary.rows_written,
            batches = summary.batches,
            errors = summary.errors.len(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Streaming unit finished"
        );

        summary
    }
}

fn collect_write(
    label: &str,
    joined: std::result::Result<Result<()>, tokio::task::JoinError>,
    errors: &mut Vec<IngestError>,
) {
    match joined {
        Ok(Ok(())) => {},
        Ok(Err(e)) => {
            error!(unit = label, error = %e, "Batch write failed");
            errors.push(e);
        },
        Err(e) => {
            error!(unit = label, error = %e, "Batch write task aborted");
            errors.push(IngestError::from(e));
        },
    }
}
