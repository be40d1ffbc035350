//! NDL Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Loads SHARADAR datatables from Nasdaq Data Link into PostgreSQL.
//!
//! # Components
//!
//! - **client**: rate-limited, retrying API client with whole-table and streaming reads
//! - **parser** / **models**: columnar rows into typed records
//! - **repository**: chunked, idempotent upserts with NUMERIC overflow guards
//! - **orchestrator**: concurrent fetch-to-write pipeline with bounded writes
//! - **service**: one entry point per table plus a status query
//!
//! # Example
//!
//! ```no_run
//! use ndl_ingest::config::IngestSettings;
//! use ndl_ingest::service::{DailyRequest, IngestService};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = IngestSettings::load()?;
//!     let service = IngestService::connect(&settings, CancellationToken::new()).await?;
//!
//!     let outcome = service.ingest_daily(DailyRequest::default()).await;
//!     println!("{} rows in {:?}", outcome.count, outcome.elapsed);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod parser;
pub mod repository;
pub mod service;

pub use client::{FetchError, NdlClient};
pub use error::{IngestError, Result};
pub use repository::PgRepository;
pub use service::IngestService;
