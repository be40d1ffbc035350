//! NDL Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared plumbing for the NDL ingestion workspace.
//!
//! - **Logging**: `tracing` subscriber setup driven by [`logging::LogConfig`]
//! - **Errors**: the [`CommonError`] type used for configuration and environment parsing
//! - **Types**: result shapes handed to whatever sits above the ingestion pipeline
//!   (CLI today, an admin dashboard elsewhere)
//!
//! # Example
//!
//! ```no_run
//! use ndl_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     let _guard = init_logging(&config)?;
//!     tracing::info!("ready");
//!     Ok(())
//! }
//! ```

pub mod env;
pub mod error;
pub mod logging;
pub mod types;

pub use error::{CommonError, Result};
pub use types::{IngestOutcome, IngestStatus};
