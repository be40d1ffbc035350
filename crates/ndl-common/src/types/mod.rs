//! Result types reported by the ingestion entry points

use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Outcome of one ingestion run.
///
/// `success` is false only when the run wrote nothing and hit at least one error; partial
/// progress with some failed chunks is still reported as a success with a lower count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub success: bool,
    pub message: String,
    pub count: u64,
    #[serde(with = "duration_millis", rename = "elapsed_ms")]
    pub elapsed: Duration,
}

impl IngestOutcome {
    pub fn ok(count: u64, message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            success: true,
            message: message.into(),
            count,
            elapsed,
        }
    }

    pub fn failed(count: u64, message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            success: false,
            message: message.into(),
            count,
            elapsed,
        }
    }
}

/// Snapshot of what is currently stored
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStatus {
    pub companies: i64,
    pub financial_metrics: i64,
    pub daily_prices: i64,
    pub benchmark_prices: i64,
    pub index_memberships: i64,
    /// Latest `last_updated` seen in financial metrics
    pub last_metric_update: Option<NaiveDate>,
    /// Latest trading date stored for equities
    pub last_price_date: Option<NaiveDate>,
    /// Latest trading date stored for benchmarks
    pub last_benchmark_date: Option<NaiveDate>,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serializes_elapsed_as_millis() {
        let outcome = IngestOutcome::ok(42, "done", Duration::from_millis(1500));
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["elapsed_ms"], 1500);
        assert_eq!(json["count"], 42);
        assert_eq!(json["success"], true);
    }

    #[test]
    fn test_failed_outcome() {
        let outcome = IngestOutcome::failed(0, "no rows written", Duration::ZERO);
        assert!(!outcome.success);
        let back: IngestOutcome =
            serde_json::from_str(&serde_json::to_string(&outcome).unwrap()).unwrap();
        assert_eq!(back, outcome);
    }
}
