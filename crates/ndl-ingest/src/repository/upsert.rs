// Multi-row upserts
//
// Each record type describes its table, conflict target and bind order through `UpsertRow`;
// the repository turns a chunk of records into one `INSERT ... VALUES (...), (...)
// ON CONFLICT ... DO UPDATE` statement. `write_in_chunks` drives the chunks and keeps going
// when one of them fails.

use chrono::NaiveDate;
use sqlx::query_builder::Separated;
use sqlx::Postgres;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use tracing::{debug, error, warn};

use super::sanitize::{sanitize, CURRENCY, PRICE, RATIO};
use super::{RepositoryError, Result};
use crate::models::{
    BenchmarkPriceRecord, DailyPriceRecord, FundamentalsRecord, IndexAction,
    IndexMembershipRecord, TickerRecord,
};

/// How many unknown tickers to name in a warning
const UNKNOWN_TICKER_SAMPLE: usize = 10;

/// A record that can be written with a multi-row upsert
pub trait UpsertRow: Send + Sync {
    /// Identity of the row in its table
    type Key: Eq + Hash + Debug;

    /// Destination table
    const ENTITY: &'static str;

    /// `INSERT INTO table (columns...)`, bound in the same order as `push_tuple`
    const INSERT: &'static str;

    /// Conflict target and the `DO UPDATE SET` list, which always refreshes `updated_at`
    const ON_CONFLICT: &'static str;

    /// Rows may only be written for tickers already in `companies`
    const REQUIRES_COMPANY: bool;

    fn key(&self) -> Self::Key;

    fn ticker(&self) -> &str;

    /// Bind one `VALUES` tuple, sanitising decimals on the way
    fn push_tuple<'args>(&self, row: Separated<'_, 'args, Postgres, &'static str>);
}

impl UpsertRow for TickerRecord {
    type Key = String;

    const ENTITY: &'static str = "companies";
    const INSERT: &'static str =
        "INSERT INTO companies (ticker, name, exchange, sector, industry, active, last_updated) ";
    const ON_CONFLICT: &'static str = r#"
        ON CONFLICT (ticker) DO UPDATE SET
            name = EXCLUDED.name,
            exchange = EXCLUDED.exchange,
            sector = EXCLUDED.sector,
            industry = EXCLUDED.industry,
            active = EXCLUDED.active,
            last_updated = EXCLUDED.last_updated,
            updated_at = NOW()
    "#;
    const REQUIRES_COMPANY: bool = false;

    fn key(&self) -> String {
        self.ticker.clone()
    }

    fn ticker(&self) -> &str {
        &self.ticker
    }

    fn push_tuple<'args>(&self, mut row: Separated<'_, 'args, Postgres, &'static str>) {
        row.push_bind(self.ticker.clone())
            .push_bind(self.name.clone())
            .push_bind(self.exchange.clone())
            .push_bind(self.sector.clone())
            .push_bind(self.industry.clone())
            .push_bind(!self.is_delisted)
            .push_bind(self.last_updated);
    }
}

impl UpsertRow for FundamentalsRecord {
    type Key = (String, String, NaiveDate);

    const ENTITY: &'static str = "financial_metrics";
    const INSERT: &'static str = r#"
        INSERT INTO financial_metrics (
            ticker, dimension, date_key, calendar_date, report_period, last_updated,
            revenue, net_income, ebitda, fcf,
            roic, pe_ratio, ev_ebit, pb_ratio, debt_to_equity,
            market_cap, enterprise_value, price
        )
    "#;
    const ON_CONFLICT: &'static str = r#"
        ON CONFLICT (ticker, dimension, date_key) DO UPDATE SET
            calendar_date = EXCLUDED.calendar_date,
            report_period = EXCLUDED.report_period,
            last_updated = EXCLUDED.last_updated,
            revenue = EXCLUDED.revenue,
            net_income = EXCLUDED.net_income,
            ebitda = EXCLUDED.ebitda,
            fcf = EXCLUDED.fcf,
            roic = EXCLUDED.roic,
            pe_ratio = EXCLUDED.pe_ratio,
            ev_ebit = EXCLUDED.ev_ebit,
            pb_ratio = EXCLUDED.pb_ratio,
            debt_to_equity = EXCLUDED.debt_to_equity,
            market_cap = EXCLUDED.market_cap,
            enterprise_value = EXCLUDED.enterprise_value,
            price = EXCLUDED.price,
            updated_at = NOW()
    "#;
    const REQUIRES_COMPANY: bool = true;

    fn key(&self) -> Self::Key {
        (self.ticker.clone(), self.dimension.clone(), self.date_key)
    }

    fn ticker(&self) -> &str {
        &self.ticker
    }

    fn push_tuple<'args>(&self, mut row: Separated<'_, 'args, Postgres, &'static str>) {
        let key = format!("{}/{}/{}", self.ticker, self.dimension, self.date_key);
        let entity = Self::ENTITY;

        row.push_bind(self.ticker.clone())
            .push_bind(self.dimension.clone())
            .push_bind(self.date_key)
            .push_bind(self.calendar_date)
            .push_bind(self.report_period)
            .push_bind(self.last_updated)
            .push_bind(sanitize(&self.revenue, CURRENCY, entity, &key, "revenue"))
            .push_bind(sanitize(&self.net_income, CURRENCY, entity, &key, "net_income"))
            .push_bind(sanitize(&self.ebitda, CURRENCY, entity, &key, "ebitda"))
            .push_bind(sanitize(&self.fcf, CURRENCY, entity, &key, "fcf"))
            .push_bind(sanitize(&self.roic, RATIO, entity, &key, "roic"))
            .push_bind(sanitize(&self.pe_ratio, RATIO, entity, &key, "pe_ratio"))
            .push_bind(sanitize(&self.ev_ebit, RATIO, entity, &key, "ev_ebit"))
            .push_bind(sanitize(&self.pb_ratio, RATIO, entity, &key, "pb_ratio"))
            .push_bind(sanitize(&self.debt_to_equity, RATIO, entity, &key, "debt_to_equity"))
            .push_bind(sanitize(&self.market_cap, CURRENCY, entity, &key, "market_cap"))
            .push_bind(sanitize(&self.enterprise_value, CURRENCY, entity, &key, "enterprise_value"))
            .push_bind(sanitize(&self.price, PRICE, entity, &key, "price"));
    }
}

/// Column list shared by `daily_prices` and `benchmark_prices`
macro_rules! price_insert {
    ($table:literal) => {
        concat!(
            "INSERT INTO ",
            $table,
            " (ticker, date, open, high, low, close, volume, dividends, close_unadj, ",
            "market_cap, enterprise_value, pe_ratio, pb_ratio, last_updated) "
        )
    };
}

const PRICE_ON_CONFLICT: &str = r#"
    ON CONFLICT (ticker, date) DO UPDATE SET
        open = EXCLUDED.open,
        high = EXCLUDED.high,
        low = EXCLUDED.low,
        close = EXCLUDED.close,
        volume = EXCLUDED.volume,
        dividends = EXCLUDED.dividends,
        close_unadj = EXCLUDED.close_unadj,
        market_cap = EXCLUDED.market_cap,
        enterprise_value = EXCLUDED.enterprise_value,
        pe_ratio = EXCLUDED.pe_ratio,
        pb_ratio = EXCLUDED.pb_ratio,
        last_updated = EXCLUDED.last_updated,
        updated_at = NOW()
"#;

fn push_price_tuple<'args>(
    record: &DailyPriceRecord,
    entity: &str,
    mut row: Separated<'_, 'args, Postgres, &'static str>,
) {
    let key = format!("{}/{}", record.ticker, record.date);

    row.push_bind(record.ticker.clone())
        .push_bind(record.date)
        .push_bind(sanitize(&record.open, PRICE, entity, &key, "open"))
        .push_bind(sanitize(&record.high, PRICE, entity, &key, "high"))
        .push_bind(sanitize(&record.low, PRICE, entity, &key, "low"))
        .push_bind(sanitize(&record.close, PRICE, entity, &key, "close"))
        .push_bind(record.volume)
        .push_bind(sanitize(&record.dividends, PRICE, entity, &key, "dividends"))
        .push_bind(sanitize(&record.close_unadj, PRICE, entity, &key, "close_unadj"))
        .push_bind(sanitize(&record.market_cap, CURRENCY, entity, &key, "market_cap"))
        .push_bind(sanitize(&record.enterprise_value, CURRENCY, entity, &key, "enterprise_value"))
        .push_bind(sanitize(&record.pe_ratio, RATIO, entity, &key, "pe_ratio"))
        .push_bind(sanitize(&record.pb_ratio, RATIO, entity, &key, "pb_ratio"))
        .push_bind(record.last_updated);
}

impl UpsertRow for DailyPriceRecord {
    type Key = (String, NaiveDate);

    const ENTITY: &'static str = "daily_prices";
    const INSERT: &'static str = price_insert!("daily_prices");
    const ON_CONFLICT: &'static str = PRICE_ON_CONFLICT;
    const REQUIRES_COMPANY: bool = true;

    fn key(&self) -> Self::Key {
        (self.ticker.clone(), self.date)
    }

    fn ticker(&self) -> &str {
        &self.ticker
    }

    fn push_tuple<'args>(&self, row: Separated<'_, 'args, Postgres, &'static str>) {
        push_price_tuple(self, Self::ENTITY, row);
    }
}

impl UpsertRow for BenchmarkPriceRecord {
    type Key = (String, NaiveDate);

    const ENTITY: &'static str = "benchmark_prices";
    const INSERT: &'static str = price_insert!("benchmark_prices");
    const ON_CONFLICT: &'static str = PRICE_ON_CONFLICT;
    const REQUIRES_COMPANY: bool = false;

    fn key(&self) -> Self::Key {
        (self.0.ticker.clone(), self.0.date)
    }

    fn ticker(&self) -> &str {
        &self.0.ticker
    }

    fn push_tuple<'args>(&self, row: Separated<'_, 'args, Postgres, &'static str>) {
        push_price_tuple(&self.0, Self::ENTITY, row);
    }
}

impl UpsertRow for IndexMembershipRecord {
    type Key = (String, NaiveDate, IndexAction);

    const ENTITY: &'static str = "index_memberships";
    const INSERT: &'static str =
        "INSERT INTO index_memberships (ticker, date, action, name, contra_ticker, contra_name) ";
    const ON_CONFLICT: &'static str = r#"
        ON CONFLICT (ticker, date, action) DO UPDATE SET
            name = EXCLUDED.name,
            contra_ticker = EXCLUDED.contra_ticker,
            contra_name = EXCLUDED.contra_name,
            updated_at = NOW()
    "#;
    const REQUIRES_COMPANY: bool = false;

    fn key(&self) -> Self::Key {
        (self.ticker.clone(), self.date, self.action)
    }

    fn ticker(&self) -> &str {
        &self.ticker
    }

    fn push_tuple<'args>(&self, mut row: Separated<'_, 'args, Postgres, &'static str>) {
        row.push_bind(self.ticker.clone())
            .push_bind(self.date)
            .push_bind(self.action.as_str())
            .push_bind(self.name.clone())
            .push_bind(self.contra_ticker.clone())
            .push_bind(self.contra_name.clone());
    }
}

/// Rows of one chunk that will actually be sent.
///
/// Drops rows whose ticker is not in `known` (when given) and collapses repeated keys so
/// the last occurrence wins; Postgres refuses to update one row twice in one statement.
pub(crate) fn prepare_chunk<'a, T: UpsertRow>(
    chunk: &'a [T],
    known: Option<&HashSet<String>>,
) -> Vec<&'a T> {
    let mut kept: Vec<&T> = Vec::with_capacity(chunk.len());
    let mut positions: HashMap<T::Key, usize> = HashMap::with_capacity(chunk.len());
    let mut unknown: BTreeSet<&str> = BTreeSet::new();
    let mut unknown_rows = 0usize;
    let mut duplicates = 0usize;

    for row in chunk {
        if let Some(known) = known {
            if !known.contains(row.ticker()) {
                unknown_rows += 1;
                unknown.insert(row.ticker());
                continue;
            }
        }

        match positions.entry(row.key()) {
            Entry::Occupied(slot) => {
                kept[*slot.get()] = row;
                duplicates += 1;
            },
            Entry::Vacant(slot) => {
                slot.insert(kept.len());
                kept.push(row);
            },
        }
    }

    if unknown_rows > 0 {
        let sample: Vec<&str> = unknown.iter().take(UNKNOWN_TICKER_SAMPLE).copied().collect();
        warn!(
            entity = T::ENTITY,
            rows = unknown_rows,
            tickers = ?sample,
            "Skipping rows for tickers missing from companies"
        );
    }
    if duplicates > 0 {
        debug!(entity = T::ENTITY, duplicates, "Collapsed duplicate keys in chunk");
    }

    kept
}

/// Run `write_chunk` over `rows` in chunks of `batch_size`.
///
/// A failing chunk is logged with its row range and skipped. The call only fails when at
/// least one chunk failed and nothing at all was written.
pub(crate) async fn write_in_chunks<'a, T, F, Fut>(
    entity: &'static str,
    rows: &'a [T],
    batch_size: usize,
    mut write_chunk: F,
) -> Result<u64>
where
    F: FnMut(&'a [T]) -> Fut,
    Fut: Future<Output = std::result::Result<u64, sqlx::Error>>,
{
    if rows.is_empty() {
        return Ok(0);
    }

    let batch_size = batch_size.max(1);
    let total_chunks = rows.len().div_ceil(batch_size);
    let mut written = 0u64;
    let mut failed_chunks = 0usize;
    let mut last_error = None;

    for (chunk_idx, chunk) in rows.chunks(batch_size).enumerate() {
        let first_row = chunk_idx * batch_size;
        let last_row = first_row + chunk.len() - 1;

        match write_chunk(chunk).await {
            Ok(count) => {
                written += count;
                debug!(
                    entity,
                    chunk = chunk_idx + 1,
                    total_chunks,
                    rows = count,
                    "Chunk written"
                );
            },
            Err(e) => {
                error!(
                    entity,
                    chunk = chunk_idx + 1,
                    total_chunks,
                    first_row,
                    last_row,
                    error = %e,
                    "Chunk failed; continuing with the next one"
                );
                failed_chunks += 1;
                last_error = Some(e);
            },
        }
    }

    match last_error {
        Some(last) if written == 0 => Err(RepositoryError::AllChunksFailed {
            entity,
            chunks: failed_chunks,
            last,
        }),
        _ => Ok(written),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::Mutex;
    use sqlx::types::BigDecimal;

    fn daily(ticker: &str, day: u32, close: &str) -> DailyPriceRecord {
        DailyPriceRecord {
            ticker: ticker.to_string(),
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            open: None,
            high: None,
            low: None,
            close: Some(BigDecimal::from_str(close).unwrap()),
            volume: None,
            dividends: None,
            close_unadj: None,
            market_cap: None,
            enterprise_value: None,
            pe_ratio: None,
            pb_ratio: None,
            last_updated: None,
        }
    }

    #[test]
    fn test_prepare_chunk_last_occurrence_wins() {
        let rows = vec![
            daily("AAPL", 2, "1.00"),
            daily("MSFT", 2, "2.00"),
            daily("AAPL", 2, "3.00"),
        ];

        let kept = prepare_chunk(&rows, None);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].ticker, "AAPL");
        assert_eq!(kept[0].close, Some(BigDecimal::from_str("3.00").unwrap()));
        assert_eq!(kept[1].ticker, "MSFT");
    }

    #[test]
    fn test_prepare_chunk_drops_unknown_tickers() {
        let rows = vec![
            daily("AAPL", 2, "1"),
            daily("NOPE", 2, "1"),
            daily("MSFT", 2, "1"),
        ];
        let known: HashSet<String> = ["AAPL", "MSFT"].iter().map(|s| s.to_string()).collect();

        let kept = prepare_chunk(&rows, Some(&known));
        let tickers: Vec<&str> = kept.iter().map(|r| r.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["AAPL", "MSFT"]);
    }

    #[test]
    fn test_price_insert_lists_every_bound_column() {
        let columns = DailyPriceRecord::INSERT
            .split_once('(')
            .and_then(|(_, rest)| rest.split_once(')'))
            .map(|(cols, _)| cols.split(',').count())
            .unwrap();
        assert_eq!(columns, 14);
        assert!(BenchmarkPriceRecord::INSERT.contains("benchmark_prices"));
    }

    #[tokio::test]
    async fn test_write_in_chunks_empty_input_skips_writer() {
        let rows: Vec<u32> = Vec::new();
        let calls = std::cell::Cell::new(0);
        let written = write_in_chunks("t", &rows, 10, |_| {
            calls.set(calls.get() + 1);
            async { Ok::<u64, sqlx::Error>(1) }
        })
        .await
        .unwrap();
        assert_eq!(written, 0);
        assert_eq!(calls.get(), 0);
    }

    #[tokio::test]
    async fn test_write_in_chunks_isolates_failing_chunk() {
        let rows: Vec<u32> = (0..25).collect();
        let seen = Mutex::new(Vec::new());

        let written = write_in_chunks("t", &rows, 10, |chunk: &[u32]| {
            seen.lock().unwrap().push(chunk.len());
            let fail = chunk[0] == 10;
            let len = chunk.len() as u64;
            async move {
                if fail {
                    Err(sqlx::Error::Protocol("boom".to_string()))
                } else {
                    Ok(len)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(written, 15);
        assert_eq!(*seen.lock().unwrap(), vec![10, 10, 5]);
    }

    #[tokio::test]
    async fn test_write_in_chunks_fails_when_nothing_written() {
        let rows: Vec<u32> = (0..5).collect();
        let err = write_in_chunks("t", &rows, 2, |_| async {
            Err::<u64, _>(sqlx::Error::Protocol("down".to_string()))
        })
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            RepositoryError::AllChunksFailed { chunks: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_write_in_chunks_zero_rows_without_errors_is_ok() {
        let rows: Vec<u32> = (0..3).collect();
        let written = write_in_chunks("t", &rows, 2, |_| async { Ok::<u64, sqlx::Error>(0) })
            .await
            .unwrap();
        assert_eq!(written, 0);
    }
}
