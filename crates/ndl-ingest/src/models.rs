// Typed records read from the SHARADAR datatables

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::types::BigDecimal;

use crate::parser::{DatatableRecord, RowView};

pub const TICKERS_TABLE: &str = "SHARADAR/TICKERS";
pub const FUNDAMENTALS_TABLE: &str = "SHARADAR/SF1";
pub const DAILY_TABLE: &str = "SHARADAR/DAILY";
pub const SP500_TABLE: &str = "SHARADAR/SP500";

/// Company metadata (`SHARADAR/TICKERS`)
#[derive(Debug, Clone, PartialEq)]
pub struct TickerRecord {
    pub ticker: String,
    pub name: Option<String>,
    pub exchange: Option<String>,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub is_delisted: bool,
    pub last_updated: Option<NaiveDate>,
}

impl DatatableRecord for TickerRecord {
    const TABLE: &'static str = TICKERS_TABLE;

    fn from_row(row: &RowView<'_>) -> Option<Self> {
        Some(Self {
            ticker: row.get("ticker")?,
            name: row.get("name"),
            exchange: row.get("exchange"),
            sector: row.get("sector"),
            industry: row.get("industry"),
            is_delisted: row.get("isdelisted").unwrap_or(false),
            last_updated: row.get("lastupdated"),
        })
    }
}

/// One fundamentals filing (`SHARADAR/SF1`), identified by ticker, dimension and datekey
#[derive(Debug, Clone, PartialEq)]
pub struct FundamentalsRecord {
    pub ticker: String,
    pub dimension: String,
    pub date_key: NaiveDate,
    pub calendar_date: NaiveDate,
    pub report_period: NaiveDate,
    pub last_updated: Option<NaiveDate>,

    pub revenue: Option<BigDecimal>,
    pub net_income: Option<BigDecimal>,
    pub ebitda: Option<BigDecimal>,
    pub fcf: Option<BigDecimal>,
    pub roic: Option<BigDecimal>,
    pub pe_ratio: Option<BigDecimal>,
    pub ev_ebit: Option<BigDecimal>,
    pub pb_ratio: Option<BigDecimal>,
    pub debt_to_equity: Option<BigDecimal>,
    pub market_cap: Option<BigDecimal>,
    pub enterprise_value: Option<BigDecimal>,
    pub price: Option<BigDecimal>,
}

impl DatatableRecord for FundamentalsRecord {
    const TABLE: &'static str = FUNDAMENTALS_TABLE;

    fn from_row(row: &RowView<'_>) -> Option<Self> {
        let date_key: NaiveDate = row.get("datekey")?;

        Some(Self {
            ticker: row.get("ticker")?,
            dimension: row.get("dimension")?,
            date_key,
            calendar_date: row.get("calendardate").unwrap_or(date_key),
            report_period: row.get("reportperiod").unwrap_or(date_key),
            last_updated: row.get("lastupdated"),
            revenue: row.get("revenue"),
            net_income: row.get("netinc"),
            ebitda: row.get("ebitda"),
            fcf: row.get("fcf"),
            roic: row.get("roic"),
            pe_ratio: row.get("pe"),
            ev_ebit: row.get("evebit"),
            pb_ratio: row.get("pb"),
            debt_to_equity: row.get("de"),
            market_cap: row.get("marketcap"),
            enterprise_value: row.get("ev"),
            price: row.get("price"),
        })
    }
}

/// One trading day for one ticker (`SHARADAR/DAILY`)
#[derive(Debug, Clone, PartialEq)]
pub struct DailyPriceRecord {
    pub ticker: String,
    pub date: NaiveDate,
    pub open: Option<BigDecimal>,
    pub high: Option<BigDecimal>,
    pub low: Option<BigDecimal>,
    pub close: Option<BigDecimal>,
    pub volume: Option<i64>,
    pub dividends: Option<BigDecimal>,
    pub close_unadj: Option<BigDecimal>,
    pub market_cap: Option<BigDecimal>,
    pub enterprise_value: Option<BigDecimal>,
    pub pe_ratio: Option<BigDecimal>,
    pub pb_ratio: Option<BigDecimal>,
    pub last_updated: Option<NaiveDate>,
}

impl DatatableRecord for DailyPriceRecord {
    const TABLE: &'static str = DAILY_TABLE;

    fn from_row(row: &RowView<'_>) -> Option<Self> {
        let date = row.get("date")?;

        Some(Self {
            ticker: row.get("ticker")?,
            date,
            open: row.get("open"),
            high: row.get("high"),
            low: row.get("low"),
            close: row.get("close"),
            volume: row.get("volume"),
            dividends: row.get("dividends"),
            close_unadj: row.get("closeunadj"),
            market_cap: row.get("marketcap"),
            enterprise_value: row.get("ev"),
            pe_ratio: row.get("pe"),
            pb_ratio: row.get("pb"),
            last_updated: row.get("lastupdated"),
        })
    }
}

/// Daily row for a benchmark such as SPY.
///
/// Same source table as [`DailyPriceRecord`] but stored separately and not tied to a company.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkPriceRecord(pub DailyPriceRecord);

impl DatatableRecord for BenchmarkPriceRecord {
    const TABLE: &'static str = DAILY_TABLE;

    fn from_row(row: &RowView<'_>) -> Option<Self> {
        DailyPriceRecord::from_row(row).map(Self)
    }
}

impl From<DailyPriceRecord> for BenchmarkPriceRecord {
    fn from(record: DailyPriceRecord) -> Self {
        Self(record)
    }
}

/// Index membership event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexAction {
    Current,
    Added,
    Removed,
}

impl IndexAction {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexAction::Current => "current",
            IndexAction::Added => "added",
            IndexAction::Removed => "removed",
        }
    }
}

impl std::str::FromStr for IndexAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "current" => Ok(IndexAction::Current),
            "added" => Ok(IndexAction::Added),
            "removed" => Ok(IndexAction::Removed),
            other => Err(format!("unknown index action: {other}")),
        }
    }
}

/// S&P 500 constituent event (`SHARADAR/SP500`)
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMembershipRecord {
    pub date: NaiveDate,
    pub action: IndexAction,
    pub ticker: String,
    pub name: Option<String>,
    pub contra_ticker: Option<String>,
    pub contra_name: Option<String>,
}

impl DatatableRecord for IndexMembershipRecord {
    const TABLE: &'static str = SP500_TABLE;

    fn from_row(row: &RowView<'_>) -> Option<Self> {
        let action = row.get::<String>("action")?.parse().ok()?;

        Some(Self {
            date: row.get("date")?,
            action,
            ticker: row.get("ticker")?,
            name: row.get("name"),
            // Older extracts abbreviate the counterpart columns.
            contra_ticker: row.get_any(&["contraticker", "conticker"]),
            contra_name: row.get_any(&["contraname", "conname"]),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::client::Column;
    use crate::parser::parse_rows;
    use serde_json::{json, Value};
    use std::str::FromStr;

    fn columns(names: &[&str]) -> Vec<Column> {
        names
            .iter()
            .map(|name| Column {
                name: name.to_string(),
                kind: String::new(),
            })
            .collect()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_ticker_rows() {
        let cols = columns(&["ticker", "name", "exchange", "isdelisted", "lastupdated"]);
        let rows = vec![
            vec![json!("AAPL"), json!("Apple Inc"), json!("NASDAQ"), json!("N"), json!("2024-03-01")],
            vec![json!("LEHMQ"), json!("Lehman"), Value::Null, json!("Y"), Value::Null],
            vec![Value::Null, json!("No ticker"), json!("NYSE"), json!("N"), Value::Null],
        ];

        let parsed: Vec<TickerRecord> = parse_rows(&cols, &rows);
        assert_eq!(parsed.len(), 2);
        assert!(!parsed[0].is_delisted);
        assert_eq!(parsed[0].last_updated, Some(date(2024, 3, 1)));
        assert!(parsed[1].is_delisted);
        assert_eq!(parsed[1].exchange, None);
    }

    #[test]
    fn test_fundamentals_report_period_falls_back_to_datekey() {
        let cols = columns(&["ticker", "dimension", "datekey", "revenue", "pe"]);
        let rows = vec![vec![
            json!("AAPL"),
            json!("ARQ"),
            json!("2024-01-02"),
            json!(119575000000.0),
            json!("28.5"),
        ]];

        let parsed: Vec<FundamentalsRecord> = parse_rows(&cols, &rows);
        assert_eq!(parsed.len(), 1);
        let record = &parsed[0];
        assert_eq!(record.report_period, date(2024, 1, 2));
        assert_eq!(record.calendar_date, date(2024, 1, 2));
        assert_eq!(record.pe_ratio, Some(BigDecimal::from_str("28.5").unwrap()));
        assert!(record.revenue.is_some());
        assert_eq!(record.roic, None);
    }

    #[test]
    fn test_fundamentals_without_identity_are_dropped() {
        let cols = columns(&["ticker", "dimension", "datekey"]);
        let rows = vec![
            vec![json!("AAPL"), json!("ARQ"), Value::Null],
            vec![json!("AAPL"), Value::Null, json!("2024-01-02")],
            vec![Value::Null, json!("ARQ"), json!("2024-01-02")],
            vec![json!("MSFT"), json!("MRQ"), json!("2024-01-02")],
        ];

        let parsed: Vec<FundamentalsRecord> = parse_rows(&cols, &rows);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].ticker, "MSFT");
    }

    #[test]
    fn test_daily_rows_tolerate_bad_fields() {
        let cols = columns(&["ticker", "date", "close", "volume", "marketcap"]);
        let rows = vec![
            vec![json!("AAPL"), json!("2024-01-02"), json!(185.64), json!(82488700.0), json!("oops")],
            vec![json!("AAPL"), Value::Null, json!(186.0), json!(1), json!(1)],
        ];

        let parsed: Vec<DailyPriceRecord> = parse_rows(&cols, &rows);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].volume, Some(82488700));
        assert_eq!(parsed[0].market_cap, None);
        assert_eq!(parsed[0].close, Some(BigDecimal::from_str("185.64").unwrap()));
    }

    #[test]
    fn test_index_membership_rows() {
        let cols = columns(&["date", "action", "ticker", "name", "contraticker", "contraname"]);
        let rows = vec![
            vec![json!("2024-06-24"), json!("added"), json!("DELL"), json!("Dell"), json!("RHI"), json!("Robert Half")],
            vec![json!("2024-06-24"), json!("current"), json!("AAPL"), json!("Apple"), Value::Null, Value::Null],
            vec![json!("2024-06-24"), json!("renamed"), json!("XYZ"), Value::Null, Value::Null, Value::Null],
        ];

        let parsed: Vec<IndexMembershipRecord> = parse_rows(&cols, &rows);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].action, IndexAction::Added);
        assert_eq!(parsed[0].contra_ticker.as_deref(), Some("RHI"));
        assert_eq!(parsed[1].action, IndexAction::Current);
    }

    #[test]
    fn test_output_never_exceeds_input() {
        let cols = columns(&["ticker", "date"]);
        let rows: Vec<Vec<Value>> = (0..50)
            .map(|i| {
                if i % 3 == 0 {
                    vec![Value::Null, json!("2024-01-02")]
                } else {
                    vec![json!(format!("T{i}")), json!("2024-01-02")]
                }
            })
            .collect();

        let parsed: Vec<BenchmarkPriceRecord> = parse_rows(&cols, &rows);
        assert!(parsed.len() <= rows.len());
        assert_eq!(parsed.len(), 33);
    }
}
