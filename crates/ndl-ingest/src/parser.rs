// Columnar row parser
//
// Datatables arrive as positional rows plus a list of column names. A `ColumnIndex` maps
// names to positions once per response; `RowView::get::<T>` then pulls a single field by
// name. Every accessor is lenient: a missing column, short row, null or oddly shaped value
// produces `None` for that field and never fails the row.

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value;
use sqlx::types::BigDecimal;
use std::collections::HashMap;
use std::str::FromStr;

use crate::client::{Column, RawRow};

/// Timestamp layouts accepted for date columns, tried in order
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.fZ", "%Y-%m-%d %H:%M:%S"];

/// Column name -> position, built once per response
#[derive(Debug, Clone, Default)]
pub struct ColumnIndex {
    positions: HashMap<String, usize>,
}

impl ColumnIndex {
    pub fn new(columns: &[Column]) -> Self {
        let positions = columns
            .iter()
            .enumerate()
            .map(|(i, column)| (column.name.clone(), i))
            .collect();
        Self { positions }
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// One row seen through its response's column index
#[derive(Debug, Clone, Copy)]
pub struct RowView<'a> {
    index: &'a ColumnIndex,
    values: &'a [Value],
}

impl<'a> RowView<'a> {
    pub fn new(index: &'a ColumnIndex, values: &'a [Value]) -> Self {
        Self { index, values }
    }

    /// Raw value of `name`, with JSON null treated as absent
    pub fn value(&self, name: &str) -> Option<&'a Value> {
        let position = self.index.position(name)?;
        self.values.get(position).filter(|v| !v.is_null())
    }

    /// Typed value of `name`
    pub fn get<T: FromCell>(&self, name: &str) -> Option<T> {
        self.value(name).and_then(T::from_cell)
    }

    /// First column among `names` holding a usable value
    pub fn get_any<T: FromCell>(&self, names: &[&str]) -> Option<T> {
        names.iter().find_map(|name| self.get(name))
    }
}

/// Conversion from a single JSON cell
pub trait FromCell: Sized {
    fn from_cell(value: &Value) -> Option<Self>;
}

impl FromCell for String {
    fn from_cell(value: &Value) -> Option<Self> {
        let text = match value {
            Value::Null => return None,
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => serde_json::to_string(other).ok()?,
        };
        (!text.is_empty()).then_some(text)
    }
}

impl FromCell for bool {
    fn from_cell(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_f64().map(|f| f != 0.0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" | "true" | "1" => Some(true),
                "n" | "no" | "false" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl FromCell for BigDecimal {
    fn from_cell(value: &Value) -> Option<Self> {
        match value {
            // Parse the textual form so no binary float rounding creeps in.
            Value::Number(n) => BigDecimal::from_str(&n.to_string()).ok(),
            Value::String(s) => {
                let s = s.trim();
                if s.is_empty() {
                    None
                } else {
                    BigDecimal::from_str(s).ok()
                }
            },
            _ => None,
        }
    }
}

impl FromCell for i64 {
    fn from_cell(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>().ok().or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .map(|f| f.trunc() as i64)
                })
            },
            _ => None,
        }
    }
}

impl FromCell for NaiveDate {
    fn from_cell(value: &Value) -> Option<Self> {
        let s = value.as_str()?.trim();
        if s.is_empty() {
            return None;
        }
        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Some(date);
        }
        DATETIME_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
            .map(|dt| dt.date())
    }
}

/// A record shape that can be read from one datatable row
pub trait DatatableRecord: Sized {
    /// Datatable the record is read from, e.g. `SHARADAR/SF1`
    const TABLE: &'static str;

    /// Build a record, or `None` when the row lacks the fields that identify it
    fn from_row(row: &RowView<'_>) -> Option<Self>;
}

/// Parse every acceptable row; rows missing their identity are skipped.
pub fn parse_rows<T: DatatableRecord>(columns: &[Column], rows: &[RawRow]) -> Vec<T> {
    let index = ColumnIndex::new(columns);
    rows.iter()
        .filter_map(|values| T::from_row(&RowView::new(&index, values)))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn columns(names: &[&str]) -> Vec<Column> {
        names
            .iter()
            .map(|name| Column {
                name: name.to_string(),
                kind: String::new(),
            })
            .collect()
    }

    #[test]
    fn test_missing_column_and_short_row_are_none() {
        let index = ColumnIndex::new(&columns(&["ticker", "close"]));
        let values = vec![json!("AAPL")];
        let row = RowView::new(&index, &values);

        assert_eq!(row.get::<String>("ticker").as_deref(), Some("AAPL"));
        assert_eq!(row.get::<BigDecimal>("close"), None);
        assert_eq!(row.get::<BigDecimal>("open"), None);
    }

    #[test]
    fn test_string_cells() {
        assert_eq!(String::from_cell(&json!("")), None);
        assert_eq!(String::from_cell(&json!(12.5)).as_deref(), Some("12.5"));
        assert_eq!(String::from_cell(&json!(true)).as_deref(), Some("true"));
        assert_eq!(String::from_cell(&json!(["a"])).as_deref(), Some("[\"a\"]"));
        assert_eq!(String::from_cell(&Value::Null), None);
    }

    #[test]
    fn test_bool_cells() {
        for truthy in [json!("Y"), json!("yes"), json!("TRUE"), json!("1"), json!(2)] {
            assert_eq!(bool::from_cell(&truthy), Some(true), "{truthy}");
        }
        for falsy in [json!("N"), json!("no"), json!("false"), json!("0"), json!(0)] {
            assert_eq!(bool::from_cell(&falsy), Some(false), "{falsy}");
        }
        assert_eq!(bool::from_cell(&json!("maybe")), None);
    }

    #[test]
    fn test_decimal_cells_keep_textual_precision() {
        let d = BigDecimal::from_cell(&json!(0.1)).unwrap();
        assert_eq!(d, BigDecimal::from_str("0.1").unwrap());

        let d = BigDecimal::from_cell(&json!("123456789012.345678")).unwrap();
        assert_eq!(d.to_string(), "123456789012.345678");

        assert_eq!(BigDecimal::from_cell(&json!("n/a")), None);
        assert_eq!(BigDecimal::from_cell(&json!({})), None);
    }

    #[test]
    fn test_integer_cells_truncate_floats() {
        assert_eq!(i64::from_cell(&json!(1234)), Some(1234));
        assert_eq!(i64::from_cell(&json!(1234.9)), Some(1234));
        assert_eq!(i64::from_cell(&json!("-7.8")), Some(-7));
        assert_eq!(i64::from_cell(&json!("x")), None);
    }

    #[test]
    fn test_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert_eq!(NaiveDate::from_cell(&json!("2024-01-02")), Some(expected));
        assert_eq!(
            NaiveDate::from_cell(&json!("2024-01-02T00:00:00.000Z")),
            Some(expected)
        );
        assert_eq!(
            NaiveDate::from_cell(&json!("2024-01-02 15:30:00")),
            Some(expected)
        );
        assert_eq!(NaiveDate::from_cell(&json!("01/02/2024")), None);
        assert_eq!(NaiveDate::from_cell(&json!(20240102)), None);
    }

    #[test]
    fn test_get_any_prefers_first_present() {
        let index = ColumnIndex::new(&columns(&["conticker", "contraticker"]));
        let values = vec![json!("OLD"), Value::Null];
        let row = RowView::new(&index, &values);
        assert_eq!(
            row.get_any::<String>(&["contraticker", "conticker"]).as_deref(),
            Some("OLD")
        );
    }
}
