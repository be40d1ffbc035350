// Fixed-precision guards for NUMERIC columns
//
// Postgres rejects a whole statement when one value overflows its NUMERIC(p, s) column.
// Values are checked here first and written as NULL instead, with a warning naming the row.

use sqlx::types::BigDecimal;
use tracing::warn;

/// Shape of a `NUMERIC(precision, scale)` column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumericColumn {
    pub precision: i64,
    pub scale: i64,
}

/// Currency amounts such as revenue or market cap
pub const CURRENCY: NumericColumn = NumericColumn::new(18, 2);
/// Ratios such as P/E or ROIC
pub const RATIO: NumericColumn = NumericColumn::new(18, 4);
/// Per-share prices and dividends
pub const PRICE: NumericColumn = NumericColumn::new(18, 6);

impl NumericColumn {
    pub const fn new(precision: i64, scale: i64) -> Self {
        Self { precision, scale }
    }

    /// Whether `value` can be stored once rounded to the column's scale
    pub fn fits(&self, value: &BigDecimal) -> bool {
        // Postgres rounds half away from zero; truncating |v| + half an ulp does the same.
        let half_ulp = BigDecimal::new(5.into(), self.scale + 1);
        let rounded = (value.abs() + half_ulp).with_scale(self.scale);
        rounded < self.limit()
    }

    /// Smallest magnitude that no longer fits: 10^(precision - scale)
    fn limit(&self) -> BigDecimal {
        BigDecimal::new(1.into(), -(self.precision - self.scale))
    }
}

/// Pass `value` through if it fits `column`, otherwise log and return `None`.
pub fn sanitize(
    value: &Option<BigDecimal>,
    column: NumericColumn,
    entity: &str,
    key: &str,
    field: &str,
) -> Option<BigDecimal> {
    let value = value.as_ref()?;
    if column.fits(value) {
        return Some(value.clone());
    }

    warn!(
        entity,
        key,
        field,
        value = %value,
        precision = column.precision,
        scale = column.scale,
        "Value overflows column; writing NULL"
    );
    None
}
