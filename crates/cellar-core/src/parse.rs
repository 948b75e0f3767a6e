//! Cell parsers. Each takes one raw spreadsheet cell and returns a typed
//! value or `None`; none of them fail.

use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{Datelike, NaiveDate};

/// A cell holding only this token means "no value".
pub const PLACEHOLDER_TOKEN: &str = "-";

const CURRENCY_SYMBOLS: [char; 3] = ['$', '€', '£'];

/// Largest power of ten a decimal cell may carry in exponent notation.
pub const MAX_DECIMAL_EXPONENT: i64 = 18;

/// Most fractional digits a decimal cell may carry.
pub const MAX_DECIMAL_FRACTION: i64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateLayout {
    pub pattern: &'static str,
    pub four_digit_year: bool,
}

/// Tried in order; the first layout that parses wins.
pub const DATE_LAYOUTS: [DateLayout; 4] = [
    DateLayout { pattern: "%m/%d/%Y", four_digit_year: true },
    DateLayout { pattern: "%Y-%m-%d", four_digit_year: true },
    DateLayout { pattern: "%m/%d/%y", four_digit_year: false },
    DateLayout { pattern: "%d/%m/%Y", four_digit_year: true },
];

fn meaningful(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == PLACEHOLDER_TOKEN {
        None
    } else {
        Some(trimmed)
    }
}

pub fn parse_text(raw: &str) -> Option<String> {
    meaningful(raw).map(str::to_string)
}

pub fn parse_integer(raw: &str) -> Option<i32> {
    meaningful(raw)?.parse().ok()
}

/// Strips currency symbols and thousands separators before parsing.
/// Exponents outside `MAX_DECIMAL_EXPONENT` / `MAX_DECIMAL_FRACTION` are absent.
pub fn parse_decimal(raw: &str) -> Option<BigDecimal> {
    let cleaned = meaningful(raw)?
        .chars()
        .filter(|c| !CURRENCY_SYMBOLS.contains(c) && *c != ',')
        .collect::<String>();
    let value = BigDecimal::from_str(cleaned.trim()).ok()?;
    let (_, scale) = value.as_bigint_and_exponent();
    if !(-MAX_DECIMAL_EXPONENT..=MAX_DECIMAL_FRACTION).contains(&scale) {
        return None;
    }
    // "1e3" parses with a negative scale; keep plain notation downstream.
    Some(if scale < 0 { value.with_scale(0) } else { value })
}

/// `parse_decimal` restricted to what a `NUMERIC(precision, scale)` column
/// holds once rounded to `scale` digits.
pub fn parse_numeric(raw: &str, precision: u32, scale: u32) -> Option<BigDecimal> {
    let value = parse_decimal(raw)?;
    let limit = BigDecimal::from(10u64.checked_pow(precision.checked_sub(scale)?)?);
    (value.round(i64::from(scale)).abs() < limit).then_some(value)
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let text = meaningful(raw)?;
    DATE_LAYOUTS.iter().find_map(|layout| {
        NaiveDate::parse_from_str(text, layout.pattern)
            .ok()
            .filter(|date| !layout.four_digit_year || date.year() >= 1000)
    })
}
