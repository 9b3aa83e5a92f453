//! Row-selection predicate for incremental reads.

use chrono::{DateTime, Days, FixedOffset, NaiveDate, NaiveDateTime, Timelike};
use tracing::warn;

use crate::config::{IncrementalType, TableConfig};
use crate::core::SqlValue;

/// Build the WHERE predicate selecting source rows newer than `watermark`.
///
/// - `identity`: `column > 42`
/// - `date`/`datetime` with a buffer of N days: `column >= '<watermark - N days>'`
/// - anything else: `column > '<watermark>'`
///
/// A text watermark that cannot be read as a date loses its buffer and falls
/// back to the strict comparison.
pub fn incremental_predicate(table: &TableConfig, column: &str, watermark: &SqlValue) -> String {
    match table.incremental_type {
        Some(IncrementalType::Identity) => match watermark {
            SqlValue::I16(_)
            | SqlValue::I32(_)
            | SqlValue::I64(_)
            | SqlValue::Decimal(_)
            | SqlValue::F32(_)
            | SqlValue::F64(_) => format!("{} > {}", column, watermark),
            other => strict(column, other),
        },
        Some(IncrementalType::Date | IncrementalType::Datetime) if table.date_buffer_days > 0 => {
            match buffered_literal(watermark, table.date_buffer_days) {
                Some(literal) => format!("{} >= '{}'", column, literal),
                None => {
                    warn!(
                        "Cannot apply {}-day buffer to watermark '{}' on {}.{}; using strict comparison",
                        table.date_buffer_days, watermark, table.name, column
                    );
                    strict(column, watermark)
                }
            }
        }
        _ => strict(column, watermark),
    }
}

fn strict(column: &str, watermark: &SqlValue) -> String {
    format!("{} > '{}'", column, quote_literal(&watermark.to_string()))
}

/// Escape single quotes for a T-SQL string literal.
fn quote_literal(text: &str) -> String {
    text.replace('\'', "''")
}

/// Watermark moved back by `days`, rendered as a literal.
fn buffered_literal(watermark: &SqlValue, days: u32) -> Option<String> {
    let days = Days::new(u64::from(days));
    match watermark {
        SqlValue::Date(d) => d.checked_sub_days(days).map(format_date),
        SqlValue::DateTime(dt) => dt.checked_sub_days(days).map(format_datetime),
        SqlValue::DateTimeOffset(dto) => dto.checked_sub_days(days).map(format_datetime_offset),
        SqlValue::String(s) => {
            let s = s.trim();
            if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                d.checked_sub_days(days).map(format_date)
            } else {
                parse_datetime(s)?.checked_sub_days(days).map(format_datetime)
            }
        }
        _ => None,
    }
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

fn format_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

// SQL Server DATETIME only takes milliseconds in a literal.
fn format_datetime(dt: NaiveDateTime) -> String {
    if dt.nanosecond() == 0 {
        dt.format("%Y-%m-%d %H:%M:%S").to_string()
    } else {
        dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
    }
}

fn format_datetime_offset(dto: DateTime<FixedOffset>) -> String {
    format!("{} {}", format_datetime(dto.naive_local()), dto.format("%:z"))
}
