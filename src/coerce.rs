//! Per-value coercion applied by destination column type right before binding.

use anyhow::{Result, bail};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};

use crate::table::Column;

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"];

const DATE_OUTPUT: &str = "%Y-%m-%d";
const TIMESTAMP_OUTPUT: &str = "%Y-%m-%d %H:%M:%S%.f";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DateKind {
    Date,
    Timestamp,
    TimestampTz,
}

impl DateKind {
    /// Classifies a `format_type` rendering; `None` for every non-date type.
    pub fn of(data_type: &str) -> Option<Self> {
        let data_type = data_type.trim().to_ascii_lowercase();
        if data_type == "date" {
            Some(DateKind::Date)
        } else if data_type.starts_with("timestamp") {
            if data_type.ends_with(" with time zone") {
                Some(DateKind::TimestampTz)
            } else {
                Some(DateKind::Timestamp)
            }
        } else {
            None
        }
    }
}

/// Value coercion settings shared by every column of a pass.
#[derive(Clone, Copy, Debug)]
pub struct Coercion {
    /// Bind `""` instead of NULL for non-date columns. Kept on by default for
    /// compatibility with existing deployments; it ignores nullability. On
    /// PostgreSQL a NULL headed for a numeric, boolean or other non-text column
    /// therefore fails its cast and aborts the pass with a `Write` error
    /// instead of arriving as an empty value.
    pub null_as_empty_string: bool,
}

impl Default for Coercion {
    fn default() -> Self {
        Coercion {
            null_as_empty_string: true,
        }
    }
}

impl Coercion {
    pub fn apply(&self, column: &Column, value: Option<&str>) -> Result<Option<String>> {
        match (DateKind::of(&column.data_type), value) {
            (Some(_), None) => Ok(None),
            (Some(kind), Some(raw)) => reformat_date(kind, raw).map(Some),
            (None, None) if self.null_as_empty_string => Ok(Some(String::new())),
            (None, value) => Ok(value.map(str::to_string)),
        }
    }
}

enum Parsed {
    Zoned(DateTime<FixedOffset>),
    Naive(NaiveDateTime),
    Day(NaiveDate),
}

fn parse_temporal(raw: &str) -> Option<Parsed> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(Parsed::Zoned(dt));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(Parsed::Zoned(dt));
    }
    if let Some(dt) = NAIVE_DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
    {
        return Some(Parsed::Naive(dt));
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .map(Parsed::Day)
}

/// Rewrites a textual date or timestamp into PostgreSQL's canonical input form.
pub fn reformat_date(kind: DateKind, raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed == "infinity" || trimmed == "-infinity" {
        return Ok(trimmed.to_string());
    }
    let Some(parsed) = parse_temporal(trimmed) else {
        bail!("cannot interpret {raw:?} as a {kind:?} value");
    };
    let formatted = match (kind, parsed) {
        (DateKind::Date, Parsed::Zoned(dt)) => dt.date_naive().format(DATE_OUTPUT).to_string(),
        (DateKind::Date, Parsed::Naive(dt)) => dt.date().format(DATE_OUTPUT).to_string(),
        (DateKind::Date, Parsed::Day(d)) => d.format(DATE_OUTPUT).to_string(),
        (DateKind::Timestamp, Parsed::Zoned(dt)) => {
            dt.naive_local().format(TIMESTAMP_OUTPUT).to_string()
        }
        (DateKind::TimestampTz, Parsed::Zoned(dt)) => dt.to_rfc3339(),
        (_, Parsed::Naive(dt)) => dt.format(TIMESTAMP_OUTPUT).to_string(),
        (_, Parsed::Day(d)) => d.and_time(chrono::NaiveTime::MIN).format(TIMESTAMP_OUTPUT).to_string(),
    };
    Ok(formatted)
}
