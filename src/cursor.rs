//! Resume cursor: a date boundary plus an offset within that date.
//!
//! The cursor renders as `YYYYMMDD:skip` and reads as "the `skip`-th record,
//! in ascending date order, among records dated on or after `date`". Cursors
//! order by `(date, skip)`, so advancing past a non-empty page always yields a
//! strictly greater cursor.
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::model::RecordKind;

const OPENFDA_DATE_FORMAT: &str = "%Y%m%d";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid cursor '{input}': {reason}")]
pub struct CursorParseError {
    pub input: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cursor {
    date: NaiveDate,
    skip: u64,
}

impl Cursor {
    pub fn new(date: NaiveDate, skip: u64) -> Self {
        Self { date, skip }
    }

    /// Beginning of data when no start date is configured.
    pub fn earliest() -> Self {
        Self::new(NaiveDate::from_ymd_opt(1900, 1, 1).unwrap_or(NaiveDate::MIN), 0)
    }

    pub fn start(start_date: Option<NaiveDate>) -> Self {
        match start_date {
            Some(date) => Self::new(date, 0),
            None => Self::earliest(),
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn skip(&self) -> u64 {
        self.skip
    }

    /// Date rendered the way openFDA range queries expect it.
    pub fn api_date(&self) -> String {
        self.date.format(OPENFDA_DATE_FORMAT).to_string()
    }

    /// Cursor positioned just past `records`, which were fetched with `self`.
    pub fn advance(&self, kind: RecordKind, records: &[Value]) -> Cursor {
        let field = kind.date_field();
        let dates: Vec<Option<NaiveDate>> = records
            .iter()
            .map(|r| r.get(field).and_then(Value::as_str).and_then(parse_openfda_date))
            .collect();

        match dates.iter().flatten().max() {
            Some(&newest) if newest > self.date => {
                let same_day = dates.iter().filter(|d| **d == Some(newest)).count() as u64;
                Cursor::new(newest, same_day)
            }
            _ => Cursor::new(self.date, self.skip + records.len() as u64),
        }
    }
}

/// Parse an openFDA `YYYYMMDD` date. Anything else is `None`.
pub fn parse_openfda_date(s: &str) -> Option<NaiveDate> {
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(s, OPENFDA_DATE_FORMAT).ok()
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.api_date(), self.skip)
    }
}

impl FromStr for Cursor {
    type Err = CursorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| CursorParseError {
            input: s.to_string(),
            reason,
        };
        let (date, skip) = s.split_once(':').ok_or_else(|| err("missing ':' separator"))?;
        let date = parse_openfda_date(date).ok_or_else(|| err("date must be YYYYMMDD"))?;
        let skip = skip
            .parse::<u64>()
            .map_err(|_| err("offset must be a non-negative integer"))?;
        Ok(Cursor::new(date, skip))
    }
}

impl TryFrom<String> for Cursor {
    type Error = CursorParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cursor> for String {
    fn from(cursor: Cursor) -> Self {
        cursor.to_string()
    }
}
