//! # Processor
//!
//! Streaming validation of raw rows into `ValidatedRecord`s.
use std::collections::HashSet;
use std::convert::Infallible;
use std::fmt;
use std::io;
use std::sync::Arc;

use tracing::{error, warn};

use crate::error::{ConfigError, ValidationError};
use crate::record::{RawRow, ValidatedRecord, REQUIRED_HEADERS};
use crate::stats::ParseStats;
use crate::validation::{validate_age, validate_banner_id, validate_cookie, validate_name};

/// An ordered, single pass supply of trimmed rows sharing one header set.
/// Implementations have already removed a byte order mark and fully blank rows.
/// A row that cannot be read is yielded as an `Err` and counted as invalid.
pub trait RowSource {
    type Error: fmt::Display;

    fn headers(&self) -> &[String];

    /// The next row, or `None` once the source is exhausted.
    fn next_row(&mut self) -> Option<Result<RawRow, Self::Error>>;
}

/// A rejected row with its original field values, in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRow {
    pub row_number: u64,
    pub name: String,
    pub age: String,
    pub banner_id: String,
    pub cookie: String,
    pub reason: String,
}

impl RejectedRow {
    fn from_raw(row_number: u64, row: &RawRow, reason: String) -> Self {
        Self {
            row_number,
            name: row.value("name").to_owned(),
            age: row.value("age").to_owned(),
            banner_id: row.value("banner_id").to_owned(),
            cookie: row.value("cookie").to_owned(),
            reason,
        }
    }

    fn unreadable(row_number: u64, reason: String) -> Self {
        Self {
            row_number,
            name: String::new(),
            age: String::new(),
            banner_id: String::new(),
            cookie: String::new(),
            reason,
        }
    }
}

/// Destination for rejected rows.
pub trait ErrorSink {
    fn write_rejected(&mut self, rejected: &RejectedRow) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A `RowSource` over rows already held in memory.
pub struct MemoryRowSource {
    headers: Vec<String>,
    rows: std::vec::IntoIter<RawRow>,
}

impl MemoryRowSource {
    /// Build a source from string rows, trimming values and dropping fully blank rows.
    pub fn new<H, V>(headers: &[H], rows: &[Vec<V>]) -> Self
    where
        H: AsRef<str>,
        V: AsRef<str>,
    {
        let headers: Vec<String> = headers.iter().map(|h| h.as_ref().trim().to_owned()).collect();
        let rows: Vec<RawRow> = rows
            .iter()
            .map(|values| RawRow::from_pairs(&headers, values))
            .filter(|row| !row.is_blank())
            .collect();

        Self {
            headers,
            rows: rows.into_iter(),
        }
    }
}

impl RowSource for MemoryRowSource {
    type Error = Infallible;

    fn headers(&self) -> &[String] {
        &self.headers
    }

    fn next_row(&mut self) -> Option<Result<RawRow, Infallible>> {
        self.rows.next().map(Ok)
    }
}

/// Header names that occur more than once, in first repeat order.
pub fn duplicate_headers(headers: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(headers.len());
    let mut duplicates: Vec<String> = Vec::new();
    for header in headers {
        if !seen.insert(header.as_str()) && !duplicates.contains(header) {
            duplicates.push(header.clone());
        }
    }
    duplicates
}

/// Check that `headers` has no duplicates and contains every required header.
pub fn check_headers(headers: &[String]) -> Result<(), ConfigError> {
    let duplicates = duplicate_headers(headers);
    if !duplicates.is_empty() {
        return Err(ConfigError::DuplicateHeaders(duplicates));
    }

    if REQUIRED_HEADERS
        .iter()
        .any(|required| !headers.iter().any(|h| h == required))
    {
        let mut required: Vec<String> = REQUIRED_HEADERS.iter().map(|h| h.to_string()).collect();
        required.sort();
        return Err(ConfigError::MissingHeaders(required));
    }

    Ok(())
}

/// Validate a single row against every field validator.
pub fn validate_row(
    row: &RawRow,
    min_age: i64,
    max_age: i64,
) -> Result<ValidatedRecord, ValidationError> {
    Ok(ValidatedRecord {
        name: validate_name(row.get("name"))?,
        age: validate_age(row.get("age"), min_age, max_age)?,
        banner_id: validate_banner_id(row.get("banner_id"))?,
        cookie: validate_cookie(row.get("cookie"))?,
    })
}

/// Lazily turns a `RowSource` into valid records, counting and reporting rejected rows.
/// Single pass: once exhausted it stays exhausted.
pub struct RecordValidator<R> {
    source: R,
    min_age: i64,
    max_age: i64,
    row_number: u64,
    stats: Arc<ParseStats>,
    error_sink: Option<Box<dyn ErrorSink + Send>>,
    exhausted: bool,
}

impl<R: RowSource> RecordValidator<R> {
    /// Fails before yielding anything when the source's headers are unusable.
    pub fn new(
        source: R,
        min_age: i64,
        max_age: i64,
        stats: Arc<ParseStats>,
    ) -> Result<Self, ConfigError> {
        check_headers(source.headers())?;

        Ok(Self {
            source,
            min_age,
            max_age,
            row_number: 0,
            stats,
            error_sink: None,
            exhausted: false,
        })
    }

    pub fn with_error_sink(mut self, sink: Box<dyn ErrorSink + Send>) -> Self {
        self.error_sink = Some(sink);
        self
    }

    pub fn stats(&self) -> &Arc<ParseStats> {
        &self.stats
    }

    fn reject(&mut self, rejected: RejectedRow, kind: &'static str) {
        self.stats.record_invalid();
        warn!(
            row_id = rejected.row_number,
            kind,
            reason = %rejected.reason,
            "invalid_row"
        );

        if let Some(sink) = self.error_sink.as_mut() {
            if let Err(e) = sink.write_rejected(&rejected) {
                error!(row_id = rejected.row_number, "failed to write rejected row: {}", e);
            }
        }
    }

    fn finish(&mut self) {
        self.exhausted = true;
        if let Some(sink) = self.error_sink.as_mut() {
            if let Err(e) = sink.flush() {
                error!("failed to flush rejected rows: {}", e);
            }
        }
    }
}

impl<R: RowSource> Iterator for RecordValidator<R> {
    type Item = ValidatedRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        loop {
            let next = match self.source.next_row() {
                Some(next) => next,
                None => {
                    self.finish();
                    return None;
                }
            };

            self.row_number += 1;
            self.stats.record_read();

            let row = match next {
                Ok(row) => row,
                Err(e) => {
                    self.reject(
                        RejectedRow::unreadable(self.row_number, e.to_string()),
                        "unreadable_row",
                    );
                    continue;
                }
            };

            match validate_row(&row, self.min_age, self.max_age) {
                Ok(record) => {
                    self.stats.record_valid();
                    return Some(record);
                }
                Err(e) => {
                    let kind = e.kind();
                    self.reject(RejectedRow::from_raw(self.row_number, &row, e.to_string()), kind);
                }
            }
        }
    }
}
