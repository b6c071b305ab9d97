use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use showads_common::processor::{ErrorSink, RejectedRow};

use crate::error::SourceError;

pub const ERROR_ROWS_HEADER: [&str; 5] = ["name", "age", "banner_id", "cookie", "error"];

/// Writes rejected rows as CSV, header first, in the order they are rejected.
pub struct CsvErrorSink<W: Write> {
    writer: csv::Writer<W>,
}

impl CsvErrorSink<File> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let file = File::create(path.as_ref())?;
        Ok(Self::from_writer(file)?)
    }
}

impl<W: Write> CsvErrorSink<W> {
    pub fn from_writer(writer: W) -> csv::Result<Self> {
        let mut writer = csv::Writer::from_writer(writer);
        writer.write_record(ERROR_ROWS_HEADER)?;
        Ok(Self { writer })
    }
}

impl<W: Write> ErrorSink for CsvErrorSink<W> {
    fn write_rejected(&mut self, rejected: &RejectedRow) -> io::Result<()> {
        self.writer.write_record([
            rejected.name.as_str(),
            rejected.age.as_str(),
            rejected.banner_id.as_str(),
            rejected.cookie.as_str(),
            rejected.reason.as_str(),
        ])?;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
