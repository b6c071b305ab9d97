use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use showads_common::error::ConfigError;
use showads_common::processor::{duplicate_headers, RowSource};
use showads_common::record::RawRow;
use tracing::debug;

use crate::error::SourceError;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Delimiters recognised by `sniff_delimiter`, in tie-break order.
const DELIMITER_CANDIDATES: [u8; 4] = [b',', b';', b'\t', b'|'];

type BoxedReader = Box<dyn Read + Send>;

/// Pick the candidate occurring most often in the header line, falling back to `,`.
pub fn sniff_delimiter(header_line: &[u8]) -> u8 {
    let mut best = (b',', 0usize);
    for candidate in DELIMITER_CANDIDATES {
        let count = header_line.iter().filter(|&&b| b == candidate).count();
        if count > best.1 {
            best = (candidate, count);
        }
    }
    best.0
}

/// A `RowSource` reading a delimited text file.
///
/// The byte order mark is stripped and the delimiter sniffed from the header line. Header names
/// and values are trimmed, fully blank rows are skipped and short rows are padded with empty
/// values. A record the CSV parser cannot read is yielded as an error, not raised.
pub struct CsvRowSource {
    headers: Vec<String>,
    records: csv::StringRecordsIntoIter<BoxedReader>,
}

impl CsvRowSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let file = File::open(path.as_ref())?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read + Send + 'static>(reader: R) -> Result<Self, SourceError> {
        let mut reader = BufReader::new(reader);

        let mut header_line = Vec::new();
        reader.read_until(b'\n', &mut header_line)?;
        if header_line.starts_with(UTF8_BOM) {
            header_line.drain(..UTF8_BOM.len());
        }

        let delimiter = sniff_delimiter(&header_line);
        debug!(delimiter = %char::from(delimiter).escape_default(), "sniffed CSV delimiter");

        let input: BoxedReader = Box::new(io::Cursor::new(header_line).chain(reader));
        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(input);

        let headers: Vec<String> = csv_reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_owned())
            .collect();

        let duplicates = duplicate_headers(&headers);
        if !duplicates.is_empty() {
            return Err(ConfigError::DuplicateHeaders(duplicates).into());
        }

        Ok(Self {
            headers,
            records: csv_reader.into_records(),
        })
    }
}

impl RowSource for CsvRowSource {
    type Error = csv::Error;

    fn headers(&self) -> &[String] {
        &self.headers
    }

    fn next_row(&mut self) -> Option<Result<RawRow, csv::Error>> {
        loop {
            let record = match self.records.next()? {
                Ok(record) => record,
                Err(e) => return Some(Err(e)),
            };

            let values: Vec<&str> = record.iter().collect();
            let row = RawRow::from_pairs(&self.headers, &values);
            if row.is_blank() {
                continue;
            }
            return Some(Ok(row));
        }
    }
}
