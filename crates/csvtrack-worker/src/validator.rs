//! Structural CSV validation.
//!
//! Only the shape of the file is checked: it must be UTF-8, parse as CSV,
//! carry a header and at least one data row, and every row must have as many
//! fields as the header.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CsvValidationError {
    #[error("CSV file is empty")]
    Empty,

    #[error("CSV file has a header but no data rows")]
    HeaderOnly,

    #[error("CSV file is not valid UTF-8 (invalid byte at offset {0})")]
    NotUtf8(usize),

    #[error("Malformed CSV at record {record}: {message}")]
    Malformed { record: u64, message: String },

    #[error("Row {row} has {found} fields, header has {expected}")]
    InconsistentColumns {
        row: u64,
        expected: usize,
        found: usize,
    },
}

/// Shape of a valid file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvSummary {
    pub columns: usize,
    /// Data rows, header excluded.
    pub rows: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct CsvValidator {
    delimiter: u8,
}

impl Default for CsvValidator {
    fn default() -> Self {
        Self { delimiter: b',' }
    }
}

impl CsvValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn validate(&self, content: &[u8]) -> Result<CsvSummary, CsvValidationError> {
        let text = std::str::from_utf8(content)
            .map_err(|e| CsvValidationError::NotUtf8(e.valid_up_to()))?;
        if text.trim().is_empty() {
            return Err(CsvValidationError::Empty);
        }

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(text.as_bytes());

        let columns = reader
            .headers()
            .map_err(|e| CsvValidationError::Malformed {
                record: 0,
                message: e.to_string(),
            })?
            .len();

        let mut rows = 0u64;
        for result in reader.records() {
            let row = rows + 1;
            let record = result.map_err(|e| CsvValidationError::Malformed {
                record: row,
                message: e.to_string(),
            })?;
            if record.len() != columns {
                return Err(CsvValidationError::InconsistentColumns {
                    row,
                    expected: columns,
                    found: record.len(),
                });
            }
            rows = row;
        }

        if rows == 0 {
            return Err(CsvValidationError::HeaderOnly);
        }

        Ok(CsvSummary { columns, rows })
    }
}
