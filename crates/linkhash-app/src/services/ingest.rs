//! Batch payload parsing.
//!
//! A batch is CSV text, one record per row. Field counts may vary between
//! rows; schema conformance is checked per record by the worker.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("batch is not valid UTF-8 (byte offset {offset})")]
    NotUtf8 { offset: usize },
    #[error("failed to parse CSV batch: {0}")]
    CsvParse(#[from] csv::Error),
}

/// Parse a CSV batch into per-record field lists, skipping the header row
/// when `has_header` is set.
pub fn parse_csv_batch(payload: &[u8], has_header: bool) -> Result<Vec<Vec<String>>, IngestError> {
    if let Err(err) = std::str::from_utf8(payload) {
        return Err(IngestError::NotUtf8 {
            offset: err.valid_up_to(),
        });
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(has_header)
        .flexible(true)
        .from_reader(payload);

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(rows)
}
