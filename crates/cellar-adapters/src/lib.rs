//! Sheet adapter: turns an exported CSV sheet into inventory records.

use cellar_core::{InventoryRecord, MappingError, RecordDraft, RecordField, SourceColumnMapping};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "cellar-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("sheet header row has no `{header}` column")]
    MissingRequiredColumn { header: String },
    #[error("reading sheet header row: {0}")]
    Header(#[source] csv::Error),
    #[error(transparent)]
    Mapping(#[from] MappingError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformOutput {
    pub records: Vec<InventoryRecord>,
    /// Rows without a usable name plus rows the CSV reader could not decode.
    pub dropped_rows: usize,
    /// Mapped headers that the sheet does not contain.
    pub missing_headers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SheetAdapter {
    mapping: SourceColumnMapping,
}

impl SheetAdapter {
    pub fn new(mapping: SourceColumnMapping) -> Result<Self, AdapterError> {
        mapping.validate()?;
        Ok(Self { mapping })
    }

    pub fn mapping(&self) -> &SourceColumnMapping {
        &self.mapping
    }

    /// Reads the first row as the header and maps every later row to a record.
    ///
    /// Rows whose name is blank are dropped and counted. A sheet without the
    /// mapped name column is rejected as a whole.
    pub fn transform(&self, csv_text: &str) -> Result<TransformOutput, AdapterError> {
        let csv_text = csv_text.strip_prefix('\u{feff}').unwrap_or(csv_text);
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(csv_text.as_bytes());
        let headers = reader.headers().map_err(AdapterError::Header)?.clone();

        let mut positions = Vec::with_capacity(self.mapping.columns.len());
        let mut missing_headers = Vec::new();
        for column in &self.mapping.columns {
            match headers.iter().position(|h| h.trim() == column.header.trim()) {
                Some(index) => positions.push((column.field, index)),
                None if column.field == RecordField::Name => {
                    return Err(AdapterError::MissingRequiredColumn {
                        header: column.header.clone(),
                    });
                }
                None => {
                    warn!(header = %column.header, "mapped column missing from sheet; field left absent");
                    missing_headers.push(column.header.clone());
                }
            }
        }

        let mut records = Vec::new();
        let mut dropped_rows = 0usize;
        for (line, row) in reader.records().enumerate() {
            let row = match row {
                Ok(row) => row,
                Err(err) => {
                    warn!(row = line + 2, error = %err, "skipping unreadable sheet row");
                    dropped_rows += 1;
                    continue;
                }
            };

            let mut draft = RecordDraft::default();
            for (field, index) in &positions {
                draft.apply(*field, row.get(*index).unwrap_or_default());
            }
            match draft.finish() {
                Some(record) => records.push(record),
                None => dropped_rows += 1,
            }
        }

        debug!(records = records.len(), dropped_rows, "transformed sheet");
        Ok(TransformOutput {
            records,
            dropped_rows,
            missing_headers,
        })
    }
}
