//! Generated TypeScript artifact for the catalog application.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use cellar_core::{ExportColumn, ExportMapping, FieldValue, MappingError, StoredRecord};
use cellar_storage::write_atomic;
use serde::Serialize;
use tracing::info;

use crate::error::PipelineError;
use crate::loader::InventoryStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportReport {
    pub path: PathBuf,
    pub records: usize,
    pub content_hash: String,
    pub byte_size: usize,
}

#[derive(Debug, Clone)]
pub struct Exporter {
    mapping: ExportMapping,
    target: PathBuf,
}

fn string_literal(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

impl Exporter {
    pub fn new(mapping: ExportMapping, target: impl Into<PathBuf>) -> Result<Self, MappingError> {
        mapping.validate()?;
        Ok(Self {
            mapping,
            target: target.into(),
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn mapping(&self) -> &ExportMapping {
        &self.mapping
    }

    /// Renders `records` sorted by name then id; identical input always
    /// yields identical bytes.
    pub fn render(&self, records: &[StoredRecord]) -> String {
        let mut sorted: Vec<&StoredRecord> = records.iter().collect();
        sorted.sort_by(|a, b| a.record.name.cmp(&b.record.name).then(a.id.cmp(&b.id)));

        let m = &self.mapping;
        let mut out = String::new();
        out.push_str("// Generated by cellar-sync from the liquor table. Do not edit.\n\n");

        let _ = writeln!(out, "export interface {} {{", m.type_name);
        for column in &m.columns {
            let marker = if column.optional { "?" } else { "" };
            let _ = writeln!(out, "  {}{marker}: {};", column.key, column.kind().type_name());
        }
        out.push_str("}\n\n");

        if sorted.is_empty() {
            let _ = writeln!(out, "export const {}: {}[] = [];", m.export_name, m.type_name);
            return out;
        }

        let _ = writeln!(out, "export const {}: {}[] = [", m.export_name, m.type_name);
        for stored in sorted {
            out.push_str("  {\n");
            for column in &m.columns {
                if let Some(literal) = self.literal(column, stored) {
                    let _ = writeln!(out, "    {}: {literal},", column.key);
                }
            }
            out.push_str("  },\n");
        }
        out.push_str("];\n");
        out
    }

    /// `None` only for an optional key with nothing to show.
    fn literal(&self, column: &ExportColumn, stored: &StoredRecord) -> Option<String> {
        let resolved = column
            .field
            .into_iter()
            .chain(column.fallback.iter().copied())
            .map(|field| stored.record.value(field))
            .find(|value| !value.is_absent());

        let literal = match resolved {
            Some(FieldValue::Text(Some(text))) => string_literal(text),
            Some(FieldValue::Integer(Some(n))) => n.to_string(),
            Some(FieldValue::Decimal(Some(d))) => d.to_string(),
            Some(FieldValue::Date(Some(date))) => {
                string_literal(&date.format(&self.mapping.date_format).to_string())
            }
            _ if column.optional => return None,
            _ => column.kind().empty_literal().to_string(),
        };
        Some(literal)
    }

    /// Re-reads the committed table and atomically replaces the artifact.
    pub async fn export(&self, store: &dyn InventoryStore) -> Result<ExportReport, PipelineError> {
        let records = store.fetch_all().await.map_err(PipelineError::ExportRead)?;
        let rendered = self.render(&records);
        let written = write_atomic(&self.target, rendered.as_bytes())
            .await
            .map_err(PipelineError::ExportIo)?;

        info!(
            path = %written.path.display(),
            records = records.len(),
            bytes = written.byte_size,
            "wrote export artifact"
        );
        Ok(ExportReport {
            path: written.path,
            records: records.len(),
            content_hash: written.content_hash,
            byte_size: written.byte_size,
        })
    }
}
