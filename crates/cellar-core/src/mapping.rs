//! Column mappings: sheet header -> record field, and record field ->
//! generated artifact key.

use std::collections::HashSet;

use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{FieldKind, RecordField};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("source mapping has no column for the required `name` field")]
    MissingNameColumn,
    #[error("source header `{0}` is mapped more than once")]
    DuplicateHeader(String),
    #[error("export key `{0}` is used more than once")]
    DuplicateKey(String),
    #[error("export key `{0}` is not a valid identifier")]
    InvalidKey(String),
    #[error("export key `{key}` falls back to a field of a different kind")]
    FallbackKindMismatch { key: String },
    #[error("date format `{0}` is not a valid strftime pattern")]
    InvalidDateFormat(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceColumn {
    pub header: String,
    pub field: RecordField,
}

/// Maps sheet headers onto record fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceColumnMapping {
    pub columns: Vec<SourceColumn>,
}

impl Default for SourceColumnMapping {
    fn default() -> Self {
        let columns = [
            ("name", RecordField::Name),
            ("count", RecordField::Count),
            ("Country of Origin", RecordField::CountryOfOrigin),
            ("category/style", RecordField::CategoryStyle),
            ("region", RecordField::Region),
            ("distillery", RecordField::Distillery),
            ("age", RecordField::Age),
            ("purchased approx", RecordField::PurchasedApprox),
            ("ABV", RecordField::Abv),
            ("volume", RecordField::Volume),
            ("price (cost)", RecordField::PriceCost),
            ("Opened/Closed", RecordField::OpenedClosed),
            ("errata", RecordField::Errata),
            ("Replacement Cost", RecordField::ReplacementCost),
        ]
        .into_iter()
        .map(|(header, field)| SourceColumn {
            header: header.to_string(),
            field,
        })
        .collect();
        Self { columns }
    }
}

impl SourceColumnMapping {
    pub fn validate(&self) -> Result<(), MappingError> {
        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.header.as_str()) {
                return Err(MappingError::DuplicateHeader(column.header.clone()));
            }
        }
        if !self.columns.iter().any(|c| c.field == RecordField::Name) {
            return Err(MappingError::MissingNameColumn);
        }
        Ok(())
    }

    pub fn header_for(&self, field: RecordField) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.field == field)
            .map(|c| c.header.as_str())
    }
}

/// Primitive type of an artifact field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    String,
    Number,
}

impl ValueKind {
    pub fn type_name(self) -> &'static str {
        match self {
            ValueKind::String => "string",
            ValueKind::Number => "number",
        }
    }

    /// Literal emitted for an absent value.
    pub fn empty_literal(self) -> &'static str {
        match self {
            ValueKind::String => "\"\"",
            ValueKind::Number => "0",
        }
    }
}

impl From<FieldKind> for ValueKind {
    fn from(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Text | FieldKind::Date => ValueKind::String,
            FieldKind::Integer | FieldKind::Decimal => ValueKind::Number,
        }
    }
}

/// One key of each exported object.
///
/// `field: None` emits the empty value of a string key. `fallback` fields are
/// consulted in order while the primary field is absent. `optional` keys are
/// left out of an object entirely when no value resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportColumn {
    pub key: String,
    #[serde(default)]
    pub field: Option<RecordField>,
    #[serde(default)]
    pub fallback: Vec<RecordField>,
    #[serde(default)]
    pub optional: bool,
}

impl ExportColumn {
    pub fn new(key: &str, field: RecordField) -> Self {
        Self {
            key: key.to_string(),
            field: Some(field),
            fallback: Vec::new(),
            optional: false,
        }
    }

    pub fn kind(&self) -> ValueKind {
        self.field
            .map(|f| ValueKind::from(f.kind()))
            .unwrap_or(ValueKind::String)
    }
}

/// Shape of the generated artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportMapping {
    pub type_name: String,
    pub export_name: String,
    pub date_format: String,
    pub columns: Vec<ExportColumn>,
}

impl Default for ExportMapping {
    fn default() -> Self {
        let mut columns = vec![
            ExportColumn::new("name", RecordField::Name),
            ExportColumn::new("quantity", RecordField::Count),
            ExportColumn::new("country", RecordField::CountryOfOrigin),
            ExportColumn::new("type", RecordField::CategoryStyle),
            ExportColumn::new("region", RecordField::Region),
            ExportColumn::new("distillery", RecordField::Distillery),
            ExportColumn::new("age", RecordField::Age),
            ExportColumn::new("purchaseDate", RecordField::PurchasedApprox),
            ExportColumn::new("abv", RecordField::Abv),
            ExportColumn::new("size", RecordField::Volume),
            ExportColumn::new("purchasePrice", RecordField::PriceCost),
            ExportColumn::new("status", RecordField::OpenedClosed),
            ExportColumn::new("batch", RecordField::Errata),
            ExportColumn {
                key: "notes".to_string(),
                field: None,
                fallback: Vec::new(),
                optional: false,
            },
        ];
        let mut current_value = ExportColumn::new("currentValue", RecordField::ReplacementCost);
        current_value.fallback.push(RecordField::PriceCost);
        columns.push(current_value);
        let mut replacement = ExportColumn::new("replacementCost", RecordField::ReplacementCost);
        replacement.optional = true;
        columns.push(replacement);

        Self {
            type_name: "WhiskeyBottle".to_string(),
            export_name: "whiskeyCollection".to_string(),
            date_format: "%-m/%-d/%Y".to_string(),
            columns,
        }
    }
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

impl ExportMapping {
    pub fn validate(&self) -> Result<(), MappingError> {
        for name in [&self.type_name, &self.export_name] {
            if !is_identifier(name) {
                return Err(MappingError::InvalidKey(name.clone()));
            }
        }
        if StrftimeItems::new(&self.date_format).any(|item| matches!(item, Item::Error)) {
            return Err(MappingError::InvalidDateFormat(self.date_format.clone()));
        }
        let mut seen = HashSet::new();
        for column in &self.columns {
            if !is_identifier(&column.key) {
                return Err(MappingError::InvalidKey(column.key.clone()));
            }
            if !seen.insert(column.key.as_str()) {
                return Err(MappingError::DuplicateKey(column.key.clone()));
            }
            let kind = column.kind();
            if column
                .fallback
                .iter()
                .any(|f| ValueKind::from(f.kind()) != kind)
            {
                return Err(MappingError::FallbackKindMismatch {
                    key: column.key.clone(),
                });
            }
        }
        Ok(())
    }
}
