//! Core inventory model, cell parsers and column mappings for cellar.

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub mod mapping;
pub mod parse;

pub use mapping::{ExportColumn, ExportMapping, MappingError, SourceColumn, SourceColumnMapping, ValueKind};
pub use parse::{
    parse_date, parse_decimal, parse_integer, parse_numeric, parse_text, DateLayout, DATE_LAYOUTS,
    MAX_DECIMAL_EXPONENT, MAX_DECIMAL_FRACTION, PLACEHOLDER_TOKEN,
};

pub const CRATE_NAME: &str = "cellar-core";

/// Every attribute of an inventory record that a mapping can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordField {
    Name,
    Count,
    CountryOfOrigin,
    CategoryStyle,
    Region,
    Distillery,
    Age,
    PurchasedApprox,
    Abv,
    Volume,
    PriceCost,
    ReplacementCost,
    OpenedClosed,
    Errata,
}

/// Which cell parser (and which column type) a field uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Decimal,
    Date,
}

impl RecordField {
    pub const ALL: [RecordField; 14] = [
        RecordField::Name,
        RecordField::Count,
        RecordField::CountryOfOrigin,
        RecordField::CategoryStyle,
        RecordField::Region,
        RecordField::Distillery,
        RecordField::Age,
        RecordField::PurchasedApprox,
        RecordField::Abv,
        RecordField::Volume,
        RecordField::PriceCost,
        RecordField::ReplacementCost,
        RecordField::OpenedClosed,
        RecordField::Errata,
    ];

    pub fn kind(self) -> FieldKind {
        match self {
            RecordField::Count => FieldKind::Integer,
            RecordField::PurchasedApprox => FieldKind::Date,
            RecordField::Abv | RecordField::PriceCost | RecordField::ReplacementCost => {
                FieldKind::Decimal
            }
            _ => FieldKind::Text,
        }
    }

    /// `(precision, scale)` of the `NUMERIC` column behind a decimal field.
    pub fn numeric_bounds(self) -> Option<(u32, u32)> {
        match self {
            RecordField::Abv => Some((6, 2)),
            RecordField::PriceCost | RecordField::ReplacementCost => Some((12, 2)),
            _ => None,
        }
    }

    /// Column name in the `liquor` table.
    pub fn column(self) -> &'static str {
        match self {
            RecordField::Name => "name",
            RecordField::Count => "count",
            RecordField::CountryOfOrigin => "country_of_origin",
            RecordField::CategoryStyle => "category_style",
            RecordField::Region => "region",
            RecordField::Distillery => "distillery",
            RecordField::Age => "age",
            RecordField::PurchasedApprox => "purchased_approx",
            RecordField::Abv => "abv",
            RecordField::Volume => "volume",
            RecordField::PriceCost => "price_cost",
            RecordField::ReplacementCost => "replacement_cost",
            RecordField::OpenedClosed => "opened_closed",
            RecordField::Errata => "errata",
        }
    }
}

/// Borrowed view of one field of a record, typed by its kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    Text(Option<&'a str>),
    Integer(Option<i32>),
    Decimal(Option<&'a BigDecimal>),
    Date(Option<NaiveDate>),
}

impl FieldValue<'_> {
    pub fn is_absent(&self) -> bool {
        match self {
            FieldValue::Text(v) => v.is_none(),
            FieldValue::Integer(v) => v.is_none(),
            FieldValue::Decimal(v) => v.is_none(),
            FieldValue::Date(v) => v.is_none(),
        }
    }
}

/// One inventory row. Only `name` is required; every other attribute is
/// `None` when the sheet had no usable value for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub name: String,
    pub count: Option<i32>,
    pub country_of_origin: Option<String>,
    pub category_style: Option<String>,
    pub region: Option<String>,
    pub distillery: Option<String>,
    pub age: Option<String>,
    pub purchased_approx: Option<NaiveDate>,
    pub abv: Option<BigDecimal>,
    pub volume: Option<String>,
    pub price_cost: Option<BigDecimal>,
    pub replacement_cost: Option<BigDecimal>,
    pub opened_closed: Option<String>,
    pub errata: Option<String>,
}

impl InventoryRecord {
    /// A record carrying only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            count: None,
            country_of_origin: None,
            category_style: None,
            region: None,
            distillery: None,
            age: None,
            purchased_approx: None,
            abv: None,
            volume: None,
            price_cost: None,
            replacement_cost: None,
            opened_closed: None,
            errata: None,
        }
    }

    pub fn value(&self, field: RecordField) -> FieldValue<'_> {
        match field {
            RecordField::Name => FieldValue::Text(Some(self.name.as_str())),
            RecordField::Count => FieldValue::Integer(self.count),
            RecordField::CountryOfOrigin => FieldValue::Text(self.country_of_origin.as_deref()),
            RecordField::CategoryStyle => FieldValue::Text(self.category_style.as_deref()),
            RecordField::Region => FieldValue::Text(self.region.as_deref()),
            RecordField::Distillery => FieldValue::Text(self.distillery.as_deref()),
            RecordField::Age => FieldValue::Text(self.age.as_deref()),
            RecordField::PurchasedApprox => FieldValue::Date(self.purchased_approx),
            RecordField::Abv => FieldValue::Decimal(self.abv.as_ref()),
            RecordField::Volume => FieldValue::Text(self.volume.as_deref()),
            RecordField::PriceCost => FieldValue::Decimal(self.price_cost.as_ref()),
            RecordField::ReplacementCost => FieldValue::Decimal(self.replacement_cost.as_ref()),
            RecordField::OpenedClosed => FieldValue::Text(self.opened_closed.as_deref()),
            RecordField::Errata => FieldValue::Text(self.errata.as_deref()),
        }
    }
}

/// Record under construction from raw cells, before the required name is known.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordDraft {
    pub name: Option<String>,
    pub count: Option<i32>,
    pub country_of_origin: Option<String>,
    pub category_style: Option<String>,
    pub region: Option<String>,
    pub distillery: Option<String>,
    pub age: Option<String>,
    pub purchased_approx: Option<NaiveDate>,
    pub abv: Option<BigDecimal>,
    pub volume: Option<String>,
    pub price_cost: Option<BigDecimal>,
    pub replacement_cost: Option<BigDecimal>,
    pub opened_closed: Option<String>,
    pub errata: Option<String>,
}

impl RecordDraft {
    /// Parses `raw` with the parser matching `field` and stores the result.
    /// Unusable input leaves the field absent.
    pub fn apply(&mut self, field: RecordField, raw: &str) {
        let numeric = || {
            field
                .numeric_bounds()
                .and_then(|(precision, scale)| parse_numeric(raw, precision, scale))
        };
        match field {
            RecordField::Name => self.name = parse_text(raw),
            RecordField::Count => self.count = parse_integer(raw),
            RecordField::CountryOfOrigin => self.country_of_origin = parse_text(raw),
            RecordField::CategoryStyle => self.category_style = parse_text(raw),
            RecordField::Region => self.region = parse_text(raw),
            RecordField::Distillery => self.distillery = parse_text(raw),
            RecordField::Age => self.age = parse_text(raw),
            RecordField::PurchasedApprox => self.purchased_approx = parse_date(raw),
            RecordField::Abv => self.abv = numeric(),
            RecordField::Volume => self.volume = parse_text(raw),
            RecordField::PriceCost => self.price_cost = numeric(),
            RecordField::ReplacementCost => self.replacement_cost = numeric(),
            RecordField::OpenedClosed => self.opened_closed = parse_text(raw),
            RecordField::Errata => self.errata = parse_text(raw),
        }
    }

    /// Promotes the draft to a record; `None` when the name is absent.
    pub fn finish(self) -> Option<InventoryRecord> {
        let name = self.name?;
        Some(InventoryRecord {
            name,
            count: self.count,
            country_of_origin: self.country_of_origin,
            category_style: self.category_style,
            region: self.region,
            distillery: self.distillery,
            age: self.age,
            purchased_approx: self.purchased_approx,
            abv: self.abv,
            volume: self.volume,
            price_cost: self.price_cost,
            replacement_cost: self.replacement_cost,
            opened_closed: self.opened_closed,
            errata: self.errata,
        })
    }
}

/// Persisted record with the store-assigned system fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub record: InventoryRecord,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn draft_without_name_is_dropped() {
        let mut draft = RecordDraft::default();
        draft.apply(RecordField::Name, "   ");
        draft.apply(RecordField::Count, "4");
        assert!(draft.finish().is_none());
    }

    #[test]
    fn draft_applies_matching_parser_per_field() {
        let mut draft = RecordDraft::default();
        draft.apply(RecordField::Name, " Test Bourbon ");
        draft.apply(RecordField::Count, "3");
        draft.apply(RecordField::PriceCost, "$45.50");
        draft.apply(RecordField::PurchasedApprox, "3/1/2024");
        draft.apply(RecordField::Region, "-");

        let record = draft.finish().expect("named record");
        assert_eq!(record.name, "Test Bourbon");
        assert_eq!(record.count, Some(3));
        assert_eq!(record.price_cost, Some(BigDecimal::from_str("45.50").unwrap()));
        assert_eq!(record.purchased_approx, NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(record.region, None);
    }

    #[test]
    fn decimals_too_large_for_their_column_are_absent() {
        let mut draft = RecordDraft::default();
        draft.apply(RecordField::Name, "Cask Strength");
        draft.apply(RecordField::PriceCost, "$12,000,000,000");
        draft.apply(RecordField::ReplacementCost, "1e9999999999");
        draft.apply(RecordField::Abv, "12345");

        let record = draft.finish().expect("named record");
        assert_eq!(record.price_cost, None);
        assert_eq!(record.replacement_cost, None);
        assert_eq!(record.abv, None);
        assert_eq!(RecordField::Abv.numeric_bounds(), Some((6, 2)));
        assert_eq!(RecordField::Name.numeric_bounds(), None);
    }

    #[test]
    fn field_kinds_follow_column_types() {
        assert_eq!(RecordField::Count.kind(), FieldKind::Integer);
        assert_eq!(RecordField::PurchasedApprox.kind(), FieldKind::Date);
        assert_eq!(RecordField::ReplacementCost.kind(), FieldKind::Decimal);
        assert_eq!(RecordField::Errata.kind(), FieldKind::Text);
        assert_eq!(RecordField::ALL.len(), 14);
    }

    #[test]
    fn value_view_reports_absence() {
        let record = InventoryRecord::named("Rye");
        assert!(!record.value(RecordField::Name).is_absent());
        assert!(record.value(RecordField::Abv).is_absent());
        assert!(record.value(RecordField::PurchasedApprox).is_absent());
    }
}
