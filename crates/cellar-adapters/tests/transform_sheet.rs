use std::str::FromStr;

use bigdecimal::BigDecimal;
use cellar_adapters::{AdapterError, SheetAdapter};
use cellar_core::SourceColumnMapping;
use chrono::NaiveDate;

const HEADER: &str = "name,count,Country of Origin,category/style,region,distillery,age,purchased approx,ABV,volume,price (cost),Opened/Closed,errata,Replacement Cost";

fn adapter() -> SheetAdapter {
    SheetAdapter::new(SourceColumnMapping::default()).expect("default mapping")
}

#[test]
fn single_bourbon_row_maps_every_typed_field() {
    let csv = format!(
        "{HEADER}\nTest Bourbon,3,USA,Bourbon,Kentucky,Heaven Hill,8 yr,3/1/2024,50.5%,750ml,$45.50,Opened,-,\"$1,050.00\"\n"
    );
    let out = adapter().transform(&csv).expect("transform");

    assert_eq!(out.dropped_rows, 0);
    assert_eq!(out.records.len(), 1);
    let record = &out.records[0];
    assert_eq!(record.name, "Test Bourbon");
    assert_eq!(record.count, Some(3));
    assert_eq!(record.country_of_origin.as_deref(), Some("USA"));
    assert_eq!(record.category_style.as_deref(), Some("Bourbon"));
    assert_eq!(record.purchased_approx, NaiveDate::from_ymd_opt(2024, 3, 1));
    assert_eq!(record.price_cost, Some(BigDecimal::from_str("45.50").unwrap()));
    assert_eq!(record.replacement_cost, Some(BigDecimal::from_str("1050.00").unwrap()));
    // "50.5%" is not a plain number.
    assert_eq!(record.abv, None);
    assert_eq!(record.errata, None);
}

#[test]
fn rows_without_name_are_dropped_and_counted() {
    let csv = format!(
        "{HEADER}\nRye,1,USA,,,,,,,,,,,\n,4,Scotland,Single Malt,Islay,Lagavulin,16,1/2/2023,43,700ml,$99,Closed,gift,\n-,2,,,,,,,,,,,,\n,,,,,,,,,,,,,\n"
    );
    let out = adapter().transform(&csv).expect("transform");

    assert_eq!(out.records.len(), 1);
    assert_eq!(out.records[0].name, "Rye");
    assert_eq!(out.dropped_rows, 3);
}

#[test]
fn malformed_cells_become_absent_without_dropping_the_row() {
    let csv = format!("{HEADER}\nOdd One,a few,,,,,,last spring,strong,,cheap,,,\n");
    let out = adapter().transform(&csv).expect("transform");

    let record = &out.records[0];
    assert_eq!(record.count, None);
    assert_eq!(record.purchased_approx, None);
    assert_eq!(record.abv, None);
    assert_eq!(record.price_cost, None);
}

#[test]
fn missing_optional_columns_are_reported_not_fatal() {
    let out = adapter()
        .transform("name,count\nRye,1\nWheat,\n")
        .expect("transform");

    assert_eq!(out.records.len(), 2);
    assert_eq!(out.records[1].count, None);
    assert!(out.missing_headers.contains(&"Replacement Cost".to_string()));
    assert_eq!(out.missing_headers.len(), 12);
}

#[test]
fn short_rows_leave_trailing_fields_absent() {
    let csv = format!("{HEADER}\nRye,2\n");
    let out = adapter().transform(&csv).expect("transform");
    assert_eq!(out.records.len(), 1);
    assert_eq!(out.records[0].replacement_cost, None);
}

#[test]
fn sheet_without_name_column_is_rejected() {
    let err = adapter()
        .transform("title,count\nRye,1\n")
        .expect_err("no name column");
    assert!(matches!(err, AdapterError::MissingRequiredColumn { header } if header == "name"));
}

#[test]
fn empty_export_is_rejected() {
    assert!(matches!(
        adapter().transform(""),
        Err(AdapterError::MissingRequiredColumn { .. })
    ));
}

#[test]
fn header_only_sheet_yields_no_records() {
    let out = adapter().transform(&format!("{HEADER}\n")).expect("transform");
    assert!(out.records.is_empty());
    assert_eq!(out.dropped_rows, 0);
}
