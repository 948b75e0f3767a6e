//! Runs against a real Postgres only when `CELLAR_TEST_DATABASE_URL` is set.

use std::str::FromStr;

use bigdecimal::BigDecimal;
use cellar_core::InventoryRecord;
use cellar_sync::{InventoryStore, LoadError, PgInventoryStore};
use chrono::NaiveDate;
use sqlx::postgres::PgConnectOptions;

async fn store() -> Option<PgInventoryStore> {
    let url = std::env::var("CELLAR_TEST_DATABASE_URL").ok()?;
    let options = PgConnectOptions::from_str(&url).expect("test database url");
    let store = PgInventoryStore::connect_lazy(options).with_batch_size(2);
    store.migrate().await.expect("migrations");
    Some(store)
}

fn bourbon() -> InventoryRecord {
    let mut record = InventoryRecord::named("Test Bourbon");
    record.count = Some(3);
    record.price_cost = Some(BigDecimal::from_str("45.50").unwrap());
    record.purchased_approx = NaiveDate::from_ymd_opt(2024, 3, 1);
    record
}

// Both scenarios share one table, so they run in a single test.
#[tokio::test]
async fn refresh_round_trips_and_rolls_back() {
    let Some(store) = store().await else {
        eprintln!("CELLAR_TEST_DATABASE_URL not set; skipping");
        return;
    };

    let records = vec![
        bourbon(),
        InventoryRecord::named("Ardbeg 10"),
        InventoryRecord::named("Rye"),
    ];
    let report = store.replace_all(&records).await.expect("refresh");
    assert_eq!(report.after, 3);
    assert_eq!(report.inserted, 3);

    let rows = store.fetch_all().await.expect("fetch");
    let names: Vec<_> = rows.iter().map(|r| r.record.name.as_str()).collect();
    assert_eq!(names, vec!["Ardbeg 10", "Rye", "Test Bourbon"]);
    let stored = rows.iter().find(|r| r.record.name == "Test Bourbon").unwrap();
    assert_eq!(stored.record, bourbon());
    assert!(rows.iter().all(|r| r.id >= 1 && r.id <= 3));

    // The blank name violates the table's check constraint in the second batch.
    let bad = vec![
        InventoryRecord::named("New 1"),
        InventoryRecord::named("New 2"),
        InventoryRecord::named(" "),
    ];
    let err = store.replace_all(&bad).await.expect_err("constraint violation");
    assert!(matches!(err, LoadError::Query { stage: "insert", .. }));

    let after = store.fetch_all().await.expect("fetch after rollback");
    assert_eq!(after, rows);
    assert_eq!(store.count().await.expect("count"), 3);
}
