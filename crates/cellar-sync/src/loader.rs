//! Full-refresh loading of the `liquor` table.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use cellar_core::{FieldValue, InventoryRecord, RecordField, StoredRecord};
use chrono::Utc;
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Postgres rejects statements binding more parameters than this.
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Largest batch whose multi-row insert stays within `MAX_BIND_PARAMS`.
pub const MAX_BATCH_SIZE: usize = MAX_BIND_PARAMS / RecordField::ALL.len();

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("connecting to the inventory database: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("{stage} failed: {source}")]
    Query {
        stage: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("committing the refresh: {0}")]
    Commit(#[source] sqlx::Error),
    #[error("row {row} rejected: {reason}")]
    Rejected { row: usize, reason: String },
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Row counts observed inside the refresh transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub before: u64,
    pub after: u64,
    pub inserted: u64,
}

impl LoadReport {
    pub fn delta(&self) -> i64 {
        self.after as i64 - self.before as i64
    }
}

/// The target table.
///
/// `replace_all` is all-or-nothing: on any error the table keeps exactly the
/// rows it had before the call.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn count(&self) -> Result<u64, LoadError>;
    async fn replace_all(&self, records: &[InventoryRecord]) -> Result<LoadReport, LoadError>;
    /// Every row ordered by name, then id.
    async fn fetch_all(&self) -> Result<Vec<StoredRecord>, LoadError>;
}

#[derive(Debug, Clone)]
pub struct PgInventoryStore {
    pool: PgPool,
    batch_size: usize,
}

impl PgInventoryStore {
    /// Builds a pool that connects on first use, so a down database surfaces
    /// as a load failure of the task rather than at startup.
    pub fn connect_lazy(options: PgConnectOptions) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect_lazy_with(options);
        Self::from_pool(pool)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Clamped to `1..=MAX_BATCH_SIZE`.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), LoadError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn insert_columns() -> String {
    RecordField::ALL
        .iter()
        .map(|f| f.column())
        .collect::<Vec<_>>()
        .join(", ")
}

async fn count_in(tx: &mut Transaction<'_, Postgres>) -> Result<u64, LoadError> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM liquor")
        .fetch_one(&mut **tx)
        .await
        .map_err(|source| LoadError::Query {
            stage: "count",
            source,
        })?;
    let n: i64 = row.try_get("n").map_err(|source| LoadError::Query {
        stage: "count",
        source,
    })?;
    Ok(n.max(0) as u64)
}

fn stored_from_row(row: &PgRow) -> Result<StoredRecord, sqlx::Error> {
    Ok(StoredRecord {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        record: InventoryRecord {
            name: row.try_get("name")?,
            count: row.try_get("count")?,
            country_of_origin: row.try_get("country_of_origin")?,
            category_style: row.try_get("category_style")?,
            region: row.try_get("region")?,
            distillery: row.try_get("distillery")?,
            age: row.try_get("age")?,
            purchased_approx: row.try_get("purchased_approx")?,
            abv: row.try_get("abv")?,
            volume: row.try_get("volume")?,
            price_cost: row.try_get("price_cost")?,
            replacement_cost: row.try_get("replacement_cost")?,
            opened_closed: row.try_get("opened_closed")?,
            errata: row.try_get("errata")?,
        },
    })
}

#[async_trait]
impl InventoryStore for PgInventoryStore {
    async fn count(&self) -> Result<u64, LoadError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM liquor")
            .fetch_one(&self.pool)
            .await
            .map_err(LoadError::Connect)?;
        let n: i64 = row.try_get("n").map_err(|source| LoadError::Query {
            stage: "count",
            source,
        })?;
        Ok(n.max(0) as u64)
    }

    async fn replace_all(&self, records: &[InventoryRecord]) -> Result<LoadReport, LoadError> {
        let mut tx = self.pool.begin().await.map_err(LoadError::Connect)?;
        let before = count_in(&mut tx).await?;

        sqlx::query("TRUNCATE TABLE liquor RESTART IDENTITY")
            .execute(&mut *tx)
            .await
            .map_err(|source| LoadError::Query {
                stage: "truncate",
                source,
            })?;

        let columns = insert_columns();
        for (batch_no, chunk) in records.chunks(self.batch_size).enumerate() {
            let mut query_builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO liquor ({columns}) "));
            query_builder.push_values(chunk, |mut b, record| {
                for field in RecordField::ALL {
                    match record.value(field) {
                        FieldValue::Text(v) => {
                            b.push_bind(v);
                        }
                        FieldValue::Integer(v) => {
                            b.push_bind(v);
                        }
                        FieldValue::Decimal(v) => {
                            b.push_bind(v);
                        }
                        FieldValue::Date(v) => {
                            b.push_bind(v);
                        }
                    }
                }
            });
            query_builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|source| LoadError::Query {
                    stage: "insert",
                    source,
                })?;
            debug!(batch = batch_no, rows = chunk.len(), "inserted batch");
        }

        let after = count_in(&mut tx).await?;
        tx.commit().await.map_err(LoadError::Commit)?;

        info!(before, after, "inventory table refreshed");
        Ok(LoadReport {
            before,
            after,
            inserted: records.len() as u64,
        })
    }

    async fn fetch_all(&self) -> Result<Vec<StoredRecord>, LoadError> {
        let sql = format!(
            "SELECT id, {}, created_at, updated_at FROM liquor ORDER BY name, id",
            insert_columns()
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(LoadError::Connect)?;
        rows.iter()
            .map(stored_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| LoadError::Query {
                stage: "decode",
                source,
            })
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<StoredRecord>,
    fail_from: Option<usize>,
}

/// In-process table with the same refresh semantics as Postgres.
///
/// New rows are staged aside and swapped in only after every insert
/// succeeded, mirroring a rolled-back transaction on failure.
#[derive(Debug, Default)]
pub struct MemoryInventoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every refresh fail when it reaches row index `row`.
    pub fn fail_inserts_from(&self, row: Option<usize>) {
        self.lock().fail_from = row;
    }

    /// Replaces the table contents directly, outside any refresh.
    pub fn seed(&self, records: Vec<InventoryRecord>) {
        self.lock().rows = stage(records.iter());
    }

    pub fn rows(&self) -> Vec<StoredRecord> {
        self.lock().rows.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn stage<'a>(records: impl Iterator<Item = &'a InventoryRecord>) -> Vec<StoredRecord> {
    let now = Utc::now();
    records
        .enumerate()
        .map(|(i, record)| StoredRecord {
            id: i as i64 + 1,
            created_at: now,
            updated_at: now,
            record: record.clone(),
        })
        .collect()
}

#[async_trait]
impl InventoryStore for MemoryInventoryStore {
    async fn count(&self) -> Result<u64, LoadError> {
        Ok(self.lock().rows.len() as u64)
    }

    async fn replace_all(&self, records: &[InventoryRecord]) -> Result<LoadReport, LoadError> {
        let mut state = self.lock();
        let before = state.rows.len() as u64;

        for (row, record) in records.iter().enumerate() {
            if state.fail_from.is_some_and(|limit| row >= limit) {
                return Err(LoadError::Rejected {
                    row,
                    reason: "insert failure injected".to_string(),
                });
            }
            if record.name.trim().is_empty() {
                return Err(LoadError::Rejected {
                    row,
                    reason: "name must not be empty".to_string(),
                });
            }
        }

        state.rows = stage(records.iter());
        let after = state.rows.len() as u64;
        Ok(LoadReport {
            before,
            after,
            inserted: records.len() as u64,
        })
    }

    async fn fetch_all(&self) -> Result<Vec<StoredRecord>, LoadError> {
        let mut rows = self.lock().rows.clone();
        rows.sort_by(|a, b| {
            a.record
                .name
                .cmp(&b.record.name)
                .then(a.id.cmp(&b.id))
        });
        Ok(rows)
    }
}
