//! Catalog, price-history, and favorites stores.
//!
//! Each store is a trait so the refresh pipeline can run against the
//! JSON-file-backed implementations in production and the in-memory ones in
//! tests. All mutations are upserts keyed by a natural key; file writes go
//! through an atomic temp-file rename so a failed chunk never leaves a
//! partially written table behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cellar_core::{FavoriteEntry, PriceObservation, Record};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cellar-store";

/// Upper bound on records written per storage call.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt store file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One failed upsert chunk. Remaining chunks still proceed; the caller
/// decides whether a partial write warrants escalation.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkFailure {
    pub chunk_index: usize,
    pub ids: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpsertReport {
    pub written: usize,
    pub failed: Vec<ChunkFailure>,
}

impl UpsertReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Catalog table: full-record replace keyed by `id`.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Upsert a batch in bounded chunks. A chunk failure is reported but
    /// does not abort remaining chunks.
    async fn upsert(&self, records: &[Record]) -> Result<UpsertReport, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Record>, StoreError>;

    async fn all(&self) -> Result<Vec<Record>, StoreError>;
}

/// Price-history table: one observation per `(id, date)`, upsert on
/// conflict, rows never deleted.
#[async_trait]
pub trait PriceHistoryLedger: Send + Sync {
    async fn record(&self, observation: PriceObservation) -> Result<(), StoreError>;

    /// Batched variant used by the refresh background step.
    async fn record_many(&self, observations: &[PriceObservation]) -> Result<usize, StoreError>;

    /// Lowest price ever observed for an item; `None` when the item has no
    /// observations, which callers must treat as "cannot be evaluated".
    async fn lowest_price(&self, id: &str) -> Result<Option<f64>, StoreError>;

    async fn observations(&self, id: &str) -> Result<Vec<PriceObservation>, StoreError>;
}

/// Favorites table: at most one entry per `(user_id, id)`, mutated by
/// explicit user action only.
#[async_trait]
pub trait FavoritesStore: Send + Sync {
    /// Returns true when the entry was newly added.
    async fn add(&self, user_id: &str, id: &str, added: DateTime<Utc>)
        -> Result<bool, StoreError>;

    /// Returns true when an entry existed and was removed.
    async fn remove(&self, user_id: &str, id: &str) -> Result<bool, StoreError>;

    async fn contains(&self, user_id: &str, id: &str) -> Result<bool, StoreError>;

    async fn list(&self, user_id: &str) -> Result<Vec<FavoriteEntry>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    records: RwLock<BTreeMap<String, Record>>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn upsert(&self, records: &[Record]) -> Result<UpsertReport, StoreError> {
        let mut table = self.records.write().await;
        for record in records {
            table.insert(record.id.clone(), record.clone());
        }
        Ok(UpsertReport {
            written: records.len(),
            failed: Vec::new(),
        })
    }

    async fn get(&self, id: &str) -> Result<Option<Record>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn all(&self) -> Result<Vec<Record>, StoreError> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

type LedgerRows = BTreeMap<String, BTreeMap<NaiveDate, LedgerEntry>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LedgerEntry {
    price: f64,
    #[serde(default)]
    title: Option<String>,
}

fn ledger_lowest(rows: &LedgerRows, id: &str) -> Option<f64> {
    rows.get(id)?
        .values()
        .map(|entry| entry.price)
        .fold(None, |lowest, price| match lowest {
            Some(current) if current <= price => Some(current),
            _ => Some(price),
        })
}

fn ledger_observations(rows: &LedgerRows, id: &str) -> Vec<PriceObservation> {
    rows.get(id)
        .map(|days| {
            days.iter()
                .map(|(date, entry)| PriceObservation {
                    id: id.to_string(),
                    date: *date,
                    price: entry.price,
                    title: entry.title.clone(),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn ledger_upsert(rows: &mut LedgerRows, observation: &PriceObservation) {
    rows.entry(observation.id.clone()).or_default().insert(
        observation.date,
        LedgerEntry {
            price: observation.price,
            title: observation.title.clone(),
        },
    );
}

#[derive(Debug, Default)]
pub struct MemoryPriceHistory {
    rows: RwLock<LedgerRows>,
}

impl MemoryPriceHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PriceHistoryLedger for MemoryPriceHistory {
    async fn record(&self, observation: PriceObservation) -> Result<(), StoreError> {
        ledger_upsert(&mut *self.rows.write().await, &observation);
        Ok(())
    }

    async fn record_many(&self, observations: &[PriceObservation]) -> Result<usize, StoreError> {
        let mut rows = self.rows.write().await;
        for observation in observations {
            ledger_upsert(&mut rows, observation);
        }
        Ok(observations.len())
    }

    async fn lowest_price(&self, id: &str) -> Result<Option<f64>, StoreError> {
        Ok(ledger_lowest(&*self.rows.read().await, id))
    }

    async fn observations(&self, id: &str) -> Result<Vec<PriceObservation>, StoreError> {
        Ok(ledger_observations(&*self.rows.read().await, id))
    }
}

type FavoriteRows = BTreeMap<String, BTreeMap<String, DateTime<Utc>>>;

fn favorite_entries(rows: &FavoriteRows, user_id: &str) -> Vec<FavoriteEntry> {
    rows.get(user_id)
        .map(|ids| {
            ids.iter()
                .map(|(id, added)| FavoriteEntry {
                    user_id: user_id.to_string(),
                    id: id.clone(),
                    date_added: *added,
                })
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Default)]
pub struct MemoryFavorites {
    rows: RwLock<FavoriteRows>,
}

impl MemoryFavorites {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FavoritesStore for MemoryFavorites {
    async fn add(
        &self,
        user_id: &str,
        id: &str,
        added: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut rows = self.rows.write().await;
        let ids = rows.entry(user_id.to_string()).or_default();
        if ids.contains_key(id) {
            return Ok(false);
        }
        ids.insert(id.to_string(), added);
        Ok(true)
    }

    async fn remove(&self, user_id: &str, id: &str) -> Result<bool, StoreError> {
        let mut rows = self.rows.write().await;
        Ok(rows
            .get_mut(user_id)
            .map(|ids| ids.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn contains(&self, user_id: &str, id: &str) -> Result<bool, StoreError> {
        let rows = self.rows.read().await;
        Ok(rows
            .get(user_id)
            .map(|ids| ids.contains_key(id))
            .unwrap_or(false))
    }

    async fn list(&self, user_id: &str) -> Result<Vec<FavoriteEntry>, StoreError> {
        Ok(favorite_entries(&*self.rows.read().await, user_id))
    }
}

// ---------------------------------------------------------------------------
// JSON-file-backed implementations
// ---------------------------------------------------------------------------

async fn load_table<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Serialize and atomically replace the table file via temp-file rename.
async fn write_table<T: Serialize>(path: &Path, table: &T) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    let bytes = serde_json::to_vec_pretty(table).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;

    let temp_path = path.with_file_name(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err)?;
    file.write_all(&bytes).await.map_err(io_err)?;
    file.flush().await.map_err(io_err)?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(source) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(io_err(source))
        }
    }
}

/// Catalog table persisted as one JSON document keyed by record id.
#[derive(Debug)]
pub struct JsonCatalogStore {
    path: PathBuf,
    chunk_size: usize,
    lock: Mutex<()>,
}

impl JsonCatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_chunk_size(path, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(path: impl Into<PathBuf>, chunk_size: usize) -> Self {
        Self {
            path: path.into(),
            chunk_size: chunk_size.max(1),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl CatalogStore for JsonCatalogStore {
    async fn upsert(&self, records: &[Record]) -> Result<UpsertReport, StoreError> {
        let _guard = self.lock.lock().await;
        let mut table: BTreeMap<String, Record> = load_table(&self.path).await?;
        let mut report = UpsertReport::default();

        for (chunk_index, chunk) in records.chunks(self.chunk_size).enumerate() {
            for record in chunk {
                table.insert(record.id.clone(), record.clone());
            }
            match write_table(&self.path, &table).await {
                Ok(()) => report.written += chunk.len(),
                Err(err) => {
                    warn!(chunk_index, error = %err, "catalog chunk write failed");
                    report.failed.push(ChunkFailure {
                        chunk_index,
                        ids: chunk.iter().map(|r| r.id.clone()).collect(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    async fn get(&self, id: &str) -> Result<Option<Record>, StoreError> {
        let table: BTreeMap<String, Record> = load_table(&self.path).await?;
        Ok(table.get(id).cloned())
    }

    async fn all(&self) -> Result<Vec<Record>, StoreError> {
        let table: BTreeMap<String, Record> = load_table(&self.path).await?;
        Ok(table.into_values().collect())
    }
}

/// Price-history table persisted as `{ id: { date: { price, title } } }`.
#[derive(Debug)]
pub struct JsonPriceHistory {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonPriceHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl PriceHistoryLedger for JsonPriceHistory {
    async fn record(&self, observation: PriceObservation) -> Result<(), StoreError> {
        self.record_many(std::slice::from_ref(&observation)).await?;
        Ok(())
    }

    async fn record_many(&self, observations: &[PriceObservation]) -> Result<usize, StoreError> {
        if observations.is_empty() {
            return Ok(0);
        }
        let _guard = self.lock.lock().await;
        let mut rows: LedgerRows = load_table(&self.path).await?;
        for observation in observations {
            ledger_upsert(&mut rows, observation);
        }
        write_table(&self.path, &rows).await?;
        Ok(observations.len())
    }

    async fn lowest_price(&self, id: &str) -> Result<Option<f64>, StoreError> {
        let rows: LedgerRows = load_table(&self.path).await?;
        Ok(ledger_lowest(&rows, id))
    }

    async fn observations(&self, id: &str) -> Result<Vec<PriceObservation>, StoreError> {
        let rows: LedgerRows = load_table(&self.path).await?;
        Ok(ledger_observations(&rows, id))
    }
}

/// Favorites table persisted as `{ user_id: { id: date_added } }`.
#[derive(Debug)]
pub struct JsonFavorites {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFavorites {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl FavoritesStore for JsonFavorites {
    async fn add(
        &self,
        user_id: &str,
        id: &str,
        added: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut rows: FavoriteRows = load_table(&self.path).await?;
        let ids = rows.entry(user_id.to_string()).or_default();
        if ids.contains_key(id) {
            return Ok(false);
        }
        ids.insert(id.to_string(), added);
        write_table(&self.path, &rows).await?;
        Ok(true)
    }

    async fn remove(&self, user_id: &str, id: &str) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut rows: FavoriteRows = load_table(&self.path).await?;
        let removed = rows
            .get_mut(user_id)
            .map(|ids| ids.remove(id).is_some())
            .unwrap_or(false);
        if removed {
            write_table(&self.path, &rows).await?;
        }
        Ok(removed)
    }

    async fn contains(&self, user_id: &str, id: &str) -> Result<bool, StoreError> {
        let rows: FavoriteRows = load_table(&self.path).await?;
        Ok(rows
            .get(user_id)
            .map(|ids| ids.contains_key(id))
            .unwrap_or(false))
    }

    async fn list(&self, user_id: &str) -> Result<Vec<FavoriteEntry>, StoreError> {
        let rows: FavoriteRows = load_table(&self.path).await?;
        Ok(favorite_entries(&rows, user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn mk_record(id: &str, price: f64) -> Record {
        Record {
            id: id.to_string(),
            title: format!("Wine {id}"),
            price: Some(price),
            promo_price: None,
            rating_value: Some(4.2),
            rating_count: 12,
            attributes: BTreeMap::new(),
            score: 0.0,
            last_refreshed: Utc.with_ymd_and_hms(2026, 8, 30, 6, 0, 0).single().unwrap(),
        }
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, day).unwrap()
    }

    #[tokio::test]
    async fn repeated_upsert_is_byte_for_byte_idempotent() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("catalog.json");
        let store = JsonCatalogStore::new(&path);
        let batch = vec![mk_record("a", 19.95), mk_record("b", 22.50)];

        let first = store.upsert(&batch).await.expect("first upsert");
        assert!(first.is_complete());
        let after_first = fs::read(&path).await.expect("read after first");

        let second = store.upsert(&batch).await.expect("second upsert");
        assert!(second.is_complete());
        let after_second = fs::read(&path).await.expect("read after second");

        assert_eq!(after_first, after_second);
        assert_eq!(store.all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn upsert_replaces_whole_record() {
        let store = MemoryCatalogStore::new();
        let mut record = mk_record("a", 19.95);
        record
            .attributes
            .insert("lcbo_program".into(), cellar_core::AttrValue::Text("Vintages".into()));
        store.upsert(std::slice::from_ref(&record)).await.unwrap();

        let replacement = mk_record("a", 17.95);
        store
            .upsert(std::slice::from_ref(&replacement))
            .await
            .unwrap();

        let stored = store.get("a").await.unwrap().unwrap();
        assert_eq!(stored.price, Some(17.95));
        // Full replace, not a field-level merge: the old attribute is gone.
        assert!(stored.attributes.is_empty());
    }

    #[tokio::test]
    async fn chunked_upsert_counts_all_records() {
        let dir = tempdir().expect("tempdir");
        let store = JsonCatalogStore::with_chunk_size(dir.path().join("catalog.json"), 2);
        let batch: Vec<Record> = (0..5).map(|i| mk_record(&format!("id-{i}"), 10.0)).collect();

        let report = store.upsert(&batch).await.expect("upsert");
        assert_eq!(report.written, 5);
        assert!(report.is_complete());
        assert_eq!(store.all().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn lowest_price_tracks_historical_minimum() {
        let dir = tempdir().expect("tempdir");
        let ledger = JsonPriceHistory::new(dir.path().join("price_history.json"));

        for (day, price) in [(1, 50.0), (2, 40.0), (3, 45.0)] {
            ledger
                .record(PriceObservation {
                    id: "x".into(),
                    date: date(day),
                    price,
                    title: None,
                })
                .await
                .expect("record");
        }

        assert_eq!(ledger.lowest_price("x").await.unwrap(), Some(40.0));
        assert_eq!(ledger.lowest_price("unknown").await.unwrap(), None);
        assert_eq!(ledger.observations("x").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn same_day_observation_overwrites_not_appends() {
        let ledger = MemoryPriceHistory::new();
        for price in [30.0, 25.0] {
            ledger
                .record(PriceObservation {
                    id: "x".into(),
                    date: date(1),
                    price,
                    title: Some("Wine x".into()),
                })
                .await
                .unwrap();
        }

        let observations = ledger.observations("x").await.unwrap();
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].price, 25.0);
    }

    #[tokio::test]
    async fn favorites_are_unique_per_user_and_item() {
        let dir = tempdir().expect("tempdir");
        let favorites = JsonFavorites::new(dir.path().join("favorites.json"));
        let added = Utc.with_ymd_and_hms(2026, 8, 30, 8, 0, 0).single().unwrap();

        assert!(favorites.add("alice", "wine-1", added).await.unwrap());
        assert!(!favorites.add("alice", "wine-1", added).await.unwrap());
        assert!(favorites.add("bob", "wine-1", added).await.unwrap());

        assert!(favorites.contains("alice", "wine-1").await.unwrap());
        assert_eq!(favorites.list("alice").await.unwrap().len(), 1);

        assert!(favorites.remove("alice", "wine-1").await.unwrap());
        assert!(!favorites.remove("alice", "wine-1").await.unwrap());
        assert!(!favorites.contains("alice", "wine-1").await.unwrap());
    }

    #[tokio::test]
    async fn tables_reload_from_disk() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("catalog.json");

        {
            let store = JsonCatalogStore::new(&path);
            store.upsert(&[mk_record("a", 19.95)]).await.unwrap();
        }

        let reopened = JsonCatalogStore::new(&path);
        let record = reopened.get("a").await.unwrap().expect("record survives");
        assert_eq!(record.title, "Wine a");
    }
}
