//! Catalog refresh orchestration: paginated fetch, normalization, batch
//! ranking, deferred persistence, and low-price alerting.
//!
//! The foreground path (fetch -> normalize -> rank) blocks the caller until
//! a ranked batch exists. Persistence, ledger updates, and alerting run in
//! one detached background task per cycle; the caller gets the ranked
//! snapshot synchronously and may await the background handle if it cares
//! about durability.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cellar_client::{FetchError, PageFetch, SearchQuery, StoreContext};
use cellar_core::{AlertItem, PriceObservation, RankingConfig, Record};
use cellar_store::{CatalogStore, FavoritesStore, PriceHistoryLedger, StoreError, UpsertReport};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cellar-refresh";

pub const DEFAULT_PAGE_SIZE: u64 = 500;

/// Attempts per page before the page is given up on.
pub const DEFAULT_PAGE_RETRY_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub page_size: u64,
    pub page_retry_attempts: usize,
    pub page_retry_delay: Duration,
    pub inter_page_delay: Duration,
    pub prior_weight: f64,
    pub chunk_size: usize,
    pub data_dir: PathBuf,
    pub alert_users: Vec<String>,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            page_retry_attempts: DEFAULT_PAGE_RETRY_ATTEMPTS,
            page_retry_delay: Duration::from_millis(500),
            inter_page_delay: Duration::from_millis(500),
            prior_weight: cellar_core::DEFAULT_PRIOR_WEIGHT,
            chunk_size: cellar_store::DEFAULT_CHUNK_SIZE,
            data_dir: PathBuf::from("./data"),
            alert_users: Vec::new(),
            scheduler_enabled: false,
            refresh_cron: "0 0 6 * * *".to_string(),
        }
    }
}

impl RefreshConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            page_size: std::env::var("CELLAR_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.page_size),
            page_retry_attempts: std::env::var("CELLAR_PAGE_RETRY_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.page_retry_attempts),
            page_retry_delay: std::env::var("CELLAR_PAGE_RETRY_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.page_retry_delay),
            inter_page_delay: std::env::var("CELLAR_INTER_PAGE_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.inter_page_delay),
            prior_weight: std::env::var("CELLAR_PRIOR_WEIGHT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.prior_weight),
            chunk_size: std::env::var("CELLAR_CHUNK_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.chunk_size),
            data_dir: std::env::var("CELLAR_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            alert_users: std::env::var("CELLAR_ALERT_USERS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or(defaults.alert_users),
            scheduler_enabled: std::env::var("CELLAR_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            refresh_cron: std::env::var("CELLAR_REFRESH_CRON").unwrap_or(defaults.refresh_cron),
        }
    }
}

/// Registry of retail stores whose ids scope inventory fields in the
/// search response. Loaded from `stores.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreRegistry {
    pub stores: Vec<RetailStore>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetailStore {
    pub store_id: String,
    pub display_name: String,
    #[serde(default)]
    pub context: std::collections::BTreeMap<String, String>,
}

impl StoreRegistry {
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Scoping context for a store: the explicit map from the registry when
    /// present, else the standard inventory context for the store id.
    pub fn context_for(&self, store_id: &str) -> Option<StoreContext> {
        let store = self.stores.iter().find(|s| s.store_id == store_id)?;
        if store.context.is_empty() {
            Some(StoreContext::for_inventory(store_id))
        } else {
            Some(StoreContext {
                fields: store.context.clone(),
            })
        }
    }
}

/// A page the refresh could not aggregate. Partial data is preferable to
/// none, so gaps are reported rather than failing the batch.
#[derive(Debug, Clone, Serialize)]
pub struct PageGap {
    pub page_index: u64,
    pub offset: u64,
    pub reason: String,
}

/// Per-cycle report from the deferred persistence-and-alerting step.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackgroundReport {
    pub catalog: UpsertReport,
    pub ledger_written: usize,
    pub ledger_failed: usize,
    pub alerts_sent: usize,
    pub notify_failures: usize,
}

/// Synchronous result of one refresh: the ranked batch plus pagination
/// accounting. `background` is the handle of the cycle's detached
/// persistence task; callers are not expected to block on it.
#[derive(Debug)]
pub struct RefreshOutcome {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records: Vec<Record>,
    pub pages_fetched: u64,
    pub pages_expected: u64,
    pub gaps: Vec<PageGap>,
    pub skipped_items: usize,
    pub background: JoinHandle<BackgroundReport>,
}

impl RefreshOutcome {
    pub fn is_partial(&self) -> bool {
        !self.gaps.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum RefreshError {
    /// A prior cycle's background work is still in flight.
    #[error("a refresh cycle is already in flight")]
    AlreadyRunning,
    /// The first page failed, so no batch at all could be produced.
    #[error("initial page fetch failed")]
    InitialFetch(#[source] FetchError),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Outbound alert sink. Transports (email, webhook) live behind this trait;
/// delivery failures surface to the caller and are never retried here.
/// Implementations must treat an empty item list as a silent no-op.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: &str, items: &[AlertItem]) -> Result<(), NotifyError>;
}

/// Default sink: logs alerts instead of delivering them anywhere.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user_id: &str, items: &[AlertItem]) -> Result<(), NotifyError> {
        if items.is_empty() {
            return Ok(());
        }
        for item in items {
            info!(
                user_id,
                id = %item.id,
                title = %item.title,
                current = item.current_price,
                lowest = item.lowest_price,
                "price alert"
            );
        }
        Ok(())
    }
}

/// Favorites currently at or below their historical low for one user.
///
/// Items are skipped when the catalog record is absent, when no effective
/// price exists, or when the ledger has no observations for them; a missing
/// history means "cannot be evaluated", never "at lowest price". Ordering
/// of the result is unspecified.
pub async fn evaluate_alerts(
    user_id: &str,
    catalog: &dyn CatalogStore,
    ledger: &dyn PriceHistoryLedger,
    favorites: &dyn FavoritesStore,
) -> Result<Vec<AlertItem>, StoreError> {
    let mut items = Vec::new();
    for entry in favorites.list(user_id).await? {
        let Some(record) = catalog.get(&entry.id).await? else {
            continue;
        };
        let Some(current_price) = record.effective_price() else {
            continue;
        };
        let Some(lowest_price) = ledger.lowest_price(&entry.id).await? else {
            continue;
        };
        if current_price <= lowest_price {
            items.push(AlertItem {
                id: record.id.clone(),
                title: record.title.clone(),
                current_price,
                lowest_price,
            });
        }
    }
    Ok(items)
}

/// Best-effort daily notification dedup: an item already delivered to a
/// user today is dropped from subsequent cycles. Only delivered items are
/// recorded; a failed delivery leaves the item eligible for the next
/// cycle. In-process state only.
#[derive(Debug, Default)]
pub struct AlertDedup {
    sent: Mutex<HashMap<String, (NaiveDate, HashSet<String>)>>,
}

impl AlertDedup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Items not yet delivered to this user today. Does not mark anything
    /// as sent; call [`AlertDedup::mark_sent`] after a successful delivery.
    pub async fn fresh(
        &self,
        user_id: &str,
        today: NaiveDate,
        items: Vec<AlertItem>,
    ) -> Vec<AlertItem> {
        let mut sent = self.sent.lock().await;
        let ids = Self::day_set(&mut sent, user_id, today);
        items
            .into_iter()
            .filter(|item| !ids.contains(&item.id))
            .collect()
    }

    pub async fn mark_sent(&self, user_id: &str, today: NaiveDate, items: &[AlertItem]) {
        let mut sent = self.sent.lock().await;
        let ids = Self::day_set(&mut sent, user_id, today);
        for item in items {
            ids.insert(item.id.clone());
        }
    }

    fn day_set<'a>(
        sent: &'a mut HashMap<String, (NaiveDate, HashSet<String>)>,
        user_id: &str,
        today: NaiveDate,
    ) -> &'a mut HashSet<String> {
        let (date, ids) = sent
            .entry(user_id.to_string())
            .or_insert_with(|| (today, HashSet::new()));
        if *date != today {
            *date = today;
            ids.clear();
        }
        ids
    }
}

/// Drives one full refresh cycle: paginated fetch with bounded retries and
/// gap handling, whole-batch normalization and ranking, then one deferred
/// background task for persistence and alerting.
pub struct RefreshOrchestrator {
    fetcher: Arc<dyn PageFetch>,
    catalog: Arc<dyn CatalogStore>,
    ledger: Arc<dyn PriceHistoryLedger>,
    favorites: Arc<dyn FavoritesStore>,
    notifier: Arc<dyn Notifier>,
    dedup: Arc<AlertDedup>,
    config: RefreshConfig,
    in_flight: Arc<AtomicBool>,
}

impl RefreshOrchestrator {
    pub fn new(
        fetcher: Arc<dyn PageFetch>,
        catalog: Arc<dyn CatalogStore>,
        ledger: Arc<dyn PriceHistoryLedger>,
        favorites: Arc<dyn FavoritesStore>,
        notifier: Arc<dyn Notifier>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            fetcher,
            catalog,
            ledger,
            favorites,
            notifier,
            dedup: Arc::new(AlertDedup::new()),
            config,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    /// Run one refresh cycle. Returns the ranked batch synchronously once
    /// aggregation completes; storage durability is the background task's
    /// concern, reachable through [`RefreshOutcome::background`].
    pub async fn run_refresh(
        &self,
        query: &SearchQuery,
        store: Option<&StoreContext>,
    ) -> Result<RefreshOutcome, RefreshError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RefreshError::AlreadyRunning);
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "refresh started");

        let aggregation = match self.fetch_all_pages(query, store).await {
            Ok(aggregation) => aggregation,
            Err(err) => {
                self.in_flight.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        let refreshed_at = Utc::now();
        let mut records = Vec::with_capacity(aggregation.raw_items.len());
        let mut skipped_items = 0usize;
        for item in &aggregation.raw_items {
            match cellar_client::normalize(item, refreshed_at) {
                Some(record) => records.push(record),
                None => skipped_items += 1,
            }
        }

        cellar_core::rank(
            &mut records,
            RankingConfig {
                prior_weight: self.config.prior_weight,
            },
        );

        let finished_at = Utc::now();
        info!(
            %run_id,
            records = records.len(),
            pages_fetched = aggregation.pages_fetched,
            pages_expected = aggregation.pages_expected,
            gaps = aggregation.gaps.len(),
            skipped = skipped_items,
            "refresh aggregated"
        );
        for gap in &aggregation.gaps {
            warn!(%run_id, page_index = gap.page_index, reason = %gap.reason, "pagination gap");
        }

        // Background task owns its own copy of the batch; the ranked
        // snapshot returned to the caller is never mutated after handoff.
        let background = tokio::spawn(persist_and_alert(BackgroundCtx {
            run_id,
            records: records.clone(),
            catalog: Arc::clone(&self.catalog),
            ledger: Arc::clone(&self.ledger),
            favorites: Arc::clone(&self.favorites),
            notifier: Arc::clone(&self.notifier),
            dedup: Arc::clone(&self.dedup),
            alert_users: self.config.alert_users.clone(),
            in_flight: Arc::clone(&self.in_flight),
        }));

        Ok(RefreshOutcome {
            run_id,
            started_at,
            finished_at,
            records,
            pages_fetched: aggregation.pages_fetched,
            pages_expected: aggregation.pages_expected,
            gaps: aggregation.gaps,
            skipped_items,
            background,
        })
    }

    async fn fetch_all_pages(
        &self,
        query: &SearchQuery,
        store: Option<&StoreContext>,
    ) -> Result<PageAggregation, RefreshError> {
        let page_size = self.config.page_size.max(1);

        let first = self
            .fetch_page_with_retry(query, store, 0, page_size)
            .await
            .map_err(RefreshError::InitialFetch)?;

        let total_count = first.total_count;
        let pages_expected = total_count.div_ceil(page_size).max(1);
        let mut raw_items = first.results;
        let mut pages_fetched = 1u64;
        let mut gaps = Vec::new();

        for page_index in 1..pages_expected {
            tokio::time::sleep(self.config.inter_page_delay).await;

            let offset = page_index * page_size;
            let page = match self
                .fetch_page_with_retry(query, store, offset, page_size)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    // Partial data beats none: record the gap, stop paging.
                    gaps.push(PageGap {
                        page_index,
                        offset,
                        reason: err.to_string(),
                    });
                    break;
                }
            };

            let expected_len = page_size.min(total_count.saturating_sub(offset));
            let got_len = page.results.len() as u64;
            raw_items.extend(page.results);
            pages_fetched += 1;

            if got_len < expected_len {
                gaps.push(PageGap {
                    page_index,
                    offset,
                    reason: format!("short page: got {got_len}, expected {expected_len}"),
                });
                break;
            }
        }

        Ok(PageAggregation {
            raw_items,
            pages_fetched,
            pages_expected,
            gaps,
        })
    }

    /// Bounded retries with fixed backoff for transient failures; fatal
    /// failures propagate immediately.
    async fn fetch_page_with_retry(
        &self,
        query: &SearchQuery,
        store: Option<&StoreContext>,
        offset: u64,
        page_size: u64,
    ) -> Result<cellar_client::SearchPage, FetchError> {
        let attempts = self.config.page_retry_attempts.max(1);
        let mut last_error: Option<FetchError> = None;

        for attempt in 1..=attempts {
            match self
                .fetcher
                .fetch_page(query, store, offset, page_size)
                .await
            {
                Ok(page) => return Ok(page),
                Err(err) if err.is_transient() && attempt < attempts => {
                    warn!(offset, attempt, error = %err, "transient page failure, retrying");
                    last_error = Some(err);
                    tokio::time::sleep(self.config.page_retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.expect("retry loop captures an error before exhausting"))
    }
}

struct PageAggregation {
    raw_items: Vec<cellar_client::RawItem>,
    pages_fetched: u64,
    pages_expected: u64,
    gaps: Vec<PageGap>,
}

struct BackgroundCtx {
    run_id: Uuid,
    records: Vec<Record>,
    catalog: Arc<dyn CatalogStore>,
    ledger: Arc<dyn PriceHistoryLedger>,
    favorites: Arc<dyn FavoritesStore>,
    notifier: Arc<dyn Notifier>,
    dedup: Arc<AlertDedup>,
    alert_users: Vec<String>,
    in_flight: Arc<AtomicBool>,
}

/// Clears the single-flight flag when dropped, so a panicking store
/// implementation cannot wedge the orchestrator into `AlreadyRunning`.
struct InFlightReset(Arc<AtomicBool>);

impl Drop for InFlightReset {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The deferred half of a refresh cycle: catalog upsert, ledger upsert,
/// alert evaluation, notification. Steps run sequentially; every failure is
/// logged and collected rather than aborting the remainder.
async fn persist_and_alert(ctx: BackgroundCtx) -> BackgroundReport {
    let _reset = InFlightReset(Arc::clone(&ctx.in_flight));
    let run_id = ctx.run_id;
    let mut report = BackgroundReport::default();

    match ctx.catalog.upsert(&ctx.records).await {
        Ok(upsert) => {
            if !upsert.is_complete() {
                warn!(%run_id, failed_chunks = upsert.failed.len(), "catalog upsert partially failed");
            }
            report.catalog = upsert;
        }
        Err(err) => {
            warn!(%run_id, error = %err, "catalog upsert failed");
        }
    }

    let today = Utc::now().date_naive();
    let observations: Vec<PriceObservation> = ctx
        .records
        .iter()
        .filter_map(|record| {
            record.effective_price().map(|price| PriceObservation {
                id: record.id.clone(),
                date: today,
                price,
                title: Some(record.title.clone()),
            })
        })
        .collect();

    match ctx.ledger.record_many(&observations).await {
        Ok(written) => report.ledger_written = written,
        Err(err) => {
            // Affected ids simply miss this cycle's observation; they drop
            // out of lowest-price comparisons until a successful write.
            warn!(%run_id, error = %err, "price history write failed");
            report.ledger_failed = observations.len();
        }
    }

    for user_id in &ctx.alert_users {
        let items = match evaluate_alerts(
            user_id,
            ctx.catalog.as_ref(),
            ctx.ledger.as_ref(),
            ctx.favorites.as_ref(),
        )
        .await
        {
            Ok(items) => items,
            Err(err) => {
                warn!(%run_id, user_id, error = %err, "alert evaluation failed");
                continue;
            }
        };

        let fresh = ctx.dedup.fresh(user_id, today, items).await;
        if fresh.is_empty() {
            continue;
        }

        match ctx.notifier.notify(user_id, &fresh).await {
            Ok(()) => {
                // Marked sent only on delivery; a failed attempt leaves the
                // items eligible for the next cycle today.
                ctx.dedup.mark_sent(user_id, today, &fresh).await;
                report.alerts_sent += fresh.len();
            }
            Err(err) => {
                warn!(%run_id, user_id, error = %err, "notification delivery failed");
                report.notify_failures += 1;
            }
        }
    }

    info!(
        %run_id,
        upserted = report.catalog.written,
        ledger_written = report.ledger_written,
        alerts_sent = report.alerts_sent,
        "background persistence complete"
    );
    report
}

/// Cron-driven refresh jobs, enabled by configuration. Each tick runs one
/// full cycle with the given query, unscoped to any store.
pub async fn maybe_build_scheduler(
    orchestrator: Arc<RefreshOrchestrator>,
    query: SearchQuery,
) -> anyhow::Result<Option<JobScheduler>> {
    if !orchestrator.config().scheduler_enabled {
        return Ok(None);
    }

    let cron = orchestrator.config().refresh_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let orchestrator = Arc::clone(&orchestrator);
        let query = query.clone();
        Box::pin(async move {
            match orchestrator.run_refresh(&query, None).await {
                Ok(outcome) => info!(
                    run_id = %outcome.run_id,
                    records = outcome.records.len(),
                    partial = outcome.is_partial(),
                    "scheduled refresh complete"
                ),
                Err(err) => warn!(error = %err, "scheduled refresh failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellar_store::{MemoryCatalogStore, MemoryFavorites, MemoryPriceHistory};
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn mk_record(id: &str, price: f64) -> Record {
        Record {
            id: id.to_string(),
            title: format!("Wine {id}"),
            price: Some(price),
            promo_price: None,
            rating_value: Some(4.0),
            rating_count: 10,
            attributes: BTreeMap::new(),
            score: 0.0,
            last_refreshed: Utc.with_ymd_and_hms(2026, 8, 30, 6, 0, 0).single().unwrap(),
        }
    }

    fn mk_alert(id: &str) -> AlertItem {
        AlertItem {
            id: id.to_string(),
            title: id.to_string(),
            current_price: 10.0,
            lowest_price: 10.0,
        }
    }

    #[tokio::test]
    async fn dedup_drops_repeats_within_a_day_and_resets_across_days() {
        let dedup = AlertDedup::new();
        let day1 = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2026, 8, 31).unwrap();

        let first = dedup.fresh("alice", day1, vec![mk_alert("a"), mk_alert("b")]).await;
        assert_eq!(first.len(), 2);
        dedup.mark_sent("alice", day1, &first).await;

        let repeat = dedup.fresh("alice", day1, vec![mk_alert("a"), mk_alert("c")]).await;
        assert_eq!(repeat.len(), 1);
        assert_eq!(repeat[0].id, "c");

        // Other users have independent sent-sets.
        let other_user = dedup.fresh("bob", day1, vec![mk_alert("a")]).await;
        assert_eq!(other_user.len(), 1);

        let next_day = dedup.fresh("alice", day2, vec![mk_alert("a")]).await;
        assert_eq!(next_day.len(), 1);
    }

    #[tokio::test]
    async fn dedup_keeps_items_eligible_until_marked_sent() {
        let dedup = AlertDedup::new();
        let day = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();

        // Checking freshness records nothing; a failed delivery leaves the
        // item eligible for the next cycle.
        let first = dedup.fresh("alice", day, vec![mk_alert("a")]).await;
        assert_eq!(first.len(), 1);

        let second = dedup.fresh("alice", day, vec![mk_alert("a")]).await;
        assert_eq!(second.len(), 1);

        dedup.mark_sent("alice", day, &second).await;
        let third = dedup.fresh("alice", day, vec![mk_alert("a")]).await;
        assert!(third.is_empty());
    }

    #[tokio::test]
    async fn alert_boundary_is_inclusive() {
        let catalog = MemoryCatalogStore::new();
        let ledger = MemoryPriceHistory::new();
        let favorites = MemoryFavorites::new();
        let added = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).single().unwrap();

        let at_low = mk_record("at-low", 40.0);
        let above_low = mk_record("above-low", 40.01);
        catalog.upsert(&[at_low, above_low]).await.unwrap();

        for id in ["at-low", "above-low"] {
            favorites.add("alice", id, added).await.unwrap();
            ledger
                .record(PriceObservation {
                    id: id.to_string(),
                    date: NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
                    price: 40.0,
                    title: None,
                })
                .await
                .unwrap();
        }

        let items = evaluate_alerts("alice", &catalog, &ledger, &favorites)
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "at-low");
        assert_eq!(items[0].current_price, 40.0);
        assert_eq!(items[0].lowest_price, 40.0);
    }

    #[tokio::test]
    async fn alerts_skip_unevaluable_favorites() {
        let catalog = MemoryCatalogStore::new();
        let ledger = MemoryPriceHistory::new();
        let favorites = MemoryFavorites::new();
        let added = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).single().unwrap();

        // Favorited but absent from the catalog.
        favorites.add("alice", "gone", added).await.unwrap();

        // In the catalog but with no usable price.
        let mut priceless = mk_record("priceless", 0.0);
        priceless.price = None;
        // In the catalog, priced, but with no price history yet.
        let unhistoried = mk_record("unhistoried", 15.0);
        catalog.upsert(&[priceless, unhistoried]).await.unwrap();
        favorites.add("alice", "priceless", added).await.unwrap();
        favorites.add("alice", "unhistoried", added).await.unwrap();

        let items = evaluate_alerts("alice", &catalog, &ledger, &favorites)
            .await
            .unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn empty_notify_is_a_silent_success() {
        let notifier = LogNotifier;
        notifier.notify("alice", &[]).await.expect("no-op");
    }

    #[test]
    fn registry_resolves_contexts() {
        let yaml = r#"
stores:
  - store_id: "145"
    display_name: Bradford
  - store_id: "391"
    display_name: E. Gwillimbury
    context:
      stores_inventory: "391"
"#;
        let registry: StoreRegistry = serde_yaml::from_str(yaml).unwrap();

        let derived = registry.context_for("145").unwrap();
        assert_eq!(derived.fields.get("stores_inventory").unwrap(), "145");
        assert_eq!(derived.fields.len(), 4);

        let explicit = registry.context_for("391").unwrap();
        assert_eq!(explicit.fields.len(), 1);

        assert!(registry.context_for("999").is_none());
    }

    #[test]
    fn config_defaults_match_contract() {
        let config = RefreshConfig::default();
        assert_eq!(config.page_size, 500);
        assert_eq!(config.page_retry_attempts, 3);
        assert!(!config.scheduler_enabled);
    }
}
