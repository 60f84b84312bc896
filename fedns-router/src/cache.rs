//! Mount table cache kept in sync with the metadata store.
//!
//! The active [`MountTable`] sits behind a single atomically swapped
//! pointer. Readers take a snapshot without locking; the refresh path is the
//! only writer and is serialized by `refresh_lock`, which is never held by a
//! lookup.

use arc_swap::ArcSwapOption;
use fedns_common::{
    retry_if, timeouts, FedNsError, HealthCheckResult, HealthChecker, HealthStatus, Result,
    RouterConfig, TableVersion,
};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::metrics::RouterMetrics;
use crate::mount_table::MountTable;
use crate::store::MountStore;

/// Lifecycle of the mount table cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheState {
    /// No table; nothing is being loaded
    Init = 0,
    /// First load in progress
    Loading = 1,
    Ready = 2,
    /// A table is active and a re-fetch is in progress
    Refreshing = 3,
    /// Refreshes keep failing and the active table is older than the staleness bound
    Stale = 4,
}

impl CacheState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CacheState::Loading,
            2 => CacheState::Ready,
            3 => CacheState::Refreshing,
            4 => CacheState::Stale,
            _ => CacheState::Init,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheState::Init => "INIT",
            CacheState::Loading => "LOADING",
            CacheState::Ready => "READY",
            CacheState::Refreshing => "REFRESHING",
            CacheState::Stale => "STALE",
        }
    }

    pub fn as_metric(&self) -> i64 {
        *self as u8 as i64
    }

    /// Whether a table is available to serve lookups in this state
    pub fn is_serving(&self) -> bool {
        matches!(self, CacheState::Ready | CacheState::Refreshing | CacheState::Stale)
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-memory mount table synced from a [`MountStore`]
pub struct MountTableCache {
    store: Arc<dyn MountStore>,
    config: RouterConfig,
    current: ArcSwapOption<MountTable>,
    state: AtomicU8,
    last_version: AtomicU64,
    consecutive_failures: AtomicU32,
    refresh_lock: Mutex<()>,
    /// Version of the last published table; also pinged on state changes waiters care about
    published: watch::Sender<TableVersion>,
    /// Store change feed, subscribed at construction so no change after it is missed
    changes: Option<watch::Receiver<u64>>,
    metrics: Option<Arc<RouterMetrics>>,
}

impl MountTableCache {
    /// Create an empty cache in the `INIT` state
    pub fn new(store: Arc<dyn MountStore>, config: RouterConfig) -> Self {
        Self::new_with_metrics(store, config, None)
    }

    /// Create an empty cache with metrics
    pub fn new_with_metrics(
        store: Arc<dyn MountStore>,
        config: RouterConfig,
        metrics: Option<Arc<RouterMetrics>>,
    ) -> Self {
        let (published, _) = watch::channel(0);
        let changes = store.subscribe();
        Self {
            store,
            config,
            current: ArcSwapOption::empty(),
            state: AtomicU8::new(CacheState::Init as u8),
            last_version: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            refresh_lock: Mutex::new(()),
            published,
            changes,
            metrics,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn state(&self) -> CacheState {
        CacheState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The active table, if any. Never blocks.
    pub fn snapshot(&self) -> Option<Arc<MountTable>> {
        self.current.load_full()
    }

    pub fn version(&self) -> Option<TableVersion> {
        self.snapshot().map(|table| table.version())
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Subscribe to table publications
    pub fn subscribe(&self) -> watch::Receiver<TableVersion> {
        self.published.subscribe()
    }

    /// The active table, waiting out an initial load that is in progress
    pub async fn wait_for_table(&self) -> Result<Arc<MountTable>> {
        if let Some(table) = self.snapshot() {
            return Ok(table);
        }

        let mut published = self.published.subscribe();
        let waited = timeout(self.config.startup_timeout(), async {
            loop {
                if let Some(table) = self.snapshot() {
                    return Some(table);
                }
                if self.state() != CacheState::Loading {
                    return None;
                }
                if published.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await;

        match waited {
            Ok(Some(table)) => Ok(table),
            _ => Err(FedNsError::CacheNotReady(self.state().to_string())),
        }
    }

    /// Perform the initial load, bounded by the startup timeout.
    ///
    /// Expiry of the timeout is a fatal startup error.
    pub async fn start(&self) -> Result<TableVersion> {
        if let Some(table) = self.snapshot() {
            return Ok(table.version());
        }

        self.set_state(CacheState::Loading);
        info!("Loading initial mount table");

        let startup_timeout = self.config.startup_timeout();
        let pause = self.config.retry().initial_backoff;
        let load = async {
            loop {
                match self.refresh().await {
                    Ok(version) => return version,
                    Err(e) => {
                        warn!("Initial mount table load failed: {}", e);
                        sleep(pause).await;
                    }
                }
            }
        };

        match timeout(startup_timeout, load).await {
            Ok(version) => {
                info!("Mount table cache ready at version {}", version);
                Ok(version)
            }
            Err(_) => {
                error!("Initial mount table load timed out after {:?}", startup_timeout);
                self.set_state(CacheState::Init);
                self.wake_waiters();
                Err(FedNsError::StartupTimeout(startup_timeout))
            }
        }
    }

    /// Fetch the full entry set and publish it as a new table.
    ///
    /// Failures never reach request callers; they only move the cache
    /// towards `STALE` once the active table outlives the staleness bound.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<TableVersion> {
        let _guard = self.refresh_lock.lock().await;
        let had_table = self.current.load().is_some();
        let previous = self.state();
        // A stale cache stays stale until a fetch succeeds
        self.set_state(match (had_table, previous) {
            (_, CacheState::Stale) => CacheState::Stale,
            (true, _) => CacheState::Refreshing,
            (false, _) => CacheState::Loading,
        });

        match self.fetch_table().await {
            Ok(table) => {
                let version = table.version();
                let entries = table.len();
                self.current.store(Some(Arc::new(table)));
                self.last_version.store(version, Ordering::Release);
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.set_state(CacheState::Ready);

                if previous == CacheState::Stale {
                    info!("Mount table cache recovered at version {}", version);
                }
                debug!("Published mount table version {} ({} entries)", version, entries);

                if let Some(ref metrics) = self.metrics {
                    metrics.refreshes_total.with_label_values(&["success"]).inc();
                    metrics.table_version.set(version as i64);
                    metrics.table_entries.set(entries as i64);
                }

                self.published.send_replace(version);
                Ok(version)
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(ref metrics) = self.metrics {
                    metrics.refreshes_total.with_label_values(&["failure"]).inc();
                }

                match self.current.load_full() {
                    Some(table) if table.age() > self.config.max_staleness() => {
                        if previous != CacheState::Stale {
                            warn!(
                                "Mount table version {} is {:?} old and refresh failed, serving stale routes: {}",
                                table.version(), table.age(), e
                            );
                        }
                        self.set_state(CacheState::Stale);
                    }
                    Some(table) => {
                        warn!(
                            "Mount table refresh failed ({} consecutive), keeping version {}: {}",
                            failures, table.version(), e
                        );
                        self.set_state(CacheState::Ready);
                    }
                    None => {
                        self.set_state(if previous == CacheState::Init {
                            CacheState::Init
                        } else {
                            CacheState::Loading
                        });
                        self.wake_waiters();
                    }
                }
                Err(e)
            }
        }
    }

    /// Drop the active table; a fresh load is required before serving again
    pub async fn reset(&self) {
        let _guard = self.refresh_lock.lock().await;
        self.current.store(None);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.set_state(CacheState::Init);
        if let Some(ref metrics) = self.metrics {
            metrics.table_entries.set(0);
        }
        self.wake_waiters();
        info!("Mount table cache reset");
    }

    /// Run refreshes on the configured interval and on store change notifications
    /// until `shutdown` fires.
    pub fn spawn_refresh_task(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.refresh_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            // Clones keep the generation last seen at construction, so changes
            // made between `start()` and this point still trigger a refresh
            let mut changes = self.changes.clone();
            info!(
                "Mount table refresh task started (interval {:?}, push notifications: {})",
                self.config.refresh_interval(),
                changes.is_some()
            );

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("Mount table refresh task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let _ = self.refresh().await;
                    }
                    changed = next_change(&mut changes) => {
                        if changed {
                            debug!("Metadata store changed, refreshing mount table");
                            let _ = self.refresh().await;
                        } else {
                            warn!("Metadata store change feed closed, falling back to polling");
                            changes = None;
                        }
                    }
                }
            }
            Ok(())
        })
    }

    async fn fetch_table(&self) -> Result<MountTable> {
        let fetch_timeout = self.config.fetch_timeout();
        let entries = retry_if(
            self.config.retry(),
            || {
                let store = self.store.clone();
                async move { timeouts::try_with_timeout(fetch_timeout, store.list_entries()).await }
            },
            FedNsError::is_retriable,
        )
        .await
        .map_err(|e| match e {
            FedNsError::Timeout => FedNsError::MetadataStoreUnavailable(format!(
                "fetch exceeded {:?}", fetch_timeout
            )),
            other => other,
        })?;

        let version = self.last_version.load(Ordering::Acquire) + 1;
        MountTable::builder()
            .default_subcluster(self.config.effective_default().cloned())
            .virtual_nodes(self.config.hash_ring_virtual_nodes)
            .version(version)
            .build(entries)
    }

    fn set_state(&self, state: CacheState) {
        self.state.store(state as u8, Ordering::Release);
        if let Some(ref metrics) = self.metrics {
            metrics.cache_state.set(state.as_metric());
        }
    }

    fn wake_waiters(&self) {
        self.published.send_modify(|_| {});
    }
}

/// Resolves when the store reports a change; `false` once the feed is closed.
/// Pends forever without a feed so `select!` falls back to the ticker.
async fn next_change(changes: &mut Option<watch::Receiver<u64>>) -> bool {
    match changes {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

#[async_trait::async_trait]
impl HealthChecker for MountTableCache {
    async fn check_health(&self) -> anyhow::Result<HealthCheckResult> {
        let state = self.state();
        let (status, message) = match state {
            CacheState::Ready | CacheState::Refreshing => {
                (HealthStatus::Healthy, format!("mount table cache {}", state))
            }
            CacheState::Stale => (
                HealthStatus::Degraded,
                "serving a mount table older than the staleness bound".to_string(),
            ),
            CacheState::Init | CacheState::Loading => {
                (HealthStatus::Unknown, format!("mount table cache {}", state))
            }
        };

        let mut result = HealthCheckResult::new(self.component_name(), status, message)
            .with_metric("consecutive_failures", self.consecutive_failures() as f64);
        if let Some(table) = self.snapshot() {
            result = result
                .with_metric("table_version", table.version() as f64)
                .with_metric("table_age_ms", table.age().as_millis() as f64)
                .with_metric("table_entries", table.len() as f64);
        }
        if state == CacheState::Stale {
            result = result.with_recommendation("check metadata store connectivity");
        }
        Ok(result)
    }

    fn component_name(&self) -> &str {
        "mount_table_cache"
    }
}
