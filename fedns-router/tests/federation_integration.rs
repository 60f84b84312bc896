use async_trait::async_trait;
use fedns_common::{
    FedNsError, HealthChecker, HealthStatus, OperationKind, RemoteLocation, Result, RouterConfig,
};
use fedns_router::{
    CacheState, DestinationOrder, MemoryMountStore, MountEntry, MountStore, MountTableCache,
    RequestContext, Resolver, SledMountStore,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// A subcluster namespace holding a flat set of file paths
struct Subcluster {
    id: String,
    files: Mutex<HashSet<String>>,
    up: AtomicBool,
}

impl Subcluster {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            files: Mutex::new(HashSet::new()),
            up: AtomicBool::new(true),
        })
    }

    fn check_up(&self) -> Result<()> {
        if self.up.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(FedNsError::unavailable(&self.id, "connection refused"))
        }
    }

    fn create(&self, path: &str) -> Result<()> {
        self.check_up()?;
        self.files.lock().unwrap().insert(path.to_string());
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        self.files.lock().unwrap().contains(path)
    }

    fn delete(&self, path: &str) -> Result<bool> {
        self.check_up()?;
        Ok(self.files.lock().unwrap().remove(path))
    }
}

/// The federated namespace as seen from a client of the router
struct Federation {
    subclusters: HashMap<String, Arc<Subcluster>>,
    store: Arc<MemoryMountStore>,
    resolver: Resolver,
}

impl Federation {
    async fn new(ids: &[&str], entries: Vec<MountEntry>, config: RouterConfig) -> Self {
        let subclusters = ids.iter().map(|id| (id.to_string(), Subcluster::new(id))).collect();
        let store = Arc::new(MemoryMountStore::with_entries(entries).await.unwrap());
        let cache = Arc::new(MountTableCache::new(store.clone(), config));
        cache.start().await.unwrap();
        Self {
            subclusters,
            store,
            resolver: Resolver::new(cache),
        }
    }

    fn ns(&self, id: &str) -> &Arc<Subcluster> {
        &self.subclusters[id]
    }

    fn target(&self, loc: &RemoteLocation) -> Arc<Subcluster> {
        self.subclusters[&loc.subcluster].clone()
    }

    async fn create(&self, path: &str) -> Result<RemoteLocation> {
        let resolution = self
            .resolver
            .resolve(path, OperationKind::Create, &RequestContext::new())
            .await?;
        let delivery = self
            .resolver
            .deliver(&resolution, |loc| {
                let ns = self.target(&loc);
                async move { ns.create(&loc.remote_path) }
            })
            .await?;
        Ok(delivery.served_by)
    }

    async fn delete(&self, path: &str) -> Result<usize> {
        let resolution = self
            .resolver
            .resolve(path, OperationKind::Delete, &RequestContext::new())
            .await?;
        let delivery = self
            .resolver
            .deliver(&resolution, |loc| {
                let ns = self.target(&loc);
                async move { ns.delete(&loc.remote_path) }
            })
            .await?;
        Ok(1 + delivery.also_applied.len())
    }

    async fn refresh(&self) {
        self.resolver.cache().refresh().await.unwrap();
    }
}

fn default_ns0() -> RouterConfig {
    RouterConfig {
        default_subcluster: Some("ns0".into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_create_through_default_subcluster() {
    let fed = Federation::new(&["ns0", "ns1"], vec![], default_ns0()).await;

    let served_by = fed.create("/tmp/file").await.unwrap();
    assert_eq!(served_by, RemoteLocation::new("ns0", "/tmp/file"));
    assert!(fed.ns("ns0").exists("/tmp/file"));
    assert!(!fed.ns("ns1").exists("/tmp/file"));
}

#[tokio::test]
async fn test_create_through_added_random_mount() {
    let fed = Federation::new(&["ns0", "ns1"], vec![], default_ns0()).await;

    fed.store
        .upsert(MountEntry::to_subclusters("/tmp-ns1", ["ns1"]).with_order(DestinationOrder::Random))
        .await
        .unwrap();
    fed.refresh().await;

    let served_by = fed.create("/tmp-ns1/file").await.unwrap();
    assert_eq!(served_by.subcluster, "ns1");
    assert!(fed.ns("ns1").exists("/tmp-ns1/file"));
    assert!(!fed.ns("ns0").exists("/tmp-ns1/file"));
}

#[tokio::test]
async fn test_longest_prefix_on_segment_boundaries() {
    let fed = Federation::new(
        &["ns0", "ns1", "ns2"],
        vec![
            MountEntry::to_subclusters("/a", ["ns1"]),
            MountEntry::new("/a/b", vec![RemoteLocation::new("ns2", "/data")]),
        ],
        default_ns0(),
    )
    .await;
    let ctx = RequestContext::new();

    let deep = fed.resolver.resolve("/a/b/c", OperationKind::Read, &ctx).await.unwrap();
    assert_eq!(deep.mount_point, "/a/b");
    assert_eq!(deep.candidates, vec![RemoteLocation::new("ns2", "/data/c")]);

    let sibling = fed.resolver.resolve("/a/bc", OperationKind::Read, &ctx).await.unwrap();
    assert_eq!(sibling.mount_point, "/a");
    assert_eq!(sibling.primary().unwrap().subcluster, "ns1");

    let other = fed.resolver.resolve("/abc", OperationKind::Read, &ctx).await.unwrap();
    assert!(other.is_default);
}

#[tokio::test]
async fn test_hash_order_is_deterministic_across_rebuilds() {
    let fed = Federation::new(
        &["ns0", "ns1", "ns2"],
        vec![MountEntry::to_subclusters("/h", ["ns0", "ns1", "ns2"])],
        RouterConfig::default(),
    )
    .await;
    let ctx = RequestContext::new();

    let mut primaries = HashMap::new();
    for i in 0..50 {
        let path = format!("/h/dir{}/file", i);
        let r = fed.resolver.resolve(&path, OperationKind::Create, &ctx).await.unwrap();
        primaries.insert(path, r.candidates.clone());
    }

    // A rebuilt table routes identically
    fed.store.upsert(MountEntry::to_subclusters("/unrelated", ["ns1"])).await.unwrap();
    fed.refresh().await;

    for (path, candidates) in &primaries {
        let r = fed.resolver.resolve(path, OperationKind::Create, &ctx).await.unwrap();
        assert_eq!(&r.candidates, candidates, "{} moved after rebuild", path);
        assert_eq!(r.table_version, 2);
    }

    // Files in one first-level directory stay together
    let a = fed.resolver.resolve("/h/dir7/a", OperationKind::Create, &ctx).await.unwrap();
    let b = fed.resolver.resolve("/h/dir7/sub/b", OperationKind::Create, &ctx).await.unwrap();
    assert_eq!(a.primary().unwrap().subcluster, b.primary().unwrap().subcluster);

    let spread: HashSet<_> = primaries.values().map(|c| c[0].subcluster.clone()).collect();
    assert!(spread.len() > 1);
}

#[tokio::test]
async fn test_random_order_spreads_primaries() {
    let fed = Federation::new(
        &["ns0", "ns1", "ns2"],
        vec![MountEntry::to_subclusters("/r", ["ns0", "ns1", "ns2"])
            .with_order(DestinationOrder::Random)],
        RouterConfig::default(),
    )
    .await;
    let ctx = RequestContext::new();

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..3000 {
        let r = fed.resolver.resolve("/r/file", OperationKind::Create, &ctx).await.unwrap();
        assert_eq!(r.candidates.len(), 3);
        *counts.entry(r.candidates[0].subcluster.clone()).or_default() += 1;
    }
    assert_eq!(counts.len(), 3);
    for (ns, count) in counts {
        assert!(count > 800, "{} was primary only {} times", ns, count);
    }
}

#[tokio::test]
async fn test_read_only_mount_rejects_writes() {
    let fed = Federation::new(
        &["ns0"],
        vec![MountEntry::to_subclusters("/archive", ["ns0"]).with_read_only(true)],
        RouterConfig::default(),
    )
    .await;

    assert!(matches!(
        fed.create("/archive/new").await,
        Err(FedNsError::ReadOnlyMount { .. })
    ));
    assert!(!fed.ns("ns0").exists("/archive/new"));
}

#[tokio::test]
async fn test_write_to_unavailable_destination() {
    let entries = vec![
        MountEntry::to_subclusters("/strict", ["ns0", "ns1"]).with_order(DestinationOrder::HashAll),
        MountEntry::to_subclusters("/tolerant", ["ns0", "ns1"])
            .with_order(DestinationOrder::HashAll)
            .with_fault_tolerant(true),
    ];
    let fed = Federation::new(&["ns0", "ns1"], entries, RouterConfig::default()).await;
    let ctx = RequestContext::new();

    let strict = fed.resolver.resolve("/strict/f", OperationKind::Create, &ctx).await.unwrap();
    let down = strict.candidates[0].subcluster.clone();
    fed.ns(&down).up.store(false, Ordering::SeqCst);
    assert!(matches!(
        fed.create("/strict/f").await,
        Err(FedNsError::DestinationUnavailable { .. })
    ));
    assert!(!fed.ns("ns0").exists("/strict/f") && !fed.ns("ns1").exists("/strict/f"));
    fed.ns(&down).up.store(true, Ordering::SeqCst);

    let tolerant = fed.resolver.resolve("/tolerant/f", OperationKind::Create, &ctx).await.unwrap();
    let head = tolerant.candidates[0].clone();
    let next = tolerant.candidates[1].clone();
    fed.ns(&head.subcluster).up.store(false, Ordering::SeqCst);

    let served_by = fed.create("/tolerant/f").await.unwrap();
    assert_eq!(served_by, next);
    assert!(fed.ns(&next.subcluster).exists("/tolerant/f"));
    assert!(!fed.ns(&head.subcluster).exists("/tolerant/f"));
}

#[tokio::test]
async fn test_fan_out_delete_reaches_every_subcluster() {
    let fed = Federation::new(
        &["ns0", "ns1", "ns2"],
        vec![MountEntry::to_subclusters("/all", ["ns0", "ns1", "ns2"])
            .with_order(DestinationOrder::HashAll)],
        RouterConfig::default(),
    )
    .await;
    for ns in ["ns0", "ns1", "ns2"] {
        fed.ns(ns).create("/all/f").unwrap();
    }

    assert_eq!(fed.delete("/all/f").await.unwrap(), 3);
    for ns in ["ns0", "ns1", "ns2"] {
        assert!(!fed.ns(ns).exists("/all/f"));
    }
}

#[tokio::test]
async fn test_stale_table_keeps_serving() {
    let config = RouterConfig {
        default_subcluster: Some("ns0".into()),
        refresh_interval_ms: 10,
        max_staleness_ms: 50,
        retry_max_attempts: 1,
        ..Default::default()
    };
    let fed = Federation::new(
        &["ns0", "ns1"],
        vec![MountEntry::to_subclusters("/x", ["ns1"])],
        config,
    )
    .await;
    let cache = fed.resolver.cache().clone();

    fed.store.set_available(false);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(cache.refresh().await.is_err());
    assert_eq!(cache.state(), CacheState::Stale);
    assert_eq!(cache.check_health().await.unwrap().status, HealthStatus::Degraded);

    // Metadata store failures never reach request callers
    let served_by = fed.create("/x/file").await.unwrap();
    assert_eq!(served_by.subcluster, "ns1");
}

#[tokio::test]
async fn test_reset_requires_fresh_load() {
    let fed = Federation::new(&["ns0"], vec![], default_ns0()).await;
    let cache = fed.resolver.cache().clone();

    cache.reset().await;
    assert!(matches!(
        fed.create("/tmp/file").await,
        Err(FedNsError::CacheNotReady(_))
    ));

    cache.start().await.unwrap();
    assert!(fed.create("/tmp/file").await.is_ok());
}

/// Store whose every fetch routes all mounts to a single subcluster that
/// alternates between fetches
struct FlippingStore {
    fetches: AtomicU64,
    mounts: usize,
}

#[async_trait]
impl MountStore for FlippingStore {
    async fn list_entries(&self) -> Result<Vec<MountEntry>> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst);
        let ns = if n % 2 == 0 { "even" } else { "odd" };
        // Yield midway so readers run while the fetch is in flight
        tokio::task::yield_now().await;
        Ok((0..self.mounts)
            .map(|i| MountEntry::to_subclusters(format!("/m{}", i), [ns]))
            .collect())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_refresh_never_exposes_a_partial_table() {
    let store = Arc::new(FlippingStore {
        fetches: AtomicU64::new(0),
        mounts: 20,
    });
    let cache = Arc::new(MountTableCache::new(store, RouterConfig::default()));
    cache.start().await.unwrap();
    let resolver = Arc::new(Resolver::new(cache.clone()));

    let writer = {
        let cache = cache.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                cache.refresh().await.unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let resolver = resolver.clone();
            tokio::spawn(async move {
                let ctx = RequestContext::new();
                let mut last_version = 0;
                for _ in 0..500 {
                    let table = resolver.cache().snapshot().unwrap();
                    assert!(table.version() >= last_version);
                    last_version = table.version();

                    // Version v was built from fetch v-1
                    let expected = if table.version() % 2 == 1 { "even" } else { "odd" };
                    for i in 0..20 {
                        let r = resolver
                            .resolve_in(&table, &format!("/m{}/f", i), OperationKind::Read, &ctx)
                            .unwrap();
                        assert_eq!(r.primary().unwrap().subcluster, expected);
                        assert_eq!(r.table_version, table.version());
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    writer.await.unwrap();
    for result in futures::future::join_all(readers).await {
        result.unwrap();
    }
    assert_eq!(cache.version(), Some(201));
}

#[tokio::test]
async fn test_sled_store_end_to_end() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SledMountStore::open(dir.path()).unwrap());
    store
        .upsert(MountEntry::new(
            "/user",
            vec![
                RemoteLocation::new("ns0", "/user"),
                RemoteLocation::new("ns1", "/federated/user"),
            ],
        ))
        .unwrap();

    let cache = Arc::new(MountTableCache::new(store.clone(), default_ns0()));
    cache.start().await.unwrap();
    let resolver = Resolver::new(cache.clone());
    let ctx = RequestContext::new();

    let r = resolver.resolve("/user/alice/data", OperationKind::Read, &ctx).await.unwrap();
    assert_eq!(r.candidates.len(), 2);
    let remote: HashSet<_> = r.candidates.iter().map(|c| c.remote_path.as_str()).collect();
    assert!(remote.contains("/user/alice/data"));
    assert!(remote.contains("/federated/user/alice/data"));

    assert!(store.remove("/user").unwrap());
    cache.refresh().await.unwrap();
    let r = resolver.resolve("/user/alice/data", OperationKind::Read, &ctx).await.unwrap();
    assert!(r.is_default);
}
