//! Public entry point: path + operation to an ordered destination list

use fedns_common::{
    FedNsError, OperationKind, RemoteLocation, Result, SubclusterId, TableVersion,
};
use serde::Serialize;
use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::cache::MountTableCache;
use crate::metrics::RouterMetrics;
use crate::mount_table::MountTable;
use crate::order::{DestinationOrder, RequestContext};
use crate::path;

/// Outcome of resolving one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionResult {
    /// Normalized client path
    pub path: String,
    pub operation: OperationKind,
    /// Source path of the matched mount ("/" for the default subcluster)
    pub mount_point: String,
    /// Destinations in the order they should be attempted
    pub candidates: Vec<RemoteLocation>,
    pub order: DestinationOrder,
    pub read_only: bool,
    pub fault_tolerant: bool,
    /// Matched the synthetic default-subcluster entry
    pub is_default: bool,
    pub table_version: TableVersion,
}

impl ResolutionResult {
    /// Destination a single-target operation goes to
    pub fn primary(&self) -> Option<&RemoteLocation> {
        self.candidates.first()
    }

    /// Whether delivery must reach every candidate
    pub fn is_fan_out(&self) -> bool {
        self.operation.is_fan_out() && self.candidates.len() > 1
    }

    /// Whether delivery may move past the first candidate
    pub fn allows_fallback(&self) -> bool {
        !self.operation.is_write() || self.fault_tolerant
    }
}

/// Result of driving a resolution through the transport
#[derive(Debug)]
pub struct Delivery<T> {
    /// Value returned by the destination that served the request
    pub value: T,
    pub served_by: RemoteLocation,
    /// Number of destinations attempted
    pub attempted: usize,
    /// Further destinations that applied a fan-out operation
    pub also_applied: Vec<RemoteLocation>,
    /// Destinations that failed along the way
    pub failures: Vec<(RemoteLocation, FedNsError)>,
    /// `served_by` is not the first candidate
    pub fell_back: bool,
}

/// Resolves client paths against the mount table cache
pub struct Resolver {
    cache: Arc<MountTableCache>,
    local_subcluster: Option<SubclusterId>,
    metrics: Option<Arc<RouterMetrics>>,
}

impl Resolver {
    pub fn new(cache: Arc<MountTableCache>) -> Self {
        Self::with_metrics(cache, None)
    }

    pub fn with_metrics(cache: Arc<MountTableCache>, metrics: Option<Arc<RouterMetrics>>) -> Self {
        let local_subcluster = cache.config().local_subcluster.clone();
        Self { cache, local_subcluster, metrics }
    }

    pub fn cache(&self) -> &Arc<MountTableCache> {
        &self.cache
    }

    /// Resolve `path` for `operation`.
    ///
    /// Reads the current table exactly once. Only waits when the initial load
    /// is still in progress.
    #[instrument(skip(self, ctx), fields(op = %operation))]
    pub async fn resolve(
        &self,
        path: &str,
        operation: OperationKind,
        ctx: &RequestContext,
    ) -> Result<ResolutionResult> {
        let table = match self.cache.snapshot() {
            Some(table) => table,
            None => self.cache.wait_for_table().await?,
        };
        self.resolve_in(&table, path, operation, ctx)
    }

    /// Resolve without waiting; fails with `CacheNotReady` if no table is loaded
    pub fn try_resolve(
        &self,
        path: &str,
        operation: OperationKind,
        ctx: &RequestContext,
    ) -> Result<ResolutionResult> {
        let table = self
            .cache
            .snapshot()
            .ok_or_else(|| FedNsError::CacheNotReady(self.cache.state().to_string()))?;
        self.resolve_in(&table, path, operation, ctx)
    }

    /// Resolve against a specific table
    pub fn resolve_in(
        &self,
        table: &MountTable,
        path: &str,
        operation: OperationKind,
        ctx: &RequestContext,
    ) -> Result<ResolutionResult> {
        let _timer = self.metrics.as_ref().map(|m| m.resolution_duration.start_timer());
        let result = self.resolve_uncounted(table, path, operation, ctx);

        if let Some(ref metrics) = self.metrics {
            let outcome = match &result {
                Ok(_) => "ok",
                Err(FedNsError::PathNotResolved(_)) => "not_resolved",
                Err(FedNsError::ReadOnlyMount { .. }) => "read_only",
                Err(FedNsError::InvalidPath(_)) => "invalid_path",
                Err(_) => "error",
            };
            metrics
                .resolutions_total
                .with_label_values(&[operation.as_str(), outcome])
                .inc();
        }
        result
    }

    fn resolve_uncounted(
        &self,
        table: &MountTable,
        path: &str,
        operation: OperationKind,
        ctx: &RequestContext,
    ) -> Result<ResolutionResult> {
        let path = path::normalize(path)?;
        let mount = table
            .lookup(&path)
            .ok_or_else(|| FedNsError::PathNotResolved(path.clone()))?;
        let entry = mount.entry();

        if entry.read_only && operation.is_write() {
            return Err(FedNsError::ReadOnlyMount {
                mount: entry.source_path.clone(),
                path,
            });
        }

        let ctx = match (&ctx.locality, &self.local_subcluster) {
            (None, Some(local)) => Cow::Owned(ctx.clone().with_locality(local.clone())),
            _ => Cow::Borrowed(ctx),
        };
        let candidates = mount.ordered_locations(&path, &ctx);

        debug!(
            "Resolved {} {} via {} (v{}) to {}",
            operation,
            path,
            entry.source_path,
            table.version(),
            candidates.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(", ")
        );

        Ok(ResolutionResult {
            path,
            operation,
            mount_point: entry.source_path.clone(),
            candidates,
            order: entry.order,
            read_only: entry.read_only,
            fault_tolerant: entry.fault_tolerant,
            is_default: mount.is_default(),
            table_version: table.version(),
        })
    }

    /// Drive `attempt` over the candidates of `resolution` following the
    /// fallback rules for its operation.
    ///
    /// `attempt` performs the network call to one destination; a retriable
    /// error (e.g. `DestinationUnavailable`) lets delivery move on where the
    /// operation permits it.
    pub async fn deliver<T, F, Fut>(
        &self,
        resolution: &ResolutionResult,
        mut attempt: F,
    ) -> Result<Delivery<T>>
    where
        F: FnMut(RemoteLocation) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if resolution.is_fan_out() {
            return self.deliver_all(resolution, attempt).await;
        }

        let limit = if resolution.allows_fallback() { resolution.candidates.len() } else { 1 };
        let mut failures = Vec::new();

        for candidate in resolution.candidates.iter().take(limit) {
            match attempt(candidate.clone()).await {
                Ok(value) => {
                    if !failures.is_empty() {
                        debug!(
                            "{} {} served by {} after {} failures",
                            resolution.operation, resolution.path, candidate, failures.len()
                        );
                        if let Some(ref metrics) = self.metrics {
                            metrics
                                .fallbacks_total
                                .with_label_values(&[resolution.operation.as_str()])
                                .inc();
                        }
                    }
                    return Ok(Delivery {
                        value,
                        served_by: candidate.clone(),
                        attempted: failures.len() + 1,
                        also_applied: Vec::new(),
                        fell_back: !failures.is_empty(),
                        failures,
                    });
                }
                Err(e) if e.is_retriable() && limit > 1 => {
                    warn!("{} {} failed on {}: {}", resolution.operation, resolution.path, candidate, e);
                    failures.push((candidate.clone(), e));
                }
                Err(e) => return Err(e),
            }
        }

        Err(FedNsError::AllDestinationsFailed {
            path: resolution.path.clone(),
            attempts: failures.len(),
        })
    }

    async fn deliver_all<T, F, Fut>(
        &self,
        resolution: &ResolutionResult,
        mut attempt: F,
    ) -> Result<Delivery<T>>
    where
        F: FnMut(RemoteLocation) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut served: Option<(RemoteLocation, T)> = None;
        let mut also_applied = Vec::new();
        let mut failures = Vec::new();

        for candidate in &resolution.candidates {
            match attempt(candidate.clone()).await {
                Ok(value) if served.is_none() => served = Some((candidate.clone(), value)),
                Ok(_) => also_applied.push(candidate.clone()),
                Err(e) => {
                    warn!("{} {} failed on {}: {}", resolution.operation, resolution.path, candidate, e);
                    failures.push((candidate.clone(), e));
                }
            }
        }

        let attempted = resolution.candidates.len();
        match served {
            Some((served_by, value)) => Ok(Delivery {
                fell_back: resolution.primary() != Some(&served_by),
                value,
                served_by,
                attempted,
                also_applied,
                failures,
            }),
            None => match failures.into_iter().map(|(_, e)| e).find(|e| !e.is_retriable()) {
                Some(fatal) => Err(fatal),
                None => Err(FedNsError::AllDestinationsFailed {
                    path: resolution.path.clone(),
                    attempts: attempted,
                }),
            },
        }
    }
}
