//! Immutable mount table with longest-prefix routing.
//!
//! A [`MountTable`] maps client path prefixes to one or more subcluster
//! destinations. Tables are built once, validated as a whole and never
//! mutated afterwards; a refresh builds a new table and publishes it.

use fedns_common::{
    now_micros, FedNsError, RemoteLocation, Result, SubclusterId, TableVersion, Timestamp, ROOT_PATH,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::order::{order_destinations, DestinationOrder, HashRing, RequestContext};
use crate::path;

/// Default virtual nodes per destination on a mount point's hash ring
pub const DEFAULT_VIRTUAL_NODES: usize = 100;

/// One routing rule, as held by the metadata store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEntry {
    /// Client-visible path prefix
    pub source_path: String,
    /// Subclusters and the root path inside each one
    pub destinations: Vec<RemoteLocation>,
    #[serde(default)]
    pub order: DestinationOrder,
    #[serde(default)]
    pub read_only: bool,
    /// Writes may fall back to later destinations when the first is unavailable
    #[serde(default)]
    pub fault_tolerant: bool,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub group: String,
    #[serde(default = "default_mode")]
    pub mode: u16,
    #[serde(default)]
    pub date_created: Timestamp,
    #[serde(default)]
    pub date_modified: Timestamp,
}

fn default_mode() -> u16 {
    0o755
}

impl MountEntry {
    /// Create an entry routing `source_path` to the given destinations
    pub fn new(source_path: impl Into<String>, destinations: Vec<RemoteLocation>) -> Self {
        let now = now_micros();
        Self {
            source_path: source_path.into(),
            destinations,
            order: DestinationOrder::default(),
            read_only: false,
            fault_tolerant: false,
            owner: String::new(),
            group: String::new(),
            mode: default_mode(),
            date_created: now,
            date_modified: now,
        }
    }

    /// Create an entry mapping `source_path` to the same path in each subcluster
    pub fn to_subclusters<I, S>(source_path: impl Into<String>, subclusters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SubclusterId>,
    {
        let source_path = source_path.into();
        let destinations = subclusters
            .into_iter()
            .map(|ns| RemoteLocation::new(ns, source_path.clone()))
            .collect();
        Self::new(source_path, destinations)
    }

    pub fn with_order(mut self, order: DestinationOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_fault_tolerant(mut self, fault_tolerant: bool) -> Self {
        self.fault_tolerant = fault_tolerant;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>, group: impl Into<String>, mode: u16) -> Self {
        self.owner = owner.into();
        self.group = group.into();
        self.mode = mode;
        self
    }

    /// Validate and canonicalize paths, rejecting entries that cannot route
    fn normalized(mut self) -> Result<Self> {
        self.source_path = path::normalize(&self.source_path).map_err(|e| {
            FedNsError::Construction(format!("mount source {:?}: {}", self.source_path, e))
        })?;

        if self.destinations.is_empty() {
            return Err(FedNsError::Construction(format!(
                "mount {} has no destinations", self.source_path
            )));
        }

        let mut seen = HashSet::with_capacity(self.destinations.len());
        for dest in &mut self.destinations {
            if dest.subcluster.trim().is_empty() {
                return Err(FedNsError::Construction(format!(
                    "mount {} has a destination without subcluster", self.source_path
                )));
            }
            dest.remote_path = path::normalize(&dest.remote_path).map_err(|e| {
                FedNsError::Construction(format!(
                    "mount {} destination {}: {}", self.source_path, dest.subcluster, e
                ))
            })?;
            if !seen.insert((dest.subcluster.clone(), dest.remote_path.clone())) {
                return Err(FedNsError::Construction(format!(
                    "mount {} lists {} twice", self.source_path, dest
                )));
            }
        }
        Ok(self)
    }
}

/// A validated entry together with its precomputed hash ring
#[derive(Debug, Clone)]
pub struct MountPoint {
    entry: MountEntry,
    ring: HashRing,
    is_default: bool,
}

impl MountPoint {
    fn new(entry: MountEntry, virtual_nodes: usize, is_default: bool) -> Self {
        let labels: Vec<String> = entry.destinations.iter().map(|d| d.to_string()).collect();
        let ring = HashRing::new(&labels, virtual_nodes);
        Self { entry, ring, is_default }
    }

    pub fn entry(&self) -> &MountEntry {
        &self.entry
    }

    pub fn source_path(&self) -> &str {
        &self.entry.source_path
    }

    /// Whether this is the synthetic catch-all for the default subcluster
    pub fn is_default(&self) -> bool {
        self.is_default
    }

    /// Concrete locations for `path`, in the entry's configured order
    pub fn locations_for(&self, path: &str) -> Vec<RemoteLocation> {
        self.entry
            .destinations
            .iter()
            .map(|dest| {
                RemoteLocation::new(
                    dest.subcluster.clone(),
                    path::substitute(&self.entry.source_path, &dest.remote_path, path),
                )
            })
            .collect()
    }

    /// Locations for `path` ordered by the entry's destination order
    pub fn ordered_locations(&self, path: &str, ctx: &RequestContext) -> Vec<RemoteLocation> {
        order_destinations(
            self.entry.order,
            &self.ring,
            &self.entry.source_path,
            path,
            self.locations_for(path),
            ctx,
        )
    }
}

/// Builder for [`MountTable`]
#[derive(Debug, Clone)]
pub struct MountTableBuilder {
    default_subcluster: Option<SubclusterId>,
    virtual_nodes: usize,
    version: TableVersion,
}

impl Default for MountTableBuilder {
    fn default() -> Self {
        Self {
            default_subcluster: None,
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
            version: 0,
        }
    }
}

impl MountTableBuilder {
    /// Subcluster receiving paths that no entry covers
    pub fn default_subcluster(mut self, subcluster: Option<SubclusterId>) -> Self {
        self.default_subcluster = subcluster;
        self
    }

    pub fn virtual_nodes(mut self, virtual_nodes: usize) -> Self {
        self.virtual_nodes = virtual_nodes.max(1);
        self
    }

    pub fn version(mut self, version: TableVersion) -> Self {
        self.version = version;
        self
    }

    /// Validate every entry and build the table; any invalid entry fails the whole build
    pub fn build(self, entries: impl IntoIterator<Item = MountEntry>) -> Result<MountTable> {
        let mut mounts = BTreeMap::new();

        for entry in entries {
            let entry = entry.normalized()?;
            if mounts.contains_key(&entry.source_path) {
                return Err(FedNsError::Construction(format!(
                    "duplicate mount point {}", entry.source_path
                )));
            }
            mounts.insert(
                entry.source_path.clone(),
                MountPoint::new(entry, self.virtual_nodes, false),
            );
        }

        let default_mount = match self.default_subcluster {
            Some(ns) if !ns.trim().is_empty() => {
                let entry = MountEntry::to_subclusters(ROOT_PATH, [ns]);
                Some(MountPoint::new(entry, self.virtual_nodes, true))
            }
            Some(_) => {
                return Err(FedNsError::Construction("blank default subcluster".into()));
            }
            None => None,
        };

        debug!(
            "Built mount table version {} with {} entries (default: {:?})",
            self.version,
            mounts.len(),
            default_mount.as_ref().map(|m| &m.entry.destinations[0].subcluster)
        );

        Ok(MountTable {
            mounts,
            default_mount,
            version: self.version,
            built_at: Instant::now(),
        })
    }
}

/// Immutable, versioned set of mount points
#[derive(Debug, Clone)]
pub struct MountTable {
    mounts: BTreeMap<String, MountPoint>,
    default_mount: Option<MountPoint>,
    version: TableVersion,
    built_at: Instant,
}

impl MountTable {
    pub fn builder() -> MountTableBuilder {
        MountTableBuilder::default()
    }

    /// Build a table with no default subcluster
    pub fn build(entries: impl IntoIterator<Item = MountEntry>) -> Result<Self> {
        Self::builder().build(entries)
    }

    /// Longest whole-segment prefix match for a normalized `path`.
    ///
    /// Falls back to the default subcluster when no entry covers the path.
    pub fn lookup(&self, path: &str) -> Option<&MountPoint> {
        for candidate in path::ancestors(path) {
            if let Some(mount) = self.mounts.get(candidate) {
                trace!("Path {} matched mount point {}", path, candidate);
                return Some(mount);
            }
        }
        trace!("Path {} has no mount point", path);
        self.default_mount.as_ref()
    }

    /// Names of the child segments below `path` that lead to mount points
    pub fn child_mount_points(&self, path: &str) -> Vec<String> {
        let children: BTreeSet<String> = self
            .mounts_below(path)
            .into_iter()
            .filter(|mount| mount.source_path() != path)
            .filter_map(|mount| path::first_component_under(path, mount.source_path()))
            .map(str::to_string)
            .collect();
        children.into_iter().collect()
    }

    /// Every entry whose source path lies at or below `path`
    pub fn entries_under(&self, path: &str) -> Vec<&MountEntry> {
        self.mounts_below(path).into_iter().map(MountPoint::entry).collect()
    }

    fn mounts_below(&self, path: &str) -> Vec<&MountPoint> {
        // Keys sharing a string prefix are contiguous in the map
        self.mounts
            .range::<str, _>((std::ops::Bound::Included(path), std::ops::Bound::Unbounded))
            .take_while(|(key, _)| path == ROOT_PATH || key.starts_with(path))
            .filter(|(key, _)| path::is_segment_prefix(path, key))
            .map(|(_, mount)| mount)
            .collect()
    }

    /// All entries ordered by source path
    pub fn entries(&self) -> impl Iterator<Item = &MountEntry> {
        self.mounts.values().map(MountPoint::entry)
    }

    pub fn get(&self, source_path: &str) -> Option<&MountEntry> {
        self.mounts.get(source_path).map(MountPoint::entry)
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    pub fn default_subcluster(&self) -> Option<&SubclusterId> {
        self.default_mount
            .as_ref()
            .map(|m| &m.entry.destinations[0].subcluster)
    }

    pub fn version(&self) -> TableVersion {
        self.version
    }

    /// Time since this table was built
    pub fn age(&self) -> Duration {
        self.built_at.elapsed()
    }
}
