//! Destination ordering for mount points with several subclusters
//!
//! The variant set is closed, so ordering is a single `match` over
//! [`DestinationOrder`] instead of a trait object per policy. Every variant
//! returns a permutation of its input: nothing is dropped or duplicated.

use fedns_common::{RemoteLocation, SubclusterId};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::trace;
use xxhash_rust::xxh3::xxh3_64;

use crate::path;

/// Policy choosing among the destinations of one mount point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DestinationOrder {
    /// Consistent hash of the first-level entry below the mount
    Hash,
    /// Caller's colocated subcluster first, then `Hash`
    Local,
    /// Uniform shuffle per call
    Random,
    /// Consistent hash of the full path, every destination returned
    HashAll,
    /// Most available capacity first
    Space,
}

impl Default for DestinationOrder {
    fn default() -> Self {
        DestinationOrder::Hash
    }
}

impl DestinationOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationOrder::Hash => "HASH",
            DestinationOrder::Local => "LOCAL",
            DestinationOrder::Random => "RANDOM",
            DestinationOrder::HashAll => "HASH_ALL",
            DestinationOrder::Space => "SPACE",
        }
    }
}

impl fmt::Display for DestinationOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DestinationOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "HASH" => Ok(DestinationOrder::Hash),
            "LOCAL" => Ok(DestinationOrder::Local),
            "RANDOM" => Ok(DestinationOrder::Random),
            "HASH_ALL" => Ok(DestinationOrder::HashAll),
            "SPACE" => Ok(DestinationOrder::Space),
            other => Err(format!("unknown destination order: {}", other)),
        }
    }
}

/// Per-request hints supplied by the transport layer
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Subcluster colocated with the caller
    pub locality: Option<SubclusterId>,
    /// Available capacity reported per subcluster, in bytes
    pub available_space: HashMap<SubclusterId, u64>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_locality(mut self, subcluster: impl Into<SubclusterId>) -> Self {
        self.locality = Some(subcluster.into());
        self
    }

    pub fn with_available_space(mut self, subcluster: impl Into<SubclusterId>, bytes: u64) -> Self {
        self.available_space.insert(subcluster.into(), bytes);
        self
    }
}

/// Consistent hash ring over the destinations of one mount point.
///
/// Points are stored sorted by hash and refer to destinations by index, so
/// the ring is a flat arena built once per table.
#[derive(Debug, Clone)]
pub struct HashRing {
    points: Vec<(u64, usize)>,
    members: usize,
}

impl HashRing {
    pub fn new(labels: &[String], virtual_nodes: usize) -> Self {
        let virtual_nodes = virtual_nodes.max(1);
        let mut points = Vec::with_capacity(labels.len() * virtual_nodes);
        for (idx, label) in labels.iter().enumerate() {
            for vnode in 0..virtual_nodes {
                let key = format!("{}#{}", label, vnode);
                points.push((xxh3_64(key.as_bytes()), idx));
            }
        }
        points.sort_unstable();
        Self {
            points,
            members: labels.len(),
        }
    }

    /// Destination indices in ring order starting at the owner of `key`
    pub fn walk(&self, key: &str) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.members);
        if self.points.is_empty() {
            return order;
        }

        let hash = xxh3_64(key.as_bytes());
        let start = self.points.partition_point(|(point, _)| *point < hash);
        let mut seen = vec![false; self.members];

        for offset in 0..self.points.len() {
            let (_, idx) = self.points[(start + offset) % self.points.len()];
            if !seen[idx] {
                seen[idx] = true;
                order.push(idx);
                if order.len() == self.members {
                    break;
                }
            }
        }
        order
    }

    pub fn members(&self) -> usize {
        self.members
    }
}

/// Order `locations` (already substituted for `path`) according to `order`.
///
/// `locations` must be parallel to the ring's members.
pub fn order_destinations(
    order: DestinationOrder,
    ring: &HashRing,
    mount: &str,
    path: &str,
    locations: Vec<RemoteLocation>,
    ctx: &RequestContext,
) -> Vec<RemoteLocation> {
    if locations.len() <= 1 {
        return locations;
    }
    debug_assert_eq!(ring.members(), locations.len());

    let ordered = match order {
        DestinationOrder::Hash => permute(locations, &ring.walk(&first_level_key(mount, path))),
        DestinationOrder::HashAll => permute(locations, &ring.walk(path)),
        DestinationOrder::Random => {
            let mut locations = locations;
            locations.shuffle(&mut rand::thread_rng());
            locations
        }
        DestinationOrder::Local => {
            let mut hashed = permute(locations, &ring.walk(&first_level_key(mount, path)));
            if let Some(local) = ctx.locality.as_deref() {
                if let Some(pos) = hashed.iter().position(|loc| loc.subcluster == local) {
                    let preferred = hashed.remove(pos);
                    hashed.insert(0, preferred);
                }
            }
            hashed
        }
        DestinationOrder::Space => {
            let mut hashed = permute(locations, &ring.walk(&first_level_key(mount, path)));
            // Stable sort keeps hash order among equal capacities
            hashed.sort_by(|a, b| {
                let space_a = ctx.available_space.get(&a.subcluster).copied().unwrap_or(0);
                let space_b = ctx.available_space.get(&b.subcluster).copied().unwrap_or(0);
                space_b.cmp(&space_a)
            });
            hashed
        }
    };

    trace!(
        "Ordered {} destinations for {} with {}: primary {}",
        ordered.len(), path, order, ordered[0]
    );
    ordered
}

/// Hash key that keeps a whole first-level subtree on one destination
fn first_level_key(mount: &str, path: &str) -> String {
    match path::first_component_under(mount, path) {
        Some(component) if mount == "/" => format!("/{}", component),
        Some(component) => format!("{}/{}", mount, component),
        None => mount.to_string(),
    }
}

fn permute(locations: Vec<RemoteLocation>, order: &[usize]) -> Vec<RemoteLocation> {
    let mut slots: Vec<Option<RemoteLocation>> = locations.into_iter().map(Some).collect();
    order.iter().filter_map(|&idx| slots[idx].take()).collect()
}
