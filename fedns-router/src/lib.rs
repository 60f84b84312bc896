//! FedNS Router Library
//!
//! Resolves client paths in a federated namespace to the subcluster(s) that
//! hold them, keeping an in-memory mount table in sync with a metadata store.

pub mod path;
pub mod order;
pub mod mount_table;
pub mod store;
pub mod cache;
pub mod resolver;
pub mod metrics;

pub use crate::cache::{CacheState, MountTableCache};
pub use crate::metrics::RouterMetrics;
pub use crate::mount_table::{MountEntry, MountPoint, MountTable, MountTableBuilder};
pub use crate::order::{DestinationOrder, RequestContext};
pub use crate::resolver::{Delivery, ResolutionResult, Resolver};
pub use crate::store::{MemoryMountStore, MountStore, SharedSledMountStore, SledMountStore};
