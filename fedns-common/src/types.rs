use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// FedNS version information
pub const FEDNS_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Root of the federated namespace
pub const ROOT_PATH: &str = "/";

/// Path separator used by every subcluster
pub const PATH_SEPARATOR: char = '/';

/// Longest client-visible path accepted by the router
pub const MAX_PATH_LEN: usize = 4096;

/// Identifier of a storage subcluster (nameservice), e.g. `ns0`
pub type SubclusterId = String;

/// Monotonic version of a published mount table
pub type TableVersion = u64;

/// Timestamps in microseconds since UNIX epoch
pub type Timestamp = u64;

/// Get current timestamp in microseconds
pub fn now_micros() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// A concrete place a path lives: a subcluster and the path inside it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteLocation {
    pub subcluster: SubclusterId,
    pub remote_path: String,
}

impl RemoteLocation {
    pub fn new(subcluster: impl Into<SubclusterId>, remote_path: impl Into<String>) -> Self {
        Self {
            subcluster: subcluster.into(),
            remote_path: remote_path.into(),
        }
    }
}

impl fmt::Display for RemoteLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.subcluster, self.remote_path)
    }
}

/// Kind of client operation being routed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Read-only access (open, stat, list)
    Read,
    /// Creation of a new path
    Create,
    /// Mutation of an existing path (append, rename, setattr)
    Write,
    /// Removal; fans out to every destination of the mount
    Delete,
}

impl OperationKind {
    /// Whether the operation mutates the namespace
    pub fn is_write(&self) -> bool {
        !matches!(self, OperationKind::Read)
    }

    /// Whether the operation must reach every destination of a mount
    pub fn is_fan_out(&self) -> bool {
        matches!(self, OperationKind::Delete)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Read => "read",
            OperationKind::Create => "create",
            OperationKind::Write => "write",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read" | "open" | "getfilestatus" | "liststatus" => Ok(OperationKind::Read),
            "create" | "mkdirs" => Ok(OperationKind::Create),
            "write" | "append" | "rename" => Ok(OperationKind::Write),
            "delete" => Ok(OperationKind::Delete),
            other => Err(format!("unknown operation kind: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_kind_classification() {
        assert!(!OperationKind::Read.is_write());
        assert!(OperationKind::Create.is_write());
        assert!(OperationKind::Write.is_write());
        assert!(OperationKind::Delete.is_write());
        assert!(OperationKind::Delete.is_fan_out());
        assert!(!OperationKind::Create.is_fan_out());
    }

    #[test]
    fn test_operation_kind_parse() {
        assert_eq!("CREATE".parse::<OperationKind>().unwrap(), OperationKind::Create);
        assert_eq!("open".parse::<OperationKind>().unwrap(), OperationKind::Read);
        assert!("truncate".parse::<OperationKind>().is_err());
    }

    #[test]
    fn test_remote_location_display() {
        let loc = RemoteLocation::new("ns1", "/tmp/file");
        assert_eq!(loc.to_string(), "ns1->/tmp/file");
    }
}
