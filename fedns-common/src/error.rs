use std::time::Duration;
use thiserror::Error;
use crate::types::SubclusterId;

/// Main error type for FedNS
#[derive(Error, Debug)]
pub enum FedNsError {
    #[error("Path not resolved: {0}")]
    PathNotResolved(String),

    #[error("Mount point {mount} is read only, cannot write {path}")]
    ReadOnlyMount { mount: String, path: String },

    #[error("Subcluster {subcluster} unavailable: {reason}")]
    DestinationUnavailable { subcluster: SubclusterId, reason: String },

    #[error("All {attempts} destinations failed for {path}")]
    AllDestinationsFailed { path: String, attempts: usize },

    #[error("Metadata store unavailable: {0}")]
    MetadataStoreUnavailable(String),

    #[error("Invalid mount table: {0}")]
    Construction(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Mount table cache not ready (state {0})")]
    CacheNotReady(String),

    #[error("Initial mount table load did not finish within {0:?}")]
    StartupTimeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout error")]
    Timeout,

    #[error("Other error: {0}")]
    Other(String),
}

/// Coarse classification the transport layer maps onto its own status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NotFound,
    Forbidden,
    Unavailable,
    Invalid,
    Internal,
}

impl FedNsError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FedNsError::PathNotResolved(_) => ErrorClass::NotFound,
            FedNsError::ReadOnlyMount { .. } => ErrorClass::Forbidden,
            FedNsError::DestinationUnavailable { .. }
            | FedNsError::AllDestinationsFailed { .. }
            | FedNsError::MetadataStoreUnavailable(_)
            | FedNsError::CacheNotReady(_)
            | FedNsError::Timeout => ErrorClass::Unavailable,
            FedNsError::InvalidPath(_)
            | FedNsError::Construction(_)
            | FedNsError::Config(_) => ErrorClass::Invalid,
            _ => ErrorClass::Internal,
        }
    }

    /// Whether retrying the same call (or the next candidate) may succeed
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            FedNsError::DestinationUnavailable { .. }
                | FedNsError::MetadataStoreUnavailable(_)
                | FedNsError::Timeout
        )
    }

    pub fn unavailable(subcluster: impl Into<SubclusterId>, reason: impl Into<String>) -> Self {
        FedNsError::DestinationUnavailable {
            subcluster: subcluster.into(),
            reason: reason.into(),
        }
    }
}

impl From<bincode::Error> for FedNsError {
    fn from(error: bincode::Error) -> Self {
        FedNsError::Serialization(error.to_string())
    }
}

impl From<serde_json::Error> for FedNsError {
    fn from(error: serde_json::Error) -> Self {
        FedNsError::Serialization(error.to_string())
    }
}

impl From<config::ConfigError> for FedNsError {
    fn from(error: config::ConfigError) -> Self {
        FedNsError::Config(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FedNsError>;
