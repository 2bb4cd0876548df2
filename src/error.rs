//! Error types for the Database operator

use std::time::Duration;

use thiserror::Error;

use crate::controller::queue::RetryKind;
use crate::store::StoreError;

/// Errors that can occur while reconciling a Database
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error outside the store layer (events, client setup)
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Resource store error while reading or mutating cluster state
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The status write lost an optimistic-concurrency race
    #[error("Status of {0} changed during reconciliation")]
    StatusConflict(String),

    /// The requested storage size is smaller than the bound volume
    #[error("Storage cannot shrink from {current} to {requested}")]
    StorageShrink { current: String, requested: String },

    /// The storage class of an existing volume cannot be changed
    #[error("Storage class cannot change from {current} to {requested}")]
    StorageClassChange { current: String, requested: String },

    /// External cleanup has not finished yet
    #[error("Cleanup pending: {0}")]
    CleanupPending(String),

    /// The reconciliation attempt exceeded its deadline
    #[error("Reconciliation timed out after {0:?}")]
    Timeout(Duration),

    /// The reconciliation attempt panicked
    #[error("Reconciliation panicked: {0}")]
    Panicked(String),

    /// Invalid operator configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type for operator operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// How the work queue should schedule the next attempt for this error
    pub fn retry_kind(&self) -> RetryKind {
        match self {
            Error::StatusConflict(_) => RetryKind::Immediate,
            Error::Store(StoreError::Forbidden(_)) => RetryKind::Slow,
            Error::KubeError(kube::Error::Api(e)) if e.code == 403 => RetryKind::Slow,
            _ => RetryKind::Normal,
        }
    }

    /// Check if retrying without a spec change can succeed
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            Error::Store(StoreError::Invalid(_))
                | Error::StorageShrink { .. }
                | Error::StorageClassChange { .. }
                | Error::ConfigError(_)
        )
    }

    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::Store(StoreError::Conflict(_)) => "conflict",
            Error::Store(StoreError::Forbidden(_)) => "forbidden",
            Error::Store(StoreError::Invalid(_)) => "invalid",
            Error::Store(_) => "store",
            Error::StatusConflict(_) => "status_conflict",
            Error::StorageShrink { .. } | Error::StorageClassChange { .. } => "validation",
            Error::CleanupPending(_) => "cleanup",
            Error::Timeout(_) => "timeout",
            Error::Panicked(_) => "panic",
            Error::ConfigError(_) => "config",
        }
    }
}
