//! Error taxonomy for Memory Defrag.
//!
//! Three layers, from the bottom up:
//!
//! | Type | Raised by | Meaning |
//! |------|-----------|---------|
//! | [`StoreError`] | store adapters, process bridge | a backend call failed |
//! | [`ValidationError`] | [`crate::optimize`] | an approval set was rejected before any mutation |
//! | [`DefragError`] | everything public | the operation-level taxonomy callers match on |
//!
//! [`DefragError::severity`] separates failures that left the store
//! provably unchanged from the one condition that did not
//! ([`DefragError::IndeterminateState`]).

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Failure of a single Store Adapter call.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to connect to store at {path}: {message}")]
    Connection { path: PathBuf, message: String },

    #[error("store schema is not compatible: {0}")]
    IncompatibleSchema(String),

    #[error("required column missing: {0}")]
    MissingColumn(String),

    #[error("store is not connected")]
    NotConnected,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A write failed part-way and the backend rolled it back.
    #[error("write failed and was rolled back: {0}")]
    WriteFailed(String),

    /// A write failed and the backend could not undo it either.
    #[error("write failed ({write}); rollback also failed ({rollback})")]
    RollbackFailed { write: String, rollback: String },

    #[error("store integrity check failed: {0}")]
    Integrity(String),

    #[error("bridge process failed: {0}")]
    Bridge(String),

    #[error("bridge process timed out after {0:?} and was terminated")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Reasons an optimization request is rejected. Always raised before the
/// store is touched, so always safe to retry after fixing the input.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("no clusters have been approved for optimization")]
    NoApprovedClusters,

    #[error("approved cluster {0} is not part of this analysis")]
    UnknownCluster(Uuid),

    #[error("cluster {id} has {size} member(s); at least 2 are required")]
    InvalidClusterSize { id: Uuid, size: usize },

    #[error("cluster {0} has an empty synthesized merge")]
    EmptySynthesis(Uuid),

    #[error("potential data loss in cluster {cluster}: key terms missing from merged content: {}", missing.join(", "))]
    PotentialDataLoss { cluster: Uuid, missing: Vec<String> },

    #[error("cluster {cluster} references record {record_id} which is no longer in the store; re-run analysis")]
    StaleCluster { cluster: Uuid, record_id: String },
}

/// How bad a failure is for the store it touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Store is unchanged (or restored); the operation can be retried.
    Recoverable,
    /// Store state is unknown and needs operator attention.
    Fatal,
}

/// Operation-level error returned by the public API.
#[derive(Debug, Error)]
pub enum DefragError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("insufficient disk space: {required} bytes required, {available} available")]
    Resource { required: u64, available: u64 },

    /// The commit failed and every change was rolled back.
    #[error("transaction failed and was rolled back; store is unchanged: {0}")]
    Transaction(String),

    /// The commit failed and rollback failed too.
    #[error(
        "store state is indeterminate: commit failed ({write}) and rollback failed ({rollback}); \
         restore from backup {backup_id} manually"
    )]
    IndeterminateState {
        write: String,
        rollback: String,
        backup_id: Uuid,
    },

    #[error("external process error: {0}")]
    ExternalProcess(String),

    #[error("backup not found: {0}")]
    BackupNotFound(Uuid),

    #[error("{0} already in progress on this store")]
    Busy(&'static str),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backup catalog error: {0}")]
    Catalog(#[from] serde_json::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl From<StoreError> for DefragError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Connection { .. }
            | StoreError::IncompatibleSchema(_)
            | StoreError::MissingColumn(_)
            | StoreError::NotConnected => DefragError::Connection(err.to_string()),
            StoreError::Bridge(_) | StoreError::Timeout(_) => {
                DefragError::ExternalProcess(err.to_string())
            }
            StoreError::Integrity(msg) => DefragError::Integrity(msg),
            other => DefragError::Store(other),
        }
    }
}

impl DefragError {
    pub fn severity(&self) -> Severity {
        match self {
            DefragError::IndeterminateState { .. } => Severity::Fatal,
            _ => Severity::Recoverable,
        }
    }

    /// Validation failures never touched the store.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DefragError::Validation(_) | DefragError::Busy(_))
    }
}

pub type Result<T> = std::result::Result<T, DefragError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_maps_to_external_process() {
        let err: DefragError = StoreError::Timeout(Duration::from_secs(120)).into();
        assert!(matches!(err, DefragError::ExternalProcess(_)));
    }

    #[test]
    fn schema_errors_map_to_connection() {
        let err: DefragError = StoreError::IncompatibleSchema("no memories table".into()).into();
        assert!(matches!(err, DefragError::Connection(_)));
    }

    #[test]
    fn only_indeterminate_state_is_fatal() {
        let fatal = DefragError::IndeterminateState {
            write: "disk full".into(),
            rollback: "disk full".into(),
            backup_id: Uuid::new_v4(),
        };
        assert_eq!(fatal.severity(), Severity::Fatal);
        assert_eq!(
            DefragError::Transaction("x".into()).severity(),
            Severity::Recoverable
        );
    }

    #[test]
    fn data_loss_message_lists_terms() {
        let err = ValidationError::PotentialDataLoss {
            cluster: Uuid::nil(),
            missing: vec!["Geneva".into(), "2024".into()],
        };
        assert!(err.to_string().contains("Geneva, 2024"));
    }
}
