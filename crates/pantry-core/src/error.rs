//! Error types for pantry-core
//!
//! A version conflict is not an error: detection and save report conflicts as
//! ordinary results. [`Error`] covers failures fatal to a whole batch;
//! [`ItemError`] covers failures collected per item.

use std::time::Duration;

use thiserror::Error;

use crate::models::{EntityKind, EntityRef, VersionToken};
use crate::store::StoreError;

/// Result type alias using pantry-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort a whole detection, resolution or commit
#[derive(Error, Debug)]
pub enum Error {
    /// Storage could not be reached while classifying the batch
    #[error("Conflict detection failed: {0}")]
    Detection(#[source] StoreError),

    /// The caller cancelled before any write happened
    #[error("Operation {0} was cancelled")]
    Cancelled(String),

    /// The batch operation was driven through an illegal state change
    #[error("Invalid transition for operation {operation_id}: {from} -> {to}")]
    InvalidTransition {
        operation_id: String,
        from: &'static str,
        to: &'static str,
    },

    /// The first write failed; nothing was applied
    #[error("Storage write failed for {entity}: {source}")]
    StorageWriteFailure {
        operation_id: String,
        entity: EntityRef,
        #[source]
        source: StoreError,
    },

    /// A write failed after earlier writes landed; those were reverted
    #[error("Commit failed at {entity}; {reverted} earlier write(s) rolled back: {source}")]
    CommitRolledBack {
        operation_id: String,
        entity: EntityRef,
        reverted: usize,
        #[source]
        source: StoreError,
    },

    /// Compensation failed; the store may hold a mix of old and new data
    #[error("Rollback failed for operation {operation_id}; manual intervention required for {}", format_refs(.unreverted))]
    RollbackFailed {
        operation_id: String,
        unreverted: Vec<EntityRef>,
        reason: String,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Some writes reached the store before this failure.
    #[must_use]
    pub const fn is_partial_write(&self) -> bool {
        matches!(self, Self::CommitRolledBack { .. } | Self::RollbackFailed { .. })
    }

    /// The store may be in a mixed state that only an operator can repair.
    #[must_use]
    pub const fn requires_manual_intervention(&self) -> bool {
        matches!(self, Self::RollbackFailed { .. })
    }

    /// Operation the failure belongs to, when known.
    #[must_use]
    pub fn operation_id(&self) -> Option<&str> {
        match self {
            Self::Cancelled(operation_id)
            | Self::InvalidTransition { operation_id, .. }
            | Self::StorageWriteFailure { operation_id, .. }
            | Self::CommitRolledBack { operation_id, .. }
            | Self::RollbackFailed { operation_id, .. } => Some(operation_id),
            Self::Detection(_) | Self::Serialization(_) => None,
        }
    }

    /// Stable machine-readable code for API responses
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Detection(_) => "DETECTION_FAILED",
            Self::Cancelled(_) => "CANCELLED",
            Self::InvalidTransition { .. } => "INVALID_STATE",
            Self::StorageWriteFailure { .. } => "STORAGE_WRITE_FAILED",
            Self::CommitRolledBack { .. } => "COMMIT_ROLLED_BACK",
            Self::RollbackFailed { .. } => "MIXED_STATE",
            Self::Serialization(_) => "SERIALIZATION",
        }
    }
}

/// Failure of a single item; siblings keep going
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ItemError {
    #[error("attempt_merge requires both clientData and serverData")]
    MissingMergeInputs,

    #[error("override_with_client requires clientData")]
    MissingClientData,

    #[error("Unknown merge strategy: {0}")]
    UnknownMergeStrategy(String),

    #[error("Unknown resolution strategy: {0}")]
    UnknownResolutionStrategy(String),

    #[error("Entity not found on server: {0}")]
    EntityNotFound(EntityRef),

    #[error("Expected {expected} data, got {found}")]
    KindMismatch {
        expected: EntityKind,
        found: EntityKind,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Version changed before write (expected {expected}, found {current})")]
    StaleAtCommit {
        expected: VersionToken,
        current: VersionToken,
    },
}

impl ItemError {
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MissingMergeInputs => "MISSING_MERGE_INPUTS",
            Self::MissingClientData => "MISSING_CLIENT_DATA",
            Self::UnknownMergeStrategy(_) => "UNKNOWN_MERGE_STRATEGY",
            Self::UnknownResolutionStrategy(_) => "UNKNOWN_RESOLUTION_STRATEGY",
            Self::EntityNotFound(_) => "ENTITY_NOT_FOUND",
            Self::KindMismatch { .. } => "KIND_MISMATCH",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::StaleAtCommit { .. } => "VERSION_CONFLICT",
        }
    }
}

impl From<StoreError> for ItemError {
    fn from(value: StoreError) -> Self {
        Self::Storage(value.to_string())
    }
}

fn format_refs(refs: &[EntityRef]) -> String {
    refs.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
