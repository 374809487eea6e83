//! pantry-core - Core library for Pantry
//!
//! This crate holds the data model and the optimistic-concurrency engine behind
//! the "global save" workflow: version comparison, batch conflict detection,
//! conflict resolution, batch commit with rollback, and the audit trail that
//! ties every decision to an operation id.

pub mod audit;
pub mod commit;
pub mod config;
pub mod detect;
pub mod error;
pub mod merge;
pub mod models;
pub mod resolve;
pub mod store;
pub mod version;

pub use audit::{AuditKind, AuditReceipt, AuditRecord, AuditSink, AuditTrailLinker};
pub use commit::{
    BatchCommitCoordinator, BatchOperation, BatchState, BulkOperation, BulkOutcome, CommitReport,
    ResolutionCommit, ResolveReport, SaveOutcome, SaveRequest,
};
pub use config::{EngineConfig, MissingEntityPolicy};
pub use detect::ConflictDetector;
pub use error::{Error, ItemError, Result};
pub use models::{EntityData, EntityKind, EntityRef, VersionToken};
pub use resolve::ResolutionEngine;
pub use store::{EntityStore, StoreError};
pub use version::{compare, VersionComparison, VersionStatus};
