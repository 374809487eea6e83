//! Batch commit coordination.
//!
//! A [`BatchOperation`] walks the global-save state machine:
//!
//! ```text
//! Idle -> Detecting -> Clean -> Committing -> Committed
//!                   -> HasConflicts -> AwaitingResolution -> Refreshing -> Idle
//!                                                         -> Overriding -> Committing
//! any non-terminal state -> Failed
//! ```
//!
//! Writes are applied one at a time. Right before each write the entity's
//! current token is read again and compared with the token the write was
//! computed against; a mismatch aborts the commit, reverts earlier writes and
//! reports the entity as a conflict. A failed write after earlier writes
//! landed reverts them too, so the batch either fully applies or is reported
//! as reverted (or, when the revert itself fails, as mixed).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::{AuditReceipt, AuditSink, AuditTrailLinker};
use crate::config::EngineConfig;
use crate::detect::{conflict_item, ConflictDetector};
use crate::error::{Error, ItemError, Result};
use crate::models::{
    ConflictDetectionResult, ConflictItem, DetectionFailure, EntityData, EntityKind, EntityRef,
    EntitySnapshot, ResolutionRequest, ResolutionResult, StagedBatch, StagedEntity, VersionToken,
    VersionedEntityRef,
};
use crate::resolve::ResolutionEngine;
use crate::store::{EntityStore, StoreError};
use crate::version::compare;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchState {
    Idle,
    Detecting,
    Clean,
    HasConflicts,
    AwaitingResolution,
    Refreshing,
    Overriding,
    Committing,
    Committed,
    Failed,
}

impl BatchState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Detecting => "DETECTING",
            Self::Clean => "CLEAN",
            Self::HasConflicts => "HAS_CONFLICTS",
            Self::AwaitingResolution => "AWAITING_RESOLUTION",
            Self::Refreshing => "REFRESHING",
            Self::Overriding => "OVERRIDING",
            Self::Committing => "COMMITTING",
            Self::Committed => "COMMITTED",
            Self::Failed => "FAILED",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Failed)
    }

    /// Whether `next` is a legal successor of this state.
    ///
    /// `Committing -> HasConflicts` covers a token that moved between
    /// detection and the write.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        if matches!(next, Self::Failed) {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Self::Idle, Self::Detecting)
                | (Self::Detecting, Self::Clean | Self::HasConflicts)
                | (Self::Clean | Self::Overriding, Self::Committing)
                | (Self::Committing, Self::Committed | Self::HasConflicts)
                | (Self::HasConflicts, Self::AwaitingResolution)
                | (Self::AwaitingResolution, Self::Refreshing | Self::Overriding)
                | (Self::Refreshing, Self::Idle)
        )
    }
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one global save, keyed by its operation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOperation {
    operation_id: String,
    user_id: String,
    state: BatchState,
    history: Vec<BatchState>,
    audit_ids: Vec<String>,
    accepting_writes: bool,
}

impl BatchOperation {
    pub fn new(operation_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::starting_at(operation_id, user_id, BatchState::Idle)
    }

    /// An operation whose conflicts were already reported to the user.
    pub fn awaiting_resolution(
        operation_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self::starting_at(operation_id, user_id, BatchState::AwaitingResolution)
    }

    fn starting_at(
        operation_id: impl Into<String>,
        user_id: impl Into<String>,
        state: BatchState,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            user_id: user_id.into(),
            state,
            history: vec![state],
            audit_ids: Vec::new(),
            accepting_writes: true,
        }
    }

    #[must_use]
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub const fn state(&self) -> BatchState {
        self.state
    }

    /// Every state visited, oldest first.
    #[must_use]
    pub fn history(&self) -> &[BatchState] {
        &self.history
    }

    #[must_use]
    pub fn audit_ids(&self) -> &[String] {
        &self.audit_ids
    }

    #[must_use]
    pub const fn is_accepting_writes(&self) -> bool {
        self.accepting_writes
    }

    pub fn advance(&mut self, next: BatchState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(Error::InvalidTransition {
                operation_id: self.operation_id.clone(),
                from: self.state.as_str(),
                to: next.as_str(),
            });
        }
        tracing::debug!(
            operation_id = %self.operation_id,
            from = self.state.as_str(),
            to = next.as_str(),
            "Batch state changed"
        );
        self.state = next;
        self.history.push(next);
        if next.is_terminal() {
            self.accepting_writes = false;
        }
        Ok(())
    }

    /// Move to `Failed` unless already terminal.
    pub fn fail(&mut self) {
        if self.state.can_advance_to(BatchState::Failed) {
            self.state = BatchState::Failed;
            self.history.push(BatchState::Failed);
        }
        self.accepting_writes = false;
    }

    fn link_audit(&mut self, receipt: Option<AuditReceipt>) {
        if let Some(receipt) = receipt {
            self.audit_ids.push(receipt.id);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequest {
    /// Generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    pub user_id: String,
    pub batch: StagedBatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedEntity {
    pub kind: EntityKind,
    pub id: String,
    pub version: VersionToken,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitReport {
    pub operation_id: String,
    pub committed: Vec<CommittedEntity>,
    /// Entities left out because the server no longer holds them
    pub skipped: Vec<EntityRef>,
    pub state: BatchState,
    pub history: Vec<BatchState>,
    pub audit_ids: Vec<String>,
}

impl CommitReport {
    fn from_operation(
        operation: &BatchOperation,
        committed: Vec<CommittedEntity>,
        skipped: Vec<EntityRef>,
    ) -> Self {
        Self {
            operation_id: operation.operation_id.clone(),
            committed,
            skipped,
            state: operation.state,
            history: operation.history.clone(),
            audit_ids: operation.audit_ids.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SaveOutcome {
    Committed(CommitReport),
    /// Nothing was written; the user must pick a resolution
    #[serde(rename_all = "camelCase")]
    Conflicts {
        operation_id: String,
        conflicts: Vec<ConflictItem>,
        non_conflicted: Vec<VersionedEntityRef>,
    },
    /// Some version lookups timed out; nothing was written
    #[serde(rename_all = "camelCase")]
    Unverified {
        operation_id: String,
        failed: Vec<DetectionFailure>,
    },
}

impl SaveOutcome {
    #[must_use]
    pub fn operation_id(&self) -> &str {
        match self {
            Self::Committed(report) => &report.operation_id,
            Self::Conflicts { operation_id, .. } | Self::Unverified { operation_id, .. } => {
                operation_id
            }
        }
    }
}

/// What happened to the resolved data after a resolution call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResolutionCommit {
    /// Every item adopted server state; nothing to write
    Refreshed,
    Committed(CommitReport),
    /// Some items are unresolved; nothing was written
    #[serde(rename_all = "camelCase")]
    Blocked { unresolved: usize },
    /// A token moved again before the write; earlier writes were reverted
    #[serde(rename_all = "camelCase")]
    Conflicts {
        conflicts: Vec<ConflictItem>,
        non_conflicted: Vec<VersionedEntityRef>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveReport {
    pub resolution: ResolutionResult,
    pub commit: ResolutionCommit,
}

/// One entry of [`BatchCommitCoordinator::execute_bulk_operations`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BulkOperation {
    Create {
        data: EntityData,
    },
    Update {
        id: String,
        data: EntityData,
    },
    Delete {
        kind: EntityKind,
        id: String,
    },
}

impl BulkOperation {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "CREATE",
            Self::Update { .. } => "UPDATE",
            Self::Delete { .. } => "DELETE",
        }
    }

    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Create { data } | Self::Update { data, .. } => data.kind(),
            Self::Delete { kind, .. } => *kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkResult {
    pub index: usize,
    pub op: &'static str,
    pub kind: EntityKind,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionToken>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkError {
    pub index: usize,
    pub op: &'static str,
    pub kind: EntityKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub error: String,
}

/// Aggregate of a bulk call.
///
/// `success` only says the call ran: it stays true while at least one
/// operation applied. Callers must inspect `errors`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkOutcome {
    pub success: bool,
    pub results: Vec<BulkResult>,
    pub errors: Vec<BulkError>,
}

/// A write planned for the commit phase.
#[derive(Debug, Clone)]
struct PlannedWrite {
    entity: EntityRef,
    data: EntityData,
    /// Token the data was computed against; `None` writes unchecked
    expected: Option<VersionToken>,
}

/// A write that reached (or may have reached) the store.
#[derive(Debug, Clone)]
struct AppliedWrite {
    entity: EntityRef,
    /// Data to restore; `None` means the entity did not exist before
    prior: Option<EntityData>,
}

enum CommitAbort {
    Stale(Box<ConflictItem>),
    Failed { entity: EntityRef, source: StoreError },
}

/// An entity restored by a rollback; `version` is `None` when the
/// entity was deleted.
#[derive(Debug, Clone)]
struct RevertedWrite {
    entity: EntityRef,
    version: Option<VersionToken>,
}

/// A conflict found at write time, after the earlier writes were reverted.
struct StaleCommit {
    conflict: Box<ConflictItem>,
    reverted: Vec<RevertedWrite>,
}

impl StaleCommit {
    /// The other entities of the aborted batch, each carrying the version
    /// the rollback left it at.
    fn remaining(&self, entities: Vec<VersionedEntityRef>) -> Vec<VersionedEntityRef> {
        let stale = self.conflict.entity_ref();
        entities
            .into_iter()
            .filter(|entity| entity.entity_ref() != stale)
            .map(|mut entity| {
                let key = entity.entity_ref();
                if let Some(reverted) = self.reverted.iter().find(|r| r.entity == key) {
                    entity.current_version = reverted.version.clone();
                }
                entity
            })
            .collect()
    }
}

/// Drives detection, resolution and commit for global saves.
#[derive(Clone)]
pub struct BatchCommitCoordinator {
    store: Arc<dyn EntityStore>,
    detector: ConflictDetector,
    engine: ResolutionEngine,
    audit: AuditTrailLinker,
    config: EngineConfig,
}

impl BatchCommitCoordinator {
    pub fn new(
        store: Arc<dyn EntityStore>,
        audit_sink: Arc<dyn AuditSink>,
        config: EngineConfig,
    ) -> Self {
        let audit = AuditTrailLinker::new(audit_sink, config.audit_timeout);
        Self {
            detector: ConflictDetector::new(Arc::clone(&store), config),
            engine: ResolutionEngine::new(Arc::clone(&store), audit.clone(), config),
            store,
            audit,
            config,
        }
    }

    #[must_use]
    pub const fn detector(&self) -> &ConflictDetector {
        &self.detector
    }

    #[must_use]
    pub const fn engine(&self) -> &ResolutionEngine {
        &self.engine
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open an operation. The transaction id is the operation id.
    pub fn start_transaction(&self, operation_id: Option<&str>, user_id: &str) -> BatchOperation {
        let operation_id = operation_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map_or_else(|| Uuid::now_v7().to_string(), ToString::to_string);
        tracing::info!(operation_id = %operation_id, user_id, "Batch operation started");
        BatchOperation::new(operation_id, user_id)
    }

    /// Close the operation; no further writes are accepted under its id.
    pub fn commit_transaction(&self, operation: &mut BatchOperation) -> Result<()> {
        operation.advance(BatchState::Committed)?;
        tracing::info!(
            operation_id = %operation.operation_id,
            audit_records = operation.audit_ids.len(),
            "Batch operation committed"
        );
        Ok(())
    }

    /// Revert the given writes in reverse order by re-applying the prior
    /// data, or deleting entities that did not exist before.
    ///
    /// Returns the reverted entities with their new versions; `RollbackFailed`
    /// lists the entities that could not be reverted.
    async fn rollback_transaction(
        &self,
        operation: &mut BatchOperation,
        applied: &[AppliedWrite],
        cause: &str,
    ) -> Result<Vec<RevertedWrite>> {
        let mut reverted = Vec::new();
        let mut unreverted = Vec::new();
        let mut last_error = None;

        for write in applied.iter().rev() {
            let revert = async {
                match &write.prior {
                    Some(data) => self
                        .store
                        .write(&write.entity, data, &operation.user_id)
                        .await
                        .map(Some),
                    None => match self.store.delete(&write.entity).await {
                        Ok(()) | Err(StoreError::NotFound(_)) => Ok(None),
                        Err(error) => Err(error),
                    },
                }
            };
            match self.with_write_timeout(revert).await {
                Ok(version) => reverted.push(RevertedWrite {
                    entity: write.entity.clone(),
                    version,
                }),
                Err(error) => {
                    tracing::error!(
                        operation_id = %operation.operation_id,
                        entity = %write.entity,
                        %error,
                        "Rollback write failed"
                    );
                    unreverted.push(write.entity.clone());
                    last_error = Some(error);
                }
            }
        }

        let reverted_refs: Vec<EntityRef> =
            reverted.iter().map(|write| write.entity.clone()).collect();
        let receipt = self
            .audit
            .record_rollback(
                &operation.operation_id,
                &operation.user_id,
                &reverted_refs,
                &unreverted,
                cause,
            )
            .await;
        operation.link_audit(receipt);

        if let Some(error) = last_error {
            operation.fail();
            return Err(Error::RollbackFailed {
                operation_id: operation.operation_id.clone(),
                unreverted,
                reason: error.to_string(),
            });
        }
        tracing::warn!(
            operation_id = %operation.operation_id,
            reverted = reverted.len(),
            cause,
            "Batch rolled back"
        );
        Ok(reverted)
    }

    /// Apply each operation independently, continuing past failures.
    pub async fn execute_bulk_operations(
        &self,
        operation: &mut BatchOperation,
        operations: Vec<BulkOperation>,
    ) -> Result<BulkOutcome> {
        if !operation.accepting_writes {
            return Err(Error::InvalidTransition {
                operation_id: operation.operation_id.clone(),
                from: operation.state.as_str(),
                to: BatchState::Committing.as_str(),
            });
        }

        let total = operations.len();
        let mut outcome = BulkOutcome::default();
        let mut written = Vec::new();
        for (index, bulk) in operations.into_iter().enumerate() {
            let op = bulk.name();
            let kind = bulk.kind();
            let applied = match bulk {
                BulkOperation::Create { data } => self
                    .with_write_timeout(self.store.create(&data, &operation.user_id))
                    .await
                    .map(|snapshot| (snapshot.id, Some(snapshot.version)))
                    .map_err(|error| (None, error)),
                BulkOperation::Update { id, data } => {
                    let entity = EntityRef::new(kind, id.clone());
                    self.with_write_timeout(self.store.write(&entity, &data, &operation.user_id))
                        .await
                        .map(|version| (id.clone(), Some(version)))
                        .map_err(|error| (Some(id), error))
                }
                BulkOperation::Delete { id, .. } => {
                    let entity = EntityRef::new(kind, id.clone());
                    self.with_write_timeout(self.store.delete(&entity))
                        .await
                        .map(|()| (id.clone(), None))
                        .map_err(|error| (Some(id), error))
                }
            };
            match applied {
                Ok((id, version)) => {
                    written.push((
                        EntityRef::new(kind, id.clone()),
                        version
                            .as_ref()
                            .map_or_else(|| "deleted".to_string(), |v| v.as_str().to_string()),
                    ));
                    outcome.results.push(BulkResult {
                        index,
                        op,
                        kind,
                        id,
                        version,
                    });
                }
                Err((id, error)) => {
                    tracing::warn!(
                        operation_id = %operation.operation_id,
                        index,
                        op,
                        %error,
                        "Bulk operation failed"
                    );
                    outcome.errors.push(BulkError {
                        index,
                        op,
                        kind,
                        id,
                        error: error.to_string(),
                    });
                }
            }
        }
        outcome.success = total == 0 || !outcome.results.is_empty();

        if !written.is_empty() {
            let receipt = self
                .audit
                .record_commit(&operation.operation_id, &operation.user_id, &written)
                .await;
            operation.link_audit(receipt);
        }
        tracing::info!(
            operation_id = %operation.operation_id,
            applied = outcome.results.len(),
            failed = outcome.errors.len(),
            "Bulk operations finished"
        );
        Ok(outcome)
    }

    /// Detection without a commit, audited under the operation id.
    pub async fn detect(
        &self,
        operation_id: Option<&str>,
        user_id: &str,
        batch: StagedBatch,
        cancel: &CancellationToken,
    ) -> Result<(BatchOperation, ConflictDetectionResult)> {
        let mut operation = self.start_transaction(operation_id, user_id);
        operation.advance(BatchState::Detecting)?;
        let detection = match self
            .detector
            .detect_batch_conflicts(&operation.operation_id, batch, cancel)
            .await
        {
            Ok(detection) => detection,
            Err(error) => {
                operation.fail();
                return Err(error);
            }
        };
        let receipt = self
            .audit
            .record_detection(&operation.operation_id, &operation.user_id, &detection)
            .await;
        operation.link_audit(receipt);

        if !detection.failed.is_empty() {
            operation.fail();
        } else if detection.has_conflicts() {
            operation.advance(BatchState::HasConflicts)?;
        } else {
            operation.advance(BatchState::Clean)?;
        }
        Ok((operation, detection))
    }

    /// Detect conflicts for a staged batch and commit it when clean.
    pub async fn save(
        &self,
        request: SaveRequest,
        cancel: &CancellationToken,
    ) -> Result<SaveOutcome> {
        let mut operation =
            self.start_transaction(request.operation_id.as_deref(), &request.user_id);
        let entities = request.batch.into_entities();

        operation.advance(BatchState::Detecting)?;
        let detection = match self
            .detector
            .detect_entities(&operation.operation_id, &entities, cancel)
            .await
        {
            Ok(detection) => detection,
            Err(error) => {
                operation.fail();
                return Err(error);
            }
        };
        let receipt = self
            .audit
            .record_detection(&operation.operation_id, &operation.user_id, &detection)
            .await;
        operation.link_audit(receipt);

        if !detection.failed.is_empty() {
            operation.fail();
            return Ok(SaveOutcome::Unverified {
                operation_id: operation.operation_id,
                failed: detection.failed,
            });
        }
        if detection.has_conflicts() {
            operation.advance(BatchState::HasConflicts)?;
            operation.advance(BatchState::AwaitingResolution)?;
            return Ok(SaveOutcome::Conflicts {
                operation_id: operation.operation_id,
                conflicts: detection.conflicts,
                non_conflicted: detection.non_conflicted,
            });
        }

        operation.advance(BatchState::Clean)?;
        let writes: Vec<PlannedWrite> = entities
            .into_iter()
            .filter(|entity| !detection.skipped.contains(&entity.entity_ref()))
            .map(|entity| PlannedWrite {
                entity: entity.entity_ref(),
                expected: entity.client_version,
                data: entity.data,
            })
            .collect();

        match self.commit_writes(&mut operation, writes, cancel).await? {
            Ok(committed) => Ok(SaveOutcome::Committed(CommitReport::from_operation(
                &operation,
                committed,
                detection.skipped,
            ))),
            Err(stale) => {
                let non_conflicted = stale.remaining(detection.non_conflicted);
                Ok(SaveOutcome::Conflicts {
                    operation_id: operation.operation_id,
                    conflicts: vec![*stale.conflict],
                    non_conflicted,
                })
            }
        }
    }

    /// Resolve a conflicted batch and commit the resolved data.
    pub async fn resolve_and_commit(
        &self,
        request: &ResolutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ResolveReport> {
        let mut operation = BatchOperation::awaiting_resolution(
            request.operation_id.clone(),
            request.user_id.clone(),
        );
        let resolution = match self.engine.resolve_conflicts(request, cancel).await {
            Ok(resolution) => resolution,
            Err(error) => {
                operation.fail();
                return Err(error);
            }
        };

        if !resolution.unresolved.is_empty() {
            tracing::info!(
                operation_id = %operation.operation_id,
                unresolved = resolution.unresolved.len(),
                "Resolution incomplete; nothing committed"
            );
            let unresolved = resolution.unresolved.len();
            return Ok(ResolveReport {
                resolution,
                commit: ResolutionCommit::Blocked { unresolved },
            });
        }

        let writes: Vec<PlannedWrite> = resolution
            .resolved
            .iter()
            .filter(|item| item.resolution_applied.requires_write())
            .map(|item| PlannedWrite {
                entity: item.entity_ref(),
                data: item.final_data.clone(),
                expected: item.based_on_version.clone(),
            })
            .collect();

        if writes.is_empty() {
            operation.advance(BatchState::Refreshing)?;
            operation.advance(BatchState::Idle)?;
            return Ok(ResolveReport {
                resolution,
                commit: ResolutionCommit::Refreshed,
            });
        }

        let planned: Vec<VersionedEntityRef> = writes
            .iter()
            .map(|write| VersionedEntityRef {
                kind: write.entity.kind,
                id: write.entity.id.clone(),
                client_version: write.expected.clone(),
                current_version: write.expected.clone(),
            })
            .collect();
        operation.advance(BatchState::Overriding)?;
        let commit = match self.commit_writes(&mut operation, writes, cancel).await? {
            Ok(committed) => ResolutionCommit::Committed(CommitReport::from_operation(
                &operation,
                committed,
                Vec::new(),
            )),
            Err(stale) => ResolutionCommit::Conflicts {
                non_conflicted: stale.remaining(planned),
                conflicts: vec![*stale.conflict],
            },
        };
        Ok(ResolveReport { resolution, commit })
    }

    /// Enter `Committing`, apply the writes with check-then-set and close the
    /// operation. The inner `Err` carries a conflict found at write time,
    /// after earlier writes were reverted.
    async fn commit_writes(
        &self,
        operation: &mut BatchOperation,
        writes: Vec<PlannedWrite>,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<Vec<CommittedEntity>, StaleCommit>> {
        if cancel.is_cancelled() {
            tracing::info!(
                operation_id = %operation.operation_id,
                "Commit cancelled before any write"
            );
            operation.fail();
            return Err(Error::Cancelled(operation.operation_id.clone()));
        }
        operation.advance(BatchState::Committing)?;

        let mut applied = Vec::with_capacity(writes.len());
        let mut committed = Vec::with_capacity(writes.len());
        let mut abort = None;
        for write in writes {
            match self.apply_checked(operation, &write).await {
                Ok((prior, version)) => {
                    applied.push(AppliedWrite {
                        entity: write.entity.clone(),
                        prior,
                    });
                    committed.push(CommittedEntity {
                        kind: write.entity.kind,
                        id: write.entity.id,
                        version,
                    });
                }
                Err((abort_reason, uncertain)) => {
                    if let Some(uncertain) = uncertain {
                        applied.push(uncertain);
                    }
                    abort = Some(abort_reason);
                    break;
                }
            }
        }

        match abort {
            None => {
                let written: Vec<(EntityRef, String)> = committed
                    .iter()
                    .map(|entity| {
                        (
                            EntityRef::new(entity.kind, entity.id.clone()),
                            entity.version.as_str().to_string(),
                        )
                    })
                    .collect();
                let receipt = self
                    .audit
                    .record_commit(&operation.operation_id, &operation.user_id, &written)
                    .await;
                operation.link_audit(receipt);
                self.commit_transaction(operation)?;
                Ok(Ok(committed))
            }
            Some(CommitAbort::Stale(conflict)) => {
                let stale = ItemError::StaleAtCommit {
                    expected: conflict
                        .client_version
                        .clone()
                        .unwrap_or_else(VersionToken::unknown),
                    current: conflict.current_version.clone(),
                };
                let cause = format!("{}: {stale}", conflict.entity_ref());
                let reverted = self.rollback_transaction(operation, &applied, &cause).await?;
                operation.advance(BatchState::HasConflicts)?;
                operation.advance(BatchState::AwaitingResolution)?;
                Ok(Err(StaleCommit { conflict, reverted }))
            }
            Some(CommitAbort::Failed { entity, source }) => {
                tracing::error!(
                    operation_id = %operation.operation_id,
                    entity = %entity,
                    error = %source,
                    applied = applied.len(),
                    "Commit write failed"
                );
                if applied.is_empty() {
                    operation.fail();
                    return Err(Error::StorageWriteFailure {
                        operation_id: operation.operation_id.clone(),
                        entity,
                        source,
                    });
                }
                let cause = format!("write failed for {entity}: {source}");
                let reverted = self.rollback_transaction(operation, &applied, &cause).await?;
                operation.fail();
                Err(Error::CommitRolledBack {
                    operation_id: operation.operation_id.clone(),
                    entity,
                    reverted: reverted.len(),
                    source,
                })
            }
        }
    }

    /// Re-read the entity, verify its token still matches and write.
    ///
    /// On a timed-out write the prior data is still returned for compensation,
    /// since the write may have landed.
    async fn apply_checked(
        &self,
        operation: &BatchOperation,
        write: &PlannedWrite,
    ) -> std::result::Result<(Option<EntityData>, VersionToken), (CommitAbort, Option<AppliedWrite>)>
    {
        let current = self
            .with_write_timeout(self.store.snapshot(&write.entity))
            .await
            .map_err(|source| {
                (
                    CommitAbort::Failed {
                        entity: write.entity.clone(),
                        source,
                    },
                    None,
                )
            })?;

        if let Some(expected) = &write.expected {
            if let Some(conflict) = stale_conflict(write, expected, current.as_ref()) {
                tracing::info!(
                    operation_id = %operation.operation_id,
                    entity = %write.entity,
                    expected = %expected,
                    "Version changed before write"
                );
                return Err((CommitAbort::Stale(Box::new(conflict)), None));
            }
        }

        let prior = current.map(|snapshot| snapshot.data);
        match self
            .with_write_timeout(self.store.write(&write.entity, &write.data, &operation.user_id))
            .await
        {
            Ok(version) => Ok((prior, version)),
            Err(source) => {
                let uncertain = matches!(source, StoreError::Timeout(_)).then(|| AppliedWrite {
                    entity: write.entity.clone(),
                    prior,
                });
                Err((
                    CommitAbort::Failed {
                        entity: write.entity.clone(),
                        source,
                    },
                    uncertain,
                ))
            }
        }
    }

    async fn with_write_timeout<T>(
        &self,
        call: impl std::future::Future<Output = std::result::Result<T, StoreError>>,
    ) -> std::result::Result<T, StoreError> {
        let timeout = self.config.lookup_timeout;
        tokio::time::timeout(timeout, call)
            .await
            .unwrap_or_else(|_| Err(StoreError::Timeout(timeout.as_millis())))
    }
}

/// `Some` when the server token no longer matches what the write expects.
fn stale_conflict(
    write: &PlannedWrite,
    expected: &VersionToken,
    current: Option<&EntitySnapshot>,
) -> Option<ConflictItem> {
    let staged = StagedEntity {
        id: write.entity.id.clone(),
        client_version: Some(expected.clone()),
        data: write.data.clone(),
    };
    match current {
        None => Some(conflict_item(&staged, None)),
        Some(snapshot) if compare(Some(expected), &snapshot.version).is_conflict() => {
            Some(conflict_item(&staged, Some(snapshot.clone())))
        }
        Some(_) => None,
    }
}
