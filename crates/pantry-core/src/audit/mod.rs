//! Audit trail linking.
//!
//! Every detection run, per-item resolution decision, batch-level decision,
//! commit and rollback becomes an [`AuditRecord`] whose metadata carries the
//! `operationId`. Writing them is best-effort: a failing or slow sink is
//! logged locally and never fails the operation being audited.

mod memory;

pub use memory::{MemoryAuditSink, StoredAuditEntry, DEFAULT_AUDIT_RETENTION};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::error::ItemError;
use crate::models::{
    ConflictDetectionResult, EntityData, EntityRef, ResolutionRequest, ResolutionResult,
    ResolutionStrategy, ResolvedItem,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    ConflictDetection,
    ConflictRefresh,
    ConflictOverride,
    ConflictMerge,
    /// Batch-level summary of a resolution mixing several strategies
    ConflictResolution,
    BatchCommit,
    BatchRollback,
}

impl AuditKind {
    #[must_use]
    pub const fn for_strategy(strategy: ResolutionStrategy) -> Self {
        match strategy {
            ResolutionStrategy::Refresh | ResolutionStrategy::OverrideWithServer => {
                Self::ConflictRefresh
            }
            ResolutionStrategy::OverrideWithClient => Self::ConflictOverride,
            ResolutionStrategy::AttemptMerge => Self::ConflictMerge,
        }
    }
}

/// One append-only audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub kind: AuditKind,
    pub affected_ids: Vec<String>,
    /// Always an object holding at least `operationId`
    pub metadata: Value,
    pub user_id: String,
}

impl AuditRecord {
    pub fn new(kind: AuditKind, operation_id: &str, user_id: impl Into<String>) -> Self {
        Self {
            kind,
            affected_ids: Vec::new(),
            metadata: json!({ "operationId": operation_id }),
            user_id: user_id.into(),
        }
    }

    #[must_use]
    pub fn affecting(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.affected_ids.extend(ids);
        self
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: Value) -> Self {
        if let Value::Object(map) = &mut self.metadata {
            map.insert(key.to_string(), value);
        } else {
            let mut map = Map::new();
            map.insert(key.to_string(), value);
            self.metadata = Value::Object(map);
        }
        self
    }

    #[must_use]
    pub fn operation_id(&self) -> Option<&str> {
        self.metadata.get("operationId").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReceipt {
    pub id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuditError {
    #[error("Audit sink unavailable: {0}")]
    Unavailable(String),
    #[error("Audit record rejected: {0}")]
    Rejected(String),
}

/// Durable audit log collaborator.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_batch_operation(&self, record: &AuditRecord) -> Result<AuditReceipt, AuditError>;
}

/// Builds audit records for engine decisions and hands them to the sink.
#[derive(Clone)]
pub struct AuditTrailLinker {
    sink: Arc<dyn AuditSink>,
    timeout: Duration,
}

impl AuditTrailLinker {
    pub fn new(sink: Arc<dyn AuditSink>, timeout: Duration) -> Self {
        Self { sink, timeout }
    }

    /// Write one record. Returns `None` when the sink failed or timed out.
    pub async fn log_batch_operation(&self, record: AuditRecord) -> Option<AuditReceipt> {
        let operation_id = record.operation_id().unwrap_or("unknown").to_string();
        match tokio::time::timeout(self.timeout, self.sink.log_batch_operation(&record)).await {
            Ok(Ok(receipt)) => {
                tracing::debug!(
                    operation_id = %operation_id,
                    kind = ?record.kind,
                    audit_id = %receipt.id,
                    "Audit record written"
                );
                Some(receipt)
            }
            Ok(Err(error)) => {
                tracing::warn!(
                    operation_id = %operation_id,
                    kind = ?record.kind,
                    affected = record.affected_ids.len(),
                    %error,
                    "Audit write failed; continuing"
                );
                None
            }
            Err(_) => {
                tracing::warn!(
                    operation_id = %operation_id,
                    kind = ?record.kind,
                    timeout_ms = self.timeout.as_millis(),
                    "Audit write timed out; continuing"
                );
                None
            }
        }
    }

    pub async fn record_detection(
        &self,
        operation_id: &str,
        user_id: &str,
        result: &ConflictDetectionResult,
    ) -> Option<AuditReceipt> {
        let conflicts: Vec<Value> = result
            .conflicts
            .iter()
            .map(|conflict| {
                json!({
                    "entity": conflict.entity_ref().to_string(),
                    "clientVersion": conflict.client_version,
                    "currentVersion": conflict.current_version,
                    "conflictFields": conflict.conflict_fields,
                })
            })
            .collect();
        let record = AuditRecord::new(AuditKind::ConflictDetection, operation_id, user_id)
            .affecting(
                result
                    .conflicts
                    .iter()
                    .map(|conflict| conflict.entity_ref().to_string()),
            )
            .with("conflicts", Value::Array(conflicts))
            .with("nonConflicted", json!(result.non_conflicted.len()))
            .with(
                "skipped",
                json!(result
                    .skipped
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()),
            )
            .with("failed", json!(result.failed));
        self.log_batch_operation(record).await
    }

    /// Per-item decision with before/after snapshots.
    pub async fn record_item_decision(
        &self,
        operation_id: &str,
        user_id: &str,
        entity: &EntityRef,
        strategy: &str,
        before: Option<&EntityData>,
        outcome: Result<&ResolvedItem, &ItemError>,
    ) -> Option<AuditReceipt> {
        let kind = strategy
            .parse::<ResolutionStrategy>()
            .map_or(AuditKind::ConflictResolution, AuditKind::for_strategy);
        let record = AuditRecord::new(kind, operation_id, user_id)
            .affecting([entity.to_string()])
            .with("strategy", json!(strategy))
            .with("before", json!(before));
        let record = match outcome {
            Ok(resolved) => record
                .with("outcome", json!("resolved"))
                .with("resolutionApplied", json!(resolved.resolution_applied))
                .with("after", json!(resolved.final_data)),
            Err(error) => record
                .with("outcome", json!("unresolved"))
                .with("error", json!(error.code()))
                .with("reason", json!(error.to_string())),
        };
        self.log_batch_operation(record).await
    }

    /// Batch-level entry for a whole resolution call.
    pub async fn record_resolution(
        &self,
        request: &ResolutionRequest,
        result: &ResolutionResult,
    ) -> Option<AuditReceipt> {
        let strategies: Vec<&str> = request
            .conflicted_items
            .iter()
            .map(|item| item.resolution.as_str())
            .collect();
        let kind = match strategies.split_first() {
            Some((first, rest)) if rest.iter().all(|other| other == first) => first
                .parse::<ResolutionStrategy>()
                .map_or(AuditKind::ConflictResolution, AuditKind::for_strategy),
            _ => AuditKind::ConflictResolution,
        };
        let record = AuditRecord::new(kind, &request.operation_id, request.user_id.clone())
            .affecting(
                request
                    .conflicted_items
                    .iter()
                    .map(|item| item.entity_ref().to_string())
                    .chain(
                        request
                            .non_conflicted_items
                            .iter()
                            .map(|item| item.entity_ref().to_string()),
                    ),
            )
            .with("resolved", json!(result.resolved.len()))
            .with("unresolved", json!(result.unresolved))
            .with("strategies", json!(strategies));
        self.log_batch_operation(record).await
    }

    pub async fn record_commit(
        &self,
        operation_id: &str,
        user_id: &str,
        written: &[(EntityRef, String)],
    ) -> Option<AuditReceipt> {
        let record = AuditRecord::new(AuditKind::BatchCommit, operation_id, user_id)
            .affecting(written.iter().map(|(entity, _)| entity.to_string()))
            .with(
                "versions",
                Value::Object(
                    written
                        .iter()
                        .map(|(entity, version)| (entity.to_string(), json!(version)))
                        .collect(),
                ),
            );
        self.log_batch_operation(record).await
    }

    pub async fn record_rollback(
        &self,
        operation_id: &str,
        user_id: &str,
        reverted: &[EntityRef],
        unreverted: &[EntityRef],
        cause: &str,
    ) -> Option<AuditReceipt> {
        let record = AuditRecord::new(AuditKind::BatchRollback, operation_id, user_id)
            .affecting(reverted.iter().chain(unreverted).map(ToString::to_string))
            .with(
                "reverted",
                json!(reverted.iter().map(ToString::to_string).collect::<Vec<_>>()),
            )
            .with(
                "unreverted",
                json!(unreverted.iter().map(ToString::to_string).collect::<Vec<_>>()),
            )
            .with("cause", json!(cause));
        self.log_batch_operation(record).await
    }
}
