//! Conflict resolution.
//!
//! Each conflicted item is resolved independently and concurrently; a failing
//! item lands in `unresolved` without affecting its siblings. Non-conflicted
//! items pass through as `no_conflict`.

use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::audit::AuditTrailLinker;
use crate::config::EngineConfig;
use crate::error::{Error, ItemError, Result};
use crate::merge::merge_entities;
use crate::models::{
    ConflictedItem, EntityData, EntityKind, EntityRef, EntitySnapshot, MergeStrategy,
    NonConflictedItem, ResolutionApplied, ResolutionRequest, ResolutionResult,
    ResolutionStrategy, ResolvedItem, UnresolvedItem, VersionToken,
};
use crate::store::EntityStore;

#[derive(Clone)]
pub struct ResolutionEngine {
    store: Arc<dyn EntityStore>,
    audit: AuditTrailLinker,
    config: EngineConfig,
}

/// Result of one conflicted item plus the data it replaces, for the audit.
struct ItemOutcome {
    entity: EntityRef,
    before: Option<EntityData>,
    result: std::result::Result<ResolvedItem, ItemError>,
}

impl ResolutionEngine {
    pub fn new(store: Arc<dyn EntityStore>, audit: AuditTrailLinker, config: EngineConfig) -> Self {
        Self {
            store,
            audit,
            config,
        }
    }

    /// Compute final data for every item in the request.
    ///
    /// Returns `Err` only on cancellation; every other failure is per item.
    pub async fn resolve_conflicts(
        &self,
        request: &ResolutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ResolutionResult> {
        let operation_id = request.operation_id.as_str();
        let outcomes = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::info!(operation_id, "Conflict resolution cancelled");
                return Err(Error::Cancelled(operation_id.to_string()));
            }
            outcomes = join_all(
                request
                    .conflicted_items
                    .iter()
                    .map(|item| self.resolve_and_audit(request, item)),
            ) => outcomes,
        };

        let mut result = ResolutionResult {
            audit_trail: request.operation_id.clone(),
            ..ResolutionResult::default()
        };
        for outcome in outcomes {
            match outcome.result {
                Ok(resolved) => result.resolved.push(resolved),
                Err(error) => result.unresolved.push(UnresolvedItem {
                    kind: outcome.entity.kind,
                    id: outcome.entity.id,
                    error: error.code().to_string(),
                    reason: error.to_string(),
                }),
            }
        }
        for item in &request.non_conflicted_items {
            match pass_through(item) {
                Ok(resolved) => result.resolved.push(resolved),
                Err(error) => result.unresolved.push(UnresolvedItem {
                    kind: item.kind,
                    id: item.id.clone(),
                    error: error.code().to_string(),
                    reason: error.to_string(),
                }),
            }
        }

        self.audit.record_resolution(request, &result).await;
        tracing::info!(
            operation_id,
            resolved = result.resolved.len(),
            unresolved = result.unresolved.len(),
            "Conflict resolution finished"
        );
        Ok(result)
    }

    async fn resolve_and_audit(
        &self,
        request: &ResolutionRequest,
        item: &ConflictedItem,
    ) -> ItemOutcome {
        let outcome = self.resolve_item(item).await;
        match &outcome.result {
            Ok(resolved) => tracing::debug!(
                operation_id = %request.operation_id,
                entity = %outcome.entity,
                applied = resolved.resolution_applied.as_str(),
                "Conflict resolved"
            ),
            Err(error) => tracing::warn!(
                operation_id = %request.operation_id,
                entity = %outcome.entity,
                strategy = %item.resolution,
                %error,
                "Conflict left unresolved"
            ),
        }
        self.audit
            .record_item_decision(
                &request.operation_id,
                &request.user_id,
                &outcome.entity,
                &item.resolution,
                outcome.before.as_ref(),
                outcome.result.as_ref(),
            )
            .await;
        outcome
    }

    async fn resolve_item(&self, item: &ConflictedItem) -> ItemOutcome {
        let entity = item.entity_ref();
        let strategy = match item.resolution.parse::<ResolutionStrategy>() {
            Ok(strategy) => strategy,
            Err(error) => {
                return ItemOutcome {
                    before: item.client_data.clone(),
                    entity,
                    result: Err(error),
                }
            }
        };

        match strategy {
            ResolutionStrategy::Refresh | ResolutionStrategy::OverrideWithServer => {
                let applied = if strategy == ResolutionStrategy::Refresh {
                    ResolutionApplied::Refresh
                } else {
                    ResolutionApplied::OverrideWithServer
                };
                let result = match self.fetch_snapshot(&entity).await {
                    Ok(Some(snapshot)) => Ok(resolved(
                        &entity,
                        snapshot.data,
                        applied,
                        Some(snapshot.version),
                    )),
                    Ok(None) => Err(ItemError::EntityNotFound(entity.clone())),
                    Err(error) => Err(error),
                };
                ItemOutcome {
                    before: item.client_data.clone(),
                    entity,
                    result,
                }
            }
            ResolutionStrategy::OverrideWithClient => {
                let (before, based_on_version) = match self.fetch_snapshot(&entity).await {
                    Ok(current) => (
                        current.as_ref().map(|snapshot| snapshot.data.clone()),
                        current.map(|snapshot| snapshot.version),
                    ),
                    Err(error) => {
                        tracing::warn!(
                            entity = %entity,
                            %error,
                            "Server lookup failed; overriding against the version the client saw"
                        );
                        (item.server_data.clone(), item.server_version.clone())
                    }
                };
                let result = item
                    .client_data
                    .clone()
                    .ok_or(ItemError::MissingClientData)
                    .and_then(|client| {
                        ensure_kind(item.kind, &client)?;
                        Ok(resolved(
                            &entity,
                            client,
                            ResolutionApplied::OverrideWithClient,
                            based_on_version,
                        ))
                    });
                ItemOutcome {
                    entity,
                    before,
                    result,
                }
            }
            ResolutionStrategy::AttemptMerge => match self.merge_item(item, &entity).await {
                Ok((current, merged)) => ItemOutcome {
                    entity,
                    before: Some(current),
                    result: Ok(merged),
                },
                Err(error) => ItemOutcome {
                    before: item.server_data.clone(),
                    entity,
                    result: Err(error),
                },
            },
        }
    }

    /// Merge the client data into the server's current data.
    ///
    /// `serverData` from the request may predate another session's save, so
    /// the merge runs against a fresh snapshot and is stamped with that
    /// snapshot's version. Returns the data the merge replaced.
    async fn merge_item(
        &self,
        item: &ConflictedItem,
        entity: &EntityRef,
    ) -> std::result::Result<(EntityData, ResolvedItem), ItemError> {
        let (Some(client), Some(server)) = (&item.client_data, &item.server_data) else {
            return Err(ItemError::MissingMergeInputs);
        };
        let strategy = item
            .merge_strategy
            .as_deref()
            .map(str::parse::<MergeStrategy>)
            .transpose()?
            .unwrap_or_default();
        ensure_kind(item.kind, client)?;
        ensure_kind(item.kind, server)?;

        let current = self
            .fetch_snapshot(entity)
            .await?
            .ok_or_else(|| ItemError::EntityNotFound(entity.clone()))?;
        if current.data != *server {
            tracing::info!(
                entity = %entity,
                current_version = %current.version,
                "Server data changed since the conflict was reported; merging against current data"
            );
        }
        let merged = merge_entities(client, &current.data, strategy)?;
        Ok((
            current.data,
            resolved(
                entity,
                merged,
                ResolutionApplied::Merged,
                Some(current.version),
            ),
        ))
    }

    async fn fetch_snapshot(
        &self,
        entity: &EntityRef,
    ) -> std::result::Result<Option<EntitySnapshot>, ItemError> {
        match tokio::time::timeout(self.config.lookup_timeout, self.store.snapshot(entity)).await {
            Ok(result) => result.map_err(ItemError::from),
            Err(_) => Err(ItemError::Timeout(self.config.lookup_timeout)),
        }
    }
}

fn pass_through(item: &NonConflictedItem) -> std::result::Result<ResolvedItem, ItemError> {
    ensure_kind(item.kind, &item.data)?;
    Ok(ResolvedItem {
        kind: item.kind,
        id: item.id.clone(),
        final_data: item.data.clone(),
        resolution_applied: ResolutionApplied::NoConflict,
        based_on_version: item.client_version.clone(),
    })
}

fn resolved(
    entity: &EntityRef,
    final_data: EntityData,
    applied: ResolutionApplied,
    based_on_version: Option<VersionToken>,
) -> ResolvedItem {
    ResolvedItem {
        kind: entity.kind,
        id: entity.id.clone(),
        final_data,
        resolution_applied: applied,
        based_on_version,
    }
}

fn ensure_kind(expected: EntityKind, data: &EntityData) -> std::result::Result<(), ItemError> {
    if data.kind() == expected {
        Ok(())
    } else {
        Err(ItemError::KindMismatch {
            expected,
            found: data.kind(),
        })
    }
}
