//! Batch conflict detection.
//!
//! Every staged entity with a client token is looked up once; lookups run
//! concurrently and each is bounded by the configured lookup timeout. A store
//! error aborts the whole detection, a timeout only fails its own item.

use std::sync::Arc;

use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, MissingEntityPolicy};
use crate::error::{Error, Result};
use crate::merge::conflict_fields;
use crate::models::{
    ConflictDetectionResult, ConflictItem, DetectionFailure, EntityRef, EntitySnapshot,
    StagedBatch, StagedEntity, VersionToken, VersionedEntityRef,
};
use crate::store::EntityStore;
use crate::version::compare;

/// Outcome of checking a single staged entity.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityCheck {
    /// Safe to write: new, clean, or ahead of the server
    Clear(VersionedEntityRef),
    Conflict(Box<ConflictItem>),
    /// The server no longer holds the entity
    Missing(EntityRef),
    TimedOut(DetectionFailure),
}

#[derive(Clone)]
pub struct ConflictDetector {
    store: Arc<dyn EntityStore>,
    config: EngineConfig,
}

impl ConflictDetector {
    pub fn new(store: Arc<dyn EntityStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Classify one staged entity against the server.
    pub async fn check_entity(&self, entity: &StagedEntity) -> Result<EntityCheck> {
        let Some(client_version) = entity.client_version.as_ref() else {
            return Ok(EntityCheck::Clear(VersionedEntityRef {
                kind: entity.kind(),
                id: entity.id.clone(),
                client_version: None,
                current_version: None,
            }));
        };

        let entity_ref = entity.entity_ref();
        let lookup = self.store.snapshot(&entity_ref);
        let snapshot = match tokio::time::timeout(self.config.lookup_timeout, lookup).await {
            Ok(Ok(Some(snapshot))) => snapshot,
            Ok(Ok(None)) => return Ok(EntityCheck::Missing(entity_ref)),
            Ok(Err(error)) => return Err(Error::Detection(error)),
            Err(_) => {
                tracing::warn!(
                    entity = %entity_ref,
                    timeout_ms = self.config.lookup_timeout.as_millis(),
                    "Version lookup timed out"
                );
                return Ok(EntityCheck::TimedOut(DetectionFailure {
                    kind: entity_ref.kind,
                    id: entity_ref.id,
                    reason: format!(
                        "version lookup timed out after {}ms",
                        self.config.lookup_timeout.as_millis()
                    ),
                }));
            }
        };

        let comparison = compare(Some(client_version), &snapshot.version);
        if comparison.is_conflict() {
            return Ok(EntityCheck::Conflict(Box::new(conflict_item(
                entity,
                Some(snapshot),
            ))));
        }

        Ok(EntityCheck::Clear(VersionedEntityRef {
            kind: entity.kind(),
            id: entity.id.clone(),
            client_version: comparison.client_version,
            current_version: Some(comparison.current_version),
        }))
    }

    /// Partition a staged batch into conflicts and writable items.
    pub async fn detect_batch_conflicts(
        &self,
        operation_id: &str,
        batch: StagedBatch,
        cancel: &CancellationToken,
    ) -> Result<ConflictDetectionResult> {
        let entities = batch.into_entities();
        self.detect_entities(operation_id, &entities, cancel).await
    }

    pub async fn detect_entities(
        &self,
        operation_id: &str,
        entities: &[StagedEntity],
        cancel: &CancellationToken,
    ) -> Result<ConflictDetectionResult> {
        let checks = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::info!(operation_id, "Conflict detection cancelled");
                return Err(Error::Cancelled(operation_id.to_string()));
            }
            checks = try_join_all(entities.iter().map(|entity| self.check_entity(entity))) => checks?,
        };

        let mut result = ConflictDetectionResult::default();
        for (entity, check) in entities.iter().zip(checks) {
            match check {
                EntityCheck::Clear(clear) => result.non_conflicted.push(clear),
                EntityCheck::Conflict(conflict) => result.conflicts.push(*conflict),
                EntityCheck::Missing(entity_ref) => match self.config.missing_entity_policy {
                    MissingEntityPolicy::Conflict => {
                        result.conflicts.push(conflict_item(entity, None));
                    }
                    MissingEntityPolicy::Skip => {
                        tracing::info!(
                            operation_id,
                            entity = %entity_ref,
                            "Entity deleted on server; skipping"
                        );
                        result.skipped.push(entity_ref);
                    }
                },
                EntityCheck::TimedOut(failure) => result.failed.push(failure),
            }
        }

        tracing::info!(
            operation_id,
            total = entities.len(),
            conflicts = result.conflicts.len(),
            non_conflicted = result.non_conflicted.len(),
            skipped = result.skipped.len(),
            failed = result.failed.len(),
            "Conflict detection finished"
        );
        Ok(result)
    }
}

/// Conflict entry for a staged entity; `None` means the server lost it.
pub(crate) fn conflict_item(
    entity: &StagedEntity,
    snapshot: Option<EntitySnapshot>,
) -> ConflictItem {
    let Some(snapshot) = snapshot else {
        return ConflictItem {
            kind: entity.kind(),
            id: entity.id.clone(),
            name: entity.data.name().to_string(),
            client_version: entity.client_version.clone(),
            current_version: VersionToken::unknown(),
            last_modified: None,
            modified_by: None,
            conflict_fields: Vec::new(),
            client_data: Some(entity.data.clone()),
            server_data: None,
        };
    };

    ConflictItem {
        kind: entity.kind(),
        id: entity.id.clone(),
        name: snapshot.data.name().to_string(),
        client_version: entity.client_version.clone(),
        current_version: snapshot.version,
        last_modified: snapshot.updated_at,
        modified_by: snapshot.updated_by,
        conflict_fields: conflict_fields(&entity.data, &snapshot.data),
        client_data: Some(entity.data.clone()),
        server_data: Some(snapshot.data),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::models::{
        ConflictField, EntityData, EntityKind, IngredientData, PackagingData, RecipeData,
        RecipeLine, Staged,
    };
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn ingredient(name: &str, price: f64) -> IngredientData {
        IngredientData {
            name: name.to_string(),
            unit: Some("kg".to_string()),
            current_price: price,
            price_updated_at: None,
            is_complimentary: false,
            is_active: true,
            supplier: None,
        }
    }

    fn snapshot(id: &str, version: &str, data: impl Into<EntityData>) -> EntitySnapshot {
        EntitySnapshot {
            id: id.to_string(),
            version: VersionToken::new(version),
            data: data.into(),
            updated_at: None,
            updated_by: Some("other-user".to_string()),
        }
    }

    fn staged<T>(id: &str, version: Option<&str>, data: T) -> Staged<T> {
        Staged {
            id: id.to_string(),
            client_version: version.map(VersionToken::new),
            data,
        }
    }

    fn detector(store: &MemoryStore, policy: MissingEntityPolicy) -> ConflictDetector {
        ConflictDetector::new(
            Arc::new(store.clone()),
            EngineConfig::default()
                .with_missing_entity_policy(policy)
                .with_lookup_timeout(Duration::from_millis(100)),
        )
    }

    #[tokio::test]
    async fn partitions_clean_and_stale_items() {
        let store = MemoryStore::from_snapshots([
            snapshot("i1", "v1", ingredient("Flour", 1.0)),
            snapshot("i2", "v2", ingredient("Sugar", 2.0)),
        ]);
        let batch = StagedBatch {
            ingredients: vec![
                staged("i1", Some("v1"), ingredient("Flour", 1.1)),
                staged("i2", Some("v1"), ingredient("Cane sugar", 2.5)),
            ],
            ..StagedBatch::default()
        };

        let result = detector(&store, MissingEntityPolicy::Conflict)
            .detect_batch_conflicts("op", batch, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.total(), 2);
        assert_eq!(result.non_conflicted.len(), 1);
        assert_eq!(result.non_conflicted[0].id, "i1");

        let conflict = &result.conflicts[0];
        assert_eq!(conflict.id, "i2");
        assert_eq!(conflict.name, "Sugar");
        assert_eq!(conflict.current_version.as_str(), "v2");
        assert_eq!(conflict.modified_by.as_deref(), Some("other-user"));
        assert_eq!(
            conflict.conflict_fields,
            vec![ConflictField::Name, ConflictField::CurrentPrice]
        );
    }

    #[tokio::test]
    async fn new_entities_never_conflict() {
        let store = MemoryStore::from_snapshots([snapshot("i1", "9", ingredient("Flour", 1.0))]);
        let batch = StagedBatch {
            ingredients: vec![
                staged("i1", None, ingredient("Flour", 1.0)),
                staged("fresh", None, ingredient("Yeast", 3.0)),
            ],
            ..StagedBatch::default()
        };

        let result = detector(&store, MissingEntityPolicy::Conflict)
            .detect_batch_conflicts("op", batch, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.conflicts.is_empty());
        assert_eq!(result.non_conflicted.len(), 2);
        assert!(result.non_conflicted.iter().all(|r| r.current_version.is_none()));
    }

    #[tokio::test]
    async fn recipe_and_packaging_use_their_own_rules() {
        let server_recipe = RecipeData {
            name: "Baguette".to_string(),
            version: Some("4".to_string()),
            yield_quantity: None,
            lines: vec![RecipeLine {
                ingredient_id: "i1".to_string(),
                quantity: 500.0,
                unit: Some("g".to_string()),
            }],
        };
        let server_box = PackagingData {
            name: "Bread bag".to_string(),
            packaging_type: "bag".to_string(),
            unit_cost: Some(0.08),
            is_active: true,
        };
        let store = MemoryStore::from_snapshots([
            snapshot("r1", "5", server_recipe.clone()),
            snapshot("p1", "2025-02-01T00:00:00Z", server_box.clone()),
        ]);

        let mut client_box = server_box;
        client_box.unit_cost = Some(0.1);
        let batch = StagedBatch {
            recipes: vec![staged("r1", Some("3"), server_recipe)],
            packaging: vec![staged("p1", Some("2025-01-01T00:00:00Z"), client_box)],
            ..StagedBatch::default()
        };

        let result = detector(&store, MissingEntityPolicy::Conflict)
            .detect_batch_conflicts("op", batch, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.conflicts.len(), 2);
        assert_eq!(result.conflicts[0].kind, EntityKind::Recipe);
        assert_eq!(result.conflicts[0].conflict_fields, vec![ConflictField::Version]);
        assert_eq!(result.conflicts[1].kind, EntityKind::Packaging);
        assert_eq!(
            result.conflicts[1].conflict_fields,
            vec![ConflictField::UnitCost]
        );
    }

    #[tokio::test]
    async fn missing_entity_follows_policy() {
        let store = MemoryStore::new();
        let batch = StagedBatch {
            ingredients: vec![staged("gone", Some("v1"), ingredient("Rye", 1.0))],
            ..StagedBatch::default()
        };

        let as_conflict = detector(&store, MissingEntityPolicy::Conflict)
            .detect_batch_conflicts("op", batch.clone(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(as_conflict.conflicts.len(), 1);
        assert!(as_conflict.conflicts[0].is_deleted_on_server());
        assert_eq!(as_conflict.conflicts[0].current_version.as_str(), "unknown");

        let skipped = detector(&store, MissingEntityPolicy::Skip)
            .detect_batch_conflicts("op", batch, &CancellationToken::new())
            .await
            .unwrap();
        assert!(skipped.conflicts.is_empty());
        assert!(skipped.non_conflicted.is_empty());
        assert_eq!(
            skipped.skipped,
            vec![EntityRef::new(EntityKind::Ingredient, "gone")]
        );
    }

    #[tokio::test]
    async fn check_entity_reports_missing_regardless_of_policy() {
        let store = MemoryStore::new();
        let entity = StagedEntity::from(staged("gone", Some("v1"), ingredient("Rye", 1.0)));
        let check = detector(&store, MissingEntityPolicy::Skip)
            .check_entity(&entity)
            .await
            .unwrap();
        assert_eq!(check, EntityCheck::Missing(entity.entity_ref()));
    }

    #[tokio::test]
    async fn unreachable_store_fails_the_whole_batch() {
        let store = MemoryStore::from_snapshots([snapshot("i1", "v1", ingredient("Flour", 1.0))]);
        store.set_unavailable(true).await;
        let batch = StagedBatch {
            ingredients: vec![staged("i1", Some("v1"), ingredient("Flour", 1.0))],
            ..StagedBatch::default()
        };

        let err = detector(&store, MissingEntityPolicy::Conflict)
            .detect_batch_conflicts("op", batch, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Detection(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_lookup_fails_only_its_item() {
        let store = MemoryStore::from_snapshots([
            snapshot("i1", "v1", ingredient("Flour", 1.0)),
            snapshot("i2", "v1", ingredient("Sugar", 1.0)),
        ]);
        store
            .delay_lookups_for(
                EntityRef::new(EntityKind::Ingredient, "i2"),
                Duration::from_secs(30),
            )
            .await;
        let batch = StagedBatch {
            ingredients: vec![
                staged("i1", Some("v1"), ingredient("Flour", 1.0)),
                staged("i2", Some("v1"), ingredient("Sugar", 1.0)),
            ],
            ..StagedBatch::default()
        };

        let result = detector(&store, MissingEntityPolicy::Conflict)
            .detect_batch_conflicts("op", batch, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.non_conflicted.len(), 1);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].id, "i2");
        assert!(!result.is_clean());
    }

    #[tokio::test]
    async fn cancelled_detection_returns_cancelled() {
        let store = MemoryStore::from_snapshots([snapshot("i1", "v1", ingredient("Flour", 1.0))]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let batch = StagedBatch {
            ingredients: vec![staged("i1", Some("v1"), ingredient("Flour", 1.0))],
            ..StagedBatch::default()
        };

        let err = detector(&store, MissingEntityPolicy::Conflict)
            .detect_batch_conflicts("op-x", batch, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(id) if id == "op-x"));
    }
}
