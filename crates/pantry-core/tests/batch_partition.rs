//! Batch-level accounting: every staged entity lands in exactly one bucket
//! and every resolved entity is written or audited exactly once.

use std::collections::HashSet;
use std::sync::Arc;

use pantry_core::audit::MemoryAuditSink;
use pantry_core::models::{
    ConflictedItem, EntitySnapshot, IngredientData, NonConflictedItem, PackagingData, RecipeData,
    ResolutionRequest, Staged, StagedBatch,
};
use pantry_core::store::MemoryStore;
use pantry_core::{
    AuditKind, BatchCommitCoordinator, ConflictDetector, EngineConfig, EntityData, EntityKind,
    EntityRef, MissingEntityPolicy, ResolutionCommit, SaveOutcome, SaveRequest, VersionToken,
};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

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
        updated_by: Some("staff-2".to_string()),
    }
}

fn staged(id: &str, version: &str, price: f64) -> Staged<IngredientData> {
    Staged {
        id: id.to_string(),
        client_version: Some(VersionToken::new(version)),
        data: ingredient(id, price),
    }
}

/// Five ingredients; `a`, `b` and `c` were saved elsewhere since the client read them.
fn pantry() -> MemoryStore {
    MemoryStore::from_snapshots([
        snapshot("a", "v2", ingredient("a", 1.0)),
        snapshot("b", "v2", ingredient("b", 1.0)),
        snapshot("c", "v2", ingredient("c", 1.0)),
        snapshot("d", "v1", ingredient("d", 1.0)),
        snapshot("e", "v1", ingredient("e", 1.0)),
    ])
}

fn override_all(conflicts: &[pantry_core::models::ConflictItem]) -> Vec<ConflictedItem> {
    conflicts
        .iter()
        .map(|conflict| ConflictedItem {
            kind: conflict.kind,
            id: conflict.id.clone(),
            resolution: "override_with_client".to_string(),
            client_data: conflict.client_data.clone(),
            server_data: conflict.server_data.clone(),
            merge_strategy: None,
            server_version: Some(conflict.current_version.clone()),
        })
        .collect()
}

#[tokio::test]
async fn overriding_three_of_five_commits_all_five() {
    let store = pantry();
    let sink = MemoryAuditSink::new();
    let coordinator = BatchCommitCoordinator::new(
        Arc::new(store.clone()),
        Arc::new(sink.clone()),
        EngineConfig::default(),
    );
    let cancel = CancellationToken::new();

    let outcome = coordinator
        .save(
            SaveRequest {
                operation_id: Some("op-five".to_string()),
                user_id: "staff-1".to_string(),
                batch: StagedBatch {
                    ingredients: vec![
                        staged("a", "v1", 2.0),
                        staged("b", "v1", 2.0),
                        staged("c", "v1", 2.0),
                        staged("d", "v1", 2.0),
                        staged("e", "v1", 2.0),
                    ],
                    ..StagedBatch::default()
                },
            },
            &cancel,
        )
        .await
        .unwrap();
    let SaveOutcome::Conflicts {
        operation_id,
        conflicts,
        non_conflicted,
    } = outcome
    else {
        panic!("expected conflicts, got {outcome:?}");
    };
    assert_eq!(conflicts.len(), 3);
    assert_eq!(non_conflicted.len(), 2);

    let request = ResolutionRequest {
        conflicted_items: override_all(&conflicts),
        non_conflicted_items: non_conflicted
            .iter()
            .map(|entity| NonConflictedItem {
                kind: entity.kind,
                id: entity.id.clone(),
                data: ingredient(&entity.id, 2.0).into(),
                client_version: entity.client_version.clone(),
            })
            .collect(),
        user_id: "staff-1".to_string(),
        operation_id,
    };
    let report = coordinator.resolve_and_commit(&request, &cancel).await.unwrap();

    let ResolutionCommit::Committed(commit) = &report.commit else {
        panic!("expected a commit, got {:?}", report.commit);
    };
    let mut committed: Vec<&str> = commit.committed.iter().map(|e| e.id.as_str()).collect();
    committed.sort_unstable();
    assert_eq!(committed, vec!["a", "b", "c", "d", "e"]);

    for snapshot in store.snapshots().await {
        assert_eq!(snapshot.data, EntityData::from(ingredient(&snapshot.id, 2.0)));
    }
}

#[tokio::test]
async fn five_overrides_leave_five_item_records_and_one_batch_record() {
    let store = pantry();
    let sink = MemoryAuditSink::new();
    let coordinator = BatchCommitCoordinator::new(
        Arc::new(store),
        Arc::new(sink.clone()),
        EngineConfig::default(),
    );
    let request = ResolutionRequest {
        conflicted_items: ["a", "b", "c", "d", "e"]
            .into_iter()
            .map(|id| ConflictedItem {
                kind: EntityKind::Ingredient,
                id: id.to_string(),
                resolution: "override_with_client".to_string(),
                client_data: Some(ingredient(id, 3.0).into()),
                server_data: Some(ingredient(id, 1.0).into()),
                merge_strategy: None,
                server_version: None,
            })
            .collect(),
        non_conflicted_items: Vec::new(),
        user_id: "staff-1".to_string(),
        operation_id: "op-audit".to_string(),
    };

    let result = coordinator
        .engine()
        .resolve_conflicts(&request, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.resolved.len(), 5);

    let entries = sink.entries_for("op-audit").await;
    let overrides: Vec<_> = entries
        .iter()
        .filter(|entry| entry.record.kind == AuditKind::ConflictOverride)
        .collect();
    assert_eq!(overrides.len(), 6);
    assert_eq!(entries.len(), 6);

    let batch = overrides
        .iter()
        .find(|entry| entry.record.affected_ids.len() == 5)
        .unwrap();
    assert_eq!(batch.record.metadata["resolved"], 5);
}

fn mixed_store() -> MemoryStore {
    MemoryStore::from_snapshots([
        snapshot("flour", "v1", ingredient("Flour", 1.2)),
        snapshot(
            "bread",
            "5",
            RecipeData {
                name: "Bread".to_string(),
                version: None,
                yield_quantity: None,
                lines: Vec::new(),
            },
        ),
    ])
}

/// A clean ingredient, a stale recipe, a new packaging entity and an
/// ingredient the server no longer holds.
fn mixed_batch() -> StagedBatch {
    StagedBatch {
        ingredients: vec![staged("flour", "v1", 1.5), staged("yeast", "v3", 4.0)],
        recipes: vec![Staged {
            id: "bread".to_string(),
            client_version: Some(VersionToken::new("3")),
            data: RecipeData {
                name: "Bread".to_string(),
                version: None,
                yield_quantity: Some(2.0),
                lines: Vec::new(),
            },
        }],
        packaging: vec![Staged {
            id: "box".to_string(),
            client_version: None,
            data: PackagingData {
                name: "Box".to_string(),
                packaging_type: "box".to_string(),
                unit_cost: Some(0.4),
                is_active: true,
            },
        }],
    }
}

#[tokio::test]
async fn mixed_batch_partitions_every_entity_exactly_once() {
    let cancel = CancellationToken::new();
    let batch = mixed_batch();
    let staged: HashSet<EntityRef> = batch
        .clone()
        .into_entities()
        .iter()
        .map(|entity| entity.entity_ref())
        .collect();

    for policy in [MissingEntityPolicy::Conflict, MissingEntityPolicy::Skip] {
        let detector = ConflictDetector::new(
            Arc::new(mixed_store()),
            EngineConfig::default().with_missing_entity_policy(policy),
        );
        let result = detector
            .detect_batch_conflicts("op-mixed", batch.clone(), &cancel)
            .await
            .unwrap();
        assert!(result.failed.is_empty());

        let buckets: Vec<EntityRef> = result
            .conflicts
            .iter()
            .map(|conflict| conflict.entity_ref())
            .chain(result.non_conflicted.iter().map(|entity| entity.entity_ref()))
            .chain(result.skipped.iter().cloned())
            .collect();
        assert_eq!(buckets.len(), staged.len());
        assert_eq!(buckets.iter().cloned().collect::<HashSet<_>>(), staged);

        let conflicted: HashSet<EntityRef> =
            result.conflicts.iter().map(|c| c.entity_ref()).collect();
        assert!(conflicted.contains(&EntityRef::new(EntityKind::Recipe, "bread")));
        let yeast = EntityRef::new(EntityKind::Ingredient, "yeast");
        match policy {
            MissingEntityPolicy::Conflict => {
                assert_eq!(result.conflicts.len() + result.non_conflicted.len(), 4);
                assert!(conflicted.contains(&yeast));
            }
            MissingEntityPolicy::Skip => {
                assert_eq!(result.skipped, vec![yeast]);
                assert_eq!(result.conflicts.len(), 1);
            }
        }
        assert_eq!(result.non_conflicted.len(), 2);
    }
}
