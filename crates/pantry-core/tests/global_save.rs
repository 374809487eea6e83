//! End-to-end global save: detect, resolve, commit.

use std::sync::Arc;

use pantry_core::audit::MemoryAuditSink;
use pantry_core::models::{
    ConflictedItem, EntitySnapshot, IngredientData, NonConflictedItem, RecipeData, RecipeLine,
    ResolutionApplied, ResolutionRequest, Staged, StagedBatch,
};
use pantry_core::store::MemoryStore;
use pantry_core::{
    AuditKind, BatchCommitCoordinator, BatchState, EngineConfig, EntityData, EntityKind,
    EntityRef, EntityStore, MissingEntityPolicy, ResolutionCommit, SaveOutcome, SaveRequest,
    VersionToken,
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
        supplier: Some("Mill & Co".to_string()),
    }
}

fn recipe(lines: &[(&str, f64)]) -> RecipeData {
    RecipeData {
        name: "Sourdough".to_string(),
        version: None,
        yield_quantity: Some(2.0),
        lines: lines
            .iter()
            .map(|(id, quantity)| RecipeLine {
                ingredient_id: (*id).to_string(),
                quantity: *quantity,
                unit: Some("g".to_string()),
            })
            .collect(),
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

fn coordinator(
    store: &MemoryStore,
    sink: &MemoryAuditSink,
    config: EngineConfig,
) -> BatchCommitCoordinator {
    BatchCommitCoordinator::new(Arc::new(store.clone()), Arc::new(sink.clone()), config)
}

#[tokio::test]
async fn stale_ingredient_is_overridden_and_committed() {
    let store = MemoryStore::from_snapshots([
        snapshot("flour", "v1", ingredient("Flour", 1.2)),
        snapshot("butter", "v2", ingredient("Butter", 8.0)),
    ]);
    let sink = MemoryAuditSink::new();
    let coordinator = coordinator(&store, &sink, EngineConfig::default());
    let cancel = CancellationToken::new();

    let staged = StagedBatch {
        ingredients: vec![
            Staged {
                id: "flour".to_string(),
                client_version: Some(VersionToken::new("v1")),
                data: ingredient("Flour", 1.3),
            },
            Staged {
                id: "butter".to_string(),
                client_version: Some(VersionToken::new("v1")),
                data: ingredient("Butter", 7.5),
            },
        ],
        ..StagedBatch::default()
    };
    let outcome = coordinator
        .save(
            SaveRequest {
                operation_id: Some("op-e2e".to_string()),
                user_id: "staff-1".to_string(),
                batch: staged,
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
    assert_eq!(operation_id, "op-e2e");
    assert_eq!(conflicts.len(), 1);
    assert_eq!(non_conflicted.len(), 1);
    assert_eq!(conflicts[0].id, "butter");
    assert_eq!(conflicts[0].current_version, VersionToken::new("v2"));
    assert_eq!(store.write_count().await, 0);

    let request = ResolutionRequest {
        conflicted_items: conflicts
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
            .collect(),
        non_conflicted_items: vec![NonConflictedItem {
            kind: EntityKind::Ingredient,
            id: "flour".to_string(),
            data: ingredient("Flour", 1.3).into(),
            client_version: Some(VersionToken::new("v1")),
        }],
        user_id: "staff-1".to_string(),
        operation_id,
    };

    let report = coordinator.resolve_and_commit(&request, &cancel).await.unwrap();
    assert_eq!(report.resolution.resolved.len(), 2);
    assert!(report.resolution.unresolved.is_empty());
    assert_eq!(report.resolution.item_count(), request.item_count());
    let applied: Vec<ResolutionApplied> = report
        .resolution
        .resolved
        .iter()
        .map(|item| item.resolution_applied)
        .collect();
    assert_eq!(
        applied,
        vec![ResolutionApplied::OverrideWithClient, ResolutionApplied::NoConflict]
    );

    let ResolutionCommit::Committed(commit) = &report.commit else {
        panic!("expected a commit, got {:?}", report.commit);
    };
    assert_eq!(commit.committed.len(), 2);
    assert_eq!(commit.state, BatchState::Committed);

    let butter = store
        .snapshot(&EntityRef::new(EntityKind::Ingredient, "butter"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(butter.data, EntityData::from(ingredient("Butter", 7.5)));
    assert_eq!(butter.updated_by.as_deref(), Some("staff-1"));

    let kinds: Vec<AuditKind> = sink
        .entries_for("op-e2e")
        .await
        .into_iter()
        .map(|entry| entry.record.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            AuditKind::ConflictDetection,
            AuditKind::ConflictOverride,
            AuditKind::ConflictOverride,
            AuditKind::BatchCommit,
        ]
    );
}

#[tokio::test]
async fn recipe_merge_unions_lines_and_commits() {
    let store = MemoryStore::from_snapshots([snapshot(
        "sourdough",
        "7",
        recipe(&[("flour", 500.0), ("salt", 10.0)]),
    )]);
    let sink = MemoryAuditSink::new();
    let coordinator = coordinator(&store, &sink, EngineConfig::default());
    let cancel = CancellationToken::new();

    let outcome = coordinator
        .save(
            SaveRequest {
                operation_id: Some("op-merge".to_string()),
                user_id: "staff-1".to_string(),
                batch: StagedBatch {
                    recipes: vec![Staged {
                        id: "sourdough".to_string(),
                        client_version: Some(VersionToken::new("6")),
                        data: recipe(&[("flour", 450.0), ("water", 350.0)]),
                    }],
                    ..StagedBatch::default()
                },
            },
            &cancel,
        )
        .await
        .unwrap();
    let SaveOutcome::Conflicts { conflicts, .. } = outcome else {
        panic!("expected a conflict, got {outcome:?}");
    };

    let request = ResolutionRequest {
        conflicted_items: vec![ConflictedItem {
            kind: EntityKind::Recipe,
            id: "sourdough".to_string(),
            resolution: "attempt_merge".to_string(),
            client_data: conflicts[0].client_data.clone(),
            server_data: conflicts[0].server_data.clone(),
            merge_strategy: Some("union_ingredients".to_string()),
            server_version: Some(conflicts[0].current_version.clone()),
        }],
        non_conflicted_items: Vec::new(),
        user_id: "staff-1".to_string(),
        operation_id: "op-merge".to_string(),
    };
    let report = coordinator.resolve_and_commit(&request, &cancel).await.unwrap();
    assert!(matches!(report.commit, ResolutionCommit::Committed(_)));

    let merged = store
        .snapshot(&EntityRef::new(EntityKind::Recipe, "sourdough"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(merged.version, VersionToken::new("8"));
    let EntityData::Recipe(merged) = merged.data else {
        panic!("expected recipe data");
    };
    let lines: Vec<(String, f64)> = merged
        .lines
        .into_iter()
        .map(|line| (line.ingredient_id, line.quantity))
        .collect();
    assert_eq!(
        lines,
        vec![
            ("flour".to_string(), 500.0),
            ("salt".to_string(), 10.0),
            ("water".to_string(), 350.0),
        ]
    );
}

#[tokio::test]
async fn skip_policy_drops_entities_deleted_on_server() {
    let store = MemoryStore::from_snapshots([snapshot("flour", "v1", ingredient("Flour", 1.2))]);
    let sink = MemoryAuditSink::new();
    let coordinator = coordinator(
        &store,
        &sink,
        EngineConfig::default().with_missing_entity_policy(MissingEntityPolicy::Skip),
    );

    let outcome = coordinator
        .save(
            SaveRequest {
                operation_id: None,
                user_id: "staff-1".to_string(),
                batch: StagedBatch {
                    ingredients: vec![
                        Staged {
                            id: "flour".to_string(),
                            client_version: Some(VersionToken::new("v1")),
                            data: ingredient("Flour", 1.4),
                        },
                        Staged {
                            id: "yeast".to_string(),
                            client_version: Some(VersionToken::new("v3")),
                            data: ingredient("Yeast", 4.0),
                        },
                    ],
                    ..StagedBatch::default()
                },
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let SaveOutcome::Committed(report) = outcome else {
        panic!("expected a commit, got {outcome:?}");
    };
    assert_eq!(report.committed.len(), 1);
    assert_eq!(
        report.skipped,
        vec![EntityRef::new(EntityKind::Ingredient, "yeast")]
    );
    assert_eq!(store.snapshots().await.len(), 1);
}
