//! In-process [`EntityStore`] used by tests, the dev API server and the CLI.
//!
//! Ingredients and packaging are stamped with millisecond timestamps, recipes
//! with an increasing integer, mirroring how the metaobject store versions
//! each type.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{EntityStore, StoreError, StoreResult};
use crate::models::{EntityData, EntityKind, EntityRef, EntitySnapshot, TokenShape, VersionToken};

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    entities: HashMap<EntityRef, EntitySnapshot>,
    last_stamp: Option<DateTime<Utc>>,
    failing_writes: HashSet<EntityRef>,
    lookup_delays: HashMap<EntityRef, Duration>,
    unavailable: bool,
    writes: u64,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store holding the given snapshots verbatim.
    #[must_use]
    pub fn from_snapshots(snapshots: impl IntoIterator<Item = EntitySnapshot>) -> Self {
        let entities = snapshots
            .into_iter()
            .map(|snapshot| (snapshot.entity_ref(), snapshot))
            .collect();
        Self {
            state: Arc::new(RwLock::new(MemoryState {
                entities,
                ..MemoryState::default()
            })),
        }
    }

    /// Parse a JSON array of snapshots.
    pub fn from_json(payload: &str) -> crate::Result<Self> {
        let snapshots: Vec<EntitySnapshot> = serde_json::from_str(payload)?;
        Ok(Self::from_snapshots(snapshots))
    }

    /// Dump every snapshot as a JSON array, ordered by kind then id.
    pub async fn to_json(&self) -> crate::Result<String> {
        let snapshots = self.snapshots().await;
        Ok(serde_json::to_string_pretty(&snapshots)?)
    }

    pub async fn snapshots(&self) -> Vec<EntitySnapshot> {
        let state = self.state.read().await;
        let mut snapshots: Vec<EntitySnapshot> = state.entities.values().cloned().collect();
        snapshots.sort_by_key(EntitySnapshot::entity_ref);
        snapshots
    }

    /// Make every future write to `entity` fail with a validation error.
    pub async fn fail_writes_for(&self, entity: EntityRef) {
        self.state.write().await.failing_writes.insert(entity);
    }

    pub async fn clear_write_failures(&self) {
        self.state.write().await.failing_writes.clear();
    }

    /// Hold every lookup of `entity` for `delay` before answering.
    pub async fn delay_lookups_for(&self, entity: EntityRef, delay: Duration) {
        self.state.write().await.lookup_delays.insert(entity, delay);
    }

    /// Simulate the store being unreachable.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.write().await.unavailable = unavailable;
    }

    /// Number of writes that changed stored data.
    pub async fn write_count(&self) -> u64 {
        self.state.read().await.writes
    }

    async fn before_lookup(&self, entity: &EntityRef) -> StoreResult<()> {
        let (unavailable, delay) = {
            let state = self.state.read().await;
            (state.unavailable, state.lookup_delays.get(entity).copied())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if unavailable {
            return Err(StoreError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

impl MemoryState {
    fn next_version(&mut self, kind: EntityKind, previous: Option<&VersionToken>) -> VersionToken {
        match kind {
            EntityKind::Recipe => {
                let current = previous
                    .and_then(|token| match token.shape() {
                        TokenShape::Integer(value) => Some(value),
                        TokenShape::Timestamp(_)
                        | TokenShape::LargeInteger
                        | TokenShape::Opaque => None,
                    })
                    .unwrap_or(0);
                VersionToken::from_sequence(current.saturating_add(1))
            }
            EntityKind::Ingredient | EntityKind::Packaging => {
                let now = Utc::now();
                let floor = self
                    .last_stamp
                    .map(|last| last + TimeDelta::milliseconds(1));
                let stamp = floor.map_or(now, |floor| now.max(floor));
                self.last_stamp = Some(stamp);
                VersionToken::from_timestamp(stamp)
            }
        }
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn current_version(&self, entity: &EntityRef) -> StoreResult<Option<VersionToken>> {
        self.before_lookup(entity).await?;
        let state = self.state.read().await;
        Ok(state
            .entities
            .get(entity)
            .map(|snapshot| snapshot.version.clone()))
    }

    async fn snapshot(&self, entity: &EntityRef) -> StoreResult<Option<EntitySnapshot>> {
        self.before_lookup(entity).await?;
        let state = self.state.read().await;
        Ok(state.entities.get(entity).cloned())
    }

    async fn write(
        &self,
        entity: &EntityRef,
        data: &EntityData,
        user_id: &str,
    ) -> StoreResult<VersionToken> {
        let mut state = self.state.write().await;
        if state.unavailable {
            return Err(StoreError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        if state.failing_writes.contains(entity) {
            return Err(StoreError::Validation(format!("write rejected for {entity}")));
        }
        if data.kind() != entity.kind {
            return Err(StoreError::Validation(format!(
                "{} data cannot be written to {entity}",
                data.kind()
            )));
        }

        let previous = state.entities.get(entity).cloned();
        if let Some(existing) = previous.as_ref().filter(|existing| existing.data == *data) {
            return Ok(existing.version.clone());
        }

        let version = state.next_version(entity.kind, previous.as_ref().map(|s| &s.version));
        state.entities.insert(
            entity.clone(),
            EntitySnapshot {
                id: entity.id.clone(),
                version: version.clone(),
                data: data.clone(),
                updated_at: Some(Utc::now()),
                updated_by: Some(user_id.to_string()),
            },
        );
        state.writes += 1;
        Ok(version)
    }

    async fn create(&self, data: &EntityData, user_id: &str) -> StoreResult<EntitySnapshot> {
        let entity = EntityRef::new(data.kind(), Uuid::now_v7().to_string());
        let version = self.write(&entity, data, user_id).await?;
        Ok(EntitySnapshot {
            id: entity.id,
            version,
            data: data.clone(),
            updated_at: Some(Utc::now()),
            updated_by: Some(user_id.to_string()),
        })
    }

    async fn delete(&self, entity: &EntityRef) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.unavailable {
            return Err(StoreError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        if state.failing_writes.contains(entity) {
            return Err(StoreError::Validation(format!("delete rejected for {entity}")));
        }
        state
            .entities
            .remove(entity)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(entity.clone()))
    }
}
