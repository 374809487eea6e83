//! Storage collaborator boundary
//!
//! The metaobject store itself lives outside this crate. The engine only
//! needs version lookups, snapshots and per-entity writes.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{EntityData, EntityRef, EntitySnapshot, VersionToken};

/// Errors raised by an [`EntityStore`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or answered with a server error
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the written fields
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The entity to update or delete does not exist
    #[error("Entity not found: {0}")]
    NotFound(EntityRef),

    /// The store did not answer in time
    #[error("Store call timed out after {0}ms")]
    Timeout(u128),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Access to the durable entity store.
///
/// Lookups for absent entities return `Ok(None)`, never an error. `write`
/// creates the entity when it does not exist yet and must not bump the
/// version when called again with identical data.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Current version token of an entity
    async fn current_version(&self, entity: &EntityRef) -> StoreResult<Option<VersionToken>>;

    /// Current fields, version and modification metadata of an entity
    async fn snapshot(&self, entity: &EntityRef) -> StoreResult<Option<EntitySnapshot>>;

    /// Replace the fields of an entity and return its new version token
    async fn write(
        &self,
        entity: &EntityRef,
        data: &EntityData,
        user_id: &str,
    ) -> StoreResult<VersionToken>;

    /// Create an entity under a store-assigned id
    async fn create(&self, data: &EntityData, user_id: &str) -> StoreResult<EntitySnapshot>;

    /// Remove an entity
    async fn delete(&self, entity: &EntityRef) -> StoreResult<()>;
}
