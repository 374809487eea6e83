//! Data models for Pantry

mod conflict;
mod entity;
mod kind;
mod resolution;
mod token;

pub use conflict::{
    ConflictDetectionResult, ConflictField, ConflictItem, DetectionFailure, VersionedEntityRef,
};
pub use entity::{
    EntityData, EntitySnapshot, IngredientData, PackagingData, RecipeData, RecipeLine, Staged,
    StagedBatch, StagedEntity,
};
pub use kind::{EntityKind, EntityRef};
pub use resolution::{
    ConflictedItem, MergeStrategy, NonConflictedItem, ResolutionApplied, ResolutionRequest,
    ResolutionResult, ResolutionStrategy, ResolvedItem, UnresolvedItem,
};
pub use token::{TokenShape, VersionToken};
