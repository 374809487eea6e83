//! Typed entity payloads and staged batches

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::kind::{EntityKind, EntityRef};
use super::token::VersionToken;

/// Ingredient metaobject fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngredientData {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default)]
    pub current_price: f64,
    /// When `current_price` was last changed; drives price selection on merge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_complimentary: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplier: Option<String>,
}

/// One ingredient usage inside a recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeLine {
    pub ingredient_id: String,
    pub quantity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// Recipe metaobject fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeData {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yield_quantity: Option<f64>,
    #[serde(default)]
    pub lines: Vec<RecipeLine>,
}

/// Packaging metaobject fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackagingData {
    pub name: String,
    #[serde(default)]
    pub packaging_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_cost: Option<f64>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// Entity payload tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EntityData {
    Ingredient(IngredientData),
    Recipe(RecipeData),
    Packaging(PackagingData),
}

impl EntityData {
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Ingredient(_) => EntityKind::Ingredient,
            Self::Recipe(_) => EntityKind::Recipe,
            Self::Packaging(_) => EntityKind::Packaging,
        }
    }

    /// Display name shown in conflict listings
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Ingredient(data) => &data.name,
            Self::Recipe(data) => &data.name,
            Self::Packaging(data) => &data.name,
        }
    }
}

impl From<IngredientData> for EntityData {
    fn from(value: IngredientData) -> Self {
        Self::Ingredient(value)
    }
}

impl From<RecipeData> for EntityData {
    fn from(value: RecipeData) -> Self {
        Self::Recipe(value)
    }
}

impl From<PackagingData> for EntityData {
    fn from(value: PackagingData) -> Self {
        Self::Packaging(value)
    }
}

/// Server-held state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshot {
    pub id: String,
    pub version: VersionToken,
    pub data: EntityData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
}

impl EntitySnapshot {
    #[must_use]
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.data.kind(), self.id.clone())
    }
}

/// A client-side edit of one typed entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Staged<T> {
    pub id: String,
    /// `None` marks an entity that has never been persisted
    #[serde(default)]
    pub client_version: Option<VersionToken>,
    pub data: T,
}

/// A staged edit with its payload erased to [`EntityData`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedEntity {
    pub id: String,
    #[serde(default)]
    pub client_version: Option<VersionToken>,
    pub data: EntityData,
}

impl StagedEntity {
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        self.data.kind()
    }

    #[must_use]
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind(), self.id.clone())
    }

    #[must_use]
    pub const fn is_new(&self) -> bool {
        self.client_version.is_none()
    }
}

impl<T: Into<EntityData>> From<Staged<T>> for StagedEntity {
    fn from(value: Staged<T>) -> Self {
        Self {
            id: value.id,
            client_version: value.client_version,
            data: value.data.into(),
        }
    }
}

/// Everything a single global save submits, grouped by kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedBatch {
    #[serde(default)]
    pub ingredients: Vec<Staged<IngredientData>>,
    #[serde(default)]
    pub recipes: Vec<Staged<RecipeData>>,
    #[serde(default)]
    pub packaging: Vec<Staged<PackagingData>>,
}

impl StagedBatch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.ingredients.len() + self.recipes.len() + self.packaging.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten into one list, ingredients first, then recipes, then packaging.
    #[must_use]
    pub fn into_entities(self) -> Vec<StagedEntity> {
        let mut entities = Vec::with_capacity(self.len());
        entities.extend(self.ingredients.into_iter().map(StagedEntity::from));
        entities.extend(self.recipes.into_iter().map(StagedEntity::from));
        entities.extend(self.packaging.into_iter().map(StagedEntity::from));
        entities
    }
}

const fn default_true() -> bool {
    true
}
