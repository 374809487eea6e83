//! Entity kinds and references

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The metaobject types the global save can touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Ingredient,
    Recipe,
    Packaging,
}

impl EntityKind {
    pub const ALL: [Self; 3] = [Self::Ingredient, Self::Recipe, Self::Packaging];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ingredient => "ingredient",
            Self::Recipe => "recipe",
            Self::Packaging => "packaging",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ingredient" => Ok(Self::Ingredient),
            "recipe" => Ok(Self::Recipe),
            "packaging" => Ok(Self::Packaging),
            other => Err(format!("unknown entity kind: {other}")),
        }
    }
}

/// Identity of one entity: its kind plus its store id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}
