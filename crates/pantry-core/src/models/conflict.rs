//! Conflict detection output

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::EntityData;
use super::kind::{EntityKind, EntityRef};
use super::token::VersionToken;

/// Semantic field that differs between the client edit and the server copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictField {
    Name,
    CurrentPrice,
    IsComplimentary,
    IsActive,
    Version,
    Lines,
    UnitCost,
    PackagingType,
}

impl ConflictField {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::CurrentPrice => "currentPrice",
            Self::IsComplimentary => "isComplimentary",
            Self::IsActive => "isActive",
            Self::Version => "version",
            Self::Lines => "lines",
            Self::UnitCost => "unitCost",
            Self::PackagingType => "packagingType",
        }
    }
}

/// A staged entity whose client token is behind the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictItem {
    pub kind: EntityKind,
    pub id: String,
    pub name: String,
    pub client_version: Option<VersionToken>,
    pub current_version: VersionToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_by: Option<String>,
    #[serde(default)]
    pub conflict_fields: Vec<ConflictField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_data: Option<EntityData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_data: Option<EntityData>,
}

impl ConflictItem {
    #[must_use]
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind, self.id.clone())
    }

    /// The server no longer holds this entity.
    #[must_use]
    pub fn is_deleted_on_server(&self) -> bool {
        self.current_version.is_unknown()
    }
}

/// A staged entity that can be written as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedEntityRef {
    pub kind: EntityKind,
    pub id: String,
    pub client_version: Option<VersionToken>,
    /// `None` for entities that do not exist server-side yet
    pub current_version: Option<VersionToken>,
}

impl VersionedEntityRef {
    #[must_use]
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind, self.id.clone())
    }
}

/// An item whose server lookup did not finish (timeout).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionFailure {
    pub kind: EntityKind,
    pub id: String,
    pub reason: String,
}

/// Partition of a staged batch.
///
/// Every input entity lands in exactly one list. `skipped` only fills up under
/// [`MissingEntityPolicy::Skip`](crate::config::MissingEntityPolicy::Skip);
/// `failed` holds items whose lookup timed out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetectionResult {
    pub conflicts: Vec<ConflictItem>,
    pub non_conflicted: Vec<VersionedEntityRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<EntityRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<DetectionFailure>,
}

impl ConflictDetectionResult {
    #[must_use]
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Clean when nothing conflicted and every lookup finished.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty() && self.failed.is_empty()
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.conflicts.len() + self.non_conflicted.len() + self.skipped.len() + self.failed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_fields_serialize_camel_case() {
        let json = serde_json::to_string(&vec![
            ConflictField::CurrentPrice,
            ConflictField::PackagingType,
        ])
        .unwrap();
        assert_eq!(json, r#"["currentPrice","packagingType"]"#);
        assert_eq!(ConflictField::IsActive.as_str(), "isActive");
    }

    #[test]
    fn detection_result_counts_every_list() {
        let result = ConflictDetectionResult {
            conflicts: Vec::new(),
            non_conflicted: vec![VersionedEntityRef {
                kind: EntityKind::Recipe,
                id: "r1".to_string(),
                client_version: Some(VersionToken::new("1")),
                current_version: Some(VersionToken::new("1")),
            }],
            skipped: vec![EntityRef::new(EntityKind::Ingredient, "i1")],
            failed: Vec::new(),
        };
        assert_eq!(result.total(), 2);
        assert!(result.is_clean());
        assert!(!result.has_conflicts());
    }
}
