//! Resolution requests and results

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::entity::EntityData;
use super::kind::{EntityKind, EntityRef};
use super::token::VersionToken;
use crate::error::ItemError;

/// How the user chose to settle one conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    Refresh,
    OverrideWithClient,
    OverrideWithServer,
    AttemptMerge,
}

impl ResolutionStrategy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Refresh => "refresh",
            Self::OverrideWithClient => "override_with_client",
            Self::OverrideWithServer => "override_with_server",
            Self::AttemptMerge => "attempt_merge",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = ItemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "refresh" => Ok(Self::Refresh),
            "override_with_client" => Ok(Self::OverrideWithClient),
            "override_with_server" => Ok(Self::OverrideWithServer),
            "attempt_merge" => Ok(Self::AttemptMerge),
            other => Err(ItemError::UnknownResolutionStrategy(other.to_string())),
        }
    }
}

/// Named auto-merge algorithm. Only recipes have more than one way to merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    UnionIngredients,
}

impl MergeStrategy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnionIngredients => "union_ingredients",
        }
    }
}

impl FromStr for MergeStrategy {
    type Err = ItemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "union_ingredients" => Ok(Self::UnionIngredients),
            other => Err(ItemError::UnknownMergeStrategy(other.to_string())),
        }
    }
}

/// What ended up being applied to a resolved item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionApplied {
    Refresh,
    OverrideWithClient,
    OverrideWithServer,
    Merged,
    NoConflict,
}

impl ResolutionApplied {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Refresh => "refresh",
            Self::OverrideWithClient => "override_with_client",
            Self::OverrideWithServer => "override_with_server",
            Self::Merged => "merged",
            Self::NoConflict => "no_conflict",
        }
    }

    /// Refresh and server-override adopt what the store already holds.
    #[must_use]
    pub const fn requires_write(self) -> bool {
        match self {
            Self::Refresh | Self::OverrideWithServer => false,
            Self::OverrideWithClient | Self::Merged | Self::NoConflict => true,
        }
    }
}

/// A conflict plus the strategy picked for it.
///
/// `resolution` and `merge_strategy` stay as raw strings so an unrecognized
/// value fails only its own item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictedItem {
    pub kind: EntityKind,
    pub id: String,
    pub resolution: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_data: Option<EntityData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_data: Option<EntityData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_strategy: Option<String>,
    /// Server token reported with the conflict; guards the override write
    /// when the server cannot be re-read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<VersionToken>,
}

impl ConflictedItem {
    #[must_use]
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind, self.id.clone())
    }
}

/// An item that passed detection and is written through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonConflictedItem {
    pub kind: EntityKind,
    pub id: String,
    pub data: EntityData,
    /// Token the client staged against; re-checked right before the write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<VersionToken>,
}

impl NonConflictedItem {
    #[must_use]
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind, self.id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionRequest {
    #[serde(default)]
    pub conflicted_items: Vec<ConflictedItem>,
    #[serde(default)]
    pub non_conflicted_items: Vec<NonConflictedItem>,
    pub user_id: String,
    pub operation_id: String,
}

impl ResolutionRequest {
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.conflicted_items.len() + self.non_conflicted_items.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedItem {
    pub kind: EntityKind,
    pub id: String,
    pub final_data: EntityData,
    pub resolution_applied: ResolutionApplied,
    /// Server token the final data was computed against, when one was read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub based_on_version: Option<VersionToken>,
}

impl ResolvedItem {
    #[must_use]
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind, self.id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnresolvedItem {
    pub kind: EntityKind,
    pub id: String,
    /// Stable error code, e.g. `MISSING_MERGE_INPUTS`
    pub error: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionResult {
    pub resolved: Vec<ResolvedItem>,
    pub unresolved: Vec<UnresolvedItem>,
    /// Operation id the audit records for this resolution are keyed by
    pub audit_trail: String,
}

impl ResolutionResult {
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.resolved.len() + self.unresolved.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategies_parse_from_wire_names() {
        assert_eq!(
            "override_with_client".parse::<ResolutionStrategy>().unwrap(),
            ResolutionStrategy::OverrideWithClient
        );
        let err = "keep_both".parse::<ResolutionStrategy>().unwrap_err();
        assert!(matches!(err, ItemError::UnknownResolutionStrategy(name) if name == "keep_both"));
    }

    #[test]
    fn merge_strategy_rejects_unknown_names() {
        assert_eq!(
            "union_ingredients".parse::<MergeStrategy>().unwrap(),
            MergeStrategy::UnionIngredients
        );
        assert!(matches!(
            "intersect".parse::<MergeStrategy>(),
            Err(ItemError::UnknownMergeStrategy(_))
        ));
    }

    #[test]
    fn only_adopting_server_state_skips_the_write() {
        assert!(!ResolutionApplied::Refresh.requires_write());
        assert!(!ResolutionApplied::OverrideWithServer.requires_write());
        assert!(ResolutionApplied::OverrideWithClient.requires_write());
        assert!(ResolutionApplied::Merged.requires_write());
        assert!(ResolutionApplied::NoConflict.requires_write());
    }

    #[test]
    fn request_parses_camel_case_body() {
        let request: ResolutionRequest = serde_json::from_str(
            r#"{
                "conflictedItems": [{"kind": "recipe", "id": "r1", "resolution": "attempt_merge", "mergeStrategy": "union_ingredients"}],
                "nonConflictedItems": [{"kind": "packaging", "id": "p1", "data": {"kind": "packaging", "name": "Tin"}}],
                "userId": "staff-1",
                "operationId": "op-1"
            }"#,
        )
        .unwrap();
        assert_eq!(request.item_count(), 2);
        assert_eq!(
            request.conflicted_items[0].merge_strategy.as_deref(),
            Some("union_ingredients")
        );
    }
}
