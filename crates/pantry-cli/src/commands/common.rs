use std::path::Path;

use pantry_core::audit::StoredAuditEntry;
use pantry_core::models::{ConflictDetectionResult, EntitySnapshot, ResolutionResult};
use pantry_core::store::MemoryStore;
use pantry_core::{VersionComparison, VersionStatus, VersionToken};
use serde::de::DeserializeOwned;

use crate::error::CliError;

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CliError> {
    let payload = std::fs::read_to_string(path).map_err(|source| CliError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&payload).map_err(|source| CliError::InvalidFile {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_store(path: &Path) -> Result<MemoryStore, CliError> {
    let snapshots: Vec<EntitySnapshot> = read_json(path)?;
    tracing::info!(path = %path.display(), entities = snapshots.len(), "Loaded snapshot");
    Ok(MemoryStore::from_snapshots(snapshots))
}

/// `-` or an empty argument means the entity was never saved.
pub fn parse_client_token(raw: &str) -> Option<VersionToken> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "-" {
        None
    } else {
        Some(VersionToken::new(trimmed))
    }
}

pub fn format_comparison(comparison: &VersionComparison) -> String {
    let client = comparison
        .client_version
        .as_ref()
        .map_or("(new)", VersionToken::as_str);
    let verdict = match comparison.status {
        VersionStatus::NewEntity => "new entity, nothing to compare",
        VersionStatus::Clean => "clean",
        VersionStatus::Ahead => "client ahead of server (accepted)",
        VersionStatus::Conflict => "conflict",
    };
    format!(
        "{verdict}: client {client}, server {}",
        comparison.current_version
    )
}

pub fn format_detection_lines(
    operation_id: &str,
    result: &ConflictDetectionResult,
) -> Vec<String> {
    let mut lines = vec![format!(
        "operation {operation_id}: {} conflict(s), {} clean, {} skipped, {} failed",
        result.conflicts.len(),
        result.non_conflicted.len(),
        result.skipped.len(),
        result.failed.len()
    )];
    for conflict in &result.conflicts {
        let fields: Vec<&str> = conflict
            .conflict_fields
            .iter()
            .map(|field| field.as_str())
            .collect();
        let client = conflict
            .client_version
            .as_ref()
            .map_or("(new)", VersionToken::as_str);
        let by = conflict
            .modified_by
            .as_deref()
            .map(|user| format!(" by {user}"))
            .unwrap_or_default();
        let detail = if conflict.is_deleted_on_server() {
            "deleted on server".to_string()
        } else if fields.is_empty() {
            "no field differences".to_string()
        } else {
            fields.join(", ")
        };
        lines.push(format!(
            "  CONFLICT {}:{} \"{}\" {client} -> {}{by} [{detail}]",
            conflict.kind, conflict.id, conflict.name, conflict.current_version
        ));
    }
    for skipped in &result.skipped {
        lines.push(format!("  SKIPPED  {skipped}"));
    }
    for failed in &result.failed {
        lines.push(format!("  FAILED   {}:{} {}", failed.kind, failed.id, failed.reason));
    }
    lines
}

pub fn format_resolution_lines(result: &ResolutionResult) -> Vec<String> {
    let mut lines = vec![format!(
        "{} resolved, {} unresolved (audit trail {})",
        result.resolved.len(),
        result.unresolved.len(),
        result.audit_trail
    )];
    for item in &result.resolved {
        lines.push(format!(
            "  {:<20} {}:{}",
            item.resolution_applied.as_str(),
            item.kind,
            item.id
        ));
    }
    for item in &result.unresolved {
        lines.push(format!(
            "  {:<20} {}:{} {}",
            item.error, item.kind, item.id, item.reason
        ));
    }
    lines
}

pub fn format_audit_lines(entries: &[StoredAuditEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            format!(
                "  {} {:?} [{}]",
                entry.receipt.timestamp.format("%H:%M:%S%.3f"),
                entry.record.kind,
                entry.record.affected_ids.join(", ")
            )
        })
        .collect()
}
