use std::path::Path;
use std::sync::Arc;

use pantry_core::audit::{AuditTrailLinker, MemoryAuditSink, StoredAuditEntry};
use pantry_core::models::{ResolutionRequest, ResolutionResult};
use pantry_core::{BatchCommitCoordinator, EngineConfig, ResolutionCommit, ResolutionEngine};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::commands::common::{format_audit_lines, format_resolution_lines, load_store, read_json};
use crate::error::CliError;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResolveOutput<'a> {
    resolution: &'a ResolutionResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    commit: Option<&'a ResolutionCommit>,
    audit: &'a [StoredAuditEntry],
}

pub async fn run_resolve(
    snapshot_path: &Path,
    request_path: &Path,
    commit: bool,
    output_path: Option<&Path>,
    as_json: bool,
    config: EngineConfig,
) -> Result<(), CliError> {
    let store = load_store(snapshot_path)?;
    let request: ResolutionRequest = read_json(request_path)?;
    if request.operation_id.trim().is_empty() {
        return Err(CliError::InvalidArgument(
            "resolution request needs an operationId".to_string(),
        ));
    }
    let sink = MemoryAuditSink::new();
    let cancel = CancellationToken::new();

    let (resolution, committed) = if commit {
        let coordinator =
            BatchCommitCoordinator::new(Arc::new(store.clone()), Arc::new(sink.clone()), config);
        let report = coordinator.resolve_and_commit(&request, &cancel).await?;
        (report.resolution, Some(report.commit))
    } else {
        let engine = ResolutionEngine::new(
            Arc::new(store.clone()),
            AuditTrailLinker::new(Arc::new(sink.clone()), config.audit_timeout),
            config,
        );
        (engine.resolve_conflicts(&request, &cancel).await?, None)
    };
    let audit = sink.entries_for(&request.operation_id).await;

    if let Some(path) = output_path {
        std::fs::write(path, store.to_json().await?)?;
        tracing::info!(path = %path.display(), "Wrote resulting snapshot");
    }

    if as_json {
        let output = ResolveOutput {
            resolution: &resolution,
            commit: committed.as_ref(),
            audit: &audit,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    for line in format_resolution_lines(&resolution) {
        println!("{line}");
    }
    if let Some(commit) = &committed {
        println!("{}", describe_commit(commit));
    }
    println!("audit:");
    for line in format_audit_lines(&audit) {
        println!("{line}");
    }
    Ok(())
}

pub fn describe_commit(commit: &ResolutionCommit) -> String {
    match commit {
        ResolutionCommit::Refreshed => "commit: nothing to write, server state adopted".to_string(),
        ResolutionCommit::Committed(report) => format!(
            "commit: {} entity(ies) written under {}",
            report.committed.len(),
            report.operation_id
        ),
        ResolutionCommit::Blocked { unresolved } => {
            format!("commit: blocked by {unresolved} unresolved item(s)")
        }
        ResolutionCommit::Conflicts {
            conflicts,
            non_conflicted,
        } => format!(
            "commit: {} entity(ies) changed again before the write; rolled back, {} still writable",
            conflicts.len(),
            non_conflicted.len()
        ),
    }
}
