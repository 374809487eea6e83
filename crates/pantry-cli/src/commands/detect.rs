use std::path::Path;
use std::sync::Arc;

use pantry_core::audit::MemoryAuditSink;
use pantry_core::models::{ConflictDetectionResult, StagedBatch};
use pantry_core::{BatchCommitCoordinator, EngineConfig};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::commands::common::{format_detection_lines, load_store, read_json};
use crate::error::CliError;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DetectOutput<'a> {
    operation_id: &'a str,
    #[serde(flatten)]
    result: &'a ConflictDetectionResult,
}

pub async fn run_detect(
    snapshot_path: &Path,
    batch_path: &Path,
    operation_id: Option<&str>,
    user_id: &str,
    as_json: bool,
    config: EngineConfig,
) -> Result<(), CliError> {
    let store = load_store(snapshot_path)?;
    let batch: StagedBatch = read_json(batch_path)?;
    let coordinator = BatchCommitCoordinator::new(
        Arc::new(store),
        Arc::new(MemoryAuditSink::new()),
        config,
    );

    let (operation, result) = coordinator
        .detect(operation_id, user_id, batch, &CancellationToken::new())
        .await?;

    if as_json {
        let output = DetectOutput {
            operation_id: operation.operation_id(),
            result: &result,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        for line in format_detection_lines(operation.operation_id(), &result) {
            println!("{line}");
        }
    }
    Ok(())
}
