use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use pantry_core::{EngineConfig, MissingEntityPolicy};

use crate::error::CliError;

#[derive(Parser)]
#[command(name = "pantry")]
#[command(about = "Inspect and resolve Pantry version conflicts against snapshot files")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub engine: EngineArgs,
}

#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    /// Per-lookup timeout in milliseconds
    #[arg(long, global = true, value_name = "MS", default_value_t = 5_000)]
    pub lookup_timeout_ms: u64,

    /// Audit write timeout in milliseconds
    #[arg(long, global = true, value_name = "MS", default_value_t = 2_000)]
    pub audit_timeout_ms: u64,

    /// What to do with staged entities the snapshot no longer holds (conflict or skip)
    #[arg(long, global = true, value_name = "POLICY", default_value = "conflict")]
    pub missing_entity_policy: String,
}

impl EngineArgs {
    pub fn to_engine_config(&self) -> Result<EngineConfig, CliError> {
        if !(50..=60_000).contains(&self.lookup_timeout_ms) {
            return Err(CliError::InvalidArgument(
                "--lookup-timeout-ms must be in [50, 60000]".to_string(),
            ));
        }
        if !(10..=30_000).contains(&self.audit_timeout_ms) {
            return Err(CliError::InvalidArgument(
                "--audit-timeout-ms must be in [10, 30000]".to_string(),
            ));
        }
        let policy = self
            .missing_entity_policy
            .parse::<MissingEntityPolicy>()
            .map_err(CliError::InvalidArgument)?;
        Ok(EngineConfig::default()
            .with_lookup_timeout(Duration::from_millis(self.lookup_timeout_ms))
            .with_audit_timeout(Duration::from_millis(self.audit_timeout_ms))
            .with_missing_entity_policy(policy))
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compare a client version token with a server token
    Compare {
        /// Client token; `-` for an entity that was never saved
        client: String,
        /// Current server token
        server: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Dry-run conflict detection for a staged batch
    Detect {
        /// JSON array of entity snapshots standing in for the store
        #[arg(long, value_name = "PATH")]
        snapshot: PathBuf,
        /// Staged batch JSON ({ ingredients, recipes, packaging })
        #[arg(long, value_name = "PATH")]
        batch: PathBuf,
        /// Operation id (generated when omitted)
        #[arg(long, value_name = "ID")]
        operation_id: Option<String>,
        /// User recorded in the audit trail
        #[arg(long, value_name = "ID", default_value = "cli")]
        user: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve conflicts from a resolution request
    Resolve {
        /// JSON array of entity snapshots standing in for the store
        #[arg(long, value_name = "PATH")]
        snapshot: PathBuf,
        /// Resolution request JSON
        #[arg(long, value_name = "PATH")]
        request: PathBuf,
        /// Commit the resolved data into the in-memory copy
        #[arg(long)]
        commit: bool,
        /// Write the resulting snapshots here (requires --commit)
        #[arg(short, long, value_name = "PATH", requires = "commit")]
        output: Option<PathBuf>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}
