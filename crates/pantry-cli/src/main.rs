//! Pantry CLI - inspect version conflicts offline
//!
//! Runs the conflict engine against snapshot files instead of a live store,
//! which makes it handy for reproducing a reported conflict.

mod cli;
mod commands;
mod error;


use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::compare::run_compare;
use crate::commands::detect::run_detect;
use crate::commands::resolve::run_resolve;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                "pantry_cli=info"
                    .parse()
                    .map_err(|error| CliError::InvalidArgument(format!("{error}")))?,
            ),
        )
        .init();

    let config = cli.engine.to_engine_config()?;
    match cli.command {
        Commands::Compare {
            client,
            server,
            json,
        } => run_compare(&client, &server, json)?,
        Commands::Detect {
            snapshot,
            batch,
            operation_id,
            user,
            json,
        } => {
            run_detect(
                &snapshot,
                &batch,
                operation_id.as_deref(),
                &user,
                json,
                config,
            )
            .await?;
        }
        Commands::Resolve {
            snapshot,
            request,
            commit,
            output,
            json,
        } => {
            run_resolve(
                &snapshot,
                &request,
                commit,
                output.as_deref(),
                json,
                config,
            )
            .await?;
        }
    }

    Ok(())
}
