use pantry_core::{compare, VersionToken};

use crate::commands::common::{format_comparison, parse_client_token};
use crate::error::CliError;

pub fn run_compare(client: &str, server: &str, as_json: bool) -> Result<(), CliError> {
    let server = server.trim();
    if server.is_empty() {
        return Err(CliError::InvalidArgument(
            "server token cannot be empty".to_string(),
        ));
    }
    let client = parse_client_token(client);
    let comparison = compare(client.as_ref(), &VersionToken::new(server));

    if as_json {
        println!("{}", serde_json::to_string_pretty(&comparison)?);
    } else {
        println!("{}", format_comparison(&comparison));
    }
    Ok(())
}
