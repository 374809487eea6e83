//! Version token comparison.
//!
//! Timestamp tokens compare by instant, integer tokens numerically. Mixed or
//! unrecognized shapes fall back to string equality, where any difference
//! counts as a conflict.
//!
//! A client token *ahead* of the server is accepted. Tokens are only ever
//! issued by the store, so a forward token is unexpected; it is reported as
//! [`VersionStatus::Ahead`] and logged rather than rejected.

use std::cmp::Ordering;

use serde::Serialize;

use crate::models::{TokenShape, VersionToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    /// No client token: the entity was never persisted
    NewEntity,
    /// Tokens are identical
    Clean,
    /// Client token is newer than the server's
    Ahead,
    /// Client edited an older version than the server holds
    Conflict,
}

/// Verdict for one (client, server) token pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionComparison {
    pub status: VersionStatus,
    pub client_version: Option<VersionToken>,
    pub current_version: VersionToken,
}

impl VersionComparison {
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.status == VersionStatus::Conflict
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.status == VersionStatus::Clean
    }

    #[must_use]
    pub fn is_new_entity(&self) -> bool {
        self.status == VersionStatus::NewEntity
    }
}

/// Classify a client token against the server's current token.
#[must_use]
pub fn compare(client: Option<&VersionToken>, server: &VersionToken) -> VersionComparison {
    let status = client.map_or(VersionStatus::NewEntity, |client| status_of(client, server));
    if status == VersionStatus::Ahead {
        tracing::debug!(
            client_version = %client.map(VersionToken::as_str).unwrap_or_default(),
            current_version = %server,
            "Client version token is ahead of the server"
        );
    }

    VersionComparison {
        status,
        client_version: client.cloned(),
        current_version: server.clone(),
    }
}

fn status_of(client: &VersionToken, server: &VersionToken) -> VersionStatus {
    if client.as_str() == server.as_str() {
        return VersionStatus::Clean;
    }

    let ordering = match (client.shape(), server.shape()) {
        (TokenShape::Timestamp(client), TokenShape::Timestamp(server)) => client.cmp(&server),
        (TokenShape::Integer(client), TokenShape::Integer(server)) => client.cmp(&server),
        (
            TokenShape::Integer(_) | TokenShape::LargeInteger,
            TokenShape::Integer(_) | TokenShape::LargeInteger,
        ) => match client.cmp_digits(server) {
            Some(ordering) => ordering,
            None => return VersionStatus::Conflict,
        },
        _ => return VersionStatus::Conflict,
    };

    match ordering {
        Ordering::Less => VersionStatus::Conflict,
        // Same instant written differently, e.g. `Z` vs `+00:00`
        Ordering::Equal => VersionStatus::Clean,
        Ordering::Greater => VersionStatus::Ahead,
    }
}
