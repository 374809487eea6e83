//! Engine configuration shared by the API server and the CLI.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_LOOKUP_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_AUDIT_TIMEOUT_MS: u64 = 2_000;

/// What detection does with a staged entity the server no longer has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingEntityPolicy {
    /// Report it as a conflict with `currentVersion = "unknown"`
    #[default]
    Conflict,
    /// Leave it out of both `conflicts` and `nonConflicted`
    Skip,
}

impl MissingEntityPolicy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::Skip => "skip",
        }
    }
}

impl fmt::Display for MissingEntityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MissingEntityPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "conflict" => Ok(Self::Conflict),
            "skip" => Ok(Self::Skip),
            other => Err(format!(
                "unknown missing-entity policy '{other}' (expected conflict or skip)"
            )),
        }
    }
}

/// Timeouts and policies for detector, engine and coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound for each individual store lookup or write
    pub lookup_timeout: Duration,
    /// Upper bound for each audit sink call
    pub audit_timeout: Duration,
    pub missing_entity_policy: MissingEntityPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lookup_timeout: Duration::from_millis(DEFAULT_LOOKUP_TIMEOUT_MS),
            audit_timeout: Duration::from_millis(DEFAULT_AUDIT_TIMEOUT_MS),
            missing_entity_policy: MissingEntityPolicy::default(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub const fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_audit_timeout(mut self, timeout: Duration) -> Self {
        self.audit_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_missing_entity_policy(mut self, policy: MissingEntityPolicy) -> Self {
        self.missing_entity_policy = policy;
        self
    }
}
