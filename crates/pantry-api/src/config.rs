use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use pantry_core::{EngineConfig, MissingEntityPolicy};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub lookup_timeout: Duration,
    pub audit_timeout: Duration,
    pub missing_entity_policy: MissingEntityPolicy,
    /// Audit records kept in memory before the oldest are evicted
    pub audit_retention: usize,
    /// JSON array of entity snapshots loaded into the store at startup
    pub seed_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "PANTRY_API_BIND_ADDR", "127.0.0.1:8080");

        let lookup_timeout_ms = value_or_default(&lookup, "PANTRY_LOOKUP_TIMEOUT_MS", "5000")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "PANTRY_LOOKUP_TIMEOUT_MS must be an integer in [50, 60000]".to_string(),
                )
            })?;
        if !(50..=60_000).contains(&lookup_timeout_ms) {
            return Err(ConfigError::Invalid(
                "PANTRY_LOOKUP_TIMEOUT_MS must be in [50, 60000]".to_string(),
            ));
        }

        let audit_timeout_ms = value_or_default(&lookup, "PANTRY_AUDIT_TIMEOUT_MS", "2000")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "PANTRY_AUDIT_TIMEOUT_MS must be an integer in [10, 30000]".to_string(),
                )
            })?;
        if !(10..=30_000).contains(&audit_timeout_ms) {
            return Err(ConfigError::Invalid(
                "PANTRY_AUDIT_TIMEOUT_MS must be in [10, 30000]".to_string(),
            ));
        }

        let missing_entity_policy =
            value_or_default(&lookup, "PANTRY_MISSING_ENTITY_POLICY", "conflict")
                .parse::<MissingEntityPolicy>()
                .map_err(|_| {
                    ConfigError::Invalid(
                        "PANTRY_MISSING_ENTITY_POLICY must be one of: conflict, skip".to_string(),
                    )
                })?;

        let audit_retention = value_or_default(&lookup, "PANTRY_AUDIT_RETENTION", "10000")
            .parse::<usize>()
            .ok()
            .filter(|retention| (100..=1_000_000).contains(retention))
            .ok_or_else(|| {
                ConfigError::Invalid(
                    "PANTRY_AUDIT_RETENTION must be an integer in [100, 1000000]".to_string(),
                )
            })?;

        let seed_path = optional_trimmed(&lookup, "PANTRY_SEED_PATH").map(PathBuf::from);

        Ok(Self {
            bind_addr,
            lookup_timeout: Duration::from_millis(lookup_timeout_ms),
            audit_timeout: Duration::from_millis(audit_timeout_ms),
            missing_entity_policy,
            audit_retention,
            seed_path,
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_lookup_timeout(self.lookup_timeout)
            .with_audit_timeout(self.audit_timeout)
            .with_missing_entity_policy(self.missing_entity_policy)
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.lookup_timeout, Duration::from_secs(5));
        assert_eq!(config.audit_timeout, Duration::from_secs(2));
        assert_eq!(config.missing_entity_policy, MissingEntityPolicy::Conflict);
        assert_eq!(config.audit_retention, 10_000);
        assert!(config.seed_path.is_none());
    }

    #[test]
    fn values_are_trimmed_and_parsed() {
        let config = config_from(&[
            ("PANTRY_API_BIND_ADDR", " 0.0.0.0:9000 "),
            ("PANTRY_LOOKUP_TIMEOUT_MS", "750"),
            ("PANTRY_MISSING_ENTITY_POLICY", "skip"),
            ("PANTRY_SEED_PATH", "/srv/pantry/seed.json"),
        ])
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.engine_config().lookup_timeout, Duration::from_millis(750));
        assert_eq!(config.missing_entity_policy, MissingEntityPolicy::Skip);
        assert_eq!(config.seed_path, Some(PathBuf::from("/srv/pantry/seed.json")));
    }

    #[test]
    fn out_of_range_timeouts_are_rejected() {
        let err = config_from(&[("PANTRY_LOOKUP_TIMEOUT_MS", "10")]).unwrap_err();
        assert!(err.to_string().contains("PANTRY_LOOKUP_TIMEOUT_MS"));

        let err = config_from(&[("PANTRY_AUDIT_TIMEOUT_MS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("PANTRY_AUDIT_TIMEOUT_MS"));
    }

    #[test]
    fn audit_retention_is_bounded() {
        let config = config_from(&[("PANTRY_AUDIT_RETENTION", "500")]).unwrap();
        assert_eq!(config.audit_retention, 500);

        let err = config_from(&[("PANTRY_AUDIT_RETENTION", "5")]).unwrap_err();
        assert!(err.to_string().contains("PANTRY_AUDIT_RETENTION"));
    }

    #[test]
    fn unknown_policy_is_rejected() {
        let err = config_from(&[("PANTRY_MISSING_ENTITY_POLICY", "ignore")]).unwrap_err();
        assert!(err.to_string().contains("conflict, skip"));
    }
}
