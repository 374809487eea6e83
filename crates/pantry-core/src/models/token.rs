//! Version tokens stamped on entities at every successful write

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::LazyLock;

static TIMESTAMP_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2})?$")
        .expect("Invalid regex")
});

static INTEGER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+$").expect("Invalid regex"));

const UNKNOWN: &str = "unknown";

/// Opaque version string. Recognized shapes are ISO-8601 timestamps and
/// decimal integers; anything else only supports equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(String);

/// Parsed form of a [`VersionToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenShape {
    Timestamp(DateTime<Utc>),
    Integer(u64),
    /// All digits but past `u64`; ordered by [`VersionToken::cmp_digits`]
    LargeInteger,
    Opaque,
}

impl VersionToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Placeholder used when the server no longer holds the entity.
    #[must_use]
    pub fn unknown() -> Self {
        Self(UNKNOWN.to_string())
    }

    #[must_use]
    pub fn from_timestamp(at: DateTime<Utc>) -> Self {
        Self(at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
    }

    #[must_use]
    pub fn from_sequence(value: u64) -> Self {
        Self(value.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN
    }

    /// Classify the token. A string that looks like a timestamp but fails to
    /// parse (out-of-range date) is opaque.
    #[must_use]
    pub fn shape(&self) -> TokenShape {
        let raw = self.0.trim();
        if TIMESTAMP_PATTERN.is_match(raw) {
            return parse_timestamp(raw).map_or(TokenShape::Opaque, TokenShape::Timestamp);
        }
        if INTEGER_PATTERN.is_match(raw) {
            return raw
                .parse::<u64>()
                .map_or(TokenShape::LargeInteger, TokenShape::Integer);
        }
        TokenShape::Opaque
    }

    /// Numeric order of two all-digit tokens of any length; `None` unless
    /// both are integers.
    #[must_use]
    pub fn cmp_digits(&self, other: &Self) -> Option<Ordering> {
        let (Some(left), Some(right)) = (self.significant_digits(), other.significant_digits())
        else {
            return None;
        };
        Some(left.len().cmp(&right.len()).then_with(|| left.cmp(right)))
    }

    fn significant_digits(&self) -> Option<&str> {
        let raw = self.0.trim();
        INTEGER_PATTERN
            .is_match(raw)
            .then(|| raw.trim_start_matches('0'))
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VersionToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for VersionToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    // No offset: read as UTC
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamp_tokens_parse_with_and_without_offset() {
        let zulu = VersionToken::new("2025-01-02T03:04:05Z");
        let expected = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(zulu.shape(), TokenShape::Timestamp(expected));

        let offset = VersionToken::new("2025-01-02T05:04:05+02:00");
        assert_eq!(offset.shape(), TokenShape::Timestamp(expected));

        let naive = VersionToken::new("2025-01-02T03:04:05.000");
        assert_eq!(naive.shape(), TokenShape::Timestamp(expected));
    }

    #[test]
    fn integer_tokens_parse() {
        assert_eq!(VersionToken::new("42").shape(), TokenShape::Integer(42));
        assert_eq!(VersionToken::new("007").shape(), TokenShape::Integer(7));
    }

    #[test]
    fn malformed_tokens_are_opaque() {
        assert_eq!(VersionToken::new("v1").shape(), TokenShape::Opaque);
        assert_eq!(VersionToken::new("-3").shape(), TokenShape::Opaque);
        assert_eq!(
            VersionToken::new("2025-13-40T00:00:00Z").shape(),
            TokenShape::Opaque
        );
    }

    #[test]
    fn integers_past_u64_keep_their_order() {
        let huge = VersionToken::new("99999999999999999999999");
        assert_eq!(huge.shape(), TokenShape::LargeInteger);
        assert_eq!(
            huge.cmp_digits(&VersionToken::new("18446744073709551615")),
            Some(Ordering::Greater)
        );
        assert_eq!(
            VersionToken::new("00123").cmp_digits(&VersionToken::new("123")),
            Some(Ordering::Equal)
        );
        assert_eq!(
            VersionToken::new("0").cmp_digits(&VersionToken::new("000")),
            Some(Ordering::Equal)
        );
        assert_eq!(huge.cmp_digits(&VersionToken::new("v1")), None);
    }

    #[test]
    fn generated_tokens_round_trip_their_shape() {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        assert_eq!(
            VersionToken::from_timestamp(at).shape(),
            TokenShape::Timestamp(at)
        );
        assert_eq!(
            VersionToken::from_sequence(9).shape(),
            TokenShape::Integer(9)
        );
        assert!(VersionToken::unknown().is_unknown());
    }
}
