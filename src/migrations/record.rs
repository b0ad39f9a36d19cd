use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const TRACKING_SUFFIX: &str = "migrations";

/// One applied migration as persisted in a tracking namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub id: String,
    pub namespace: String,
    pub applied_at: DateTime<Utc>,
}

impl MigrationRecord {
    pub fn new(id: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            namespace: namespace.into(),
            applied_at: Utc::now(),
        }
    }
}

/// Derives the tracking namespace for a collection prefix: `_<prefix>migrations`.
///
/// Deployments sharing a store use different prefixes so their records never mix.
pub fn tracking_namespace(prefix: &str) -> String {
    format!("_{}{TRACKING_SUFFIX}", prefix.trim())
}

/// Namespaces end up as table/collection identifiers, so only `[A-Za-z0-9_]` is allowed.
pub fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() {
        bail!("namespace cannot be empty");
    }
    if let Some(invalid) = namespace
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
    {
        bail!("namespace {namespace:?} contains invalid character {invalid:?}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_namespace_wraps_prefix() {
        assert_eq!(tracking_namespace(""), "_migrations");
        assert_eq!(tracking_namespace("staging_"), "_staging_migrations");
        assert_eq!(tracking_namespace(" a_ "), "_a_migrations");
    }

    #[test]
    fn namespace_validation_rejects_symbols() {
        assert!(validate_namespace("_a_migrations").is_ok());
        assert!(validate_namespace("").is_err());
        let err = validate_namespace("bad\"name").unwrap_err();
        assert!(format!("{err}").contains("invalid character"));
    }

    #[test]
    fn record_round_trips_through_json() {
        let record = MigrationRecord::new("001_init", "_migrations");
        let encoded = serde_json::to_string(&record).expect("serialize");
        let decoded: MigrationRecord = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(decoded, record);
    }
}
