//! Declarative, ordered migration manifests.
//!
//! Units are listed explicitly (in code or in a JSON manifest file) instead of being
//! discovered by scanning a directory, so ordering and presence are deterministic.

use crate::store::connection::Store;
use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

/// One migration step applied against a store handle.
pub trait MigrationUnit: Send + Sync {
    fn id(&self) -> &str;

    fn apply<'a>(&'a self, store: &'a dyn Store) -> BoxFuture<'a, Result<()>>;
}

/// Execution order of a unit: the numeric prefix of its id, then the full id.
///
/// `2_seed` sorts before `10_index`; ids without a numeric prefix sort after all
/// numbered ids, lexicographically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderingKey {
    number: Option<u64>,
    id: String,
}

impl OrderingKey {
    /// Fails when the numeric prefix does not fit in a `u64`.
    pub fn from_id(id: &str) -> Result<Self> {
        let digits: String = id.chars().take_while(char::is_ascii_digit).collect();
        let number = if digits.is_empty() {
            None
        } else {
            Some(
                digits
                    .parse()
                    .with_context(|| format!("migration id {id} has an out-of-range prefix"))?,
            )
        };
        Ok(Self {
            number,
            id: id.to_owned(),
        })
    }
}

impl Ord for OrderingKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.number, other.number) {
            (Some(lhs), Some(rhs)) => lhs.cmp(&rhs).then_with(|| self.id.cmp(&other.id)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.id.cmp(&other.id),
        }
    }
}

impl PartialOrd for OrderingKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Unit made of store statements executed in order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScriptMigration {
    pub id: String,
    #[serde(default)]
    pub statements: Vec<String>,
}

impl ScriptMigration {
    pub fn new<I, S>(id: impl Into<String>, statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            statements: statements.into_iter().map(Into::into).collect(),
        }
    }
}

impl MigrationUnit for ScriptMigration {
    fn id(&self) -> &str {
        &self.id
    }

    fn apply<'a>(&'a self, store: &'a dyn Store) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for (index, statement) in self.statements.iter().enumerate() {
                store
                    .execute(statement)
                    .await
                    .with_context(|| format!("statement #{index} of {} failed", self.id))?;
            }
            Ok(())
        })
    }
}

type ApplyFn = dyn for<'a> Fn(&'a dyn Store) -> BoxFuture<'a, Result<()>> + Send + Sync;

/// Unit backed by a closure, for migrations that need more than plain statements.
pub struct FnMigration {
    id: String,
    apply: Box<ApplyFn>,
}

impl FnMigration {
    pub fn new<F>(id: impl Into<String>, apply: F) -> Self
    where
        F: for<'a> Fn(&'a dyn Store) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            apply: Box::new(apply),
        }
    }
}

impl fmt::Debug for FnMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnMigration").field("id", &self.id).finish()
    }
}

impl MigrationUnit for FnMigration {
    fn id(&self) -> &str {
        &self.id
    }

    fn apply<'a>(&'a self, store: &'a dyn Store) -> BoxFuture<'a, Result<()>> {
        (self.apply)(store)
    }
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    units: Vec<ScriptMigration>,
}

/// Ordered, duplicate-free list of migration units, loaded once per run.
pub struct MigrationManifest {
    units: Vec<Box<dyn MigrationUnit>>,
}

impl fmt::Debug for MigrationManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationManifest")
            .field("units", &self.ids())
            .finish()
    }
}

impl MigrationManifest {
    /// Sorts `units` by [`OrderingKey`] and rejects empty, duplicate or unorderable ids.
    pub fn new(units: Vec<Box<dyn MigrationUnit>>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut keyed = Vec::with_capacity(units.len());
        for unit in units {
            let id = unit.id();
            if id.trim().is_empty() {
                bail!("migration id cannot be empty");
            }
            if !seen.insert(id.to_owned()) {
                bail!("duplicate migration id {id}");
            }
            keyed.push((OrderingKey::from_id(id)?, unit));
        }

        keyed.sort_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs));
        Ok(Self {
            units: keyed.into_iter().map(|(_, unit)| unit).collect(),
        })
    }

    pub fn empty() -> Self {
        Self { units: Vec::new() }
    }

    /// Parses a JSON manifest of script units:
    /// `{"units": [{"id": "001_init", "statements": ["..."]}]}`.
    pub fn from_json(contents: &str) -> Result<Self> {
        let file: ManifestFile =
            serde_json::from_str(contents).context("invalid migration manifest")?;
        Self::new(
            file.units
                .into_iter()
                .map(|unit| Box::new(unit) as Box<dyn MigrationUnit>)
                .collect(),
        )
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read migration manifest {}", path.display()))?;
        Self::from_json(&contents)
            .with_context(|| format!("failed to load migration manifest {}", path.display()))
    }

    pub fn units(&self) -> impl Iterator<Item = &dyn MigrationUnit> {
        self.units.iter().map(|unit| unit.as_ref())
    }

    pub fn ids(&self) -> Vec<&str> {
        self.units.iter().map(|unit| unit.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}
