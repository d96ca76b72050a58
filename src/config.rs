use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;

use crate::{
    error::{Error, Result},
    ranker::RankerStrategy,
    scoring::ScoringParams,
    snippet::DEFAULT_SOURCE_TIMEOUT,
};

const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");

/// Setting keys understood by [`EngineConfig::load`].
pub mod keys {
    pub const K1: &str = "k1";
    pub const B: &str = "b";
    pub const SYNONYM_WEIGHT: &str = "synonym_weight";
    pub const STRATEGY: &str = "strategy";
    pub const SNIPPET_TIMEOUT_MS: &str = "snippet_timeout_ms";
    pub const DOCS_ROOT: &str = "docs_root";

    pub const ALL: [&str; 6] =
        [K1, B, SYNONYM_WEIGHT, STRATEGY, SNIPPET_TIMEOUT_MS, DOCS_ROOT];
}

/// String settings persisted in a redb file.
pub struct SettingsDb {
    db: Database,
}

impl SettingsDb {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(SETTINGS)?;
        txn.commit()?;

        Ok(Self { db })
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    /// Get a setting, returning the default if not set.
    pub fn get_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self.get(key)?.unwrap_or_else(|| default.to_string()))
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(SETTINGS)?;
            table.remove(key)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    pub fn list(&self) -> Result<Vec<(String, String)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            result.push((k.value().to_string(), v.value().to_string()));
        }
        Ok(result)
    }
}

impl std::fmt::Debug for SettingsDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsDb").finish_non_exhaustive()
    }
}

/// Tunables of a search index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineConfig {
    pub k1: f64,
    pub b: f64,
    pub synonym_weight: f64,
    #[serde(serialize_with = "display")]
    pub strategy: RankerStrategy,
    #[serde(rename = "snippet_timeout_ms", serialize_with = "millis")]
    pub snippet_timeout: Duration,
    /// Directory holding the source files named by the `path` field.
    pub docs_root: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let params = ScoringParams::default();
        Self {
            k1: params.k1,
            b: params.b,
            synonym_weight: params.synonym_weight,
            strategy: RankerStrategy::default(),
            snippet_timeout: DEFAULT_SOURCE_TIMEOUT,
            docs_root: None,
        }
    }
}

impl EngineConfig {
    /// Read every setting from `db`, falling back to the defaults.
    pub fn load(db: &SettingsDb) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            k1: parse_number(db, keys::K1, defaults.k1)?,
            b: parse_number(db, keys::B, defaults.b)?,
            synonym_weight: parse_number(
                db,
                keys::SYNONYM_WEIGHT,
                defaults.synonym_weight,
            )?,
            strategy: db
                .get_or(keys::STRATEGY, defaults.strategy.as_str())?
                .parse()?,
            snippet_timeout: Duration::from_millis(parse_number(
                db,
                keys::SNIPPET_TIMEOUT_MS,
                defaults.snippet_timeout.as_millis() as u64,
            )?),
            docs_root: db
                .get(keys::DOCS_ROOT)?
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.k1 > 0.0 && self.k1.is_finite()) {
            return Err(Error::Configuration(format!(
                "k1 must be positive, got {}",
                self.k1
            )));
        }
        if !(0.0..=1.0).contains(&self.b) {
            return Err(Error::Configuration(format!(
                "b must be within 0..=1, got {}",
                self.b
            )));
        }
        // Literal matches must always outweigh their expansions.
        if !(0.0..1.0).contains(&self.synonym_weight) {
            return Err(Error::Configuration(format!(
                "synonym_weight must be at least 0 and below 1, got {}",
                self.synonym_weight
            )));
        }
        Ok(())
    }

    pub fn scoring_params(&self) -> ScoringParams {
        ScoringParams {
            k1: self.k1,
            b: self.b,
            synonym_weight: self.synonym_weight,
            ..ScoringParams::default()
        }
    }

    /// The value `key` takes when unset; empty for settings without one.
    pub fn default_value(key: &str) -> Result<String> {
        let defaults = Self::default();
        Ok(match key {
            keys::K1 => defaults.k1.to_string(),
            keys::B => defaults.b.to_string(),
            keys::SYNONYM_WEIGHT => defaults.synonym_weight.to_string(),
            keys::STRATEGY => defaults.strategy.to_string(),
            keys::SNIPPET_TIMEOUT_MS => {
                defaults.snippet_timeout.as_millis().to_string()
            }
            keys::DOCS_ROOT => String::new(),
            _ => return Err(unknown_key(key)),
        })
    }

    /// Check that `value` is acceptable for `key` before storing it.
    pub fn check_setting(key: &str, value: &str) -> Result<()> {
        let mut config = Self::default();
        match key {
            keys::K1 => config.k1 = parse_value(key, value)?,
            keys::B => config.b = parse_value(key, value)?,
            keys::SYNONYM_WEIGHT => {
                config.synonym_weight = parse_value(key, value)?
            }
            keys::STRATEGY => config.strategy = value.parse()?,
            keys::SNIPPET_TIMEOUT_MS => {
                parse_value::<u64>(key, value)?;
            }
            keys::DOCS_ROOT => {}
            _ => return Err(unknown_key(key)),
        }
        config.validate()
    }
}

fn unknown_key(key: &str) -> Error {
    Error::Configuration(format!(
        "unknown setting '{key}' (expected one of: {})",
        keys::ALL.join(", ")
    ))
}

fn parse_number<T>(db: &SettingsDb, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + ToString,
{
    let raw = db.get_or(key, &default.to_string())?;
    parse_value(key, &raw)
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| {
        Error::Configuration(format!("setting '{key}' has invalid value '{raw}'"))
    })
}

fn display<S: serde::Serializer>(
    strategy: &RankerStrategy,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(strategy)
}

fn millis<S: serde::Serializer>(
    timeout: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(timeout.as_millis() as u64)
}
