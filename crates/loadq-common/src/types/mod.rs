//! Identifiers shared across loadq
//!
//! A [`LoadKey`] names a serialization domain: one `(database, table)` pair,
//! at most one load statement in flight at a time. An [`ExecutionName`] names
//! one load attempt against a key and doubles as the warehouse statement name,
//! so a completion event can be traced back to the key it belongs to.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{LoadqError, Result};

/// Separator between database and table in a rendered load key.
pub const LOAD_KEY_SEPARATOR: char = '#';

/// Width of the zero-padded millisecond stamp inside an execution name.
const MILLIS_WIDTH: usize = 13;

/// Length of the random nonce appended after the stamp.
const NONCE_LEN: usize = 8;

/// Identifies a `(database, table)` pair.
///
/// Rendered as `database#table`; that string is the partition value for every
/// tracking record of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoadKey {
    database: String,
    table: String,
}

impl LoadKey {
    /// Build a key, rejecting names that would make the rendered forms ambiguous.
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Result<Self> {
        let database = database.into();
        let table = table.into();

        let invalid_db = database.is_empty()
            || database.contains('/')
            || database.contains(LOAD_KEY_SEPARATOR);
        let invalid_table = table.is_empty() || table.contains(LOAD_KEY_SEPARATOR);

        if invalid_db || invalid_table {
            return Err(LoadqError::InvalidLoadKey(format!(
                "{}{}{}",
                database, LOAD_KEY_SEPARATOR, table
            )));
        }

        Ok(Self { database, table })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Partition value used by the state store.
    pub fn partition(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for LoadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.database, LOAD_KEY_SEPARATOR, self.table)
    }
}

impl FromStr for LoadKey {
    type Err = LoadqError;

    fn from_str(s: &str) -> Result<Self> {
        let (database, table) = s
            .split_once(LOAD_KEY_SEPARATOR)
            .ok_or_else(|| LoadqError::InvalidLoadKey(s.to_string()))?;
        Self::new(database, table)
    }
}

/// Name of one load attempt.
///
/// Format: `{database}/{table}_{millis:013}-{nonce}` with an optional
/// `~{attempt}` suffix for warehouse-level resubmissions. Within one key the
/// names sort lexically by creation time; two names minted in the same
/// millisecond are ordered by their random nonce, so ordering is approximate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionName {
    database: String,
    table: String,
    millis: i64,
    nonce: String,
    attempt: u32,
}

impl ExecutionName {
    /// Mint a fresh name for `key` stamped with the current wall clock.
    pub fn generate(key: &LoadKey) -> Self {
        Self::at(key, Utc::now().timestamp_millis())
    }

    /// Mint a name for `key` with an explicit stamp.
    pub fn at(key: &LoadKey, millis: i64) -> Self {
        let nonce = Uuid::new_v4().simple().to_string()[..NONCE_LEN].to_string();
        Self {
            database: key.database.clone(),
            table: key.table.clone(),
            millis,
            nonce,
            attempt: 0,
        }
    }

    pub fn load_key(&self) -> LoadKey {
        LoadKey {
            database: self.database.clone(),
            table: self.table.clone(),
        }
    }

    pub fn millis(&self) -> i64 {
        self.millis
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The name with any attempt suffix removed.
    pub fn base(&self) -> Self {
        Self {
            attempt: 0,
            ..self.clone()
        }
    }

    /// The same load, resubmitted once more.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    /// Whether two names refer to the same load regardless of attempt.
    pub fn same_load(&self, other: &Self) -> bool {
        self.base() == other.base()
    }

    /// Name of the staging table a load creates for itself.
    pub fn staging_table(&self) -> String {
        if self.nonce.is_empty() {
            format!("{}_{}", self.table, self.millis)
        } else {
            format!("{}_{}_{}", self.table, self.millis, self.nonce)
        }
    }
}

impl fmt::Display for ExecutionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}_{:0width$}",
            self.database,
            self.table,
            self.millis,
            width = MILLIS_WIDTH
        )?;
        if !self.nonce.is_empty() {
            write!(f, "-{}", self.nonce)?;
        }
        if self.attempt > 0 {
            write!(f, "~{}", self.attempt)?;
        }
        Ok(())
    }
}

impl FromStr for ExecutionName {
    type Err = LoadqError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || LoadqError::InvalidExecutionName(s.to_string());

        let (database, rest) = s.split_once('/').ok_or_else(invalid)?;
        let (table, tail) = rest.rsplit_once('_').ok_or_else(invalid)?;

        let (stamp, attempt) = match tail.split_once('~') {
            Some((stamp, attempt)) => (stamp, attempt.parse::<u32>().map_err(|_| invalid())?),
            None => (tail, 0),
        };

        // Names minted before nonces existed carry only the millisecond stamp.
        let (millis, nonce) = match stamp.split_once('-') {
            Some((millis, nonce)) => (millis, nonce),
            None => (stamp, ""),
        };

        if millis.is_empty() || !millis.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        if !nonce.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(invalid());
        }

        let key = LoadKey::new(database, table).map_err(|_| invalid())?;

        Ok(Self {
            database: key.database,
            table: key.table,
            millis: millis.parse().map_err(|_| invalid())?,
            nonce: nonce.to_string(),
            attempt,
        })
    }
}

impl Serialize for ExecutionName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ExecutionName {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn orders() -> LoadKey {
        LoadKey::new("db1", "orders").unwrap()
    }

    #[test]
    fn test_load_key_display_and_parse() {
        let key = orders();
        assert_eq!(key.to_string(), "db1#orders");
        assert_eq!("db1#orders".parse::<LoadKey>().unwrap(), key);
    }

    #[test]
    fn test_load_key_rejects_ambiguous_names() {
        assert!(LoadKey::new("", "orders").is_err());
        assert!(LoadKey::new("db1", "").is_err());
        assert!(LoadKey::new("db/1", "orders").is_err());
        assert!(LoadKey::new("db1", "ord#ers").is_err());
        assert!("no-separator".parse::<LoadKey>().is_err());
    }

    #[test]
    fn test_execution_name_format() {
        let name = ExecutionName::at(&orders(), 1_700_000_000_123);
        let rendered = name.to_string();

        assert!(rendered.starts_with("db1/orders_1700000000123-"));
        assert_eq!(rendered.len(), "db1/orders_1700000000123-".len() + NONCE_LEN);
        assert_eq!(rendered.parse::<ExecutionName>().unwrap(), name);
    }

    #[test]
    fn test_execution_name_with_underscored_table() {
        let key = LoadKey::new("dev", "web_events_raw").unwrap();
        let name = ExecutionName::at(&key, 42);
        let parsed: ExecutionName = name.to_string().parse().unwrap();

        assert_eq!(parsed.load_key(), key);
        assert_eq!(parsed.millis(), 42);
    }

    #[test]
    fn test_legacy_execution_name_without_nonce() {
        let parsed: ExecutionName = "dev/orders_1625097600000".parse().unwrap();
        assert_eq!(parsed.load_key(), LoadKey::new("dev", "orders").unwrap());
        assert_eq!(parsed.to_string(), "dev/orders_1625097600000");
        assert_eq!(parsed.staging_table(), "orders_1625097600000");
    }

    #[test]
    fn test_attempt_suffix() {
        let name = ExecutionName::at(&orders(), 7);
        let retry = name.next_attempt();

        assert!(retry.to_string().ends_with("~1"));
        assert_eq!(retry.attempt(), 1);
        assert!(retry.same_load(&name));
        assert_eq!(retry.base(), name);

        let parsed: ExecutionName = retry.to_string().parse().unwrap();
        assert_eq!(parsed, retry);
    }

    #[test]
    fn test_invalid_execution_names() {
        for raw in ["", "orders_123", "db1/orders", "db1/orders_abc", "db1/orders_12~x"] {
            assert!(raw.parse::<ExecutionName>().is_err(), "{raw} should not parse");
        }
    }

    #[test]
    fn test_execution_name_serde_as_string() {
        let name = ExecutionName::at(&orders(), 99);
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, format!("\"{}\"", name));
        let back: ExecutionName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, name);
    }

    proptest! {
        #[test]
        fn earlier_stamps_sort_first(a in 0i64..9_999_999_999_999, b in 0i64..9_999_999_999_999) {
            prop_assume!(a < b);
            let key = orders();
            let first = ExecutionName::at(&key, a).to_string();
            let second = ExecutionName::at(&key, b).to_string();
            prop_assert!(first < second);
        }
    }
}
