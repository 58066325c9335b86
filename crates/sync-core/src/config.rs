//! Replication set configuration.
//!
//! Keys are snake_case. The PascalCase keys of the classic JSON format
//! (`ReplicationSets`, `Name`, `ConnectionString`, ...) are accepted too:
//!
//! ```json
//! {
//!   "ReplicationSets": [{
//!     "Name": "Test",
//!     "Source": { "Name": "Primary", "ConnectionString": "postgres://..." },
//!     "Destinations": [{ "Name": "Replica", "ConnectionString": "postgres://..." }],
//!     "Tables": ["users", "public.orders"]
//!   }]
//! }
//! ```

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Top-level configuration: a list of replication sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(alias = "ReplicationSets", default)]
    pub replication_sets: Vec<ReplicationSet>,
}

/// One source database replicated to one or more destinations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationSet {
    /// Name used to identify the set in logs and events
    #[serde(alias = "Name")]
    pub name: String,
    #[serde(alias = "Source")]
    pub source: DatabaseInfo,
    #[serde(alias = "Destinations", default)]
    pub destinations: Vec<DatabaseInfo>,
    /// Tables to replicate, bare or schema-qualified. Empty means all tracked tables.
    #[serde(alias = "Tables", default)]
    pub tables: Vec<String>,
}

/// Connection information for one database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseInfo {
    /// Name used solely for identification in logs
    #[serde(alias = "Name")]
    pub name: String,
    #[serde(alias = "ConnectionString")]
    pub connection_string: String,
}

impl DatabaseInfo {
    pub fn new(name: impl Into<String>, connection_string: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection_string: connection_string.into(),
        }
    }
}

impl Config {
    /// Check the structural requirements of every replication set.
    pub fn validate(&self) -> Result<(), SyncError> {
        for (i, set) in self.replication_sets.iter().enumerate() {
            set.validate()
                .map_err(|e| SyncError::Config(format!("replication set #{}: {e}", i + 1)))?;
        }
        Ok(())
    }
}

impl ReplicationSet {
    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".to_string());
        }
        if self.source.connection_string.trim().is_empty() {
            return Err(format!("source of '{}' has no connection string", self.name));
        }
        if self.destinations.is_empty() {
            return Err(format!("'{}' has no destinations", self.name));
        }
        let mut seen = HashSet::new();
        for destination in &self.destinations {
            if destination.connection_string.trim().is_empty() {
                return Err(format!(
                    "destination '{}' of '{}' has no connection string",
                    destination.name, self.name
                ));
            }
            if !seen.insert(destination.name.as_str()) {
                return Err(format!(
                    "destination name '{}' appears more than once in '{}'",
                    destination.name, self.name
                ));
            }
        }
        Ok(())
    }
}
