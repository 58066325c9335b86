//! Net row-level changes and the change set of one replication pass.

use crate::schema::{ForeignKeyConstraint, TableDescriptor};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A change-tracking version number.
pub type Version = i64;

/// Net operation of a row over one poll window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    /// Parse a change-tracking operation code (`I`, `U` or `D`).
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "I" | "i" => Some(Self::Insert),
            "U" | "u" => Some(Self::Update),
            "D" | "d" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Insert => "I",
            Self::Update => "U",
            Self::Delete => "D",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => f.write_str("insert"),
            Self::Update => f.write_str("update"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

/// Column values in column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnValues(Vec<(String, Value)>);

impl ColumnValues {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, column: impl Into<String>, value: Value) {
        self.0.push((column.into(), value));
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(c, v)| (c.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(c, _)| c.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.0.iter().map(|(_, v)| v)
    }

    /// The values as a JSON object keyed by column name.
    pub fn to_json_object(&self) -> serde_json::Map<String, Value> {
        self.0.iter().cloned().collect()
    }
}

impl<S: Into<String>> FromIterator<(S, Value)> for ColumnValues {
    fn from_iter<T: IntoIterator<Item = (S, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(c, v)| (c.into(), v)).collect())
    }
}

/// One net row-level mutation as of a given poll.
#[derive(Debug, Clone)]
pub struct Change {
    /// The table this row belongs to
    pub table: Arc<TableDescriptor>,
    /// Latest change version of the row
    pub version: Version,
    /// Version at which the row was inserted (equals `version` if unknown)
    pub creation_version: Version,
    /// Net operation
    pub operation: Operation,
    /// Primary key values, never empty
    pub keys: ColumnValues,
    /// Current values of the other columns, empty for deletes
    pub others: ColumnValues,
    /// Foreign keys to disable before applying this change, with the
    /// creation version until which each one must stay disabled
    pub disabled_constraints: HashMap<ForeignKeyConstraint, Version>,
}

impl Change {
    pub fn new(
        table: Arc<TableDescriptor>,
        operation: Operation,
        version: Version,
        creation_version: Version,
        keys: ColumnValues,
        others: ColumnValues,
    ) -> Self {
        Self {
            table,
            version,
            creation_version,
            operation,
            keys,
            others,
            disabled_constraints: HashMap::new(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table.name
    }

    /// Value of a key or other column.
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.keys.get(column).or_else(|| self.others.get(column))
    }

    /// Key columns followed by other columns.
    pub fn column_names(&self) -> Vec<&str> {
        self.keys.names().chain(self.others.names()).collect()
    }

    /// Key values followed by other values.
    pub fn values(&self) -> Vec<&Value> {
        self.keys.values().chain(self.others.values()).collect()
    }

    /// Whether the row was updated after it was inserted within the window.
    pub fn updated_since_creation(&self) -> bool {
        self.creation_version < self.version
    }
}

/// All changes of one replication pass, in canonical order.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    /// The source's global version captured when the set was assembled
    pub version: Version,
    /// Changes ordered by creation version, then table name
    pub changes: Vec<Change>,
}

impl ChangeSet {
    /// Build a change set, sorting the changes into canonical order.
    pub fn new(version: Version, mut changes: Vec<Change>) -> Self {
        sort_canonical(&mut changes);
        Self { version, changes }
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Ascending creation version, ties broken by table name.
///
/// The sort is stable, so changes of one table keep the order in which the
/// change feed returned them.
pub fn sort_canonical(changes: &mut [Change]) {
    changes.sort_by(|a, b| {
        a.creation_version
            .cmp(&b.creation_version)
            .then_with(|| a.table.name.cmp(&b.table.name))
    });
}
