//! Schema descriptors for tracked tables.
//!
//! These types are produced once per replication set by a schema catalog and
//! cached for the lifetime of that set. Schema changes require a restart.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// A foreign key edge from a dependent column to a referenced column.
///
/// Composite foreign keys are described as one `ForeignKeyConstraint` per
/// column pair, all sharing the same constraint name. Equality and hashing
/// only consider the owning table and the constraint name, so every column
/// pair of one constraint maps to the same disable window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyConstraint {
    /// Constraint name
    pub name: String,
    /// Dependent (owning) table
    pub table: String,
    /// Column on the dependent table
    pub column: String,
    /// Referenced table
    pub referenced_table: String,
    /// Column on the referenced table
    pub referenced_column: String,
}

impl ForeignKeyConstraint {
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
        referenced_table: impl Into<String>,
        referenced_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            column: column.into(),
            referenced_table: referenced_table.into(),
            referenced_column: referenced_column.into(),
        }
    }

    /// `table:name`, unique across a database.
    pub fn full_name(&self) -> String {
        format!("{}:{}", self.table, self.name)
    }
}

impl PartialEq for ForeignKeyConstraint {
    fn eq(&self, other: &Self) -> bool {
        self.table == other.table && self.name == other.name
    }
}

impl Eq for ForeignKeyConstraint {}

impl Hash for ForeignKeyConstraint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.table.hash(state);
        self.name.hash(state);
    }
}

/// A unique index or unique constraint (other than the primary key).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    /// Index or constraint name
    pub name: String,
    /// Owning table
    pub table: String,
    /// Indexed columns in key order
    pub columns: Vec<String>,
    /// `true` for a declared constraint, `false` for a plain unique index
    pub is_constraint: bool,
}

/// Everything the engine needs to know about one tracked table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Schema-qualified table name (`schema.table`)
    pub name: String,
    /// Primary key columns in key order
    pub key_columns: Vec<String>,
    /// All remaining (non-computed) columns
    pub other_columns: Vec<String>,
    /// Whether the key is an identity (auto-increment) column
    pub has_identity: bool,
    /// Outgoing foreign keys owned by this table
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyConstraint>,
    /// Unique constraints and unique indexes on this table.
    ///
    /// Informational only: change ordering never consults them, so a change
    /// set that moves a unique value between rows can still collide.
    #[serde(default)]
    pub unique_constraints: Vec<UniqueConstraint>,
}

impl TableDescriptor {
    pub fn new(
        name: impl Into<String>,
        key_columns: Vec<String>,
        other_columns: Vec<String>,
        has_identity: bool,
    ) -> Self {
        Self {
            name: name.into(),
            key_columns,
            other_columns,
            has_identity,
            foreign_keys: Vec::new(),
            unique_constraints: Vec::new(),
        }
    }

    /// The table name without its schema qualifier.
    pub fn bare_name(&self) -> &str {
        self.name
            .rsplit_once('.')
            .map(|(_, table)| table)
            .unwrap_or(&self.name)
    }

    /// Whether an allow-list entry names this table.
    ///
    /// Entries match either the bare or the schema-qualified name. Quoting
    /// with `[]` or `""` is ignored on both sides.
    pub fn matches_name(&self, entry: &str) -> bool {
        let entry = strip_quotes(entry);
        let name = strip_quotes(&self.name);
        if entry == name {
            return true;
        }
        let bare = name.rsplit_once('.').map(|(_, t)| t).unwrap_or(&name);
        entry == bare
    }

    /// Foreign keys of this table that reference `referenced_table`.
    pub fn foreign_keys_to<'a>(
        &'a self,
        referenced_table: &'a str,
    ) -> impl Iterator<Item = &'a ForeignKeyConstraint> + 'a {
        self.foreign_keys
            .iter()
            .filter(move |fk| fk.referenced_table == referenced_table)
    }

    /// Key columns followed by other columns.
    pub fn column_names(&self) -> impl Iterator<Item = &String> {
        self.key_columns.iter().chain(self.other_columns.iter())
    }
}

fn strip_quotes(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '[' | ']' | '"'))
        .collect()
}
