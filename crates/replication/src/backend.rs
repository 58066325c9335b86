//! Traits at the seam between the engine and a concrete database backend.
//!
//! A backend provides three collaborators:
//!
//! - [`SchemaCatalog`] - describes tracked tables and their constraints
//! - [`ChangeFeed`] - versions and raw net changes since a baseline
//! - [`DestinationSession`] - statement execution, constraint toggling and
//!   the watermark store of one destination
//!
//! The engine never builds SQL itself; everything dialect-specific lives
//! behind these traits.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use sync_core::{
    Change, DatabaseInfo, ForeignKeyConstraint, TableDescriptor, UniqueConstraint, Version,
};

/// One raw record returned by a change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChange {
    /// Operation code: `I`, `U` or `D`
    pub operation: String,
    /// Latest change version of the row
    pub version: Version,
    /// Version of the row's insert, if it was inserted within the window
    pub creation_version: Option<Version>,
    /// Key column values in `TableDescriptor::key_columns` order
    pub keys: Vec<Value>,
    /// Other column values in `TableDescriptor::other_columns` order.
    /// Nulls for deleted rows.
    pub others: Vec<Value>,
}

/// Schema metadata of a source database.
#[async_trait]
pub trait SchemaCatalog: Send {
    /// Tables with change tracking enabled. Foreign keys and unique
    /// constraints are attached by the engine.
    async fn describe_tracked_tables(&mut self) -> Result<Vec<TableDescriptor>>;

    /// All enabled foreign keys.
    async fn describe_foreign_keys(&mut self) -> Result<Vec<ForeignKeyConstraint>>;

    /// All unique constraints and unique indexes other than primary keys.
    async fn describe_unique_constraints(&mut self) -> Result<Vec<UniqueConstraint>>;
}

/// Change-tracking feed of a source database.
#[async_trait]
pub trait ChangeFeed: Send {
    /// The current global change-tracking version, `None` when change
    /// tracking is not enabled.
    async fn current_version(&mut self) -> Result<Option<Version>>;

    /// Start a repeatable-read snapshot for the rest of the session.
    ///
    /// Returns `false` when snapshot isolation is unavailable; the session
    /// then reads at the database's default isolation.
    async fn begin_snapshot(&mut self) -> Result<bool>;

    /// End the snapshot started by [`begin_snapshot`](Self::begin_snapshot).
    async fn end_snapshot(&mut self) -> Result<()>;

    /// Oldest version for which the table's change history is retained.
    async fn min_valid_version(&mut self, table: &TableDescriptor) -> Result<Option<Version>>;

    /// Net changes of `table` with a version greater than `baseline`,
    /// ordered by `coalesce(creation_version, version)`.
    async fn changes_since(
        &mut self,
        table: &TableDescriptor,
        baseline: Version,
    ) -> Result<Vec<RawChange>>;
}

/// A connection to a source database.
pub trait SourceSession: SchemaCatalog + ChangeFeed {}

impl<T: SchemaCatalog + ChangeFeed> SourceSession for T {}

/// A connection to one destination database.
///
/// The executor drives the session through exactly one transaction per
/// pass: `begin`, any number of statements, then `commit` or `rollback`.
#[async_trait]
pub trait DestinationSession: Send {
    /// The last applied source version, `None` if never written.
    async fn read_watermark(&mut self) -> Result<Option<Version>>;

    /// The destination's own change-tracking version, if it carries change
    /// tracking itself (e.g. restored from a backup of the source).
    async fn tracked_version(&mut self) -> Result<Option<Version>>;

    async fn begin(&mut self) -> Result<()>;

    async fn disable_foreign_key(&mut self, fk: &ForeignKeyConstraint) -> Result<()>;

    /// Re-enable a foreign key, validating all existing rows.
    async fn enable_foreign_key(&mut self, fk: &ForeignKeyConstraint) -> Result<()>;

    /// Insert the row. Identity keys are inserted explicitly for this
    /// statement only.
    async fn insert(&mut self, change: &Change) -> Result<()>;

    /// Set all other columns of the row identified by the key columns.
    async fn update(&mut self, change: &Change) -> Result<()>;

    /// Delete the row identified by the key columns.
    async fn delete(&mut self, change: &Change) -> Result<()>;

    /// Upsert the watermark inside the current transaction.
    async fn write_watermark(&mut self, version: Version) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}

/// Opens sessions against configured databases.
#[async_trait]
pub trait Backend: Send + Sync {
    type Source: SourceSession;
    type Destination: DestinationSession;

    async fn connect_source(&self, database: &DatabaseInfo) -> Result<Self::Source>;

    async fn connect_destination(&self, database: &DatabaseInfo) -> Result<Self::Destination>;
}
