//! Core types for the change-sync framework.
//!
//! This crate provides the foundational types shared by the replication
//! engine and the database backends:
//!
//! - [`TableDescriptor`], [`ForeignKeyConstraint`], [`UniqueConstraint`] - schema
//!   metadata produced by a schema catalog
//! - [`Change`], [`ChangeSet`], [`Operation`] - net row-level changes for one pass
//! - [`Config`], [`ReplicationSet`], [`DatabaseInfo`] - replication set configuration
//! - [`SyncError`] - the error kinds surfaced by a replication pass
//!
//! # Architecture
//!
//! ```text
//! sync-core (this crate)
//!    │
//!    ├─── replication   (engine: assembler, planner, executor, scheduler)
//!    │
//!    ├─── postgresql    (catalog, change feed and destination sessions)
//!    │
//!    └─── change-sync   (CLI, config files, service loop)
//! ```

pub mod change;
pub mod config;
pub mod error;
pub mod schema;

pub use change::{Change, ChangeSet, ColumnValues, Operation, Version};
pub use config::{Config, DatabaseInfo, ReplicationSet};
pub use error::SyncError;
pub use schema::{ForeignKeyConstraint, TableDescriptor, UniqueConstraint};
