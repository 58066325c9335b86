//! Change-tracking replication engine.
//!
//! Replicates net row changes from one source database to any number of
//! destinations, each caught up independently to its own watermark.
//!
//! # Pass structure
//!
//! ```text
//! Synchronizer (one-shot or loop, per replication set)
//!    │
//!    └─ VersionCoordinator: read watermarks, group destinations
//!          │
//!          ├─ assemble: one ChangeSet per watermark group
//!          ├─ plan_foreign_key_windows: annotate disable windows
//!          └─ Executor: one transaction per destination
//! ```
//!
//! Database access goes through the traits in [`backend`]. The
//! [`testing`] module provides an in-memory backend.

pub mod assembler;
pub mod backend;
pub mod catalog;
pub mod coordinator;
pub mod executor;
pub mod feed;
pub mod options;
pub mod planner;
pub mod report;
pub mod scheduler;
pub mod testing;

pub use backend::{Backend, ChangeFeed, DestinationSession, RawChange, SchemaCatalog, SourceSession};
pub use executor::Executor;
pub use options::SyncOptions;
pub use report::{Failure, PassReport};
pub use scheduler::{SyncedEvent, Synchronizer};
