//! change-sync
//!
//! Replicates row changes from a change-tracked PostgreSQL source to any
//! number of destination databases. Each destination keeps its own
//! watermark, so destinations at different positions are caught up
//! independently.
//!
//! # Crates
//!
//! - `sync_core` - schema descriptors, changes, replication set config, errors
//! - `replication` - the replication engine and its backend traits
//! - `change_sync_postgresql` - the PostgreSQL backend with trigger-based
//!   change tracking
//!
//! # CLI Usage
//!
//! ```bash
//! # Install change tracking on the source
//! change-sync setup-tracking --source-uri postgresql://... --table users --table orders
//!
//! # Replicate once
//! change-sync sync replication.json
//!
//! # Replicate every 30 seconds until Ctrl+C
//! change-sync watch --interval 30s replication.yaml
//!
//! # Drop change history older than two days
//! change-sync cleanup-tracking --source-uri postgresql://... --retention 2d
//! ```

pub mod config;

pub use config::{load_config, parse_config, parse_duration, ConfigFormat};
