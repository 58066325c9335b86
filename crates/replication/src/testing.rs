//! Test support for the replication engine.
//!
//! [`MemoryBackend`] keeps every database in memory, emulates change
//! tracking and enforces foreign keys, so a transient constraint violation
//! during replication fails the same way it would on a real database.

pub mod memory;

pub use memory::{MemoryBackend, MemoryDatabase};
