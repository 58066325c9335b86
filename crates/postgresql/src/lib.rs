//! PostgreSQL backend for the change-sync replication engine
//!
//! Change tracking is trigger-based: [`setup_tracking`] installs a row
//! trigger on each table that records changed keys in a shared change log.
//! Sources read net changes from that log inside a repeatable-read snapshot;
//! destinations apply them through [`PostgresDestination`] and keep their
//! watermark in a single-row table.

mod catalog;
mod client;
mod destination;
mod feed;
pub mod sql;
mod tracking;

pub use client::new_postgresql_client;
pub use destination::PostgresDestination;
pub use tracking::{cleanup_tracking, current_version, setup_tracking, user_tables};

use anyhow::{Context, Result};
use async_trait::async_trait;
use replication::Backend;
use std::time::Duration;
use sync_core::DatabaseInfo;
use tokio_postgres::Client;

/// A connection to a source database.
pub struct PostgresSource {
    client: Client,
    in_snapshot: bool,
}

impl PostgresSource {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            in_snapshot: false,
        }
    }
}

/// Opens PostgreSQL sessions for configured databases.
#[derive(Debug, Clone, Default)]
pub struct PostgresBackend {
    command_timeout: Option<Duration>,
}

impl PostgresBackend {
    pub fn new(command_timeout: Option<Duration>) -> Self {
        Self { command_timeout }
    }
}

#[async_trait]
impl Backend for PostgresBackend {
    type Source = PostgresSource;
    type Destination = PostgresDestination;

    async fn connect_source(&self, database: &DatabaseInfo) -> Result<PostgresSource> {
        let client = new_postgresql_client(&database.connection_string, self.command_timeout)
            .await
            .with_context(|| format!("Failed to connect to source {}", database.name))?;
        Ok(PostgresSource::new(client))
    }

    async fn connect_destination(&self, database: &DatabaseInfo) -> Result<PostgresDestination> {
        let client = new_postgresql_client(&database.connection_string, self.command_timeout)
            .await
            .with_context(|| format!("Failed to connect to destination {}", database.name))?;
        Ok(PostgresDestination::new(client))
    }
}
