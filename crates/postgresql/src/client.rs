//! PostgreSQL client utilities

use anyhow::{Context, Result};
use log::error;
use std::time::Duration;
use tokio_postgres::{Client, NoTls};

/// Create a new PostgreSQL client with connection handling.
///
/// A non-zero `command_timeout` becomes the session's `statement_timeout`.
pub async fn new_postgresql_client(
    connection_string: &str,
    command_timeout: Option<Duration>,
) -> Result<Client> {
    let (client, connection) = tokio_postgres::connect(connection_string, NoTls).await?;

    // Spawn connection handler
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("PostgreSQL connection error: {e}");
        }
    });

    if let Some(timeout) = command_timeout.filter(|t| !t.is_zero()) {
        client
            .simple_query(&format!("SET statement_timeout = {}", timeout.as_millis()))
            .await
            .context("Failed to set statement timeout")?;
    }

    Ok(client)
}
