//! Destination session: change application and the watermark table.

use crate::sql::{
    delete_statement, insert_statement, quote_ident, quote_table, update_statement,
    WATERMARK_TABLE,
};
use crate::tracking::{self, table_exists};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use replication::DestinationSession;
use serde_json::Value;
use std::collections::HashMap;
use sync_core::{Change, ForeignKeyConstraint, Version};
use tokio_postgres::Client;
use tracing::debug;

/// A connection to one destination database.
pub struct PostgresDestination {
    client: Client,
    /// Definitions of the foreign keys dropped in the current transaction,
    /// by [`ForeignKeyConstraint::full_name`]
    disabled: HashMap<String, String>,
}

impl PostgresDestination {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            disabled: HashMap::new(),
        }
    }

    async fn execute_row(&self, sql: &str, change: &Change) -> Result<u64> {
        let mut row = change.keys.to_json_object();
        row.extend(change.others.to_json_object());
        let row = Value::Object(row);
        debug!("{sql} -- {row}");
        self.client
            .execute(sql, &[&row])
            .await
            .with_context(|| format!("Failed to apply {} to {}", change.operation, change.table_name()))
    }
}

#[async_trait]
impl DestinationSession for PostgresDestination {
    async fn read_watermark(&mut self) -> Result<Option<Version>> {
        if !table_exists(&self.client, WATERMARK_TABLE).await? {
            return Ok(None);
        }
        let row = self
            .client
            .query_opt(
                &format!("SELECT version FROM {WATERMARK_TABLE} WHERE id = 1"),
                &[],
            )
            .await?;
        Ok(row.map(|row| row.get(0)))
    }

    async fn tracked_version(&mut self) -> Result<Option<Version>> {
        tracking::current_version(&self.client).await
    }

    async fn begin(&mut self) -> Result<()> {
        self.disabled.clear();
        self.client
            .batch_execute("BEGIN ISOLATION LEVEL READ UNCOMMITTED")
            .await?;
        Ok(())
    }

    async fn disable_foreign_key(&mut self, fk: &ForeignKeyConstraint) -> Result<()> {
        let row = self
            .client
            .query_opt(
                "SELECT pg_get_constraintdef(c.oid)
                 FROM pg_constraint c
                 WHERE c.conrelid = to_regclass($1) AND c.conname = $2 AND c.contype = 'f'",
                &[&quote_table(&fk.table), &fk.name],
            )
            .await?
            .ok_or_else(|| anyhow!("Foreign key {} not found", fk.full_name()))?;
        let definition: String = row.get(0);

        let sql = format!(
            "ALTER TABLE {} DROP CONSTRAINT {}",
            quote_table(&fk.table),
            quote_ident(&fk.name)
        );
        debug!("{sql}");
        self.client.batch_execute(&sql).await?;
        self.disabled.insert(fk.full_name(), definition);
        Ok(())
    }

    async fn enable_foreign_key(&mut self, fk: &ForeignKeyConstraint) -> Result<()> {
        let definition = self
            .disabled
            .remove(&fk.full_name())
            .ok_or_else(|| anyhow!("Foreign key {} was not disabled", fk.full_name()))?;

        let sql = format!(
            "ALTER TABLE {} ADD CONSTRAINT {} {definition}",
            quote_table(&fk.table),
            quote_ident(&fk.name)
        );
        debug!("{sql}");
        self.client
            .batch_execute(&sql)
            .await
            .with_context(|| format!("Failed to re-enable foreign key {}", fk.full_name()))?;
        Ok(())
    }

    async fn insert(&mut self, change: &Change) -> Result<()> {
        self.execute_row(&insert_statement(&change.table), change)
            .await?;
        Ok(())
    }

    async fn update(&mut self, change: &Change) -> Result<()> {
        if let Some(sql) = update_statement(&change.table) {
            self.execute_row(&sql, change).await?;
        }
        Ok(())
    }

    async fn delete(&mut self, change: &Change) -> Result<()> {
        self.execute_row(&delete_statement(&change.table), change)
            .await?;
        Ok(())
    }

    async fn write_watermark(&mut self, version: Version) -> Result<()> {
        self.client
            .batch_execute(&format!(
                "CREATE TABLE IF NOT EXISTS {WATERMARK_TABLE} (
                    id INT PRIMARY KEY DEFAULT 1 CHECK (id = 1),
                    version BIGINT NOT NULL
                )"
            ))
            .await?;
        self.client
            .execute(
                &format!(
                    "INSERT INTO {WATERMARK_TABLE} (id, version) VALUES (1, $1)
                     ON CONFLICT (id) DO UPDATE SET version = EXCLUDED.version"
                ),
                &[&version],
            )
            .await
            .context("Failed to write watermark")?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.disabled.clear();
        self.client.batch_execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.disabled.clear();
        self.client.batch_execute("ROLLBACK").await?;
        Ok(())
    }
}
