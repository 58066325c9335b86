//! Net changes from the trigger-maintained change log.

use crate::sql::{
    capture_lock_statement, capture_unlock_statement, net_changes_query, SNAPSHOT_BEGIN,
    TABLES_TABLE,
};
use crate::tracking::current_version;
use crate::PostgresSource;
use anyhow::{Context, Result};
use async_trait::async_trait;
use replication::{ChangeFeed, RawChange};
use serde_json::Value;
use sync_core::{TableDescriptor, Version};
use tracing::debug;

fn into_array(value: Value) -> Vec<Value> {
    match value {
        Value::Array(values) => values,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

#[async_trait]
impl ChangeFeed for PostgresSource {
    async fn current_version(&mut self) -> Result<Option<Version>> {
        current_version(&self.client).await
    }

    async fn begin_snapshot(&mut self) -> Result<bool> {
        // Versions are drawn before commit, so a writer still in flight can
        // hold a version below the snapshot's maximum. Wait for those writers
        // and keep new ones out until the snapshot is fixed.
        self.client
            .batch_execute(&capture_lock_statement())
            .await
            .context("Failed to wait for in-flight changes")?;
        let started = self.client.batch_execute(SNAPSHOT_BEGIN).await;
        if started.is_ok() {
            self.in_snapshot = true;
        }
        let unlocked = self.client.batch_execute(&capture_unlock_statement()).await;
        started.context("Failed to start snapshot transaction")?;
        unlocked.context("Failed to release the change capture lock")?;
        Ok(true)
    }

    async fn end_snapshot(&mut self) -> Result<()> {
        if self.in_snapshot {
            self.in_snapshot = false;
            self.client.batch_execute("COMMIT").await?;
        }
        Ok(())
    }

    async fn min_valid_version(&mut self, table: &TableDescriptor) -> Result<Option<Version>> {
        let row = self
            .client
            .query_opt(
                &format!("SELECT min_valid_version FROM {TABLES_TABLE} WHERE table_name = $1"),
                &[&table.name],
            )
            .await?;
        Ok(row.map(|row| row.get(0)))
    }

    async fn changes_since(
        &mut self,
        table: &TableDescriptor,
        baseline: Version,
    ) -> Result<Vec<RawChange>> {
        let sql = net_changes_query(table);
        debug!("Fetching changes of {} since {baseline}: {sql}", table.name);
        let rows = self
            .client
            .query(&sql, &[&table.name, &baseline])
            .await
            .with_context(|| format!("Failed to read changes of {}", table.name))?;

        Ok(rows
            .into_iter()
            .map(|row| RawChange {
                operation: row.get(0),
                version: row.get(1),
                creation_version: row.get(2),
                keys: into_array(row.get(3)),
                others: into_array(row.get(4)),
            })
            .collect())
    }
}
