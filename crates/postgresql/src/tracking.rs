//! Trigger-based change tracking.
//!
//! Every tracked table gets an `AFTER INSERT OR UPDATE OR DELETE` row
//! trigger that appends the row's key to [`LOG_TABLE`]. The log's sequence
//! is the database-wide change version. [`TABLES_TABLE`] records each
//! tracked table together with its minimum valid version, the oldest
//! baseline its retained history can still serve.

use crate::sql::{
    normalize_table_name, quote_table, trigger_function, trigger_function_name, LOG_TABLE,
    TABLES_TABLE,
};
use anyhow::{bail, Context, Result};
use std::time::Duration;
use sync_core::Version;
use tokio_postgres::{Client, GenericClient};
use tracing::{debug, info};

const TRIGGER_NAME: &str = "change_sync_track";

/// Whether a table exists, `name` given as `schema.table`.
pub async fn table_exists<C: GenericClient>(client: &C, name: &str) -> Result<bool> {
    let row = client
        .query_one("SELECT to_regclass($1) IS NOT NULL", &[&quote_table(name)])
        .await?;
    Ok(row.get(0))
}

/// Create the change log and the tracked table registry.
pub async fn create_tracking_tables<C: GenericClient>(client: &C) -> Result<()> {
    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {LOG_TABLE} (
            version BIGSERIAL PRIMARY KEY,
            table_name TEXT NOT NULL,
            operation TEXT NOT NULL CHECK (operation IN ('I', 'U', 'D')),
            row_key JSONB NOT NULL,
            changed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        CREATE INDEX IF NOT EXISTS change_sync_log_table_version
            ON {LOG_TABLE} (table_name, version);
        CREATE TABLE IF NOT EXISTS {TABLES_TABLE} (
            table_name TEXT PRIMARY KEY,
            min_valid_version BIGINT NOT NULL,
            enabled_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );"
    );
    client
        .batch_execute(&ddl)
        .await
        .context("Failed to create change tracking tables")?;
    Ok(())
}

/// The current change version, `None` when change tracking is not set up.
pub async fn current_version<C: GenericClient>(client: &C) -> Result<Option<Version>> {
    if !table_exists(client, LOG_TABLE).await? {
        return Ok(None);
    }
    let row = client
        .query_one(
            &format!("SELECT COALESCE(MAX(version), 0) FROM {LOG_TABLE}"),
            &[],
        )
        .await?;
    Ok(Some(row.get(0)))
}

/// Primary key columns of a table in key order.
pub async fn primary_key_columns<C: GenericClient>(client: &C, table: &str) -> Result<Vec<String>> {
    let rows = client
        .query(
            "SELECT a.attname::text
             FROM pg_index i
             CROSS JOIN LATERAL unnest(i.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum
             WHERE i.indrelid = to_regclass($1) AND i.indisprimary
             ORDER BY k.ord",
            &[&quote_table(table)],
        )
        .await?;
    Ok(rows.iter().map(|row| row.get(0)).collect())
}

/// All user tables as `schema.table`, excluding the tracking tables.
pub async fn user_tables<C: GenericClient>(client: &C) -> Result<Vec<String>> {
    let rows = client
        .query(
            "SELECT n.nspname || '.' || c.relname
             FROM pg_class c
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE c.relkind IN ('r', 'p')
               AND NOT c.relispartition
               AND n.nspname NOT IN ('pg_catalog', 'information_schema')
               AND n.nspname NOT LIKE 'pg_toast%'
               AND NOT (n.nspname = 'public' AND c.relname LIKE 'change\\_sync\\_%')
             ORDER BY 1",
            &[],
        )
        .await?;
    Ok(rows.iter().map(|row| row.get(0)).collect())
}

/// Install change tracking on `tables`, or on every user table when empty.
///
/// Re-running on an already tracked table replaces its trigger and moves its
/// minimum valid version up to the current version, so destinations behind
/// that point must be reinitialised.
pub async fn setup_tracking(client: &mut Client, tables: &[String]) -> Result<Vec<String>> {
    let tx = client.transaction().await?;
    create_tracking_tables(&tx).await?;

    let tables = if tables.is_empty() {
        user_tables(&tx).await?
    } else {
        tables.iter().map(|t| normalize_table_name(t)).collect()
    };

    for table in &tables {
        if !table_exists(&tx, table).await? {
            bail!("Table {table} does not exist");
        }
        let keys = primary_key_columns(&tx, table).await?;
        if keys.is_empty() {
            bail!("Table {table} has no primary key and cannot be tracked");
        }

        let function = trigger_function_name(table);
        let quoted = quote_table(table);
        debug!("Creating tracking trigger {function} on {quoted}");
        tx.batch_execute(&trigger_function(table, &keys))
            .await
            .with_context(|| format!("Failed to create trigger function for {table}"))?;
        tx.batch_execute(&format!(
            "DROP TRIGGER IF EXISTS {TRIGGER_NAME} ON {quoted};
             CREATE TRIGGER {TRIGGER_NAME}
             AFTER INSERT OR UPDATE OR DELETE ON {quoted}
             FOR EACH ROW EXECUTE FUNCTION {function}();"
        ))
        .await
        .with_context(|| format!("Failed to create trigger on {table}"))?;

        tx.execute(
            &format!(
                "INSERT INTO {TABLES_TABLE} (table_name, min_valid_version)
                 VALUES ($1, (SELECT COALESCE(MAX(version), 0) FROM {LOG_TABLE}))
                 ON CONFLICT (table_name) DO UPDATE
                 SET min_valid_version = EXCLUDED.min_valid_version, enabled_at = NOW()"
            ),
            &[table],
        )
        .await?;
        info!("Enabled change tracking on table {table}");
    }

    tx.commit().await?;
    Ok(tables)
}

/// Delete change history older than `retention` and advance the minimum
/// valid version of every affected table. The newest log entry is always
/// kept so the current version never goes backwards.
pub async fn cleanup_tracking(client: &mut Client, retention: Duration) -> Result<u64> {
    let tx = client.transaction().await?;
    if !table_exists(&tx, LOG_TABLE).await? {
        bail!("Change tracking is not set up");
    }

    let expired = format!(
        "changed_at < NOW() - make_interval(secs => $1::float8)
         AND version < (SELECT MAX(version) FROM {LOG_TABLE})"
    );
    let seconds = retention.as_secs_f64();

    let advanced = tx
        .execute(
            &format!(
                "UPDATE {TABLES_TABLE} r
                 SET min_valid_version = GREATEST(r.min_valid_version, p.max_version)
                 FROM (
                     SELECT table_name, MAX(version) AS max_version
                     FROM {LOG_TABLE}
                     WHERE {expired}
                     GROUP BY table_name
                 ) p
                 WHERE r.table_name = p.table_name"
            ),
            &[&seconds],
        )
        .await?;
    let deleted = tx
        .execute(
            &format!("DELETE FROM {LOG_TABLE} WHERE {expired}"),
            &[&seconds],
        )
        .await?;

    tx.commit().await?;
    info!("Removed {deleted} change log entries, advanced {advanced} table(s)");
    Ok(deleted)
}
