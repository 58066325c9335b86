//! Schema metadata from `pg_catalog`.

use crate::sql::{quote_table, TABLES_TABLE};
use crate::tracking::table_exists;
use crate::PostgresSource;
use anyhow::{Context, Result};
use async_trait::async_trait;
use replication::SchemaCatalog;
use sync_core::{ForeignKeyConstraint, TableDescriptor, UniqueConstraint};
use tracing::{debug, warn};

const COLUMNS_QUERY: &str = "
    SELECT a.attname::text,
           pk.ord IS NOT NULL AS is_key,
           a.attidentity IN ('a', 'd') AS is_identity
    FROM pg_attribute a
    LEFT JOIN LATERAL (
        SELECT k.ord
        FROM pg_index i
        CROSS JOIN LATERAL unnest(i.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
        WHERE i.indrelid = a.attrelid AND i.indisprimary AND k.attnum = a.attnum
    ) pk ON TRUE
    WHERE a.attrelid = to_regclass($1)
      AND a.attnum > 0
      AND NOT a.attisdropped
      AND a.attgenerated <> 's'
    ORDER BY pk.ord NULLS LAST, a.attnum";

const FOREIGN_KEYS_QUERY: &str = "
    SELECT con.conname::text,
           src_ns.nspname || '.' || src.relname,
           a.attname::text,
           ref_ns.nspname || '.' || ref.relname,
           ra.attname::text
    FROM pg_constraint con
    JOIN pg_class src ON src.oid = con.conrelid
    JOIN pg_namespace src_ns ON src_ns.oid = src.relnamespace
    JOIN pg_class ref ON ref.oid = con.confrelid
    JOIN pg_namespace ref_ns ON ref_ns.oid = ref.relnamespace
    CROSS JOIN LATERAL unnest(con.conkey, con.confkey) AS k(col, ref_col)
    JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.col
    JOIN pg_attribute ra ON ra.attrelid = con.confrelid AND ra.attnum = k.ref_col
    WHERE con.contype = 'f' AND con.convalidated
    ORDER BY 2, 1";

const UNIQUE_QUERY: &str = "
    SELECT ic.relname::text,
           n.nspname || '.' || t.relname,
           array_agg(a.attname::text ORDER BY k.ord),
           EXISTS (
               SELECT 1 FROM pg_constraint c
               WHERE c.conindid = x.indexrelid AND c.contype = 'u'
           )
    FROM pg_index x
    JOIN pg_class ic ON ic.oid = x.indexrelid
    JOIN pg_class t ON t.oid = x.indrelid
    JOIN pg_namespace n ON n.oid = t.relnamespace
    CROSS JOIN LATERAL unnest(x.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
    JOIN pg_attribute a ON a.attrelid = x.indrelid AND a.attnum = k.attnum
    WHERE x.indisunique
      AND NOT x.indisprimary
      AND n.nspname NOT IN ('pg_catalog', 'information_schema')
      AND n.nspname NOT LIKE 'pg_toast%'
    GROUP BY x.indexrelid, ic.relname, n.nspname, t.relname
    ORDER BY 2, 1";

/// Columns of one table as `(key_columns, other_columns, has_identity)`.
async fn describe_columns(
    client: &tokio_postgres::Client,
    table: &str,
) -> Result<(Vec<String>, Vec<String>, bool)> {
    let rows = client
        .query(COLUMNS_QUERY, &[&quote_table(table)])
        .await
        .with_context(|| format!("Failed to describe columns of {table}"))?;

    let mut keys = Vec::new();
    let mut others = Vec::new();
    let mut has_identity = false;
    for row in rows {
        let name: String = row.get(0);
        if row.get::<_, bool>(1) {
            has_identity |= row.get::<_, bool>(2);
            keys.push(name);
        } else {
            others.push(name);
        }
    }
    Ok((keys, others, has_identity))
}

#[async_trait]
impl SchemaCatalog for PostgresSource {
    async fn describe_tracked_tables(&mut self) -> Result<Vec<TableDescriptor>> {
        if !table_exists(&self.client, TABLES_TABLE).await? {
            return Ok(Vec::new());
        }

        let rows = self
            .client
            .query(
                &format!("SELECT table_name FROM {TABLES_TABLE} ORDER BY table_name"),
                &[],
            )
            .await?;

        let mut tables = Vec::new();
        for row in rows {
            let name: String = row.get(0);
            if !table_exists(&self.client, &name).await? {
                warn!("Tracked table {name} no longer exists");
                continue;
            }
            let (keys, others, has_identity) = describe_columns(&self.client, &name).await?;
            debug!(
                "Table {name}: keys {keys:?}, {} other column(s), identity {has_identity}",
                others.len()
            );
            tables.push(TableDescriptor::new(name, keys, others, has_identity));
        }
        Ok(tables)
    }

    async fn describe_foreign_keys(&mut self) -> Result<Vec<ForeignKeyConstraint>> {
        let rows = self
            .client
            .query(FOREIGN_KEYS_QUERY, &[])
            .await
            .context("Failed to describe foreign keys")?;
        Ok(rows
            .iter()
            .map(|row| {
                ForeignKeyConstraint::new(
                    row.get::<_, String>(0),
                    row.get::<_, String>(1),
                    row.get::<_, String>(2),
                    row.get::<_, String>(3),
                    row.get::<_, String>(4),
                )
            })
            .collect())
    }

    async fn describe_unique_constraints(&mut self) -> Result<Vec<UniqueConstraint>> {
        let rows = self
            .client
            .query(UNIQUE_QUERY, &[])
            .await
            .context("Failed to describe unique constraints")?;
        Ok(rows
            .iter()
            .map(|row| UniqueConstraint {
                name: row.get(0),
                table: row.get(1),
                columns: row.get(2),
                is_constraint: row.get(3),
            })
            .collect())
    }
}
