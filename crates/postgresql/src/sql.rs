//! SQL text for change tracking and change application.
//!
//! Table names are carried schema-qualified and unquoted (`public.users`);
//! everything here quotes identifiers before they reach a statement. Row
//! values travel as one JSONB parameter and are expanded with
//! `jsonb_populate_record`, so column types come from the table itself.

use sync_core::TableDescriptor;

/// Change log filled by the tracking triggers.
pub const LOG_TABLE: &str = "public.change_sync_log";
/// Registry of tracked tables and their minimum valid versions.
pub const TABLES_TABLE: &str = "public.change_sync_tables";
/// Destination watermark.
pub const WATERMARK_TABLE: &str = "public.change_sync_info";
/// Advisory lock key ordering change logging against version capture.
///
/// Triggers hold it shared until their transaction ends; a source takes it
/// exclusively while its snapshot is fixed, so every logged version at or
/// below the captured one belongs to a committed transaction.
pub const CAPTURE_LOCK_KEY: i64 = 0x6368_616e_6765;

const DEFAULT_SCHEMA: &str = "public";

/// Quote an identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Split `schema.table` into its parts, defaulting to `public`.
pub fn split_table_name(name: &str) -> (&str, &str) {
    name.split_once('.').unwrap_or((DEFAULT_SCHEMA, name))
}

/// `users` -> `public.users`, with any quoting removed.
pub fn normalize_table_name(name: &str) -> String {
    let unquoted: String = name.chars().filter(|c| *c != '"').collect();
    let (schema, table) = split_table_name(&unquoted);
    format!("{schema}.{table}")
}

/// `public.users` -> `"public"."users"`
pub fn quote_table(name: &str) -> String {
    let (schema, table) = split_table_name(name);
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

fn populated_record(table: &str) -> String {
    format!("jsonb_populate_record(NULL::{table}, $1::jsonb) r")
}

fn key_match(alias: &str, keys: &[String]) -> String {
    keys.iter()
        .map(|k| {
            let k = quote_ident(k);
            format!("{alias}.{k} = r.{k}")
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Insert of one row, identity columns taken from the row.
pub fn insert_statement(table: &TableDescriptor) -> String {
    let name = quote_table(&table.name);
    let columns: Vec<String> = table.column_names().map(|c| quote_ident(c)).collect();
    let values: Vec<String> = columns.iter().map(|c| format!("r.{c}")).collect();
    let overriding = if table.has_identity {
        " OVERRIDING SYSTEM VALUE"
    } else {
        ""
    };
    format!(
        "INSERT INTO {name} ({}){overriding} SELECT {} FROM {}",
        columns.join(", "),
        values.join(", "),
        populated_record(&name)
    )
}

/// Update of all non-key columns of one row, `None` for key-only tables.
pub fn update_statement(table: &TableDescriptor) -> Option<String> {
    if table.other_columns.is_empty() {
        return None;
    }
    let name = quote_table(&table.name);
    let assignments: Vec<String> = table
        .other_columns
        .iter()
        .map(|c| {
            let c = quote_ident(c);
            format!("{c} = r.{c}")
        })
        .collect();
    Some(format!(
        "UPDATE {name} AS t SET {} FROM {} WHERE {}",
        assignments.join(", "),
        populated_record(&name),
        key_match("t", &table.key_columns)
    ))
}

/// Delete of one row by key.
pub fn delete_statement(table: &TableDescriptor) -> String {
    let name = quote_table(&table.name);
    format!(
        "DELETE FROM {name} AS t USING {} WHERE {}",
        populated_record(&name),
        key_match("t", &table.key_columns)
    )
}

/// Net changes of one table since a baseline.
///
/// Parameters: `$1` table name, `$2` baseline version. Columns: operation,
/// version, creation version, key values and other values (JSON arrays in
/// descriptor order). Deleted rows keep their logged key and have null
/// other values.
pub fn net_changes_query(table: &TableDescriptor) -> String {
    let name = quote_table(&table.name);
    let keys: Vec<String> = table
        .key_columns
        .iter()
        .map(|c| format!("k.{}", quote_ident(c)))
        .collect();
    let others: Vec<String> = table
        .other_columns
        .iter()
        .map(|c| format!("t.{}", quote_ident(c)))
        .collect();
    let join: Vec<String> = table
        .key_columns
        .iter()
        .map(|c| {
            let c = quote_ident(c);
            format!("t.{c} = k.{c}")
        })
        .collect();

    format!(
        "WITH c AS (
            SELECT row_key,
                   MAX(version) AS version,
                   MAX(version) FILTER (WHERE operation = 'I') AS creation_version,
                   (ARRAY_AGG(operation ORDER BY version DESC))[1] AS last_operation,
                   (ARRAY_AGG(operation ORDER BY version ASC))[1] AS first_operation
            FROM {LOG_TABLE}
            WHERE table_name = $1 AND version > $2
            GROUP BY row_key
        )
        SELECT CASE
                   WHEN c.last_operation = 'D' THEN 'D'
                   WHEN c.first_operation = 'I' THEN 'I'
                   ELSE 'U'
               END AS operation,
               c.version,
               c.creation_version,
               jsonb_build_array({}) AS key_values,
               jsonb_build_array({}) AS other_values
        FROM c
        CROSS JOIN LATERAL jsonb_populate_record(NULL::{name}, c.row_key) k
        LEFT JOIN {name} t ON {}
        ORDER BY COALESCE(c.creation_version, c.version)",
        keys.join(", "),
        others.join(", "),
        join.join(" AND ")
    )
}

/// Name of the tracking trigger function of a table.
pub fn trigger_function_name(table: &str) -> String {
    let sanitized: String = table
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("public.{}", quote_ident(&format!("change_sync_track_{sanitized}")))
}

/// Opens the source's read-only snapshot. The trailing query fixes it.
pub const SNAPSHOT_BEGIN: &str = "BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY; SELECT 1";

/// Waits for every transaction that has logged a change to finish.
pub fn capture_lock_statement() -> String {
    format!("SELECT pg_advisory_lock({CAPTURE_LOCK_KEY})")
}

pub fn capture_unlock_statement() -> String {
    format!("SELECT pg_advisory_unlock({CAPTURE_LOCK_KEY})")
}

/// Trigger function logging every row change of `table` with its key.
///
/// A key update is logged as a delete of the old key followed by an insert
/// of the new one.
pub fn trigger_function(table: &str, key_columns: &[String]) -> String {
    let function = trigger_function_name(table);
    let row_key = |record: &str| {
        let pairs: Vec<String> = key_columns
            .iter()
            .map(|k| format!("'{}', {record}.{}", k.replace('\'', "''"), quote_ident(k)))
            .collect();
        format!("jsonb_build_object({})", pairs.join(", "))
    };
    let key_row = |record: &str| {
        let columns: Vec<String> = key_columns
            .iter()
            .map(|k| format!("{record}.{}", quote_ident(k)))
            .collect();
        format!("ROW({})", columns.join(", "))
    };
    let literal = table.replace('\'', "''");
    let old_key = row_key("OLD");
    let new_key = row_key("NEW");
    let old_row = key_row("OLD");
    let new_row = key_row("NEW");

    format!(
        "CREATE OR REPLACE FUNCTION {function}() RETURNS TRIGGER AS $$
        BEGIN
            PERFORM pg_advisory_xact_lock_shared({CAPTURE_LOCK_KEY});
            IF TG_OP = 'DELETE' THEN
                INSERT INTO {LOG_TABLE} (table_name, operation, row_key)
                VALUES ('{literal}', 'D', {old_key});
                RETURN OLD;
            ELSIF TG_OP = 'UPDATE' AND {old_row} IS DISTINCT FROM {new_row} THEN
                INSERT INTO {LOG_TABLE} (table_name, operation, row_key)
                VALUES ('{literal}', 'D', {old_key});
                INSERT INTO {LOG_TABLE} (table_name, operation, row_key)
                VALUES ('{literal}', 'I', {new_key});
                RETURN NEW;
            ELSIF TG_OP = 'UPDATE' THEN
                INSERT INTO {LOG_TABLE} (table_name, operation, row_key)
                VALUES ('{literal}', 'U', {new_key});
                RETURN NEW;
            ELSE
                INSERT INTO {LOG_TABLE} (table_name, operation, row_key)
                VALUES ('{literal}', 'I', {new_key});
                RETURN NEW;
            END IF;
        END;
        $$ LANGUAGE plpgsql"
    )
}
