//! Table discovery for a replication set.

use crate::backend::SchemaCatalog;
use anyhow::Result;
use std::sync::Arc;
use sync_core::{ReplicationSet, TableDescriptor};
use tracing::{info, warn};

/// Describe the tracked tables of a replication set's source.
///
/// Foreign keys and unique constraints are attached to their owning table,
/// then the list is filtered against the set's allow-list.
pub async fn load_tables<C: SchemaCatalog + ?Sized>(
    catalog: &mut C,
    replication_set: &ReplicationSet,
) -> Result<Vec<Arc<TableDescriptor>>> {
    let mut tables = catalog.describe_tracked_tables().await?;
    let foreign_keys = catalog.describe_foreign_keys().await?;
    let unique_constraints = catalog.describe_unique_constraints().await?;

    for table in &mut tables {
        table.foreign_keys = foreign_keys
            .iter()
            .filter(|fk| fk.table == table.name)
            .cloned()
            .collect();
        table.unique_constraints = unique_constraints
            .iter()
            .filter(|uq| uq.table == table.name)
            .cloned()
            .collect();
    }

    let tables = filter_tables(tables, &replication_set.tables);

    if tables.is_empty() {
        warn!(
            "No tables to replicate in replication set {} (check if change tracking is enabled)",
            replication_set.name
        );
    } else {
        info!(
            "Replicating {} table(s) in replication set {}: {}",
            tables.len(),
            replication_set.name,
            tables
                .iter()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    Ok(tables.into_iter().map(Arc::new).collect())
}

/// Keep the tables named in `allow_list`; an empty list keeps everything.
pub fn filter_tables(tables: Vec<TableDescriptor>, allow_list: &[String]) -> Vec<TableDescriptor> {
    if allow_list.is_empty() {
        return tables;
    }
    tables
        .into_iter()
        .filter(|t| allow_list.iter().any(|entry| t.matches_name(entry)))
        .collect()
}
