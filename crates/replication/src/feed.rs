//! Change feed adapter.
//!
//! Wraps a backend's [`ChangeFeed`] and turns its raw records into
//! [`Change`]s bound to their [`TableDescriptor`]. The retention horizon is
//! checked before any changes are read.

use crate::backend::{ChangeFeed, RawChange};
use std::sync::Arc;
use sync_core::{Change, ColumnValues, Operation, TableDescriptor, Version};
use thiserror::Error;
use tracing::{debug, info};

/// Why a table's changes could not be fetched.
#[derive(Error, Debug)]
pub enum FeedError {
    /// The source could not be queried.
    #[error(transparent)]
    Unavailable(#[from] anyhow::Error),
    /// The baseline is older than the table's retained history.
    #[error("minimum version {min_valid_version} of table {table} is greater than baseline {baseline}")]
    RetentionExceeded {
        table: String,
        min_valid_version: Version,
        baseline: Version,
    },
}

/// Fetches one table's changes at a time from a change feed.
pub struct ChangeFeedAdapter<'a, F: ChangeFeed + ?Sized> {
    feed: &'a mut F,
}

impl<'a, F: ChangeFeed + ?Sized> ChangeFeedAdapter<'a, F> {
    pub fn new(feed: &'a mut F) -> Self {
        Self { feed }
    }

    /// Changes of `table` since `baseline`, in feed order.
    pub async fn fetch(
        &mut self,
        table: &Arc<TableDescriptor>,
        baseline: Version,
    ) -> Result<Vec<Change>, FeedError> {
        let min_valid_version = self.feed.min_valid_version(table).await?;
        info!(
            "Minimum version of table {} is {}",
            table.name,
            min_valid_version.map_or_else(|| "unknown".to_string(), |v| v.to_string())
        );

        if let Some(min_valid_version) = min_valid_version {
            if min_valid_version > baseline {
                return Err(FeedError::RetentionExceeded {
                    table: table.name.clone(),
                    min_valid_version,
                    baseline,
                });
            }
        }

        let records = self.feed.changes_since(table, baseline).await?;
        debug!(
            "Change feed returned {} record(s) for table {} since version {}",
            records.len(),
            table.name,
            baseline
        );

        records
            .into_iter()
            .map(|raw| to_change(table, raw).map_err(FeedError::Unavailable))
            .collect()
    }
}

/// Bind a raw record to its table's columns.
pub fn to_change(table: &Arc<TableDescriptor>, raw: RawChange) -> anyhow::Result<Change> {
    let operation = Operation::from_code(&raw.operation).ok_or_else(|| {
        anyhow::anyhow!(
            "Unknown change operation '{}' in table {}",
            raw.operation,
            table.name
        )
    })?;

    if table.key_columns.is_empty() {
        anyhow::bail!("Table {} has no primary key columns", table.name);
    }
    if raw.keys.len() != table.key_columns.len() {
        anyhow::bail!(
            "Change record for table {} has {} key value(s), expected {}",
            table.name,
            raw.keys.len(),
            table.key_columns.len()
        );
    }

    let keys: ColumnValues = table
        .key_columns
        .iter()
        .cloned()
        .zip(raw.keys)
        .collect();

    let others: ColumnValues = if operation == Operation::Delete {
        ColumnValues::new()
    } else {
        if raw.others.len() != table.other_columns.len() {
            anyhow::bail!(
                "Change record for table {} has {} column value(s), expected {}",
                table.name,
                raw.others.len(),
                table.other_columns.len()
            );
        }
        table
            .other_columns
            .iter()
            .cloned()
            .zip(raw.others)
            .collect()
    };

    // creation_version <= version
    let creation_version = raw.creation_version.unwrap_or(raw.version).min(raw.version);

    Ok(Change::new(
        table.clone(),
        operation,
        raw.version,
        creation_version,
        keys,
        others,
    ))
}
