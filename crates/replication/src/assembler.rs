//! Change set assembly.
//!
//! One change set is assembled per destination group: every table's changes
//! since the group's watermark, read at one captured source version, merged
//! into canonical order.

use crate::backend::ChangeFeed;
use crate::feed::{ChangeFeedAdapter, FeedError};
use std::sync::Arc;
use sync_core::{ChangeSet, TableDescriptor, Version};
use tracing::{debug, info, warn};

/// Assemble the changes of `tables` since `baseline`.
pub async fn assemble<F: ChangeFeed + ?Sized>(
    source: &mut F,
    source_name: &str,
    tables: &[Arc<TableDescriptor>],
    baseline: Version,
) -> Result<ChangeSet, FeedError> {
    let snapshot = source.begin_snapshot().await?;
    if snapshot {
        info!("Snapshot isolation is enabled in database {source_name}");
    } else {
        info!(
            "Snapshot isolation is not enabled in database {source_name}, ignoring all changes above current version"
        );
    }

    let result = read_changes(source, source_name, tables, baseline, snapshot).await;

    if snapshot {
        if let Err(e) = source.end_snapshot().await {
            if result.is_ok() {
                return Err(FeedError::Unavailable(e));
            }
            debug!("Failed to end snapshot in database {source_name}: {e:#}");
        }
    }

    result
}

async fn read_changes<F: ChangeFeed + ?Sized>(
    source: &mut F,
    source_name: &str,
    tables: &[Arc<TableDescriptor>],
    baseline: Version,
    snapshot: bool,
) -> Result<ChangeSet, FeedError> {
    let version = source.current_version().await?.ok_or_else(|| {
        FeedError::Unavailable(anyhow::anyhow!(
            "change tracking is not enabled in database {source_name}"
        ))
    })?;
    info!("Current version of database {source_name} is {version}");

    let mut changes = Vec::new();
    let mut adapter = ChangeFeedAdapter::new(source);

    for table in tables {
        let fetched = adapter.fetch(table, baseline).await?;
        let before = changes.len();

        for change in fetched {
            let earliest = change.version.min(change.creation_version);
            if !snapshot && earliest > version {
                warn!(
                    "Ignoring change version {earliest} of table {} (above captured version {version})",
                    table.name
                );
                continue;
            }
            changes.push(change);
        }

        info!(
            "Table {} has {} change(s)",
            table.name,
            changes.len() - before
        );
    }

    Ok(ChangeSet::new(version, changes))
}
