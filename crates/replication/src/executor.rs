//! Transactional application of a change set to one destination.

use crate::backend::DestinationSession;
use anyhow::{Context, Result};
use std::collections::HashMap;
use sync_core::{ChangeSet, ForeignKeyConstraint, Operation, SyncError, Version};
use tracing::{debug, info, warn};

/// Applies change sets to destinations, one transaction per destination.
#[derive(Debug, Clone, Copy, Default)]
pub struct Executor {
    dry_run: bool,
}

impl Executor {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    /// Apply `change_set` to `session` and advance its watermark to the
    /// change set's version.
    ///
    /// On any statement failure the transaction is rolled back and the
    /// destination is left untouched. In dry-run mode every step is
    /// evaluated but no mutating statement is issued and the transaction is
    /// rolled back.
    pub async fn apply<D: DestinationSession + ?Sized>(
        &self,
        session: &mut D,
        destination: &str,
        change_set: &ChangeSet,
    ) -> Result<(), SyncError> {
        info!(
            "Replicating {} change(s) to destination {}",
            change_set.len(),
            destination
        );

        session
            .begin()
            .await
            .map_err(|e| SyncError::destination_unavailable(destination, e))?;

        let applied = self.apply_changes(session, change_set).await;

        let finished = match applied {
            Ok(()) if !self.dry_run => self.finish(session, change_set.version).await,
            Ok(()) => session.rollback().await.context("Failed to roll back dry run"),
            Err(e) => {
                if let Err(rollback) = session.rollback().await {
                    warn!("Failed to roll back transaction on destination {destination}: {rollback:#}");
                }
                Err(e)
            }
        };

        finished.map_err(|e| SyncError::apply_failed(destination, e))?;

        if self.dry_run {
            info!(
                "Dry run: destination {destination} would now be at version {}",
                change_set.version
            );
        } else {
            info!(
                "Destination {destination} now at version {}",
                change_set.version
            );
        }
        Ok(())
    }

    async fn finish<D: DestinationSession + ?Sized>(
        &self,
        session: &mut D,
        version: Version,
    ) -> Result<()> {
        let written = session
            .write_watermark(version)
            .await
            .with_context(|| format!("Failed to set destination version to {version}"));
        if let Err(e) = written {
            if let Err(rollback) = session.rollback().await {
                warn!("Failed to roll back transaction: {rollback:#}");
            }
            return Err(e);
        }
        session.commit().await.context("Failed to commit transaction")
    }

    async fn apply_changes<D: DestinationSession + ?Sized>(
        &self,
        session: &mut D,
        change_set: &ChangeSet,
    ) -> Result<()> {
        let changes = &change_set.changes;
        let mut disabled: HashMap<ForeignKeyConstraint, Version> = HashMap::new();

        for (i, change) in changes.iter().enumerate() {
            debug!(
                "Replicating change #{} of {} (Version {}, CreationVersion {})",
                i + 1,
                changes.len(),
                change.version,
                change.creation_version
            );

            for (fk, &until) in &change.disabled_constraints {
                match disabled.get_mut(fk) {
                    Some(current) => {
                        if until > *current {
                            *current = until;
                        }
                    }
                    None => {
                        debug!("Disabling foreign key constraint {}", fk.full_name());
                        if !self.dry_run {
                            session.disable_foreign_key(fk).await.with_context(|| {
                                format!("Failed to disable foreign key constraint {}", fk.full_name())
                            })?;
                        }
                        disabled.insert(fk.clone(), until);
                    }
                }
            }

            if !self.dry_run {
                let performed = match change.operation {
                    Operation::Insert => session.insert(change).await,
                    Operation::Update => session.update(change).await,
                    Operation::Delete => session.delete(change).await,
                };
                performed.with_context(|| {
                    format!(
                        "Failed to {} row {:?} of table {} (version {})",
                        change.operation,
                        change.keys.to_json_object(),
                        change.table_name(),
                        change.version
                    )
                })?;
            }

            let boundary = changes
                .get(i + 1)
                .map_or(true, |next| next.creation_version > change.creation_version);
            if !boundary {
                continue;
            }

            let expired: Vec<ForeignKeyConstraint> = disabled
                .iter()
                .filter(|(_, &until)| until <= change.creation_version)
                .map(|(fk, _)| fk.clone())
                .collect();
            for fk in expired {
                debug!("Re-enabling foreign key constraint {}", fk.full_name());
                if !self.dry_run {
                    session.enable_foreign_key(&fk).await.with_context(|| {
                        format!("Failed to re-enable foreign key constraint {}", fk.full_name())
                    })?;
                }
                disabled.remove(&fk);
            }
        }

        // Windows end at or before the last creation version, so nothing
        // can still be disabled here.
        if !disabled.is_empty() {
            anyhow::bail!(
                "Foreign key constraint(s) still disabled after the last change: {}",
                disabled
                    .keys()
                    .map(|fk| fk.full_name())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        Ok(())
    }
}
