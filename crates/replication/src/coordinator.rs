//! Per-destination watermarks and destination groups.

use crate::assembler::assemble;
use crate::backend::{Backend, DestinationSession};
use crate::executor::Executor;
use crate::feed::FeedError;
use crate::planner::plan_foreign_key_windows;
use crate::report::PassReport;
use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use sync_core::{DatabaseInfo, ReplicationSet, SyncError, TableDescriptor, Version};
use tracing::{debug, info};

/// Destinations sharing a watermark, replicated from one change set.
pub struct DestinationGroup<D> {
    pub watermark: Version,
    pub members: Vec<(DatabaseInfo, D)>,
}

impl<D> DestinationGroup<D> {
    pub fn names(&self) -> Vec<String> {
        self.members.iter().map(|(db, _)| db.name.clone()).collect()
    }
}

/// Read a destination's watermark.
///
/// Without a stored watermark, a destination carrying change tracking of
/// its own (a restored copy of the source) is at its tracked version;
/// anything else starts from 0.
pub async fn read_watermark<D: DestinationSession + ?Sized>(
    session: &mut D,
    destination: &str,
) -> Result<Version> {
    if let Some(version) = session.read_watermark().await? {
        info!("Database {destination} is at version {version}");
        return Ok(version);
    }

    info!("No replication watermark in database {destination}");
    match session.tracked_version().await? {
        Some(version) => {
            info!("Database {destination} is at version {version}");
            Ok(version)
        }
        None => {
            info!("Change tracking not enabled in database {destination}, assuming version 0");
            Ok(0)
        }
    }
}

/// Runs replication passes of one replication set.
pub struct VersionCoordinator<'a, B: Backend> {
    backend: &'a B,
    executor: Executor,
}

impl<'a, B: Backend> VersionCoordinator<'a, B> {
    pub fn new(backend: &'a B, executor: Executor) -> Self {
        Self { backend, executor }
    }

    /// Connect every destination and group them by watermark.
    ///
    /// Unreachable destinations are recorded and left out. With a `bound`,
    /// destinations already at or above it are left out as well.
    pub async fn group_destinations(
        &self,
        replication_set: &ReplicationSet,
        bound: Option<Version>,
        report: &mut PassReport,
    ) -> Vec<DestinationGroup<B::Destination>> {
        let mut groups: BTreeMap<Version, Vec<(DatabaseInfo, B::Destination)>> = BTreeMap::new();

        for destination in &replication_set.destinations {
            let mut session = match self.backend.connect_destination(destination).await {
                Ok(session) => session,
                Err(e) => {
                    report.record(
                        &replication_set.name,
                        Some(&destination.name),
                        SyncError::destination_unavailable(
                            &destination.name,
                            e.context("skipping this destination"),
                        ),
                    );
                    continue;
                }
            };

            let watermark = match read_watermark(&mut session, &destination.name).await {
                Ok(watermark) => watermark,
                Err(e) => {
                    report.record(
                        &replication_set.name,
                        Some(&destination.name),
                        SyncError::destination_unavailable(
                            &destination.name,
                            e.context("error getting current version, skipping this destination"),
                        ),
                    );
                    continue;
                }
            };

            if let Some(bound) = bound {
                if watermark >= bound {
                    debug!(
                        "Destination {} is already at version {watermark} (source at {bound})",
                        destination.name
                    );
                    continue;
                }
            }

            groups
                .entry(watermark)
                .or_default()
                .push((destination.clone(), session));
        }

        groups
            .into_iter()
            .map(|(watermark, members)| DestinationGroup { watermark, members })
            .collect()
    }

    /// Run one pass of `replication_set` over `tables`.
    ///
    /// Group failures are recorded and do not stop other groups. A source
    /// failure aborts the rest of this set's pass.
    pub async fn run(
        &self,
        replication_set: &ReplicationSet,
        tables: &[Arc<TableDescriptor>],
        bound: Option<Version>,
        report: &mut PassReport,
    ) {
        if tables.is_empty() {
            return;
        }

        info!(
            "Starting replication for replication set {}",
            replication_set.name
        );

        let groups = self
            .group_destinations(replication_set, bound, report)
            .await;
        if groups.is_empty() {
            debug!(
                "No destinations to replicate in replication set {}",
                replication_set.name
            );
            return;
        }

        let source_info = &replication_set.source;
        let mut source = match self.backend.connect_source(source_info).await {
            Ok(source) => source,
            Err(e) => {
                report.record(
                    &replication_set.name,
                    None,
                    SyncError::source_unavailable(&source_info.name, e),
                );
                return;
            }
        };

        for group in groups {
            let names = group.names();
            let mut change_set =
                match assemble(&mut source, &source_info.name, tables, group.watermark).await {
                    Ok(change_set) => change_set,
                    Err(FeedError::RetentionExceeded {
                        table,
                        min_valid_version,
                        baseline,
                    }) => {
                        report.record(
                            &replication_set.name,
                            None,
                            SyncError::RetentionExceeded {
                                table,
                                min_valid_version,
                                watermark: baseline,
                                destinations: names,
                            },
                        );
                        continue;
                    }
                    Err(FeedError::Unavailable(e)) => {
                        report.record(
                            &replication_set.name,
                            None,
                            SyncError::source_unavailable(&source_info.name, e),
                        );
                        return;
                    }
                };

            plan_foreign_key_windows(&mut change_set.changes);

            for (destination, mut session) in group.members {
                if let Err(e) = self
                    .executor
                    .apply(&mut session, &destination.name, &change_set)
                    .await
                {
                    report.record(&replication_set.name, Some(&destination.name), e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sync_core::{Change, ForeignKeyConstraint};

    struct WatermarkOnly {
        watermark: Option<Version>,
        tracked: Option<Version>,
    }

    #[async_trait]
    impl DestinationSession for WatermarkOnly {
        async fn read_watermark(&mut self) -> Result<Option<Version>> {
            Ok(self.watermark)
        }
        async fn tracked_version(&mut self) -> Result<Option<Version>> {
            Ok(self.tracked)
        }
        async fn begin(&mut self) -> Result<()> {
            Ok(())
        }
        async fn disable_foreign_key(&mut self, _fk: &ForeignKeyConstraint) -> Result<()> {
            Ok(())
        }
        async fn enable_foreign_key(&mut self, _fk: &ForeignKeyConstraint) -> Result<()> {
            Ok(())
        }
        async fn insert(&mut self, _change: &Change) -> Result<()> {
            Ok(())
        }
        async fn update(&mut self, _change: &Change) -> Result<()> {
            Ok(())
        }
        async fn delete(&mut self, _change: &Change) -> Result<()> {
            Ok(())
        }
        async fn write_watermark(&mut self, _version: Version) -> Result<()> {
            Ok(())
        }
        async fn commit(&mut self) -> Result<()> {
            Ok(())
        }
        async fn rollback(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stored_watermark_wins() {
        let mut session = WatermarkOnly {
            watermark: Some(12),
            tracked: Some(40),
        };
        assert_eq!(read_watermark(&mut session, "replica").await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_tracked_version_fallback() {
        let mut session = WatermarkOnly {
            watermark: None,
            tracked: Some(40),
        };
        assert_eq!(read_watermark(&mut session, "replica").await.unwrap(), 40);
    }

    #[tokio::test]
    async fn test_defaults_to_zero() {
        let mut session = WatermarkOnly {
            watermark: None,
            tracked: None,
        };
        assert_eq!(read_watermark(&mut session, "replica").await.unwrap(), 0);
    }
}
