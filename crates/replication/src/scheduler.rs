//! One-shot and loop replication across all replication sets.

use crate::backend::{Backend, ChangeFeed};
use crate::catalog::load_tables;
use crate::coordinator::VersionCoordinator;
use crate::executor::Executor;
use crate::options::SyncOptions;
use crate::report::PassReport;
use std::sync::Arc;
use std::time::Instant;
use sync_core::{Config, SyncError, TableDescriptor, Version};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Emitted in loop mode once per replication set whose source version
/// advanced, whether or not the pass succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedEvent {
    pub replication_set: String,
    /// The captured source version the pass ran against
    pub version: Version,
}

/// Replicates every configured replication set through one backend.
pub struct Synchronizer<B: Backend> {
    backend: B,
    config: Config,
    options: SyncOptions,
    tables: Vec<Option<Vec<Arc<TableDescriptor>>>>,
    subscribers: Vec<mpsc::UnboundedSender<SyncedEvent>>,
}

impl<B: Backend> Synchronizer<B> {
    pub fn new(backend: B, config: Config, options: SyncOptions) -> Self {
        let tables = vec![None; config.replication_sets.len()];
        Self {
            backend,
            config,
            options,
            tables,
            subscribers: Vec::new(),
        }
    }

    /// Receive a [`SyncedEvent`] for every loop-mode pass.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SyncedEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Load the tables of every replication set not loaded yet.
    ///
    /// Sets whose source catalog cannot be read are recorded in the report
    /// and retried on the next pass.
    pub async fn init(&mut self) -> PassReport {
        if let Some(timeout) = self.options.command_timeout {
            info!("Command timeout is {} second(s)", timeout.as_secs());
        }

        let mut report = PassReport::new();
        for index in 0..self.config.replication_sets.len() {
            if let Err(e) = self.tables_of(index).await {
                let name = self.config.replication_sets[index].name.clone();
                report.record(&name, None, e);
            }
        }
        report
    }

    async fn tables_of(&mut self, index: usize) -> Result<Vec<Arc<TableDescriptor>>, SyncError> {
        if let Some(tables) = &self.tables[index] {
            return Ok(tables.clone());
        }

        let replication_set = &self.config.replication_sets[index];
        info!(
            "Getting replication information for replication set {}",
            replication_set.name
        );

        let source = &replication_set.source;
        let mut session = self
            .backend
            .connect_source(source)
            .await
            .map_err(|e| SyncError::source_unavailable(&source.name, e))?;
        let tables = load_tables(&mut session, replication_set)
            .await
            .map_err(|e| {
                SyncError::source_unavailable(
                    &source.name,
                    e.context("error getting tables to replicate"),
                )
            })?;

        self.tables[index] = Some(tables.clone());
        Ok(tables)
    }

    /// Run one pass over every replication set.
    pub async fn run_once(&mut self) -> PassReport {
        let mut report = PassReport::new();

        for index in 0..self.config.replication_sets.len() {
            let tables = match self.tables_of(index).await {
                Ok(tables) => tables,
                Err(e) => {
                    let name = self.config.replication_sets[index].name.clone();
                    report.record(&name, None, e);
                    continue;
                }
            };

            let coordinator = VersionCoordinator::new(&self.backend, self.executor());
            coordinator
                .run(
                    &self.config.replication_sets[index],
                    &tables,
                    None,
                    &mut report,
                )
                .await;
        }

        log_finished(&report);
        report
    }

    /// Run one pass over every replication set, `true` if nothing failed.
    pub async fn sync(&mut self) -> bool {
        self.run_once().await.is_success()
    }

    /// Replicate whenever a source's version advances, until `token` is
    /// cancelled.
    ///
    /// Cancellation is honoured at the start of a tick and between
    /// replication sets; an apply in progress always runs to completion.
    pub async fn sync_loop(&mut self, token: CancellationToken) {
        let mut current_versions: Vec<Version> = vec![0; self.config.replication_sets.len()];

        loop {
            if token.is_cancelled() {
                info!("Stopping replication.");
                return;
            }

            let start = Instant::now();
            let mut report = PassReport::new();

            for index in 0..self.config.replication_sets.len() {
                self.tick(index, &mut current_versions[index], &mut report)
                    .await;

                if token.is_cancelled() {
                    info!("Stopping replication.");
                    return;
                }
            }

            log_finished(&report);

            let delay = self.options.interval.saturating_sub(start.elapsed());
            debug!("Next replication tick in {} ms", delay.as_millis());
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Stopping replication.");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn tick(&mut self, index: usize, current_version: &mut Version, report: &mut PassReport) {
        let name = self.config.replication_sets[index].name.clone();

        let version = match self.source_version(index).await {
            Ok(version) => version,
            Err(e) => {
                report.record(&name, None, e);
                return;
            }
        };
        debug!("Current version of source in replication set {name} is {version}.");

        if version <= *current_version {
            return;
        }
        info!(
            "Current version of source in replication set {name} has increased from {} to {version}: Starting replication.",
            *current_version
        );

        let mut pass = PassReport::new();
        match self.tables_of(index).await {
            Ok(tables) => {
                let coordinator = VersionCoordinator::new(&self.backend, self.executor());
                coordinator
                    .run(
                        &self.config.replication_sets[index],
                        &tables,
                        Some(version),
                        &mut pass,
                    )
                    .await;
            }
            Err(e) => pass.record(&name, None, e),
        }

        if pass.is_success() {
            *current_version = version;
        }
        report.merge(pass);

        self.notify(SyncedEvent {
            replication_set: name,
            version,
        });
    }

    async fn source_version(&self, index: usize) -> Result<Version, SyncError> {
        let source = &self.config.replication_sets[index].source;
        let mut session = self
            .backend
            .connect_source(source)
            .await
            .map_err(|e| SyncError::source_unavailable(&source.name, e))?;
        session
            .current_version()
            .await
            .map_err(|e| SyncError::source_unavailable(&source.name, e))?
            .ok_or_else(|| {
                SyncError::source_unavailable(&source.name, "change tracking is not enabled")
            })
    }

    fn notify(&mut self, event: SyncedEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn executor(&self) -> Executor {
        Executor::new(self.options.dry_run)
    }
}

fn log_finished(report: &PassReport) {
    if report.is_success() {
        info!("Finished replication without errors");
    } else {
        info!(
            "Finished replication with errors ({} failure(s))",
            report.failures.len()
        );
    }
}
