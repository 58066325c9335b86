//! Per-pass result accumulator.

use sync_core::SyncError;
use tracing::error;

/// One failure recorded during a pass.
#[derive(Debug)]
pub struct Failure {
    pub replication_set: String,
    /// The destination that failed, `None` for set- or group-wide failures
    pub destination: Option<String>,
    pub error: SyncError,
}

/// Outcome of a replication pass over one or more replication sets.
///
/// Failures are collected here instead of aborting the pass, so one failing
/// destination, group or replication set never stops its siblings.
#[derive(Debug, Default)]
pub struct PassReport {
    pub failures: Vec<Failure>,
}

impl PassReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log and record a failure.
    pub fn record(
        &mut self,
        replication_set: &str,
        destination: Option<&str>,
        error: SyncError,
    ) {
        match destination {
            Some(destination) => error!(
                "Replication set {replication_set}, destination {destination}: {error}"
            ),
            None => error!("Replication set {replication_set}: {error}"),
        }
        self.failures.push(Failure {
            replication_set: replication_set.to_string(),
            destination: destination.map(str::to_string),
            error,
        });
    }

    pub fn merge(&mut self, other: PassReport) {
        self.failures.extend(other.failures);
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failures recorded against a replication set.
    pub fn failures_of<'a>(
        &'a self,
        replication_set: &'a str,
    ) -> impl Iterator<Item = &'a Failure> + 'a {
        self.failures
            .iter()
            .filter(move |f| f.replication_set == replication_set)
    }
}
