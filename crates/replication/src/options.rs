use std::time::Duration;

/// Default pause between the starts of two loop ticks.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Process-level controls for a [`Synchronizer`](crate::Synchronizer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Evaluate every pass without mutating destinations or watermarks
    pub dry_run: bool,
    /// Per-statement timeout, `None` for the database default
    pub command_timeout: Option<Duration>,
    /// Loop mode tick interval
    pub interval: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            command_timeout: None,
            interval: DEFAULT_INTERVAL,
        }
    }
}
