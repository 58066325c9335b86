//! Duration parsing utilities.

use anyhow::Context;
use std::time::Duration;

/// Parse a duration string like "2d", "1h", "30m", "300s", "300" into seconds.
/// Supports:
/// - Plain numbers (interpreted as seconds): "300"
/// - Seconds suffix: "300s"
/// - Minutes suffix: "30m"
/// - Hours suffix: "1h"
/// - Days suffix: "2d"
pub fn parse_duration_to_secs(s: &str) -> anyhow::Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("Empty duration string");
    }

    let (num_str, unit, multiplier) = if let Some(n) = s.strip_suffix('d') {
        (n, "days", 86_400)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, "hours", 3_600)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, "minutes", 60)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, "seconds", 1)
    } else {
        // No suffix - treat as seconds
        (s, "duration", 1)
    };

    let value: u64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid {unit} value: {num_str}"))?;
    value
        .checked_mul(multiplier)
        .with_context(|| format!("Duration out of range: {s}"))
}

/// [`parse_duration_to_secs`] as a [`Duration`], for clap value parsers.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    parse_duration_to_secs(s).map(Duration::from_secs)
}
