//! Wall-clock budget helpers for the build loop.

use std::time::{Duration, Instant};

/// True once `limit` has elapsed since `started`. No limit never expires.
///
/// Only consulted at cycle boundaries; an in-flight build is never cut short.
pub fn deadline_passed(started: Instant, limit: Option<Duration>, now: Instant) -> bool {
    match limit {
        Some(limit) => now.saturating_duration_since(started) >= limit,
        None => false,
    }
}

/// Render a duration as `1h 02m 03s`, `4m 05s`, or `6s`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h {minutes:02}m {seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}
