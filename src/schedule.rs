//! Next reconciliation deadline derived from the leaf certificate expiry

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Shortest self-scheduled requeue
pub const MIN_REQUEUE: Duration = Duration::from_secs(60);

/// Compute how long to wait before the next forced pass.
///
/// Returns `None` when generation is disabled: the controller then only
/// reacts to watch events. Otherwise the deadline is `lookahead` before
/// `not_after`. If that moment has already passed, the deadline falls back
/// to when the certificate enters the `expiration_threshold` window, and is
/// never shorter than [`MIN_REQUEUE`].
pub fn requeue_after(
    auto_generate: bool,
    not_after: DateTime<Utc>,
    now: DateTime<Utc>,
    lookahead: Duration,
    expiration_threshold: Duration,
) -> Option<Duration> {
    if !auto_generate {
        return None;
    }

    let remaining = not_after - now;
    let before = |window: Duration| {
        let window = TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX);
        remaining.checked_sub(&window).and_then(|d| d.to_std().ok())
    };

    let wait = before(lookahead)
        .filter(|d| !d.is_zero())
        .or_else(|| before(expiration_threshold))
        .unwrap_or(MIN_REQUEUE);

    Some(wait.max(MIN_REQUEUE))
}
