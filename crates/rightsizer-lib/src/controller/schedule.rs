//! When a policy is due for analysis and when to look at it again

use crate::crd::{Phase, RightSizingPolicyStatus};
use crate::duration::parse_duration;
use chrono::{DateTime, Utc};
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(24 * 3600);

/// Metrics window used when `analysisWindow` does not parse
pub const DEFAULT_METRICS_WINDOW: Duration = Duration::from_secs(7 * 24 * 3600);

/// Minimum time between two analyses. Windows under a day are re-analysed
/// hourly, longer windows 24 times per window.
pub fn analysis_interval(window: &str) -> Duration {
    match parse_duration(window) {
        Ok(w) if w < DAY => HOUR,
        Ok(w) => w / 24,
        Err(_) => DAY,
    }
}

/// Requeue delay after a completed pass
pub fn requeue_interval(window: &str) -> Duration {
    match parse_duration(window) {
        Ok(w) if w >= DAY => DAY,
        _ => HOUR,
    }
}

/// History span requested from the metrics backend
pub fn metrics_window(window: &str) -> Duration {
    parse_duration(window)
        .ok()
        .filter(|w| !w.is_zero())
        .unwrap_or(DEFAULT_METRICS_WINDOW)
}

/// `None` when analysis should run now, otherwise the time left until it is due.
///
/// A policy is due when it was never analysed, when its last pass failed,
/// when its spec changed since the last pass, or when the analysis interval
/// has elapsed.
pub fn due_in(
    status: Option<&RightSizingPolicyStatus>,
    generation: Option<i64>,
    window: &str,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let status = status?;
    let last = status.last_analysis_time.as_ref()?;
    if status.phase == Phase::Error {
        return None;
    }
    if let Some(observed) = status
        .ready_condition()
        .and_then(|c| c.observed_generation)
    {
        if generation.is_some() && generation != Some(observed) {
            return None;
        }
    }

    let elapsed = (now - last.0).to_std().unwrap_or(Duration::ZERO);
    analysis_interval(window).checked_sub(elapsed).filter(|d| !d.is_zero())
}
