//! Velocity and prediction engine.
//!
//! Pure functions over the bounded sample history. Time is always passed in
//! explicitly so callers and tests control the clock; nothing here reads
//! `Utc::now()`.

use super::types::{ResetTimestamp, UsageSample};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Look-ahead horizon for the projected utilization figure.
pub const PREDICTION_LOOKAHEAD: Duration = Duration::from_secs(15 * 60);

/// Length of the session usage window.
pub const RESET_WINDOW: Duration = Duration::from_secs(5 * 60 * 60);

/// Projections beyond this are noise from a near-zero velocity; drop them.
const TIME_TO_FULL_CEILING: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Usage velocity in percent per second over the sample history.
///
/// Requires at least two samples spanning a positive duration, and a strictly
/// increasing percent. Flat or decreasing usage yields None; there is nothing
/// meaningful to project from it.
pub fn velocity(history: &[UsageSample]) -> Option<f64> {
    let first = history.first()?;
    let last = history.last()?;

    let elapsed_ms = last.at.signed_duration_since(first.at).num_milliseconds();
    if elapsed_ms <= 0 {
        return None;
    }

    let delta = last.percent as f64 - first.percent as f64;
    if delta <= 0.0 {
        return None;
    }

    Some(delta / (elapsed_ms as f64 / 1000.0))
}

/// Utilization projected `lookahead` from now, capped at 100.
///
/// None once the account is already at limit; the projection is only shown
/// while there is headroom left.
pub fn predicted_percent(percent: u8, velocity: f64, lookahead: Duration) -> Option<u8> {
    if percent >= 100 {
        return None;
    }

    let projected = percent as f64 + velocity * lookahead.as_secs_f64();
    Some(projected.min(100.0) as u8)
}

/// Projected time until utilization reaches 100 at the current velocity.
///
/// None when already at limit, when velocity is non-positive, or when the
/// projection lands beyond the sanity ceiling.
pub fn time_to_full(percent: u8, velocity: f64) -> Option<Duration> {
    if percent >= 100 || velocity <= 0.0 {
        return None;
    }

    let secs = (100.0 - percent as f64) / velocity;
    if secs <= 0.0 || secs > TIME_TO_FULL_CEILING.as_secs_f64() {
        return None;
    }

    Some(Duration::from_secs_f64(secs))
}

/// Remaining fraction of the reset window as a percentage.
///
/// 100 means the window just began, 0 means the reset is imminent or has
/// already happened. Decays with wall clock alone, so it is recomputed on
/// every poll tick whether or not a fetch ran.
pub fn reset_progress(reset_at: ResetTimestamp, now: DateTime<Utc>) -> u8 {
    let remaining = reset_at.epoch_seconds - now.timestamp();
    if remaining <= 0 {
        return 0;
    }

    let ratio = remaining as f64 / RESET_WINDOW.as_secs_f64();
    (ratio * 100.0).clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn sample(at_secs: i64, percent: u8) -> UsageSample {
        UsageSample {
            at: Utc.timestamp_opt(at_secs, 0).unwrap(),
            percent,
        }
    }

    #[test]
    fn test_velocity_needs_two_samples() {
        assert_eq!(velocity(&[]), None);
        assert_eq!(velocity(&[sample(0, 50)]), None);
    }

    #[test]
    fn test_velocity_increasing() {
        // 10 percent over 100 seconds
        let history = [sample(1_000, 40), sample(1_100, 50)];
        let v = velocity(&history).unwrap();
        assert!((v - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_velocity_uses_endpoints() {
        // Intermediate dips do not matter, only first and last
        let history = [sample(0, 40), sample(50, 10), sample(100, 60)];
        let v = velocity(&history).unwrap();
        assert!((v - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_velocity_rejects_flat_and_decreasing() {
        assert_eq!(velocity(&[sample(0, 50), sample(100, 50)]), None);
        assert_eq!(velocity(&[sample(0, 50), sample(100, 40)]), None);
    }

    #[test]
    fn test_velocity_rejects_zero_duration() {
        assert_eq!(velocity(&[sample(100, 40), sample(100, 50)]), None);
    }

    #[test]
    fn test_predicted_percent_projects_forward() {
        // 0.1 pct/sec over 15 minutes = +90
        let p = predicted_percent(5, 0.1, PREDICTION_LOOKAHEAD).unwrap();
        assert_eq!(p, 95);
    }

    #[test]
    fn test_predicted_percent_caps_at_100() {
        let p = predicted_percent(50, 1.0, PREDICTION_LOOKAHEAD).unwrap();
        assert_eq!(p, 100);
    }

    #[test]
    fn test_predicted_percent_none_at_limit() {
        assert_eq!(predicted_percent(100, 0.5, PREDICTION_LOOKAHEAD), None);
        assert_eq!(predicted_percent(103, 0.5, PREDICTION_LOOKAHEAD), None);
    }

    #[test]
    fn test_time_to_full_basic() {
        // 50 percent left at 0.5 pct/sec -> 100 seconds
        let t = time_to_full(50, 0.5).unwrap();
        assert_eq!(t.as_secs(), 100);
    }

    #[test]
    fn test_time_to_full_rejects_at_limit_and_non_positive_velocity() {
        assert_eq!(time_to_full(100, 0.5), None);
        assert_eq!(time_to_full(50, 0.0), None);
        assert_eq!(time_to_full(50, -0.1), None);
    }

    #[test]
    fn test_time_to_full_rejects_absurd_projection() {
        // 50 percent left at a hair above zero velocity -> years out
        assert_eq!(time_to_full(50, 1e-9), None);
    }

    #[test]
    fn test_reset_progress_full_window() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let reset = ResetTimestamp::from_epoch_seconds(
            1_700_000_000 + RESET_WINDOW.as_secs() as i64,
        );
        assert_eq!(reset_progress(reset, now), 100);
    }

    #[test]
    fn test_reset_progress_past_is_zero() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let reset = ResetTimestamp::from_epoch_seconds(1_699_999_999);
        assert_eq!(reset_progress(reset, now), 0);
        let exactly_now = ResetTimestamp::from_epoch_seconds(1_700_000_000);
        assert_eq!(reset_progress(exactly_now, now), 0);
    }

    #[test]
    fn test_reset_progress_midway() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let reset = ResetTimestamp::from_epoch_seconds(
            1_700_000_000 + (RESET_WINDOW.as_secs() / 2) as i64,
        );
        assert_eq!(reset_progress(reset, now), 50);
    }

    #[test]
    fn test_reset_progress_clamps_beyond_window() {
        // Reset further out than one window still reads 100
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let reset = ResetTimestamp::from_epoch_seconds(
            1_700_000_000 + 2 * RESET_WINDOW.as_secs() as i64,
        );
        assert_eq!(reset_progress(reset, now), 100);
    }

    proptest! {
        #[test]
        fn prop_predicted_percent_never_exceeds_cap(
            percent in 0u8..100,
            velocity in 0.0f64..10.0,
        ) {
            if let Some(p) = predicted_percent(percent, velocity, PREDICTION_LOOKAHEAD) {
                prop_assert!(p <= 100);
                prop_assert!(p >= percent);
            }
        }

        #[test]
        fn prop_reset_progress_bounded(offset in -86_400i64..86_400) {
            let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
            let reset = ResetTimestamp::from_epoch_seconds(1_700_000_000 + offset);
            let progress = reset_progress(reset, now);
            prop_assert!(progress <= 100);
        }

        #[test]
        fn prop_non_increasing_history_never_projects(
            start in 0u8..=100,
            drop in 0u8..=100,
        ) {
            let end = start.saturating_sub(drop);
            let history = [sample(0, start), sample(300, end)];
            prop_assert_eq!(velocity(&history), None);
        }
    }
}
