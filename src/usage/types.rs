//! Data types shared across the usage tracking core.
//!
//! `ResetTimestamp` stores reset instants as Unix epoch seconds and carries
//! the minute normalization that makes jittered fetches of the same reset
//! land on one scheduling key. `UsageState` is the per-account display state
//! owned by the tracker actor; `UsageBoard` is the sorted snapshot published
//! to consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Trailing window of usage samples kept per account, in minutes.
const SAMPLE_HISTORY_MINUTES: i64 = 5;

/// Stable account identity (the provider-side organization id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Shortened form for display when no display name is configured.
    pub fn short(&self) -> String {
        self.0.chars().take(8).collect()
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An absolute reset instant stored as Unix epoch seconds.
///
/// Epoch seconds keep serialization timezone-independent and make the
/// minute-normalized value directly usable as a scheduling key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResetTimestamp {
    /// Unix timestamp in seconds
    pub epoch_seconds: i64,
}

impl ResetTimestamp {
    pub fn from_epoch_seconds(seconds: i64) -> Self {
        Self {
            epoch_seconds: seconds,
        }
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self {
            epoch_seconds: at.timestamp(),
        }
    }

    /// Rounds to the nearest minute boundary (30s and above round up).
    ///
    /// Fetches observe the same upstream reset with a few seconds of jitter;
    /// normalized values collapse them onto one notification group.
    pub fn normalized_to_minute(self) -> Self {
        Self {
            epoch_seconds: (self.epoch_seconds + 30).div_euclid(60) * 60,
        }
    }

    /// Returns the duration from now until this timestamp, or None if already past.
    pub fn duration_from_now(&self) -> Option<Duration> {
        self.duration_from(Utc::now())
    }

    /// Returns the duration from `now` until this timestamp, or None if already past.
    pub fn duration_from(&self, now: DateTime<Utc>) -> Option<Duration> {
        let diff = self.epoch_seconds - now.timestamp();
        if diff > 0 {
            Some(Duration::from_secs(diff as u64))
        } else {
            None
        }
    }
}

/// A single observed utilization reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    pub at: DateTime<Utc>,
    pub percent: u8,
}

/// Outcome of the most recent fetch attempt for an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchStatus {
    /// Registered but no fetch has completed yet.
    Loading,
    Success,
    Error(String),
}

/// Derived display state for one tracked account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageState {
    pub account_id: AccountId,
    /// Latest observed utilization. Upstream rounding can push this past 100;
    /// anything >= 100 is treated as at-limit.
    pub percent: u8,
    /// Projection after the prediction look-ahead, capped at 100.
    pub predicted_percent: Option<u8>,
    /// Session window reset instant, minute-normalized at ingestion.
    pub reset_at: Option<ResetTimestamp>,
    /// Remaining fraction of the reset window: 100 = just began, 0 = imminent.
    pub reset_progress_percent: Option<u8>,
    /// Projected time until utilization reaches 100.
    pub time_to_full: Option<Duration>,
    /// Secondary seven-day window, carried for display only.
    pub weekly_percent: Option<u8>,
    pub weekly_reset_at: Option<ResetTimestamp>,
    pub status: FetchStatus,
    /// Recent samples, bounded to the trailing history window.
    pub history: Vec<UsageSample>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl UsageState {
    pub fn new(account_id: AccountId) -> Self {
        Self {
            account_id,
            percent: 0,
            predicted_percent: None,
            reset_at: None,
            reset_progress_percent: None,
            time_to_full: None,
            weekly_percent: None,
            weekly_reset_at: None,
            status: FetchStatus::Loading,
            history: Vec::new(),
            fetched_at: None,
        }
    }

    /// Appends a sample and prunes everything older than the history window,
    /// measured against the newest sample's timestamp.
    pub fn push_sample(&mut self, at: DateTime<Utc>, percent: u8) {
        self.history.push(UsageSample { at, percent });
        let cutoff = at - chrono::Duration::minutes(SAMPLE_HISTORY_MINUTES);
        self.history.retain(|sample| sample.at >= cutoff);
    }

    pub fn is_at_limit(&self) -> bool {
        self.percent >= 100
    }
}

/// One row of the published snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardEntry {
    /// Display name when configured, shortened account id otherwise.
    pub label: String,
    pub state: UsageState,
}

/// Display-sorted snapshot of every tracked account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageBoard {
    pub entries: Vec<BoardEntry>,
    pub updated_at: DateTime<Utc>,
    pub paused: bool,
}

impl Default for UsageBoard {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            updated_at: Utc::now(),
            paused: false,
        }
    }
}

/// Formats a duration as "Xd Yh Zm" countdown string with consistent padding.
///
/// - Days are shown only if >= 1 day
/// - Minutes are zero-padded whenever hours are shown
/// - Seconds are never shown
/// - Returns "0m" for zero or missing durations
///
/// Examples: "4h 05m", "2d 3h", "1d 0h 30m", "45m"
pub fn format_countdown(duration: Option<Duration>) -> String {
    let Some(d) = duration else {
        return "0m".to_string();
    };

    let total_secs = d.as_secs();
    if total_secs == 0 {
        return "0m".to_string();
    }

    let days = total_secs / 86400;
    let hours = (total_secs % 86400) / 3600;
    let minutes = (total_secs % 3600) / 60;

    if days > 0 {
        if minutes > 0 {
            format!("{}d {}h {:02}m", days, hours, minutes)
        } else if hours > 0 {
            format!("{}d {}h", days, hours)
        } else {
            format!("{}d", days)
        }
    } else if hours > 0 {
        format!("{}h {:02}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}
