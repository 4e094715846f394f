//! Usage tracking core: per-account state, predictions, reset reminders.
//!
//! The tracker actor ([`tracker::UsageTracker`]) owns all mutable state and
//! serializes every update through its mailbox. Around it sit pure helpers:
//! the prediction engine ([`velocity`]), the debounce batcher ([`debounce`]),
//! and the reset-reminder scheduler ([`scheduler`]). Network access goes
//! through the [`fetch::UsageFetcher`] trait so tests can substitute fakes.

pub mod debounce;
pub mod fetch;
pub mod scheduler;
pub mod tracker;
pub mod types;
pub mod velocity;
