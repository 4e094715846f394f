//! The usage tracker actor.
//!
//! Single owner of all tracking state: the account set, the per-account usage
//! table, the reset-reminder scheduler, and the debounce batcher. Every
//! mutation enters through the mailbox, so fetch completions apply serially
//! no matter how many fetches are in flight. Fetches themselves run on
//! spawned tasks and re-enter as [`TrackerMessage::FetchDone`]; timers are
//! spawned tasks casting back in the same way.

use super::debounce::ChangeBatcher;
use super::fetch::{FetchError, UsageFetcher, UsageReport};
use super::scheduler::{AlertService, ResetNotificationScheduler};
use super::types::{AccountId, BoardEntry, FetchStatus, UsageBoard, UsageState};
use super::velocity;
use crate::accounts::Account;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

/// Baseline polling cadence.
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// How long an open change cycle waits for stragglers before flushing.
pub const DEBOUNCE_TIMEOUT: Duration = Duration::from_secs(5);

/// At-limit accounts within this distance of their reset fetch normally, so
/// the post-reset drop is observed promptly.
const SKIP_MIN_REMAINING: Duration = Duration::from_secs(1);

/// Messages handled by the tracker actor.
pub enum TrackerMessage {
    /// Track an account and fetch it immediately.
    Register(Account),
    /// Stop tracking an account. Unknown ids are ignored.
    Unregister(AccountId),
    /// Poll every tracked account as one debounced cycle.
    PollAll,
    /// Poll a single account outside any cycle.
    PollOne(AccountId),
    /// Halt the schedule and all network activity.
    Pause,
    /// Restart the schedule and poll immediately.
    Resume,
    /// Current snapshot.
    GetBoard(oneshot::Sender<UsageBoard>),
    /// A fetch task finished.
    FetchDone(AccountId, Result<UsageReport, FetchError>),
    /// The debounce deadline for the cycle with this generation fired.
    DebounceExpired(u64),
}

/// Tunables for the tracker, fixed at spawn.
#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    /// Cadence of the non-aligned schedule.
    pub poll_interval: Duration,
    pub debounce_timeout: Duration,
    /// Fire polls at :01/:31 past the minute instead of a free-running
    /// interval, landing just after minute-aligned resets.
    pub align_to_clock: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            debounce_timeout: DEBOUNCE_TIMEOUT,
            align_to_clock: true,
        }
    }
}

/// Arguments for spawning a tracker actor.
#[derive(Clone)]
pub struct TrackerArgs {
    pub fetcher: Arc<dyn UsageFetcher>,
    pub alert_service: Arc<dyn AlertService>,
    pub config: TrackerConfig,
    /// Watch channel sender for board snapshots.
    pub board_tx: watch::Sender<UsageBoard>,
    /// Broadcast channel sender for debounced change events.
    pub event_tx: broadcast::Sender<UsageBoard>,
}

/// State maintained by the tracker actor.
pub struct TrackerState {
    fetcher: Arc<dyn UsageFetcher>,
    config: TrackerConfig,
    accounts: HashMap<AccountId, Account>,
    table: HashMap<AccountId, UsageState>,
    scheduler: ResetNotificationScheduler,
    batcher: ChangeBatcher,
    paused: bool,
    board_tx: watch::Sender<UsageBoard>,
    event_tx: broadcast::Sender<UsageBoard>,
    poll_task: Option<JoinHandle<()>>,
}

/// The tracker actor.
pub struct UsageTracker;

#[async_trait]
impl Actor for UsageTracker {
    type Msg = TrackerMessage;
    type State = TrackerState;
    type Arguments = TrackerArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(TrackerState {
            fetcher: args.fetcher,
            config: args.config,
            accounts: HashMap::new(),
            table: HashMap::new(),
            scheduler: ResetNotificationScheduler::new(args.alert_service),
            batcher: ChangeBatcher::new(),
            paused: false,
            board_tx: args.board_tx,
            event_tx: args.event_tx,
            poll_task: None,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            TrackerMessage::Register(account) => {
                let id = account.id.clone();
                state.accounts.insert(id.clone(), account);
                state
                    .table
                    .entry(id.clone())
                    .or_insert_with(|| UsageState::new(id.clone()));
                ensure_poll_schedule(&myself, state);
                publish(state, true);
                if !state.paused {
                    spawn_fetch(&myself, state, &id);
                }
            }
            TrackerMessage::Unregister(id) => {
                let existed = state.table.remove(&id).is_some();
                state.accounts.remove(&id);
                if existed {
                    state.scheduler.remove_account(&id);
                    let flushed = state.batcher.remove(&id);
                    publish(state, flushed || !state.batcher.is_active());
                    if state.accounts.is_empty() {
                        stop_poll_schedule(state);
                    }
                }
            }
            TrackerMessage::PollAll => {
                handle_poll_all(&myself, state);
            }
            TrackerMessage::PollOne(id) => {
                if !state.paused && state.accounts.contains_key(&id) {
                    poll_account(&myself, state, &id, Utc::now());
                }
            }
            TrackerMessage::Pause => {
                state.paused = true;
                stop_poll_schedule(state);
                publish(state, true);
            }
            TrackerMessage::Resume => {
                state.paused = false;
                ensure_poll_schedule(&myself, state);
                publish(state, true);
                handle_poll_all(&myself, state);
            }
            TrackerMessage::GetBoard(reply) => {
                if reply.send(build_board(state)).is_err() {
                    tracing::debug!("Board reply channel closed");
                }
            }
            TrackerMessage::FetchDone(id, result) => {
                apply_fetch_result(state, &id, result);
            }
            TrackerMessage::DebounceExpired(generation) => {
                if state.batcher.expire(generation) {
                    publish(state, true);
                }
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        stop_poll_schedule(state);
        Ok(())
    }
}

/// Runs one poll cycle: capture the tracked set, arm the deadline, and decide
/// fetch versus local-only refresh per account.
fn handle_poll_all(myself: &ActorRef<TrackerMessage>, state: &mut TrackerState) {
    if state.paused || state.accounts.is_empty() {
        return;
    }

    let now = Utc::now();
    let ids: Vec<AccountId> = state.table.keys().cloned().collect();

    if let Some(generation) = state.batcher.begin(ids.clone()) {
        arm_debounce_deadline(myself, state.config.debounce_timeout, generation);
    }

    for id in &ids {
        poll_account(myself, state, id, now);
    }
}

fn poll_account(
    myself: &ActorRef<TrackerMessage>,
    state: &mut TrackerState,
    id: &AccountId,
    now: DateTime<Utc>,
) {
    let Some(entry) = state.table.get_mut(id) else {
        return;
    };

    if should_skip_fetch(entry, now) {
        // At limit with the reset still ahead: the number cannot move, only
        // the countdown does. Refresh locally and count the slot complete.
        refresh_derived(entry, now);
        complete_action(state, id);
    } else {
        spawn_fetch(myself, state, id);
    }
}

/// The at-limit skip heuristic. Pause is enforced upstream; this only looks
/// at the account itself.
fn should_skip_fetch(entry: &UsageState, now: DateTime<Utc>) -> bool {
    let Some(remaining) = entry.reset_at.and_then(|t| t.duration_from(now)) else {
        return false;
    };
    remaining > SKIP_MIN_REMAINING && entry.is_at_limit()
}

/// Issues the fetch on a spawned task; the result re-enters the mailbox.
fn spawn_fetch(myself: &ActorRef<TrackerMessage>, state: &TrackerState, id: &AccountId) {
    let Some(account) = state.accounts.get(id).cloned() else {
        return;
    };
    let fetcher = Arc::clone(&state.fetcher);
    let myself = myself.clone();

    tokio::spawn(async move {
        let result = fetcher.fetch(&account).await;
        let _ = myself.send_message(TrackerMessage::FetchDone(account.id, result));
    });
}

fn arm_debounce_deadline(myself: &ActorRef<TrackerMessage>, timeout: Duration, generation: u64) {
    let myself = myself.clone();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        // Stale generations are ignored on arrival; a stopped actor drops it.
        let _ = myself.send_message(TrackerMessage::DebounceExpired(generation));
    });
}

/// Applies a fetch outcome to the table, keeps reminders in sync, and settles
/// the account's slot in any open cycle.
fn apply_fetch_result(
    state: &mut TrackerState,
    id: &AccountId,
    result: Result<UsageReport, FetchError>,
) {
    let now = Utc::now();
    let Some(entry) = state.table.get_mut(id) else {
        tracing::debug!("Fetch completed for unregistered account {}", id);
        return;
    };

    match result {
        Ok(report) => {
            entry.status = FetchStatus::Success;
            entry.fetched_at = Some(now);
            entry.percent = report.session.percent;
            entry.push_sample(now, report.session.percent);
            entry.reset_at = report.session.resets_at.map(|t| t.normalized_to_minute());
            entry.weekly_percent = report.weekly.map(|w| w.percent);
            entry.weekly_reset_at = report
                .weekly
                .and_then(|w| w.resets_at)
                .map(|t| t.normalized_to_minute());
            refresh_derived(entry, now);

            let reset_at = entry.reset_at;
            match reset_at {
                Some(t) => {
                    let display_name = state
                        .accounts
                        .get(id)
                        .and_then(|a| a.display_name.clone());
                    state
                        .scheduler
                        .schedule_or_update(id, display_name.as_deref(), t);
                }
                // A report without a reset instant cannot keep a reminder
                // honest; drop any pending one.
                None => state.scheduler.remove_account(id),
            }
        }
        Err(e) => {
            tracing::warn!("Usage fetch failed for {}: {}", id, e);
            entry.status = FetchStatus::Error(e.to_string());
            refresh_derived(entry, now);
        }
    }

    complete_action(state, id);
}

/// Recomputes every wall-clock-derived field from the current history.
fn refresh_derived(entry: &mut UsageState, now: DateTime<Utc>) {
    let vel = velocity::velocity(&entry.history);
    entry.predicted_percent = vel.and_then(|v| {
        velocity::predicted_percent(entry.percent, v, velocity::PREDICTION_LOOKAHEAD)
    });
    entry.time_to_full = vel.and_then(|v| velocity::time_to_full(entry.percent, v));
    entry.reset_progress_percent = entry.reset_at.map(|t| velocity::reset_progress(t, now));
}

/// Settles a completed fetch or refresh: inside a cycle it marks the slot and
/// flushes when the cycle closes; outside one it signals immediately.
fn complete_action(state: &mut TrackerState, id: &AccountId) {
    let flush = if state.batcher.is_active() {
        state.batcher.mark_complete(id)
    } else {
        true
    };
    publish(state, flush);
}

fn build_board(state: &TrackerState) -> UsageBoard {
    let mut entries: Vec<BoardEntry> = state
        .table
        .values()
        .map(|usage| BoardEntry {
            label: state
                .accounts
                .get(&usage.account_id)
                .map(Account::label)
                .unwrap_or_else(|| usage.account_id.short()),
            state: usage.clone(),
        })
        .collect();
    entries.sort_by(|a, b| {
        a.label
            .cmp(&b.label)
            .then_with(|| a.state.account_id.cmp(&b.state.account_id))
    });

    UsageBoard {
        entries,
        updated_at: Utc::now(),
        paused: state.paused,
    }
}

/// Publishes the current board on the watch channel, and as a change event
/// when `notify` is set. The snapshot lands first so an event wake always
/// observes it.
fn publish(state: &mut TrackerState, notify: bool) {
    let board = build_board(state);
    let _ = state.board_tx.send(board.clone());
    if notify {
        let _ = state.event_tx.send(board);
    }
}

fn ensure_poll_schedule(myself: &ActorRef<TrackerMessage>, state: &mut TrackerState) {
    if state.poll_task.is_some() || state.paused || state.accounts.is_empty() {
        return;
    }

    let config = state.config;
    let myself = myself.clone();
    let handle = tokio::spawn(async move {
        if config.align_to_clock {
            loop {
                tokio::time::sleep(delay_to_aligned_tick(Utc::now())).await;
                if myself.send_message(TrackerMessage::PollAll).is_err() {
                    break;
                }
            }
        } else {
            let mut interval = tokio::time::interval(config.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick is immediate; registration already fetched.
            interval.tick().await;
            loop {
                interval.tick().await;
                if myself.send_message(TrackerMessage::PollAll).is_err() {
                    break;
                }
            }
        }
    });
    state.poll_task = Some(handle);
}

fn stop_poll_schedule(state: &mut TrackerState) {
    if let Some(handle) = state.poll_task.take() {
        handle.abort();
    }
}

/// Time until the next :01 or :31 tick, one second past the minute-aligned
/// reset moments.
fn delay_to_aligned_tick(now: DateTime<Utc>) -> Duration {
    let within = f64::from(now.second()) + f64::from(now.nanosecond()) / 1e9;
    let target = if within < 1.0 {
        1.0
    } else if within < 31.0 {
        31.0
    } else {
        61.0
    };
    Duration::from_secs_f64((target - within).max(0.0))
}

/// Cloneable handle over the tracker's mailbox.
#[derive(Clone)]
pub struct TrackerHandle {
    actor: ActorRef<TrackerMessage>,
}

impl TrackerHandle {
    pub fn register(&self, account: Account) -> Result<()> {
        self.send(TrackerMessage::Register(account))
    }

    pub fn unregister(&self, id: AccountId) -> Result<()> {
        self.send(TrackerMessage::Unregister(id))
    }

    pub fn poll_all(&self) -> Result<()> {
        self.send(TrackerMessage::PollAll)
    }

    pub fn poll_one(&self, id: AccountId) -> Result<()> {
        self.send(TrackerMessage::PollOne(id))
    }

    pub fn pause(&self) -> Result<()> {
        self.send(TrackerMessage::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.send(TrackerMessage::Resume)
    }

    pub async fn board(&self) -> Result<UsageBoard> {
        let (tx, rx) = oneshot::channel();
        self.send(TrackerMessage::GetBoard(tx))?;
        rx.await.context("Usage tracker dropped the board request")
    }

    pub fn stop(&self) {
        self.actor.stop(None);
    }

    fn send(&self, message: TrackerMessage) -> Result<()> {
        self.actor
            .send_message(message)
            .map_err(|_| anyhow!("usage tracker is not running"))
    }
}

/// Creates tracker arguments plus the snapshot and event receivers.
pub fn create_tracker_args(
    fetcher: Arc<dyn UsageFetcher>,
    alert_service: Arc<dyn AlertService>,
    config: TrackerConfig,
) -> (
    TrackerArgs,
    watch::Receiver<UsageBoard>,
    broadcast::Receiver<UsageBoard>,
) {
    let (board_tx, board_rx) = watch::channel(UsageBoard::default());
    let (event_tx, event_rx) = broadcast::channel(64);

    let args = TrackerArgs {
        fetcher,
        alert_service,
        config,
        board_tx,
        event_tx,
    };

    (args, board_rx, event_rx)
}

/// Spawns the tracker actor.
pub async fn spawn_tracker(args: TrackerArgs) -> Result<(TrackerHandle, JoinHandle<()>)> {
    let (actor, join) = UsageTracker::spawn(None, UsageTracker, args)
        .await
        .context("Failed to spawn usage tracker")?;
    Ok((TrackerHandle { actor }, join))
}

#[cfg(test)]
#[path = "tests/tracker_tests.rs"]
mod tests;
