mod accounts;
mod config;
mod notify;
mod paths;
mod status_board;
mod usage;

use accounts::{hint_from_token, Account, AccountStore};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use config::AppConfig;
use crossterm::cursor;
use crossterm::event::{Event as TermEvent, EventStream, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::style::Print;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, Clear, ClearType, EnterAlternateScreen,
    LeaveAlternateScreen,
};
use fs2::FileExt;
use futures::StreamExt;
use notify::{AlertFired, DesktopAlertService, NoopAlertService};
use std::fs::File;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use usage::fetch::{HttpUsageFetcher, UsageFetcher};
use usage::scheduler::AlertService;
use usage::tracker::{create_tracker_args, spawn_tracker, TrackerHandle};
use usage::types::{AccountId, BoardEntry, FetchStatus, UsageBoard, UsageState};
use usage::velocity;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("QUOTA_WATCH_GIT_SHA"),
    ")"
);

#[derive(Parser)]
#[command(name = "quota-watch")]
#[command(about = "Track Claude usage limits across accounts")]
#[command(version = VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch usage for all accounts in a live terminal view (default)
    Watch,
    /// Fetch usage once for all accounts and print it
    Fetch {
        /// Print machine-readable JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Manage tracked accounts
    Accounts {
        #[command(subcommand)]
        command: AccountCommands,
    },
}

#[derive(Subcommand)]
enum AccountCommands {
    /// Add an account, or update the one with the same id
    Add {
        /// OAuth access token for the account
        token: String,
        /// Account id; derived from the token when omitted
        #[arg(long)]
        id: Option<String>,
        /// Display name shown on the board
        #[arg(long)]
        name: Option<String>,
    },
    /// Remove an account by id
    Remove { id: String },
    /// List configured accounts
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quota_watch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Watch) {
        Commands::Watch => run_watch().await,
        Commands::Fetch { json } => run_fetch(json).await,
        Commands::Accounts { command } => run_accounts(command),
    }
}

fn run_accounts(command: AccountCommands) -> Result<()> {
    let mut store = AccountStore::load()?;
    match command {
        AccountCommands::Add { token, id, name } => {
            let hint = hint_from_token(&token);
            let id = id
                .or_else(|| hint.as_ref().map(|h| h.id.clone()))
                .context("Could not derive an account id from the token; pass --id explicitly")?;
            let display_name = name.or_else(|| hint.and_then(|h| h.display_name));
            let account = Account {
                id: AccountId::new(&id),
                credential: token,
                display_name,
            };
            let label = account.label();
            let replaced = store.upsert(account);
            store.save()?;
            if replaced {
                println!("Updated account {}", label);
            } else {
                println!("Added account {}", label);
            }
        }
        AccountCommands::Remove { id } => {
            let id = AccountId::new(&id);
            if !store.remove(&id) {
                bail!("No account with id {}", id);
            }
            store.save()?;
            println!("Removed account {}", id);
        }
        AccountCommands::List => {
            if store.is_empty() {
                println!("No accounts configured.");
            } else {
                for account in store.accounts() {
                    match &account.display_name {
                        Some(name) => println!("{}  {}", account.id, name),
                        None => println!("{}", account.id),
                    }
                }
            }
        }
    }
    Ok(())
}

async fn run_fetch(json: bool) -> Result<()> {
    let config = AppConfig::load()?;
    let store = AccountStore::load()?;
    if store.is_empty() {
        bail!("No accounts configured. Add one with `quota-watch accounts add <token>`.");
    }

    let fetcher = HttpUsageFetcher::new(&config.api_base_url);
    let outcomes =
        futures::future::join_all(store.accounts().iter().map(|a| fetcher.fetch(a))).await;

    let now = Utc::now();
    let mut entries = Vec::new();
    let mut any_success = false;
    for (account, outcome) in store.accounts().iter().zip(outcomes) {
        let mut state = UsageState::new(account.id.clone());
        match outcome {
            Ok(report) => {
                any_success = true;
                state.status = FetchStatus::Success;
                state.fetched_at = Some(now);
                state.percent = report.session.percent;
                state.reset_at = report.session.resets_at.map(|t| t.normalized_to_minute());
                state.reset_progress_percent =
                    state.reset_at.map(|t| velocity::reset_progress(t, now));
                if let Some(weekly) = report.weekly {
                    state.weekly_percent = Some(weekly.percent);
                    state.weekly_reset_at = weekly.resets_at.map(|t| t.normalized_to_minute());
                }
            }
            Err(e) => {
                state.status = FetchStatus::Error(e.to_string());
            }
        }
        entries.push(BoardEntry {
            label: account.label(),
            state,
        });
    }
    entries.sort_by(|a, b| a.label.cmp(&b.label));

    if json {
        let rows: Vec<serde_json::Value> = entries
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "id": entry.state.account_id.to_string(),
                    "label": entry.label,
                    "percent": entry.state.fetched_at.map(|_| entry.state.percent),
                    "resets_at": entry.state.reset_at.map(|t| t.epoch_seconds),
                    "weekly_percent": entry.state.weekly_percent,
                    "error": match &entry.state.status {
                        FetchStatus::Error(message) => Some(message.clone()),
                        _ => None,
                    },
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        let board = UsageBoard {
            entries,
            updated_at: now,
            paused: false,
        };
        for line in status_board::render_table(&board, now) {
            println!("{}", line);
        }
    }

    if !any_success {
        bail!("All usage fetches failed");
    }
    Ok(())
}

async fn run_watch() -> Result<()> {
    let config = AppConfig::load()?;
    let store = AccountStore::load()?;
    if store.is_empty() {
        bail!("No accounts configured. Add one with `quota-watch accounts add <token>`.");
    }

    let _lock = acquire_watch_lock()?;

    let fetcher: Arc<dyn UsageFetcher> = Arc::new(HttpUsageFetcher::new(&config.api_base_url));
    // With notifications off, a parked sender keeps the alert channel from closing.
    let (alert_service, alert_rx, _parked_tx): (
        Arc<dyn AlertService>,
        mpsc::UnboundedReceiver<AlertFired>,
        Option<mpsc::UnboundedSender<AlertFired>>,
    ) = if config.notifications {
        let (service, rx) = DesktopAlertService::new();
        (service, rx, None)
    } else {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(NoopAlertService), rx, Some(tx))
    };

    let (args, board_rx, event_rx) =
        create_tracker_args(fetcher, alert_service, config.tracker_config());
    let (tracker, _tracker_task) = spawn_tracker(args).await?;
    for account in store.accounts() {
        tracker.register(account.clone())?;
    }

    enable_raw_mode().context("Failed to enable raw terminal mode")?;
    let mut stdout = std::io::stdout();
    crossterm::execute!(stdout, EnterAlternateScreen, cursor::Hide)
        .context("Failed to enter alternate screen")?;

    let result = watch_loop(&tracker, board_rx, event_rx, alert_rx).await;

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(stdout, cursor::Show, LeaveAlternateScreen);
    let _ = disable_raw_mode();
    tracker.stop();

    result
}

async fn watch_loop(
    tracker: &TrackerHandle,
    board_rx: watch::Receiver<UsageBoard>,
    mut event_rx: broadcast::Receiver<UsageBoard>,
    mut alert_rx: mpsc::UnboundedReceiver<AlertFired>,
) -> Result<()> {
    let mut term_events = EventStream::new();
    let mut redraw = tokio::time::interval(Duration::from_secs(1));
    let mut alert_closed = false;

    draw_board(&board_rx.borrow())?;

    loop {
        tokio::select! {
            event = term_events.next() => match event {
                Some(Ok(TermEvent::Key(key))) if key.kind == KeyEventKind::Press => {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                            return Ok(());
                        }
                        KeyCode::Char('r') => tracker.poll_all()?,
                        KeyCode::Char('p') => {
                            let paused = board_rx.borrow().paused;
                            if paused {
                                tracker.resume()?;
                            } else {
                                tracker.pause()?;
                            }
                        }
                        _ => {}
                    }
                }
                Some(Ok(TermEvent::Resize(_, _))) => draw_board(&board_rx.borrow())?,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("Terminal event stream failed"),
                None => return Ok(()),
            },
            event = event_rx.recv() => match event {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    draw_board(&board_rx.borrow())?;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    bail!("Usage tracker stopped unexpectedly");
                }
            },
            fired = alert_rx.recv(), if !alert_closed => match fired {
                Some(alert) => {
                    tracing::debug!("Reset alert fired: {}", alert.key);
                    tracker.poll_all()?;
                }
                None => alert_closed = true,
            },
            _ = redraw.tick() => draw_board(&board_rx.borrow())?,
        }
    }
}

fn draw_board(board: &UsageBoard) -> Result<()> {
    let mut stdout = std::io::stdout();
    crossterm::execute!(
        stdout,
        cursor::MoveTo(0, 0),
        Clear(ClearType::All),
        Print(status_board::render_screen(board, Utc::now()).join("\r\n")),
    )
    .context("Failed to draw the status board")?;
    Ok(())
}

fn acquire_watch_lock() -> Result<File> {
    let path = paths::watch_lock_path()?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .with_context(|| format!("Failed to open lock file at {}", path.display()))?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            bail!("Another quota-watch instance is already watching")
        }
        Err(e) => Err(e).with_context(|| format!("Failed to lock {}", path.display())),
    }
}
