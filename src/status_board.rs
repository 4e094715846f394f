//! Plain-text rendering of the usage board.
//!
//! Produces the aligned table shown by `watch` and `fetch`. Column widths
//! follow the widest cell, measured in display width so wide display names
//! keep the table straight.

use crate::usage::types::{format_countdown, BoardEntry, FetchStatus, UsageBoard};
use chrono::{DateTime, Utc};
use unicode_width::UnicodeWidthStr;

const HEADER: [&str; 9] = [
    "ACCOUNT",
    "USED",
    "PRED",
    "FULL IN",
    "RESETS IN",
    "WINDOW",
    "WEEKLY",
    "AGE",
    "STATUS",
];

const ERROR_PREVIEW_CHARS: usize = 40;

/// Header plus one aligned row per entry.
pub fn render_table(board: &UsageBoard, now: DateTime<Utc>) -> Vec<String> {
    let rows: Vec<Vec<String>> = board.entries.iter().map(|e| entry_cells(e, now)).collect();

    let mut widths: Vec<usize> = HEADER.iter().map(|h| UnicodeWidthStr::width(*h)).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(UnicodeWidthStr::width(cell.as_str()));
        }
    }

    let header: Vec<String> = HEADER.iter().map(|h| (*h).to_string()).collect();
    let mut lines = vec![format_row(&header, &widths)];
    for row in &rows {
        lines.push(format_row(row, &widths));
    }
    lines
}

/// Full screen for `watch`: title, table, and key hints.
pub fn render_screen(board: &UsageBoard, now: DateTime<Utc>) -> Vec<String> {
    let mut lines = Vec::new();

    let mut title = format!("quota-watch  {}", board.updated_at.format("%H:%M:%S"));
    if board.paused {
        title.push_str("  [paused]");
    }
    lines.push(title);
    lines.push(String::new());

    if board.entries.is_empty() {
        lines.push("No accounts tracked. Add one with `quota-watch accounts add`.".to_string());
    } else {
        lines.extend(render_table(board, now));
    }

    lines.push(String::new());
    lines.push("[q] quit  [p] pause/resume  [r] refresh now".to_string());
    lines
}

fn entry_cells(entry: &BoardEntry, now: DateTime<Utc>) -> Vec<String> {
    let state = &entry.state;

    let used = if state.fetched_at.is_some() {
        format!("{}%", state.percent)
    } else {
        "-".to_string()
    };

    vec![
        entry.label.clone(),
        used,
        opt_percent(state.predicted_percent),
        opt_countdown(state.time_to_full),
        opt_countdown(state.reset_at.and_then(|t| t.duration_from(now))),
        opt_percent(state.reset_progress_percent),
        opt_percent(state.weekly_percent),
        format_age(state.fetched_at, now),
        status_cell(&state.status),
    ]
}

fn opt_percent(value: Option<u8>) -> String {
    value
        .map(|p| format!("{}%", p))
        .unwrap_or_else(|| "-".to_string())
}

fn opt_countdown(duration: Option<std::time::Duration>) -> String {
    match duration {
        Some(d) => format_countdown(Some(d)),
        None => "-".to_string(),
    }
}

fn format_age(fetched_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(at) = fetched_at else {
        return "-".to_string();
    };
    let secs = (now - at).num_seconds().max(0);
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{}h", secs / 3600)
    }
}

fn status_cell(status: &FetchStatus) -> String {
    match status {
        FetchStatus::Loading => "loading".to_string(),
        FetchStatus::Success => "ok".to_string(),
        FetchStatus::Error(message) => {
            let mut preview: String = message.chars().take(ERROR_PREVIEW_CHARS).collect();
            if message.chars().count() > ERROR_PREVIEW_CHARS {
                preview.push_str("...");
            }
            preview
        }
    }
}

/// First column left-aligned and the last ragged; numeric columns right-aligned.
fn format_row(cells: &[String], widths: &[usize]) -> String {
    let last = cells.len() - 1;
    let mut parts = Vec::with_capacity(cells.len());
    for (i, cell) in cells.iter().enumerate() {
        if i == 0 {
            parts.push(pad_right(cell, widths[i]));
        } else if i == last {
            parts.push(cell.clone());
        } else {
            parts.push(pad_left(cell, widths[i]));
        }
    }
    parts.join("  ").trim_end().to_string()
}

fn pad_right(text: &str, width: usize) -> String {
    let fill = width.saturating_sub(UnicodeWidthStr::width(text));
    format!("{}{}", text, " ".repeat(fill))
}

fn pad_left(text: &str, width: usize) -> String {
    let fill = width.saturating_sub(UnicodeWidthStr::width(text));
    format!("{}{}", " ".repeat(fill), text)
}
