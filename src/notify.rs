//! Desktop delivery of scheduled reset alerts.
//!
//! `DesktopAlertService` keeps one sleep-until-fire task per alert key.
//! Upserting an existing key replaces its task, cancel aborts it. When a
//! timer fires it shows an OS notification and emits an [`AlertFired`] event;
//! the watch shell routes that into a full poll so the board reflects the
//! reset promptly.

use crate::usage::scheduler::AlertService;
use crate::usage::types::ResetTimestamp;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Ensure macOS notification application is set (once per process).
static MACOS_APP_INIT: Once = Once::new();

/// Initialize notification system for the current platform.
/// On macOS, this sets the application name so notifications appear correctly.
fn ensure_notifications_initialized() {
    MACOS_APP_INIT.call_once(|| {
        #[cfg(target_os = "macos")]
        {
            // Borrow Terminal's identity; a plain CLI has no bundle of its own.
            if let Err(e) = notify_rust::set_application("com.apple.Terminal") {
                tracing::warn!("Failed to set notification application: {}", e);
            }
        }
    });
}

const ALERT_TIMEOUT_MS: u32 = 5000;

/// Emitted after an alert was delivered (or delivery was attempted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertFired {
    pub key: String,
}

/// Alert service backed by desktop notifications and tokio timers.
pub struct DesktopAlertService {
    timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    fired_tx: mpsc::UnboundedSender<AlertFired>,
}

impl DesktopAlertService {
    /// Creates the service and the receiver for delivery events.
    ///
    /// Must be called within a tokio runtime; timers are spawned tasks.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<AlertFired>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let service = Arc::new(Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            fired_tx,
        });
        (service, fired_rx)
    }
}

impl AlertService for DesktopAlertService {
    fn upsert(&self, key: &str, title: &str, body: &str, fire_at: ResetTimestamp) -> Result<()> {
        // A fire time already in the past fires right away.
        let delay = fire_at.duration_from_now().unwrap_or(Duration::ZERO);

        let timers = Arc::clone(&self.timers);
        let fired_tx = self.fired_tx.clone();
        let task_key = key.to_string();
        let title = title.to_string();
        let body = body.to_string();

        // Hold the lock across spawn + insert so a zero-delay timer cannot
        // observe the map before its own handle is registered.
        let mut pending = self.timers.lock().unwrap();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            timers.lock().unwrap().remove(&task_key);

            let shown =
                tokio::task::spawn_blocking(move || show_notification(&title, &body)).await;
            if shown.is_err() {
                tracing::warn!("Notification display task failed");
            }

            let _ = fired_tx.send(AlertFired { key: task_key });
        });

        if let Some(previous) = pending.insert(key.to_string(), handle) {
            previous.abort();
        }
        Ok(())
    }

    fn cancel(&self, key: &str) -> Result<()> {
        if let Some(handle) = self.timers.lock().unwrap().remove(key) {
            handle.abort();
        }
        Ok(())
    }
}

impl Drop for DesktopAlertService {
    fn drop(&mut self) {
        for (_, handle) in self.timers.lock().unwrap().drain() {
            handle.abort();
        }
    }
}

fn show_notification(title: &str, body: &str) {
    ensure_notifications_initialized();

    let mut notification = notify_rust::Notification::new();
    notification
        .summary(title)
        .body(body)
        .timeout(notify_rust::Timeout::Milliseconds(ALERT_TIMEOUT_MS));

    // Urgency is only available on Linux (freedesktop notification spec)
    #[cfg(target_os = "linux")]
    notification.urgency(notify_rust::Urgency::Normal);

    if let Err(e) = notification.show() {
        tracing::warn!("Could not send notification: {}", e);
    }
}

/// Alert service that drops everything, for the notifications-off config.
pub struct NoopAlertService;

impl AlertService for NoopAlertService {
    fn upsert(&self, _key: &str, _title: &str, _body: &str, _fire_at: ResetTimestamp) -> Result<()> {
        Ok(())
    }

    fn cancel(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}
