//! Reset reminder scheduling.
//!
//! Accounts sharing a minute-normalized reset instant form one group with one
//! scheduled alert; the alert key is derived from the instant, so re-issuing
//! replaces instead of duplicating. The platform side is behind
//! [`AlertService`] and its failures only cost the reminder, never the
//! bookkeeping.

use super::types::{AccountId, ResetTimestamp};
use anyhow::Result;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Platform service that delivers scheduled alerts.
///
/// `upsert` with an existing key replaces the pending alert; this is what
/// makes group updates idempotent.
pub trait AlertService: Send + Sync {
    fn upsert(&self, key: &str, title: &str, body: &str, fire_at: ResetTimestamp) -> Result<()>;
    fn cancel(&self, key: &str) -> Result<()>;
}

const ALERT_TITLE: &str = "Usage window reset";

/// Maps normalized reset instants to the accounts resetting then, and keeps
/// one alert per group current.
pub struct ResetNotificationScheduler {
    service: Arc<dyn AlertService>,
    /// Group membership keyed by normalized reset epoch seconds.
    groups: HashMap<i64, BTreeSet<AccountId>>,
    /// The group each account currently belongs to. An account is in at most
    /// one group.
    scheduled: HashMap<AccountId, i64>,
    /// Last known display label per scheduled account, for group bodies.
    labels: HashMap<AccountId, String>,
}

impl ResetNotificationScheduler {
    pub fn new(service: Arc<dyn AlertService>) -> Self {
        Self {
            service,
            groups: HashMap::new(),
            scheduled: HashMap::new(),
            labels: HashMap::new(),
        }
    }

    /// Ensures `id` is scheduled under `reset_at`.
    ///
    /// A repeated call with the account's current reset instant is a no-op,
    /// so steady-state polls cost no platform calls. A changed instant moves
    /// the account between groups, updating both sides.
    pub fn schedule_or_update(
        &mut self,
        id: &AccountId,
        display_name: Option<&str>,
        reset_at: ResetTimestamp,
    ) {
        let key = reset_at.normalized_to_minute().epoch_seconds;
        let label = display_name
            .map(String::from)
            .unwrap_or_else(|| id.short());
        self.labels.insert(id.clone(), label);

        if self.scheduled.get(id) == Some(&key) {
            return;
        }

        self.detach(id);

        self.groups.entry(key).or_default().insert(id.clone());
        self.scheduled.insert(id.clone(), key);
        self.reissue(key);
    }

    /// Drops an account from its group, cancelling the group's alert if it
    /// was the last member and reissuing with the remainder otherwise.
    pub fn remove_account(&mut self, id: &AccountId) {
        self.detach(id);
        self.labels.remove(id);
    }

    /// Removes `id` from its current group and refreshes that group's alert.
    fn detach(&mut self, id: &AccountId) {
        let Some(key) = self.scheduled.remove(id) else {
            return;
        };

        let emptied = match self.groups.get_mut(&key) {
            Some(members) => {
                members.remove(id);
                members.is_empty()
            }
            None => return,
        };

        if emptied {
            self.groups.remove(&key);
            if let Err(e) = self.service.cancel(&alert_key(key)) {
                tracing::warn!("Failed to cancel reset alert: {:#}", e);
            }
        } else {
            self.reissue(key);
        }
    }

    /// Issues the alert for a group from its full current membership.
    fn reissue(&self, key: i64) {
        let Some(members) = self.groups.get(&key) else {
            return;
        };

        let mut labels: Vec<&str> = members
            .iter()
            .filter_map(|id| self.labels.get(id).map(String::as_str))
            .collect();
        labels.sort_unstable();

        let body = match labels.len() {
            1 => format!("Usage has reset for {}", labels[0]),
            n => format!("Usage has reset for {} accounts: {}", n, labels.join(", ")),
        };

        let fire_at = ResetTimestamp::from_epoch_seconds(key);
        if let Err(e) = self
            .service
            .upsert(&alert_key(key), ALERT_TITLE, &body, fire_at)
        {
            tracing::warn!("Failed to schedule reset alert: {:#}", e);
        }
    }

    #[cfg(test)]
    fn scheduled_reset(&self, id: &AccountId) -> Option<ResetTimestamp> {
        self.scheduled
            .get(id)
            .map(|key| ResetTimestamp::from_epoch_seconds(*key))
    }

    #[cfg(test)]
    fn group_count(&self) -> usize {
        self.groups.len()
    }
}

/// Stable alert identity for a group, shared across process restarts.
fn alert_key(epoch_seconds: i64) -> String {
    format!("usage-reset-{}", epoch_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Minute boundary used as the common reset instant in tests.
    const MINUTE_BASE: i64 = 1_700_000_040;

    #[derive(Debug, Clone, PartialEq)]
    enum AlertCall {
        Upsert {
            key: String,
            body: String,
            fire_at: i64,
        },
        Cancel {
            key: String,
        },
    }

    #[derive(Default)]
    struct RecordingAlertService {
        calls: Mutex<Vec<AlertCall>>,
        fail: bool,
    }

    impl RecordingAlertService {
        fn failing() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        fn calls(&self) -> Vec<AlertCall> {
            self.calls.lock().unwrap().clone()
        }

        fn upsert_count(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, AlertCall::Upsert { .. }))
                .count()
        }
    }

    impl AlertService for RecordingAlertService {
        fn upsert(&self, key: &str, _title: &str, body: &str, fire_at: ResetTimestamp) -> Result<()> {
            self.calls.lock().unwrap().push(AlertCall::Upsert {
                key: key.to_string(),
                body: body.to_string(),
                fire_at: fire_at.epoch_seconds,
            });
            if self.fail {
                anyhow::bail!("notification daemon unavailable");
            }
            Ok(())
        }

        fn cancel(&self, key: &str) -> Result<()> {
            self.calls.lock().unwrap().push(AlertCall::Cancel {
                key: key.to_string(),
            });
            if self.fail {
                anyhow::bail!("notification daemon unavailable");
            }
            Ok(())
        }
    }

    fn id(s: &str) -> AccountId {
        AccountId::new(s)
    }

    fn at(epoch: i64) -> ResetTimestamp {
        ResetTimestamp::from_epoch_seconds(epoch)
    }

    #[test]
    fn test_schedule_issues_single_alert() {
        let service = Arc::new(RecordingAlertService::default());
        let mut scheduler = ResetNotificationScheduler::new(service.clone());

        scheduler.schedule_or_update(&id("a"), Some("work"), at(MINUTE_BASE));

        let calls = service.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0],
            AlertCall::Upsert {
                key: format!("usage-reset-{}", MINUTE_BASE),
                body: "Usage has reset for work".to_string(),
                fire_at: MINUTE_BASE,
            }
        );
    }

    #[test]
    fn test_schedule_same_reset_is_noop() {
        let service = Arc::new(RecordingAlertService::default());
        let mut scheduler = ResetNotificationScheduler::new(service.clone());

        scheduler.schedule_or_update(&id("a"), Some("work"), at(MINUTE_BASE));
        scheduler.schedule_or_update(&id("a"), Some("work"), at(MINUTE_BASE));
        scheduler.schedule_or_update(&id("a"), Some("work"), at(MINUTE_BASE));

        assert_eq!(service.upsert_count(), 1);
    }

    #[test]
    fn test_jittered_resets_collapse_to_one_group() {
        let service = Arc::new(RecordingAlertService::default());
        let mut scheduler = ResetNotificationScheduler::new(service.clone());

        // Same upstream reset observed with seconds of jitter
        scheduler.schedule_or_update(&id("a"), Some("work"), at(MINUTE_BASE + 20));
        scheduler.schedule_or_update(&id("a"), Some("work"), at(MINUTE_BASE - 20));

        assert_eq!(service.upsert_count(), 1);
        assert_eq!(scheduler.group_count(), 1);
    }

    #[test]
    fn test_coalesced_group_body_lists_sorted_labels() {
        let service = Arc::new(RecordingAlertService::default());
        let mut scheduler = ResetNotificationScheduler::new(service.clone());

        scheduler.schedule_or_update(&id("z"), Some("zeta"), at(MINUTE_BASE));
        scheduler.schedule_or_update(&id("a"), Some("alpha"), at(MINUTE_BASE));
        scheduler.schedule_or_update(&id("m"), Some("mid"), at(MINUTE_BASE));

        let calls = service.calls();
        assert_eq!(calls.len(), 3);
        let AlertCall::Upsert { key, body, .. } = &calls[2] else {
            panic!("expected upsert");
        };
        // Same key every time, replacing the pending alert
        assert_eq!(key, &format!("usage-reset-{}", MINUTE_BASE));
        assert_eq!(body, "Usage has reset for 3 accounts: alpha, mid, zeta");
        assert_eq!(scheduler.group_count(), 1);
    }

    #[test]
    fn test_remove_reissues_remaining_membership() {
        let service = Arc::new(RecordingAlertService::default());
        let mut scheduler = ResetNotificationScheduler::new(service.clone());

        scheduler.schedule_or_update(&id("a"), Some("alpha"), at(MINUTE_BASE));
        scheduler.schedule_or_update(&id("b"), Some("beta"), at(MINUTE_BASE));
        scheduler.remove_account(&id("a"));

        let calls = service.calls();
        let AlertCall::Upsert { body, .. } = calls.last().unwrap() else {
            panic!("expected upsert");
        };
        assert_eq!(body, "Usage has reset for beta");
    }

    #[test]
    fn test_remove_last_member_cancels_group() {
        let service = Arc::new(RecordingAlertService::default());
        let mut scheduler = ResetNotificationScheduler::new(service.clone());

        scheduler.schedule_or_update(&id("a"), Some("alpha"), at(MINUTE_BASE));
        scheduler.remove_account(&id("a"));

        let calls = service.calls();
        assert_eq!(
            calls.last().unwrap(),
            &AlertCall::Cancel {
                key: format!("usage-reset-{}", MINUTE_BASE),
            }
        );
        assert_eq!(scheduler.group_count(), 0);
        assert_eq!(scheduler.scheduled_reset(&id("a")), None);
    }

    #[test]
    fn test_remove_unknown_account_is_noop() {
        let service = Arc::new(RecordingAlertService::default());
        let mut scheduler = ResetNotificationScheduler::new(service.clone());

        scheduler.remove_account(&id("ghost"));
        assert!(service.calls().is_empty());
    }

    #[test]
    fn test_changed_reset_moves_between_groups() {
        let service = Arc::new(RecordingAlertService::default());
        let mut scheduler = ResetNotificationScheduler::new(service.clone());
        let later = MINUTE_BASE + 5 * 3600;

        scheduler.schedule_or_update(&id("a"), Some("alpha"), at(MINUTE_BASE));
        scheduler.schedule_or_update(&id("a"), Some("alpha"), at(later));

        let calls = service.calls();
        // Upsert old group, cancel it on departure, upsert new group
        assert_eq!(calls.len(), 3);
        assert_eq!(
            calls[1],
            AlertCall::Cancel {
                key: format!("usage-reset-{}", MINUTE_BASE),
            }
        );
        let AlertCall::Upsert { key, .. } = &calls[2] else {
            panic!("expected upsert");
        };
        assert_eq!(key, &format!("usage-reset-{}", later));
        assert_eq!(
            scheduler.scheduled_reset(&id("a")),
            Some(at(later))
        );
    }

    #[test]
    fn test_move_out_of_shared_group_reissues_both() {
        let service = Arc::new(RecordingAlertService::default());
        let mut scheduler = ResetNotificationScheduler::new(service.clone());
        let later = MINUTE_BASE + 5 * 3600;

        scheduler.schedule_or_update(&id("a"), Some("alpha"), at(MINUTE_BASE));
        scheduler.schedule_or_update(&id("b"), Some("beta"), at(MINUTE_BASE));
        scheduler.schedule_or_update(&id("a"), Some("alpha"), at(later));

        let calls = service.calls();
        assert_eq!(calls.len(), 4);
        // Old group reissued naming only beta
        let AlertCall::Upsert { key, body, .. } = &calls[2] else {
            panic!("expected upsert");
        };
        assert_eq!(key, &format!("usage-reset-{}", MINUTE_BASE));
        assert_eq!(body, "Usage has reset for beta");
        // New group holds alpha alone
        let AlertCall::Upsert { key, body, .. } = &calls[3] else {
            panic!("expected upsert");
        };
        assert_eq!(key, &format!("usage-reset-{}", later));
        assert_eq!(body, "Usage has reset for alpha");
        assert_eq!(scheduler.group_count(), 2);
    }

    #[test]
    fn test_label_falls_back_to_short_id() {
        let service = Arc::new(RecordingAlertService::default());
        let mut scheduler = ResetNotificationScheduler::new(service.clone());

        scheduler.schedule_or_update(&id("org-0123456789"), None, at(MINUTE_BASE));

        let AlertCall::Upsert { body, .. } = &service.calls()[0] else {
            panic!("expected upsert");
        };
        assert_eq!(body, "Usage has reset for org-0123");
    }

    #[test]
    fn test_platform_failure_leaves_bookkeeping_intact() {
        let service = Arc::new(RecordingAlertService::failing());
        let mut scheduler = ResetNotificationScheduler::new(service.clone());

        scheduler.schedule_or_update(&id("a"), Some("alpha"), at(MINUTE_BASE));
        assert_eq!(
            scheduler.scheduled_reset(&id("a")),
            Some(at(MINUTE_BASE))
        );

        // Still idempotent afterwards; the failed upsert is not retried
        scheduler.schedule_or_update(&id("a"), Some("alpha"), at(MINUTE_BASE));
        assert_eq!(service.upsert_count(), 1);
    }
}
