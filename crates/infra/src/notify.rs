//! Operator notifications.
//!
//! A digest of a run is delivered to every notifiable account twice: once as
//! a transactional email and once as an in-app message. Delivery is
//! best-effort and isolated per account.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use tracing::{info, warn};

use mailops_core::{AccountId, RunLog};

use crate::store::{Account, AccountDirectory, StoreError};

pub const UPDATE_NOTIFICATION_SUBJECT: &str = "Automatic update notification!";

/// Line separator used when a run log is rendered for email/HTML display.
pub const DIGEST_SEPARATOR: &str = "<br />";

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("delivery to {recipient} failed: {reason}")]
    Delivery { recipient: String, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What gets delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub body: String,
}

impl Notification {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
        }
    }

    /// Digest of an auto-update run.
    pub fn update_digest(log: &RunLog) -> Self {
        Self::new(UPDATE_NOTIFICATION_SUBJECT, log.digest(DIGEST_SEPARATOR))
    }
}

pub trait Notifier: Send + Sync {
    fn send_email(&self, to: &Account, notification: &Notification) -> Result<(), NotifyError>;

    fn post_message(&self, to: &Account, notification: &Notification) -> Result<(), NotifyError>;
}

/// Outcome of a fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub accounts: usize,
    pub emails_sent: usize,
    pub messages_posted: usize,
    pub failures: usize,
}

/// Deliver `notification` to every notifiable account.
///
/// Fails only when the account list itself cannot be read.
pub fn notify_accounts(
    directory: &dyn AccountDirectory,
    notifier: &dyn Notifier,
    notification: &Notification,
) -> Result<DeliveryReport, NotifyError> {
    let accounts = directory.notifiable_accounts()?;
    let mut report = DeliveryReport {
        accounts: accounts.len(),
        ..DeliveryReport::default()
    };

    for account in &accounts {
        match notifier.send_email(account, notification) {
            Ok(()) => report.emails_sent += 1,
            Err(err) => {
                report.failures += 1;
                warn!(account_id = %account.id, error = %err, "notification email failed");
            }
        }
        match notifier.post_message(account, notification) {
            Ok(()) => report.messages_posted += 1,
            Err(err) => {
                report.failures += 1;
                warn!(account_id = %account.id, error = %err, "in-app notification failed");
            }
        }
    }

    info!(
        accounts = report.accounts,
        emails = report.emails_sent,
        messages = report.messages_posted,
        failures = report.failures,
        "notifications delivered"
    );
    Ok(report)
}

/// Notifier that keeps deliveries in memory (tests/dev).
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    emails: Mutex<Vec<(AccountId, Notification)>>,
    messages: Mutex<Vec<(AccountId, Notification)>>,
    failing: HashSet<AccountId>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every delivery to `account` fail.
    pub fn failing_for(mut self, account: AccountId) -> Self {
        self.failing.insert(account);
        self
    }

    pub fn emails(&self) -> Vec<(AccountId, Notification)> {
        self.emails
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn messages(&self) -> Vec<(AccountId, Notification)> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn deliver(
        &self,
        sink: &Mutex<Vec<(AccountId, Notification)>>,
        to: &Account,
        notification: &Notification,
    ) -> Result<(), NotifyError> {
        if self.failing.contains(&to.id) {
            return Err(NotifyError::Delivery {
                recipient: to.email.clone(),
                reason: "rejected".to_string(),
            });
        }
        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((to.id, notification.clone()));
        Ok(())
    }
}

impl Notifier for RecordingNotifier {
    fn send_email(&self, to: &Account, notification: &Notification) -> Result<(), NotifyError> {
        self.deliver(&self.emails, to, notification)
    }

    fn post_message(&self, to: &Account, notification: &Notification) -> Result<(), NotifyError> {
        self.deliver(&self.messages, to, notification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryAccountDirectory;
    use mailops_core::RunId;

    fn account(id: u64) -> Account {
        Account {
            id: AccountId::new(id),
            name: format!("Operator {id}"),
            email: format!("op{id}@example.com"),
        }
    }

    #[test]
    fn one_failing_account_does_not_block_the_others() {
        let directory = InMemoryAccountDirectory::new([account(1), account(2), account(3)]);
        let notifier = RecordingNotifier::new().failing_for(AccountId::new(2));
        let notification = Notification::new("subject", "body");

        let report = notify_accounts(&directory, &notifier, &notification).unwrap();

        assert_eq!(report.accounts, 3);
        assert_eq!(report.emails_sent, 2);
        assert_eq!(report.messages_posted, 2);
        assert_eq!(report.failures, 2);
        let recipients: Vec<_> = notifier.emails().into_iter().map(|(id, _)| id.get()).collect();
        assert_eq!(recipients, vec![1, 3]);
    }

    #[test]
    fn update_digest_joins_log_lines() {
        let mut log = RunLog::new("auto-update", RunId::new());
        log.record("first");
        log.record("second");

        let digest = Notification::update_digest(&log);
        assert_eq!(digest.subject, UPDATE_NOTIFICATION_SUBJECT);
        assert!(digest.body.contains("first"));
        assert!(digest.body.contains(&format!("{DIGEST_SEPARATOR}[")));
    }
}
