//! Offline notification queue.
//!
//! Sessions submit fire-and-forget alert jobs; a single worker task drains
//! the queue and talks to the Telegram Bot API. Submission never blocks and
//! its failures never reach the submitting session.

pub mod telegram;

use tokio::sync::mpsc;

use crate::config::TelegramConfig;
use telegram::TelegramNotifier;

/// A queued "you have a new message" alert for an offline recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// The recipient's stored telegram handle (a t.me link or @name).
    pub handle: String,
    pub sender_name: String,
    pub text: String,
}

/// Cloneable submit side of the notification queue.
#[derive(Clone)]
pub struct NotifierHandle {
    tx: mpsc::UnboundedSender<Notification>,
}

impl NotifierHandle {
    /// Enqueue an alert. Never blocks, never fails the caller — a dead
    /// worker just logs and drops.
    pub fn submit(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            tracing::warn!("notification worker is gone, alert dropped");
        }
    }
}

/// Create a detached queue: the submit handle plus the raw receiving end.
/// Tests use this to observe submitted jobs without running a worker.
pub fn channel() -> (NotifierHandle, mpsc::UnboundedReceiver<Notification>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (NotifierHandle { tx }, rx)
}

/// Spawn the notification worker and return the handle sessions submit to.
/// Without telegram configuration the worker still drains the queue so
/// submitters never notice the difference.
pub fn spawn_notifier(config: Option<TelegramConfig>) -> NotifierHandle {
    let (handle, mut rx) = channel();

    match config {
        Some(config) => {
            let notifier = TelegramNotifier::new(config);
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    if let Err(err) = notifier.send(&job).await {
                        tracing::warn!(
                            handle = %job.handle,
                            error = %err,
                            "telegram notification failed"
                        );
                    }
                }
            });
        }
        None => {
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    tracing::debug!(
                        handle = %job.handle,
                        "telegram notifications disabled, alert dropped"
                    );
                }
            });
        }
    }

    handle
}
