//! Per-proxy views of the connection's single event stream.

use std::panic::AssertUnwindSafe;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::rpc::envelope::{Event, HandleId};

/// Matches every event name for a source
pub const ANY_EVENT: &str = "*";

/// An active `on(name, callback)` registration.
///
/// The callback runs on a background task until [`unsubscribe`] is called or
/// the subscription is dropped.
///
/// [`unsubscribe`]: Subscription::unsubscribe
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: CancellationToken,
}

impl Subscription {
    /// Start delivering events from `source` named `name` to `callback`.
    /// Must be called inside a tokio runtime.
    pub(crate) fn spawn<F>(
        mut events: broadcast::Receiver<Event>,
        source: Option<HandleId>,
        name: &str,
        callback: F,
    ) -> Self
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let name = name.to_string();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            log::warn!("Subscriber for '{name}' lagged, {missed} event(s) dropped");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };

                if event.source != source || (name != ANY_EVENT && event.name != name) {
                    continue;
                }

                if std::panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                    log::error!("Event callback for '{name}' panicked");
                }
            }
        });

        Self { cancel }
    }

    /// Stop delivering events. Calling it again has no effect.
    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
