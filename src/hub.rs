//! Synchronous fan-out of state changes and output lines to registered observers.
//!
//! Callbacks run on the publishing task, in registration order. They must stay short:
//! a slow state subscriber stalls the monitor task, a slow output subscriber stalls the
//! output collector. A callback that returns `Err` or panics is logged and skipped;
//! the remaining subscribers still get the event.

use crate::buffer::OutputLine;
use crate::state::StateChange;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::error;

pub type StateCallback = dyn Fn(&StateChange) -> anyhow::Result<()> + Send + Sync;
pub type OutputCallback = dyn Fn(&OutputLine) -> anyhow::Result<()> + Send + Sync;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    StateChange,
    Output,
}

/// Token returned by a subscribe call; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "dropping the token makes the subscription impossible to remove"]
pub struct Subscription {
    id: u64,
    kind: SubscriptionKind,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Notification<'a> {
    State(&'a StateChange),
    Output(&'a OutputLine),
}

enum Callback {
    State(Arc<StateCallback>),
    Output(Arc<OutputCallback>),
}

impl Callback {
    fn kind(&self) -> SubscriptionKind {
        match self {
            Callback::State(_) => SubscriptionKind::StateChange,
            Callback::Output(_) => SubscriptionKind::Output,
        }
    }
}


#[derive(Default)]
pub struct NotificationHub {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(u64, Callback)>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_state<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StateChange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(Callback::State(Arc::new(callback)))
    }

    pub fn subscribe_output<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&OutputLine) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(Callback::Output(Arc::new(callback)))
    }

    /// Returns false if the subscription was already removed.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut subs = self.lock();
        let before = subs.len();
        subs.retain(|(id, _)| *id != subscription.id);
        subs.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }



    /*
        @@@
        @publish();
        . Copies the matching callbacks out under the lock, then releases it before calling any of them,
          so a callback may subscribe or unsubscribe without deadlocking.
        . Calls each one in registration order, isolating errors and panics.
    */
    pub fn publish(&self, event: Notification<'_>) {
        match event {
            Notification::State(change) => {
                let callbacks: Vec<(u64, Arc<StateCallback>)> = self
                    .lock()
                    .iter()
                    .filter_map(|(id, cb)| match cb {
                        Callback::State(f) => Some((*id, f.clone())),
                        Callback::Output(_) => None,
                    })
                    .collect();
                for (id, callback) in callbacks {
                    let outcome = catch_unwind(AssertUnwindSafe(|| callback(change)));
                    report(id, SubscriptionKind::StateChange, outcome);
                }
            }
            Notification::Output(line) => {
                let callbacks: Vec<(u64, Arc<OutputCallback>)> = self
                    .lock()
                    .iter()
                    .filter_map(|(id, cb)| match cb {
                        Callback::Output(f) => Some((*id, f.clone())),
                        Callback::State(_) => None,
                    })
                    .collect();
                for (id, callback) in callbacks {
                    let outcome = catch_unwind(AssertUnwindSafe(|| callback(line)));
                    report(id, SubscriptionKind::Output, outcome);
                }
            }
        }
    }

    pub fn publish_state(&self, change: &StateChange) {
        self.publish(Notification::State(change));
    }

    pub fn publish_output(&self, line: &OutputLine) {
        self.publish(Notification::Output(line));
    }

    fn register(&self, callback: Callback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let kind = callback.kind();
        self.lock().push((id, callback));
        Subscription { id, kind }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(u64, Callback)>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn report(
    id: u64,
    kind: SubscriptionKind,
    outcome: Result<anyhow::Result<()>, Box<dyn Any + Send>>,
) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(subscription = id, kind = ?kind, error = %e, "subscriber failed");
        }
        Err(payload) => {
            error!(subscription = id, kind = ?kind, panic = %panic_message(&*payload), "subscriber panicked");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
