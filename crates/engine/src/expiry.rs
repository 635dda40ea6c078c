use std::collections::HashMap;

use shared::domain::MessageId;
use tokio::{sync::Mutex, task::JoinHandle};

/// Abortable expiry timers, one per live broadcast message. Cancelling a
/// timer only stops a sleep that has not finished; whether a removal gets
/// announced is always decided by the state store's `remove_message`.
#[derive(Default)]
pub struct ExpiryTimers {
    tasks: Mutex<HashMap<MessageId, JoinHandle<()>>>,
}

impl ExpiryTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the timer task, replacing (and aborting) any timer already
    /// scheduled for the id.
    pub async fn schedule(&self, id: MessageId, task: JoinHandle<()>) {
        if let Some(previous) = self.tasks.lock().await.insert(id, task) {
            previous.abort();
        }
    }

    /// Aborts and forgets the timer; returns whether one was pending.
    pub async fn cancel(&self, id: MessageId) -> bool {
        match self.tasks.lock().await.remove(&id) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Drops the bookkeeping for a timer that has already fired.
    pub async fn forget(&self, id: MessageId) {
        self.tasks.lock().await.remove(&id);
    }

    pub async fn pending(&self) -> usize {
        self.tasks.lock().await.len()
    }
}
