use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

type Topics = Arc<Mutex<HashMap<String, Vec<Waiter>>>>;

struct Waiter {
    id: u64,
    tx: mpsc::Sender<()>,
}

/// Per-key one-shot notification of waiters. A publish wakes every current
/// subscriber of the key without blocking; each subscriber observes at most
/// one pending signal no matter how many publishes race it.
#[derive(Default)]
pub struct PubSub {
    topics: Topics,
    next_id: AtomicU64,
}

impl PubSub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, key: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(1);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push(Waiter { id, tx });
        Subscription {
            topics: self.topics.clone(),
            key: key.to_string(),
            id,
            rx,
        }
    }

    pub fn publish(&self, key: &str) {
        let mut topics = self.topics.lock().unwrap();
        if let Some(waiters) = topics.get_mut(key) {
            waiters.retain(|w| !w.tx.is_closed());
            for w in waiters.iter() {
                let _ = w.tx.try_send(());
            }
            if waiters.is_empty() {
                topics.remove(key);
            }
        }
    }
}

/// Handle to one registration; dropping it releases the slot.
pub struct Subscription {
    topics: Topics,
    key: String,
    id: u64,
    rx: mpsc::Receiver<()>,
}

impl Subscription {
    /// Resolves on the next publish for the key (or immediately, if one
    /// already fired since registration).
    pub async fn wait(&mut self) {
        let _ = self.rx.recv().await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut topics = self.topics.lock().unwrap();
        if let Some(waiters) = topics.get_mut(&self.key) {
            waiters.retain(|w| w.id != self.id);
            if waiters.is_empty() {
                topics.remove(&self.key);
            }
        }
    }
}
