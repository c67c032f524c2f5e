use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use tokio::sync::broadcast;

/// Deduplicates concurrent invocations for the same key: the first caller
/// (leader) runs the future, everyone else awaits the leader's broadcast.
///
/// A cancelled leader drops its sender, which closes the channel; waiting
/// followers observe the closure and re-enter the loop, so the group never
/// wedges on a dead key.
pub struct Group<T> {
    calls: Mutex<HashMap<String, broadcast::Sender<T>>>,
}

impl<T: Clone + Send + 'static> Group<T> {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub async fn work<F, Fut>(&self, key: &str, f: F) -> T
    where
        F: Fn() -> Fut,
        Fut: Future<Output = T>,
    {
        loop {
            let role = {
                let mut calls = self.calls.lock().unwrap();
                match calls.get(key) {
                    Some(tx) => Role::Follower(tx.subscribe()),
                    None => {
                        let (tx, _) = broadcast::channel(1);
                        calls.insert(key.to_string(), tx.clone());
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Follower(mut rx) => match rx.recv().await {
                    Ok(v) => return v,
                    // leader was cancelled before it could publish; retry
                    Err(_) => continue,
                },
                Role::Leader(tx) => {
                    let _guard = Unregister { group: self, key };
                    let v = f().await;
                    let _ = tx.send(v.clone());
                    return v;
                }
            }
        }
    }
}

impl<T: Clone + Send + 'static> Default for Group<T> {
    fn default() -> Self {
        Self::new()
    }
}

enum Role<T> {
    Leader(broadcast::Sender<T>),
    Follower(broadcast::Receiver<T>),
}

struct Unregister<'a, T> {
    group: &'a Group<T>,
    key: &'a str,
}

impl<T> Drop for Unregister<'_, T> {
    fn drop(&mut self) {
        self.group.calls.lock().unwrap().remove(self.key);
    }
}
