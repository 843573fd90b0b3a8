use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_std::sync::Mutex;

use crate::common::{Command, Reply};

struct Entry {
    closed: bool,
    result: Option<(Command, Reply)>,
    senders: Vec<async_std::channel::Sender<()>>,
}

impl Entry {
    fn open() -> Self {
        Self {
            closed: false,
            result: None,
            senders: vec![],
        }
    }
}

/// Rendezvous point between an RPC handler blocked on a submitted log index
/// and the applier task that eventually executes it. Lazily creates an
/// entry on first access from either side.
pub struct WaiterRegistry {
    entries: Mutex<HashMap<u64, Entry>>,
    destroyed: AtomicBool,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Blocks until `set_and_broadcast` closes this index (or the registry
    /// is destroyed), then returns whatever was recorded, if anything.
    pub async fn wait(&self, index: u64) -> Option<(Command, Reply)> {
        loop {
            let receiver = {
                let mut entries = self.entries.lock().await;
                if self.destroyed.load(Ordering::SeqCst) {
                    return None;
                }
                let entry = entries.entry(index).or_insert_with(Entry::open);
                if entry.closed {
                    return entry.result.clone();
                }
                let (sender, receiver) = async_std::channel::bounded(1);
                entry.senders.push(sender);
                receiver
            };
            let _ = receiver.recv().await;
        }
    }

    /// Records the outcome for `index`. If no one is waiting yet, the entry
    /// is only created when `wake` is true (a live submission from this
    /// server); entries from replayed log with no local waiter are dropped
    /// to avoid leaking memory for indices nobody will ever wait on.
    pub async fn set_and_broadcast(&self, index: u64, command: Command, reply: Reply, wake: bool) {
        let mut entries = self.entries.lock().await;
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }

        if !entries.contains_key(&index) && !wake {
            return;
        }

        let entry = entries.entry(index).or_insert_with(Entry::open);
        entry.closed = true;
        entry.result = Some((command, reply));
        for sender in entry.senders.drain(..) {
            let _ = sender.send(()).await;
        }
    }

    pub async fn delete(&self, index: u64) {
        self.entries.lock().await.remove(&index);
    }

    /// Unblocks every current and future `wait` call with `None`, used on
    /// server shutdown.
    pub async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        let mut entries = self.entries.lock().await;
        for (_, entry) in entries.iter_mut() {
            entry.closed = true;
            for sender in entry.senders.drain(..) {
                let _ = sender.send(()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Identifier, OpKey};

    fn sample_command() -> Command {
        Command {
            id: Identifier { clerk_id: 1, seq: 0 },
            server_id: 0,
            op: OpKey::Query(-1),
        }
    }

    #[async_std::test]
    async fn wait_resolves_after_broadcast() {
        let registry = WaiterRegistry::new();
        let wait_fut = registry.wait(5);
        let broadcast_fut = registry.set_and_broadcast(5, sample_command(), Reply::ok(), true);

        let (result, _) = futures::future::join(wait_fut, broadcast_fut).await;
        assert!(result.is_some());
    }

    #[async_std::test]
    async fn no_wake_without_waiter_is_noop() {
        let registry = WaiterRegistry::new();
        registry
            .set_and_broadcast(9, sample_command(), Reply::ok(), false)
            .await;
        assert!(registry.entries.lock().await.get(&9).is_none());
    }

    #[async_std::test]
    async fn destroy_unblocks_waiters() {
        let registry = WaiterRegistry::new();
        let wait_fut = registry.wait(3);
        let destroy_fut = registry.destroy();
        let (result, _) = futures::future::join(wait_fut, destroy_fut).await;
        assert!(result.is_none());
    }
}
