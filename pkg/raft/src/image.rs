use std::sync::Arc;

use async_std::sync::RwLock;
use async_trait::async_trait;
use common::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// A done-token for one term/role incarnation. Background work spawned under
/// a given [Image] races this against its own progress and bails out once
/// the peer moves on to a new term or role, instead of polling shared state.
#[derive(Clone)]
pub struct Done {
    inner: Arc<async_std::sync::Mutex<DoneInner>>,
}

struct DoneInner {
    closed: bool,
    waiters: Vec<async_std::channel::Sender<()>>,
}

impl Done {
    fn new() -> Self {
        Self {
            inner: Arc::new(async_std::sync::Mutex::new(DoneInner {
                closed: false,
                waiters: vec![],
            })),
        }
    }

    async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return;
        }
        inner.closed = true;
        for sender in inner.waiters.drain(..) {
            let _ = sender.send(()).await;
        }
    }

    pub async fn is_done(&self) -> bool {
        self.inner.lock().await.closed
    }
}

#[async_trait]
impl CancellationToken for Done {
    async fn wait(&self) {
        let receiver = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return;
            }
            let (sender, receiver) = async_std::channel::bounded(1);
            inner.waiters.push(sender);
            receiver
        };
        let _ = receiver.recv().await;
    }
}

/// An immutable snapshot of a peer's role/term/vote, paired with a token
/// that is closed the instant a newer [Image] replaces this one.
#[derive(Clone)]
pub struct Image {
    pub role: Role,
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub done: Done,
}

impl Image {
    pub fn initial() -> Self {
        Self {
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            done: Done::new(),
        }
    }
}

/// Guards the current [Image] and hands out a fresh one (with its own done
/// token) on every role/term transition, invalidating whoever held the
/// previous one.
pub struct ImageCell {
    current: RwLock<Image>,
}

impl ImageCell {
    pub fn new(initial: Image) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    pub async fn get(&self) -> Image {
        self.current.read().await.clone()
    }

    /// Applies `f` to the current image to compute the new one, closes the
    /// old done token, and installs the new image with a fresh token.
    pub async fn update<F: FnOnce(&Image) -> Image>(&self, f: F) -> Image {
        let mut guard = self.current.write().await;
        let old_done = guard.done.clone();
        let mut next = f(&guard);
        next.done = Done::new();
        *guard = next.clone();
        drop(guard);
        old_done.close().await;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_std::test]
    async fn update_invalidates_previous_image() {
        let cell = ImageCell::new(Image::initial());
        let first = cell.get().await;
        assert!(!first.done.is_done().await);

        cell.update(|img| Image {
            role: Role::Candidate,
            current_term: img.current_term + 1,
            voted_for: None,
            done: img.done.clone(),
        })
        .await;

        assert!(first.done.is_done().await);
        let second = cell.get().await;
        assert_eq!(second.role, Role::Candidate);
        assert_eq!(second.current_term, 1);
        assert!(!second.done.is_done().await);
    }
}
