//! Exactly-once cancellation token
//!
//! An atomic flag decides which caller fires the broadcast; a `watch` channel
//! wakes every waiter, including ones that subscribe after the fact.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;

struct Inner {
    cancelled: AtomicBool,
    tx: watch::Sender<bool>,
    children: Mutex<Vec<Weak<Inner>>>,
}

/// Cloneable cancellation signal shared between pumps
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                tx,
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A token that is cancelled together with `self` (but not vice versa)
    pub fn child(&self) -> Self {
        let child = Self::new();
        let mut children = self.inner.children.lock();
        if self.is_cancelled() {
            drop(children);
            child.cancel();
            return child;
        }
        children.retain(|weak| weak.strong_count() > 0);
        children.push(Arc::downgrade(&child.inner));
        child
    }

    /// Fire the token. Returns `true` only for the call that actually fired it.
    pub fn cancel(&self) -> bool {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.tx.send_replace(true);
        let children = std::mem::take(&mut *self.inner.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            CancelToken { inner: child }.cancel();
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token has fired
    pub async fn cancelled(&self) {
        let mut rx = self.inner.tx.subscribe();
        if self.is_cancelled() {
            return;
        }
        // The sender lives as long as `self`, so this only returns once fired.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fires_exactly_once_under_concurrency() {
        let token = CancelToken::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let token = token.clone();
            let fired = fired.clone();
            handles.push(tokio::spawn(async move {
                if token.cancel() {
                    fired.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_late_waiter_resolves() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(50), token.cancelled())
            .await
            .expect("late waiter must resolve immediately");
    }

    #[tokio::test]
    async fn test_waiter_woken() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .expect("waiter woken")
            .unwrap();
    }

    #[test]
    fn test_child_follows_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        child.cancel();
        assert!(!parent.is_cancelled());

        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(parent.child().is_cancelled());
    }
}
