//! Screen lifetimes.
//!
//! A [`ScreenScope`] is owned by whatever renders a screen. Controllers hold
//! a [`ScopeToken`] and stop publishing once the scope is cancelled, either
//! explicitly or by dropping it.

use tokio::sync::watch;
use tracing::debug;

#[derive(Debug)]
pub struct ScreenScope {
    cancel: watch::Sender<bool>,
}

impl ScreenScope {
    pub fn new() -> Self {
        Self {
            cancel: watch::Sender::new(false),
        }
    }

    pub fn token(&self) -> ScopeToken {
        ScopeToken {
            rx: self.cancel.subscribe(),
        }
    }

    /// Marks the screen as gone. Idempotent.
    pub fn cancel(&self) {
        let changed = self.cancel.send_if_modified(|cancelled| {
            let was = *cancelled;
            *cancelled = true;
            !was
        });
        if changed {
            debug!("screen scope cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

impl Default for ScreenScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScreenScope {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Debug, Clone)]
pub struct ScopeToken {
    rx: watch::Receiver<bool>,
}

impl ScopeToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the owning scope is cancelled or dropped.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // Err means the sender is gone, which only happens after Drop cancelled it.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let scope = ScreenScope::new();
        let token = scope.token();
        assert!(!token.is_cancelled());

        let waiter = tokio::spawn({
            let token = token.clone();
            async move { token.cancelled().await }
        });

        scope.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
        assert!(scope.is_cancelled());
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let scope = ScreenScope::new();
        let token = scope.token();
        drop(scope);

        assert!(token.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let scope = ScreenScope::default();
        scope.cancel();
        scope.cancel();
        assert!(scope.is_cancelled());
    }
}
