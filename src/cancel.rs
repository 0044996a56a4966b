use tokio::sync::watch;

use crate::errors::StitchError;

/// A token that can be checked for cancellation.
#[derive(Clone)]
pub struct CancellationToken(watch::Receiver<bool>);

impl CancellationToken {
    /// A token nobody can cancel.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        CancellationToken(rx)
    }

    /// Returns true if cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Round-boundary check.
    pub fn check(&self) -> Result<(), StitchError> {
        if self.is_cancelled() {
            Err(StitchError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation is signalled; never resolves if the handle
    /// is gone without having cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.0.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Owner side of a cancellation token.
pub struct CancellationHandle {
    tx: watch::Sender<bool>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken(self.tx.subscribe())
    }

    /// Signal cancellation to every token handed out.
    pub fn cancel(&self) {
        // send_replace works with no live receivers
        self.tx.send_replace(true);
    }
}

impl Default for CancellationHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn never_token_stays_clear() {
        let token = CancellationToken::never();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let handle = CancellationHandle::new();
        let token = handle.token();
        let waiter = tokio::spawn(async move { token.cancelled().await });
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(handle.token().check(), Err(StitchError::Cancelled)));
    }
}
