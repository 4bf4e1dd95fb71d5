use crate::error::CanaryError;
use std::future::Future;
use tokio::sync::watch;

/// Owner side of a cancellation pair.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Observer side, cloned into every long-running operation.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelHandle {
    pub fn pair() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelSignal { rx })
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelSignal {
    /// Signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Dropping the sender freezes the value at `false`.
        drop(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested; pends forever if it never is.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Race `fut` against cancellation.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T, CanaryError>
    where
        F: Future<Output = Result<T, CanaryError>>,
    {
        if self.is_cancelled() {
            return Err(CanaryError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(CanaryError::Cancelled),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn guard_returns_cancelled_when_signalled() {
        let (handle, signal) = CancelHandle::pair();
        let pending = signal.guard(async {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok::<_, CanaryError>(1)
        });
        handle.cancel();
        assert_eq!(pending.await, Err(CanaryError::Cancelled));
    }

    #[tokio::test]
    async fn never_signal_lets_work_finish() {
        let signal = CancelSignal::never();
        assert!(!signal.is_cancelled());
        let value = signal.guard(async { Ok::<_, CanaryError>(7) }).await;
        assert_eq!(value, Ok(7));
    }
}
