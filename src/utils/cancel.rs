/// Caller-supplied cancellation signal built on a tokio watch channel
use tokio::sync::watch;

/// Sending half: owned by whoever decides to cancel (e.g. a ctrl-c handler)
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiving half: cloned into every operation that must abort promptly
#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires, for callers without a cancellation source
    #[allow(dead_code)]
    pub fn none() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the channel open forever so `cancelled` pends instead of erroring
        std::mem::forget(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested. If the handle is dropped
    /// without cancelling, this pends forever.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a connected cancel handle/signal pair
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}
