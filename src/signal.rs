//! One-shot disconnect signal.
//!
//! Every connection attempt creates a fresh pair. The session owns the
//! [`DisconnectNotifier`] and fires it when the transport reports the link is
//! gone; the supervisor owns the [`DisconnectSignal`] and waits on it. Neither
//! half outlives the attempt it was made for.

use tokio::sync::oneshot;

/// Why a [`DisconnectSignal`] resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The transport reported the disconnection.
    Reported,
    /// The notifier was dropped without firing. The session can no longer
    /// report anything, so the connection is treated as lost.
    NotifierDropped,
}

/// Sending half. Fires at most once because [`notify`](Self::notify)
/// consumes it.
#[derive(Debug)]
pub struct DisconnectNotifier {
    tx: oneshot::Sender<()>,
}

impl DisconnectNotifier {
    /// Mark the connection as lost.
    pub fn notify(self) {
        // The waiter may already be gone if the attempt was cancelled.
        let _ = self.tx.send(());
    }

    /// Check whether the waiting side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half.
#[derive(Debug)]
pub struct DisconnectSignal {
    rx: oneshot::Receiver<()>,
}

impl DisconnectSignal {
    /// Create a fresh notifier/signal pair.
    pub fn new() -> (DisconnectNotifier, DisconnectSignal) {
        let (tx, rx) = oneshot::channel();
        (DisconnectNotifier { tx }, DisconnectSignal { rx })
    }

    /// Suspend until the notifier fires or is dropped.
    pub async fn wait(self) -> DisconnectReason {
        match self.rx.await {
            Ok(()) => DisconnectReason::Reported,
            Err(_) => DisconnectReason::NotifierDropped,
        }
    }
}
