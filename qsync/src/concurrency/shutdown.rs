use tokio::sync::watch;

use crate::concurrency::signal::{SignalRx, SignalTx, create_signal};

/// Requests the end of a run.
///
/// A shutdown never interrupts the release of a lock or pause already held, it only
/// stops the waits that precede it and prevents the next table from starting.
#[derive(Debug, Clone)]
pub struct ShutdownTx(SignalTx);

impl ShutdownTx {
    pub fn wrap(tx: SignalTx) -> Self {
        Self(tx)
    }

    pub fn shutdown(&self) -> Result<(), watch::error::SendError<()>> {
        self.0.send(())
    }
}

pub type ShutdownRx = SignalRx;

/// Returns `true` if a shutdown was sent that `shutdown_rx` has not observed yet.
///
/// Decided from the channel version, so a shutdown stays visible after the sender is
/// dropped. A sender dropped without sending is not a shutdown request.
pub fn is_shutdown_requested(shutdown_rx: &ShutdownRx) -> bool {
    shutdown_rx.borrow().has_changed()
}

pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = create_signal();
    (ShutdownTx::wrap(tx), rx)
}
