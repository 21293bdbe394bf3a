use tokio::sync::watch;

/// Sending half of a watch channel carrying no data, used as a one-shot broadcast.
pub type SignalTx = watch::Sender<()>;

/// Receiving half of a [`SignalTx`].
pub type SignalRx = watch::Receiver<()>;

/// Creates a new pair of [`SignalTx`] and [`SignalRx`].
pub fn create_signal() -> (SignalTx, SignalRx) {
    watch::channel(())
}
