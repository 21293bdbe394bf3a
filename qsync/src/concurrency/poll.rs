use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::concurrency::shutdown::ShutdownRx;
use crate::error::SyncResult;

/// What happens once a [`Deadline`] has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnExpiry {
    /// Stop polling and report [`PollOutcome::Expired`].
    Abort,
    /// Log a warning once and keep polling.
    Warn,
}

/// Time limit of a polling loop, measured from an instant that may precede the loop.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started_at: Instant,
    limit: Duration,
    on_expiry: OnExpiry,
}

impl Deadline {
    pub fn new(started_at: Instant, limit: Duration, on_expiry: OnExpiry) -> Self {
        Self {
            started_at,
            limit,
            on_expiry,
        }
    }

    /// Builds the deadline of an operator-overridable wait: forced runs only warn.
    pub fn overridable(started_at: Instant, limit: Duration, force: bool) -> Self {
        let on_expiry = if force { OnExpiry::Warn } else { OnExpiry::Abort };
        Self::new(started_at, limit, on_expiry)
    }

    pub fn is_expired(&self) -> bool {
        self.started_at.elapsed() > self.limit
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }
}

/// How a polling loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The predicate held.
    Ready,
    /// The deadline passed with [`OnExpiry::Abort`].
    Expired,
    /// A shutdown was requested while waiting.
    Shutdown,
}

/// Evaluates `predicate` every `interval` until it holds.
///
/// The predicate is evaluated first, so a condition that already holds returns without
/// sleeping. The deadline is only checked between evaluations, never preemptively. When
/// `shutdown_rx` is `None` the loop cannot be interrupted, which is what release paths
/// need. Errors of the predicate end the loop immediately.
pub async fn poll_until<F, Fut>(
    interval: Duration,
    deadline: Option<Deadline>,
    mut shutdown_rx: Option<ShutdownRx>,
    mut predicate: F,
) -> SyncResult<PollOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<bool>>,
{
    let mut warned = false;

    loop {
        if predicate().await? {
            return Ok(PollOutcome::Ready);
        }

        if let Some(deadline) = &deadline
            && deadline.is_expired()
        {
            match deadline.on_expiry {
                OnExpiry::Abort => return Ok(PollOutcome::Expired),
                OnExpiry::Warn if !warned => {
                    warn!(
                        limit_secs = deadline.limit.as_secs_f64(),
                        "wait exceeded its limit, continuing because it was forced"
                    );
                    warned = true;
                }
                OnExpiry::Warn => {}
            }
        }

        match shutdown_rx.as_mut() {
            Some(shutdown_rx) => {
                tokio::select! {
                    biased;

                    changed = shutdown_rx.changed() => {
                        if changed.is_ok() {
                            return Ok(PollOutcome::Shutdown);
                        }

                        // The sender is gone, nobody can request a shutdown anymore.
                        tokio::time::sleep(interval).await;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            None => tokio::time::sleep(interval).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::shutdown::create_shutdown_channel;
    use crate::error::ErrorKind;
    use crate::sync_error;
    use std::cell::Cell;

    const INTERVAL: Duration = Duration::from_millis(500);

    #[tokio::test(start_paused = true)]
    async fn test_ready_predicate_does_not_sleep() {
        let start = Instant::now();
        let outcome = poll_until(INTERVAL, None, None, || async { Ok(true) })
            .await
            .unwrap();

        assert_eq!(outcome, PollOutcome::Ready);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_on_interval_until_ready() {
        let start = Instant::now();
        let calls = Cell::new(0);
        let outcome = poll_until(INTERVAL, None, None, || {
            calls.set(calls.get() + 1);
            let done = calls.get() == 4;
            async move { Ok(done) }
        })
        .await
        .unwrap();

        assert_eq!(outcome, PollOutcome::Ready);
        assert_eq!(calls.get(), 4);
        assert_eq!(start.elapsed(), INTERVAL * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_deadline_expires() {
        let start = Instant::now();
        let deadline = Deadline::overridable(start, Duration::from_secs(2), false);
        let outcome = poll_until(INTERVAL, Some(deadline), None, || async { Ok(false) })
            .await
            .unwrap();

        assert_eq!(outcome, PollOutcome::Expired);
        assert!(start.elapsed() > Duration::from_secs(2));
        assert!(start.elapsed() <= Duration::from_secs(2) + INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_deadline_keeps_polling() {
        let start = Instant::now();
        let deadline = Deadline::overridable(start, Duration::from_secs(1), true);
        let outcome = poll_until(INTERVAL, Some(deadline), None, || {
            let done = start.elapsed() >= Duration::from_secs(5);
            async move { Ok(done) }
        })
        .await
        .unwrap();

        assert_eq!(outcome, PollOutcome::Ready);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_wait() {
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        shutdown_tx.shutdown().unwrap();

        let outcome = poll_until(INTERVAL, None, Some(shutdown_rx), || async { Ok(false) })
            .await
            .unwrap();

        assert_eq!(outcome, PollOutcome::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_shutdown_channel_is_ignored() {
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        drop(shutdown_tx);

        let start = Instant::now();
        let outcome = poll_until(INTERVAL, None, Some(shutdown_rx), || {
            let done = start.elapsed() >= Duration::from_secs(1);
            async move { Ok(done) }
        })
        .await
        .unwrap();

        assert_eq!(outcome, PollOutcome::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_error_stops_polling() {
        let err = poll_until(INTERVAL, None, None, || async {
            Err(sync_error!(ErrorKind::ConsumerNotFound, "No such consumer"))
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConsumerNotFound);
    }
}
