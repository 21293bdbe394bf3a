use tracing::{debug, warn};

use crate::bail;
use crate::concurrency::poll::{PollOutcome, poll_until};
use crate::error::{ErrorKind, SyncResult};
use crate::queue::QueueControl;
use crate::session::QueueAdmin;

/// Waits until the run's consumer keeps up with the ticker.
///
/// A consumer is healthy when its lag stays below the ticker lag plus the configured
/// margin. There is no deadline: comparing against a consumer known to be far behind is
/// never useful, so the check waits for as long as it takes, warning on every poll. A
/// missing consumer fails immediately. A shutdown ends the wait with
/// [`ErrorKind::Cancelled`].
pub async fn ensure_consumer_healthy<A>(queue: &QueueControl<'_, A>) -> SyncResult<()>
where
    A: QueueAdmin,
{
    let margin = queue.settings().lag_margin;
    let consumer_name = queue.settings().consumer_name.as_str();

    let outcome = poll_until(
        queue.settings().poll_interval,
        None,
        Some(queue.shutdown_rx()),
        || async move {
            let info = queue.consumer_info().await?;
            if info.is_healthy(margin) {
                return Ok(true);
            }

            if info.consumer_lag.is_none() {
                warn!(
                    consumer_name,
                    "consumer has not finished a batch yet and reports no lag, waiting"
                );
                return Ok(false);
            }

            warn!(
                consumer_name,
                consumer_lag_secs = info.consumer_lag.map(|lag| lag.as_secs_f64()),
                ticker_lag_secs = info.ticker_lag.as_secs_f64(),
                margin_secs = margin.as_secs_f64(),
                "consumer lag too big compared to ticker lag, waiting"
            );

            Ok(false)
        },
    )
    .await?;

    match outcome {
        PollOutcome::Ready | PollOutcome::Expired => {
            debug!(consumer_name, "consumer is healthy");
            Ok(())
        }
        PollOutcome::Shutdown => bail!(
            ErrorKind::Cancelled,
            "Run was cancelled while waiting for a healthy consumer"
        ),
    }
}
