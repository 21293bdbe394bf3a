use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::bail;
use crate::concurrency::poll::{Deadline, PollOutcome, poll_until};
use crate::concurrency::shutdown::ShutdownRx;
use crate::context::SyncSettings;
use crate::error::{ErrorKind, SyncResult};
use crate::session::QueueAdmin;
use crate::sync_error;
use crate::types::{ConsumerInfo, NodeInfo, TickId};

/// Queue operations of a run, bound to its queue, consumer and settings.
///
/// Every wait is driven by [`poll_until`] and observes the run's shutdown signal, except
/// [`QueueControl::resume_consumer`] which always runs to completion.
#[derive(Debug)]
pub struct QueueControl<'a, A> {
    admin: &'a A,
    settings: &'a SyncSettings,
    shutdown_rx: ShutdownRx,
}

impl<'a, A> QueueControl<'a, A>
where
    A: QueueAdmin,
{
    pub fn new(admin: &'a A, settings: &'a SyncSettings, shutdown_rx: ShutdownRx) -> Self {
        Self {
            admin,
            settings,
            shutdown_rx,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        self.settings
    }

    pub(crate) fn shutdown_rx(&self) -> ShutdownRx {
        self.shutdown_rx.clone()
    }

    /// Returns the metadata of the node for the queue.
    pub async fn node_info(&self) -> SyncResult<NodeInfo> {
        let queue_name = &self.settings.queue_name;
        self.admin.node_info(queue_name).await?.ok_or_else(|| {
            sync_error!(
                ErrorKind::NodeNotFound,
                "Node is not part of the queue",
                format!("queue '{queue_name}' has no node on this database")
            )
        })
    }

    /// Returns the current progress of the run's consumer.
    pub async fn consumer_info(&self) -> SyncResult<ConsumerInfo> {
        let queue_name = &self.settings.queue_name;
        let consumer_name = &self.settings.consumer_name;
        self.admin
            .consumer_info(queue_name, consumer_name)
            .await?
            .ok_or_else(|| {
                sync_error!(
                    ErrorKind::ConsumerNotFound,
                    "Consumer is not registered on the queue",
                    format!("consumer '{consumer_name}' not found on queue '{queue_name}'")
                )
            })
    }

    /// Age of the consumer's last finished tick, `None` before its first batch.
    pub async fn consumer_lag(&self) -> SyncResult<Option<Duration>> {
        Ok(self.consumer_info().await?.consumer_lag)
    }

    pub async fn ticker_lag(&self) -> SyncResult<Duration> {
        self.admin.ticker_lag(&self.settings.queue_name).await
    }

    pub async fn server_time(&self) -> SyncResult<DateTime<Utc>> {
        self.admin.server_time().await
    }

    /// Requests a new tick and returns the latest tick id.
    ///
    /// With `wait`, keeps requesting until the ticker cut a tick past the one seen before
    /// the call. Exceeding the tick timeout fails with [`ErrorKind::TickerUnresponsive`]
    /// unless the run is forced.
    pub async fn force_tick(&self, wait: bool) -> SyncResult<TickId> {
        let queue_name = &self.settings.queue_name;
        let start_tick = self.admin.force_tick(queue_name).await?;
        if !wait {
            return Ok(start_tick);
        }

        let deadline = Deadline::overridable(
            Instant::now(),
            self.settings.tick_timeout,
            self.settings.force,
        );
        let current_tick = AtomicI64::new(start_tick);
        let latest_tick = &current_tick;
        let admin = self.admin;
        let outcome = poll_until(
            self.settings.poll_interval,
            Some(deadline),
            Some(self.shutdown_rx()),
            || async move {
                let tick_id = admin.force_tick(queue_name).await?;
                latest_tick.store(tick_id, Ordering::Relaxed);
                Ok(tick_id != start_tick)
            },
        )
        .await?;

        match outcome {
            PollOutcome::Ready => {
                let current_tick = current_tick.load(Ordering::Relaxed);
                debug!(queue_name, start_tick, current_tick, "ticker cut a new tick");
                Ok(current_tick)
            }
            PollOutcome::Expired => bail!(
                ErrorKind::TickerUnresponsive,
                "Ticker did not produce a new tick",
                format!(
                    "no tick past {start_tick} on queue '{queue_name}' within {:?}",
                    self.settings.tick_timeout
                )
            ),
            PollOutcome::Shutdown => bail!(
                ErrorKind::Cancelled,
                "Run was cancelled while waiting for a tick"
            ),
        }
    }

    /// Pauses `worker_name` and waits until it acknowledged the pause.
    pub async fn pause_consumer(&self, worker_name: &str) -> SyncResult<()> {
        info!(worker_name, "pausing consumer");
        self.set_paused(worker_name, true, Some(self.shutdown_rx()))
            .await
    }

    /// Resumes `worker_name` and waits until it acknowledged. Not interrupted by shutdown.
    pub async fn resume_consumer(&self, worker_name: &str) -> SyncResult<()> {
        info!(worker_name, "resuming consumer");
        self.set_paused(worker_name, false, None).await
    }

    async fn set_paused(
        &self,
        worker_name: &str,
        paused: bool,
        shutdown_rx: Option<ShutdownRx>,
    ) -> SyncResult<()> {
        let queue_name = &self.settings.queue_name;
        self.admin
            .set_consumer_paused(queue_name, worker_name, paused)
            .await?;

        let admin = self.admin;
        let outcome = poll_until(self.settings.poll_interval, None, shutdown_rx, || async move {
            let uptodate = admin.consumer_uptodate(queue_name, worker_name).await?;
            if !uptodate {
                debug!(worker_name, paused, "waiting for consumer to acknowledge");
            }

            Ok(uptodate)
        })
        .await?;

        match outcome {
            PollOutcome::Ready | PollOutcome::Expired => Ok(()),
            PollOutcome::Shutdown => bail!(
                ErrorKind::Cancelled,
                "Run was cancelled while waiting for the consumer"
            ),
        }
    }
}
