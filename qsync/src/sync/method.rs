use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::bail;
use crate::concurrency::poll::{Deadline, PollOutcome, poll_until};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::queue::QueueControl;
use crate::session::{LockSession, QueueAdmin};
use crate::sync::coordinator::{TablePhase, TablePhaseTracker};
use crate::types::{ConsumerInfo, NodeInfo, NodeType, TableName, TickId};

/// How changes to a table are stopped while the consumer catches up.
///
/// Chosen once per run from the provider's position in the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMethod {
    /// The provider originates changes: lock the table against writers.
    Root,
    /// The provider only relays changes: pause the worker feeding it.
    Branch { worker_name: String },
}

impl SyncMethod {
    pub fn for_provider(node: &NodeInfo) -> SyncResult<SyncMethod> {
        match node.node_type {
            NodeType::Root => Ok(SyncMethod::Root),
            NodeType::Branch | NodeType::Leaf => match &node.worker_name {
                Some(worker_name) => Ok(SyncMethod::Branch {
                    worker_name: worker_name.clone(),
                }),
                None => bail!(
                    ErrorKind::InvalidData,
                    "Relaying provider has no worker",
                    format!(
                        "{} node '{}' reports no worker name",
                        node.node_type, node.node_name
                    )
                ),
            },
        }
    }

    /// Stops changes to `table` on the provider and waits until the consumer replayed
    /// everything written before.
    ///
    /// On success the returned hold must be released. On failure nothing is held
    /// anymore: whatever was acquired has been released before the error is returned.
    pub async fn acquire<'a, L, A>(
        &self,
        lock_session: &'a L,
        queue: &'a QueueControl<'a, A>,
        table: &TableName,
        phase: &mut TablePhaseTracker,
    ) -> SyncResult<SyncHold<'a, L, A>>
    where
        L: LockSession,
        A: QueueAdmin,
    {
        match self {
            SyncMethod::Root => {
                let lock_timeout = queue.settings().lock_timeout;
                info!(table = %table, "locking table");
                lock_session.lock_table(table, lock_timeout).await?;

                let hold = SyncHold {
                    kind: HoldKind::TableLock {
                        table: table.clone(),
                    },
                    lock_session,
                    queue,
                };
                let locked_at = Instant::now();

                phase.set(TablePhase::WaitingForReplay);
                match wait_for_lock_replay(queue, table, locked_at).await {
                    Ok(()) => Ok(hold),
                    Err(err) => Err(hold.abandon(err).await),
                }
            }
            SyncMethod::Branch { worker_name } => {
                let started_at = Instant::now();
                let hold = SyncHold {
                    kind: HoldKind::RelayPause {
                        worker_name: worker_name.clone(),
                    },
                    lock_session,
                    queue,
                };

                if let Err(err) = queue.pause_consumer(worker_name).await {
                    return Err(hold.abandon(err).await);
                }

                phase.set(TablePhase::WaitingForReplay);
                match wait_for_relay_replay(queue, table, started_at).await {
                    Ok(()) => Ok(hold),
                    Err(err) => Err(hold.abandon(err).await),
                }
            }
        }
    }
}

async fn wait_for_lock_replay<A: QueueAdmin>(
    queue: &QueueControl<'_, A>,
    table: &TableName,
    locked_at: Instant,
) -> SyncResult<()> {
    // Two ticks make sure the last transaction before the lock is inside a closed batch.
    queue.force_tick(true).await?;
    queue.force_tick(true).await?;

    let sync_time = queue.server_time().await?;
    info!(table = %table, %sync_time, "waiting for consumer to replay past lock");

    let outcome = wait_for_consumer(queue, locked_at, |info| {
        debug!(table = %table, position = ?info.position(), "consumer position");
        info.has_replayed_past(sync_time)
    })
    .await?;

    check_wait_outcome(outcome, table, sync_time, None)
}

async fn wait_for_relay_replay<A: QueueAdmin>(
    queue: &QueueControl<'_, A>,
    table: &TableName,
    started_at: Instant,
) -> SyncResult<()> {
    let tick_id = queue.force_tick(false).await?;
    let sync_time = queue.server_time().await?;
    info!(table = %table, tick_id, %sync_time, "waiting for consumer to reach tick");

    let outcome = wait_for_consumer(queue, started_at, |info| {
        debug!(table = %table, last_tick = ?info.last_tick, "consumer tick");
        info.has_reached_tick(tick_id)
    })
    .await?;

    check_wait_outcome(outcome, table, sync_time, Some(tick_id))
}

async fn wait_for_consumer<A, F>(
    queue: &QueueControl<'_, A>,
    held_since: Instant,
    caught_up: F,
) -> SyncResult<PollOutcome>
where
    A: QueueAdmin,
    F: Fn(&ConsumerInfo) -> bool,
{
    let settings = queue.settings();
    let deadline = Deadline::overridable(held_since, settings.lock_timeout, settings.force);
    let caught_up = &caught_up;

    poll_until(
        settings.poll_interval,
        Some(deadline),
        Some(queue.shutdown_rx()),
        || async move {
            let info = queue.consumer_info().await?;
            Ok(caught_up(&info))
        },
    )
    .await
}

fn check_wait_outcome(
    outcome: PollOutcome,
    table: &TableName,
    sync_time: DateTime<Utc>,
    tick_id: Option<TickId>,
) -> SyncResult<()> {
    match outcome {
        PollOutcome::Ready => Ok(()),
        PollOutcome::Expired => {
            error!(
                table = %table,
                %sync_time,
                tick_id,
                "consumer lagging too much, giving up"
            );
            bail!(
                ErrorKind::LockTimeout,
                "Consumer did not catch up while the table was held",
                format!("table {table}")
            )
        }
        PollOutcome::Shutdown => bail!(
            ErrorKind::Cancelled,
            "Run was cancelled while waiting for the consumer"
        ),
    }
}

#[derive(Debug)]
enum HoldKind {
    TableLock { table: TableName },
    RelayPause { worker_name: String },
}

/// A table lock or relay pause in effect.
///
/// Releasing consumes the hold, so it can only happen once.
#[must_use = "a held lock or pause must be released"]
#[derive(Debug)]
pub struct SyncHold<'a, L, A> {
    kind: HoldKind,
    lock_session: &'a L,
    queue: &'a QueueControl<'a, A>,
}

impl<L, A> SyncHold<'_, L, A>
where
    L: LockSession,
    A: QueueAdmin,
{
    /// Lets changes flow again.
    pub async fn release(self) -> SyncResult<()> {
        match &self.kind {
            HoldKind::TableLock { table } => {
                info!(table = %table, "unlocking table");
                self.lock_session.unlock().await
            }
            HoldKind::RelayPause { worker_name } => {
                self.queue.resume_consumer(worker_name).await
            }
        }
    }

    /// Releases after `err` happened while holding and returns the error to propagate.
    ///
    /// A table lock is rolled back instead of committed.
    pub async fn abandon(self, err: SyncError) -> SyncError {
        let released = match &self.kind {
            HoldKind::TableLock { table } => {
                info!(table = %table, "rolling back table lock");
                self.lock_session.abort().await
            }
            HoldKind::RelayPause { worker_name } => {
                self.queue.resume_consumer(worker_name).await
            }
        };

        match released {
            Ok(()) => err,
            Err(release_err) => {
                error!(error = %release_err, "release failed after an earlier error");
                SyncError::many(vec![err, release_err])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(node_type: NodeType, worker_name: Option<&str>) -> NodeInfo {
        NodeInfo {
            node_name: "n1".to_owned(),
            node_type,
            worker_name: worker_name.map(str::to_owned),
            provider_location: None,
        }
    }

    #[test]
    fn test_method_follows_topology() {
        assert_eq!(
            SyncMethod::for_provider(&node(NodeType::Root, None)).unwrap(),
            SyncMethod::Root
        );
        assert_eq!(
            SyncMethod::for_provider(&node(NodeType::Branch, Some("w1"))).unwrap(),
            SyncMethod::Branch {
                worker_name: "w1".to_owned()
            }
        );
        assert_eq!(
            SyncMethod::for_provider(&node(NodeType::Leaf, Some("w2"))).unwrap(),
            SyncMethod::Branch {
                worker_name: "w2".to_owned()
            }
        );
    }

    #[test]
    fn test_branch_without_worker_is_invalid() {
        let err = SyncMethod::for_provider(&node(NodeType::Branch, None)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
