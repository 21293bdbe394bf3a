use std::fmt;
use tracing::{debug, info, warn};

use crate::compare::TableComparator;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::queue::QueueControl;
use crate::session::{DataSession, LockSession, QueueAdmin};
use crate::sync::method::SyncMethod;
use crate::sync::outcome::{SkipReason, SyncOutcome};
use crate::types::TableName;

/// Progress of a single table through the synchronization protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TablePhase {
    /// Set when the table starts, before anything is taken.
    CheckingExistence,

    /// Set just before the table is locked or the upstream worker is paused.
    Locking,

    /// Set once changes are stopped, while waiting for the consumer to replay every
    /// change made before that point.
    WaitingForReplay,

    /// Set when both data sessions open their snapshots.
    Snapshotting,

    /// Set when the lock or pause is released.
    Unlocking,

    /// Set while the comparator runs on the frozen snapshots.
    Comparing,

    /// Set once the comparison finished and both sessions were committed.
    Done,

    /// Set when the physical table is missing on either side.
    Skipped,

    /// Set when the consumer did not catch up in time. Ends the run.
    AbortedTimeout,
}

impl fmt::Display for TablePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Logs the phase transitions of one table.
#[derive(Debug)]
pub struct TablePhaseTracker {
    table: TableName,
    phase: TablePhase,
}

impl TablePhaseTracker {
    pub fn new(table: TableName) -> Self {
        debug!(table = %table, phase = %TablePhase::CheckingExistence, "table phase set");

        Self {
            table,
            phase: TablePhase::CheckingExistence,
        }
    }

    pub fn set(&mut self, phase: TablePhase) {
        debug!(
            table = %self.table,
            from = %self.phase,
            to = %phase,
            "table phase changed"
        );
        self.phase = phase;
    }

    pub fn phase(&self) -> TablePhase {
        self.phase
    }
}

/// Runs the synchronization protocol for one table at a time.
#[derive(Debug)]
pub struct SyncCoordinator<'a, L, D, A, C> {
    lock_session: &'a L,
    provider: &'a D,
    subscriber: &'a D,
    queue: &'a QueueControl<'a, A>,
    method: &'a SyncMethod,
    comparator: &'a C,
}

impl<'a, L, D, A, C> SyncCoordinator<'a, L, D, A, C>
where
    L: LockSession,
    D: DataSession,
    A: QueueAdmin,
    C: TableComparator<D>,
{
    pub fn new(
        lock_session: &'a L,
        provider: &'a D,
        subscriber: &'a D,
        queue: &'a QueueControl<'a, A>,
        method: &'a SyncMethod,
        comparator: &'a C,
    ) -> Self {
        Self {
            lock_session,
            provider,
            subscriber,
            queue,
            method,
            comparator,
        }
    }

    /// Brings `provider_table` and `subscriber_table` to equivalent snapshots and
    /// compares them.
    ///
    /// Missing physical tables are skipped without taking anything. Any lock or pause
    /// taken is released before this returns, whether it succeeds or fails.
    pub async fn sync_table(
        &self,
        provider_table: &TableName,
        subscriber_table: &TableName,
    ) -> SyncResult<SyncOutcome> {
        let mut phase = TablePhaseTracker::new(subscriber_table.clone());

        if !self.provider.table_exists(provider_table).await? {
            warn!(table = %provider_table, "table does not exist on provider, skipping");
            phase.set(TablePhase::Skipped);
            return Ok(SyncOutcome::Skipped(SkipReason::MissingOnProvider));
        }
        if !self.subscriber.table_exists(subscriber_table).await? {
            warn!(table = %subscriber_table, "table does not exist on subscriber, skipping");
            phase.set(TablePhase::Skipped);
            return Ok(SyncOutcome::Skipped(SkipReason::MissingOnSubscriber));
        }

        phase.set(TablePhase::Locking);
        let hold = match self
            .method
            .acquire(self.lock_session, self.queue, provider_table, &mut phase)
            .await
        {
            Ok(hold) => hold,
            Err(err) => {
                if err.kind() == ErrorKind::LockTimeout {
                    phase.set(TablePhase::AbortedTimeout);
                }
                return Err(err);
            }
        };

        phase.set(TablePhase::Snapshotting);
        let snapshot_result = self.open_snapshots().await;

        phase.set(TablePhase::Unlocking);
        let release_result = hold.release().await;

        match (snapshot_result, release_result) {
            (Ok(()), Ok(())) => {}
            (Err(err), Ok(())) | (Ok(()), Err(err)) => return Err(err),
            (Err(snapshot_err), Err(release_err)) => {
                return Err(SyncError::many(vec![snapshot_err, release_err]));
            }
        }

        phase.set(TablePhase::Comparing);
        let result = self
            .comparator
            .compare(self.provider, self.subscriber, provider_table, subscriber_table)
            .await?;

        self.provider.commit().await?;
        self.subscriber.commit().await?;

        phase.set(TablePhase::Done);
        info!(table = %subscriber_table, ?result, "table compared");

        Ok(SyncOutcome::Compared(result))
    }

    async fn open_snapshots(&self) -> SyncResult<()> {
        self.provider.begin_snapshot().await?;
        self.subscriber.begin_snapshot().await?;

        Ok(())
    }
}
