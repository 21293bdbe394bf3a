//! Narrow interfaces over the database sessions a run uses.
//!
//! A run holds four sessions: one for table locks on the provider, one read session per
//! side, and one autocommit administrative session on the provider for queue inspection.
//! The subscriber is only inspected once, to find the provider. The traits below are
//! everything the synchronization logic needs from them, which keeps the logic testable
//! against a simulated cluster.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;

use crate::catalog::TableListEntry;
use crate::error::SyncResult;
use crate::types::{ConsumerInfo, NodeInfo, TableName, TickId};

/// Administrative access to the queue functions of a node.
pub trait QueueAdmin {
    /// Returns the node metadata for `queue_name`, or `None` if the node does not take
    /// part in that queue.
    fn node_info(
        &self,
        queue_name: &str,
    ) -> impl Future<Output = SyncResult<Option<NodeInfo>>> + Send;

    /// Returns the progress of `consumer_name` on `queue_name`, or `None` if no such
    /// consumer is registered.
    fn consumer_info(
        &self,
        queue_name: &str,
        consumer_name: &str,
    ) -> impl Future<Output = SyncResult<Option<ConsumerInfo>>> + Send;

    /// Returns the age of the newest tick of `queue_name`.
    fn ticker_lag(&self, queue_name: &str) -> impl Future<Output = SyncResult<Duration>> + Send;

    /// Asks the ticker for a new tick and returns the id of the latest tick already cut.
    fn force_tick(&self, queue_name: &str) -> impl Future<Output = SyncResult<TickId>> + Send;

    /// Returns the clock of the server.
    fn server_time(&self) -> impl Future<Output = SyncResult<DateTime<Utc>>> + Send;

    /// Sets or clears the pause flag of `consumer_name`.
    fn set_consumer_paused(
        &self,
        queue_name: &str,
        consumer_name: &str,
        paused: bool,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Returns `true` once `consumer_name` has acknowledged its current pause flag.
    fn consumer_uptodate(
        &self,
        queue_name: &str,
        consumer_name: &str,
    ) -> impl Future<Output = SyncResult<bool>> + Send;
}

/// Read access to the replicated tables of one side.
pub trait DataSession {
    /// Returns the replication catalog entries of `queue_name`.
    fn table_list(
        &self,
        queue_name: &str,
    ) -> impl Future<Output = SyncResult<Vec<TableListEntry>>> + Send;

    /// Returns `true` if `table` physically exists.
    fn table_exists(&self, table: &TableName) -> impl Future<Output = SyncResult<bool>> + Send;

    /// Ends any open transaction and starts one that reads a single consistent snapshot.
    fn begin_snapshot(&self) -> impl Future<Output = SyncResult<()>> + Send;

    /// Ends the open transaction.
    fn commit(&self) -> impl Future<Output = SyncResult<()>> + Send;
}

/// Session dedicated to holding table locks on a root provider.
pub trait LockSession {
    /// Opens a transaction and takes a lock that blocks writers of `table`.
    ///
    /// A non-zero `statement_timeout` bounds how long the lock request may wait. On
    /// failure the transaction is rolled back before returning.
    fn lock_table(
        &self,
        table: &TableName,
        statement_timeout: Duration,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Releases the lock by committing.
    fn unlock(&self) -> impl Future<Output = SyncResult<()>> + Send;

    /// Releases the lock by rolling back.
    fn abort(&self) -> impl Future<Output = SyncResult<()>> + Send;
}
