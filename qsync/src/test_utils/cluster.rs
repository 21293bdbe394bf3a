//! In-memory replication cluster implementing every session interface.
//!
//! The cluster runs on the tokio clock, so tests using `start_paused = true` see polling
//! loops advance deterministically. It models a provider and a subscriber, a ticker that
//! cuts requested ticks after a short delay, a consumer replaying the provider's queue
//! with a configurable lag, the pause flag of the provider's upstream worker and the
//! physical tables of both sides.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::bail;
use crate::catalog::TableListEntry;
use crate::compare::{ComparisonResult, TableComparator};
use crate::context::SyncSettings;
use crate::error::{ErrorKind, SyncResult};
use crate::session::{DataSession, LockSession, QueueAdmin};
use crate::sync_error;
use crate::types::{ConsumerInfo, NodeInfo, NodeType, TableName, TickId};

pub const QUEUE_NAME: &str = "q1";
pub const CONSUMER_NAME: &str = "sync_q1";
pub const WORKER_NAME: &str = "branch_worker";
pub const PROVIDER_LOCATION: &str = "host=provider.local dbname=provdb";

/// Delay between a tick request and the ticker cutting the tick.
const TICK_DELAY: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Provider,
    Subscriber,
}

/// Something a session did to the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    TableLocked(TableName),
    TableUnlocked(TableName),
    LockRolledBack(TableName),
    /// A lock session was committed or rolled back while holding nothing.
    ReleaseWithoutLock,
    ConsumerPaused(String),
    ConsumerResumed(String),
    TickForced(TickId),
    ServerTimeRead(DateTime<Utc>),
    SnapshotOpened(Side),
    Compared(TableName),
}

/// How the consumer replays the provider's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerBehavior {
    /// Keeps replaying, `lag` behind the server clock.
    Replaying { lag: Duration },
    /// Stopped replaying when the cluster was created.
    Stalled,
    /// Registered but never finished a batch, so it reports neither lag nor last tick.
    Idle,
    /// Replays with `lag_before` until `recovers_after` has passed, then with `lag_after`.
    Recovering {
        lag_before: Duration,
        recovers_after: Duration,
        lag_after: Duration,
    },
}

#[derive(Debug, Default)]
struct SideState {
    catalog: Vec<TableListEntry>,
    contents: HashMap<TableName, Vec<String>>,
}

#[derive(Debug)]
struct Inner {
    epoch: DateTime<Utc>,
    started_at: Instant,
    provider_node: NodeInfo,
    subscriber_node: Option<NodeInfo>,
    ticker_alive: bool,
    ticker_lag: Duration,
    ticks: Vec<(TickId, DateTime<Utc>)>,
    tick_requested_at: Option<DateTime<Utc>>,
    consumer: Option<ConsumerBehavior>,
    paused_workers: HashSet<String>,
    pending_acks: usize,
    acks_per_change: usize,
    lock_error: Option<ErrorKind>,
    release_error: Option<ErrorKind>,
    snapshot_errors: HashMap<Side, ErrorKind>,
    consumer_after_unlock: Option<ConsumerBehavior>,
    held_lock: Option<TableName>,
    sides: HashMap<Side, SideState>,
    events: Vec<(DateTime<Utc>, ClusterEvent)>,
}

impl Inner {
    fn now(&self) -> DateTime<Utc> {
        self.epoch + to_delta(self.started_at.elapsed())
    }

    fn record(&mut self, event: ClusterEvent) {
        let now = self.now();
        self.events.push((now, event));
    }

    fn advance_ticker(&mut self) {
        if !self.ticker_alive {
            return;
        }

        let now = self.now();
        if let Some(requested_at) = self.tick_requested_at {
            let cut_at = requested_at + to_delta(TICK_DELAY);
            if cut_at <= now {
                let next_id = self.last_tick_id() + 1;
                self.ticks.push((next_id, cut_at));
                self.tick_requested_at = None;
            }
        }
    }

    fn last_tick_id(&self) -> TickId {
        self.ticks.last().map(|(id, _)| *id).unwrap_or_default()
    }

    fn consumer_position(
        &self,
        behavior: ConsumerBehavior,
        at: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let position = match behavior {
            ConsumerBehavior::Replaying { lag } => at - to_delta(lag),
            ConsumerBehavior::Stalled => self.epoch,
            ConsumerBehavior::Idle => return None,
            ConsumerBehavior::Recovering {
                lag_before,
                recovers_after,
                lag_after,
            } => {
                if at < self.epoch + to_delta(recovers_after) {
                    at - to_delta(lag_before)
                } else {
                    at - to_delta(lag_after)
                }
            }
        };

        Some(position)
    }

    fn last_tick_before(&self, position: DateTime<Utc>) -> Option<TickId> {
        self.ticks
            .iter()
            .filter(|(_, cut_at)| *cut_at <= position)
            .map(|(id, _)| *id)
            .max()
    }

    fn side(&mut self, side: Side) -> &mut SideState {
        self.sides.entry(side).or_default()
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// Shared handle on the simulated cluster.
#[derive(Debug, Clone)]
pub struct TestCluster {
    inner: Arc<Mutex<Inner>>,
}

impl TestCluster {
    /// Creates a cluster whose provider has the given position in the topology.
    ///
    /// The consumer replays with a lag of one second and the worker acknowledges pause
    /// changes on the second poll.
    pub fn new(provider_type: NodeType) -> Self {
        let epoch = DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default();
        let worker_name = (!provider_type.is_root()).then(|| WORKER_NAME.to_owned());
        let inner = Inner {
            epoch,
            started_at: Instant::now(),
            provider_node: NodeInfo {
                node_name: "provider".to_owned(),
                node_type: provider_type,
                worker_name,
                provider_location: None,
            },
            subscriber_node: Some(NodeInfo {
                node_name: "subscriber".to_owned(),
                node_type: NodeType::Leaf,
                worker_name: Some(CONSUMER_NAME.to_owned()),
                provider_location: Some(PROVIDER_LOCATION.to_owned()),
            }),
            ticker_alive: true,
            ticker_lag: Duration::from_secs(1),
            ticks: vec![(1, epoch - TimeDelta::seconds(1))],
            tick_requested_at: None,
            consumer: Some(ConsumerBehavior::Replaying {
                lag: Duration::from_secs(1),
            }),
            paused_workers: HashSet::new(),
            pending_acks: 0,
            acks_per_change: 1,
            lock_error: None,
            release_error: None,
            snapshot_errors: HashMap::new(),
            consumer_after_unlock: None,
            held_lock: None,
            sides: HashMap::new(),
            events: Vec::new(),
        };

        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Settings matching the cluster's queue and consumer.
    pub fn settings(&self) -> SyncSettings {
        SyncSettings::new(QUEUE_NAME.to_owned(), CONSUMER_NAME.to_owned())
    }

    /// Registers `name` in the catalog of `side` and creates it with `rows`.
    pub async fn add_table(&self, side: Side, name: &str, merge_state: Option<&str>, rows: &[&str]) {
        let mut inner = self.inner.lock().await;
        let state = inner.side(side);
        state.catalog.push(TableListEntry {
            table_name: name.to_owned(),
            merge_state: merge_state.map(str::to_owned),
            dest_table: None,
            table_attrs: None,
        });
        state.contents.insert(
            TableName::parse(name),
            rows.iter().map(|row| (*row).to_owned()).collect(),
        );
    }

    /// Adds `name` with identical rows and merge state `ok` on both sides.
    pub async fn add_replicated_table(&self, name: &str, rows: &[&str]) {
        self.add_table(Side::Provider, name, Some("ok"), rows).await;
        self.add_table(Side::Subscriber, name, Some("ok"), rows).await;
    }

    /// Removes the physical table while keeping its catalog entry.
    pub async fn drop_physical_table(&self, side: Side, name: &str) {
        let mut inner = self.inner.lock().await;
        inner.side(side).contents.remove(&TableName::parse(name));
    }

    pub async fn set_consumer(&self, behavior: ConsumerBehavior) {
        self.inner.lock().await.consumer = Some(behavior);
    }

    pub async fn unregister_consumer(&self) {
        self.inner.lock().await.consumer = None;
    }

    pub async fn stop_ticker(&self) {
        self.inner.lock().await.ticker_alive = false;
    }

    /// Makes every lock request fail with `kind`.
    pub async fn fail_locks(&self, kind: ErrorKind) {
        self.inner.lock().await.lock_error = Some(kind);
    }

    /// Makes committing or rolling back a lock and resuming a worker fail with `kind`.
    ///
    /// A failed release records no event and leaves the lock or pause in place.
    pub async fn fail_releases(&self, kind: ErrorKind) {
        self.inner.lock().await.release_error = Some(kind);
    }

    /// Makes opening a snapshot on `side` fail with `kind`.
    pub async fn fail_snapshots(&self, side: Side, kind: ErrorKind) {
        self.inner.lock().await.snapshot_errors.insert(side, kind);
    }

    /// Switches the consumer to `behavior` once the next table lock is committed.
    pub async fn set_consumer_after_unlock(&self, behavior: ConsumerBehavior) {
        self.inner.lock().await.consumer_after_unlock = Some(behavior);
    }

    pub async fn set_subscriber_node(&self, node: Option<NodeInfo>) {
        self.inner.lock().await.subscriber_node = node;
    }

    pub async fn events(&self) -> Vec<ClusterEvent> {
        let inner = self.inner.lock().await;
        inner.events.iter().map(|(_, event)| event.clone()).collect()
    }

    pub async fn timed_events(&self) -> Vec<(DateTime<Utc>, ClusterEvent)> {
        self.inner.lock().await.events.clone()
    }

    /// Returns how many recorded events match `predicate`.
    pub async fn count_events(&self, predicate: impl Fn(&ClusterEvent) -> bool) -> usize {
        let inner = self.inner.lock().await;
        inner.events.iter().filter(|(_, event)| predicate(event)).count()
    }

    /// Returns the last tick the consumer had finished at `at`.
    pub async fn consumer_last_tick_at(&self, at: DateTime<Utc>) -> Option<TickId> {
        let inner = self.inner.lock().await;
        let behavior = inner.consumer?;
        let position = inner.consumer_position(behavior, at)?;
        inner.last_tick_before(position)
    }

    pub async fn is_paused(&self, worker_name: &str) -> bool {
        self.inner.lock().await.paused_workers.contains(worker_name)
    }

    pub fn provider_admin(&self) -> TestAdmin {
        TestAdmin {
            cluster: self.clone(),
            side: Side::Provider,
        }
    }

    pub fn subscriber_admin(&self) -> TestAdmin {
        TestAdmin {
            cluster: self.clone(),
            side: Side::Subscriber,
        }
    }

    pub fn lock_session(&self) -> TestLockSession {
        TestLockSession {
            cluster: self.clone(),
        }
    }

    pub fn provider_session(&self) -> TestDataSession {
        TestDataSession {
            cluster: self.clone(),
            side: Side::Provider,
        }
    }

    pub fn subscriber_session(&self) -> TestDataSession {
        TestDataSession {
            cluster: self.clone(),
            side: Side::Subscriber,
        }
    }
}

/// Administrative session on one side of a [`TestCluster`].
#[derive(Debug, Clone)]
pub struct TestAdmin {
    cluster: TestCluster,
    side: Side,
}

impl QueueAdmin for TestAdmin {
    async fn node_info(&self, queue_name: &str) -> SyncResult<Option<NodeInfo>> {
        let inner = self.cluster.inner.lock().await;
        if queue_name != QUEUE_NAME {
            return Ok(None);
        }

        match self.side {
            Side::Provider => Ok(Some(inner.provider_node.clone())),
            Side::Subscriber => Ok(inner.subscriber_node.clone()),
        }
    }

    async fn consumer_info(
        &self,
        _queue_name: &str,
        consumer_name: &str,
    ) -> SyncResult<Option<ConsumerInfo>> {
        let mut inner = self.cluster.inner.lock().await;
        inner.advance_ticker();

        let Some(behavior) = inner.consumer else {
            return Ok(None);
        };
        if consumer_name != CONSUMER_NAME {
            return Ok(None);
        }

        let now = inner.now();
        let position = inner.consumer_position(behavior, now);

        Ok(Some(ConsumerInfo {
            ticker_lag: inner.ticker_lag,
            consumer_lag: position.map(|position| (now - position).to_std().unwrap_or_default()),
            last_tick: position.and_then(|position| inner.last_tick_before(position)),
            observed_at: now,
        }))
    }

    async fn ticker_lag(&self, _queue_name: &str) -> SyncResult<Duration> {
        Ok(self.cluster.inner.lock().await.ticker_lag)
    }

    async fn force_tick(&self, _queue_name: &str) -> SyncResult<TickId> {
        let mut inner = self.cluster.inner.lock().await;
        inner.advance_ticker();

        let tick_id = inner.last_tick_id();
        if inner.tick_requested_at.is_none() {
            inner.tick_requested_at = Some(inner.now());
        }
        inner.record(ClusterEvent::TickForced(tick_id));

        Ok(tick_id)
    }

    async fn server_time(&self) -> SyncResult<DateTime<Utc>> {
        let mut inner = self.cluster.inner.lock().await;
        let now = inner.now();
        inner.record(ClusterEvent::ServerTimeRead(now));

        Ok(now)
    }

    async fn set_consumer_paused(
        &self,
        _queue_name: &str,
        consumer_name: &str,
        paused: bool,
    ) -> SyncResult<()> {
        let mut inner = self.cluster.inner.lock().await;
        if !paused && let Some(kind) = inner.release_error {
            bail!(kind, "Resuming the worker failed", format!("worker {consumer_name}"));
        }

        if paused {
            inner.paused_workers.insert(consumer_name.to_owned());
            inner.record(ClusterEvent::ConsumerPaused(consumer_name.to_owned()));
        } else {
            inner.paused_workers.remove(consumer_name);
            inner.record(ClusterEvent::ConsumerResumed(consumer_name.to_owned()));
        }
        inner.pending_acks = inner.acks_per_change;

        Ok(())
    }

    async fn consumer_uptodate(&self, _queue_name: &str, _consumer_name: &str) -> SyncResult<bool> {
        let mut inner = self.cluster.inner.lock().await;
        if inner.pending_acks > 0 {
            inner.pending_acks -= 1;
            return Ok(false);
        }

        Ok(true)
    }
}

/// Lock session on the provider of a [`TestCluster`].
#[derive(Debug, Clone)]
pub struct TestLockSession {
    cluster: TestCluster,
}

impl LockSession for TestLockSession {
    async fn lock_table(&self, table: &TableName, _statement_timeout: Duration) -> SyncResult<()> {
        let mut inner = self.cluster.inner.lock().await;
        if let Some(kind) = inner.lock_error {
            bail!(kind, "Lock request failed", format!("table {table}"));
        }
        if let Some(held) = &inner.held_lock {
            bail!(
                ErrorKind::InvalidState,
                "Lock session already holds a lock",
                format!("table {held}")
            );
        }

        inner.held_lock = Some(table.clone());
        inner.record(ClusterEvent::TableLocked(table.clone()));

        Ok(())
    }

    async fn unlock(&self) -> SyncResult<()> {
        let mut inner = self.cluster.inner.lock().await;
        if let Some(kind) = inner.release_error {
            bail!(kind, "Commit of the lock session failed");
        }

        match inner.held_lock.take() {
            Some(table) => inner.record(ClusterEvent::TableUnlocked(table)),
            None => inner.record(ClusterEvent::ReleaseWithoutLock),
        }
        if let Some(behavior) = inner.consumer_after_unlock.take() {
            inner.consumer = Some(behavior);
        }

        Ok(())
    }

    async fn abort(&self) -> SyncResult<()> {
        let mut inner = self.cluster.inner.lock().await;
        if let Some(kind) = inner.release_error {
            bail!(kind, "Rollback of the lock session failed");
        }

        match inner.held_lock.take() {
            Some(table) => inner.record(ClusterEvent::LockRolledBack(table)),
            None => inner.record(ClusterEvent::ReleaseWithoutLock),
        }

        Ok(())
    }
}

/// Data session on one side of a [`TestCluster`].
#[derive(Debug, Clone)]
pub struct TestDataSession {
    cluster: TestCluster,
    side: Side,
}

impl TestDataSession {
    /// Returns the rows of `table`, sorted.
    pub async fn rows(&self, table: &TableName) -> SyncResult<Vec<String>> {
        let mut inner = self.cluster.inner.lock().await;
        let mut rows = inner
            .side(self.side)
            .contents
            .get(table)
            .cloned()
            .ok_or_else(|| {
                sync_error!(
                    ErrorKind::QueryFailed,
                    "Table does not exist",
                    format!("table {table}")
                )
            })?;
        rows.sort();

        Ok(rows)
    }
}

impl DataSession for TestDataSession {
    async fn table_list(&self, _queue_name: &str) -> SyncResult<Vec<TableListEntry>> {
        let mut inner = self.cluster.inner.lock().await;
        Ok(inner.side(self.side).catalog.clone())
    }

    async fn table_exists(&self, table: &TableName) -> SyncResult<bool> {
        let mut inner = self.cluster.inner.lock().await;
        Ok(inner.side(self.side).contents.contains_key(table))
    }

    async fn begin_snapshot(&self) -> SyncResult<()> {
        let mut inner = self.cluster.inner.lock().await;
        if let Some(kind) = inner.snapshot_errors.get(&self.side) {
            bail!(*kind, "Opening the snapshot failed", format!("{:?} side", self.side));
        }

        inner.record(ClusterEvent::SnapshotOpened(self.side));

        Ok(())
    }

    async fn commit(&self) -> SyncResult<()> {
        Ok(())
    }
}

/// Compares the sorted rows of both sides.
#[derive(Debug, Clone, Copy, Default)]
pub struct RowComparator;

impl TableComparator<TestDataSession> for RowComparator {
    async fn compare(
        &self,
        provider: &TestDataSession,
        subscriber: &TestDataSession,
        provider_table: &TableName,
        subscriber_table: &TableName,
    ) -> SyncResult<ComparisonResult> {
        let provider_rows = provider.rows(provider_table).await?;
        let subscriber_rows = subscriber.rows(subscriber_table).await?;

        subscriber
            .cluster
            .inner
            .lock()
            .await
            .record(ClusterEvent::Compared(subscriber_table.clone()));

        if provider_rows == subscriber_rows {
            Ok(ComparisonResult::Match)
        } else {
            Ok(ComparisonResult::Mismatch)
        }
    }
}
