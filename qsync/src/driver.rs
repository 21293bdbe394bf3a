use tracing::{info, warn};

use crate::bail;
use crate::catalog::{ReplicatedTable, TableCatalog};
use crate::compare::TableComparator;
use crate::context::SyncContext;
use crate::error::{ErrorKind, SyncResult};
use crate::health::ensure_consumer_healthy;
use crate::queue::QueueControl;
use crate::session::{DataSession, LockSession, QueueAdmin};
use crate::sync::{RunReport, SkipReason, SyncCoordinator, SyncMethod, SyncOutcome};
use crate::sync_error;
use crate::types::TableName;

/// Reads where the provider of `queue_name` lives from the subscriber's node metadata.
pub async fn resolve_provider_location<A: QueueAdmin>(
    subscriber_admin: &A,
    queue_name: &str,
) -> SyncResult<String> {
    let Some(node) = subscriber_admin.node_info(queue_name).await? else {
        bail!(
            ErrorKind::NodeNotFound,
            "Subscriber is not part of the queue",
            format!("queue '{queue_name}' has no node on the subscriber")
        );
    };

    node.provider_location.ok_or_else(|| {
        sync_error!(
            ErrorKind::NodeNotFound,
            "Subscriber has no provider",
            format!(
                "{} node '{}' has no provider location for queue '{queue_name}'",
                node.node_type, node.node_name
            )
        )
    })
}

/// Sessions a run works with.
///
/// `lock`, `provider` and `admin` are connected to the provider, `subscriber` to the
/// subscriber.
#[derive(Debug)]
pub struct SyncSessions<'a, L, D, A> {
    pub lock: &'a L,
    pub provider: &'a D,
    pub subscriber: &'a D,
    pub admin: &'a A,
}

/// Checks the requested tables one after the other.
#[derive(Debug)]
pub struct Driver<'a, L, D, A, C> {
    sessions: SyncSessions<'a, L, D, A>,
    comparator: &'a C,
}

impl<'a, L, D, A, C> Driver<'a, L, D, A, C>
where
    L: LockSession,
    D: DataSession,
    A: QueueAdmin,
    C: TableComparator<D>,
{
    pub fn new(sessions: SyncSessions<'a, L, D, A>, comparator: &'a C) -> Self {
        Self {
            sessions,
            comparator,
        }
    }

    /// Checks `requested` tables, or every table of the subscriber if none are given.
    ///
    /// Tables that are not replicated and fully synced on both sides are skipped with a
    /// warning. Any error ends the run, after releasing what the current table held.
    pub async fn run(&self, ctx: &mut SyncContext, requested: &[String]) -> SyncResult<RunReport> {
        let settings = ctx.settings().clone();
        let queue = QueueControl::new(self.sessions.admin, &settings, ctx.shutdown_rx());

        let provider_node = queue.node_info().await?;
        info!(
            node_name = %provider_node.node_name,
            node_type = %provider_node.node_type,
            "provider node"
        );
        let method = SyncMethod::for_provider(&provider_node)?;
        ctx.set_provider_node(provider_node);

        let provider_catalog = TableCatalog::load(self.sessions.provider, &settings.queue_name).await?;
        let subscriber_catalog =
            TableCatalog::load(self.sessions.subscriber, &settings.queue_name).await?;

        let worklist: Vec<TableName> = if requested.is_empty() {
            subscriber_catalog.names().to_vec()
        } else {
            requested.iter().map(|name| TableName::parse(name)).collect()
        };
        info!(tables = worklist.len(), "starting consistency check");

        let coordinator = SyncCoordinator::new(
            self.sessions.lock,
            self.sessions.provider,
            self.sessions.subscriber,
            &queue,
            &method,
            self.comparator,
        );

        for table in worklist {
            if ctx.is_shutdown_requested() {
                bail!(
                    ErrorKind::Cancelled,
                    "Run was cancelled",
                    format!("stopped before table {table}")
                );
            }

            let (provider_table, subscriber_table) =
                match select_tables(&table, &provider_catalog, &subscriber_catalog) {
                    Ok(tables) => tables,
                    Err(reason) => {
                        warn!(table = %table, %reason, "skipping table");
                        ctx.record(table, SyncOutcome::Skipped(reason));
                        continue;
                    }
                };

            ensure_consumer_healthy(&queue).await?;

            match coordinator
                .sync_table(&provider_table.dest_table, &subscriber_table.dest_table)
                .await
            {
                Ok(outcome) => ctx.record(table, outcome),
                Err(err) => {
                    if err.kind() == ErrorKind::LockTimeout {
                        ctx.record(table, SyncOutcome::AbortedTimeout);
                    }
                    return Err(err);
                }
            }
        }

        let report = ctx.report();
        info!(
            tables = report.outcomes().len(),
            bad_tables = report.bad_tables(),
            "consistency check finished"
        );

        Ok(report)
    }
}

/// Returns the provider and subscriber entries of `table` if it can be compared.
fn select_tables<'c>(
    table: &TableName,
    provider_catalog: &'c TableCatalog,
    subscriber_catalog: &'c TableCatalog,
) -> Result<(&'c ReplicatedTable, &'c ReplicatedTable), SkipReason> {
    let subscriber_table = subscriber_catalog
        .get(table)
        .ok_or(SkipReason::NotSubscribed)?;
    let provider_table = provider_catalog
        .get(table)
        .ok_or(SkipReason::NotOnProvider)?;

    if !provider_table.merge_state.is_ok() {
        return Err(SkipReason::NotReadyOnProvider);
    }
    if !subscriber_table.merge_state.is_ok() {
        return Err(SkipReason::NotSyncedOnSubscriber);
    }

    Ok((provider_table, subscriber_table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::ComparisonResult;
    use crate::concurrency::shutdown::create_shutdown_channel;
    use crate::test_utils::cluster::{
        ClusterEvent, ConsumerBehavior, PROVIDER_LOCATION, RowComparator, Side, TestCluster,
        WORKER_NAME,
    };
    use crate::types::{NodeInfo, NodeType};
    use chrono::TimeDelta;
    use qsync_telemetry::init_test_tracing;
    use std::time::Duration;

    async fn run(cluster: &TestCluster, requested: &[&str]) -> (SyncResult<RunReport>, SyncContext) {
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let mut ctx = SyncContext::new(cluster.settings(), shutdown_rx);
        let result = run_with(cluster, &mut ctx, requested).await;

        (result, ctx)
    }

    async fn run_with(
        cluster: &TestCluster,
        ctx: &mut SyncContext,
        requested: &[&str],
    ) -> SyncResult<RunReport> {
        init_test_tracing();

        let lock = cluster.lock_session();
        let provider = cluster.provider_session();
        let subscriber = cluster.subscriber_session();
        let admin = cluster.provider_admin();
        let sessions = SyncSessions {
            lock: &lock,
            provider: &provider,
            subscriber: &subscriber,
            admin: &admin,
        };
        let requested: Vec<String> = requested.iter().map(|name| (*name).to_owned()).collect();

        Driver::new(sessions, &RowComparator).run(ctx, &requested).await
    }

    async fn q1_cluster(node_type: NodeType) -> TestCluster {
        let cluster = TestCluster::new(node_type);
        cluster.add_replicated_table("public.a", &["1", "2", "3"]).await;
        cluster
            .add_table(Side::Provider, "public.b", Some("ok"), &["1", "2"])
            .await;
        cluster
            .add_table(Side::Subscriber, "public.b", Some("ok"), &["1", "3"])
            .await;
        cluster
    }

    fn lock_count(events: &[ClusterEvent], table: &str) -> (usize, usize) {
        let table = TableName::parse(table);
        let locked = events
            .iter()
            .filter(|event| **event == ClusterEvent::TableLocked(table.clone()))
            .count();
        let unlocked = events
            .iter()
            .filter(|event| **event == ClusterEvent::TableUnlocked(table.clone()))
            .count();

        (locked, unlocked)
    }

    #[tokio::test(start_paused = true)]
    async fn test_matching_table_exits_zero() {
        let cluster = q1_cluster(NodeType::Root).await;

        let (result, ctx) = run(&cluster, &["a"]).await;
        let report = result.unwrap();

        assert_eq!(report.exit_code(), 0);
        assert_eq!(
            report.outcome(&TableName::parse("a")),
            Some(SyncOutcome::Compared(ComparisonResult::Match))
        );
        assert_eq!(ctx.provider_node().unwrap().node_type, NodeType::Root);
        assert_eq!(lock_count(&cluster.events().await, "a"), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatching_table_exits_one() {
        let cluster = q1_cluster(NodeType::Root).await;

        let (result, _) = run(&cluster, &["b"]).await;
        let report = result.unwrap();

        assert_eq!(report.exit_code(), 1);
        assert_eq!(
            report.outcome(&TableName::parse("b")),
            Some(SyncOutcome::Compared(ComparisonResult::Mismatch))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_tables_are_processed_in_list_order() {
        let cluster = q1_cluster(NodeType::Root).await;

        let (result, _) = run(&cluster, &["a", "b"]).await;
        let report = result.unwrap();

        assert_eq!(report.exit_code(), 1);
        assert_eq!(
            report.outcomes(),
            &[
                (
                    TableName::parse("a"),
                    SyncOutcome::Compared(ComparisonResult::Match)
                ),
                (
                    TableName::parse("b"),
                    SyncOutcome::Compared(ComparisonResult::Mismatch)
                ),
            ]
        );

        let events = cluster.events().await;
        assert_eq!(lock_count(&events, "a"), (1, 1));
        assert_eq!(lock_count(&events, "b"), (1, 1));

        let locks: Vec<_> = events
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    ClusterEvent::TableLocked(_) | ClusterEvent::TableUnlocked(_)
                )
            })
            .cloned()
            .collect();
        assert_eq!(
            locks,
            vec![
                ClusterEvent::TableLocked(TableName::parse("a")),
                ClusterEvent::TableUnlocked(TableName::parse("a")),
                ClusterEvent::TableLocked(TableName::parse("b")),
                ClusterEvent::TableUnlocked(TableName::parse("b")),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_table_still_syncing_is_skipped_without_acquisitions() {
        let cluster = q1_cluster(NodeType::Root).await;
        cluster
            .add_table(Side::Provider, "public.c", Some("ok"), &["1"])
            .await;
        cluster
            .add_table(Side::Subscriber, "public.c", Some("syncing"), &[])
            .await;

        let (result, _) = run(&cluster, &["c"]).await;
        let report = result.unwrap();

        assert_eq!(report.exit_code(), 0);
        assert_eq!(
            report.outcome(&TableName::parse("c")),
            Some(SyncOutcome::Skipped(SkipReason::NotSyncedOnSubscriber))
        );
        assert!(cluster.events().await.is_empty());

        let (result, _) = run(&cluster, &["a", "c"]).await;
        assert_eq!(result.unwrap().exit_code(), 0);
        assert_eq!(lock_count(&cluster.events().await, "c"), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worklist_filtering() {
        let cluster = q1_cluster(NodeType::Root).await;
        cluster
            .add_table(Side::Subscriber, "public.only_here", Some("ok"), &[])
            .await;
        cluster
            .add_table(Side::Provider, "public.copying", Some("in-copy"), &[])
            .await;
        cluster
            .add_table(Side::Subscriber, "public.copying", Some("ok"), &[])
            .await;

        let (result, _) = run(&cluster, &["missing", "only_here", "copying"]).await;
        let report = result.unwrap();

        assert_eq!(
            report.outcomes(),
            &[
                (
                    TableName::parse("missing"),
                    SyncOutcome::Skipped(SkipReason::NotSubscribed)
                ),
                (
                    TableName::parse("only_here"),
                    SyncOutcome::Skipped(SkipReason::NotOnProvider)
                ),
                (
                    TableName::parse("copying"),
                    SyncOutcome::Skipped(SkipReason::NotReadyOnProvider)
                ),
            ]
        );
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_subscriber_tables_by_default() {
        let cluster = q1_cluster(NodeType::Root).await;

        let (result, _) = run(&cluster, &[]).await;
        let report = result.unwrap();

        let tables: Vec<_> = report.outcomes().iter().map(|(table, _)| table.clone()).collect();
        assert_eq!(tables, vec![TableName::parse("a"), TableName::parse("b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_branch_provider_pauses_worker_per_table() {
        let cluster = q1_cluster(NodeType::Branch).await;

        let (result, _) = run(&cluster, &["a", "b"]).await;
        assert_eq!(result.unwrap().exit_code(), 1);

        let events = cluster.events().await;
        let paused = ClusterEvent::ConsumerPaused(WORKER_NAME.to_owned());
        let resumed = ClusterEvent::ConsumerResumed(WORKER_NAME.to_owned());
        assert_eq!(events.iter().filter(|event| **event == paused).count(), 2);
        assert_eq!(events.iter().filter(|event| **event == resumed).count(), 2);
        assert!(!cluster.is_paused(WORKER_NAME).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_is_checked_again_before_each_table() {
        let cluster = q1_cluster(NodeType::Root).await;
        let recovers_after = Duration::from_secs(20);
        cluster
            .set_consumer_after_unlock(ConsumerBehavior::Recovering {
                lag_before: Duration::from_secs(60),
                recovers_after,
                lag_after: Duration::from_secs(1),
            })
            .await;

        let (result, _) = run(&cluster, &["a", "b"]).await;
        assert_eq!(result.unwrap().exit_code(), 1);

        let events = cluster.timed_events().await;
        let lock_time = |table: &str| {
            let table = TableName::parse(table);
            events
                .iter()
                .find(|(_, event)| *event == ClusterEvent::TableLocked(table.clone()))
                .map(|(at, _)| *at)
                .unwrap()
        };
        let unlock_a = events
            .iter()
            .find(|(_, event)| matches!(event, ClusterEvent::TableUnlocked(_)))
            .map(|(at, _)| *at)
            .unwrap();

        assert!(lock_time("a") < unlock_a);
        // The consumer fell behind when `a` was unlocked, `b` waits until it recovers.
        assert!(unlock_a < lock_time("b"));
        assert_eq!(
            lock_time("b") - events[0].0,
            TimeDelta::from_std(recovers_after).unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_fatal_and_recorded() {
        let cluster = q1_cluster(NodeType::Root).await;
        cluster
            .set_consumer(ConsumerBehavior::Stalled)
            .await;

        let (result, ctx) = run(&cluster, &["a", "b"]).await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::LockTimeout);
        assert_eq!(
            ctx.outcomes(),
            &[(TableName::parse("a"), SyncOutcome::AbortedTimeout)]
        );
        assert_eq!(ctx.bad_tables(), 1);
        assert_eq!(lock_count(&cluster.events().await, "b"), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_before_first_table() {
        let cluster = q1_cluster(NodeType::Root).await;
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let mut ctx = SyncContext::new(cluster.settings(), shutdown_rx);
        shutdown_tx.shutdown().unwrap();

        let err = run_with(&cluster, &mut ctx, &["a"]).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(cluster.events().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_from_finished_listener_takes_no_lock() {
        let cluster = q1_cluster(NodeType::Root).await;
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let mut ctx = SyncContext::new(cluster.settings(), shutdown_rx);
        shutdown_tx.shutdown().unwrap();
        drop(shutdown_tx);

        let err = run_with(&cluster, &mut ctx, &["a"]).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(cluster.events().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_provider_node_is_fatal() {
        let cluster = q1_cluster(NodeType::Root).await;
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let mut settings = cluster.settings();
        settings.queue_name = "unknown".to_owned();
        let mut ctx = SyncContext::new(settings, shutdown_rx);

        let err = run_with(&cluster, &mut ctx, &["a"]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NodeNotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_provider_location() {
        let cluster = TestCluster::new(NodeType::Root);
        let admin = cluster.subscriber_admin();

        assert_eq!(
            resolve_provider_location(&admin, "q1").await.unwrap(),
            PROVIDER_LOCATION
        );

        cluster
            .set_subscriber_node(Some(NodeInfo {
                node_name: "subscriber".to_owned(),
                node_type: NodeType::Root,
                worker_name: None,
                provider_location: None,
            }))
            .await;
        let err = resolve_provider_location(&admin, "q1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NodeNotFound);

        cluster.set_subscriber_node(None).await;
        let err = resolve_provider_location(&admin, "q1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NodeNotFound);
    }
}
