use qsync_config::shared::SyncerConfig;
use std::time::Duration;
use tracing::info;

use crate::concurrency::shutdown::{ShutdownRx, is_shutdown_requested};
use crate::sync::{RunReport, SyncOutcome};
use crate::types::{NodeInfo, TableName};

/// Tunables of a run, fixed once the run starts.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub queue_name: String,
    pub consumer_name: String,
    /// Limit on how long a lock or pause may be held while waiting for the consumer.
    /// Zero only disables the statement timeout of the lock session, the wait still
    /// gives up after its first unsuccessful poll.
    pub lock_timeout: Duration,
    /// Limit on how long to wait for the ticker to cut a new tick.
    pub tick_timeout: Duration,
    pub poll_interval: Duration,
    pub lag_margin: Duration,
    /// Turns expired limits into warnings.
    pub force: bool,
}

impl SyncSettings {
    pub fn new(queue_name: String, consumer_name: String) -> Self {
        Self {
            queue_name,
            consumer_name,
            lock_timeout: Duration::from_secs(10),
            tick_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
            lag_margin: Duration::from_secs(5),
            force: false,
        }
    }

    pub fn from_config(config: &SyncerConfig, force: bool) -> Self {
        Self {
            queue_name: config.queue_name.clone(),
            consumer_name: config.consumer_name().to_owned(),
            lock_timeout: config.lock_timeout(),
            tick_timeout: config.tick_timeout(),
            poll_interval: config.poll_interval(),
            lag_margin: config.lag_margin(),
            force,
        }
    }
}

/// State of a single run, passed explicitly through the driver.
#[derive(Debug)]
pub struct SyncContext {
    settings: SyncSettings,
    provider_node: Option<NodeInfo>,
    outcomes: Vec<(TableName, SyncOutcome)>,
    bad_tables: usize,
    shutdown_rx: ShutdownRx,
}

impl SyncContext {
    pub fn new(settings: SyncSettings, shutdown_rx: ShutdownRx) -> Self {
        Self {
            settings,
            provider_node: None,
            outcomes: Vec::new(),
            bad_tables: 0,
            shutdown_rx,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn provider_node(&self) -> Option<&NodeInfo> {
        self.provider_node.as_ref()
    }

    pub fn set_provider_node(&mut self, node: NodeInfo) {
        self.provider_node = Some(node);
    }

    /// Returns a receiver for the waits of the run.
    pub fn shutdown_rx(&self) -> ShutdownRx {
        self.shutdown_rx.clone()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        is_shutdown_requested(&self.shutdown_rx)
    }

    /// Records the outcome of a table, counting it if it is bad.
    pub fn record(&mut self, table: TableName, outcome: SyncOutcome) {
        if outcome.is_bad() {
            self.bad_tables += 1;
        }

        info!(table = %table, %outcome, "table finished");
        self.outcomes.push((table, outcome));
    }

    pub fn bad_tables(&self) -> usize {
        self.bad_tables
    }

    pub fn outcomes(&self) -> &[(TableName, SyncOutcome)] {
        &self.outcomes
    }

    pub fn report(&self) -> RunReport {
        RunReport::new(self.outcomes.clone(), self.bad_tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::ComparisonResult;
    use crate::concurrency::shutdown::create_shutdown_channel;
    use crate::sync::SkipReason;

    #[test]
    fn test_bad_tables_are_counted() {
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let settings = SyncSettings::new("q1".to_owned(), "c1".to_owned());
        let mut ctx = SyncContext::new(settings, shutdown_rx);

        ctx.record(
            TableName::parse("a"),
            SyncOutcome::Compared(ComparisonResult::Match),
        );
        ctx.record(
            TableName::parse("b"),
            SyncOutcome::Compared(ComparisonResult::Mismatch),
        );
        ctx.record(
            TableName::parse("c"),
            SyncOutcome::Skipped(SkipReason::NotSyncedOnSubscriber),
        );
        ctx.record(TableName::parse("d"), SyncOutcome::AbortedTimeout);

        assert_eq!(ctx.bad_tables(), 2);
        assert_eq!(ctx.outcomes().len(), 4);
        assert_eq!(ctx.report().exit_code(), 2);
    }
}
