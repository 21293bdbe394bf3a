use std::fmt;

use crate::compare::ComparisonResult;
use crate::types::TableName;

/// Why a table was not compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Requested but not replicated to the subscriber.
    NotSubscribed,
    /// Replicated to the subscriber but unknown to the provider.
    NotOnProvider,
    /// The provider itself is still syncing the table.
    NotReadyOnProvider,
    /// The subscriber is still syncing the table.
    NotSyncedOnSubscriber,
    /// The physical table does not exist on the provider.
    MissingOnProvider,
    /// The physical table does not exist on the subscriber.
    MissingOnSubscriber,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SkipReason::NotSubscribed => "not subscribed",
            SkipReason::NotOnProvider => "not on provider",
            SkipReason::NotReadyOnProvider => "not ready on provider",
            SkipReason::NotSyncedOnSubscriber => "not synced on subscriber",
            SkipReason::MissingOnProvider => "missing on provider",
            SkipReason::MissingOnSubscriber => "missing on subscriber",
        };

        f.write_str(reason)
    }
}

/// Result of processing one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Skipped(SkipReason),
    Compared(ComparisonResult),
    /// The consumer did not catch up while the table was held.
    AbortedTimeout,
}

impl SyncOutcome {
    /// Returns `true` for outcomes that count against the run.
    pub fn is_bad(&self) -> bool {
        matches!(
            self,
            SyncOutcome::Compared(ComparisonResult::Mismatch) | SyncOutcome::AbortedTimeout
        )
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::Skipped(reason) => write!(f, "skipped ({reason})"),
            SyncOutcome::Compared(ComparisonResult::Match) => write!(f, "match"),
            SyncOutcome::Compared(ComparisonResult::Mismatch) => write!(f, "mismatch"),
            SyncOutcome::AbortedTimeout => write!(f, "aborted on timeout"),
        }
    }
}

/// Outcomes of a run, in processing order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    outcomes: Vec<(TableName, SyncOutcome)>,
    bad_tables: usize,
}

impl RunReport {
    pub fn new(outcomes: Vec<(TableName, SyncOutcome)>, bad_tables: usize) -> Self {
        Self {
            outcomes,
            bad_tables,
        }
    }

    pub fn outcomes(&self) -> &[(TableName, SyncOutcome)] {
        &self.outcomes
    }

    pub fn outcome(&self, table: &TableName) -> Option<SyncOutcome> {
        self.outcomes
            .iter()
            .find(|(name, _)| name == table)
            .map(|(_, outcome)| *outcome)
    }

    pub fn bad_tables(&self) -> usize {
        self.bad_tables
    }

    /// Process exit status: zero when nothing was bad, otherwise the number of bad
    /// tables, saturated to fit an exit code.
    pub fn exit_code(&self) -> u8 {
        u8::try_from(self.bad_tables).unwrap_or(u8::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_saturates() {
        let report = RunReport::new(Vec::new(), 0);
        assert_eq!(report.exit_code(), 0);

        let report = RunReport::new(Vec::new(), 3);
        assert_eq!(report.exit_code(), 3);

        let report = RunReport::new(Vec::new(), 1_000);
        assert_eq!(report.exit_code(), 255);
    }

    #[test]
    fn test_only_mismatch_and_abort_are_bad() {
        assert!(!SyncOutcome::Compared(ComparisonResult::Match).is_bad());
        assert!(!SyncOutcome::Skipped(SkipReason::MissingOnProvider).is_bad());
        assert!(SyncOutcome::Compared(ComparisonResult::Mismatch).is_bad());
        assert!(SyncOutcome::AbortedTimeout.is_bad());
    }
}
