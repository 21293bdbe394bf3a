use std::future::Future;

use crate::error::SyncResult;
use crate::types::TableName;

/// Verdict of comparing a table on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonResult {
    Match,
    Mismatch,
}

/// Compares the content of a table as seen by two sessions.
///
/// Implementations are called once both sessions read equivalent snapshots and must not
/// end their transactions. A mismatch is a result, not an error. Errors are fatal for the
/// run and never retried.
pub trait TableComparator<S> {
    fn compare(
        &self,
        provider: &S,
        subscriber: &S,
        provider_table: &TableName,
        subscriber_table: &TableName,
    ) -> impl Future<Output = SyncResult<ComparisonResult>> + Send;
}
