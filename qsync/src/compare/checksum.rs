use tracing::{info, warn};

use crate::compare::base::{ComparisonResult, TableComparator};
use crate::error::SyncResult;
use crate::postgres::PgSession;
use crate::types::TableName;

/// Row count and order-independent content hash of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableChecksum {
    pub row_count: i64,
    pub checksum: i64,
}

impl TableChecksum {
    pub fn compare(&self, other: &TableChecksum) -> ComparisonResult {
        if self == other {
            ComparisonResult::Match
        } else {
            ComparisonResult::Mismatch
        }
    }
}

/// Compares tables by row count and by the sum of the hashes of their rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecksumComparator;

impl TableComparator<PgSession> for ChecksumComparator {
    async fn compare(
        &self,
        provider: &PgSession,
        subscriber: &PgSession,
        provider_table: &TableName,
        subscriber_table: &TableName,
    ) -> SyncResult<ComparisonResult> {
        let provider_checksum = provider.table_checksum(provider_table).await?;
        let subscriber_checksum = subscriber.table_checksum(subscriber_table).await?;

        let result = provider_checksum.compare(&subscriber_checksum);
        match result {
            ComparisonResult::Match => info!(
                table = %subscriber_table,
                rows = subscriber_checksum.row_count,
                checksum = subscriber_checksum.checksum,
                "table contents match"
            ),
            ComparisonResult::Mismatch => warn!(
                table = %subscriber_table,
                provider_rows = provider_checksum.row_count,
                provider_checksum = provider_checksum.checksum,
                subscriber_rows = subscriber_checksum.row_count,
                subscriber_checksum = subscriber_checksum.checksum,
                "table contents differ"
            ),
        }

        Ok(result)
    }
}
