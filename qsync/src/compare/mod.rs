mod base;
mod checksum;

pub use base::{ComparisonResult, TableComparator};
pub use checksum::{ChecksumComparator, TableChecksum};
