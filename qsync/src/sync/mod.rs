//! Per-table synchronization protocol.

mod coordinator;
mod method;
mod outcome;

pub use coordinator::{SyncCoordinator, TablePhase, TablePhaseTracker};
pub use method::{SyncHold, SyncMethod};
pub use outcome::{RunReport, SkipReason, SyncOutcome};
