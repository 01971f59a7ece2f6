//! Collection cycle: slab directory, liveness oracle and the mark-sweep
//! driver.

mod collector;
mod directory;
mod oracle;

pub use collector::{
    CollectRequest, CollectorPhase, CommitOutcome, MarkSweepCollector, ReclaimReport, SkipReason,
    SlabReclaim,
};
pub use directory::{MarkOutcome, SlabDirectory, SlabSource, SlabTrackingRecord};
pub use oracle::{AllocSite, DefectKind, DefectRecord, LiveEntry, LivenessOracle};
