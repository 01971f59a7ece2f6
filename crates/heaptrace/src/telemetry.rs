//! Structured tracing for collection cycles.
//!
//! When the `tracing` feature is enabled, every cycle runs inside a
//! `heap_collect` span and each phase inside a `collector_phase` span.
//! Cycle identifiers are allocated either way so reports can be correlated.

use std::sync::atomic::{AtomicU64, Ordering};

/// Stable identifier of one collection cycle.
///
/// Monotonically increasing across the process, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CycleId(pub u64);

static NEXT_CYCLE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next cycle identifier.
pub fn next_cycle_id() -> CycleId {
    CycleId(NEXT_CYCLE_ID.fetch_add(1, Ordering::Relaxed))
}

#[cfg(feature = "tracing")]
pub(crate) mod internal {
    use tracing::{span, Level};

    use super::CycleId;
    use crate::gc::CollectorPhase;

    /// Span covering a whole cycle.
    pub fn trace_cycle(cycle: CycleId) -> span::EnteredSpan {
        span!(Level::DEBUG, "heap_collect", cycle = cycle.0).entered()
    }

    /// Span covering one phase.
    pub fn trace_phase(phase: CollectorPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "collector_phase", phase = ?phase).entered()
    }
}

/// Guard for the span of the phase in progress.
#[cfg(feature = "tracing")]
pub(crate) type PhaseSpan = tracing::span::EnteredSpan;
/// Guard for the span of the phase in progress.
#[cfg(not(feature = "tracing"))]
pub(crate) type PhaseSpan = ();

#[cfg(feature = "tracing")]
pub(crate) fn phase_span(phase: crate::gc::CollectorPhase) -> PhaseSpan {
    internal::trace_phase(phase)
}

#[cfg(not(feature = "tracing"))]
pub(crate) const fn phase_span(_phase: crate::gc::CollectorPhase) -> PhaseSpan {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_ids_increase() {
        let a = next_cycle_id();
        let b = next_cycle_id();
        assert!(b > a);
        assert!(a.0 >= 1);
    }
}
