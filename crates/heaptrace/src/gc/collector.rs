//! The mark-sweep cycle driver.
//!
//! One cycle runs `Idle → Snapshotting → Marking → Validating → Accounting →
//! Cleanup → Idle` synchronously on the calling thread. Only the LiveSet and
//! the destructor-obligation list outlive a cycle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use slab_alloc::BlockBitmap;

use super::directory::{MarkOutcome, SlabDirectory, SlabSource};
use super::oracle::{AllocSite, DefectKind, DefectRecord, LivenessOracle};
use crate::census::HeapCensus;
use crate::config::{CollectorConfig, ReclaimPolicy};
use crate::error::Result;
use crate::exec::ExecutionState;
use crate::metrics::{global_metrics, CycleMetrics, PhaseTimer};
use crate::stats::global_stats;
use crate::telemetry::{next_cycle_id, phase_span, CycleId, PhaseSpan};
use crate::tracer::{HeapTracer, TraceStats};
use crate::value::{CellOwner, DataKind, ObjectRef};

// ============================================================================
// Phase and requests
// ============================================================================

/// Where the collector is in its cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CollectorPhase {
    /// Between cycles.
    #[default]
    Idle,
    /// Copying the allocator's slab state.
    Snapshotting,
    /// Tracing and marking blocks.
    Marking,
    /// Comparing traced against refcount liveness.
    Validating,
    /// Computing reclaimable blocks and running the gated commit.
    Accounting,
    /// Dropping per-cycle state.
    Cleanup,
}

/// Cross-thread handle for asking a collector to run at its next safepoint.
///
/// # Example
///
/// ```
/// use heaptrace::{CollectorConfig, MarkSweepCollector};
///
/// let collector = MarkSweepCollector::new(CollectorConfig::default());
/// let request = collector.request_handle();
/// std::thread::spawn(move || request.request_collection_at_next_safe_point())
///     .join()
///     .unwrap();
/// assert!(collector.collection_requested());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CollectRequest {
    flag: Arc<AtomicBool>,
}

impl CollectRequest {
    /// Ask for a collection. Repeated requests before the safepoint coalesce.
    pub fn request_collection_at_next_safe_point(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Returns `true` if a request is pending.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }
}

// ============================================================================
// Report
// ============================================================================

/// Per-slab accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlabReclaim {
    /// Slab base.
    pub base: usize,
    /// Block size.
    pub block_size: usize,
    /// Blocks allocated at snapshot time.
    pub allocated: usize,
    /// Blocks reached by the tracer.
    pub used: usize,
    /// Allocated blocks the tracer never reached.
    pub reclaimable: usize,
    /// The reclaimable blocks themselves.
    pub blocks: BlockBitmap,
}

/// Why a commit did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The policy is [`ReclaimPolicy::Advisory`].
    Advisory,
    /// Validation is off, so nothing proves the reclaim set is dead.
    ValidationDisabled,
    /// The cycle found validation defects.
    DefectsFound,
    /// A block in the reclaim set holds an object the runtime reports live.
    LiveBlockInReclaimSet,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Advisory => "advisory policy",
            Self::ValidationDisabled => "validation disabled",
            Self::DefectsFound => "validation defects found",
            Self::LiveBlockInReclaimSet => "live object in reclaim set",
        })
    }
}

/// What the gated commit step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Nothing was handed to the allocator.
    Skipped(SkipReason),
    /// The reclaim set was handed to the allocator.
    Committed {
        /// Blocks the allocator actually released.
        blocks: usize,
    },
}

/// Output of one successful cycle.
#[derive(Debug, Clone)]
pub struct ReclaimReport {
    /// Cycle identifier.
    pub cycle: CycleId,
    /// Allocated blocks the tracer never reached, over all slabs.
    pub reclaimable_blocks: u64,
    /// Bytes in those blocks.
    pub reclaimable_bytes: u64,
    /// Validation findings, sorted by address.
    pub validation_defects: Vec<DefectRecord>,
    /// Per-slab breakdown, in snapshot order.
    pub slabs: Vec<SlabReclaim>,
    /// Reachable heap by kind; empty when the census is off.
    pub census: HeapCensus,
    /// Addresses of registered destructible objects found unreachable.
    pub pending_destructors: Vec<usize>,
    /// Gated commit result.
    pub commit: CommitOutcome,
    /// Traversal counters.
    pub trace: TraceStats,
}

impl ReclaimReport {
    /// Returns `true` if validation found nothing wrong.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.validation_defects.is_empty()
    }

    /// Defects of one kind.
    pub fn defects_of(&self, kind: DefectKind) -> impl Iterator<Item = &DefectRecord> + '_ {
        self.validation_defects
            .iter()
            .filter(move |d| d.defect == kind)
    }

    /// Accounting for the slab at `base`.
    #[must_use]
    pub fn slab(&self, base: usize) -> Option<&SlabReclaim> {
        self.slabs.iter().find(|s| s.base == base)
    }
}

// ============================================================================
// MarkSweepCollector
// ============================================================================

/// A thread-confined diagnostic mark-sweep collector.
#[derive(Debug)]
pub struct MarkSweepCollector {
    config: CollectorConfig,
    tracer: HeapTracer,
    directory: SlabDirectory,
    oracle: LivenessOracle,
    destructable: Vec<ObjectRef>,
    phase: CollectorPhase,
    request: CollectRequest,
    last_metrics: CycleMetrics,
}

impl Default for MarkSweepCollector {
    fn default() -> Self {
        Self::new(CollectorConfig::default())
    }
}

impl MarkSweepCollector {
    /// Collector with `config`.
    #[must_use]
    pub fn new(config: CollectorConfig) -> Self {
        Self {
            tracer: HeapTracer::with_globals_name(config.globals_name),
            config,
            directory: SlabDirectory::new(),
            oracle: LivenessOracle::new(),
            destructable: Vec::new(),
            phase: CollectorPhase::Idle,
            request: CollectRequest::default(),
            last_metrics: CycleMetrics::default(),
        }
    }

    /// Configuration.
    #[must_use]
    pub const fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Current phase. Always [`CollectorPhase::Idle`] between cycles.
    #[must_use]
    pub const fn phase(&self) -> CollectorPhase {
        self.phase
    }

    /// Metrics of the last successful cycle.
    #[must_use]
    pub const fn last_metrics(&self) -> CycleMetrics {
        self.last_metrics
    }

    /// LiveSet and TracedSet.
    #[must_use]
    pub const fn oracle(&self) -> &LivenessOracle {
        &self.oracle
    }

    /// Registered destructor obligations.
    #[must_use]
    pub fn destructables(&self) -> &[ObjectRef] {
        &self.destructable
    }

    // ------------------------------------------------------------------------
    // Refcount hooks
    // ------------------------------------------------------------------------

    /// Record that the runtime considers `addr` live. Ignored when
    /// validation is off.
    pub fn mark_object_live(&mut self, addr: usize, kind: DataKind, site: Option<AllocSite>) {
        if self.config.validate {
            self.oracle.mark_live(addr, kind, site);
        }
    }

    /// Record that the runtime released `addr`.
    pub fn mark_object_dead(&mut self, addr: usize) {
        self.oracle.mark_dead(addr);
        self.destructable.retain(|obj| obj.addr() != addr);
    }

    /// Register an object that must have its destructor run before its
    /// memory can be reused.
    pub fn mark_destructable(&mut self, obj: ObjectRef) {
        if !self.destructable.contains(&obj) {
            self.destructable.push(obj);
        }
    }

    /// Handle other threads can use to request a collection.
    #[must_use]
    pub fn request_handle(&self) -> CollectRequest {
        self.request.clone()
    }

    /// Request a collection at the next [`MarkSweepCollector::safepoint`].
    pub fn request_collection_at_next_safe_point(&self) {
        self.request.request_collection_at_next_safe_point();
    }

    /// Returns `true` if a collection request is pending.
    #[must_use]
    pub fn collection_requested(&self) -> bool {
        self.request.is_pending()
    }

    /// Run a cycle if one was requested since the last safepoint.
    ///
    /// # Errors
    ///
    /// As [`MarkSweepCollector::collect`].
    pub fn safepoint<A, E>(&mut self, slabs: &mut A, state: &E) -> Result<Option<ReclaimReport>>
    where
        A: SlabSource + CellOwner + ?Sized,
        E: ExecutionState + ?Sized,
    {
        if !self.request.take() {
            return Ok(None);
        }
        self.collect(slabs, state).map(Some)
    }

    // ------------------------------------------------------------------------
    // Cycle
    // ------------------------------------------------------------------------

    /// Run one full cycle.
    ///
    /// `slabs` is both the allocator being accounted and the owner the
    /// tracer consults before reading a payload's children.
    ///
    /// The allocator is only mutated through the gated commit step, and only
    /// when [`ReclaimPolicy::Commit`] is configured.
    ///
    /// # Errors
    ///
    /// Any structural defect found while tracing. Per-cycle state is cleared
    /// and the LiveSet left untouched before the error is returned.
    pub fn collect<A, E>(&mut self, slabs: &mut A, state: &E) -> Result<ReclaimReport>
    where
        A: SlabSource + CellOwner + ?Sized,
        E: ExecutionState + ?Sized,
    {
        let cycle = next_cycle_id();
        #[cfg(feature = "tracing")]
        let _cycle_span = crate::telemetry::internal::trace_cycle(cycle);

        let start = Instant::now();
        let mut timer = PhaseTimer::new();
        let result = self.run_cycle(cycle, slabs, state, &mut timer);

        {
            let _span = self.begin(CollectorPhase::Cleanup);
            timer.start();
            match &result {
                Ok(_) if self.config.validate => self.oracle.roll_over(),
                Ok(_) | Err(_) => self.oracle.clear_traced(),
            }
            self.directory.clear();
            timer.end_cleanup();
        }
        self.phase = CollectorPhase::Idle;

        match result {
            Ok(report) => {
                let metrics = CycleMetrics {
                    duration: start.elapsed(),
                    snapshot_duration: timer.snapshot,
                    mark_duration: timer.mark,
                    account_duration: timer.account,
                    cleanup_duration: timer.cleanup,
                    roots: report.trace.roots,
                    frames: report.trace.frames,
                    visited: report.trace.visited,
                    slabs: report.slabs.len(),
                    reclaimable_blocks: usize::try_from(report.reclaimable_blocks)
                        .unwrap_or(usize::MAX),
                    reclaimable_bytes: usize::try_from(report.reclaimable_bytes)
                        .unwrap_or(usize::MAX),
                    defects: report.validation_defects.len(),
                    committed_blocks: match report.commit {
                        CommitOutcome::Committed { blocks } => blocks,
                        CommitOutcome::Skipped(_) => 0,
                    },
                };
                self.last_metrics = metrics;
                global_metrics().record_cycle(&metrics);
                if self.config.publish_stats {
                    global_stats().merge_cycle(&report);
                }

                #[cfg(feature = "tracing")]
                tracing::debug!(
                    cycle = cycle.0,
                    reclaimable_blocks = report.reclaimable_blocks,
                    reclaimable_bytes = report.reclaimable_bytes,
                    defects = report.validation_defects.len(),
                    visited = report.trace.visited,
                    "cycle_complete"
                );
                Ok(report)
            }
            Err(err) => {
                global_metrics().record_failure();
                #[cfg(feature = "tracing")]
                tracing::error!(cycle = cycle.0, error = %err, "cycle_failed");
                Err(err)
            }
        }
    }

    fn begin(&mut self, phase: CollectorPhase) -> PhaseSpan {
        self.phase = phase;
        phase_span(phase)
    }

    fn run_cycle<A, E>(
        &mut self,
        cycle: CycleId,
        slabs: &mut A,
        state: &E,
        timer: &mut PhaseTimer,
    ) -> Result<ReclaimReport>
    where
        A: SlabSource + CellOwner + ?Sized,
        E: ExecutionState + ?Sized,
    {
        let validate = self.config.validate;
        let census_on = self.config.census;

        // 1. Snapshot
        {
            let _span = self.begin(CollectorPhase::Snapshotting);
            timer.start();
            let snapshot = self.directory.snapshot(slabs);
            timer.end_snapshot();
            snapshot?;
        }

        // 2. Mark
        let mut census = HeapCensus::new();
        let mut defects = Vec::new();
        let trace = {
            let _span = self.begin(CollectorPhase::Marking);
            timer.start();
            let directory = &mut self.directory;
            let oracle = &mut self.oracle;
            let trace = self.tracer.trace_heap(state, &*slabs, |node| {
                let Some(addr) = node.current.heap_addr() else {
                    return;
                };
                let kind = node.current.kind();
                let bytes = match directory.mark(addr) {
                    MarkOutcome::Marked { block_size }
                    | MarkOutcome::AlreadyMarked { block_size } => block_size,
                    MarkOutcome::Unmapped => 0,
                    MarkOutcome::Unallocated { .. } => {
                        defects.push(DefectRecord {
                            addr,
                            kind,
                            defect: DefectKind::TracedUnallocated,
                            site: oracle.live_entry(addr).and_then(|e| e.site.clone()),
                        });
                        return;
                    }
                };
                if validate {
                    oracle.record_traced(addr, kind);
                }
                if census_on {
                    census.record(kind, bytes);
                }
            });
            timer.end_mark();
            trace?
        };

        // 3. Validate; timed together with accounting
        timer.start();
        if validate {
            let _span = self.begin(CollectorPhase::Validating);
            defects.extend(self.oracle.missing());
            defects.sort_by_key(|d| d.addr);
        }
        #[cfg(feature = "tracing")]
        for defect in &defects {
            tracing::warn!(
                cycle = cycle.0,
                addr = defect.addr,
                kind = %defect.kind,
                defect = ?defect.defect,
                site = defect.site.as_ref().map(ToString::to_string),
                "validation_defect"
            );
        }

        // 4. Account
        let _span = self.begin(CollectorPhase::Accounting);
        let mut reclaim = Vec::with_capacity(self.directory.len());
        let mut reclaimable_blocks = 0u64;
        let mut reclaimable_bytes = 0u64;
        for record in self.directory.records() {
            debug_assert!(record.used_blocks.is_subset_of(&record.slab.allocated));
            let blocks = record.reclaimable();
            let count = blocks.count_ones();
            let block_size = record.slab.block_size;

            #[cfg(feature = "tracing")]
            tracing::debug!(
                base = record.slab.base,
                block_size,
                used = record.used_blocks.count_ones(),
                reclaimable = count,
                "slab_accounted"
            );

            reclaimable_blocks += count as u64;
            reclaimable_bytes += (count * block_size) as u64;
            reclaim.push(SlabReclaim {
                base: record.slab.base,
                block_size,
                allocated: record.slab.allocated.count_ones(),
                used: record.used_blocks.count_ones(),
                reclaimable: count,
                blocks,
            });
        }

        let pending_destructors: Vec<usize> = self
            .destructable
            .iter()
            .map(|obj| obj.addr())
            .filter(|&addr| {
                self.directory
                    .lookup(addr)
                    .is_some_and(|r| r.is_reclaimable(addr))
            })
            .collect();

        let commit = self.commit(slabs, &reclaim, &defects);
        if matches!(commit, CommitOutcome::Committed { .. }) {
            self.destructable
                .retain(|obj| !pending_destructors.contains(&obj.addr()));
        }
        timer.end_account();

        Ok(ReclaimReport {
            cycle,
            reclaimable_blocks,
            reclaimable_bytes,
            validation_defects: defects,
            slabs: reclaim,
            census,
            pending_destructors,
            commit,
            trace,
        })
    }

    fn commit_blocker(&self, defects: &[DefectRecord]) -> Option<SkipReason> {
        if self.config.reclaim == ReclaimPolicy::Advisory {
            return Some(SkipReason::Advisory);
        }
        if !self.config.validate {
            return Some(SkipReason::ValidationDisabled);
        }
        if !defects.is_empty() {
            return Some(SkipReason::DefectsFound);
        }
        let live_in_reclaim_set = self.oracle.live_addrs().any(|addr| {
            self.directory
                .lookup(addr)
                .is_some_and(|r| r.is_reclaimable(addr))
        });
        live_in_reclaim_set.then_some(SkipReason::LiveBlockInReclaimSet)
    }

    fn commit<A>(&self, slabs: &mut A, reclaim: &[SlabReclaim], defects: &[DefectRecord]) -> CommitOutcome
    where
        A: SlabSource + ?Sized,
    {
        if let Some(reason) = self.commit_blocker(defects) {
            #[cfg(feature = "tracing")]
            if reason == SkipReason::Advisory {
                tracing::debug!(%reason, "commit_skipped");
            } else {
                tracing::warn!(%reason, "commit_skipped");
            }
            return CommitOutcome::Skipped(reason);
        }
        let blocks = reclaim
            .iter()
            .filter(|s| s.reclaimable > 0)
            .map(|s| slabs.recycle(s.base, &s.blocks))
            .sum();

        #[cfg(feature = "tracing")]
        tracing::debug!(blocks, "commit_released");

        CommitOutcome::Committed { blocks }
    }
}
