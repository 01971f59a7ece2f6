//! Collector metrics and statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Statistics from one collection cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleMetrics {
    /// Wall time of the whole cycle.
    pub duration: Duration,
    /// Time spent snapshotting the allocator.
    pub snapshot_duration: Duration,
    /// Time spent tracing and marking.
    pub mark_duration: Duration,
    /// Time spent validating, computing reclaimable blocks and running the
    /// gated commit.
    pub account_duration: Duration,
    /// Time spent rolling the oracle over and clearing per-cycle state.
    pub cleanup_duration: Duration,
    /// Roots enqueued.
    pub roots: usize,
    /// Frames walked.
    pub frames: usize,
    /// Distinct payloads visited.
    pub visited: usize,
    /// Slabs tracked.
    pub slabs: usize,
    /// Blocks allocated but unreachable.
    pub reclaimable_blocks: usize,
    /// Bytes in those blocks.
    pub reclaimable_bytes: usize,
    /// Validation defects found.
    pub defects: usize,
    /// Blocks handed back to the allocator.
    pub committed_blocks: usize,
}

/// Internal helper for capturing phase durations.
///
/// # Example
///
/// ```
/// use heaptrace::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... snapshot the allocator ...
/// timer.end_snapshot();
///
/// timer.start();
/// // ... trace ...
/// timer.end_mark();
///
/// timer.start();
/// // ... validate and account ...
/// timer.end_account();
/// assert!(timer.total() >= timer.mark);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    /// Snapshot phase time.
    pub snapshot: Duration,
    /// Mark phase time.
    pub mark: Duration,
    /// Validation, accounting and commit time.
    pub account: Duration,
    /// Cleanup time.
    pub cleanup: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// All durations zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            snapshot: Duration::ZERO,
            mark: Duration::ZERO,
            account: Duration::ZERO,
            cleanup: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    fn lap(&mut self) -> Duration {
        self.current_start
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed())
    }

    /// End the snapshot phase.
    pub fn end_snapshot(&mut self) {
        self.snapshot = self.lap();
    }

    /// End the mark phase.
    pub fn end_mark(&mut self) {
        self.mark = self.lap();
    }

    /// End the accounting phase.
    pub fn end_account(&mut self) {
        self.account = self.lap();
    }

    /// End the cleanup phase.
    pub fn end_cleanup(&mut self) {
        self.cleanup = self.lap();
    }

    /// Sum of the recorded phases.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.snapshot + self.mark + self.account + self.cleanup
    }
}

/// Process-level cumulative collector statistics.
///
/// # Example
///
/// ```
/// use heaptrace::global_metrics;
///
/// let metrics = global_metrics();
/// println!("cycles so far: {}", metrics.total_cycles());
/// ```
#[derive(Debug, Default)]
pub struct GlobalMetrics {
    cycles: AtomicU64,
    failed_cycles: AtomicU64,
    reclaimable_blocks: AtomicU64,
    committed_blocks: AtomicU64,
    defects: AtomicU64,
    pause_ns: AtomicU64,
}

impl GlobalMetrics {
    /// All counters zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cycles: AtomicU64::new(0),
            failed_cycles: AtomicU64::new(0),
            reclaimable_blocks: AtomicU64::new(0),
            committed_blocks: AtomicU64::new(0),
            defects: AtomicU64::new(0),
            pause_ns: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_cycle(&self, m: &CycleMetrics) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.reclaimable_blocks
            .fetch_add(m.reclaimable_blocks as u64, Ordering::Relaxed);
        self.committed_blocks
            .fetch_add(m.committed_blocks as u64, Ordering::Relaxed);
        self.defects.fetch_add(m.defects as u64, Ordering::Relaxed);
        self.pause_ns.fetch_add(
            u64::try_from(m.duration.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    pub(crate) fn record_failure(&self) {
        self.failed_cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Successful cycles.
    #[inline]
    #[must_use]
    pub fn total_cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Cycles aborted by a structural error.
    #[inline]
    #[must_use]
    pub fn total_failed_cycles(&self) -> u64 {
        self.failed_cycles.load(Ordering::Relaxed)
    }

    /// Reclaimable blocks reported, summed over cycles.
    #[inline]
    #[must_use]
    pub fn total_reclaimable_blocks(&self) -> u64 {
        self.reclaimable_blocks.load(Ordering::Relaxed)
    }

    /// Blocks actually handed back to allocators.
    #[inline]
    #[must_use]
    pub fn total_committed_blocks(&self) -> u64 {
        self.committed_blocks.load(Ordering::Relaxed)
    }

    /// Validation defects, summed over cycles.
    #[inline]
    #[must_use]
    pub fn total_defects(&self) -> u64 {
        self.defects.load(Ordering::Relaxed)
    }

    /// Time spent in successful cycles, in nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_pause_ns(&self) -> u64 {
        self.pause_ns.load(Ordering::Relaxed)
    }
}

static GLOBAL_METRICS: GlobalMetrics = GlobalMetrics::new();

/// Get the global cumulative collector metrics.
#[must_use]
pub fn global_metrics() -> &'static GlobalMetrics {
    &GLOBAL_METRICS
}
