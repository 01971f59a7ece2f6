//! Collector configuration.

/// Name of the global-table entry holding the globals array.
pub const DEFAULT_GLOBALS_NAME: &str = "GLOBALS";

/// What a cycle does with the blocks it finds unreachable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReclaimPolicy {
    /// Report reclaimable blocks and leave the allocator untouched.
    #[default]
    Advisory,
    /// Hand reclaimable blocks back to the allocator, but only when the
    /// cycle validated cleanly.
    Commit,
}

/// Knobs for [`MarkSweepCollector`](crate::MarkSweepCollector).
///
/// # Example
///
/// ```
/// use heaptrace::{CollectorConfig, ReclaimPolicy};
///
/// let config = CollectorConfig::new()
///     .with_census(false)
///     .with_reclaim(ReclaimPolicy::Commit);
/// assert!(config.validate);
/// assert_eq!(config.reclaim, ReclaimPolicy::Commit);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorConfig {
    /// Cross-check the traced set against refcount liveness.
    pub validate: bool,
    /// Collect a per-kind census while marking.
    pub census: bool,
    /// Reclaim policy.
    pub reclaim: ReclaimPolicy,
    /// Global-table key of the globals array.
    pub globals_name: &'static str,
    /// Merge each cycle into the process-wide stats registry.
    pub publish_stats: bool,
    /// Record the runtime backtrace when an allocation is reported live.
    pub capture_alloc_sites: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectorConfig {
    /// Default configuration: validating, counting, advisory.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            validate: true,
            census: true,
            reclaim: ReclaimPolicy::Advisory,
            globals_name: DEFAULT_GLOBALS_NAME,
            publish_stats: true,
            capture_alloc_sites: true,
        }
    }

    /// Toggle validation.
    #[must_use]
    pub const fn with_validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    /// Toggle the census.
    #[must_use]
    pub const fn with_census(mut self, census: bool) -> Self {
        self.census = census;
        self
    }

    /// Set the reclaim policy.
    #[must_use]
    pub const fn with_reclaim(mut self, reclaim: ReclaimPolicy) -> Self {
        self.reclaim = reclaim;
        self
    }

    /// Use a different global-table key for the globals array.
    #[must_use]
    pub const fn with_globals_name(mut self, name: &'static str) -> Self {
        self.globals_name = name;
        self
    }

    /// Toggle merging into the global stats registry.
    #[must_use]
    pub const fn with_publish_stats(mut self, publish: bool) -> Self {
        self.publish_stats = publish;
        self
    }

    /// Toggle allocation-site capture.
    #[must_use]
    pub const fn with_alloc_sites(mut self, capture: bool) -> Self {
        self.capture_alloc_sites = capture;
        self
    }
}
