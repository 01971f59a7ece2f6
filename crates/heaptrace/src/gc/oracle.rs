//! Refcount-liveness oracle.
//!
//! The runtime reports every allocation it considers live (and every
//! release) here. After marking, each live entry that the tracer did not
//! reach is a defect: either the tracer missed a root or edge, or the
//! refcount bookkeeping kept something alive that nothing points to.

use std::collections::HashMap;
use std::fmt;

use crate::value::DataKind;

/// Where an allocation happened: function names, innermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocSite {
    /// Call stack at allocation time.
    pub frames: Vec<String>,
}

impl AllocSite {
    /// Site from a backtrace.
    #[must_use]
    pub const fn new(frames: Vec<String>) -> Self {
        Self { frames }
    }
}

impl fmt::Display for AllocSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.frames.is_empty() {
            return f.write_str("<top level>");
        }
        f.write_str(&self.frames.join(" <- "))
    }
}

/// A LiveSet entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveEntry {
    /// Kind reported at allocation.
    pub kind: DataKind,
    /// Allocation site, if captured.
    pub site: Option<AllocSite>,
}

/// What is wrong with a [`DefectRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefectKind {
    /// Reported live by the runtime, never reached by the tracer.
    LiveNotTraced,
    /// Reached by the tracer inside a block the allocator did not consider
    /// allocated.
    TracedUnallocated,
}

/// One validation finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefectRecord {
    /// Payload address.
    pub addr: usize,
    /// Payload kind.
    pub kind: DataKind,
    /// Finding.
    pub defect: DefectKind,
    /// Allocation site, when known.
    pub site: Option<AllocSite>,
}

impl fmt::Display for DefectRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.defect {
            DefectKind::LiveNotTraced => "live but unreachable",
            DefectKind::TracedUnallocated => "reachable but unallocated",
        };
        write!(f, "{} at {:#x} {what}", self.kind, self.addr)?;
        if let Some(site) = &self.site {
            write!(f, " (allocated in {site})")?;
        }
        Ok(())
    }
}

/// The LiveSet and TracedSet of one collector.
#[derive(Debug, Default)]
pub struct LivenessOracle {
    live: HashMap<usize, LiveEntry>,
    traced: HashMap<usize, DataKind>,
}

impl LivenessOracle {
    /// Empty oracle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the runtime considers `addr` live.
    pub fn mark_live(&mut self, addr: usize, kind: DataKind, site: Option<AllocSite>) {
        self.live.insert(addr, LiveEntry { kind, site });
    }

    /// Record that the runtime released `addr`. Returns `true` if it was live.
    pub fn mark_dead(&mut self, addr: usize) -> bool {
        self.live.remove(&addr).is_some()
    }

    /// Record that the tracer reached `addr`.
    pub fn record_traced(&mut self, addr: usize, kind: DataKind) {
        self.traced.insert(addr, kind);
    }

    /// Returns `true` if `addr` is in the LiveSet.
    #[must_use]
    pub fn is_live(&self, addr: usize) -> bool {
        self.live.contains_key(&addr)
    }

    /// LiveSet entry for `addr`.
    #[must_use]
    pub fn live_entry(&self, addr: usize) -> Option<&LiveEntry> {
        self.live.get(&addr)
    }

    /// Returns `true` if the tracer reached `addr` this cycle.
    #[must_use]
    pub fn is_traced(&self, addr: usize) -> bool {
        self.traced.contains_key(&addr)
    }

    /// LiveSet size.
    #[must_use]
    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    /// TracedSet size.
    #[must_use]
    pub fn traced_len(&self) -> usize {
        self.traced.len()
    }

    /// Addresses in the LiveSet, unordered.
    pub fn live_addrs(&self) -> impl Iterator<Item = usize> + '_ {
        self.live.keys().copied()
    }

    /// LiveSet minus TracedSet, sorted by address.
    #[must_use]
    pub fn missing(&self) -> Vec<DefectRecord> {
        let mut out: Vec<DefectRecord> = self
            .live
            .iter()
            .filter(|(addr, _)| !self.traced.contains_key(addr))
            .map(|(&addr, entry)| DefectRecord {
                addr,
                kind: entry.kind,
                defect: DefectKind::LiveNotTraced,
                site: entry.site.clone(),
            })
            .collect();
        out.sort_by_key(|d| d.addr);
        out
    }

    /// Make this cycle's TracedSet the next cycle's LiveSet baseline.
    ///
    /// Allocation sites of entries that survive are kept.
    pub fn roll_over(&mut self) {
        let mut previous = std::mem::take(&mut self.live);
        self.live = self
            .traced
            .drain()
            .map(|(addr, kind)| {
                let site = previous.remove(&addr).and_then(|e| e.site);
                (addr, LiveEntry { kind, site })
            })
            .collect();
    }

    /// Discard the TracedSet without touching the LiveSet.
    pub fn clear_traced(&mut self) {
        self.traced.clear();
    }
}
