//! Per-kind census of the reachable heap.

use crate::value::DataKind;

/// Object counts and bytes per [`DataKind`], gathered while marking.
///
/// Bytes are whole blocks: a payload is charged its slab's block size, and
/// payloads outside every slab are charged nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapCensus {
    counts: [u64; DataKind::COUNT],
    bytes: [u64; DataKind::COUNT],
}

impl HeapCensus {
    /// Empty census.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            counts: [0; DataKind::COUNT],
            bytes: [0; DataKind::COUNT],
        }
    }

    /// Count one payload of `kind` occupying `bytes`.
    pub fn record(&mut self, kind: DataKind, bytes: usize) {
        self.counts[kind.index()] += 1;
        self.bytes[kind.index()] += bytes as u64;
    }

    /// Payloads of `kind`.
    #[must_use]
    pub const fn count(&self, kind: DataKind) -> u64 {
        self.counts[kind.index()]
    }

    /// Bytes charged to `kind`.
    #[must_use]
    pub const fn bytes(&self, kind: DataKind) -> u64 {
        self.bytes[kind.index()]
    }

    /// Payloads of every kind.
    #[must_use]
    pub fn total_objects(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Bytes of every kind.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.bytes.iter().sum()
    }

    /// `(kind, count, bytes)` for every kind with at least one payload.
    pub fn iter(&self) -> impl Iterator<Item = (DataKind, u64, u64)> + '_ {
        DataKind::ALL
            .into_iter()
            .filter(|k| self.count(*k) > 0)
            .map(|k| (k, self.count(k), self.bytes(k)))
    }
}
