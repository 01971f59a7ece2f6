//! A diagnostic tracing collector for reference-counted runtimes.
//!
//! `heaptrace` walks a runtime's call frames and globals, discovers every
//! heap value reachable from them, and compares that against what the
//! refcounting side believes is alive. Each cycle reports which allocator
//! blocks could be reclaimed if tracing replaced refcounting, plus every
//! object the refcount bookkeeping keeps alive that nothing points to.
//!
//! # Architecture
//!
//! - [`Value`]: closed sum over runtime data; heap kinds carry an optional
//!   [`HeapRef`] (`None` is the fake/empty payload).
//! - [`ExecutionState`] / [`FrameView`]: read-only view of the interpreter;
//!   [`VmState`] is a reference implementation.
//! - [`HeapTracer`]: root discovery and breadth-first graph walk. Children
//!   are only read from cells a [`CellOwner`] (normally the [`Heap`])
//!   vouches for.
//! - [`MarkSweepCollector`]: snapshots slabs, marks, validates, accounts and
//!   optionally commits the reclaim set.
//! - [`ExecutionContext`]: owns a [`Heap`], a [`VmState`] and a collector.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use heaptrace::{Class, CollectorConfig, ExecutionContext, FuncInfo, Value};
//!
//! let mut cx = ExecutionContext::new(CollectorConfig::default());
//! cx.vm_mut().push_frame(Arc::new(FuncInfo::new("main", 0, 1)), &[]);
//!
//! let point = Arc::new(Class::new("Point", &["x", "y"]));
//! let obj = cx.alloc_object(&point)?;
//! let list = cx.alloc_list(&[Value::Int(1), Value::from(obj)])?;
//! cx.vm_mut().set_local(0, Value::from(list));
//!
//! let report = cx.collect()?;
//! assert_eq!(report.trace.visited, 2);
//! assert_eq!(report.reclaimable_blocks, 0);
//! assert!(report.is_clean());
//! # Ok::<(), heaptrace::CollectError>(())
//! ```
//!
//! # Thread Safety
//!
//! A collector, its heap and its VM state are confined to one thread. Only
//! [`CollectRequest`] handles and the [`StatsRegistry`] are shared.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod census;
mod config;
mod context;
mod error;
pub mod exec;
mod gc;
pub mod heap;
pub mod metrics;
pub mod stats;
mod telemetry;
mod tracer;
pub mod value;

pub use census::HeapCensus;
pub use config::{CollectorConfig, ReclaimPolicy, DEFAULT_GLOBALS_NAME};
pub use context::ExecutionContext;
pub use error::{CollectError, Result};
pub use exec::{
    CallerLink, ExecutionState, FrameId, FrameView, FuncInfo, NameValueTable, Offset, StackPtr,
    VmState,
};
pub use gc::{
    AllocSite, CollectRequest, CollectorPhase, CommitOutcome, DefectKind, DefectRecord, LiveEntry,
    LivenessOracle, MarkOutcome, MarkSweepCollector, ReclaimReport, SkipReason, SlabDirectory,
    SlabReclaim, SlabSource, SlabTrackingRecord,
};
pub use heap::Heap;
pub use metrics::{global_metrics, CycleMetrics, GlobalMetrics};
pub use stats::{global_stats, Histogram, StatsRegistry, StatsSnapshot};
pub use telemetry::{next_cycle_id, CycleId};
pub use tracer::{HeapTracer, SearchNode, TraceStats};
pub use value::{
    ArrayData, ArrayRef, CellOwner, Class, DataKind, Handle, HeapRef, ObjectData, ObjectRef,
    RefData, RefRef, ResourceData, ResourceRef, StringData, StringRef, Value,
};

pub use slab_alloc::{BlockBitmap, SlabInfo};
