//! Cycles aborted by malformed interpreter state or object graphs.

mod common;

use std::sync::Arc;

use common::{main_frame, quiet};
use heaptrace::{
    global_metrics, CallerLink, Class, CollectError, CollectorPhase, DataKind, FrameId, Heap,
    FuncInfo, MarkSweepCollector, ObjectData, ReclaimPolicy, Value, VmState,
};

struct Fixture {
    heap: Heap,
    vm: VmState,
    gc: MarkSweepCollector,
}

impl Fixture {
    /// A `main` frame holding one rooted array, with the collector in
    /// commit mode so any allocator mutation would be visible.
    fn new() -> Self {
        let mut heap = Heap::new();
        let mut vm = VmState::new();
        main_frame(&mut vm, 2);
        let root = heap.alloc_array().unwrap();
        vm.set_local(0, Value::from(root));
        let mut gc = MarkSweepCollector::new(quiet().with_reclaim(ReclaimPolicy::Commit));
        gc.mark_object_live(root.addr(), DataKind::Array, None);
        // Unreachable garbage a commit would otherwise release.
        heap.alloc_string("garbage").unwrap();
        Self { heap, vm, gc }
    }

    fn root_object(&mut self, data: ObjectData) -> Value {
        let obj = Value::from(self.heap.alloc(data).unwrap());
        if let Some(addr) = obj.heap_addr() {
            self.gc.mark_object_live(addr, DataKind::Object, None);
        }
        self.vm.set_local(1, obj);
        obj
    }

    /// Run a cycle that must fail, and check it left no trace behind.
    fn collect_err(&mut self) -> CollectError {
        let cells = self.heap.cells_in_use();
        let blocks = self.heap.arena().blocks_in_use();
        let live = self.gc.oracle().live_len();
        let failures = global_metrics().total_failed_cycles();

        let err = self.gc.collect(&mut self.heap, &self.vm).unwrap_err();

        assert_eq!(self.gc.phase(), CollectorPhase::Idle);
        assert_eq!(self.gc.oracle().live_len(), live);
        assert_eq!(self.gc.oracle().traced_len(), 0);
        assert_eq!(self.heap.cells_in_use(), cells);
        assert_eq!(self.heap.arena().blocks_in_use(), blocks);
        assert!(global_metrics().total_failed_cycles() > failures);
        err
    }
}

#[test]
fn test_frame_without_function() {
    let mut fx = Fixture::new();
    fx.vm.frame_mut(FrameId(0)).unwrap().set_func(None);
    let err = fx.collect_err();
    assert!(matches!(err, CollectError::MissingFunc { frame: FrameId(0) }));
}

#[test]
fn test_dangling_current_frame() {
    let mut fx = Fixture::new();
    fx.vm.set_current_frame(Some(FrameId(9)));
    let err = fx.collect_err();
    assert!(matches!(err, CollectError::DanglingFrame { frame: FrameId(9) }));
}

#[test]
fn test_caller_chain_loops_back() {
    let mut fx = Fixture::new();
    fx.vm
        .push_frame(Arc::new(FuncInfo::new("inner", 0, 1)), &[]);
    fx.vm.frame_mut(FrameId(0)).unwrap().set_caller(Some(CallerLink {
        frame: FrameId(1),
        pc: 0,
        stack_top: 1,
    }));
    let err = fx.collect_err();
    assert!(matches!(err, CollectError::FrameChainCycle { frame: FrameId(1) }));
}

#[test]
fn test_locals_outside_stack() {
    let mut fx = Fixture::new();
    fx.vm.frame_mut(FrameId(0)).unwrap().set_locals_base(100);
    let err = fx.collect_err();
    match err {
        CollectError::StackOutOfBounds {
            frame,
            base,
            top,
            stack_top,
        } => {
            assert_eq!(frame, FrameId(0));
            assert_eq!(base, 100);
            assert_eq!(top, 2);
            assert_eq!(stack_top, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_object_without_class() {
    let mut fx = Fixture::new();
    let obj = fx.root_object(ObjectData::detached(2));
    let err = fx.collect_err();
    assert!(
        matches!(err, CollectError::MissingClass { addr } if Some(addr) == obj.heap_addr())
    );
}

#[test]
fn test_object_missing_declared_slots() {
    let mut fx = Fixture::new();
    let class = Arc::new(Class::new("Point", &["x", "y", "z"]));
    let obj = fx.root_object(ObjectData::new(class));
    let data = fx.heap.object(obj.as_object().unwrap()).unwrap();
    data.truncate_props(1);

    let err = fx.collect_err();
    match err {
        CollectError::PropertySlotsMissing {
            declared, present, ..
        } => {
            assert_eq!(declared, 3);
            assert_eq!(present, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_recovers_once_state_is_repaired() {
    let mut fx = Fixture::new();
    fx.vm.set_current_frame(Some(FrameId(3)));
    fx.collect_err();

    fx.vm.set_current_frame(Some(FrameId(0)));
    let report = fx.gc.collect(&mut fx.heap, &fx.vm).unwrap();
    assert!(report.is_clean());
    assert_eq!(report.reclaimable_blocks, 1);
    assert_eq!(fx.heap.cells_in_use(), 1);
}
