//! End-to-end cycles over small, fully specified heaps.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{fake_string, main_frame, quiet, SyntheticSlabs};
use heaptrace::{
    Class, CommitOutcome, DataKind, Heap, HeapTracer, MarkSweepCollector, SkipReason, Value,
    VmState,
};

fn block_is_reclaimable(report: &heaptrace::ReclaimReport, addr: usize) -> bool {
    report.slabs.iter().any(|s| {
        addr >= s.base
            && addr < s.base + s.block_size * s.blocks.len()
            && s.blocks.get((addr - s.base) / s.block_size)
    })
}

#[test]
fn test_array_with_string_and_object_from_local() {
    let mut heap = Heap::new();
    let class = Arc::new(Class::new("Item", &[]));
    let x = heap.alloc_string("x").unwrap();
    let obj = heap.alloc_object(class).unwrap();
    let array = heap.alloc_array().unwrap();
    heap.array(array).unwrap().set(Value::Int(1), Value::from(x));
    heap.array(array).unwrap().set(Value::Int(2), Value::from(obj));
    let garbage = heap.alloc_array().unwrap();

    let mut vm = VmState::new();
    main_frame(&mut vm, 1);
    vm.set_local(0, Value::from(array));

    let mut gc = MarkSweepCollector::new(quiet());
    let report = gc.collect(&mut heap, &vm).unwrap();

    // The traced set becomes the next baseline.
    let oracle = gc.oracle();
    assert_eq!(oracle.live_len(), 3);
    for addr in [array.addr(), x.addr(), obj.addr()] {
        assert!(oracle.is_live(addr));
        assert!(!block_is_reclaimable(&report, addr));
    }
    assert!(block_is_reclaimable(&report, garbage.addr()));
    assert_eq!(report.reclaimable_blocks, 1);
    assert_eq!(report.census.count(DataKind::Array), 1);
    assert_eq!(report.census.count(DataKind::String), 1);
    assert_eq!(report.census.count(DataKind::Object), 1);
}

#[test]
fn test_self_referential_global_array_visited_once() {
    let mut heap = Heap::new();
    let a = heap.alloc_array().unwrap();
    heap.array(a).unwrap().set(Value::Int(0), Value::from(a));
    let globals = heap.alloc_array().unwrap();
    heap.array(globals)
        .unwrap()
        .set(Value::StaticString("a"), Value::from(a));

    let mut vm = VmState::new();
    vm.globals_mut().set("GLOBALS", Value::from(globals));

    let mut visits = 0;
    HeapTracer::new()
        .trace_heap(&vm, &heap, |node| {
            if node.current.heap_addr() == Some(a.addr()) {
                visits += 1;
            }
        })
        .unwrap();
    assert_eq!(visits, 1);

    let mut gc = MarkSweepCollector::new(quiet());
    let report = gc.collect(&mut heap, &vm).unwrap();
    assert_eq!(report.reclaimable_blocks, 0);
}

#[test]
fn test_object_without_props_has_no_children() {
    let mut heap = Heap::new();
    let obj = heap.alloc_object(Arc::new(Class::new("Empty", &[]))).unwrap();

    let mut vm = VmState::new();
    main_frame(&mut vm, 1);
    vm.set_local(0, Value::from(obj));

    let mut nodes = Vec::new();
    HeapTracer::new()
        .trace_heap(&vm, &heap, |node| nodes.push(*node))
        .unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].current, Value::from(obj));
    assert!(nodes.iter().all(|n| n.parent != Value::from(obj)));

    let mut gc = MarkSweepCollector::new(quiet());
    let report = gc.collect(&mut heap, &vm).unwrap();
    assert_eq!(report.slabs[0].used, 1);
    assert_eq!(report.reclaimable_blocks, 0);
}

#[test]
fn test_sixty_four_block_slab_forty_allocated_ten_reached() {
    const BASE: usize = 0x5555_0000;
    const BLOCK: usize = 1024;

    let mut slabs = SyntheticSlabs::new();
    slabs.add_slab(BASE, BLOCK, 0..40);

    let mut vm = VmState::new();
    main_frame(&mut vm, 10);
    for i in 0..10 {
        vm.set_local(i, fake_string(BASE + i * 4 * BLOCK));
    }

    let mut gc = MarkSweepCollector::new(quiet());
    let report = gc.collect(&mut slabs, &vm).unwrap();

    assert_eq!(report.slabs.len(), 1);
    assert_eq!(report.slabs[0].allocated, 40);
    assert_eq!(report.slabs[0].used, 10);
    assert_eq!(report.reclaimable_blocks, 30);
    assert_eq!(report.reclaimable_bytes, 30 * BLOCK as u64);
    assert_eq!(report.commit, CommitOutcome::Skipped(SkipReason::Advisory));
    assert!(slabs.recycled.is_empty());

    let reached: HashSet<usize> = (0..10).map(|i| i * 4).collect();
    for i in report.slabs[0].blocks.iter_ones() {
        assert!(i < 40);
        assert!(!reached.contains(&i));
    }
}

#[test]
fn test_unmapped_payloads_are_ignored() {
    let mut slabs = SyntheticSlabs::new();
    slabs.add_slab(0x5555_0000, 64, [0]);

    let mut vm = VmState::new();
    main_frame(&mut vm, 2);
    vm.set_local(0, Value::StaticString("interned"));
    vm.set_local(1, fake_string(0x7777_0000));

    let mut gc = MarkSweepCollector::new(quiet());
    let report = gc.collect(&mut slabs, &vm).unwrap();
    assert_eq!(report.trace.visited, 2);
    assert_eq!(report.reclaimable_blocks, 1);
    assert!(report.is_clean());
    assert_eq!(report.census.bytes(DataKind::String), 0);
}
