//! Cross-checking traced reachability against refcount liveness.

mod common;

use std::sync::Arc;

use common::{fake_string, main_frame, quiet, SyntheticSlabs};
use heaptrace::{
    Class, CollectorConfig, DataKind, DefectKind, ExecutionContext, FuncInfo, MarkSweepCollector,
    Value, VmState,
};

fn context() -> ExecutionContext {
    let mut cx = ExecutionContext::new(quiet());
    cx.vm_mut()
        .push_frame(Arc::new(FuncInfo::new("main", 0, 2)), &[]);
    cx
}

#[test]
fn test_clean_heap_has_no_defects() {
    let mut cx = context();
    let class = Arc::new(Class::new("Pair", &["l", "r"]));
    let l = cx.alloc_string("left").unwrap();
    let r = cx.alloc_list(&[Value::Int(1), Value::Bool(true)]).unwrap();
    let pair = cx.alloc_object(&class).unwrap();
    cx.heap().object(pair).unwrap().set_prop(0, Value::from(l));
    cx.heap().object(pair).unwrap().set_prop(1, Value::from(r));
    cx.vm_mut().set_local(0, Value::from(pair));
    let cell = cx.alloc_ref(Value::from(pair)).unwrap();
    cx.set_global("cell", Value::from(cell)).unwrap();

    let report = cx.collect().unwrap();
    assert!(report.is_clean(), "{:?}", report.validation_defects);
    assert_eq!(report.reclaimable_blocks, 0);
}

#[test]
fn test_second_collect_is_identical_and_clean() {
    let mut cx = context();
    let kept = cx.alloc_list(&[]).unwrap();
    cx.vm_mut().set_local(0, Value::from(kept));
    let _leak1 = cx.alloc_string("leak").unwrap();
    let _leak2 = cx.alloc_array().unwrap();

    let first = cx.collect().unwrap();
    assert_eq!(first.validation_defects.len(), 2);

    let second = cx.collect().unwrap();
    assert!(second.is_clean());
    assert_eq!(second.reclaimable_blocks, first.reclaimable_blocks);
    assert_eq!(second.reclaimable_bytes, first.reclaimable_bytes);
    assert_eq!(second.slabs, first.slabs);
}

#[test]
fn test_idempotent_over_synthetic_allocator() {
    const BASE: usize = 0x4440_0000;
    let mut slabs = SyntheticSlabs::new();
    slabs.add_slab(BASE, 256, 0..100);
    let mut vm = VmState::new();
    main_frame(&mut vm, 3);
    for i in 0..3 {
        vm.set_local(i, fake_string(BASE + i * 256));
    }

    let mut gc = MarkSweepCollector::new(quiet());
    let first = gc.collect(&mut slabs, &vm).unwrap();
    let second = gc.collect(&mut slabs, &vm).unwrap();
    assert_eq!(first.reclaimable_blocks, 97);
    assert_eq!(second.reclaimable_blocks, 97);
    assert!(second.is_clean());
    assert_eq!(slabs.allocated_count(), 100);
}

#[test]
fn test_leaks_reported_sorted_with_sites() {
    let mut cx = context();
    cx.vm_mut()
        .push_frame(Arc::new(FuncInfo::new("build_cache", 0, 0)), &[]);
    let a = cx.alloc_array().unwrap();
    let b = cx.alloc_string("orphan").unwrap();
    cx.vm_mut().pop_frame();
    let c = cx.alloc_array().unwrap();

    let report = cx.collect().unwrap();
    let defects: Vec<_> = report.defects_of(DefectKind::LiveNotTraced).collect();
    assert_eq!(defects.len(), 3);
    assert!(defects.windows(2).all(|w| w[0].addr < w[1].addr));

    let by_addr = |addr: usize| defects.iter().find(|d| d.addr == addr).unwrap();
    assert_eq!(by_addr(a.addr()).kind, DataKind::Array);
    assert_eq!(by_addr(b.addr()).kind, DataKind::String);
    assert_eq!(
        by_addr(b.addr()).site.as_ref().unwrap().frames,
        vec!["build_cache".to_owned(), "main".to_owned()]
    );
    assert_eq!(
        by_addr(c.addr()).site.as_ref().unwrap().frames,
        vec!["main".to_owned()]
    );
}

#[test]
fn test_sites_can_be_disabled() {
    let mut cx = ExecutionContext::new(quiet().with_alloc_sites(false));
    let leak = cx.alloc_array().unwrap();
    let report = cx.collect().unwrap();
    assert_eq!(report.validation_defects[0].addr, leak.addr());
    assert!(report.validation_defects[0].site.is_none());
}

#[test]
fn test_released_value_still_referenced_is_traced_unallocated() {
    let mut cx = context();
    let s = cx.alloc_string("freed").unwrap();
    let arr = cx.alloc_array().unwrap();
    cx.vm_mut().set_local(0, Value::from(s));
    cx.vm_mut().set_local(1, Value::from(arr));
    assert!(cx.release(Value::from(s)));
    assert!(cx.release(Value::from(arr)));

    let report = cx.collect().unwrap();
    let found: Vec<usize> = report
        .defects_of(DefectKind::TracedUnallocated)
        .map(|d| d.addr)
        .collect();
    assert_eq!(found.len(), 2);
    assert!(found.contains(&s.addr()));
    assert!(found.contains(&arr.addr()));
    for slab in &report.slabs {
        assert!(slab.used <= slab.allocated);
    }
}

#[test]
fn test_validation_off_reports_nothing_live() {
    let mut cx = ExecutionContext::new(quiet().with_validate(false));
    let _leak = cx.alloc_array().unwrap();
    let report = cx.collect().unwrap();
    assert!(report.is_clean());
    assert_eq!(report.reclaimable_blocks, 1);
    assert_eq!(cx.collector().oracle().live_len(), 0);
}

#[test]
fn test_census_off_leaves_census_empty() {
    let mut cx = ExecutionContext::new(
        CollectorConfig::new()
            .with_census(false)
            .with_publish_stats(false),
    );
    cx.set_global("k", Value::Int(1)).unwrap();
    let report = cx.collect().unwrap();
    assert_eq!(report.census.total_objects(), 0);
    assert_eq!(report.trace.visited, 2);
}
