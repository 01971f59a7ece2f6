//! Breadth-first reachability over the runtime's value graph.
//!
//! Roots come from the frame chain, innermost first, and then the globals
//! array. For each frame the order is: bound receiver, extra arguments,
//! dynamic environment, declared locals from last to first, and finally the
//! frame's stack temporaries. Every distinct payload address is handed to
//! the visit callback exactly once per trace.
//!
//! Payloads are only dereferenced when the caller's [`CellOwner`] vouches
//! for their address. A handle it does not own, such as one left over from
//! a heap that has since been dropped, is visited as a childless leaf.

use std::collections::{HashSet, VecDeque};

use crate::config::DEFAULT_GLOBALS_NAME;
use crate::error::{CollectError, Result};
use crate::exec::{ExecutionState, FrameId, FrameView, Offset, StackPtr};
use crate::value::{CellOwner, Value};

/// A unit of traversal work.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchNode {
    /// The value to visit.
    pub current: Value,
    /// What it was reached from; [`Value::Uninit`] for roots.
    pub parent: Value,
}

impl SearchNode {
    const fn root(current: Value) -> Self {
        Self {
            current,
            parent: Value::Uninit,
        }
    }
}

/// Counters from one trace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceStats {
    /// Root values enqueued.
    pub roots: usize,
    /// Frames walked.
    pub frames: usize,
    /// Distinct payloads visited.
    pub visited: usize,
}

/// Reusable traversal state.
///
/// The reachable set and queue are empty between calls to
/// [`HeapTracer::trace_heap`], whether the previous trace succeeded or not.
#[derive(Debug)]
pub struct HeapTracer {
    reachable: HashSet<usize>,
    queue: VecDeque<SearchNode>,
    globals_name: &'static str,
}

impl Default for HeapTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapTracer {
    /// Tracer reading globals from the `GLOBALS` entry.
    #[must_use]
    pub fn new() -> Self {
        Self::with_globals_name(DEFAULT_GLOBALS_NAME)
    }

    /// Tracer reading globals from the `name` entry of the global table.
    #[must_use]
    pub fn with_globals_name(name: &'static str) -> Self {
        Self {
            reachable: HashSet::new(),
            queue: VecDeque::new(),
            globals_name: name,
        }
    }

    /// Visit every payload reachable from `state`, reading children only
    /// from cells owned by `cells`.
    ///
    /// # Errors
    ///
    /// Structural corruption in frames, the stack or object metadata. The
    /// callback may already have seen some nodes when this happens.
    pub fn trace_heap<S, C, F>(
        &mut self,
        state: &S,
        cells: &C,
        mut visit: F,
    ) -> Result<TraceStats>
    where
        S: ExecutionState + ?Sized,
        C: CellOwner + ?Sized,
        F: FnMut(&SearchNode),
    {
        let result = self.run(state, cells, &mut visit);
        self.reachable.clear();
        self.queue.clear();
        result
    }

    fn run<S, C, F>(&mut self, state: &S, cells: &C, visit: &mut F) -> Result<TraceStats>
    where
        S: ExecutionState + ?Sized,
        C: CellOwner + ?Sized,
        F: FnMut(&SearchNode),
    {
        let mut stats = TraceStats::default();

        if let Some(fp) = state.current_frame() {
            self.enqueue_frames(state, fp, state.program_offset(), state.stack_top(), &mut stats)?;
        }
        if let Some(globals) = state.global_table().lookup(self.globals_name) {
            self.queue.push_back(SearchNode::root(globals));
        }
        stats.roots = self.queue.len();

        #[cfg(feature = "tracing")]
        tracing::debug!(roots = stats.roots, frames = stats.frames, "roots_enqueued");

        while let Some(node) = self.queue.pop_front() {
            let Some(addr) = node.current.heap_addr() else {
                continue;
            };
            if !self.reachable.insert(addr) {
                continue;
            }
            visit(&node);
            stats.visited += 1;
            self.expand(cells, node.current, addr)?;
        }
        Ok(stats)
    }

    fn enqueue_frames<S>(
        &mut self,
        state: &S,
        fp: FrameId,
        pc: Offset,
        top: StackPtr,
        stats: &mut TraceStats,
    ) -> Result<()>
    where
        S: ExecutionState + ?Sized,
    {
        let mut seen = HashSet::new();
        let mut cursor = Some((fp, pc, top));

        while let Some((id, pc, top)) = cursor {
            if !seen.insert(id) {
                return Err(CollectError::FrameChainCycle { frame: id });
            }
            let frame = state
                .frame(id)
                .ok_or(CollectError::DanglingFrame { frame: id })?;
            let func = frame.func().ok_or(CollectError::MissingFunc { frame: id })?;

            #[cfg(feature = "tracing")]
            tracing::trace!(frame = %id, func = %func.name, pc, "walk_frame");
            #[cfg(not(feature = "tracing"))]
            let _ = pc;

            stats.frames += 1;

            // 1. Bound receiver
            if let Some(this) = frame.receiver() {
                self.push_root(Value::Object(Some(this)));
            }

            // 2. Arguments beyond the declared parameters
            let extra = frame.num_args().saturating_sub(func.num_params);
            for i in 0..extra {
                if let Some(arg) = frame.extra_arg(i) {
                    self.push_root(arg);
                }
            }

            // 3. Dynamic environment; local markers are metadata
            if let Some(env) = frame.dynamic_env() {
                for (_, value) in env.iter() {
                    if !matches!(value, Value::NamedLocal(_)) {
                        self.push_root(value);
                    }
                }
            }

            // 4. Declared locals, last to first
            let base = frame.locals_base();
            let out_of_bounds = || CollectError::StackOutOfBounds {
                frame: id,
                base,
                top,
                stack_top: state.stack_top(),
            };
            let locals_end = base
                .checked_add(func.num_locals)
                .filter(|&end| end <= top)
                .ok_or_else(out_of_bounds)?;
            let slots = state.stack_slots(base..top).ok_or_else(out_of_bounds)?;
            let (locals, temporaries) = slots.split_at(locals_end - base);
            for &local in locals.iter().rev() {
                self.push_root(local);
            }
            // 5. Everything above the locals up to the frame's stack top
            self.scan_temporaries(temporaries);

            cursor = frame.caller().map(|link| (link.frame, link.pc, link.stack_top));
        }
        Ok(())
    }

    fn push_root(&mut self, value: Value) {
        self.queue.push_back(SearchNode::root(value));
    }

    /// Best-effort root region: every slot between a frame's locals and its
    /// stack top is a root, whether or not the interpreter still needs it.
    /// Dead temporaries may keep garbage reachable; a live one is never
    /// missed.
    fn scan_temporaries(&mut self, slots: &[Value]) {
        for &slot in slots {
            self.push_root(slot);
        }
    }

    fn push_child(&mut self, parent: Value, child: Value) {
        self.queue.push_back(SearchNode {
            current: child,
            parent,
        });
    }

    fn expand<C>(&mut self, cells: &C, current: Value, addr: usize) -> Result<()>
    where
        C: CellOwner + ?Sized,
    {
        match current {
            Value::Array(Some(array)) => {
                let Some(data) = array.resolve_in(cells) else {
                    return Ok(());
                };
                for &(key, value) in data.entries().iter() {
                    self.push_child(current, key);
                    self.push_child(current, value);
                }
            }
            Value::Ref(Some(cell)) => {
                if let Some(data) = cell.resolve_in(cells) {
                    self.push_child(current, data.get());
                }
            }
            Value::Object(Some(object)) => {
                let Some(data) = object.resolve_in(cells) else {
                    return Ok(());
                };
                let class = data.class().ok_or(CollectError::MissingClass { addr })?;
                let declared = class.declared_property_count();
                let props = data.props();
                if props.len() < declared {
                    return Err(CollectError::PropertySlotsMissing {
                        addr,
                        declared,
                        present: props.len(),
                    });
                }
                for &prop in &props[..declared] {
                    self.push_child(current, prop);
                }
                if let Some(table) = data.dyn_props() {
                    self.push_child(current, Value::Array(Some(table)));
                }
            }
            Value::Uninit
            | Value::Null
            | Value::Bool(_)
            | Value::Int(_)
            | Value::Double(_)
            | Value::StaticString(_)
            | Value::String(_)
            | Value::Resource(_)
            | Value::NamedLocal(_)
            | Value::Array(None)
            | Value::Ref(None)
            | Value::Object(None) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::exec::{FuncInfo, VmState};
    use crate::heap::Heap;
    use crate::value::{Class, DataKind};

    fn func(name: &str, params: usize, locals: usize) -> Arc<FuncInfo> {
        Arc::new(FuncInfo::new(name, params, locals))
    }

    fn trace(heap: &Heap, vm: &VmState) -> Result<Vec<SearchNode>> {
        let mut nodes = Vec::new();
        HeapTracer::new().trace_heap(vm, heap, |n| nodes.push(*n))?;
        Ok(nodes)
    }

    fn addrs(nodes: &[SearchNode]) -> Vec<usize> {
        nodes.iter().filter_map(|n| n.current.heap_addr()).collect()
    }

    #[test]
    fn test_idle_state_visits_nothing() {
        let heap = Heap::new();
        let vm = VmState::new();
        let mut tracer = HeapTracer::new();
        let stats = tracer
            .trace_heap(&vm, &heap, |_| panic!("nothing to visit"))
            .unwrap();
        assert_eq!(stats, TraceStats::default());
    }

    #[test]
    fn test_frame_root_order() {
        let mut heap = Heap::new();
        let class = Arc::new(Class::new("C", &[]));
        let this = heap.alloc_object(Arc::clone(&class)).unwrap();
        let extra = heap.alloc_string("extra").unwrap();
        let dynamic = heap.alloc_string("dyn").unwrap();
        let local0 = heap.alloc_string("l0").unwrap();
        let local1 = heap.alloc_string("l1").unwrap();
        let temp = heap.alloc_string("t").unwrap();

        let mut vm = VmState::new();
        vm.push_method_frame(func("m", 1, 2), this, &[Value::from(local0), Value::from(extra)]);
        vm.set_local(1, Value::from(local1));
        vm.set_dynamic("d", Value::from(dynamic));
        vm.bind_named_local("alias", 0);
        vm.push(Value::from(temp));

        assert_eq!(
            addrs(&trace(&heap, &vm).unwrap()),
            vec![
                this.addr(),
                extra.addr(),
                dynamic.addr(),
                local1.addr(),
                local0.addr(),
                temp.addr()
            ]
        );
    }

    #[test]
    fn test_shared_and_cyclic_payloads_visit_once() {
        let mut heap = Heap::new();
        let a = heap.alloc_array().unwrap();
        let b = heap.alloc_array().unwrap();
        heap.array(a).unwrap().push(Value::from(b));
        heap.array(b).unwrap().push(Value::from(a));
        heap.array(b).unwrap().push(Value::from(b));

        let mut vm = VmState::new();
        vm.push_frame(func("main", 0, 2), &[]);
        vm.set_local(0, Value::from(a));
        vm.set_local(1, Value::from(a));

        let nodes = trace(&heap, &vm).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1].parent, Value::from(a));
    }

    #[test]
    fn test_globals_traced_after_frames() {
        let mut heap = Heap::new();
        let globals = heap.alloc_array().unwrap();
        let g = heap.alloc_string("g").unwrap();
        heap.array(globals).unwrap().set(Value::StaticString("x"), Value::from(g));

        let mut vm = VmState::new();
        vm.globals_mut().set("GLOBALS", Value::from(globals));
        vm.globals_mut().set("unrelated", Value::Int(3));

        let nodes = trace(&heap, &vm).unwrap();
        let kinds: Vec<DataKind> = nodes.iter().map(|n| n.current.kind()).collect();
        assert_eq!(kinds, vec![DataKind::Array, DataKind::StaticString, DataKind::String]);
    }

    #[test]
    fn test_object_props_and_dyn_table() {
        let mut heap = Heap::new();
        let class = Arc::new(Class::new("P", &["a", "b"]));
        let obj = heap.alloc_object(class).unwrap();
        let dyn_table = heap.alloc_array().unwrap();
        let s = heap.alloc_string("v").unwrap();
        heap.object(obj).unwrap().set_prop(1, Value::from(s));
        heap.object(obj).unwrap().set_dyn_props(Some(dyn_table));

        let mut vm = VmState::new();
        vm.push_frame(func("main", 0, 1), &[]);
        vm.set_local(0, Value::from(obj));

        let visited: HashSet<usize> = addrs(&trace(&heap, &vm).unwrap()).into_iter().collect();
        assert_eq!(
            visited,
            HashSet::from([obj.addr(), s.addr(), dyn_table.addr()])
        );
    }

    #[test]
    fn test_empty_handles_are_leaves() {
        let heap = Heap::new();
        let mut vm = VmState::new();
        vm.push_frame(func("main", 0, 3), &[]);
        vm.set_local(0, Value::Array(None));
        vm.set_local(1, Value::Object(None));
        vm.set_local(2, Value::Ref(None));
        assert!(trace(&heap, &vm).unwrap().is_empty());
    }

    #[test]
    fn test_reachable_set_reset_after_error() {
        let mut heap = Heap::new();
        let s = heap.alloc_string("s").unwrap();
        let mut vm = VmState::new();
        vm.push_frame(func("main", 0, 1), &[]);
        vm.set_local(0, Value::from(s));

        let mut tracer = HeapTracer::new();
        vm.frame_mut(FrameId(0)).unwrap().set_func(None);
        assert!(matches!(
            tracer.trace_heap(&vm, &heap, |_| {}),
            Err(CollectError::MissingFunc { .. })
        ));

        vm.frame_mut(FrameId(0)).unwrap().set_func(Some(func("main", 0, 1)));
        let mut count = 0;
        tracer.trace_heap(&vm, &heap, |_| count += 1).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_caller_frames_walked_from_saved_link() {
        let mut heap = Heap::new();
        let main_local = heap.alloc_string("main local").unwrap();
        let main_temp = heap.alloc_string("main temp").unwrap();
        let g_local = heap.alloc_string("g local").unwrap();
        let g_temp = heap.alloc_string("g temp").unwrap();

        let mut vm = VmState::new();
        vm.push_frame(func("main", 0, 1), &[]);
        vm.set_local(0, Value::from(main_local));
        vm.push(Value::from(main_temp));
        vm.set_pc(7);
        let g = vm.push_frame(func("g", 0, 1), &[]);
        vm.set_local(0, Value::from(g_local));
        vm.push(Value::from(g_temp));

        let link = vm.frame(g).and_then(FrameView::caller).unwrap();
        assert_eq!((link.frame, link.pc, link.stack_top), (FrameId(0), 7, 2));

        let mut nodes = Vec::new();
        let stats = HeapTracer::new()
            .trace_heap(&vm, &heap, |n| nodes.push(*n))
            .unwrap();
        assert_eq!(
            addrs(&nodes),
            vec![
                g_local.addr(),
                g_temp.addr(),
                main_local.addr(),
                main_temp.addr()
            ]
        );
        assert_eq!(stats.frames, 2);
        // No slot of the callee is scanned again as a caller temporary.
        assert_eq!(stats.roots, 4);
        assert_eq!(stats.visited, 4);
    }

    #[test]
    fn test_handles_from_dropped_heap_are_leaves() {
        let mut vm = VmState::new();
        vm.push_frame(func("main", 0, 1), &[]);
        let stale = {
            let mut old = Heap::new();
            let array = old.alloc_array().unwrap();
            let s = old.alloc_string("gone").unwrap();
            old.array(array).unwrap().push(Value::from(s));
            array
        };
        vm.set_local(0, Value::from(stale));

        let heap = Heap::new();
        let nodes = trace(&heap, &vm).unwrap();
        assert_eq!(addrs(&nodes), vec![stale.addr()]);
    }

    #[test]
    fn test_children_read_only_from_owning_heap() {
        let mut owner = Heap::new();
        let mut other = Heap::new();
        let array = owner.alloc_array().unwrap();
        let s = owner.alloc_string("child").unwrap();
        owner.array(array).unwrap().push(Value::from(s));

        let mut vm = VmState::new();
        vm.push_frame(func("main", 0, 1), &[]);
        vm.set_local(0, Value::from(array));

        assert_eq!(trace(&owner, &vm).unwrap().len(), 2);
        other.alloc_array().unwrap();
        assert_eq!(trace(&other, &vm).unwrap().len(), 1);
    }
}
