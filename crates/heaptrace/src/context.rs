//! Per-request owner of the heap, interpreter state and collector.
//!
//! Allocation and release go through the context so the collector's
//! LiveSet tracks exactly what the refcounting side believes is alive.

use std::sync::Arc;

use crate::config::CollectorConfig;
use crate::error::Result;
use crate::exec::VmState;
use crate::gc::{AllocSite, CollectRequest, MarkSweepCollector, ReclaimReport};
use crate::heap::Heap;
use crate::value::{ArrayRef, Class, ObjectRef, RefRef, ResourceRef, StringRef, Value};

/// One logical request: a heap, the VM running over it and its collector.
///
/// # Example
///
/// ```
/// use heaptrace::{CollectorConfig, ExecutionContext, FuncInfo, Value};
/// use std::sync::Arc;
///
/// let mut cx = ExecutionContext::new(CollectorConfig::default());
/// cx.vm_mut().push_frame(Arc::new(FuncInfo::new("main", 0, 1)), &[]);
/// let s = cx.alloc_string("hello")?;
/// cx.vm_mut().set_local(0, Value::from(s));
/// cx.alloc_array()?; // reported live, but nothing points at it
///
/// let report = cx.collect()?;
/// assert_eq!(report.reclaimable_blocks, 1);
/// assert_eq!(report.validation_defects.len(), 1);
/// # Ok::<(), heaptrace::CollectError>(())
/// ```
#[derive(Debug)]
pub struct ExecutionContext {
    heap: Heap,
    vm: VmState,
    collector: MarkSweepCollector,
    globals: Option<ArrayRef>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(CollectorConfig::default())
    }
}

impl ExecutionContext {
    /// Fresh context.
    #[must_use]
    pub fn new(config: CollectorConfig) -> Self {
        Self {
            heap: Heap::new(),
            vm: VmState::new(),
            collector: MarkSweepCollector::new(config),
            globals: None,
        }
    }

    /// The heap.
    #[must_use]
    pub const fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The VM state.
    #[must_use]
    pub const fn vm(&self) -> &VmState {
        &self.vm
    }

    /// Mutable VM state.
    pub fn vm_mut(&mut self) -> &mut VmState {
        &mut self.vm
    }

    /// The collector.
    #[must_use]
    pub const fn collector(&self) -> &MarkSweepCollector {
        &self.collector
    }

    /// Mutable collector, for feeding refcount hooks directly.
    pub fn collector_mut(&mut self) -> &mut MarkSweepCollector {
        &mut self.collector
    }

    fn track(&mut self, value: Value) {
        let Some(addr) = value.heap_addr() else {
            return;
        };
        let site = self
            .collector
            .config()
            .capture_alloc_sites
            .then(|| AllocSite::new(self.vm.backtrace()));
        self.collector.mark_object_live(addr, value.kind(), site);
    }

    /// Allocate a string and report it live.
    ///
    /// # Errors
    ///
    /// Allocator failure.
    pub fn alloc_string(&mut self, text: &str) -> Result<StringRef> {
        let r = self.heap.alloc_string(text)?;
        self.track(Value::from(r));
        Ok(r)
    }

    /// Allocate an empty array and report it live.
    ///
    /// # Errors
    ///
    /// Allocator failure.
    pub fn alloc_array(&mut self) -> Result<ArrayRef> {
        let r = self.heap.alloc_array()?;
        self.track(Value::from(r));
        Ok(r)
    }

    /// Allocate an array holding `values` under keys `0..` and report it live.
    ///
    /// # Errors
    ///
    /// Allocator failure.
    pub fn alloc_list(&mut self, values: &[Value]) -> Result<ArrayRef> {
        let r = self.alloc_array()?;
        if let Some(array) = self.heap.array(r) {
            for &v in values {
                array.push(v);
            }
        }
        Ok(r)
    }

    /// Allocate an instance of `class` and report it live.
    ///
    /// Instances of classes with a destructor are also registered as
    /// destructor obligations.
    ///
    /// # Errors
    ///
    /// Allocator failure.
    pub fn alloc_object(&mut self, class: &Arc<Class>) -> Result<ObjectRef> {
        let r = self.heap.alloc_object(Arc::clone(class))?;
        self.track(Value::from(r));
        if class.has_destructor() {
            self.collector.mark_destructable(r);
        }
        Ok(r)
    }

    /// Allocate a resource and report it live.
    ///
    /// # Errors
    ///
    /// Allocator failure.
    pub fn alloc_resource(&mut self, name: &str) -> Result<ResourceRef> {
        let r = self.heap.alloc_resource(name)?;
        self.track(Value::from(r));
        Ok(r)
    }

    /// Allocate a reference cell and report it live.
    ///
    /// # Errors
    ///
    /// Allocator failure.
    pub fn alloc_ref(&mut self, target: Value) -> Result<RefRef> {
        let r = self.heap.alloc_ref(target)?;
        self.track(Value::from(r));
        Ok(r)
    }

    /// Refcount reached zero: destroy `value` and report it dead.
    ///
    /// Releasing the globals array also unlinks it from the global table;
    /// the next global store starts a fresh one.
    pub fn release(&mut self, value: Value) -> bool {
        let Some(addr) = value.heap_addr() else {
            return false;
        };
        if !self.heap.release(value) {
            return false;
        }
        self.collector.mark_object_dead(addr);
        if let Some(g) = self.globals.filter(|g| g.addr() == addr) {
            self.globals = None;
            let name = self.collector.config().globals_name;
            let table = self.vm.globals_mut();
            if table.lookup(name) == Some(Value::from(g)) {
                table.remove(name);
            }
        }
        true
    }

    /// The globals array, allocating it on first use.
    ///
    /// # Errors
    ///
    /// Allocator failure.
    pub fn globals_array(&mut self) -> Result<ArrayRef> {
        if let Some(g) = self.globals.filter(|&g| self.heap.array(g).is_some()) {
            return Ok(g);
        }
        let g = self.alloc_array()?;
        let name = self.collector.config().globals_name;
        self.vm.globals_mut().set(name, Value::from(g));
        self.globals = Some(g);
        Ok(g)
    }

    /// Store `value` as global `name`.
    ///
    /// The key string is allocated the first time `name` is stored and
    /// reused on every overwrite.
    ///
    /// # Errors
    ///
    /// Allocator failure.
    pub fn set_global(&mut self, name: &str, value: Value) -> Result<()> {
        let globals = self.globals_array()?;
        let existing = self
            .heap
            .array(globals)
            .and_then(|array| array.string_key(&self.heap, name));
        let key = match existing {
            Some(key) => key,
            None => Value::from(self.alloc_string(name)?),
        };
        if let Some(array) = self.heap.array(globals) {
            array.set_in(&self.heap, key, value);
        }
        Ok(())
    }

    /// Value of global `name`.
    #[must_use]
    pub fn global(&self, name: &str) -> Option<Value> {
        let array = self.heap.array(self.globals?)?;
        let key = array.string_key(&self.heap, name)?;
        array.get_in(&self.heap, &key)
    }

    /// Run a cycle over this context.
    ///
    /// # Errors
    ///
    /// Structural defects in the VM state or object graph.
    pub fn collect(&mut self) -> Result<ReclaimReport> {
        self.collector.collect(&mut self.heap, &self.vm)
    }

    /// Run a cycle if one was requested.
    ///
    /// # Errors
    ///
    /// As [`ExecutionContext::collect`].
    pub fn safepoint(&mut self) -> Result<Option<ReclaimReport>> {
        self.collector.safepoint(&mut self.heap, &self.vm)
    }

    /// Handle other threads can use to request a collection.
    #[must_use]
    pub fn request_handle(&self) -> CollectRequest {
        self.collector.request_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReclaimPolicy, DEFAULT_GLOBALS_NAME};
    use crate::exec::FuncInfo;
    use crate::gc::{CommitOutcome, DefectKind};

    fn config() -> CollectorConfig {
        CollectorConfig::new().with_publish_stats(false)
    }

    #[test]
    fn test_alloc_records_backtrace_site() {
        let mut cx = ExecutionContext::new(config());
        cx.vm_mut().push_frame(Arc::new(FuncInfo::new("main", 0, 0)), &[]);
        cx.vm_mut().push_frame(Arc::new(FuncInfo::new("make", 0, 0)), &[]);
        let leaked = cx.alloc_array().unwrap();

        let entry = cx.collector().oracle().live_entry(leaked.addr()).unwrap();
        assert_eq!(
            entry.site.as_ref().unwrap().frames,
            vec!["make".to_owned(), "main".to_owned()]
        );

        let report = cx.collect().unwrap();
        let defect = &report.validation_defects[0];
        assert_eq!(defect.defect, DefectKind::LiveNotTraced);
        assert_eq!(defect.site, entry_site(&["make", "main"]));
    }

    fn entry_site(frames: &[&str]) -> Option<AllocSite> {
        Some(AllocSite::new(frames.iter().map(|f| (*f).to_owned()).collect()))
    }

    #[test]
    fn test_release_feeds_oracle() {
        let mut cx = ExecutionContext::new(config());
        let s = cx.alloc_string("tmp").unwrap();
        assert!(cx.collector().oracle().is_live(s.addr()));
        assert!(cx.release(Value::from(s)));
        assert!(!cx.collector().oracle().is_live(s.addr()));
        assert!(!cx.release(Value::from(s)));

        let report = cx.collect().unwrap();
        assert!(report.is_clean());
        assert_eq!(report.reclaimable_blocks, 0);
    }

    #[test]
    fn test_globals_are_roots() {
        let mut cx = ExecutionContext::new(config());
        let v = cx.alloc_string("value").unwrap();
        cx.set_global("x", Value::from(v)).unwrap();
        cx.set_global("y", Value::Int(1)).unwrap();

        let report = cx.collect().unwrap();
        // Unreachable: nothing. Globals array + "x" + "y" keys + value.
        assert_eq!(report.reclaimable_blocks, 0);
        assert_eq!(report.trace.visited, 4);
        assert!(report.is_clean());
    }

    #[test]
    fn test_overwriting_global_reuses_key() {
        let mut cx = ExecutionContext::new(config().with_reclaim(ReclaimPolicy::Commit));
        cx.set_global("x", Value::Int(1)).unwrap();
        let cells = cx.heap().cells_in_use();
        cx.set_global("x", Value::Int(2)).unwrap();
        assert_eq!(cx.heap().cells_in_use(), cells);
        assert_eq!(cx.global("x"), Some(Value::Int(2)));

        let report = cx.collect().unwrap();
        assert!(report.is_clean(), "{:?}", report.validation_defects);
        assert_eq!(report.reclaimable_blocks, 0);
        assert_eq!(report.commit, CommitOutcome::Committed { blocks: 0 });
    }

    #[test]
    fn test_released_globals_array_is_replaced() {
        let mut cx = ExecutionContext::new(config());
        cx.set_global("x", Value::Int(1)).unwrap();
        let old = cx.globals_array().unwrap();
        assert!(cx.release(Value::from(old)));
        assert!(cx.vm().globals().lookup(DEFAULT_GLOBALS_NAME).is_none());
        assert_eq!(cx.global("x"), None);

        cx.set_global("y", Value::Int(2)).unwrap();
        let fresh = cx.globals_array().unwrap();
        assert!(cx.heap().array(fresh).is_some());
        assert_eq!(cx.global("y"), Some(Value::Int(2)));
        assert_eq!(
            cx.vm().globals().lookup(DEFAULT_GLOBALS_NAME),
            Some(Value::from(fresh))
        );
    }
}
