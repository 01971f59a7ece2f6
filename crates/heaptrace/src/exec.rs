//! Read-only view of the interpreter state the tracer starts from, plus a
//! small reference VM implementing it.
//!
//! The evaluation stack is a flat array of [`Value`] slots indexed by
//! [`StackPtr`] and growing upward. A frame owns the slots
//! `[locals_base, locals_base + num_locals)` for its declared locals,
//! followed by its temporaries up to the frame's stack top. The current
//! frame's top is [`ExecutionState::stack_top`]; a caller's top is the value
//! saved in the [`CallerLink`] of the frame it called.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crate::value::{ObjectRef, Value};

/// Bytecode offset within a function.
pub type Offset = u32;

/// Slot index into the evaluation stack.
pub type StackPtr = usize;

/// Identifier of an activation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub usize);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Function metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncInfo {
    /// Function name.
    pub name: String,
    /// Declared local slots, parameters included.
    pub num_locals: usize,
    /// Declared parameters.
    pub num_params: usize,
}

impl FuncInfo {
    /// A function with `num_params` parameters and `num_locals` locals.
    ///
    /// Parameters occupy the first local slots, so `num_locals` is raised to
    /// at least `num_params`.
    #[must_use]
    pub fn new(name: impl Into<String>, num_params: usize, num_locals: usize) -> Self {
        Self {
            name: name.into(),
            num_locals: num_locals.max(num_params),
            num_params,
        }
    }
}

/// Where to resume in the caller once a frame returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerLink {
    /// Caller frame.
    pub frame: FrameId,
    /// Caller's program offset.
    pub pc: Offset,
    /// Caller's stack top at the call.
    pub stack_top: StackPtr,
}

/// Name to value table, used for dynamic environments and the global table.
#[derive(Debug, Clone, Default)]
pub struct NameValueTable {
    entries: Vec<(String, Value)>,
}

impl NameValueTable {
    /// Empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Insert or overwrite `name`.
    pub fn set(&mut self, name: &str, value: Value) {
        if let Some(slot) = self.entries.iter_mut().find(|(n, _)| n == name) {
            slot.1 = value;
        } else {
            self.entries.push((name.to_owned(), value));
        }
    }

    /// Look up `name`.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    /// Remove `name`, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let pos = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(pos).1)
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Value)> + '_ {
        self.entries.iter().map(|(n, v)| (n.as_str(), *v))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Views
// ============================================================================

/// One activation record as the tracer sees it.
pub trait FrameView {
    /// Function metadata, `None` if the frame is corrupted.
    fn func(&self) -> Option<&FuncInfo>;

    /// Bound receiver.
    fn receiver(&self) -> Option<ObjectRef>;

    /// Number of arguments actually passed.
    fn num_args(&self) -> usize;

    /// Argument passed beyond the declared parameters, by position past the
    /// last parameter.
    fn extra_arg(&self, index: usize) -> Option<Value>;

    /// Dynamic variable environment.
    fn dynamic_env(&self) -> Option<&NameValueTable>;

    /// Stack slot of local 0.
    fn locals_base(&self) -> StackPtr;

    /// Caller, `None` for the outermost frame.
    fn caller(&self) -> Option<CallerLink>;
}

/// Read-only interpreter state: frames, evaluation stack and globals.
pub trait ExecutionState {
    /// Frame representation.
    type Frame: FrameView;

    /// Innermost frame, `None` when nothing is executing.
    fn current_frame(&self) -> Option<FrameId>;

    /// Resolve a frame identifier.
    fn frame(&self, id: FrameId) -> Option<&Self::Frame>;

    /// Program offset within the current frame.
    fn program_offset(&self) -> Offset;

    /// Stack top of the current frame.
    fn stack_top(&self) -> StackPtr;

    /// Slots in `range`, `None` if the range is not within the stack.
    fn stack_slots(&self, range: Range<StackPtr>) -> Option<&[Value]>;

    /// Global variable table.
    fn global_table(&self) -> &NameValueTable;
}

// ============================================================================
// Reference VM
// ============================================================================

/// An activation record of [`VmState`].
#[derive(Debug, Clone)]
pub struct ActRec {
    func: Option<Arc<FuncInfo>>,
    this: Option<ObjectRef>,
    num_args: usize,
    extra_args: Vec<Value>,
    var_env: Option<NameValueTable>,
    locals_base: StackPtr,
    caller: Option<CallerLink>,
}

impl ActRec {
    /// Replace the caller link.
    pub fn set_caller(&mut self, caller: Option<CallerLink>) {
        self.caller = caller;
    }

    /// Replace the function metadata.
    pub fn set_func(&mut self, func: Option<Arc<FuncInfo>>) {
        self.func = func;
    }

    /// Move the locals window.
    pub fn set_locals_base(&mut self, base: StackPtr) {
        self.locals_base = base;
    }
}

impl FrameView for ActRec {
    fn func(&self) -> Option<&FuncInfo> {
        self.func.as_deref()
    }

    fn receiver(&self) -> Option<ObjectRef> {
        self.this
    }

    fn num_args(&self) -> usize {
        self.num_args
    }

    fn extra_arg(&self, index: usize) -> Option<Value> {
        self.extra_args.get(index).copied()
    }

    fn dynamic_env(&self) -> Option<&NameValueTable> {
        self.var_env.as_ref()
    }

    fn locals_base(&self) -> StackPtr {
        self.locals_base
    }

    fn caller(&self) -> Option<CallerLink> {
        self.caller
    }
}

/// A minimal interpreter state: a frame stack over one evaluation stack.
#[derive(Debug, Default)]
pub struct VmState {
    stack: Vec<Value>,
    frames: Vec<ActRec>,
    current: Option<FrameId>,
    pc: Offset,
    globals: NameValueTable,
}

impl VmState {
    /// Idle VM with an empty global table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `func` with `args`.
    ///
    /// Arguments up to `num_params` land in the first local slots; the rest
    /// are kept as extra arguments.
    pub fn push_frame(&mut self, func: Arc<FuncInfo>, args: &[Value]) -> FrameId {
        self.enter(func, None, args)
    }

    /// Call `func` bound to receiver `this`.
    pub fn push_method_frame(
        &mut self,
        func: Arc<FuncInfo>,
        this: ObjectRef,
        args: &[Value],
    ) -> FrameId {
        self.enter(func, Some(this), args)
    }

    fn enter(&mut self, func: Arc<FuncInfo>, this: Option<ObjectRef>, args: &[Value]) -> FrameId {
        let caller = self.current.map(|frame| CallerLink {
            frame,
            pc: self.pc,
            stack_top: self.stack.len(),
        });
        let locals_base = self.stack.len();
        let fixed = args.len().min(func.num_params);
        self.stack.extend_from_slice(&args[..fixed]);
        self.stack
            .resize(locals_base + func.num_locals, Value::Uninit);

        let id = FrameId(self.frames.len());
        self.frames.push(ActRec {
            num_args: args.len(),
            extra_args: args[fixed..].to_vec(),
            func: Some(func),
            this,
            var_env: None,
            locals_base,
            caller,
        });
        self.current = Some(id);
        self.pc = 0;
        id
    }

    /// Return from the current frame, discarding its slots.
    ///
    /// Returns the frame control passes to.
    pub fn pop_frame(&mut self) -> Option<FrameId> {
        let id = self.current?;
        if id.0 + 1 != self.frames.len() {
            return None;
        }
        let frame = self.frames.pop()?;
        self.stack.truncate(frame.locals_base);
        match frame.caller {
            Some(link) => {
                self.pc = link.pc;
                self.current = Some(link.frame);
            }
            None => {
                self.pc = 0;
                self.current = None;
            }
        }
        self.current
    }

    fn current_rec(&self) -> Option<&ActRec> {
        self.frames.get(self.current?.0)
    }

    fn current_rec_mut(&mut self) -> Option<&mut ActRec> {
        self.frames.get_mut(self.current?.0)
    }

    fn temporaries_base(&self) -> StackPtr {
        self.current_rec().map_or(0, |rec| {
            rec.locals_base + rec.func.as_ref().map_or(0, |f| f.num_locals)
        })
    }

    /// Write local `index` of the current frame.
    ///
    /// Returns `false` if there is no current frame or no such local.
    pub fn set_local(&mut self, index: usize, value: Value) -> bool {
        let Some(rec) = self.current_rec() else {
            return false;
        };
        let Some(func) = rec.func.as_ref() else {
            return false;
        };
        if index >= func.num_locals {
            return false;
        }
        let slot = rec.locals_base + index;
        match self.stack.get_mut(slot) {
            Some(s) => {
                *s = value;
                true
            }
            None => false,
        }
    }

    /// Read local `index` of the current frame.
    #[must_use]
    pub fn local(&self, index: usize) -> Option<Value> {
        let rec = self.current_rec()?;
        if index >= rec.func.as_ref()?.num_locals {
            return None;
        }
        self.stack.get(rec.locals_base + index).copied()
    }

    /// Push a temporary.
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    /// Pop a temporary of the current frame.
    pub fn pop(&mut self) -> Option<Value> {
        if self.stack.len() <= self.temporaries_base() {
            return None;
        }
        self.stack.pop()
    }

    /// Move the program offset of the current frame.
    pub fn set_pc(&mut self, pc: Offset) {
        self.pc = pc;
    }

    /// Set a dynamic variable in the current frame's environment.
    pub fn set_dynamic(&mut self, name: &str, value: Value) -> bool {
        match self.current_rec_mut() {
            Some(rec) => {
                rec.var_env
                    .get_or_insert_with(NameValueTable::new)
                    .set(name, value);
                true
            }
            None => false,
        }
    }

    /// Record that dynamic name `name` aliases declared local `slot`.
    pub fn bind_named_local(&mut self, name: &str, slot: u32) -> bool {
        self.set_dynamic(name, Value::NamedLocal(slot))
    }

    /// Global table.
    #[must_use]
    pub const fn globals(&self) -> &NameValueTable {
        &self.globals
    }

    /// Mutable global table.
    pub fn globals_mut(&mut self) -> &mut NameValueTable {
        &mut self.globals
    }

    /// Mutable access to a frame.
    pub fn frame_mut(&mut self, id: FrameId) -> Option<&mut ActRec> {
        self.frames.get_mut(id.0)
    }

    /// Override the current-frame pointer.
    pub fn set_current_frame(&mut self, id: Option<FrameId>) {
        self.current = id;
    }

    /// Number of live frames.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Function names from the innermost frame outward.
    #[must_use]
    pub fn backtrace(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut cursor = self.current;
        while let Some(id) = cursor {
            if names.len() >= self.frames.len() {
                break;
            }
            let Some(rec) = self.frames.get(id.0) else {
                break;
            };
            names.push(
                rec.func
                    .as_ref()
                    .map_or_else(|| String::from("<unknown>"), |f| f.name.clone()),
            );
            cursor = rec.caller.map(|link| link.frame);
        }
        names
    }
}

impl ExecutionState for VmState {
    type Frame = ActRec;

    fn current_frame(&self) -> Option<FrameId> {
        self.current
    }

    fn frame(&self, id: FrameId) -> Option<&ActRec> {
        self.frames.get(id.0)
    }

    fn program_offset(&self) -> Offset {
        self.pc
    }

    fn stack_top(&self) -> StackPtr {
        self.stack.len()
    }

    fn stack_slots(&self, range: Range<StackPtr>) -> Option<&[Value]> {
        self.stack.get(range)
    }

    fn global_table(&self) -> &NameValueTable {
        &self.globals
    }
}
