//! The runtime value model the tracer walks.
//!
//! A [`Value`] is a closed sum over every datum kind. Heap kinds carry a
//! [`Handle`], which is `None` for the fake/empty payload the runtime uses
//! as a placeholder; such values are childless leaves.
//!
//! Heap payloads live in allocator blocks laid out as a [`CellHeader`]
//! followed by the payload. A [`HeapRef`] is the address of that cell and is
//! compared, hashed and traced by address alone.

use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

// ============================================================================
// DataKind
// ============================================================================

/// Kind tag of a [`Value`], ordered the way the runtime orders its type tags.
///
/// Everything up to and including [`DataKind::Double`] is an inline scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum DataKind {
    /// Uninitialized slot.
    Uninit = 0,
    /// `null`.
    Null = 1,
    /// Boolean scalar.
    Boolean = 2,
    /// 64-bit integer scalar.
    Int64 = 3,
    /// Double scalar.
    Double = 4,
    /// Interned string with static lifetime.
    StaticString = 5,
    /// Refcounted string.
    String = 6,
    /// Ordered key/value array.
    Array = 7,
    /// Class instance.
    Object = 8,
    /// Opaque resource.
    Resource = 9,
    /// Reference cell.
    Ref = 10,
    /// Marker in a dynamic environment table pointing at a declared local.
    NamedLocal = 11,
}

impl DataKind {
    /// Number of kinds.
    pub const COUNT: usize = 12;

    /// Every kind, in tag order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Uninit,
        Self::Null,
        Self::Boolean,
        Self::Int64,
        Self::Double,
        Self::StaticString,
        Self::String,
        Self::Array,
        Self::Object,
        Self::Resource,
        Self::Ref,
        Self::NamedLocal,
    ];

    /// Dense index, usable for per-kind tables.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Returns `true` for kinds whose payload is a heap pointer.
    #[must_use]
    pub const fn is_heap(self) -> bool {
        let tag = self as u8;
        tag >= Self::StaticString as u8 && tag <= Self::Ref as u8
    }

    /// Short lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Uninit => "uninit",
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Int64 => "int64",
            Self::Double => "double",
            Self::StaticString => "static-string",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
            Self::Resource => "resource",
            Self::Ref => "ref",
            Self::NamedLocal => "named-local",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Cells and handles
// ============================================================================

/// Header tag written over a cell whose payload has been destroyed.
const TOMBSTONE: u8 = 0xFF;

/// Metadata at the start of every heap cell.
#[repr(C)]
pub(crate) struct CellHeader {
    /// `DataKind` tag of the payload, or [`TOMBSTONE`].
    tag: Cell<u8>,
    /// Drops the payload in place.
    drop_fn: unsafe fn(*mut u8),
}

impl CellHeader {
    fn new<T: CellData>() -> Self {
        Self {
            tag: Cell::new(T::KIND as u8),
            drop_fn: drop_cell::<T>,
        }
    }

    /// Drop the payload of the cell at `cell` unless it is already a tombstone.
    ///
    /// # Safety
    ///
    /// `cell` must point to a cell that was initialized by [`HeapCell::new`]
    /// and whose memory is still mapped.
    pub(crate) unsafe fn destroy(cell: *mut u8) -> bool {
        // SAFETY: every cell starts with a `CellHeader`.
        let header = unsafe { &*cell.cast::<Self>() };
        if header.tag.get() == TOMBSTONE {
            return false;
        }
        header.tag.set(TOMBSTONE);
        // SAFETY: the tag was live, so the payload has not been dropped yet.
        unsafe { (header.drop_fn)(cell) };
        true
    }
}

/// A header followed by its payload.
#[repr(C)]
pub(crate) struct HeapCell<T> {
    header: CellHeader,
    value: T,
}

impl<T: CellData> HeapCell<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            header: CellHeader::new::<T>(),
            value,
        }
    }
}

unsafe fn drop_cell<T>(cell: *mut u8) {
    // SAFETY: the caller guarantees `cell` is a live `HeapCell<T>`.
    unsafe { std::ptr::drop_in_place(std::ptr::addr_of_mut!((*cell.cast::<HeapCell<T>>()).value)) }
}

mod sealed {
    pub trait Sealed {}
}

/// Payload types that can live in a heap cell.
pub trait CellData: sealed::Sealed + Sized + 'static {
    /// Kind tag written into the cell header.
    const KIND: DataKind;
}

/// Address-identity handle to a heap cell holding a `T`.
///
/// Handles are plain addresses: copying one does not touch any refcount and
/// holding one does not keep the cell alive.
pub struct HeapRef<T> {
    ptr: NonNull<HeapCell<T>>,
    _marker: PhantomData<*const T>,
}

/// A possibly-empty heap payload. `None` is the fake/empty placeholder.
pub type Handle<T> = Option<HeapRef<T>>;

impl<T: CellData> HeapRef<T> {
    pub(crate) const fn from_cell(ptr: NonNull<HeapCell<T>>) -> Self {
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    /// Build a handle from a bare address without checking what lives there.
    ///
    /// Returns `None` for address zero. Useful for allocator test doubles that
    /// only need address identity.
    ///
    /// # Safety
    ///
    /// Calling [`HeapRef::resolve`] on the result is only sound if `addr`
    /// really is the start of a mapped cell.
    #[must_use]
    pub unsafe fn from_addr(addr: usize) -> Option<Self> {
        NonNull::new(addr as *mut HeapCell<T>).map(Self::from_cell)
    }

    /// The cell address; this is the handle's identity.
    #[must_use]
    pub fn addr(self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Kind of the payload this handle refers to.
    #[must_use]
    pub const fn kind(self) -> DataKind {
        T::KIND
    }

    /// Borrow the payload.
    ///
    /// Returns `None` if the cell has been destroyed or now holds a payload
    /// of a different kind (its block was reused).
    ///
    /// # Safety
    ///
    /// The memory behind the handle must still be mapped for `'a`, i.e. the
    /// owning heap must outlive the borrow, and the payload must not be
    /// destroyed while the borrow exists.
    #[must_use]
    pub unsafe fn resolve<'a>(self) -> Option<&'a T> {
        // SAFETY: the caller guarantees the cell memory is mapped.
        let cell = unsafe { &*self.ptr.as_ptr() };
        (cell.header.tag.get() == T::KIND as u8).then_some(&cell.value)
    }

    /// Borrow the payload if `owner` vouches for the cell.
    ///
    /// `None` if `owner` does not own the address, or the cell is destroyed
    /// or holds another kind.
    #[must_use]
    pub fn resolve_in<'a, O: CellOwner + ?Sized>(self, owner: &'a O) -> Option<&'a T> {
        if !owner.owns_cell(self.addr()) {
            return None;
        }
        // SAFETY: `owner` keeps the cell mapped and undestroyed while it is
        // borrowed, which outlives the returned reference.
        unsafe { self.resolve() }
    }
}

/// Something that can vouch for heap cell addresses.
///
/// The tracer and content-keyed array lookups only dereference handles an
/// owner accepts.
///
/// # Safety
///
/// `owns_cell(addr)` may only return `true` if `addr` is the start of a cell
/// initialized by this crate whose memory stays mapped, and whose payload is
/// not destroyed, for as long as `self` is borrowed.
pub unsafe trait CellOwner {
    /// Returns `true` if `addr` names a cell the owner keeps alive.
    fn owns_cell(&self, addr: usize) -> bool;
}

impl<T> Clone for HeapRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for HeapRef<T> {}

impl<T> PartialEq for HeapRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for HeapRef<T> {}

impl<T> Hash for HeapRef<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ptr.hash(state);
    }
}

impl<T: CellData> fmt::Debug for HeapRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:#x}", T::KIND, self.addr())
    }
}

/// Handle to an array cell.
pub type ArrayRef = HeapRef<ArrayData>;
/// Handle to an object cell.
pub type ObjectRef = HeapRef<ObjectData>;
/// Handle to a string cell.
pub type StringRef = HeapRef<StringData>;
/// Handle to a reference cell.
pub type RefRef = HeapRef<RefData>;
/// Handle to a resource cell.
pub type ResourceRef = HeapRef<ResourceData>;

// ============================================================================
// Value
// ============================================================================

/// A tagged runtime datum.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Value {
    /// Uninitialized slot.
    #[default]
    Uninit,
    /// `null`.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Double.
    Double(f64),
    /// Interned string. Its identity is the address of the static text.
    StaticString(&'static str),
    /// Refcounted string.
    String(Handle<StringData>),
    /// Array.
    Array(Handle<ArrayData>),
    /// Object.
    Object(Handle<ObjectData>),
    /// Resource.
    Resource(Handle<ResourceData>),
    /// Reference cell.
    Ref(Handle<RefData>),
    /// Dynamic-environment marker naming a declared local slot. Metadata,
    /// never data.
    NamedLocal(u32),
}

impl Value {
    /// Kind tag.
    #[must_use]
    pub const fn kind(&self) -> DataKind {
        match self {
            Self::Uninit => DataKind::Uninit,
            Self::Null => DataKind::Null,
            Self::Bool(_) => DataKind::Boolean,
            Self::Int(_) => DataKind::Int64,
            Self::Double(_) => DataKind::Double,
            Self::StaticString(_) => DataKind::StaticString,
            Self::String(_) => DataKind::String,
            Self::Array(_) => DataKind::Array,
            Self::Object(_) => DataKind::Object,
            Self::Resource(_) => DataKind::Resource,
            Self::Ref(_) => DataKind::Ref,
            Self::NamedLocal(_) => DataKind::NamedLocal,
        }
    }

    /// Payload address for heap kinds with a non-empty payload.
    ///
    /// `None` for scalars, empty handles and local markers.
    #[must_use]
    pub fn heap_addr(&self) -> Option<usize> {
        match self {
            Self::StaticString(s) => Some(s.as_ptr() as usize),
            Self::String(h) => h.map(HeapRef::addr),
            Self::Array(h) => h.map(HeapRef::addr),
            Self::Object(h) => h.map(HeapRef::addr),
            Self::Resource(h) => h.map(HeapRef::addr),
            Self::Ref(h) => h.map(HeapRef::addr),
            Self::Uninit
            | Self::Null
            | Self::Bool(_)
            | Self::Int(_)
            | Self::Double(_)
            | Self::NamedLocal(_) => None,
        }
    }

    /// Array handle, if this is a non-empty array.
    #[must_use]
    pub const fn as_array(&self) -> Option<ArrayRef> {
        match self {
            Self::Array(h) => *h,
            _ => None,
        }
    }

    /// Object handle, if this is a non-empty object.
    #[must_use]
    pub const fn as_object(&self) -> Option<ObjectRef> {
        match self {
            Self::Object(h) => *h,
            _ => None,
        }
    }

    /// Reference-cell handle, if this is a non-empty ref.
    #[must_use]
    pub const fn as_ref_cell(&self) -> Option<RefRef> {
        match self {
            Self::Ref(h) => *h,
            _ => None,
        }
    }

    /// String handle, if this is a non-empty refcounted string.
    #[must_use]
    pub const fn as_string(&self) -> Option<StringRef> {
        match self {
            Self::String(h) => *h,
            _ => None,
        }
    }
}

impl From<ArrayRef> for Value {
    fn from(r: ArrayRef) -> Self {
        Self::Array(Some(r))
    }
}

impl From<ObjectRef> for Value {
    fn from(r: ObjectRef) -> Self {
        Self::Object(Some(r))
    }
}

impl From<StringRef> for Value {
    fn from(r: StringRef) -> Self {
        Self::String(Some(r))
    }
}

impl From<RefRef> for Value {
    fn from(r: RefRef) -> Self {
        Self::Ref(Some(r))
    }
}

impl From<ResourceRef> for Value {
    fn from(r: ResourceRef) -> Self {
        Self::Resource(Some(r))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// A refcounted string.
#[derive(Debug)]
pub struct StringData {
    text: Box<str>,
}

impl StringData {
    /// Wrap `text`.
    #[must_use]
    pub fn new(text: &str) -> Self {
        Self { text: text.into() }
    }

    /// Contents.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

/// Key equality the way array lookups see it: integers by value, static
/// strings by contents. Refcounted strings compare by contents only when
/// `cells` can vouch for them, and by identity otherwise.
fn same_key(a: &Value, b: &Value, cells: Option<&dyn CellOwner>) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::String(x), Value::String(y)) if x == y => true,
        _ => match (string_contents(a, cells), string_contents(b, cells)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

fn string_contents<'a>(v: &'a Value, cells: Option<&'a dyn CellOwner>) -> Option<&'a str> {
    match v {
        Value::StaticString(s) => Some(*s),
        Value::String(Some(s)) => s.resolve_in(cells?).map(StringData::as_str),
        _ => None,
    }
}

/// An ordered key/value array.
#[derive(Debug, Default)]
pub struct ArrayData {
    entries: RefCell<Vec<(Value, Value)>>,
    next_index: Cell<i64>,
}

impl ArrayData {
    /// Empty array.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Returns `true` if the array has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Append `value` under the next integer key.
    pub fn push(&self, value: Value) {
        let key = self.next_index.get();
        self.next_index.set(key + 1);
        self.entries.borrow_mut().push((Value::Int(key), value));
    }

    /// Insert or overwrite the entry for `key`.
    ///
    /// Refcounted string keys match by identity; use [`ArrayData::set_in`]
    /// to match them by contents.
    pub fn set(&self, key: Value, value: Value) {
        self.insert(key, value, None);
    }

    /// Insert or overwrite the entry for `key`, matching string keys by
    /// contents through `cells`.
    pub fn set_in<O: CellOwner>(&self, cells: &O, key: Value, value: Value) {
        self.insert(key, value, Some(cells));
    }

    fn insert(&self, key: Value, value: Value, cells: Option<&dyn CellOwner>) {
        if let Value::Int(i) = key {
            if i >= self.next_index.get() {
                self.next_index.set(i + 1);
            }
        }
        let mut entries = self.entries.borrow_mut();
        if let Some(slot) = entries.iter_mut().find(|(k, _)| same_key(k, &key, cells)) {
            slot.1 = value;
        } else {
            entries.push((key, value));
        }
    }

    /// Look up the value stored under `key`, matching refcounted string keys
    /// by identity.
    #[must_use]
    pub fn get(&self, key: &Value) -> Option<Value> {
        self.find(key, None)
    }

    /// Look up the value stored under `key`, matching string keys by
    /// contents through `cells`.
    #[must_use]
    pub fn get_in<O: CellOwner>(&self, cells: &O, key: &Value) -> Option<Value> {
        self.find(key, Some(cells))
    }

    /// The stored key whose string contents are `name`.
    #[must_use]
    pub fn string_key<O: CellOwner>(&self, cells: &O, name: &str) -> Option<Value> {
        let cells: &dyn CellOwner = cells;
        self.entries
            .borrow()
            .iter()
            .map(|(k, _)| *k)
            .find(|k| string_contents(k, Some(cells)) == Some(name))
    }

    fn find(&self, key: &Value, cells: Option<&dyn CellOwner>) -> Option<Value> {
        self.entries
            .borrow()
            .iter()
            .find(|(k, _)| same_key(k, key, cells))
            .map(|(_, v)| *v)
    }

    /// Borrow all entries in insertion order.
    #[must_use]
    pub fn entries(&self) -> Ref<'_, [(Value, Value)]> {
        Ref::map(self.entries.borrow(), Vec::as_slice)
    }
}

/// Class descriptor: the metadata needed to enumerate an object's declared
/// property slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Class {
    name: String,
    declared_props: Vec<String>,
    has_destructor: bool,
}

impl Class {
    /// A class named `name` declaring `props` in slot order.
    #[must_use]
    pub fn new(name: impl Into<String>, props: &[&str]) -> Self {
        Self {
            name: name.into(),
            declared_props: props.iter().map(|p| (*p).to_owned()).collect(),
            has_destructor: false,
        }
    }

    /// Mark instances as carrying a destructor obligation.
    #[must_use]
    pub const fn with_destructor(mut self) -> Self {
        self.has_destructor = true;
        self
    }

    /// Class name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of declared property slots.
    #[must_use]
    pub fn declared_property_count(&self) -> usize {
        self.declared_props.len()
    }

    /// Slot index of a declared property.
    #[must_use]
    pub fn slot_of(&self, prop: &str) -> Option<usize> {
        self.declared_props.iter().position(|p| p == prop)
    }

    /// Whether instances need a destructor run before their memory is reused.
    #[must_use]
    pub const fn has_destructor(&self) -> bool {
        self.has_destructor
    }
}

/// A class instance.
#[derive(Debug)]
pub struct ObjectData {
    class: Option<Arc<Class>>,
    props: RefCell<Vec<Value>>,
    dyn_props: Cell<Handle<ArrayData>>,
}

impl ObjectData {
    /// An instance of `class` with every declared slot uninitialized.
    #[must_use]
    pub fn new(class: Arc<Class>) -> Self {
        let slots = class.declared_property_count();
        Self {
            class: Some(class),
            props: RefCell::new(vec![Value::Uninit; slots]),
            dyn_props: Cell::new(None),
        }
    }

    /// An instance whose class descriptor is missing.
    ///
    /// Real runtimes never produce this; it stands in for corrupted metadata.
    #[must_use]
    pub fn detached(slots: usize) -> Self {
        Self {
            class: None,
            props: RefCell::new(vec![Value::Uninit; slots]),
            dyn_props: Cell::new(None),
        }
    }

    /// Class descriptor.
    #[must_use]
    pub const fn class(&self) -> Option<&Arc<Class>> {
        self.class.as_ref()
    }

    /// Borrow the declared property slots.
    #[must_use]
    pub fn props(&self) -> Ref<'_, [Value]> {
        Ref::map(self.props.borrow(), Vec::as_slice)
    }

    /// Value of slot `index`.
    #[must_use]
    pub fn prop(&self, index: usize) -> Option<Value> {
        self.props.borrow().get(index).copied()
    }

    /// Overwrite slot `index`. Returns `false` if there is no such slot.
    pub fn set_prop(&self, index: usize, value: Value) -> bool {
        self.props
            .borrow_mut()
            .get_mut(index)
            .map(|slot| *slot = value)
            .is_some()
    }

    /// Drop trailing slots, leaving fewer than the class declares.
    ///
    /// Stands in for a corrupted property vector.
    pub fn truncate_props(&self, len: usize) {
        self.props.borrow_mut().truncate(len);
    }

    /// Dynamic-property side table.
    #[must_use]
    pub fn dyn_props(&self) -> Handle<ArrayData> {
        self.dyn_props.get()
    }

    /// Attach a dynamic-property side table.
    pub fn set_dyn_props(&self, table: Handle<ArrayData>) {
        self.dyn_props.set(table);
    }
}

/// An opaque resource.
#[derive(Debug)]
pub struct ResourceData {
    name: Box<str>,
}

impl ResourceData {
    /// A resource described by `name`.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self { name: name.into() }
    }

    /// Description.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A reference cell holding one value.
#[derive(Debug, Default)]
pub struct RefData {
    target: Cell<Value>,
}

impl RefData {
    /// A cell holding `target`.
    #[must_use]
    pub const fn new(target: Value) -> Self {
        Self {
            target: Cell::new(target),
        }
    }

    /// Current target.
    #[must_use]
    pub fn get(&self) -> Value {
        self.target.get()
    }

    /// Replace the target.
    pub fn set(&self, target: Value) {
        self.target.set(target);
    }
}

macro_rules! cell_data {
    ($($ty:ty => $kind:expr),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}
            impl CellData for $ty {
                const KIND: DataKind = $kind;
            }
        )*
    };
}

cell_data! {
    StringData => DataKind::String,
    ArrayData => DataKind::Array,
    ObjectData => DataKind::Object,
    ResourceData => DataKind::Resource,
    RefData => DataKind::Ref,
}
