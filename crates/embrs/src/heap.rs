//! The object heap and its mark-sweep garbage collector.
//!
//! All heap objects live in a single arena: a slab of slots plus a free
//! list, addressed by [`ObjRef`] handles. A live object occupies exactly
//! one slot; freeing a slot pushes its index onto the free list for reuse.
//!
//! Collection is tri-color mark-sweep run to completion per cycle. The VM
//! enumerates roots (stack, frames, upvalues, globals, modules), the heap
//! traces the gray worklist to fixpoint, dead keys are evicted from the
//! string-interning table, and the sweep frees every unmarked slot. The
//! cycle triggers when the bytes-allocated account crosses a threshold
//! that grows by ×1.25 after each collection.

use std::any::Any;
use std::sync::Arc;

use log::trace;

use crate::bytecode::Blob;
use crate::table::Table;
use crate::value::{hash_bytes, Value};

/// Heap growth factor applied to the trigger threshold after each cycle.
const GC_HEAP_GROWTH_FACTOR: f64 = 1.25;

/// First collection happens after this many bytes.
const GC_INITIAL_THRESHOLD: usize = 1024 * 1024;

/// A handle to a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(u32);

/// Signature for host-native functions. `args[0]` is the receiver when
/// the native is invoked as a method; plain function calls pass only the
/// actual arguments. Returning `Err` raises an `Exception` with the
/// message in the calling frame.
pub type NativeFn =
    Arc<dyn Fn(&mut Heap, &[Value]) -> std::result::Result<Value, String> + Send + Sync>;

/// Load/unload hooks for native modules.
pub type ModuleHook = Arc<dyn Fn(&mut Heap) + Send + Sync>;

// ---------------------------------------------------------------------------
// Object payloads
// ---------------------------------------------------------------------------

/// An interned, immutable string.
#[derive(Debug)]
pub struct StrObj {
    pub text: Box<str>,
    /// Cached content hash, used by the interning table and as the value
    /// hash.
    pub hash: u32,
    /// Cached UTF-8 code-point count.
    pub chars: usize,
    /// True when every byte is ASCII, letting indexing skip UTF-8 walks.
    pub ascii: bool,
}

#[derive(Debug, Default)]
pub struct BytesObj {
    pub bytes: Vec<u8>,
}

/// An integer range. `length` is precomputed; direction is inferred from
/// the sign of `upper - lower`.
#[derive(Debug)]
pub struct RangeObj {
    pub lower: i64,
    pub upper: i64,
    pub length: i64,
}

#[derive(Debug, Default)]
pub struct ListObj {
    pub items: Vec<Value>,
}

/// An ordered mapping: `keys` preserves insertion order, `table` maps key
/// to value.
#[derive(Debug, Default)]
pub struct DictObj {
    pub keys: Vec<Value>,
    pub table: Table,
}

/// An open file handle. The handle is dropped (and the descriptor closed)
/// either by the `close` method or when the GC frees the object.
#[derive(Debug)]
pub struct FileObj {
    pub path: String,
    pub mode: String,
    pub handle: Option<std::fs::File>,
}

/// A captured variable: open while its stack slot is alive, closed (owning
/// the value) after the frame unwinds.
#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct UpvalueObj {
    pub state: UpvalueState,
}

/// A method extracted from an instance, remembering its receiver.
#[derive(Debug)]
pub struct BoundMethodObj {
    pub receiver: Value,
    /// A closure or native function.
    pub method: Value,
}

#[derive(Debug)]
pub struct ClosureObj {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// How a function may be called, assigned by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Script,
    Function,
    Method,
    /// A method whose name equals its class's name.
    Initializer,
    /// A method whose name starts with `_`; callable only through `self`.
    Private,
    /// Callable only on the class object, not instances.
    Static,
}

pub struct FunctionObj {
    pub arity: u8,
    pub upvalue_count: usize,
    pub is_variadic: bool,
    pub kind: FunctionKind,
    /// Interned name; `None` for scripts and module bodies.
    pub name: Option<ObjRef>,
    pub module: ObjRef,
    pub blob: Blob,
}

impl std::fmt::Debug for FunctionObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionObj")
            .field("arity", &self.arity)
            .field("upvalue_count", &self.upvalue_count)
            .field("is_variadic", &self.is_variadic)
            .field("kind", &self.kind)
            .field("code_len", &self.blob.code.len())
            .finish()
    }
}

#[derive(Debug)]
pub struct InstanceObj {
    pub class: ObjRef,
    pub properties: Table,
}

#[derive(Debug)]
pub struct ClassObj {
    pub name: ObjRef,
    /// Default values copied into each new instance.
    pub properties: Table,
    pub statics: Table,
    pub methods: Table,
    /// Cached constructor: the method registered under the class's own
    /// name, or `Empty` when absent.
    pub initializer: Value,
    pub superclass: Option<ObjRef>,
}

pub struct ModuleObj {
    pub name: String,
    pub file: String,
    /// Top-level bindings of the module body.
    pub values: Table,
    pub preloader: Option<ModuleHook>,
    pub unloader: Option<ModuleHook>,
    /// Gates the one-time unload hook.
    pub imported: bool,
}

impl std::fmt::Debug for ModuleObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleObj")
            .field("name", &self.name)
            .field("file", &self.file)
            .finish()
    }
}

/// Precomputed jump table for `using` statements: constant value →
/// relative bytecode offset, plus a default and an exit offset.
#[derive(Debug)]
pub struct SwitchObj {
    pub table: Table,
    pub default_jump: i32,
    pub exit_jump: i32,
}

pub struct NativeObj {
    pub name: String,
    pub function: NativeFn,
}

impl std::fmt::Debug for NativeObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeObj({})", self.name)
    }
}

/// An opaque host value threaded through native modules.
pub struct PointerObj {
    pub name: &'static str,
    pub data: Box<dyn Any + Send>,
}

impl std::fmt::Debug for PointerObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PointerObj({})", self.name)
    }
}

/// A heap object.
#[derive(Debug)]
pub enum Obj {
    Str(StrObj),
    Bytes(BytesObj),
    Range(RangeObj),
    List(ListObj),
    Dict(DictObj),
    File(FileObj),
    Upvalue(UpvalueObj),
    BoundMethod(BoundMethodObj),
    Closure(ClosureObj),
    Function(FunctionObj),
    Instance(InstanceObj),
    Class(ClassObj),
    Module(ModuleObj),
    Switch(SwitchObj),
    Native(NativeObj),
    Pointer(PointerObj),
}

struct Slot {
    obj: Obj,
    marked: bool,
}

// ---------------------------------------------------------------------------
// The heap
// ---------------------------------------------------------------------------

pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    /// String-interning table; keys are string values, values are nil.
    strings: Table,
    /// Gray worklist, reused across cycles so tracing never recurses.
    gray: Vec<ObjRef>,
    /// Values pinned by native functions mid-call (the `gcprotected`
    /// register). Cleared by the VM when the native returns.
    protected: Vec<Value>,
    bytes_allocated: usize,
    next_gc: usize,
    /// While positive, collection is deferred: the compiler owns blobs the
    /// collector cannot see yet.
    pause_depth: u32,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            strings: Table::new(),
            gray: Vec::new(),
            protected: Vec::new(),
            bytes_allocated: 0,
            next_gc: GC_INITIAL_THRESHOLD,
            pause_depth: 0,
        }
    }

    // -- Allocation ---------------------------------------------------------

    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.bytes_allocated += size_estimate(&obj);
        let slot = Slot { obj, marked: false };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                ObjRef(index)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Some(slot));
                ObjRef(index)
            }
        }
    }

    pub fn alloc_list(&mut self, items: Vec<Value>) -> Value {
        Value::Obj(self.alloc(Obj::List(ListObj { items })))
    }

    pub fn alloc_dict(&mut self) -> Value {
        Value::Obj(self.alloc(Obj::Dict(DictObj::default())))
    }

    pub fn alloc_bytes(&mut self, bytes: Vec<u8>) -> Value {
        Value::Obj(self.alloc(Obj::Bytes(BytesObj { bytes })))
    }

    pub fn alloc_range(&mut self, lower: i64, upper: i64) -> Value {
        let length = (upper - lower).abs();
        Value::Obj(self.alloc(Obj::Range(RangeObj { lower, upper, length })))
    }

    /// Intern a string: return the existing instance when one with equal
    /// bytes is already live, otherwise allocate and register it.
    pub fn intern(&mut self, text: &str) -> ObjRef {
        let hash = hash_bytes(text.as_bytes());
        let slots = &self.slots;
        let found = self.strings.find_string(hash, |r| {
            match &slots[r.0 as usize] {
                Some(Slot { obj: Obj::Str(s), .. }) => &*s.text == text,
                _ => false,
            }
        });
        if let Some(existing) = found {
            return existing;
        }
        let obj = Obj::Str(StrObj {
            text: text.into(),
            hash,
            chars: text.chars().count(),
            ascii: text.is_ascii(),
        });
        let r = self.alloc(obj);
        self.strings.set(hash, Value::Obj(r), Value::Nil);
        r
    }

    pub fn intern_value(&mut self, text: &str) -> Value {
        Value::Obj(self.intern(text))
    }

    /// Look up an already-interned string without allocating. Returns
    /// `None` when no equal string is currently live.
    pub fn strings_lookup(&self, text: &str) -> Option<ObjRef> {
        let hash = hash_bytes(text.as_bytes());
        let slots = &self.slots;
        self.strings.find_string(hash, |r| {
            match &slots[r.0 as usize] {
                Some(Slot { obj: Obj::Str(s), .. }) => &*s.text == text,
                _ => false,
            }
        })
    }

    // -- Access -------------------------------------------------------------

    pub fn get(&self, r: ObjRef) -> &Obj {
        &self.slots[r.0 as usize].as_ref().expect("stale object reference").obj
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        &mut self.slots[r.0 as usize].as_mut().expect("stale object reference").obj
    }

    pub fn string(&self, r: ObjRef) -> &StrObj {
        match self.get(r) {
            Obj::Str(s) => s,
            other => panic!("expected string, found {:?}", other),
        }
    }

    pub fn str_text(&self, r: ObjRef) -> &str {
        &self.string(r).text
    }

    pub fn list(&self, r: ObjRef) -> &ListObj {
        match self.get(r) {
            Obj::List(l) => l,
            other => panic!("expected list, found {:?}", other),
        }
    }

    pub fn list_mut(&mut self, r: ObjRef) -> &mut ListObj {
        match self.get_mut(r) {
            Obj::List(l) => l,
            _ => panic!("expected list"),
        }
    }

    pub fn dict(&self, r: ObjRef) -> &DictObj {
        match self.get(r) {
            Obj::Dict(d) => d,
            other => panic!("expected dict, found {:?}", other),
        }
    }

    pub fn dict_mut(&mut self, r: ObjRef) -> &mut DictObj {
        match self.get_mut(r) {
            Obj::Dict(d) => d,
            _ => panic!("expected dict"),
        }
    }

    pub fn bytes(&self, r: ObjRef) -> &BytesObj {
        match self.get(r) {
            Obj::Bytes(b) => b,
            other => panic!("expected bytes, found {:?}", other),
        }
    }

    pub fn bytes_mut(&mut self, r: ObjRef) -> &mut BytesObj {
        match self.get_mut(r) {
            Obj::Bytes(b) => b,
            _ => panic!("expected bytes"),
        }
    }

    pub fn range(&self, r: ObjRef) -> &RangeObj {
        match self.get(r) {
            Obj::Range(x) => x,
            other => panic!("expected range, found {:?}", other),
        }
    }

    pub fn file_mut(&mut self, r: ObjRef) -> &mut FileObj {
        match self.get_mut(r) {
            Obj::File(f) => f,
            _ => panic!("expected file"),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &UpvalueObj {
        match self.get(r) {
            Obj::Upvalue(u) => u,
            other => panic!("expected upvalue, found {:?}", other),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut UpvalueObj {
        match self.get_mut(r) {
            Obj::Upvalue(u) => u,
            _ => panic!("expected upvalue"),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &ClosureObj {
        match self.get(r) {
            Obj::Closure(c) => c,
            other => panic!("expected closure, found {:?}", other),
        }
    }

    pub fn function(&self, r: ObjRef) -> &FunctionObj {
        match self.get(r) {
            Obj::Function(f) => f,
            other => panic!("expected function, found {:?}", other),
        }
    }

    pub fn class(&self, r: ObjRef) -> &ClassObj {
        match self.get(r) {
            Obj::Class(c) => c,
            other => panic!("expected class, found {:?}", other),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut ClassObj {
        match self.get_mut(r) {
            Obj::Class(c) => c,
            _ => panic!("expected class"),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &InstanceObj {
        match self.get(r) {
            Obj::Instance(i) => i,
            other => panic!("expected instance, found {:?}", other),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut InstanceObj {
        match self.get_mut(r) {
            Obj::Instance(i) => i,
            _ => panic!("expected instance"),
        }
    }

    pub fn module(&self, r: ObjRef) -> &ModuleObj {
        match self.get(r) {
            Obj::Module(m) => m,
            other => panic!("expected module, found {:?}", other),
        }
    }

    pub fn module_mut(&mut self, r: ObjRef) -> &mut ModuleObj {
        match self.get_mut(r) {
            Obj::Module(m) => m,
            _ => panic!("expected module"),
        }
    }

    pub fn switch(&self, r: ObjRef) -> &SwitchObj {
        match self.get(r) {
            Obj::Switch(s) => s,
            other => panic!("expected switch, found {:?}", other),
        }
    }

    // -- GC protection ------------------------------------------------------

    /// Pin a value against collection until [`Heap::release_protected`].
    /// Used by native functions for transient allocations.
    pub fn protect(&mut self, value: Value) -> Value {
        self.protected.push(value);
        value
    }

    pub fn protected_len(&self) -> usize {
        self.protected.len()
    }

    /// Drop protection for everything pinned after `mark`. The VM calls
    /// this when a native function returns.
    pub fn release_protected(&mut self, mark: usize) {
        self.protected.truncate(mark);
    }

    /// Defer collection; used while the compiler owns blobs that are not
    /// yet reachable from any root.
    pub fn pause_gc(&mut self) {
        self.pause_depth += 1;
    }

    pub fn resume_gc(&mut self) {
        debug_assert!(self.pause_depth > 0);
        self.pause_depth -= 1;
    }

    pub fn should_collect(&self) -> bool {
        self.pause_depth == 0 && self.bytes_allocated > self.next_gc
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Number of live objects. Exposed for tests and heap statistics.
    pub fn live_objects(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    // -- Mark phase ---------------------------------------------------------

    pub fn is_marked(&self, r: ObjRef) -> bool {
        self.slots[r.0 as usize].as_ref().map(|s| s.marked).unwrap_or(false)
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    pub fn mark_object(&mut self, r: ObjRef) {
        if let Some(slot) = self.slots[r.0 as usize].as_mut() {
            if !slot.marked {
                slot.marked = true;
                self.gray.push(r);
            }
        }
    }

    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_value(key);
            self.mark_value(value);
        }
    }

    fn mark_protected(&mut self) {
        let pinned = std::mem::take(&mut self.protected);
        for value in &pinned {
            self.mark_value(*value);
        }
        self.protected = pinned;
    }

    /// Drain the gray worklist, blackening each object by marking its
    /// referents. Iterative so deep object graphs cannot overflow the host
    /// stack.
    pub fn trace_references(&mut self) {
        let mut scratch: Vec<Value> = Vec::new();
        while let Some(r) = self.gray.pop() {
            scratch.clear();
            self.collect_referents(r, &mut scratch);
            for value in scratch.drain(..) {
                self.mark_value(value);
            }
        }
    }

    fn collect_referents(&self, r: ObjRef, out: &mut Vec<Value>) {
        match self.get(r) {
            Obj::Str(_) | Obj::Bytes(_) | Obj::Range(_) | Obj::File(_) | Obj::Native(_)
            | Obj::Pointer(_) => {}
            Obj::List(l) => out.extend_from_slice(&l.items),
            Obj::Dict(d) => {
                out.extend_from_slice(&d.keys);
                for (k, v) in d.table.iter() {
                    out.push(k);
                    out.push(v);
                }
            }
            Obj::Upvalue(u) => {
                if let UpvalueState::Closed(v) = u.state {
                    out.push(v);
                }
            }
            Obj::BoundMethod(b) => {
                out.push(b.receiver);
                out.push(b.method);
            }
            Obj::Closure(c) => {
                out.push(Value::Obj(c.function));
                out.extend(c.upvalues.iter().map(|u| Value::Obj(*u)));
            }
            Obj::Function(f) => {
                if let Some(name) = f.name {
                    out.push(Value::Obj(name));
                }
                out.push(Value::Obj(f.module));
                out.extend_from_slice(&f.blob.constants);
            }
            Obj::Instance(i) => {
                out.push(Value::Obj(i.class));
                for (k, v) in i.properties.iter() {
                    out.push(k);
                    out.push(v);
                }
            }
            Obj::Class(c) => {
                out.push(Value::Obj(c.name));
                for table in [&c.properties, &c.statics, &c.methods] {
                    for (k, v) in table.iter() {
                        out.push(k);
                        out.push(v);
                    }
                }
                out.push(c.initializer);
                if let Some(superclass) = c.superclass {
                    out.push(Value::Obj(superclass));
                }
            }
            Obj::Module(m) => {
                for (k, v) in m.values.iter() {
                    out.push(k);
                    out.push(v);
                }
            }
            Obj::Switch(s) => {
                for (k, v) in s.table.iter() {
                    out.push(k);
                    out.push(v);
                }
            }
        }
    }

    // -- Sweep phase --------------------------------------------------------

    /// Begin a collection cycle: mark internally pinned values. The VM
    /// marks its own roots before calling [`Heap::trace_references`].
    pub fn begin_cycle(&mut self) {
        debug_assert!(self.gray.is_empty());
        self.mark_protected();
    }

    /// Tombstone interning-table entries whose string died this cycle.
    /// Must run between marking and [`Heap::sweep`].
    pub fn remove_white_strings(&mut self) {
        let slots = &self.slots;
        self.strings.remove_white_keys(|r| {
            slots[r.0 as usize].as_ref().map(|s| s.marked).unwrap_or(false)
        });
    }

    /// Free every unmarked object and clear the mark bits of survivors.
    /// Returns the number of objects freed.
    pub fn sweep(&mut self) -> usize {
        let before = self.bytes_allocated;
        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Some(s) if s.marked => s.marked = false,
                Some(s) => {
                    self.bytes_allocated =
                        self.bytes_allocated.saturating_sub(size_estimate(&s.obj));
                    *slot = None;
                    self.free.push(index as u32);
                    freed += 1;
                }
                None => {}
            }
        }
        self.next_gc = (self.bytes_allocated as f64 * GC_HEAP_GROWTH_FACTOR) as usize;
        trace!(
            "gc cycle: freed {} objects, {} -> {} bytes, next at {}",
            freed, before, self.bytes_allocated, self.next_gc
        );
        freed
    }
}

/// Rough per-object footprint for the allocation account. Collection
/// pressure only needs to correlate with real usage, not match it.
fn size_estimate(obj: &Obj) -> usize {
    let base = std::mem::size_of::<Obj>();
    base + match obj {
        Obj::Str(s) => s.text.len(),
        Obj::Bytes(b) => b.bytes.capacity(),
        Obj::List(l) => l.items.capacity() * std::mem::size_of::<Value>(),
        Obj::Dict(d) => d.keys.capacity() * std::mem::size_of::<Value>() * 3,
        Obj::Function(f) => f.blob.code.len() + f.blob.constants.len() * std::mem::size_of::<Value>(),
        Obj::Closure(c) => c.upvalues.len() * std::mem::size_of::<ObjRef>(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_deduplicates() {
        let mut heap = Heap::new();
        let a = heap.intern("interned");
        let b = heap.intern("interned");
        let c = heap.intern("other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.live_objects(), 2);
    }

    #[test]
    fn unreachable_objects_are_swept() {
        let mut heap = Heap::new();
        let kept = heap.intern("kept");
        heap.alloc_list(Vec::new());
        heap.alloc_bytes(vec![1, 2, 3]);

        heap.begin_cycle();
        heap.mark_object(kept);
        heap.trace_references();
        heap.remove_white_strings();
        let freed = heap.sweep();

        assert_eq!(freed, 2);
        assert_eq!(heap.live_objects(), 1);
        // The survivor is still interned: a fresh intern returns it.
        assert_eq!(heap.intern("kept"), kept);
    }

    #[test]
    fn dead_strings_leave_the_intern_table() {
        let mut heap = Heap::new();
        let doomed = heap.intern("doomed");

        heap.begin_cycle();
        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();

        // Re-interning the same text must produce a fresh object rather
        // than resurrect the stale reference.
        let fresh = heap.intern("doomed");
        assert_ne!(doomed, fresh);
        assert_eq!(heap.live_objects(), 1);
    }

    #[test]
    fn marking_traces_nested_containers() {
        let mut heap = Heap::new();
        let inner = heap.alloc_list(Vec::new());
        let outer = heap.alloc_list(vec![inner]);

        heap.begin_cycle();
        heap.mark_value(outer);
        heap.trace_references();
        heap.remove_white_strings();
        let freed = heap.sweep();

        assert_eq!(freed, 0);
        assert_eq!(heap.live_objects(), 2);
    }

    #[test]
    fn protected_values_survive() {
        let mut heap = Heap::new();
        let list = heap.alloc_list(Vec::new());
        let mark = heap.protected_len();
        heap.protect(list);

        heap.begin_cycle();
        heap.trace_references();
        heap.remove_white_strings();
        assert_eq!(heap.sweep(), 0);

        heap.release_protected(mark);
        heap.begin_cycle();
        heap.trace_references();
        heap.remove_white_strings();
        assert_eq!(heap.sweep(), 1);
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut heap = Heap::new();
        heap.alloc_list(Vec::new());
        let before = heap.live_objects();

        heap.begin_cycle();
        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();

        let replacement = heap.alloc_bytes(vec![1]);
        assert_eq!(heap.live_objects(), before);
        assert!(matches!(heap.get(replacement.as_obj().unwrap()), Obj::Bytes(_)));
    }
}
