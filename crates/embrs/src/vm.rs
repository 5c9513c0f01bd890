//! Stack-based bytecode virtual machine.
//!
//! Executes the blobs produced by [`crate::compiler`] over a bounded value
//! stack and a bounded call-frame stack. All runtime state — the stack,
//! frames, globals, modules, open upvalues, and the object heap — lives
//! here; the compiler is pure translation and `operators`/`methods` are
//! stateless helpers.
//!
//! Runtime errors are synthesised into `Exception` instances and raised
//! into the current frame's handler chain, making them indistinguishable
//! from user-raised exceptions at the handler level.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use log::warn;

use crate::bytecode::Opcode;
use crate::compiler::{self, CompileOptions};
use crate::debug;
use crate::error::{Error, Result};
use crate::heap::{
    BoundMethodObj, ClassObj, ClosureObj, FunctionKind, FunctionObj, Heap, InstanceObj,
    ModuleObj, NativeObj, Obj, ObjRef, UpvalueState, UpvalueObj,
};
use crate::methods;
use crate::modules::{NativeModuleDef, NativeValue};
use crate::operators;
use crate::table::Table;
use crate::value::{
    echo_value, hash_value, is_falsey, stringify, type_name, Value,
};

/// Fixed capacity of the value stack.
pub const STACK_MAX: usize = 1024;

/// Fixed capacity of the call-frame stack.
pub const FRAMES_MAX: usize = 512;

/// Exception handlers that can be live in one frame at once.
const MAX_HANDLER_FRAMES: usize = 16;

/// An exception handler installed by `OP_TRY`.
#[derive(Debug, Clone, Copy)]
struct HandlerFrame {
    /// Class to match; `None` for finally-only handlers.
    class: Option<ObjRef>,
    /// Bytecode offset of the catch body; 0 means "no catch".
    address: usize,
    /// Bytecode offset of the finally body; 0 means "no finally".
    finally_address: usize,
    /// Value-stack height when the handler was installed, restored before
    /// the handler binds the exception.
    stack_depth: usize,
}

/// One activation record.
struct CallFrame {
    closure: ObjRef,
    ip: usize,
    /// Stack index of slot 0 for this frame.
    slots: usize,
    handlers: Vec<HandlerFrame>,
}

/// Where `echo` output goes: the process stdout, or a capture buffer used
/// by [`crate::Runtime::capture`] and the test suite.
enum EchoSink {
    Stdout,
    Buffer(Vec<String>),
}

/// Internal control-flow signal for opcode handlers.
enum VmSignal {
    /// An exception value looking for a handler.
    Raise(Value),
    /// The top-level frame returned; execution is complete.
    Done(Value),
    /// Unrecoverable condition; reported to the host as-is.
    Halt(Error),
}

type OpResult = std::result::Result<(), VmSignal>;

pub struct Vm {
    pub(crate) heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// VM-wide globals (the `Exception` bootstrap and imported module
    /// bindings at the top level).
    globals: Table,
    /// Known modules: native modules by name, source modules by file.
    modules: Table,
    /// Open upvalues ordered by stack slot, deepest first.
    open_upvalues: Vec<ObjRef>,
    exception_class: ObjRef,
    illegal_state_class: ObjRef,
    /// Module owning the hand-assembled bootstrap functions.
    core_module: ObjRef,
    echo: EchoSink,
    native_names: HashSet<String>,
    pub(crate) is_repl: bool,
    pub(crate) dump_bytecode: bool,
    pub(crate) search_paths: Vec<PathBuf>,
    pub(crate) argv: Vec<String>,
}

impl Vm {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let core_module = heap.alloc(Obj::Module(ModuleObj {
            name: "<core>".to_string(),
            file: "<core>".to_string(),
            values: Table::new(),
            preloader: None,
            unloader: None,
            imported: true,
        }));

        let mut vm = Self {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            modules: Table::new(),
            open_upvalues: Vec::new(),
            exception_class: core_module, // patched right below
            illegal_state_class: core_module,
            core_module,
            echo: EchoSink::Stdout,
            native_names: HashSet::new(),
            is_repl: false,
            dump_bytecode: false,
            search_paths: Vec::new(),
            argv: Vec::new(),
        };
        vm.bootstrap_exceptions();
        vm
    }

    /// Build the `Exception` base class (and its `IllegalState` subclass
    /// used by `assert`) with a hand-assembled one-argument initializer
    /// that stores `message` on the new instance.
    fn bootstrap_exceptions(&mut self) {
        let exception = self.make_exception_class("Exception", None);
        let illegal_state = self.make_exception_class("IllegalState", Some(exception));
        self.exception_class = exception;
        self.illegal_state_class = illegal_state;
    }

    fn make_exception_class(&mut self, name: &str, superclass: Option<ObjRef>) -> ObjRef {
        let class_name = self.heap.intern(name);
        let message_name = self.heap.intern_value("message");
        let stacktrace_name = self.heap.intern_value("stacktrace");

        let mut blob = crate::bytecode::Blob::new();
        let message_const = blob.add_constant(message_name);
        blob.write_op(Opcode::GetLocal, 0);
        blob.write_u16(0, 0);
        blob.write_op(Opcode::GetLocal, 0);
        blob.write_u16(1, 0);
        blob.write_op(Opcode::SetProperty, 0);
        blob.write_u16(message_const, 0);
        blob.write_op(Opcode::Pop, 0);
        blob.write_op(Opcode::GetLocal, 0);
        blob.write_u16(0, 0);
        blob.write_op(Opcode::Return, 0);

        let function = self.heap.alloc(Obj::Function(FunctionObj {
            arity: 1,
            upvalue_count: 0,
            is_variadic: false,
            kind: FunctionKind::Initializer,
            name: Some(class_name),
            module: self.core_module,
            blob,
        }));
        let initializer = Value::Obj(self.heap.alloc(Obj::Closure(ClosureObj {
            function,
            upvalues: Vec::new(),
        })));

        let mut properties = Table::new();
        let h = hash_value(&self.heap, message_name);
        properties.set(h, message_name, Value::Nil);
        let h = hash_value(&self.heap, stacktrace_name);
        properties.set(h, stacktrace_name, Value::Nil);

        let mut methods = Table::new();
        let name_value = Value::Obj(class_name);
        let h = hash_value(&self.heap, name_value);
        methods.set(h, name_value, initializer);

        if let Some(superclass) = superclass {
            let parent = self.heap.class(superclass);
            let parent_props = parent.properties.clone();
            let parent_methods = parent.methods.clone();
            properties.add_all(&parent_props);
            methods.add_all(&parent_methods);
        }

        let class = self.heap.alloc(Obj::Class(ClassObj {
            name: class_name,
            properties,
            statics: Table::new(),
            methods,
            initializer,
            superclass,
        }));
        self.globals.set(hash_value(&self.heap, name_value), name_value, Value::Obj(class));
        class
    }

    // -- Host configuration -------------------------------------------------

    pub fn set_echo_capture(&mut self, capture: bool) {
        self.echo = if capture { EchoSink::Buffer(Vec::new()) } else { EchoSink::Stdout };
    }

    pub fn take_echo_output(&mut self) -> Vec<String> {
        match &mut self.echo {
            EchoSink::Buffer(lines) => std::mem::take(lines),
            EchoSink::Stdout => Vec::new(),
        }
    }

    /// Materialise a native-module definition into a heap module and
    /// register it for import.
    pub fn register_native_module(&mut self, def: NativeModuleDef) {
        let NativeModuleDef { name, fields, functions, classes, preloader, unloader } = def;

        let mut values = Table::new();
        for (field_name, field_value) in fields {
            let key = self.heap.intern_value(&field_name);
            let value = self.native_value(field_value);
            values.set(hash_value(&self.heap, key), key, value);
        }
        for (fn_name, function) in functions {
            let key = self.heap.intern_value(&fn_name);
            let native = Value::Obj(self.heap.alloc(Obj::Native(NativeObj {
                name: fn_name,
                function,
            })));
            values.set(hash_value(&self.heap, key), key, native);
        }
        for class_def in classes {
            let class_name = self.heap.intern(&class_def.name);
            let mut properties = Table::new();
            for (field_name, field_value) in class_def.fields {
                let key = self.heap.intern_value(&field_name);
                let value = self.native_value(field_value);
                properties.set(hash_value(&self.heap, key), key, value);
            }
            let mut methods = Table::new();
            let mut initializer = Value::Empty;
            for (method_name, function) in class_def.methods {
                let key = self.heap.intern_value(&method_name);
                let native = Value::Obj(self.heap.alloc(Obj::Native(NativeObj {
                    name: method_name.clone(),
                    function,
                })));
                if method_name == class_def.name {
                    initializer = native;
                }
                methods.set(hash_value(&self.heap, key), key, native);
            }
            let class = Value::Obj(self.heap.alloc(Obj::Class(ClassObj {
                name: class_name,
                properties,
                statics: Table::new(),
                methods,
                initializer,
                superclass: None,
            })));
            let key = Value::Obj(class_name);
            values.set(hash_value(&self.heap, key), key, class);
        }

        let module = self.heap.alloc(Obj::Module(ModuleObj {
            name: name.clone(),
            file: format!("<native:{}>", name),
            values,
            preloader,
            unloader,
            imported: false,
        }));
        let key = self.heap.intern_value(&name);
        self.modules.set(hash_value(&self.heap, key), key, Value::Obj(module));
        self.native_names.insert(name);
    }

    fn native_value(&mut self, value: NativeValue) -> Value {
        match value {
            NativeValue::Nil => Value::Nil,
            NativeValue::Bool(b) => Value::Bool(b),
            NativeValue::Number(n) => Value::Number(n),
            NativeValue::Str(s) => self.heap.intern_value(&s),
        }
    }

    /// Run the module unload hooks. Called when the host frees the VM.
    pub fn unload_native_modules(&mut self) {
        let modules: Vec<Value> = self.modules.iter().map(|(_, v)| v).collect();
        for value in modules {
            let Some(r) = value.as_obj() else { continue };
            let hook = match self.heap.get(r) {
                Obj::Module(m) if m.imported => m.unloader.clone(),
                _ => None,
            };
            if let Some(hook) = hook {
                self.heap.module_mut(r).imported = false;
                hook(&mut self.heap);
            }
        }
    }

    // -- Interpretation -----------------------------------------------------

    fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            repl: self.is_repl,
            search_paths: self.search_paths.clone(),
            native_modules: self.native_names.clone(),
        }
    }

    /// Compile and execute `source` as a module. Returns the script's
    /// result value (useful in REPL mode), or the error that stopped it.
    pub fn interpret(&mut self, source: &str, module_name: &str, file: &str) -> Result<Value> {
        let module = self.heap.alloc(Obj::Module(ModuleObj {
            name: module_name.to_string(),
            file: file.to_string(),
            values: Table::new(),
            preloader: None,
            unloader: None,
            imported: true,
        }));
        let options = self.compile_options();
        let function = compiler::compile(&mut self.heap, source, module, &options)?;

        if self.dump_bytecode {
            eprint!("{}", debug::disassemble(&self.heap, function));
        }

        // Register the entry module like any import would.
        let file_key = self.heap.intern_value(file);
        self.modules.set(hash_value(&self.heap, file_key), file_key, Value::Obj(module));
        let name_key = self.heap.intern_value(module_name);
        self.globals.set(hash_value(&self.heap, name_key), name_key, Value::Obj(module));

        let closure = Value::Obj(self.heap.alloc(Obj::Closure(ClosureObj {
            function,
            upvalues: Vec::new(),
        })));
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        self.push(closure).map_err(signal_to_error)?;
        self.call_value(closure, 0).map_err(signal_to_error)?;
        self.run()
    }

    /// The fetch-decode-execute loop. Raised exceptions are routed through
    /// the handler chain; anything unhandled is rendered and returned as a
    /// runtime error.
    fn run(&mut self) -> Result<Value> {
        loop {
            if self.frames.is_empty() {
                // A finally-only try whose body raised can legally unwind
                // every frame without a Done signal.
                return Ok(self.stack.pop().unwrap_or(Value::Nil));
            }
            if self.heap.should_collect() {
                self.collect_garbage();
            }
            let byte = self.read_byte();
            let Some(op) = Opcode::from_byte(byte) else {
                return Err(Error::Fatal(format!("corrupt bytecode: {:#x}", byte)));
            };
            match self.dispatch(op) {
                Ok(()) => {}
                Err(VmSignal::Done(value)) => return Ok(value),
                Err(VmSignal::Raise(exception)) => {
                    if !self.propagate_exception(exception) {
                        return Err(self.unhandled(exception));
                    }
                }
                Err(VmSignal::Halt(error)) => return Err(error),
            }
        }
    }

    // -- Frame and code access ----------------------------------------------

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active frame");
        let function = self.heap.closure(frame.closure).function;
        let byte = self.heap.function(function).blob.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let frame = self.frames.last_mut().expect("no active frame");
        let function = self.heap.closure(frame.closure).function;
        let value = self.heap.function(function).blob.read_u16(frame.ip);
        frame.ip += 2;
        value
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_u16() as usize;
        let function = self.current_function();
        self.heap.function(function).blob.constants[index]
    }

    fn current_function(&self) -> ObjRef {
        let frame = self.frames.last().expect("no active frame");
        self.heap.closure(frame.closure).function
    }

    fn current_module(&self) -> ObjRef {
        self.heap.function(self.current_function()).module
    }

    // -- Stack primitives ---------------------------------------------------

    fn push(&mut self, value: Value) -> OpResult {
        if self.stack.len() == STACK_MAX {
            return Err(self.raise("stack overflow".to_string()));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Nil)
    }

    fn pop_n(&mut self, n: usize) {
        let len = self.stack.len().saturating_sub(n);
        self.stack.truncate(len);
    }

    fn peek(&self, distance: usize) -> Value {
        let len = self.stack.len();
        if distance + 1 > len {
            Value::Nil
        } else {
            self.stack[len - 1 - distance]
        }
    }

    fn set_peek(&mut self, distance: usize, value: Value) {
        let len = self.stack.len();
        self.stack[len - 1 - distance] = value;
    }

    // -- Exceptions ---------------------------------------------------------

    /// Build an `Exception` instance for a runtime error and return the
    /// raise signal for it.
    fn raise(&mut self, message: String) -> VmSignal {
        self.raise_as(self.exception_class, message)
    }

    fn raise_as(&mut self, class: ObjRef, message: String) -> VmSignal {
        let instance = self.make_exception(class, &message);
        VmSignal::Raise(instance)
    }

    fn make_exception(&mut self, class: ObjRef, message: &str) -> Value {
        let mut properties = Table::new();
        let message_key = self.heap.intern_value("message");
        let message_value = self.heap.intern_value(message);
        properties.set(hash_value(&self.heap, message_key), message_key, message_value);
        let trace_key = self.heap.intern_value("stacktrace");
        let trace = self.stack_trace();
        let trace_value = self.heap.intern_value(&trace);
        properties.set(hash_value(&self.heap, trace_key), trace_key, trace_value);
        Value::Obj(self.heap.alloc(Obj::Instance(InstanceObj { class, properties })))
    }

    /// Format the active call frames as `file:line -> name()` lines,
    /// outermost first.
    fn stack_trace(&self) -> String {
        let mut lines = Vec::new();
        for frame in &self.frames {
            let function = self.heap.closure(frame.closure).function;
            let function = self.heap.function(function);
            let module = self.heap.module(function.module);
            let line = function.blob.line_at(frame.ip.saturating_sub(1));
            let name = match function.name {
                Some(name) => format!("{}()", self.heap.str_text(name)),
                None => "<script>".to_string(),
            };
            lines.push(format!("    {}:{} -> {}", module.file, line, name));
        }
        lines.join("\n")
    }

    /// Walk the handler chains from the current frame outward. On a class
    /// match, resume at the catch body with the exception on the stack;
    /// on a finally-only handler, push the "continue propagating" sentinel
    /// and run the finally body first. Returns false when no frame
    /// handles the exception.
    fn propagate_exception(&mut self, exception: Value) -> bool {
        while !self.frames.is_empty() {
            loop {
                let handler = match self.frames.last().unwrap().handlers.last() {
                    Some(handler) => *handler,
                    None => break,
                };
                let matches = handler.address != 0
                    && match handler.class {
                        Some(class) => self.exception_matches(exception, class),
                        None => false,
                    };
                if matches {
                    self.frames.last_mut().unwrap().ip = handler.address;
                    self.stack.truncate(handler.stack_depth);
                    self.stack.push(exception);
                    return true;
                }
                if handler.finally_address != 0 {
                    self.frames.last_mut().unwrap().ip = handler.finally_address;
                    self.stack.truncate(handler.stack_depth);
                    self.stack.push(exception);
                    self.stack.push(Value::Bool(true));
                    return true;
                }
                // Neither arm applies in this handler; discard it and keep
                // searching the same frame.
                self.frames.last_mut().unwrap().handlers.pop();
            }
            // Unwind this frame entirely.
            let finished = self.frames.pop().unwrap();
            self.close_upvalues(finished.slots);
            self.stack.truncate(finished.slots);
        }
        false
    }

    /// Does the exception's class (or any ancestor) match the handler's?
    fn exception_matches(&self, exception: Value, handler_class: ObjRef) -> bool {
        let Some(instance) = exception.as_obj() else { return false };
        let Obj::Instance(instance) = self.heap.get(instance) else { return false };
        let target_name = self.heap.class(handler_class).name;
        let mut class = Some(instance.class);
        while let Some(current) = class {
            let c = self.heap.class(current);
            if c.name == target_name {
                return true;
            }
            class = c.superclass;
        }
        false
    }

    fn unhandled(&mut self, exception: Value) -> Error {
        let (class_name, message, stacktrace) = match exception.as_obj() {
            Some(r) => {
                let class_name = match self.heap.get(r) {
                    Obj::Instance(i) => self.heap.str_text(self.heap.class(i.class).name).to_string(),
                    _ => "Exception".to_string(),
                };
                let message = self
                    .instance_property(exception, "message")
                    .map(|v| stringify(&self.heap, v))
                    .unwrap_or_default();
                let stacktrace = self
                    .instance_property(exception, "stacktrace")
                    .map(|v| stringify(&self.heap, v))
                    .unwrap_or_default();
                (class_name, message, stacktrace)
            }
            None => ("Exception".to_string(), stringify(&self.heap, exception), String::new()),
        };
        Error::Runtime { class: class_name, message, stacktrace }
    }

    fn instance_property(&self, value: Value, name: &str) -> Option<Value> {
        let r = value.as_obj()?;
        let Obj::Instance(instance) = self.heap.get(r) else { return None };
        let key = Value::Obj(self.heap.strings_lookup(name)?);
        instance.properties.get(hash_value(&self.heap, key), key)
    }

    // -- Upvalues -----------------------------------------------------------

    /// Find or create an open upvalue for a stack slot. The open list is
    /// kept ordered by slot so closing a range on frame exit is O(k).
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, upvalue) in self.open_upvalues.iter().enumerate().rev() {
            let open_slot = match self.heap.upvalue(*upvalue).state {
                UpvalueState::Open(s) => s,
                UpvalueState::Closed(_) => continue,
            };
            if open_slot == slot {
                return *upvalue;
            }
            if open_slot < slot {
                break;
            }
            insert_at = i;
        }
        let upvalue = self.heap.alloc(Obj::Upvalue(UpvalueObj {
            state: UpvalueState::Open(slot),
        }));
        self.open_upvalues.insert(insert_at, upvalue);
        upvalue
    }

    /// Close every open upvalue at or above `from_slot`, moving the value
    /// off the stack into the upvalue itself.
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&upvalue) = self.open_upvalues.last() {
            let slot = match self.heap.upvalue(upvalue).state {
                UpvalueState::Open(s) => s,
                UpvalueState::Closed(_) => {
                    self.open_upvalues.pop();
                    continue;
                }
            };
            if slot < from_slot {
                break;
            }
            let value = self.stack.get(slot).copied().unwrap_or(Value::Nil);
            self.heap.upvalue_mut(upvalue).state = UpvalueState::Closed(value);
            self.open_upvalues.pop();
        }
    }

    // -- Garbage collection -------------------------------------------------

    /// A full mark-sweep cycle with the VM's root set.
    fn collect_garbage(&mut self) {
        self.heap.begin_cycle();

        for value in &self.stack {
            self.heap.mark_value(*value);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
            for handler in &frame.handlers {
                if let Some(class) = handler.class {
                    self.heap.mark_object(class);
                }
            }
        }
        for upvalue in &self.open_upvalues {
            self.heap.mark_object(*upvalue);
        }
        let globals = std::mem::take(&mut self.globals);
        self.heap.mark_table(&globals);
        self.globals = globals;
        let modules = std::mem::take(&mut self.modules);
        self.heap.mark_table(&modules);
        self.modules = modules;
        self.heap.mark_object(self.exception_class);
        self.heap.mark_object(self.illegal_state_class);
        self.heap.mark_object(self.core_module);

        self.heap.trace_references();
        self.heap.remove_white_strings();
        self.heap.sweep();
    }

    // -- Calls --------------------------------------------------------------

    /// Dispatch a call to `callee` with `argc` arguments already on the
    /// stack. The callee sits just below its arguments.
    fn call_value(&mut self, callee: Value, argc: usize) -> OpResult {
        let Some(r) = callee.as_obj() else {
            let name = type_name(&self.heap, callee);
            return Err(self.raise(format!("object of type {} is not callable", name)));
        };
        match self.heap.get(r) {
            Obj::BoundMethod(bound) => {
                let receiver = bound.receiver;
                let method = bound.method;
                self.set_peek(argc, receiver);
                // Native methods see the receiver as args[0]; closures get
                // it through slot 0 of their frame.
                match method.as_obj().map(|m| self.heap.get(m)) {
                    Some(Obj::Native(_)) => self.call_native_method(method.as_obj().unwrap(), argc),
                    _ => self.call_value(method, argc),
                }
            }
            Obj::Class(_) => self.call_class(r, argc),
            Obj::Module(module) => {
                // A module with a self-named value is deliberately
                // callable through that value.
                let module_name = module.name.clone();
                let self_name = self.heap.intern_value(&module_name);
                let callable = self
                    .heap
                    .module(r)
                    .values
                    .get(hash_value(&self.heap, self_name), self_name);
                match callable {
                    Some(callable) => self.call_value(callable, argc),
                    None => Err(self.raise(format!("module {} is not callable", module_name))),
                }
            }
            Obj::Closure(_) => self.call_closure(r, argc),
            Obj::Native(_) => self.call_native(r, argc),
            _ => {
                let name = type_name(&self.heap, callee);
                Err(self.raise(format!("object of type {} is not callable", name)))
            }
        }
    }

    fn call_class(&mut self, class: ObjRef, argc: usize) -> OpResult {
        // Instances start from a one-level copy of the class's instance
        // property defaults.
        let defaults: Vec<(u32, Value, Value)> =
            self.heap.class(class).properties.iter_hashed().collect();
        let mut properties = Table::new();
        for (hash, key, value) in defaults {
            let copied = crate::value::copy_value(&mut self.heap, value);
            properties.set(hash, key, copied);
        }
        let instance = Value::Obj(self.heap.alloc(Obj::Instance(InstanceObj {
            class,
            properties,
        })));
        self.set_peek(argc, instance);

        let initializer = self.heap.class(class).initializer;
        let initializer = if initializer.is_empty() {
            match self.heap.class(class).superclass {
                Some(superclass) => self.heap.class(superclass).initializer,
                None => Value::Empty,
            }
        } else {
            initializer
        };
        if !initializer.is_empty() {
            // Native initializers see the fresh instance as args[0].
            return match initializer.as_obj().map(|m| self.heap.get(m)) {
                Some(Obj::Native(_)) => {
                    self.call_native_method(initializer.as_obj().unwrap(), argc)
                }
                _ => self.call_value(initializer, argc),
            };
        }
        if argc != 0 {
            let name = self.heap.str_text(self.heap.class(class).name).to_string();
            return Err(self.raise(format!(
                "{} constructor expects 0 arguments, {} given",
                name, argc
            )));
        }
        Ok(())
    }

    fn call_closure(&mut self, closure: ObjRef, mut argc: usize) -> OpResult {
        let function = self.heap.closure(closure).function;
        let (arity, is_variadic) = {
            let f = self.heap.function(function);
            (f.arity as usize, f.is_variadic)
        };

        // Missing arguments of a fixed-arity function default to nil.
        while !is_variadic && argc < arity {
            self.push(Value::Nil)?;
            argc += 1;
        }
        // A variadic function folds the excess into a list bound to the
        // trailing `__args__` parameter.
        if is_variadic && argc + 1 >= arity {
            let extra = argc + 1 - arity;
            let start = self.stack.len() - extra;
            let items = self.stack[start..].to_vec();
            let list = self.heap.alloc_list(items);
            self.stack.truncate(start);
            self.push(list)?;
            argc = arity;
        }
        if argc != arity {
            self.pop_n(argc);
            let message = if is_variadic {
                format!("expected at least {} arguments but got {}", arity - 1, argc)
            } else {
                format!("expected {} arguments but got {}", arity, argc)
            };
            return Err(self.raise(message));
        }
        if self.frames.len() == FRAMES_MAX {
            self.pop_n(argc);
            return Err(self.raise("stack overflow".to_string()));
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots: self.stack.len() - argc - 1,
            handlers: Vec::new(),
        });
        Ok(())
    }

    /// Invoke a host-native function. Arguments (with the receiver at
    /// index 0 for method calls) are passed as a slice; the result lands
    /// in the callee slot. Protected allocations are released when the
    /// call returns.
    fn call_native(&mut self, native: ObjRef, argc: usize) -> OpResult {
        let function = match self.heap.get(native) {
            Obj::Native(n) => Arc::clone(&n.function),
            _ => unreachable!(),
        };
        let protect_mark = self.heap.protected_len();
        let base = self.stack.len() - argc - 1;
        let args: Vec<Value> = self.stack[base..].to_vec();
        let result = function(&mut self.heap, &args[1..]);
        self.heap.release_protected(protect_mark);
        match result {
            Ok(value) => {
                self.stack.truncate(base);
                self.push(value)
            }
            Err(message) => Err(self.raise(message)),
        }
    }

    /// Invoke a native function as a method: the receiver is `args[0]`.
    fn call_native_method(&mut self, native: ObjRef, argc: usize) -> OpResult {
        let function = match self.heap.get(native) {
            Obj::Native(n) => Arc::clone(&n.function),
            _ => unreachable!(),
        };
        let protect_mark = self.heap.protected_len();
        let base = self.stack.len() - argc - 1;
        let args: Vec<Value> = self.stack[base..].to_vec();
        let result = function(&mut self.heap, &args);
        self.heap.release_protected(protect_mark);
        match result {
            Ok(value) => {
                self.stack.truncate(base);
                self.push(value)
            }
            Err(message) => Err(self.raise(message)),
        }
    }

    fn method_kind(&self, method: Value) -> FunctionKind {
        match method.as_obj().map(|r| self.heap.get(r)) {
            Some(Obj::Closure(c)) => self.heap.function(c.function).kind,
            _ => FunctionKind::Method,
        }
    }

    /// Method lookup beginning at `class` (inheritance copies parent
    /// methods in, so one table holds the whole chain).
    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: Value,
        argc: usize,
        allow_private: bool,
    ) -> OpResult {
        let method = self
            .heap
            .class(class)
            .methods
            .get(hash_value(&self.heap, name), name);
        let Some(method) = method else {
            let name = stringify(&self.heap, name);
            let class_name = self.heap.str_text(self.heap.class(class).name).to_string();
            return Err(self.raise(format!("undefined method '{}' in {}", name, class_name)));
        };
        if !allow_private && self.method_kind(method) == FunctionKind::Private {
            let name = stringify(&self.heap, name);
            return Err(self.raise(format!("cannot call private method '{}' from outside its class", name)));
        }
        match method.as_obj().map(|r| self.heap.get(r)) {
            Some(Obj::Native(_)) => self.call_native_method(method.as_obj().unwrap(), argc),
            _ => self.call_value(method, argc),
        }
    }

    /// `INVOKE name argc` — receiver sits below the arguments.
    fn invoke(&mut self, name: Value, argc: usize, from_self: bool) -> OpResult {
        let receiver = self.peek(argc);
        let name_text = stringify(&self.heap, name);

        let Some(r) = receiver.as_obj() else {
            let kind = type_name(&self.heap, receiver);
            return Err(self.raise(format!(
                "cannot call method {} on object of type {}",
                name_text, kind
            )));
        };

        match self.heap.get(r) {
            Obj::Module(module) => {
                let module_name = module.name.clone();
                let value = module.values.get(hash_value(&self.heap, name), name);
                match value {
                    Some(value) => {
                        if name_text.starts_with('_') && !from_self {
                            return Err(self.raise(format!(
                                "cannot call private module method '{}'",
                                name_text
                            )));
                        }
                        self.call_value(value, argc)
                    }
                    None => Err(self.raise(format!(
                        "module {} does not define class or method {}()",
                        module_name, name_text
                    ))),
                }
            }
            Obj::Class(class) => {
                let class_name = self.heap.str_text(class.name).to_string();
                if let Some(method) = class.methods.get(hash_value(&self.heap, name), name) {
                    match self.method_kind(method) {
                        FunctionKind::Private if !from_self => Err(self.raise(format!(
                            "cannot call private method {}() on {}",
                            name_text, class_name
                        ))),
                        FunctionKind::Static | FunctionKind::Private | FunctionKind::Initializer => {
                            self.call_value(method, argc)
                        }
                        _ if from_self => self.call_value(method, argc),
                        _ => Err(self.raise(format!(
                            "cannot call non-static method {}() on a class",
                            name_text
                        ))),
                    }
                } else if let Some(value) =
                    class.statics.get(hash_value(&self.heap, name), name)
                {
                    self.call_value(value, argc)
                } else {
                    Err(self.raise(format!(
                        "unknown method {}() in class {}",
                        name_text, class_name
                    )))
                }
            }
            Obj::Instance(instance) => {
                let class = instance.class;
                if let Some(value) = instance.properties.get(hash_value(&self.heap, name), name) {
                    self.set_peek(argc, value);
                    return self.call_value(value, argc);
                }
                self.invoke_from_class(class, name, argc, from_self)
            }
            _ => {
                // Built-in containers dispatch into the method tables.
                let base = self.stack.len() - argc;
                let args: Vec<Value> = self.stack[base..].to_vec();
                match methods::dispatch(&mut self.heap, receiver, &name_text, &args) {
                    Some(Ok(result)) => {
                        self.pop_n(argc + 1);
                        self.push(result)
                    }
                    Some(Err(message)) => Err(self.raise(message)),
                    None => {
                        let kind = type_name(&self.heap, receiver);
                        Err(self.raise(format!(
                            "cannot call method {} on object of type {}",
                            name_text, kind
                        )))
                    }
                }
            }
        }
    }

    // -- Indexing -----------------------------------------------------------

    fn get_index(&mut self, will_assign: bool) -> OpResult {
        let index = self.peek(0);
        let receiver = self.peek(1);
        let result = self.index_value(receiver, index)?;
        if !will_assign {
            self.pop_n(2);
        }
        self.push(result)
    }

    fn index_value(&mut self, receiver: Value, index: Value) -> std::result::Result<Value, VmSignal> {
        let Some(r) = receiver.as_obj() else {
            let kind = type_name(&self.heap, receiver);
            return Err(self.raise(format!("type {} is not indexable", kind)));
        };
        match self.heap.get(r) {
            Obj::Str(s) => {
                let Some(i) = index.as_number() else {
                    return Err(self.raise("strings are numerically indexed".to_string()));
                };
                let length = s.chars as i64;
                let i = i as i64;
                let i = if i < 0 { length + i } else { i };
                if i < 0 || i >= length {
                    return Err(self.raise(format!("string index {} out of range", i)));
                }
                match methods::string_char_at(&self.heap, r, i as usize) {
                    Some(c) => Ok(self.heap.intern_value(&c)),
                    None => Ok(Value::Nil),
                }
            }
            Obj::List(list) => {
                let Some(i) = index.as_number() else {
                    return Err(self.raise("lists are numerically indexed".to_string()));
                };
                let length = list.items.len() as i64;
                let i = i as i64;
                let i = if i < 0 { length + i } else { i };
                if i < 0 || i >= length {
                    return Err(self.raise(format!("list index {} out of range", i)));
                }
                Ok(self.heap.list(r).items[i as usize])
            }
            Obj::Bytes(bytes) => {
                let Some(i) = index.as_number() else {
                    return Err(self.raise("bytes are numerically indexed".to_string()));
                };
                let length = bytes.bytes.len() as i64;
                let i = i as i64;
                let i = if i < 0 { length + i } else { i };
                if i < 0 || i >= length {
                    return Err(self.raise(format!("bytes index {} out of range", i)));
                }
                Ok(Value::Number(self.heap.bytes(r).bytes[i as usize] as f64))
            }
            Obj::Dict(dict) => match dict.table.get(hash_value(&self.heap, index), index) {
                Some(value) => Ok(value),
                None => {
                    let rendered = stringify(&self.heap, index);
                    Err(self.raise(format!("invalid index {}", rendered)))
                }
            },
            Obj::Module(module) => match module.values.get(hash_value(&self.heap, index), index) {
                Some(value) => Ok(value),
                None => {
                    let rendered = stringify(&self.heap, index);
                    let name = self.heap.module(r).name.clone();
                    Err(self.raise(format!("module {} has no member {}", name, rendered)))
                }
            },
            _ => {
                let kind = type_name(&self.heap, receiver);
                Err(self.raise(format!("type {} is not indexable", kind)))
            }
        }
    }

    fn set_index(&mut self) -> OpResult {
        let value = self.peek(0);
        let index = self.peek(1);
        let receiver = self.peek(2);
        if value.is_empty() {
            return Err(self.raise("empty cannot be assigned".to_string()));
        }
        let Some(r) = receiver.as_obj() else {
            let kind = type_name(&self.heap, receiver);
            return Err(self.raise(format!("type {} is not index-assignable", kind)));
        };
        match self.heap.get(r) {
            Obj::List(list) => {
                let Some(i) = index.as_number() else {
                    return Err(self.raise("lists are numerically indexed".to_string()));
                };
                let length = list.items.len() as i64;
                let i = i as i64;
                let i = if i < 0 { length + i } else { i };
                if i < 0 || i >= length {
                    return Err(self.raise(format!("list index {} out of range", i)));
                }
                self.heap.list_mut(r).items[i as usize] = value;
            }
            Obj::Dict(_) => {
                methods::dict_set(&mut self.heap, r, index, value);
            }
            Obj::Bytes(bytes) => {
                let Some(i) = index.as_number() else {
                    return Err(self.raise("bytes are numerically indexed".to_string()));
                };
                let Some(byte) = value.as_number() else {
                    return Err(self.raise("bytes can only store numbers".to_string()));
                };
                let length = bytes.bytes.len() as i64;
                let i = i as i64;
                let i = if i < 0 { length + i } else { i };
                if i < 0 || i >= length {
                    return Err(self.raise(format!("bytes index {} out of range", i)));
                }
                self.heap.bytes_mut(r).bytes[i as usize] = byte as i64 as u8;
            }
            _ => {
                let kind = type_name(&self.heap, receiver);
                return Err(self.raise(format!("type {} is not index-assignable", kind)));
            }
        }
        // Leave the assigned value as the expression result.
        self.pop_n(3);
        self.push(value)
    }

    fn get_ranged_index(&mut self, will_assign: bool) -> OpResult {
        let upper = self.peek(0);
        let lower = self.peek(1);
        let receiver = self.peek(2);

        let bound = |v: Value| -> std::result::Result<Option<i64>, ()> {
            match v {
                Value::Nil => Ok(None),
                Value::Number(n) => Ok(Some(n as i64)),
                _ => Err(()),
            }
        };
        let (Ok(lower), Ok(upper)) = (bound(lower), bound(upper)) else {
            return Err(self.raise("range indices must be numbers or nil".to_string()));
        };

        let Some(r) = receiver.as_obj() else {
            let kind = type_name(&self.heap, receiver);
            return Err(self.raise(format!("type {} is not range-indexable", kind)));
        };
        let clamp = |length: usize, lower: Option<i64>, upper: Option<i64>| {
            let length = length as i64;
            let mut lo = lower.unwrap_or(0);
            let mut hi = upper.unwrap_or(length);
            if lo < 0 {
                lo += length;
            }
            if hi < 0 {
                hi += length;
            }
            let lo = lo.clamp(0, length) as usize;
            let hi = hi.clamp(0, length) as usize;
            (lo, hi.max(lo))
        };

        let result = match self.heap.get(r) {
            Obj::Str(s) => {
                let (lo, hi) = clamp(s.chars, lower, upper);
                let sliced: String = s.text.chars().skip(lo).take(hi - lo).collect();
                self.heap.intern_value(&sliced)
            }
            Obj::List(list) => {
                let (lo, hi) = clamp(list.items.len(), lower, upper);
                let items = list.items[lo..hi].to_vec();
                self.heap.alloc_list(items)
            }
            Obj::Bytes(bytes) => {
                let (lo, hi) = clamp(bytes.bytes.len(), lower, upper);
                let sliced = bytes.bytes[lo..hi].to_vec();
                self.heap.alloc_bytes(sliced)
            }
            _ => {
                let kind = type_name(&self.heap, receiver);
                return Err(self.raise(format!("type {} is not range-indexable", kind)));
            }
        };
        if !will_assign {
            self.pop_n(3);
        }
        self.push(result)
    }

    // -- Properties ---------------------------------------------------------

    fn get_property(&mut self, name: Value, on_self: bool) -> OpResult {
        let receiver = self.peek(0);
        let name_text = stringify(&self.heap, name);
        let Some(r) = receiver.as_obj() else {
            let kind = type_name(&self.heap, receiver);
            return Err(self.raise(format!("type {} has no properties", kind)));
        };
        match self.heap.get(r) {
            Obj::Module(module) => {
                let module_name = module.name.clone();
                match module.values.get(hash_value(&self.heap, name), name) {
                    Some(value) => {
                        if name_text.starts_with('_') && !on_self {
                            return Err(self.raise(format!(
                                "cannot get private module property '{}'",
                                name_text
                            )));
                        }
                        self.pop();
                        self.push(value)
                    }
                    None => Err(self.raise(format!(
                        "{} module does not define '{}'",
                        module_name, name_text
                    ))),
                }
            }
            Obj::Class(class) => {
                let class_name = self.heap.str_text(class.name).to_string();
                if let Some(method) = class.methods.get(hash_value(&self.heap, name), name) {
                    if self.method_kind(method) == FunctionKind::Static || on_self {
                        self.pop();
                        return self.push(method);
                    }
                }
                if let Some(value) = class.statics.get(hash_value(&self.heap, name), name) {
                    self.pop();
                    return self.push(value);
                }
                Err(self.raise(format!(
                    "class {} does not have a static property or method named '{}'",
                    class_name, name_text
                )))
            }
            Obj::Instance(instance) => {
                let class = instance.class;
                if let Some(value) = instance.properties.get(hash_value(&self.heap, name), name) {
                    if name_text.starts_with('_') && !on_self {
                        return Err(self.raise(format!(
                            "cannot get private property '{}' from instance",
                            name_text
                        )));
                    }
                    self.pop();
                    return self.push(value);
                }
                if name_text.starts_with('_') && !on_self {
                    return Err(self.raise(format!(
                        "cannot bind private property '{}' from instance",
                        name_text
                    )));
                }
                // Bind the method to its receiver.
                let method = self
                    .heap
                    .class(class)
                    .methods
                    .get(hash_value(&self.heap, name), name);
                match method {
                    Some(method) => {
                        let bound = Value::Obj(self.heap.alloc(Obj::BoundMethod(BoundMethodObj {
                            receiver,
                            method,
                        })));
                        self.pop();
                        self.push(bound)
                    }
                    None => {
                        let class_name =
                            self.heap.str_text(self.heap.class(class).name).to_string();
                        Err(self.raise(format!(
                            "instance of class {} does not have a property or method named '{}'",
                            class_name, name_text
                        )))
                    }
                }
            }
            Obj::Dict(dict) => {
                // Dot access doubles as ordered-key lookup on dictionaries.
                if let Some(value) = dict.table.get(hash_value(&self.heap, name), name) {
                    self.pop();
                    return self.push(value);
                }
                self.builtin_property(receiver, &name_text)
            }
            Obj::Str(_) | Obj::List(_) | Obj::Bytes(_) | Obj::Range(_) | Obj::File(_) => {
                self.builtin_property(receiver, &name_text)
            }
            _ => {
                let kind = type_name(&self.heap, receiver);
                Err(self.raise(format!("type {} has no property '{}'", kind, name_text)))
            }
        }
    }

    /// Properties of built-in containers: an unknown name raises here and
    /// now, `length` evaluates in place, and any other method name
    /// produces a bound method value.
    fn builtin_property(&mut self, receiver: Value, name: &str) -> OpResult {
        if !methods::has_method(&self.heap, receiver, name).unwrap_or(false) {
            let kind = type_name(&self.heap, receiver);
            return Err(self.raise(format!("{} has no named property '{}'", kind, name)));
        }
        if name == "length" {
            match methods::dispatch(&mut self.heap, receiver, "length", &[]) {
                Some(Ok(result)) => {
                    self.pop();
                    return self.push(result);
                }
                Some(Err(message)) => return Err(self.raise(message)),
                None => {}
            }
        }
        let method_name = name.to_string();
        let dispatch_name = method_name.clone();
        let native = Value::Obj(self.heap.alloc(Obj::Native(NativeObj {
            name: method_name,
            function: Arc::new(move |heap: &mut Heap, args: &[Value]| {
                match methods::dispatch(heap, args[0], &dispatch_name, &args[1..]) {
                    Some(result) => result,
                    None => Err(format!("no method {}() on this value", dispatch_name)),
                }
            }),
        })));
        let bound = Value::Obj(self.heap.alloc(Obj::BoundMethod(BoundMethodObj {
            receiver,
            method: native,
        })));
        self.pop();
        self.push(bound)
    }

    fn set_property(&mut self, name: Value) -> OpResult {
        let value = self.peek(0);
        let receiver = self.peek(1);
        if value.is_empty() {
            return Err(self.raise("empty cannot be assigned".to_string()));
        }
        let hash = hash_value(&self.heap, name);
        let Some(r) = receiver.as_obj() else {
            let kind = type_name(&self.heap, receiver);
            return Err(self.raise(format!("cannot set property on type {}", kind)));
        };
        match self.heap.get_mut(r) {
            Obj::Instance(instance) => {
                instance.properties.set(hash, name, value);
            }
            Obj::Class(class) => {
                class.statics.set(hash, name, value);
            }
            Obj::Module(module) => {
                module.values.set(hash, name, value);
            }
            _ => {
                let kind = type_name(&self.heap, receiver);
                return Err(self.raise(format!("cannot set property on type {}", kind)));
            }
        }
        self.pop_n(2);
        self.push(value)
    }

    // -- Echo ---------------------------------------------------------------

    fn echo_line(&mut self, value: Value) {
        // The empty sentinel prints nothing, not even a newline.
        if value.is_empty() {
            return;
        }
        let rendered = if self.is_repl {
            echo_value(&self.heap, value)
        } else {
            stringify(&self.heap, value)
        };
        match &mut self.echo {
            EchoSink::Stdout => println!("{}", rendered),
            EchoSink::Buffer(lines) => lines.push(rendered),
        }
    }

    // -- Opcode dispatch ----------------------------------------------------

    fn dispatch(&mut self, op: Opcode) -> OpResult {
        match op {
            Opcode::Constant => {
                let value = self.read_constant();
                self.push(value)?;
            }
            Opcode::Nil => self.push(Value::Nil)?,
            Opcode::True => self.push(Value::Bool(true))?,
            Opcode::False => self.push(Value::Bool(false))?,
            Opcode::Empty => self.push(Value::Empty)?,
            Opcode::One => self.push(Value::Number(1.0))?,
            Opcode::Pop => {
                self.pop();
            }
            Opcode::PopN => {
                let n = self.read_u16() as usize;
                self.pop_n(n);
            }
            Opcode::Dup => {
                let top = self.peek(0);
                self.push(top)?;
            }

            // -- Variables --
            Opcode::DefineGlobal => {
                let name = self.read_constant();
                let value = self.peek(0);
                if value.is_empty() {
                    return Err(self.raise("empty cannot be assigned".to_string()));
                }
                let module = self.current_module();
                let hash = hash_value(&self.heap, name);
                self.heap.module_mut(module).values.set(hash, name, value);
                self.pop();
            }
            Opcode::GetGlobal => {
                let name = self.read_constant();
                let hash = hash_value(&self.heap, name);
                let module = self.current_module();
                let value = self
                    .heap
                    .module(module)
                    .values
                    .get(hash, name)
                    .or_else(|| self.globals.get(hash, name));
                match value {
                    Some(value) => self.push(value)?,
                    None => {
                        let rendered = stringify(&self.heap, name);
                        return Err(self.raise(format!("'{}' is undefined in this scope", rendered)));
                    }
                }
            }
            Opcode::SetGlobal => {
                let name = self.read_constant();
                let value = self.peek(0);
                if value.is_empty() {
                    return Err(self.raise("empty cannot be assigned".to_string()));
                }
                let hash = hash_value(&self.heap, name);
                let module = self.current_module();
                if self.heap.module(module).values.contains(hash, name) {
                    self.heap.module_mut(module).values.set(hash, name, value);
                } else if self.globals.contains(hash, name) {
                    self.globals.set(hash, name, value);
                } else {
                    let rendered = stringify(&self.heap, name);
                    return Err(self.raise(format!("'{}' is undefined in this scope", rendered)));
                }
            }
            Opcode::GetLocal => {
                let slot = self.read_u16() as usize;
                let base = self.frames.last().unwrap().slots;
                let value = self.stack.get(base + slot).copied().unwrap_or(Value::Nil);
                self.push(value)?;
            }
            Opcode::SetLocal => {
                let slot = self.read_u16() as usize;
                let value = self.peek(0);
                if value.is_empty() {
                    return Err(self.raise("empty cannot be assigned".to_string()));
                }
                let base = self.frames.last().unwrap().slots;
                self.stack[base + slot] = value;
            }
            Opcode::GetUpvalue => {
                let index = self.read_u16() as usize;
                let closure = self.frames.last().unwrap().closure;
                let upvalue = self.heap.closure(closure).upvalues[index];
                let value = match self.heap.upvalue(upvalue).state {
                    UpvalueState::Open(slot) => self.stack[slot],
                    UpvalueState::Closed(value) => value,
                };
                self.push(value)?;
            }
            Opcode::SetUpvalue => {
                let index = self.read_u16() as usize;
                let value = self.peek(0);
                if value.is_empty() {
                    return Err(self.raise("empty cannot be assigned".to_string()));
                }
                let closure = self.frames.last().unwrap().closure;
                let upvalue = self.heap.closure(closure).upvalues[index];
                match self.heap.upvalue(upvalue).state {
                    UpvalueState::Open(slot) => self.stack[slot] = value,
                    UpvalueState::Closed(_) => {
                        self.heap.upvalue_mut(upvalue).state = UpvalueState::Closed(value);
                    }
                }
            }
            Opcode::CloseUpvalue => {
                self.close_upvalues(self.stack.len().saturating_sub(1));
                self.pop();
            }

            // -- Arithmetic and logic --
            Opcode::Add
            | Opcode::Subtract
            | Opcode::Multiply
            | Opcode::Divide
            | Opcode::FloorDivide
            | Opcode::Remainder
            | Opcode::Pow
            | Opcode::BitAnd
            | Opcode::BitOr
            | Opcode::BitXor
            | Opcode::LeftShift
            | Opcode::RightShift
            | Opcode::Greater
            | Opcode::Less => {
                let right = self.pop();
                let left = self.pop();
                match operators::binary_op(&mut self.heap, op, left, right) {
                    Ok(result) => self.push(result)?,
                    Err(message) => return Err(self.raise(message)),
                }
            }
            Opcode::Equal => {
                let right = self.pop();
                let left = self.pop();
                self.push(Value::Bool(left == right))?;
            }
            Opcode::Negate => {
                let value = self.pop();
                match value.as_number() {
                    Some(n) => self.push(Value::Number(-n))?,
                    None => {
                        let kind = type_name(&self.heap, value);
                        return Err(self.raise(format!("cannot negate value of type {}", kind)));
                    }
                }
            }
            Opcode::Not => {
                let value = self.pop();
                let falsey = is_falsey(&self.heap, value);
                self.push(Value::Bool(falsey))?;
            }
            Opcode::BitNot => {
                let value = self.pop();
                match value.as_number() {
                    Some(n) => self.push(Value::Number(!operators::to_int32(n) as f64))?,
                    None => {
                        let kind = type_name(&self.heap, value);
                        return Err(self.raise(format!("cannot invert value of type {}", kind)));
                    }
                }
            }

            // -- Control flow --
            Opcode::Jump => {
                let offset = self.read_u16() as usize;
                self.frames.last_mut().unwrap().ip += offset;
            }
            Opcode::JumpIfFalse => {
                let offset = self.read_u16() as usize;
                let condition = self.peek(0);
                if is_falsey(&self.heap, condition) {
                    self.frames.last_mut().unwrap().ip += offset;
                }
            }
            Opcode::Loop => {
                let offset = self.read_u16() as usize;
                self.frames.last_mut().unwrap().ip -= offset;
            }
            Opcode::Choice => {
                let else_value = self.pop();
                let then_value = self.pop();
                let condition = self.pop();
                if is_falsey(&self.heap, condition) {
                    self.push(else_value)?;
                } else {
                    self.push(then_value)?;
                }
            }
            Opcode::Switch => {
                let switch = self.read_constant().as_obj().expect("switch constant");
                let selector = self.peek(0);
                let jump = {
                    let sw = self.heap.switch(switch);
                    match sw.table.get(hash_value(&self.heap, selector), selector) {
                        Some(offset) => offset.as_number().unwrap_or(0.0) as i64,
                        None if sw.default_jump != -1 => sw.default_jump as i64,
                        None => sw.exit_jump as i64,
                    }
                };
                self.frames.last_mut().unwrap().ip += jump as usize;
                self.pop();
            }

            // -- Containers --
            Opcode::List => {
                let count = self.read_u16() as usize;
                let start = self.stack.len() - count;
                let items = self.stack[start..].to_vec();
                let list = self.heap.alloc_list(items);
                // The slot below the elements holds the placeholder.
                self.stack.truncate(start - 1);
                self.push(list)?;
            }
            Opcode::Dict => {
                let count = self.read_u16() as usize;
                let start = self.stack.len() - count * 2;
                let pairs = self.stack[start..].to_vec();
                let dict = self.heap.alloc_dict();
                let dict_ref = dict.as_obj().unwrap();
                for chunk in pairs.chunks(2) {
                    methods::dict_set(&mut self.heap, dict_ref, chunk[0], chunk[1]);
                }
                self.stack.truncate(start - 1);
                self.push(dict)?;
            }
            Opcode::Range => {
                let upper = self.pop();
                let lower = self.pop();
                let (Some(lower), Some(upper)) = (lower.as_number(), upper.as_number()) else {
                    return Err(self.raise("range boundaries must be numbers".to_string()));
                };
                let range = self.heap.alloc_range(lower as i64, upper as i64);
                self.push(range)?;
            }

            // -- Indexing and properties --
            Opcode::GetIndex => {
                let will_assign = self.read_byte() == 1;
                self.get_index(will_assign)?;
            }
            Opcode::GetRangedIndex => {
                let will_assign = self.read_byte() == 1;
                self.get_ranged_index(will_assign)?;
            }
            Opcode::SetIndex => {
                self.set_index()?;
            }
            Opcode::GetProperty => {
                let name = self.read_constant();
                self.get_property(name, false)?;
            }
            Opcode::GetSelfProperty => {
                let name = self.read_constant();
                self.get_property(name, true)?;
            }
            Opcode::SetProperty => {
                let name = self.read_constant();
                self.set_property(name)?;
            }

            // -- Calls and classes --
            Opcode::Call => {
                let argc = self.read_byte() as usize;
                let callee = self.peek(argc);
                self.call_value(callee, argc)?;
            }
            Opcode::Invoke => {
                let name = self.read_constant();
                let argc = self.read_byte() as usize;
                self.invoke(name, argc, false)?;
            }
            Opcode::InvokeSelf => {
                let name = self.read_constant();
                let argc = self.read_byte() as usize;
                self.invoke(name, argc, true)?;
            }
            Opcode::Return => {
                let result = self.pop();
                let finished = self.frames.pop().expect("no active frame");
                self.close_upvalues(finished.slots);
                self.stack.truncate(finished.slots);
                if self.frames.is_empty() {
                    return Err(VmSignal::Done(result));
                }
                self.push(result)?;
            }
            Opcode::Closure => {
                let function = self.read_constant().as_obj().expect("closure constant");
                let upvalue_count = self.heap.function(function).upvalue_count;
                let closure = self.heap.alloc(Obj::Closure(ClosureObj {
                    function,
                    upvalues: Vec::with_capacity(upvalue_count),
                }));
                self.push(Value::Obj(closure))?;
                for _ in 0..upvalue_count {
                    let is_local = self.read_byte() == 1;
                    let index = self.read_u16() as usize;
                    let upvalue = if is_local {
                        let base = self.frames.last().unwrap().slots;
                        self.capture_upvalue(base + index)
                    } else {
                        let enclosing = self.frames.last().unwrap().closure;
                        self.heap.closure(enclosing).upvalues[index]
                    };
                    match self.heap.get_mut(closure) {
                        Obj::Closure(c) => c.upvalues.push(upvalue),
                        _ => unreachable!(),
                    }
                }
            }
            Opcode::Class => {
                let name = self.read_constant().as_obj().expect("class name constant");
                let class = self.heap.alloc(Obj::Class(ClassObj {
                    name,
                    properties: Table::new(),
                    statics: Table::new(),
                    methods: Table::new(),
                    initializer: Value::Empty,
                    superclass: None,
                }));
                self.push(Value::Obj(class))?;
            }
            Opcode::Inherit => {
                let Some(superclass) = self.peek(1).as_obj().filter(|r| {
                    matches!(self.heap.get(*r), Obj::Class(_))
                }) else {
                    return Err(self.raise("cannot inherit from non-class object".to_string()));
                };
                let subclass = self.peek(0).as_obj().expect("subclass on stack");
                let (parent_properties, parent_methods) = {
                    let parent = self.heap.class(superclass);
                    (parent.properties.clone(), parent.methods.clone())
                };
                let sub = self.heap.class_mut(subclass);
                sub.properties.add_all(&parent_properties);
                sub.methods.add_all(&parent_methods);
                sub.superclass = Some(superclass);
                self.pop();
            }
            Opcode::Method => {
                let name = self.read_constant();
                let method = self.peek(0);
                let class = self.peek(1).as_obj().expect("class on stack");
                let hash = hash_value(&self.heap, name);
                let class_name = self.heap.class(class).name;
                let is_initializer = name.as_obj() == Some(class_name);
                let c = self.heap.class_mut(class);
                c.methods.set(hash, name, method);
                if is_initializer {
                    c.initializer = method;
                }
                self.pop();
            }
            Opcode::ClassProperty => {
                let name = self.read_constant();
                let is_static = self.read_byte() == 1;
                let value = self.peek(0);
                let class = self.peek(1).as_obj().expect("class on stack");
                let hash = hash_value(&self.heap, name);
                let c = self.heap.class_mut(class);
                if is_static {
                    c.statics.set(hash, name, value);
                } else {
                    c.properties.set(hash, name, value);
                }
                self.pop();
            }
            Opcode::GetSuper => {
                let name = self.read_constant();
                // The synthetic `parent` value holds the superclass.
                let superclass = self.pop().as_obj().expect("superclass on stack");
                let receiver = self.peek(0);
                let method = self
                    .heap
                    .class(superclass)
                    .methods
                    .get(hash_value(&self.heap, name), name);
                match method {
                    Some(method) => {
                        let bound = Value::Obj(self.heap.alloc(Obj::BoundMethod(BoundMethodObj {
                            receiver,
                            method,
                        })));
                        self.pop();
                        self.push(bound)?;
                    }
                    None => {
                        let rendered = stringify(&self.heap, name);
                        return Err(self.raise(format!(
                            "parent class does not define a function {}",
                            rendered
                        )));
                    }
                }
            }
            Opcode::SuperInvoke => {
                let name = self.read_constant();
                let argc = self.read_byte() as usize;
                let superclass = self.pop().as_obj().expect("superclass on stack");
                self.invoke_from_class(superclass, name, argc, true)?;
            }
            Opcode::SuperInvokeSelf => {
                let argc = self.read_byte() as usize;
                let superclass = self.pop().as_obj().expect("superclass on stack");
                let name = Value::Obj(self.heap.class(superclass).name);
                self.invoke_from_class(superclass, name, argc, true)?;
            }

            // -- Output --
            Opcode::Echo => {
                let value = self.pop();
                self.echo_line(value);
            }
            Opcode::Stringify => {
                let value = self.peek(0);
                match value {
                    Value::Obj(r) => match self.heap.get(r) {
                        Obj::Str(_) => {}
                        Obj::Instance(instance) => {
                            // `@to_string` override: run the hook in place;
                            // its return value replaces the receiver.
                            let hook = self.heap.strings_lookup("@to_string");
                            let method = hook.and_then(|hook| {
                                let key = Value::Obj(hook);
                                self.heap
                                    .class(instance.class)
                                    .methods
                                    .get(hash_value(&self.heap, key), key)
                            });
                            match method {
                                Some(method) => self.call_value(method, 0)?,
                                None => {
                                    let rendered = stringify(&self.heap, value);
                                    self.pop();
                                    let interned = self.heap.intern_value(&rendered);
                                    self.push(interned)?;
                                }
                            }
                        }
                        _ => {
                            let rendered = stringify(&self.heap, value);
                            self.pop();
                            let interned = self.heap.intern_value(&rendered);
                            self.push(interned)?;
                        }
                    },
                    Value::Nil => {}
                    _ => {
                        let rendered = stringify(&self.heap, value);
                        self.pop();
                        let interned = self.heap.intern_value(&rendered);
                        self.push(interned)?;
                    }
                }
            }

            // -- Exceptions --
            Opcode::Assert => {
                let message = self.pop();
                let expression = self.pop();
                if is_falsey(&self.heap, expression) {
                    let text = if message.is_nil() {
                        "assertion failed".to_string()
                    } else {
                        stringify(&self.heap, message)
                    };
                    return Err(self.raise_as(self.illegal_state_class, text));
                }
            }
            Opcode::Die => {
                let value = self.peek(0);
                if !self.exception_matches(value, self.exception_class) {
                    return Err(self.raise("instance of Exception expected".to_string()));
                }
                // Stamp the stack trace at the raise site.
                let trace = self.stack_trace();
                let trace_value = self.heap.intern_value(&trace);
                let key = self.heap.intern_value("stacktrace");
                let hash = hash_value(&self.heap, key);
                let instance = value.as_obj().unwrap();
                self.heap.instance_mut(instance).properties.set(hash, key, trace_value);
                let exception = self.pop();
                return Err(VmSignal::Raise(exception));
            }
            Opcode::Try => {
                let type_name_const = self.read_constant();
                let address = self.read_u16() as usize;
                let finally_address = self.read_u16() as usize;
                let class = if address != 0 {
                    let hash = hash_value(&self.heap, type_name_const);
                    let found = self
                        .globals
                        .get(hash, type_name_const)
                        .and_then(|v| v.as_obj())
                        .filter(|r| matches!(self.heap.get(*r), Obj::Class(_)));
                    match found {
                        Some(class) => Some(class),
                        None => {
                            let rendered = stringify(&self.heap, type_name_const);
                            return Err(self.raise(format!(
                                "object of type '{}' is not an exception",
                                rendered
                            )));
                        }
                    }
                } else {
                    None
                };
                let depth = self.stack.len();
                if self.frames.last().unwrap().handlers.len() == MAX_HANDLER_FRAMES {
                    return Err(self.raise(
                        "too many nested exception handlers in one function".to_string(),
                    ));
                }
                self.frames.last_mut().unwrap().handlers.push(HandlerFrame {
                    class,
                    address,
                    finally_address,
                    stack_depth: depth,
                });
            }
            Opcode::PopTry => {
                self.frames.last_mut().unwrap().handlers.pop();
            }
            Opcode::PublishTry => {
                self.frames.last_mut().unwrap().handlers.pop();
                let exception = self.pop();
                return Err(VmSignal::Raise(exception));
            }

            // -- Modules --
            Opcode::CallImport => {
                let closure = self.read_constant().as_obj().expect("import constant");
                let module = self.heap.function(self.heap.closure(closure).function).module;
                self.register_imported_module(module);
                self.push(Value::Obj(closure))?;
                self.call_closure(closure, 0)?;
            }
            Opcode::NativeModule => {
                let name = self.read_constant();
                let hash = hash_value(&self.heap, name);
                match self.modules.get(hash, name) {
                    Some(module_value) => {
                        let module = module_value.as_obj().expect("native module");
                        let preloader = self.heap.module(module).preloader.clone();
                        if let Some(hook) = preloader {
                            hook(&mut self.heap);
                        }
                        self.heap.module_mut(module).imported = true;
                        let importing = self.current_module();
                        self.heap.module_mut(importing).values.set(hash, name, module_value);
                    }
                    None => {
                        let rendered = stringify(&self.heap, name);
                        return Err(self.raise(format!("module '{}' not found", rendered)));
                    }
                }
            }
            Opcode::SelectImport => {
                let name = self.read_constant();
                let closure = self.peek(0).as_obj().expect("module closure on stack");
                let module = self.heap.function(self.heap.closure(closure).function).module;
                let hash = hash_value(&self.heap, name);
                match self.heap.module(module).values.get(hash, name) {
                    Some(value) => {
                        let importing = self.current_module();
                        self.heap.module_mut(importing).values.set(hash, name, value);
                    }
                    None => {
                        let rendered = stringify(&self.heap, name);
                        let module_name = self.heap.module(module).name.clone();
                        return Err(self.raise(format!(
                            "module {} does not define '{}'",
                            module_name, rendered
                        )));
                    }
                }
            }
            Opcode::SelectNativeImport => {
                let name = self.read_constant();
                let module_name = self.peek(0);
                let hash = hash_value(&self.heap, module_name);
                let module = self
                    .modules
                    .get(hash, module_name)
                    .and_then(|v| v.as_obj());
                match module {
                    Some(module) => {
                        let value_hash = hash_value(&self.heap, name);
                        match self.heap.module(module).values.get(value_hash, name) {
                            Some(value) => {
                                let importing = self.current_module();
                                self.heap
                                    .module_mut(importing)
                                    .values
                                    .set(value_hash, name, value);
                            }
                            None => {
                                let rendered = stringify(&self.heap, name);
                                let module_name = self.heap.module(module).name.clone();
                                return Err(self.raise(format!(
                                    "module {} does not define '{}'",
                                    module_name, rendered
                                )));
                            }
                        }
                    }
                    None => {
                        let rendered = stringify(&self.heap, module_name);
                        return Err(self.raise(format!("module '{}' not found", rendered)));
                    }
                }
            }
            Opcode::ImportAll => {
                let closure = self.peek(0).as_obj().expect("module closure on stack");
                let module = self.heap.function(self.heap.closure(closure).function).module;
                let values = self.heap.module(module).values.clone();
                let importing = self.current_module();
                self.heap.module_mut(importing).values.add_all(&values);
            }
            Opcode::ImportAllNative => {
                let module_name = self.peek(0);
                let hash = hash_value(&self.heap, module_name);
                if let Some(module) = self.modules.get(hash, module_name).and_then(|v| v.as_obj()) {
                    let values = self.heap.module(module).values.clone();
                    let importing = self.current_module();
                    self.heap.module_mut(importing).values.add_all(&values);
                }
            }
            Opcode::EjectImport => {
                let closure = self.read_constant().as_obj().expect("import constant");
                let module = self.heap.function(self.heap.closure(closure).function).module;
                let name = self.heap.module(module).name.clone();
                let key = self.heap.intern_value(&name);
                let hash = hash_value(&self.heap, key);
                let importing = self.current_module();
                self.heap.module_mut(importing).values.delete(hash, key);
            }
            Opcode::EjectNativeImport => {
                let name = self.read_constant();
                let hash = hash_value(&self.heap, name);
                let importing = self.current_module();
                self.heap.module_mut(importing).values.delete(hash, name);
            }

            Opcode::BreakPlaceholder => {
                warn!("break placeholder reached the interpreter");
            }
        }
        Ok(())
    }

    /// Register a just-imported source module the way the original
    /// registers any module: keyed by file in the module table, bound by
    /// name in the importing module's values.
    fn register_imported_module(&mut self, module: ObjRef) {
        let file = self.heap.module(module).file.clone();
        let file_key = self.heap.intern_value(&file);
        self.modules.set(hash_value(&self.heap, file_key), file_key, Value::Obj(module));

        let name = self.heap.module(module).name.clone();
        let name_key = self.heap.intern_value(&name);
        let hash = hash_value(&self.heap, name_key);
        if self.frames.is_empty() {
            self.globals.set(hash, name_key, Value::Obj(module));
        } else {
            let importing = self.current_module();
            self.heap.module_mut(importing).values.set(hash, name_key, Value::Obj(module));
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

fn signal_to_error(signal: VmSignal) -> Error {
    match signal {
        VmSignal::Halt(error) => error,
        VmSignal::Done(_) => Error::Fatal("unexpected completion during call setup".to_string()),
        VmSignal::Raise(_) => Error::Runtime {
            class: "Exception".to_string(),
            message: "exception raised during call setup".to_string(),
            stacktrace: String::new(),
        },
    }
}
