//! embrs — a small, embeddable runtime for the Ember scripting language.
//!
//! Ember is a dynamically-typed language with first-class closures,
//! classes with single inheritance, dynamic containers, modules, and
//! structured exception handling. Source compiles in a single pass (a
//! Pratt parser emitting bytecode directly, no AST) and runs on a
//! stack-based virtual machine with a tracing mark-sweep garbage
//! collector.
//!
//! # Quick start
//!
//! ```
//! use embrs::Runtime;
//!
//! let mut runtime = Runtime::new();
//! let output = runtime.capture(r#"
//! def greet(name) {
//!   return "Hello, ${name}!"
//! }
//! echo greet("Ember")
//! "#).unwrap();
//! assert_eq!(output.lines, vec!["Hello, Ember!"]);
//! ```
//!
//! # Native modules
//!
//! Hosts extend the language through native modules — named with a
//! leading underscore and resolved from a registry instead of the file
//! system:
//!
//! ```
//! use embrs::{NativeValue, Runtime, Value};
//!
//! let mut runtime = Runtime::new();
//! runtime.module("_host", |m| {
//!     m.field("version", NativeValue::Str("1.0".to_string()));
//!     m.function("triple", |_heap, args| {
//!         let n = args.first().and_then(|v| v.as_number()).unwrap_or(0.0);
//!         Ok(Value::Number(n * 3.0))
//!     });
//! });
//! let output = runtime.capture("import _host\necho _host.triple(14)\n").unwrap();
//! assert_eq!(output.lines, vec!["42"]);
//! ```
//!
//! # Language tour
//!
//! ```text
//! var list = [1, 2, 3]
//! foreach v in list { echo v }
//!
//! class Point {
//!   var x = 0
//!   var y = 0
//!   Point(x, y) { self.x = x; self.y = y }
//!   def @to_string() { return "(${self.x}, ${self.y})" }
//! }
//!
//! try {
//!   die Exception("boom")
//! } catch Exception e {
//!   echo e.message
//! } finally {
//!   echo "done"
//! }
//! ```

mod bytecode;
mod compiler;
mod debug;
mod diagnostic;
mod error;
mod heap;
mod methods;
pub(crate) mod modules;
mod operators;
mod runtime;
mod scanner;
mod table;
mod value;
mod vm;

pub use diagnostic::Diagnostic;
pub use error::{Error, Result};
pub use heap::{Heap, NativeFn, ObjRef};
pub use modules::{ModuleBuilder, NativeClassDef, NativeModuleDef, NativeValue};
pub use runtime::{Output, Runtime};
pub use value::Value;
