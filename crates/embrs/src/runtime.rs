//! The embedding facade.
//!
//! [`Runtime`] owns a VM for its whole lifecycle: configure it (native
//! modules, search paths, REPL and debug flags, argv), feed it source with
//! [`Runtime::interpret`] or [`Runtime::capture`], and drop it to release
//! every object and run native-module unload hooks.

use std::path::PathBuf;

use crate::error::Result;
use crate::modules::ModuleBuilder;
use crate::value::{echo_value, Value};
use crate::vm::Vm;

/// Result of running code with echo capture.
#[derive(Debug, Clone)]
pub struct Output {
    /// The script's result value, rendered the way the REPL would echo it.
    pub value: String,
    /// Lines produced by `echo` statements, in order.
    pub lines: Vec<String>,
}

/// A complete Ember runtime: compiler, VM, heap, and module registry.
///
/// # Example
///
/// ```
/// use embrs::Runtime;
///
/// let mut runtime = Runtime::new();
/// let output = runtime.capture("echo 1 + 2\n").unwrap();
/// assert_eq!(output.lines, vec!["3"]);
/// ```
pub struct Runtime {
    vm: Vm,
}

impl Runtime {
    pub fn new() -> Self {
        Self { vm: Vm::new() }
    }

    /// Enable REPL semantics: bare expression statements echo their value
    /// and strings echo quoted.
    pub fn set_repl(&mut self, repl: bool) {
        self.vm.is_repl = repl;
    }

    /// Dump a disassembly of each compiled module to stderr.
    pub fn set_dump_bytecode(&mut self, dump: bool) {
        self.vm.dump_bytecode = dump;
    }

    /// Program arguments exposed to native modules.
    pub fn set_argv(&mut self, argv: Vec<String>) {
        self.vm.argv = argv;
    }

    pub fn argv(&self) -> &[String] {
        &self.vm.argv
    }

    /// Add a root for absolute import resolution. Roots are searched in
    /// registration order: vendor directory first, then the user package
    /// directory, then the installation library directory.
    pub fn add_search_path(&mut self, path: impl Into<PathBuf>) {
        self.vm.search_paths.push(path.into());
    }

    /// Register a native module. The name must carry the leading
    /// underscore that marks native imports.
    ///
    /// See [`ModuleBuilder`] for the builder API.
    pub fn module<F>(&mut self, name: &str, builder_fn: F)
    where
        F: FnOnce(&mut ModuleBuilder),
    {
        let mut builder = ModuleBuilder::new(name);
        builder_fn(&mut builder);
        self.vm.register_native_module(builder.build());
    }

    /// Compile and run `source` as the module `module_name`.
    pub fn interpret(&mut self, source: &str, module_name: &str) -> Result<()> {
        let file = format!("{}.em", module_name);
        self.vm.interpret(source, module_name, &file)?;
        Ok(())
    }

    /// Read and run a script file. Relative imports resolve against the
    /// file's directory.
    pub fn interpret_file(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        let source = std::fs::read_to_string(&path)
            .map_err(|e| crate::error::Error::Fatal(format!("{}: {}", path.display(), e)))?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "<script>".to_string());
        self.vm.interpret(&source, &name, &path.to_string_lossy())?;
        Ok(())
    }

    /// Run `source` capturing `echo` output instead of writing to stdout.
    pub fn capture(&mut self, source: &str) -> Result<Output> {
        self.capture_as(source, "<capture>", "<capture>")
    }

    /// Like [`Runtime::capture`], but resolving relative imports against
    /// `file`'s directory.
    pub fn capture_with_file(&mut self, source: &str, file: impl Into<PathBuf>) -> Result<Output> {
        let file = file.into();
        let name = file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "<capture>".to_string());
        let file = file.to_string_lossy().into_owned();
        self.capture_as(source, &name, &file)
    }

    fn capture_as(&mut self, source: &str, module_name: &str, file: &str) -> Result<Output> {
        self.vm.set_echo_capture(true);
        let result = self.vm.interpret(source, module_name, file);
        let lines = self.vm.take_echo_output();
        self.vm.set_echo_capture(false);
        let value = result?;
        Ok(Output {
            value: render_result(&self.vm, value),
            lines,
        })
    }
}

fn render_result(vm: &Vm, value: Value) -> String {
    if value.is_empty() {
        String::new()
    } else {
        echo_value(&vm.heap, value)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.vm.unload_native_modules();
    }
}
