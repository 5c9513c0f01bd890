//! Module resolution and the native-module registry.
//!
//! Source modules are resolved against the importing module's directory
//! (relative forms `.x` / `..x`) or a search-path walk (vendor directory,
//! then user packages, then the installation library directory), checking
//! both the file form (`name.em`) and the index form (`name/index.em`).
//!
//! Native modules carry a leading underscore, are never path-resolved,
//! and are registered by the host through [`ModuleBuilder`] before any
//! source runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;

use crate::heap::{ModuleHook, NativeFn};

/// File extension for source modules.
pub const SOURCE_EXTENSION: &str = "em";

/// Name of the per-directory index module.
pub const INDEX_FILE: &str = "index";

// ---------------------------------------------------------------------------
// Path resolution
// ---------------------------------------------------------------------------

/// Resolve an import to a source file on disk.
///
/// `parts` are the dotted components (`a.b.c` → `["a", "b", "c"]`);
/// `parent_hops` counts leading `..` segments of a relative import.
/// Returns `None` when no candidate exists, letting the compiler fall
/// back to the native registry before reporting an error.
pub fn resolve_import(
    importing_file: &str,
    parts: &[String],
    is_relative: bool,
    parent_hops: usize,
    search_paths: &[PathBuf],
) -> Option<PathBuf> {
    let importer_dir = Path::new(importing_file)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    if is_relative {
        let mut base = importer_dir;
        for _ in 0..parent_hops {
            base.push("..");
        }
        return probe(&base, parts);
    }

    // Absolute: vendor dir and friends first, importer-relative last so a
    // stray local file cannot shadow a vendored package.
    for root in search_paths {
        if let Some(found) = probe(root, parts) {
            return Some(found);
        }
    }
    probe(&importer_dir, parts)
}

/// Check `root/a/b.em` then `root/a/b/index.em`.
fn probe(root: &Path, parts: &[String]) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for part in parts {
        path.push(part);
    }

    let file_form = path.with_extension(SOURCE_EXTENSION);
    debug!("probing import candidate {}", file_form.display());
    if file_form.is_file() {
        return Some(file_form);
    }

    let index_form = path.join(format!("{}.{}", INDEX_FILE, SOURCE_EXTENSION));
    debug!("probing import candidate {}", index_form.display());
    if index_form.is_file() {
        return Some(index_form);
    }
    None
}

// ---------------------------------------------------------------------------
// Native-module registry
// ---------------------------------------------------------------------------

/// A plain value a native module can export without heap access.
#[derive(Debug, Clone)]
pub enum NativeValue {
    Nil,
    Bool(bool),
    Number(f64),
    Str(String),
}

/// A class exported by a native module: field defaults plus native
/// methods.
pub struct NativeClassDef {
    pub name: String,
    pub fields: Vec<(String, NativeValue)>,
    pub methods: Vec<(String, NativeFn)>,
}

/// Definition of a native module, materialised into a heap `Module` when
/// the VM boots.
pub struct NativeModuleDef {
    pub name: String,
    pub fields: Vec<(String, NativeValue)>,
    pub functions: Vec<(String, NativeFn)>,
    pub classes: Vec<NativeClassDef>,
    pub preloader: Option<ModuleHook>,
    pub unloader: Option<ModuleHook>,
}

/// Builder handed to the host's module-registration closure.
///
/// # Example
///
/// ```
/// use embrs::{NativeValue, Runtime, Value};
///
/// let mut runtime = Runtime::new();
/// runtime.module("_calc", |m| {
///     m.field("answer", NativeValue::Number(42.0));
///     m.function("double", |_heap, args| {
///         let n = args.first().and_then(|v| v.as_number()).unwrap_or(0.0);
///         Ok(Value::Number(n * 2.0))
///     });
/// });
///
/// let output = runtime.capture("import _calc\necho _calc.double(21)\n").unwrap();
/// assert_eq!(output.lines, vec!["42"]);
/// ```
pub struct ModuleBuilder {
    name: String,
    fields: Vec<(String, NativeValue)>,
    functions: Vec<(String, NativeFn)>,
    classes: Vec<NativeClassDef>,
    preloader: Option<ModuleHook>,
    unloader: Option<ModuleHook>,
}

impl ModuleBuilder {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: Vec::new(),
            functions: Vec::new(),
            classes: Vec::new(),
            preloader: None,
            unloader: None,
        }
    }

    /// Export a constant value.
    pub fn field(&mut self, name: &str, value: NativeValue) {
        self.fields.push((name.to_string(), value));
    }

    /// Export a native function. The callback receives the heap and the
    /// argument slice and returns the result value, or an error message
    /// that the VM raises as an `Exception`.
    pub fn function<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&mut crate::heap::Heap, &[crate::value::Value]) -> Result<crate::value::Value, String>
            + Send
            + Sync
            + 'static,
    {
        self.functions.push((name.to_string(), Arc::new(f) as NativeFn));
    }

    /// Export a class with native methods. Methods receive the instance
    /// as `args[0]`.
    pub fn class(&mut self, def: NativeClassDef) {
        self.classes.push(def);
    }

    /// Hook run every time the module is imported, before bindings copy.
    pub fn preloader<F>(&mut self, f: F)
    where
        F: Fn(&mut crate::heap::Heap) + Send + Sync + 'static,
    {
        self.preloader = Some(Arc::new(f) as ModuleHook);
    }

    /// Hook run once when an imported module is discarded.
    pub fn unloader<F>(&mut self, f: F)
    where
        F: Fn(&mut crate::heap::Heap) + Send + Sync + 'static,
    {
        self.unloader = Some(Arc::new(f) as ModuleHook);
    }

    pub(crate) fn build(self) -> NativeModuleDef {
        NativeModuleDef {
            name: self.name,
            fields: self.fields,
            functions: self.functions,
            classes: self.classes,
            preloader: self.preloader,
            unloader: self.unloader,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn resolves_file_and_index_forms() {
        let dir = std::env::temp_dir().join("embrs-resolve-test");
        let _ = std::fs::remove_dir_all(&dir);
        write(&dir, "vendor/util.em", "var x = 1\n");
        write(&dir, "vendor/pkg/index.em", "var y = 2\n");

        let roots = vec![dir.join("vendor")];
        let importer = dir.join("main.em");
        let importer = importer.to_string_lossy();

        let util = resolve_import(&importer, &["util".to_string()], false, 0, &roots).unwrap();
        assert!(util.ends_with("util.em"));
        let pkg = resolve_import(&importer, &["pkg".to_string()], false, 0, &roots).unwrap();
        assert!(pkg.ends_with("index.em"));
        assert!(resolve_import(&importer, &["missing".to_string()], false, 0, &roots).is_none());
    }

    #[test]
    fn relative_imports_resolve_against_the_importer() {
        let dir = std::env::temp_dir().join("embrs-relative-test");
        let _ = std::fs::remove_dir_all(&dir);
        write(&dir, "pkg/helper.em", "var x = 1\n");
        write(&dir, "shared.em", "var y = 2\n");

        let importer = dir.join("pkg/main.em");
        let importer = importer.to_string_lossy();
        let sibling = resolve_import(&importer, &["helper".to_string()], true, 0, &[]).unwrap();
        assert!(sibling.ends_with("helper.em"));
        let parent = resolve_import(&importer, &["shared".to_string()], true, 1, &[]).unwrap();
        assert!(parent.ends_with("shared.em"));
    }

    #[test]
    fn builder_collects_exports() {
        let mut builder = ModuleBuilder::new("_demo");
        builder.field("version", NativeValue::Str("1.0".to_string()));
        builder.function("noop", |_, _| Ok(crate::value::Value::Nil));
        let def = builder.build();
        assert_eq!(def.name, "_demo");
        assert_eq!(def.fields.len(), 1);
        assert_eq!(def.functions.len(), 1);
    }
}
