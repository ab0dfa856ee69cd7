//! Module loader for Hemlock
//!
//! A module's identity is its canonical absolute path: two import specifiers
//! resolving to the same path yield the same module record. Loading is a
//! two-pass compile (imports first, then exports) guarded by a LOADING state
//! that turns re-entry into a cycle failure.
//!
//! Name mangling only matters to the C transpiler - the interpreter binds
//! through the export table directly - but the prefixes are assigned here so
//! both consumers agree on them.

use crate::ast::{Expr, Program, Stmt};
use crate::error::ModuleError;
use crate::parser;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Unloaded,
    Loading,
    Loaded,
}

/// An exported symbol: original name and transpiler-facing mangled name
#[derive(Debug, Clone, PartialEq)]
pub struct ExportEntry {
    pub name: String,
    pub mangled: String,
}

/// An import binding recorded on the importing module
#[derive(Debug, Clone, PartialEq)]
pub struct ImportBinding {
    /// Name bound locally in the importer
    pub local: String,
    /// Original name in the source module
    pub original: String,
    /// Source module's generated prefix
    pub source_prefix: String,
    /// Source module's canonical path
    pub source_path: PathBuf,
    /// Whether the export is a function literal (affects transpiled calls)
    pub is_function: bool,
    /// Declared arity when `is_function`
    pub arity: usize,
}

#[derive(Debug)]
pub struct Module {
    /// Canonical absolute path; the module's identity
    pub path: PathBuf,
    /// Generated symbol prefix, `_mod<N>_`
    pub prefix: String,
    pub state: ModuleState,
    pub program: Option<Program>,
    pub exports: Vec<ExportEntry>,
    pub imports: Vec<ImportBinding>,
}

impl Module {
    pub fn export(&self, name: &str) -> Option<&ExportEntry> {
        self.exports.iter().find(|e| e.name == name)
    }

    /// Mangled name for a non-exported top-level function
    pub fn mangle_private(&self, name: &str) -> String {
        format!("{}fn_{}", self.prefix, name)
    }
}

pub struct ModuleRegistry {
    cache: HashMap<PathBuf, Rc<RefCell<Module>>>,
    /// Completion order: deepest imports first. This is the initialization
    /// order for both the interpreter and the transpiler.
    order: Vec<PathBuf>,
    next_index: u32,
    stdlib_root: Option<PathBuf>,
    /// Directory of the main file; anchor for imports with no importer
    main_dir: PathBuf,
}

impl ModuleRegistry {
    pub fn new(main_dir: PathBuf, stdlib_root: Option<PathBuf>) -> Self {
        ModuleRegistry {
            cache: HashMap::new(),
            order: Vec::new(),
            next_index: 0,
            stdlib_root,
            main_dir,
        }
    }

    pub fn get(&self, path: &Path) -> Option<Rc<RefCell<Module>>> {
        self.cache.get(path).cloned()
    }

    /// Modules in initialization order (deepest imports first)
    pub fn initialization_order(&self) -> impl Iterator<Item = Rc<RefCell<Module>>> + '_ {
        self.order.iter().filter_map(|p| self.cache.get(p).cloned())
    }

    /// Resolve an import specifier against its importer.
    ///
    /// `@stdlib/x` maps under the stdlib root; absolute paths are used
    /// verbatim; anything else joins the importer's directory (or the main
    /// file's directory when the importer is the main program). `.hml` is
    /// appended when no extension is present, then the result is
    /// canonicalized.
    pub fn resolve(&self, importer: Option<&Path>, spec: &str) -> Result<PathBuf, ModuleError> {
        let raw = if let Some(rest) = spec.strip_prefix("@stdlib/") {
            let root = self.stdlib_root.as_ref().ok_or_else(|| {
                ModuleError::Resolve(format!(
                    "'{}' needs a stdlib root, and none is configured",
                    spec
                ))
            })?;
            root.join(rest)
        } else if spec.starts_with('/') {
            PathBuf::from(spec)
        } else {
            let base = match importer {
                Some(path) => path.parent().unwrap_or(Path::new(".")).to_path_buf(),
                None => self.main_dir.clone(),
            };
            base.join(spec)
        };
        let raw = if raw.extension().is_none() {
            raw.with_extension("hml")
        } else {
            raw
        };
        raw.canonicalize().map_err(|source| ModuleError::Io {
            path: raw,
            source,
        })
    }

    /// Compile the module at a canonical path, pulling in its imports first.
    pub fn compile(&mut self, path: &Path) -> Result<Rc<RefCell<Module>>, ModuleError> {
        if let Some(existing) = self.cache.get(path) {
            return match existing.borrow().state {
                ModuleState::Loaded => Ok(existing.clone()),
                ModuleState::Loading => Err(ModuleError::Cycle(path.to_path_buf())),
                // A module that previously failed to parse stays failed.
                ModuleState::Unloaded => Err(ModuleError::Resolve(format!(
                    "module {} previously failed to load",
                    path.display()
                ))),
            };
        }

        let prefix = format!("_mod{}_", self.next_index);
        self.next_index += 1;
        let record = Rc::new(RefCell::new(Module {
            path: path.to_path_buf(),
            prefix,
            state: ModuleState::Loading,
            program: None,
            exports: Vec::new(),
            imports: Vec::new(),
        }));
        self.cache.insert(path.to_path_buf(), record.clone());

        let source = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(source) => {
                record.borrow_mut().state = ModuleState::Unloaded;
                return Err(ModuleError::Io { path: path.to_path_buf(), source });
            }
        };
        let program = match parser::parse_source(&source, path) {
            Ok(p) => p,
            Err(e) => {
                record.borrow_mut().state = ModuleState::Unloaded;
                return Err(ModuleError::Parse(e));
            }
        };

        // First pass: resolve and compile every import, recording bindings.
        let mut imports = Vec::new();
        for (names, spec, _loc) in program.imports() {
            let dep_path = self.resolve(Some(path), spec)?;
            let dep = self.compile(&dep_path)?;
            let dep_ref = dep.borrow();
            for name in names {
                let entry = dep_ref.export(name).ok_or_else(|| {
                    ModuleError::Resolve(format!(
                        "module {} does not export '{}'",
                        dep_path.display(),
                        name
                    ))
                })?;
                let (is_function, arity) = dep_ref
                    .program
                    .as_ref()
                    .map(|p| export_fn_info(p, name))
                    .unwrap_or((false, 0));
                imports.push(ImportBinding {
                    local: name.clone(),
                    original: entry.name.clone(),
                    source_prefix: dep_ref.prefix.clone(),
                    source_path: dep_path.clone(),
                    is_function,
                    arity,
                });
            }
        }

        // Second pass: populate the exports table with mangled names.
        let exports: Vec<ExportEntry> = {
            let prefix = record.borrow().prefix.clone();
            program
                .exports()
                .map(|name| ExportEntry {
                    name: name.to_string(),
                    mangled: format!("{}{}", prefix, name),
                })
                .collect()
        };

        {
            let mut m = record.borrow_mut();
            m.program = Some(program);
            m.imports = imports;
            m.exports = exports;
            m.state = ModuleState::Loaded;
        }
        self.order.push(path.to_path_buf());
        Ok(record)
    }
}

/// Whether an exported binding is a function literal, and its arity
pub(crate) fn export_fn_info(program: &Program, name: &str) -> (bool, usize) {
    for stmt in &program.statements {
        if let Stmt::Export { stmt, .. } = stmt
            && let Stmt::Let { name: n, value, .. } | Stmt::Const { name: n, value, .. } =
                stmt.as_ref()
            && n == name
        {
            if let Expr::Function { params, .. } = value {
                return (true, params.len());
            }
            return (false, 0);
        }
    }
    (false, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).expect("write module");
        path
    }

    fn registry(dir: &TempDir) -> ModuleRegistry {
        ModuleRegistry::new(dir.path().to_path_buf(), None)
    }

    #[test]
    fn test_same_path_same_instance() {
        let dir = TempDir::new().unwrap();
        write(&dir, "m.hml", "export let x = 41;");
        let mut reg = registry(&dir);
        let a = reg.resolve(None, "./m").unwrap();
        let b = reg.resolve(None, "m.hml").unwrap();
        assert_eq!(a, b);
        let first = reg.compile(&a).unwrap();
        let second = reg.compile(&b).unwrap();
        assert!(Rc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_exports_are_mangled() {
        let dir = TempDir::new().unwrap();
        write(&dir, "m.hml", "export let x = 41; export let f = fn(a, b) { return a; };");
        let mut reg = registry(&dir);
        let path = reg.resolve(None, "./m").unwrap();
        let module = reg.compile(&path).unwrap();
        let module = module.borrow();
        assert_eq!(module.prefix, "_mod0_");
        let x = module.export("x").unwrap();
        assert_eq!(x.mangled, "_mod0_x");
        assert_eq!(module.mangle_private("helper"), "_mod0_fn_helper");
    }

    #[test]
    fn test_import_bindings_record_fn_arity() {
        let dir = TempDir::new().unwrap();
        write(&dir, "dep.hml", "export let double = fn(n) { return n * 2; };");
        write(&dir, "top.hml", "import { double } from \"./dep\"; export let y = double(2);");
        let mut reg = registry(&dir);
        let path = reg.resolve(None, "./top").unwrap();
        let module = reg.compile(&path).unwrap();
        let module = module.borrow();
        assert_eq!(module.imports.len(), 1);
        let binding = &module.imports[0];
        assert_eq!(binding.local, "double");
        assert_eq!(binding.source_prefix, "_mod0_");
        assert!(binding.is_function);
        assert_eq!(binding.arity, 1);
    }

    #[test]
    fn test_cycle_detected() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.hml", "import { b } from \"./b\"; export let a = 1;");
        write(&dir, "b.hml", "import { a } from \"./a\"; export let b = 2;");
        let mut reg = registry(&dir);
        let path = reg.resolve(None, "./a").unwrap();
        let err = reg.compile(&path).unwrap_err();
        assert!(err.to_string().contains("Cycle detected"));
    }

    #[test]
    fn test_missing_export_fails() {
        let dir = TempDir::new().unwrap();
        write(&dir, "dep.hml", "export let x = 1;");
        write(&dir, "top.hml", "import { nope } from \"./dep\";");
        let mut reg = registry(&dir);
        let path = reg.resolve(None, "./top").unwrap();
        let err = reg.compile(&path).unwrap_err();
        assert!(err.to_string().contains("does not export 'nope'"));
    }

    #[test]
    fn test_parse_failure_marks_unloaded() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "bad.hml", "let = ;");
        let mut reg = registry(&dir);
        let canonical = path.canonicalize().unwrap();
        assert!(matches!(
            reg.compile(&canonical),
            Err(ModuleError::Parse(_))
        ));
        assert_eq!(
            reg.get(&canonical).unwrap().borrow().state,
            ModuleState::Unloaded
        );
        // Retry does not silently succeed.
        assert!(reg.compile(&canonical).is_err());
    }

    #[test]
    fn test_initialization_order_deepest_first() {
        let dir = TempDir::new().unwrap();
        write(&dir, "leaf.hml", "export let l = 1;");
        write(&dir, "mid.hml", "import { l } from \"./leaf\"; export let m = 2;");
        write(&dir, "top.hml", "import { m } from \"./mid\"; export let t = 3;");
        let mut reg = registry(&dir);
        let path = reg.resolve(None, "./top").unwrap();
        reg.compile(&path).unwrap();
        let order: Vec<String> = reg
            .initialization_order()
            .map(|m| {
                m.borrow()
                    .path
                    .file_name()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(order, vec!["leaf.hml", "mid.hml", "top.hml"]);
    }

    #[test]
    fn test_stdlib_resolution() {
        let dir = TempDir::new().unwrap();
        let stdlib = TempDir::new().unwrap();
        write(&stdlib, "datetime.hml", "export let sleep_ms = fn(n) { return n; };");
        let reg = ModuleRegistry::new(
            dir.path().to_path_buf(),
            Some(stdlib.path().to_path_buf()),
        );
        let resolved = reg.resolve(None, "@stdlib/datetime").unwrap();
        assert!(resolved.ends_with("datetime.hml"));
        let reg_no_stdlib = registry(&dir);
        assert!(reg_no_stdlib.resolve(None, "@stdlib/datetime").is_err());
    }

    #[test]
    fn test_diamond_import_is_not_a_cycle() {
        let dir = TempDir::new().unwrap();
        write(&dir, "shared.hml", "export let s = 1;");
        write(&dir, "a.hml", "import { s } from \"./shared\"; export let a = s;");
        write(&dir, "b.hml", "import { s } from \"./shared\"; export let b = s;");
        write(
            &dir,
            "top.hml",
            "import { a } from \"./a\"; import { b } from \"./b\"; export let t = 1;",
        );
        let mut reg = registry(&dir);
        let path = reg.resolve(None, "./top").unwrap();
        assert!(reg.compile(&path).is_ok());
    }
}
