//! Interpreter state and program entry
//!
//! [`Interp`] owns everything a running program shares: the global scope,
//! the module registry and executed-module environments, `define_object`
//! type declarations, signal handlers, the FFI capability, and the output
//! sink. Evaluation itself lives in `eval.rs`; this module wires programs
//! in and tears the world down afterwards.

use crate::eval::FrameCtx;
use crate::ffi::{FfiHost, NullFfiHost};
use crate::scheduler;
use hemlock_compiler::ast::FieldDecl;
use hemlock_compiler::module::ModuleRegistry;
use hemlock_compiler::Program;
use hemlock_core::control::Thrown;
use hemlock_core::env::{break_cycles, Env};
use hemlock_core::value::Value;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;

/// Where `print` and friends write
enum Output {
    Stdout,
    Capture(Vec<u8>),
}

pub struct InterpOptions {
    /// The main file, if running from disk; anchors relative imports
    pub main_file: Option<PathBuf>,
    pub stdlib_root: Option<PathBuf>,
    /// Program arguments exposed through the `args` builtin
    pub args: Vec<String>,
    /// Buffer output instead of writing to stdout (tests, REPL echo)
    pub capture_output: bool,
}

impl Default for InterpOptions {
    fn default() -> Self {
        InterpOptions {
            main_file: None,
            stdlib_root: None,
            args: Vec::new(),
            capture_output: false,
        }
    }
}

/// Guard against runaway recursion blowing the coroutine stack
pub(crate) const MAX_CALL_DEPTH: usize = 4000;

pub struct Interp {
    pub globals: Rc<Env>,
    /// Top-level scope cursor; advances when a top-level `let` re-declares
    /// a name (the old binding stays visible to closures that captured it).
    top_env: RefCell<Rc<Env>>,
    pub(crate) modules: RefCell<ModuleRegistry>,
    /// Environments of modules whose top level has run (exactly once each)
    pub(crate) module_envs: RefCell<HashMap<PathBuf, Rc<Env>>>,
    /// Stack of module paths currently executing; `None` is the main file
    pub(crate) module_stack: RefCell<Vec<Option<PathBuf>>>,
    /// `define_object` declarations, by type name
    pub(crate) object_types: RefCell<HashMap<String, Vec<FieldDecl>>>,
    /// Installed signal handlers, by signal number
    pub(crate) signal_handlers: RefCell<HashMap<i32, Value>>,
    pub(crate) args: Vec<String>,
    pub(crate) ffi: RefCell<Box<dyn FfiHost>>,
    pub(crate) call_depth: Cell<usize>,
    /// Value of the most recent expression statement (REPL echo)
    pub(crate) last_value: RefCell<Value>,
    out: RefCell<Output>,
}

impl Interp {
    pub fn new(options: InterpOptions) -> Rc<Interp> {
        Self::with_ffi(options, Box::new(NullFfiHost))
    }

    pub fn with_ffi(options: InterpOptions, mut ffi: Box<dyn FfiHost>) -> Rc<Interp> {
        // The FFI capability is process-wide and initializes exactly once,
        // bracketed by the interpreter's lifetime.
        ffi.init();
        let main_dir = options
            .main_file
            .as_ref()
            .and_then(|p| p.parent().map(|d| d.to_path_buf()))
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let globals = Env::new();
        // Program arguments are exposed as the `args` array (the `args()`
        // builtin stays as a fallback when the binding is shadowed away).
        globals.define(
            "args",
            Value::array(options.args.iter().map(Value::string).collect()),
            false,
        );
        Rc::new(Interp {
            top_env: RefCell::new(globals.clone()),
            globals,
            modules: RefCell::new(ModuleRegistry::new(main_dir, options.stdlib_root)),
            module_envs: RefCell::new(HashMap::new()),
            module_stack: RefCell::new(vec![None]),
            object_types: RefCell::new(HashMap::new()),
            signal_handlers: RefCell::new(HashMap::new()),
            args: options.args,
            ffi: RefCell::new(ffi),
            call_depth: Cell::new(0),
            last_value: RefCell::new(Value::Null),
            out: RefCell::new(if options.capture_output {
                Output::Capture(Vec::new())
            } else {
                Output::Stdout
            }),
        })
    }

    pub(crate) fn write_out(&self, text: &str) {
        match &mut *self.out.borrow_mut() {
            Output::Stdout => {
                let stdout = std::io::stdout();
                let mut lock = stdout.lock();
                let _ = lock.write_all(text.as_bytes());
                let _ = lock.flush();
            }
            Output::Capture(buf) => buf.extend_from_slice(text.as_bytes()),
        }
    }

    /// Drain captured output (empty when writing to stdout)
    pub fn take_output(&self) -> String {
        match &mut *self.out.borrow_mut() {
            Output::Stdout => String::new(),
            Output::Capture(buf) => String::from_utf8_lossy(&std::mem::take(buf)).into_owned(),
        }
    }

    /// Run a program's top level in the persistent top-level scope.
    /// Returns the value of the last expression statement (`null` if none);
    /// top-level `defer`s run before this returns.
    pub fn run(self: &Rc<Self>, program: &Program) -> Result<Value, Thrown> {
        *self.last_value.borrow_mut() = Value::Null;
        let mut env = self.top_env.borrow().clone();
        let mut frame = FrameCtx::new();
        let result = self.exec_stmts(&program.statements, &mut env, &mut frame);
        let defers = self.run_defers(frame);
        *self.top_env.borrow_mut() = env;
        defers?;
        result?;
        Ok(self.last_value.borrow().clone())
    }

    /// Release everything the program allocated. The caller drops the
    /// program result first; then every environment chain gets the
    /// cycle-break pass so closure cycles cannot keep scopes alive.
    pub fn teardown(&self) {
        for (_, env) in self.module_envs.borrow_mut().drain() {
            release_env_chain(&env, None);
        }
        self.signal_handlers.borrow_mut().clear();
        let top = self.top_env.borrow().clone();
        release_env_chain(&top, None);
        *self.top_env.borrow_mut() = self.globals.clone();
        self.ffi.borrow_mut().cleanup();
    }
}

/// Break cycles on every scope from `env` down to (but excluding) `stop`,
/// walking parent links. `None` releases the whole chain.
pub(crate) fn release_env_chain(env: &Rc<Env>, stop: Option<&Rc<Env>>) {
    let mut cursor = Some(env.clone());
    while let Some(current) = cursor {
        if let Some(stop) = stop
            && Rc::ptr_eq(&current, stop)
        {
            break;
        }
        break_cycles(&current);
        cursor = current.parent().cloned();
    }
}

/// Convenience runner: evaluate a program on the single-worker scheduler,
/// print an uncaught throw with its stack trace, and map to an exit code.
pub fn run_program(program: Program, options: InterpOptions) -> i32 {
    scheduler::run_on_worker(move || {
        let interp = Interp::new(options);
        let outcome = interp.run(&program);
        let code = match outcome {
            Ok(result) => {
                drop(result);
                0
            }
            Err(thrown) => {
                eprintln!("Uncaught: {}", thrown.value.to_display());
                eprint!("{}", thrown.render_trace());
                1
            }
        };
        interp.teardown();
        code
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hemlock_compiler::parse_source;
    use serial_test::serial;
    use std::path::Path;

    fn run_capture(source: &str) -> (Result<Value, Thrown>, String) {
        let program = parse_source(source, Path::new("test.hml")).expect("parse");
        let interp = Interp::new(InterpOptions {
            capture_output: true,
            ..Default::default()
        });
        let result = interp.run(&program);
        let output = interp.take_output();
        interp.teardown();
        (result, output)
    }

    #[test]
    #[serial]
    fn test_run_returns_last_expression_value() {
        let (result, _) = run_capture("let x = 40; x + 2;");
        assert!(matches!(result.unwrap(), Value::I32(42)));
    }

    #[test]
    #[serial]
    fn test_uncaught_throw_surfaces() {
        let (result, _) = run_capture("throw \"boom\";");
        let thrown = result.unwrap_err();
        assert_eq!(thrown.value.as_str().unwrap(), "boom");
    }

    #[test]
    #[serial]
    fn test_top_level_scope_persists_across_runs() {
        let interp = Interp::new(InterpOptions {
            capture_output: true,
            ..Default::default()
        });
        let first = parse_source("let x = 1;", Path::new("repl")).unwrap();
        interp.run(&first).unwrap();
        let second = parse_source("x + 1;", Path::new("repl")).unwrap();
        let value = interp.run(&second).unwrap();
        assert!(matches!(value, Value::I32(2)));
        interp.teardown();
    }
}
