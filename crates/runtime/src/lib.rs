//! Hemlock runtime
//!
//! The tree-walking evaluator and everything it drives: builtin dispatch,
//! the cooperative task scheduler (May, one worker), channels, files,
//! sockets, signal delivery, and the FFI capability seam. Programs come in
//! as ASTs from hemlock-compiler; values and environments come from
//! hemlock-core.

pub mod builtins;
mod coerce;
mod eval;
pub mod ffi;
pub mod file;
pub mod interp;
pub mod net;
pub mod scheduler;
pub mod signal;
pub mod tasks;

pub use ffi::{FfiHost, NullFfiHost};
pub use interp::{run_program, Interp, InterpOptions};

use hemlock_compiler::parse_source;
use std::path::Path;

/// Outcome of [`eval_source`]: the display form of the program's final
/// expression (or the uncaught throw), plus captured output.
pub struct RunOutcome {
    pub value: Result<String, String>,
    pub output: String,
}

impl RunOutcome {
    pub fn value_ok(&self) -> &str {
        self.value.as_deref().expect("program threw")
    }

    pub fn value_err(&self) -> &str {
        match &self.value {
            Err(message) => message,
            Ok(v) => panic!("expected a throw, got {}", v),
        }
    }
}

/// Evaluate source text on the scheduler with captured output. The heavy
/// lifting for tests and `hemlock -c`.
pub fn eval_source(source: &str) -> Result<RunOutcome, String> {
    eval_source_with(
        source,
        InterpOptions {
            capture_output: true,
            ..Default::default()
        },
    )
}

/// [`eval_source`] with explicit options (main file, stdlib root, args).
/// Output capture is forced on.
pub fn eval_source_with(source: &str, mut options: InterpOptions) -> Result<RunOutcome, String> {
    let file = options
        .main_file
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from("<eval>"));
    let program = parse_source(source, &file).map_err(|e| e.to_string())?;
    options.capture_output = true;
    eval_program(program, options)
}

/// Run an already-parsed program with captured output
pub fn eval_program(
    program: hemlock_compiler::Program,
    mut options: InterpOptions,
) -> Result<RunOutcome, String> {
    options.capture_output = true;
    Ok(scheduler::run_on_worker(move || {
        let interp = Interp::new(options);
        let value = match interp.run(&program) {
            Ok(value) => {
                let display = value.to_display();
                drop(value);
                Ok(display)
            }
            Err(thrown) => Err(thrown.value.to_display()),
        };
        let output = interp.take_output();
        interp.teardown();
        RunOutcome { value, output }
    }))
}

/// Evaluate a main file (source or `.hmlc`) with arguments, writing to
/// stdout, returning the process exit code.
pub fn run_file(path: &Path, args: Vec<String>, stdlib_root: Option<std::path::PathBuf>) -> i32 {
    let program = match hemlock_compiler::load_program(path) {
        Ok(program) => program,
        Err(message) => {
            eprintln!("{}", message);
            return 1;
        }
    };
    run_program(
        program,
        InterpOptions {
            main_file: Some(path.to_path_buf()),
            stdlib_root,
            args,
            capture_output: false,
        },
    )
}
