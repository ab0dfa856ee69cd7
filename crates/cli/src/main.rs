//! Hemlock CLI
//!
//! - `hemlock`                      start the REPL
//! - `hemlock FILE [ARGS...]`       run a `.hml` or `.hmlc` program
//! - `hemlock -c CODE`              evaluate a code string
//! - `hemlock --compile FILE`       serialize the AST to `.hmlc`
//! - `hemlock -i FILE`              run a file, then drop into the REPL
//! - `hemlock --emit-c FILE`        emit the C translation unit
//!
//! Exit codes: 0 on success, 1 on parse or runtime error.

mod repl;

use clap::Parser as ClapParser;
use hemlock_runtime::{scheduler, Interp, InterpOptions};
use std::path::PathBuf;
use std::process;

#[derive(ClapParser)]
#[command(name = "hemlock")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Hemlock language toolchain", long_about = None)]
struct Cli {
    /// Script to run (.hml source or .hmlc binary AST); omit for a REPL
    file: Option<PathBuf>,

    /// Arguments exposed to the script through the `args` builtin
    #[arg(trailing_var_arg = true)]
    script_args: Vec<String>,

    /// Evaluate a code string and exit
    #[arg(short = 'c', value_name = "CODE", conflicts_with = "file")]
    code: Option<String>,

    /// Serialize FILE's AST to .hmlc instead of running it
    #[arg(long, requires = "file")]
    compile: bool,

    /// Output path for --compile / --emit-c (default: FILE with .hmlc / .c)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Include line/column debug info when compiling
    #[arg(long)]
    debug: bool,

    /// Run FILE, then continue in the REPL with its bindings
    #[arg(short = 'i', requires = "file")]
    interactive: bool,

    /// Emit the C translation unit for FILE instead of running it
    #[arg(long = "emit-c", requires = "file")]
    emit_c: bool,

    /// Root directory for @stdlib imports (default: $HEMLOCK_STDLIB)
    #[arg(long)]
    stdlib: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    let stdlib = cli
        .stdlib
        .clone()
        .or_else(|| std::env::var_os("HEMLOCK_STDLIB").map(PathBuf::from));

    if let Some(code) = cli.code {
        process::exit(run_code(&code, stdlib));
    }

    let Some(file) = cli.file else {
        process::exit(run_repl(None, stdlib, Vec::new()));
    };

    if cli.compile {
        let output = cli
            .output
            .unwrap_or_else(|| file.with_extension("hmlc"));
        match hemlock_compiler::compile_to_hmlc(&file, &output, cli.debug) {
            Ok(()) => {
                println!("Compiled {} -> {}", file.display(), output.display());
                process::exit(0);
            }
            Err(message) => {
                eprintln!("{}", message);
                process::exit(1);
            }
        }
    }

    if cli.emit_c {
        match hemlock_compiler::transpile_to_c(&file, stdlib) {
            Ok(c_source) => match &cli.output {
                Some(output) => {
                    if let Err(e) = std::fs::write(output, c_source) {
                        eprintln!("cannot write {}: {}", output.display(), e);
                        process::exit(1);
                    }
                    process::exit(0);
                }
                None => {
                    print!("{}", c_source);
                    process::exit(0);
                }
            },
            Err(message) => {
                eprintln!("{}", message);
                process::exit(1);
            }
        }
    }

    if cli.interactive {
        process::exit(run_repl(Some(file), stdlib, cli.script_args));
    }

    process::exit(hemlock_runtime::run_file(&file, cli.script_args, stdlib));
}

fn run_code(code: &str, stdlib: Option<PathBuf>) -> i32 {
    let program = match hemlock_compiler::parse_source(code, std::path::Path::new("<cmdline>")) {
        Ok(program) => program,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };
    hemlock_runtime::run_program(
        program,
        InterpOptions {
            stdlib_root: stdlib,
            ..Default::default()
        },
    )
}

/// Start the REPL, optionally running a file first so its bindings are in
/// scope. Everything runs on the worker; line reads block the scheduler,
/// which is the documented behavior for blocking I/O.
fn run_repl(file: Option<PathBuf>, stdlib: Option<PathBuf>, args: Vec<String>) -> i32 {
    scheduler::run_on_worker(move || {
        let interp = Interp::new(InterpOptions {
            main_file: file.clone(),
            stdlib_root: stdlib,
            args,
            capture_output: false,
        });
        if let Some(file) = file {
            let program = match hemlock_compiler::load_program(&file) {
                Ok(program) => program,
                Err(message) => {
                    eprintln!("{}", message);
                    return 1;
                }
            };
            if let Err(thrown) = interp.run(&program) {
                eprintln!("Uncaught: {}", thrown.value.to_display());
                eprint!("{}", thrown.render_trace());
                interp.teardown();
                return 1;
            }
        }
        let code = repl::repl_loop(&interp);
        interp.teardown();
        code
    })
}
