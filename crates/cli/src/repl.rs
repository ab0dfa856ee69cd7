//! Line-based REPL
//!
//! Each line parses as a program against the interpreter's persistent
//! top-level scope, so bindings accumulate across lines. The grammar makes
//! the final semicolon optional, so `1 + 2` works without ceremony.

use hemlock_compiler::parse_source;
use hemlock_core::value::Value;
use hemlock_runtime::Interp;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::Path;
use std::rc::Rc;

pub fn repl_loop(interp: &Rc<Interp>) -> i32 {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("cannot start REPL: {}", e);
            return 1;
        }
    };
    println!("hemlock {} - ctrl-d to exit", env!("CARGO_PKG_VERSION"));
    loop {
        match editor.readline("hemlock> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(trimmed);
                eval_line(interp, trimmed);
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => return 0,
            Err(e) => {
                eprintln!("read error: {}", e);
                return 1;
            }
        }
    }
}

fn eval_line(interp: &Rc<Interp>, line: &str) {
    let program = match parse_source(line, Path::new("<repl>")) {
        Ok(program) => program,
        Err(error) => {
            eprintln!("{}", error);
            return;
        }
    };
    match interp.run(&program) {
        Ok(Value::Null) => {}
        Ok(value) => println!("{}", value.to_repr()),
        Err(thrown) => {
            eprintln!("Uncaught: {}", thrown.value.to_display());
            eprint!("{}", thrown.render_trace());
        }
    }
}
