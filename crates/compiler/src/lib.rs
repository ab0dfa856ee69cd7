//! Hemlock front-end
//!
//! Everything between source text and execution: lexer, recursive-descent
//! parser, the `.hmlc` binary AST codec, the module loader, and the C code
//! generator. The interpreter (hemlock-runtime) consumes the AST produced
//! here; the transpiler path shares the same tree, so the two stay in
//! lockstep by construction.

pub mod ast;
pub mod captures;
pub mod codec;
pub mod codegen;
pub mod error;
pub mod lexer;
pub mod module;
pub mod parser;
pub mod token;

pub use ast::{Expr, Program, SourceLocation, Stmt, TypeAnnotation};
pub use codegen::CodeGen;
pub use error::{CodeGenError, CodecError, ModuleError, ParseError};
pub use module::{Module, ModuleRegistry, ModuleState};
pub use parser::{parse_expression, parse_source};

use std::fs;
use std::path::Path;

/// Load a program from disk, dispatching on extension: `.hmlc` streams are
/// decoded, anything else is parsed as source text.
pub fn load_program(path: &Path) -> Result<Program, String> {
    if path.extension().is_some_and(|e| e == "hmlc") {
        let bytes = fs::read(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        codec::deserialize(&bytes, &path.display().to_string()).map_err(|e| e.to_string())
    } else {
        let source =
            fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        parse_source(&source, path).map_err(|e| e.to_string())
    }
}

/// Parse a source file and write its `.hmlc` form
pub fn compile_to_hmlc(input: &Path, output: &Path, debug: bool) -> Result<(), String> {
    let source =
        fs::read_to_string(input).map_err(|e| format!("cannot read {}: {}", input.display(), e))?;
    let program = parse_source(&source, input).map_err(|e| e.to_string())?;
    let bytes = codec::serialize(&program, debug);
    fs::write(output, bytes).map_err(|e| format!("cannot write {}: {}", output.display(), e))
}

/// Parse a source file, compile its imports, and emit the C translation unit
pub fn transpile_to_c(input: &Path, stdlib_root: Option<std::path::PathBuf>) -> Result<String, String> {
    let source =
        fs::read_to_string(input).map_err(|e| format!("cannot read {}: {}", input.display(), e))?;
    let program = parse_source(&source, input).map_err(|e| e.to_string())?;
    let main_dir = input
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| std::path::PathBuf::from("."));
    let mut registry = ModuleRegistry::new(main_dir, stdlib_root);
    for (_, spec, _) in program.imports() {
        let path = registry.resolve(None, spec).map_err(|e| e.to_string())?;
        registry.compile(&path).map_err(|e| e.to_string())?;
    }
    let mut codegen = CodeGen::new();
    codegen
        .generate(&program, input, &registry)
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_compile_and_load_hmlc() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("p.hml");
        let out = dir.path().join("p.hmlc");
        fs::write(&src, "let x = 41; print(x + 1);").unwrap();
        compile_to_hmlc(&src, &out, true).expect("compile");
        let program = load_program(&out).expect("load");
        assert_eq!(program.statements.len(), 2);
    }

    #[test]
    fn test_load_program_dispatches_on_extension() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("p.hml");
        fs::write(&src, "let x = 1;").unwrap();
        assert!(load_program(&src).is_ok());
        let bogus = dir.path().join("b.hmlc");
        fs::write(&bogus, b"not a codec stream").unwrap();
        let err = load_program(&bogus).unwrap_err();
        assert!(err.contains("HMLC"));
    }

    #[test]
    fn test_transpile_with_import() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("m.hml"), "export let x = 41;").unwrap();
        let main = dir.path().join("main.hml");
        fs::write(&main, "import { x } from \"./m\"; print(x + 1);").unwrap();
        let c = transpile_to_c(&main, None).expect("transpile");
        assert!(c.contains("_mod0_x"));
        assert!(c.contains("int main(int argc, char **argv)"));
    }
}
