//! AST-to-C code generation
//!
//! Emits a C translation unit as text against the prebuilt
//! `hemlock_runtime.h` value contract:
//!
//! - Every user function lowers to `Value name(HmlEnv *env, Value p1, ...)`;
//!   top-level calls pass `NULL` for the environment.
//! - Every user function also gets an anonymous-form trampoline
//!   `Value name__tramp(HmlEnv *env, Value *argv, int argc)` that unpacks an
//!   argument array, filling missing positions with the `hml_undef()`
//!   sentinel so parameter defaults evaluate inside the callee.
//! - A function frame allocates one heap environment holding exactly the
//!   variables some nested closure references; every closure created in the
//!   frame shares it, which is what makes captured mutation visible.
//! - Main-file symbols are prefixed `_main_` and module symbols with their
//!   module prefix, so user names like `open` or `kill` never collide with
//!   libc identifiers.
//! - `defer` lowers to a per-function defer stack ran LIFO on every exit
//!   path: return, fallthrough, and exception propagation (via a function
//!   try frame that reruns defers and rethrows).
//! - `finally` bodies are re-emitted on every control transfer that leaves
//!   their `try` (return, break, continue), which is how the emitted program
//!   matches the interpreter's signal algebra.

use crate::ast::{BinaryOp, Expr, InterpPart, Param, Program, Stmt, TypeAnnotation, UnaryOp};
use crate::captures::function_free_vars;
use crate::error::CodeGenError;
use crate::module::{ModuleRegistry, export_fn_info};
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::path::Path;
use std::rc::Rc;

/// Builtin names the generated code routes through `hml_builtin_call`.
/// IMPORTANT: keep this list in sync with the runtime's builtin table
/// (hemlock-runtime builtins.rs).
pub const BUILTIN_NAMES: &[&str] = &[
    "print",
    "typeof",
    "len",
    "to_string",
    "parse_int",
    "parse_float",
    "deep_equal",
    "clone",
    "keys",
    "values",
    "buffer",
    "channel",
    "spawn",
    "join",
    "detach",
    "cancel",
    "sleep",
    "yield_now",
    "signal",
    "open",
    "read_file",
    "write_file",
    "tcp_listen",
    "tcp_connect",
    "json_parse",
    "json_stringify",
    "free",
    "exit",
    "args",
    "assert",
];

/// How an identifier resolves during emission
#[derive(Debug, Clone)]
enum VarRef {
    /// Plain C local variable
    Local(String),
    /// C global (top-level binding, possibly from another module)
    Global(String),
    /// Slot in the defining frame's heap environment
    EnvSlot(usize),
}

/// A known top-level function: call sites can use the typed C entry directly
#[derive(Debug, Clone)]
struct KnownFn {
    c_name: String,
    arity: usize,
    is_async: bool,
}

/// Control-transfer bookkeeping: pending `finally` bodies must re-run when a
/// return/break/continue leaves their `try`, and `break` inside a `switch`
/// jumps to the switch end label rather than a C loop break.
enum CtrlEntry {
    Finally(Rc<Vec<Stmt>>),
    Loop { continue_label: Option<String> },
    Switch { end_label: String },
}

struct Frame {
    /// Block scopes, innermost last
    scopes: Vec<HashMap<String, VarRef>>,
    /// Captured-variable layout of this frame's heap environment
    captured: HashMap<String, usize>,
    /// Whether this frame allocated a heap environment
    has_env: bool,
    /// True for the unit (top-level) pseudo-frame
    is_unit: bool,
    /// Whether the function being emitted declared any `defer`
    has_defers: bool,
}

impl Frame {
    fn unit(has_defers: bool) -> Self {
        Frame {
            scopes: vec![HashMap::new()],
            captured: HashMap::new(),
            has_env: false,
            is_unit: true,
            has_defers,
        }
    }

    fn function(captured: HashMap<String, usize>, has_defers: bool) -> Self {
        let has_env = !captured.is_empty();
        Frame {
            scopes: vec![HashMap::new()],
            captured,
            has_env,
            is_unit: false,
            has_defers,
        }
    }
}

pub struct CodeGen {
    /// Forward declarations
    decls: String,
    /// Global variable definitions
    globals: String,
    /// Completed function definitions
    fns: String,
    /// Stack of function-body buffers (nested literals emit recursively)
    bufs: Vec<String>,
    indents: Vec<usize>,
    frames: Vec<Frame>,
    /// Control stack for the function currently being emitted
    ctrl: Vec<CtrlEntry>,
    /// Saved control stacks of enclosing functions
    ctrl_saved: Vec<Vec<CtrlEntry>>,
    known_fns: HashMap<String, KnownFn>,
    /// Prefix of the unit currently being emitted (`_main_` or `_mod<N>_`)
    unit_prefix: String,
    tmp: u32,
    lambda: u32,
    label: u32,
}

impl Default for CodeGen {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeGen {
    pub fn new() -> Self {
        CodeGen {
            decls: String::new(),
            globals: String::new(),
            fns: String::new(),
            bufs: Vec::new(),
            indents: Vec::new(),
            frames: Vec::new(),
            ctrl: Vec::new(),
            ctrl_saved: Vec::new(),
            known_fns: HashMap::new(),
            unit_prefix: "_main_".to_string(),
            tmp: 0,
            lambda: 0,
            label: 0,
        }
    }

    /// Generate the complete translation unit: modules in initialization
    /// order, then the main program, then `main()`.
    pub fn generate(
        &mut self,
        main: &Program,
        main_file: &Path,
        registry: &ModuleRegistry,
    ) -> Result<String, CodeGenError> {
        let mut init_calls = Vec::new();

        let modules: Vec<_> = registry.initialization_order().collect();
        for module in &modules {
            let module = module.borrow();
            let program = module.program.as_ref().ok_or_else(|| {
                CodeGenError::Logic(format!(
                    "module {} has no parsed program",
                    module.path.display()
                ))
            })?;
            let imports: Vec<(String, String, bool, usize)> = module
                .imports
                .iter()
                .map(|b| {
                    (
                        b.local.clone(),
                        format!("{}{}", b.source_prefix, b.original),
                        b.is_function,
                        b.arity,
                    )
                })
                .collect();
            let exports: BTreeSet<String> =
                module.exports.iter().map(|e| e.name.clone()).collect();
            let init = self.emit_unit(&module.prefix, program, &imports, &exports)?;
            init_calls.push(init);
        }

        // The main program's imports bind against already-compiled modules.
        let mut main_imports = Vec::new();
        for (names, spec, _) in main.imports() {
            let path = registry
                .resolve(None, spec)
                .map_err(|e| CodeGenError::Logic(e.to_string()))?;
            let module = registry.get(&path).ok_or_else(|| {
                CodeGenError::Logic(format!("import '{}' was not compiled", spec))
            })?;
            let module = module.borrow();
            for name in names {
                let entry = module.export(name).ok_or_else(|| {
                    CodeGenError::Logic(format!(
                        "module {} does not export '{}'",
                        module.path.display(),
                        name
                    ))
                })?;
                let (is_function, arity) = module
                    .program
                    .as_ref()
                    .map(|p| export_fn_info(p, name))
                    .unwrap_or((false, 0));
                main_imports.push((name.clone(), entry.mangled.clone(), is_function, arity));
            }
        }
        let init = self.emit_unit("_main_", main, &main_imports, &BTreeSet::new())?;
        init_calls.push(init);

        let mut out = String::new();
        writeln!(out, "/* Generated from {} */", main_file.display())?;
        writeln!(out, "#include \"hemlock_runtime.h\"")?;
        writeln!(out)?;
        out.push_str(&self.decls);
        writeln!(out)?;
        out.push_str(&self.globals);
        writeln!(out)?;
        out.push_str(&self.fns);
        writeln!(out, "int main(int argc, char **argv) {{")?;
        writeln!(out, "    hml_runtime_init(argc, argv);")?;
        writeln!(out, "    HmlTryFrame __top;")?;
        writeln!(out, "    if (hml_try_enter(&__top)) {{")?;
        writeln!(out, "        hml_report_uncaught(hml_catch_value());")?;
        writeln!(out, "        hml_runtime_shutdown();")?;
        writeln!(out, "        return 1;")?;
        writeln!(out, "    }}")?;
        for init in &init_calls {
            writeln!(out, "    {}();", init)?;
        }
        writeln!(out, "    hml_try_exit(&__top);")?;
        writeln!(out, "    hml_runtime_shutdown();")?;
        writeln!(out, "    return 0;")?;
        writeln!(out, "}}")?;
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Units (one source file each)
    // ------------------------------------------------------------------

    /// Emit one source file's top level as `static void <prefix>init(void)`.
    /// `imports` are `(local, mangled, is_function, arity)` tuples.
    fn emit_unit(
        &mut self,
        prefix: &str,
        program: &Program,
        imports: &[(String, String, bool, usize)],
        exports: &BTreeSet<String>,
    ) -> Result<String, CodeGenError> {
        self.unit_prefix = prefix.to_string();
        let has_defers = body_has_defer(&program.statements);
        let mut frame = Frame::unit(has_defers);
        for (local, mangled, is_function, arity) in imports {
            if *is_function {
                // The source module keeps the typed entry under the mangled
                // name and the function value under `<mangled>_v`.
                let value_global = format!("{}_v", mangled);
                frame.scopes[0].insert(local.clone(), VarRef::Global(value_global.clone()));
                self.known_fns.insert(
                    value_global,
                    KnownFn { c_name: mangled.clone(), arity: *arity, is_async: false },
                );
            } else {
                frame.scopes[0].insert(local.clone(), VarRef::Global(mangled.clone()));
            }
        }

        let init_name = format!("{}init", prefix);
        writeln!(self.decls, "static void {}(void);", init_name)?;

        self.frames.push(frame);
        self.bufs.push(String::new());
        self.indents.push(1);
        self.ctrl_saved.push(std::mem::take(&mut self.ctrl));

        if has_defers {
            self.line("HmlDefers __defers = {0};");
        }
        for stmt in &program.statements {
            self.emit_top_stmt(stmt, exports)?;
        }
        if has_defers {
            self.line("hml_defer_run(&__defers);");
        }

        let body = self.bufs.pop().expect("unit body buffer");
        self.indents.pop();
        self.frames.pop();
        self.ctrl = self.ctrl_saved.pop().expect("saved control stack");

        writeln!(self.fns, "static void {}(void) {{", init_name)?;
        self.fns.push_str(&body);
        writeln!(self.fns, "}}")?;
        writeln!(self.fns)?;
        Ok(init_name)
    }

    /// Mangled global for a top-level binding. Exports use `<prefix><name>`,
    /// private functions `<prefix>fn_<name>`, private values `<prefix>v_<name>`.
    fn mangle_top_level(&self, name: &str, is_fn: bool, exported: bool) -> String {
        if exported {
            format!("{}{}", self.unit_prefix, name)
        } else if is_fn {
            format!("{}fn_{}", self.unit_prefix, name)
        } else {
            format!("{}v_{}", self.unit_prefix, name)
        }
    }

    fn emit_top_stmt(
        &mut self,
        stmt: &Stmt,
        exports: &BTreeSet<String>,
    ) -> Result<(), CodeGenError> {
        match stmt {
            Stmt::Export { stmt, .. } => self.emit_top_stmt(stmt, exports),
            Stmt::Let { name, annotation, value, .. }
            | Stmt::Const { name, annotation, value, .. } => {
                let exported = exports.contains(name);
                if let Expr::Function { params, body, is_async, .. } = value {
                    // Top-level function: typed C entry plus a value global.
                    let c_name = self.mangle_top_level(name, true, exported);
                    let value_global = format!("{}_v", c_name);
                    writeln!(self.globals, "static Value {};", value_global)?;
                    self.bind_current(name, VarRef::Global(value_global.clone()));
                    self.known_fns.insert(
                        value_global.clone(),
                        KnownFn {
                            c_name: c_name.clone(),
                            arity: params.len(),
                            is_async: *is_async,
                        },
                    );
                    let fn_value = self.emit_function_literal(&c_name, params, body, *is_async)?;
                    self.line(format!("{} = {};", value_global, fn_value));
                } else {
                    let global = self.mangle_top_level(name, false, exported);
                    writeln!(self.globals, "static Value {};", global)?;
                    let tmp = self.emit_expr(value)?;
                    let tmp = self.apply_annotation(tmp, annotation)?;
                    self.line(format!("{} = {};", global, tmp));
                    self.bind_current(name, VarRef::Global(global));
                }
                Ok(())
            }
            Stmt::Import { .. } => Ok(()), // bound in the unit frame already
            other => self.emit_stmt(other),
        }
    }

    // ------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------

    /// Emit a function literal as a C function plus trampoline, returning a
    /// C expression that builds the runtime function value.
    fn emit_function_literal(
        &mut self,
        c_name: &str,
        params: &[Param],
        body: &Rc<Vec<Stmt>>,
        is_async: bool,
    ) -> Result<String, CodeGenError> {
        // The frame environment holds exactly the variables some nested
        // closure references.
        let mut captured: HashMap<String, usize> = HashMap::new();
        let mut bindable: BTreeSet<String> = params.iter().map(|p| p.name.clone()).collect();
        collect_bindable(body, &mut bindable);
        let mut closure_free = BTreeSet::new();
        collect_closure_free_vars(body, &mut closure_free);
        for name in closure_free {
            if bindable.contains(&name) {
                let slot = captured.len();
                captured.insert(name, slot);
            }
        }

        let required = params.iter().take_while(|p| p.default.is_none()).count();
        let arity = params.len();
        let has_defers = body_has_defer(body);
        // The closure env of this literal comes from the frame that is
        // current right now, before the new frame is pushed.
        let env_arg = self.closure_env_expr();

        let mut sig = format!("static Value {}(HmlEnv *env", c_name);
        for param in params {
            write!(sig, ", Value p_{}", param.name)?;
        }
        sig.push(')');
        writeln!(self.decls, "{};", sig)?;
        writeln!(
            self.decls,
            "static Value {}__tramp(HmlEnv *env, Value *argv, int argc);",
            c_name
        )?;

        self.frames.push(Frame::function(captured.clone(), has_defers));
        self.bufs.push(String::new());
        self.indents.push(1);
        self.ctrl_saved.push(std::mem::take(&mut self.ctrl));

        // Prologue: defaults, frame env, captured-parameter hoisting.
        for param in params {
            if let Some(default) = &param.default {
                self.line(format!("if (hml_is_undef(p_{})) {{", param.name));
                self.indent();
                // Earlier parameters are in scope for later defaults.
                let tmp = self.emit_expr(default)?;
                self.line(format!("p_{} = {};", param.name, tmp));
                self.dedent();
                self.line("}");
            } else {
                self.line(format!(
                    "if (hml_is_undef(p_{0})) p_{0} = hml_null();",
                    param.name
                ));
            }
            self.bind_current(&param.name, VarRef::Local(format!("p_{}", param.name)));
        }
        let frame_has_env = self.frames.last().expect("frame").has_env;
        if frame_has_env {
            self.line(format!(
                "HmlEnv *frame_env = hml_env_alloc(env, {});",
                captured.len()
            ));
            let mut hoisted: Vec<(&String, &usize)> = captured.iter().collect();
            hoisted.sort_by_key(|(_, slot)| **slot);
            for (name, slot) in hoisted {
                if params.iter().any(|p| &p.name == name) {
                    self.line(format!(
                        "hml_env_local_set(frame_env, {}, p_{});",
                        slot, name
                    ));
                }
                self.bind_current(name, VarRef::EnvSlot(*slot));
            }
        }
        if has_defers {
            self.line("HmlDefers __defers = {0};");
            self.line("HmlTryFrame __fframe;");
            self.line("if (hml_try_enter(&__fframe)) {");
            self.indent();
            self.line("hml_defer_run(&__defers);");
            self.line("hml_rethrow();");
            self.dedent();
            self.line("}");
        }

        for stmt in body.iter() {
            self.emit_stmt(stmt)?;
        }
        // Fallthrough yields null.
        if has_defers {
            self.line("hml_try_exit(&__fframe);");
            self.line("hml_defer_run(&__defers);");
        }
        self.line("return hml_null();");

        let text = self.bufs.pop().expect("function body buffer");
        self.indents.pop();
        self.frames.pop();
        self.ctrl = self.ctrl_saved.pop().expect("saved control stack");

        writeln!(self.fns, "{} {{", sig)?;
        self.fns.push_str(&text);
        writeln!(self.fns, "}}")?;
        writeln!(self.fns)?;

        // Anonymous-form trampoline: unpack an argument array, filling
        // missing positions with the undef sentinel.
        writeln!(
            self.fns,
            "static Value {}__tramp(HmlEnv *env, Value *argv, int argc) {{",
            c_name
        )?;
        let mut call = format!("{}(env", c_name);
        for i in 0..arity {
            write!(call, ", argc > {i} ? argv[{i}] : hml_undef()")?;
        }
        call.push(')');
        writeln!(self.fns, "    return {};", call)?;
        writeln!(self.fns, "}}")?;
        writeln!(self.fns)?;

        Ok(format!(
            "hml_make_function({}__tramp, {}, {}, {}, {})",
            c_name,
            env_arg,
            arity,
            required,
            if is_async { 1 } else { 0 }
        ))
    }

    /// Environment a closure created in the current frame should capture
    fn closure_env_expr(&self) -> &'static str {
        match self.frames.last() {
            None => "NULL",
            Some(frame) if frame.is_unit => "NULL",
            Some(frame) if frame.has_env => "frame_env",
            Some(_) => "env",
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn emit_stmt(&mut self, stmt: &Stmt) -> Result<(), CodeGenError> {
        match stmt {
            Stmt::Let { name, annotation, value, .. }
            | Stmt::Const { name, annotation, value, .. } => {
                let tmp = if let Expr::Function { params, body, is_async, .. } = value {
                    // Bind before emission so the body's self-reference
                    // resolves (named recursion through the binding).
                    self.bind_let_target(name)?;
                    let lambda = self.fresh_lambda(name);
                    let fn_value = self.emit_function_literal(&lambda, params, body, *is_async)?;
                    let tmp = self.fresh_tmp();
                    self.line(format!("Value {} = {};", tmp, fn_value));
                    tmp
                } else {
                    let tmp = self.emit_expr(value)?;
                    self.bind_let_target(name)?;
                    tmp
                };
                let tmp = self.apply_annotation(tmp, annotation)?;
                self.write_var(name, &tmp)?;
                Ok(())
            }
            Stmt::Expr { expr, .. } => {
                let tmp = self.emit_expr(expr)?;
                self.line(format!("(void){};", tmp));
                Ok(())
            }
            Stmt::If { cond, then_body, else_body, .. } => {
                let cond = self.emit_expr(cond)?;
                self.line(format!("if (hml_truthy({})) {{", cond));
                self.emit_scope(then_body)?;
                if let Some(else_body) = else_body {
                    self.line("} else {");
                    self.emit_scope(else_body)?;
                }
                self.line("}");
                Ok(())
            }
            Stmt::While { cond, body, .. } => {
                self.line("for (;;) {");
                self.indent();
                let cond = self.emit_expr(cond)?;
                self.line(format!("if (!hml_truthy({})) break;", cond));
                self.ctrl.push(CtrlEntry::Loop { continue_label: None });
                self.emit_scope_inline(body)?;
                self.ctrl.pop();
                self.dedent();
                self.line("}");
                Ok(())
            }
            Stmt::For { init, cond, step, body, .. } => {
                self.push_scope();
                self.line("{");
                self.indent();
                if let Some(init) = init {
                    self.emit_stmt(init)?;
                }
                self.line("for (;;) {");
                self.indent();
                if let Some(cond) = cond {
                    let cond = self.emit_expr(cond)?;
                    self.line(format!("if (!hml_truthy({})) break;", cond));
                }
                // `continue` must run the step, so it jumps to a label
                // placed just before the step expression.
                let step_label = self.fresh_label("step");
                self.ctrl.push(CtrlEntry::Loop {
                    continue_label: Some(step_label.clone()),
                });
                self.emit_scope_inline(body)?;
                self.ctrl.pop();
                self.line(format!("{}:;", step_label));
                if let Some(step) = step {
                    let tmp = self.emit_expr(step)?;
                    self.line(format!("(void){};", tmp));
                }
                self.dedent();
                self.line("}");
                self.dedent();
                self.line("}");
                self.pop_scope();
                Ok(())
            }
            Stmt::ForIn { key, value, iterable, body, .. } => {
                let iter = self.emit_expr(iterable)?;
                let it = self.fresh_tmp();
                self.line(format!("Value {} = hml_iter_new({});", it, iter));
                let k = self.fresh_tmp();
                let v = self.fresh_tmp();
                self.line(format!("Value {}, {};", k, v));
                self.line(format!("while (hml_iter_next({}, &{}, &{})) {{", it, k, v));
                self.indent();
                self.push_scope();
                if let Some(key) = key {
                    let c = format!("v_{}_{}", key, self.next_tmp_id());
                    self.line(format!("Value {} = {};", c, k));
                    self.bind_current(key, VarRef::Local(c));
                }
                let c = format!("v_{}_{}", value, self.next_tmp_id());
                self.line(format!("Value {} = {};", c, v));
                self.bind_current(value, VarRef::Local(c));
                self.ctrl.push(CtrlEntry::Loop { continue_label: None });
                for stmt in body {
                    self.emit_stmt(stmt)?;
                }
                self.ctrl.pop();
                self.pop_scope();
                self.dedent();
                self.line("}");
                Ok(())
            }
            Stmt::Block { body, .. } => {
                self.line("{");
                self.emit_scope(body)?;
                self.line("}");
                Ok(())
            }
            Stmt::Return { value, .. } => {
                let tmp = match value {
                    Some(value) => self.emit_expr(value)?,
                    None => {
                        let tmp = self.fresh_tmp();
                        self.line(format!("Value {} = hml_null();", tmp));
                        tmp
                    }
                };
                self.emit_pending_finallys(None)?;
                let (is_unit, has_defers) = {
                    let frame = self.frames.last().expect("frame");
                    (frame.is_unit, frame.has_defers)
                };
                if is_unit {
                    self.line(format!("(void){};", tmp));
                    if has_defers {
                        self.line("hml_defer_run(&__defers);");
                    }
                    self.line("return;");
                } else {
                    if has_defers {
                        self.line("hml_try_exit(&__fframe);");
                        self.line("hml_defer_run(&__defers);");
                    }
                    self.line(format!("return {};", tmp));
                }
                Ok(())
            }
            Stmt::Break { .. } => {
                let target = self.emit_pending_finallys(Some(false))?;
                match target {
                    Some(label) => self.line(format!("goto {};", label)),
                    None => self.line("break;"),
                }
                Ok(())
            }
            Stmt::Continue { .. } => {
                let target = self.emit_pending_finallys(Some(true))?;
                match target {
                    Some(label) => self.line(format!("goto {};", label)),
                    None => self.line("continue;"),
                }
                Ok(())
            }
            Stmt::Try { body, catch_name, catch_body, finally_body, .. } => self.emit_try(
                body,
                catch_name.as_deref(),
                catch_body.as_deref(),
                finally_body.as_ref(),
            ),
            Stmt::Throw { value, .. } => {
                let tmp = self.emit_expr(value)?;
                self.line(format!("hml_throw({});", tmp));
                Ok(())
            }
            Stmt::Switch { discriminant, cases, default, .. } => {
                let disc = self.emit_expr(discriminant)?;
                let end = self.fresh_label("switch_end");
                self.ctrl.push(CtrlEntry::Switch { end_label: end.clone() });
                let mut first = true;
                for case in cases {
                    let value = self.emit_expr(&case.value)?;
                    let kw = if first { "if" } else { "else if" };
                    first = false;
                    self.line(format!("{} (hml_truthy(hml_eq({}, {}))) {{", kw, disc, value));
                    self.emit_scope(&case.body)?;
                    self.line("}");
                }
                if let Some(default) = default {
                    if first {
                        self.line("{");
                    } else {
                        self.line("else {");
                    }
                    self.emit_scope(default)?;
                    self.line("}");
                }
                self.ctrl.pop();
                self.line(format!("{}:;", end));
                Ok(())
            }
            Stmt::Defer { expr, .. } => {
                // The expression (not its value) is registered: wrap it in a
                // zero-argument closure evaluated at exit time.
                let lambda = self.fresh_lambda("defer");
                let body = Rc::new(vec![Stmt::Expr {
                    expr: expr.clone(),
                    loc: stmt.loc().clone(),
                }]);
                let fn_value = self.emit_function_literal(&lambda, &[], &body, false)?;
                self.line(format!("hml_defer_push(&__defers, {});", fn_value));
                Ok(())
            }
            Stmt::Enum { name, members, .. } => {
                let tmp = self.fresh_tmp();
                self.line(format!("Value {} = hml_object_new();", tmp));
                let mut next = 0i64;
                for (member, value) in members {
                    if let Some(v) = value {
                        next = *v;
                    }
                    self.line(format!(
                        "hml_object_set({}, \"{}\", hml_i32({}));",
                        tmp, member, next
                    ));
                    next += 1;
                }
                self.bind_let_target(name)?;
                self.write_var(name, &tmp)?;
                Ok(())
            }
            Stmt::DefineObject { name, fields, .. } => {
                self.line(format!("hml_define_object(\"{}\");", name));
                for field in fields {
                    self.line(format!(
                        "hml_define_object_field(\"{}\", \"{}\", \"{}\");",
                        name, field.name, field.annotation
                    ));
                }
                Ok(())
            }
            Stmt::Import { .. } => Ok(()),
            Stmt::Export { stmt, .. } => self.emit_stmt(stmt),
            Stmt::ImportFfi { library, .. } => {
                self.line(format!("hml_ffi_load(\"{}\");", c_escape(library)));
                Ok(())
            }
            Stmt::ExternFn { name, params, .. } => {
                let tmp = self.fresh_tmp();
                self.line(format!(
                    "Value {} = hml_ffi_fn(\"{}\", {});",
                    tmp,
                    name,
                    params.len()
                ));
                self.bind_let_target(name)?;
                self.write_var(name, &tmp)?;
                Ok(())
            }
        }
    }

    /// Re-emit `finally` bodies pending on the control stack for a transfer
    /// that leaves them. `stop_at_loop`: `None` for return (runs them all),
    /// `Some(for_continue)` for break/continue (runs down to the innermost
    /// loop; break also stops at a switch). Returns the goto label when the
    /// transfer targets a switch end.
    fn emit_pending_finallys(
        &mut self,
        stop_at_loop: Option<bool>,
    ) -> Result<Option<String>, CodeGenError> {
        let mut bodies: Vec<Rc<Vec<Stmt>>> = Vec::new();
        let mut target = None;
        for entry in self.ctrl.iter().rev() {
            match entry {
                CtrlEntry::Finally(body) => bodies.push(body.clone()),
                CtrlEntry::Loop { continue_label } => {
                    if let Some(for_continue) = stop_at_loop {
                        if for_continue {
                            target = continue_label.clone();
                        }
                        break;
                    }
                }
                CtrlEntry::Switch { end_label } => {
                    if stop_at_loop == Some(false) {
                        target = Some(end_label.clone());
                        break;
                    }
                    // `continue` passes through a switch to the loop.
                }
            }
        }
        for body in bodies {
            self.push_scope();
            for stmt in body.iter() {
                self.emit_stmt(stmt)?;
            }
            self.pop_scope();
        }
        Ok(target)
    }

    fn emit_try(
        &mut self,
        body: &[Stmt],
        catch_name: Option<&str>,
        catch_body: Option<&[Stmt]>,
        finally_body: Option<&Vec<Stmt>>,
    ) -> Result<(), CodeGenError> {
        let id = self.next_tmp_id();
        let finally_rc = finally_body.map(|b| Rc::new(b.clone()));

        self.line(format!("HmlTryFrame tf_{};", id));
        self.line(format!("if (hml_try_enter(&tf_{}) == 0) {{", id));
        if let Some(f) = &finally_rc {
            self.ctrl.push(CtrlEntry::Finally(f.clone()));
        }
        self.emit_scope(body)?;
        if finally_rc.is_some() {
            self.ctrl.pop();
        }
        self.indent();
        self.line(format!("hml_try_exit(&tf_{});", id));
        self.dedent();
        self.line("} else {");
        self.indent();
        if let Some(catch_body) = catch_body {
            // A throw out of the catch body must still run the finally, so
            // the catch runs under its own frame.
            let catch_id = self.next_tmp_id();
            if finally_rc.is_some() {
                self.line(format!("HmlTryFrame tf_{};", catch_id));
                self.line(format!("if (hml_try_enter(&tf_{}) == 0) {{", catch_id));
                self.indent();
            }
            self.push_scope();
            if let Some(f) = &finally_rc {
                self.ctrl.push(CtrlEntry::Finally(f.clone()));
            }
            if let Some(name) = catch_name {
                let c = format!("v_{}_{}", name, self.next_tmp_id());
                self.line(format!("Value {} = hml_catch_value();", c));
                self.bind_current(name, VarRef::Local(c));
            }
            for stmt in catch_body {
                self.emit_stmt(stmt)?;
            }
            if finally_rc.is_some() {
                self.ctrl.pop();
            }
            self.pop_scope();
            if let Some(finally_body) = finally_body
                && finally_rc.is_some()
            {
                self.line(format!("hml_try_exit(&tf_{});", catch_id));
                self.dedent();
                self.line("} else {");
                self.indent();
                self.push_scope();
                for stmt in finally_body {
                    self.emit_stmt(stmt)?;
                }
                self.pop_scope();
                self.line("hml_rethrow();");
                self.dedent();
                self.line("}");
            }
        } else {
            // try/finally with no catch: run the finally, then rethrow.
            if let Some(finally_body) = finally_body {
                self.push_scope();
                for stmt in finally_body {
                    self.emit_stmt(stmt)?;
                }
                self.pop_scope();
            }
            self.line("hml_rethrow();");
        }
        self.dedent();
        self.line("}");
        // Normal completion path (and after a completed catch).
        if let Some(finally_body) = finally_body {
            self.push_scope();
            for stmt in finally_body {
                self.emit_stmt(stmt)?;
            }
            self.pop_scope();
        }
        Ok(())
    }

    fn emit_scope(&mut self, body: &[Stmt]) -> Result<(), CodeGenError> {
        self.indent();
        self.push_scope();
        for stmt in body {
            self.emit_stmt(stmt)?;
        }
        self.pop_scope();
        self.dedent();
        Ok(())
    }

    fn emit_scope_inline(&mut self, body: &[Stmt]) -> Result<(), CodeGenError> {
        self.push_scope();
        for stmt in body {
            self.emit_stmt(stmt)?;
        }
        self.pop_scope();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn emit_expr(&mut self, expr: &Expr) -> Result<String, CodeGenError> {
        match expr {
            Expr::Int { bits, kind, .. } => {
                let tmp = self.fresh_tmp();
                let ctor = if kind.is_signed() {
                    format!("hml_{}((int64_t){}ll)", kind.name(), *bits as i64)
                } else {
                    format!("hml_{}((uint64_t){}ull)", kind.name(), bits)
                };
                self.line(format!("Value {} = {};", tmp, ctor));
                Ok(tmp)
            }
            Expr::Float { value, is_f32, .. } => {
                let tmp = self.fresh_tmp();
                let ctor = if *is_f32 {
                    format!("hml_f32({:?}f)", *value as f32)
                } else {
                    format!("hml_f64({:?})", value)
                };
                self.line(format!("Value {} = {};", tmp, ctor));
                Ok(tmp)
            }
            Expr::Bool { value, .. } => {
                let tmp = self.fresh_tmp();
                self.line(format!("Value {} = hml_bool({});", tmp, *value as u8));
                Ok(tmp)
            }
            Expr::Str { value, .. } => {
                let tmp = self.fresh_tmp();
                self.line(format!(
                    "Value {} = hml_string(\"{}\");",
                    tmp,
                    c_escape(value)
                ));
                Ok(tmp)
            }
            Expr::Rune { value, .. } => {
                let tmp = self.fresh_tmp();
                self.line(format!("Value {} = hml_rune({}u);", tmp, *value as u32));
                Ok(tmp)
            }
            Expr::Null { .. } => {
                let tmp = self.fresh_tmp();
                self.line(format!("Value {} = hml_null();", tmp));
                Ok(tmp)
            }
            Expr::Ident { name, .. } => {
                let tmp = self.fresh_tmp();
                let read = self.read_var(name)?;
                self.line(format!("Value {} = {};", tmp, read));
                Ok(tmp)
            }
            Expr::Binary { op, lhs, rhs, .. } => self.emit_binary(*op, lhs, rhs),
            Expr::Unary { op, operand, .. } => {
                let operand = self.emit_expr(operand)?;
                let tmp = self.fresh_tmp();
                let call = match op {
                    UnaryOp::Neg => "hml_neg",
                    UnaryOp::Not => "hml_not",
                    UnaryOp::BitNot => "hml_bnot",
                };
                self.line(format!("Value {} = {}({});", tmp, call, operand));
                Ok(tmp)
            }
            Expr::Ternary { cond, then_expr, else_expr, .. } => {
                let cond = self.emit_expr(cond)?;
                let tmp = self.fresh_tmp();
                self.line(format!("Value {};", tmp));
                self.line(format!("if (hml_truthy({})) {{", cond));
                self.indent();
                let t = self.emit_expr(then_expr)?;
                self.line(format!("{} = {};", tmp, t));
                self.dedent();
                self.line("} else {");
                self.indent();
                let e = self.emit_expr(else_expr)?;
                self.line(format!("{} = {};", tmp, e));
                self.dedent();
                self.line("}");
                Ok(tmp)
            }
            Expr::Call { callee, args, .. } => self.emit_call(callee, args),
            Expr::Assign { target, value, .. } => {
                let tmp = self.emit_expr(value)?;
                self.emit_store(target, &tmp)?;
                Ok(tmp)
            }
            Expr::Property { object, name, .. } => {
                let object = self.emit_expr(object)?;
                let tmp = self.fresh_tmp();
                self.line(format!(
                    "Value {} = hml_get_property({}, \"{}\");",
                    tmp, object, name
                ));
                Ok(tmp)
            }
            Expr::OptionalProperty { object, name, .. } => {
                let object = self.emit_expr(object)?;
                let tmp = self.fresh_tmp();
                self.line(format!("Value {};", tmp));
                self.line(format!("if (hml_is_null({})) {{", object));
                self.indent();
                self.line(format!("{} = hml_null();", tmp));
                self.dedent();
                self.line("} else {");
                self.indent();
                self.line(format!(
                    "{} = hml_get_property({}, \"{}\");",
                    tmp, object, name
                ));
                self.dedent();
                self.line("}");
                Ok(tmp)
            }
            Expr::Index { object, index, .. } => {
                let object = self.emit_expr(object)?;
                let index = self.emit_expr(index)?;
                let tmp = self.fresh_tmp();
                self.line(format!("Value {} = hml_index({}, {});", tmp, object, index));
                Ok(tmp)
            }
            Expr::Array { elements, .. } => {
                let tmp = self.fresh_tmp();
                self.line(format!("Value {} = hml_array_new({});", tmp, elements.len()));
                for element in elements {
                    let e = self.emit_expr(element)?;
                    self.line(format!("hml_array_push({}, {});", tmp, e));
                }
                Ok(tmp)
            }
            Expr::Object { entries, .. } => {
                let tmp = self.fresh_tmp();
                self.line(format!("Value {} = hml_object_new();", tmp));
                for (key, value) in entries {
                    let v = self.emit_expr(value)?;
                    self.line(format!(
                        "hml_object_set({}, \"{}\", {});",
                        tmp,
                        c_escape(key),
                        v
                    ));
                }
                Ok(tmp)
            }
            Expr::Function { params, body, is_async, .. } => {
                let lambda = self.fresh_lambda("lambda");
                let fn_value = self.emit_function_literal(&lambda, params, body, *is_async)?;
                let tmp = self.fresh_tmp();
                self.line(format!("Value {} = {};", tmp, fn_value));
                Ok(tmp)
            }
            Expr::IncDec { target, increment, prefix, .. } => {
                let old = self.emit_expr(target)?;
                let new = self.fresh_tmp();
                let op = if *increment { "hml_add" } else { "hml_sub" };
                self.line(format!("Value {} = {}({}, hml_i32(1));", new, op, old));
                self.emit_store(target, &new)?;
                Ok(if *prefix { new } else { old })
            }
            Expr::Interp { parts, .. } => {
                let tmp = self.fresh_tmp();
                self.line(format!("Value {} = hml_string(\"\");", tmp));
                for part in parts {
                    match part {
                        InterpPart::Lit(text) => {
                            self.line(format!(
                                "{0} = hml_concat({0}, hml_string(\"{1}\"));",
                                tmp,
                                c_escape(text)
                            ));
                        }
                        InterpPart::Expr(expr) => {
                            let e = self.emit_expr(expr)?;
                            self.line(format!(
                                "{0} = hml_concat({0}, hml_to_display({1}));",
                                tmp, e
                            ));
                        }
                    }
                }
                Ok(tmp)
            }
            Expr::Await { expr, .. } => {
                let e = self.emit_expr(expr)?;
                let tmp = self.fresh_tmp();
                self.line(format!("Value {} = hml_await({});", tmp, e));
                Ok(tmp)
            }
        }
    }

    fn emit_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<String, CodeGenError> {
        match op {
            BinaryOp::And | BinaryOp::Or => {
                let l = self.emit_expr(lhs)?;
                let tmp = self.fresh_tmp();
                self.line(format!("Value {} = {};", tmp, l));
                let test = if op == BinaryOp::And {
                    format!("hml_truthy({})", l)
                } else {
                    format!("!hml_truthy({})", l)
                };
                self.line(format!("if ({}) {{", test));
                self.indent();
                let r = self.emit_expr(rhs)?;
                self.line(format!("{} = {};", tmp, r));
                self.dedent();
                self.line("}");
                Ok(tmp)
            }
            BinaryOp::NullCoalesce => {
                let l = self.emit_expr(lhs)?;
                let tmp = self.fresh_tmp();
                self.line(format!("Value {} = {};", tmp, l));
                self.line(format!("if (hml_is_null({})) {{", l));
                self.indent();
                let r = self.emit_expr(rhs)?;
                self.line(format!("{} = {};", tmp, r));
                self.dedent();
                self.line("}");
                Ok(tmp)
            }
            _ => {
                let l = self.emit_expr(lhs)?;
                let r = self.emit_expr(rhs)?;
                let call = match op {
                    BinaryOp::Add => "hml_add",
                    BinaryOp::Sub => "hml_sub",
                    BinaryOp::Mul => "hml_mul",
                    BinaryOp::Div => "hml_div",
                    BinaryOp::Mod => "hml_mod",
                    BinaryOp::Eq => "hml_eq",
                    BinaryOp::Ne => "hml_ne",
                    BinaryOp::Lt => "hml_lt",
                    BinaryOp::Le => "hml_le",
                    BinaryOp::Gt => "hml_gt",
                    BinaryOp::Ge => "hml_ge",
                    BinaryOp::BitAnd => "hml_band",
                    BinaryOp::BitOr => "hml_bor",
                    BinaryOp::BitXor => "hml_bxor",
                    BinaryOp::Shl => "hml_shl",
                    BinaryOp::Shr => "hml_shr",
                    BinaryOp::And | BinaryOp::Or | BinaryOp::NullCoalesce => unreachable!(),
                };
                let tmp = self.fresh_tmp();
                self.line(format!("Value {} = {}({}, {});", tmp, call, l, r));
                Ok(tmp)
            }
        }
    }

    fn emit_call(&mut self, callee: &Expr, args: &[Expr]) -> Result<String, CodeGenError> {
        if let Expr::Ident { name, .. } = callee {
            match self.resolve_anywhere(name) {
                Some(VarRef::Global(global)) => {
                    // Known top-level functions get a direct typed call;
                    // async functions go through hml_call so the runtime
                    // can spawn a task.
                    if let Some(info) = self.known_fns.get(&global).cloned()
                        && !info.is_async
                    {
                        let mut arg_tmps = Vec::new();
                        for arg in args.iter().take(info.arity) {
                            arg_tmps.push(self.emit_expr(arg)?);
                        }
                        // Excess arguments still evaluate left-to-right.
                        for arg in args.iter().skip(info.arity) {
                            let t = self.emit_expr(arg)?;
                            self.line(format!("(void){};", t));
                        }
                        let mut call = format!("{}(NULL", info.c_name);
                        for i in 0..info.arity {
                            match arg_tmps.get(i) {
                                Some(tmp) => write!(call, ", {}", tmp)?,
                                None => write!(call, ", hml_undef()")?,
                            }
                        }
                        call.push(')');
                        let tmp = self.fresh_tmp();
                        self.line(format!("Value {} = {};", tmp, call));
                        return Ok(tmp);
                    }
                }
                // The builtin table is consulted only when no binding at any
                // scope shadows the name.
                None if BUILTIN_NAMES.contains(&name.as_str()) => {
                    return self.emit_builtin_call(name, args);
                }
                _ => {}
            }
        }
        // Method-style calls dispatch through the runtime with the receiver.
        if let Expr::Property { object, name, .. } = callee {
            let recv = self.emit_expr(object)?;
            let argv = self.emit_arg_array(args)?;
            let tmp = self.fresh_tmp();
            self.line(format!(
                "Value {} = hml_call_method({}, \"{}\", {}, {});",
                tmp,
                recv,
                name,
                argv,
                args.len()
            ));
            return Ok(tmp);
        }
        let callee = self.emit_expr(callee)?;
        let argv = self.emit_arg_array(args)?;
        let tmp = self.fresh_tmp();
        self.line(format!(
            "Value {} = hml_call({}, {}, {});",
            tmp,
            callee,
            argv,
            args.len()
        ));
        Ok(tmp)
    }

    fn emit_builtin_call(&mut self, name: &str, args: &[Expr]) -> Result<String, CodeGenError> {
        let argv = self.emit_arg_array(args)?;
        let tmp = self.fresh_tmp();
        self.line(format!(
            "Value {} = hml_builtin_call(\"{}\", {}, {});",
            tmp,
            name,
            argv,
            args.len()
        ));
        Ok(tmp)
    }

    fn emit_arg_array(&mut self, args: &[Expr]) -> Result<String, CodeGenError> {
        let mut tmps = Vec::new();
        for arg in args {
            tmps.push(self.emit_expr(arg)?);
        }
        let argv = format!("argv_{}", self.next_tmp_id());
        if tmps.is_empty() {
            self.line(format!("Value *{} = NULL;", argv));
        } else {
            self.line(format!("Value {}[{}];", argv, tmps.len()));
            for (i, tmp) in tmps.iter().enumerate() {
                self.line(format!("{}[{}] = {};", argv, i, tmp));
            }
        }
        Ok(argv)
    }

    fn emit_store(&mut self, target: &Expr, value: &str) -> Result<(), CodeGenError> {
        match target {
            Expr::Ident { name, .. } => self.write_var(name, value),
            Expr::Property { object, name, .. } => {
                let object = self.emit_expr(object)?;
                self.line(format!(
                    "hml_set_property({}, \"{}\", {});",
                    object, name, value
                ));
                Ok(())
            }
            Expr::Index { object, index, .. } => {
                let object = self.emit_expr(object)?;
                let index = self.emit_expr(index)?;
                self.line(format!("hml_index_set({}, {}, {});", object, index, value));
                Ok(())
            }
            other => Err(CodeGenError::Logic(format!(
                "invalid assignment target at {}",
                other.loc()
            ))),
        }
    }

    fn apply_annotation(
        &mut self,
        tmp: String,
        annotation: &Option<TypeAnnotation>,
    ) -> Result<String, CodeGenError> {
        if let Some(ann) = annotation {
            let coerced = self.fresh_tmp();
            self.line(format!("Value {} = hml_coerce({}, \"{}\");", coerced, tmp, ann));
            Ok(coerced)
        } else {
            Ok(tmp)
        }
    }

    // ------------------------------------------------------------------
    // Variable binding and resolution
    // ------------------------------------------------------------------

    fn bind_current(&mut self, name: &str, var: VarRef) {
        self.frames
            .last_mut()
            .expect("frame")
            .scopes
            .last_mut()
            .expect("scope")
            .insert(name.to_string(), var);
    }

    /// Register a `let`-style binding target. Captured names map to their
    /// env slot, top-of-unit names become globals, anything else becomes a
    /// fresh C local (re-lets shadow with a new variable).
    fn bind_let_target(&mut self, name: &str) -> Result<(), CodeGenError> {
        let frame = self.frames.last().expect("frame");
        if frame.is_unit && frame.scopes.len() == 1 {
            let global = self.mangle_top_level(name, false, false);
            writeln!(self.globals, "static Value {};", global)?;
            self.bind_current(name, VarRef::Global(global));
            return Ok(());
        }
        if !frame.is_unit
            && let Some(&slot) = frame.captured.get(name)
        {
            self.bind_current(name, VarRef::EnvSlot(slot));
            return Ok(());
        }
        let c = format!("v_{}_{}", name, self.next_tmp_id());
        self.line(format!("Value {} = hml_null();", c));
        self.bind_current(name, VarRef::Local(c));
        Ok(())
    }

    /// Look a name up through every scope of every frame, innermost first.
    /// A `Local` in an enclosing function is unreachable from here and
    /// reports as `None`; capture analysis prevents that case for names a
    /// closure actually uses.
    fn resolve_anywhere(&self, name: &str) -> Option<VarRef> {
        for (i, frame) in self.frames.iter().enumerate().rev() {
            let innermost = i == self.frames.len() - 1;
            for scope in frame.scopes.iter().rev() {
                match scope.get(name) {
                    Some(var @ VarRef::Global(_)) => return Some(var.clone()),
                    Some(var) if innermost => return Some(var.clone()),
                    Some(VarRef::EnvSlot(_)) => return Some(VarRef::EnvSlot(usize::MAX)),
                    Some(VarRef::Local(_)) => return None,
                    None => {}
                }
            }
        }
        None
    }

    /// Resolve a read. Enclosing function frames are reached through the
    /// environment chain; depth counts intervening env-bearing frames.
    fn read_var(&mut self, name: &str) -> Result<String, CodeGenError> {
        let innermost = self.frames.last().expect("frame");
        for scope in innermost.scopes.iter().rev() {
            if let Some(var) = scope.get(name) {
                return Ok(match var {
                    VarRef::Local(c) => c.clone(),
                    VarRef::Global(g) => g.clone(),
                    VarRef::EnvSlot(slot) => {
                        format!("hml_env_local_get(frame_env, {})", slot)
                    }
                });
            }
        }
        let mut depth = 0usize;
        for frame in self.frames.iter().rev().skip(1) {
            for scope in frame.scopes.iter().rev() {
                match scope.get(name) {
                    Some(VarRef::EnvSlot(slot)) => {
                        return Ok(format!("hml_env_get(env, {}, {})", depth, slot));
                    }
                    Some(VarRef::Global(g)) => return Ok(g.clone()),
                    Some(VarRef::Local(_)) => {
                        return Err(CodeGenError::Logic(format!(
                            "variable '{}' crosses a function boundary without being captured",
                            name
                        )));
                    }
                    None => {}
                }
            }
            if frame.has_env {
                depth += 1;
            }
            if frame.is_unit {
                break;
            }
        }
        if BUILTIN_NAMES.contains(&name) {
            return Ok(format!("hml_builtin_ref(\"{}\")", name));
        }
        // Unbound: the runtime throws a NameError when this evaluates.
        Ok(format!("hml_unbound(\"{}\")", name))
    }

    fn write_var(&mut self, name: &str, value: &str) -> Result<(), CodeGenError> {
        let innermost = self.frames.last().expect("frame");
        let mut found = None;
        for scope in innermost.scopes.iter().rev() {
            if let Some(var) = scope.get(name) {
                found = Some(var.clone());
                break;
            }
        }
        if let Some(var) = found {
            match var {
                VarRef::Local(c) => self.line(format!("{} = {};", c, value)),
                VarRef::Global(g) => self.line(format!("{} = {};", g, value)),
                VarRef::EnvSlot(slot) => {
                    self.line(format!("hml_env_local_set(frame_env, {}, {});", slot, value));
                }
            }
            return Ok(());
        }
        let mut depth = 0usize;
        for i in (0..self.frames.len().saturating_sub(1)).rev() {
            let frame = &self.frames[i];
            let mut found = None;
            for scope in frame.scopes.iter().rev() {
                if let Some(var) = scope.get(name) {
                    found = Some(var.clone());
                    break;
                }
            }
            match found {
                Some(VarRef::EnvSlot(slot)) => {
                    self.line(format!("hml_env_set(env, {}, {}, {});", depth, slot, value));
                    return Ok(());
                }
                Some(VarRef::Global(g)) => {
                    self.line(format!("{} = {};", g, value));
                    return Ok(());
                }
                Some(VarRef::Local(_)) => {
                    return Err(CodeGenError::Logic(format!(
                        "assignment to '{}' crosses a function boundary without capture",
                        name
                    )));
                }
                None => {}
            }
            if frame.has_env {
                depth += 1;
            }
            if frame.is_unit {
                break;
            }
        }
        self.line(format!("hml_assign_unbound(\"{}\", {});", name, value));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Buffer plumbing
    // ------------------------------------------------------------------

    fn line(&mut self, text: impl AsRef<str>) {
        let indent = *self.indents.last().unwrap_or(&1);
        let buf = self.bufs.last_mut().expect("emission buffer");
        for _ in 0..indent {
            buf.push_str("    ");
        }
        buf.push_str(text.as_ref());
        buf.push('\n');
    }

    fn indent(&mut self) {
        if let Some(i) = self.indents.last_mut() {
            *i += 1;
        }
    }

    fn dedent(&mut self) {
        if let Some(i) = self.indents.last_mut() {
            *i = i.saturating_sub(1);
        }
    }

    fn push_scope(&mut self) {
        self.frames
            .last_mut()
            .expect("frame")
            .scopes
            .push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.frames.last_mut().expect("frame").scopes.pop();
    }

    fn next_tmp_id(&mut self) -> u32 {
        self.tmp += 1;
        self.tmp
    }

    fn fresh_tmp(&mut self) -> String {
        format!("t{}", self.next_tmp_id())
    }

    fn fresh_label(&mut self, base: &str) -> String {
        self.label += 1;
        format!("__{}_{}", base, self.label)
    }

    fn fresh_lambda(&mut self, hint: &str) -> String {
        self.lambda += 1;
        format!("{}lambda_{}_{}", self.unit_prefix, self.lambda, hint)
    }
}

/// Names bindable anywhere in a function body, not descending into nested
/// function literals (their bindings are their own).
fn collect_bindable(stmts: &[Stmt], out: &mut BTreeSet<String>) {
    for stmt in stmts {
        walk_stmt_shallow(stmt, &mut |s| match s {
            Stmt::Let { name, .. }
            | Stmt::Const { name, .. }
            | Stmt::Enum { name, .. }
            | Stmt::DefineObject { name, .. }
            | Stmt::ExternFn { name, .. } => {
                out.insert(name.clone());
            }
            Stmt::ForIn { key, value, .. } => {
                if let Some(key) = key {
                    out.insert(key.clone());
                }
                out.insert(value.clone());
            }
            Stmt::Try { catch_name: Some(name), .. } => {
                out.insert(name.clone());
            }
            Stmt::Import { names, .. } => out.extend(names.iter().cloned()),
            _ => {}
        });
    }
}

/// Free variables of every function literal whose defining scope is this
/// body. Nested literals are covered transitively by `function_free_vars`.
/// `defer` expressions count too: they lower to synthesized zero-argument
/// closures, so everything they reference must live in the frame env.
fn collect_closure_free_vars(stmts: &[Stmt], out: &mut BTreeSet<String>) {
    for stmt in stmts {
        visit_stmt_exprs(stmt, &mut |expr| {
            if let Expr::Function { params, body, .. } = expr {
                out.extend(function_free_vars(params, body));
                false // literal handled; do not descend into it
            } else {
                true
            }
        });
        walk_stmt_shallow(stmt, &mut |s| {
            if let Stmt::Defer { expr, loc } = s {
                let wrapped = Stmt::Expr { expr: expr.clone(), loc: loc.clone() };
                out.extend(function_free_vars(&[], std::slice::from_ref(&wrapped)));
            }
        });
    }
}

fn body_has_defer(stmts: &[Stmt]) -> bool {
    let mut found = false;
    for stmt in stmts {
        walk_stmt_shallow(stmt, &mut |s| {
            if matches!(s, Stmt::Defer { .. }) {
                found = true;
            }
        });
    }
    found
}

/// Visit a statement and its nested statements, not descending into
/// function literals.
fn walk_stmt_shallow(stmt: &Stmt, f: &mut dyn FnMut(&Stmt)) {
    f(stmt);
    let mut walk_all = |bodies: &[&Vec<Stmt>], f: &mut dyn FnMut(&Stmt)| {
        for body in bodies {
            for s in body.iter() {
                walk_stmt_shallow(s, f);
            }
        }
    };
    match stmt {
        Stmt::If { then_body, else_body, .. } => {
            walk_all(&[then_body], f);
            if let Some(b) = else_body {
                walk_all(&[b], f);
            }
        }
        Stmt::While { body, .. } | Stmt::Block { body, .. } | Stmt::ForIn { body, .. } => {
            walk_all(&[body], f);
        }
        Stmt::For { init, body, .. } => {
            if let Some(init) = init {
                walk_stmt_shallow(init, f);
            }
            walk_all(&[body], f);
        }
        Stmt::Try { body, catch_body, finally_body, .. } => {
            walk_all(&[body], f);
            if let Some(b) = catch_body {
                walk_all(&[b], f);
            }
            if let Some(b) = finally_body {
                walk_all(&[b], f);
            }
        }
        Stmt::Switch { cases, default, .. } => {
            for case in cases {
                walk_all(&[&case.body], f);
            }
            if let Some(b) = default {
                walk_all(&[b], f);
            }
        }
        Stmt::Export { stmt, .. } => walk_stmt_shallow(stmt, f),
        _ => {}
    }
}

/// Visit every expression in a statement tree. The callback returns whether
/// to descend into the visited expression's children.
fn visit_stmt_exprs(stmt: &Stmt, f: &mut dyn FnMut(&Expr) -> bool) {
    walk_stmt_shallow(stmt, &mut |s| {
        let exprs: Vec<&Expr> = match s {
            Stmt::Let { value, .. } | Stmt::Const { value, .. } => vec![value],
            Stmt::Expr { expr, .. } | Stmt::Throw { value: expr, .. } | Stmt::Defer { expr, .. } => {
                vec![expr]
            }
            Stmt::If { cond, .. } | Stmt::While { cond, .. } => vec![cond],
            Stmt::For { cond, step, .. } => {
                cond.iter().chain(step.iter()).collect()
            }
            Stmt::ForIn { iterable, .. } => vec![iterable],
            Stmt::Return { value, .. } => value.iter().collect(),
            Stmt::Switch { discriminant, cases, .. } => {
                let mut v = vec![discriminant];
                v.extend(cases.iter().map(|c| &c.value));
                v
            }
            _ => Vec::new(),
        };
        for expr in exprs {
            visit_expr_tree(expr, f);
        }
    });
}

fn visit_expr_tree(expr: &Expr, f: &mut dyn FnMut(&Expr) -> bool) {
    if !f(expr) {
        return;
    }
    match expr {
        Expr::Binary { lhs, rhs, .. } => {
            visit_expr_tree(lhs, f);
            visit_expr_tree(rhs, f);
        }
        Expr::Unary { operand, .. } => visit_expr_tree(operand, f),
        Expr::Ternary { cond, then_expr, else_expr, .. } => {
            visit_expr_tree(cond, f);
            visit_expr_tree(then_expr, f);
            visit_expr_tree(else_expr, f);
        }
        Expr::Call { callee, args, .. } => {
            visit_expr_tree(callee, f);
            for a in args {
                visit_expr_tree(a, f);
            }
        }
        Expr::Assign { target, value, .. } => {
            visit_expr_tree(target, f);
            visit_expr_tree(value, f);
        }
        Expr::Property { object, .. } | Expr::OptionalProperty { object, .. } => {
            visit_expr_tree(object, f);
        }
        Expr::Index { object, index, .. } => {
            visit_expr_tree(object, f);
            visit_expr_tree(index, f);
        }
        Expr::Array { elements, .. } => {
            for e in elements {
                visit_expr_tree(e, f);
            }
        }
        Expr::Object { entries, .. } => {
            for (_, e) in entries {
                visit_expr_tree(e, f);
            }
        }
        Expr::Function { params, body, .. } => {
            for p in params {
                if let Some(d) = &p.default {
                    visit_expr_tree(d, f);
                }
            }
            for s in body.iter() {
                visit_stmt_exprs(s, f);
            }
        }
        Expr::IncDec { target, .. } => visit_expr_tree(target, f),
        Expr::Interp { parts, .. } => {
            for part in parts {
                if let InterpPart::Expr(e) = part {
                    visit_expr_tree(e, f);
                }
            }
        }
        Expr::Await { expr, .. } => visit_expr_tree(expr, f),
        _ => {}
    }
}

fn c_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;
    use std::path::PathBuf;

    fn generate(source: &str) -> String {
        let main_file = PathBuf::from("main.hml");
        let program = parse_source(source, &main_file).expect("parse");
        let registry = ModuleRegistry::new(PathBuf::from("."), None);
        let mut codegen = CodeGen::new();
        codegen
            .generate(&program, &main_file, &registry)
            .expect("codegen")
    }

    #[test]
    fn test_top_level_symbols_get_main_prefix() {
        let c = generate("let open = fn() { return 1; }; let kill = 2;");
        // User names that collide with libc must be prefixed.
        assert!(c.contains("static Value _main_fn_open(HmlEnv *env)"));
        assert!(c.contains("static Value _main_v_kill;"));
        assert!(!c.contains("\nValue open("));
    }

    #[test]
    fn test_trampoline_emitted_for_every_function() {
        let c = generate("let f = fn(a, b) { return a; };");
        assert!(c.contains("_main_fn_f__tramp(HmlEnv *env, Value *argv, int argc)"));
        assert!(c.contains("argc > 0 ? argv[0] : hml_undef()"));
        assert!(c.contains("argc > 1 ? argv[1] : hml_undef()"));
    }

    #[test]
    fn test_direct_call_for_known_function() {
        let c = generate("let fib = fn(n) { return fib(n); }; fib(10);");
        // Top-level functions pass NULL for the environment.
        assert!(c.contains("_main_fn_fib(NULL, "));
    }

    #[test]
    fn test_closure_env_allocated_for_captured_vars() {
        let c = generate("let make = fn() { let c = 0; return fn() { c = c + 1; }; };");
        assert!(c.contains("HmlEnv *frame_env = hml_env_alloc(env, 1);"));
        assert!(c.contains("hml_env_local_set(frame_env, 0"));
        // The inner closure reaches the cell through the chain at depth 0.
        assert!(c.contains("hml_env_get(env, 0, 0)") || c.contains("hml_env_set(env, 0, 0,"));
    }

    #[test]
    fn test_closures_share_one_frame_env() {
        let c = generate(
            "let make = fn() { let a = 1; let b = 2; \
             let f = fn() { return a; }; let g = fn() { return a + b; }; return f; };",
        );
        // One allocation holding the union of closure-referenced variables.
        assert_eq!(c.matches("hml_env_alloc(env, 2)").count(), 1);
    }

    #[test]
    fn test_defer_runs_on_every_exit() {
        let c = generate("let f = fn() { defer print(1); return 2; };");
        // Teardown on the return path, the fallthrough path, and the
        // exception path (function try frame + rethrow).
        assert!(c.matches("hml_defer_run(&__defers);").count() >= 3);
        assert!(c.contains("hml_rethrow();"));
        assert!(c.contains("hml_defer_push(&__defers,"));
    }

    #[test]
    fn test_defer_captures_locals_through_frame_env() {
        let c = generate("let f = fn() { let x = 1; defer print(x); return x; };");
        // The synthesized defer closure reaches x through the frame env.
        assert!(c.contains("hml_env_alloc(env, 1)"));
        assert!(c.contains("hml_env_get(env, 0, 0)"));
    }

    #[test]
    fn test_builtin_dispatch_and_shadowing() {
        let c = generate("print(1); let print = fn(x) { return x; }; print(2);");
        // Before shadowing: builtin dispatch. After: the user binding.
        assert!(c.contains("hml_builtin_call(\"print\""));
        assert!(c.contains("_main_fn_print(NULL, "));
    }

    #[test]
    fn test_switch_break_uses_label_and_continue_reaches_loop() {
        let c = generate("while (1) { switch (2) { case 1: break; default: continue; } }");
        assert!(c.contains("goto __switch_end_"));
        assert!(c.contains("continue;"));
    }

    #[test]
    fn test_for_continue_jumps_to_step() {
        let c = generate("for (let i = 0; i < 3; i++) { if (i == 1) { continue; } print(i); }");
        assert!(c.contains("goto __step_"));
        assert!(c.contains("__step_1:;"));
    }

    #[test]
    fn test_finally_reruns_on_return() {
        let c = generate(
            "let f = fn() { try { return 1; } finally { print(\"F\"); } };",
        );
        // The finally body appears on the return path as well as the
        // normal and exceptional paths.
        assert!(c.matches("hml_builtin_call(\"print\"").count() >= 2);
        assert!(c.contains("hml_rethrow();"));
    }

    #[test]
    fn test_module_symbols_use_module_prefix() {
        use tempfile::TempDir;
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("m.hml"),
            "export let x = 41; export let double = fn(n) { return n * 2; };",
        )
        .unwrap();
        let main_file = dir.path().join("main.hml");
        let source = "import { x, double } from \"./m\"; print(double(x));";
        std::fs::write(&main_file, source).unwrap();
        let program = parse_source(source, &main_file).expect("parse");
        let mut registry = ModuleRegistry::new(dir.path().to_path_buf(), None);
        let path = registry.resolve(None, "./m").unwrap();
        registry.compile(&path).unwrap();
        let mut codegen = CodeGen::new();
        let c = codegen
            .generate(&program, &main_file, &registry)
            .expect("codegen");
        assert!(c.contains("static Value _mod0_x;"));
        assert!(c.contains("static Value _mod0_double(HmlEnv *env, Value p_n)"));
        // Imported function calls resolve to the source module's name.
        assert!(c.contains("_mod0_double(NULL, "));
        // Module init runs before main init.
        let mod_init = c.find("_mod0_init();").expect("module init call");
        let main_init = c.find("_main_init();").expect("main init call");
        assert!(mod_init < main_init);
    }

    #[test]
    fn test_interpolation_concatenates_display_strings() {
        let c = generate(r#"let n = 3; let s = "count: ${n * 2}";"#);
        assert!(c.contains("hml_to_display("));
        assert!(c.contains("hml_concat("));
    }

    #[test]
    fn test_annotation_coercion_emitted() {
        let c = generate("let a: array<i32> = [1];");
        assert!(c.contains("hml_coerce("));
        assert!(c.contains("array<i32>"));
    }

    #[test]
    fn test_method_call_dispatch() {
        let c = generate("let c = channel(0); c.send(42);");
        assert!(c.contains("hml_call_method("));
        assert!(c.contains("\"send\""));
    }

    #[test]
    fn test_enum_at_top_level_becomes_global() {
        let c = generate("enum Color { Red, Green = 5, Blue } print(Color.Green);");
        assert!(c.contains("static Value _main_v_Color;"));
        assert!(c.contains("hml_object_set(t1, \"Green\", hml_i32(5));"));
        assert!(c.contains("hml_object_set(t1, \"Blue\", hml_i32(6));"));
    }

    #[test]
    fn test_string_escapes() {
        let c = generate("let s = \"a\\\"b\\n\";");
        assert!(c.contains("hml_string(\"a\\\"b\\n\")"));
    }
}
