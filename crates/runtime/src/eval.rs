//! The evaluator: a direct recursive tree walk
//!
//! Statements return `Result<Control, Thrown>`; expressions return
//! `Result<Value, Thrown>`. Throws ride `?` until a `try` catches them or
//! they leave the top level.
//!
//! Scoping: `if`/`while`/`for`/block bodies run in a child environment, and
//! a `let` that re-declares a name already bound in the innermost scope
//! layers a fresh environment instead of overwriting the cell - closures
//! capture the binding, not the name. Scopes get the cycle-break pass as
//! they exit.

use crate::builtins;
use crate::interp::{release_env_chain, Interp, MAX_CALL_DEPTH};
use crate::tasks;
use hemlock_compiler::ast::{
    BinaryOp, Expr, InterpPart, Param, SourceLocation, Stmt, SwitchCase,
};
use hemlock_core::arith;
use hemlock_core::control::{
    self, name_error, runtime_error, type_error, Control, EvalResult, ExecResult, Thrown,
};
use hemlock_core::env::{AssignOutcome, Env};
use hemlock_core::value::{FunctionCell, FunctionKind, ObjectCell, Value};
use std::rc::Rc;

/// Per-call bookkeeping: the LIFO defer list. Each entry keeps the
/// expression and the environment it was registered in.
pub struct FrameCtx {
    defers: Vec<(Expr, Rc<Env>)>,
}

impl FrameCtx {
    pub fn new() -> Self {
        FrameCtx { defers: Vec::new() }
    }
}

impl Default for FrameCtx {
    fn default() -> Self {
        Self::new()
    }
}

impl Interp {
    pub(crate) fn exec_stmts(
        self: &Rc<Self>,
        stmts: &[Stmt],
        env: &mut Rc<Env>,
        frame: &mut FrameCtx,
    ) -> ExecResult {
        for stmt in stmts {
            match self.exec_stmt(stmt, env, frame)? {
                Control::Normal => {}
                signal => return Ok(signal),
            }
        }
        Ok(Control::Normal)
    }

    /// Run a statement list in a child scope, releasing it on the way out
    fn exec_scoped(
        self: &Rc<Self>,
        stmts: &[Stmt],
        env: &Rc<Env>,
        frame: &mut FrameCtx,
    ) -> ExecResult {
        let mut child = Env::with_parent(env.clone());
        let result = self.exec_stmts(stmts, &mut child, frame);
        release_env_chain(&child, Some(env));
        result
    }

    fn exec_stmt(
        self: &Rc<Self>,
        stmt: &Stmt,
        env: &mut Rc<Env>,
        frame: &mut FrameCtx,
    ) -> ExecResult {
        match stmt {
            Stmt::Let { name, annotation, value, loc } => {
                self.exec_binding(name, annotation.as_ref(), value, false, env, loc)
            }
            Stmt::Const { name, annotation, value, loc } => {
                self.exec_binding(name, annotation.as_ref(), value, true, env, loc)
            }
            Stmt::Expr { expr, .. } => {
                let value = self.eval_expr(expr, env)?;
                *self.last_value.borrow_mut() = value;
                Ok(Control::Normal)
            }
            Stmt::If { cond, then_body, else_body, .. } => {
                if self.eval_expr(cond, env)?.is_truthy() {
                    self.exec_scoped(then_body, env, frame)
                } else if let Some(else_body) = else_body {
                    self.exec_scoped(else_body, env, frame)
                } else {
                    Ok(Control::Normal)
                }
            }
            Stmt::While { cond, body, .. } => {
                while self.eval_expr(cond, env)?.is_truthy() {
                    match self.exec_scoped(body, env, frame)? {
                        Control::Break => break,
                        Control::Continue | Control::Normal => {}
                        signal => return Ok(signal),
                    }
                }
                Ok(Control::Normal)
            }
            Stmt::For { init, cond, step, body, .. } => {
                let mut loop_env = Env::with_parent(env.clone());
                if let Some(init) = init {
                    match self.exec_stmt(init, &mut loop_env, frame)? {
                        Control::Normal => {}
                        signal => return Ok(signal),
                    }
                }
                let result = loop {
                    if let Some(cond) = cond
                        && !self.eval_expr(cond, &loop_env)?.is_truthy()
                    {
                        break Ok(Control::Normal);
                    }
                    match self.exec_scoped(body, &loop_env, frame)? {
                        Control::Break => break Ok(Control::Normal),
                        Control::Continue | Control::Normal => {}
                        signal => break Ok(signal),
                    }
                    if let Some(step) = step {
                        self.eval_expr(step, &loop_env)?;
                    }
                };
                release_env_chain(&loop_env, Some(env));
                result
            }
            Stmt::ForIn { key, value, iterable, body, .. } => {
                self.exec_for_in(key.as_deref(), value, iterable, body, env, frame)
            }
            Stmt::Block { body, .. } => self.exec_scoped(body, env, frame),
            Stmt::Return { value, .. } => {
                let result = match value {
                    Some(value) => self.eval_expr(value, env)?,
                    None => Value::Null,
                };
                Ok(Control::Return(result))
            }
            Stmt::Break { .. } => Ok(Control::Break),
            Stmt::Continue { .. } => Ok(Control::Continue),
            Stmt::Try { body, catch_name, catch_body, finally_body, .. } => {
                self.exec_try(
                    body,
                    catch_name.as_deref(),
                    catch_body.as_deref(),
                    finally_body.as_deref(),
                    env,
                    frame,
                )
            }
            Stmt::Throw { value, .. } => {
                let thrown = self.eval_expr(value, env)?;
                Err(Thrown::new(thrown))
            }
            Stmt::Switch { discriminant, cases, default, .. } => {
                self.exec_switch(discriminant, cases, default.as_deref(), env, frame)
            }
            Stmt::Defer { expr, .. } => {
                frame.defers.push((expr.clone(), env.clone()));
                Ok(Control::Normal)
            }
            Stmt::Enum { name, members, .. } => {
                let object = ObjectCell::new();
                let mut next = 0i64;
                for (member, value) in members {
                    if let Some(v) = value {
                        next = *v;
                    }
                    object.set(member, Value::int_narrow(next));
                    next += 1;
                }
                self.define_layered(name, Value::Object(object), true, env);
                Ok(Control::Normal)
            }
            Stmt::DefineObject { name, fields, .. } => {
                self.object_types
                    .borrow_mut()
                    .insert(name.clone(), fields.clone());
                Ok(Control::Normal)
            }
            Stmt::Import { names, path, loc } => self.exec_import(names, path, loc, env),
            Stmt::Export { stmt, .. } => self.exec_stmt(stmt, env, frame),
            Stmt::ImportFfi { library, .. } => {
                self.ffi
                    .borrow_mut()
                    .load(library)
                    .map_err(runtime_error)?;
                Ok(Control::Normal)
            }
            Stmt::ExternFn { name, params, .. } => {
                let cell = FunctionCell::extern_fn(name.clone(), params.len());
                self.define_layered(name, Value::Function(cell), false, env);
                Ok(Control::Normal)
            }
        }
    }

    fn exec_binding(
        self: &Rc<Self>,
        name: &str,
        annotation: Option<&hemlock_compiler::ast::TypeAnnotation>,
        value: &Expr,
        is_const: bool,
        env: &mut Rc<Env>,
        _loc: &SourceLocation,
    ) -> ExecResult {
        let mut evaluated = self.eval_expr(value, env)?;
        if let Value::Function(cell) = &evaluated
            && let FunctionKind::Script { name: fn_name, .. } = &cell.kind
        {
            let mut slot = fn_name.borrow_mut();
            if slot.is_none() {
                *slot = Some(name.to_string());
            }
        }
        if let Some(annotation) = annotation {
            evaluated = self.coerce(evaluated, annotation, name)?;
        }
        if env.has_own(name) {
            *env = Env::with_parent(env.clone());
        }
        env.define(name, evaluated, is_const);
        Ok(Control::Normal)
    }

    /// Define with the re-declaration layering used by `let`
    fn define_layered(&self, name: &str, value: Value, is_const: bool, env: &mut Rc<Env>) {
        if env.has_own(name) {
            *env = Env::with_parent(env.clone());
        }
        env.define(name, value, is_const);
    }

    fn exec_for_in(
        self: &Rc<Self>,
        key: Option<&str>,
        value_name: &str,
        iterable: &Expr,
        body: &[Stmt],
        env: &Rc<Env>,
        frame: &mut FrameCtx,
    ) -> ExecResult {
        let iterable = self.eval_expr(iterable, env)?;
        let pairs: Vec<(Value, Value)> = match &iterable {
            Value::Array(cell) => {
                let elements = cell.elements.borrow().clone();
                elements
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| (Value::int_narrow(i as i64), v))
                    .collect()
            }
            Value::Object(cell) => cell
                .entries_snapshot()
                .into_iter()
                .map(|(k, v)| (Value::string(k), v))
                .collect(),
            Value::Str(s) => s
                .chars()
                .enumerate()
                .map(|(i, c)| (Value::int_narrow(i as i64), Value::string(c.to_string())))
                .collect(),
            other => {
                return Err(type_error(format!(
                    "cannot iterate over {}",
                    other.type_name()
                )));
            }
        };
        // Objects iterated with a single variable see keys; everything
        // else sees values.
        let single_sees_key = matches!(&iterable, Value::Object(_));
        for (k, v) in pairs {
            let mut child = Env::with_parent(env.clone());
            match key {
                Some(key) => {
                    child.define(key, k, false);
                    child.define(value_name, v, false);
                }
                None => {
                    let bound = if single_sees_key { k } else { v };
                    child.define(value_name, bound, false);
                }
            }
            let result = self.exec_stmts(body, &mut child, frame);
            release_env_chain(&child, Some(env));
            match result? {
                Control::Break => break,
                Control::Continue | Control::Normal => {}
                signal => return Ok(signal),
            }
        }
        Ok(Control::Normal)
    }

    /// `try { A } catch (e) { B } finally { C }`: run A; a throw binds `e`
    /// and runs B, B's signal replacing A's; C runs in every case and a
    /// non-normal signal from C supersedes the accumulated one.
    fn exec_try(
        self: &Rc<Self>,
        body: &[Stmt],
        catch_name: Option<&str>,
        catch_body: Option<&[Stmt]>,
        finally_body: Option<&[Stmt]>,
        env: &Rc<Env>,
        frame: &mut FrameCtx,
    ) -> ExecResult {
        let mut signal = self.exec_scoped(body, env, frame);
        if let Some(catch_body) = catch_body {
            signal = match signal {
                Err(thrown) => {
                    let mut catch_env = Env::with_parent(env.clone());
                    if let Some(name) = catch_name {
                        catch_env.define(name, thrown.value, false);
                    }
                    let caught = self.exec_stmts(catch_body, &mut catch_env, frame);
                    release_env_chain(&catch_env, Some(env));
                    caught
                }
                ok => ok,
            };
        }
        if let Some(finally_body) = finally_body {
            match self.exec_scoped(finally_body, env, frame) {
                Ok(Control::Normal) => {}
                superseding => return superseding,
            }
        }
        signal
    }

    fn exec_switch(
        self: &Rc<Self>,
        discriminant: &Expr,
        cases: &[SwitchCase],
        default: Option<&[Stmt]>,
        env: &Rc<Env>,
        frame: &mut FrameCtx,
    ) -> ExecResult {
        let subject = self.eval_expr(discriminant, env)?;
        let mut chosen: Option<&[Stmt]> = None;
        for case in cases {
            let candidate = self.eval_expr(&case.value, env)?;
            if subject.equals(&candidate) {
                chosen = Some(&case.body);
                break;
            }
        }
        let Some(body) = chosen.or(default) else {
            return Ok(Control::Normal);
        };
        // First match only; fall-through is not implicit. `break` exits the
        // switch, `continue` belongs to an enclosing loop.
        match self.exec_scoped(body, env, frame)? {
            Control::Break => Ok(Control::Normal),
            signal => Ok(signal),
        }
    }

    fn exec_import(
        self: &Rc<Self>,
        names: &[String],
        spec: &str,
        _loc: &SourceLocation,
        env: &mut Rc<Env>,
    ) -> ExecResult {
        let importer = self.module_stack.borrow().last().cloned().flatten();
        let resolved = self
            .modules
            .borrow()
            .resolve(importer.as_deref(), spec)
            .map_err(|e| control::error(control::ErrorKind::Module, e.to_string()))?;
        self.modules
            .borrow_mut()
            .compile(&resolved)
            .map_err(|e| control::error(control::ErrorKind::Module, e.to_string()))?;
        self.ensure_module_executed(&resolved)?;

        let module = self
            .modules
            .borrow()
            .get(&resolved)
            .expect("compiled module is cached");
        let module_env = self
            .module_envs
            .borrow()
            .get(&resolved)
            .expect("executed module has an environment")
            .clone();
        for name in names {
            if module.borrow().export(name).is_none() {
                return Err(control::error(
                    control::ErrorKind::Module,
                    format!("module {} does not export '{}'", resolved.display(), name),
                ));
            }
            let value = module_env.lookup(name).ok_or_else(|| {
                control::error(
                    control::ErrorKind::Module,
                    format!(
                        "export '{}' of {} was never bound",
                        name,
                        resolved.display()
                    ),
                )
            })?;
            self.define_layered(name, value, false, env);
        }
        Ok(Control::Normal)
    }

    /// Run a module's top level exactly once. Imports recurse through this,
    /// so initialization lands deepest-first.
    fn ensure_module_executed(self: &Rc<Self>, path: &std::path::Path) -> Result<(), Thrown> {
        if self.module_envs.borrow().contains_key(path) {
            return Ok(());
        }
        let statements = {
            let registry = self.modules.borrow();
            let module = registry.get(path).expect("compiled module is cached");
            let module = module.borrow();
            module
                .program
                .as_ref()
                .map(|p| p.statements.clone())
                .unwrap_or_default()
        };
        self.module_stack
            .borrow_mut()
            .push(Some(path.to_path_buf()));
        let mut env = Env::new();
        let mut frame = FrameCtx::new();
        let result = self.exec_stmts(&statements, &mut env, &mut frame);
        let defers = self.run_defers(frame);
        self.module_stack.borrow_mut().pop();
        result?;
        defers?;
        self.module_envs
            .borrow_mut()
            .insert(path.to_path_buf(), env);
        Ok(())
    }

    /// Run a frame's defers in LIFO order. A defer that throws aborts the
    /// remaining ones and its throw supersedes the frame's signal.
    pub(crate) fn run_defers(self: &Rc<Self>, frame: FrameCtx) -> Result<(), Thrown> {
        for (expr, env) in frame.defers.into_iter().rev() {
            self.eval_expr(&expr, &env)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    pub(crate) fn eval_expr(self: &Rc<Self>, expr: &Expr, env: &Rc<Env>) -> EvalResult {
        match expr {
            Expr::Int { bits, kind, .. } => Ok(Value::int(*bits, *kind)),
            Expr::Float { value, is_f32, .. } => Ok(if *is_f32 {
                Value::F32(*value as f32)
            } else {
                Value::F64(*value)
            }),
            Expr::Bool { value, .. } => Ok(Value::Bool(*value)),
            Expr::Str { value, .. } => Ok(Value::string(value)),
            Expr::Rune { value, .. } => Ok(Value::Rune(*value)),
            Expr::Null { .. } => Ok(Value::Null),
            Expr::Ident { name, .. } => self.eval_ident(name, env),
            Expr::Binary { op, lhs, rhs, .. } => self.eval_binary(*op, lhs, rhs, env),
            Expr::Unary { op, operand, .. } => {
                let operand = self.eval_expr(operand, env)?;
                arith::unary(*op, &operand)
            }
            Expr::Ternary { cond, then_expr, else_expr, .. } => {
                if self.eval_expr(cond, env)?.is_truthy() {
                    self.eval_expr(then_expr, env)
                } else {
                    self.eval_expr(else_expr, env)
                }
            }
            Expr::Call { callee, args, loc } => {
                let callee = self.eval_expr(callee, env)?;
                let mut evaluated = Vec::with_capacity(args.len());
                for arg in args {
                    evaluated.push(self.eval_expr(arg, env)?);
                }
                self.call_value(&callee, evaluated, loc)
            }
            Expr::Assign { target, value, .. } => {
                let value = self.eval_expr(value, env)?;
                self.assign_target(target, value.clone(), env)?;
                Ok(value)
            }
            Expr::Property { object, name, loc } => {
                let object = self.eval_expr(object, env)?;
                self.read_property(&object, name, loc)
            }
            Expr::OptionalProperty { object, name, loc } => {
                let object = self.eval_expr(object, env)?;
                if object.is_null() {
                    Ok(Value::Null)
                } else {
                    self.read_property(&object, name, loc)
                }
            }
            Expr::Index { object, index, .. } => {
                let object = self.eval_expr(object, env)?;
                let index = self.eval_expr(index, env)?;
                self.read_index(&object, &index)
            }
            Expr::Array { elements, .. } => {
                let mut out = Vec::with_capacity(elements.len());
                for element in elements {
                    out.push(self.eval_expr(element, env)?);
                }
                Ok(Value::array(out))
            }
            Expr::Object { entries, .. } => {
                let object = ObjectCell::new();
                for (key, value) in entries {
                    object.set(key, self.eval_expr(value, env)?);
                }
                Ok(Value::Object(object))
            }
            Expr::Function { params, body, is_async, loc } => {
                // A function expression captures the current environment at
                // construction; the body stays shared with the AST.
                Ok(Value::Function(FunctionCell::script(
                    Rc::new(params.clone()),
                    body.clone(),
                    *is_async,
                    loc.clone(),
                    Some(env.clone()),
                )))
            }
            Expr::IncDec { target, increment, prefix, .. } => {
                let old = self.eval_expr(target, env)?;
                let op = if *increment { BinaryOp::Add } else { BinaryOp::Sub };
                let new = arith::binary(op, &old, &Value::I32(1))?;
                self.assign_target(target, new.clone(), env)?;
                Ok(if *prefix { new } else { old })
            }
            Expr::Interp { parts, .. } => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        InterpPart::Lit(text) => out.push_str(text),
                        InterpPart::Expr(expr) => {
                            out.push_str(&self.eval_expr(expr, env)?.to_display());
                        }
                    }
                }
                Ok(Value::string(out))
            }
            Expr::Await { expr, .. } => {
                let value = self.eval_expr(expr, env)?;
                match value {
                    Value::Task(task) => tasks::join_task(self, &task),
                    other => Ok(other),
                }
            }
        }
    }

    fn eval_ident(self: &Rc<Self>, name: &str, env: &Rc<Env>) -> EvalResult {
        if let Some(value) = env.lookup(name) {
            return Ok(value);
        }
        // The builtin table is consulted only when no lexical or imported
        // binding shadows the name.
        if let Some(builtin) = builtins::lookup(name) {
            return Ok(builtin);
        }
        Err(name_error(name))
    }

    fn eval_binary(
        self: &Rc<Self>,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        env: &Rc<Env>,
    ) -> EvalResult {
        match op {
            // Short-circuit operators return the deciding operand.
            BinaryOp::And => {
                let left = self.eval_expr(lhs, env)?;
                if left.is_truthy() {
                    self.eval_expr(rhs, env)
                } else {
                    Ok(left)
                }
            }
            BinaryOp::Or => {
                let left = self.eval_expr(lhs, env)?;
                if left.is_truthy() {
                    Ok(left)
                } else {
                    self.eval_expr(rhs, env)
                }
            }
            BinaryOp::NullCoalesce => {
                let left = self.eval_expr(lhs, env)?;
                if left.is_null() {
                    self.eval_expr(rhs, env)
                } else {
                    Ok(left)
                }
            }
            _ => {
                let left = self.eval_expr(lhs, env)?;
                let right = self.eval_expr(rhs, env)?;
                arith::binary(op, &left, &right)
            }
        }
    }

    fn assign_target(
        self: &Rc<Self>,
        target: &Expr,
        value: Value,
        env: &Rc<Env>,
    ) -> Result<(), Thrown> {
        match target {
            Expr::Ident { name, .. } => match env.assign(name, value) {
                AssignOutcome::Assigned => Ok(()),
                AssignOutcome::Unbound => Err(name_error(name)),
                AssignOutcome::ConstViolation => Err(control::const_violation(name)),
            },
            Expr::Property { object, name, .. } => {
                let object = self.eval_expr(object, env)?;
                match &object {
                    Value::Object(cell) => {
                        cell.set(name, value);
                        Ok(())
                    }
                    other => Err(type_error(format!(
                        "cannot set property '{}' on {}",
                        name,
                        other.type_name()
                    ))),
                }
            }
            Expr::Index { object, index, .. } => {
                let object = self.eval_expr(object, env)?;
                let index = self.eval_expr(index, env)?;
                self.write_index(&object, &index, value)
            }
            other => Err(runtime_error(format!(
                "invalid assignment target at {}",
                other.loc()
            ))),
        }
    }

    fn read_property(
        self: &Rc<Self>,
        object: &Value,
        name: &str,
        _loc: &SourceLocation,
    ) -> EvalResult {
        match object {
            // Plain access on null raises; only the optional chain
            // propagates null.
            Value::Null => Err(type_error(format!(
                "cannot read property '{}' of null",
                name
            ))),
            Value::Object(cell) => {
                if let Some(value) = cell.get(name) {
                    return Ok(value);
                }
                if builtins::has_method(object, name) {
                    return Ok(Value::Function(FunctionCell::method(object.clone(), name)));
                }
                Ok(Value::Null)
            }
            other => {
                if let Some(value) = other.virtual_property(name) {
                    return Ok(value);
                }
                if builtins::has_method(other, name) {
                    return Ok(Value::Function(FunctionCell::method(other.clone(), name)));
                }
                Ok(Value::Null)
            }
        }
    }

    fn read_index(self: &Rc<Self>, object: &Value, index: &Value) -> EvalResult {
        match object {
            Value::Array(cell) => {
                let Some(i) = index.as_int_wide() else {
                    return Err(type_error("array index must be an integer"));
                };
                let elements = cell.elements.borrow();
                if i < 0 || i as usize >= elements.len() {
                    // Arrays are bounds-checked but forgiving.
                    return Ok(Value::Null);
                }
                Ok(elements[i as usize].clone())
            }
            Value::Str(s) => {
                let Some(i) = index.as_int_wide() else {
                    return Err(type_error("string index must be an integer"));
                };
                if i < 0 {
                    return Err(control::index_error(format!(
                        "string index {} out of range",
                        i
                    )));
                }
                match s.chars().nth(i as usize) {
                    Some(c) => Ok(Value::string(c.to_string())),
                    None => Err(control::index_error(format!(
                        "string index {} out of range (length {})",
                        i,
                        s.chars().count()
                    ))),
                }
            }
            Value::Buffer(cell) => {
                let Some(i) = index.as_int_wide() else {
                    return Err(type_error("buffer index must be an integer"));
                };
                let data = cell.data.borrow();
                if i < 0 || i as usize >= data.len() {
                    return Err(control::index_error(format!(
                        "buffer index {} out of range (length {})",
                        i,
                        data.len()
                    )));
                }
                Ok(Value::U8(data[i as usize]))
            }
            Value::Object(cell) => match index {
                Value::Str(key) => Ok(cell.get(key).unwrap_or(Value::Null)),
                other => Err(type_error(format!(
                    "object index must be a string, got {}",
                    other.type_name()
                ))),
            },
            other => Err(type_error(format!(
                "cannot index {}",
                other.type_name()
            ))),
        }
    }

    fn write_index(
        self: &Rc<Self>,
        object: &Value,
        index: &Value,
        value: Value,
    ) -> Result<(), Thrown> {
        match object {
            Value::Array(cell) => {
                let Some(i) = index.as_int_wide() else {
                    return Err(type_error("array index must be an integer"));
                };
                let len = cell.elements.borrow().len();
                if i < 0 || i as usize >= len {
                    return Err(control::index_error(format!(
                        "array index {} out of range (length {})",
                        i, len
                    )));
                }
                let elem_type = cell.elem_type.borrow().clone();
                let value = match elem_type {
                    Some(annotation) => self.coerce(value, &annotation, "array element")?,
                    None => value,
                };
                cell.elements.borrow_mut()[i as usize] = value;
                Ok(())
            }
            Value::Buffer(cell) => {
                let Some(i) = index.as_int_wide() else {
                    return Err(type_error("buffer index must be an integer"));
                };
                let Some(byte) = value.as_int_wide() else {
                    return Err(type_error("buffer element must be an integer"));
                };
                let mut data = cell.data.borrow_mut();
                if i < 0 || i as usize >= data.len() {
                    return Err(control::index_error(format!(
                        "buffer index {} out of range (length {})",
                        i,
                        data.len()
                    )));
                }
                data[i as usize] = byte as u8;
                Ok(())
            }
            Value::Object(cell) => match index {
                Value::Str(key) => {
                    cell.set(key, value);
                    Ok(())
                }
                other => Err(type_error(format!(
                    "object index must be a string, got {}",
                    other.type_name()
                ))),
            },
            other => Err(type_error(format!(
                "cannot index-assign {}",
                other.type_name()
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    pub(crate) fn call_value(
        self: &Rc<Self>,
        callee: &Value,
        args: Vec<Value>,
        loc: &SourceLocation,
    ) -> EvalResult {
        let Value::Function(cell) = callee else {
            return Err(type_error(format!(
                "not callable: {}",
                callee.type_name()
            )));
        };
        match &cell.kind {
            FunctionKind::Script { is_async: true, .. } => {
                // Calling an async function spawns a task; `await`/`join`
                // collects the result.
                tasks::spawn_task(self, callee.clone(), args)
            }
            FunctionKind::Script { .. } => self.call_script(cell, args, loc),
            FunctionKind::Builtin { name } => builtins::call(self, name, args, loc),
            FunctionKind::Method { receiver, name } => {
                builtins::call_method(self, receiver, name, args, loc)
            }
            FunctionKind::Extern { name, .. } => {
                let result = self.ffi.borrow_mut().call(name, &args);
                result.map_err(runtime_error)
            }
        }
    }

    /// Invoke a function for a task body: like `call_value` but an async
    /// function runs here directly instead of spawning again.
    pub(crate) fn call_for_task(
        self: &Rc<Self>,
        callee: &Value,
        args: Vec<Value>,
        loc: &SourceLocation,
    ) -> EvalResult {
        match callee {
            Value::Function(cell) if matches!(cell.kind, FunctionKind::Script { .. }) => {
                self.call_script(cell, args, loc)
            }
            other => self.call_value(other, args, loc),
        }
    }

    pub(crate) fn call_script(
        self: &Rc<Self>,
        cell: &Rc<FunctionCell>,
        args: Vec<Value>,
        loc: &SourceLocation,
    ) -> EvalResult {
        let FunctionKind::Script { name, params, body, .. } = &cell.kind else {
            return Err(runtime_error("call_script on a non-script function"));
        };
        let depth = self.call_depth.get();
        if depth >= MAX_CALL_DEPTH {
            return Err(runtime_error(format!(
                "call depth exceeded {}",
                MAX_CALL_DEPTH
            )));
        }
        self.call_depth.set(depth + 1);
        let result = self.call_script_inner(params, body, &cell.env.borrow().clone(), args);
        self.call_depth.set(depth);
        result.map_err(|mut thrown| {
            let fn_name = name.borrow().clone().unwrap_or_else(|| "<fn>".to_string());
            thrown.push_frame(&fn_name, loc);
            thrown
        })
    }

    fn call_script_inner(
        self: &Rc<Self>,
        params: &Rc<Vec<Param>>,
        body: &Rc<Vec<Stmt>>,
        captured: &Option<Rc<Env>>,
        args: Vec<Value>,
    ) -> EvalResult {
        // Lexical scoping: the call frame's parent is the captured closure
        // environment, never the caller's scope.
        let parent = captured.clone().unwrap_or_else(|| self.globals.clone());
        let call_env = Env::with_parent(parent.clone());
        for (i, param) in params.iter().enumerate() {
            let value = match args.get(i) {
                Some(v) => v.clone(),
                None => match &param.default {
                    Some(default) => self.eval_expr(default, &call_env)?,
                    None => Value::Null,
                },
            };
            let value = match &param.annotation {
                Some(annotation) => self.coerce(value, annotation, &param.name)?,
                None => value,
            };
            call_env.define(&param.name, value, false);
        }

        let mut frame = FrameCtx::new();
        let mut cursor = call_env;
        let signal = self.exec_stmts(body, &mut cursor, &mut frame);
        // Defers run after the body finishes - normally, by return, or by
        // throw - and before the signal propagates.
        let defers = self.run_defers(frame);
        release_env_chain(&cursor, Some(&parent));
        defers?;
        match signal? {
            Control::Return(value) => Ok(value),
            Control::Normal => Ok(Value::Null),
            Control::Break | Control::Continue => {
                Err(runtime_error("break or continue outside of a loop"))
            }
        }
    }
}
