//! Free-variable analysis for closures
//!
//! The C transpiler hoists a variable into a heap environment only when some
//! nested function references it. This module computes, for a function body,
//! the set of names referenced but not bound inside it - the function's free
//! variables. The analysis is transitive: a nested closure's free variables
//! flow outward through every scope that does not bind them.

use crate::ast::{Expr, InterpPart, Param, Stmt};
use std::collections::{BTreeSet, HashSet};

/// Free variables of a function literal: names its body references that are
/// neither parameters nor locally bound. Sorted for deterministic layouts.
pub fn function_free_vars(params: &[Param], body: &[Stmt]) -> BTreeSet<String> {
    let mut scope = ScopeStack::new();
    scope.push();
    for param in params {
        scope.bind(&param.name);
    }
    let mut free = BTreeSet::new();
    // Defaults evaluate in the callee environment, so they resolve against
    // the parameter frame, not the caller's scope.
    for param in params {
        if let Some(default) = &param.default {
            collect_expr(default, &mut scope, &mut free);
        }
    }
    collect_stmts(body, &mut scope, &mut free);
    free
}

/// Names bound by `let`/`const` directly in a statement list (one scope level)
pub fn directly_bound(stmts: &[Stmt]) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for stmt in stmts {
        match stmt {
            Stmt::Let { name, .. } | Stmt::Const { name, .. } => {
                out.insert(name.clone());
            }
            Stmt::Enum { name, .. } | Stmt::DefineObject { name, .. } => {
                out.insert(name.clone());
            }
            Stmt::ExternFn { name, .. } => {
                out.insert(name.clone());
            }
            Stmt::Export { stmt, .. } => {
                out.extend(directly_bound(std::slice::from_ref(stmt)));
            }
            Stmt::Import { names, .. } => {
                out.extend(names.iter().cloned());
            }
            _ => {}
        }
    }
    out
}

struct ScopeStack {
    frames: Vec<HashSet<String>>,
}

impl ScopeStack {
    fn new() -> Self {
        ScopeStack { frames: Vec::new() }
    }

    fn push(&mut self) {
        self.frames.push(HashSet::new());
    }

    fn pop(&mut self) {
        self.frames.pop();
    }

    fn bind(&mut self, name: &str) {
        if let Some(top) = self.frames.last_mut() {
            top.insert(name.to_string());
        }
    }

    fn is_bound(&self, name: &str) -> bool {
        self.frames.iter().any(|f| f.contains(name))
    }
}

fn collect_stmts(stmts: &[Stmt], scope: &mut ScopeStack, free: &mut BTreeSet<String>) {
    scope.push();
    for stmt in stmts {
        collect_stmt(stmt, scope, free);
    }
    scope.pop();
}

fn collect_stmt(stmt: &Stmt, scope: &mut ScopeStack, free: &mut BTreeSet<String>) {
    match stmt {
        Stmt::Let { name, value, .. } | Stmt::Const { name, value, .. } => {
            // The initializer may reference the binding itself (named
            // recursion through `let f = fn() { f() }`), so bind first;
            // function bodies are deferred to call time anyway.
            scope.bind(name);
            collect_expr(value, scope, free);
        }
        Stmt::Expr { expr, .. } | Stmt::Throw { value: expr, .. } | Stmt::Defer { expr, .. } => {
            collect_expr(expr, scope, free);
        }
        Stmt::If { cond, then_body, else_body, .. } => {
            collect_expr(cond, scope, free);
            collect_stmts(then_body, scope, free);
            if let Some(body) = else_body {
                collect_stmts(body, scope, free);
            }
        }
        Stmt::While { cond, body, .. } => {
            collect_expr(cond, scope, free);
            collect_stmts(body, scope, free);
        }
        Stmt::For { init, cond, step, body, .. } => {
            scope.push();
            if let Some(init) = init {
                collect_stmt(init, scope, free);
            }
            if let Some(cond) = cond {
                collect_expr(cond, scope, free);
            }
            if let Some(step) = step {
                collect_expr(step, scope, free);
            }
            collect_stmts(body, scope, free);
            scope.pop();
        }
        Stmt::ForIn { key, value, iterable, body, .. } => {
            collect_expr(iterable, scope, free);
            scope.push();
            if let Some(key) = key {
                scope.bind(key);
            }
            scope.bind(value);
            collect_stmts(body, scope, free);
            scope.pop();
        }
        Stmt::Block { body, .. } => collect_stmts(body, scope, free),
        Stmt::Return { value, .. } => {
            if let Some(value) = value {
                collect_expr(value, scope, free);
            }
        }
        Stmt::Break { .. } | Stmt::Continue { .. } => {}
        Stmt::Try { body, catch_name, catch_body, finally_body, .. } => {
            collect_stmts(body, scope, free);
            if let Some(catch_body) = catch_body {
                scope.push();
                if let Some(name) = catch_name {
                    scope.bind(name);
                }
                collect_stmts(catch_body, scope, free);
                scope.pop();
            }
            if let Some(finally_body) = finally_body {
                collect_stmts(finally_body, scope, free);
            }
        }
        Stmt::Switch { discriminant, cases, default, .. } => {
            collect_expr(discriminant, scope, free);
            for case in cases {
                collect_expr(&case.value, scope, free);
                collect_stmts(&case.body, scope, free);
            }
            if let Some(default) = default {
                collect_stmts(default, scope, free);
            }
        }
        Stmt::Enum { name, .. } | Stmt::DefineObject { name, .. } => {
            scope.bind(name);
        }
        Stmt::Import { names, .. } => {
            for name in names {
                scope.bind(name);
            }
        }
        Stmt::Export { stmt, .. } => collect_stmt(stmt, scope, free),
        Stmt::ImportFfi { .. } => {}
        Stmt::ExternFn { name, .. } => {
            scope.bind(name);
        }
    }
}

fn collect_expr(expr: &Expr, scope: &mut ScopeStack, free: &mut BTreeSet<String>) {
    match expr {
        Expr::Ident { name, .. } => {
            if !scope.is_bound(name) {
                free.insert(name.clone());
            }
        }
        Expr::Int { .. }
        | Expr::Float { .. }
        | Expr::Bool { .. }
        | Expr::Str { .. }
        | Expr::Rune { .. }
        | Expr::Null { .. } => {}
        Expr::Binary { lhs, rhs, .. } => {
            collect_expr(lhs, scope, free);
            collect_expr(rhs, scope, free);
        }
        Expr::Unary { operand, .. } => collect_expr(operand, scope, free),
        Expr::Ternary { cond, then_expr, else_expr, .. } => {
            collect_expr(cond, scope, free);
            collect_expr(then_expr, scope, free);
            collect_expr(else_expr, scope, free);
        }
        Expr::Call { callee, args, .. } => {
            collect_expr(callee, scope, free);
            for arg in args {
                collect_expr(arg, scope, free);
            }
        }
        Expr::Assign { target, value, .. } => {
            collect_expr(target, scope, free);
            collect_expr(value, scope, free);
        }
        Expr::Property { object, .. } | Expr::OptionalProperty { object, .. } => {
            collect_expr(object, scope, free);
        }
        Expr::Index { object, index, .. } => {
            collect_expr(object, scope, free);
            collect_expr(index, scope, free);
        }
        Expr::Array { elements, .. } => {
            for e in elements {
                collect_expr(e, scope, free);
            }
        }
        Expr::Object { entries, .. } => {
            for (_, e) in entries {
                collect_expr(e, scope, free);
            }
        }
        Expr::Function { params, body, .. } => {
            // Nested function: its free variables flow outward unless bound
            // at this level or below.
            for name in function_free_vars(params, body) {
                if !scope.is_bound(&name) {
                    free.insert(name);
                }
            }
        }
        Expr::IncDec { target, .. } => collect_expr(target, scope, free),
        Expr::Interp { parts, .. } => {
            for part in parts {
                if let InterpPart::Expr(e) = part {
                    collect_expr(e, scope, free);
                }
            }
        }
        Expr::Await { expr, .. } => collect_expr(expr, scope, free),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Expr;
    use crate::parser::parse_source;
    use std::path::Path;

    fn free_of(source: &str) -> Vec<String> {
        let program = parse_source(source, Path::new("t.hml")).expect("parse");
        let Stmt::Expr { expr: Expr::Function { params, body, .. }, .. } =
            &program.statements[0]
        else {
            panic!("expected function expression statement");
        };
        function_free_vars(params, body).into_iter().collect()
    }

    #[test]
    fn test_params_and_locals_are_not_free() {
        let free = free_of("fn(a, b) { let c = a + b; return c; };");
        assert!(free.is_empty());
    }

    #[test]
    fn test_outer_reference_is_free() {
        let free = free_of("fn(a) { return a + x; };");
        assert_eq!(free, vec!["x"]);
    }

    #[test]
    fn test_nested_closure_free_vars_propagate() {
        let free = free_of("fn() { let g = fn() { return x + y; }; return g; };");
        assert_eq!(free, vec!["x", "y"]);
    }

    #[test]
    fn test_nested_closure_capture_of_local_stops_propagation() {
        let free = free_of("fn() { let x = 1; let g = fn() { return x; }; return g; };");
        assert!(free.is_empty());
    }

    #[test]
    fn test_named_recursion_is_not_free() {
        let free = free_of("fn() { let f = fn(n) { return f(n); }; return f; };");
        assert!(free.is_empty());
    }

    #[test]
    fn test_catch_and_forin_bindings() {
        let free = free_of(
            "fn() { try { } catch (e) { print(e); } for (k, v in xs) { print(k, v); } };",
        );
        assert_eq!(free, vec!["print", "xs"]);
    }

    #[test]
    fn test_default_exprs_resolve_in_callee_scope() {
        // `b`'s default references parameter `a`, not an outer `a`.
        let free = free_of("fn(a, b = a + n) { return b; };");
        assert_eq!(free, vec!["n"]);
    }

    #[test]
    fn test_directly_bound_collects_declarations() {
        let program = parse_source(
            "let a = 1; const b = 2; enum E { X } import { c } from \"./m\"; export let d = 3;",
            Path::new("t.hml"),
        )
        .expect("parse");
        let bound: Vec<String> = directly_bound(&program.statements).into_iter().collect();
        assert_eq!(bound, vec!["a", "b", "c", "d", "E"]);
    }
}
