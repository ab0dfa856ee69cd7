//! Lexical environments
//!
//! A name-to-value map with a parent pointer forming the scope chain.
//! Lookup walks outward; assignment mutates the nearest binding that
//! defines the name; `let`/`const` always define in the innermost scope.
//!
//! # Cycles
//!
//! A closure stored in the environment it captures is a reference cycle
//! (`env -> function -> env`) that reference counting alone never collects.
//! [`break_cycles`] is the explicit teardown pass: for every function bound
//! in the scope whose captured chain includes that scope, and whose binding
//! is its only remaining owner, the captured-environment pointer is
//! cleared. The ownership check is what keeps escaped closures intact -
//! a function that was returned or stored elsewhere has other owners and is
//! left alone.

use crate::value::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug)]
struct Binding {
    value: Value,
    is_const: bool,
}

/// Outcome of an assignment attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOutcome {
    Assigned,
    Unbound,
    ConstViolation,
}

#[derive(Debug, Default)]
pub struct Env {
    parent: Option<Rc<Env>>,
    bindings: RefCell<HashMap<String, Binding>>,
}

impl Env {
    pub fn new() -> Rc<Env> {
        Rc::new(Env::default())
    }

    pub fn with_parent(parent: Rc<Env>) -> Rc<Env> {
        Rc::new(Env {
            parent: Some(parent),
            bindings: RefCell::new(HashMap::new()),
        })
    }

    pub fn parent(&self) -> Option<&Rc<Env>> {
        self.parent.as_ref()
    }

    /// Define a binding in this scope, shadowing any outer definition
    pub fn define(&self, name: &str, value: Value, is_const: bool) {
        self.bindings
            .borrow_mut()
            .insert(name.to_string(), Binding { value, is_const });
    }

    /// Whether this scope itself (not a parent) binds the name
    pub fn has_own(&self, name: &str) -> bool {
        self.bindings.borrow().contains_key(name)
    }

    /// Walk the chain for a name
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(binding) = self.bindings.borrow().get(name) {
            return Some(binding.value.clone());
        }
        self.parent.as_ref()?.lookup(name)
    }

    /// Assign to the nearest enclosing binding that defines the name
    pub fn assign(&self, name: &str, value: Value) -> AssignOutcome {
        {
            let mut bindings = self.bindings.borrow_mut();
            if let Some(binding) = bindings.get_mut(name) {
                if binding.is_const {
                    return AssignOutcome::ConstViolation;
                }
                binding.value = value;
                return AssignOutcome::Assigned;
            }
        }
        match &self.parent {
            Some(parent) => parent.assign(name, value),
            None => AssignOutcome::Unbound,
        }
    }

    /// Names bound directly in this scope
    pub fn own_names(&self) -> Vec<String> {
        self.bindings.borrow().keys().cloned().collect()
    }
}

/// Whether a function's captured environment chain passes through `env`
fn chain_contains(start: &Option<Rc<Env>>, env: &Rc<Env>) -> bool {
    let mut cursor = start.clone();
    while let Some(current) = cursor {
        if Rc::ptr_eq(&current, env) {
            return true;
        }
        cursor = current.parent.clone();
    }
    false
}

/// Cycle-break pass run before an environment is released.
///
/// Conservative single-pass reset: only function values bound directly in
/// this scope are examined, and only those with no owner besides the
/// binding itself (`Rc::strong_count == 1`) have their captured-environment
/// pointer cleared. Such a function is about to become unreachable along
/// with the scope, so cutting the back edge is safe and lets the reference
/// counts reach zero.
pub fn break_cycles(env: &Rc<Env>) {
    let bindings = env.bindings.borrow();
    for binding in bindings.values() {
        if let Value::Function(cell) = &binding.value
            && Rc::strong_count(cell) == 1
        {
            let captured = cell.env.borrow().clone();
            if chain_contains(&captured, env) {
                cell.env.borrow_mut().take();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::FunctionCell;
    use hemlock_compiler::ast::SourceLocation;
    use std::rc::Weak;

    #[test]
    fn test_lookup_walks_chain() {
        let root = Env::new();
        root.define("x", Value::I32(1), false);
        let child = Env::with_parent(root.clone());
        child.define("y", Value::I32(2), false);
        assert!(matches!(child.lookup("x"), Some(Value::I32(1))));
        assert!(matches!(child.lookup("y"), Some(Value::I32(2))));
        assert!(root.lookup("y").is_none());
        assert!(child.lookup("z").is_none());
    }

    #[test]
    fn test_shadowing() {
        let root = Env::new();
        root.define("x", Value::I32(1), false);
        let child = Env::with_parent(root.clone());
        child.define("x", Value::I32(2), false);
        assert!(matches!(child.lookup("x"), Some(Value::I32(2))));
        assert!(matches!(root.lookup("x"), Some(Value::I32(1))));
    }

    #[test]
    fn test_assign_mutates_nearest_binding() {
        let root = Env::new();
        root.define("x", Value::I32(1), false);
        let child = Env::with_parent(root.clone());
        assert_eq!(child.assign("x", Value::I32(9)), AssignOutcome::Assigned);
        assert!(matches!(root.lookup("x"), Some(Value::I32(9))));
        assert_eq!(child.assign("nope", Value::Null), AssignOutcome::Unbound);
    }

    #[test]
    fn test_const_rejects_assignment() {
        let env = Env::new();
        env.define("k", Value::I32(1), true);
        assert_eq!(env.assign("k", Value::I32(2)), AssignOutcome::ConstViolation);
        assert!(matches!(env.lookup("k"), Some(Value::I32(1))));
    }

    fn make_closure(env: &Rc<Env>) -> Value {
        Value::Function(FunctionCell::script(
            Rc::new(Vec::new()),
            Rc::new(Vec::new()),
            false,
            SourceLocation::unknown(),
            Some(env.clone()),
        ))
    }

    #[test]
    fn test_break_cycles_frees_self_referential_closure() {
        let weak: Weak<Env>;
        {
            let env = Env::new();
            weak = Rc::downgrade(&env);
            // let f = fn() { f() };  - the closure captures env, env binds it.
            env.define("f", make_closure(&env), false);
            assert!(weak.upgrade().is_some());
            break_cycles(&env);
        }
        // Both the env and the function cell are reclaimed.
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_break_cycles_spares_escaped_closures() {
        let env = Env::new();
        let closure = make_closure(&env);
        env.define("f", closure.clone(), false);
        // A second owner exists (the escaped copy), so the capture survives.
        break_cycles(&env);
        let Value::Function(cell) = &closure else {
            panic!("expected function")
        };
        assert!(cell.env.borrow().is_some());
    }

    #[test]
    fn test_break_cycles_ignores_foreign_closures() {
        let other = Env::new();
        let env = Env::new();
        // Bound here but capturing elsewhere: no cycle through this env.
        env.define("f", make_closure(&other), false);
        break_cycles(&env);
        let Some(Value::Function(cell)) = env.lookup("f") else {
            panic!("expected function")
        };
        assert!(cell.env.borrow().is_some());
    }
}
