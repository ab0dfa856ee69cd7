//! Signal handling
//!
//! Flag-based trapping: the OS handler only sets an atomic flag
//! (async-signal-safe), and the scheduler delivers pending signals at
//! suspension points by invoking the user handler synchronously before the
//! interrupted work resumes. No Hemlock code ever runs in signal context.

use crate::interp::Interp;
use hemlock_core::control::{runtime_error, type_error, Thrown};
use hemlock_core::value::Value;
use std::rc::Rc;
use std::sync::atomic::Ordering;

/// Covers all standard Unix signals
const MAX_SIGNAL: usize = 32;

#[cfg(unix)]
mod hooks {
    use super::MAX_SIGNAL;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, LazyLock, Mutex};

    /// Per-signal pending flags, set by the OS handler
    pub(super) static FLAGS: LazyLock<[Arc<AtomicBool>; MAX_SIGNAL]> =
        LazyLock::new(|| std::array::from_fn(|_| Arc::new(AtomicBool::new(false))));

    /// Signals with an OS hook already installed (install once per signal)
    pub(super) static INSTALLED: Mutex<Option<HashSet<i32>>> = Mutex::new(None);

    pub(super) fn install(signum: i32) -> Result<(), String> {
        let mut guard = INSTALLED.lock().expect("signal hook set lock");
        let installed = guard.get_or_insert_with(HashSet::new);
        if installed.contains(&signum) {
            return Ok(());
        }
        signal_hook::flag::register(signum, FLAGS[signum as usize].clone())
            .map_err(|e| format!("cannot trap signal {}: {}", signum, e))?;
        installed.insert(signum);
        Ok(())
    }

    pub(super) fn pending(signum: i32) -> &'static AtomicBool {
        &FLAGS[signum as usize]
    }
}

/// Install (or clear, when the handler is null) a handler for a signal
pub fn trap(interp: &Rc<Interp>, signum: i32, handler: Value) -> Result<(), Thrown> {
    if signum <= 0 || signum as usize >= MAX_SIGNAL {
        return Err(type_error(format!("signal: invalid signal number {}", signum)));
    }
    if handler.is_null() {
        interp.signal_handlers.borrow_mut().remove(&signum);
        return Ok(());
    }
    if !matches!(handler, Value::Function(_)) {
        return Err(type_error("signal: handler must be a function or null"));
    }
    #[cfg(unix)]
    {
        hooks::install(signum).map_err(runtime_error)?;
        interp.signal_handlers.borrow_mut().insert(signum, handler);
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = handler;
        Err(runtime_error("signal trapping is only supported on Unix"))
    }
}

/// Deliver pending trapped signals: called at every suspension point.
/// The handler runs synchronously here; a throw from it propagates into
/// the interrupted task.
pub fn check_pending(interp: &Rc<Interp>) -> Result<(), Thrown> {
    #[cfg(unix)]
    {
        let handlers: Vec<(i32, Value)> = interp
            .signal_handlers
            .borrow()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        for (signum, handler) in handlers {
            if hooks::pending(signum).swap(false, Ordering::SeqCst) {
                let loc = hemlock_compiler::ast::SourceLocation::unknown();
                interp.call_value(&handler, vec![Value::I32(signum)], &loc)?;
            }
        }
    }
    let _ = interp;
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::interp::InterpOptions;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_trap_rejects_bad_arguments() {
        let interp = Interp::new(InterpOptions::default());
        assert!(trap(&interp, -1, Value::Null).is_err());
        assert!(trap(&interp, 10, Value::I32(1)).is_err());
        // Null clears without installing anything.
        assert!(trap(&interp, 10, Value::Null).is_ok());
    }

    #[test]
    #[serial]
    fn test_pending_flag_drives_handler() {
        use hemlock_core::value::FunctionCell;
        let interp = Interp::new(InterpOptions {
            capture_output: true,
            ..Default::default()
        });
        // Trap SIGUSR1 with the builtin `print`, then fake a delivery by
        // setting the flag directly (raising for real would race the
        // whole test binary).
        let sigusr1 = libc::SIGUSR1;
        trap(
            &interp,
            sigusr1,
            Value::Function(FunctionCell::builtin("print")),
        )
        .unwrap();
        hooks::pending(sigusr1).store(true, Ordering::SeqCst);
        check_pending(&interp).unwrap();
        let output = interp.take_output();
        assert_eq!(output.trim(), sigusr1.to_string());
        // Flag consumed: a second check delivers nothing.
        check_pending(&interp).unwrap();
        assert!(interp.take_output().is_empty());
    }
}
