//! Cooperative task primitives: spawn, join, sleep, channels
//!
//! Tasks are May coroutines on the single worker (see `scheduler`).
//! Suspension points - `sleep`, blocked channel operations, `join` on an
//! unfinished task, `yield_now` - are where cancellation is observed and
//! trapped signals are delivered.

use crate::interp::Interp;
use crate::scheduler::{self, SingleWorker};
use crate::signal;
use hemlock_compiler::ast::SourceLocation;
use hemlock_core::channel::{ChannelCell, ChannelError};
use hemlock_core::control::{cancelled, io_error, type_error, EvalResult, Thrown};
use hemlock_core::task::TaskCell;
use hemlock_core::value::Value;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Create a task running `func(args...)`. The task is enqueued, not run to
/// completion; the caller proceeds until its next suspension point.
pub fn spawn_task(interp: &Rc<Interp>, func: Value, args: Vec<Value>) -> EvalResult {
    if !matches!(func, Value::Function(_)) {
        return Err(type_error(format!(
            "spawn: not callable: {}",
            func.type_name()
        )));
    }
    scheduler::scheduler_init();
    let task = TaskCell::new();
    let payload = SingleWorker((interp.clone(), func, args, task.clone()));
    unsafe {
        may::coroutine::spawn(move || {
            let payload = payload;
            let SingleWorker((interp, func, args, task)) = payload;
            scheduler::set_current_task(Some(task.clone()));
            task.set_running();
            let loc = SourceLocation::unknown();
            let result = interp.call_for_task(&func, args, &loc);
            let was_cancelled =
                matches!(&result, Err(t) if t.value.as_str() == Some("Cancelled"));
            task.complete(result, was_cancelled);
            scheduler::set_current_task(None);
        });
    }
    Ok(Value::Task(task))
}

/// Suspend until the task finishes; return its result or re-throw the
/// throw that terminated it.
pub fn join_task(interp: &Rc<Interp>, task: &Rc<TaskCell>) -> EvalResult {
    loop {
        signal::check_pending(interp)?;
        if scheduler::current_cancel_requested() {
            return Err(cancelled());
        }
        if task.is_finished() {
            return match task.result().expect("finished task has a result") {
                Ok(value) => Ok(value),
                Err(thrown) => Err(thrown),
            };
        }
        may::coroutine::yield_now();
    }
}

/// Cooperative sleep in small slices so cancellation and signals are
/// observed promptly.
pub fn sleep_ms(interp: &Rc<Interp>, ms: u64) -> Result<(), Thrown> {
    scheduler::scheduler_init();
    let deadline = Instant::now() + Duration::from_millis(ms);
    loop {
        signal::check_pending(interp)?;
        if scheduler::current_cancel_requested() {
            return Err(cancelled());
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        let slice = (deadline - now).min(Duration::from_millis(10));
        may::coroutine::sleep(slice);
    }
}

/// Explicit yield: a suspension point with no wait condition
pub fn yield_once(interp: &Rc<Interp>) -> Result<(), Thrown> {
    signal::check_pending(interp)?;
    if scheduler::current_cancel_requested() {
        return Err(cancelled());
    }
    may::coroutine::yield_now();
    Ok(())
}

/// Channel methods: `send`, `recv` (optionally with a timeout in
/// milliseconds, returning null on expiry), `close`, `len`.
pub fn channel_method(
    interp: &Rc<Interp>,
    cell: &Rc<ChannelCell>,
    name: &str,
    args: Vec<Value>,
) -> EvalResult {
    match name {
        "send" => {
            signal::check_pending(interp)?;
            let value = args.into_iter().next().unwrap_or(Value::Null);
            match cell.send(value, &scheduler::current_cancel_requested) {
                Ok(()) => Ok(Value::Null),
                Err(ChannelError::Closed) => Err(io_error("send on closed channel")),
                Err(ChannelError::Cancelled) => Err(cancelled()),
            }
        }
        "recv" => {
            signal::check_pending(interp)?;
            let timeout = args.first().and_then(|v| v.as_int_wide());
            match timeout {
                Some(ms) => {
                    let timeout = Duration::from_millis(ms.max(0) as u64);
                    match cell.recv_timeout(timeout, &scheduler::current_cancel_requested) {
                        Ok(Some(value)) => Ok(value),
                        Ok(None) => Ok(Value::Null),
                        Err(ChannelError::Closed) => {
                            Err(io_error("receive on closed channel"))
                        }
                        Err(ChannelError::Cancelled) => Err(cancelled()),
                    }
                }
                None => match cell.recv(&scheduler::current_cancel_requested) {
                    Ok(value) => Ok(value),
                    Err(ChannelError::Closed) => Err(io_error("receive on closed channel")),
                    Err(ChannelError::Cancelled) => Err(cancelled()),
                },
            }
        }
        "close" => {
            cell.close();
            Ok(Value::Null)
        }
        "len" => Ok(Value::I64(cell.len() as i64)),
        _ => Err(type_error(format!("no method '{}' on channel", name))),
    }
}
