//! Scheduler bootstrap and the single-worker invariant
//!
//! Hemlock tasks are May coroutines, but the language model is
//! single-threaded cooperative scheduling: no data races by construction,
//! because only one task observes mutation at a time. That invariant is
//! enforced here by configuring May with exactly one worker thread and
//! running every piece of evaluation inside a coroutine on that worker.
//!
//! Values hold `Rc`/`RefCell` cells and are therefore not `Send`; they
//! cross into coroutine closures through [`SingleWorker`], whose `Send`
//! assertion is sound for the same reason the model is race-free - a single
//! worker means one coroutine touches the cells at a time, handing off only
//! at cooperative suspension points. The spawning thread never touches the
//! payload again.

use hemlock_core::task::TaskCell;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Once;

static SCHEDULER_INIT: Once = Once::new();

/// Default coroutine stack size: 4MB. Tree-walking recursion is stack
/// hungry, so this is larger than a typical coroutine default.
/// Can be overridden via the HEMLOCK_STACK_SIZE environment variable.
const DEFAULT_STACK_SIZE: usize = 0x400000;

/// Parse a stack size from an optional string value.
/// Returns the parsed size, or DEFAULT_STACK_SIZE if the value is missing,
/// zero, or invalid. Prints a warning to stderr for invalid values.
fn parse_stack_size(env_value: Option<String>) -> usize {
    match env_value {
        Some(val) => match val.parse::<usize>() {
            Ok(0) => {
                eprintln!(
                    "Warning: HEMLOCK_STACK_SIZE=0 is invalid, using default {}",
                    DEFAULT_STACK_SIZE
                );
                DEFAULT_STACK_SIZE
            }
            Ok(size) => size,
            Err(_) => {
                eprintln!(
                    "Warning: HEMLOCK_STACK_SIZE='{}' is not a valid number, using default {}",
                    val, DEFAULT_STACK_SIZE
                );
                DEFAULT_STACK_SIZE
            }
        },
        None => DEFAULT_STACK_SIZE,
    }
}

/// Initialize the scheduler. Idempotent via Once; every entry point that
/// spawns coroutines calls this first.
pub fn scheduler_init() {
    SCHEDULER_INIT.call_once(|| {
        let stack_size = parse_stack_size(std::env::var("HEMLOCK_STACK_SIZE").ok());
        may::config().set_workers(1).set_stack_size(stack_size);
    });
}

/// Send-asserting envelope for moving non-`Send` evaluator state into a
/// coroutine on the single worker. See the module docs for the argument.
pub struct SingleWorker<T>(pub T);

// Safety: May is configured with one worker thread (scheduler_init), every
// coroutine runs on it, and the spawning thread does not retain access to
// the payload. Only one execution context can observe the wrapped value at
// any time.
unsafe impl<T> Send for SingleWorker<T> {}

/// Run a closure to completion inside a coroutine on the worker, blocking
/// the calling (non-coroutine) thread until it finishes. This is how the
/// CLI enters the interpreter: the calling thread itself never evaluates.
pub fn run_on_worker<T, F>(f: F) -> T
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    scheduler_init();
    let payload = SingleWorker(f);
    let handle = unsafe {
        may::coroutine::spawn(move || {
            let payload = payload;
            let SingleWorker(f) = payload;
            SingleWorker(f())
        })
    };
    match handle.join() {
        Ok(SingleWorker(value)) => value,
        Err(_) => panic!("root task panicked"),
    }
}

// The task cell of the coroutine currently running, if it was spawned as a
// Hemlock task. Suspension points read this to observe cancellation.
// Coroutine-local (not thread-local) so the association survives scheduling.
may::coroutine_local!(static CURRENT_TASK: RefCell<Option<Rc<TaskCell>>> = RefCell::new(None));

pub fn set_current_task(task: Option<Rc<TaskCell>>) {
    CURRENT_TASK.with(|slot| *slot.borrow_mut() = task);
}

pub fn current_task() -> Option<Rc<TaskCell>> {
    CURRENT_TASK.with(|slot| slot.borrow().clone())
}

/// Whether the running task has been asked to cancel. The root program is
/// not a task and never reports cancelled.
pub fn current_cancel_requested() -> bool {
    CURRENT_TASK.with(|slot| {
        slot.borrow()
            .as_ref()
            .is_some_and(|task| task.cancel_requested())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_stack_size_valid() {
        assert_eq!(parse_stack_size(Some("2097152".to_string())), 2097152);
    }

    #[test]
    fn test_parse_stack_size_invalid_falls_back() {
        assert_eq!(parse_stack_size(None), DEFAULT_STACK_SIZE);
        assert_eq!(parse_stack_size(Some("0".to_string())), DEFAULT_STACK_SIZE);
        assert_eq!(
            parse_stack_size(Some("not-a-number".to_string())),
            DEFAULT_STACK_SIZE
        );
    }

    #[test]
    #[serial]
    fn test_run_on_worker_round_trip() {
        let result = run_on_worker(|| 40 + 2);
        assert_eq!(result, 42);
    }

    #[test]
    #[serial]
    fn test_current_task_defaults_to_none() {
        let has_task = run_on_worker(|| current_task().is_some());
        assert!(!has_task);
        assert!(!current_cancel_requested());
    }
}

#[cfg(test)]
mod diag_tests {
    use super::*;
    #[test]
    #[serial_test::serial]
    fn diag_nested_spawn_join() {
        let result = run_on_worker(|| {
            let task = unsafe {
                may::coroutine::spawn(|| {
                    eprintln!("inner coroutine running");
                    42
                })
            };
            loop {
                eprintln!("polling");
                if task.is_done() {
                    break;
                }
                may::coroutine::yield_now();
            }
            99
        });
        assert_eq!(result, 99);
    }
}
