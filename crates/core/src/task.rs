//! Task cells
//!
//! A task is a cooperatively scheduled unit of user-visible concurrency:
//! a function value plus captured arguments, run by the scheduler in
//! hemlock-runtime. The cell here is the shared handle - state, result,
//! and the cancellation flag observed at suspension points.

use crate::control::Thrown;
use crate::value::Value;
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Runnable,
    Running,
    Done,
    Cancelled,
}

#[derive(Debug)]
pub struct TaskCell {
    pub id: u64,
    state: Cell<TaskState>,
    /// Set exactly once when the task finishes: its return value, or the
    /// throw that terminated it (re-thrown by `join`).
    result: RefCell<Option<Result<Value, Thrown>>>,
    cancel_requested: Cell<bool>,
    detached: Cell<bool>,
}

impl TaskCell {
    pub fn new() -> std::rc::Rc<Self> {
        std::rc::Rc::new(TaskCell {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            state: Cell::new(TaskState::Runnable),
            result: RefCell::new(None),
            cancel_requested: Cell::new(false),
            detached: Cell::new(false),
        })
    }

    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    pub fn set_running(&self) {
        self.state.set(TaskState::Running);
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state.get(), TaskState::Done | TaskState::Cancelled)
    }

    /// Record completion. A task that terminated because of cancellation
    /// lands in `Cancelled`, anything else in `Done`.
    pub fn complete(&self, result: Result<Value, Thrown>, was_cancelled: bool) {
        *self.result.borrow_mut() = Some(result);
        self.state.set(if was_cancelled {
            TaskState::Cancelled
        } else {
            TaskState::Done
        });
    }

    /// Clone out the stored result; `None` while still running
    pub fn result(&self) -> Option<Result<Value, Thrown>> {
        self.result.borrow().clone()
    }

    pub fn request_cancel(&self) {
        self.cancel_requested.set(true);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.get()
    }

    pub fn detach(&self) {
        self.detached.set(true);
    }

    pub fn is_detached(&self) -> bool {
        self.detached.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let task = TaskCell::new();
        assert_eq!(task.state(), TaskState::Runnable);
        assert!(task.result().is_none());
        task.set_running();
        task.complete(Ok(Value::I32(7)), false);
        assert_eq!(task.state(), TaskState::Done);
        assert!(matches!(task.result(), Some(Ok(Value::I32(7)))));
    }

    #[test]
    fn test_cancellation_flag_and_state() {
        let task = TaskCell::new();
        assert!(!task.cancel_requested());
        task.request_cancel();
        assert!(task.cancel_requested());
        task.complete(Err(crate::control::cancelled()), true);
        assert_eq!(task.state(), TaskState::Cancelled);
        assert!(task.is_finished());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = TaskCell::new();
        let b = TaskCell::new();
        assert_ne!(a.id, b.id);
    }
}
