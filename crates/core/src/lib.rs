//! Core runtime library for the Hemlock language
//!
//! The pieces every execution path shares: the tagged [`value::Value`] sum,
//! lexical [`env::Env`] chains with explicit cycle breaking, the control
//! signal protocol in [`control`], numeric/operator semantics in [`arith`],
//! and the channel and task cells the cooperative scheduler drives.

pub mod arith;
pub mod channel;
pub mod control;
pub mod env;
pub mod task;
pub mod value;

pub use channel::{ChannelCell, ChannelError};
pub use control::{Control, ErrorKind, EvalResult, ExecResult, Thrown};
pub use env::{break_cycles, AssignOutcome, Env};
pub use task::{TaskCell, TaskState};
pub use value::{
    ArrayCell, BufferCell, FileCell, FunctionCell, FunctionKind, ObjectCell, SocketCell,
    SocketHandle, Value,
};
