//! Control signals and thrown values
//!
//! Statement evaluation returns `Result<Control, Thrown>`: the `Ok` side
//! carries normal completion, `return`, `break`, and `continue`; the `Err`
//! side is a `throw` in flight, so exception propagation rides `?` through
//! every recursive evaluator call. `try`/`catch` is the only place that
//! matches on the `Err` side.

use crate::value::Value;
use hemlock_compiler::ast::SourceLocation;

/// Non-throw completion of a statement
#[derive(Debug, Clone)]
pub enum Control {
    Normal,
    Return(Value),
    Break,
    Continue,
}

impl Control {
    pub fn is_normal(&self) -> bool {
        matches!(self, Control::Normal)
    }
}

/// One frame of the call chain captured when a throw propagates
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub function: String,
    pub loc: SourceLocation,
}

/// A throw in flight: the thrown value plus the call-chain snapshot used
/// for the uncaught-throw stack trace.
#[derive(Debug, Clone)]
pub struct Thrown {
    pub value: Value,
    pub trace: Vec<TraceFrame>,
}

impl Thrown {
    pub fn new(value: Value) -> Self {
        Thrown { value, trace: Vec::new() }
    }

    pub fn push_frame(&mut self, function: &str, loc: &SourceLocation) {
        self.trace.push(TraceFrame {
            function: function.to_string(),
            loc: loc.clone(),
        });
    }

    /// Render the trace for an uncaught throw, innermost frame first
    pub fn render_trace(&self) -> String {
        let mut out = String::new();
        for frame in &self.trace {
            out.push_str(&format!("  at {} ({})\n", frame.function, frame.loc));
        }
        out
    }
}

/// Runtime error categories. Each surfaces to user code as a thrown string
/// prefixed with the category name, so `catch` blocks can match on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Runtime,
    Type,
    Name,
    Index,
    ConstViolation,
    Module,
    Io,
    Cancelled,
}

impl ErrorKind {
    pub fn prefix(self) -> &'static str {
        match self {
            ErrorKind::Runtime => "RuntimeError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Name => "NameError",
            ErrorKind::Index => "IndexError",
            ErrorKind::ConstViolation => "ConstViolation",
            ErrorKind::Module => "ModuleError",
            ErrorKind::Io => "IOError",
            ErrorKind::Cancelled => "Cancelled",
        }
    }
}

/// Build a thrown error value: `Throw("TypeError: ...")`
pub fn error(kind: ErrorKind, message: impl AsRef<str>) -> Thrown {
    Thrown::new(Value::string(format!(
        "{}: {}",
        kind.prefix(),
        message.as_ref()
    )))
}

pub fn type_error(message: impl AsRef<str>) -> Thrown {
    error(ErrorKind::Type, message)
}

pub fn name_error(name: &str) -> Thrown {
    error(ErrorKind::Name, format!("undefined variable '{}'", name))
}

pub fn index_error(message: impl AsRef<str>) -> Thrown {
    error(ErrorKind::Index, message)
}

pub fn const_violation(name: &str) -> Thrown {
    error(
        ErrorKind::ConstViolation,
        format!("cannot assign to const '{}'", name),
    )
}

pub fn runtime_error(message: impl AsRef<str>) -> Thrown {
    error(ErrorKind::Runtime, message)
}

pub fn module_error(message: impl AsRef<str>) -> Thrown {
    error(ErrorKind::Module, message)
}

pub fn io_error(message: impl AsRef<str>) -> Thrown {
    error(ErrorKind::Io, message)
}

pub fn cancelled() -> Thrown {
    Thrown::new(Value::string("Cancelled"))
}

/// Statement evaluation result
pub type ExecResult = Result<Control, Thrown>;
/// Expression evaluation result
pub type EvalResult = Result<Value, Thrown>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_prefixes() {
        let err = type_error("operands must be numeric");
        assert_eq!(
            err.value.as_str().unwrap(),
            "TypeError: operands must be numeric"
        );
        let err = name_error("x");
        assert_eq!(err.value.as_str().unwrap(), "NameError: undefined variable 'x'");
        assert_eq!(cancelled().value.as_str().unwrap(), "Cancelled");
    }

    #[test]
    fn test_trace_rendering() {
        let mut thrown = runtime_error("boom");
        thrown.push_frame("inner", &SourceLocation::unknown());
        thrown.push_frame("outer", &SourceLocation::unknown());
        let trace = thrown.render_trace();
        let inner_pos = trace.find("inner").unwrap();
        let outer_pos = trace.find("outer").unwrap();
        assert!(inner_pos < outer_pos);
    }
}
