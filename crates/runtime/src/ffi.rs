//! FFI capability seam
//!
//! Native library loading is an external collaborator: the evaluator only
//! knows the [`FfiHost`] trait. The host initializes exactly once when the
//! interpreter is built and finalizes once at teardown, bracketed by the
//! main entry point. The default host has no loader and fails every call,
//! which keeps `import_ffi`/`extern_fn` parseable and runnable-to-the-error
//! on builds without native support.
//!
//! FFI pointers (`ptr` values) are non-owning handles: the runtime never
//! releases them, and the `free` builtin forwards to `libc::free` exactly
//! once at the user's request.

use hemlock_core::value::Value;

pub trait FfiHost {
    /// `import_ffi "libname";`
    fn load(&mut self, library: &str) -> Result<(), String>;

    /// Invoke a declared `extern_fn`
    fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, String>;

    /// Process-wide initialization; called exactly once
    fn init(&mut self) {}

    /// Process-wide finalization; called exactly once at teardown
    fn cleanup(&mut self) {}
}

/// Host used when no native loader is wired in
#[derive(Debug, Default)]
pub struct NullFfiHost;

impl FfiHost for NullFfiHost {
    fn load(&mut self, library: &str) -> Result<(), String> {
        Err(format!("FFI not available (import_ffi \"{}\")", library))
    }

    fn call(&mut self, name: &str, _args: &[Value]) -> Result<Value, String> {
        Err(format!("FFI not available (extern_fn {})", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_host_fails_closed() {
        let mut host = NullFfiHost;
        assert!(host.load("libm.so.6").is_err());
        assert!(host.call("sin", &[Value::F64(0.0)]).is_err());
    }
}
