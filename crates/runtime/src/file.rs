//! File values and filesystem builtins
//!
//! File handles are refcounted cells; the descriptor closes on `close()` or
//! when the last reference drops, whichever comes first, so
//! `let f = open(p); defer f.close();` releases on every exit path. Native
//! failures surface as IOError throws carrying the OS error text.

use hemlock_core::control::{io_error, type_error, EvalResult};
use hemlock_core::value::{FileCell, Value};
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::rc::Rc;

/// `open(path, mode)` with modes `r`, `w`, `a`, `rw`
pub fn open_file(path: &str, mode: &str) -> EvalResult {
    let mut options = OpenOptions::new();
    match mode {
        "r" => options.read(true),
        "w" => options.write(true).create(true).truncate(true),
        "a" => options.append(true).create(true),
        "rw" | "r+" => options.read(true).write(true).create(true),
        other => {
            return Err(type_error(format!(
                "open: unknown mode '{}' (use r, w, a, rw)",
                other
            )));
        }
    };
    let file = options
        .open(path)
        .map_err(|e| io_error(format!("open {}: {}", path, e)))?;
    Ok(Value::File(FileCell::new(file, path)))
}

pub fn read_file(path: &str) -> EvalResult {
    let content = std::fs::read_to_string(path)
        .map_err(|e| io_error(format!("read_file {}: {}", path, e)))?;
    Ok(Value::string(content))
}

pub fn write_file(path: &str, content: &str) -> EvalResult {
    std::fs::write(path, content)
        .map_err(|e| io_error(format!("write_file {}: {}", path, e)))?;
    Ok(Value::Null)
}

/// File methods: `read` (remaining content, or up to N bytes), `write`
/// (returns bytes written), `close` (idempotent).
pub fn file_method(cell: &Rc<FileCell>, name: &str, args: Vec<Value>) -> EvalResult {
    match name {
        "read" => {
            let mut handle = cell.handle.borrow_mut();
            let file = handle
                .as_mut()
                .ok_or_else(|| io_error(format!("read: {} is closed", cell.path)))?;
            match args.first().and_then(|v| v.as_int_wide()) {
                Some(limit) => {
                    let mut buf = vec![0u8; limit.max(0) as usize];
                    let n = file
                        .read(&mut buf)
                        .map_err(|e| io_error(format!("read {}: {}", cell.path, e)))?;
                    buf.truncate(n);
                    Ok(Value::string(String::from_utf8_lossy(&buf).into_owned()))
                }
                None => {
                    let mut content = String::new();
                    file.read_to_string(&mut content)
                        .map_err(|e| io_error(format!("read {}: {}", cell.path, e)))?;
                    Ok(Value::string(content))
                }
            }
        }
        "write" => {
            let text = match args.first() {
                Some(Value::Str(s)) => s.to_string(),
                Some(other) => other.to_display(),
                None => return Err(type_error("write: expected an argument")),
            };
            let mut handle = cell.handle.borrow_mut();
            let file = handle
                .as_mut()
                .ok_or_else(|| io_error(format!("write: {} is closed", cell.path)))?;
            file.write_all(text.as_bytes())
                .map_err(|e| io_error(format!("write {}: {}", cell.path, e)))?;
            Ok(Value::I64(text.len() as i64))
        }
        "close" => {
            cell.close();
            Ok(Value::Null)
        }
        _ => Err(type_error(format!("no method '{}' on file", name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_read_write_close() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.txt");
        let path_str = path.to_string_lossy().into_owned();

        let Value::File(file) = open_file(&path_str, "w").unwrap() else {
            panic!("expected file value");
        };
        file_method(&file, "write", vec![Value::string("hello")]).unwrap();
        file_method(&file, "close", vec![]).unwrap();
        assert!(file.is_closed());
        // Writes after close fail with IOError.
        let err = file_method(&file, "write", vec![Value::string("x")]).unwrap_err();
        assert!(err.value.as_str().unwrap().starts_with("IOError"));

        let Value::Str(content) = read_file(&path_str).unwrap() else {
            panic!("expected string");
        };
        assert_eq!(&*content, "hello");
    }

    #[test]
    fn test_open_missing_file_is_io_error() {
        let err = open_file("/nonexistent/definitely/missing", "r").unwrap_err();
        let message = err.value.as_str().unwrap();
        assert!(message.starts_with("IOError"));
    }

    #[test]
    fn test_read_with_limit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, "abcdef").unwrap();
        let Value::File(file) = open_file(&path.to_string_lossy(), "r").unwrap() else {
            panic!("expected file value");
        };
        let Value::Str(chunk) = file_method(&file, "read", vec![Value::I32(3)]).unwrap()
        else {
            panic!("expected string");
        };
        assert_eq!(&*chunk, "abc");
    }

    #[test]
    fn test_bad_mode_rejected() {
        let err = open_file("x", "q").unwrap_err();
        assert!(err.value.as_str().unwrap().contains("unknown mode"));
    }
}
