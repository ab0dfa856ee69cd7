//! TCP socket values
//!
//! Built on May's coroutine-aware sockets, so reads and accepts yield the
//! task instead of blocking the worker thread. Socket descriptors are
//! runtime ids from a monotonic counter; address and port metadata ride on
//! the cell for the virtual properties.

use hemlock_core::control::{io_error, type_error, EvalResult};
use hemlock_core::value::{SocketCell, SocketHandle, Value};
use may::net::{TcpListener, TcpStream};
use std::io::{Read, Write};
use std::rc::Rc;
use std::sync::atomic::{AtomicI32, Ordering};

static NEXT_SOCKET_ID: AtomicI32 = AtomicI32::new(1);

/// Cap on a single read to keep one peer from ballooning memory
const MAX_READ_SIZE: usize = 1 << 20;

const DEFAULT_READ_SIZE: usize = 4096;

fn next_id() -> i32 {
    NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed)
}

/// `tcp_listen(port)` binds 0.0.0.0 and returns a listener socket
pub fn tcp_listen(port: i64) -> EvalResult {
    if !(0..=u16::MAX as i64).contains(&port) {
        return Err(type_error(format!("tcp_listen: invalid port {}", port)));
    }
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .map_err(|e| io_error(format!("tcp_listen {}: {}", addr, e)))?;
    // Port 0 asks the OS to pick; report the bound port.
    let bound_port = listener
        .local_addr()
        .map(|a| a.port())
        .unwrap_or(port as u16);
    Ok(Value::Socket(SocketCell::new(
        SocketHandle::Listener(listener),
        next_id(),
        "0.0.0.0".to_string(),
        bound_port,
    )))
}

pub fn tcp_connect(host: &str, port: i64) -> EvalResult {
    if !(0..=u16::MAX as i64).contains(&port) {
        return Err(type_error(format!("tcp_connect: invalid port {}", port)));
    }
    let addr = format!("{}:{}", host, port);
    let stream = TcpStream::connect(&addr)
        .map_err(|e| io_error(format!("tcp_connect {}: {}", addr, e)))?;
    Ok(Value::Socket(SocketCell::new(
        SocketHandle::Stream(stream),
        next_id(),
        host.to_string(),
        port as u16,
    )))
}

/// Socket methods: `accept` (listener), `read`/`write` (stream), `close`
pub fn socket_method(cell: &Rc<SocketCell>, name: &str, args: Vec<Value>) -> EvalResult {
    match name {
        "accept" => {
            let mut handle = cell.handle.borrow_mut();
            let Some(SocketHandle::Listener(listener)) = handle.as_mut() else {
                return Err(io_error("accept: not an open listener socket"));
            };
            let (stream, peer) = listener
                .accept()
                .map_err(|e| io_error(format!("accept: {}", e)))?;
            Ok(Value::Socket(SocketCell::new(
                SocketHandle::Stream(stream),
                next_id(),
                peer.ip().to_string(),
                peer.port(),
            )))
        }
        "read" => {
            let limit = args
                .first()
                .and_then(|v| v.as_int_wide())
                .map(|n| (n.max(0) as usize).min(MAX_READ_SIZE))
                .unwrap_or(DEFAULT_READ_SIZE);
            let mut handle = cell.handle.borrow_mut();
            let Some(SocketHandle::Stream(stream)) = handle.as_mut() else {
                return Err(io_error("read: not an open stream socket"));
            };
            let mut buf = vec![0u8; limit];
            let n = stream
                .read(&mut buf)
                .map_err(|e| io_error(format!("read: {}", e)))?;
            buf.truncate(n);
            Ok(Value::string(String::from_utf8_lossy(&buf).into_owned()))
        }
        "write" => {
            let text = match args.first() {
                Some(Value::Str(s)) => s.to_string(),
                Some(other) => other.to_display(),
                None => return Err(type_error("write: expected an argument")),
            };
            let mut handle = cell.handle.borrow_mut();
            let Some(SocketHandle::Stream(stream)) = handle.as_mut() else {
                return Err(io_error("write: not an open stream socket"));
            };
            stream
                .write_all(text.as_bytes())
                .map_err(|e| io_error(format!("write: {}", e)))?;
            Ok(Value::I64(text.len() as i64))
        }
        "close" => {
            cell.close();
            Ok(Value::Null)
        }
        _ => Err(type_error(format!("no method '{}' on socket", name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_listen_reports_bound_port() {
        crate::scheduler::scheduler_init();
        let Value::Socket(listener) = tcp_listen(0).unwrap() else {
            panic!("expected socket value");
        };
        assert!(listener.port > 0);
        assert_eq!(listener.address, "0.0.0.0");
        assert!(!listener.closed.get());
        socket_method(&listener, "close", vec![]).unwrap();
        assert!(listener.closed.get());
        // Operations on a closed socket fail with IOError.
        let err = socket_method(&listener, "accept", vec![]).unwrap_err();
        assert!(err.value.as_str().unwrap().starts_with("IOError"));
    }

    #[test]
    fn test_invalid_port_rejected() {
        assert!(tcp_listen(70000).is_err());
        assert!(tcp_connect("localhost", -1).is_err());
    }
}
