//! Builtin dispatch
//!
//! Well-known names resolve through this string-keyed table only when no
//! lexical or imported binding shadows them - the evaluator checks the
//! environment chain first and falls back here (the shadowing check is
//! mandatory: user code may alias names like `sleep`).
//!
//! Native methods (`chan.send`, `arr.push`, `file.close`, ...) dispatch per
//! receiver type through [`call_method`]; property access turns them into
//! bound function values so they can also be passed around.

use crate::interp::Interp;
use crate::tasks;
use crate::{file, net, signal};
use hemlock_compiler::ast::SourceLocation;
use hemlock_compiler::codegen::BUILTIN_NAMES;
use hemlock_core::control::{runtime_error, type_error, EvalResult, Thrown};
use hemlock_core::value::{ArrayCell, BufferCell, FunctionCell, ObjectCell, Value};
use hemlock_core::ChannelCell;
use std::rc::Rc;

/// Resolve a builtin name to a function value, if the name is known
pub fn lookup(name: &str) -> Option<Value> {
    BUILTIN_NAMES
        .iter()
        .find(|&&n| n == name)
        .map(|&n| Value::Function(FunctionCell::builtin(n)))
}

fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).cloned().unwrap_or(Value::Null)
}

fn want_int(args: &[Value], i: usize, what: &str) -> Result<i64, Thrown> {
    arg(args, i)
        .as_int_wide()
        .map(|v| v as i64)
        .ok_or_else(|| type_error(format!("{}: expected integer argument", what)))
}

fn want_str(args: &[Value], i: usize, what: &str) -> Result<String, Thrown> {
    match arg(args, i) {
        Value::Str(s) => Ok(s.to_string()),
        other => Err(type_error(format!(
            "{}: expected string argument, got {}",
            what,
            other.type_name()
        ))),
    }
}

/// Dispatch a builtin call
pub fn call(
    interp: &Rc<Interp>,
    name: &str,
    args: Vec<Value>,
    loc: &SourceLocation,
) -> EvalResult {
    match name {
        "print" => {
            let line = args
                .iter()
                .map(|v| v.to_display())
                .collect::<Vec<_>>()
                .join(" ");
            interp.write_out(&line);
            interp.write_out("\n");
            Ok(Value::Null)
        }
        "typeof" => Ok(Value::string(arg(&args, 0).type_name())),
        "len" => match arg(&args, 0) {
            Value::Array(cell) => Ok(Value::I64(cell.elements.borrow().len() as i64)),
            Value::Str(s) => Ok(Value::I64(s.len() as i64)),
            Value::Object(cell) => Ok(Value::I64(cell.len() as i64)),
            Value::Buffer(cell) => Ok(Value::I64(cell.data.borrow().len() as i64)),
            other => Err(type_error(format!("len: no length for {}", other.type_name()))),
        },
        "to_string" => Ok(Value::string(arg(&args, 0).to_display())),
        "parse_int" => {
            let text = want_str(&args, 0, "parse_int")?;
            let parsed: i64 = text
                .trim()
                .parse()
                .map_err(|_| type_error(format!("parse_int: '{}' is not an integer", text)))?;
            Ok(Value::int_narrow(parsed))
        }
        "parse_float" => {
            let text = want_str(&args, 0, "parse_float")?;
            let parsed: f64 = text
                .trim()
                .parse()
                .map_err(|_| type_error(format!("parse_float: '{}' is not a number", text)))?;
            Ok(Value::F64(parsed))
        }
        "deep_equal" => Ok(Value::Bool(arg(&args, 0).deep_equals(&arg(&args, 1)))),
        "clone" => Ok(shallow_clone(&arg(&args, 0))),
        "keys" => match arg(&args, 0) {
            Value::Object(cell) => Ok(Value::array(
                cell.keys().into_iter().map(Value::string).collect(),
            )),
            other => Err(type_error(format!("keys: expected object, got {}", other.type_name()))),
        },
        "values" => match arg(&args, 0) {
            Value::Object(cell) => Ok(Value::array(cell.values())),
            other => Err(type_error(format!(
                "values: expected object, got {}",
                other.type_name()
            ))),
        },
        "buffer" => {
            let capacity = want_int(&args, 0, "buffer")?;
            if capacity < 0 {
                return Err(type_error("buffer: capacity must be non-negative"));
            }
            Ok(Value::Buffer(BufferCell::new(capacity as usize)))
        }
        "channel" => {
            let capacity = want_int(&args, 0, "channel")?;
            if capacity < 0 {
                return Err(type_error("channel: capacity must be non-negative"));
            }
            Ok(Value::Channel(ChannelCell::new(capacity as usize)))
        }
        "spawn" => {
            if args.is_empty() {
                return Err(type_error("spawn: expected a function argument"));
            }
            let func = args[0].clone();
            let rest = args[1..].to_vec();
            tasks::spawn_task(interp, func, rest)
        }
        "join" => match arg(&args, 0) {
            Value::Task(task) => tasks::join_task(interp, &task),
            other => Err(type_error(format!("join: expected task, got {}", other.type_name()))),
        },
        "detach" => match arg(&args, 0) {
            Value::Task(task) => {
                task.detach();
                Ok(Value::Null)
            }
            other => Err(type_error(format!(
                "detach: expected task, got {}",
                other.type_name()
            ))),
        },
        "cancel" => match arg(&args, 0) {
            Value::Task(task) => {
                task.request_cancel();
                Ok(Value::Null)
            }
            other => Err(type_error(format!(
                "cancel: expected task, got {}",
                other.type_name()
            ))),
        },
        "sleep" => {
            let ms = want_int(&args, 0, "sleep")?;
            tasks::sleep_ms(interp, ms.max(0) as u64)?;
            Ok(Value::Null)
        }
        "yield_now" => {
            tasks::yield_once(interp)?;
            Ok(Value::Null)
        }
        "signal" => {
            let signum = want_int(&args, 0, "signal")? as i32;
            signal::trap(interp, signum, arg(&args, 1))?;
            Ok(Value::Null)
        }
        "open" => {
            let path = want_str(&args, 0, "open")?;
            let mode = match args.get(1) {
                Some(Value::Str(m)) => m.to_string(),
                _ => "r".to_string(),
            };
            file::open_file(&path, &mode)
        }
        "read_file" => {
            let path = want_str(&args, 0, "read_file")?;
            file::read_file(&path)
        }
        "write_file" => {
            let path = want_str(&args, 0, "write_file")?;
            let content = want_str(&args, 1, "write_file")?;
            file::write_file(&path, &content)
        }
        "tcp_listen" => {
            let port = want_int(&args, 0, "tcp_listen")?;
            net::tcp_listen(port)
        }
        "tcp_connect" => {
            let host = want_str(&args, 0, "tcp_connect")?;
            let port = want_int(&args, 1, "tcp_connect")?;
            net::tcp_connect(&host, port)
        }
        "json_parse" => {
            let text = want_str(&args, 0, "json_parse")?;
            json_parse(&text)
        }
        "json_stringify" => {
            let json = value_to_json(&arg(&args, 0))?;
            Ok(Value::string(json.to_string()))
        }
        "free" => match arg(&args, 0) {
            // Non-owning FFI pointer: freeing it is the user's call, made
            // exactly here and never by the refcount machinery.
            Value::Ptr(0) | Value::Null => Ok(Value::Null),
            Value::Ptr(address) => {
                unsafe { libc::free(address as *mut libc::c_void) };
                Ok(Value::Null)
            }
            other => Err(type_error(format!("free: expected ptr, got {}", other.type_name()))),
        },
        "exit" => {
            let code = match args.first() {
                Some(v) => v.as_int_wide().unwrap_or(0) as i32,
                None => 0,
            };
            std::process::exit(code);
        }
        "args" => Ok(Value::array(
            interp.args.iter().map(Value::string).collect(),
        )),
        "assert" => {
            if arg(&args, 0).is_truthy() {
                Ok(Value::Null)
            } else {
                let message = match args.get(1) {
                    Some(Value::Str(m)) => format!("assertion failed: {}", m),
                    _ => "assertion failed".to_string(),
                };
                Err(runtime_error(message))
            }
        }
        other => Err(runtime_error(format!(
            "builtin '{}' is not implemented at {}",
            other, loc
        ))),
    }
}

fn shallow_clone(value: &Value) -> Value {
    match value {
        Value::Array(cell) => {
            let copy = ArrayCell::new(cell.elements.borrow().clone());
            *copy.elem_type.borrow_mut() = cell.elem_type.borrow().clone();
            Value::Array(copy)
        }
        Value::Object(cell) => {
            let copy = ObjectCell::from_entries(cell.entries_snapshot());
            *copy.type_tag.borrow_mut() = cell.type_tag.borrow().clone();
            Value::Object(copy)
        }
        other => other.clone(),
    }
}

// ----------------------------------------------------------------------
// Native methods
// ----------------------------------------------------------------------

const ARRAY_METHODS: &[&str] = &[
    "push", "pop", "insert", "remove", "clear", "index_of", "contains", "join",
];
const STRING_METHODS: &[&str] = &[
    "split",
    "trim",
    "to_upper",
    "to_lower",
    "contains",
    "starts_with",
    "ends_with",
    "replace",
    "substring",
    "char_at",
];
const OBJECT_METHODS: &[&str] = &["has", "remove", "keys", "values"];
const CHANNEL_METHODS: &[&str] = &["send", "recv", "close", "len"];
const TASK_METHODS: &[&str] = &["join", "cancel", "detach"];
const FILE_METHODS: &[&str] = &["read", "write", "close"];
const SOCKET_METHODS: &[&str] = &["accept", "read", "write", "close"];
const BUFFER_METHODS: &[&str] = &["push", "fill", "to_string"];

pub fn has_method(receiver: &Value, name: &str) -> bool {
    let table: &[&str] = match receiver {
        Value::Array(_) => ARRAY_METHODS,
        Value::Str(_) => STRING_METHODS,
        Value::Object(_) => OBJECT_METHODS,
        Value::Channel(_) => CHANNEL_METHODS,
        Value::Task(_) => TASK_METHODS,
        Value::File(_) => FILE_METHODS,
        Value::Socket(_) => SOCKET_METHODS,
        Value::Buffer(_) => BUFFER_METHODS,
        _ => return false,
    };
    table.contains(&name)
}

pub fn call_method(
    interp: &Rc<Interp>,
    receiver: &Value,
    name: &str,
    args: Vec<Value>,
    loc: &SourceLocation,
) -> EvalResult {
    match receiver {
        Value::Array(cell) => array_method(interp, cell, name, args),
        Value::Str(s) => string_method(s, name, args),
        Value::Object(cell) => object_method(cell, name, args),
        Value::Channel(cell) => tasks::channel_method(interp, cell, name, args),
        Value::Task(task) => match name {
            "join" => tasks::join_task(interp, task),
            "cancel" => {
                task.request_cancel();
                Ok(Value::Null)
            }
            "detach" => {
                task.detach();
                Ok(Value::Null)
            }
            _ => Err(no_such_method(receiver, name)),
        },
        Value::File(cell) => file::file_method(cell, name, args),
        Value::Socket(cell) => net::socket_method(cell, name, args),
        Value::Buffer(cell) => buffer_method(cell, name, args),
        other => Err(type_error(format!(
            "no method '{}' on {} at {}",
            name,
            other.type_name(),
            loc
        ))),
    }
}

fn no_such_method(receiver: &Value, name: &str) -> Thrown {
    type_error(format!(
        "no method '{}' on {}",
        name,
        receiver.type_name()
    ))
}

fn array_method(
    interp: &Rc<Interp>,
    cell: &Rc<ArrayCell>,
    name: &str,
    args: Vec<Value>,
) -> EvalResult {
    match name {
        "push" => {
            let mut value = arg(&args, 0);
            // A typed array checks every write against its element tag.
            let elem_type = cell.elem_type.borrow().clone();
            if let Some(annotation) = elem_type {
                value = interp.coerce(value, &annotation, "array element")?;
            }
            cell.elements.borrow_mut().push(value);
            Ok(Value::I64(cell.elements.borrow().len() as i64))
        }
        "pop" => Ok(cell.elements.borrow_mut().pop().unwrap_or(Value::Null)),
        "insert" => {
            let i = want_int(&args, 0, "insert")?;
            let mut value = arg(&args, 1);
            let elem_type = cell.elem_type.borrow().clone();
            if let Some(annotation) = elem_type {
                value = interp.coerce(value, &annotation, "array element")?;
            }
            let mut elements = cell.elements.borrow_mut();
            if i < 0 || i as usize > elements.len() {
                return Err(hemlock_core::control::index_error(format!(
                    "insert index {} out of range (length {})",
                    i,
                    elements.len()
                )));
            }
            elements.insert(i as usize, value);
            Ok(Value::Null)
        }
        "remove" => {
            let i = want_int(&args, 0, "remove")?;
            let mut elements = cell.elements.borrow_mut();
            if i < 0 || i as usize >= elements.len() {
                return Err(hemlock_core::control::index_error(format!(
                    "remove index {} out of range (length {})",
                    i,
                    elements.len()
                )));
            }
            Ok(elements.remove(i as usize))
        }
        "clear" => {
            cell.elements.borrow_mut().clear();
            Ok(Value::Null)
        }
        "index_of" => {
            let needle = arg(&args, 0);
            let elements = cell.elements.borrow();
            Ok(match elements.iter().position(|v| v.equals(&needle)) {
                Some(i) => Value::int_narrow(i as i64),
                None => Value::I32(-1),
            })
        }
        "contains" => {
            let needle = arg(&args, 0);
            let elements = cell.elements.borrow();
            Ok(Value::Bool(elements.iter().any(|v| v.equals(&needle))))
        }
        "join" => {
            let sep = match args.first() {
                Some(Value::Str(s)) => s.to_string(),
                _ => ",".to_string(),
            };
            let elements = cell.elements.borrow();
            let joined: Vec<String> = elements.iter().map(|v| v.to_display()).collect();
            Ok(Value::string(joined.join(&sep)))
        }
        _ => Err(no_such_method(&Value::Array(cell.clone()), name)),
    }
}

fn string_method(s: &Rc<str>, name: &str, args: Vec<Value>) -> EvalResult {
    match name {
        "split" => {
            let sep = want_str(&args, 0, "split")?;
            let parts: Vec<Value> = if sep.is_empty() {
                s.chars().map(|c| Value::string(c.to_string())).collect()
            } else {
                s.split(&sep).map(Value::string).collect()
            };
            Ok(Value::array(parts))
        }
        "trim" => Ok(Value::string(s.trim())),
        "to_upper" => Ok(Value::string(s.to_uppercase())),
        "to_lower" => Ok(Value::string(s.to_lowercase())),
        "contains" => {
            let needle = want_str(&args, 0, "contains")?;
            Ok(Value::Bool(s.contains(&needle)))
        }
        "starts_with" => {
            let prefix = want_str(&args, 0, "starts_with")?;
            Ok(Value::Bool(s.starts_with(&prefix)))
        }
        "ends_with" => {
            let suffix = want_str(&args, 0, "ends_with")?;
            Ok(Value::Bool(s.ends_with(&suffix)))
        }
        "replace" => {
            let from = want_str(&args, 0, "replace")?;
            let to = want_str(&args, 1, "replace")?;
            Ok(Value::string(s.replace(&from, &to)))
        }
        "substring" => {
            let start = want_int(&args, 0, "substring")?.max(0) as usize;
            let chars: Vec<char> = s.chars().collect();
            let end = match args.get(1) {
                Some(v) => v
                    .as_int_wide()
                    .map(|e| (e.max(0) as usize).min(chars.len()))
                    .unwrap_or(chars.len()),
                None => chars.len(),
            };
            if start >= chars.len() || start >= end {
                return Ok(Value::string(""));
            }
            Ok(Value::string(chars[start..end].iter().collect::<String>()))
        }
        "char_at" => {
            let i = want_int(&args, 0, "char_at")?;
            if i < 0 {
                return Ok(Value::Null);
            }
            Ok(match s.chars().nth(i as usize) {
                Some(c) => Value::Rune(c),
                None => Value::Null,
            })
        }
        _ => Err(no_such_method(&Value::Str(s.clone()), name)),
    }
}

fn object_method(cell: &Rc<ObjectCell>, name: &str, args: Vec<Value>) -> EvalResult {
    match name {
        "has" => {
            let key = want_str(&args, 0, "has")?;
            Ok(Value::Bool(cell.has(&key)))
        }
        "remove" => {
            let key = want_str(&args, 0, "remove")?;
            Ok(cell.remove(&key).unwrap_or(Value::Null))
        }
        "keys" => Ok(Value::array(
            cell.keys().into_iter().map(Value::string).collect(),
        )),
        "values" => Ok(Value::array(cell.values())),
        _ => Err(no_such_method(&Value::Object(cell.clone()), name)),
    }
}

fn buffer_method(cell: &Rc<BufferCell>, name: &str, args: Vec<Value>) -> EvalResult {
    match name {
        "push" => {
            let byte = want_int(&args, 0, "push")?;
            let mut data = cell.data.borrow_mut();
            if data.len() >= cell.capacity {
                return Err(runtime_error(format!(
                    "buffer full (capacity {})",
                    cell.capacity
                )));
            }
            data.push(byte as u8);
            Ok(Value::I64(data.len() as i64))
        }
        "fill" => {
            let byte = want_int(&args, 0, "fill")?;
            let mut data = cell.data.borrow_mut();
            data.resize(cell.capacity, 0);
            data.fill(byte as u8);
            Ok(Value::Null)
        }
        "to_string" => {
            let data = cell.data.borrow();
            Ok(Value::string(String::from_utf8_lossy(&data).into_owned()))
        }
        _ => Err(no_such_method(&Value::Buffer(cell.clone()), name)),
    }
}

// ----------------------------------------------------------------------
// JSON interchange
// ----------------------------------------------------------------------

fn json_parse(text: &str) -> EvalResult {
    let parsed: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| type_error(format!("json_parse: {}", e)))?;
    Ok(json_to_value(&parsed))
}

fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::int_narrow(i)
            } else if let Some(u) = n.as_u64() {
                Value::U64(u)
            } else {
                Value::F64(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::string(s),
        serde_json::Value::Array(items) => {
            Value::array(items.iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(map) => {
            let object = ObjectCell::new();
            for (key, value) in map {
                object.set(key, json_to_value(value));
            }
            Value::Object(object)
        }
    }
}

fn value_to_json(value: &Value) -> Result<serde_json::Value, Thrown> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::F32(v) => json_float(*v as f64)?,
        Value::F64(v) => json_float(*v)?,
        Value::Rune(c) => serde_json::Value::String(c.to_string()),
        Value::Str(s) => serde_json::Value::String(s.to_string()),
        other if other.is_integer() => {
            let wide = other.as_int_wide().expect("integer");
            if wide >= 0 {
                serde_json::Value::from(wide as u64)
            } else {
                serde_json::Value::from(wide as i64)
            }
        }
        Value::Array(cell) => {
            let elements = cell.elements.borrow();
            let mut out = Vec::with_capacity(elements.len());
            for element in elements.iter() {
                out.push(value_to_json(element)?);
            }
            serde_json::Value::Array(out)
        }
        Value::Object(cell) => {
            let mut map = serde_json::Map::new();
            for (key, field) in cell.entries_snapshot() {
                map.insert(key, value_to_json(&field)?);
            }
            serde_json::Value::Object(map)
        }
        other => {
            return Err(type_error(format!(
                "json_stringify: {} is not serializable",
                other.type_name()
            )));
        }
    })
}

fn json_float(v: f64) -> Result<serde_json::Value, Thrown> {
    serde_json::Number::from_f64(v)
        .map(serde_json::Value::Number)
        .ok_or_else(|| type_error("json_stringify: non-finite float"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_builtin_name_resolves() {
        for name in BUILTIN_NAMES {
            assert!(lookup(name).is_some(), "missing builtin {}", name);
        }
        assert!(lookup("no_such_builtin").is_none());
    }

    #[test]
    fn test_method_tables() {
        assert!(has_method(&Value::array(vec![]), "push"));
        assert!(has_method(&Value::string("x"), "split"));
        assert!(!has_method(&Value::I32(1), "push"));
        assert!(has_method(&Value::Channel(ChannelCell::new(0)), "send"));
    }

    #[test]
    fn test_json_round_trip() {
        let obj = ObjectCell::new();
        obj.set("n", Value::I32(3));
        obj.set("s", Value::string("hi"));
        obj.set("xs", Value::array(vec![Value::Bool(true), Value::Null]));
        let json = value_to_json(&Value::Object(obj)).unwrap().to_string();
        let back = json_parse(&json).unwrap();
        let Value::Object(back) = back else { panic!("expected object") };
        assert!(matches!(back.get("n"), Some(Value::I32(3))));
        assert!(matches!(back.get("s"), Some(Value::Str(s)) if &*s == "hi"));
    }

    #[test]
    fn test_json_rejects_channels() {
        let err = value_to_json(&Value::Channel(ChannelCell::new(0))).unwrap_err();
        assert!(err.value.as_str().unwrap().contains("not serializable"));
    }
}
