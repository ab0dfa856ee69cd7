//! Value: what the language talks about
//!
//! A tagged sum over every Hemlock datum. Scalar variants are inline; the
//! heap variants are `Rc` cells, which is the reference counting the
//! language semantics describe - `clone` retains, `drop` releases, and a
//! cell dies exactly when its last owner lets go. Cycles only arise through
//! closures capturing their defining environment and are broken explicitly
//! at environment teardown (see `env::break_cycles`).

use crate::channel::ChannelCell;
use crate::env::Env;
use crate::task::TaskCell;
use hemlock_compiler::ast::{IntKind, Param, SourceLocation, Stmt, TypeAnnotation};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Array cell: mutable in place, optionally carrying an element-type tag.
/// Writes into a tagged array coerce to the tag or throw.
#[derive(Debug)]
pub struct ArrayCell {
    pub elements: RefCell<Vec<Value>>,
    pub elem_type: RefCell<Option<TypeAnnotation>>,
}

impl ArrayCell {
    pub fn new(elements: Vec<Value>) -> Rc<Self> {
        Rc::new(ArrayCell {
            elements: RefCell::new(elements),
            elem_type: RefCell::new(None),
        })
    }
}

/// Fixed-capacity byte region
#[derive(Debug)]
pub struct BufferCell {
    pub data: RefCell<Vec<u8>>,
    pub capacity: usize,
}

impl BufferCell {
    pub fn new(capacity: usize) -> Rc<Self> {
        Rc::new(BufferCell {
            data: RefCell::new(Vec::new()),
            capacity,
        })
    }
}

/// Object cell: string keys to values, insertion order preserved, with an
/// optional type tag assigned by a `define_object` coercion.
#[derive(Debug, Default)]
pub struct ObjectCell {
    entries: RefCell<Vec<(String, Value)>>,
    pub type_tag: RefCell<Option<String>>,
}

impl ObjectCell {
    pub fn new() -> Rc<Self> {
        Rc::new(ObjectCell::default())
    }

    pub fn from_entries(entries: Vec<(String, Value)>) -> Rc<Self> {
        Rc::new(ObjectCell {
            entries: RefCell::new(entries),
            type_tag: RefCell::new(None),
        })
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries
            .borrow()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn set(&self, key: &str, value: Value) {
        let mut entries = self.entries.borrow_mut();
        if let Some(slot) = entries.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        } else {
            entries.push((key.to_string(), value));
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.borrow().iter().any(|(k, _)| k == key)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.borrow_mut();
        let idx = entries.iter().position(|(k, _)| k == key)?;
        Some(entries.remove(idx).1)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.borrow().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries.borrow().iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn entries_snapshot(&self) -> Vec<(String, Value)> {
        self.entries.borrow().clone()
    }
}

/// What a function value runs when called
#[derive(Debug)]
pub enum FunctionKind {
    /// A user function: parsed parameters and body, deferred to call time
    Script {
        /// Diagnostic name, set when the literal lands in a `let`
        name: RefCell<Option<String>>,
        params: Rc<Vec<Param>>,
        body: Rc<Vec<Stmt>>,
        is_async: bool,
        loc: SourceLocation,
    },
    /// A builtin resolved through the dispatch table
    Builtin { name: &'static str },
    /// A native method bound to its receiver (`chan.send`, `arr.push`)
    Method { receiver: Value, name: String },
    /// A declared `extern_fn`, dispatched through the FFI capability
    Extern { name: String, arity: usize },
}

/// Function cell: code plus the captured closure environment.
///
/// The environment pointer sits in a `RefCell` so the cycle-break pass can
/// clear it when the function is about to become unreachable.
#[derive(Debug)]
pub struct FunctionCell {
    pub kind: FunctionKind,
    pub env: RefCell<Option<Rc<Env>>>,
}

impl FunctionCell {
    pub fn script(
        params: Rc<Vec<Param>>,
        body: Rc<Vec<Stmt>>,
        is_async: bool,
        loc: SourceLocation,
        env: Option<Rc<Env>>,
    ) -> Rc<Self> {
        Rc::new(FunctionCell {
            kind: FunctionKind::Script {
                name: RefCell::new(None),
                params,
                body,
                is_async,
                loc,
            },
            env: RefCell::new(env),
        })
    }

    pub fn builtin(name: &'static str) -> Rc<Self> {
        Rc::new(FunctionCell {
            kind: FunctionKind::Builtin { name },
            env: RefCell::new(None),
        })
    }

    pub fn method(receiver: Value, name: impl Into<String>) -> Rc<Self> {
        Rc::new(FunctionCell {
            kind: FunctionKind::Method { receiver, name: name.into() },
            env: RefCell::new(None),
        })
    }

    pub fn extern_fn(name: impl Into<String>, arity: usize) -> Rc<Self> {
        Rc::new(FunctionCell {
            kind: FunctionKind::Extern { name: name.into(), arity },
            env: RefCell::new(None),
        })
    }

    pub fn arity(&self) -> usize {
        match &self.kind {
            FunctionKind::Script { params, .. } => params.len(),
            FunctionKind::Extern { arity, .. } => *arity,
            _ => 0,
        }
    }

    pub fn required_arity(&self) -> usize {
        match &self.kind {
            FunctionKind::Script { params, .. } => {
                params.iter().take_while(|p| p.default.is_none()).count()
            }
            _ => 0,
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(&self.kind, FunctionKind::Script { is_async: true, .. })
    }

    pub fn describe(&self) -> String {
        match &self.kind {
            FunctionKind::Script { name, .. } => match name.borrow().as_deref() {
                Some(n) => format!("<fn {}>", n),
                None => "<fn>".to_string(),
            },
            FunctionKind::Builtin { name } => format!("<builtin {}>", name),
            FunctionKind::Method { name, .. } => format!("<method {}>", name),
            FunctionKind::Extern { name, .. } => format!("<extern {}>", name),
        }
    }
}

/// OS file handle; the descriptor closes when the handle cell is dropped
/// or `close()` runs, whichever comes first.
#[derive(Debug)]
pub struct FileCell {
    pub handle: RefCell<Option<std::fs::File>>,
    pub path: String,
}

impl FileCell {
    pub fn new(file: std::fs::File, path: impl Into<String>) -> Rc<Self> {
        Rc::new(FileCell {
            handle: RefCell::new(Some(file)),
            path: path.into(),
        })
    }

    pub fn close(&self) -> bool {
        self.handle.borrow_mut().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.handle.borrow().is_none()
    }
}

/// The two shapes a socket value can take
#[derive(Debug)]
pub enum SocketHandle {
    Listener(may::net::TcpListener),
    Stream(may::net::TcpStream),
}

/// OS socket with address/port metadata
#[derive(Debug)]
pub struct SocketCell {
    pub handle: RefCell<Option<SocketHandle>>,
    pub fd: i32,
    pub address: String,
    pub port: u16,
    pub closed: Cell<bool>,
}

impl SocketCell {
    pub fn new(handle: SocketHandle, fd: i32, address: String, port: u16) -> Rc<Self> {
        Rc::new(SocketCell {
            handle: RefCell::new(Some(handle)),
            fd,
            address,
            port,
            closed: Cell::new(false),
        })
    }

    pub fn close(&self) {
        self.handle.borrow_mut().take();
        self.closed.set(true);
    }
}

/// A Hemlock value. Scalars are inline; everything else is a refcounted
/// heap cell. `ptr` is a non-owning native pointer: the runtime never
/// releases it, `free()` is the user's responsibility.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Rune(char),
    Str(Rc<str>),
    Array(Rc<ArrayCell>),
    Buffer(Rc<BufferCell>),
    Object(Rc<ObjectCell>),
    Function(Rc<FunctionCell>),
    File(Rc<FileCell>),
    Channel(Rc<ChannelCell>),
    Task(Rc<TaskCell>),
    Socket(Rc<SocketCell>),
    Ptr(usize),
}

impl Value {
    pub fn string(s: impl AsRef<str>) -> Value {
        Value::Str(Rc::from(s.as_ref()))
    }

    /// Integer constructor from a two's-complement payload and width tag
    pub fn int(bits: u64, kind: IntKind) -> Value {
        match kind {
            IntKind::I8 => Value::I8(bits as i8),
            IntKind::I16 => Value::I16(bits as i16),
            IntKind::I32 => Value::I32(bits as i32),
            IntKind::I64 => Value::I64(bits as i64),
            IntKind::U8 => Value::U8(bits as u8),
            IntKind::U16 => Value::U16(bits as u16),
            IntKind::U32 => Value::U32(bits as u32),
            IntKind::U64 => Value::U64(bits),
        }
    }

    /// The narrowest signed tag that holds `v`: 32-bit if representable,
    /// else 64-bit.
    pub fn int_narrow(v: i64) -> Value {
        if v >= i32::MIN as i64 && v <= i32::MAX as i64 {
            Value::I32(v as i32)
        } else {
            Value::I64(v)
        }
    }

    pub fn array(elements: Vec<Value>) -> Value {
        Value::Array(ArrayCell::new(elements))
    }

    pub fn object() -> Value {
        Value::Object(ObjectCell::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Value::I8(_)
                | Value::I16(_)
                | Value::I32(_)
                | Value::I64(_)
                | Value::U8(_)
                | Value::U16(_)
                | Value::U32(_)
                | Value::U64(_)
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Value::F32(_) | Value::F64(_))
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integer() || self.is_float()
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer payload widened to i128 (u64 fits losslessly)
    pub fn as_int_wide(&self) -> Option<i128> {
        Some(match self {
            Value::I8(v) => *v as i128,
            Value::I16(v) => *v as i128,
            Value::I32(v) => *v as i128,
            Value::I64(v) => *v as i128,
            Value::U8(v) => *v as i128,
            Value::U16(v) => *v as i128,
            Value::U32(v) => *v as i128,
            Value::U64(v) => *v as i128,
            _ => return None,
        })
    }

    pub fn int_kind(&self) -> Option<IntKind> {
        Some(match self {
            Value::I8(_) => IntKind::I8,
            Value::I16(_) => IntKind::I16,
            Value::I32(_) => IntKind::I32,
            Value::I64(_) => IntKind::I64,
            Value::U8(_) => IntKind::U8,
            Value::U16(_) => IntKind::U16,
            Value::U32(_) => IntKind::U32,
            Value::U64(_) => IntKind::U64,
            _ => return None,
        })
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F32(v) => Some(*v as f64),
            Value::F64(v) => Some(*v),
            other => other.as_int_wide().map(|v| v as f64),
        }
    }

    /// `null` and `false` are falsy; numeric zero is falsy; empty string,
    /// array, and object are truthy (a value exists).
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::F32(v) => *v != 0.0,
            Value::F64(v) => *v != 0.0,
            other if other.is_integer() => other.as_int_wide() != Some(0),
            _ => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::I8(_) => "i8",
            Value::I16(_) => "i16",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::U8(_) => "u8",
            Value::U16(_) => "u16",
            Value::U32(_) => "u32",
            Value::U64(_) => "u64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Rune(_) => "rune",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Buffer(_) => "buffer",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::File(_) => "file",
            Value::Channel(_) => "channel",
            Value::Task(_) => "task",
            Value::Socket(_) => "socket",
            Value::Ptr(_) => "ptr",
        }
    }

    /// Structural equality on strings and numerics, reference identity on
    /// every other heap type. Mismatched types compare unequal rather than
    /// raising; ordering comparisons are the ones that demand compatibility.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Rune(a), Value::Rune(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (a, b) if a.is_numeric() && b.is_numeric() => {
                if a.is_float() || b.is_float() {
                    a.as_f64() == b.as_f64()
                } else {
                    a.as_int_wide() == b.as_int_wide()
                }
            }
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Buffer(a), Value::Buffer(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::File(a), Value::File(b)) => Rc::ptr_eq(a, b),
            (Value::Channel(a), Value::Channel(b)) => Rc::ptr_eq(a, b),
            (Value::Task(a), Value::Task(b)) => Rc::ptr_eq(a, b),
            (Value::Socket(a), Value::Socket(b)) => Rc::ptr_eq(a, b),
            (Value::Ptr(a), Value::Ptr(b)) => a == b,
            _ => false,
        }
    }

    /// Deep structural equality, exposed as the `deep_equal` builtin
    pub fn deep_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Array(a), Value::Array(b)) => {
                let a = a.elements.borrow();
                let b = b.elements.borrow();
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.deep_equals(y))
            }
            (Value::Object(a), Value::Object(b)) => {
                let a = a.entries_snapshot();
                let b = b.entries_snapshot();
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| matches!(other_get(b.as_slice(), k), Some(w) if v.deep_equals(w)))
            }
            _ => self.equals(other),
        }
    }

    /// Well-known virtual properties available on non-object values
    pub fn virtual_property(&self, name: &str) -> Option<Value> {
        match (self, name) {
            (Value::Array(a), "length") => Some(Value::I64(a.elements.borrow().len() as i64)),
            (Value::Str(s), "length") | (Value::Str(s), "byte_length") => {
                Some(Value::I64(s.len() as i64))
            }
            (Value::Buffer(b), "length") => Some(Value::I64(b.data.borrow().len() as i64)),
            (Value::Buffer(b), "capacity") => Some(Value::I64(b.capacity as i64)),
            (Value::Socket(s), "fd") => Some(Value::I32(s.fd)),
            (Value::Socket(s), "address") => Some(Value::string(&s.address)),
            (Value::Socket(s), "port") => Some(Value::U16(s.port)),
            (Value::Socket(s), "closed") => Some(Value::Bool(s.closed.get())),
            (Value::File(f), "path") => Some(Value::string(&f.path)),
            (Value::File(f), "closed") => Some(Value::Bool(f.is_closed())),
            _ => None,
        }
    }

    /// Display form used by `print` and string interpolation
    pub fn to_display(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            other => other.to_repr(),
        }
    }

    /// Container form: like display, but strings are quoted
    pub fn to_repr(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::I8(v) => v.to_string(),
            Value::I16(v) => v.to_string(),
            Value::I32(v) => v.to_string(),
            Value::I64(v) => v.to_string(),
            Value::U8(v) => v.to_string(),
            Value::U16(v) => v.to_string(),
            Value::U32(v) => v.to_string(),
            Value::U64(v) => v.to_string(),
            Value::F32(v) => format_float(*v as f64),
            Value::F64(v) => format_float(*v),
            Value::Rune(c) => c.to_string(),
            Value::Str(s) => format!("\"{}\"", s),
            Value::Array(a) => {
                let elements = a.elements.borrow();
                let inner: Vec<String> = elements.iter().map(|v| v.to_repr()).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Buffer(b) => {
                format!("<buffer {}/{}>", b.data.borrow().len(), b.capacity)
            }
            Value::Object(o) => {
                let entries = o.entries_snapshot();
                let inner: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v.to_repr()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Value::Function(f) => f.describe(),
            Value::File(f) => format!("<file {}>", f.path),
            Value::Channel(c) => format!("<channel {}>", c.id),
            Value::Task(t) => format!("<task {}>", t.id),
            Value::Socket(s) => format!("<socket fd={}>", s.fd),
            Value::Ptr(p) => format!("<ptr {:#x}>", p),
        }
    }
}

fn other_get<'a>(entries: &'a [(String, Value)], key: &str) -> Option<&'a Value> {
    entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

/// Floats always show a decimal point so they read as floats
fn format_float(v: f64) -> String {
    if v.is_finite() && v == v.trunc() && v.abs() < 1e15 {
        format!("{:.1}", v)
    } else {
        format!("{}", v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::I32(0).is_truthy());
        assert!(!Value::U64(0).is_truthy());
        assert!(!Value::F64(0.0).is_truthy());
        // Empty containers are truthy: a value exists.
        assert!(Value::string("").is_truthy());
        assert!(Value::array(vec![]).is_truthy());
        assert!(Value::object().is_truthy());
        assert!(Value::I32(-1).is_truthy());
    }

    #[test]
    fn test_int_narrowing() {
        assert!(matches!(Value::int_narrow(5), Value::I32(5)));
        assert!(matches!(Value::int_narrow(3_000_000_000), Value::I64(_)));
        assert!(matches!(Value::int_narrow(-3_000_000_000), Value::I64(_)));
    }

    #[test]
    fn test_equality_strings_structural_arrays_by_identity() {
        assert!(Value::string("ab").equals(&Value::string("ab")));
        let a = Value::array(vec![Value::I32(1)]);
        let b = Value::array(vec![Value::I32(1)]);
        assert!(!a.equals(&b));
        assert!(a.equals(&a.clone()));
        assert!(a.deep_equals(&b));
    }

    #[test]
    fn test_numeric_equality_across_widths() {
        assert!(Value::I32(1).equals(&Value::U64(1)));
        assert!(Value::I32(1).equals(&Value::F64(1.0)));
        assert!(!Value::I32(1).equals(&Value::F64(1.5)));
    }

    #[test]
    fn test_object_insertion_order() {
        let obj = ObjectCell::new();
        obj.set("b", Value::I32(1));
        obj.set("a", Value::I32(2));
        obj.set("b", Value::I32(3));
        assert_eq!(obj.keys(), vec!["b", "a"]);
        assert!(matches!(obj.get("b"), Some(Value::I32(3))));
    }

    #[test]
    fn test_virtual_properties() {
        let s = Value::string("héllo");
        assert!(matches!(s.virtual_property("length"), Some(Value::I64(6))));
        assert!(matches!(
            s.virtual_property("byte_length"),
            Some(Value::I64(6))
        ));
        let arr = Value::array(vec![Value::I32(1), Value::I32(2)]);
        assert!(matches!(
            arr.virtual_property("length"),
            Some(Value::I64(2))
        ));
        assert!(arr.virtual_property("capacity").is_none());
        let buf = Value::Buffer(BufferCell::new(16));
        assert!(matches!(
            buf.virtual_property("capacity"),
            Some(Value::I64(16))
        ));
    }

    #[test]
    fn test_display_forms() {
        assert_eq!(Value::Null.to_display(), "null");
        assert_eq!(Value::string("hi").to_display(), "hi");
        assert_eq!(Value::F64(2.0).to_display(), "2.0");
        assert_eq!(Value::F64(2.5).to_display(), "2.5");
        let arr = Value::array(vec![Value::I32(1), Value::string("x")]);
        assert_eq!(arr.to_display(), "[1, \"x\"]");
        let obj = ObjectCell::new();
        obj.set("a", Value::I32(1));
        assert_eq!(Value::Object(obj).to_display(), "{a: 1}");
    }

    #[test]
    fn test_int_constructor_wraps() {
        assert!(matches!(Value::int(0xFF, IntKind::I8), Value::I8(-1)));
        assert!(matches!(Value::int(0x100, IntKind::U8), Value::U8(0)));
    }
}
