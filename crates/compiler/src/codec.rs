//! Binary AST codec (`.hmlc`)
//!
//! Persists a parsed program so the runtime can load it without re-parsing.
//!
//! File layout:
//! ```text
//! magic(4)   = 'H' 'M' 'L' 'C'
//! version(2) = little-endian u16, currently 1
//! flags(2)   = bitfield; bit 0 = HMLC_DEBUG (include line/column info)
//! stmt_count(4)
//! statements...
//! ```
//!
//! Each node is a 1-byte kind tag followed by a kind-specific body. Strings
//! are a u32 length plus UTF-8 bytes; integers are fixed-width matching their
//! AST width; floats are IEEE 754; all multi-byte values little-endian;
//! sequences are count-prefixed. A reader seeing an unknown version refuses -
//! there is no cross-version tolerance.

use crate::ast::{
    BinaryOp, Expr, ExternParam, FieldDecl, InterpPart, IntKind, Param, PrimType, Program,
    SourceLocation, Stmt, SwitchCase, TypeAnnotation, UnaryOp,
};
use crate::error::CodecError;
use std::path::PathBuf;
use std::rc::Rc;

pub const MAGIC: [u8; 4] = *b"HMLC";
pub const VERSION: u16 = 1;
pub const FLAG_DEBUG: u16 = 0x0001;

// Statement tags
const ST_LET: u8 = 0x01;
const ST_CONST: u8 = 0x02;
const ST_EXPR: u8 = 0x03;
const ST_IF: u8 = 0x04;
const ST_WHILE: u8 = 0x05;
const ST_FOR: u8 = 0x06;
const ST_FOR_IN: u8 = 0x07;
const ST_BLOCK: u8 = 0x08;
const ST_RETURN: u8 = 0x09;
const ST_BREAK: u8 = 0x0A;
const ST_CONTINUE: u8 = 0x0B;
const ST_TRY: u8 = 0x0C;
const ST_THROW: u8 = 0x0D;
const ST_SWITCH: u8 = 0x0E;
const ST_DEFER: u8 = 0x0F;
const ST_ENUM: u8 = 0x10;
const ST_DEFINE_OBJECT: u8 = 0x11;
const ST_IMPORT: u8 = 0x12;
const ST_EXPORT: u8 = 0x13;
const ST_IMPORT_FFI: u8 = 0x14;
const ST_EXTERN_FN: u8 = 0x15;

// Expression tags
const EX_INT: u8 = 0x20;
const EX_FLOAT: u8 = 0x21;
const EX_BOOL: u8 = 0x22;
const EX_STR: u8 = 0x23;
const EX_RUNE: u8 = 0x24;
const EX_NULL: u8 = 0x25;
const EX_IDENT: u8 = 0x26;
const EX_BINARY: u8 = 0x27;
const EX_UNARY: u8 = 0x28;
const EX_TERNARY: u8 = 0x29;
const EX_CALL: u8 = 0x2A;
const EX_ASSIGN: u8 = 0x2B;
const EX_PROPERTY: u8 = 0x2C;
const EX_OPT_PROPERTY: u8 = 0x2D;
const EX_INDEX: u8 = 0x2E;
const EX_ARRAY: u8 = 0x2F;
const EX_OBJECT: u8 = 0x30;
const EX_FUNCTION: u8 = 0x31;
const EX_INC_DEC: u8 = 0x32;
const EX_INTERP: u8 = 0x33;
const EX_AWAIT: u8 = 0x34;

// Type annotation tags
const TY_PRIM: u8 = 0x01;
const TY_NAMED: u8 = 0x02;
const TY_ARRAY: u8 = 0x03;

/// Serialize a program to `.hmlc` bytes.
/// `debug` controls the HMLC_DEBUG flag (line/column info per node).
pub fn serialize(program: &Program, debug: bool) -> Vec<u8> {
    let mut enc = Encoder { buf: Vec::new(), debug };
    enc.buf.extend_from_slice(&MAGIC);
    enc.write_u16(VERSION);
    enc.write_u16(if debug { FLAG_DEBUG } else { 0 });
    enc.write_u32(program.statements.len() as u32);
    for stmt in &program.statements {
        enc.write_stmt(stmt);
    }
    enc.buf
}

/// Deserialize `.hmlc` bytes.
/// `source_name` labels locations when the stream carries debug info.
pub fn deserialize(bytes: &[u8], source_name: &str) -> Result<Program, CodecError> {
    let mut dec = Decoder {
        data: bytes,
        pos: 0,
        debug: false,
        file: Rc::new(PathBuf::from(source_name)),
    };
    let magic = dec.read_bytes(4)?;
    if magic != MAGIC {
        return Err(CodecError::BadMagic([magic[0], magic[1], magic[2], magic[3]]));
    }
    let version = dec.read_u16()?;
    if version != VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let flags = dec.read_u16()?;
    dec.debug = flags & FLAG_DEBUG != 0;
    let count = dec.read_u32()? as usize;
    let mut statements = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        statements.push(dec.read_stmt()?);
    }
    if dec.pos != bytes.len() {
        return Err(CodecError::TrailingBytes(bytes.len() - dec.pos));
    }
    Ok(Program::new(statements))
}

struct Encoder {
    buf: Vec<u8>,
    debug: bool,
}

impl Encoder {
    fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn write_str(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn write_bool(&mut self, v: bool) {
        self.write_u8(v as u8);
    }

    fn write_loc(&mut self, loc: &SourceLocation) {
        if self.debug {
            self.write_u32(loc.line);
            self.write_u32(loc.column);
        }
    }

    fn write_opt<T>(&mut self, value: &Option<T>, mut write: impl FnMut(&mut Self, &T)) {
        match value {
            Some(v) => {
                self.write_u8(1);
                write(self, v);
            }
            None => self.write_u8(0),
        }
    }

    fn write_stmts(&mut self, stmts: &[Stmt]) {
        self.write_u32(stmts.len() as u32);
        for s in stmts {
            self.write_stmt(s);
        }
    }

    fn write_exprs(&mut self, exprs: &[Expr]) {
        self.write_u32(exprs.len() as u32);
        for e in exprs {
            self.write_expr(e);
        }
    }

    fn write_annotation(&mut self, ann: &TypeAnnotation) {
        match ann {
            TypeAnnotation::Prim(p) => {
                self.write_u8(TY_PRIM);
                self.write_u8(prim_code(*p));
            }
            TypeAnnotation::Named(name) => {
                self.write_u8(TY_NAMED);
                self.write_str(name);
            }
            TypeAnnotation::Array(inner) => {
                self.write_u8(TY_ARRAY);
                self.write_annotation(inner);
            }
        }
    }

    fn write_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Let { name, annotation, value, loc } => {
                self.write_u8(ST_LET);
                self.write_loc(loc);
                self.write_str(name);
                self.write_opt(annotation, |e, a| e.write_annotation(a));
                self.write_expr(value);
            }
            Stmt::Const { name, annotation, value, loc } => {
                self.write_u8(ST_CONST);
                self.write_loc(loc);
                self.write_str(name);
                self.write_opt(annotation, |e, a| e.write_annotation(a));
                self.write_expr(value);
            }
            Stmt::Expr { expr, loc } => {
                self.write_u8(ST_EXPR);
                self.write_loc(loc);
                self.write_expr(expr);
            }
            Stmt::If { cond, then_body, else_body, loc } => {
                self.write_u8(ST_IF);
                self.write_loc(loc);
                self.write_expr(cond);
                self.write_stmts(then_body);
                self.write_opt(else_body, |e, b| e.write_stmts(b));
            }
            Stmt::While { cond, body, loc } => {
                self.write_u8(ST_WHILE);
                self.write_loc(loc);
                self.write_expr(cond);
                self.write_stmts(body);
            }
            Stmt::For { init, cond, step, body, loc } => {
                self.write_u8(ST_FOR);
                self.write_loc(loc);
                self.write_opt(init, |e, s| e.write_stmt(s));
                self.write_opt(cond, |e, c| e.write_expr(c));
                self.write_opt(step, |e, s| e.write_expr(s));
                self.write_stmts(body);
            }
            Stmt::ForIn { key, value, iterable, body, loc } => {
                self.write_u8(ST_FOR_IN);
                self.write_loc(loc);
                self.write_opt(key, |e, k| e.write_str(k));
                self.write_str(value);
                self.write_expr(iterable);
                self.write_stmts(body);
            }
            Stmt::Block { body, loc } => {
                self.write_u8(ST_BLOCK);
                self.write_loc(loc);
                self.write_stmts(body);
            }
            Stmt::Return { value, loc } => {
                self.write_u8(ST_RETURN);
                self.write_loc(loc);
                self.write_opt(value, |e, v| e.write_expr(v));
            }
            Stmt::Break { loc } => {
                self.write_u8(ST_BREAK);
                self.write_loc(loc);
            }
            Stmt::Continue { loc } => {
                self.write_u8(ST_CONTINUE);
                self.write_loc(loc);
            }
            Stmt::Try { body, catch_name, catch_body, finally_body, loc } => {
                self.write_u8(ST_TRY);
                self.write_loc(loc);
                self.write_stmts(body);
                self.write_opt(catch_name, |e, n| e.write_str(n));
                self.write_opt(catch_body, |e, b| e.write_stmts(b));
                self.write_opt(finally_body, |e, b| e.write_stmts(b));
            }
            Stmt::Throw { value, loc } => {
                self.write_u8(ST_THROW);
                self.write_loc(loc);
                self.write_expr(value);
            }
            Stmt::Switch { discriminant, cases, default, loc } => {
                self.write_u8(ST_SWITCH);
                self.write_loc(loc);
                self.write_expr(discriminant);
                self.write_u32(cases.len() as u32);
                for case in cases {
                    self.write_expr(&case.value);
                    self.write_stmts(&case.body);
                }
                self.write_opt(default, |e, b| e.write_stmts(b));
            }
            Stmt::Defer { expr, loc } => {
                self.write_u8(ST_DEFER);
                self.write_loc(loc);
                self.write_expr(expr);
            }
            Stmt::Enum { name, members, loc } => {
                self.write_u8(ST_ENUM);
                self.write_loc(loc);
                self.write_str(name);
                self.write_u32(members.len() as u32);
                for (member, value) in members {
                    self.write_str(member);
                    self.write_opt(value, |e, v| e.write_i64(*v));
                }
            }
            Stmt::DefineObject { name, fields, loc } => {
                self.write_u8(ST_DEFINE_OBJECT);
                self.write_loc(loc);
                self.write_str(name);
                self.write_u32(fields.len() as u32);
                for field in fields {
                    self.write_str(&field.name);
                    self.write_annotation(&field.annotation);
                }
            }
            Stmt::Import { names, path, loc } => {
                self.write_u8(ST_IMPORT);
                self.write_loc(loc);
                self.write_u32(names.len() as u32);
                for name in names {
                    self.write_str(name);
                }
                self.write_str(path);
            }
            Stmt::Export { stmt, loc } => {
                self.write_u8(ST_EXPORT);
                self.write_loc(loc);
                self.write_stmt(stmt);
            }
            Stmt::ImportFfi { library, loc } => {
                self.write_u8(ST_IMPORT_FFI);
                self.write_loc(loc);
                self.write_str(library);
            }
            Stmt::ExternFn { name, params, ret, loc } => {
                self.write_u8(ST_EXTERN_FN);
                self.write_loc(loc);
                self.write_str(name);
                self.write_u32(params.len() as u32);
                for p in params {
                    self.write_str(&p.name);
                    self.write_annotation(&p.annotation);
                }
                self.write_opt(ret, |e, a| e.write_annotation(a));
            }
        }
    }

    fn write_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Int { bits, kind, loc } => {
                self.write_u8(EX_INT);
                self.write_loc(loc);
                self.write_u8(int_kind_code(*kind));
                // Fixed width matching the AST width
                match kind.bits() {
                    8 => self.write_u8(*bits as u8),
                    16 => self.write_u16(*bits as u16),
                    32 => self.write_u32(*bits as u32),
                    _ => self.write_u64(*bits),
                }
            }
            Expr::Float { value, is_f32, loc } => {
                self.write_u8(EX_FLOAT);
                self.write_loc(loc);
                self.write_bool(*is_f32);
                if *is_f32 {
                    self.buf.extend_from_slice(&(*value as f32).to_le_bytes());
                } else {
                    self.buf.extend_from_slice(&value.to_le_bytes());
                }
            }
            Expr::Bool { value, loc } => {
                self.write_u8(EX_BOOL);
                self.write_loc(loc);
                self.write_bool(*value);
            }
            Expr::Str { value, loc } => {
                self.write_u8(EX_STR);
                self.write_loc(loc);
                self.write_str(value);
            }
            Expr::Rune { value, loc } => {
                self.write_u8(EX_RUNE);
                self.write_loc(loc);
                self.write_u32(*value as u32);
            }
            Expr::Null { loc } => {
                self.write_u8(EX_NULL);
                self.write_loc(loc);
            }
            Expr::Ident { name, loc } => {
                self.write_u8(EX_IDENT);
                self.write_loc(loc);
                self.write_str(name);
            }
            Expr::Binary { op, lhs, rhs, loc } => {
                self.write_u8(EX_BINARY);
                self.write_loc(loc);
                self.write_u8(binary_op_code(*op));
                self.write_expr(lhs);
                self.write_expr(rhs);
            }
            Expr::Unary { op, operand, loc } => {
                self.write_u8(EX_UNARY);
                self.write_loc(loc);
                self.write_u8(unary_op_code(*op));
                self.write_expr(operand);
            }
            Expr::Ternary { cond, then_expr, else_expr, loc } => {
                self.write_u8(EX_TERNARY);
                self.write_loc(loc);
                self.write_expr(cond);
                self.write_expr(then_expr);
                self.write_expr(else_expr);
            }
            Expr::Call { callee, args, loc } => {
                self.write_u8(EX_CALL);
                self.write_loc(loc);
                self.write_expr(callee);
                self.write_exprs(args);
            }
            Expr::Assign { target, value, loc } => {
                self.write_u8(EX_ASSIGN);
                self.write_loc(loc);
                self.write_expr(target);
                self.write_expr(value);
            }
            Expr::Property { object, name, loc } => {
                self.write_u8(EX_PROPERTY);
                self.write_loc(loc);
                self.write_expr(object);
                self.write_str(name);
            }
            Expr::OptionalProperty { object, name, loc } => {
                self.write_u8(EX_OPT_PROPERTY);
                self.write_loc(loc);
                self.write_expr(object);
                self.write_str(name);
            }
            Expr::Index { object, index, loc } => {
                self.write_u8(EX_INDEX);
                self.write_loc(loc);
                self.write_expr(object);
                self.write_expr(index);
            }
            Expr::Array { elements, loc } => {
                self.write_u8(EX_ARRAY);
                self.write_loc(loc);
                self.write_exprs(elements);
            }
            Expr::Object { entries, loc } => {
                self.write_u8(EX_OBJECT);
                self.write_loc(loc);
                self.write_u32(entries.len() as u32);
                for (key, value) in entries {
                    self.write_str(key);
                    self.write_expr(value);
                }
            }
            Expr::Function { params, body, is_async, loc } => {
                self.write_u8(EX_FUNCTION);
                self.write_loc(loc);
                self.write_bool(*is_async);
                self.write_u32(params.len() as u32);
                for p in params {
                    self.write_str(&p.name);
                    self.write_opt(&p.annotation, |e, a| e.write_annotation(a));
                    self.write_opt(&p.default, |e, d| e.write_expr(d));
                }
                self.write_stmts(body);
            }
            Expr::IncDec { target, increment, prefix, loc } => {
                self.write_u8(EX_INC_DEC);
                self.write_loc(loc);
                self.write_bool(*increment);
                self.write_bool(*prefix);
                self.write_expr(target);
            }
            Expr::Interp { parts, loc } => {
                self.write_u8(EX_INTERP);
                self.write_loc(loc);
                self.write_u32(parts.len() as u32);
                for part in parts {
                    match part {
                        InterpPart::Lit(text) => {
                            self.write_u8(0);
                            self.write_str(text);
                        }
                        InterpPart::Expr(expr) => {
                            self.write_u8(1);
                            self.write_expr(expr);
                        }
                    }
                }
            }
            Expr::Await { expr, loc } => {
                self.write_u8(EX_AWAIT);
                self.write_loc(loc);
                self.write_expr(expr);
            }
        }
    }
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    debug: bool,
    file: Rc<PathBuf>,
}

impl<'a> Decoder<'a> {
    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.data.len() {
            return Err(CodecError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_le_bytes(b.try_into().expect("8-byte slice")))
    }

    fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(self.read_u64()? as i64)
    }

    fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    fn read_str(&mut self) -> Result<String, CodecError> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    fn read_loc(&mut self) -> Result<SourceLocation, CodecError> {
        if self.debug {
            let line = self.read_u32()?;
            let column = self.read_u32()?;
            Ok(SourceLocation::new(self.file.clone(), line, column))
        } else {
            Ok(SourceLocation::unknown())
        }
    }

    fn read_opt<T>(
        &mut self,
        mut read: impl FnMut(&mut Self) -> Result<T, CodecError>,
    ) -> Result<Option<T>, CodecError> {
        if self.read_bool()? {
            Ok(Some(read(self)?))
        } else {
            Ok(None)
        }
    }

    fn read_stmts(&mut self) -> Result<Vec<Stmt>, CodecError> {
        let count = self.read_u32()? as usize;
        let mut out = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            out.push(self.read_stmt()?);
        }
        Ok(out)
    }

    fn read_exprs(&mut self) -> Result<Vec<Expr>, CodecError> {
        let count = self.read_u32()? as usize;
        let mut out = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            out.push(self.read_expr()?);
        }
        Ok(out)
    }

    fn read_annotation(&mut self) -> Result<TypeAnnotation, CodecError> {
        match self.read_u8()? {
            TY_PRIM => {
                let code = self.read_u8()?;
                Ok(TypeAnnotation::Prim(prim_from_code(code)?))
            }
            TY_NAMED => Ok(TypeAnnotation::Named(self.read_str()?)),
            TY_ARRAY => Ok(TypeAnnotation::Array(Box::new(self.read_annotation()?))),
            value => Err(CodecError::InvalidTag { what: "type annotation", value }),
        }
    }

    fn read_stmt(&mut self) -> Result<Stmt, CodecError> {
        let tag = self.read_u8()?;
        let loc = self.read_loc()?;
        Ok(match tag {
            ST_LET | ST_CONST => {
                let name = self.read_str()?;
                let annotation = self.read_opt(|d| d.read_annotation())?;
                let value = self.read_expr()?;
                if tag == ST_LET {
                    Stmt::Let { name, annotation, value, loc }
                } else {
                    Stmt::Const { name, annotation, value, loc }
                }
            }
            ST_EXPR => Stmt::Expr { expr: self.read_expr()?, loc },
            ST_IF => {
                let cond = self.read_expr()?;
                let then_body = self.read_stmts()?;
                let else_body = self.read_opt(|d| d.read_stmts())?;
                Stmt::If { cond, then_body, else_body, loc }
            }
            ST_WHILE => {
                let cond = self.read_expr()?;
                let body = self.read_stmts()?;
                Stmt::While { cond, body, loc }
            }
            ST_FOR => {
                let init = self.read_opt(|d| d.read_stmt())?.map(Box::new);
                let cond = self.read_opt(|d| d.read_expr())?;
                let step = self.read_opt(|d| d.read_expr())?;
                let body = self.read_stmts()?;
                Stmt::For { init, cond, step, body, loc }
            }
            ST_FOR_IN => {
                let key = self.read_opt(|d| d.read_str())?;
                let value = self.read_str()?;
                let iterable = self.read_expr()?;
                let body = self.read_stmts()?;
                Stmt::ForIn { key, value, iterable, body, loc }
            }
            ST_BLOCK => Stmt::Block { body: self.read_stmts()?, loc },
            ST_RETURN => Stmt::Return { value: self.read_opt(|d| d.read_expr())?, loc },
            ST_BREAK => Stmt::Break { loc },
            ST_CONTINUE => Stmt::Continue { loc },
            ST_TRY => {
                let body = self.read_stmts()?;
                let catch_name = self.read_opt(|d| d.read_str())?;
                let catch_body = self.read_opt(|d| d.read_stmts())?;
                let finally_body = self.read_opt(|d| d.read_stmts())?;
                Stmt::Try { body, catch_name, catch_body, finally_body, loc }
            }
            ST_THROW => Stmt::Throw { value: self.read_expr()?, loc },
            ST_SWITCH => {
                let discriminant = self.read_expr()?;
                let case_count = self.read_u32()? as usize;
                let mut cases = Vec::with_capacity(case_count.min(1 << 16));
                for _ in 0..case_count {
                    let value = self.read_expr()?;
                    let body = self.read_stmts()?;
                    cases.push(SwitchCase { value, body });
                }
                let default = self.read_opt(|d| d.read_stmts())?;
                Stmt::Switch { discriminant, cases, default, loc }
            }
            ST_DEFER => Stmt::Defer { expr: self.read_expr()?, loc },
            ST_ENUM => {
                let name = self.read_str()?;
                let count = self.read_u32()? as usize;
                let mut members = Vec::with_capacity(count.min(1 << 16));
                for _ in 0..count {
                    let member = self.read_str()?;
                    let value = self.read_opt(|d| d.read_i64())?;
                    members.push((member, value));
                }
                Stmt::Enum { name, members, loc }
            }
            ST_DEFINE_OBJECT => {
                let name = self.read_str()?;
                let count = self.read_u32()? as usize;
                let mut fields = Vec::with_capacity(count.min(1 << 16));
                for _ in 0..count {
                    let field = self.read_str()?;
                    let annotation = self.read_annotation()?;
                    fields.push(FieldDecl { name: field, annotation });
                }
                Stmt::DefineObject { name, fields, loc }
            }
            ST_IMPORT => {
                let count = self.read_u32()? as usize;
                let mut names = Vec::with_capacity(count.min(1 << 16));
                for _ in 0..count {
                    names.push(self.read_str()?);
                }
                let path = self.read_str()?;
                Stmt::Import { names, path, loc }
            }
            ST_EXPORT => Stmt::Export { stmt: Box::new(self.read_stmt()?), loc },
            ST_IMPORT_FFI => Stmt::ImportFfi { library: self.read_str()?, loc },
            ST_EXTERN_FN => {
                let name = self.read_str()?;
                let count = self.read_u32()? as usize;
                let mut params = Vec::with_capacity(count.min(1 << 16));
                for _ in 0..count {
                    let pname = self.read_str()?;
                    let annotation = self.read_annotation()?;
                    params.push(ExternParam { name: pname, annotation });
                }
                let ret = self.read_opt(|d| d.read_annotation())?;
                Stmt::ExternFn { name, params, ret, loc }
            }
            value => return Err(CodecError::InvalidTag { what: "statement", value }),
        })
    }

    fn read_expr(&mut self) -> Result<Expr, CodecError> {
        let tag = self.read_u8()?;
        let loc = self.read_loc()?;
        Ok(match tag {
            EX_INT => {
                let kind = int_kind_from_code(self.read_u8()?)?;
                let bits = match kind.bits() {
                    8 => self.read_u8()? as u64,
                    16 => self.read_u16()? as u64,
                    32 => self.read_u32()? as u64,
                    _ => self.read_u64()?,
                };
                Expr::Int { bits, kind, loc }
            }
            EX_FLOAT => {
                let is_f32 = self.read_bool()?;
                let value = if is_f32 {
                    let b = self.read_bytes(4)?;
                    f32::from_le_bytes(b.try_into().expect("4-byte slice")) as f64
                } else {
                    let b = self.read_bytes(8)?;
                    f64::from_le_bytes(b.try_into().expect("8-byte slice"))
                };
                Expr::Float { value, is_f32, loc }
            }
            EX_BOOL => Expr::Bool { value: self.read_bool()?, loc },
            EX_STR => Expr::Str { value: self.read_str()?, loc },
            EX_RUNE => {
                let scalar = self.read_u32()?;
                let value = char::from_u32(scalar).ok_or(CodecError::InvalidTag {
                    what: "rune scalar",
                    value: (scalar & 0xFF) as u8,
                })?;
                Expr::Rune { value, loc }
            }
            EX_NULL => Expr::Null { loc },
            EX_IDENT => Expr::Ident { name: self.read_str()?, loc },
            EX_BINARY => {
                let op = binary_op_from_code(self.read_u8()?)?;
                let lhs = Box::new(self.read_expr()?);
                let rhs = Box::new(self.read_expr()?);
                Expr::Binary { op, lhs, rhs, loc }
            }
            EX_UNARY => {
                let op = unary_op_from_code(self.read_u8()?)?;
                let operand = Box::new(self.read_expr()?);
                Expr::Unary { op, operand, loc }
            }
            EX_TERNARY => {
                let cond = Box::new(self.read_expr()?);
                let then_expr = Box::new(self.read_expr()?);
                let else_expr = Box::new(self.read_expr()?);
                Expr::Ternary { cond, then_expr, else_expr, loc }
            }
            EX_CALL => {
                let callee = Box::new(self.read_expr()?);
                let args = self.read_exprs()?;
                Expr::Call { callee, args, loc }
            }
            EX_ASSIGN => {
                let target = Box::new(self.read_expr()?);
                let value = Box::new(self.read_expr()?);
                Expr::Assign { target, value, loc }
            }
            EX_PROPERTY => {
                let object = Box::new(self.read_expr()?);
                let name = self.read_str()?;
                Expr::Property { object, name, loc }
            }
            EX_OPT_PROPERTY => {
                let object = Box::new(self.read_expr()?);
                let name = self.read_str()?;
                Expr::OptionalProperty { object, name, loc }
            }
            EX_INDEX => {
                let object = Box::new(self.read_expr()?);
                let index = Box::new(self.read_expr()?);
                Expr::Index { object, index, loc }
            }
            EX_ARRAY => Expr::Array { elements: self.read_exprs()?, loc },
            EX_OBJECT => {
                let count = self.read_u32()? as usize;
                let mut entries = Vec::with_capacity(count.min(1 << 16));
                for _ in 0..count {
                    let key = self.read_str()?;
                    let value = self.read_expr()?;
                    entries.push((key, value));
                }
                Expr::Object { entries, loc }
            }
            EX_FUNCTION => {
                let is_async = self.read_bool()?;
                let count = self.read_u32()? as usize;
                let mut params = Vec::with_capacity(count.min(1 << 16));
                for _ in 0..count {
                    let name = self.read_str()?;
                    let annotation = self.read_opt(|d| d.read_annotation())?;
                    let default = self.read_opt(|d| d.read_expr())?;
                    params.push(Param { name, annotation, default });
                }
                let body = Rc::new(self.read_stmts()?);
                Expr::Function { params, body, is_async, loc }
            }
            EX_INC_DEC => {
                let increment = self.read_bool()?;
                let prefix = self.read_bool()?;
                let target = Box::new(self.read_expr()?);
                Expr::IncDec { target, increment, prefix, loc }
            }
            EX_INTERP => {
                let count = self.read_u32()? as usize;
                let mut parts = Vec::with_capacity(count.min(1 << 16));
                for _ in 0..count {
                    match self.read_u8()? {
                        0 => parts.push(InterpPart::Lit(self.read_str()?)),
                        1 => parts.push(InterpPart::Expr(self.read_expr()?)),
                        value => {
                            return Err(CodecError::InvalidTag {
                                what: "interpolation part",
                                value,
                            });
                        }
                    }
                }
                Expr::Interp { parts, loc }
            }
            EX_AWAIT => Expr::Await { expr: Box::new(self.read_expr()?), loc },
            value => return Err(CodecError::InvalidTag { what: "expression", value }),
        })
    }
}

fn int_kind_code(kind: IntKind) -> u8 {
    match kind {
        IntKind::I8 => 0,
        IntKind::I16 => 1,
        IntKind::I32 => 2,
        IntKind::I64 => 3,
        IntKind::U8 => 4,
        IntKind::U16 => 5,
        IntKind::U32 => 6,
        IntKind::U64 => 7,
    }
}

fn int_kind_from_code(code: u8) -> Result<IntKind, CodecError> {
    Ok(match code {
        0 => IntKind::I8,
        1 => IntKind::I16,
        2 => IntKind::I32,
        3 => IntKind::I64,
        4 => IntKind::U8,
        5 => IntKind::U16,
        6 => IntKind::U32,
        7 => IntKind::U64,
        value => return Err(CodecError::InvalidTag { what: "integer width", value }),
    })
}

fn prim_code(prim: PrimType) -> u8 {
    match prim {
        PrimType::Int(k) => int_kind_code(k),
        PrimType::F32 => 8,
        PrimType::F64 => 9,
        PrimType::Bool => 10,
        PrimType::Str => 11,
        PrimType::Rune => 12,
    }
}

fn prim_from_code(code: u8) -> Result<PrimType, CodecError> {
    Ok(match code {
        0..=7 => PrimType::Int(int_kind_from_code(code)?),
        8 => PrimType::F32,
        9 => PrimType::F64,
        10 => PrimType::Bool,
        11 => PrimType::Str,
        12 => PrimType::Rune,
        value => return Err(CodecError::InvalidTag { what: "primitive type", value }),
    })
}

fn binary_op_code(op: BinaryOp) -> u8 {
    match op {
        BinaryOp::Add => 0,
        BinaryOp::Sub => 1,
        BinaryOp::Mul => 2,
        BinaryOp::Div => 3,
        BinaryOp::Mod => 4,
        BinaryOp::Eq => 5,
        BinaryOp::Ne => 6,
        BinaryOp::Lt => 7,
        BinaryOp::Le => 8,
        BinaryOp::Gt => 9,
        BinaryOp::Ge => 10,
        BinaryOp::And => 11,
        BinaryOp::Or => 12,
        BinaryOp::BitAnd => 13,
        BinaryOp::BitOr => 14,
        BinaryOp::BitXor => 15,
        BinaryOp::Shl => 16,
        BinaryOp::Shr => 17,
        BinaryOp::NullCoalesce => 18,
    }
}

fn binary_op_from_code(code: u8) -> Result<BinaryOp, CodecError> {
    Ok(match code {
        0 => BinaryOp::Add,
        1 => BinaryOp::Sub,
        2 => BinaryOp::Mul,
        3 => BinaryOp::Div,
        4 => BinaryOp::Mod,
        5 => BinaryOp::Eq,
        6 => BinaryOp::Ne,
        7 => BinaryOp::Lt,
        8 => BinaryOp::Le,
        9 => BinaryOp::Gt,
        10 => BinaryOp::Ge,
        11 => BinaryOp::And,
        12 => BinaryOp::Or,
        13 => BinaryOp::BitAnd,
        14 => BinaryOp::BitOr,
        15 => BinaryOp::BitXor,
        16 => BinaryOp::Shl,
        17 => BinaryOp::Shr,
        18 => BinaryOp::NullCoalesce,
        value => return Err(CodecError::InvalidTag { what: "binary operator", value }),
    })
}

fn unary_op_code(op: UnaryOp) -> u8 {
    match op {
        UnaryOp::Neg => 0,
        UnaryOp::Not => 1,
        UnaryOp::BitNot => 2,
    }
}

fn unary_op_from_code(code: u8) -> Result<UnaryOp, CodecError> {
    Ok(match code {
        0 => UnaryOp::Neg,
        1 => UnaryOp::Not,
        2 => UnaryOp::BitNot,
        value => return Err(CodecError::InvalidTag { what: "unary operator", value }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;
    use std::path::Path;

    fn round_trip(source: &str, debug: bool) -> Program {
        let program = parse_source(source, Path::new("t.hml")).expect("parse");
        let bytes = serialize(&program, debug);
        deserialize(&bytes, "t.hml").expect("deserialize")
    }

    /// Strip locations so structural comparison ignores debug-info presence
    fn assert_same_shape(a: &Program, b: &Program) {
        assert_eq!(a.statements.len(), b.statements.len());
        // Serializing both sides without debug info normalizes locations.
        assert_eq!(serialize(a, false), serialize(b, false));
    }

    const SAMPLE: &str = r#"
        let fib = fn(n) { if (n < 2) { return n; } return fib(n-1) + fib(n-2); };
        const greeting: string = "hi ${1 + 2} there";
        enum Color { Red, Green = 5, Blue }
        define_object Point { x: i32, y: i32 }
        for (k, v in {a: 1, b: 2}) { print(k, v); }
        try { throw "x"; } catch (e) { print(e); } finally { print("F"); }
        switch (2) { case 1: break; case 2: print("two"); default: print("?"); }
        let a: array<i32> = [1, 2, 3];
        defer print("bye");
        import { x } from "./m";
        export let z = 41;
        import_ffi "libm.so.6";
        extern_fn sin(x: f64) -> f64;
        let t = spawn(fn() { return 1; });
        let r = await t;
        let opt = obj?.field ?? "default";
        let neg = -127i8;
        let big = 18446744073709551615u64;
        let r2 = 'x';
        let f = 2.5f32;
        x++;
        --x;
    "#;

    #[test]
    fn test_round_trip_with_debug() {
        let program = parse_source(SAMPLE, Path::new("t.hml")).expect("parse");
        let bytes = serialize(&program, true);
        let back = deserialize(&bytes, "t.hml").expect("deserialize");
        assert_same_shape(&program, &back);
        // Debug info preserves line/column.
        assert_eq!(program.statements[0].loc().line, back.statements[0].loc().line);
    }

    #[test]
    fn test_round_trip_without_debug() {
        let program = parse_source(SAMPLE, Path::new("t.hml")).expect("parse");
        let back = round_trip(SAMPLE, false);
        assert_same_shape(&program, &back);
        // Locations fall back to unknown.
        assert_eq!(back.statements[0].loc().line, 0);
    }

    #[test]
    fn test_header_layout() {
        let program = parse_source("let x = 1;", Path::new("t.hml")).expect("parse");
        let bytes = serialize(&program, true);
        assert_eq!(&bytes[0..4], b"HMLC");
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), 1);
        assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]), FLAG_DEBUG);
        assert_eq!(u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]), 1);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let err = deserialize(b"ELF\x7f\x01\x00\x00\x00", "t").unwrap_err();
        assert!(matches!(err, CodecError::BadMagic(_)));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let program = parse_source("let x = 1;", Path::new("t.hml")).expect("parse");
        let mut bytes = serialize(&program, false);
        bytes[4..6].copy_from_slice(&999u16.to_le_bytes());
        let err = deserialize(&bytes, "t").unwrap_err();
        assert_eq!(err, CodecError::UnsupportedVersion(999));
    }

    #[test]
    fn test_truncated_stream_rejected() {
        let program = parse_source("let x = \"hello\";", Path::new("t.hml")).expect("parse");
        let bytes = serialize(&program, false);
        let err = deserialize(&bytes[..bytes.len() - 3], "t").unwrap_err();
        assert_eq!(err, CodecError::UnexpectedEof);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let program = parse_source("let x = 1;", Path::new("t.hml")).expect("parse");
        let mut bytes = serialize(&program, false);
        bytes.push(0xAB);
        let err = deserialize(&bytes, "t").unwrap_err();
        assert_eq!(err, CodecError::TrailingBytes(1));
    }

    #[test]
    fn test_invalid_statement_tag() {
        let program = parse_source("let x = 1;", Path::new("t.hml")).expect("parse");
        let mut bytes = serialize(&program, false);
        bytes[12] = 0xEE; // first statement tag
        let err = deserialize(&bytes, "t").unwrap_err();
        assert!(matches!(err, CodecError::InvalidTag { what: "statement", .. }));
    }

    #[test]
    fn test_int_width_payload_sizes() {
        // 1-byte payload for u8, 8-byte for u64: header(12) + tag(1) + kind(1) + payload
        let p8 = parse_source("200u8;", Path::new("t")).expect("parse");
        let p64 = parse_source("200u64;", Path::new("t")).expect("parse");
        let b8 = serialize(&p8, false);
        let b64 = serialize(&p64, false);
        assert_eq!(b64.len() - b8.len(), 7);
    }
}
