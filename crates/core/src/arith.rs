//! Binary and unary operations over values
//!
//! Numeric rules: mixed int/float promotes to float (of the wider float
//! width involved); mixed-width integers promote C-style - the wider width
//! wins, and at equal width unsigned wins; integer overflow wraps
//! two's-complement. `+` also concatenates strings and arrays. Logical
//! `&&`/`||` short-circuit in the evaluator, never here.

use crate::control::{runtime_error, type_error, Thrown};
use crate::value::Value;
use hemlock_compiler::ast::{BinaryOp, IntKind, UnaryOp};
use std::cmp::Ordering;

/// Result width/signedness for a pair of integer operands
fn promote_ints(a: IntKind, b: IntKind) -> IntKind {
    let bits = a.bits().max(b.bits());
    let signed = match (a.is_signed(), b.is_signed()) {
        (true, true) => true,
        (false, false) => false,
        (sa, _) => {
            let (signed_kind, unsigned_kind) = if sa { (a, b) } else { (b, a) };
            // The unsigned operand wins at equal or greater width.
            unsigned_kind.bits() < signed_kind.bits()
        }
    };
    match (bits, signed) {
        (8, true) => IntKind::I8,
        (16, true) => IntKind::I16,
        (32, true) => IntKind::I32,
        (64, true) => IntKind::I64,
        (8, false) => IntKind::U8,
        (16, false) => IntKind::U16,
        (32, false) => IntKind::U32,
        _ => IntKind::U64,
    }
}

/// Truncate a wide intermediate back to its tag, two's-complement
fn wrap_int(v: i128, kind: IntKind) -> Value {
    match kind {
        IntKind::I8 => Value::I8(v as i8),
        IntKind::I16 => Value::I16(v as i16),
        IntKind::I32 => Value::I32(v as i32),
        IntKind::I64 => Value::I64(v as i64),
        IntKind::U8 => Value::U8(v as u8),
        IntKind::U16 => Value::U16(v as u16),
        IntKind::U32 => Value::U32(v as u32),
        IntKind::U64 => Value::U64(v as u64),
    }
}

/// Float result width: f32 only when every operand is f32
fn float_result(a: &Value, b: &Value, v: f64) -> Value {
    if matches!(a, Value::F32(_)) && (matches!(b, Value::F32(_)) || b.is_integer()) {
        Value::F32(v as f32)
    } else if matches!(b, Value::F32(_)) && a.is_integer() {
        Value::F32(v as f32)
    } else {
        Value::F64(v)
    }
}

pub fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, Thrown> {
    match op {
        BinaryOp::Add => add(lhs, rhs),
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            arithmetic(op, lhs, rhs)
        }
        BinaryOp::Eq => Ok(Value::Bool(lhs.equals(rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!lhs.equals(rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            // IEEE semantics for floats: every ordering against NaN is false.
            if (lhs.is_float() || rhs.is_float()) && lhs.is_numeric() && rhs.is_numeric() {
                let a = lhs.as_f64().expect("numeric");
                let b = rhs.as_f64().expect("numeric");
                return Ok(Value::Bool(match op {
                    BinaryOp::Lt => a < b,
                    BinaryOp::Le => a <= b,
                    BinaryOp::Gt => a > b,
                    _ => a >= b,
                }));
            }
            let ord = compare(op, lhs, rhs)?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }))
        }
        BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::Shl | BinaryOp::Shr => {
            bitwise(op, lhs, rhs)
        }
        // Short-circuit forms are handled by the evaluator before it gets
        // here; seeing them means a caller skipped that step.
        BinaryOp::And | BinaryOp::Or | BinaryOp::NullCoalesce => Err(runtime_error(format!(
            "operator '{}' requires evaluator short-circuiting",
            op.symbol()
        ))),
    }
}

fn add(lhs: &Value, rhs: &Value) -> Result<Value, Thrown> {
    match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => {
            let mut s = String::with_capacity(a.len() + b.len());
            s.push_str(a);
            s.push_str(b);
            Ok(Value::string(s))
        }
        (Value::Array(a), Value::Array(b)) => {
            let mut elements = a.elements.borrow().clone();
            elements.extend(b.elements.borrow().iter().cloned());
            Ok(Value::array(elements))
        }
        _ => arithmetic(BinaryOp::Add, lhs, rhs),
    }
}

fn arithmetic(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, Thrown> {
    if !lhs.is_numeric() || !rhs.is_numeric() {
        return Err(type_error(format!(
            "operator '{}' requires numeric operands, got {} and {}",
            op.symbol(),
            lhs.type_name(),
            rhs.type_name()
        )));
    }
    if lhs.is_float() || rhs.is_float() {
        let a = lhs.as_f64().expect("numeric");
        let b = rhs.as_f64().expect("numeric");
        let v = match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Mod => a % b,
            _ => unreachable!(),
        };
        return Ok(float_result(lhs, rhs, v));
    }
    let kind = promote_ints(
        lhs.int_kind().expect("integer"),
        rhs.int_kind().expect("integer"),
    );
    let a = lhs.as_int_wide().expect("integer");
    let b = rhs.as_int_wide().expect("integer");
    let v = match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::Div => {
            if b == 0 {
                return Err(runtime_error("division by zero"));
            }
            a.wrapping_div(b)
        }
        BinaryOp::Mod => {
            if b == 0 {
                return Err(runtime_error("modulo by zero"));
            }
            a.wrapping_rem(b)
        }
        _ => unreachable!(),
    };
    Ok(wrap_int(v, kind))
}

/// Ordering comparison for non-float operands; requires compatible types
/// (numeric with numeric, string with string, rune with rune).
fn compare(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Ordering, Thrown> {
    if lhs.is_integer() && rhs.is_integer() {
        let a = lhs.as_int_wide().expect("integer");
        let b = rhs.as_int_wide().expect("integer");
        return Ok(a.cmp(&b));
    }
    match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => Ok(a.as_ref().cmp(b.as_ref())),
        (Value::Rune(a), Value::Rune(b)) => Ok(a.cmp(b)),
        _ => Err(type_error(format!(
            "operator '{}' cannot compare {} with {}",
            op.symbol(),
            lhs.type_name(),
            rhs.type_name()
        ))),
    }
}

fn bitwise(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, Thrown> {
    let (Some(ak), Some(bk)) = (lhs.int_kind(), rhs.int_kind()) else {
        return Err(type_error(format!(
            "operator '{}' requires integer operands, got {} and {}",
            op.symbol(),
            lhs.type_name(),
            rhs.type_name()
        )));
    };
    // Shift results keep the left operand's width; the count only selects
    // bit positions.
    let kind = match op {
        BinaryOp::Shl | BinaryOp::Shr => ak,
        _ => promote_ints(ak, bk),
    };
    let a = lhs.as_int_wide().expect("integer");
    let b = rhs.as_int_wide().expect("integer");
    let v = match op {
        BinaryOp::BitAnd => a & b,
        BinaryOp::BitOr => a | b,
        BinaryOp::BitXor => a ^ b,
        BinaryOp::Shl => a << ((b as u32) % kind.bits()),
        BinaryOp::Shr => a >> ((b as u32) % kind.bits()),
        _ => unreachable!(),
    };
    Ok(wrap_int(v, kind))
}

pub fn unary(op: UnaryOp, operand: &Value) -> Result<Value, Thrown> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!operand.is_truthy())),
        UnaryOp::Neg => {
            if operand.is_float() {
                return Ok(match operand {
                    Value::F32(v) => Value::F32(-v),
                    Value::F64(v) => Value::F64(-v),
                    _ => unreachable!(),
                });
            }
            let kind = operand.int_kind().ok_or_else(|| {
                type_error(format!("cannot negate {}", operand.type_name()))
            })?;
            let v = operand.as_int_wide().expect("integer");
            Ok(wrap_int(v.wrapping_neg(), kind))
        }
        UnaryOp::BitNot => {
            let kind = operand
                .int_kind()
                .ok_or_else(|| type_error(format!("cannot invert {}", operand.type_name())))?;
            let v = operand.as_int_wide().expect("integer");
            Ok(wrap_int(!v, kind))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bin(op: BinaryOp, a: Value, b: Value) -> Value {
        binary(op, &a, &b).expect("binary op")
    }

    #[test]
    fn test_int_float_promotes_to_float() {
        assert!(matches!(
            bin(BinaryOp::Add, Value::I32(1), Value::F64(0.5)),
            Value::F64(v) if v == 1.5
        ));
        assert!(matches!(
            bin(BinaryOp::Mul, Value::F32(2.0), Value::I32(3)),
            Value::F32(v) if v == 6.0
        ));
    }

    #[test]
    fn test_mixed_width_promotion() {
        // Wider signed wins over narrower unsigned.
        assert!(matches!(
            bin(BinaryOp::Add, Value::U8(200), Value::I32(100)),
            Value::I32(300)
        ));
        // u64 against i64 computes in u64.
        assert!(matches!(
            bin(BinaryOp::Add, Value::U64(1), Value::I64(2)),
            Value::U64(3)
        ));
    }

    #[test]
    fn test_integer_overflow_wraps() {
        assert!(matches!(
            bin(BinaryOp::Add, Value::I32(i32::MAX), Value::I32(1)),
            Value::I32(i32::MIN)
        ));
        assert!(matches!(
            bin(BinaryOp::Mul, Value::U8(200), Value::U8(2)),
            Value::U8(144)
        ));
    }

    #[test]
    fn test_division_by_zero_throws() {
        let err = binary(BinaryOp::Div, &Value::I32(1), &Value::I32(0)).unwrap_err();
        assert!(err.value.as_str().unwrap().contains("division by zero"));
        // Float division follows IEEE instead.
        assert!(matches!(
            bin(BinaryOp::Div, Value::F64(1.0), Value::F64(0.0)),
            Value::F64(v) if v.is_infinite()
        ));
    }

    #[test]
    fn test_string_and_array_concat() {
        assert_eq!(
            bin(BinaryOp::Add, Value::string("ab"), Value::string("cd"))
                .as_str()
                .unwrap(),
            "abcd"
        );
        let Value::Array(joined) = bin(
            BinaryOp::Add,
            Value::array(vec![Value::I32(1)]),
            Value::array(vec![Value::I32(2)]),
        ) else {
            panic!("expected array");
        };
        assert_eq!(joined.elements.borrow().len(), 2);
        // String + number is a type error, not coercion.
        assert!(binary(BinaryOp::Add, &Value::string("a"), &Value::I32(1)).is_err());
    }

    #[test]
    fn test_comparisons() {
        assert!(matches!(
            bin(BinaryOp::Lt, Value::I32(1), Value::U64(2)),
            Value::Bool(true)
        ));
        assert!(matches!(
            bin(BinaryOp::Ge, Value::string("b"), Value::string("a")),
            Value::Bool(true)
        ));
        assert!(binary(BinaryOp::Lt, &Value::string("a"), &Value::I32(1)).is_err());
    }

    #[test]
    fn test_bitwise_and_shifts() {
        assert!(matches!(
            bin(BinaryOp::BitAnd, Value::I32(0b1100), Value::I32(0b1010)),
            Value::I32(0b1000)
        ));
        assert!(matches!(
            bin(BinaryOp::Shl, Value::U8(1), Value::I32(3)),
            Value::U8(8)
        ));
        assert!(binary(BinaryOp::BitOr, &Value::F64(1.0), &Value::I32(1)).is_err());
    }

    #[test]
    fn test_unary() {
        assert!(matches!(
            unary(UnaryOp::Neg, &Value::I32(5)).unwrap(),
            Value::I32(-5)
        ));
        assert!(matches!(
            unary(UnaryOp::Not, &Value::Null).unwrap(),
            Value::Bool(true)
        ));
        assert!(matches!(
            unary(UnaryOp::BitNot, &Value::U8(0)).unwrap(),
            Value::U8(255)
        ));
        assert!(unary(UnaryOp::Neg, &Value::string("x")).is_err());
    }
}
