//! Runtime type-annotation checks
//!
//! Annotations are checked when a binding (or parameter) is established:
//! primitives range-cast, named object types duck-type against their
//! `define_object` declaration (extra fields permitted), and `array<T>`
//! checks element-wise and tags the array so later writes stay checked.

use crate::interp::Interp;
use hemlock_compiler::ast::{IntKind, PrimType, TypeAnnotation};
use hemlock_core::control::{type_error, Thrown};
use hemlock_core::value::Value;
use std::rc::Rc;

impl Interp {
    pub(crate) fn coerce(
        self: &Rc<Self>,
        value: Value,
        annotation: &TypeAnnotation,
        what: &str,
    ) -> Result<Value, Thrown> {
        match annotation {
            TypeAnnotation::Prim(prim) => coerce_prim(value, *prim, what),
            TypeAnnotation::Named(type_name) => self.coerce_named(value, type_name, what),
            TypeAnnotation::Array(inner) => {
                let Value::Array(cell) = &value else {
                    return Err(type_error(format!(
                        "{}: expected array<{}>, got {}",
                        what,
                        inner,
                        value.type_name()
                    )));
                };
                {
                    let mut elements = cell.elements.borrow_mut();
                    for i in 0..elements.len() {
                        let element = elements[i].clone();
                        elements[i] = self.coerce(
                            element,
                            inner,
                            &format!("{}[{}]", what, i),
                        )?;
                    }
                }
                *cell.elem_type.borrow_mut() = Some(inner.as_ref().clone());
                Ok(value)
            }
        }
    }

    fn coerce_named(
        self: &Rc<Self>,
        value: Value,
        type_name: &str,
        what: &str,
    ) -> Result<Value, Thrown> {
        let fields = self
            .object_types
            .borrow()
            .get(type_name)
            .cloned()
            .ok_or_else(|| {
                type_error(format!("{}: unknown type '{}'", what, type_name))
            })?;
        let Value::Object(cell) = &value else {
            return Err(type_error(format!(
                "{}: expected {} (object), got {}",
                what,
                type_name,
                value.type_name()
            )));
        };
        // Duck typing: every declared field must be present and conform;
        // extra fields are permitted.
        for field in &fields {
            let Some(field_value) = cell.get(&field.name) else {
                return Err(type_error(format!(
                    "{}: missing field '{}' required by {}",
                    what, field.name, type_name
                )));
            };
            let coerced = self.coerce(
                field_value,
                &field.annotation,
                &format!("{}.{}", what, field.name),
            )?;
            cell.set(&field.name, coerced);
        }
        *cell.type_tag.borrow_mut() = Some(type_name.to_string());
        Ok(value)
    }
}

fn coerce_prim(value: Value, prim: PrimType, what: &str) -> Result<Value, Thrown> {
    let mismatch = |value: &Value| {
        type_error(format!(
            "{}: expected {}, got {}",
            what,
            prim.name(),
            value.type_name()
        ))
    };
    match prim {
        PrimType::Int(kind) => {
            let wide = if let Some(v) = value.as_int_wide() {
                v
            } else if value.is_float() {
                let f = value.as_f64().expect("float");
                if !f.is_finite() || f.trunc() != f {
                    return Err(type_error(format!(
                        "{}: {} is not exactly representable as {}",
                        what,
                        f,
                        kind.name()
                    )));
                }
                f as i128
            } else {
                return Err(mismatch(&value));
            };
            if !int_in_range(wide, kind) {
                return Err(type_error(format!(
                    "{}: value {} out of range for {}",
                    what,
                    wide,
                    kind.name()
                )));
            }
            Ok(Value::int(wide as u64, kind))
        }
        PrimType::F32 => match value.as_f64() {
            Some(v) => Ok(Value::F32(v as f32)),
            None => Err(mismatch(&value)),
        },
        PrimType::F64 => match value.as_f64() {
            Some(v) => Ok(Value::F64(v)),
            None => Err(mismatch(&value)),
        },
        PrimType::Bool => match value {
            Value::Bool(_) => Ok(value),
            other => Err(mismatch(&other)),
        },
        PrimType::Str => match value {
            Value::Str(_) => Ok(value),
            other => Err(mismatch(&other)),
        },
        PrimType::Rune => match value {
            Value::Rune(_) => Ok(value),
            other => Err(mismatch(&other)),
        },
    }
}

fn int_in_range(v: i128, kind: IntKind) -> bool {
    match kind {
        IntKind::I8 => v >= i8::MIN as i128 && v <= i8::MAX as i128,
        IntKind::I16 => v >= i16::MIN as i128 && v <= i16::MAX as i128,
        IntKind::I32 => v >= i32::MIN as i128 && v <= i32::MAX as i128,
        IntKind::I64 => v >= i64::MIN as i128 && v <= i64::MAX as i128,
        IntKind::U8 => v >= 0 && v <= u8::MAX as i128,
        IntKind::U16 => v >= 0 && v <= u16::MAX as i128,
        IntKind::U32 => v >= 0 && v <= u32::MAX as i128,
        IntKind::U64 => v >= 0 && v <= u64::MAX as i128,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_range_checks() {
        assert!(int_in_range(255, IntKind::U8));
        assert!(!int_in_range(256, IntKind::U8));
        assert!(!int_in_range(-1, IntKind::U8));
        assert!(int_in_range(-128, IntKind::I8));
        assert!(!int_in_range(-129, IntKind::I8));
    }

    #[test]
    fn test_prim_coercion() {
        assert!(matches!(
            coerce_prim(Value::I64(7), PrimType::Int(IntKind::I8), "x").unwrap(),
            Value::I8(7)
        ));
        assert!(coerce_prim(Value::I32(300), PrimType::Int(IntKind::U8), "x").is_err());
        assert!(matches!(
            coerce_prim(Value::I32(2), PrimType::F64, "x").unwrap(),
            Value::F64(v) if v == 2.0
        ));
        // Fractional floats do not silently truncate into integers.
        assert!(coerce_prim(Value::F64(1.5), PrimType::Int(IntKind::I32), "x").is_err());
        assert!(coerce_prim(Value::string("s"), PrimType::Bool, "x").is_err());
    }
}
