// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Arithmetic, comparison and conversion semantics of the evaluation stack.
//!
//! Operand pairs follow ECMA-335 III.1.5: `int32 op int32` stays `int32`, anything
//! mixed with a native int becomes native int, `int64` pairs stay `int64`, floats win
//! over everything. Integer arithmetic wraps unless an `.ovf` form is used.

use std::cmp::Ordering;

use crate::emulation::value::Value;

/// Why an operation could not produce a value.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Fault {
    /// Integer division or remainder by zero
    DivideByZero,
    /// Checked arithmetic or conversion overflowed
    Overflow,
    /// The operands have shapes the operation does not accept
    Mismatch(String),
}

/// Binary numeric operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    DivUn,
    Rem,
    RemUn,
    And,
    Or,
    Xor,
    AddOvf,
    AddOvfUn,
    SubOvf,
    SubOvfUn,
    MulOvf,
    MulOvfUn,
}

impl BinaryOp {
    pub(crate) fn from_mnemonic(mnemonic: &str) -> Option<BinaryOp> {
        Some(match mnemonic {
            "add" => BinaryOp::Add,
            "sub" => BinaryOp::Sub,
            "mul" => BinaryOp::Mul,
            "div" => BinaryOp::Div,
            "div.un" => BinaryOp::DivUn,
            "rem" => BinaryOp::Rem,
            "rem.un" => BinaryOp::RemUn,
            "and" => BinaryOp::And,
            "or" => BinaryOp::Or,
            "xor" => BinaryOp::Xor,
            "add.ovf" => BinaryOp::AddOvf,
            "add.ovf.un" => BinaryOp::AddOvfUn,
            "sub.ovf" => BinaryOp::SubOvf,
            "sub.ovf.un" => BinaryOp::SubOvfUn,
            "mul.ovf" => BinaryOp::MulOvf,
            "mul.ovf.un" => BinaryOp::MulOvfUn,
            _ => return None,
        })
    }

    fn is_bitwise(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or | BinaryOp::Xor)
    }
}

#[derive(Debug, Clone, Copy)]
enum Width {
    I4,
    I8,
    Native,
}

fn integer_operands(left: &Value, right: &Value) -> Option<(Width, i64, i64)> {
    match (left, right) {
        (Value::I4(a), Value::I4(b)) => Some((Width::I4, i64::from(*a), i64::from(*b))),
        (Value::I8(a), Value::I8(b)) => Some((Width::I8, *a, *b)),
        (Value::I8(a), Value::I4(b)) => Some((Width::I8, *a, i64::from(*b))),
        (Value::I4(a), Value::I8(b)) => Some((Width::I8, i64::from(*a), *b)),
        (Value::IntPtr(a), Value::IntPtr(b)) => Some((Width::Native, *a, *b)),
        (Value::IntPtr(a), Value::I4(b)) => Some((Width::Native, *a, i64::from(*b))),
        (Value::I4(a), Value::IntPtr(b)) => Some((Width::Native, i64::from(*a), *b)),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn wrap(width: Width, value: i64) -> Value {
    match width {
        Width::I4 => Value::I4(value as i32),
        Width::I8 => Value::I8(value),
        Width::Native => Value::IntPtr(value),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
fn integer_binary(op: BinaryOp, width: Width, a: i64, b: i64) -> Result<Value, Fault> {
    if let Width::I4 = width {
        let (a, b) = (a as i32, b as i32);
        let (ua, ub) = (a as u32, b as u32);
        let result = match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Div | BinaryOp::Rem if b == 0 => return Err(Fault::DivideByZero),
            BinaryOp::DivUn | BinaryOp::RemUn if ub == 0 => return Err(Fault::DivideByZero),
            BinaryOp::Div => a.checked_div(b).ok_or(Fault::Overflow)?,
            BinaryOp::Rem => a.checked_rem(b).unwrap_or(0),
            BinaryOp::DivUn => (ua / ub) as i32,
            BinaryOp::RemUn => (ua % ub) as i32,
            BinaryOp::And => a & b,
            BinaryOp::Or => a | b,
            BinaryOp::Xor => a ^ b,
            BinaryOp::AddOvf => a.checked_add(b).ok_or(Fault::Overflow)?,
            BinaryOp::SubOvf => a.checked_sub(b).ok_or(Fault::Overflow)?,
            BinaryOp::MulOvf => a.checked_mul(b).ok_or(Fault::Overflow)?,
            BinaryOp::AddOvfUn => ua.checked_add(ub).ok_or(Fault::Overflow)? as i32,
            BinaryOp::SubOvfUn => ua.checked_sub(ub).ok_or(Fault::Overflow)? as i32,
            BinaryOp::MulOvfUn => ua.checked_mul(ub).ok_or(Fault::Overflow)? as i32,
        };
        return Ok(Value::I4(result));
    }

    let (ua, ub) = (a as u64, b as u64);
    let result = match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::Div | BinaryOp::Rem if b == 0 => return Err(Fault::DivideByZero),
        BinaryOp::DivUn | BinaryOp::RemUn if ub == 0 => return Err(Fault::DivideByZero),
        BinaryOp::Div => a.checked_div(b).ok_or(Fault::Overflow)?,
        BinaryOp::Rem => a.checked_rem(b).unwrap_or(0),
        BinaryOp::DivUn => (ua / ub) as i64,
        BinaryOp::RemUn => (ua % ub) as i64,
        BinaryOp::And => a & b,
        BinaryOp::Or => a | b,
        BinaryOp::Xor => a ^ b,
        BinaryOp::AddOvf => a.checked_add(b).ok_or(Fault::Overflow)?,
        BinaryOp::SubOvf => a.checked_sub(b).ok_or(Fault::Overflow)?,
        BinaryOp::MulOvf => a.checked_mul(b).ok_or(Fault::Overflow)?,
        BinaryOp::AddOvfUn => ua.checked_add(ub).ok_or(Fault::Overflow)? as i64,
        BinaryOp::SubOvfUn => ua.checked_sub(ub).ok_or(Fault::Overflow)? as i64,
        BinaryOp::MulOvfUn => ua.checked_mul(ub).ok_or(Fault::Overflow)? as i64,
    };
    Ok(wrap(width, result))
}

fn float_operand(value: &Value) -> Option<f64> {
    match value {
        Value::R8(value) => Some(*value),
        Value::I4(value) => Some(f64::from(*value)),
        #[allow(clippy::cast_precision_loss)]
        Value::I8(value) | Value::IntPtr(value) => Some(*value as f64),
        _ => None,
    }
}

/// Applies a binary numeric operator.
pub(crate) fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, Fault> {
    if let Some((width, a, b)) = integer_operands(left, right) {
        return integer_binary(op, width, a, b);
    }

    if matches!(left, Value::R8(_)) || matches!(right, Value::R8(_)) {
        if op.is_bitwise() {
            return Err(Fault::Mismatch(format!("{op:?} on floating point operands")));
        }
        if let (Some(a), Some(b)) = (float_operand(left), float_operand(right)) {
            return Ok(Value::R8(match op {
                BinaryOp::Add | BinaryOp::AddOvf | BinaryOp::AddOvfUn => a + b,
                BinaryOp::Sub | BinaryOp::SubOvf | BinaryOp::SubOvfUn => a - b,
                BinaryOp::Mul | BinaryOp::MulOvf | BinaryOp::MulOvfUn => a * b,
                BinaryOp::Div | BinaryOp::DivUn => a / b,
                BinaryOp::Rem | BinaryOp::RemUn => a % b,
                BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => unreachable!(),
            }));
        }
    }

    Err(Fault::Mismatch(format!("{op:?} on {left} and {right}")))
}

/// Applies `shl`, `shr` or `shr.un`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
pub(crate) fn shift(mnemonic: &str, value: &Value, amount: &Value) -> Result<Value, Fault> {
    let amount = match amount {
        Value::I4(amount) => *amount as u32,
        Value::IntPtr(amount) => *amount as u32,
        other => return Err(Fault::Mismatch(format!("shift amount {other}"))),
    };

    Ok(match (mnemonic, value) {
        ("shl", Value::I4(v)) => Value::I4(v.wrapping_shl(amount)),
        ("shr", Value::I4(v)) => Value::I4(v.wrapping_shr(amount)),
        ("shr.un", Value::I4(v)) => Value::I4(((*v as u32).wrapping_shr(amount)) as i32),
        ("shl", Value::I8(v)) => Value::I8(v.wrapping_shl(amount)),
        ("shr", Value::I8(v)) => Value::I8(v.wrapping_shr(amount)),
        ("shr.un", Value::I8(v)) => Value::I8(((*v as u64).wrapping_shr(amount)) as i64),
        ("shl", Value::IntPtr(v)) => Value::IntPtr(v.wrapping_shl(amount)),
        ("shr", Value::IntPtr(v)) => Value::IntPtr(v.wrapping_shr(amount)),
        ("shr.un", Value::IntPtr(v)) => Value::IntPtr(((*v as u64).wrapping_shr(amount)) as i64),
        (_, other) => return Err(Fault::Mismatch(format!("{mnemonic} on {other}"))),
    })
}

/// Applies `neg` or `not`.
pub(crate) fn unary(mnemonic: &str, value: &Value) -> Result<Value, Fault> {
    Ok(match (mnemonic, value) {
        ("neg", Value::I4(v)) => Value::I4(v.wrapping_neg()),
        ("neg", Value::I8(v)) => Value::I8(v.wrapping_neg()),
        ("neg", Value::IntPtr(v)) => Value::IntPtr(v.wrapping_neg()),
        ("neg", Value::R8(v)) => Value::R8(-v),
        ("not", Value::I4(v)) => Value::I4(!v),
        ("not", Value::I8(v)) => Value::I8(!v),
        ("not", Value::IntPtr(v)) => Value::IntPtr(!v),
        (_, other) => return Err(Fault::Mismatch(format!("{mnemonic} on {other}"))),
    })
}

/// Orders two stack values; `None` when they are unordered (NaN).
///
/// References only compare for identity: a non-null reference orders above null and
/// two distinct references order as `Greater`, which is what `cgt.un` and `bne.un`
/// rely on for reference inequality.
#[allow(clippy::cast_sign_loss)]
pub(crate) fn compare(left: &Value, right: &Value, unsigned: bool) -> Result<Option<Ordering>, Fault> {
    if let Some((width, a, b)) = integer_operands(left, right) {
        if unsigned {
            return Ok(Some(match width {
                #[allow(clippy::cast_possible_truncation)]
                Width::I4 => (a as u32).cmp(&(b as u32)),
                Width::I8 | Width::Native => (a as u64).cmp(&(b as u64)),
            }));
        }
        return Ok(Some(a.cmp(&b)));
    }

    if let (Value::R8(_), _) | (_, Value::R8(_)) = (left, right) {
        if let (Some(a), Some(b)) = (float_operand(left), float_operand(right)) {
            return Ok(a.partial_cmp(&b));
        }
    }

    match (left, right) {
        (Value::Null, Value::Null) => Ok(Some(Ordering::Equal)),
        (Value::ObjectRef(_), Value::Null) | (Value::FunctionPointer(_), Value::Null) => {
            Ok(Some(Ordering::Greater))
        }
        (Value::Null, Value::ObjectRef(_)) => Ok(Some(Ordering::Less)),
        (Value::ObjectRef(a), Value::ObjectRef(b)) => Ok(Some(if a == b {
            Ordering::Equal
        } else {
            Ordering::Greater
        })),
        (Value::ManagedPtr(a), Value::ManagedPtr(b)) => Ok(Some(if a == b {
            Ordering::Equal
        } else {
            Ordering::Greater
        })),
        (Value::FunctionPointer(a), Value::FunctionPointer(b)) => Ok(Some(if a == b {
            Ordering::Equal
        } else {
            Ordering::Greater
        })),
        _ => Err(Fault::Mismatch(format!("cannot compare {left} and {right}"))),
    }
}

/// Evaluates the condition of `ceq`/`cgt`/`clt` and the two-operand branches, given the
/// mnemonic without its `.s` suffix.
pub(crate) fn condition(mnemonic: &str, left: &Value, right: &Value) -> Result<bool, Fault> {
    let unsigned = mnemonic.ends_with(".un");
    let ordering = compare(left, right, unsigned)?;
    let base = mnemonic.strip_suffix(".un").unwrap_or(mnemonic);

    Ok(match (base, ordering) {
        ("beq" | "ceq", Some(ordering)) => ordering == Ordering::Equal,
        ("bne", Some(ordering)) => ordering != Ordering::Equal,
        ("bge", Some(ordering)) => ordering != Ordering::Less,
        ("bgt" | "cgt", Some(ordering)) => ordering == Ordering::Greater,
        ("ble", Some(ordering)) => ordering != Ordering::Greater,
        ("blt" | "clt", Some(ordering)) => ordering == Ordering::Less,
        ("bne", None) => true,
        (_, None) => unsigned,
        _ => return Err(Fault::Mismatch(format!("no condition for {mnemonic}"))),
    })
}

/// Target of a `conv.*` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Signed(u32),
    Unsigned(u32),
    NativeSigned,
    NativeUnsigned,
    R4,
    R8,
    RUnsigned,
}

impl Target {
    fn parse(kind: &str) -> Option<Target> {
        Some(match kind {
            "i1" => Target::Signed(8),
            "i2" => Target::Signed(16),
            "i4" => Target::Signed(32),
            "i8" => Target::Signed(64),
            "u1" => Target::Unsigned(8),
            "u2" => Target::Unsigned(16),
            "u4" => Target::Unsigned(32),
            "u8" => Target::Unsigned(64),
            "i" => Target::NativeSigned,
            "u" => Target::NativeUnsigned,
            "r4" => Target::R4,
            "r8" => Target::R8,
            "r" => Target::RUnsigned,
            _ => return None,
        })
    }

    fn range(self) -> Option<(i128, i128)> {
        match self {
            Target::Signed(bits) => Some((-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)),
            Target::Unsigned(bits) => Some((0, (1i128 << bits) - 1)),
            Target::NativeSigned => Some((i128::from(i64::MIN), i128::from(i64::MAX))),
            Target::NativeUnsigned => Some((0, i128::from(u64::MAX))),
            Target::R4 | Target::R8 | Target::RUnsigned => None,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn wrap(self, value: i128) -> Value {
        match self {
            Target::Signed(8) => Value::I4(i32::from(value as i8)),
            Target::Signed(16) => Value::I4(i32::from(value as i16)),
            Target::Signed(32) => Value::I4(value as i32),
            Target::Unsigned(8) => Value::I4(i32::from(value as u8)),
            Target::Unsigned(16) => Value::I4(i32::from(value as u16)),
            Target::Unsigned(32) => Value::I4(value as u32 as i32),
            Target::Signed(_) | Target::Unsigned(_) => Value::I8(value as i64),
            Target::NativeSigned | Target::NativeUnsigned => Value::IntPtr(value as i64),
            Target::R4 | Target::R8 | Target::RUnsigned => Value::R8(value as f64),
        }
    }
}

/// Whether `mnemonic` is one of the `conv.*` family.
pub(crate) fn is_conversion(mnemonic: &str) -> bool {
    mnemonic.starts_with("conv.")
}

/// Applies a `conv.*` instruction.
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
pub(crate) fn convert(mnemonic: &str, value: &Value) -> Result<Value, Fault> {
    let rest = mnemonic
        .strip_prefix("conv.")
        .ok_or_else(|| Fault::Mismatch(format!("{mnemonic} is not a conversion")))?;
    let (checked, rest) = match rest.strip_prefix("ovf.") {
        Some(rest) => (true, rest),
        None => (false, rest),
    };
    let (unsigned_source, kind) = match rest.strip_suffix(".un") {
        Some(kind) => (true, kind),
        None => (false, rest),
    };
    let target =
        Target::parse(kind).ok_or_else(|| Fault::Mismatch(format!("unknown conversion {mnemonic}")))?;

    // Unchecked widening of an int32 to an unsigned 64-bit or native target zero-extends.
    let zero_extend = unsigned_source
        || (!checked && matches!(target, Target::Unsigned(64) | Target::NativeUnsigned));

    let source: Result<i128, f64> = match value {
        Value::I4(v) if zero_extend => Ok(i128::from(*v as u32)),
        Value::I4(v) => Ok(i128::from(*v)),
        Value::I8(v) | Value::IntPtr(v) if unsigned_source => Ok(i128::from(*v as u64)),
        Value::I8(v) | Value::IntPtr(v) => Ok(i128::from(*v)),
        Value::R8(v) => Err(*v),
        other => return Err(Fault::Mismatch(format!("{mnemonic} on {other}"))),
    };

    match (target, source) {
        (Target::R4, Ok(integer)) => Ok(Value::R8(f64::from(integer as f32))),
        (Target::R4, Err(float)) => Ok(Value::R8(f64::from(float as f32))),
        (Target::R8 | Target::RUnsigned, Ok(integer)) => Ok(Value::R8(integer as f64)),
        (Target::R8 | Target::RUnsigned, Err(float)) => Ok(Value::R8(float)),
        (target, Ok(integer)) => {
            if checked {
                if let Some((min, max)) = target.range() {
                    if integer < min || integer > max {
                        return Err(Fault::Overflow);
                    }
                }
            }
            Ok(target.wrap(integer))
        }
        (target, Err(float)) => {
            let truncated = float.trunc();
            if checked {
                let in_range = target.range().is_some_and(|(min, max)| {
                    truncated.is_finite() && truncated >= min as f64 && truncated <= max as f64
                });
                if !in_range {
                    return Err(Fault::Overflow);
                }
            }
            Ok(target.wrap(truncated as i128))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int32_arithmetic_wraps() {
        assert_eq!(
            binary(BinaryOp::Add, &Value::I4(i32::MAX), &Value::I4(1)),
            Ok(Value::I4(i32::MIN))
        );
        assert_eq!(
            binary(BinaryOp::AddOvf, &Value::I4(i32::MAX), &Value::I4(1)),
            Err(Fault::Overflow)
        );
        assert_eq!(
            binary(BinaryOp::DivUn, &Value::I4(-2), &Value::I4(2)),
            Ok(Value::I4(0x7FFF_FFFF))
        );
        assert_eq!(binary(BinaryOp::Div, &Value::I4(1), &Value::I4(0)), Err(Fault::DivideByZero));
        assert_eq!(binary(BinaryOp::Rem, &Value::I4(7), &Value::I4(3)), Ok(Value::I4(1)));
    }

    #[test]
    fn mixed_widths() {
        assert_eq!(binary(BinaryOp::Mul, &Value::I8(3), &Value::I8(4)), Ok(Value::I8(12)));
        assert_eq!(binary(BinaryOp::Add, &Value::IntPtr(3), &Value::I4(4)), Ok(Value::IntPtr(7)));
        assert_eq!(binary(BinaryOp::Div, &Value::R8(1.0), &Value::R8(4.0)), Ok(Value::R8(0.25)));
        assert!(matches!(
            binary(BinaryOp::And, &Value::R8(1.0), &Value::R8(1.0)),
            Err(Fault::Mismatch(_))
        ));
        assert!(binary(BinaryOp::Add, &Value::Null, &Value::I4(1)).is_err());
    }

    #[test]
    fn shifts_and_unary() {
        assert_eq!(shift("shl", &Value::I4(1), &Value::I4(4)), Ok(Value::I4(16)));
        assert_eq!(shift("shr", &Value::I4(-16), &Value::I4(2)), Ok(Value::I4(-4)));
        assert_eq!(shift("shr.un", &Value::I4(-1), &Value::I4(28)), Ok(Value::I4(15)));
        assert_eq!(unary("neg", &Value::I4(5)), Ok(Value::I4(-5)));
        assert_eq!(unary("not", &Value::I8(0)), Ok(Value::I8(-1)));
    }

    #[test]
    fn conditions() -> Result<(), Fault> {
        assert!(condition("ceq", &Value::I4(3), &Value::I4(3))?);
        assert!(condition("clt", &Value::I4(-1), &Value::I4(0))?);
        assert!(!condition("clt.un", &Value::I4(-1), &Value::I4(0))?);
        assert!(condition("bge", &Value::I8(5), &Value::I8(5))?);
        assert!(condition("bne.un", &Value::R8(f64::NAN), &Value::R8(f64::NAN))?);
        assert!(!condition("bgt", &Value::R8(f64::NAN), &Value::R8(1.0))?);
        assert!(condition("bgt.un", &Value::R8(f64::NAN), &Value::R8(1.0))?);

        let object = Value::ObjectRef(crate::emulation::value::HeapRef::new(3));
        assert!(condition("cgt.un", &object, &Value::Null)?);
        assert!(condition("ceq", &Value::Null, &Value::Null)?);
        assert!(!condition("ceq", &object, &Value::Null)?);
        Ok(())
    }

    #[test]
    fn conversions() {
        assert_eq!(convert("conv.i1", &Value::I4(0x1FF)), Ok(Value::I4(-1)));
        assert_eq!(convert("conv.u1", &Value::I4(-1)), Ok(Value::I4(255)));
        assert_eq!(convert("conv.i8", &Value::I4(-3)), Ok(Value::I8(-3)));
        assert_eq!(convert("conv.u8", &Value::I4(-1)), Ok(Value::I8(0xFFFF_FFFF)));
        assert_eq!(convert("conv.u", &Value::I4(-2)), Ok(Value::IntPtr(0xFFFF_FFFE)));
        assert_eq!(convert("conv.u8", &Value::I8(-1)), Ok(Value::I8(-1)));
        assert_eq!(convert("conv.ovf.u8", &Value::I4(-1)), Err(Fault::Overflow));
        assert_eq!(convert("conv.i", &Value::I4(-1)), Ok(Value::IntPtr(-1)));
        assert_eq!(convert("conv.i4", &Value::R8(-2.75)), Ok(Value::I4(-2)));
        assert_eq!(convert("conv.r8", &Value::I4(2)), Ok(Value::R8(2.0)));
        assert_eq!(convert("conv.i", &Value::I4(7)), Ok(Value::IntPtr(7)));
        assert_eq!(convert("conv.ovf.u1", &Value::I4(256)), Err(Fault::Overflow));
        assert_eq!(convert("conv.ovf.i4", &Value::I8(1 << 40)), Err(Fault::Overflow));
        assert_eq!(convert("conv.ovf.i4.un", &Value::I4(-1)), Err(Fault::Overflow));
        assert_eq!(convert("conv.ovf.i4", &Value::R8(f64::NAN)), Err(Fault::Overflow));
        assert!(is_conversion("conv.r.un"));
        assert_eq!(convert("conv.r.un", &Value::I4(-1)), Ok(Value::R8(4_294_967_295.0)));
    }
}
