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

//! Runtime values.
//!
//! [`Value`] is what lives on the evaluation stack, in locals, arguments, fields and
//! array elements. Small integer types (`bool`, `char`, `int32`) all widen to
//! [`Value::I4`] the way ECMA-335 (III.1.1) stack types do.
//!
//! # Key Components
//!
//! - [`Value`] - A single runtime value
//! - [`HeapRef`] - Handle of an object on the [`crate::emulation::ManagedHeap`]
//! - [`ManagedPointer`] / [`PointerTarget`] - Managed pointers (`&`), as produced by
//!   `ldloca`, `ldarga`, `ldflda`, `ldsflda`, `ldelema` and `unbox`
//! - [`FunctionPointer`] - Result of `ldftn` / `ldvirtftn`

use std::fmt;

use crate::{
    metadata::{symbols::SymbolTable, token::Token, typesystem::TypeSig},
    Error, Result,
};

/// Reference to an object on the managed heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapRef(pub(crate) u64);

impl HeapRef {
    /// Creates a new heap reference from a raw id.
    #[must_use]
    pub fn new(id: u64) -> Self {
        HeapRef(id)
    }

    /// The raw id of the referenced object.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HeapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeapRef({})", self.0)
    }
}

/// Handle of a callable registered with the runtime, as pushed by `ldftn`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FunctionPointer(pub(crate) u64);

impl FunctionPointer {
    /// The raw index of the pointer in the runtime's function table.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FunctionPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fnptr({})", self.0)
    }
}

/// The storage location a managed pointer refers to.
#[derive(Clone, Debug, PartialEq)]
pub enum PointerTarget {
    /// A local variable of a live frame
    Local {
        /// Index of the frame on the thread's frame stack
        frame: usize,
        /// Local slot
        index: u16,
    },
    /// An argument of a live frame
    Argument {
        /// Index of the frame on the thread's frame stack
        frame: usize,
        /// Argument slot
        index: u16,
    },
    /// An array element
    ArrayElement {
        /// The array
        array: HeapRef,
        /// Element index
        index: usize,
    },
    /// A field of a heap object
    ObjectField {
        /// The object
        object: HeapRef,
        /// Field token
        field: Token,
    },
    /// A static field
    StaticField(Token),
    /// The payload of a boxed value type
    Boxed(HeapRef),
    /// A field of a value type reached through another pointer
    ValueField {
        /// Pointer to the containing value
        parent: Box<ManagedPointer>,
        /// Field token
        field: Token,
    },
}

/// A managed pointer (`&T`).
#[derive(Clone, Debug, PartialEq)]
pub struct ManagedPointer {
    /// Where the pointer points
    pub target: PointerTarget,
}

impl ManagedPointer {
    /// Pointer to a local variable of frame `frame`.
    #[must_use]
    pub fn to_local(frame: usize, index: u16) -> Self {
        ManagedPointer {
            target: PointerTarget::Local { frame, index },
        }
    }

    /// Pointer to an argument of frame `frame`.
    #[must_use]
    pub fn to_argument(frame: usize, index: u16) -> Self {
        ManagedPointer {
            target: PointerTarget::Argument { frame, index },
        }
    }

    /// Pointer to an array element.
    #[must_use]
    pub fn to_array_element(array: HeapRef, index: usize) -> Self {
        ManagedPointer {
            target: PointerTarget::ArrayElement { array, index },
        }
    }

    /// Pointer to a field of a heap object.
    #[must_use]
    pub fn to_object_field(object: HeapRef, field: Token) -> Self {
        ManagedPointer {
            target: PointerTarget::ObjectField { object, field },
        }
    }

    /// Pointer to a static field.
    #[must_use]
    pub fn to_static_field(field: Token) -> Self {
        ManagedPointer {
            target: PointerTarget::StaticField(field),
        }
    }

    /// Pointer to the payload of a boxed value.
    #[must_use]
    pub fn to_boxed(object: HeapRef) -> Self {
        ManagedPointer {
            target: PointerTarget::Boxed(object),
        }
    }

    /// Pointer to a field of the value type this pointer refers to.
    #[must_use]
    pub fn to_value_field(self, field: Token) -> Self {
        ManagedPointer {
            target: PointerTarget::ValueField {
                parent: Box::new(self),
                field,
            },
        }
    }
}

impl fmt::Display for ManagedPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            PointerTarget::Local { frame, index } => write!(f, "&loc{index}@{frame}"),
            PointerTarget::Argument { frame, index } => write!(f, "&arg{index}@{frame}"),
            PointerTarget::ArrayElement { array, index } => write!(f, "&{array}[{index}]"),
            PointerTarget::ObjectField { object, field } => write!(f, "&{object}.{field}"),
            PointerTarget::StaticField(field) => write!(f, "&static {field}"),
            PointerTarget::Boxed(object) => write!(f, "&unbox {object}"),
            PointerTarget::ValueField { parent, field } => write!(f, "{parent}.{field}"),
        }
    }
}

/// A runtime value.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    /// No value (void returns)
    #[default]
    Void,
    /// 32-bit integer, also `bool` and `char`
    I4(i32),
    /// 64-bit integer
    I8(i64),
    /// Floating point
    R8(f64),
    /// Native integer
    IntPtr(i64),
    /// Null reference
    Null,
    /// Reference to a heap object
    ObjectRef(HeapRef),
    /// Managed pointer
    ManagedPtr(ManagedPointer),
    /// Function pointer
    FunctionPointer(FunctionPointer),
    /// Unboxed value type instance
    ValueType {
        /// The value type
        type_token: Token,
        /// Instance fields in declaration order
        fields: Vec<(Token, Value)>,
    },
}

impl Value {
    /// The zero value of a location typed `signature`.
    ///
    /// Value types get all their instance fields zeroed, recursively.
    #[must_use]
    pub fn default_for(signature: &TypeSig, symbols: &dyn SymbolTable) -> Value {
        match signature {
            TypeSig::Void => Value::Void,
            TypeSig::Boolean | TypeSig::Char | TypeSig::I4 => Value::I4(0),
            TypeSig::I8 => Value::I8(0),
            TypeSig::R8 => Value::R8(0.0),
            TypeSig::IntPtr => Value::IntPtr(0),
            TypeSig::ValueType(token) => {
                if let Some(primitive) = symbols.core_types().primitive_sig(*token) {
                    return Value::default_for(&primitive, symbols);
                }
                let fields = symbols
                    .instance_fields(*token)
                    .iter()
                    .map(|field| (field.token, Value::default_for(&field.signature, symbols)))
                    .collect();
                Value::ValueType {
                    type_token: *token,
                    fields,
                }
            }
            TypeSig::String
            | TypeSig::Object
            | TypeSig::Class(_)
            | TypeSig::ByRef(_)
            | TypeSig::SzArray(_)
            | TypeSig::GenericParam(_) => Value::Null,
        }
    }

    /// Whether the value is a null reference.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The value as a 32-bit integer.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for non-integer values.
    pub fn as_i4(&self) -> Result<i32> {
        match self {
            Value::I4(value) => Ok(*value),
            #[allow(clippy::cast_possible_truncation)]
            Value::I8(value) | Value::IntPtr(value) => Ok(*value as i32),
            other => Err(Error::TypeMismatch(format!("expected int32, found {other}"))),
        }
    }

    /// The value as a 64-bit integer, sign-extending `int32`.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for non-integer values.
    pub fn as_i8(&self) -> Result<i64> {
        match self {
            Value::I4(value) => Ok(i64::from(*value)),
            Value::I8(value) | Value::IntPtr(value) => Ok(*value),
            other => Err(Error::TypeMismatch(format!("expected int64, found {other}"))),
        }
    }

    /// The value as a float.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for non-numeric values.
    pub fn as_r8(&self) -> Result<f64> {
        match self {
            Value::R8(value) => Ok(*value),
            Value::I4(value) => Ok(f64::from(*value)),
            #[allow(clippy::cast_precision_loss)]
            Value::I8(value) | Value::IntPtr(value) => Ok(*value as f64),
            other => Err(Error::TypeMismatch(format!("expected float64, found {other}"))),
        }
    }

    /// Truthiness as tested by `brtrue`: non-zero numbers and non-null references.
    #[must_use]
    pub fn is_true(&self) -> bool {
        match self {
            Value::I4(value) => *value != 0,
            Value::I8(value) | Value::IntPtr(value) => *value != 0,
            Value::R8(value) => *value != 0.0,
            Value::Null | Value::Void => false,
            Value::ObjectRef(_)
            | Value::ManagedPtr(_)
            | Value::FunctionPointer(_)
            | Value::ValueType { .. } => true,
        }
    }

    /// The referenced heap object, `None` for null.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for values that are not object references.
    pub fn as_object(&self) -> Result<Option<HeapRef>> {
        match self {
            Value::ObjectRef(object) => Ok(Some(*object)),
            Value::Null => Ok(None),
            other => Err(Error::TypeMismatch(format!(
                "expected object reference, found {other}"
            ))),
        }
    }

    /// The value as a managed pointer.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for values that are not managed pointers.
    pub fn as_pointer(&self) -> Result<&ManagedPointer> {
        match self {
            Value::ManagedPtr(pointer) => Ok(pointer),
            other => Err(Error::TypeMismatch(format!(
                "expected managed pointer, found {other}"
            ))),
        }
    }

    /// The type token of an unboxed value type instance.
    #[must_use]
    pub fn value_type_token(&self) -> Option<Token> {
        match self {
            Value::ValueType { type_token, .. } => Some(*type_token),
            _ => None,
        }
    }

    /// A field of an unboxed value type instance.
    ///
    /// # Errors
    /// Returns [`Error::FieldNotFound`] if the instance has no such field and
    /// [`Error::TypeMismatch`] if the value is not a value type instance.
    pub fn field(&self, field: Token) -> Result<&Value> {
        match self {
            Value::ValueType { fields, .. } => fields
                .iter()
                .find(|(token, _)| *token == field)
                .map(|(_, value)| value)
                .ok_or(Error::FieldNotFound(field)),
            other => Err(Error::TypeMismatch(format!(
                "expected value type instance, found {other}"
            ))),
        }
    }

    /// Replaces a field of an unboxed value type instance.
    ///
    /// # Errors
    /// Returns [`Error::FieldNotFound`] if the instance has no such field and
    /// [`Error::TypeMismatch`] if the value is not a value type instance.
    pub fn set_field(&mut self, field: Token, value: Value) -> Result<()> {
        match self {
            Value::ValueType { fields, .. } => {
                let slot = fields
                    .iter_mut()
                    .find(|(token, _)| *token == field)
                    .ok_or(Error::FieldNotFound(field))?;
                slot.1 = value;
                Ok(())
            }
            other => Err(Error::TypeMismatch(format!(
                "expected value type instance, found {other}"
            ))),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::I4(i32::from(value))
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::I4(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::I8(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::R8(value)
    }
}

impl From<HeapRef> for Value {
    fn from(value: HeapRef) -> Self {
        Value::ObjectRef(value)
    }
}

impl From<ManagedPointer> for Value {
    fn from(value: ManagedPointer) -> Self {
        Value::ManagedPtr(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => write!(f, "void"),
            Value::I4(value) => write!(f, "{value}"),
            Value::I8(value) => write!(f, "{value}L"),
            Value::R8(value) => write!(f, "{value}"),
            Value::IntPtr(value) => write!(f, "{value}n"),
            Value::Null => write!(f, "null"),
            Value::ObjectRef(object) => write!(f, "{object}"),
            Value::ManagedPtr(pointer) => write!(f, "{pointer}"),
            Value::FunctionPointer(pointer) => write!(f, "{pointer}"),
            Value::ValueType { type_token, fields } => {
                write!(f, "valuetype {type_token} {{")?;
                for (index, (field, value)) in fields.iter().enumerate() {
                    if index > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, " {field}: {value}")?;
                }
                write!(f, " }}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        builders::{FieldDefBuilder, TypeDefBuilder},
        Module,
    };

    #[test]
    fn integer_widening() -> Result<()> {
        assert_eq!(Value::from(true), Value::I4(1));
        assert_eq!(Value::I4(-2).as_i8()?, -2);
        assert_eq!(Value::I8(0x1_0000_0005).as_i4()?, 5);
        assert!(Value::Null.as_i4().is_err());
        assert!(!Value::I4(0).is_true());
        assert!(Value::ObjectRef(HeapRef::new(1)).is_true());
        Ok(())
    }

    #[test]
    fn value_type_defaults() -> Result<()> {
        let module = Module::new();
        let point = TypeDefBuilder::new("Geometry", "Point")
            .value_type()
            .build(&module)?;
        let x = FieldDefBuilder::new("X", TypeSig::I4).build(&module, point)?;
        let y = FieldDefBuilder::new("Y", TypeSig::R8).build(&module, point)?;
        FieldDefBuilder::new("Origin", TypeSig::ValueType(point))
            .static_field()
            .build(&module, point)?;

        let mut value = Value::default_for(&TypeSig::ValueType(point), &module);
        assert_eq!(value.value_type_token(), Some(point));
        assert_eq!(value.field(x)?, &Value::I4(0));
        assert_eq!(value.field(y)?, &Value::R8(0.0));

        value.set_field(x, Value::I4(7))?;
        assert_eq!(value.field(x)?, &Value::I4(7));
        assert!(value.field(Token::new(0x0400_0999)).is_err());

        let int32 = module.corlib().int32;
        assert_eq!(Value::default_for(&TypeSig::ValueType(int32), &module), Value::I4(0));
        assert_eq!(Value::default_for(&TypeSig::String, &module), Value::Null);
        Ok(())
    }

    #[test]
    fn pointer_display() {
        let pointer = ManagedPointer::to_local(2, 1).to_value_field(Token::new(0x0400_0003));
        assert_eq!(pointer.to_string(), "&loc1@2.0x04000003");
        assert_eq!(HeapRef::new(4).to_string(), "HeapRef(4)");
    }
}
