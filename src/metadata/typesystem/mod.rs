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

//! Type signatures and type/field definitions.
//!
//! [`TypeSig`] is the structural shape of a type as it appears in method signatures,
//! field declarations and local variable lists. Equality on [`TypeSig`] is exact
//! structural equality, which is what shim signature validation and
//! [`crate::metadata::MethodIdentity`] comparisons rely on.
//!
//! [`TypeDef`] and [`FieldDef`] are the definitions a
//! [`crate::metadata::SymbolTable`] hands out.

use std::fmt;

use bitflags::bitflags;

use crate::metadata::token::Token;

/// Structural type signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeSig {
    /// `void`, only valid as a return type
    Void,
    /// `bool`
    Boolean,
    /// `char`
    Char,
    /// 32-bit signed integer
    I4,
    /// 64-bit signed integer
    I8,
    /// 64-bit float
    R8,
    /// `string`
    String,
    /// `object`
    Object,
    /// `native int`, also the type of function pointers
    IntPtr,
    /// A reference type defined in the symbol table
    Class(Token),
    /// A value type defined in the symbol table
    ValueType(Token),
    /// A managed pointer to the inner type
    ByRef(Box<TypeSig>),
    /// A single-dimensional zero-based array
    SzArray(Box<TypeSig>),
    /// A generic parameter by position
    GenericParam(u16),
}

impl TypeSig {
    /// Wraps this type in a managed pointer.
    #[must_use]
    pub fn by_ref(self) -> TypeSig {
        TypeSig::ByRef(Box::new(self))
    }

    /// Returns `true` for managed pointers.
    #[must_use]
    pub fn is_by_ref(&self) -> bool {
        matches!(self, TypeSig::ByRef(_))
    }

    /// Returns `true` for types with value semantics.
    #[must_use]
    pub fn is_value_type(&self) -> bool {
        matches!(
            self,
            TypeSig::Boolean
                | TypeSig::Char
                | TypeSig::I4
                | TypeSig::I8
                | TypeSig::R8
                | TypeSig::IntPtr
                | TypeSig::ValueType(_)
        )
    }

    /// The defining token of a class or value type signature.
    #[must_use]
    pub fn type_token(&self) -> Option<Token> {
        match self {
            TypeSig::Class(token) | TypeSig::ValueType(token) => Some(*token),
            _ => None,
        }
    }

    /// Replaces generic parameters by the matching entry of `args`.
    ///
    /// Parameters without a matching argument are kept as they are.
    #[must_use]
    pub fn substitute(&self, args: &[TypeSig]) -> TypeSig {
        match self {
            TypeSig::GenericParam(index) => args
                .get(usize::from(*index))
                .cloned()
                .unwrap_or_else(|| self.clone()),
            TypeSig::ByRef(inner) => TypeSig::ByRef(Box::new(inner.substitute(args))),
            TypeSig::SzArray(inner) => TypeSig::SzArray(Box::new(inner.substitute(args))),
            other => other.clone(),
        }
    }

    /// Strips one level of managed pointer.
    #[must_use]
    pub fn element(&self) -> &TypeSig {
        match self {
            TypeSig::ByRef(inner) | TypeSig::SzArray(inner) => inner,
            other => other,
        }
    }
}

impl fmt::Display for TypeSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSig::Void => write!(f, "void"),
            TypeSig::Boolean => write!(f, "bool"),
            TypeSig::Char => write!(f, "char"),
            TypeSig::I4 => write!(f, "int32"),
            TypeSig::I8 => write!(f, "int64"),
            TypeSig::R8 => write!(f, "float64"),
            TypeSig::String => write!(f, "string"),
            TypeSig::Object => write!(f, "object"),
            TypeSig::IntPtr => write!(f, "native int"),
            TypeSig::Class(token) => write!(f, "class {token}"),
            TypeSig::ValueType(token) => write!(f, "valuetype {token}"),
            TypeSig::ByRef(inner) => write!(f, "{inner}&"),
            TypeSig::SzArray(inner) => write!(f, "{inner}[]"),
            TypeSig::GenericParam(index) => write!(f, "!!{index}"),
        }
    }
}

bitflags! {
    /// Type attributes (ECMA-335 II.23.1.15), restricted to the ones the runtime reads.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeAttributes: u32 {
        /// Type is public
        const PUBLIC = 0x0000_0001;
        /// Type is an interface
        const INTERFACE = 0x0000_0020;
        /// Type is abstract
        const ABSTRACT = 0x0000_0080;
        /// Type cannot be derived from
        const SEALED = 0x0000_0100;
        /// Type is compiler or runtime special
        const SPECIAL_NAME = 0x0000_0400;
    }
}

bitflags! {
    /// Field attributes (ECMA-335 II.23.1.5), restricted to the ones the runtime reads.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldAttributes: u16 {
        /// Field is public
        const PUBLIC = 0x0006;
        /// Field belongs to the type, not to instances
        const STATIC = 0x0010;
        /// Field can only be initialized
        const INIT_ONLY = 0x0020;
    }
}

/// A type definition.
#[derive(Debug, Clone)]
pub struct TypeDef {
    /// Token of this definition
    pub token: Token,
    /// Namespace, may be empty
    pub namespace: String,
    /// Simple name
    pub name: String,
    /// Attributes
    pub flags: TypeAttributes,
    /// Base class, `None` only for `System.Object` and interfaces
    pub base: Option<Token>,
    /// Implemented interfaces
    pub interfaces: Vec<Token>,
    /// Whether instances have value semantics
    pub is_value_type: bool,
}

impl TypeDef {
    /// `Namespace.Name`, or just the name for the global namespace.
    #[must_use]
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    /// Returns `true` if this is an interface.
    #[must_use]
    pub fn is_interface(&self) -> bool {
        self.flags.contains(TypeAttributes::INTERFACE)
    }

    /// The signature used to refer to this type.
    #[must_use]
    pub fn signature(&self) -> TypeSig {
        if self.is_value_type {
            TypeSig::ValueType(self.token)
        } else {
            TypeSig::Class(self.token)
        }
    }
}

/// A field definition.
#[derive(Debug, Clone)]
pub struct FieldDef {
    /// Token of this definition
    pub token: Token,
    /// Declaring type
    pub declaring_type: Token,
    /// Field name
    pub name: String,
    /// Field type
    pub signature: TypeSig,
    /// Attributes
    pub flags: FieldAttributes,
}

impl FieldDef {
    /// Returns `true` for static fields.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(FieldAttributes::STATIC)
    }
}
