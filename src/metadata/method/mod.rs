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

//! Method definitions, identities, bodies and exception clauses.
//!
//! # Key Components
//!
//! - [`MethodDef`] - A method as stored in a symbol table, including its raw body bytes
//! - [`MethodIdentity`] - The hashable key used by shims and the stub cache
//! - [`MethodBody`] - A parsed body header with its exception clauses
//! - [`ExceptionHandler`] - One exception handling clause
//!
//! A [`MethodDef`] keeps its body in a [`std::sync::OnceLock`] so a method can be
//! declared first (to obtain its token, for recursive or mutually recursive calls) and
//! implemented afterwards.

mod body;
mod exceptions;
mod types;

pub use body::*;
pub use exceptions::*;
pub use types::*;

use std::{fmt, sync::Arc, sync::OnceLock};

use bitflags::bitflags;

use crate::{
    metadata::{token::Token, typesystem::TypeSig},
    Result,
};

/// A reference-counted method definition
pub type MethodDefRc = Arc<MethodDef>;

/// Name of instance constructors
pub const CONSTRUCTOR_NAME: &str = ".ctor";

/// A method definition.
#[derive(Debug)]
pub struct MethodDef {
    /// Token of this definition
    pub token: Token,
    /// Declaring type
    pub declaring_type: Token,
    /// Method name
    pub name: String,
    /// Attribute flags
    pub flags: MethodModifiers,
    /// Access flags
    pub access: MethodAccessFlags,
    /// Implementation code type
    pub impl_code_type: MethodImplCodeType,
    /// Implementation options
    pub impl_options: MethodImplOptions,
    /// Parameter types, without the implicit receiver
    pub params: Vec<TypeSig>,
    /// Return type
    pub return_type: TypeSig,
    /// Number of generic parameters
    pub generic_arity: u16,
    /// Generic arguments of an instantiation, empty for definitions
    pub generic_args: Vec<TypeSig>,
    /// Raw body bytes (header, code, sections), set once
    pub body: OnceLock<Vec<u8>>,
}

impl MethodDef {
    /// Whether the method has no implicit receiver.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodModifiers::STATIC)
    }

    /// Whether the method is an instance constructor.
    #[must_use]
    pub fn is_constructor(&self) -> bool {
        !self.is_static() && self.name == CONSTRUCTOR_NAME
    }

    /// Whether the method is abstract.
    #[must_use]
    pub fn is_abstract(&self) -> bool {
        self.flags.contains(MethodModifiers::ABSTRACT)
    }

    /// Whether the method is virtual.
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        self.flags.contains(MethodModifiers::VIRTUAL)
    }

    /// Whether the method is `virtual` and may still be overridden.
    #[must_use]
    pub fn is_overridable(&self) -> bool {
        self.is_virtual() && !self.flags.contains(MethodModifiers::FINAL)
    }

    /// Whether the method is implemented inside the runtime.
    #[must_use]
    pub fn is_internal_call(&self) -> bool {
        self.impl_options.contains(MethodImplOptions::INTERNAL_CALL)
            || self.impl_code_type == MethodImplCodeType::RUNTIME
    }

    /// Whether the method is a platform invoke.
    #[must_use]
    pub fn is_pinvoke(&self) -> bool {
        self.flags.contains(MethodModifiers::PINVOKE_IMPL)
    }

    /// Whether CIL bytes are available for this method.
    #[must_use]
    pub fn has_body(&self) -> bool {
        self.body.get().is_some()
    }

    /// Raw body bytes, if the method has a body.
    #[must_use]
    pub fn body_bytes(&self) -> Option<&[u8]> {
        self.body.get().map(Vec::as_slice)
    }

    /// The signature a call site sees.
    #[must_use]
    pub fn signature(&self) -> MethodSignature {
        MethodSignature {
            has_this: !self.is_static(),
            params: self.params.clone(),
            return_type: self.return_type.clone(),
        }
    }

    /// The identity of this method, including the arguments of an instantiation.
    #[must_use]
    pub fn identity(&self) -> MethodIdentity {
        let mut flags = IdentityFlags::empty();
        flags.set(IdentityFlags::STATIC, self.is_static());
        flags.set(IdentityFlags::CONSTRUCTOR, self.is_constructor());
        flags.set(IdentityFlags::ABSTRACT, self.is_abstract());
        flags.set(IdentityFlags::VIRTUAL, self.is_virtual());

        MethodIdentity {
            method: self.token,
            declaring_type: self.declaring_type,
            name: self.name.clone(),
            params: self.params.clone(),
            return_type: self.return_type.clone(),
            flags,
            generic_arity: self.generic_arity,
            generic_args: self.generic_args.clone(),
        }
    }

    /// Whether this is an instantiation of a generic method definition.
    #[must_use]
    pub fn is_instantiation(&self) -> bool {
        !self.generic_args.is_empty()
    }

    /// Builds the instantiation of this generic definition under `token`.
    ///
    /// Generic parameters in the signature are replaced by `generic_args`; the body
    /// is shared as it is at the time of the call.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] when the method is not a generic definition
    /// or the argument count differs from its arity.
    pub fn instantiate(&self, token: Token, generic_args: Vec<TypeSig>) -> Result<MethodDef> {
        if self.is_instantiation() || self.generic_arity == 0 {
            return Err(malformed_error!(
                "{} is not a generic method definition",
                self.name
            ));
        }
        if generic_args.len() != usize::from(self.generic_arity) {
            return Err(malformed_error!(
                "{} takes {} generic argument(s), got {}",
                self.name,
                self.generic_arity,
                generic_args.len()
            ));
        }

        let body = OnceLock::new();
        if let Some(bytes) = self.body.get() {
            let _ = body.set(bytes.clone());
        }
        Ok(MethodDef {
            token,
            declaring_type: self.declaring_type,
            name: self.name.clone(),
            flags: self.flags,
            access: self.access,
            impl_code_type: self.impl_code_type,
            impl_options: self.impl_options,
            params: self
                .params
                .iter()
                .map(|param| param.substitute(&generic_args))
                .collect(),
            return_type: self.return_type.substitute(&generic_args),
            generic_arity: self.generic_arity,
            generic_args,
            body,
        })
    }

    /// Whether `other` has the same name and parameter list.
    #[must_use]
    pub fn same_shape(&self, other: &MethodDef) -> bool {
        self.name == other.name && self.params == other.params
    }
}

bitflags! {
    /// The flag components of a [`MethodIdentity`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IdentityFlags: u8 {
        /// No implicit receiver
        const STATIC = 0x01;
        /// Instance constructor
        const CONSTRUCTOR = 0x02;
        /// Abstract
        const ABSTRACT = 0x04;
        /// Virtual
        const VIRTUAL = 0x08;
    }
}

/// The identity of a method.
///
/// Two identities are equal iff every component matches, including the exact generic
/// instantiation. Shims, the stub cache and rewritten-body caches are all keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodIdentity {
    /// Definition token
    pub method: Token,
    /// Declaring type
    pub declaring_type: Token,
    /// Member name
    pub name: String,
    /// Parameter types, without the implicit receiver
    pub params: Vec<TypeSig>,
    /// Return type
    pub return_type: TypeSig,
    /// Static, constructor, abstract and virtual flags
    pub flags: IdentityFlags,
    /// Number of generic parameters
    pub generic_arity: u16,
    /// Generic arguments of this instantiation, empty for the open definition
    pub generic_args: Vec<TypeSig>,
}

impl MethodIdentity {
    /// Whether the method has no implicit receiver.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(IdentityFlags::STATIC)
    }

    /// Whether the method is an instance constructor.
    #[must_use]
    pub fn is_constructor(&self) -> bool {
        self.flags.contains(IdentityFlags::CONSTRUCTOR)
    }

    /// Whether the method is virtual.
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        self.flags.contains(IdentityFlags::VIRTUAL)
    }

    /// Whether the method is abstract.
    #[must_use]
    pub fn is_abstract(&self) -> bool {
        self.flags.contains(IdentityFlags::ABSTRACT)
    }
}

impl fmt::Display for MethodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}::{}", self.return_type, self.declaring_type, self.name)?;
        if !self.generic_args.is_empty() {
            write!(f, "<")?;
            for (index, arg) in self.generic_args.iter().enumerate() {
                if index > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{arg}")?;
            }
            write!(f, ">")?;
        }
        write!(f, "(")?;
        for (index, param) in self.params.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{param}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn method(name: &str, flags: MethodModifiers) -> MethodDef {
        MethodDef {
            token: Token::new(0x0600_0010),
            declaring_type: Token::new(0x0200_0008),
            name: name.to_string(),
            flags,
            access: MethodAccessFlags::PUBLIC,
            impl_code_type: MethodImplCodeType::IL,
            impl_options: MethodImplOptions::empty(),
            params: vec![TypeSig::I4],
            return_type: TypeSig::Void,
            generic_arity: 1,
            generic_args: Vec::new(),
            body: OnceLock::new(),
        }
    }

    #[test]
    fn flags() {
        let ctor = method(CONSTRUCTOR_NAME, MethodModifiers::RTSPECIAL_NAME);
        assert!(ctor.is_constructor());
        assert!(!ctor.has_body());
        assert!(ctor.identity().is_constructor());

        let virt = method("Run", MethodModifiers::VIRTUAL | MethodModifiers::FINAL);
        assert!(virt.is_virtual());
        assert!(!virt.is_overridable());
        assert!(virt.identity().is_virtual());
    }

    #[test]
    fn generic_identity_inequality() -> Result<()> {
        let definition = method("Map", MethodModifiers::STATIC);
        let spec = Token::new(0x2B00_0001);
        let open = definition.identity();
        let as_int = definition.instantiate(spec, vec![TypeSig::I4])?.identity();
        let as_string = definition.instantiate(spec, vec![TypeSig::String])?.identity();

        assert_ne!(open, as_int);
        assert_ne!(as_int, as_string);
        assert_eq!(as_int, definition.instantiate(spec, vec![TypeSig::I4])?.identity());

        let set: HashSet<_> = [open, as_int.clone(), as_string, as_int].into_iter().collect();
        assert_eq!(set.len(), 3);
        Ok(())
    }

    #[test]
    fn instantiation_substitutes_generic_parameters() -> Result<()> {
        let mut open = method("Wrap", MethodModifiers::STATIC);
        open.params = vec![TypeSig::GenericParam(0), TypeSig::GenericParam(0).by_ref()];
        open.return_type = TypeSig::SzArray(Box::new(TypeSig::GenericParam(0)));
        let _ = open.body.set(vec![0x06, 0x2A]);

        let closed = open.instantiate(Token::new(0x2B00_0001), vec![TypeSig::String])?;
        assert!(closed.is_instantiation());
        assert_eq!(closed.params, vec![TypeSig::String, TypeSig::String.by_ref()]);
        assert_eq!(closed.return_type, TypeSig::SzArray(Box::new(TypeSig::String)));
        assert_eq!(closed.body_bytes(), open.body_bytes());
        assert_eq!(closed.identity().generic_args, vec![TypeSig::String]);

        assert!(open.instantiate(Token::new(0x2B00_0002), vec![]).is_err());
        assert!(closed
            .instantiate(Token::new(0x2B00_0003), vec![TypeSig::I4])
            .is_err());
        Ok(())
    }

    #[test]
    fn identity_display() -> Result<()> {
        let identity = method("Map", MethodModifiers::STATIC)
            .instantiate(Token::new(0x2B00_0001), vec![TypeSig::String])?
            .identity();
        assert_eq!(identity.to_string(), "void 0x02000008::Map<string>(int32)");
        Ok(())
    }
}
