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

//! Member resolution.
//!
//! The decoder, the rewriter, the stubs and the interpreter resolve every token through
//! [`SymbolTable`]. A host runtime or a custom metadata loader implements the required
//! lookups; type relationships, virtual dispatch and field layout are provided on top
//! of them. [`crate::metadata::Module`] is the in-memory implementation shipped with
//! the crate.

use std::sync::Arc;

use crate::{
    metadata::{
        method::{LocalVariable, MethodDefRc, MethodModifiers, MethodSignature},
        token::Token,
        typesystem::{FieldDef, TypeDef, TypeSig},
    },
    Result,
};

/// A reference-counted type definition
pub type TypeDefRc = Arc<TypeDef>;
/// A reference-counted field definition
pub type FieldDefRc = Arc<FieldDef>;

/// Contents of a `StandAloneSig` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StandAloneSignature {
    /// Local variable list of a method body
    Locals(Vec<LocalVariable>),
    /// Call site signature used by `calli`
    Method(MethodSignature),
}

/// Well-known core types a symbol table must be able to name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreTypes {
    /// `System.Object`
    pub object: Token,
    /// `System.ValueType`
    pub value_type: Token,
    /// `System.String`
    pub string: Token,
    /// `System.Int32`
    pub int32: Token,
    /// `System.Int64`
    pub int64: Token,
    /// `System.Double`
    pub double: Token,
    /// `System.Boolean`
    pub boolean: Token,
    /// `System.Char`
    pub char: Token,
}

impl CoreTypes {
    /// The primitive signature a core type token stands for, if any.
    #[must_use]
    pub fn primitive_sig(&self, token: Token) -> Option<TypeSig> {
        if token == self.object {
            Some(TypeSig::Object)
        } else if token == self.string {
            Some(TypeSig::String)
        } else if token == self.int32 {
            Some(TypeSig::I4)
        } else if token == self.int64 {
            Some(TypeSig::I8)
        } else if token == self.double {
            Some(TypeSig::R8)
        } else if token == self.boolean {
            Some(TypeSig::Boolean)
        } else if token == self.char {
            Some(TypeSig::Char)
        } else {
            None
        }
    }

    /// The type token a value of signature `sig` has once boxed.
    #[must_use]
    pub fn boxed_type(&self, sig: &TypeSig) -> Option<Token> {
        match sig {
            TypeSig::Object => Some(self.object),
            TypeSig::String => Some(self.string),
            TypeSig::I4 => Some(self.int32),
            TypeSig::I8 | TypeSig::IntPtr => Some(self.int64),
            TypeSig::R8 => Some(self.double),
            TypeSig::Boolean => Some(self.boolean),
            TypeSig::Char => Some(self.char),
            TypeSig::Class(token) | TypeSig::ValueType(token) => Some(*token),
            _ => None,
        }
    }
}

/// Abstract member lookup used by every layer of the engine.
pub trait SymbolTable: Send + Sync {
    /// Resolves a type definition.
    ///
    /// # Errors
    /// Returns [`crate::Error::TypeNotFound`] for unknown tokens.
    fn type_def(&self, token: Token) -> Result<TypeDefRc>;

    /// Resolves a method definition.
    ///
    /// # Errors
    /// Returns [`crate::Error::MethodNotFound`] for unknown tokens.
    fn method(&self, token: Token) -> Result<MethodDefRc>;

    /// Resolves a field definition.
    ///
    /// # Errors
    /// Returns [`crate::Error::FieldNotFound`] for unknown tokens.
    fn field(&self, token: Token) -> Result<FieldDefRc>;

    /// Resolves a user string.
    ///
    /// # Errors
    /// Returns [`crate::Error::StringNotFound`] for unknown tokens.
    fn user_string(&self, token: Token) -> Result<Arc<str>>;

    /// Resolves a stand-alone signature.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for unknown tokens.
    fn standalone_signature(&self, token: Token) -> Result<Arc<StandAloneSignature>>;

    /// Methods declared directly on a type, in declaration order.
    fn methods_of(&self, type_token: Token) -> Vec<Token>;

    /// Fields declared directly on a type, in declaration order.
    fn fields_of(&self, type_token: Token) -> Vec<Token>;

    /// Finds a type by namespace and name.
    fn find_type(&self, namespace: &str, name: &str) -> Option<Token>;

    /// The core types.
    fn core_types(&self) -> CoreTypes;

    /// Finds a method declared on `type_token` by name and parameter types.
    fn find_method(&self, type_token: Token, name: &str, params: &[TypeSig]) -> Option<Token> {
        self.methods_of(type_token).into_iter().find(|candidate| {
            self.method(*candidate)
                .map(|method| method.name == name && method.params == params)
                .unwrap_or(false)
        })
    }

    /// Finds a method declared on `type_token` by name only.
    fn find_method_by_name(&self, type_token: Token, name: &str) -> Option<Token> {
        self.methods_of(type_token).into_iter().find(|candidate| {
            self.method(*candidate)
                .map(|method| method.name == name)
                .unwrap_or(false)
        })
    }

    /// The signature used to refer to a type token.
    ///
    /// Core types map to their primitive signatures.
    fn type_sig(&self, type_token: Token) -> Result<TypeSig> {
        if let Some(sig) = self.core_types().primitive_sig(type_token) {
            return Ok(sig);
        }
        Ok(self.type_def(type_token)?.signature())
    }

    /// Whether a type token describes a value type.
    fn is_value_type(&self, type_token: Token) -> bool {
        self.type_def(type_token)
            .map(|def| def.is_value_type)
            .unwrap_or(false)
    }

    /// Whether `derived` is `base`, derives from it, or implements it.
    fn is_subtype_of(&self, derived: Token, base: Token) -> bool {
        let mut current = Some(derived);
        while let Some(token) = current {
            if token == base {
                return true;
            }
            let Ok(def) = self.type_def(token) else {
                return false;
            };
            if def
                .interfaces
                .iter()
                .any(|interface| self.is_subtype_of(*interface, base))
            {
                return true;
            }
            current = def.base;
        }
        false
    }

    /// Whether a value of type `source` can be stored in a location of type `target`.
    fn is_assignable(&self, target: &TypeSig, source: &TypeSig) -> bool {
        if target == source {
            return true;
        }

        let core = self.core_types();
        let as_token = |sig: &TypeSig| match sig {
            TypeSig::Object => Some(core.object),
            TypeSig::String => Some(core.string),
            TypeSig::Class(token) | TypeSig::ValueType(token) => Some(*token),
            _ => None,
        };

        match (target, source) {
            (TypeSig::Object, source) => {
                !source.is_by_ref() && !source.is_value_type() && *source != TypeSig::Void
            }
            (TypeSig::Class(_) | TypeSig::String, TypeSig::Class(_) | TypeSig::String) => {
                match (as_token(target), as_token(source)) {
                    (Some(target), Some(source)) => self.is_subtype_of(source, target),
                    _ => false,
                }
            }
            (TypeSig::SzArray(target), TypeSig::SzArray(source)) => {
                !source.is_value_type() && self.is_assignable(target, source)
            }
            _ => false,
        }
    }

    /// All instance fields of a type, base type fields first.
    fn instance_fields(&self, type_token: Token) -> Vec<FieldDefRc> {
        let mut chain = Vec::new();
        let mut current = Some(type_token);
        while let Some(token) = current {
            chain.push(token);
            current = self.type_def(token).ok().and_then(|def| def.base);
        }

        chain
            .into_iter()
            .rev()
            .flat_map(|token| self.fields_of(token))
            .filter_map(|field| self.field(field).ok())
            .filter(|field| !field.is_static())
            .collect()
    }

    /// Finds the implementation of `method` that a receiver of `runtime_type` dispatches to.
    ///
    /// Walks from the runtime type up the base chain and returns the most derived
    /// instance method with the same name and parameters. Interface methods match any
    /// such method; class methods only match virtual overrides in `method`'s slot. A
    /// `newslot` virtual starts a new slot, so it and everything overriding it below
    /// are skipped. Falls back to `method` itself when nothing more derived is found.
    fn resolve_virtual(&self, runtime_type: Token, method: &MethodDefRc) -> Result<MethodDefRc> {
        if method.is_static() || (!method.is_virtual() && !method.is_abstract()) {
            return Ok(method.clone());
        }

        let through_interface = self
            .type_def(method.declaring_type)
            .map(|def| def.is_interface())
            .unwrap_or(false);

        let mut found: Option<MethodDefRc> = None;
        let mut current = Some(runtime_type);
        while let Some(token) = current {
            if token == method.declaring_type {
                break;
            }
            for candidate in self.methods_of(token) {
                let candidate = self.method(candidate)?;
                if candidate.is_static() || !candidate.same_shape(method) {
                    continue;
                }
                if through_interface {
                    return Ok(candidate);
                }
                if !candidate.is_virtual() {
                    continue;
                }
                if candidate.flags.contains(MethodModifiers::NEW_SLOT) {
                    found = None;
                } else if found.is_none() {
                    found = Some(candidate);
                }
                break;
            }
            current = self.type_def(token)?.base;
        }

        Ok(found.unwrap_or_else(|| method.clone()))
    }

    /// Whether `candidate` overrides `original`: same name and parameters, declared
    /// on a type deriving from the original's declaring type, and what a receiver of
    /// that type dispatches `original` to.
    fn overrides(&self, candidate: &MethodDefRc, original: &MethodDefRc) -> bool {
        candidate.token != original.token
            && (original.is_virtual() || original.is_abstract())
            && !candidate.is_static()
            && candidate.same_shape(original)
            && self.is_subtype_of(candidate.declaring_type, original.declaring_type)
            && self
                .resolve_virtual(candidate.declaring_type, original)
                .is_ok_and(|resolved| resolved.token == candidate.token)
    }

    /// Local variables of a method body, given its locals signature token.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] when the token is not a locals signature.
    fn locals(&self, signature: Option<Token>) -> Result<Vec<LocalVariable>> {
        let Some(token) = signature else {
            return Ok(Vec::new());
        };
        match self.standalone_signature(token)?.as_ref() {
            StandAloneSignature::Locals(locals) => Ok(locals.clone()),
            StandAloneSignature::Method(_) => Err(malformed_error!(
                "Signature {} is not a locals signature",
                token
            )),
        }
    }

    /// Human-readable `Namespace.Type::Name` of a method, with the generic arguments
    /// of an instantiation.
    fn method_name(&self, token: Token) -> String {
        match self.method(token) {
            Ok(method) => {
                let owner = self
                    .type_def(method.declaring_type)
                    .map(|def| def.full_name())
                    .unwrap_or_else(|_| method.declaring_type.to_string());
                if method.is_instantiation() {
                    let args: Vec<String> =
                        method.generic_args.iter().map(ToString::to_string).collect();
                    format!("{owner}::{}<{}>", method.name, args.join(", "))
                } else {
                    format!("{owner}::{}", method.name)
                }
            }
            Err(_) => token.to_string(),
        }
    }
}
