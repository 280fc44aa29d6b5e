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

//! Dynamic methods, dynamic token scopes and native callables.
//!
//! A [`DynamicMethod`] is a method body produced at run time (by the rewriter) that
//! belongs to no type. Its CIL may reference members with ordinary metadata tokens,
//! plus `0x7F` tokens that index its [`DynamicScope`]. Scope entries are either native
//! callables (stubs) or plain members the body calls without interception.

use std::{fmt, sync::Arc};

use crate::{
    assembly::DecodedMethod,
    emulation::{thread::ExecutionThread, value::Value},
    metadata::{
        method::{
            encode_method_body, ExceptionHandler, LocalVariable, MethodBody, MethodDefRc,
            MethodIdentity, MethodSignature,
        },
        symbols::SymbolTable,
        token::{TableId, Token},
        typesystem::TypeSig,
    },
    Result,
};

/// Signature of a native callable: the executing thread and the arguments, receiver
/// first for instance semantics.
pub type NativeFn = dyn Fn(&mut ExecutionThread<'_>, Vec<Value>) -> Result<Value> + Send + Sync;

/// A reference-counted native method
pub type NativeMethodRc = Arc<NativeMethod>;
/// A reference-counted dynamic method
pub type DynamicMethodRc = Arc<DynamicMethod>;

/// A callable implemented in Rust.
///
/// Interception stubs, native shim replacements and host-provided internal calls are
/// all native methods.
pub struct NativeMethod {
    name: String,
    params: Vec<TypeSig>,
    return_type: TypeSig,
    func: Box<NativeFn>,
}

impl NativeMethod {
    /// Wraps a closure with its declared signature.
    pub fn new<F>(name: impl Into<String>, params: Vec<TypeSig>, return_type: TypeSig, func: F) -> Self
    where
        F: Fn(&mut ExecutionThread<'_>, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        NativeMethod {
            name: name.into(),
            params,
            return_type,
            func: Box::new(func),
        }
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared parameter types, receiver included.
    #[must_use]
    pub fn params(&self) -> &[TypeSig] {
        &self.params
    }

    /// Declared return type.
    #[must_use]
    pub fn return_type(&self) -> &TypeSig {
        &self.return_type
    }

    /// The call site signature of this callable.
    #[must_use]
    pub fn signature(&self) -> MethodSignature {
        MethodSignature {
            has_this: false,
            params: self.params.clone(),
            return_type: self.return_type.clone(),
        }
    }

    /// Invokes the closure directly, without call depth accounting.
    ///
    /// Use [`ExecutionThread::call_native`] from managed call sites.
    ///
    /// # Errors
    /// Returns whatever the closure returns.
    pub fn invoke(&self, thread: &mut ExecutionThread<'_>, args: Vec<Value>) -> Result<Value> {
        (self.func)(thread, args)
    }
}

impl fmt::Debug for NativeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeMethod")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("return_type", &self.return_type)
            .finish_non_exhaustive()
    }
}

/// What a `0x7F` token of a dynamic body stands for.
#[derive(Clone, Debug)]
pub enum ScopeEntry {
    /// A native callable, invoked as a static method with its declared signature
    Native(NativeMethodRc),
    /// A member used as-is, with the semantics of the referencing instruction
    Member(Token),
}

/// Token scope of a dynamic method.
#[derive(Default)]
pub struct DynamicScope {
    entries: boxcar::Vec<ScopeEntry>,
}

impl DynamicScope {
    /// Creates an empty scope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry and returns the token that refers to it.
    pub fn add(&self, entry: ScopeEntry) -> Token {
        let index = self.entries.push(entry);
        #[allow(clippy::cast_possible_truncation)]
        Token::from_parts(TableId::Dynamic, index as u32 + 1)
    }

    /// The entry behind a scope token.
    #[must_use]
    pub fn get(&self, token: Token) -> Option<&ScopeEntry> {
        if !token.is_dynamic() || token.row() == 0 {
            return None;
        }
        self.entries.get(token.row() as usize - 1)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.count()
    }

    /// Whether the scope is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every entry with its token, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (Token, &ScopeEntry)> {
        self.entries.iter().map(|(index, entry)| {
            #[allow(clippy::cast_possible_truncation)]
            let token = Token::from_parts(TableId::Dynamic, index as u32 + 1);
            (token, entry)
        })
    }

    /// Human-readable name of a scope token's target.
    #[must_use]
    pub fn describe(&self, token: Token, symbols: &dyn SymbolTable) -> String {
        match self.get(token) {
            Some(ScopeEntry::Native(native)) => native.name().to_string(),
            Some(ScopeEntry::Member(member)) => symbols.method_name(*member),
            None => token.to_string(),
        }
    }
}

impl fmt::Debug for DynamicScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// A method created at run time.
///
/// Dynamic methods are always static: a receiver, if any, is an explicit first
/// parameter.
#[derive(Debug)]
pub struct DynamicMethod {
    name: String,
    origin: MethodIdentity,
    params: Vec<TypeSig>,
    return_type: TypeSig,
    body: Vec<u8>,
    decoded: DecodedMethod,
    scope: DynamicScope,
}

impl DynamicMethod {
    /// Creates a dynamic method from raw code.
    ///
    /// The code is wrapped in a method body (header plus clause section) and decoded
    /// once, which checks every branch target and clause boundary.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] or [`crate::Error::UnsupportedInstruction`]
    /// if the code does not decode.
    pub fn new(
        name: impl Into<String>,
        origin: MethodIdentity,
        params: Vec<TypeSig>,
        return_type: TypeSig,
        locals: Vec<LocalVariable>,
        scope: DynamicScope,
        code: &[u8],
        max_stack: u16,
        handlers: Vec<ExceptionHandler>,
    ) -> Result<DynamicMethod> {
        let body = encode_method_body(code, max_stack, 0, true, &handlers)?;
        let decoded = DecodedMethod::new(code, locals, handlers, usize::from(max_stack), true)?;

        Ok(DynamicMethod {
            name: name.into(),
            origin,
            params,
            return_type,
            body,
            decoded,
            scope,
        })
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity of the method this body was produced from.
    #[must_use]
    pub fn origin(&self) -> &MethodIdentity {
        &self.origin
    }

    /// Parameter types, receiver included.
    #[must_use]
    pub fn params(&self) -> &[TypeSig] {
        &self.params
    }

    /// Return type.
    #[must_use]
    pub fn return_type(&self) -> &TypeSig {
        &self.return_type
    }

    /// Local variable slots.
    #[must_use]
    pub fn locals(&self) -> &[LocalVariable] {
        &self.decoded.locals
    }

    /// The encoded body: header, code and exception section.
    #[must_use]
    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    /// The parsed body header and clauses.
    ///
    /// # Errors
    /// Only fails if the stored body is damaged, which construction rules out.
    pub fn body(&self) -> Result<MethodBody> {
        MethodBody::from(&self.body)
    }

    /// The decoded instructions.
    #[must_use]
    pub fn decoded(&self) -> &DecodedMethod {
        &self.decoded
    }

    /// The token scope.
    #[must_use]
    pub fn scope(&self) -> &DynamicScope {
        &self.scope
    }

    /// The call site signature.
    #[must_use]
    pub fn signature(&self) -> MethodSignature {
        MethodSignature {
            has_this: false,
            params: self.params.clone(),
            return_type: self.return_type.clone(),
        }
    }
}

/// Anything the runtime can invoke.
#[derive(Clone, Debug)]
pub enum Callable {
    /// A method of the symbol table, run from its original body or natively
    Method(MethodDefRc),
    /// A rewritten body
    Dynamic(DynamicMethodRc),
    /// A Rust closure
    Native(NativeMethodRc),
}

impl Callable {
    /// Whether the first argument is a receiver.
    #[must_use]
    pub fn has_this(&self) -> bool {
        match self {
            Callable::Method(method) => !method.is_static(),
            Callable::Dynamic(_) | Callable::Native(_) => false,
        }
    }

    /// Display name.
    #[must_use]
    pub fn name(&self, symbols: &dyn SymbolTable) -> String {
        match self {
            Callable::Method(method) => symbols.method_name(method.token),
            Callable::Dynamic(method) => method.name().to_string(),
            Callable::Native(method) => method.name().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Module;

    #[test]
    fn scope_tokens() {
        let scope = DynamicScope::new();
        let first = scope.add(ScopeEntry::Member(Token::new(0x0600_0001)));
        let second = scope.add(ScopeEntry::Native(Arc::new(NativeMethod::new(
            "stub_call_Answer",
            vec![],
            TypeSig::I4,
            |_, _| Ok(Value::I4(42)),
        ))));

        assert_eq!(first, Token::new(0x7F00_0001));
        assert_eq!(second, Token::new(0x7F00_0002));
        assert!(matches!(scope.get(first), Some(ScopeEntry::Member(_))));
        assert!(scope.get(Token::new(0x7F00_0003)).is_none());
        assert!(scope.get(Token::new(0x0600_0001)).is_none());
        assert_eq!(scope.len(), 2);

        let module = Module::new();
        assert_eq!(scope.describe(second, &module), "stub_call_Answer");
        assert_eq!(scope.describe(first, &module), "System.Object::.ctor");
    }

    #[test]
    fn dynamic_body_round_trip() -> Result<()> {
        let module = Module::new();
        let origin = module.method(module.corlib().object_to_string)?.identity();
        // ldc.i4.1; ret
        let method = DynamicMethod::new(
            "rewritten",
            origin,
            vec![],
            TypeSig::I4,
            vec![],
            DynamicScope::new(),
            &[0x17, 0x2A],
            1,
            vec![],
        )?;

        assert_eq!(method.body_bytes(), &[0x0A, 0x17, 0x2A]);
        assert_eq!(method.decoded().instructions.len(), 2);
        assert_eq!(method.body()?.size_code, 2);
        assert!(!method.signature().has_this);
        Ok(())
    }

    #[test]
    fn misaligned_code_is_rejected() {
        let module = Module::new();
        let origin = module
            .method(module.corlib().object_to_string)
            .map(|method| method.identity());
        let Ok(origin) = origin else {
            panic!("corlib method missing");
        };
        // br.s +1 targets the middle of ldc.i4.s
        let result = DynamicMethod::new(
            "broken",
            origin,
            vec![],
            TypeSig::Void,
            vec![],
            DynamicScope::new(),
            &[0x2B, 0x01, 0x1F, 0x05, 0x2A],
            1,
            vec![],
        );
        assert!(result.is_err());
    }
}
