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

//! The in-memory symbol table.
//!
//! A [`Module`] owns append-only tables of types, methods, fields, user strings and
//! stand-alone signatures. Rows are never removed or reordered, so tokens handed out
//! once stay valid for the lifetime of the module and lookups never block writers.
//! Members are added through the builders in [`crate::metadata::builders`]; method
//! bodies may be attached after declaration with [`Module::implement`].
//!
//! Every module starts with the [`CoreLibrary`] installed.
//!
//! # Examples
//!
//! ```rust
//! use dotshim::metadata::{Module, SymbolTable, TypeSig};
//!
//! let module = Module::new();
//! let string = module.find_type("System", "String").unwrap();
//! assert_eq!(module.type_sig(string)?, TypeSig::String);
//! # Ok::<(), dotshim::Error>(())
//! ```

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use dashmap::DashMap;

use crate::{
    metadata::{
        builders::MethodBodyBuilder,
        corlib::CoreLibrary,
        method::{
            MethodAccessFlags, MethodDef, MethodDefRc, MethodImplCodeType, MethodImplOptions,
            MethodModifiers,
        },
        symbols::{CoreTypes, FieldDefRc, StandAloneSignature, SymbolTable, TypeDefRc},
        token::{TableId, Token},
        typesystem::{FieldAttributes, FieldDef, TypeAttributes, TypeDef, TypeSig},
    },
    Error, Result,
};

/// A reference-counted module
pub type ModuleRc = Arc<Module>;

/// Append-only storage behind a [`Module`].
pub(crate) struct ModuleTables {
    types: boxcar::Vec<TypeDefRc>,
    methods: boxcar::Vec<MethodDefRc>,
    fields: boxcar::Vec<FieldDefRc>,
    strings: boxcar::Vec<Arc<str>>,
    signatures: boxcar::Vec<Arc<StandAloneSignature>>,
    method_specs: boxcar::Vec<(Token, Vec<TypeSig>)>,
    spec_index: DashMap<(Token, Vec<TypeSig>), Token>,
    type_names: DashMap<(String, String), Token>,
    type_methods: DashMap<Token, Vec<Token>>,
    type_fields: DashMap<Token, Vec<Token>>,
    // Serializes row allocation so row numbers follow insertion order
    insert: Mutex<()>,
}

fn next_token(table: TableId, count: usize) -> Token {
    #[allow(clippy::cast_possible_truncation)]
    Token::from_parts(table, (count + 1) as u32)
}

fn row_index(token: Token, table: TableId) -> Option<usize> {
    if token.table() != table as u8 || token.row() == 0 {
        return None;
    }
    Some(token.row() as usize - 1)
}

impl ModuleTables {
    fn new() -> Self {
        ModuleTables {
            types: boxcar::Vec::new(),
            methods: boxcar::Vec::new(),
            fields: boxcar::Vec::new(),
            strings: boxcar::Vec::new(),
            signatures: boxcar::Vec::new(),
            method_specs: boxcar::Vec::new(),
            spec_index: DashMap::new(),
            type_names: DashMap::new(),
            type_methods: DashMap::new(),
            type_fields: DashMap::new(),
            insert: Mutex::new(()),
        }
    }

    /// Appends a type definition built from its freshly allocated token.
    pub(crate) fn push_type_def(&self, build: impl FnOnce(Token) -> TypeDef) -> Token {
        let _guard = self.insert.lock().unwrap_or_else(PoisonError::into_inner);
        let token = next_token(TableId::TypeDef, self.types.count());
        let def = build(token);
        self.type_names
            .insert((def.namespace.clone(), def.name.clone()), token);
        self.types.push(Arc::new(def));
        token
    }

    /// Appends a class or value type without interfaces.
    pub(crate) fn push_type(
        &self,
        namespace: &str,
        name: &str,
        flags: TypeAttributes,
        base: Option<Token>,
        is_value_type: bool,
    ) -> Token {
        self.push_type_def(|token| TypeDef {
            token,
            namespace: namespace.to_string(),
            name: name.to_string(),
            flags,
            base,
            interfaces: Vec::new(),
            is_value_type,
        })
    }

    /// Appends a method definition built from its freshly allocated token.
    pub(crate) fn push_method_def(&self, build: impl FnOnce(Token) -> MethodDef) -> Token {
        let _guard = self.insert.lock().unwrap_or_else(PoisonError::into_inner);
        let token = next_token(TableId::MethodDef, self.methods.count());
        let def = build(token);
        self.type_methods
            .entry(def.declaring_type)
            .or_default()
            .push(token);
        self.methods.push(Arc::new(def));
        token
    }

    /// Appends a public, bodiless method.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn push_method(
        &self,
        owner: Token,
        name: &str,
        flags: MethodModifiers,
        impl_code_type: MethodImplCodeType,
        impl_options: MethodImplOptions,
        params: Vec<TypeSig>,
        return_type: TypeSig,
    ) -> Token {
        self.push_method_def(|token| MethodDef {
            token,
            declaring_type: owner,
            name: name.to_string(),
            flags,
            access: MethodAccessFlags::PUBLIC,
            impl_code_type,
            impl_options,
            params,
            return_type,
            generic_arity: 0,
            generic_args: Vec::new(),
            body: OnceLock::new(),
        })
    }

    /// Appends a field.
    pub(crate) fn push_field(
        &self,
        owner: Token,
        name: &str,
        signature: TypeSig,
        flags: FieldAttributes,
    ) -> Token {
        let _guard = self.insert.lock().unwrap_or_else(PoisonError::into_inner);
        let token = next_token(TableId::Field, self.fields.count());
        self.fields.push(Arc::new(FieldDef {
            token,
            declaring_type: owner,
            name: name.to_string(),
            signature,
            flags,
        }));
        self.type_fields.entry(owner).or_default().push(token);
        token
    }

    /// Appends a user string.
    pub(crate) fn push_string(&self, value: &str) -> Token {
        let _guard = self.insert.lock().unwrap_or_else(PoisonError::into_inner);
        let token = next_token(TableId::UserString, self.strings.count());
        self.strings.push(Arc::from(value));
        token
    }

    /// Appends a method instantiation, reusing the row of an identical one.
    pub(crate) fn push_method_spec(&self, method: Token, generic_args: Vec<TypeSig>) -> Token {
        let _guard = self.insert.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (method, generic_args);
        if let Some(existing) = self.spec_index.get(&key) {
            return *existing;
        }
        let token = next_token(TableId::MethodSpec, self.method_specs.count());
        self.method_specs.push(key.clone());
        self.spec_index.insert(key, token);
        token
    }

    /// Appends a stand-alone signature.
    pub(crate) fn push_signature(&self, signature: StandAloneSignature) -> Token {
        let _guard = self.insert.lock().unwrap_or_else(PoisonError::into_inner);
        let token = next_token(TableId::StandAloneSig, self.signatures.count());
        self.signatures.push(Arc::new(signature));
        token
    }
}

/// An in-memory module implementing [`SymbolTable`].
pub struct Module {
    tables: ModuleTables,
    corlib: CoreLibrary,
    instantiations: DashMap<Token, MethodDefRc>,
}

impl Module {
    /// Creates a module with the core library installed.
    #[must_use]
    pub fn new() -> Module {
        let tables = ModuleTables::new();
        let corlib = CoreLibrary::install(&tables);
        Module {
            tables,
            corlib,
            instantiations: DashMap::new(),
        }
    }

    /// Tokens of the core library members.
    #[must_use]
    pub fn corlib(&self) -> &CoreLibrary {
        &self.corlib
    }

    pub(crate) fn tables(&self) -> &ModuleTables {
        &self.tables
    }

    /// Adds a user string and returns its `ldstr` token.
    pub fn add_user_string(&self, value: &str) -> Token {
        self.tables.push_string(value)
    }

    /// Adds a stand-alone signature (locals or `calli` call site).
    pub fn add_signature(&self, signature: StandAloneSignature) -> Token {
        self.tables.push_signature(signature)
    }

    /// Returns the `MethodSpec` token of a generic method instantiation.
    ///
    /// Identical instantiations share one token. Call sites use the returned token
    /// like a method definition token; its identity carries `generic_args`.
    ///
    /// # Errors
    /// Returns [`Error::MethodNotFound`] for unknown methods and [`Error::Malformed`]
    /// when `method` is not a generic definition or the argument count is wrong.
    pub fn instantiate_method(&self, method: Token, generic_args: Vec<TypeSig>) -> Result<Token> {
        let definition = self.method(method)?;
        definition.instantiate(Token::from_parts(TableId::MethodSpec, 0), generic_args.clone())?;
        Ok(self.tables.push_method_spec(method, generic_args))
    }

    fn method_spec(&self, token: Token) -> Result<MethodDefRc> {
        if let Some(cached) = self.instantiations.get(&token) {
            return Ok(Arc::clone(cached.value()));
        }

        let (method, generic_args) = row_index(token, TableId::MethodSpec)
            .and_then(|index| self.tables.method_specs.get(index))
            .cloned()
            .ok_or_else(|| Error::MethodNotFound(token.to_string()))?;
        let definition = self.method(method)?;
        let instantiation = Arc::new(definition.instantiate(token, generic_args)?);
        // A definition may still receive its body; only complete instantiations are kept
        if definition.has_body() {
            self.instantiations
                .insert(token, Arc::clone(&instantiation));
        }
        Ok(instantiation)
    }

    /// Attaches a body to a declared method.
    ///
    /// # Errors
    /// Returns [`Error::MethodNotFound`] for unknown tokens, [`Error::Malformed`] if the
    /// method already has a body, and any error raised while building the body.
    pub fn implement(&self, method: Token, body: MethodBodyBuilder) -> Result<()> {
        let def = self.method(method)?;
        if def.has_body() {
            return Err(malformed_error!("Method {} already has a body", method));
        }
        let (bytes, _) = body.build(self)?;
        self.set_body(method, bytes)
    }

    /// Attaches raw body bytes (header, code and sections) to a declared method.
    ///
    /// # Errors
    /// Returns [`Error::MethodNotFound`] for unknown tokens and [`Error::Malformed`]
    /// if the method already has a body or is a generic instantiation.
    pub fn set_body(&self, method: Token, bytes: Vec<u8>) -> Result<()> {
        if method.table_id() == Some(TableId::MethodSpec) {
            return Err(malformed_error!(
                "Instantiation {} shares the body of its definition",
                method
            ));
        }
        self.method(method)?
            .body
            .set(bytes)
            .map_err(|_| malformed_error!("Method {} already has a body", method))
    }

    /// Number of type definitions, core library included.
    #[must_use]
    pub fn type_count(&self) -> usize {
        self.tables.types.count()
    }

    /// Number of method definitions, core library included.
    #[must_use]
    pub fn method_count(&self) -> usize {
        self.tables.methods.count()
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable for Module {
    fn type_def(&self, token: Token) -> Result<TypeDefRc> {
        row_index(token, TableId::TypeDef)
            .and_then(|index| self.tables.types.get(index))
            .cloned()
            .ok_or(Error::TypeNotFound(token))
    }

    fn method(&self, token: Token) -> Result<MethodDefRc> {
        if token.table_id() == Some(TableId::MethodSpec) {
            return self.method_spec(token);
        }
        row_index(token, TableId::MethodDef)
            .and_then(|index| self.tables.methods.get(index))
            .cloned()
            .ok_or_else(|| Error::MethodNotFound(token.to_string()))
    }

    fn field(&self, token: Token) -> Result<FieldDefRc> {
        row_index(token, TableId::Field)
            .and_then(|index| self.tables.fields.get(index))
            .cloned()
            .ok_or(Error::FieldNotFound(token))
    }

    fn user_string(&self, token: Token) -> Result<Arc<str>> {
        row_index(token, TableId::UserString)
            .and_then(|index| self.tables.strings.get(index))
            .cloned()
            .ok_or(Error::StringNotFound(token))
    }

    fn standalone_signature(&self, token: Token) -> Result<Arc<StandAloneSignature>> {
        row_index(token, TableId::StandAloneSig)
            .and_then(|index| self.tables.signatures.get(index))
            .cloned()
            .ok_or_else(|| malformed_error!("Unknown stand-alone signature {}", token))
    }

    fn methods_of(&self, type_token: Token) -> Vec<Token> {
        self.tables
            .type_methods
            .get(&type_token)
            .map(|methods| methods.clone())
            .unwrap_or_default()
    }

    fn fields_of(&self, type_token: Token) -> Vec<Token> {
        self.tables
            .type_fields
            .get(&type_token)
            .map(|fields| fields.clone())
            .unwrap_or_default()
    }

    fn find_type(&self, namespace: &str, name: &str) -> Option<Token> {
        self.tables
            .type_names
            .get(&(namespace.to_string(), name.to_string()))
            .map(|token| *token)
    }

    fn core_types(&self) -> CoreTypes {
        self.corlib.core_types()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        builders::{MethodBodyBuilder, MethodDefBuilder, TypeDefBuilder},
        method::LocalVariable,
    };

    #[test]
    fn corlib_is_installed_first() -> Result<()> {
        let module = Module::new();
        let corlib = module.corlib();

        assert_eq!(corlib.object, Token::new(0x0200_0001));
        assert_eq!(module.find_type("System", "Object"), Some(corlib.object));
        assert_eq!(module.type_sig(corlib.int32)?, TypeSig::I4);
        assert_eq!(module.type_sig(corlib.exception)?, TypeSig::Class(corlib.exception));
        assert!(module.is_value_type(corlib.int32));
        assert!(module.is_subtype_of(corlib.null_reference_exception, corlib.exception));
        assert!(!module.is_subtype_of(corlib.exception, corlib.null_reference_exception));
        Ok(())
    }

    #[test]
    fn members_by_type() -> Result<()> {
        let module = Module::new();
        let corlib = module.corlib();

        let write_line = module
            .find_method(corlib.console, "WriteLine", &[TypeSig::String])
            .ok_or(Error::MethodNotFound("WriteLine".to_string()))?;
        assert_eq!(write_line, corlib.console_write_line_string);
        assert_eq!(module.methods_of(corlib.console).len(), 2);
        assert_eq!(
            module.fields_of(corlib.exception),
            vec![corlib.exception_message_field]
        );
        assert_eq!(module.method_name(write_line), "System.Console::WriteLine");
        Ok(())
    }

    #[test]
    fn strings_and_signatures() -> Result<()> {
        let module = Module::new();
        let hello = module.add_user_string("hello");
        assert_eq!(hello.table(), 0x70);
        assert_eq!(&*module.user_string(hello)?, "hello");

        let locals = module.add_signature(StandAloneSignature::Locals(vec![LocalVariable::new(
            TypeSig::I4,
        )]));
        assert_eq!(module.locals(Some(locals))?.len(), 1);
        assert!(module.locals(None)?.is_empty());
        Ok(())
    }

    #[test]
    fn generic_instantiations() -> Result<()> {
        let module = Module::new();
        let owner = TypeDefBuilder::new("Demo", "Generic").build(&module)?;
        let echo = MethodDefBuilder::new("Echo")
            .static_method()
            .generic_arity(1)
            .param(TypeSig::GenericParam(0))
            .returns(TypeSig::GenericParam(0))
            .build(&module, owner)?;

        let as_int = module.instantiate_method(echo, vec![TypeSig::I4])?;
        assert_eq!(as_int.table_id(), Some(TableId::MethodSpec));
        assert_eq!(module.instantiate_method(echo, vec![TypeSig::I4])?, as_int);
        let as_string = module.instantiate_method(echo, vec![TypeSig::String])?;
        assert_ne!(as_int, as_string);

        let closed = module.method(as_int)?;
        assert_eq!(closed.params, vec![TypeSig::I4]);
        assert_eq!(closed.return_type, TypeSig::I4);
        assert!(!closed.has_body());
        assert_eq!(module.method_name(as_string), "Demo.Generic::Echo<string>");

        module.implement(
            echo,
            MethodBodyBuilder::new().implementation(|asm| {
                asm.ldarg_0()?.ret()?;
                Ok(())
            }),
        )?;
        assert!(module.method(as_int)?.has_body());
        assert!(module.set_body(as_int, vec![0x06, 0x2A]).is_err());

        assert!(module.instantiate_method(echo, vec![]).is_err());
        let plain = MethodDefBuilder::new("Plain").static_method().build(&module, owner)?;
        assert!(module.instantiate_method(plain, vec![TypeSig::I4]).is_err());
        assert!(matches!(
            module.method(Token::new(0x2B00_00FF)),
            Err(Error::MethodNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn new_slot_virtuals_start_a_new_chain() -> Result<()> {
        let module = Module::new();
        let speak = |owner, builder: MethodDefBuilder| {
            builder.returns(TypeSig::String).build(&module, owner)
        };

        let base = TypeDefBuilder::new("Demo", "Base").build(&module)?;
        let base_speak = speak(base, MethodDefBuilder::new("Speak").virtual_method())?;
        let middle = TypeDefBuilder::new("Demo", "Middle").base(base).build(&module)?;
        let middle_speak = speak(middle, MethodDefBuilder::new("Speak").virtual_method())?;
        let hiding = TypeDefBuilder::new("Demo", "Hiding").base(middle).build(&module)?;
        let hiding_speak =
            speak(hiding, MethodDefBuilder::new("Speak").virtual_method().new_slot())?;
        let leaf = TypeDefBuilder::new("Demo", "Leaf").base(hiding).build(&module)?;
        let leaf_speak = speak(leaf, MethodDefBuilder::new("Speak").virtual_method())?;

        let base_speak = module.method(base_speak)?;
        let hiding_speak = module.method(hiding_speak)?;
        let resolved = |runtime_type, method| -> Result<Token> {
            Ok(module.resolve_virtual(runtime_type, method)?.token)
        };
        assert_eq!(resolved(middle, &base_speak)?, middle_speak);
        assert_eq!(resolved(hiding, &base_speak)?, middle_speak);
        assert_eq!(resolved(leaf, &base_speak)?, middle_speak);
        assert_eq!(resolved(leaf, &hiding_speak)?, leaf_speak);

        assert!(module.overrides(&module.method(middle_speak)?, &base_speak));
        assert!(!module.overrides(&hiding_speak, &base_speak));
        assert!(!module.overrides(&module.method(leaf_speak)?, &base_speak));
        assert!(module.overrides(&module.method(leaf_speak)?, &hiding_speak));
        Ok(())
    }

    #[test]
    fn unknown_tokens() {
        let module = Module::new();
        assert!(matches!(
            module.type_def(Token::new(0x0200_FFFF)),
            Err(Error::TypeNotFound(_))
        ));
        assert!(matches!(
            module.method(Token::new(0x0200_0001)),
            Err(Error::MethodNotFound(_))
        ));
        assert!(module.user_string(Token::new(0x7000_0000)).is_err());
    }

    #[test]
    fn body_is_set_once() -> Result<()> {
        let module = Module::new();
        let method = module.corlib().object_to_string;
        module.set_body(method, vec![0x06, 0x14, 0x2A])?;
        assert!(module.method(method)?.has_body());
        assert!(module.set_body(method, vec![0x06, 0x14, 0x2A]).is_err());
        Ok(())
    }
}
