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

//! Type, field and method definition builders.

use std::sync::OnceLock;

use crate::{
    metadata::{
        builders::MethodBodyBuilder,
        method::{
            MethodAccessFlags, MethodDef, MethodImplCodeType, MethodImplOptions, MethodModifiers,
            CONSTRUCTOR_NAME,
        },
        module::Module,
        symbols::SymbolTable,
        token::Token,
        typesystem::{FieldAttributes, TypeAttributes, TypeDef, TypeSig},
    },
    Error, Result,
};

/// Builder for type definitions.
///
/// Types derive from `System.Object` unless a base is given; value types derive from
/// `System.ValueType` and interfaces have no base.
pub struct TypeDefBuilder {
    namespace: String,
    name: String,
    flags: TypeAttributes,
    base: Option<Token>,
    interfaces: Vec<Token>,
    is_value_type: bool,
}

impl TypeDefBuilder {
    /// Starts a public class.
    #[must_use]
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            flags: TypeAttributes::PUBLIC,
            base: None,
            interfaces: Vec::new(),
            is_value_type: false,
        }
    }

    /// Sets the base class.
    #[must_use]
    pub fn base(mut self, base: Token) -> Self {
        self.base = Some(base);
        self
    }

    /// Adds an implemented interface.
    #[must_use]
    pub fn implements(mut self, interface: Token) -> Self {
        self.interfaces.push(interface);
        self
    }

    /// Makes this a sealed value type.
    #[must_use]
    pub fn value_type(mut self) -> Self {
        self.is_value_type = true;
        self.flags |= TypeAttributes::SEALED;
        self
    }

    /// Makes this an interface.
    #[must_use]
    pub fn interface(mut self) -> Self {
        self.flags |= TypeAttributes::INTERFACE | TypeAttributes::ABSTRACT;
        self
    }

    /// Makes this type abstract.
    #[must_use]
    pub fn abstract_type(mut self) -> Self {
        self.flags |= TypeAttributes::ABSTRACT;
        self
    }

    /// Makes this type sealed.
    #[must_use]
    pub fn sealed(mut self) -> Self {
        self.flags |= TypeAttributes::SEALED;
        self
    }

    /// Adds the type to `module`.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if a type with the same name exists, and
    /// [`Error::TypeNotFound`] for an unknown base or interface.
    pub fn build(self, module: &Module) -> Result<Token> {
        if module.find_type(&self.namespace, &self.name).is_some() {
            return Err(malformed_error!(
                "Type {}.{} is already defined",
                self.namespace,
                self.name
            ));
        }

        let corlib = module.corlib();
        let base = if self.flags.contains(TypeAttributes::INTERFACE) {
            None
        } else if let Some(base) = self.base {
            Some(base)
        } else if self.is_value_type {
            Some(corlib.value_type)
        } else {
            Some(corlib.object)
        };
        for dependency in base.iter().chain(&self.interfaces) {
            module.type_def(*dependency)?;
        }

        let TypeDefBuilder {
            namespace,
            name,
            flags,
            interfaces,
            is_value_type,
            ..
        } = self;
        Ok(module.tables().push_type_def(|token| TypeDef {
            token,
            namespace,
            name,
            flags,
            base,
            interfaces,
            is_value_type,
        }))
    }
}

/// Builder for field definitions.
pub struct FieldDefBuilder {
    name: String,
    signature: TypeSig,
    flags: FieldAttributes,
}

impl FieldDefBuilder {
    /// Starts a public instance field.
    #[must_use]
    pub fn new(name: &str, signature: TypeSig) -> Self {
        Self {
            name: name.to_string(),
            signature,
            flags: FieldAttributes::PUBLIC,
        }
    }

    /// Makes this a static field.
    #[must_use]
    pub fn static_field(mut self) -> Self {
        self.flags |= FieldAttributes::STATIC;
        self
    }

    /// Adds the field to `owner`.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] for an unknown owner.
    pub fn build(self, module: &Module, owner: Token) -> Result<Token> {
        module.type_def(owner)?;
        Ok(module
            .tables()
            .push_field(owner, &self.name, self.signature, self.flags))
    }
}

/// Builder for method definitions.
pub struct MethodDefBuilder {
    name: String,
    flags: MethodModifiers,
    impl_code_type: MethodImplCodeType,
    impl_options: MethodImplOptions,
    params: Vec<TypeSig>,
    return_type: TypeSig,
    generic_arity: u16,
    body: Option<MethodBodyBuilder>,
}

impl MethodDefBuilder {
    /// Starts a public instance method returning `void`.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            flags: MethodModifiers::HIDE_BY_SIG,
            impl_code_type: MethodImplCodeType::IL,
            impl_options: MethodImplOptions::empty(),
            params: Vec::new(),
            return_type: TypeSig::Void,
            generic_arity: 0,
            body: None,
        }
    }

    /// Starts an instance constructor.
    #[must_use]
    pub fn constructor() -> Self {
        let mut builder = Self::new(CONSTRUCTOR_NAME);
        builder.flags |= MethodModifiers::SPECIAL_NAME | MethodModifiers::RTSPECIAL_NAME;
        builder
    }

    /// Makes the method static.
    #[must_use]
    pub fn static_method(mut self) -> Self {
        self.flags |= MethodModifiers::STATIC;
        self
    }

    /// Makes the method virtual.
    #[must_use]
    pub fn virtual_method(mut self) -> Self {
        self.flags |= MethodModifiers::VIRTUAL;
        self
    }

    /// Makes the method abstract (and virtual).
    #[must_use]
    pub fn abstract_method(mut self) -> Self {
        self.flags |= MethodModifiers::VIRTUAL | MethodModifiers::ABSTRACT;
        self
    }

    /// Seals a virtual method.
    #[must_use]
    pub fn final_method(mut self) -> Self {
        self.flags |= MethodModifiers::FINAL;
        self
    }

    /// Gives a virtual method its own vtable slot instead of overriding the base's.
    #[must_use]
    pub fn new_slot(mut self) -> Self {
        self.flags |= MethodModifiers::NEW_SLOT;
        self
    }

    /// Marks a property accessor or operator.
    #[must_use]
    pub fn special_name(mut self) -> Self {
        self.flags |= MethodModifiers::SPECIAL_NAME;
        self
    }

    /// Marks the method as implemented inside the runtime.
    #[must_use]
    pub fn internal_call(mut self) -> Self {
        self.impl_options |= MethodImplOptions::INTERNAL_CALL;
        self
    }

    /// Marks the method as a platform invoke.
    #[must_use]
    pub fn pinvoke(mut self) -> Self {
        self.flags |= MethodModifiers::PINVOKE_IMPL | MethodModifiers::STATIC;
        self.impl_options |= MethodImplOptions::PRESERVE_SIG;
        self
    }

    /// Appends a parameter.
    #[must_use]
    pub fn param(mut self, signature: TypeSig) -> Self {
        self.params.push(signature);
        self
    }

    /// Sets the return type.
    #[must_use]
    pub fn returns(mut self, signature: TypeSig) -> Self {
        self.return_type = signature;
        self
    }

    /// Sets the number of generic parameters.
    #[must_use]
    pub fn generic_arity(mut self, arity: u16) -> Self {
        self.generic_arity = arity;
        self
    }

    /// Gives the method a body.
    ///
    /// Without one, the body can be attached later with [`Module::implement`].
    #[must_use]
    pub fn body(mut self, body: MethodBodyBuilder) -> Self {
        self.body = Some(body);
        self
    }

    /// Adds the method to `owner`.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] for an unknown owner, [`Error::Malformed`] for a
    /// body on an abstract, internal or P/Invoke method, and any error raised while
    /// building the body.
    pub fn build(self, module: &Module, owner: Token) -> Result<Token> {
        let owner_def = module.type_def(owner)?;
        let bodiless = self.flags.contains(MethodModifiers::ABSTRACT)
            || self.flags.contains(MethodModifiers::PINVOKE_IMPL)
            || self.impl_options.contains(MethodImplOptions::INTERNAL_CALL);
        if bodiless && self.body.is_some() {
            return Err(malformed_error!(
                "Method {}::{} cannot have a body",
                owner_def.full_name(),
                self.name
            ));
        }
        if owner_def.is_interface()
            && !self.flags.contains(MethodModifiers::STATIC)
            && self.body.is_some()
        {
            return Err(Error::NotSupported(format!(
                "default interface method {}::{}",
                owner_def.full_name(),
                self.name
            )));
        }

        let MethodDefBuilder {
            name,
            mut flags,
            impl_code_type,
            impl_options,
            params,
            return_type,
            generic_arity,
            body,
        } = self;
        if owner_def.is_interface() && !flags.contains(MethodModifiers::STATIC) {
            flags |= MethodModifiers::VIRTUAL | MethodModifiers::ABSTRACT;
        }

        let token = module.tables().push_method_def(|token| MethodDef {
            token,
            declaring_type: owner,
            name,
            flags,
            access: MethodAccessFlags::PUBLIC,
            impl_code_type,
            impl_options,
            params,
            return_type,
            generic_arity,
            generic_args: Vec::new(),
            body: OnceLock::new(),
        });

        if let Some(body) = body {
            module.implement(token, body)?;
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_hierarchy() -> Result<()> {
        let module = Module::new();
        let shape = TypeDefBuilder::new("Geometry", "Shape")
            .abstract_type()
            .build(&module)?;
        let circle = TypeDefBuilder::new("Geometry", "Circle")
            .base(shape)
            .build(&module)?;

        assert!(module.is_subtype_of(circle, shape));
        assert!(module.is_subtype_of(circle, module.corlib().object));
        assert_eq!(module.type_sig(circle)?, TypeSig::Class(circle));
        assert!(TypeDefBuilder::new("Geometry", "Shape").build(&module).is_err());
        Ok(())
    }

    #[test]
    fn value_types_and_interfaces() -> Result<()> {
        let module = Module::new();
        let named = TypeDefBuilder::new("Demo", "INamed").interface().build(&module)?;
        let point = TypeDefBuilder::new("Demo", "Point")
            .value_type()
            .implements(named)
            .build(&module)?;

        let point_def = module.type_def(point)?;
        assert_eq!(point_def.base, Some(module.corlib().value_type));
        assert_eq!(module.type_sig(point)?, TypeSig::ValueType(point));
        assert!(module.is_subtype_of(point, named));
        assert!(module.type_def(named)?.base.is_none());

        let name = MethodDefBuilder::new("get_Name")
            .returns(TypeSig::String)
            .build(&module, named)?;
        assert!(module.method(name)?.is_abstract());
        Ok(())
    }

    #[test]
    fn fields() -> Result<()> {
        let module = Module::new();
        let point = TypeDefBuilder::new("Demo", "Point").value_type().build(&module)?;
        let x = FieldDefBuilder::new("X", TypeSig::I4).build(&module, point)?;
        let count = FieldDefBuilder::new("Count", TypeSig::I4)
            .static_field()
            .build(&module, point)?;

        let instance: Vec<Token> = module
            .instance_fields(point)
            .iter()
            .map(|field| field.token)
            .collect();
        assert_eq!(instance, vec![x]);
        assert!(module.field(count)?.is_static());
        assert!(FieldDefBuilder::new("Y", TypeSig::I4)
            .build(&module, Token::new(0x0200_FFFF))
            .is_err());
        Ok(())
    }

    #[test]
    fn methods() -> Result<()> {
        let module = Module::new();
        let program = TypeDefBuilder::new("Demo", "Program").build(&module)?;
        let ctor = MethodDefBuilder::constructor().build(&module, program)?;
        let twice = MethodDefBuilder::new("Twice")
            .static_method()
            .param(TypeSig::I4)
            .returns(TypeSig::I4)
            .body(MethodBodyBuilder::new().implementation(|asm| {
                asm.ldarg_0()?.ldarg_0()?.add()?.ret()?;
                Ok(())
            }))
            .build(&module, program)?;

        assert!(module.method(ctor)?.is_constructor());
        assert!(!module.method(ctor)?.has_body());
        let twice = module.method(twice)?;
        assert!(twice.is_static());
        assert!(twice.has_body());
        assert_eq!(module.methods_of(program).len(), 2);

        let abstract_with_body = MethodDefBuilder::new("Broken")
            .abstract_method()
            .body(MethodBodyBuilder::new().implementation(|asm| {
                asm.ret()?;
                Ok(())
            }))
            .build(&module, program);
        assert!(abstract_with_body.is_err());
        Ok(())
    }
}
