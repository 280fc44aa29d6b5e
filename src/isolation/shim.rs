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

//! Shims: a method to intercept and what to run instead.
//!
//! A [`Shim`] is created through [`ShimBuilder`], which selects the original method,
//! optionally narrows it to one receiver instance or receiver type, and validates the
//! replacement's signature against the original before the shim exists:
//!
//! ```rust
//! use dotshim::emulation::{NativeMethod, Value};
//! use dotshim::isolation::Shim;
//! use dotshim::metadata::{Module, TypeSig};
//!
//! let module = Module::new();
//! let write_line = module.corlib().console_write_line_string;
//!
//! let shim = Shim::replace(&module, write_line)?.with_native(
//!     &module,
//!     NativeMethod::new("quiet", vec![TypeSig::String], TypeSig::Void, |_, _| Ok(Value::Void)),
//! )?;
//! assert_eq!(shim.original().name, "WriteLine");
//!
//! let wrong = Shim::replace(&module, write_line)?.with_native(
//!     &module,
//!     NativeMethod::new("quiet", vec![TypeSig::I4], TypeSig::Void, |_, _| Ok(Value::Void)),
//! );
//! assert!(wrong.is_err());
//! # Ok::<(), dotshim::Error>(())
//! ```
//!
//! Replacement signatures follow delegate conventions: an instance method's
//! replacement takes the receiver as its first parameter (by reference for value
//! types), a constructor's replacement takes the constructor's parameters and returns
//! the constructed instance, and a setter's replacement returns `void`.

use std::fmt;

use crate::{
    emulation::{ExecutionThread, HeapRef, NativeMethod, NativeMethodRc, Runtime, Value},
    metadata::{MethodDefRc, MethodIdentity, SymbolTable, Token, TypeSig},
    Error, Result,
};

/// Which receivers a shim applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverMatch {
    /// Every receiver, and static methods
    Any,
    /// Only this exact heap instance
    Instance(HeapRef),
    /// Receivers whose runtime type is, derives from or implements this type
    Type(Token),
}

/// What runs in place of the original method.
#[derive(Clone)]
pub enum Replacement {
    /// A Rust closure with a declared signature
    Native(NativeMethodRc),
    /// A managed method, optionally bound to a target like a closed delegate
    Managed {
        /// The replacement method
        method: Token,
        /// Receiver of an instance replacement method
        target: Option<Value>,
    },
}

impl Replacement {
    /// Parameter types and return type the replacement is called with.
    ///
    /// # Errors
    /// Returns [`Error::MethodNotFound`] or [`Error::TypeNotFound`] for unknown
    /// managed replacements.
    pub fn signature(&self, symbols: &dyn SymbolTable) -> Result<(Vec<TypeSig>, TypeSig)> {
        match self {
            Replacement::Native(native) => {
                Ok((native.params().to_vec(), native.return_type().clone()))
            }
            Replacement::Managed { method, target } => {
                let def = symbols.method(*method)?;
                if def.is_static() || target.is_some() {
                    return Ok((def.params.clone(), def.return_type.clone()));
                }

                let mut receiver = symbols.type_sig(def.declaring_type)?;
                if symbols.is_value_type(def.declaring_type) {
                    receiver = receiver.by_ref();
                }
                let mut params = Vec::with_capacity(def.params.len() + 1);
                params.push(receiver);
                params.extend(def.params.iter().cloned());
                Ok((params, def.return_type.clone()))
            }
        }
    }

    /// Runs the replacement with the original call's arguments.
    ///
    /// Managed replacements run from their original bodies, so calls they make are
    /// not intercepted.
    ///
    /// # Errors
    /// Returns whatever the replacement returns, including [`Error::Thrown`].
    pub fn invoke(&self, thread: &mut ExecutionThread<'_>, args: Vec<Value>) -> Result<Value> {
        match self {
            Replacement::Native(native) => thread.call_native(native, args),
            Replacement::Managed { method, target } => {
                let def = thread.runtime().symbols().method(*method)?;
                let args = match target {
                    Some(target) => std::iter::once(target.clone()).chain(args).collect(),
                    None => args,
                };
                if !def.is_static() && def.is_virtual() {
                    thread.call_virtual(&def, args)
                } else {
                    thread.call_method(&def, args)
                }
            }
        }
    }
}

impl fmt::Debug for Replacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Replacement::Native(native) => f.debug_tuple("Native").field(&native.name()).finish(),
            Replacement::Managed { method, target } => f
                .debug_struct("Managed")
                .field("method", method)
                .field("target", target)
                .finish(),
        }
    }
}

/// A validated interception rule.
#[derive(Debug, Clone)]
pub struct Shim {
    original: MethodDefRc,
    identity: MethodIdentity,
    receiver: ReceiverMatch,
    replacement: Replacement,
    setter: bool,
    construction_base: Option<Token>,
}

impl Shim {
    /// Starts a shim for a method.
    ///
    /// # Errors
    /// Returns [`Error::MethodNotFound`] for unknown tokens.
    pub fn replace(symbols: &dyn SymbolTable, method: Token) -> Result<ShimBuilder> {
        Ok(ShimBuilder::new(symbols.method(method)?))
    }

    /// Starts a shim for a property getter, or its setter when `setter` is set.
    ///
    /// # Errors
    /// Returns [`Error::MethodNotFound`] if the type declares no such accessor.
    pub fn replace_property(
        symbols: &dyn SymbolTable,
        type_token: Token,
        name: &str,
        setter: bool,
    ) -> Result<ShimBuilder> {
        let accessor = if setter {
            format!("set_{name}")
        } else {
            format!("get_{name}")
        };
        let Some(method) = symbols.find_method_by_name(type_token, &accessor) else {
            let owner = symbols
                .type_def(type_token)
                .map_or_else(|_| type_token.to_string(), |def| def.full_name());
            return Err(Error::MethodNotFound(format!("{owner}::{accessor}")));
        };

        let mut builder = ShimBuilder::new(symbols.method(method)?);
        builder.setter = setter;
        Ok(builder)
    }

    /// The intercepted method.
    #[must_use]
    pub fn original(&self) -> &MethodDefRc {
        &self.original
    }

    /// Identity of the intercepted method.
    #[must_use]
    pub fn identity(&self) -> &MethodIdentity {
        &self.identity
    }

    /// Receiver criterion.
    #[must_use]
    pub fn receiver(&self) -> ReceiverMatch {
        self.receiver
    }

    /// The replacement.
    #[must_use]
    pub fn replacement(&self) -> &Replacement {
        &self.replacement
    }

    /// Whether the shim replaces a property setter.
    #[must_use]
    pub fn is_setter(&self) -> bool {
        self.setter
    }

    /// Type a constructor replacement's result was checked against.
    #[must_use]
    pub fn construction_base(&self) -> Option<Token> {
        self.construction_base
    }

    /// Runs the replacement.
    ///
    /// # Errors
    /// See [`Replacement::invoke`].
    pub fn invoke(&self, thread: &mut ExecutionThread<'_>, args: Vec<Value>) -> Result<Value> {
        self.replacement.invoke(thread, args)
    }
}

/// Collects the selection criteria of a [`Shim`].
#[derive(Debug, Clone)]
pub struct ShimBuilder {
    original: MethodDefRc,
    receiver: ReceiverMatch,
    instance_type: Option<Token>,
    setter: bool,
    construction_base: Option<Token>,
}

impl ShimBuilder {
    fn new(original: MethodDefRc) -> Self {
        ShimBuilder {
            original,
            receiver: ReceiverMatch::Any,
            instance_type: None,
            setter: false,
            construction_base: None,
        }
    }

    /// Restricts the shim to one heap instance.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] for null, unboxed or boxed value type
    /// instances.
    pub fn on_instance(mut self, runtime: &Runtime, instance: &Value) -> Result<Self> {
        let Value::ObjectRef(object) = instance else {
            return Err(Error::NotSupported(format!(
                "cannot bind a shim to {instance}, only reference type instances"
            )));
        };

        let core = runtime.symbols().core_types();
        let runtime_type = runtime.heap().get_type_token(*object, &core)?;
        if runtime.symbols().is_value_type(runtime_type) {
            return Err(Error::NotSupported(format!(
                "cannot bind a shim to a boxed {}",
                runtime.type_name(runtime_type)
            )));
        }

        self.receiver = ReceiverMatch::Instance(*object);
        self.instance_type = Some(runtime_type);
        Ok(self)
    }

    /// Restricts the shim to receivers assignable to `type_token`.
    #[must_use]
    pub fn on_type(mut self, type_token: Token) -> Self {
        self.receiver = ReceiverMatch::Type(type_token);
        self.instance_type = None;
        self
    }

    /// Checks a constructor replacement's result against `base` instead of the
    /// declaring type.
    #[must_use]
    pub fn constructing_as(mut self, base: Token) -> Self {
        self.construction_base = Some(base);
        self
    }

    /// Validates a native replacement and creates the shim.
    ///
    /// # Errors
    /// See [`ShimBuilder::with`].
    pub fn with_native(self, symbols: &dyn SymbolTable, native: NativeMethod) -> Result<Shim> {
        self.with(symbols, Replacement::Native(NativeMethodRc::new(native)))
    }

    /// Validates a managed replacement and creates the shim.
    ///
    /// # Errors
    /// See [`ShimBuilder::with`].
    pub fn with_method(
        self,
        symbols: &dyn SymbolTable,
        method: Token,
        target: Option<Value>,
    ) -> Result<Shim> {
        self.with(symbols, Replacement::Managed { method, target })
    }

    /// Validates `replacement` against the original and creates the shim.
    ///
    /// # Errors
    /// Returns [`Error::InvalidShimSignature`] naming the first mismatch (return type,
    /// value type receiver, receiver type, parameter count, parameter types), and
    /// [`Error::NotSupported`] when a static method or constructor is bound to a
    /// receiver.
    pub fn with(self, symbols: &dyn SymbolTable, replacement: Replacement) -> Result<Shim> {
        self.validate(symbols, &replacement)?;

        let identity = self.original.identity();
        Ok(Shim {
            original: self.original,
            identity,
            receiver: self.receiver,
            replacement,
            setter: self.setter,
            construction_base: self.construction_base,
        })
    }

    fn validate(&self, symbols: &dyn SymbolTable, replacement: &Replacement) -> Result<()> {
        let original = &self.original;
        let owner = original.declaring_type;
        let is_constructor = original.is_constructor();
        let is_static_or_constructor = original.is_static() || is_constructor;

        if is_static_or_constructor && self.receiver != ReceiverMatch::Any {
            return Err(Error::NotSupported(format!(
                "{} has no receiver to match",
                symbols.method_name(original.token)
            )));
        }

        let (params, return_type) = replacement.signature(symbols)?;

        if is_constructor {
            let base = symbols.type_sig(self.construction_base.unwrap_or(owner))?;
            if !symbols.is_assignable(&base, &return_type) {
                return Err(invalid("Mismatched construction types"));
            }
        } else {
            let expected = if self.setter {
                TypeSig::Void
            } else {
                original.return_type.clone()
            };
            if expected != return_type {
                return Err(invalid("Mismatched return types"));
            }
        }

        let shim_params = if is_static_or_constructor {
            params.as_slice()
        } else {
            let receiver = params.first();
            if symbols.is_value_type(owner) && !receiver.is_some_and(TypeSig::is_by_ref) {
                return Err(invalid("ValueType instances must be passed by ref"));
            }

            let owning_type = match self.receiver {
                ReceiverMatch::Type(type_token) => type_token,
                ReceiverMatch::Instance(_) => self.instance_type.unwrap_or(owner),
                ReceiverMatch::Any => owner,
            };
            let mut expected = symbols.type_sig(owning_type)?;
            if symbols.is_value_type(owning_type) {
                expected = expected.by_ref();
            }
            if receiver != Some(&expected) {
                return Err(invalid("Mismatched instance types"));
            }
            &params[1..]
        };

        if shim_params.len() != original.params.len() {
            return Err(invalid("Parameters count do not match"));
        }
        for (index, (expected, actual)) in original.params.iter().zip(shim_params).enumerate() {
            if expected != actual {
                return Err(invalid(&format!("Parameter types at {index} do not match")));
            }
        }
        Ok(())
    }
}

fn invalid(message: &str) -> Error {
    Error::InvalidShimSignature(message.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::metadata::{
        builders::{MethodDefBuilder, TypeDefBuilder},
        Module,
    };

    struct Fixture {
        module: Arc<Module>,
        counter: Token,
        derived: Token,
        point: Token,
        add: Token,
        twice: Token,
        ctor: Token,
        set_value: Token,
        length: Token,
    }

    fn fixture() -> Result<Fixture> {
        let module = Arc::new(Module::new());
        let counter = TypeDefBuilder::new("Demo", "Counter").build(&module)?;
        let derived = TypeDefBuilder::new("Demo", "SlowCounter")
            .base(counter)
            .build(&module)?;
        let point = TypeDefBuilder::new("Demo", "Point").value_type().build(&module)?;

        let add = MethodDefBuilder::new("Add")
            .param(TypeSig::I4)
            .returns(TypeSig::I4)
            .build(&module, counter)?;
        let twice = MethodDefBuilder::new("Twice")
            .static_method()
            .param(TypeSig::I4)
            .param(TypeSig::String)
            .returns(TypeSig::I4)
            .build(&module, counter)?;
        let ctor = MethodDefBuilder::constructor()
            .param(TypeSig::I4)
            .build(&module, counter)?;
        MethodDefBuilder::new("get_Value")
            .special_name()
            .returns(TypeSig::I4)
            .build(&module, counter)?;
        let set_value = MethodDefBuilder::new("set_Value")
            .special_name()
            .param(TypeSig::I4)
            .build(&module, counter)?;
        let length = MethodDefBuilder::new("Length")
            .returns(TypeSig::I4)
            .build(&module, point)?;

        Ok(Fixture {
            module,
            counter,
            derived,
            point,
            add,
            twice,
            ctor,
            set_value,
            length,
        })
    }

    fn native(params: Vec<TypeSig>, return_type: TypeSig) -> NativeMethod {
        NativeMethod::new("replacement", params, return_type, |_, _| Ok(Value::Void))
    }

    fn rejection(result: Result<Shim>) -> String {
        match result {
            Err(Error::InvalidShimSignature(message)) => message,
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("replacement was accepted"),
        }
    }

    #[test]
    fn accepts_matching_replacements() -> Result<()> {
        let f = fixture()?;
        let module = f.module.as_ref();
        let counter = TypeSig::Class(f.counter);

        let shim = Shim::replace(module, f.add)?
            .with_native(module, native(vec![counter, TypeSig::I4], TypeSig::I4))?;
        assert_eq!(shim.receiver(), ReceiverMatch::Any);
        assert_eq!(shim.identity(), &module.method(f.add)?.identity());

        Shim::replace(module, f.twice)?.with_native(
            module,
            native(vec![TypeSig::I4, TypeSig::String], TypeSig::I4),
        )?;
        Shim::replace(module, f.ctor)?
            .with_native(module, native(vec![TypeSig::I4], TypeSig::Class(f.counter)))?;
        Shim::replace(module, f.length)?.with_native(
            module,
            native(vec![TypeSig::ValueType(f.point).by_ref()], TypeSig::I4),
        )?;
        Ok(())
    }

    #[test]
    fn mismatches_are_reported_in_order() -> Result<()> {
        let f = fixture()?;
        let module = f.module.as_ref();
        let counter = TypeSig::Class(f.counter);

        let message = rejection(
            Shim::replace(module, f.add)?.with_native(module, native(vec![], TypeSig::String)),
        );
        assert_eq!(message, "Mismatched return types");

        let message = rejection(Shim::replace(module, f.length)?.with_native(
            module,
            native(vec![TypeSig::ValueType(f.point)], TypeSig::I4),
        ));
        assert_eq!(message, "ValueType instances must be passed by ref");

        let message = rejection(Shim::replace(module, f.add)?.with_native(
            module,
            native(vec![TypeSig::Object, TypeSig::I4], TypeSig::I4),
        ));
        assert_eq!(message, "Mismatched instance types");

        let message = rejection(
            Shim::replace(module, f.add)?
                .with_native(module, native(vec![counter.clone()], TypeSig::I4)),
        );
        assert_eq!(message, "Parameters count do not match");

        let message = rejection(Shim::replace(module, f.twice)?.with_native(
            module,
            native(vec![TypeSig::I4, TypeSig::I8], TypeSig::I4),
        ));
        assert_eq!(message, "Parameter types at 1 do not match");
        Ok(())
    }

    #[test]
    fn constructors_check_assignability() -> Result<()> {
        let f = fixture()?;
        let module = f.module.as_ref();

        Shim::replace(module, f.ctor)?
            .with_native(module, native(vec![TypeSig::I4], TypeSig::Class(f.derived)))?;

        let message = rejection(
            Shim::replace(module, f.ctor)?
                .constructing_as(f.derived)
                .with_native(module, native(vec![TypeSig::I4], TypeSig::Class(f.counter))),
        );
        assert_eq!(message, "Mismatched construction types");

        let message = rejection(
            Shim::replace(module, f.ctor)?.with_native(module, native(vec![TypeSig::I4], TypeSig::String)),
        );
        assert_eq!(message, "Mismatched construction types");
        Ok(())
    }

    #[test]
    fn type_scoped_receivers() -> Result<()> {
        let f = fixture()?;
        let module = f.module.as_ref();

        let shim = Shim::replace(module, f.add)?.on_type(f.derived).with_native(
            module,
            native(vec![TypeSig::Class(f.derived), TypeSig::I4], TypeSig::I4),
        )?;
        assert_eq!(shim.receiver(), ReceiverMatch::Type(f.derived));

        let message = rejection(Shim::replace(module, f.add)?.on_type(f.derived).with_native(
            module,
            native(vec![TypeSig::Class(f.counter), TypeSig::I4], TypeSig::I4),
        ));
        assert_eq!(message, "Mismatched instance types");
        Ok(())
    }

    #[test]
    fn instance_binding() -> Result<()> {
        let f = fixture()?;
        let runtime = Runtime::new(f.module.clone());
        let module = f.module.as_ref();

        let instance = runtime.new_object(f.derived)?;
        let shim = Shim::replace(module, f.add)?
            .on_instance(&runtime, &instance)?
            .with_native(
                module,
                native(vec![TypeSig::Class(f.derived), TypeSig::I4], TypeSig::I4),
            )?;
        assert!(matches!(shim.receiver(), ReceiverMatch::Instance(_)));

        let boxed = runtime.box_value(runtime.corlib().int32, Value::I4(3))?;
        assert!(matches!(
            Shim::replace(module, f.add)?.on_instance(&runtime, &boxed),
            Err(Error::NotSupported(_))
        ));
        assert!(matches!(
            Shim::replace(module, f.add)?.on_instance(&runtime, &Value::Null),
            Err(Error::NotSupported(_))
        ));
        Ok(())
    }

    #[test]
    fn static_methods_cannot_be_bound() -> Result<()> {
        let f = fixture()?;
        let module = f.module.as_ref();
        let result = Shim::replace(module, f.twice)?.on_type(f.counter).with_native(
            module,
            native(vec![TypeSig::I4, TypeSig::String], TypeSig::I4),
        );
        assert!(matches!(result, Err(Error::NotSupported(_))));
        Ok(())
    }

    #[test]
    fn property_setters_return_void() -> Result<()> {
        let f = fixture()?;
        let module = f.module.as_ref();
        let counter = TypeSig::Class(f.counter);

        let shim = Shim::replace_property(module, f.counter, "Value", true)?
            .with_native(module, native(vec![counter.clone(), TypeSig::I4], TypeSig::Void))?;
        assert!(shim.is_setter());
        assert_eq!(shim.original().token, f.set_value);

        Shim::replace_property(module, f.counter, "Value", false)?
            .with_native(module, native(vec![counter], TypeSig::I4))?;

        assert!(matches!(
            Shim::replace_property(module, f.counter, "Missing", false),
            Err(Error::MethodNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn managed_replacements() -> Result<()> {
        let f = fixture()?;
        let module = f.module.as_ref();
        let helpers = TypeDefBuilder::new("Demo", "Helpers").build(module)?;
        let static_add = MethodDefBuilder::new("Add")
            .static_method()
            .param(TypeSig::Class(f.counter))
            .param(TypeSig::I4)
            .returns(TypeSig::I4)
            .build(module, helpers)?;
        let instance_add = MethodDefBuilder::new("AddTo")
            .param(TypeSig::Class(f.counter))
            .param(TypeSig::I4)
            .returns(TypeSig::I4)
            .build(module, helpers)?;

        Shim::replace(module, f.add)?.with_method(module, static_add, None)?;

        let bound = Replacement::Managed {
            method: instance_add,
            target: Some(Value::Null),
        };
        assert_eq!(bound.signature(module)?.0.len(), 2);
        let open = Replacement::Managed {
            method: instance_add,
            target: None,
        };
        assert_eq!(open.signature(module)?.0[0], TypeSig::Class(helpers));

        let message = rejection(Shim::replace(module, f.add)?.with_method(module, instance_add, None));
        assert_eq!(message, "Mismatched instance types");
        Ok(())
    }
}
