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

//! The ordered shim list of one isolation run.
//!
//! Lookup is two-tiered. Shims bound to the exact receiver instance win over shims
//! scoped by type or unscoped; within a tier the first registered shim wins.
//! Every tier also matches overrides of the virtual method a shim names.

use crate::{
    emulation::{ExecutionThread, HeapRef, Value},
    isolation::shim::{ReceiverMatch, Shim},
    metadata::{MethodDefRc, MethodIdentity, SymbolTable, Token},
    Result,
};

/// What shim matching knows about a call's receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Receiver {
    /// The heap instance, for reference type receivers
    pub instance: Option<HeapRef>,
    /// The receiver's runtime type, if it has one
    pub runtime_type: Option<Token>,
}

impl Receiver {
    /// Describes a receiver argument; `None` for null.
    ///
    /// Managed pointers are followed, so value type receivers passed by reference
    /// report their value type.
    ///
    /// # Errors
    /// Returns [`crate::Error::TypeMismatch`] for dangling references.
    pub fn of(thread: &ExecutionThread<'_>, value: &Value) -> Result<Option<Receiver>> {
        let runtime = thread.runtime();
        let pointee;
        let value = match value {
            Value::ManagedPtr(pointer) => {
                pointee = thread.load(pointer)?;
                &pointee
            }
            other => other,
        };

        Ok(match value {
            Value::Null => None,
            Value::ObjectRef(object) => Some(Receiver {
                instance: Some(*object),
                runtime_type: runtime.runtime_type(value)?,
            }),
            other => Some(Receiver {
                instance: None,
                runtime_type: runtime.runtime_type(other)?,
            }),
        })
    }
}

/// Shims of one run, in registration order.
#[derive(Debug, Default)]
pub struct ShimRegistry {
    shims: Vec<Shim>,
}

impl ShimRegistry {
    /// Creates a registry; earlier shims take precedence within a tier.
    #[must_use]
    pub fn new(shims: Vec<Shim>) -> Self {
        ShimRegistry { shims }
    }

    /// Number of shims.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shims.len()
    }

    /// Whether no shim is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shims.is_empty()
    }

    /// The shim at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Shim> {
        self.shims.get(index)
    }

    /// All shims in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Shim> {
        self.shims.iter()
    }

    /// Whether any shim names `identity` as its original.
    #[must_use]
    pub fn names(&self, identity: &MethodIdentity) -> bool {
        self.shims.iter().any(|shim| shim.identity() == identity)
    }

    /// Finds the shim that applies to a call of `method` on `receiver`.
    ///
    /// `method` is the resolved target: for virtual calls, the implementation the
    /// receiver dispatches to.
    #[must_use]
    pub fn find(
        &self,
        symbols: &dyn SymbolTable,
        method: &MethodDefRc,
        receiver: Option<&Receiver>,
    ) -> Option<usize> {
        let identity = method.identity();
        let names = |shim: &Shim| {
            *shim.identity() == identity || symbols.overrides(method, shim.original())
        };

        let receiver = match receiver {
            Some(receiver) if !method.is_static() => receiver,
            _ => {
                return self
                    .shims
                    .iter()
                    .position(|shim| *shim.identity() == identity)
            }
        };

        if let Some(instance) = receiver.instance {
            let bound = self.shims.iter().position(|shim| {
                shim.receiver() == ReceiverMatch::Instance(instance) && names(shim)
            });
            if bound.is_some() {
                return bound;
            }
        }

        self.shims.iter().position(|shim| {
            let type_matches = match shim.receiver() {
                ReceiverMatch::Instance(_) => false,
                ReceiverMatch::Type(type_token) => receiver
                    .runtime_type
                    .is_some_and(|runtime_type| symbols.is_subtype_of(runtime_type, type_token)),
                ReceiverMatch::Any => true,
            };
            type_matches && names(shim)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        emulation::{NativeMethod, Runtime},
        metadata::{
            builders::{MethodDefBuilder, TypeDefBuilder},
            Module, TypeSig,
        },
    };

    struct Animals {
        module: Arc<Module>,
        animal: Token,
        dog: Token,
        speak: MethodDefRc,
        dog_speak: MethodDefRc,
        create: MethodDefRc,
    }

    fn animals() -> Result<Animals> {
        let module = Arc::new(Module::new());
        let animal = TypeDefBuilder::new("Zoo", "Animal").build(&module)?;
        let dog = TypeDefBuilder::new("Zoo", "Dog").base(animal).build(&module)?;
        let speak = MethodDefBuilder::new("Speak")
            .virtual_method()
            .returns(TypeSig::String)
            .build(&module, animal)?;
        let dog_speak = MethodDefBuilder::new("Speak")
            .virtual_method()
            .returns(TypeSig::String)
            .build(&module, dog)?;
        let create = MethodDefBuilder::new("Create")
            .static_method()
            .returns(TypeSig::Class(animal))
            .build(&module, animal)?;

        Ok(Animals {
            speak: module.method(speak)?,
            dog_speak: module.method(dog_speak)?,
            create: module.method(create)?,
            module,
            animal,
            dog,
        })
    }

    fn speak_shim(zoo: &Animals, receiver: ReceiverMatch, method: &MethodDefRc) -> Result<Shim> {
        let module = zoo.module.as_ref();
        let receiver_type = match receiver {
            ReceiverMatch::Type(type_token) => type_token,
            _ => method.declaring_type,
        };
        let builder = Shim::replace(module, method.token)?;
        let builder = match receiver {
            ReceiverMatch::Type(type_token) => builder.on_type(type_token),
            _ => builder,
        };
        builder.with_native(
            module,
            NativeMethod::new(
                "speak",
                vec![TypeSig::Class(receiver_type)],
                TypeSig::String,
                |_, _| Ok(Value::Null),
            ),
        )
    }

    #[test]
    fn static_methods_match_by_identity() -> Result<()> {
        let zoo = animals()?;
        let module = zoo.module.as_ref();
        let shim = Shim::replace(module, zoo.create.token)?.with_native(
            module,
            NativeMethod::new("create", vec![], TypeSig::Class(zoo.animal), |_, _| {
                Ok(Value::Null)
            }),
        )?;
        let registry = ShimRegistry::new(vec![shim]);

        assert_eq!(registry.find(module, &zoo.create, None), Some(0));
        assert_eq!(registry.find(module, &zoo.speak, None), None);
        assert!(registry.names(&zoo.create.identity()));
        assert!(!registry.names(&zoo.speak.identity()));
        Ok(())
    }

    #[test]
    fn overrides_match_unscoped_shims() -> Result<()> {
        let zoo = animals()?;
        let module = zoo.module.as_ref();
        let registry = ShimRegistry::new(vec![speak_shim(&zoo, ReceiverMatch::Any, &zoo.speak)?]);

        let dog = Receiver {
            instance: Some(HeapRef::new(1)),
            runtime_type: Some(zoo.dog),
        };
        assert_eq!(registry.find(module, &zoo.dog_speak, Some(&dog)), Some(0));
        assert_eq!(registry.find(module, &zoo.speak, Some(&dog)), Some(0));
        Ok(())
    }

    #[test]
    fn type_scope_filters_receivers() -> Result<()> {
        let zoo = animals()?;
        let module = zoo.module.as_ref();
        let registry = ShimRegistry::new(vec![speak_shim(
            &zoo,
            ReceiverMatch::Type(zoo.dog),
            &zoo.speak,
        )?]);

        let animal = Receiver {
            instance: Some(HeapRef::new(1)),
            runtime_type: Some(zoo.animal),
        };
        let dog = Receiver {
            instance: Some(HeapRef::new(2)),
            runtime_type: Some(zoo.dog),
        };
        assert_eq!(registry.find(module, &zoo.speak, Some(&animal)), None);
        assert_eq!(registry.find(module, &zoo.dog_speak, Some(&dog)), Some(0));
        Ok(())
    }

    #[test]
    fn instance_shims_take_priority() -> Result<()> {
        let zoo = animals()?;
        let runtime = Runtime::new(zoo.module.clone());
        let module = zoo.module.as_ref();
        let rex = runtime.new_object(zoo.dog)?;
        let Value::ObjectRef(rex_ref) = rex else {
            panic!("expected an object reference");
        };

        let scoped = speak_shim(&zoo, ReceiverMatch::Type(zoo.dog), &zoo.dog_speak)?;
        let bound = Shim::replace(module, zoo.dog_speak.token)?
            .on_instance(&runtime, &rex)?
            .with_native(
                module,
                NativeMethod::new("rex", vec![TypeSig::Class(zoo.dog)], TypeSig::String, |_, _| {
                    Ok(Value::Null)
                }),
            )?;
        let registry = ShimRegistry::new(vec![scoped, bound]);

        let rex = Receiver {
            instance: Some(rex_ref),
            runtime_type: Some(zoo.dog),
        };
        let other = Receiver {
            instance: Some(HeapRef::new(rex_ref.id() + 100)),
            runtime_type: Some(zoo.dog),
        };
        assert_eq!(registry.find(module, &zoo.dog_speak, Some(&rex)), Some(1));
        assert_eq!(registry.find(module, &zoo.dog_speak, Some(&other)), Some(0));
        Ok(())
    }

    #[test]
    fn receivers_of_values() -> Result<()> {
        let zoo = animals()?;
        let runtime = Runtime::new(zoo.module.clone());
        let thread = ExecutionThread::new(&runtime);

        let dog = runtime.new_object(zoo.dog)?;
        let receiver = Receiver::of(&thread, &dog)?;
        assert_eq!(receiver.and_then(|r| r.runtime_type), Some(zoo.dog));
        assert!(receiver.is_some_and(|r| r.instance.is_some()));

        assert_eq!(Receiver::of(&thread, &Value::Null)?, None);
        let number = Receiver::of(&thread, &Value::I4(4))?;
        assert_eq!(
            number,
            Some(Receiver {
                instance: None,
                runtime_type: Some(runtime.corlib().int32),
            })
        );
        Ok(())
    }
}
