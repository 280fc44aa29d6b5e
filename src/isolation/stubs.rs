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

//! Interception stubs.
//!
//! The rewriter replaces every call-like instruction with a `call` to a stub: a
//! native method with the call site's stack signature that decides at run time what
//! actually runs. There are five flavors, one per call-like instruction, plus the
//! `constrained.` variant of the virtual call stub:
//!
//! | Kind | Replaces | Signature |
//! |------|----------|-----------|
//! | [`StubKind::Call`] | `call` | receiver (by reference for value types), params |
//! | [`StubKind::Virtual`] | `callvirt` | receiver (`object` for interfaces), params |
//! | [`StubKind::Constrained`] | `constrained. T callvirt` | `T&`, params |
//! | [`StubKind::Construct`] | `newobj` | params, returns the type |
//! | [`StubKind::FunctionPointer`] | `ldftn` | returns `native int` |
//! | [`StubKind::VirtualFunctionPointer`] | `ldvirtftn` | `object`, returns `native int` |
//!
//! Call stubs consult the run's shims first. Everything that is not shimmed runs from
//! a rewritten body, so interception reaches arbitrarily deep into the call graph.
//! Function-pointer stubs never apply shims; they hand out pointers to rewritten
//! bodies, so calls made through the delegate are still intercepted.
//!
//! Stubs hold a weak reference to their [`RunContext`]. A stub that escapes its run
//! (for example through a function pointer stored on the heap) fails with
//! [`Error::NotSupported`] once the run is over.

use std::sync::{Arc, Weak};

use strum::Display;

use crate::{
    emulation::{
        Callable, ExecutionThread, ManagedPointer, NativeMethod, NativeMethodRc, Value,
    },
    isolation::{context::RunContext, registry::Receiver},
    metadata::{MethodDef, MethodDefRc, MethodIdentity, SymbolTable, Token, TypeSig},
    Error, Result,
};

/// Stub flavors; the display form is the stub name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum StubKind {
    /// `call`
    #[strum(serialize = "stub_call")]
    Call,
    /// `callvirt`
    #[strum(serialize = "stub_callvirt")]
    Virtual,
    /// `constrained. T callvirt`, carrying `T`
    #[strum(serialize = "stub_callvirt")]
    Constrained(Token),
    /// `newobj`
    #[strum(serialize = "stub_newobj")]
    Construct,
    /// `ldftn`
    #[strum(serialize = "stub_ldftn")]
    FunctionPointer,
    /// `ldvirtftn`
    #[strum(serialize = "stub_ldvirtftn")]
    VirtualFunctionPointer,
}

impl StubKind {
    /// The stub flavor replacing `mnemonic`, given a pending `constrained.` prefix.
    #[must_use]
    pub fn for_instruction(mnemonic: &str, constrained: Option<Token>) -> Option<StubKind> {
        match (mnemonic, constrained) {
            ("call", _) => Some(StubKind::Call),
            ("callvirt", Some(constraint)) => Some(StubKind::Constrained(constraint)),
            ("callvirt", None) => Some(StubKind::Virtual),
            ("newobj", _) => Some(StubKind::Construct),
            ("ldftn", _) => Some(StubKind::FunctionPointer),
            ("ldvirtftn", _) => Some(StubKind::VirtualFunctionPointer),
            _ => None,
        }
    }

    /// Whether the stub receives a receiver as its first argument.
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        matches!(
            self,
            StubKind::Virtual | StubKind::Constrained(_) | StubKind::VirtualFunctionPointer
        )
    }
}

/// The stack signature of a stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubSignature {
    /// Parameter types, receiver first
    pub params: Vec<TypeSig>,
    /// Return type
    pub return_type: TypeSig,
}

impl StubSignature {
    /// Computes the signature of the `kind` stub for `method`.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] when `kind` cannot apply to `method`, such as
    /// a virtual stub for a static method or a construction stub for a non-constructor.
    pub fn new(symbols: &dyn SymbolTable, kind: StubKind, method: &MethodDef) -> Result<Self> {
        let owner = method.declaring_type;
        let invalid = |what: &str| {
            Error::NotSupported(format!(
                "{kind} for {} {what}",
                symbols.method_name(method.token)
            ))
        };

        let with_receiver = |receiver: TypeSig| {
            std::iter::once(receiver)
                .chain(method.params.iter().cloned())
                .collect::<Vec<_>>()
        };

        let signature = match kind {
            StubKind::Call => StubSignature {
                params: if method.is_static() {
                    method.params.clone()
                } else {
                    with_receiver(receiver_sig(symbols, owner)?)
                },
                return_type: method.return_type.clone(),
            },
            StubKind::Virtual => {
                if method.is_static() {
                    return Err(invalid("needs an instance method"));
                }
                let receiver = if symbols.type_def(owner)?.is_interface() {
                    TypeSig::Object
                } else {
                    receiver_sig(symbols, owner)?
                };
                StubSignature {
                    params: with_receiver(receiver),
                    return_type: method.return_type.clone(),
                }
            }
            StubKind::Constrained(constraint) => {
                if method.is_static() {
                    return Err(invalid("needs an instance method"));
                }
                StubSignature {
                    params: with_receiver(symbols.type_sig(constraint)?.by_ref()),
                    return_type: method.return_type.clone(),
                }
            }
            StubKind::Construct => {
                if !method.is_constructor() {
                    return Err(invalid("needs a constructor"));
                }
                StubSignature {
                    params: method.params.clone(),
                    return_type: symbols.type_sig(owner)?,
                }
            }
            StubKind::FunctionPointer => StubSignature {
                params: Vec::new(),
                return_type: TypeSig::IntPtr,
            },
            StubKind::VirtualFunctionPointer => {
                if method.is_static() {
                    return Err(invalid("needs an instance method"));
                }
                StubSignature {
                    params: vec![TypeSig::Object],
                    return_type: TypeSig::IntPtr,
                }
            }
        };
        Ok(signature)
    }
}

/// The receiver parameter of a non-virtual call on a method declared on `owner`.
pub(crate) fn receiver_sig(symbols: &dyn SymbolTable, owner: Token) -> Result<TypeSig> {
    let sig = symbols.type_sig(owner)?;
    Ok(if symbols.is_value_type(owner) {
        sig.by_ref()
    } else {
        sig
    })
}

/// `stub_call_Type_Method` and friends.
#[must_use]
pub fn stub_name(symbols: &dyn SymbolTable, kind: StubKind, method: &MethodDef) -> String {
    let owner = symbols
        .type_def(method.declaring_type)
        .map(|def| def.name.clone())
        .unwrap_or_else(|_| method.declaring_type.to_string());
    format!("{kind}_{owner}_{}", method.name)
}

/// A generated stub.
#[derive(Debug)]
pub struct Stub {
    kind: StubKind,
    target: MethodIdentity,
    native: NativeMethodRc,
}

impl Stub {
    /// Generates the `kind` stub for `method`, bound to `context`.
    ///
    /// # Errors
    /// See [`StubSignature::new`].
    pub fn generate(
        context: &Arc<RunContext>,
        symbols: &dyn SymbolTable,
        kind: StubKind,
        method: &MethodDefRc,
    ) -> Result<Stub> {
        let signature = StubSignature::new(symbols, kind, method)?;
        let name = stub_name(symbols, kind, method);

        let context = Arc::downgrade(context);
        let target = MethodDefRc::clone(method);
        let native = NativeMethod::new(
            name,
            signature.params,
            signature.return_type,
            move |thread, args| {
                let context = upgrade(&context, &target)?;
                dispatch(&context, kind, &target, thread, args)
            },
        );
        Ok(Stub::from_native(kind, method.identity(), native))
    }

    pub(crate) fn from_native(kind: StubKind, target: MethodIdentity, native: NativeMethod) -> Stub {
        Stub {
            kind,
            target,
            native: Arc::new(native),
        }
    }

    /// The stub flavor.
    #[must_use]
    pub fn kind(&self) -> StubKind {
        self.kind
    }

    /// Identity of the method the stub stands in for.
    #[must_use]
    pub fn target(&self) -> &MethodIdentity {
        &self.target
    }

    /// The native callable the rewritten body calls.
    #[must_use]
    pub fn native(&self) -> &NativeMethodRc {
        &self.native
    }

    /// Stub name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.native.name()
    }

    /// The stack signature.
    #[must_use]
    pub fn signature(&self) -> StubSignature {
        StubSignature {
            params: self.native.params().to_vec(),
            return_type: self.native.return_type().clone(),
        }
    }
}

fn upgrade(context: &Weak<RunContext>, target: &MethodDef) -> Result<Arc<RunContext>> {
    context.upgrade().ok_or_else(|| {
        Error::NotSupported(format!(
            "stub for {} invoked after its isolation run ended",
            target.name
        ))
    })
}

fn dispatch(
    context: &Arc<RunContext>,
    kind: StubKind,
    method: &MethodDefRc,
    thread: &mut ExecutionThread<'_>,
    args: Vec<Value>,
) -> Result<Value> {
    if context.config().trace_dispatch {
        log::trace!(
            "{kind} {} with {} argument(s)",
            thread.runtime().symbols().method_name(method.token),
            args.len()
        );
    }

    match kind {
        StubKind::Call => call_direct(context, thread, method, args),
        StubKind::Virtual => call_virtual(context, thread, method, args),
        StubKind::Constrained(constraint) => {
            call_constrained(context, thread, constraint, method, args)
        }
        StubKind::Construct => construct(context, thread, method, args),
        StubKind::FunctionPointer => load_function(context, thread, method),
        StubKind::VirtualFunctionPointer => load_virtual_function(context, thread, method, args),
    }
}

fn call_direct(
    context: &Arc<RunContext>,
    thread: &mut ExecutionThread<'_>,
    method: &MethodDefRc,
    args: Vec<Value>,
) -> Result<Value> {
    let symbols = thread.runtime().symbols();
    let receiver = match args.first() {
        Some(value) if !method.is_static() => Receiver::of(thread, value)?,
        _ => None,
    };

    // Constructor shims build whole instances and only apply to `newobj`. A `call`
    // to a constructor initializes an existing receiver, e.g. a base constructor call.
    if !method.is_constructor() {
        if let Some(shim) = context.shim_for(symbols, method, receiver.as_ref()) {
            return shim.invoke(thread, args);
        }
    }

    let callable = context.implementation(symbols, method, false)?;
    thread.invoke(&callable, args)
}

fn call_virtual(
    context: &Arc<RunContext>,
    thread: &mut ExecutionThread<'_>,
    method: &MethodDefRc,
    mut args: Vec<Value>,
) -> Result<Value> {
    let runtime = thread.runtime();
    let symbols = runtime.symbols();
    let Some(first) = args.first() else {
        return Err(Error::TypeMismatch(format!(
            "virtual call to {} without a receiver",
            method.name
        )));
    };
    let Some(receiver) = Receiver::of(thread, first)? else {
        return Err(thread.null_reference());
    };

    let resolved = match receiver.runtime_type {
        Some(runtime_type) => symbols.resolve_virtual(runtime_type, method)?,
        None => MethodDefRc::clone(method),
    };

    if let Some(shim) = context.shim_for(symbols, &resolved, Some(&receiver)) {
        return shim.invoke(thread, args);
    }

    let interface_dispatch = symbols.type_def(method.declaring_type)?.is_interface();
    let callable = context.implementation(symbols, &resolved, interface_dispatch)?;

    if symbols.is_value_type(resolved.declaring_type) {
        // Rewritten interface bodies unbox an object receiver themselves; everything
        // else on a value type expects a pointer.
        let boxed_receiver = interface_dispatch && matches!(callable, Callable::Dynamic(_));
        args[0] = match (args[0].clone(), boxed_receiver) {
            (Value::ObjectRef(boxed), false) => Value::ManagedPtr(ManagedPointer::to_boxed(boxed)),
            (Value::ManagedPtr(pointer), true) => {
                let value = thread.load(&pointer)?;
                runtime.box_value(resolved.declaring_type, value)?
            }
            (other, _) => other,
        };
    }

    thread.invoke(&callable, args)
}

fn call_constrained(
    context: &Arc<RunContext>,
    thread: &mut ExecutionThread<'_>,
    constraint: Token,
    method: &MethodDefRc,
    mut args: Vec<Value>,
) -> Result<Value> {
    let runtime = thread.runtime();
    let symbols = runtime.symbols();
    let Some(Value::ManagedPtr(pointer)) = args.first().cloned() else {
        return call_virtual(context, thread, method, args);
    };

    if !symbols.is_value_type(constraint) {
        args[0] = thread.load(&pointer)?;
        return call_virtual(context, thread, method, args);
    }

    let resolved = symbols.resolve_virtual(constraint, method)?;
    if resolved.declaring_type == constraint {
        return call_direct(context, thread, &resolved, args);
    }

    let value = thread.load(&pointer)?;
    args[0] = runtime.box_value(constraint, value)?;
    call_virtual(context, thread, method, args)
}

fn construct(
    context: &Arc<RunContext>,
    thread: &mut ExecutionThread<'_>,
    ctor: &MethodDefRc,
    args: Vec<Value>,
) -> Result<Value> {
    let runtime = thread.runtime();
    let symbols = runtime.symbols();

    if let Some(shim) = context.shim_for(symbols, ctor, None) {
        return shim.invoke(thread, args);
    }

    let Callable::Dynamic(body) = context.implementation(symbols, ctor, false)? else {
        return thread.construct(ctor, args);
    };

    let type_token = ctor.declaring_type;
    if symbols.is_value_type(type_token) {
        let initial = runtime.default_value(type_token)?;
        return thread.with_temporary(initial, |thread, pointer| {
            let full = std::iter::once(Value::ManagedPtr(pointer)).chain(args).collect();
            thread.call_dynamic(&body, full).map(|_| ())
        });
    }

    let object = runtime.new_object(type_token)?;
    let full = std::iter::once(object.clone()).chain(args).collect();
    thread.call_dynamic(&body, full)?;
    Ok(object)
}

fn load_function(
    context: &Arc<RunContext>,
    thread: &mut ExecutionThread<'_>,
    method: &MethodDefRc,
) -> Result<Value> {
    let runtime = thread.runtime();
    let callable = context.implementation(runtime.symbols(), method, false)?;
    Ok(Value::FunctionPointer(runtime.function_pointer(callable)))
}

fn load_virtual_function(
    context: &Arc<RunContext>,
    thread: &mut ExecutionThread<'_>,
    method: &MethodDefRc,
    args: Vec<Value>,
) -> Result<Value> {
    let runtime = thread.runtime();
    let symbols = runtime.symbols();
    let receiver = match args.first() {
        Some(value) => Receiver::of(thread, value)?,
        None => None,
    };
    let Some(receiver) = receiver else {
        return Err(thread.null_reference());
    };

    let resolved = match receiver.runtime_type {
        Some(runtime_type) => symbols.resolve_virtual(runtime_type, method)?,
        None => MethodDefRc::clone(method),
    };
    // Delegates bind boxed instances, so value type targets take an object receiver.
    let interface_dispatch = symbols.is_value_type(resolved.declaring_type);
    let callable = context.implementation(symbols, &resolved, interface_dispatch)?;
    Ok(Value::FunctionPointer(runtime.function_pointer(callable)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        builders::{MethodDefBuilder, TypeDefBuilder},
        Module,
    };

    #[test]
    fn kinds_from_instructions() {
        let constraint = Token::new(0x0200_0010);
        assert_eq!(StubKind::for_instruction("call", None), Some(StubKind::Call));
        assert_eq!(
            StubKind::for_instruction("callvirt", Some(constraint)),
            Some(StubKind::Constrained(constraint))
        );
        assert_eq!(
            StubKind::for_instruction("ldvirtftn", None),
            Some(StubKind::VirtualFunctionPointer)
        );
        assert_eq!(StubKind::for_instruction("calli", None), None);

        assert_eq!(StubKind::Constrained(constraint).to_string(), "stub_callvirt");
        assert_eq!(StubKind::Construct.to_string(), "stub_newobj");
        assert!(StubKind::Virtual.is_virtual());
        assert!(!StubKind::FunctionPointer.is_virtual());
    }

    #[test]
    fn signatures() {
        let module = Module::new();
        let corlib = module.corlib().clone();

        let point = TypeDefBuilder::new("Demo", "Point").value_type().build(&module).unwrap();
        let shape = TypeDefBuilder::new("Demo", "IShape").interface().build(&module).unwrap();
        let area = MethodDefBuilder::new("Area")
            .abstract_method()
            .returns(TypeSig::I4)
            .build(&module, shape)
            .unwrap();
        let offset = MethodDefBuilder::new("Offset")
            .param(TypeSig::I4)
            .build(&module, point)
            .unwrap();

        let upper = module.method(corlib.string_to_upper).unwrap();
        let call = StubSignature::new(&module, StubKind::Call, &upper).unwrap();
        assert_eq!(call.params, vec![TypeSig::String]);
        assert_eq!(call.return_type, TypeSig::String);

        let offset = module.method(offset).unwrap();
        let call = StubSignature::new(&module, StubKind::Call, &offset).unwrap();
        assert_eq!(call.params, vec![TypeSig::ValueType(point).by_ref(), TypeSig::I4]);

        let area = module.method(area).unwrap();
        let virtual_call = StubSignature::new(&module, StubKind::Virtual, &area).unwrap();
        assert_eq!(virtual_call.params, vec![TypeSig::Object]);
        let constrained =
            StubSignature::new(&module, StubKind::Constrained(point), &area).unwrap();
        assert_eq!(constrained.params, vec![TypeSig::ValueType(point).by_ref()]);

        let ctor = module.method(corlib.exception_ctor_message).unwrap();
        let construct = StubSignature::new(&module, StubKind::Construct, &ctor).unwrap();
        assert_eq!(construct.params, vec![TypeSig::String]);
        assert_eq!(construct.return_type, TypeSig::Class(corlib.exception));

        let pointer = StubSignature::new(&module, StubKind::VirtualFunctionPointer, &area).unwrap();
        assert_eq!(pointer.params, vec![TypeSig::Object]);
        assert_eq!(pointer.return_type, TypeSig::IntPtr);
    }

    #[test]
    fn invalid_kinds() {
        let module = Module::new();
        let concat = module.method(module.corlib().string_concat).unwrap();
        assert!(matches!(
            StubSignature::new(&module, StubKind::Virtual, &concat),
            Err(Error::NotSupported(_))
        ));
        assert!(matches!(
            StubSignature::new(&module, StubKind::Construct, &concat),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn names() {
        let module = Module::new();
        let corlib = module.corlib();
        let write_line = module.method(corlib.console_write_line_string).unwrap();
        assert_eq!(
            stub_name(&module, StubKind::Call, &write_line),
            "stub_call_Console_WriteLine"
        );
        let ctor = module.method(corlib.object_ctor).unwrap();
        assert_eq!(
            stub_name(&module, StubKind::Construct, &ctor),
            "stub_newobj_Object_.ctor"
        );
    }
}
