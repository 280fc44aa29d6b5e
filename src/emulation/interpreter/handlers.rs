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

//! Instruction handlers for calls, objects, fields and arrays.
//!
//! - **Calls**: `call`, `callvirt` (with `constrained.`), `newobj`, `ldftn`,
//!   `ldvirtftn` and `calli`, including `0x7F` tokens of dynamic bodies
//! - **Fields**: `ldfld`, `ldflda`, `stfld`
//! - **Types**: `box`, `unbox`, `unbox.any`, `castclass`, `isinst`
//! - **Arrays**: `newarr`, `ldlen`, `ldelema`, `ldelem*`, `stelem*`

use crate::{
    assembly::Instruction,
    emulation::{
        dynamic::{Callable, NativeMethodRc, ScopeEntry},
        heap::HeapObject,
        interpreter::{pop, pop_args, token, Interpreter},
        runtime::Runtime,
        thread::ExecutionThread,
        value::{HeapRef, ManagedPointer, Value},
    },
    metadata::{
        method::MethodDefRc,
        symbols::StandAloneSignature,
        token::Token,
        typesystem::TypeSig,
    },
    Error, Result,
};

/// What a call-family token resolves to.
enum CallTarget {
    /// A member of the symbol table, called with the instruction's own semantics
    Method(MethodDefRc),
    /// A scope-registered native, always called directly with its declared signature
    Native(NativeMethodRc),
}

impl Interpreter<'_> {
    fn resolve_call(&self, runtime: &Runtime, token: Token) -> Result<CallTarget> {
        if !token.is_dynamic() {
            return Ok(CallTarget::Method(runtime.symbols().method(token)?));
        }

        match self.scope.and_then(|scope| scope.get(token)) {
            Some(ScopeEntry::Native(native)) => Ok(CallTarget::Native(NativeMethodRc::clone(native))),
            Some(ScopeEntry::Member(member)) => {
                Ok(CallTarget::Method(runtime.symbols().method(*member)?))
            }
            None => Err(malformed_error!("Dynamic token {} is not in scope", token)),
        }
    }

    pub(super) fn load_string(
        &mut self,
        thread: &mut ExecutionThread<'_>,
        instruction: &Instruction,
        stack: &mut Vec<Value>,
    ) -> Result<()> {
        let runtime = thread.runtime();
        let text = runtime.symbols().user_string(token(instruction)?)?;
        stack.push(runtime.alloc_string(&text)?);
        Ok(())
    }

    /// `call`, `callvirt`, `newobj`, `ldftn` and `ldvirtftn`.
    pub(super) fn call(
        &mut self,
        thread: &mut ExecutionThread<'_>,
        instruction: &Instruction,
        stack: &mut Vec<Value>,
        constrained: Option<Token>,
    ) -> Result<()> {
        let runtime = thread.runtime();
        let offset = instruction.offset;

        let method = match self.resolve_call(runtime, token(instruction)?)? {
            CallTarget::Native(native) => {
                let args = pop_args(stack, native.params().len(), offset)?;
                let result = thread.call_native(&native, args)?;
                if *native.return_type() != TypeSig::Void {
                    stack.push(result);
                }
                return Ok(());
            }
            CallTarget::Method(method) => method,
        };

        match instruction.mnemonic {
            "newobj" => {
                let args = pop_args(stack, method.params.len(), offset)?;
                let object = thread.construct(&method, args)?;
                stack.push(object);
            }
            "ldftn" => {
                let pointer = runtime.function_pointer(Callable::Method(method));
                stack.push(Value::FunctionPointer(pointer));
            }
            "ldvirtftn" => {
                let receiver = pop(stack, offset)?;
                if receiver.is_null() {
                    return Err(thread.null_reference());
                }
                let target = match runtime.runtime_type(&receiver)? {
                    Some(runtime_type) => runtime.symbols().resolve_virtual(runtime_type, &method)?,
                    None => method,
                };
                let pointer = runtime.function_pointer(Callable::Method(target));
                stack.push(Value::FunctionPointer(pointer));
            }
            mnemonic => {
                let signature = method.signature();
                let args = pop_args(stack, signature.stack_pops(), offset)?;
                let result = match (mnemonic, constrained) {
                    ("callvirt", Some(constraint)) => {
                        constrained_call(thread, constraint, &method, args)?
                    }
                    ("callvirt", None) => thread.call_virtual(&method, args)?,
                    _ => thread.call_method(&method, args)?,
                };
                if signature.has_result() {
                    stack.push(result);
                }
            }
        }
        Ok(())
    }

    /// `calli` through a function pointer.
    pub(super) fn call_indirect(
        &mut self,
        thread: &mut ExecutionThread<'_>,
        instruction: &Instruction,
        stack: &mut Vec<Value>,
    ) -> Result<()> {
        let runtime = thread.runtime();
        let offset = instruction.offset;
        let signature = runtime.symbols().standalone_signature(token(instruction)?)?;
        let StandAloneSignature::Method(call_site) = signature.as_ref() else {
            return Err(malformed_error!(
                "IL_{:04X}: calli needs a call-site signature",
                offset
            ));
        };

        let Value::FunctionPointer(pointer) = pop(stack, offset)? else {
            return Err(Error::TypeMismatch(format!(
                "IL_{offset:04X}: calli expects a function pointer"
            )));
        };
        let args = pop_args(stack, call_site.stack_pops(), offset)?;
        let callable = runtime.resolve_function_pointer(pointer)?;
        let result = thread.invoke(&callable, args)?;
        if call_site.has_result() {
            stack.push(result);
        }
        Ok(())
    }

    pub(super) fn load_field(
        &mut self,
        thread: &mut ExecutionThread<'_>,
        instruction: &Instruction,
        stack: &mut Vec<Value>,
    ) -> Result<()> {
        let runtime = thread.runtime();
        let field = token(instruction)?;
        let receiver = pop(stack, instruction.offset)?;

        let value = match receiver {
            Value::Null => return Err(thread.null_reference()),
            Value::ObjectRef(object) => object_field(runtime, object, field)?,
            Value::ManagedPtr(pointer) => match thread.load(&pointer)? {
                Value::ObjectRef(object) => object_field(runtime, object, field)?,
                Value::Null => return Err(thread.null_reference()),
                instance => instance.field(field)?.clone(),
            },
            instance @ Value::ValueType { .. } => instance.field(field)?.clone(),
            other => {
                return Err(Error::TypeMismatch(format!(
                    "IL_{:04X}: ldfld on {other}",
                    instruction.offset
                )))
            }
        };
        stack.push(value);
        Ok(())
    }

    pub(super) fn load_field_address(
        &mut self,
        thread: &mut ExecutionThread<'_>,
        instruction: &Instruction,
        stack: &mut Vec<Value>,
    ) -> Result<()> {
        let field = token(instruction)?;
        let pointer = match pop(stack, instruction.offset)? {
            Value::Null => return Err(thread.null_reference()),
            Value::ObjectRef(object) => ManagedPointer::to_object_field(object, field),
            Value::ManagedPtr(pointer) => pointer.to_value_field(field),
            other => {
                return Err(Error::TypeMismatch(format!(
                    "IL_{:04X}: ldflda on {other}",
                    instruction.offset
                )))
            }
        };
        stack.push(Value::ManagedPtr(pointer));
        Ok(())
    }

    pub(super) fn store_field(
        &mut self,
        thread: &mut ExecutionThread<'_>,
        instruction: &Instruction,
        stack: &mut Vec<Value>,
    ) -> Result<()> {
        let field = token(instruction)?;
        let value = pop(stack, instruction.offset)?;
        match pop(stack, instruction.offset)? {
            Value::Null => Err(thread.null_reference()),
            Value::ObjectRef(object) => thread.runtime().heap().set_field(object, field, value),
            Value::ManagedPtr(pointer) => thread.store(&pointer.to_value_field(field), value),
            other => Err(Error::TypeMismatch(format!(
                "IL_{:04X}: stfld on {other}",
                instruction.offset
            ))),
        }
    }

    pub(super) fn box_value(
        &mut self,
        thread: &mut ExecutionThread<'_>,
        instruction: &Instruction,
        stack: &mut Vec<Value>,
    ) -> Result<()> {
        let value = pop(stack, instruction.offset)?;
        stack.push(thread.runtime().box_value(token(instruction)?, value)?);
        Ok(())
    }

    pub(super) fn unbox(
        &mut self,
        thread: &mut ExecutionThread<'_>,
        instruction: &Instruction,
        stack: &mut Vec<Value>,
    ) -> Result<()> {
        let type_token = token(instruction)?;
        let object = boxed_instance(thread, pop(stack, instruction.offset)?, type_token)?;
        stack.push(Value::ManagedPtr(ManagedPointer::to_boxed(object)));
        Ok(())
    }

    pub(super) fn unbox_any(
        &mut self,
        thread: &mut ExecutionThread<'_>,
        instruction: &Instruction,
        stack: &mut Vec<Value>,
    ) -> Result<()> {
        let type_token = token(instruction)?;
        let value = pop(stack, instruction.offset)?;

        if !thread.runtime().symbols().is_value_type(type_token) {
            if !value.is_null() && !is_instance(thread.runtime(), &value, type_token)? {
                return Err(cast_error(thread, &value, type_token));
            }
            stack.push(value);
            return Ok(());
        }

        let object = boxed_instance(thread, value, type_token)?;
        let (_, payload) = thread.runtime().heap().unbox(object)?;
        stack.push(payload);
        Ok(())
    }

    /// `castclass` and `isinst`.
    pub(super) fn cast(
        &mut self,
        thread: &mut ExecutionThread<'_>,
        instruction: &Instruction,
        stack: &mut Vec<Value>,
    ) -> Result<()> {
        let type_token = token(instruction)?;
        let value = pop(stack, instruction.offset)?;
        if value.is_null() || is_instance(thread.runtime(), &value, type_token)? {
            stack.push(value);
        } else if instruction.mnemonic == "isinst" {
            stack.push(Value::Null);
        } else {
            return Err(cast_error(thread, &value, type_token));
        }
        Ok(())
    }

    pub(super) fn new_array(
        &mut self,
        thread: &mut ExecutionThread<'_>,
        instruction: &Instruction,
        stack: &mut Vec<Value>,
    ) -> Result<()> {
        let runtime = thread.runtime();
        let length = pop(stack, instruction.offset)?.as_i8()?;
        let Ok(length) = usize::try_from(length) else {
            return Err(thread.throw(runtime.corlib().overflow_exception, None));
        };

        let element_type = runtime.symbols().type_sig(token(instruction)?)?;
        let zero = Value::default_for(&element_type, runtime.symbols());
        let array = runtime
            .heap()
            .alloc_array(element_type, vec![zero; length])?;
        stack.push(Value::ObjectRef(array));
        Ok(())
    }

    pub(super) fn array_length(
        &mut self,
        thread: &mut ExecutionThread<'_>,
        instruction: &Instruction,
        stack: &mut Vec<Value>,
    ) -> Result<()> {
        let Some(array) = pop(stack, instruction.offset)?.as_object()? else {
            return Err(thread.null_reference());
        };
        let length = thread.runtime().heap().get_array_length(array)?;
        stack.push(Value::IntPtr(i64::try_from(length).unwrap_or(i64::MAX)));
        Ok(())
    }

    pub(super) fn element_address(
        &mut self,
        thread: &mut ExecutionThread<'_>,
        instruction: &Instruction,
        stack: &mut Vec<Value>,
    ) -> Result<()> {
        let (array, index) = array_access(thread, stack, instruction.offset)?;
        stack.push(Value::ManagedPtr(ManagedPointer::to_array_element(array, index)));
        Ok(())
    }

    /// `ldelem` and its sized forms.
    pub(super) fn load_element(
        &mut self,
        thread: &mut ExecutionThread<'_>,
        instruction: &Instruction,
        stack: &mut Vec<Value>,
    ) -> Result<()> {
        let (array, index) = array_access(thread, stack, instruction.offset)?;
        let value = thread.load(&ManagedPointer::to_array_element(array, index))?;
        stack.push(value);
        Ok(())
    }

    /// `stelem` and its sized forms.
    pub(super) fn store_element(
        &mut self,
        thread: &mut ExecutionThread<'_>,
        instruction: &Instruction,
        stack: &mut Vec<Value>,
    ) -> Result<()> {
        let value = pop(stack, instruction.offset)?;
        let (array, index) = array_access(thread, stack, instruction.offset)?;
        thread.store(&ManagedPointer::to_array_element(array, index), value)
    }
}

/// Calls `method` on a receiver passed by pointer under a `constrained.` prefix.
///
/// Reference types are dereferenced and called virtually. Value types that implement
/// the method themselves receive the pointer; otherwise the value is boxed first.
fn constrained_call(
    thread: &mut ExecutionThread<'_>,
    constraint: Token,
    method: &MethodDefRc,
    mut args: Vec<Value>,
) -> Result<Value> {
    let runtime = thread.runtime();
    let symbols = runtime.symbols();
    let Some(Value::ManagedPtr(pointer)) = args.first().cloned() else {
        return thread.call_virtual(method, args);
    };

    if !symbols.is_value_type(constraint) {
        args[0] = thread.load(&pointer)?;
        return thread.call_virtual(method, args);
    }

    let target = symbols.resolve_virtual(constraint, method)?;
    if target.declaring_type == constraint {
        return thread.call_method(&target, args);
    }

    let value = thread.load(&pointer)?;
    args[0] = runtime.box_value(constraint, value)?;
    thread.call_virtual(method, args)
}

fn object_field(runtime: &Runtime, object: HeapRef, field: Token) -> Result<Value> {
    runtime
        .heap()
        .get_field(object, field, runtime.field_default(field)?)
}

fn is_instance(runtime: &Runtime, value: &Value, type_token: Token) -> Result<bool> {
    Ok(match runtime.runtime_type(value)? {
        Some(runtime_type) => runtime.symbols().is_subtype_of(runtime_type, type_token),
        None => false,
    })
}

fn cast_error(thread: &ExecutionThread<'_>, value: &Value, type_token: Token) -> Error {
    let runtime = thread.runtime();
    let source = runtime
        .runtime_type(value)
        .ok()
        .flatten()
        .map_or_else(|| value.to_string(), |token| runtime.type_name(token));
    thread.invalid_cast(&format!(
        "Unable to cast object of type '{source}' to type '{}'.",
        runtime.type_name(type_token)
    ))
}

/// The box behind `value`, checked to hold a `type_token`.
fn boxed_instance(thread: &ExecutionThread<'_>, value: Value, type_token: Token) -> Result<HeapRef> {
    let Some(object) = value.as_object()? else {
        return Err(thread.null_reference());
    };
    match thread.runtime().heap().get(object)? {
        HeapObject::Boxed {
            type_token: boxed, ..
        } if boxed == type_token => Ok(object),
        _ => Err(cast_error(thread, &value, type_token)),
    }
}

/// Pops an index and an array reference, checking null and bounds.
fn array_access(
    thread: &ExecutionThread<'_>,
    stack: &mut Vec<Value>,
    offset: u64,
) -> Result<(HeapRef, usize)> {
    let index = pop(stack, offset)?.as_i8()?;
    let Some(array) = pop(stack, offset)?.as_object()? else {
        return Err(thread.null_reference());
    };
    let length = thread.runtime().heap().get_array_length(array)?;
    match usize::try_from(index) {
        Ok(index) if index < length => Ok((array, index)),
        _ => Err(thread.index_out_of_range()),
    }
}
