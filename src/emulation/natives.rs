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

//! Native implementations of the core library's internal calls.
//!
//! Every member of [`crate::metadata::CoreLibrary`] without a CIL body is backed here.
//! Hosts extend the set through [`Runtime::register_native`].

use crate::{
    emulation::{
        dynamic::{Callable, NativeMethod},
        heap::HeapObject,
        runtime::Runtime,
        thread::ExecutionThread,
        value::Value,
    },
    metadata::{symbols::SymbolTable, token::Token},
    Error, Result,
};

type NativeBody = fn(&mut ExecutionThread<'_>, Vec<Value>) -> Result<Value>;

/// Registers the core library natives with `runtime`.
pub(crate) fn install(runtime: &Runtime) {
    let corlib = runtime.corlib().clone();

    let table: Vec<(Token, NativeBody)> = vec![
        (corlib.object_ctor, object_ctor),
        (corlib.object_to_string, object_to_string),
        (corlib.string_concat, string_concat),
        (corlib.string_to_upper, string_to_upper),
        (corlib.string_length, string_length),
        (corlib.string_equality, string_equality),
        (corlib.console_write_line_string, write_line_string),
        (corlib.console_write_line_int, write_line_int),
        (corlib.exception_message, exception_message),
        (corlib.action_ctor, action_ctor),
        (corlib.action_invoke, action_invoke),
    ];

    let exception_ctors = corlib
        .exception_ctors
        .iter()
        .flat_map(|(_, default_ctor, message_ctor)| {
            [
                (*default_ctor, object_ctor as NativeBody),
                (*message_ctor, exception_ctor_message as NativeBody),
            ]
        });

    for (token, body) in table.into_iter().chain(exception_ctors) {
        match native_for(runtime.symbols(), token, body) {
            Ok(native) => runtime.register_native(token, native),
            Err(error) => log::warn!("core library native {token} not installed: {error}"),
        }
    }
}

fn native_for(symbols: &dyn SymbolTable, token: Token, body: NativeBody) -> Result<NativeMethod> {
    let method = symbols.method(token)?;
    let mut params = Vec::with_capacity(method.params.len() + 1);
    if !method.is_static() {
        params.push(symbols.type_sig(method.declaring_type)?);
    }
    params.extend(method.params.iter().cloned());

    Ok(NativeMethod::new(
        symbols.method_name(token),
        params,
        method.return_type.clone(),
        body,
    ))
}

fn argument(args: &[Value], index: usize) -> Result<&Value> {
    args.get(index)
        .ok_or_else(|| Error::TypeMismatch(format!("missing native argument {index}")))
}

/// The receiver string, raising `NullReferenceException` for null.
fn receiver_string(thread: &ExecutionThread<'_>, args: &[Value]) -> Result<std::sync::Arc<str>> {
    match thread.runtime().string_value(argument(args, 0)?)? {
        Some(value) => Ok(value),
        None => Err(thread.null_reference()),
    }
}

fn object_ctor(_: &mut ExecutionThread<'_>, _: Vec<Value>) -> Result<Value> {
    Ok(Value::Void)
}

fn object_to_string(thread: &mut ExecutionThread<'_>, args: Vec<Value>) -> Result<Value> {
    let receiver = match argument(&args, 0)? {
        Value::ManagedPtr(pointer) => thread.load(pointer)?,
        other => other.clone(),
    };
    let text = display(thread.runtime(), &receiver)?;
    match text {
        Some(text) => thread.runtime().alloc_string(&text),
        None => Err(thread.null_reference()),
    }
}

/// What `Object::ToString` produces for a value, `None` for null.
pub(crate) fn display(runtime: &Runtime, value: &Value) -> Result<Option<String>> {
    let core = runtime.symbols().core_types();
    Ok(Some(match value {
        Value::Null => return Ok(None),
        Value::ObjectRef(object) => match runtime.heap().get(*object)? {
            HeapObject::String(text) => text.to_string(),
            HeapObject::Boxed { type_token, value } => {
                if type_token == core.boolean {
                    String::from(if value.is_true() { "True" } else { "False" })
                } else if type_token == core.char {
                    let code = u32::try_from(value.as_i4()?).unwrap_or(0xFFFD);
                    char::from_u32(code).unwrap_or('\u{FFFD}').to_string()
                } else {
                    return display(runtime, value.as_ref());
                }
            }
            HeapObject::Array { element_type, .. } => format!("{element_type}[]"),
            HeapObject::Object { type_token, .. } | HeapObject::Delegate { type_token, .. } => {
                runtime.type_name(type_token)
            }
        },
        Value::I4(value) => value.to_string(),
        Value::I8(value) | Value::IntPtr(value) => value.to_string(),
        Value::R8(value) => value.to_string(),
        Value::ValueType { type_token, .. } => runtime.type_name(*type_token),
        other => other.to_string(),
    }))
}

fn string_concat(thread: &mut ExecutionThread<'_>, args: Vec<Value>) -> Result<Value> {
    let runtime = thread.runtime();
    let left = runtime.string_value(argument(&args, 0)?)?;
    let right = runtime.string_value(argument(&args, 1)?)?;
    let mut joined = String::new();
    joined.push_str(left.as_deref().unwrap_or_default());
    joined.push_str(right.as_deref().unwrap_or_default());
    runtime.alloc_string(&joined)
}

fn string_to_upper(thread: &mut ExecutionThread<'_>, args: Vec<Value>) -> Result<Value> {
    let value = receiver_string(thread, &args)?;
    thread.runtime().alloc_string(&value.to_uppercase())
}

fn string_length(thread: &mut ExecutionThread<'_>, args: Vec<Value>) -> Result<Value> {
    let value = receiver_string(thread, &args)?;
    let length = i32::try_from(value.encode_utf16().count())
        .map_err(|_| Error::NotSupported("string length exceeds int32".to_string()))?;
    Ok(Value::I4(length))
}

fn string_equality(thread: &mut ExecutionThread<'_>, args: Vec<Value>) -> Result<Value> {
    let runtime = thread.runtime();
    let left = runtime.string_value(argument(&args, 0)?)?;
    let right = runtime.string_value(argument(&args, 1)?)?;
    Ok(Value::from(left == right))
}

fn write_line_string(thread: &mut ExecutionThread<'_>, args: Vec<Value>) -> Result<Value> {
    let runtime = thread.runtime();
    let line = runtime.string_value(argument(&args, 0)?)?;
    runtime.console().write_line(line.as_deref().unwrap_or_default())?;
    Ok(Value::Void)
}

fn write_line_int(thread: &mut ExecutionThread<'_>, args: Vec<Value>) -> Result<Value> {
    let value = argument(&args, 0)?.as_i4()?;
    thread.runtime().console().write_line(&value.to_string())?;
    Ok(Value::Void)
}

fn exception_ctor_message(thread: &mut ExecutionThread<'_>, args: Vec<Value>) -> Result<Value> {
    let runtime = thread.runtime();
    let Some(exception) = argument(&args, 0)?.as_object()? else {
        return Err(thread.null_reference());
    };
    let message = argument(&args, 1)?.clone();
    runtime
        .heap()
        .set_field(exception, runtime.corlib().exception_message_field, message)?;
    Ok(Value::Void)
}

fn exception_message(thread: &mut ExecutionThread<'_>, args: Vec<Value>) -> Result<Value> {
    let runtime = thread.runtime();
    let Some(exception) = argument(&args, 0)?.as_object()? else {
        return Err(thread.null_reference());
    };
    let (_, message) = runtime.describe_exception(exception)?;
    runtime.alloc_string(&message)
}

fn action_ctor(thread: &mut ExecutionThread<'_>, args: Vec<Value>) -> Result<Value> {
    let runtime = thread.runtime();
    let Some(delegate) = argument(&args, 0)?.as_object()? else {
        return Err(thread.null_reference());
    };
    let target = argument(&args, 1)?.clone();
    let Value::FunctionPointer(method) = argument(&args, 2)? else {
        return Err(Error::TypeMismatch(format!(
            "delegate constructor expects a function pointer, found {}",
            argument(&args, 2)?
        )));
    };
    let method = *method;
    let type_token = runtime.corlib().action;

    runtime.heap().with_object_mut(delegate, |object| {
        *object = HeapObject::Delegate {
            type_token,
            target,
            method,
        };
        Ok(())
    })?;
    Ok(Value::Void)
}

fn action_invoke(thread: &mut ExecutionThread<'_>, args: Vec<Value>) -> Result<Value> {
    let runtime = thread.runtime();
    let Some(delegate) = argument(&args, 0)?.as_object()? else {
        return Err(thread.null_reference());
    };
    let HeapObject::Delegate { target, method, .. } = runtime.heap().get(delegate)? else {
        return Err(Error::TypeMismatch(format!("{delegate} is not a delegate")));
    };

    let callable = runtime.resolve_function_pointer(method)?;
    let call_args = if callable.has_this() || !target.is_null() {
        vec![target]
    } else {
        Vec::new()
    };

    match &callable {
        Callable::Method(method) if method.is_virtual() => {
            let method = method.clone();
            thread.call_virtual(&method, call_args)
        }
        _ => thread.invoke(&callable, call_args),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::metadata::Module;

    fn call(runtime: &Runtime, method: Token, args: Vec<Value>) -> Result<Value> {
        let native = runtime
            .native(method)
            .ok_or_else(|| Error::MethodNotFound(method.to_string()))?;
        ExecutionThread::new(runtime).call_native(&native, args)
    }

    #[test]
    fn strings() -> Result<()> {
        let runtime = Runtime::new(Arc::new(Module::new()));
        let corlib = runtime.corlib().clone();

        let hello = runtime.alloc_string("hello ")?;
        let world = runtime.alloc_string("world")?;
        let joined = call(&runtime, corlib.string_concat, vec![hello, world.clone()])?;
        assert_eq!(runtime.string_value(&joined)?.as_deref(), Some("hello world"));

        let upper = call(&runtime, corlib.string_to_upper, vec![joined.clone()])?;
        assert_eq!(runtime.string_value(&upper)?.as_deref(), Some("HELLO WORLD"));
        assert_eq!(call(&runtime, corlib.string_length, vec![joined])?, Value::I4(11));

        let again = runtime.alloc_string("world")?;
        assert_eq!(call(&runtime, corlib.string_equality, vec![world, again])?, Value::I4(1));
        assert_eq!(
            call(&runtime, corlib.string_equality, vec![Value::Null, Value::Null])?,
            Value::I4(1)
        );

        let with_null = call(&runtime, corlib.string_concat, vec![Value::Null, upper])?;
        assert_eq!(runtime.string_value(&with_null)?.as_deref(), Some("HELLO WORLD"));
        assert!(matches!(
            call(&runtime, corlib.string_to_upper, vec![Value::Null]),
            Err(Error::Thrown(_))
        ));
        Ok(())
    }

    #[test]
    fn console_capture() -> Result<()> {
        let runtime = Runtime::new(Arc::new(Module::new()));
        let corlib = runtime.corlib().clone();
        let text = runtime.alloc_string("line")?;

        call(&runtime, corlib.console_write_line_string, vec![text])?;
        call(&runtime, corlib.console_write_line_int, vec![Value::I4(-4)])?;
        call(&runtime, corlib.console_write_line_string, vec![Value::Null])?;
        assert_eq!(runtime.console().lines(), vec!["line", "-4", ""]);
        Ok(())
    }

    #[test]
    fn to_string_of_boxes() -> Result<()> {
        let runtime = Runtime::new(Arc::new(Module::new()));
        let corlib = runtime.corlib().clone();

        let boxed = runtime.box_value(corlib.int32, Value::I4(12))?;
        let text = call(&runtime, corlib.object_to_string, vec![boxed])?;
        assert_eq!(runtime.string_value(&text)?.as_deref(), Some("12"));

        let flag = runtime.box_value(corlib.boolean, Value::I4(1))?;
        let text = call(&runtime, corlib.object_to_string, vec![flag])?;
        assert_eq!(runtime.string_value(&text)?.as_deref(), Some("True"));

        let object = runtime.new_object(corlib.object)?;
        let text = call(&runtime, corlib.object_to_string, vec![object])?;
        assert_eq!(runtime.string_value(&text)?.as_deref(), Some("System.Object"));
        Ok(())
    }

    #[test]
    fn exception_messages() -> Result<()> {
        let runtime = Runtime::new(Arc::new(Module::new()));
        let corlib = runtime.corlib().clone();

        let exception = runtime.new_object(corlib.exception)?;
        let message = runtime.alloc_string("bad state")?;
        call(&runtime, corlib.exception_ctor_message, vec![exception.clone(), message])?;
        let text = call(&runtime, corlib.exception_message, vec![exception])?;
        assert_eq!(runtime.string_value(&text)?.as_deref(), Some("bad state"));
        Ok(())
    }
}
