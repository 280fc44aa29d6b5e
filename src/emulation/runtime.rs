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

//! The execution substrate shared by every thread.
//!
//! A [`Runtime`] binds a [`Module`] to the state managed code mutates: the heap, static
//! fields and the console capture. It also holds the native implementations of
//! internal calls, the decoded-body cache and the function pointer table `ldftn`
//! hands out handles from.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use dotshim::emulation::{Runtime, Value};
//! use dotshim::metadata::{
//!     builders::{MethodBodyBuilder, MethodDefBuilder, TypeDefBuilder},
//!     Module, TypeSig,
//! };
//!
//! let module = Arc::new(Module::new());
//! let program = TypeDefBuilder::new("Demo", "Program").build(&module)?;
//! let answer = MethodDefBuilder::new("Answer")
//!     .static_method()
//!     .returns(TypeSig::I4)
//!     .body(MethodBodyBuilder::new().implementation(|asm| {
//!         asm.ldc_i4(42)?.ret()?;
//!         Ok(())
//!     }))
//!     .build(&module, program)?;
//!
//! let runtime = Runtime::new(module);
//! assert_eq!(runtime.invoke(answer, vec![])?, Value::I4(42));
//! # Ok::<(), dotshim::Error>(())
//! ```

use std::{collections::HashMap, sync::Arc};

use dashmap::DashMap;

use crate::{
    assembly::{decode_method, DecodedMethod},
    emulation::{
        capture::ConsoleCapture,
        config::RuntimeLimits,
        dynamic::{Callable, NativeMethod, NativeMethodRc},
        heap::{HeapObject, ManagedHeap},
        natives,
        statics::StaticFieldStorage,
        thread::ExecutionThread,
        value::{FunctionPointer, HeapRef, Value},
    },
    metadata::{
        method::MethodDef, symbols::SymbolTable, token::Token, typesystem::TypeSig, CoreLibrary,
        ModuleRc,
    },
    Error, Result,
};

/// A reference-counted runtime
pub type RuntimeRc = Arc<Runtime>;

/// Heap, statics, natives and caches of one module.
pub struct Runtime {
    module: ModuleRc,
    heap: ManagedHeap,
    statics: StaticFieldStorage,
    console: ConsoleCapture,
    natives: DashMap<Token, NativeMethodRc>,
    bodies: DashMap<Token, Arc<DecodedMethod>>,
    function_pointers: boxcar::Vec<Callable>,
    limits: RuntimeLimits,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("natives", &self.natives.len())
            .field("decoded_bodies", &self.bodies.len())
            .field("function_pointers", &self.function_pointers.count())
            .field("console_lines", &self.console.len())
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Creates a runtime with default limits and the core library natives installed.
    #[must_use]
    pub fn new(module: ModuleRc) -> Runtime {
        Self::with_limits(module, RuntimeLimits::default())
    }

    /// Creates a runtime with explicit limits.
    #[must_use]
    pub fn with_limits(module: ModuleRc, limits: RuntimeLimits) -> Runtime {
        let runtime = Runtime {
            module,
            heap: ManagedHeap::new(limits.max_heap_objects),
            statics: StaticFieldStorage::new(),
            console: ConsoleCapture::new(),
            natives: DashMap::new(),
            bodies: DashMap::new(),
            function_pointers: boxcar::Vec::new(),
            limits,
        };
        natives::install(&runtime);
        runtime
    }

    /// The module this runtime executes.
    #[must_use]
    pub fn module(&self) -> &ModuleRc {
        &self.module
    }

    /// The module as a symbol table.
    #[must_use]
    pub fn symbols(&self) -> &dyn SymbolTable {
        self.module.as_ref()
    }

    /// Tokens of the core library.
    #[must_use]
    pub fn corlib(&self) -> &CoreLibrary {
        self.module.corlib()
    }

    /// The managed heap.
    #[must_use]
    pub fn heap(&self) -> &ManagedHeap {
        &self.heap
    }

    /// Static field storage.
    #[must_use]
    pub fn statics(&self) -> &StaticFieldStorage {
        &self.statics
    }

    /// Lines written through `System.Console`.
    #[must_use]
    pub fn console(&self) -> &ConsoleCapture {
        &self.console
    }

    /// Execution limits.
    #[must_use]
    pub fn limits(&self) -> &RuntimeLimits {
        &self.limits
    }

    /// Backs `method` with a native implementation, replacing any previous one.
    pub fn register_native(&self, method: Token, native: NativeMethod) {
        self.natives.insert(method, Arc::new(native));
    }

    /// The native implementation of `method`, if one is registered.
    #[must_use]
    pub fn native(&self, method: Token) -> Option<NativeMethodRc> {
        self.natives.get(&method).map(|entry| Arc::clone(entry.value()))
    }

    /// The decoded body of `method`, decoded once and cached.
    ///
    /// # Errors
    /// Returns the errors of [`decode_method`].
    pub fn decoded(&self, method: &MethodDef) -> Result<Arc<DecodedMethod>> {
        if let Some(decoded) = self.bodies.get(&method.token) {
            return Ok(Arc::clone(decoded.value()));
        }

        let decoded = Arc::new(decode_method(self.symbols(), method)?);
        log::trace!(
            "decoded {} ({} instructions)",
            self.symbols().method_name(method.token),
            decoded.instructions.len()
        );
        Ok(Arc::clone(
            self.bodies.entry(method.token).or_insert(decoded).value(),
        ))
    }

    /// Registers a callable in the function table and returns its handle.
    pub fn function_pointer(&self, callable: Callable) -> FunctionPointer {
        FunctionPointer(self.function_pointers.push(callable) as u64)
    }

    /// The callable behind a function pointer.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for handles this runtime never issued.
    pub fn resolve_function_pointer(&self, pointer: FunctionPointer) -> Result<Callable> {
        usize::try_from(pointer.id())
            .ok()
            .and_then(|index| self.function_pointers.get(index))
            .cloned()
            .ok_or_else(|| Error::TypeMismatch(format!("unknown function pointer {pointer}")))
    }

    /// Allocates a string and returns a reference to it.
    ///
    /// # Errors
    /// Fails when the heap object limit is reached.
    pub fn alloc_string(&self, value: &str) -> Result<Value> {
        Ok(Value::ObjectRef(self.heap.alloc_string(value)?))
    }

    /// The contents of a string reference, `None` for null.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] if the value is not a string reference.
    pub fn string_value(&self, value: &Value) -> Result<Option<Arc<str>>> {
        match value.as_object()? {
            Some(object) => Ok(Some(self.heap.get_string(object)?)),
            None => Ok(None),
        }
    }

    /// A zeroed instance of `type_token`: a heap object for reference types, an unboxed
    /// value for value types.
    ///
    /// # Errors
    /// Fails when the heap object limit is reached.
    pub fn new_object(&self, type_token: Token) -> Result<Value> {
        let symbols = self.symbols();
        if symbols.is_value_type(type_token) {
            return Ok(Value::default_for(&symbols.type_sig(type_token)?, symbols));
        }

        let fields: HashMap<Token, Value> = symbols
            .instance_fields(type_token)
            .iter()
            .map(|field| (field.token, Value::default_for(&field.signature, symbols)))
            .collect();
        Ok(Value::ObjectRef(self.heap.alloc_object(type_token, fields)?))
    }

    /// Allocates an exception object of `type_token` with an optional message.
    ///
    /// # Errors
    /// Fails when the heap object limit is reached.
    pub fn new_exception(&self, type_token: Token, message: Option<&str>) -> Result<HeapRef> {
        let exception = self.new_object(type_token)?.as_object()?.ok_or_else(|| {
            Error::TypeMismatch(format!("exception type {type_token} is a value type"))
        })?;
        if let Some(message) = message {
            let message = self.alloc_string(message)?;
            self.heap
                .set_field(exception, self.corlib().exception_message_field, message)?;
        }
        Ok(exception)
    }

    /// The type name and message of an exception object.
    ///
    /// Exceptions without an explicit message report the default
    /// `Exception of type '...' was thrown.` text.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for dangling references.
    pub fn describe_exception(&self, exception: HeapRef) -> Result<(String, String)> {
        let core = self.symbols().core_types();
        let type_token = self.heap.get_type_token(exception, &core)?;
        let type_name = self.type_name(type_token);

        let message = match self.heap.get(exception)? {
            HeapObject::Object { fields, .. } => {
                match fields.get(&self.corlib().exception_message_field) {
                    Some(message) => self.string_value(message)?,
                    None => None,
                }
            }
            _ => None,
        };
        let message = match message {
            Some(message) => message.to_string(),
            None => format!("Exception of type '{type_name}' was thrown."),
        };
        Ok((type_name, message))
    }

    /// `Namespace.Name` of a type, or the token for unknown types.
    #[must_use]
    pub fn type_name(&self, type_token: Token) -> String {
        self.symbols()
            .type_def(type_token)
            .map(|def| def.full_name())
            .unwrap_or_else(|_| type_token.to_string())
    }

    /// The runtime type of a value, `None` for null and untyped values.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for dangling references.
    pub fn runtime_type(&self, value: &Value) -> Result<Option<Token>> {
        let core = self.symbols().core_types();
        Ok(match value {
            Value::ObjectRef(object) => Some(self.heap.get_type_token(*object, &core)?),
            Value::ValueType { type_token, .. } => Some(*type_token),
            Value::I4(_) => Some(core.int32),
            Value::I8(_) | Value::IntPtr(_) => Some(core.int64),
            Value::R8(_) => Some(core.double),
            Value::Void
            | Value::Null
            | Value::ManagedPtr(_)
            | Value::FunctionPointer(_) => None,
        })
    }

    /// The zero value of a field's declared type.
    ///
    /// # Errors
    /// Returns [`Error::FieldNotFound`] for unknown fields.
    pub fn field_default(&self, field: Token) -> Result<Value> {
        let def = self.symbols().field(field)?;
        Ok(Value::default_for(&def.signature, self.symbols()))
    }

    /// The current value of a static field, zero until first written.
    ///
    /// # Errors
    /// Returns [`Error::FieldNotFound`] for unknown fields.
    pub fn load_static(&self, field: Token) -> Result<Value> {
        match self.statics.get(field)? {
            Some(value) => Ok(value),
            None => self.field_default(field),
        }
    }

    /// Boxes a value of `type_token`; reference type values are returned unchanged.
    ///
    /// # Errors
    /// Fails when the heap object limit is reached.
    pub fn box_value(&self, type_token: Token, value: Value) -> Result<Value> {
        if !self.symbols().is_value_type(type_token) {
            return Ok(value);
        }
        Ok(Value::ObjectRef(self.heap.alloc_boxed(type_token, value)?))
    }

    /// The zero value of a type token.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] for unknown types.
    pub fn default_value(&self, type_token: Token) -> Result<Value> {
        let signature: TypeSig = self.symbols().type_sig(type_token)?;
        Ok(Value::default_for(&signature, self.symbols()))
    }

    /// Runs a method to completion on a fresh thread.
    ///
    /// # Errors
    /// Returns [`Error::ManagedException`] for unhandled managed exceptions and any
    /// runtime error raised while executing.
    pub fn invoke(&self, method: Token, args: Vec<Value>) -> Result<Value> {
        let method = self.symbols().method(method)?;
        ExecutionThread::new(self).run(&Callable::Method(method), args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Module;

    fn runtime() -> Runtime {
        Runtime::new(Arc::new(Module::new()))
    }

    #[test]
    fn corlib_natives_are_installed() {
        let runtime = runtime();
        let corlib = runtime.corlib().clone();
        assert!(runtime.native(corlib.object_ctor).is_some());
        assert!(runtime.native(corlib.console_write_line_int).is_some());
        assert!(runtime.native(corlib.action_invoke).is_some());
        for (_, default_ctor, message_ctor) in &corlib.exception_ctors {
            assert!(runtime.native(*default_ctor).is_some());
            assert!(runtime.native(*message_ctor).is_some());
        }
    }

    #[test]
    fn exceptions_describe_themselves() -> Result<()> {
        let runtime = runtime();
        let corlib = runtime.corlib().clone();

        let plain = runtime.new_exception(corlib.invalid_operation_exception, None)?;
        let (type_name, message) = runtime.describe_exception(plain)?;
        assert_eq!(type_name, "System.InvalidOperationException");
        assert_eq!(
            message,
            "Exception of type 'System.InvalidOperationException' was thrown."
        );

        let explicit = runtime.new_exception(corlib.exception, Some("boom"))?;
        assert_eq!(runtime.describe_exception(explicit)?.1, "boom");
        Ok(())
    }

    #[test]
    fn function_pointers() -> Result<()> {
        let runtime = runtime();
        let method = runtime.symbols().method(runtime.corlib().object_ctor)?;
        let pointer = runtime.function_pointer(Callable::Method(method));
        assert!(matches!(
            runtime.resolve_function_pointer(pointer)?,
            Callable::Method(m) if m.token == runtime.corlib().object_ctor
        ));
        assert!(runtime.resolve_function_pointer(FunctionPointer(99)).is_err());
        Ok(())
    }

    #[test]
    fn runtime_types() -> Result<()> {
        let runtime = runtime();
        let core = runtime.symbols().core_types();
        let text = runtime.alloc_string("hi")?;
        assert_eq!(runtime.runtime_type(&text)?, Some(core.string));
        assert_eq!(runtime.runtime_type(&Value::I4(1))?, Some(core.int32));
        assert_eq!(runtime.runtime_type(&Value::Null)?, None);

        let boxed = runtime.box_value(core.int32, Value::I4(7))?;
        assert_eq!(runtime.runtime_type(&boxed)?, Some(core.int32));
        assert_eq!(runtime.box_value(core.string, text.clone())?, text);
        Ok(())
    }
}
