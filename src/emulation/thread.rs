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

//! Execution threads.
//!
//! An [`ExecutionThread`] owns the argument and local slots of every active frame and
//! the call depth and instruction accounting of one top-level invocation. Frames are
//! addressed by index so managed pointers into locals and arguments stay valid while
//! callees run on top of them.
//!
//! Calls recurse on the Rust stack: each managed call runs its own
//! [`crate::emulation::interpreter::Interpreter`] against the shared thread, and native
//! callables (corlib natives, interception stubs) receive `&mut ExecutionThread` so they
//! can call back into managed code.

use crate::{
    assembly::DecodedMethod,
    emulation::{
        config::RuntimeLimits,
        dynamic::{Callable, DynamicMethodRc, DynamicScope, NativeMethod},
        interpreter::Interpreter,
        runtime::Runtime,
        value::{ManagedPointer, PointerTarget, Value},
    },
    metadata::{method::MethodDefRc, token::Token, typesystem::TypeSig},
    Error, Result,
};

/// Argument and local slots of one frame.
#[derive(Debug, Default)]
pub(crate) struct FrameSlots {
    pub(crate) args: Vec<Value>,
    pub(crate) locals: Vec<Value>,
}

/// The state of one logical thread of managed execution.
pub struct ExecutionThread<'r> {
    runtime: &'r Runtime,
    limits: RuntimeLimits,
    frames: Vec<FrameSlots>,
    depth: usize,
    executed: u64,
}

impl<'r> ExecutionThread<'r> {
    /// Creates a thread with no active frames, bounded by the runtime's limits.
    #[must_use]
    pub fn new(runtime: &'r Runtime) -> Self {
        Self::with_limits(runtime, runtime.limits().clone())
    }

    /// Creates a thread with its own call depth and instruction limits.
    ///
    /// The heap limit always comes from the runtime.
    #[must_use]
    pub fn with_limits(runtime: &'r Runtime, limits: RuntimeLimits) -> Self {
        ExecutionThread {
            runtime,
            limits,
            frames: Vec::new(),
            depth: 0,
            executed: 0,
        }
    }

    /// The runtime this thread executes against.
    #[must_use]
    pub fn runtime(&self) -> &'r Runtime {
        self.runtime
    }

    /// Current managed and native call depth.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Number of instructions executed so far.
    #[must_use]
    pub fn executed(&self) -> u64 {
        self.executed
    }

    /// Runs a top-level invocation.
    ///
    /// Unlike [`ExecutionThread::invoke`], an exception that escapes the callable is
    /// reported as [`Error::ManagedException`] with its type name and message.
    ///
    /// # Errors
    /// Returns [`Error::ManagedException`] for unhandled managed exceptions and any
    /// runtime error raised while executing.
    pub fn run(&mut self, callable: &Callable, args: Vec<Value>) -> Result<Value> {
        match self.invoke(callable, args) {
            Err(Error::Thrown(exception)) => {
                let (type_name, message) = self.runtime.describe_exception(exception)?;
                log::debug!("unhandled {type_name}: {message}");
                Err(Error::ManagedException { type_name, message })
            }
            other => other,
        }
    }

    /// Invokes any callable with direct call semantics.
    ///
    /// # Errors
    /// Returns [`Error::Thrown`] for managed exceptions escaping the callee.
    pub fn invoke(&mut self, callable: &Callable, args: Vec<Value>) -> Result<Value> {
        match callable {
            Callable::Method(method) => self.call_method(method, args),
            Callable::Dynamic(method) => self.call_dynamic(method, args),
            Callable::Native(native) => self.call_native(native, args),
        }
    }

    /// Calls a method non-virtually (the semantics of `call`).
    ///
    /// Methods with a registered native implementation run natively; everything else
    /// needs a readable CIL body.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] for methods without body or native
    /// implementation, and [`Error::Thrown`] for escaping managed exceptions.
    pub fn call_method(&mut self, method: &MethodDefRc, args: Vec<Value>) -> Result<Value> {
        if let Some(native) = self.runtime.native(method.token) {
            return self.call_native(&native, args);
        }

        if method.is_abstract() {
            return Err(Error::NotSupported(format!(
                "cannot call abstract method {}",
                self.runtime.symbols().method_name(method.token)
            )));
        }

        let decoded = match self.runtime.decoded(method) {
            Ok(decoded) => decoded,
            Err(Error::UnreadableMethodBody(_)) => {
                return Err(Error::NotSupported(format!(
                    "{} has neither a body nor a native implementation",
                    self.runtime.symbols().method_name(method.token)
                )))
            }
            Err(error) => return Err(error),
        };
        self.execute(&decoded, None, args)
    }

    /// Calls a method virtually (the semantics of `callvirt`).
    ///
    /// The receiver is `args[0]`; a null receiver raises `NullReferenceException`.
    /// When the resolved implementation is declared on a value type and the receiver
    /// is a boxed instance, the implementation receives a pointer into the box.
    ///
    /// # Errors
    /// Returns [`Error::Thrown`] for null receivers and escaping managed exceptions.
    pub fn call_virtual(&mut self, method: &MethodDefRc, mut args: Vec<Value>) -> Result<Value> {
        let Some(receiver) = args.first() else {
            return Err(Error::TypeMismatch(format!(
                "virtual call to {} without a receiver",
                method.name
            )));
        };
        if receiver.is_null() {
            return Err(self.null_reference());
        }

        let runtime_type = match receiver {
            Value::ManagedPtr(pointer) => {
                let pointee = self.load(pointer)?;
                self.runtime.runtime_type(&pointee)?
            }
            other => self.runtime.runtime_type(other)?,
        };
        let Some(runtime_type) = runtime_type else {
            return self.call_method(method, args);
        };

        let symbols = self.runtime.symbols();
        let target = symbols.resolve_virtual(runtime_type, method)?;
        if target.token != method.token {
            log::trace!(
                "devirtualized {} to {}",
                symbols.method_name(method.token),
                symbols.method_name(target.token)
            );
        }

        if symbols.is_value_type(target.declaring_type) {
            if let Some(Value::ObjectRef(boxed)) = args.first() {
                args[0] = Value::ManagedPtr(ManagedPointer::to_boxed(*boxed));
            }
        }
        self.call_method(&target, args)
    }

    /// Allocates an instance and runs `ctor` on it (the semantics of `newobj`).
    ///
    /// Reference types are allocated on the heap; value types are constructed in a
    /// temporary slot and returned by value.
    ///
    /// # Errors
    /// Returns [`Error::Thrown`] for exceptions escaping the constructor.
    pub fn construct(&mut self, ctor: &MethodDefRc, args: Vec<Value>) -> Result<Value> {
        let symbols = self.runtime.symbols();
        let type_token = ctor.declaring_type;

        if symbols.is_value_type(type_token) {
            let initial = Value::default_for(&TypeSig::ValueType(type_token), symbols);
            return self.with_temporary(initial, |thread, pointer| {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(Value::ManagedPtr(pointer));
                full.extend(args);
                thread.call_method(ctor, full).map(|_| ())
            });
        }

        let object = self.runtime.new_object(type_token)?;
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(object.clone());
        full.extend(args);
        self.call_method(ctor, full)?;
        Ok(object)
    }

    /// Runs a dynamic method.
    ///
    /// # Errors
    /// Returns [`Error::Thrown`] for escaping managed exceptions.
    pub fn call_dynamic(&mut self, method: &DynamicMethodRc, args: Vec<Value>) -> Result<Value> {
        let method = DynamicMethodRc::clone(method);
        self.execute(method.decoded(), Some(method.scope()), args)
    }

    /// Runs a native callable, counting it as one call level.
    ///
    /// # Errors
    /// Returns whatever the native returns.
    pub fn call_native(&mut self, native: &NativeMethod, args: Vec<Value>) -> Result<Value> {
        self.enter()?;
        let result = native.invoke(self, args);
        self.leave();
        result
    }

    /// Reads the location a managed pointer refers to.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for dangling pointers and [`Error::Thrown`] for
    /// array indices out of range.
    pub fn load(&self, pointer: &ManagedPointer) -> Result<Value> {
        let runtime = self.runtime;
        match &pointer.target {
            PointerTarget::Local { frame, index } => self
                .frames
                .get(*frame)
                .and_then(|slots| slots.locals.get(usize::from(*index)))
                .cloned()
                .ok_or_else(|| dangling(pointer)),
            PointerTarget::Argument { frame, index } => self
                .frames
                .get(*frame)
                .and_then(|slots| slots.args.get(usize::from(*index)))
                .cloned()
                .ok_or_else(|| dangling(pointer)),
            PointerTarget::ArrayElement { array, index } => {
                match runtime.heap().get_array_element(*array, *index)? {
                    Some(value) => Ok(value),
                    None => Err(self.index_out_of_range()),
                }
            }
            PointerTarget::ObjectField { object, field } => {
                let default = runtime.field_default(*field)?;
                runtime.heap().get_field(*object, *field, default)
            }
            PointerTarget::StaticField(field) => runtime.load_static(*field),
            PointerTarget::Boxed(object) => runtime.heap().unbox(*object).map(|(_, value)| value),
            PointerTarget::ValueField { parent, field } => {
                let parent = self.load(parent)?;
                parent.field(*field).cloned()
            }
        }
    }

    /// Writes the location a managed pointer refers to.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for dangling pointers and [`Error::Thrown`] for
    /// array indices out of range.
    pub fn store(&mut self, pointer: &ManagedPointer, value: Value) -> Result<()> {
        let runtime = self.runtime;
        match &pointer.target {
            PointerTarget::Local { frame, index } => {
                let slot = self
                    .frames
                    .get_mut(*frame)
                    .and_then(|slots| slots.locals.get_mut(usize::from(*index)))
                    .ok_or_else(|| dangling(pointer))?;
                *slot = value;
                Ok(())
            }
            PointerTarget::Argument { frame, index } => {
                let slot = self
                    .frames
                    .get_mut(*frame)
                    .and_then(|slots| slots.args.get_mut(usize::from(*index)))
                    .ok_or_else(|| dangling(pointer))?;
                *slot = value;
                Ok(())
            }
            PointerTarget::ArrayElement { array, index } => {
                if runtime.heap().set_array_element(*array, *index, value)? {
                    Ok(())
                } else {
                    Err(self.index_out_of_range())
                }
            }
            PointerTarget::ObjectField { object, field } => {
                runtime.heap().set_field(*object, *field, value)
            }
            PointerTarget::StaticField(field) => runtime.statics().set(*field, value),
            PointerTarget::Boxed(object) => runtime.heap().set_boxed(*object, value),
            PointerTarget::ValueField { parent, field } => {
                let mut instance = self.load(parent)?;
                instance.set_field(*field, value)?;
                self.store(parent, instance)
            }
        }
    }

    /// Runs `f` with a pointer to a temporary slot holding `value` and returns the
    /// slot's final content.
    ///
    /// # Errors
    /// Returns whatever `f` returns.
    pub fn with_temporary<F>(&mut self, value: Value, f: F) -> Result<Value>
    where
        F: FnOnce(&mut Self, ManagedPointer) -> Result<()>,
    {
        let frame = self.push_frame(Vec::new(), vec![value]);
        let result = f(self, ManagedPointer::to_local(frame, 0));
        let value = self
            .frames
            .get_mut(frame)
            .and_then(|slots| slots.locals.pop())
            .unwrap_or_default();
        self.frames.truncate(frame);
        result.map(|()| value)
    }

    /// Allocates an exception of `type_token` and returns it as an in-flight error.
    ///
    /// Allocation failures are returned instead.
    #[must_use]
    pub fn throw(&self, type_token: Token, message: Option<&str>) -> Error {
        match self.runtime.new_exception(type_token, message) {
            Ok(exception) => Error::Thrown(exception),
            Err(error) => error,
        }
    }

    /// A `NullReferenceException` in flight.
    #[must_use]
    pub fn null_reference(&self) -> Error {
        self.throw(self.runtime.corlib().null_reference_exception, None)
    }

    /// An `IndexOutOfRangeException` in flight.
    #[must_use]
    pub fn index_out_of_range(&self) -> Error {
        self.throw(self.runtime.corlib().index_out_of_range_exception, None)
    }

    /// An `InvalidCastException` in flight.
    #[must_use]
    pub fn invalid_cast(&self, message: &str) -> Error {
        self.throw(self.runtime.corlib().invalid_cast_exception, Some(message))
    }

    /// Counts one executed instruction against the instruction limit.
    pub(crate) fn tick(&mut self) -> Result<()> {
        self.executed += 1;
        let max = self.limits.max_instructions;
        if max > 0 && self.executed > max {
            return Err(Error::InstructionLimit(max));
        }
        Ok(())
    }

    fn enter(&mut self) -> Result<()> {
        let max = self.limits.max_call_depth;
        if max > 0 && self.depth >= max {
            return Err(Error::CallDepthExceeded(max));
        }
        self.depth += 1;
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub(crate) fn push_frame(&mut self, args: Vec<Value>, locals: Vec<Value>) -> usize {
        self.frames.push(FrameSlots { args, locals });
        self.frames.len() - 1
    }

    pub(crate) fn frame(&self, frame: usize) -> Result<&FrameSlots> {
        self.frames
            .get(frame)
            .ok_or_else(|| malformed_error!("Frame {} is not active", frame))
    }

    pub(crate) fn frame_mut(&mut self, frame: usize) -> Result<&mut FrameSlots> {
        self.frames
            .get_mut(frame)
            .ok_or_else(|| malformed_error!("Frame {} is not active", frame))
    }

    fn execute(
        &mut self,
        method: &DecodedMethod,
        scope: Option<&DynamicScope>,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.enter()?;
        let symbols = self.runtime.symbols();
        let locals = method
            .locals
            .iter()
            .map(|local| Value::default_for(&local.signature, symbols))
            .collect();
        let frame = self.push_frame(args, locals);

        let result = Interpreter::new(method, scope, frame).run(self);

        self.frames.truncate(frame);
        self.leave();
        result
    }
}

fn dangling(pointer: &ManagedPointer) -> Error {
    Error::TypeMismatch(format!("dangling managed pointer {pointer}"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        emulation::{RuntimeLimits, Value},
        metadata::Module,
    };

    #[test]
    fn temporaries_and_pointers() -> Result<()> {
        let runtime = Runtime::new(Arc::new(Module::new()));
        let mut thread = ExecutionThread::new(&runtime);

        let result = thread.with_temporary(Value::I4(1), |thread, pointer| {
            let current = thread.load(&pointer)?.as_i4()?;
            thread.store(&pointer, Value::I4(current + 41))
        })?;
        assert_eq!(result, Value::I4(42));

        let dangling = ManagedPointer::to_local(7, 0);
        assert!(matches!(thread.load(&dangling), Err(Error::TypeMismatch(_))));
        Ok(())
    }

    #[test]
    fn array_pointers_check_bounds() -> Result<()> {
        let runtime = Runtime::new(Arc::new(Module::new()));
        let array = runtime
            .heap()
            .alloc_array(TypeSig::I4, vec![Value::I4(5), Value::I4(6)])?;
        let mut thread = ExecutionThread::new(&runtime);

        thread.store(&ManagedPointer::to_array_element(array, 1), Value::I4(9))?;
        assert_eq!(thread.load(&ManagedPointer::to_array_element(array, 1))?, Value::I4(9));

        let outside = ManagedPointer::to_array_element(array, 2);
        assert!(matches!(thread.load(&outside), Err(Error::Thrown(_))));
        Ok(())
    }

    #[test]
    fn instruction_budget() {
        let module = Arc::new(Module::new());
        let runtime = Runtime::with_limits(module, RuntimeLimits::new().with_max_instructions(2));
        let mut thread = ExecutionThread::new(&runtime);

        assert!(thread.tick().is_ok());
        assert!(thread.tick().is_ok());
        assert!(matches!(thread.tick(), Err(Error::InstructionLimit(2))));
    }

    #[test]
    fn native_calls_count_depth() {
        let module = Arc::new(Module::new());
        let runtime = Runtime::with_limits(module, RuntimeLimits::new().with_max_call_depth(3));
        let recurse = Arc::new(std::sync::OnceLock::<crate::emulation::NativeMethodRc>::new());
        let inner = Arc::clone(&recurse);
        let native = Arc::new(NativeMethod::new(
            "Recurse",
            vec![],
            TypeSig::I4,
            move |thread, _| {
                let depth = i32::try_from(thread.depth()).unwrap_or(i32::MAX);
                match inner.get() {
                    Some(this) if depth < 10 => thread.call_native(this, Vec::new()),
                    _ => Ok(Value::I4(depth)),
                }
            },
        ));
        recurse.set(Arc::clone(&native)).unwrap();

        let mut thread = ExecutionThread::new(&runtime);
        assert!(matches!(
            thread.call_native(&native, Vec::new()),
            Err(Error::CallDepthExceeded(3))
        ));
        assert_eq!(thread.depth(), 0);
    }
}
