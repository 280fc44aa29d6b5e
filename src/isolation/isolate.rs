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

//! Running code with shims active.
//!
//! [`isolate`] is the one-call form: it runs a static, parameterless entry point with
//! a list of shims. [`IsolationRun`] is the general form; it accepts arguments,
//! returns the entry's result, and can be configured and reused for several calls
//! that then share stubs and rewritten bodies.
//!
//! ```rust
//! use dotshim::emulation::{NativeMethod, Runtime, Value};
//! use dotshim::isolation::{isolate, Shim};
//! use dotshim::metadata::{
//!     builders::{MethodBodyBuilder, MethodDefBuilder, TypeDefBuilder},
//!     Module, TypeSig,
//! };
//! use std::sync::Arc;
//!
//! let module = Module::new();
//! let write_line = module.corlib().console_write_line_string;
//! let greeting = module.add_user_string("hello");
//! let program = TypeDefBuilder::new("Demo", "Program").build(&module)?;
//! let main = MethodDefBuilder::new("Main")
//!     .static_method()
//!     .body(MethodBodyBuilder::new().implementation(move |asm| {
//!         asm.ldstr(greeting)?.call(write_line)?.ret()?;
//!         Ok(())
//!     }))
//!     .build(&module, program)?;
//!
//! let shim = Shim::replace(&module, write_line)?.with_native(
//!     &module,
//!     NativeMethod::new("shout", vec![TypeSig::String], TypeSig::Void, move |thread, args| {
//!         let runtime = thread.runtime();
//!         let text = runtime.string_value(&args[0])?;
//!         let loud = runtime.alloc_string(&text.map(|s| s.to_uppercase()).unwrap_or_default())?;
//!         let original = runtime.symbols().method(write_line)?;
//!         thread.call_method(&original, vec![loud])
//!     }),
//! )?;
//!
//! let runtime = Runtime::new(Arc::new(module));
//! isolate(&runtime, main, vec![shim])?;
//! assert_eq!(runtime.console().lines(), ["HELLO"]);
//! # Ok::<(), dotshim::Error>(())
//! ```

use std::sync::Arc;

use crate::{
    emulation::{Callable, ExecutionThread, Runtime, Value},
    isolation::{config::IsolationConfig, context::RunContext, shim::Shim, stubs::StubKind},
    metadata::Token,
    Error, Result,
};

/// One isolation run over a runtime.
#[derive(Debug)]
pub struct IsolationRun<'r> {
    runtime: &'r Runtime,
    context: Arc<RunContext>,
}

impl<'r> IsolationRun<'r> {
    /// Creates a run with the default configuration.
    ///
    /// # Errors
    /// See [`IsolationRun::with_config`].
    pub fn new(runtime: &'r Runtime, shims: Vec<Shim>) -> Result<Self> {
        Self::with_config(runtime, shims, IsolationConfig::default())
    }

    /// Creates a run.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] when a shim was built against a different
    /// symbol table than the runtime's, and [`Error::MethodNotFound`] when its
    /// original does not exist there at all.
    pub fn with_config(
        runtime: &'r Runtime,
        shims: Vec<Shim>,
        config: IsolationConfig,
    ) -> Result<Self> {
        let symbols = runtime.symbols();
        for shim in &shims {
            let original = symbols.method(shim.original().token)?;
            if original.identity() != *shim.identity() {
                return Err(Error::NotSupported(format!(
                    "shim for {} was built against another symbol table",
                    shim.identity()
                )));
            }
        }

        log::debug!("isolation run with {} shim(s)", shims.len());
        Ok(IsolationRun {
            runtime,
            context: RunContext::new(shims, config),
        })
    }

    /// The runtime the run executes on.
    #[must_use]
    pub fn runtime(&self) -> &'r Runtime {
        self.runtime
    }

    /// The run's shims, caches and configuration.
    #[must_use]
    pub fn context(&self) -> &Arc<RunContext> {
        &self.context
    }

    /// Calls `entry` through an interception stub on a fresh thread.
    ///
    /// # Errors
    /// Returns [`Error::ManagedException`] for an unhandled managed exception,
    /// [`Error::UnsupportedInstruction`] when a reached method cannot be rewritten, and
    /// any execution error such as [`Error::CallDepthExceeded`].
    pub fn invoke(&self, entry: Token, args: Vec<Value>) -> Result<Value> {
        let symbols = self.runtime.symbols();
        let method = symbols.method(entry)?;
        let stub = self.context.stub(symbols, StubKind::Call, &method)?;

        let limits = self
            .context
            .config()
            .limits
            .clone()
            .unwrap_or_else(|| self.runtime.limits().clone());
        ExecutionThread::with_limits(self.runtime, limits)
            .run(&Callable::Native(Arc::clone(stub.native())), args)
    }
}

/// Runs the static, parameterless method `entry` with `shims` active.
///
/// Without shims the entry runs directly, without rewriting anything.
///
/// # Errors
/// Returns [`Error::NotSupported`] for entries that take arguments or a receiver, and
/// everything [`IsolationRun::invoke`] returns.
pub fn isolate(runtime: &Runtime, entry: Token, shims: Vec<Shim>) -> Result<()> {
    let method = runtime.symbols().method(entry)?;
    if !method.is_static() || !method.params.is_empty() {
        return Err(Error::NotSupported(format!(
            "entry point {} must be static and parameterless",
            runtime.symbols().method_name(entry)
        )));
    }

    if shims.is_empty() {
        runtime.invoke(entry, Vec::new())?;
        return Ok(());
    }

    IsolationRun::new(runtime, shims)?.invoke(entry, Vec::new())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        emulation::NativeMethod,
        metadata::{
            builders::{MethodBodyBuilder, MethodDefBuilder, TypeDefBuilder},
            Module, SymbolTable, TypeSig,
        },
    };

    fn add_one(module: &Module) -> Result<Token> {
        let program = TypeDefBuilder::new("Demo", "Program").build(module)?;
        MethodDefBuilder::new("AddOne")
            .static_method()
            .param(TypeSig::I4)
            .returns(TypeSig::I4)
            .body(MethodBodyBuilder::new().implementation(|asm| {
                asm.ldarg_0()?.ldc_i4_1()?.add()?.ret()?;
                Ok(())
            }))
            .build(module, program)
    }

    #[test]
    fn invoke_returns_the_result() -> Result<()> {
        let module = Module::new();
        let entry = add_one(&module)?;
        let runtime = Runtime::new(Arc::new(module));

        let run = IsolationRun::new(&runtime, Vec::new())?;
        assert_eq!(run.invoke(entry, vec![Value::I4(41)])?, Value::I4(42));
        assert_eq!(run.context().cache().body_count(), 1);
        Ok(())
    }

    #[test]
    fn runs_format_for_debugging() -> Result<()> {
        let module = Module::new();
        add_one(&module)?;
        let runtime = Runtime::new(Arc::new(module));

        let run = IsolationRun::new(&runtime, Vec::new())?;
        let rendered = format!("{run:?}");
        assert!(rendered.starts_with("IsolationRun"));
        assert!(rendered.contains("Runtime"));
        assert!(rendered.contains("natives"));
        Ok(())
    }

    #[test]
    fn entries_must_be_parameterless() -> Result<()> {
        let module = Module::new();
        let entry = add_one(&module)?;
        let runtime = Runtime::new(Arc::new(module));
        assert!(matches!(
            isolate(&runtime, entry, Vec::new()),
            Err(Error::NotSupported(_))
        ));
        Ok(())
    }

    #[test]
    fn shims_must_come_from_the_same_table() -> Result<()> {
        let shim_module = Module::new();
        let entry = add_one(&shim_module)?;
        let shim = Shim::replace(&shim_module, entry)?.with_native(
            &shim_module,
            NativeMethod::new("fixed", vec![TypeSig::I4], TypeSig::I4, |_, _| Ok(Value::I4(0))),
        )?;

        let module = Module::new();
        let program = TypeDefBuilder::new("Demo", "Other").build(&module)?;
        MethodDefBuilder::new("Unrelated")
            .static_method()
            .returns(TypeSig::Boolean)
            .build(&module, program)?;
        let runtime = Runtime::new(Arc::new(module));
        assert_eq!(runtime.symbols().method(entry)?.name, "Unrelated");

        assert!(matches!(
            IsolationRun::new(&runtime, vec![shim]),
            Err(Error::NotSupported(_))
        ));
        Ok(())
    }

    #[test]
    fn limits_come_from_the_configuration() -> Result<()> {
        let module = Module::new();
        let program = TypeDefBuilder::new("Demo", "Program").build(&module)?;
        let spin = MethodDefBuilder::new("Spin")
            .static_method()
            .body(MethodBodyBuilder::new().implementation(|asm| {
                asm.label("top")?.br("top")?;
                Ok(())
            }))
            .build(&module, program)?;
        let runtime = Runtime::new(Arc::new(module));

        let config = IsolationConfig::default()
            .with_limits(crate::emulation::RuntimeLimits::new().with_max_instructions(1_000));
        let run = IsolationRun::with_config(&runtime, Vec::new(), config)?;
        assert!(matches!(
            run.invoke(spin, Vec::new()),
            Err(Error::InstructionLimit(_))
        ));
        Ok(())
    }
}
