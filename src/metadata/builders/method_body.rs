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

//! Method body builder.
//!
//! [`MethodBodyBuilder`] runs an implementation closure against an
//! [`InstructionAssembler`] bound to the module, so calls know their stack effect,
//! and encodes the result as a tiny or fat body with its clause table.

use crate::{
    assembly::InstructionAssembler,
    metadata::{
        method::{encode_method_body, LocalVariable},
        module::Module,
        symbols::StandAloneSignature,
        token::Token,
        typesystem::TypeSig,
    },
    Result,
};

/// Type alias for method body implementation closures
type ImplementationFn = Box<dyn for<'a> FnOnce(&mut InstructionAssembler<'a>) -> Result<()>>;

/// Builder for encoded method bodies.
///
/// ```rust
/// use dotshim::metadata::{builders::MethodBodyBuilder, Module, TypeSig};
///
/// let module = Module::new();
/// let (body, locals) = MethodBodyBuilder::new()
///     .local(TypeSig::I4)
///     .implementation(|asm| {
///         asm.ldarg_0()?.stloc_0()?.ldloc_0()?.ret()?;
///         Ok(())
///     })
///     .build(&module)?;
/// assert_eq!(body[0] & 0x03, 0x03);
/// assert!(!locals.is_null());
/// # Ok::<(), dotshim::Error>(())
/// ```
pub struct MethodBodyBuilder {
    /// Maximum stack depth (None = auto-calculate)
    max_stack: Option<u16>,
    init_locals: bool,
    locals: Vec<TypeSig>,
    implementation: Option<ImplementationFn>,
}

impl MethodBodyBuilder {
    /// Create a new method body builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_stack: None,
            init_locals: true,
            locals: Vec::new(),
            implementation: None,
        }
    }

    /// Overrides the computed maximum stack depth.
    #[must_use]
    pub fn max_stack(mut self, stack_size: u16) -> Self {
        self.max_stack = Some(stack_size);
        self
    }

    /// Declares the next local variable slot.
    #[must_use]
    pub fn local(mut self, local_type: TypeSig) -> Self {
        self.locals.push(local_type);
        self
    }

    /// Whether locals are zero-initialized on entry (default `true`).
    #[must_use]
    pub fn init_locals(mut self, init: bool) -> Self {
        self.init_locals = init;
        self
    }

    /// The code of the body.
    #[must_use]
    pub fn implementation<F>(mut self, f: F) -> Self
    where
        F: for<'a> FnOnce(&mut InstructionAssembler<'a>) -> Result<()> + 'static,
    {
        self.implementation = Some(Box::new(f));
        self
    }

    /// Assembles and encodes the body.
    ///
    /// Returns the body bytes and the locals signature token (null without locals).
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] without an implementation, and any error
    /// raised by the implementation closure or the encoder.
    pub fn build(self, module: &Module) -> Result<(Vec<u8>, Token)> {
        let MethodBodyBuilder {
            max_stack,
            init_locals,
            locals,
            implementation,
        } = self;

        let implementation =
            implementation.ok_or_else(|| malformed_error!("Method body implementation is required"))?;

        let mut assembler = InstructionAssembler::with_symbols(module);
        implementation(&mut assembler)?;
        let (code, calculated_max_stack, handlers) = assembler.finish()?;

        let max_stack = max_stack.unwrap_or(calculated_max_stack);

        let local_var_sig_token = if locals.is_empty() {
            Token::new(0)
        } else {
            module.add_signature(StandAloneSignature::Locals(
                locals.into_iter().map(LocalVariable::new).collect(),
            ))
        };

        let body = encode_method_body(
            &code,
            max_stack,
            local_var_sig_token.value(),
            init_locals,
            &handlers,
        )?;
        Ok((body, local_var_sig_token))
    }
}

impl Default for MethodBodyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::method::{ExceptionRegionKind, MethodBody};

    #[test]
    fn tiny_body() -> Result<()> {
        let module = Module::new();
        let (body_bytes, local_sig_token) = MethodBodyBuilder::new()
            .implementation(|asm| {
                asm.ldc_i4_1()?.ret()?;
                Ok(())
            })
            .build(&module)?;

        // (2 << 2) | tiny
        assert_eq!(body_bytes, vec![0x0A, 0x17, 0x2A]);
        assert!(local_sig_token.is_null());
        Ok(())
    }

    #[test]
    fn explicit_max_stack_forces_fat_header() -> Result<()> {
        let module = Module::new();
        let (body_bytes, _) = MethodBodyBuilder::new()
            .max_stack(10)
            .implementation(|asm| {
                asm.nop()?.ret()?;
                Ok(())
            })
            .build(&module)?;

        let body = MethodBody::from(&body_bytes)?;
        assert!(body.is_fat);
        assert_eq!(body.max_stack, 10);
        Ok(())
    }

    #[test]
    fn locals_and_clauses() -> Result<()> {
        let module = Module::new();
        let exception = module.corlib().exception;
        let (body_bytes, locals) = MethodBodyBuilder::new()
            .local(TypeSig::I4)
            .implementation(move |asm| {
                asm.try_start("guard")?
                    .ldc_i4_1()?
                    .stloc_0()?
                    .leave_s("done")?
                    .try_end("guard")?
                    .catch_start("guard", exception)?
                    .pop()?
                    .leave_s("done")?
                    .catch_end("guard")?
                    .label("done")?
                    .ldloc_0()?
                    .ret()?;
                Ok(())
            })
            .build(&module)?;

        let body = MethodBody::from(&body_bytes)?;
        assert_eq!(body.local_signature(), Some(locals));
        assert_eq!(body.exception_handlers.len(), 1);
        assert_eq!(body.exception_handlers[0].kind(), ExceptionRegionKind::Catch);
        assert_eq!(body.exception_handlers[0].handler, Some(exception));
        Ok(())
    }

    #[test]
    fn missing_implementation() {
        let module = Module::new();
        assert!(MethodBodyBuilder::new().build(&module).is_err());
    }
}
