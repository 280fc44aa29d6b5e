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

//! Fluent CIL assembly.
//!
//! [`InstructionAssembler`] wraps the [`InstructionEncoder`] with one method per
//! instruction, each returning `&mut Self` so code reads like an IL listing. Calls
//! resolve their stack effect through an optional [`SymbolTable`].
//!
//! Exception blocks are named. A block opens with `try_start`, every handler is
//! opened by its `*_start` method and closed by the matching `*_end`; a handler
//! that is followed directly by another handler of the same block shares the
//! guarded range with it.
//!
//! ```rust
//! use dotshim::assembly::InstructionAssembler;
//!
//! let mut asm = InstructionAssembler::new();
//! asm.ldarg_0()?
//!     .brtrue_s("non_zero")?
//!     .ldc_i4_0()?
//!     .ret()?
//!     .label("non_zero")?
//!     .ldc_i4_1()?
//!     .ret()?;
//! let (code, max_stack, handlers) = asm.finish()?;
//! assert_eq!(code, vec![0x02, 0x2D, 0x02, 0x16, 0x2A, 0x17, 0x2A]);
//! assert_eq!(max_stack, 1);
//! assert!(handlers.is_empty());
//! # Ok::<(), dotshim::Error>(())
//! ```

use crate::{
    assembly::{
        encoder::InstructionEncoder,
        instruction::{Immediate, Operand},
    },
    metadata::{
        method::ExceptionHandler,
        symbols::{StandAloneSignature, SymbolTable},
        token::Token,
    },
    Result,
};

macro_rules! simple_instructions {
    ($($(#[$doc:meta])* $name:ident => $mnemonic:literal),* $(,)?) => {
        $(
            $(#[$doc])*
            #[doc = concat!("Emits `", $mnemonic, "`.")]
            ///
            /// # Errors
            /// Returns an error on stack underflow.
            pub fn $name(&mut self) -> Result<&mut Self> {
                self.emit($mnemonic, None)
            }
        )*
    };
}

macro_rules! token_instructions {
    ($($name:ident => $mnemonic:literal),* $(,)?) => {
        $(
            #[doc = concat!("Emits `", $mnemonic, "` with a token operand.")]
            ///
            /// # Errors
            /// Returns an error on stack underflow.
            pub fn $name(&mut self, token: Token) -> Result<&mut Self> {
                self.emit($mnemonic, Some(Operand::Token(token)))
            }
        )*
    };
}

macro_rules! branch_instructions {
    ($($name:ident => $mnemonic:literal),* $(,)?) => {
        $(
            #[doc = concat!("Emits `", $mnemonic, "` to a label.")]
            ///
            /// # Errors
            /// Returns an error on stack underflow or inconsistent depth at the label.
            pub fn $name(&mut self, label: &str) -> Result<&mut Self> {
                self.flush_block()?;
                self.encoder.emit_branch($mnemonic, label)?;
                Ok(self)
            }
        )*
    };
}

/// Fluent CIL assembler.
pub struct InstructionAssembler<'a> {
    encoder: InstructionEncoder,
    symbols: Option<&'a dyn SymbolTable>,
    blocks: Vec<String>,
    closing: Option<String>,
}

impl<'a> InstructionAssembler<'a> {
    /// Creates an assembler without a symbol table; call instructions are rejected.
    #[must_use]
    pub fn new() -> Self {
        Self {
            encoder: InstructionEncoder::new(),
            symbols: None,
            blocks: Vec::new(),
            closing: None,
        }
    }

    /// Creates an assembler resolving call stack effects through `symbols`.
    #[must_use]
    pub fn with_symbols(symbols: &'a dyn SymbolTable) -> Self {
        Self {
            symbols: Some(symbols),
            ..Self::new()
        }
    }

    /// Finalizes the code: bytecode, maximum stack depth and exception clauses.
    ///
    /// # Errors
    /// Returns an error for undefined labels or unterminated exception blocks.
    pub fn finish(mut self) -> Result<(Vec<u8>, u16, Vec<ExceptionHandler>)> {
        self.flush_block()?;
        if let Some(open) = self.blocks.last() {
            return Err(malformed_error!("Exception block '{}' was never closed", open));
        }
        let (code, max_stack, _, handlers) = self.encoder.finalize()?;
        Ok((code, max_stack, handlers))
    }

    fn emit(&mut self, mnemonic: &str, operand: Option<Operand>) -> Result<&mut Self> {
        self.flush_block()?;
        self.encoder.emit_instruction(mnemonic, operand)?;
        Ok(self)
    }

    /// Closes a block whose last handler ended and was not followed by another one.
    fn flush_block(&mut self) -> Result<()> {
        if self.closing.take().is_some() {
            self.encoder.end_exception_block()?;
            self.blocks.pop();
        }
        Ok(())
    }

    fn expect_block(&self, name: &str) -> Result<()> {
        match self.blocks.last() {
            Some(open) if open == name => Ok(()),
            Some(open) => Err(malformed_error!(
                "Exception block '{}' used while '{}' is innermost",
                name,
                open
            )),
            None => Err(malformed_error!("Exception block '{}' is not open", name)),
        }
    }

    /// Prepares a handler start: continues the block if its previous handler just ended.
    fn handler_start(&mut self, name: &str) -> Result<()> {
        if self.closing.as_deref() == Some(name) {
            self.closing = None;
            return Ok(());
        }
        self.flush_block()?;
        self.expect_block(name)
    }

    fn handler_end(&mut self, name: &str) -> Result<&mut Self> {
        self.flush_block()?;
        self.expect_block(name)?;
        self.closing = Some(name.to_string());
        Ok(self)
    }

    /// Defines a label at the current position.
    ///
    /// # Errors
    /// Returns an error for duplicate labels.
    pub fn label(&mut self, name: &str) -> Result<&mut Self> {
        self.flush_block()?;
        self.encoder.define_label(name)?;
        Ok(self)
    }

    /// Opens a protected block.
    ///
    /// # Errors
    /// Returns an error if a pending block cannot be closed.
    pub fn try_start(&mut self, name: &str) -> Result<&mut Self> {
        self.flush_block()?;
        self.blocks.push(name.to_string());
        self.encoder.begin_exception_block();
        Ok(self)
    }

    /// Marks the end of the guarded range; the first handler must follow.
    ///
    /// # Errors
    /// Returns an error if `name` is not the innermost open block.
    pub fn try_end(&mut self, name: &str) -> Result<&mut Self> {
        self.flush_block()?;
        self.expect_block(name)?;
        Ok(self)
    }

    /// Opens a catch handler for `class`.
    ///
    /// # Errors
    /// Returns an error if `name` is not the innermost open block.
    pub fn catch_start(&mut self, name: &str, class: Token) -> Result<&mut Self> {
        self.handler_start(name)?;
        self.encoder.begin_catch_block(class)?;
        Ok(self)
    }

    /// Closes a catch handler.
    ///
    /// # Errors
    /// Returns an error if `name` is not the innermost open block.
    pub fn catch_end(&mut self, name: &str) -> Result<&mut Self> {
        self.handler_end(name)
    }

    /// Opens the filter expression of a filter clause.
    ///
    /// # Errors
    /// Returns an error if `name` is not the innermost open block.
    pub fn filter_start(&mut self, name: &str) -> Result<&mut Self> {
        self.handler_start(name)?;
        self.encoder.begin_filter_block()?;
        Ok(self)
    }

    /// Opens the handler guarded by the preceding filter, after its `endfilter`.
    ///
    /// # Errors
    /// Returns an error unless a filter of `name` is being emitted.
    pub fn filter_handler_start(&mut self, name: &str) -> Result<&mut Self> {
        self.flush_block()?;
        self.expect_block(name)?;
        self.encoder.begin_filtered_handler()?;
        Ok(self)
    }

    /// Closes a filtered handler.
    ///
    /// # Errors
    /// Returns an error if `name` is not the innermost open block.
    pub fn filter_end(&mut self, name: &str) -> Result<&mut Self> {
        self.handler_end(name)
    }

    /// Opens a finally handler.
    ///
    /// # Errors
    /// Returns an error if `name` is not the innermost open block.
    pub fn finally_start(&mut self, name: &str) -> Result<&mut Self> {
        self.handler_start(name)?;
        self.encoder.begin_finally_block()?;
        Ok(self)
    }

    /// Closes a finally handler.
    ///
    /// # Errors
    /// Returns an error if `name` is not the innermost open block.
    pub fn finally_end(&mut self, name: &str) -> Result<&mut Self> {
        self.handler_end(name)
    }

    /// Opens a fault handler.
    ///
    /// # Errors
    /// Returns an error if `name` is not the innermost open block.
    pub fn fault_start(&mut self, name: &str) -> Result<&mut Self> {
        self.handler_start(name)?;
        self.encoder.begin_fault_block()?;
        Ok(self)
    }

    /// Closes a fault handler.
    ///
    /// # Errors
    /// Returns an error if `name` is not the innermost open block.
    pub fn fault_end(&mut self, name: &str) -> Result<&mut Self> {
        self.handler_end(name)
    }

    simple_instructions! {
        nop => "nop",
        dup => "dup",
        pop => "pop",
        ret => "ret",
        ldnull => "ldnull",
        ldarg_0 => "ldarg.0",
        ldarg_1 => "ldarg.1",
        ldarg_2 => "ldarg.2",
        ldarg_3 => "ldarg.3",
        ldloc_0 => "ldloc.0",
        ldloc_1 => "ldloc.1",
        ldloc_2 => "ldloc.2",
        ldloc_3 => "ldloc.3",
        stloc_0 => "stloc.0",
        stloc_1 => "stloc.1",
        stloc_2 => "stloc.2",
        stloc_3 => "stloc.3",
        ldc_i4_m1 => "ldc.i4.m1",
        ldc_i4_0 => "ldc.i4.0",
        ldc_i4_1 => "ldc.i4.1",
        ldc_i4_2 => "ldc.i4.2",
        ldc_i4_3 => "ldc.i4.3",
        ldc_i4_4 => "ldc.i4.4",
        ldc_i4_5 => "ldc.i4.5",
        ldc_i4_6 => "ldc.i4.6",
        ldc_i4_7 => "ldc.i4.7",
        ldc_i4_8 => "ldc.i4.8",
        add => "add",
        sub => "sub",
        mul => "mul",
        div => "div",
        div_un => "div.un",
        rem => "rem",
        neg => "neg",
        and => "and",
        or => "or",
        xor => "xor",
        not => "not",
        shl => "shl",
        shr => "shr",
        add_ovf => "add.ovf",
        sub_ovf => "sub.ovf",
        mul_ovf => "mul.ovf",
        ceq => "ceq",
        cgt => "cgt",
        cgt_un => "cgt.un",
        clt => "clt",
        clt_un => "clt.un",
        conv_i4 => "conv.i4",
        conv_i8 => "conv.i8",
        conv_r8 => "conv.r8",
        conv_i => "conv.i",
        conv_ovf_i4 => "conv.ovf.i4",
        ldind_i4 => "ldind.i4",
        ldind_i8 => "ldind.i8",
        ldind_r8 => "ldind.r8",
        ldind_ref => "ldind.ref",
        stind_i4 => "stind.i4",
        stind_i8 => "stind.i8",
        stind_r8 => "stind.r8",
        stind_ref => "stind.ref",
        ldlen => "ldlen",
        ldelem_i4 => "ldelem.i4",
        ldelem_i8 => "ldelem.i8",
        ldelem_ref => "ldelem.ref",
        stelem_i4 => "stelem.i4",
        stelem_i8 => "stelem.i8",
        stelem_ref => "stelem.ref",
        throw => "throw",
        rethrow => "rethrow",
        endfinally => "endfinally",
        endfilter => "endfilter",
        readonly => "readonly.",
        tail => "tail.",
    }

    token_instructions! {
        ldstr => "ldstr",
        ldfld => "ldfld",
        ldflda => "ldflda",
        stfld => "stfld",
        ldsfld => "ldsfld",
        ldsflda => "ldsflda",
        stsfld => "stsfld",
        box_ => "box",
        unbox => "unbox",
        unbox_any => "unbox.any",
        castclass => "castclass",
        isinst => "isinst",
        newarr => "newarr",
        ldelema => "ldelema",
        ldelem => "ldelem",
        stelem => "stelem",
        ldobj => "ldobj",
        stobj => "stobj",
        initobj => "initobj",
        constrained => "constrained.",
        ldftn => "ldftn",
        ldvirtftn => "ldvirtftn",
    }

    branch_instructions! {
        br => "br",
        br_s => "br.s",
        brtrue => "brtrue",
        brtrue_s => "brtrue.s",
        brfalse => "brfalse",
        brfalse_s => "brfalse.s",
        beq => "beq",
        beq_s => "beq.s",
        bne_un => "bne.un",
        bne_un_s => "bne.un.s",
        bge => "bge",
        bge_s => "bge.s",
        bgt => "bgt",
        bgt_s => "bgt.s",
        ble => "ble",
        ble_s => "ble.s",
        blt => "blt",
        blt_s => "blt.s",
        leave => "leave",
        leave_s => "leave.s",
    }

    /// Emits a `switch` over the labels.
    ///
    /// # Errors
    /// Returns an error for an empty table or stack underflow.
    pub fn switch(&mut self, labels: &[&str]) -> Result<&mut Self> {
        self.flush_block()?;
        self.encoder.emit_switch(labels)?;
        Ok(self)
    }

    /// Loads an argument with the shortest encoding.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn ldarg(&mut self, index: u16) -> Result<&mut Self> {
        self.flush_block()?;
        self.encoder.emit_ldarg(index)?;
        Ok(self)
    }

    /// Emits `ldarg.s`.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn ldarg_s(&mut self, index: u8) -> Result<&mut Self> {
        self.emit("ldarg.s", Some(Operand::Immediate(Immediate::UInt8(index))))
    }

    /// Loads an argument address.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn ldarga(&mut self, index: u16) -> Result<&mut Self> {
        self.flush_block()?;
        self.encoder.emit_ldarga(index)?;
        Ok(self)
    }

    /// Stores into an argument.
    ///
    /// # Errors
    /// Returns an error on stack underflow.
    pub fn starg(&mut self, index: u16) -> Result<&mut Self> {
        self.flush_block()?;
        self.encoder.emit_starg(index)?;
        Ok(self)
    }

    /// Loads a local with the shortest encoding.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn ldloc(&mut self, index: u16) -> Result<&mut Self> {
        self.flush_block()?;
        self.encoder.emit_ldloc(index)?;
        Ok(self)
    }

    /// Loads a local address.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn ldloca(&mut self, index: u16) -> Result<&mut Self> {
        self.flush_block()?;
        self.encoder.emit_ldloca(index)?;
        Ok(self)
    }

    /// Stores into a local with the shortest encoding.
    ///
    /// # Errors
    /// Returns an error on stack underflow.
    pub fn stloc(&mut self, index: u16) -> Result<&mut Self> {
        self.flush_block()?;
        self.encoder.emit_stloc(index)?;
        Ok(self)
    }

    /// Emits `ldc.i4` with a 32-bit operand.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn ldc_i4(&mut self, value: i32) -> Result<&mut Self> {
        self.emit("ldc.i4", Some(Operand::Immediate(Immediate::Int32(value))))
    }

    /// Emits `ldc.i4.s`.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn ldc_i4_s(&mut self, value: i8) -> Result<&mut Self> {
        self.emit("ldc.i4.s", Some(Operand::Immediate(Immediate::Int8(value))))
    }

    /// Loads an integer constant with the shortest encoding.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn ldc_i4_const(&mut self, value: i32) -> Result<&mut Self> {
        self.flush_block()?;
        self.encoder.emit_ldc_i4(value)?;
        Ok(self)
    }

    /// Emits `ldc.i8`.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn ldc_i8(&mut self, value: i64) -> Result<&mut Self> {
        self.emit("ldc.i8", Some(Operand::Immediate(Immediate::Int64(value))))
    }

    /// Emits `ldc.r8`.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn ldc_r8(&mut self, value: f64) -> Result<&mut Self> {
        self.emit("ldc.r8", Some(Operand::Immediate(Immediate::Float64(value))))
    }

    fn symbols(&self, token: Token) -> Result<&'a dyn SymbolTable> {
        self.symbols
            .ok_or_else(|| malformed_error!("Call to {} needs a symbol table", token))
    }

    fn emit_call(
        &mut self,
        mnemonic: &str,
        token: Token,
        pops: usize,
        has_result: bool,
    ) -> Result<&mut Self> {
        self.flush_block()?;
        let pops = u8::try_from(pops)
            .map_err(|_| malformed_error!("Call to {} has too many arguments", token))?;
        self.encoder
            .emit_call(mnemonic, Some(Operand::Token(token)), pops, has_result)?;
        Ok(self)
    }

    /// Emits `call`.
    ///
    /// # Errors
    /// Returns an error without a symbol table or for unknown methods.
    pub fn call(&mut self, method: Token) -> Result<&mut Self> {
        let signature = self.symbols(method)?.method(method)?.signature();
        self.emit_call("call", method, signature.stack_pops(), signature.has_result())
    }

    /// Emits `callvirt`.
    ///
    /// # Errors
    /// Returns an error without a symbol table or for unknown methods.
    pub fn callvirt(&mut self, method: Token) -> Result<&mut Self> {
        let signature = self.symbols(method)?.method(method)?.signature();
        self.emit_call(
            "callvirt",
            method,
            signature.stack_pops(),
            signature.has_result(),
        )
    }

    /// Emits `newobj`.
    ///
    /// # Errors
    /// Returns an error without a symbol table or for unknown constructors.
    pub fn newobj(&mut self, constructor: Token) -> Result<&mut Self> {
        let params = self.symbols(constructor)?.method(constructor)?.params.len();
        self.emit_call("newobj", constructor, params, true)
    }

    /// Emits `calli` with a call-site signature token.
    ///
    /// # Errors
    /// Returns an error without a symbol table or if the token is not a call-site
    /// signature.
    pub fn calli(&mut self, signature: Token) -> Result<&mut Self> {
        let standalone = self.symbols(signature)?.standalone_signature(signature)?;
        let StandAloneSignature::Method(call_site) = standalone.as_ref() else {
            return Err(malformed_error!("{} is not a call-site signature", signature));
        };
        let pops = call_site.stack_pops() + 1;
        let has_result = call_site.has_result();
        self.emit_call("calli", signature, pops, has_result)
    }
}

impl Default for InstructionAssembler<'_> {
    fn default() -> Self {
        Self::new()
    }
}
