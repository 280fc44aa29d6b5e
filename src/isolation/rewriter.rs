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

//! The method rewriter.
//!
//! [`rewrite`] turns a method body into an equivalent [`DynamicMethod`] whose call
//! sites go through interception stubs. The body is re-emitted one instruction at a
//! time through an [`InstructionEncoder`]:
//!
//! - every branch and switch target gets a label, and short branches are promoted to
//!   their long forms since stub calls change instruction sizes;
//! - exception regions are reopened at the same instruction boundaries through a
//!   [`RegionTracker`];
//! - `call`, `callvirt`, `newobj`, `ldftn` and `ldvirtftn` become `call` to a stub
//!   held in the dynamic method's scope, unless the run forwards the target;
//! - a `constrained.` prefix is folded into the virtual call stub it precedes.
//!
//! Instance methods get their receiver as an explicit first parameter. For interface
//! dispatch the receiver is an `object`; value type bodies then unbox it after every
//! load of argument 0.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use crate::{
    assembly::{
        decode_method, long_form_mnemonic,
        opcodes::{
            FE_LDARG, FE_LDARGA, FE_PREFIX, FE_STARG, LDARGA_S, LDARG_0, LDARG_S, STARG_S,
        },
        FlowType, Instruction, InstructionEncoder, Operand,
    },
    emulation::{DynamicMethod, DynamicScope, ScopeEntry},
    isolation::{
        context::RunContext,
        regions::RegionTracker,
        stubs::{receiver_sig, StubKind},
    },
    metadata::{MethodDef, MethodDefRc, StandAloneSignature, SymbolTable, Token, TypeSig},
    Error, Result,
};

/// Maps argument indices of the original body to the rewritten one.
///
/// Instance bodies already number the receiver as argument 0, so the explicit
/// receiver parameter keeps index 0 and the shift is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgumentLayout {
    count: u16,
    shift: u16,
}

impl ArgumentLayout {
    /// The layout of a rewrite of `method`.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] for more parameters than an index can address.
    pub fn new(method: &MethodDef) -> Result<Self> {
        let count = method.params.len() + usize::from(!method.is_static());
        let count = u16::try_from(count)
            .map_err(|_| malformed_error!("{} has too many parameters", method.name))?;
        Ok(ArgumentLayout { count, shift: 0 })
    }

    /// Number of arguments, receiver included.
    #[must_use]
    pub fn count(&self) -> u16 {
        self.count
    }

    /// The rewritten index of argument `index`.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] for indices past the last argument.
    pub fn map(&self, index: u16) -> Result<u16> {
        if index >= self.count {
            return Err(malformed_error!(
                "Argument {} out of range, the method has {}",
                index,
                self.count
            ));
        }
        Ok(index + self.shift)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgumentAccess {
    Load,
    Address,
    Store,
}

fn argument_access(instruction: &Instruction) -> Option<(ArgumentAccess, u16)> {
    let index = instruction.argument_index()?;
    let access = match (instruction.prefix, instruction.opcode) {
        (0, LDARG_0..=0x05 | LDARG_S) | (FE_PREFIX, FE_LDARG) => ArgumentAccess::Load,
        (0, LDARGA_S) | (FE_PREFIX, FE_LDARGA) => ArgumentAccess::Address,
        (0, STARG_S) | (FE_PREFIX, FE_STARG) => ArgumentAccess::Store,
        _ => return None,
    };
    Some((access, index))
}

fn label(offset: u64) -> String {
    format!("IL_{offset:04X}")
}

/// Rewrites `method` for execution under `context`.
///
/// # Errors
/// Returns [`Error::UnreadableMethodBody`] when the method has no body,
/// [`Error::UnsupportedInstruction`] for instructions without an emission rule, and
/// any decoding or encoding error of the body.
pub fn rewrite(
    context: &Arc<RunContext>,
    symbols: &dyn SymbolTable,
    method: &MethodDefRc,
    interface_dispatch: bool,
) -> Result<DynamicMethod> {
    let decoded = decode_method(symbols, method)?;
    let owner = method.declaring_type;

    let mut params = Vec::with_capacity(method.params.len() + 1);
    if !method.is_static() {
        params.push(if interface_dispatch {
            TypeSig::Object
        } else {
            receiver_sig(symbols, owner)?
        });
    }
    params.extend(method.params.iter().cloned());

    let mut rewriter = Rewriter {
        context,
        symbols,
        encoder: InstructionEncoder::new(),
        scope: DynamicScope::new(),
        stub_tokens: HashMap::new(),
        layout: ArgumentLayout::new(method)?,
        unbox_receiver: interface_dispatch && !method.is_static() && symbols.is_value_type(owner),
        owner,
        constrained: None,
    };
    rewriter.encoder.set_branch_optimization(false);

    let targets: BTreeSet<u64> = decoded
        .instructions
        .iter()
        .flat_map(|instruction| instruction.branch_targets.iter().copied())
        .collect();
    let regions = RegionTracker::new(&decoded.exception_regions);

    for instruction in &decoded.instructions {
        regions.apply(instruction.offset, &mut rewriter.encoder)?;
        if targets.contains(&instruction.offset) {
            rewriter.encoder.define_label(&label(instruction.offset))?;
        }
        if let Err(error) = rewriter.emit(instruction) {
            if let Error::UnsupportedInstruction { offset, reason } = &error {
                log::warn!(
                    "cannot rewrite {}: IL_{offset:04X} {reason}",
                    symbols.method_name(method.token)
                );
            }
            return Err(error);
        }
    }
    regions.apply(decoded.code_size, &mut rewriter.encoder)?;

    let Rewriter { encoder, scope, .. } = rewriter;
    let stub_sites = scope.len();
    let (code, computed_max_stack, _, handlers) = encoder.finalize()?;
    let max_stack = u16::try_from(decoded.max_stack)
        .unwrap_or(u16::MAX)
        .max(computed_max_stack);

    let name = format!(
        "dynamic_{}_{}",
        symbols
            .type_def(owner)
            .map(|def| def.name.clone())
            .unwrap_or_else(|_| owner.to_string()),
        method.name
    );
    log::debug!(
        "rewrote {} into {name} ({} bytes, {stub_sites} stub(s){})",
        symbols.method_name(method.token),
        code.len(),
        if interface_dispatch { ", interface dispatch" } else { "" }
    );

    DynamicMethod::new(
        name,
        method.identity(),
        params,
        method.return_type.clone(),
        decoded.locals,
        scope,
        &code,
        max_stack,
        handlers,
    )
}

struct Rewriter<'a> {
    context: &'a Arc<RunContext>,
    symbols: &'a dyn SymbolTable,
    encoder: InstructionEncoder,
    scope: DynamicScope,
    stub_tokens: HashMap<(StubKind, Token), Token>,
    layout: ArgumentLayout,
    unbox_receiver: bool,
    owner: Token,
    constrained: Option<Token>,
}

impl Rewriter<'_> {
    fn emit(&mut self, instruction: &Instruction) -> Result<()> {
        if let Some((access, index)) = argument_access(instruction) {
            return self.emit_argument(access, index);
        }

        match instruction.mnemonic {
            "constrained." => {
                self.constrained = Some(operand_token(instruction)?);
                return Ok(());
            }
            "tail." => return Ok(()),
            "call" | "callvirt" | "newobj" | "ldftn" | "ldvirtftn" => {
                return self.emit_call_site(instruction)
            }
            "calli" => return self.emit_indirect_call(instruction),
            "jmp" | "arglist" | "mkrefany" | "refanyval" | "refanytype" => {
                return Err(unsupported_instruction!(
                    instruction.offset,
                    "{} has no emission rule",
                    instruction.mnemonic
                ))
            }
            _ => {}
        }

        if let Some(constraint) = self.constrained.take() {
            return Err(unsupported_instruction!(
                instruction.offset,
                "constrained. {} must prefix callvirt, found {}",
                constraint,
                instruction.mnemonic
            ));
        }

        match instruction.flow_type {
            FlowType::Switch => {
                let labels: Vec<String> =
                    instruction.branch_targets.iter().copied().map(label).collect();
                let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
                self.encoder.emit_switch(&labels)
            }
            FlowType::ConditionalBranch | FlowType::UnconditionalBranch | FlowType::Leave => {
                let mnemonic = long_form_mnemonic(instruction.mnemonic).ok_or_else(|| {
                    unsupported_instruction!(
                        instruction.offset,
                        "no long form for {}",
                        instruction.mnemonic
                    )
                })?;
                let target = instruction.branch_targets.first().copied().ok_or_else(|| {
                    unsupported_instruction!(
                        instruction.offset,
                        "{} without a target",
                        instruction.mnemonic
                    )
                })?;
                self.encoder.emit_branch(mnemonic, &label(target))
            }
            _ => self.encoder.emit_instruction_decoded(instruction),
        }
    }

    fn emit_argument(&mut self, access: ArgumentAccess, index: u16) -> Result<()> {
        let index = self.layout.map(index)?;
        match access {
            ArgumentAccess::Load => {
                self.encoder.emit_ldarg(index)?;
                if index == 0 && self.unbox_receiver {
                    self.encoder
                        .emit_instruction("unbox", Some(Operand::Token(self.owner)))?;
                }
                Ok(())
            }
            ArgumentAccess::Address => self.encoder.emit_ldarga(index),
            ArgumentAccess::Store => self.encoder.emit_starg(index),
        }
    }

    fn emit_call_site(&mut self, instruction: &Instruction) -> Result<()> {
        let token = operand_token(instruction)?;
        let constrained = self.constrained.take();
        let mnemonic = instruction.mnemonic;
        if constrained.is_some() && mnemonic != "callvirt" {
            return Err(unsupported_instruction!(
                instruction.offset,
                "constrained. must prefix callvirt, found {}",
                mnemonic
            ));
        }

        let method = self.symbols.method(token)?;
        let virtual_call = matches!(mnemonic, "callvirt" | "ldvirtftn");

        if self.context.forwards(self.symbols, &method, virtual_call) {
            if let Some(constraint) = constrained {
                self.encoder
                    .emit_instruction("constrained.", Some(Operand::Token(constraint)))?;
            }
            let signature = method.signature();
            let (pops, has_result) = match mnemonic {
                "newobj" => (method.params.len(), true),
                "ldftn" => (0, true),
                "ldvirtftn" => (1, true),
                _ => (signature.stack_pops(), signature.has_result()),
            };
            return self.encoder.emit_call(
                mnemonic,
                Some(Operand::Token(token)),
                stack_count(instruction, pops)?,
                has_result,
            );
        }

        let kind = StubKind::for_instruction(mnemonic, constrained).ok_or_else(|| {
            unsupported_instruction!(instruction.offset, "no stub for {}", mnemonic)
        })?;
        let stub = self.context.stub(self.symbols, kind, &method)?;
        let scope_token = match self.stub_tokens.get(&(kind, token)) {
            Some(existing) => *existing,
            None => {
                let added = self.scope.add(ScopeEntry::Native(Arc::clone(stub.native())));
                self.stub_tokens.insert((kind, token), added);
                added
            }
        };

        let native = stub.native();
        self.encoder.emit_call(
            "call",
            Some(Operand::Token(scope_token)),
            stack_count(instruction, native.params().len())?,
            *native.return_type() != TypeSig::Void,
        )
    }

    fn emit_indirect_call(&mut self, instruction: &Instruction) -> Result<()> {
        let token = operand_token(instruction)?;
        let signature = self.symbols.standalone_signature(token)?;
        let StandAloneSignature::Method(call_site) = signature.as_ref() else {
            return Err(unsupported_instruction!(
                instruction.offset,
                "calli through {} which is not a call-site signature",
                token
            ));
        };
        self.encoder.emit_call(
            "calli",
            Some(Operand::Token(token)),
            stack_count(instruction, call_site.stack_pops() + 1)?,
            call_site.has_result(),
        )
    }
}

fn operand_token(instruction: &Instruction) -> Result<Token> {
    instruction.token().ok_or_else(|| {
        unsupported_instruction!(
            instruction.offset,
            "{} without a token operand",
            instruction.mnemonic
        )
    })
}

fn stack_count(instruction: &Instruction, count: usize) -> Result<u8> {
    u8::try_from(count).map_err(|_| {
        unsupported_instruction!(
            instruction.offset,
            "{} pops {} values",
            instruction.mnemonic,
            count
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        isolation::config::IsolationConfig,
        metadata::{
            builders::{FieldDefBuilder, MethodBodyBuilder, MethodDefBuilder, TypeDefBuilder},
            method::encode_method_body,
            Module,
        },
    };

    fn hello(module: &Module) -> Result<MethodDefRc> {
        let program = TypeDefBuilder::new("Demo", "Program").build(module)?;
        let greeting = module.add_user_string("hello");
        let write_line = module.corlib().console_write_line_string;
        let main = MethodDefBuilder::new("Main")
            .static_method()
            .body(MethodBodyBuilder::new().implementation(move |asm| {
                asm.ldstr(greeting)?.call(write_line)?.ret()?;
                Ok(())
            }))
            .build(module, program)?;
        module.method(main)
    }

    #[test]
    fn call_sites_become_stub_calls() -> Result<()> {
        let module = Module::new();
        let main = hello(&module)?;
        let context = RunContext::new(Vec::new(), IsolationConfig::strict());

        let rewritten = rewrite(&context, &module, &main, false)?;
        assert_eq!(rewritten.name(), "dynamic_Program_Main");
        assert!(rewritten.params().is_empty());

        let call = &rewritten.decoded().instructions[1];
        assert_eq!(call.mnemonic, "call");
        let token = call.token().unwrap();
        assert!(token.is_dynamic());
        assert_eq!(
            rewritten.scope().describe(token, &module),
            "stub_call_Console_WriteLine"
        );
        assert_eq!(context.cache().stub_count(), 1);
        Ok(())
    }

    #[test]
    fn forwarded_call_sites_are_kept() -> Result<()> {
        let module = Module::new();
        let main = hello(&module)?;
        let context = RunContext::new(Vec::new(), IsolationConfig::default());

        let rewritten = rewrite(&context, &module, &main, false)?;
        let call = &rewritten.decoded().instructions[1];
        assert_eq!(call.token(), Some(module.corlib().console_write_line_string));
        assert!(rewritten.scope().is_empty());
        Ok(())
    }

    #[test]
    fn short_branches_are_promoted() -> Result<()> {
        let module = Module::new();
        let program = TypeDefBuilder::new("Demo", "Program").build(&module)?;
        let sign = MethodDefBuilder::new("Sign")
            .static_method()
            .param(TypeSig::I4)
            .returns(TypeSig::I4)
            .body(MethodBodyBuilder::new().implementation(|asm| {
                asm.ldarg_0()?
                    .brtrue_s("nonzero")?
                    .ldc_i4_0()?
                    .ret()?
                    .label("nonzero")?
                    .ldc_i4_1()?
                    .ret()?;
                Ok(())
            }))
            .build(&module, program)?;
        let sign = module.method(sign)?;
        let context = RunContext::new(Vec::new(), IsolationConfig::default());

        let rewritten = rewrite(&context, &module, &sign, false)?;
        let mnemonics: Vec<_> = rewritten
            .decoded()
            .instructions
            .iter()
            .map(|instruction| instruction.mnemonic)
            .collect();
        assert_eq!(mnemonics, ["ldarg.0", "brtrue", "ldc.i4.0", "ret", "ldc.i4.1", "ret"]);
        assert_eq!(rewritten.decoded().instructions[1].branch_targets, vec![8]);
        Ok(())
    }

    #[test]
    fn unsupported_instructions_abort() -> Result<()> {
        let module = Module::new();
        let program = TypeDefBuilder::new("Demo", "Program").build(&module)?;
        let varargs = MethodDefBuilder::new("VarArgs")
            .static_method()
            .build(&module, program)?;
        // arglist; pop; ret
        module.set_body(varargs, encode_method_body(&[0xFE, 0x00, 0x26, 0x2A], 8, 0, false, &[])?)?;
        let varargs = module.method(varargs)?;
        let context = RunContext::new(Vec::new(), IsolationConfig::default());

        assert!(matches!(
            rewrite(&context, &module, &varargs, false),
            Err(Error::UnsupportedInstruction { offset: 0, .. })
        ));
        Ok(())
    }

    #[test]
    fn bodiless_methods_are_unreadable() {
        let module = Module::new();
        let write_line = module.method(module.corlib().console_write_line_string).unwrap();
        let context = RunContext::new(Vec::new(), IsolationConfig::default());
        assert!(matches!(
            rewrite(&context, &module, &write_line, false),
            Err(Error::UnreadableMethodBody(_))
        ));
    }

    #[test]
    fn value_type_receivers() -> Result<()> {
        let module = Module::new();
        let point = TypeDefBuilder::new("Demo", "Point").value_type().build(&module)?;
        let x = FieldDefBuilder::new("X", TypeSig::I4).build(&module, point)?;
        let get_x = MethodDefBuilder::new("GetX")
            .returns(TypeSig::I4)
            .body(MethodBodyBuilder::new().implementation(move |asm| {
                asm.ldarg_0()?.ldfld(x)?.ret()?;
                Ok(())
            }))
            .build(&module, point)?;
        let get_x = module.method(get_x)?;
        let context = RunContext::new(Vec::new(), IsolationConfig::default());

        let direct = rewrite(&context, &module, &get_x, false)?;
        assert_eq!(direct.params(), [TypeSig::ValueType(point).by_ref()]);

        let through_interface = rewrite(&context, &module, &get_x, true)?;
        assert_eq!(through_interface.params(), [TypeSig::Object]);
        let mnemonics: Vec<_> = through_interface
            .decoded()
            .instructions
            .iter()
            .map(|instruction| instruction.mnemonic)
            .collect();
        assert_eq!(mnemonics, ["ldarg.0", "unbox", "ldfld", "ret"]);
        Ok(())
    }

    #[test]
    fn argument_layout() {
        let module = Module::new();
        let concat = module.method(module.corlib().string_concat).unwrap();
        let layout = ArgumentLayout::new(&concat).unwrap();
        assert_eq!(layout.count(), 2);
        assert_eq!(layout.map(1).unwrap(), 1);
        assert!(layout.map(2).is_err());

        let upper = module.method(module.corlib().string_to_upper).unwrap();
        assert_eq!(ArgumentLayout::new(&upper).unwrap().map(0).unwrap(), 0);
    }
}
