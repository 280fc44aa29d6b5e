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

//! CIL instruction decoding.
//!
//! - [`decode_instruction`] - decodes one instruction at the parser position
//! - [`decode_stream`] - decodes a whole code buffer linearly
//! - [`decode_method`] - decodes a method's body into a [`DecodedMethod`], with its
//!   locals and exception clauses
//!
//! # Usage Examples
//!
//! ```rust
//! use dotshim::{assembly::{decode_instruction, decode_stream}, Parser};
//!
//! let code = [0x72, 0x01, 0x00, 0x00, 0x70]; // ldstr 0x70000001
//! let mut parser = Parser::new(&code);
//! let instruction = decode_instruction(&mut parser)?;
//! assert_eq!(instruction.mnemonic, "ldstr");
//!
//! let instructions = decode_stream(&[0x00, 0x2A])?; // nop, ret
//! assert_eq!(instructions.len(), 2);
//! assert_eq!(instructions[1].offset, 1);
//! # Ok::<(), dotshim::Error>(())
//! ```

use crate::{
    assembly::{
        instruction::{FlowType, Immediate, Instruction, Operand, OperandType, StackBehavior},
        instructions::{INSTRUCTIONS, INSTRUCTIONS_FE},
        opcodes::FE_PREFIX,
    },
    file::parser::Parser,
    metadata::{
        method::{ExceptionHandler, ExceptionRegionKind, LocalVariable, MethodBody, MethodDef},
        symbols::SymbolTable,
    },
    Error, Result,
};

/// A method body decoded into instructions.
#[derive(Debug, Clone)]
pub struct DecodedMethod {
    /// Instructions in offset order
    pub instructions: Vec<Instruction>,
    /// Local variable slots
    pub locals: Vec<LocalVariable>,
    /// Exception clauses in table order (inner clauses first)
    pub exception_regions: Vec<ExceptionHandler>,
    /// Declared maximum stack depth
    pub max_stack: usize,
    /// Whether locals are zero-initialized
    pub init_locals: bool,
    /// Size of the code in bytes
    pub code_size: u64,
}

impl DecodedMethod {
    /// Decodes `code` and checks that every branch target and clause boundary falls on
    /// an instruction boundary.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] for misaligned targets, and any error of
    /// [`decode_stream`].
    pub fn new(
        code: &[u8],
        locals: Vec<LocalVariable>,
        exception_regions: Vec<ExceptionHandler>,
        max_stack: usize,
        init_locals: bool,
    ) -> Result<Self> {
        let decoded = DecodedMethod {
            instructions: decode_stream(code)?,
            locals,
            exception_regions,
            max_stack,
            init_locals,
            code_size: code.len() as u64,
        };
        decoded.validate()?;
        Ok(decoded)
    }

    /// Index of the instruction starting at `offset`.
    #[must_use]
    pub fn position(&self, offset: u64) -> Option<usize> {
        self.instructions
            .binary_search_by_key(&offset, |instruction| instruction.offset)
            .ok()
    }

    /// The instruction starting at `offset`.
    #[must_use]
    pub fn instruction_at(&self, offset: u64) -> Option<&Instruction> {
        self.position(offset).map(|index| &self.instructions[index])
    }

    fn is_boundary(&self, offset: u64) -> bool {
        offset == self.code_size || self.position(offset).is_some()
    }

    fn validate(&self) -> Result<()> {
        for instruction in &self.instructions {
            for target in &instruction.branch_targets {
                if self.position(*target).is_none() {
                    return Err(malformed_error!(
                        "Branch at IL_{:04X} targets IL_{:04X}, which is not an instruction",
                        instruction.offset,
                        target
                    ));
                }
            }
        }

        for clause in &self.exception_regions {
            let mut bounds = vec![
                clause.try_offset,
                clause.try_end(),
                clause.handler_offset,
                clause.handler_end(),
            ];
            if clause.kind() == ExceptionRegionKind::Filter {
                bounds.push(clause.filter_offset);
            }
            if let Some(bad) = bounds
                .into_iter()
                .find(|bound| !self.is_boundary(u64::from(*bound)))
            {
                return Err(malformed_error!(
                    "Exception clause boundary IL_{:04X} is not an instruction boundary",
                    bad
                ));
            }
        }

        Ok(())
    }
}

/// Decodes the body of `method`.
///
/// # Errors
/// Returns [`Error::UnreadableMethodBody`] if the method is abstract, implemented by
/// the runtime, a P/Invoke, or simply has no CIL bytes. Damaged bodies report
/// [`Error::Malformed`] or [`Error::OutOfBounds`]; unknown opcodes report
/// [`Error::UnsupportedInstruction`].
pub fn decode_method(symbols: &dyn SymbolTable, method: &MethodDef) -> Result<DecodedMethod> {
    let data = match method.body_bytes() {
        Some(data) if !method.is_abstract() && !method.is_internal_call() && !method.is_pinvoke() => {
            data
        }
        _ => return Err(Error::UnreadableMethodBody(method.token)),
    };

    let body = MethodBody::from(data)?;
    let code = body.code(data)?;
    let mut locals = symbols.locals(body.local_signature())?;
    if method.is_instantiation() {
        for local in &mut locals {
            local.signature = local.signature.substitute(&method.generic_args);
        }
    }

    DecodedMethod::new(
        code,
        locals,
        body.exception_handlers,
        body.max_stack,
        body.is_init_local,
    )
}

/// Decodes a code buffer into instructions, linearly from offset 0.
///
/// # Errors
/// Returns [`Error::OutOfBounds`] for a truncated final instruction and
/// [`Error::UnsupportedInstruction`] for unknown or reserved opcodes.
pub fn decode_stream(code: &[u8]) -> Result<Vec<Instruction>> {
    let mut parser = Parser::new(code);
    let mut instructions = Vec::new();

    while parser.has_more_data() {
        instructions.push(decode_instruction(&mut parser)?);
    }

    Ok(instructions)
}

/// Decodes a single instruction at the current parser position.
///
/// The instruction offset is the parser position; branch targets are absolute offsets
/// computed from the end of the instruction plus the sign-extended displacement.
///
/// # Errors
/// Returns [`Error::OutOfBounds`] if the operand is truncated and
/// [`Error::UnsupportedInstruction`] for unknown or reserved opcodes.
pub fn decode_instruction(parser: &mut Parser) -> Result<Instruction> {
    let offset = parser.pos() as u64;
    let first_byte = parser.read_le::<u8>()?;

    let (cil_instruction, prefix, opcode) = if first_byte == FE_PREFIX {
        let second_byte = parser.read_le::<u8>()?;
        match INSTRUCTIONS_FE.get(second_byte as usize) {
            Some(instr) => (instr, FE_PREFIX, second_byte),
            None => {
                return Err(unsupported_instruction!(
                    offset,
                    "unknown opcode FE {:02X}",
                    second_byte
                ))
            }
        }
    } else {
        match INSTRUCTIONS.get(first_byte as usize) {
            Some(instr) => (instr, 0, first_byte),
            None => {
                return Err(unsupported_instruction!(
                    offset,
                    "unknown opcode {:02X}",
                    first_byte
                ))
            }
        }
    };

    if cil_instruction.is_reserved() {
        return Err(unsupported_instruction!(
            offset,
            "reserved opcode {:02X}{:02X}",
            prefix,
            opcode
        ));
    }

    let operand = match cil_instruction.op_type {
        OperandType::None => Operand::None,
        OperandType::Int8 => Operand::Immediate(Immediate::Int8(parser.read_le::<i8>()?)),
        OperandType::UInt8 => Operand::Immediate(Immediate::UInt8(parser.read_le::<u8>()?)),
        OperandType::Int16 => Operand::Immediate(Immediate::Int16(parser.read_le::<i16>()?)),
        OperandType::UInt16 => Operand::Immediate(Immediate::UInt16(parser.read_le::<u16>()?)),
        OperandType::Int32 => Operand::Immediate(Immediate::Int32(parser.read_le::<i32>()?)),
        OperandType::UInt32 => Operand::Immediate(Immediate::UInt32(parser.read_le::<u32>()?)),
        OperandType::Int64 => Operand::Immediate(Immediate::Int64(parser.read_le::<i64>()?)),
        OperandType::UInt64 => Operand::Immediate(Immediate::UInt64(parser.read_le::<u64>()?)),
        OperandType::Float32 => Operand::Immediate(Immediate::Float32(parser.read_le::<f32>()?)),
        OperandType::Float64 => Operand::Immediate(Immediate::Float64(parser.read_le::<f64>()?)),
        OperandType::Token => Operand::Token(parser.read_le::<u32>()?.into()),
        OperandType::Switch => {
            let case_count = parser.read_le::<u32>()? as usize;
            if case_count.saturating_mul(4) > parser.remaining() {
                return Err(out_of_bounds_error!());
            }

            let mut targets = Vec::with_capacity(case_count);
            for _ in 0..case_count {
                targets.push(parser.read_le::<i32>()?);
            }
            Operand::Switch(targets)
        }
    };
    let size = parser.pos() as u64 - offset;

    let mut instruction = Instruction {
        offset,
        size,
        opcode,
        prefix,
        mnemonic: cil_instruction.instr,
        category: cil_instruction.category,
        flow_type: cil_instruction.flow,
        stack_behavior: StackBehavior {
            pops: cil_instruction.stack_pops,
            pushes: cil_instruction.stack_pushes,
            // Stack effects are tiny; the subtraction may legitimately be negative
            #[allow(clippy::cast_possible_wrap)]
            net_effect: cil_instruction.stack_pushes as i8 - cil_instruction.stack_pops as i8,
        },
        branch_targets: Vec::new(),
        operand,
    };

    let next = instruction.next_offset();
    match instruction.flow_type {
        FlowType::ConditionalBranch | FlowType::UnconditionalBranch | FlowType::Leave => {
            if let Operand::Immediate(value) = instruction.operand {
                let displacement = <Immediate as Into<u64>>::into(value);
                instruction
                    .branch_targets
                    .push(next.wrapping_add(displacement));
            }
        }
        FlowType::Switch => {
            if let Operand::Switch(targets) = &instruction.operand {
                for &target in targets {
                    #[allow(clippy::cast_sign_loss)]
                    let displacement = i64::from(target) as u64;
                    instruction
                        .branch_targets
                        .push(next.wrapping_add(displacement));
                }
            }
        }
        _ => {}
    }

    Ok(instruction)
}
