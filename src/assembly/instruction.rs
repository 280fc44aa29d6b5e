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

//! Decoded CIL instructions.
//!
//! An [`Instruction`] is the decoder's output and the encoder's input: opcode bytes,
//! byte offset, a typed [`Operand`], the static stack effect and any branch targets.
//! Offsets are always relative to the start of the method's code, which lets branch
//! targets and exception clause boundaries be matched against instruction offsets
//! directly.

use std::fmt::{self, UpperHex};

use crate::metadata::token::Token;

/// How an operand is encoded after the opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    /// No operand
    None,
    /// Signed 8-bit immediate, also short branch displacements
    Int8,
    /// Unsigned 8-bit immediate, also short argument and local indices
    UInt8,
    /// Signed 16-bit immediate
    Int16,
    /// Unsigned 16-bit immediate, also long argument and local indices
    UInt16,
    /// Signed 32-bit immediate, also long branch displacements
    Int32,
    /// Unsigned 32-bit immediate
    UInt32,
    /// Signed 64-bit immediate
    Int64,
    /// Unsigned 64-bit immediate
    UInt64,
    /// 32-bit float
    Float32,
    /// 64-bit float
    Float64,
    /// Metadata token
    Token,
    /// Switch jump table
    Switch,
}

impl OperandType {
    /// Encoded size in bytes, `None` for the variable-length switch table.
    #[must_use]
    pub const fn size(&self) -> Option<usize> {
        match self {
            OperandType::None => Some(0),
            OperandType::Int8 | OperandType::UInt8 => Some(1),
            OperandType::Int16 | OperandType::UInt16 => Some(2),
            OperandType::Int32
            | OperandType::UInt32
            | OperandType::Float32
            | OperandType::Token => Some(4),
            OperandType::Int64 | OperandType::UInt64 | OperandType::Float64 => Some(8),
            OperandType::Switch => None,
        }
    }
}

/// An immediate operand value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Immediate {
    /// Signed 8-bit
    Int8(i8),
    /// Unsigned 8-bit
    UInt8(u8),
    /// Signed 16-bit
    Int16(i16),
    /// Unsigned 16-bit
    UInt16(u16),
    /// Signed 32-bit
    Int32(i32),
    /// Unsigned 32-bit
    UInt32(u32),
    /// Signed 64-bit
    Int64(i64),
    /// Unsigned 64-bit
    UInt64(u64),
    /// 32-bit float
    Float32(f32),
    /// 64-bit float
    Float64(f64),
}

impl UpperHex for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Immediate::Int8(value) => write!(f, "{value:02X}"),
            Immediate::UInt8(value) => write!(f, "{value:02X}"),
            Immediate::Int16(value) => write!(f, "{value:04X}"),
            Immediate::UInt16(value) => write!(f, "{value:04X}"),
            Immediate::Int32(value) => write!(f, "{value:08X}"),
            Immediate::UInt32(value) => write!(f, "{value:08X}"),
            Immediate::Int64(value) => write!(f, "{value:016X}"),
            Immediate::UInt64(value) => write!(f, "{value:016X}"),
            Immediate::Float32(value) => write!(f, "{:08X}", value.to_bits()),
            Immediate::Float64(value) => write!(f, "{:016X}", value.to_bits()),
        }
    }
}

impl fmt::Display for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Immediate::Int8(value) => write!(f, "{value}"),
            Immediate::UInt8(value) => write!(f, "{value}"),
            Immediate::Int16(value) => write!(f, "{value}"),
            Immediate::UInt16(value) => write!(f, "{value}"),
            Immediate::Int32(value) => write!(f, "{value}"),
            Immediate::UInt32(value) => write!(f, "{value}"),
            Immediate::Int64(value) => write!(f, "{value}"),
            Immediate::UInt64(value) => write!(f, "{value}"),
            Immediate::Float32(value) => write!(f, "{value}"),
            Immediate::Float64(value) => write!(f, "{value}"),
        }
    }
}

impl From<Immediate> for u64 {
    fn from(val: Immediate) -> Self {
        // Signed values sign-extend, so branch displacements can be added with wrapping_add
        match val {
            #[allow(clippy::cast_sign_loss)]
            Immediate::Int8(value) => value as u64,
            Immediate::UInt8(value) => u64::from(value),
            #[allow(clippy::cast_sign_loss)]
            Immediate::Int16(value) => value as u64,
            Immediate::UInt16(value) => u64::from(value),
            #[allow(clippy::cast_sign_loss)]
            Immediate::Int32(value) => value as u64,
            Immediate::UInt32(value) => u64::from(value),
            #[allow(clippy::cast_sign_loss)]
            Immediate::Int64(value) => value as u64,
            Immediate::UInt64(value) => value,
            Immediate::Float32(value) => u64::from(value.to_bits()),
            Immediate::Float64(value) => value.to_bits(),
        }
    }
}

/// A decoded operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand
    None,
    /// Immediate value, including raw branch displacements
    Immediate(Immediate),
    /// Absolute branch target offset
    Target(u64),
    /// Metadata token (member, type, field, string or signature)
    Token(Token),
    /// Local variable index
    Local(u16),
    /// Argument index
    Argument(u16),
    /// Switch displacements, relative to the end of the instruction
    Switch(Vec<i32>),
}

/// Control flow behavior of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Falls through to the next instruction
    Sequential,
    /// May branch or fall through
    ConditionalBranch,
    /// Always branches
    UnconditionalBranch,
    /// Calls a method and continues
    Call,
    /// Leaves the method
    Return,
    /// Jump table
    Switch,
    /// Raises an exception
    Throw,
    /// Ends a finally, fault or filter block
    EndFinally,
    /// Leaves a protected region
    Leave,
}

/// Fixed stack effect of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBehavior {
    /// Values popped
    pub pops: u8,
    /// Values pushed
    pub pushes: u8,
    /// `pushes - pops`
    pub net_effect: i8,
}

/// Broad instruction categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionCategory {
    /// Arithmetic
    Arithmetic,
    /// Bitwise and logical
    BitwiseLogical,
    /// Comparisons
    Comparison,
    /// Branches, calls, returns and exception flow
    ControlFlow,
    /// Numeric conversions
    Conversion,
    /// Loads and stores of locals, arguments, constants and indirections
    LoadStore,
    /// Objects, fields, arrays and type operations
    ObjectModel,
    /// Prefixes modifying the next instruction
    Prefix,
    /// Everything else
    Misc,
}

/// One decoded instruction.
#[derive(Clone)]
pub struct Instruction {
    /// Byte offset from the start of the method's code
    pub offset: u64,
    /// Encoded size in bytes, including prefix and operand
    pub size: u64,
    /// Opcode byte (second byte for `0xFE`-prefixed opcodes)
    pub opcode: u8,
    /// `0xFE` for two-byte opcodes, `0` otherwise
    pub prefix: u8,
    /// Mnemonic
    pub mnemonic: &'static str,
    /// Category
    pub category: InstructionCategory,
    /// Control flow behavior
    pub flow_type: FlowType,
    /// Operand
    pub operand: Operand,
    /// Fixed stack effect
    pub stack_behavior: StackBehavior,
    /// Absolute offsets of branch, leave and switch targets
    pub branch_targets: Vec<u64>,
}

impl Instruction {
    /// Offset of the instruction that follows this one.
    #[must_use]
    pub fn next_offset(&self) -> u64 {
        self.offset + self.size
    }

    /// Whether the instruction transfers control to branch targets.
    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(
            self.flow_type,
            FlowType::ConditionalBranch
                | FlowType::UnconditionalBranch
                | FlowType::Switch
                | FlowType::Leave
        )
    }

    /// Whether the instruction is a prefix for the next one.
    #[must_use]
    pub fn is_prefix(&self) -> bool {
        self.category == InstructionCategory::Prefix
    }

    /// Whether this is the `opcode` (with `prefix`) instruction.
    #[must_use]
    pub fn is(&self, prefix: u8, opcode: u8) -> bool {
        self.prefix == prefix && self.opcode == opcode
    }

    /// The token operand, if any.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        match &self.operand {
            Operand::Token(token) => Some(*token),
            _ => None,
        }
    }

    /// The argument index the instruction refers to, for `ldarg`, `ldarga` and `starg`
    /// in all their encodings.
    #[must_use]
    pub fn argument_index(&self) -> Option<u16> {
        match (self.prefix, self.opcode) {
            (0, 0x02..=0x05) => Some(u16::from(self.opcode - 0x02)),
            (0, 0x0E..=0x10) | (0xFE, 0x09..=0x0B) => self.index_operand(),
            _ => None,
        }
    }

    /// The local index the instruction refers to, for `ldloc`, `ldloca` and `stloc`
    /// in all their encodings.
    #[must_use]
    pub fn local_index(&self) -> Option<u16> {
        match (self.prefix, self.opcode) {
            (0, 0x06..=0x09) => Some(u16::from(self.opcode - 0x06)),
            (0, 0x0A..=0x0D) => Some(u16::from(self.opcode - 0x0A)),
            (0, 0x11..=0x13) | (0xFE, 0x0C..=0x0E) => self.index_operand(),
            _ => None,
        }
    }

    fn index_operand(&self) -> Option<u16> {
        match &self.operand {
            Operand::Immediate(Immediate::UInt8(index)) => Some(u16::from(*index)),
            Operand::Immediate(Immediate::UInt16(index))
            | Operand::Local(index)
            | Operand::Argument(index) => Some(*index),
            _ => None,
        }
    }

    /// The integer constant pushed by an `ldc.i4` family instruction.
    #[must_use]
    pub fn i32_constant(&self) -> Option<i32> {
        match (self.prefix, self.opcode, &self.operand) {
            (0, 0x15, _) => Some(-1),
            (0, 0x16..=0x1E, _) => Some(i32::from(self.opcode) - 0x16),
            (0, 0x1F, Operand::Immediate(Immediate::Int8(value))) => Some(i32::from(*value)),
            (0, 0x20, Operand::Immediate(Immediate::Int32(value))) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IL_{:04X} - ", self.offset)?;

        if self.prefix != 0 {
            write!(f, "{:02X}:", self.prefix)?;
        }

        write!(f, "{:02X} - {:<12}", self.opcode, self.mnemonic)?;

        match &self.operand {
            Operand::None => {}
            Operand::Immediate(imm) => write!(f, " 0x{imm:X}")?,
            Operand::Target(target) => write!(f, " -> IL_{target:04X}")?,
            Operand::Token(token) => write!(f, " token:{token}")?,
            Operand::Local(local) => write!(f, " local:{local}")?,
            Operand::Argument(arg) => write!(f, " arg:{arg}")?,
            Operand::Switch(items) => write!(f, " switch[{}]", items.len())?,
        }

        write!(f, " | {:?}", self.category)?;
        if self.flow_type != FlowType::Sequential {
            write!(f, " | {:?}", self.flow_type)?;
        }
        if self.stack_behavior.net_effect != 0 {
            write!(f, " | stack:{:+}", self.stack_behavior.net_effect)?;
        }
        write!(f, " | size:{}", self.size)
    }
}
