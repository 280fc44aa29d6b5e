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

//! The CIL opcode table.
//!
//! Every single-byte opcode and every `0xFE`-prefixed opcode is described by a
//! [`CilInstruction`] entry: mnemonic, operand encoding, category, control flow and
//! the fixed part of its stack effect. Calls (`call`, `callvirt`, `calli`, `newobj`,
//! `ret`) have signature-dependent stack effects; the table lists only their fixed part
//! and callers account for the rest. Reserved slots carry an empty mnemonic.

use crate::assembly::instruction::{FlowType, InstructionCategory, OperandType};

/// Static description of one opcode.
#[derive(Debug, Clone, Copy)]
pub struct CilInstruction<'a> {
    /// Operand encoding following the opcode
    pub op_type: OperandType,
    /// Mnemonic, empty for reserved slots
    pub instr: &'a str,
    /// Instruction category
    pub category: InstructionCategory,
    /// Control flow behavior
    pub flow: FlowType,
    /// Values popped, not counting call arguments
    pub stack_pops: u8,
    /// Values pushed, not counting call results
    pub stack_pushes: u8,
}

impl CilInstruction<'_> {
    /// Whether this slot is unassigned.
    #[must_use]
    pub const fn is_reserved(&self) -> bool {
        self.instr.is_empty()
    }
}

const fn op(
    instr: &'static str,
    op_type: OperandType,
    category: InstructionCategory,
    flow: FlowType,
    stack_pops: u8,
    stack_pushes: u8,
) -> CilInstruction<'static> {
    CilInstruction {
        op_type,
        instr,
        category,
        flow,
        stack_pops,
        stack_pushes,
    }
}

const RESERVED: CilInstruction<'static> = op(
    "",
    OperandType::None,
    InstructionCategory::Misc,
    FlowType::Sequential,
    0,
    0,
);

/// Single-byte opcodes, indexed by opcode byte
pub static INSTRUCTIONS: [CilInstruction<'static>; 225] = [
    /* 0x00 */ op("nop", OperandType::None, InstructionCategory::Misc, FlowType::Sequential, 0, 0),
    /* 0x01 */ op("break", OperandType::None, InstructionCategory::Misc, FlowType::Sequential, 0, 0),
    /* 0x02 */ op("ldarg.0", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x03 */ op("ldarg.1", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x04 */ op("ldarg.2", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x05 */ op("ldarg.3", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x06 */ op("ldloc.0", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x07 */ op("ldloc.1", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x08 */ op("ldloc.2", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x09 */ op("ldloc.3", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x0A */ op("stloc.0", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 0),
    /* 0x0B */ op("stloc.1", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 0),
    /* 0x0C */ op("stloc.2", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 0),
    /* 0x0D */ op("stloc.3", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 0),
    /* 0x0E */ op("ldarg.s", OperandType::UInt8, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x0F */ op("ldarga.s", OperandType::UInt8, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x10 */ op("starg.s", OperandType::UInt8, InstructionCategory::LoadStore, FlowType::Sequential, 1, 0),
    /* 0x11 */ op("ldloc.s", OperandType::UInt8, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x12 */ op("ldloca.s", OperandType::UInt8, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x13 */ op("stloc.s", OperandType::UInt8, InstructionCategory::LoadStore, FlowType::Sequential, 1, 0),
    /* 0x14 */ op("ldnull", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x15 */ op("ldc.i4.m1", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x16 */ op("ldc.i4.0", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x17 */ op("ldc.i4.1", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x18 */ op("ldc.i4.2", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x19 */ op("ldc.i4.3", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x1A */ op("ldc.i4.4", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x1B */ op("ldc.i4.5", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x1C */ op("ldc.i4.6", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x1D */ op("ldc.i4.7", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x1E */ op("ldc.i4.8", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x1F */ op("ldc.i4.s", OperandType::Int8, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x20 */ op("ldc.i4", OperandType::Int32, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x21 */ op("ldc.i8", OperandType::Int64, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x22 */ op("ldc.r4", OperandType::Float32, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x23 */ op("ldc.r8", OperandType::Float64, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x24 */ RESERVED,
    /* 0x25 */ op("dup", OperandType::None, InstructionCategory::Misc, FlowType::Sequential, 1, 2),
    /* 0x26 */ op("pop", OperandType::None, InstructionCategory::Misc, FlowType::Sequential, 1, 0),
    /* 0x27 */ op("jmp", OperandType::Token, InstructionCategory::ControlFlow, FlowType::Return, 0, 0),
    /* 0x28 */ op("call", OperandType::Token, InstructionCategory::ControlFlow, FlowType::Call, 0, 0),
    /* 0x29 */ op("calli", OperandType::Token, InstructionCategory::ControlFlow, FlowType::Call, 0, 0),
    /* 0x2A */ op("ret", OperandType::None, InstructionCategory::ControlFlow, FlowType::Return, 0, 0),
    /* 0x2B */ op("br.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::UnconditionalBranch, 0, 0),
    /* 0x2C */ op("brfalse.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 1, 0),
    /* 0x2D */ op("brtrue.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 1, 0),
    /* 0x2E */ op("beq.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0),
    /* 0x2F */ op("bge.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0),
    /* 0x30 */ op("bgt.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0),
    /* 0x31 */ op("ble.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0),
    /* 0x32 */ op("blt.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0),
    /* 0x33 */ op("bne.un.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0),
    /* 0x34 */ op("bge.un.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0),
    /* 0x35 */ op("bgt.un.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0),
    /* 0x36 */ op("ble.un.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0),
    /* 0x37 */ op("blt.un.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0),
    /* 0x38 */ op("br", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::UnconditionalBranch, 0, 0),
    /* 0x39 */ op("brfalse", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 1, 0),
    /* 0x3A */ op("brtrue", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 1, 0),
    /* 0x3B */ op("beq", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0),
    /* 0x3C */ op("bge", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0),
    /* 0x3D */ op("bgt", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0),
    /* 0x3E */ op("ble", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0),
    /* 0x3F */ op("blt", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0),
    /* 0x40 */ op("bne.un", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0),
    /* 0x41 */ op("bge.un", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0),
    /* 0x42 */ op("bgt.un", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0),
    /* 0x43 */ op("ble.un", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0),
    /* 0x44 */ op("blt.un", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::ConditionalBranch, 2, 0),
    /* 0x45 */ op("switch", OperandType::Switch, InstructionCategory::ControlFlow, FlowType::Switch, 1, 0),
    /* 0x46 */ op("ldind.i1", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 1),
    /* 0x47 */ op("ldind.u1", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 1),
    /* 0x48 */ op("ldind.i2", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 1),
    /* 0x49 */ op("ldind.u2", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 1),
    /* 0x4A */ op("ldind.i4", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 1),
    /* 0x4B */ op("ldind.u4", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 1),
    /* 0x4C */ op("ldind.i8", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 1),
    /* 0x4D */ op("ldind.i", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 1),
    /* 0x4E */ op("ldind.r4", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 1),
    /* 0x4F */ op("ldind.r8", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 1),
    /* 0x50 */ op("ldind.ref", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 1, 1),
    /* 0x51 */ op("stind.ref", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 2, 0),
    /* 0x52 */ op("stind.i1", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 2, 0),
    /* 0x53 */ op("stind.i2", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 2, 0),
    /* 0x54 */ op("stind.i4", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 2, 0),
    /* 0x55 */ op("stind.i8", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 2, 0),
    /* 0x56 */ op("stind.r4", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 2, 0),
    /* 0x57 */ op("stind.r8", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 2, 0),
    /* 0x58 */ op("add", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1),
    /* 0x59 */ op("sub", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1),
    /* 0x5A */ op("mul", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1),
    /* 0x5B */ op("div", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1),
    /* 0x5C */ op("div.un", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1),
    /* 0x5D */ op("rem", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1),
    /* 0x5E */ op("rem.un", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1),
    /* 0x5F */ op("and", OperandType::None, InstructionCategory::BitwiseLogical, FlowType::Sequential, 2, 1),
    /* 0x60 */ op("or", OperandType::None, InstructionCategory::BitwiseLogical, FlowType::Sequential, 2, 1),
    /* 0x61 */ op("xor", OperandType::None, InstructionCategory::BitwiseLogical, FlowType::Sequential, 2, 1),
    /* 0x62 */ op("shl", OperandType::None, InstructionCategory::BitwiseLogical, FlowType::Sequential, 2, 1),
    /* 0x63 */ op("shr", OperandType::None, InstructionCategory::BitwiseLogical, FlowType::Sequential, 2, 1),
    /* 0x64 */ op("shr.un", OperandType::None, InstructionCategory::BitwiseLogical, FlowType::Sequential, 2, 1),
    /* 0x65 */ op("neg", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 1, 1),
    /* 0x66 */ op("not", OperandType::None, InstructionCategory::BitwiseLogical, FlowType::Sequential, 1, 1),
    /* 0x67 */ op("conv.i1", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0x68 */ op("conv.i2", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0x69 */ op("conv.i4", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0x6A */ op("conv.i8", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0x6B */ op("conv.r4", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0x6C */ op("conv.r8", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0x6D */ op("conv.u4", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0x6E */ op("conv.u8", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0x6F */ op("callvirt", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Call, 0, 0),
    /* 0x70 */ op("cpobj", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 0),
    /* 0x71 */ op("ldobj", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 1),
    /* 0x72 */ op("ldstr", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 0, 1),
    /* 0x73 */ op("newobj", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Call, 0, 1),
    /* 0x74 */ op("castclass", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 1),
    /* 0x75 */ op("isinst", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 1),
    /* 0x76 */ op("conv.r.un", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0x77 */ RESERVED,
    /* 0x78 */ RESERVED,
    /* 0x79 */ op("unbox", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 1),
    /* 0x7A */ op("throw", OperandType::None, InstructionCategory::ControlFlow, FlowType::Throw, 1, 0),
    /* 0x7B */ op("ldfld", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 1),
    /* 0x7C */ op("ldflda", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 1),
    /* 0x7D */ op("stfld", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 0),
    /* 0x7E */ op("ldsfld", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 0, 1),
    /* 0x7F */ op("ldsflda", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 0, 1),
    /* 0x80 */ op("stsfld", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 0),
    /* 0x81 */ op("stobj", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 0),
    /* 0x82 */ op("conv.ovf.i1.un", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0x83 */ op("conv.ovf.i2.un", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0x84 */ op("conv.ovf.i4.un", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0x85 */ op("conv.ovf.i8.un", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0x86 */ op("conv.ovf.u1.un", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0x87 */ op("conv.ovf.u2.un", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0x88 */ op("conv.ovf.u4.un", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0x89 */ op("conv.ovf.u8.un", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0x8A */ op("conv.ovf.i.un", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0x8B */ op("conv.ovf.u.un", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0x8C */ op("box", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 1),
    /* 0x8D */ op("newarr", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 1),
    /* 0x8E */ op("ldlen", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 1),
    /* 0x8F */ op("ldelema", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1),
    /* 0x90 */ op("ldelem.i1", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1),
    /* 0x91 */ op("ldelem.u1", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1),
    /* 0x92 */ op("ldelem.i2", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1),
    /* 0x93 */ op("ldelem.u2", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1),
    /* 0x94 */ op("ldelem.i4", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1),
    /* 0x95 */ op("ldelem.u4", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1),
    /* 0x96 */ op("ldelem.i8", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1),
    /* 0x97 */ op("ldelem.i", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1),
    /* 0x98 */ op("ldelem.r4", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1),
    /* 0x99 */ op("ldelem.r8", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1),
    /* 0x9A */ op("ldelem.ref", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1),
    /* 0x9B */ op("stelem.i", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 3, 0),
    /* 0x9C */ op("stelem.i1", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 3, 0),
    /* 0x9D */ op("stelem.i2", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 3, 0),
    /* 0x9E */ op("stelem.i4", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 3, 0),
    /* 0x9F */ op("stelem.i8", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 3, 0),
    /* 0xA0 */ op("stelem.r4", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 3, 0),
    /* 0xA1 */ op("stelem.r8", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 3, 0),
    /* 0xA2 */ op("stelem.ref", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 3, 0),
    /* 0xA3 */ op("ldelem", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 2, 1),
    /* 0xA4 */ op("stelem", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 3, 0),
    /* 0xA5 */ op("unbox.any", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 1),
    /* 0xA6 */ RESERVED,
    /* 0xA7 */ RESERVED,
    /* 0xA8 */ RESERVED,
    /* 0xA9 */ RESERVED,
    /* 0xAA */ RESERVED,
    /* 0xAB */ RESERVED,
    /* 0xAC */ RESERVED,
    /* 0xAD */ RESERVED,
    /* 0xAE */ RESERVED,
    /* 0xAF */ RESERVED,
    /* 0xB0 */ RESERVED,
    /* 0xB1 */ RESERVED,
    /* 0xB2 */ RESERVED,
    /* 0xB3 */ op("conv.ovf.i1", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0xB4 */ op("conv.ovf.u1", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0xB5 */ op("conv.ovf.i2", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0xB6 */ op("conv.ovf.u2", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0xB7 */ op("conv.ovf.i4", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0xB8 */ op("conv.ovf.u4", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0xB9 */ op("conv.ovf.i8", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0xBA */ op("conv.ovf.u8", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0xBB */ RESERVED,
    /* 0xBC */ RESERVED,
    /* 0xBD */ RESERVED,
    /* 0xBE */ RESERVED,
    /* 0xBF */ RESERVED,
    /* 0xC0 */ RESERVED,
    /* 0xC1 */ RESERVED,
    /* 0xC2 */ op("refanyval", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 1),
    /* 0xC3 */ op("ckfinite", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 1, 1),
    /* 0xC4 */ RESERVED,
    /* 0xC5 */ RESERVED,
    /* 0xC6 */ op("mkrefany", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 1),
    /* 0xC7 */ RESERVED,
    /* 0xC8 */ RESERVED,
    /* 0xC9 */ RESERVED,
    /* 0xCA */ RESERVED,
    /* 0xCB */ RESERVED,
    /* 0xCC */ RESERVED,
    /* 0xCD */ RESERVED,
    /* 0xCE */ RESERVED,
    /* 0xCF */ RESERVED,
    /* 0xD0 */ op("ldtoken", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 0, 1),
    /* 0xD1 */ op("conv.u2", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0xD2 */ op("conv.u1", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0xD3 */ op("conv.i", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0xD4 */ op("conv.ovf.i", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0xD5 */ op("conv.ovf.u", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
    /* 0xD6 */ op("add.ovf", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1),
    /* 0xD7 */ op("add.ovf.un", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1),
    /* 0xD8 */ op("mul.ovf", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1),
    /* 0xD9 */ op("mul.ovf.un", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1),
    /* 0xDA */ op("sub.ovf", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1),
    /* 0xDB */ op("sub.ovf.un", OperandType::None, InstructionCategory::Arithmetic, FlowType::Sequential, 2, 1),
    /* 0xDC */ op("endfinally", OperandType::None, InstructionCategory::ControlFlow, FlowType::EndFinally, 0, 0),
    /* 0xDD */ op("leave", OperandType::Int32, InstructionCategory::ControlFlow, FlowType::Leave, 0, 0),
    /* 0xDE */ op("leave.s", OperandType::Int8, InstructionCategory::ControlFlow, FlowType::Leave, 0, 0),
    /* 0xDF */ op("stind.i", OperandType::None, InstructionCategory::LoadStore, FlowType::Sequential, 2, 0),
    /* 0xE0 */ op("conv.u", OperandType::None, InstructionCategory::Conversion, FlowType::Sequential, 1, 1),
];

/// Opcodes behind the `0xFE` prefix, indexed by the second byte
pub static INSTRUCTIONS_FE: [CilInstruction<'static>; 31] = [
    /* 0x00 */ op("arglist", OperandType::None, InstructionCategory::Misc, FlowType::Sequential, 0, 1),
    /* 0x01 */ op("ceq", OperandType::None, InstructionCategory::Comparison, FlowType::Sequential, 2, 1),
    /* 0x02 */ op("cgt", OperandType::None, InstructionCategory::Comparison, FlowType::Sequential, 2, 1),
    /* 0x03 */ op("cgt.un", OperandType::None, InstructionCategory::Comparison, FlowType::Sequential, 2, 1),
    /* 0x04 */ op("clt", OperandType::None, InstructionCategory::Comparison, FlowType::Sequential, 2, 1),
    /* 0x05 */ op("clt.un", OperandType::None, InstructionCategory::Comparison, FlowType::Sequential, 2, 1),
    /* 0x06 */ op("ldftn", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 0, 1),
    /* 0x07 */ op("ldvirtftn", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 1),
    /* 0x08 */ RESERVED,
    /* 0x09 */ op("ldarg", OperandType::UInt16, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x0A */ op("ldarga", OperandType::UInt16, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x0B */ op("starg", OperandType::UInt16, InstructionCategory::LoadStore, FlowType::Sequential, 1, 0),
    /* 0x0C */ op("ldloc", OperandType::UInt16, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x0D */ op("ldloca", OperandType::UInt16, InstructionCategory::LoadStore, FlowType::Sequential, 0, 1),
    /* 0x0E */ op("stloc", OperandType::UInt16, InstructionCategory::LoadStore, FlowType::Sequential, 1, 0),
    /* 0x0F */ op("localloc", OperandType::None, InstructionCategory::Misc, FlowType::Sequential, 1, 1),
    /* 0x10 */ RESERVED,
    /* 0x11 */ op("endfilter", OperandType::None, InstructionCategory::ControlFlow, FlowType::EndFinally, 1, 0),
    /* 0x12 */ op("unaligned.", OperandType::UInt8, InstructionCategory::Prefix, FlowType::Sequential, 0, 0),
    /* 0x13 */ op("volatile.", OperandType::None, InstructionCategory::Prefix, FlowType::Sequential, 0, 0),
    /* 0x14 */ op("tail.", OperandType::None, InstructionCategory::Prefix, FlowType::Sequential, 0, 0),
    /* 0x15 */ op("initobj", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 0),
    /* 0x16 */ op("constrained.", OperandType::Token, InstructionCategory::Prefix, FlowType::Sequential, 0, 0),
    /* 0x17 */ op("cpblk", OperandType::None, InstructionCategory::Misc, FlowType::Sequential, 3, 0),
    /* 0x18 */ op("initblk", OperandType::None, InstructionCategory::Misc, FlowType::Sequential, 3, 0),
    /* 0x19 */ op("no.", OperandType::UInt8, InstructionCategory::Prefix, FlowType::Sequential, 0, 0),
    /* 0x1A */ op("rethrow", OperandType::None, InstructionCategory::ControlFlow, FlowType::Throw, 0, 0),
    /* 0x1B */ RESERVED,
    /* 0x1C */ op("sizeof", OperandType::Token, InstructionCategory::ObjectModel, FlowType::Sequential, 0, 1),
    /* 0x1D */ op("refanytype", OperandType::None, InstructionCategory::ObjectModel, FlowType::Sequential, 1, 1),
    /* 0x1E */ op("readonly.", OperandType::None, InstructionCategory::Prefix, FlowType::Sequential, 0, 0),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mnemonics_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for entry in INSTRUCTIONS.iter().chain(INSTRUCTIONS_FE.iter()) {
            if !entry.is_reserved() {
                assert!(seen.insert(entry.instr), "duplicate {}", entry.instr);
            }
        }
        assert_eq!(seen.len(), 219);
    }

    #[test]
    fn well_known_slots() {
        assert_eq!(INSTRUCTIONS[0x28].instr, "call");
        assert_eq!(INSTRUCTIONS[0x73].instr, "newobj");
        assert_eq!(INSTRUCTIONS[0xDE].flow, FlowType::Leave);
        assert_eq!(INSTRUCTIONS_FE[0x16].instr, "constrained.");
        assert_eq!(INSTRUCTIONS_FE[0x11].flow, FlowType::EndFinally);
        assert!(INSTRUCTIONS[0x24].is_reserved());
        assert!(INSTRUCTIONS_FE[0x1B].is_reserved());
    }
}
