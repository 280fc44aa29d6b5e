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

//! CIL instruction decoding, encoding and assembly.
//!
//! # Key Components
//!
//! - [`decode_method`] / [`DecodedMethod`] - A method body as decoded instructions,
//!   locals and exception clauses
//! - [`Instruction`] / [`Operand`] - One decoded instruction
//! - [`InstructionEncoder`] - Label-based emission with stack tracking and
//!   structured exception blocks
//! - [`InstructionAssembler`] - Fluent, named-block front end to the encoder
//! - [`INSTRUCTIONS`] / [`INSTRUCTIONS_FE`] - The opcode tables
//!
//! Decoding and encoding are inverse: decoded instructions can be re-emitted one for
//! one through the encoder, which is what the method rewriter does.

mod assembler;
mod decoder;
mod encoder;
mod instruction;
mod instructions;
pub mod opcodes;

pub use assembler::InstructionAssembler;
pub use decoder::{decode_instruction, decode_method, decode_stream, DecodedMethod};
pub use encoder::{long_form_mnemonic, lookup_mnemonic, InstructionEncoder, LabelFixup, SwitchFixup};
pub use instruction::{
    FlowType, Immediate, Instruction, InstructionCategory, Operand, OperandType, StackBehavior,
};
pub use instructions::{CilInstruction, INSTRUCTIONS, INSTRUCTIONS_FE};
