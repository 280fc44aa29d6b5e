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

//! CIL instruction encoding.
//!
//! [`InstructionEncoder`] turns mnemonics and operands into bytecode. Branches refer
//! to string labels and are patched when the encoder is finalized; the encoder tracks
//! the evaluation stack depth to compute `max_stack`, and records structured
//! exception blocks as offset-based clauses.
//!
//! # Exception blocks
//!
//! Blocks follow the begin/end protocol of a dynamic method generator:
//!
//! ```text
//! begin_exception_block      try {
//!   ...                          ...
//!   leave end                    leave end
//! begin_catch_block(T)       } catch (T) {
//!   ...                          ...
//!   leave end                    leave end
//! begin_finally_block        } finally {
//!   endfinally                   endfinally
//! end_exception_block        }
//! ```
//!
//! The encoder only records offsets; `leave`, `endfinally` and `endfilter` are emitted
//! by the caller. Several handlers on one block share the guarded range. Clauses are
//! produced in the order blocks close, so nested (inner) blocks come first as the
//! clause table requires.
//!
//! # Usage Examples
//!
//! ```rust
//! use dotshim::assembly::InstructionEncoder;
//!
//! let mut encoder = InstructionEncoder::new();
//! encoder.emit_instruction("ldarg.0", None)?;
//! encoder.emit_branch("brtrue.s", "done")?;
//! encoder.emit_instruction("ldc.i4.1", None)?;
//! encoder.emit_instruction("pop", None)?;
//! encoder.define_label("done")?;
//! encoder.emit_instruction("ret", None)?;
//!
//! let (bytecode, max_stack, _labels, clauses) = encoder.finalize()?;
//! assert_eq!(bytecode, vec![0x02, 0x2D, 0x02, 0x17, 0x26, 0x2A]);
//! assert_eq!(max_stack, 1);
//! assert!(clauses.is_empty());
//! # Ok::<(), dotshim::Error>(())
//! ```

use std::{
    collections::{HashMap, HashSet},
    sync::OnceLock,
};

use crate::{
    assembly::{
        instruction::{FlowType, Immediate, Instruction, Operand, OperandType},
        instructions::{CilInstruction, INSTRUCTIONS, INSTRUCTIONS_FE},
    },
    metadata::{
        method::{ExceptionHandler, ExceptionHandlerFlags},
        token::Token,
    },
    Error, Result,
};

/// Mnemonic to (opcode, prefix, table entry)
static MNEMONIC_TO_OPCODE: OnceLock<
    HashMap<&'static str, (u8, u8, &'static CilInstruction<'static>)>,
> = OnceLock::new();

fn get_mnemonic_lookup(
) -> &'static HashMap<&'static str, (u8, u8, &'static CilInstruction<'static>)> {
    MNEMONIC_TO_OPCODE.get_or_init(|| {
        let mut map = HashMap::new();

        for (opcode, instr) in (0u8..).zip(INSTRUCTIONS.iter()) {
            if !instr.is_reserved() {
                map.insert(instr.instr, (opcode, 0, instr));
            }
        }

        for (opcode, instr) in (0u8..).zip(INSTRUCTIONS_FE.iter()) {
            if !instr.is_reserved() {
                map.insert(instr.instr, (opcode, 0xFE, instr));
            }
        }

        map
    })
}

/// Looks up the table entry of a mnemonic.
///
/// # Errors
/// Returns [`Error::InvalidMnemonic`] if the mnemonic does not exist.
pub fn lookup_mnemonic(mnemonic: &str) -> Result<&'static CilInstruction<'static>> {
    get_mnemonic_lookup()
        .get(mnemonic)
        .map(|(_, _, instr)| *instr)
        .ok_or_else(|| Error::InvalidMnemonic(mnemonic.to_string()))
}

/// A branch whose displacement is patched at finalization.
#[derive(Debug, Clone)]
pub struct LabelFixup {
    /// Target label
    pub label: String,
    /// Position of the displacement bytes
    pub fixup_position: usize,
    /// Size of the displacement: 1 or 4 bytes
    pub offset_size: u8,
    /// Position of the instruction's first byte
    pub instruction_position: usize,
    /// Short form this long branch may be shrunk to
    pub short_form_mnemonic: Option<&'static str>,
}

/// A switch table patched at finalization.
#[derive(Debug, Clone)]
pub struct SwitchFixup {
    /// Target labels in case order
    pub labels: Vec<String>,
    /// Position of the first displacement
    pub fixup_position: usize,
    /// End of the switch instruction, the base of all displacements
    pub instruction_end_position: usize,
}

/// A clause whose handler is being emitted.
#[derive(Debug, Clone)]
struct PendingClause {
    flags: ExceptionHandlerFlags,
    class: Option<Token>,
    filter_start: usize,
    handler_start: Option<usize>,
}

/// An exception block between `begin_exception_block` and `end_exception_block`.
#[derive(Debug, Clone)]
struct OpenBlock {
    try_start: usize,
    try_end: Option<usize>,
    current: Option<PendingClause>,
}

/// A finished clause, in byte positions so branch shrinking can move it.
#[derive(Debug, Clone)]
struct ClauseMarks {
    flags: ExceptionHandlerFlags,
    class: Option<Token>,
    try_start: usize,
    try_end: usize,
    handler_start: usize,
    handler_end: usize,
    filter_start: usize,
}

/// Encodes CIL instructions into bytecode.
pub struct InstructionEncoder {
    bytecode: Vec<u8>,
    labels: HashMap<String, u32>,
    fixups: Vec<LabelFixup>,
    switch_fixups: Vec<SwitchFixup>,
    current_stack_depth: i16,
    max_stack_depth: u16,
    label_stack_depths: HashMap<String, i16>,
    unreachable: bool,
    optimize_branches: bool,
    open_blocks: Vec<OpenBlock>,
    clauses: Vec<ClauseMarks>,
}

fn get_short_form_mnemonic(mnemonic: &str) -> Option<&'static str> {
    match mnemonic {
        "br" => Some("br.s"),
        "brfalse" => Some("brfalse.s"),
        "brtrue" => Some("brtrue.s"),
        "beq" => Some("beq.s"),
        "bne.un" => Some("bne.un.s"),
        "bge" => Some("bge.s"),
        "bge.un" => Some("bge.un.s"),
        "bgt" => Some("bgt.s"),
        "bgt.un" => Some("bgt.un.s"),
        "ble" => Some("ble.s"),
        "ble.un" => Some("ble.un.s"),
        "blt" => Some("blt.s"),
        "blt.un" => Some("blt.un.s"),
        "leave" => Some("leave.s"),
        _ => None,
    }
}

/// The 32-bit displacement form of a branch mnemonic; long forms map to themselves.
#[must_use]
pub fn long_form_mnemonic(mnemonic: &str) -> Option<&'static str> {
    match mnemonic {
        "br.s" | "br" => Some("br"),
        "brfalse.s" | "brfalse" => Some("brfalse"),
        "brtrue.s" | "brtrue" => Some("brtrue"),
        "beq.s" | "beq" => Some("beq"),
        "bne.un.s" | "bne.un" => Some("bne.un"),
        "bge.s" | "bge" => Some("bge"),
        "bge.un.s" | "bge.un" => Some("bge.un"),
        "bgt.s" | "bgt" => Some("bgt"),
        "bgt.un.s" | "bgt.un" => Some("bgt.un"),
        "ble.s" | "ble" => Some("ble"),
        "ble.un.s" | "ble.un" => Some("ble.un"),
        "blt.s" | "blt" => Some("blt"),
        "blt.un.s" | "blt.un" => Some("blt.un"),
        "leave.s" | "leave" => Some("leave"),
        _ => None,
    }
}

impl InstructionEncoder {
    /// Creates an empty encoder. Long branches are shrunk to short forms by default.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bytecode: Vec::new(),
            labels: HashMap::new(),
            fixups: Vec::new(),
            switch_fixups: Vec::new(),
            current_stack_depth: 0,
            max_stack_depth: 0,
            label_stack_depths: HashMap::new(),
            unreachable: false,
            optimize_branches: true,
            open_blocks: Vec::new(),
            clauses: Vec::new(),
        }
    }

    /// Enables or disables shrinking long branches to their short forms.
    pub fn set_branch_optimization(&mut self, enabled: bool) {
        self.optimize_branches = enabled;
    }

    /// Emits an instruction with its fixed stack effect.
    ///
    /// # Errors
    /// Returns [`Error::InvalidMnemonic`] for unknown mnemonics,
    /// [`Error::UnexpectedOperand`] / [`Error::WrongOperandType`] for operand
    /// mismatches and [`Error::Malformed`] on stack underflow.
    pub fn emit_instruction(&mut self, mnemonic: &str, operand: Option<Operand>) -> Result<()> {
        let (opcode, prefix, metadata) = get_mnemonic_lookup()
            .get(mnemonic)
            .ok_or_else(|| Error::InvalidMnemonic(mnemonic.to_string()))?;

        if *prefix != 0 {
            self.bytecode.push(*prefix);
        }
        self.bytecode.push(*opcode);

        self.emit_operand(operand, metadata.op_type)?;

        self.update_stack_depth(metadata.stack_pops, metadata.stack_pushes)
            .map_err(|e| malformed_error!("Stack error at instruction '{}': {}", mnemonic, e))?;

        if matches!(
            metadata.flow,
            FlowType::Return | FlowType::Throw | FlowType::EndFinally
        ) {
            self.unreachable = true;
        }

        Ok(())
    }

    /// Re-emits a decoded instruction unchanged (branches need [`Self::emit_branch`]).
    ///
    /// # Errors
    /// See [`Self::emit_instruction`].
    pub fn emit_instruction_decoded(&mut self, instruction: &Instruction) -> Result<()> {
        let operand = if matches!(instruction.operand, Operand::None) {
            None
        } else {
            Some(instruction.operand.clone())
        };
        self.emit_instruction(instruction.mnemonic, operand)
    }

    /// Emits a branch or `leave` to `label`.
    ///
    /// `leave` empties the evaluation stack before transferring control.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBranch`] if the mnemonic is not a branch, and stack
    /// depth mismatches as [`Error::Malformed`].
    pub fn emit_branch(&mut self, mnemonic: &str, label: &str) -> Result<()> {
        let (opcode, prefix, metadata) = get_mnemonic_lookup()
            .get(mnemonic)
            .ok_or_else(|| Error::InvalidMnemonic(mnemonic.to_string()))?;

        if !matches!(
            metadata.flow,
            FlowType::ConditionalBranch | FlowType::UnconditionalBranch | FlowType::Leave
        ) {
            return Err(Error::InvalidBranch(format!(
                "instruction '{mnemonic}' is not a branch instruction"
            )));
        }

        let instruction_start = self.bytecode.len();
        if *prefix != 0 {
            self.bytecode.push(*prefix);
        }
        self.bytecode.push(*opcode);

        let offset_size = match metadata.op_type {
            OperandType::Int8 => 1,
            OperandType::Int32 => 4,
            _ => {
                return Err(Error::InvalidBranch(
                    "operand type must be Int8 or Int32".to_string(),
                ))
            }
        };

        let short_form_mnemonic = if offset_size == 4 {
            get_short_form_mnemonic(mnemonic)
        } else {
            None
        };
        self.fixups.push(LabelFixup {
            label: label.to_string(),
            fixup_position: self.bytecode.len(),
            offset_size,
            instruction_position: instruction_start,
            short_form_mnemonic,
        });
        self.bytecode.extend(std::iter::repeat(0).take(offset_size as usize));

        self.update_stack_depth(metadata.stack_pops, metadata.stack_pushes)
            .map_err(|e| {
                malformed_error!("Stack error at branch '{}' to '{}': {}", mnemonic, label, e)
            })?;

        if metadata.flow == FlowType::Leave {
            self.current_stack_depth = 0;
        }
        self.record_label_stack_depth(label)?;

        if matches!(
            metadata.flow,
            FlowType::UnconditionalBranch | FlowType::Leave
        ) {
            self.unreachable = true;
        }

        Ok(())
    }

    /// Emits a `switch` over `labels`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBranch`] for an empty table.
    pub fn emit_switch(&mut self, labels: &[&str]) -> Result<()> {
        if labels.is_empty() {
            return Err(Error::InvalidBranch(
                "switch must have at least one target".to_string(),
            ));
        }

        self.bytecode.push(0x45);

        let num_targets =
            u32::try_from(labels.len()).map_err(|_| malformed_error!("Too many switch targets"))?;
        self.bytecode.extend_from_slice(&num_targets.to_le_bytes());

        let fixup_position = self.bytecode.len();
        for _ in 0..labels.len() {
            self.bytecode.extend_from_slice(&[0, 0, 0, 0]);
        }

        self.switch_fixups.push(SwitchFixup {
            labels: labels.iter().map(|s| (*s).to_string()).collect(),
            fixup_position,
            instruction_end_position: self.bytecode.len(),
        });

        self.update_stack_depth(1, 0)
            .map_err(|e| malformed_error!("Stack error at 'switch': {}", e))?;

        for label in labels {
            self.record_label_stack_depth(label)?;
        }

        Ok(())
    }

    /// Emits a call-like instruction with an explicit stack effect.
    ///
    /// `num_args` counts everything the call pops (receiver and function pointer
    /// included); `has_result` whether it pushes a value.
    ///
    /// # Errors
    /// See [`Self::emit_instruction`].
    pub fn emit_call(
        &mut self,
        mnemonic: &str,
        operand: Option<Operand>,
        num_args: u8,
        has_result: bool,
    ) -> Result<()> {
        let (opcode, prefix, metadata) = get_mnemonic_lookup()
            .get(mnemonic)
            .ok_or_else(|| Error::InvalidMnemonic(mnemonic.to_string()))?;

        if *prefix != 0 {
            self.bytecode.push(*prefix);
        }
        self.bytecode.push(*opcode);

        self.emit_operand(operand, metadata.op_type)?;

        let pushes = u8::from(has_result);
        self.update_stack_depth(num_args, pushes)
            .map_err(|e| malformed_error!("Stack error at call '{}': {}", mnemonic, e))?;

        Ok(())
    }

    /// Emits the shortest `ldarg` form for `index`.
    ///
    /// # Errors
    /// See [`Self::emit_instruction`].
    pub fn emit_ldarg(&mut self, index: u16) -> Result<()> {
        match index {
            0 => self.emit_instruction("ldarg.0", None),
            1 => self.emit_instruction("ldarg.1", None),
            2 => self.emit_instruction("ldarg.2", None),
            3 => self.emit_instruction("ldarg.3", None),
            x => self.emit_indexed("ldarg.s", "ldarg", x),
        }
    }

    /// Emits the shortest `ldloc` form for `index`.
    ///
    /// # Errors
    /// See [`Self::emit_instruction`].
    pub fn emit_ldloc(&mut self, index: u16) -> Result<()> {
        match index {
            0 => self.emit_instruction("ldloc.0", None),
            1 => self.emit_instruction("ldloc.1", None),
            2 => self.emit_instruction("ldloc.2", None),
            3 => self.emit_instruction("ldloc.3", None),
            x => self.emit_indexed("ldloc.s", "ldloc", x),
        }
    }

    /// Emits the shortest `stloc` form for `index`.
    ///
    /// # Errors
    /// See [`Self::emit_instruction`].
    pub fn emit_stloc(&mut self, index: u16) -> Result<()> {
        match index {
            0 => self.emit_instruction("stloc.0", None),
            1 => self.emit_instruction("stloc.1", None),
            2 => self.emit_instruction("stloc.2", None),
            3 => self.emit_instruction("stloc.3", None),
            x => self.emit_indexed("stloc.s", "stloc", x),
        }
    }

    /// Emits `starg.s` or `starg`.
    ///
    /// # Errors
    /// See [`Self::emit_instruction`].
    pub fn emit_starg(&mut self, index: u16) -> Result<()> {
        self.emit_indexed("starg.s", "starg", index)
    }

    /// Emits `ldarga.s` or `ldarga`.
    ///
    /// # Errors
    /// See [`Self::emit_instruction`].
    pub fn emit_ldarga(&mut self, index: u16) -> Result<()> {
        self.emit_indexed("ldarga.s", "ldarga", index)
    }

    /// Emits `ldloca.s` or `ldloca`.
    ///
    /// # Errors
    /// See [`Self::emit_instruction`].
    pub fn emit_ldloca(&mut self, index: u16) -> Result<()> {
        self.emit_indexed("ldloca.s", "ldloca", index)
    }

    fn emit_indexed(&mut self, short: &str, long: &str, index: u16) -> Result<()> {
        match u8::try_from(index) {
            Ok(short_index) => {
                self.emit_instruction(short, Some(Operand::Immediate(Immediate::UInt8(short_index))))
            }
            Err(_) => self.emit_instruction(long, Some(Operand::Immediate(Immediate::UInt16(index)))),
        }
    }

    /// Emits the shortest `ldc.i4` form for `value`.
    ///
    /// # Errors
    /// See [`Self::emit_instruction`].
    pub fn emit_ldc_i4(&mut self, value: i32) -> Result<()> {
        match value {
            -1 => self.emit_instruction("ldc.i4.m1", None),
            0 => self.emit_instruction("ldc.i4.0", None),
            1 => self.emit_instruction("ldc.i4.1", None),
            2 => self.emit_instruction("ldc.i4.2", None),
            3 => self.emit_instruction("ldc.i4.3", None),
            4 => self.emit_instruction("ldc.i4.4", None),
            5 => self.emit_instruction("ldc.i4.5", None),
            6 => self.emit_instruction("ldc.i4.6", None),
            7 => self.emit_instruction("ldc.i4.7", None),
            8 => self.emit_instruction("ldc.i4.8", None),
            x => match i8::try_from(x) {
                Ok(short) => {
                    self.emit_instruction("ldc.i4.s", Some(Operand::Immediate(Immediate::Int8(short))))
                }
                Err(_) => {
                    self.emit_instruction("ldc.i4", Some(Operand::Immediate(Immediate::Int32(x))))
                }
            },
        }
    }

    /// Defines `name` at the current position.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateLabel`] if the label exists, and
    /// [`Error::Malformed`] if branches to it disagree on the stack depth.
    pub fn define_label(&mut self, name: &str) -> Result<()> {
        if self.labels.contains_key(name) {
            return Err(Error::DuplicateLabel(name.to_string()));
        }

        if let Some(&expected) = self.label_stack_depths.get(name) {
            if self.unreachable {
                self.current_stack_depth = expected;
            } else if self.current_stack_depth != expected {
                return Err(malformed_error!(
                    "Stack depth mismatch at label '{}': expected {} (from branch), got {} (current)",
                    name,
                    expected,
                    self.current_stack_depth
                ));
            }
        } else if !self.unreachable {
            self.label_stack_depths
                .insert(name.to_string(), self.current_stack_depth);
        } else {
            self.current_stack_depth = 0;
        }

        self.unreachable = false;

        let bytecode_len = u32::try_from(self.bytecode.len())
            .map_err(|_| malformed_error!("Bytecode length exceeds u32 range"))?;
        self.labels.insert(name.to_string(), bytecode_len);
        Ok(())
    }

    /// Opens a protected block at the current position.
    pub fn begin_exception_block(&mut self) {
        self.open_blocks.push(OpenBlock {
            try_start: self.bytecode.len(),
            try_end: None,
            current: None,
        });
    }

    /// Starts a typed catch handler on the innermost open block.
    ///
    /// The handler is entered with the exception object on the stack.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if no block is open.
    pub fn begin_catch_block(&mut self, class: Token) -> Result<()> {
        self.start_handler(ExceptionHandlerFlags::EXCEPTION, Some(class), None)?;
        self.enter_handler(1);
        Ok(())
    }

    /// Starts the filter expression of a filter clause.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if no block is open.
    pub fn begin_filter_block(&mut self) -> Result<()> {
        let position = self.bytecode.len();
        self.start_handler(ExceptionHandlerFlags::FILTER, None, Some(position))?;
        self.enter_handler(1);
        Ok(())
    }

    /// Starts the handler that runs when the preceding filter accepts the exception.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] unless a filter is being emitted.
    pub fn begin_filtered_handler(&mut self) -> Result<()> {
        let position = self.bytecode.len();
        let pending = self
            .open_blocks
            .last_mut()
            .and_then(|block| block.current.as_mut())
            .filter(|pending| {
                pending.flags == ExceptionHandlerFlags::FILTER && pending.handler_start.is_none()
            })
            .ok_or_else(|| malformed_error!("Filtered handler without a preceding filter"))?;
        pending.handler_start = Some(position);
        self.enter_handler(1);
        Ok(())
    }

    /// Starts a finally handler on the innermost open block.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if no block is open.
    pub fn begin_finally_block(&mut self) -> Result<()> {
        self.start_handler(ExceptionHandlerFlags::FINALLY, None, None)?;
        self.enter_handler(0);
        Ok(())
    }

    /// Starts a fault handler on the innermost open block.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if no block is open.
    pub fn begin_fault_block(&mut self) -> Result<()> {
        self.start_handler(ExceptionHandlerFlags::FAULT, None, None)?;
        self.enter_handler(0);
        Ok(())
    }

    /// Closes the innermost open block; its last handler ends at the current position.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if no block is open or the block has no handler.
    pub fn end_exception_block(&mut self) -> Result<()> {
        let position = self.bytecode.len();
        let mut block = self
            .open_blocks
            .pop()
            .ok_or_else(|| malformed_error!("No open exception block to end"))?;
        if block.current.is_none() {
            return Err(malformed_error!(
                "Exception block at {} has no handler",
                block.try_start
            ));
        }
        self.close_handler(&mut block, position)
    }

    fn start_handler(
        &mut self,
        flags: ExceptionHandlerFlags,
        class: Option<Token>,
        filter_start: Option<usize>,
    ) -> Result<()> {
        let position = self.bytecode.len();
        let mut block = self
            .open_blocks
            .pop()
            .ok_or_else(|| malformed_error!("Handler started outside of an exception block"))?;

        if block.try_end.is_none() {
            block.try_end = Some(position);
        }
        self.close_handler(&mut block, position)?;

        block.current = Some(PendingClause {
            flags,
            class,
            filter_start: filter_start.unwrap_or(0),
            handler_start: if filter_start.is_some() {
                None
            } else {
                Some(position)
            },
        });
        self.open_blocks.push(block);
        Ok(())
    }

    fn close_handler(&mut self, block: &mut OpenBlock, position: usize) -> Result<()> {
        let Some(pending) = block.current.take() else {
            return Ok(());
        };
        let handler_start = pending
            .handler_start
            .ok_or_else(|| malformed_error!("Filter at {} has no handler", pending.filter_start))?;

        self.clauses.push(ClauseMarks {
            flags: pending.flags,
            class: pending.class,
            try_start: block.try_start,
            try_end: block.try_end.unwrap_or(handler_start),
            handler_start,
            handler_end: position,
            filter_start: pending.filter_start,
        });
        Ok(())
    }

    fn enter_handler(&mut self, depth: i16) {
        self.unreachable = false;
        self.set_stack_depth(depth);
    }

    /// Current write position.
    #[must_use]
    pub fn current_position(&self) -> u32 {
        u32::try_from(self.bytecode.len()).unwrap_or(u32::MAX)
    }

    fn ensure_method_terminated(&mut self) -> Result<()> {
        if self.bytecode.is_empty() {
            return Ok(());
        }

        let current_len = self.bytecode.len();
        let has_branch_to_end = self.fixups.iter().any(|fixup| {
            self.labels
                .get(&fixup.label)
                .is_some_and(|label_pos| *label_pos as usize >= current_len)
        });

        if has_branch_to_end {
            self.emit_instruction("ret", None)?;
        }

        Ok(())
    }

    /// Offset of a defined label.
    #[must_use]
    pub fn label_offset(&self, name: &str) -> Option<u32> {
        self.labels.get(name).copied()
    }

    /// Resolves all fixups and returns the bytecode, the maximum stack depth, the
    /// label offsets and the exception clauses.
    ///
    /// # Errors
    /// Returns [`Error::UndefinedLabel`] for branches to unknown labels and
    /// [`Error::Malformed`] if an exception block is still open.
    pub fn finalize(
        mut self,
    ) -> Result<(Vec<u8>, u16, HashMap<String, u32>, Vec<ExceptionHandler>)> {
        if let Some(block) = self.open_blocks.last() {
            return Err(malformed_error!(
                "Exception block at {} was never ended",
                block.try_start
            ));
        }

        self.ensure_method_terminated()?;

        if self.optimize_branches {
            self.optimize_branch_forms()?;
        }

        let fixups = std::mem::take(&mut self.fixups);
        for fixup in &fixups {
            let label_position = self
                .labels
                .get(&fixup.label)
                .ok_or_else(|| Error::UndefinedLabel(fixup.label.clone()))?;

            let next_instruction_pos = fixup.fixup_position + fixup.offset_size as usize;

            let label_pos_i32 = i32::try_from(*label_position)
                .map_err(|_| malformed_error!("Label position exceeds i32 range"))?;
            let next_instr_pos_i32 = i32::try_from(next_instruction_pos)
                .map_err(|_| malformed_error!("Instruction position exceeds i32 range"))?;

            self.write_branch_offset(label_pos_i32 - next_instr_pos_i32, fixup)?;
        }

        let switch_fixups = std::mem::take(&mut self.switch_fixups);
        for switch_fixup in &switch_fixups {
            let instruction_end_i32 = i32::try_from(switch_fixup.instruction_end_position)
                .map_err(|_| malformed_error!("Switch instruction end exceeds i32 range"))?;

            for (i, label) in switch_fixup.labels.iter().enumerate() {
                let label_position = self
                    .labels
                    .get(label)
                    .ok_or_else(|| Error::UndefinedLabel(label.clone()))?;
                let label_pos_i32 = i32::try_from(*label_position)
                    .map_err(|_| malformed_error!("Label position exceeds i32 range"))?;

                let target_pos = switch_fixup.fixup_position + i * 4;
                self.bytecode[target_pos..target_pos + 4]
                    .copy_from_slice(&(label_pos_i32 - instruction_end_i32).to_le_bytes());
            }
        }

        let to_u32 = |position: usize| {
            u32::try_from(position).map_err(|_| malformed_error!("Clause offset exceeds u32 range"))
        };
        let mut handlers = Vec::with_capacity(self.clauses.len());
        for clause in &self.clauses {
            let try_offset = to_u32(clause.try_start)?;
            let handler_offset = to_u32(clause.handler_start)?;
            handlers.push(ExceptionHandler {
                flags: clause.flags,
                try_offset,
                try_length: to_u32(clause.try_end)? - try_offset,
                handler_offset,
                handler_length: to_u32(clause.handler_end)? - handler_offset,
                handler: clause.class,
                filter_offset: to_u32(clause.filter_start)?,
            });
        }

        Ok((self.bytecode, self.max_stack_depth, self.labels, handlers))
    }

    fn optimize_branch_forms(&mut self) -> Result<()> {
        const MAX_ITERATIONS: usize = 100;

        for _ in 0..MAX_ITERATIONS {
            let shrinkable = self.find_shrinkable_branches()?;
            if shrinkable.is_empty() {
                break;
            }
            self.apply_branch_shrinking(&shrinkable)?;
        }

        Ok(())
    }

    fn find_shrinkable_branches(&self) -> Result<Vec<usize>> {
        let mut shrinkable = Vec::new();

        for (idx, fixup) in self.fixups.iter().enumerate() {
            if fixup.offset_size != 4 || fixup.short_form_mnemonic.is_none() {
                continue;
            }

            let label_position = self
                .labels
                .get(&fixup.label)
                .ok_or_else(|| Error::UndefinedLabel(fixup.label.clone()))?;

            // opcode + 1-byte displacement
            let short_form_end = fixup.instruction_position + 2;

            let label_pos_i32 = i32::try_from(*label_position)
                .map_err(|_| malformed_error!("Label position exceeds i32 range"))?;
            let short_end_i32 = i32::try_from(short_form_end)
                .map_err(|_| malformed_error!("Instruction position exceeds i32 range"))?;

            let mut offset = label_pos_i32 - short_end_i32;
            // Shrinking moves forward targets 3 bytes closer
            if offset > 0 {
                offset -= 3;
            }

            if (-128..=127).contains(&offset) {
                shrinkable.push(idx);
            }
        }

        // One at a time keeps every displacement estimate exact
        shrinkable.truncate(1);
        Ok(shrinkable)
    }

    fn apply_branch_shrinking(&mut self, shrinkable: &[usize]) -> Result<()> {
        if shrinkable.is_empty() {
            return Ok(());
        }

        let shrinkable_set: HashSet<usize> = shrinkable.iter().copied().collect();

        let mut adjustments: Vec<(usize, usize)> = Vec::new();
        let mut removed = 0usize;
        let mut ordered: Vec<usize> = shrinkable.to_vec();
        ordered.sort_by_key(|&i| self.fixups[i].instruction_position);
        for &idx in &ordered {
            let fixup = &self.fixups[idx];
            removed += 3;
            adjustments.push((fixup.fixup_position + fixup.offset_size as usize, removed));
        }

        let adjust_position = |pos: usize| -> usize {
            let mut adj = 0usize;
            for &(threshold, cumulative) in &adjustments {
                if pos >= threshold {
                    adj = cumulative;
                } else {
                    break;
                }
            }
            pos.saturating_sub(adj)
        };

        let mut new_bytecode = Vec::with_capacity(self.bytecode.len());
        let mut src_pos = 0usize;

        let mut sorted_indices: Vec<usize> = (0..self.fixups.len()).collect();
        sorted_indices.sort_by_key(|&i| self.fixups[i].instruction_position);

        for &idx in &sorted_indices {
            let fixup = &self.fixups[idx];

            if src_pos < fixup.instruction_position {
                new_bytecode.extend_from_slice(&self.bytecode[src_pos..fixup.instruction_position]);
            }
            src_pos = fixup.instruction_position;

            if shrinkable_set.contains(&idx) {
                let short_mnemonic = fixup.short_form_mnemonic.ok_or_else(|| {
                    Error::InvalidMnemonic("missing short form for shrinkable branch".to_string())
                })?;
                let (opcode, prefix, _) = get_mnemonic_lookup()
                    .get(short_mnemonic)
                    .ok_or_else(|| Error::InvalidMnemonic(short_mnemonic.to_string()))?;

                if *prefix != 0 {
                    new_bytecode.push(*prefix);
                }
                new_bytecode.push(*opcode);
                new_bytecode.push(0);

                src_pos = fixup.fixup_position + 4;
            } else {
                let instr_end = fixup.fixup_position + fixup.offset_size as usize;
                new_bytecode.extend_from_slice(&self.bytecode[src_pos..instr_end]);
                src_pos = instr_end;
            }
        }

        if src_pos < self.bytecode.len() {
            new_bytecode.extend_from_slice(&self.bytecode[src_pos..]);
        }

        for pos in self.labels.values_mut() {
            *pos = u32::try_from(adjust_position(*pos as usize))
                .map_err(|_| malformed_error!("Label position exceeds u32 range"))?;
        }

        for (idx, fixup) in self.fixups.iter_mut().enumerate() {
            let new_instr_pos = adjust_position(fixup.instruction_position);

            if shrinkable_set.contains(&idx) {
                fixup.instruction_position = new_instr_pos;
                fixup.fixup_position = new_instr_pos + 1;
                fixup.offset_size = 1;
                fixup.short_form_mnemonic = None;
            } else {
                fixup.instruction_position = new_instr_pos;
                fixup.fixup_position = adjust_position(fixup.fixup_position);
            }
        }

        for switch_fixup in &mut self.switch_fixups {
            switch_fixup.fixup_position = adjust_position(switch_fixup.fixup_position);
            switch_fixup.instruction_end_position =
                adjust_position(switch_fixup.instruction_end_position);
        }

        for clause in &mut self.clauses {
            clause.try_start = adjust_position(clause.try_start);
            clause.try_end = adjust_position(clause.try_end);
            clause.handler_start = adjust_position(clause.handler_start);
            clause.handler_end = adjust_position(clause.handler_end);
            if clause.flags == ExceptionHandlerFlags::FILTER {
                clause.filter_start = adjust_position(clause.filter_start);
            }
        }

        self.bytecode = new_bytecode;
        Ok(())
    }

    fn emit_operand(&mut self, operand: Option<Operand>, expected: OperandType) -> Result<()> {
        let wrong = |expected: &str| Error::WrongOperandType {
            expected: expected.to_string(),
        };

        match (expected, operand) {
            (OperandType::None, None) => {}
            (OperandType::None, Some(_)) => return Err(Error::UnexpectedOperand),
            (OperandType::Int8, Some(Operand::Immediate(Immediate::Int8(val)))) => {
                self.bytecode.extend_from_slice(&val.to_le_bytes());
            }
            (OperandType::UInt8, Some(Operand::Immediate(Immediate::UInt8(val)))) => {
                self.bytecode.push(val);
            }
            (OperandType::UInt8, Some(Operand::Local(index) | Operand::Argument(index))) => {
                self.bytecode
                    .push(u8::try_from(index).map_err(|_| wrong("UInt8"))?);
            }
            (OperandType::Int16, Some(Operand::Immediate(Immediate::Int16(val)))) => {
                self.bytecode.extend_from_slice(&val.to_le_bytes());
            }
            (OperandType::UInt16, Some(Operand::Immediate(Immediate::UInt16(val))))
            | (OperandType::UInt16, Some(Operand::Local(val) | Operand::Argument(val))) => {
                self.bytecode.extend_from_slice(&val.to_le_bytes());
            }
            (OperandType::Int32, Some(Operand::Immediate(Immediate::Int32(val)))) => {
                self.bytecode.extend_from_slice(&val.to_le_bytes());
            }
            (OperandType::UInt32, Some(Operand::Immediate(Immediate::UInt32(val)))) => {
                self.bytecode.extend_from_slice(&val.to_le_bytes());
            }
            (OperandType::Int64, Some(Operand::Immediate(Immediate::Int64(val)))) => {
                self.bytecode.extend_from_slice(&val.to_le_bytes());
            }
            (OperandType::UInt64, Some(Operand::Immediate(Immediate::UInt64(val)))) => {
                self.bytecode.extend_from_slice(&val.to_le_bytes());
            }
            (OperandType::Float32, Some(Operand::Immediate(Immediate::Float32(val)))) => {
                self.bytecode.extend_from_slice(&val.to_le_bytes());
            }
            (OperandType::Float64, Some(Operand::Immediate(Immediate::Float64(val)))) => {
                self.bytecode.extend_from_slice(&val.to_le_bytes());
            }
            (OperandType::Token, Some(Operand::Token(token))) => {
                self.bytecode
                    .extend_from_slice(&token.value().to_le_bytes());
            }
            (OperandType::Switch, Some(Operand::Switch(targets))) => {
                let targets_len = u32::try_from(targets.len())
                    .map_err(|_| malformed_error!("Too many switch targets"))?;
                self.bytecode.extend_from_slice(&targets_len.to_le_bytes());
                for target in targets {
                    self.bytecode.extend_from_slice(&target.to_le_bytes());
                }
            }
            (expected, _) => return Err(wrong(&format!("{expected:?}"))),
        }
        Ok(())
    }

    fn write_branch_offset(&mut self, offset: i32, fixup: &LabelFixup) -> Result<()> {
        match fixup.offset_size {
            1 => {
                let offset_i8 = i8::try_from(offset).map_err(|_| {
                    Error::InvalidBranch(format!(
                        "offset {offset} out of range for 1-byte instruction"
                    ))
                })?;
                self.bytecode[fixup.fixup_position] = offset_i8.to_le_bytes()[0];
            }
            4 => {
                self.bytecode[fixup.fixup_position..fixup.fixup_position + 4]
                    .copy_from_slice(&offset.to_le_bytes());
            }
            _ => {
                return Err(Error::InvalidBranch(format!(
                    "invalid offset size: {} bytes",
                    fixup.offset_size
                )))
            }
        }
        Ok(())
    }

    fn update_stack_depth(&mut self, pops: u8, pushes: u8) -> Result<()> {
        let net_effect = i16::from(pushes) - i16::from(pops);
        self.current_stack_depth += net_effect;

        if self.current_stack_depth < 0 && !self.unreachable {
            return Err(malformed_error!(
                "Stack underflow: depth became {} after instruction with {} pops, {} pushes",
                self.current_stack_depth,
                pops,
                pushes
            ));
        }

        if self.current_stack_depth < 0 {
            self.current_stack_depth = 0;
        }

        let current_depth_u16 = u16::try_from(self.current_stack_depth)
            .map_err(|_| malformed_error!("Stack depth exceeds u16 range"))?;
        self.max_stack_depth = self.max_stack_depth.max(current_depth_u16);

        Ok(())
    }

    /// Highest stack depth seen so far.
    #[must_use]
    pub fn max_stack_depth(&self) -> u16 {
        self.max_stack_depth
    }

    /// Stack depth at the current position.
    #[must_use]
    pub fn current_stack_depth(&self) -> i16 {
        self.current_stack_depth
    }

    fn record_label_stack_depth(&mut self, label: &str) -> Result<()> {
        if self.unreachable {
            return Ok(());
        }

        if let Some(&expected) = self.label_stack_depths.get(label) {
            if self.current_stack_depth != expected {
                return Err(malformed_error!(
                    "Stack depth mismatch for branch to '{}': expected {}, but branch has {}",
                    label,
                    expected,
                    self.current_stack_depth
                ));
            }
        } else {
            self.label_stack_depths
                .insert(label.to_string(), self.current_stack_depth);
        }
        Ok(())
    }

    /// Overrides the tracked stack depth, e.g. on entry to a handler.
    pub fn set_stack_depth(&mut self, depth: i16) {
        self.current_stack_depth = depth;
        if let Ok(depth) = u16::try_from(depth) {
            self.max_stack_depth = self.max_stack_depth.max(depth);
        }
    }
}

impl Default for InstructionEncoder {
    fn default() -> Self {
        Self::new()
    }
}
