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

//! The CIL interpreter.
//!
//! An [`Interpreter`] executes one activation of a decoded body against an
//! [`ExecutionThread`]. It keeps its own evaluation stack and instruction index; argument
//! and local slots live in the thread's frame so managed pointers to them survive calls.
//!
//! Instructions are dispatched by mnemonic in [`Interpreter::step`], which returns a
//! [`StepResult`] telling the execution loop how control continues. Exception handling
//! (clause selection, filters, `finally`/`fault` unwinding and `leave`) lives in the
//! `exceptions` submodule; finally, fault and filter blocks run as nested executions
//! restricted to the handler's byte range.
//!
//! Anything without an execution rule fails with [`Error::UnsupportedInstruction`].

mod exceptions;
mod handlers;
pub(crate) mod ops;

use crate::{
    assembly::{DecodedMethod, Immediate, Instruction, Operand},
    emulation::{
        dynamic::DynamicScope,
        thread::ExecutionThread,
        value::{HeapRef, ManagedPointer, Value},
    },
    metadata::token::Token,
    Error, Result,
};

use exceptions::{Block, LeaveOutcome};
use ops::{BinaryOp, Fault};

/// How control continues after one instruction.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StepResult {
    /// Fall through to the next instruction
    Continue,
    /// Jump to an offset
    Branch(u64),
    /// Leave a protected region towards an offset
    Leave(u64),
    /// Return from the method
    Return(Value),
    /// Raise a managed exception
    Throw(HeapRef),
    /// End of a finally or fault block
    EndFinally,
    /// End of a filter block with its verdict
    EndFilter(bool),
}

/// How an execution (of the body or a nested handler block) ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BlockExit {
    Return(Value),
    EndFinally,
    EndFilter(bool),
}

/// Executes one activation of a method body.
pub struct Interpreter<'m> {
    method: &'m DecodedMethod,
    scope: Option<&'m DynamicScope>,
    frame: usize,
    constrained: Option<Token>,
    /// Exceptions bound to catch handlers that are currently executing, by clause index
    caught: Vec<(usize, HeapRef)>,
}

impl<'m> Interpreter<'m> {
    /// Creates an interpreter for `method` whose slots live in thread frame `frame`.
    ///
    /// `scope` resolves `0x7F` tokens of dynamic bodies.
    #[must_use]
    pub fn new(method: &'m DecodedMethod, scope: Option<&'m DynamicScope>, frame: usize) -> Self {
        Interpreter {
            method,
            scope,
            frame,
            constrained: None,
            caught: Vec::new(),
        }
    }

    /// Runs the body from offset 0 to its `ret`.
    ///
    /// # Errors
    /// Returns [`Error::Thrown`] for exceptions no clause of this body handles, and
    /// any runtime error.
    pub fn run(&mut self, thread: &mut ExecutionThread<'_>) -> Result<Value> {
        match self.execute(thread, 0, Vec::new(), None)? {
            BlockExit::Return(value) => Ok(value),
            BlockExit::EndFinally | BlockExit::EndFilter(_) => Err(malformed_error!(
                "endfinally or endfilter reached outside of a handler block"
            )),
        }
    }

    fn execute(
        &mut self,
        thread: &mut ExecutionThread<'_>,
        start: u64,
        mut stack: Vec<Value>,
        block: Option<Block>,
    ) -> Result<BlockExit> {
        let method = self.method;
        let mut index = self.position(start)?;

        loop {
            let Some(instruction) = method.instructions.get(index) else {
                return Err(malformed_error!(
                    "Execution ran past the end of the method ({} bytes)",
                    method.code_size
                ));
            };
            thread.tick()?;

            let result = match self.step(thread, instruction, &mut stack) {
                Ok(result) => result,
                Err(Error::Thrown(exception)) => StepResult::Throw(exception),
                Err(error) => return Err(error),
            };

            match result {
                StepResult::Continue => index += 1,
                StepResult::Branch(target) => index = self.position(target)?,
                StepResult::Leave(target) => {
                    stack.clear();
                    match self.leave(thread, instruction.offset, target, block)? {
                        LeaveOutcome::Completed => index = self.position(target)?,
                        LeaveOutcome::Raised { offset, exception } => {
                            let (handler, caught) = self.dispatch(thread, offset, exception, block)?;
                            stack.push(Value::ObjectRef(caught));
                            index = self.position(handler)?;
                        }
                    }
                }
                StepResult::Return(value) => return Ok(BlockExit::Return(value)),
                StepResult::EndFinally => return Ok(BlockExit::EndFinally),
                StepResult::EndFilter(accepted) => return Ok(BlockExit::EndFilter(accepted)),
                StepResult::Throw(exception) => {
                    self.constrained = None;
                    let (handler, caught) =
                        self.dispatch(thread, instruction.offset, exception, block)?;
                    stack.clear();
                    stack.push(Value::ObjectRef(caught));
                    index = self.position(handler)?;
                }
            }
        }
    }

    fn position(&self, offset: u64) -> Result<usize> {
        self.method
            .position(offset)
            .ok_or_else(|| malformed_error!("No instruction starts at IL_{:04X}", offset))
    }

    /// Executes a single instruction.
    pub(crate) fn step(
        &mut self,
        thread: &mut ExecutionThread<'_>,
        instruction: &Instruction,
        stack: &mut Vec<Value>,
    ) -> Result<StepResult> {
        let offset = instruction.offset;
        let constrained = self.constrained.take();

        match instruction.mnemonic {
            "nop" | "break" => {}
            "readonly." | "volatile." | "tail." | "unaligned." => self.constrained = constrained,
            "constrained." => self.constrained = Some(token(instruction)?),

            "ldnull" => stack.push(Value::Null),
            "ldc.i8" => match &instruction.operand {
                Operand::Immediate(Immediate::Int64(value)) => stack.push(Value::I8(*value)),
                _ => return Err(bad_operand(instruction)),
            },
            "ldc.r4" => match &instruction.operand {
                Operand::Immediate(Immediate::Float32(value)) => {
                    stack.push(Value::R8(f64::from(*value)));
                }
                _ => return Err(bad_operand(instruction)),
            },
            "ldc.r8" => match &instruction.operand {
                Operand::Immediate(Immediate::Float64(value)) => stack.push(Value::R8(*value)),
                _ => return Err(bad_operand(instruction)),
            },
            "dup" => {
                let value = pop(stack, offset)?;
                stack.push(value.clone());
                stack.push(value);
            }
            "pop" => {
                pop(stack, offset)?;
            }
            "ret" => return Ok(StepResult::Return(stack.pop().unwrap_or_default())),

            "br" | "br.s" => return Ok(StepResult::Branch(target(instruction)?)),
            "brtrue" | "brtrue.s" => {
                if pop(stack, offset)?.is_true() {
                    return Ok(StepResult::Branch(target(instruction)?));
                }
            }
            "brfalse" | "brfalse.s" => {
                if !pop(stack, offset)?.is_true() {
                    return Ok(StepResult::Branch(target(instruction)?));
                }
            }
            "switch" => {
                let selector = pop(stack, offset)?.as_i4()?;
                if let Some(target) = usize::try_from(selector)
                    .ok()
                    .and_then(|selector| instruction.branch_targets.get(selector))
                {
                    return Ok(StepResult::Branch(*target));
                }
            }
            "leave" | "leave.s" => return Ok(StepResult::Leave(target(instruction)?)),
            "endfinally" => return Ok(StepResult::EndFinally),
            "endfilter" => return Ok(StepResult::EndFilter(pop(stack, offset)?.is_true())),
            "throw" => match pop(stack, offset)? {
                Value::ObjectRef(exception) => return Ok(StepResult::Throw(exception)),
                Value::Null => return Err(thread.null_reference()),
                other => {
                    return Err(Error::TypeMismatch(format!(
                        "IL_{offset:04X}: cannot throw {other}"
                    )))
                }
            },
            "rethrow" => return Ok(StepResult::Throw(self.rethrow_target(offset)?)),

            "shl" | "shr" | "shr.un" => {
                let amount = pop(stack, offset)?;
                let value = pop(stack, offset)?;
                let result = ops::shift(instruction.mnemonic, &value, &amount)
                    .map_err(|fault| arithmetic_fault(thread, fault, offset))?;
                stack.push(result);
            }
            "neg" | "not" => {
                let value = pop(stack, offset)?;
                let result = ops::unary(instruction.mnemonic, &value)
                    .map_err(|fault| arithmetic_fault(thread, fault, offset))?;
                stack.push(result);
            }
            "ceq" | "cgt" | "cgt.un" | "clt" | "clt.un" => {
                let right = pop(stack, offset)?;
                let left = pop(stack, offset)?;
                let result = ops::condition(instruction.mnemonic, &left, &right)
                    .map_err(|fault| arithmetic_fault(thread, fault, offset))?;
                stack.push(Value::from(result));
            }

            "ldstr" => self.load_string(thread, instruction, stack)?,
            "call" | "callvirt" | "newobj" | "ldftn" | "ldvirtftn" => {
                self.call(thread, instruction, stack, constrained)?;
            }
            "calli" => self.call_indirect(thread, instruction, stack)?,

            "ldfld" => self.load_field(thread, instruction, stack)?,
            "ldflda" => self.load_field_address(thread, instruction, stack)?,
            "stfld" => self.store_field(thread, instruction, stack)?,
            "ldsfld" => {
                let value = thread.runtime().load_static(token(instruction)?)?;
                stack.push(value);
            }
            "ldsflda" => stack.push(Value::ManagedPtr(
                ManagedPointer::to_static_field(token(instruction)?),
            )),
            "stsfld" => {
                let value = pop(stack, offset)?;
                thread.runtime().statics().set(token(instruction)?, value)?;
            }

            "box" => self.box_value(thread, instruction, stack)?,
            "unbox" => self.unbox(thread, instruction, stack)?,
            "unbox.any" => self.unbox_any(thread, instruction, stack)?,
            "castclass" | "isinst" => self.cast(thread, instruction, stack)?,
            "initobj" => {
                let pointer = pop(stack, offset)?;
                let value = thread.runtime().default_value(token(instruction)?)?;
                thread.store(pointer.as_pointer()?, value)?;
            }
            "ldobj" => {
                let pointer = pop(stack, offset)?;
                stack.push(thread.load(pointer.as_pointer()?)?);
            }
            "stobj" => {
                let value = pop(stack, offset)?;
                let pointer = pop(stack, offset)?;
                thread.store(pointer.as_pointer()?, value)?;
            }

            "newarr" => self.new_array(thread, instruction, stack)?,
            "ldlen" => self.array_length(thread, instruction, stack)?,
            "ldelema" => self.element_address(thread, instruction, stack)?,

            mnemonic => return self.step_family(thread, instruction, stack, mnemonic),
        }

        Ok(StepResult::Continue)
    }

    /// Instructions recognized by mnemonic prefix.
    fn step_family(
        &mut self,
        thread: &mut ExecutionThread<'_>,
        instruction: &Instruction,
        stack: &mut Vec<Value>,
        mnemonic: &str,
    ) -> Result<StepResult> {
        let offset = instruction.offset;

        if mnemonic.starts_with("ldc.i4") {
            let value = instruction
                .i32_constant()
                .ok_or_else(|| bad_operand(instruction))?;
            stack.push(Value::I4(value));
        } else if mnemonic.starts_with("ldarga") {
            let index = instruction
                .argument_index()
                .ok_or_else(|| bad_operand(instruction))?;
            stack.push(Value::ManagedPtr(ManagedPointer::to_argument(
                self.frame, index,
            )));
        } else if mnemonic.starts_with("ldarg") {
            let index = instruction
                .argument_index()
                .ok_or_else(|| bad_operand(instruction))?;
            let value = thread
                .frame(self.frame)?
                .args
                .get(usize::from(index))
                .cloned()
                .ok_or_else(|| malformed_error!("IL_{:04X}: no argument {}", offset, index))?;
            stack.push(value);
        } else if mnemonic.starts_with("starg") {
            let index = instruction
                .argument_index()
                .ok_or_else(|| bad_operand(instruction))?;
            let value = pop(stack, offset)?;
            let slot = thread
                .frame_mut(self.frame)?
                .args
                .get_mut(usize::from(index))
                .ok_or_else(|| malformed_error!("IL_{:04X}: no argument {}", offset, index))?;
            *slot = value;
        } else if mnemonic.starts_with("ldloca") {
            let index = instruction
                .local_index()
                .ok_or_else(|| bad_operand(instruction))?;
            stack.push(Value::ManagedPtr(ManagedPointer::to_local(
                self.frame, index,
            )));
        } else if mnemonic.starts_with("ldloc") {
            let index = instruction
                .local_index()
                .ok_or_else(|| bad_operand(instruction))?;
            let value = thread
                .frame(self.frame)?
                .locals
                .get(usize::from(index))
                .cloned()
                .ok_or_else(|| malformed_error!("IL_{:04X}: no local {}", offset, index))?;
            stack.push(value);
        } else if mnemonic.starts_with("stloc") {
            let index = instruction
                .local_index()
                .ok_or_else(|| bad_operand(instruction))?;
            let value = pop(stack, offset)?;
            let slot = thread
                .frame_mut(self.frame)?
                .locals
                .get_mut(usize::from(index))
                .ok_or_else(|| malformed_error!("IL_{:04X}: no local {}", offset, index))?;
            *slot = value;
        } else if let Some(op) = BinaryOp::from_mnemonic(mnemonic) {
            let right = pop(stack, offset)?;
            let left = pop(stack, offset)?;
            let result = ops::binary(op, &left, &right)
                .map_err(|fault| arithmetic_fault(thread, fault, offset))?;
            stack.push(result);
        } else if ops::is_conversion(mnemonic) {
            let value = pop(stack, offset)?;
            let result = ops::convert(mnemonic, &value)
                .map_err(|fault| arithmetic_fault(thread, fault, offset))?;
            stack.push(result);
        } else if let Some(condition) = comparison_branch(mnemonic) {
            let right = pop(stack, offset)?;
            let left = pop(stack, offset)?;
            let taken = ops::condition(condition, &left, &right)
                .map_err(|fault| arithmetic_fault(thread, fault, offset))?;
            if taken {
                return Ok(StepResult::Branch(target(instruction)?));
            }
        } else if let Some(kind) = mnemonic.strip_prefix("ldind.") {
            let pointer = pop(stack, offset)?;
            let value = thread.load(pointer.as_pointer()?)?;
            stack.push(narrow(kind, value).map_err(|fault| arithmetic_fault(thread, fault, offset))?);
        } else if let Some(kind) = mnemonic.strip_prefix("stind.") {
            let value = pop(stack, offset)?;
            let pointer = pop(stack, offset)?;
            let value = narrow(kind, value).map_err(|fault| arithmetic_fault(thread, fault, offset))?;
            thread.store(pointer.as_pointer()?, value)?;
        } else if mnemonic.starts_with("ldelem") {
            self.load_element(thread, instruction, stack)?;
        } else if mnemonic.starts_with("stelem") {
            self.store_element(thread, instruction, stack)?;
        } else {
            return Err(unsupported_instruction!(
                offset,
                "no execution rule for {}",
                mnemonic
            ));
        }

        Ok(StepResult::Continue)
    }
}

/// The condition name of a two-operand conditional branch, without its `.s` suffix.
fn comparison_branch(mnemonic: &str) -> Option<&str> {
    let condition = mnemonic.strip_suffix(".s").unwrap_or(mnemonic);
    matches!(
        condition,
        "beq" | "bne.un" | "bge" | "bge.un" | "bgt" | "bgt.un" | "ble" | "ble.un" | "blt" | "blt.un"
    )
    .then_some(condition)
}

/// Truncates a value loaded or stored through a sized indirect or element access.
fn narrow(kind: &str, value: Value) -> std::result::Result<Value, Fault> {
    match kind {
        "i1" | "u1" | "i2" | "u2" | "u4" => ops::convert(&format!("conv.{kind}"), &value),
        _ => Ok(value),
    }
}

pub(crate) fn pop(stack: &mut Vec<Value>, offset: u64) -> Result<Value> {
    stack.pop().ok_or(Error::StackUnderflow(offset))
}

pub(crate) fn pop_args(stack: &mut Vec<Value>, count: usize, offset: u64) -> Result<Vec<Value>> {
    if stack.len() < count {
        return Err(Error::StackUnderflow(offset));
    }
    Ok(stack.split_off(stack.len() - count))
}

fn token(instruction: &Instruction) -> Result<Token> {
    instruction.token().ok_or_else(|| bad_operand(instruction))
}

fn target(instruction: &Instruction) -> Result<u64> {
    instruction
        .branch_targets
        .first()
        .copied()
        .ok_or_else(|| bad_operand(instruction))
}

fn bad_operand(instruction: &Instruction) -> Error {
    malformed_error!(
        "IL_{:04X}: {} has an unexpected operand",
        instruction.offset,
        instruction.mnemonic
    )
}

fn arithmetic_fault(thread: &ExecutionThread<'_>, fault: Fault, offset: u64) -> Error {
    let corlib = thread.runtime().corlib();
    match fault {
        Fault::DivideByZero => thread.throw(corlib.divide_by_zero_exception, None),
        Fault::Overflow => thread.throw(corlib.overflow_exception, None),
        Fault::Mismatch(message) => Error::TypeMismatch(format!("IL_{offset:04X}: {message}")),
    }
}

#[cfg(test)]
mod tests;
