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

//! Structured exception handling (ECMA-335 I.12.4.2).
//!
//! Dispatch is two-pass. The first pass walks the clause table in order (inner clauses
//! first) and selects the first catch whose type matches or filter that accepts the
//! exception; filters run as nested executions and an exception raised inside a
//! filter counts as a rejection. The second pass runs every finally and fault clause
//! that guards the throwing offset and is nested inside the selected clause. An
//! exception escaping one of those handlers replaces the original and is dispatched
//! again from the handler's position.

use crate::{
    emulation::{
        interpreter::{BlockExit, Interpreter},
        thread::ExecutionThread,
        value::{HeapRef, Value},
    },
    metadata::method::{ExceptionHandler, ExceptionRegionKind},
    Error, Result,
};

/// Byte range of a handler block being executed as a nested run.
///
/// Only clauses whose guarded block lies inside the range are visible to it; the
/// enclosing clauses belong to the outer execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block {
    start: u32,
    end: u32,
}

impl Block {
    fn contains(self, clause: &ExceptionHandler) -> bool {
        clause.try_offset >= self.start && clause.try_end() <= self.end
    }
}

fn visible(block: Option<Block>, clause: &ExceptionHandler) -> bool {
    block.map_or(true, |block| block.contains(clause))
}

fn code_offset(offset: u64) -> u32 {
    u32::try_from(offset).unwrap_or(u32::MAX)
}

/// Result of running the finally clauses a `leave` exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LeaveOutcome {
    /// All finally clauses completed; continue at the target
    Completed,
    /// A finally clause raised; dispatch `exception` as if thrown at `offset`
    Raised {
        offset: u64,
        exception: HeapRef,
    },
}

impl Interpreter<'_> {
    /// Finds the handler for `exception` thrown at `offset`, running the finally and
    /// fault clauses it unwinds through.
    ///
    /// Returns the handler offset and the exception it receives.
    ///
    /// # Errors
    /// Returns [`Error::Thrown`] when no visible clause handles the exception.
    pub(super) fn dispatch(
        &mut self,
        thread: &mut ExecutionThread<'_>,
        offset: u64,
        exception: HeapRef,
        block: Option<Block>,
    ) -> Result<(u64, HeapRef)> {
        let method = self.method;
        let runtime = thread.runtime();
        let symbols = runtime.symbols();
        let exception_type = runtime
            .heap()
            .get_type_token(exception, &symbols.core_types())?;
        let at = code_offset(offset);

        let mut selected = None;
        for (index, clause) in method.exception_regions.iter().enumerate() {
            if !clause.covers(at) || !visible(block, clause) {
                continue;
            }
            let handles = match clause.kind() {
                ExceptionRegionKind::Catch => clause
                    .handler
                    .is_some_and(|class| symbols.is_subtype_of(exception_type, class)),
                ExceptionRegionKind::Filter => self.run_filter(thread, clause, exception)?,
                ExceptionRegionKind::Finally | ExceptionRegionKind::Fault => false,
            };
            if handles {
                selected = Some(index);
                break;
            }
        }

        let unwound = selected.unwrap_or(method.exception_regions.len());
        for clause in &method.exception_regions[..unwound] {
            if !clause.is_termination_handler() || !clause.covers(at) || !visible(block, clause) {
                continue;
            }
            log::trace!(
                "unwinding through {} at IL_{:04X}",
                clause.kind(),
                clause.handler_offset
            );
            match self.run_termination_handler(thread, clause) {
                Ok(()) => {}
                Err(Error::Thrown(replacement)) => {
                    return self.dispatch(
                        thread,
                        u64::from(clause.handler_offset),
                        replacement,
                        block,
                    );
                }
                Err(error) => return Err(error),
            }
        }

        match selected.and_then(|index| method.exception_regions.get(index).map(|c| (index, c))) {
            Some((index, clause)) => {
                log::trace!(
                    "{} at IL_{:04X} caught by {} handler at IL_{:04X}",
                    runtime.type_name(exception_type),
                    offset,
                    clause.kind(),
                    clause.handler_offset
                );
                self.caught.push((index, exception));
                Ok((u64::from(clause.handler_offset), exception))
            }
            None => Err(Error::Thrown(exception)),
        }
    }

    /// Runs the finally clauses a `leave` from `offset` to `target` exits, innermost
    /// first.
    pub(super) fn leave(
        &mut self,
        thread: &mut ExecutionThread<'_>,
        offset: u64,
        target: u64,
        block: Option<Block>,
    ) -> Result<LeaveOutcome> {
        let method = self.method;
        let (from, to) = (code_offset(offset), code_offset(target));

        for clause in &method.exception_regions {
            if clause.kind() != ExceptionRegionKind::Finally
                || !clause.covers(from)
                || clause.covers(to)
                || !visible(block, clause)
            {
                continue;
            }
            match self.run_termination_handler(thread, clause) {
                Ok(()) => {}
                Err(Error::Thrown(exception)) => {
                    return Ok(LeaveOutcome::Raised {
                        offset: u64::from(clause.handler_offset),
                        exception,
                    })
                }
                Err(error) => return Err(error),
            }
        }

        self.caught.retain(|(index, _)| {
            method
                .exception_regions
                .get(*index)
                .is_some_and(|clause| !clause.in_handler(from) || clause.in_handler(to))
        });
        Ok(LeaveOutcome::Completed)
    }

    /// The exception the innermost active catch handler around `offset` received.
    pub(super) fn rethrow_target(&self, offset: u64) -> Result<HeapRef> {
        let at = code_offset(offset);
        self.caught
            .iter()
            .rev()
            .find(|(index, _)| {
                self.method
                    .exception_regions
                    .get(*index)
                    .is_some_and(|clause| clause.in_handler(at))
            })
            .map(|(_, exception)| *exception)
            .ok_or_else(|| malformed_error!("rethrow outside of a catch handler at IL_{:04X}", offset))
    }

    fn run_filter(
        &mut self,
        thread: &mut ExecutionThread<'_>,
        clause: &ExceptionHandler,
        exception: HeapRef,
    ) -> Result<bool> {
        let block = Block {
            start: clause.filter_offset,
            end: clause.handler_offset,
        };
        match self.execute(
            thread,
            u64::from(clause.filter_offset),
            vec![Value::ObjectRef(exception)],
            Some(block),
        ) {
            Ok(BlockExit::EndFilter(accepted)) => Ok(accepted),
            Ok(_) => Err(malformed_error!(
                "Filter at IL_{:04X} did not end with endfilter",
                clause.filter_offset
            )),
            Err(Error::Thrown(_)) => Ok(false),
            Err(error) => Err(error),
        }
    }

    fn run_termination_handler(
        &mut self,
        thread: &mut ExecutionThread<'_>,
        clause: &ExceptionHandler,
    ) -> Result<()> {
        let block = Block {
            start: clause.handler_offset,
            end: clause.handler_end(),
        };
        match self.execute(thread, u64::from(clause.handler_offset), Vec::new(), Some(block))? {
            BlockExit::EndFinally => Ok(()),
            _ => Err(malformed_error!(
                "{} handler at IL_{:04X} did not end with endfinally",
                clause.kind(),
                clause.handler_offset
            )),
        }
    }
}
