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

//! Exception handling clauses of a method body (ECMA-335 II.25.4.6).

use bitflags::bitflags;
use strum::Display;

use crate::metadata::token::Token;

bitflags! {
    /// Kind of an exception handling clause.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExceptionHandlerFlags: u16 {
        /// A typed catch clause
        const EXCEPTION = 0x0000;
        /// A filter followed by a handler
        const FILTER = 0x0001;
        /// A finally clause
        const FINALLY = 0x0002;
        /// A fault clause, run only when an exception leaves the guarded block
        const FAULT = 0x0004;
    }
}

/// Clause kinds with the catch case made explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ExceptionRegionKind {
    /// Typed catch
    #[strum(serialize = "catch")]
    Catch,
    /// Filter plus handler
    #[strum(serialize = "filter")]
    Filter,
    /// Finally
    #[strum(serialize = "finally")]
    Finally,
    /// Fault
    #[strum(serialize = "fault")]
    Fault,
}

/// One exception handling clause.
///
/// Offsets are byte offsets into the method's code; ranges are half-open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Clause kind
    pub flags: ExceptionHandlerFlags,
    /// Start of the guarded block
    pub try_offset: u32,
    /// Length of the guarded block
    pub try_length: u32,
    /// Start of the handler
    pub handler_offset: u32,
    /// Length of the handler
    pub handler_length: u32,
    /// Caught type, for catch clauses
    pub handler: Option<Token>,
    /// Start of the filter block, for filter clauses
    pub filter_offset: u32,
}

impl ExceptionHandler {
    /// The clause kind.
    #[must_use]
    pub fn kind(&self) -> ExceptionRegionKind {
        if self.flags.contains(ExceptionHandlerFlags::FILTER) {
            ExceptionRegionKind::Filter
        } else if self.flags.contains(ExceptionHandlerFlags::FINALLY) {
            ExceptionRegionKind::Finally
        } else if self.flags.contains(ExceptionHandlerFlags::FAULT) {
            ExceptionRegionKind::Fault
        } else {
            ExceptionRegionKind::Catch
        }
    }

    /// End of the guarded block (exclusive).
    #[must_use]
    pub fn try_end(&self) -> u32 {
        self.try_offset.saturating_add(self.try_length)
    }

    /// End of the handler (exclusive).
    #[must_use]
    pub fn handler_end(&self) -> u32 {
        self.handler_offset.saturating_add(self.handler_length)
    }

    /// Whether `offset` lies in the guarded block.
    #[must_use]
    pub fn covers(&self, offset: u32) -> bool {
        offset >= self.try_offset && offset < self.try_end()
    }

    /// Whether `offset` lies in the handler.
    #[must_use]
    pub fn in_handler(&self, offset: u32) -> bool {
        offset >= self.handler_offset && offset < self.handler_end()
    }

    /// Whether `offset` lies in the filter block.
    #[must_use]
    pub fn in_filter(&self, offset: u32) -> bool {
        self.kind() == ExceptionRegionKind::Filter
            && offset >= self.filter_offset
            && offset < self.handler_offset
    }

    /// Whether the clause runs while unwinding, regardless of the exception type.
    #[must_use]
    pub fn is_termination_handler(&self) -> bool {
        matches!(
            self.kind(),
            ExceptionRegionKind::Finally | ExceptionRegionKind::Fault
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clause(flags: ExceptionHandlerFlags) -> ExceptionHandler {
        ExceptionHandler {
            flags,
            try_offset: 2,
            try_length: 10,
            handler_offset: 16,
            handler_length: 4,
            handler: None,
            filter_offset: 12,
        }
    }

    #[test]
    fn ranges() {
        let catch = clause(ExceptionHandlerFlags::EXCEPTION);
        assert_eq!(catch.kind(), ExceptionRegionKind::Catch);
        assert!(catch.covers(2));
        assert!(catch.covers(11));
        assert!(!catch.covers(12));
        assert!(catch.in_handler(19));
        assert!(!catch.in_handler(20));
        assert!(!catch.in_filter(12));
    }

    #[test]
    fn kinds() {
        assert_eq!(clause(ExceptionHandlerFlags::FILTER).kind(), ExceptionRegionKind::Filter);
        assert!(clause(ExceptionHandlerFlags::FILTER).in_filter(14));
        assert!(clause(ExceptionHandlerFlags::FINALLY).is_termination_handler());
        assert!(clause(ExceptionHandlerFlags::FAULT).is_termination_handler());
        assert_eq!(ExceptionRegionKind::Finally.to_string(), "finally");
    }
}
