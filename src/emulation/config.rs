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

//! Execution limits.
//!
//! # Example
//!
//! ```rust
//! use dotshim::emulation::RuntimeLimits;
//!
//! let limits = RuntimeLimits::new()
//!     .with_max_instructions(1_000_000)
//!     .with_max_call_depth(64);
//! assert_eq!(limits.max_call_depth, 64);
//! ```

/// Resource limits enforced while executing managed code.
///
/// # Default Values
///
/// | Setting | Default Value |
/// |---------|---------------|
/// | `max_call_depth` | 128 |
/// | `max_instructions` | 10,000,000 |
/// | `max_heap_objects` | 1,000,000 |
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeLimits {
    /// Maximum number of nested managed calls.
    ///
    /// Interpreted frames, stubs and native methods all count. Exceeding it fails the
    /// call with [`crate::Error::CallDepthExceeded`].
    pub max_call_depth: usize,

    /// Maximum instructions executed by one thread, 0 for unlimited.
    pub max_instructions: u64,

    /// Maximum number of live heap objects, 0 for unlimited.
    pub max_heap_objects: usize,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        RuntimeLimits {
            max_call_depth: 128,
            max_instructions: 10_000_000,
            max_heap_objects: 1_000_000,
        }
    }
}

impl RuntimeLimits {
    /// Creates limits with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits without an instruction or heap budget.
    #[must_use]
    pub fn unlimited() -> Self {
        RuntimeLimits {
            max_instructions: 0,
            max_heap_objects: 0,
            ..Self::default()
        }
    }

    /// Sets the maximum call depth.
    #[must_use]
    pub fn with_max_call_depth(mut self, max: usize) -> Self {
        self.max_call_depth = max;
        self
    }

    /// Sets the instruction budget (0 for unlimited).
    #[must_use]
    pub fn with_max_instructions(mut self, max: u64) -> Self {
        self.max_instructions = max;
        self
    }

    /// Sets the maximum number of live heap objects (0 for unlimited).
    #[must_use]
    pub fn with_max_heap_objects(mut self, max: usize) -> Self {
        self.max_heap_objects = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder() {
        let limits = RuntimeLimits::new()
            .with_max_call_depth(8)
            .with_max_instructions(100)
            .with_max_heap_objects(5);
        assert_eq!(limits.max_call_depth, 8);
        assert_eq!(limits.max_instructions, 100);
        assert_eq!(limits.max_heap_objects, 5);

        let unlimited = RuntimeLimits::unlimited();
        assert_eq!(unlimited.max_instructions, 0);
        assert_eq!(unlimited.max_call_depth, RuntimeLimits::default().max_call_depth);
    }
}
