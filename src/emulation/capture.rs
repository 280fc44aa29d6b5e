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

//! Console output capture.
//!
//! `System.Console` writes never reach the host's stdout; they are collected here so
//! callers can inspect what the managed code printed.

use std::sync::RwLock;

use crate::Result;

/// Lines written through `System.Console`.
#[derive(Debug, Default)]
pub struct ConsoleCapture {
    lines: RwLock<Vec<String>>,
}

impl ConsoleCapture {
    /// Creates an empty capture.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one line.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the capture lock is poisoned.
    pub fn write_line(&self, line: &str) -> Result<()> {
        log::trace!("console: {line}");
        write_lock!(self.lines).push(line.to_string());
        Ok(())
    }

    /// A copy of every line written so far.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .read()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }

    /// Removes and returns every line written so far.
    #[must_use]
    pub fn take(&self) -> Vec<String> {
        self.lines
            .write()
            .map(|mut lines| std::mem::take(&mut *lines))
            .unwrap_or_default()
    }

    /// Number of lines written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.read().map(|lines| lines.len()).unwrap_or(0)
    }

    /// Whether nothing was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_lines() -> Result<()> {
        let console = ConsoleCapture::new();
        assert!(console.is_empty());
        console.write_line("HELLO")?;
        console.write_line("42")?;
        assert_eq!(console.lines(), vec!["HELLO", "42"]);
        assert_eq!(console.take().len(), 2);
        assert!(console.is_empty());
        Ok(())
    }
}
