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

//! Metadata tokens.
//!
//! A token is a 32-bit value whose most significant byte selects a table and whose
//! remaining 24 bits are a 1-based row. Instruction operands of `call`, `ldfld`,
//! `ldstr`, `newobj` and friends are tokens.
//!
//! Besides the ECMA-335 tables, rewritten bodies use the private [`TableId::Dynamic`]
//! table: its rows index the body's own dynamic scope (generated stubs and forwarded
//! members), mirroring how a dynamic method resolves tokens through its generator.

use std::fmt;

use strum::{Display, FromRepr};

/// Tables a [`Token`] can point into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u8)]
pub enum TableId {
    /// Type definitions
    TypeDef = 0x02,
    /// Field definitions
    Field = 0x04,
    /// Method definitions
    MethodDef = 0x06,
    /// Stand-alone signatures, used by `calli`
    StandAloneSig = 0x11,
    /// Generic method instantiations
    MethodSpec = 0x2B,
    /// User strings referenced by `ldstr`
    UserString = 0x70,
    /// Entries of a rewritten body's dynamic scope
    Dynamic = 0x7F,
}

/// A metadata token.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub u32);

impl Token {
    /// Creates a new token from its raw value.
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Builds a token from a table and a 1-based row.
    #[must_use]
    pub fn from_parts(table: TableId, row: u32) -> Self {
        Token((u32::from(table as u8) << 24) | (row & 0x00FF_FFFF))
    }

    /// Returns the raw 32-bit value.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Returns the table id byte.
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Returns the table this token points into, if it is a known one.
    #[must_use]
    pub fn table_id(&self) -> Option<TableId> {
        TableId::from_repr(self.table())
    }

    /// Returns the 1-based row.
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Returns `true` for the null token.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if the token indexes a dynamic scope.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.table() == TableId::Dynamic as u8
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}
