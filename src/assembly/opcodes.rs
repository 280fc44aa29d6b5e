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

//! Opcode bytes the rewriter and the interpreter single out.
//!
//! Two-byte opcodes share the [`FE_PREFIX`] first byte; their second byte carries an
//! `FE_` prefix here (e.g. [`FE_LDFTN`] is `0xFE 0x06`).
#![allow(missing_docs)]

pub const FE_PREFIX: u8 = 0xFE;

// Calls and construction
pub const JMP: u8 = 0x27;
pub const CALL: u8 = 0x28;
pub const CALLI: u8 = 0x29;
pub const RET: u8 = 0x2A;
pub const CALLVIRT: u8 = 0x6F;
pub const NEWOBJ: u8 = 0x73;

// Argument access, short and long forms
pub const LDARG_0: u8 = 0x02;
pub const LDARG_S: u8 = 0x0E;
pub const LDARGA_S: u8 = 0x0F;
pub const STARG_S: u8 = 0x10;

// Exception flow
pub const THROW: u8 = 0x7A;
pub const ENDFINALLY: u8 = 0xDC;
pub const LEAVE: u8 = 0xDD;
pub const LEAVE_S: u8 = 0xDE;

// 0xFE-prefixed
pub const FE_ARGLIST: u8 = 0x00;
pub const FE_LDFTN: u8 = 0x06;
pub const FE_LDVIRTFTN: u8 = 0x07;
pub const FE_LDARG: u8 = 0x09;
pub const FE_LDARGA: u8 = 0x0A;
pub const FE_STARG: u8 = 0x0B;
pub const FE_LOCALLOC: u8 = 0x0F;
pub const FE_ENDFILTER: u8 = 0x11;
pub const FE_UNALIGNED: u8 = 0x12;
pub const FE_VOLATILE: u8 = 0x13;
pub const FE_TAIL: u8 = 0x14;
pub const FE_CONSTRAINED: u8 = 0x16;
pub const FE_NO: u8 = 0x19;
pub const FE_RETHROW: u8 = 0x1A;
pub const FE_READONLY: u8 = 0x1E;
