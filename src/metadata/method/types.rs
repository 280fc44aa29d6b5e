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

//! Method flags, body header flags and signature shapes.
//!
//! # Key Types
//! - [`MethodImplCodeType`], [`MethodImplOptions`]: implementation flags
//! - [`MethodAccessFlags`], [`MethodModifiers`]: attribute flags
//! - [`MethodBodyFlags`], [`SectionFlags`]: method body and section flags
//! - [`LocalVariable`], [`MethodSignature`]: local slots and call signatures

use std::fmt;

use bitflags::bitflags;

use crate::metadata::typesystem::TypeSig;

/// Bitmask for the code type bits of the implementation flags
pub const METHOD_IMPL_CODE_TYPE_MASK: u32 = 0x0003;
/// Bitmask for the member access bits of the method flags
pub const METHOD_ACCESS_MASK: u32 = 0x0007;

bitflags! {
    /// How a method is implemented.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodImplCodeType: u32 {
        /// Method body is CIL
        const IL = 0x0000;
        /// Method body is native code
        const NATIVE = 0x0001;
        /// Method body is optimized CIL
        const OPTIL = 0x0002;
        /// Method is provided by the runtime
        const RUNTIME = 0x0003;
    }
}

impl MethodImplCodeType {
    /// Extracts the code type from raw implementation flags.
    #[must_use]
    pub fn from_impl_flags(flags: u32) -> Self {
        Self::from_bits_truncate(flags & METHOD_IMPL_CODE_TYPE_MASK)
    }
}

bitflags! {
    /// Additional implementation options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodImplOptions: u32 {
        /// Method may not be inlined
        const NO_INLINING = 0x0008;
        /// Method is single-threaded through the body
        const SYNCHRONIZED = 0x0020;
        /// Method signature is exported exactly as declared
        const PRESERVE_SIG = 0x0080;
        /// Method should be inlined if possible
        const AGGRESSIVE_INLINING = 0x0100;
        /// Method is implemented inside the runtime
        const INTERNAL_CALL = 0x1000;
    }
}

impl MethodImplOptions {
    /// Extracts the options from raw implementation flags.
    #[must_use]
    pub fn from_impl_flags(flags: u32) -> Self {
        Self::from_bits_truncate(flags & !METHOD_IMPL_CODE_TYPE_MASK)
    }
}

bitflags! {
    /// Member access.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodAccessFlags: u32 {
        /// Accessible only to the declaring type
        const PRIVATE = 0x0001;
        /// Accessible within the assembly
        const ASSEM = 0x0003;
        /// Accessible to the type and its subtypes
        const FAMILY = 0x0004;
        /// Accessible to everyone
        const PUBLIC = 0x0006;
    }
}

impl MethodAccessFlags {
    /// Extracts the access bits from raw method flags.
    #[must_use]
    pub fn from_method_flags(flags: u32) -> Self {
        Self::from_bits_truncate(flags & METHOD_ACCESS_MASK)
    }
}

bitflags! {
    /// Method modifiers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodModifiers: u32 {
        /// Defined on the type, not per instance
        const STATIC = 0x0010;
        /// Cannot be overridden
        const FINAL = 0x0020;
        /// Dispatched through the vtable
        const VIRTUAL = 0x0040;
        /// Hidden by name and signature
        const HIDE_BY_SIG = 0x0080;
        /// Always gets a new vtable slot
        const NEW_SLOT = 0x0100;
        /// Has no implementation
        const ABSTRACT = 0x0400;
        /// Name is special
        const SPECIAL_NAME = 0x0800;
        /// Name is special to the runtime (`.ctor`, `.cctor`)
        const RTSPECIAL_NAME = 0x1000;
        /// Implemented through platform invoke
        const PINVOKE_IMPL = 0x2000;
    }
}

impl MethodModifiers {
    /// Extracts the modifier bits from raw method flags.
    #[must_use]
    pub fn from_method_flags(flags: u32) -> Self {
        Self::from_bits_truncate(flags & !METHOD_ACCESS_MASK)
    }
}

bitflags! {
    /// Method body header flags (ECMA-335 II.25.4.4).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodBodyFlags: u16 {
        /// Tiny header, one byte
        const TINY_FORMAT = 0x2;
        /// Fat header, twelve bytes
        const FAT_FORMAT = 0x3;
        /// Extra data sections follow the code
        const MORE_SECTS = 0x8;
        /// Locals are zero-initialized
        const INIT_LOCALS = 0x10;
    }
}

bitflags! {
    /// Method data section flags (ECMA-335 II.25.4.5).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u8 {
        /// Exception handling data
        const EHTABLE = 0x1;
        /// Reserved
        const OPT_ILTABLE = 0x2;
        /// Fat section layout
        const FAT_FORMAT = 0x40;
        /// Another section follows
        const MORE_SECTS = 0x80;
    }
}

/// A local variable slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariable {
    /// Declared type of the slot
    pub signature: TypeSig,
    /// Slot is pinned
    pub is_pinned: bool,
}

impl LocalVariable {
    /// An unpinned local of the given type.
    #[must_use]
    pub fn new(signature: TypeSig) -> Self {
        LocalVariable {
            signature,
            is_pinned: false,
        }
    }
}

/// A call signature as seen by a call site.
///
/// `params` never contains the implicit receiver; `has_this` says whether one is passed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    /// Whether an implicit receiver precedes the parameters
    pub has_this: bool,
    /// Parameter types
    pub params: Vec<TypeSig>,
    /// Return type
    pub return_type: TypeSig,
}

impl MethodSignature {
    /// Number of stack slots a call with this signature consumes.
    #[must_use]
    pub fn stack_pops(&self) -> usize {
        self.params.len() + usize::from(self.has_this)
    }

    /// Whether a call with this signature pushes a result.
    #[must_use]
    pub fn has_result(&self) -> bool {
        self.return_type != TypeSig::Void
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_this {
            write!(f, "instance ")?;
        }
        write!(f, "{} (", self.return_type)?;
        for (index, param) in self.params.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{param}")?;
        }
        write!(f, ")")
    }
}
