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

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]

//! # dotshim
//!
//! Runtime method interception for CIL bytecode.
//!
//! `dotshim` runs managed methods with selected callees replaced by user-supplied
//! implementations. It never patches a method in place. Instead, the entry method is
//! rewritten so that every call site (`call`, `callvirt`, `newobj`, `ldftn`,
//! `ldvirtftn`) goes through a generated stub. At run time the stub either invokes a
//! matching shim or rewrites the real callee the same way and calls it. Interception
//! therefore follows the call graph as deep as execution goes, while only methods
//! that are actually reached are ever rewritten.
//!
//! ## Features
//!
//! - **Shims** for static methods, instance methods (on every instance, one type, or
//!   one bound instance), constructors, property getters and setters
//! - **Lazy rewriting** with per-run caches of stubs and rewritten bodies
//! - **Exception regions** carried through rewriting with their nesting intact
//! - **A CIL execution substrate**: symbol tables, an in-memory module with builders,
//!   an interpreter and a managed heap
//! - **Diagnostics**: listings of original and rewritten bodies
//!
//! ## Quick Start
//!
//! ```rust
//! use dotshim::prelude::*;
//! use std::sync::Arc;
//!
//! let module = Module::new();
//! let write_line = module.corlib().console_write_line_string;
//! let greeting = module.add_user_string("hello");
//! let program = TypeDefBuilder::new("Demo", "Program").build(&module)?;
//! let main = MethodDefBuilder::new("Main")
//!     .static_method()
//!     .body(MethodBodyBuilder::new().implementation(move |asm| {
//!         asm.ldstr(greeting)?.call(write_line)?.ret()?;
//!         Ok(())
//!     }))
//!     .build(&module, program)?;
//!
//! let silence = Shim::replace(&module, write_line)?.with_native(
//!     &module,
//!     NativeMethod::new("silence", vec![TypeSig::String], TypeSig::Void, |_, _| {
//!         Ok(Value::Void)
//!     }),
//! )?;
//!
//! let runtime = Runtime::new(Arc::new(module));
//! isolate(&runtime, main, vec![silence])?;
//! assert!(runtime.console().lines().is_empty());
//! # Ok::<(), dotshim::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`metadata`] - Tokens, type signatures, method definitions and bodies, the
//!   [`metadata::SymbolTable`] trait and the in-memory [`metadata::Module`]
//! - [`assembly`] - CIL decoding, encoding with labels and branch fixups, and a
//!   fluent assembler
//! - [`emulation`] - The execution substrate: values, heap, threads, the interpreter
//!   and dynamic methods
//! - [`isolation`] - Shims, the rewriter, stubs, caches and the [`isolation::isolate`]
//!   entry point
//! - [`Error`] and [`Result`] - Error handling
//!
//! ## Standards
//!
//! Instruction encodings, method body layout and exception clause semantics follow
//! ECMA-335 (6th edition), Partition II and III.
#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;
pub(crate) mod file;

/// Convenient re-exports of the most commonly used types and traits.
///
/// ```rust
/// use dotshim::prelude::*;
///
/// let module = Module::new();
/// let program = TypeDefBuilder::new("Demo", "Program").build(&module)?;
/// assert_eq!(module.type_def(program)?.name, "Program");
/// # Ok::<(), dotshim::Error>(())
/// ```
pub mod prelude;

/// CIL instruction decoding and encoding.
///
/// The decoder turns method bodies into [`assembly::Instruction`]s with resolved branch
/// targets. [`assembly::InstructionEncoder`] writes instructions back, resolving labels
/// and computing the maximum stack depth; [`assembly::InstructionAssembler`] is a
/// fluent front end used by the builders.
///
/// # Examples
///
/// ```rust
/// use dotshim::{assembly::decode_instruction, Parser};
///
/// let bytecode = &[0x00, 0x2A]; // nop, ret
/// let mut parser = Parser::new(bytecode);
/// let instruction = decode_instruction(&mut parser)?;
/// assert_eq!(instruction.mnemonic, "nop");
/// # Ok::<(), dotshim::Error>(())
/// ```
pub mod assembly;

/// The execution substrate.
pub mod emulation;

/// Method interception.
pub mod isolation;

/// Metadata model: tokens, signatures, methods, types and symbol resolution.
///
/// # Examples
///
/// ```rust
/// use dotshim::metadata::{Module, SymbolTable};
///
/// let module = Module::new();
/// let console = module.corlib().console;
/// assert_eq!(module.type_def(console)?.full_name(), "System.Console");
/// # Ok::<(), dotshim::Error>(())
/// ```
pub mod metadata;

/// `dotshim` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `dotshim` Error type
///
/// The main error type for all operations in this crate: malformed bodies, lookups,
/// rewriting failures, shim validation and execution errors.
pub use error::Error;

/// Bounds-checked little-endian reader over a byte slice.
pub use file::parser::Parser;
