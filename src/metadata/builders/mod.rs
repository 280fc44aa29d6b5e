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

//! Builders for adding members to a [`crate::metadata::Module`].
//!
//! - [`TypeDefBuilder`] - classes, value types and interfaces
//! - [`FieldDefBuilder`] - static and instance fields
//! - [`MethodDefBuilder`] - methods and constructors, optionally with a body
//! - [`MethodBodyBuilder`] - encoded CIL bodies written with the fluent assembler
//!
//! # Examples
//!
//! ```rust
//! use dotshim::metadata::{
//!     builders::{MethodBodyBuilder, MethodDefBuilder, TypeDefBuilder},
//!     Module, TypeSig,
//! };
//!
//! let module = Module::new();
//! let program = TypeDefBuilder::new("Demo", "Program").build(&module)?;
//! let answer = MethodDefBuilder::new("Answer")
//!     .static_method()
//!     .returns(TypeSig::I4)
//!     .body(MethodBodyBuilder::new().implementation(|asm| {
//!         asm.ldc_i4(42)?.ret()?;
//!         Ok(())
//!     }))
//!     .build(&module, program)?;
//! # let _ = answer;
//! # Ok::<(), dotshim::Error>(())
//! ```

mod method_body;
mod types;

pub use method_body::MethodBodyBuilder;
pub use types::{FieldDefBuilder, MethodDefBuilder, TypeDefBuilder};
