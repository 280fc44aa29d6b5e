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


//! Execution substrate for CIL bodies.
//!
//! Original methods, rewritten methods and generated stubs all run here. The
//! substrate interprets decoded bodies against a [`crate::metadata::SymbolTable`],
//! with a managed heap, static field storage and a small set of native core library
//! methods.
//!
//! # Architecture
//!
//! - Values: [`Value`], [`HeapRef`], [`ManagedPointer`] and [`FunctionPointer`]
//! - Storage: [`ManagedHeap`] for objects, arrays, strings and boxes, and
//!   [`StaticFieldStorage`] for static fields
//! - Execution: [`Runtime`] owns the shared state, an [`ExecutionThread`] holds the
//!   frames of one call chain and an [`Interpreter`] executes one activation
//! - Dynamic code: [`DynamicMethod`] bodies resolve their tokens through a
//!   [`DynamicScope`] and [`NativeMethod`]s back core library calls and delegates
//!
//! # Usage Examples
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use dotshim::{
//!     emulation::{Runtime, Value},
//!     metadata::{
//!         builders::{MethodBodyBuilder, MethodDefBuilder, TypeDefBuilder},
//!         Module, TypeSig,
//!     },
//! };
//!
//! let module = Module::new();
//! let program = TypeDefBuilder::new("Demo", "Program").build(&module)?;
//! let double = MethodDefBuilder::new("Double")
//!     .static_method()
//!     .param(TypeSig::I4)
//!     .returns(TypeSig::I4)
//!     .body(MethodBodyBuilder::new().implementation(|asm| {
//!         asm.ldarg_0()?.ldc_i4_2()?.mul()?.ret()?;
//!         Ok(())
//!     }))
//!     .build(&module, program)?;
//!
//! let runtime = Runtime::new(Arc::new(module));
//! assert_eq!(runtime.invoke(double, vec![Value::I4(21)])?, Value::I4(42));
//! # Ok::<(), dotshim::Error>(())
//! ```
//!
//! # Execution Limits
//!
//! [`RuntimeLimits`] bounds the call depth, the number of executed instructions and
//! the number of live heap objects, so runaway code fails with an error instead of
//! exhausting the host.
//!
//! # Thread Safety
//!
//! [`Runtime`] is `Send + Sync`; its heap, statics and caches use concurrent maps.
//! An [`ExecutionThread`] borrows the runtime and is confined to the thread that
//! created it.

mod capture;
mod config;
mod dynamic;
mod heap;
pub mod interpreter;
mod natives;
mod runtime;
mod statics;
mod thread;
mod value;

pub use capture::ConsoleCapture;
pub use config::RuntimeLimits;
pub use dynamic::{
    Callable, DynamicMethod, DynamicMethodRc, DynamicScope, NativeFn, NativeMethod,
    NativeMethodRc, ScopeEntry,
};
pub use heap::{HeapObject, ManagedHeap};
pub use interpreter::Interpreter;
pub use runtime::{Runtime, RuntimeRc};
pub use statics::StaticFieldStorage;
pub use thread::ExecutionThread;
pub use value::{FunctionPointer, HeapRef, ManagedPointer, PointerTarget, Value};
