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

//! Method interception.
//!
//! This module runs managed code with selected methods replaced by user-supplied
//! implementations ("shims"). Nothing is patched in place: the entry method's body is
//! rewritten into a [`crate::emulation::DynamicMethod`] in which every call site goes
//! through a generated stub. When executed, a stub looks for a matching shim and
//! otherwise rewrites the real target the same way and calls that, so interception
//! reaches arbitrarily deep call chains.
//!
//! # Architecture
//!
//! - [`shim`] - [`Shim`] construction and signature validation
//! - [`registry`] - [`ShimRegistry`] lookup by identity and receiver
//! - [`config`] - [`IsolationConfig`], intrinsic namespaces and forwarding policy
//! - [`regions`] - [`RegionTracker`], exception clause boundaries during rewriting
//! - [`rewriter`] - [`rewrite`], the body transformation
//! - [`stubs`] - [`Stub`] flavors for each call instruction
//! - [`cache`] - [`StubCache`] of stubs and rewritten bodies
//! - [`context`] - [`RunContext`], the state shared by all stubs of a run
//! - [`isolate`](mod@isolate) - [`IsolationRun`] and the [`isolate()`] entry point
//! - [`decompile`](mod@decompile) - textual listings of original and rewritten bodies
//!
//! # Runs
//!
//! All state of a run lives in one [`RunContext`] owned through an `Arc`. Stubs only
//! keep a weak reference to it, so dropping the [`IsolationRun`] releases the caches.
//! Concurrent runs on different threads share nothing.
//!
//! # Examples
//!
//! ```rust
//! use dotshim::emulation::{NativeMethod, Runtime, Value};
//! use dotshim::isolation::{IsolationRun, Shim};
//! use dotshim::metadata::{
//!     builders::{MethodBodyBuilder, MethodDefBuilder, TypeDefBuilder},
//!     Module, TypeSig,
//! };
//! use std::sync::Arc;
//!
//! let module = Module::new();
//! let program = TypeDefBuilder::new("Demo", "Program").build(&module)?;
//! let now = MethodDefBuilder::new("Now")
//!     .static_method()
//!     .returns(TypeSig::I4)
//!     .body(MethodBodyBuilder::new().implementation(|asm| {
//!         asm.ldc_i4(2024)?.ret()?;
//!         Ok(())
//!     }))
//!     .build(&module, program)?;
//! let age = MethodDefBuilder::new("Age")
//!     .static_method()
//!     .returns(TypeSig::I4)
//!     .body(MethodBodyBuilder::new().implementation(move |asm| {
//!         asm.call(now)?.ldc_i4(2000)?.sub()?.ret()?;
//!         Ok(())
//!     }))
//!     .build(&module, program)?;
//!
//! let frozen = Shim::replace(&module, now)?.with_native(
//!     &module,
//!     NativeMethod::new("frozen", vec![], TypeSig::I4, |_, _| Ok(Value::I4(2030))),
//! )?;
//!
//! let runtime = Runtime::new(Arc::new(module));
//! let run = IsolationRun::new(&runtime, vec![frozen])?;
//! assert_eq!(run.invoke(age, vec![])?, Value::I4(30));
//! # Ok::<(), dotshim::Error>(())
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod decompile;
pub mod isolate;
pub mod regions;
pub mod registry;
pub mod rewriter;
pub mod shim;
pub mod stubs;

pub use cache::StubCache;
pub use config::{ForwardPolicy, IsolationConfig, DEFAULT_INTRINSIC_NAMESPACES};
pub use context::RunContext;
pub use decompile::{decompile, decompile_dynamic};
pub use isolate::{isolate, IsolationRun};
pub use regions::{RegionEvent, RegionTracker};
pub use registry::{Receiver, ShimRegistry};
pub use rewriter::{rewrite, ArgumentLayout};
pub use shim::{ReceiverMatch, Replacement, Shim, ShimBuilder};
pub use stubs::{stub_name, Stub, StubKind, StubSignature};
