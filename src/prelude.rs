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

//! # dotshim Prelude
//!
//! The types needed to build a module, define shims and run code in isolation.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all dotshim operations
pub use crate::Error;

/// The result type used throughout dotshim
pub use crate::Result;

// ================================================================================================
// Metadata
// ================================================================================================

/// Tokens, signatures and definitions
pub use crate::metadata::{
    MethodDef, MethodDefRc, MethodIdentity, MethodSignature, Module, ModuleRc, SymbolTable,
    TableId, Token, TypeDef, TypeSig,
};

/// Builders for types, members and bodies
pub use crate::metadata::builders::{
    FieldDefBuilder, MethodBodyBuilder, MethodDefBuilder, TypeDefBuilder,
};

// ================================================================================================
// Assembly
// ================================================================================================

/// Decoding, encoding and assembling CIL
pub use crate::assembly::{
    decode_method, DecodedMethod, FlowType, Instruction, InstructionAssembler,
    InstructionEncoder, Operand,
};

// ================================================================================================
// Execution
// ================================================================================================

/// The runtime, threads, values and callables
pub use crate::emulation::{
    Callable, DynamicMethod, ExecutionThread, NativeMethod, Runtime, RuntimeLimits, Value,
};

// ================================================================================================
// Isolation
// ================================================================================================

/// Shims and isolation runs
pub use crate::isolation::{
    decompile, isolate, IsolationConfig, IsolationRun, ReceiverMatch, Replacement, Shim,
};
