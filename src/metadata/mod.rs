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

//! Metadata model and member resolution.
//!
//! This module holds everything the engine knows about types and members: tokens,
//! type signatures, definitions, method bodies and the [`SymbolTable`] abstraction
//! all other layers resolve through.
//!
//! # Key Components
//!
//! - [`token`] - Metadata tokens (table id + row)
//! - [`typesystem`] - [`TypeSig`], [`TypeDef`] and [`FieldDef`]
//! - [`method`] - Method definitions, identities, bodies and exception clauses
//! - [`symbols`] - The [`SymbolTable`] trait
//! - [`module`] - [`Module`], the in-memory symbol table
//! - [`builders`] - Builders that add types, fields, methods and bodies to a module
//! - [`corlib`] - The minimal core library installed into every module
//!
//! # Examples
//!
//! ```rust
//! use dotshim::metadata::{Module, SymbolTable};
//!
//! let module = Module::new();
//! let console = module.corlib().console;
//! for method in module.methods_of(console) {
//!     println!("{}", module.method_name(method));
//! }
//! ```

pub mod builders;
pub mod corlib;
pub mod method;
pub mod module;
pub mod symbols;
pub mod token;
pub mod typesystem;

pub use corlib::CoreLibrary;
pub use method::{MethodDef, MethodDefRc, MethodIdentity, MethodSignature};
pub use module::{Module, ModuleRc};
pub use symbols::{CoreTypes, FieldDefRc, StandAloneSignature, SymbolTable, TypeDefRc};
pub use token::{TableId, Token};
pub use typesystem::{FieldDef, TypeDef, TypeSig};
