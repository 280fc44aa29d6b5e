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

//! Shared state of one isolation run.
//!
//! A [`RunContext`] owns the run's shims, its stub cache and its configuration. The
//! run keeps it alive through an [`Arc`]; every stub refers back to it, so nothing
//! about a run is global and concurrent runs never observe each other.

use std::sync::Arc;

use crate::{
    emulation::Callable,
    isolation::{
        cache::StubCache,
        config::IsolationConfig,
        registry::{Receiver, ShimRegistry},
        rewriter::rewrite,
        shim::Shim,
        stubs::{Stub, StubKind},
    },
    metadata::{MethodDef, MethodDefRc, SymbolTable},
    Error, Result,
};

/// Registry, cache and configuration of one run.
#[derive(Debug)]
pub struct RunContext {
    registry: ShimRegistry,
    cache: StubCache,
    config: IsolationConfig,
}

impl RunContext {
    /// Creates the context of a run.
    #[must_use]
    pub fn new(shims: Vec<Shim>, config: IsolationConfig) -> Arc<RunContext> {
        Arc::new(RunContext {
            registry: ShimRegistry::new(shims),
            cache: StubCache::new(),
            config,
        })
    }

    /// The run's shims.
    #[must_use]
    pub fn registry(&self) -> &ShimRegistry {
        &self.registry
    }

    /// The run's stubs and rewritten bodies.
    #[must_use]
    pub fn cache(&self) -> &StubCache {
        &self.cache
    }

    /// The run's configuration.
    #[must_use]
    pub fn config(&self) -> &IsolationConfig {
        &self.config
    }

    /// Whether `method` is intrinsic under the run's forwarding policy.
    #[must_use]
    pub fn is_intrinsic(&self, symbols: &dyn SymbolTable, method: &MethodDef) -> bool {
        self.config.forward.is_intrinsic(symbols, method)
    }

    /// Whether a call site targeting `method` is emitted unchanged.
    ///
    /// Intrinsics are always forwarded. Otherwise a call is forwarded only when no
    /// shim names the target, the target has no body and is not abstract, the
    /// forwarding policy allows its kind, and a virtual call cannot reach an override.
    #[must_use]
    pub fn forwards(&self, symbols: &dyn SymbolTable, method: &MethodDef, virtual_call: bool) -> bool {
        if self.is_intrinsic(symbols, method) {
            return true;
        }
        if self.registry.names(&method.identity()) {
            return false;
        }
        if virtual_call && method.is_overridable() {
            return false;
        }
        if method.has_body() || method.is_abstract() {
            return false;
        }
        self.config.forward.forwards_bodiless(method)
    }

    /// The shim that applies to a call of `method` on `receiver`, if any.
    #[must_use]
    pub fn shim_for(
        &self,
        symbols: &dyn SymbolTable,
        method: &MethodDefRc,
        receiver: Option<&Receiver>,
    ) -> Option<&Shim> {
        let index = self.registry.find(symbols, method, receiver)?;
        let shim = self.registry.get(index)?;
        log::trace!(
            "shim #{index} replaces {} ({:?})",
            symbols.method_name(method.token),
            shim.replacement()
        );
        Some(shim)
    }

    /// The `kind` stub for `method`, generated on first use.
    ///
    /// # Errors
    /// See [`Stub::generate`].
    pub fn stub(
        self: &Arc<Self>,
        symbols: &dyn SymbolTable,
        kind: StubKind,
        method: &MethodDefRc,
    ) -> Result<Arc<Stub>> {
        self.cache.stub_or_insert_with(kind, &method.identity(), || {
            let stub = Stub::generate(self, symbols, kind, method)?;
            log::debug!("generated {}", stub.name());
            Ok(stub)
        })
    }

    /// The rewritten body of `method`, or the method itself when it has no body.
    ///
    /// # Errors
    /// Returns [`Error::UnsupportedInstruction`] and any other rewrite failure.
    pub fn rewritten(
        self: &Arc<Self>,
        symbols: &dyn SymbolTable,
        method: &MethodDefRc,
        interface_dispatch: bool,
    ) -> Result<Callable> {
        let body = self
            .cache
            .body_or_insert_with(&method.identity(), interface_dispatch, || {
                rewrite(self, symbols, method, interface_dispatch).map(Arc::new)
            });
        match body {
            Ok(body) => Ok(Callable::Dynamic(body)),
            Err(Error::UnreadableMethodBody(_)) => Ok(Callable::Method(MethodDefRc::clone(method))),
            Err(error) => Err(error),
        }
    }

    /// What a stub runs for an unshimmed `method`: the original for intrinsics and
    /// bodiless methods, the rewritten body otherwise.
    ///
    /// # Errors
    /// See [`RunContext::rewritten`].
    pub fn implementation(
        self: &Arc<Self>,
        symbols: &dyn SymbolTable,
        method: &MethodDefRc,
        interface_dispatch: bool,
    ) -> Result<Callable> {
        if self.is_intrinsic(symbols, method) {
            return Ok(Callable::Method(MethodDefRc::clone(method)));
        }
        self.rewritten(symbols, method, interface_dispatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        emulation::{NativeMethod, Value},
        isolation::config::ForwardPolicy,
        metadata::{
            builders::{MethodBodyBuilder, MethodDefBuilder, TypeDefBuilder},
            Module, TypeSig,
        },
    };

    #[test]
    fn forwarding_rules() -> Result<()> {
        let module = Module::new();
        let corlib = module.corlib().clone();
        let unsafe_helpers =
            TypeDefBuilder::new("System.Runtime.CompilerServices", "Unsafe").build(&module)?;
        let as_ref = MethodDefBuilder::new("AsRef")
            .static_method()
            .body(MethodBodyBuilder::new().implementation(|asm| {
                asm.ret()?;
                Ok(())
            }))
            .build(&module, unsafe_helpers)?;

        let write_line = module.method(corlib.console_write_line_string)?;
        let to_string = module.method(corlib.object_to_string)?;
        let as_ref = module.method(as_ref)?;

        let context = RunContext::new(Vec::new(), IsolationConfig::default());
        assert!(context.forwards(&module, &write_line, false));
        assert!(context.forwards(&module, &as_ref, false));
        assert!(!context.forwards(&module, &to_string, true));
        assert!(context.forwards(&module, &to_string, false));

        let strict = RunContext::new(Vec::new(), IsolationConfig::strict());
        assert!(!strict.forwards(&module, &write_line, false));
        assert!(!strict.forwards(&module, &as_ref, false));

        let shim = Shim::replace(&module, corlib.console_write_line_string)?.with_native(
            &module,
            NativeMethod::new("quiet", vec![TypeSig::String], TypeSig::Void, |_, _| {
                Ok(Value::Void)
            }),
        )?;
        let shimmed = RunContext::new(vec![shim], IsolationConfig::default());
        assert!(!shimmed.forwards(&module, &write_line, false));

        let forced = RunContext::new(
            Vec::new(),
            IsolationConfig::strict()
                .with_forward_policy(ForwardPolicy::none().with_forced_type("System.Console")),
        );
        assert!(forced.forwards(&module, &write_line, false));
        Ok(())
    }

    #[test]
    fn stubs_and_bodies_are_cached() -> Result<()> {
        let module = Module::new();
        let program = TypeDefBuilder::new("Demo", "Program").build(&module)?;
        let answer = MethodDefBuilder::new("Answer")
            .static_method()
            .returns(TypeSig::I4)
            .body(MethodBodyBuilder::new().implementation(|asm| {
                asm.ldc_i4(42)?.ret()?;
                Ok(())
            }))
            .build(&module, program)?;
        let answer = module.method(answer)?;
        let context = RunContext::new(Vec::new(), IsolationConfig::default());

        let first = context.stub(&module, StubKind::Call, &answer)?;
        let second = context.stub(&module, StubKind::Call, &answer)?;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name(), "stub_call_Program_Answer");

        let Callable::Dynamic(body) = context.rewritten(&module, &answer, false)? else {
            panic!("a method with a body is rewritten");
        };
        let Callable::Dynamic(again) = context.rewritten(&module, &answer, false)? else {
            panic!("a method with a body is rewritten");
        };
        assert!(Arc::ptr_eq(&body, &again));
        assert_eq!(context.cache().body_count(), 1);

        let write_line = module.method(module.corlib().console_write_line_string)?;
        assert!(matches!(
            context.rewritten(&module, &write_line, false)?,
            Callable::Method(_)
        ));
        assert_eq!(context.cache().body_count(), 1);
        Ok(())
    }
}
