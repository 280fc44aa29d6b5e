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

//! Memoization of generated stubs and rewritten bodies.
//!
//! Both tables are concurrent maps so stubs running on several threads of one runtime
//! can share them. Generation happens outside of any map lock; when two threads race
//! on the same key the first insertion wins and both observe it.

use std::sync::Arc;

use dashmap::DashMap;

use crate::{
    emulation::DynamicMethodRc,
    isolation::stubs::{Stub, StubKind},
    metadata::MethodIdentity,
    Result,
};

/// Stubs keyed by flavor and target, rewritten bodies keyed by origin and calling
/// convention.
#[derive(Debug, Default)]
pub struct StubCache {
    stubs: DashMap<(StubKind, MethodIdentity), Arc<Stub>>,
    bodies: DashMap<(MethodIdentity, bool), DynamicMethodRc>,
}

impl StubCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached stub of `kind` for `target`.
    #[must_use]
    pub fn stub(&self, kind: StubKind, target: &MethodIdentity) -> Option<Arc<Stub>> {
        self.stubs
            .get(&(kind, target.clone()))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the cached stub, generating and inserting it on a miss.
    ///
    /// # Errors
    /// Returns the generator's error; nothing is cached in that case.
    pub fn stub_or_insert_with<F>(
        &self,
        kind: StubKind,
        target: &MethodIdentity,
        generate: F,
    ) -> Result<Arc<Stub>>
    where
        F: FnOnce() -> Result<Stub>,
    {
        if let Some(stub) = self.stub(kind, target) {
            return Ok(stub);
        }

        let stub = Arc::new(generate()?);
        Ok(Arc::clone(
            self.stubs
                .entry((kind, target.clone()))
                .or_insert(stub)
                .value(),
        ))
    }

    /// The cached rewritten body of `origin`.
    #[must_use]
    pub fn body(&self, origin: &MethodIdentity, interface_dispatch: bool) -> Option<DynamicMethodRc> {
        self.bodies
            .get(&(origin.clone(), interface_dispatch))
            .map(|entry| DynamicMethodRc::clone(entry.value()))
    }

    /// Returns the cached rewritten body, producing and inserting it on a miss.
    ///
    /// # Errors
    /// Returns the producer's error; nothing is cached in that case.
    pub fn body_or_insert_with<F>(
        &self,
        origin: &MethodIdentity,
        interface_dispatch: bool,
        rewrite: F,
    ) -> Result<DynamicMethodRc>
    where
        F: FnOnce() -> Result<DynamicMethodRc>,
    {
        if let Some(body) = self.body(origin, interface_dispatch) {
            return Ok(body);
        }

        let body = rewrite()?;
        Ok(DynamicMethodRc::clone(
            self.bodies
                .entry((origin.clone(), interface_dispatch))
                .or_insert(body)
                .value(),
        ))
    }

    /// Number of cached stubs.
    #[must_use]
    pub fn stub_count(&self) -> usize {
        self.stubs.len()
    }

    /// Number of cached rewritten bodies.
    #[must_use]
    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        emulation::{NativeMethod, Value},
        metadata::{Module, SymbolTable, TypeSig},
        Error,
    };

    fn stub_for(module: &Module, kind: StubKind) -> Stub {
        let method = module
            .method(module.corlib().string_to_upper)
            .unwrap();
        Stub::from_native(
            kind,
            method.identity(),
            NativeMethod::new("fixture", vec![TypeSig::String], TypeSig::String, |_, mut args| {
                Ok(args.pop().unwrap_or(Value::Null))
            }),
        )
    }

    #[test]
    fn stubs_are_generated_once() {
        let module = Module::new();
        let target = module
            .method(module.corlib().string_to_upper)
            .unwrap()
            .identity();
        let cache = StubCache::new();

        let first = cache
            .stub_or_insert_with(StubKind::Call, &target, || Ok(stub_for(&module, StubKind::Call)))
            .unwrap();
        let second = cache
            .stub_or_insert_with(StubKind::Call, &target, || {
                panic!("generator must not run on a hit")
            })
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        cache
            .stub_or_insert_with(StubKind::Virtual, &target, || {
                Ok(stub_for(&module, StubKind::Virtual))
            })
            .unwrap();
        assert_eq!(cache.stub_count(), 2);
        assert_eq!(cache.body_count(), 0);
    }

    #[test]
    fn failed_generation_is_not_cached() {
        let module = Module::new();
        let target = module
            .method(module.corlib().string_to_upper)
            .unwrap()
            .identity();
        let cache = StubCache::new();

        let failed = cache.stub_or_insert_with(StubKind::Construct, &target, || {
            Err(Error::NotSupported("fixture".to_string()))
        });
        assert!(failed.is_err());
        assert!(cache.stub(StubKind::Construct, &target).is_none());
        assert_eq!(cache.stub_count(), 0);
    }
}
