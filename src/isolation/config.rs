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

//! Isolation configuration.
//!
//! # Overview
//!
//! - [`IsolationConfig`] - Top-level configuration of an isolation run
//! - [`ForwardPolicy`] - Which call targets are left untouched by the rewriter
//!
//! # Configuration Presets
//!
//! - [`IsolationConfig::default()`] - Forwards internal calls, P/Invokes and the
//!   compiler-services namespaces; the runtime's own limits apply
//! - [`IsolationConfig::strict()`] - Routes every call site through a stub and bounds
//!   execution with [`RuntimeLimits::default()`]
//! - [`IsolationConfig::permissive()`] - Default forwarding without instruction or
//!   heap budgets
//!
//! # Example
//!
//! ```rust
//! use dotshim::emulation::RuntimeLimits;
//! use dotshim::isolation::{ForwardPolicy, IsolationConfig};
//!
//! let config = IsolationConfig {
//!     forward: ForwardPolicy::default().with_forced_type("Demo.Native"),
//!     ..IsolationConfig::strict()
//! }
//! .with_limits(RuntimeLimits::new().with_max_call_depth(32))
//! .with_trace_dispatch(true);
//!
//! assert!(config.trace_dispatch);
//! assert_eq!(config.limits.map(|limits| limits.max_call_depth), Some(32));
//! ```

use crate::{
    emulation::RuntimeLimits,
    metadata::{MethodDef, SymbolTable},
};

/// Namespaces whose members are forwarded by default.
pub const DEFAULT_INTRINSIC_NAMESPACES: &[&str] = &[
    "System.Runtime.CompilerServices",
    "System.Runtime.Intrinsics",
    "System.Runtime.InteropServices",
];

/// Decides which call targets are forwarded unchanged.
///
/// A forwarded call keeps its original instruction: no stub is generated and no shim
/// can intercept it. Intrinsic targets (by namespace or forced type name) are always
/// forwarded. Bodiless internal calls and P/Invokes are forwarded when the matching
/// flag is set and no shim names them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardPolicy {
    /// Namespaces whose members are intrinsic; nested namespaces match as well
    pub intrinsic_namespaces: Vec<String>,

    /// Full type names whose members are intrinsic
    pub forced_types: Vec<String>,

    /// Forward bodiless runtime-implemented methods instead of routing them
    /// through a stub
    pub forward_internal_calls: bool,

    /// Forward P/Invoke methods instead of routing them through a stub
    pub forward_pinvoke: bool,
}

impl Default for ForwardPolicy {
    fn default() -> Self {
        ForwardPolicy {
            intrinsic_namespaces: DEFAULT_INTRINSIC_NAMESPACES
                .iter()
                .map(|namespace| (*namespace).to_string())
                .collect(),
            forced_types: Vec::new(),
            forward_internal_calls: true,
            forward_pinvoke: true,
        }
    }
}

impl ForwardPolicy {
    /// A policy that forwards nothing on its own: every call site gets a stub.
    #[must_use]
    pub fn none() -> Self {
        ForwardPolicy {
            intrinsic_namespaces: Vec::new(),
            forced_types: Vec::new(),
            forward_internal_calls: false,
            forward_pinvoke: false,
        }
    }

    /// Adds an intrinsic namespace.
    #[must_use]
    pub fn with_intrinsic_namespace(mut self, namespace: &str) -> Self {
        self.intrinsic_namespaces.push(namespace.to_string());
        self
    }

    /// Adds a type whose members are always forwarded.
    #[must_use]
    pub fn with_forced_type(mut self, full_name: &str) -> Self {
        self.forced_types.push(full_name.to_string());
        self
    }

    /// Sets whether bodiless internal calls are forwarded.
    #[must_use]
    pub fn with_forward_internal_calls(mut self, enabled: bool) -> Self {
        self.forward_internal_calls = enabled;
        self
    }

    /// Sets whether P/Invokes are forwarded.
    #[must_use]
    pub fn with_forward_pinvoke(mut self, enabled: bool) -> Self {
        self.forward_pinvoke = enabled;
        self
    }

    /// Whether `method` is intrinsic: declared in an intrinsic namespace or on a
    /// forced type.
    #[must_use]
    pub fn is_intrinsic(&self, symbols: &dyn SymbolTable, method: &MethodDef) -> bool {
        let Ok(owner) = symbols.type_def(method.declaring_type) else {
            return false;
        };

        let in_namespace = self.intrinsic_namespaces.iter().any(|namespace| {
            owner.namespace == *namespace
                || owner
                    .namespace
                    .strip_prefix(namespace.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        });
        in_namespace || self.forced_types.contains(&owner.full_name())
    }

    /// Whether a bodiless, non-abstract `method` is forwarded under the two flags.
    #[must_use]
    pub fn forwards_bodiless(&self, method: &MethodDef) -> bool {
        if method.is_pinvoke() {
            self.forward_pinvoke
        } else if method.is_internal_call() {
            self.forward_internal_calls
        } else {
            true
        }
    }
}

/// Configuration of one isolation run.
///
/// # Default Configuration
///
/// | Setting | Default Value |
/// |---------|---------------|
/// | `forward` | [`ForwardPolicy::default()`] |
/// | `limits` | `None` (the runtime's limits) |
/// | `trace_dispatch` | `false` |
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IsolationConfig {
    /// Forwarding policy used by the rewriter and the stubs.
    pub forward: ForwardPolicy,

    /// Execution limits of the run's thread.
    ///
    /// `None` uses the limits the runtime was created with.
    pub limits: Option<RuntimeLimits>,

    /// Logs every stub invocation at trace level, not only shim dispatches.
    pub trace_dispatch: bool,
}

impl IsolationConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call site is intercepted and execution is bounded by the default limits.
    #[must_use]
    pub fn strict() -> Self {
        IsolationConfig {
            forward: ForwardPolicy::none(),
            limits: Some(RuntimeLimits::default()),
            trace_dispatch: false,
        }
    }

    /// Default forwarding, no instruction or heap budget.
    #[must_use]
    pub fn permissive() -> Self {
        IsolationConfig {
            forward: ForwardPolicy::default(),
            limits: Some(RuntimeLimits::unlimited()),
            trace_dispatch: false,
        }
    }

    /// Replaces the forwarding policy.
    #[must_use]
    pub fn with_forward_policy(mut self, forward: ForwardPolicy) -> Self {
        self.forward = forward;
        self
    }

    /// Sets the run's execution limits.
    #[must_use]
    pub fn with_limits(mut self, limits: RuntimeLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Enables or disables tracing of every stub invocation.
    #[must_use]
    pub fn with_trace_dispatch(mut self, enabled: bool) -> Self {
        self.trace_dispatch = enabled;
        self
    }
}
