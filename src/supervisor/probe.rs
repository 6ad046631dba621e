// Copyright (c) 2026 Amunchain
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Probe interface + registry (§4.F, §9 polymorphism design note).

use std::collections::HashMap;
use std::sync::Arc;

use crate::supervisor::queue::{LastStatus, ServiceDescriptor, Supervisor};

/// A pluggable per-protocol liveness check.
///
/// `police` must never block the caller: it launches its own asynchronous work
/// and reports the outcome back through `supervisor.set_laststatus`, per §4.F's
/// "must never throw out" requirement.
pub trait Probe: Send + Sync {
    /// Dispatch a check for `descriptor`, reporting the result via `supervisor`.
    fn police(&self, descriptor: ServiceDescriptor, supervisor: Arc<Supervisor>);
}

/// Registry of probes keyed by uppercase protocol tag.
pub struct ProbeRegistry {
    probes: HashMap<String, Arc<dyn Probe>>,
    unknown: Arc<dyn Probe>,
}

impl ProbeRegistry {
    /// An empty registry; only the unknown-protocol fallback will ever run.
    pub fn new() -> Self {
        Self { probes: HashMap::new(), unknown: Arc::new(UnknownProbe) }
    }

    /// A registry pre-populated with the reference HTTP probe.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register("HTTP", Arc::new(crate::supervisor::http_probe::HttpProbe::new()));
        reg
    }

    /// Register a probe under an uppercase protocol tag.
    pub fn register(&mut self, protocol: &str, probe: Arc<dyn Probe>) {
        self.probes.insert(protocol.to_uppercase(), probe);
    }

    /// Resolve a protocol tag to its probe, falling back to the unknown probe.
    pub fn get(&self, protocol: &str) -> Option<Arc<dyn Probe>> {
        Some(self.probes.get(&protocol.to_uppercase()).cloned().unwrap_or_else(|| self.unknown.clone()))
    }
}

impl Default for ProbeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Fallback probe for protocols with no registered implementation: always
/// reports failure, then forces its interval to `u64::MAX` so the scheduler's
/// lazy-deletion heap never dispatches it again (a one-shot check per §4.F).
pub struct UnknownProbe;

impl Probe for UnknownProbe {
    fn police(&self, descriptor: ServiceDescriptor, supervisor: Arc<Supervisor>) {
        supervisor.set_laststatus(&descriptor.uid, LastStatus::Fail);
        supervisor.set_interval(&descriptor.uid, u64::MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_protocol_falls_back() {
        let registry = ProbeRegistry::new();
        assert!(registry.get("SMTP").is_some());
    }
}
