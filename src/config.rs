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

#![allow(missing_docs)]

//! Node configuration: the `self` document of the membership store (§6.1).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("host and port lists must be the same non-zero length")]
    HostPortMismatch,
    #[error("toml parse")]
    Toml,
    #[error("io")]
    Io,
}

/// Certificate material paths for the mutual-TLS listener/dialer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CertificatePaths {
    /// Private key PEM path.
    pub key: String,
    /// Leaf certificate PEM path.
    pub certificate: String,
    /// CA bundle PEM path used to verify peers.
    pub ca: String,
}

/// The `self` document of the membership store (`gossip_crackertable`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Hosts this babbler listens on, paired positionally with `port`.
    pub host: Vec<String>,
    /// Ports this babbler listens on, paired positionally with `host`.
    pub port: Vec<u16>,
    /// Maximum number of unverified third-party peer-table entries (0 = unbounded).
    #[serde(default)]
    pub maxconv: u32,
    /// Debug flag, unused by this crate beyond passthrough logging verbosity.
    #[serde(default)]
    pub debug: u8,
    /// Verbose flag, unused by this crate beyond passthrough logging verbosity.
    #[serde(default)]
    pub verbose: u8,
    /// My own Contact version. Defaults to 1 when absent, per spec.
    #[serde(default = "default_version")]
    pub version: u64,
    /// TLS certificate material.
    pub certificates: CertificatePaths,
}

fn default_version() -> u64 {
    1
}

impl GossipConfig {
    /// Validate the host/port invariant required by §6.1.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() || self.host.len() != self.port.len() {
            return Err(ConfigError::HostPortMismatch);
        }
        Ok(())
    }

    /// Load from a TOML seed file (used by `seed-config` and local dev bootstrapping).
    pub fn load_toml(path: &str) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
        let cfg: GossipConfig = toml::from_str(&text).map_err(|_| ConfigError::Toml)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// One service entry as stored under `services.<key>` in a watch-list document;
/// the document's own id (`self`, or a peer's identifier) is the group.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceEntry {
    /// Protocol tag, matched case-insensitively against the probe registry.
    pub proto: String,
    /// Target host.
    pub ipv4: String,
    /// Target port.
    pub port: u16,
    /// Per-check timeout in seconds.
    pub timeout: u64,
}

/// The `self` document of the watch-list store (`gossip_watchlist`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServiceListDocument {
    /// Service key -> entry. The enclosing document's id (`self`, or a peer's
    /// identifier) is the reconciliation group, not a key inside this map.
    #[serde(default)]
    pub services: std::collections::BTreeMap<String, ServiceEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_host_port_lengths() {
        let cfg = GossipConfig {
            host: vec!["a".into(), "b".into()],
            port: vec![1],
            maxconv: 0,
            debug: 0,
            verbose: 0,
            version: 1,
            certificates: CertificatePaths {
                key: "k".into(),
                certificate: "c".into(),
                ca: "ca".into(),
            },
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::HostPortMismatch)));
    }

    #[test]
    fn defaults_version_to_one() {
        let text = r#"
            host = ["localhost"]
            port = [50000]
            [certificates]
            key = "k.pem"
            certificate = "c.pem"
            ca = "ca.pem"
        "#;
        let cfg: GossipConfig = toml::from_str(text).unwrap();
        assert_eq!(cfg.version, 1);
    }
}
