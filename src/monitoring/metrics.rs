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

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use thiserror::Error;

/// Metrics errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus")]
    Prom,
}

/// Metrics container.
#[derive(Clone)]
pub struct Metrics {
    /// Registry.
    pub registry: Registry,

    /// Entries currently held in the peer table.
    pub gossip_peers: IntGauge,
    /// Conversations currently in GOING_ON.
    pub gossip_conversations_active: IntGauge,
    /// Frames successfully read off the wire.
    pub gossip_frames_received_total: IntCounter,
    /// Frames written to the wire.
    pub gossip_frames_sent_total: IntCounter,
    /// Inbound or outbound dials that failed.
    pub gossip_dial_failures_total: IntCounter,

    /// Services currently scheduled in the supervisor queue.
    pub supervisor_queue_depth: IntGauge,
    /// Checks dispatched to a probe.
    pub supervisor_checks_dispatched_total: IntCounter,
    /// Checks that reported `LastStatus::Fail`.
    pub supervisor_checks_failed_total: IntCounter,
}

impl Metrics {
    /// Create and register metrics.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let gossip_peers = IntGauge::new("gossip_peers", "Entries in the peer table")
            .map_err(|_| MetricsError::Prom)?;
        let gossip_conversations_active = IntGauge::new(
            "gossip_conversations_active",
            "Conversations currently in GOING_ON",
        )
        .map_err(|_| MetricsError::Prom)?;
        let gossip_frames_received_total = IntCounter::new(
            "gossip_frames_received_total",
            "Frames successfully read off the wire",
        )
        .map_err(|_| MetricsError::Prom)?;
        let gossip_frames_sent_total =
            IntCounter::new("gossip_frames_sent_total", "Frames written to the wire")
                .map_err(|_| MetricsError::Prom)?;
        let gossip_dial_failures_total = IntCounter::new(
            "gossip_dial_failures_total",
            "Inbound or outbound dials that failed",
        )
        .map_err(|_| MetricsError::Prom)?;

        let supervisor_queue_depth =
            IntGauge::new("supervisor_queue_depth", "Services currently scheduled")
                .map_err(|_| MetricsError::Prom)?;
        let supervisor_checks_dispatched_total = IntCounter::new(
            "supervisor_checks_dispatched_total",
            "Checks dispatched to a probe",
        )
        .map_err(|_| MetricsError::Prom)?;
        let supervisor_checks_failed_total = IntCounter::new(
            "supervisor_checks_failed_total",
            "Checks that reported a failing status",
        )
        .map_err(|_| MetricsError::Prom)?;

        for metric in [
            Box::new(gossip_peers.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(gossip_conversations_active.clone()),
            Box::new(supervisor_queue_depth.clone()),
        ] {
            registry.register(metric).map_err(|_| MetricsError::Prom)?;
        }
        for metric in [
            Box::new(gossip_frames_received_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(gossip_frames_sent_total.clone()),
            Box::new(gossip_dial_failures_total.clone()),
            Box::new(supervisor_checks_dispatched_total.clone()),
            Box::new(supervisor_checks_failed_total.clone()),
        ] {
            registry.register(metric).map_err(|_| MetricsError::Prom)?;
        }

        Ok(Self {
            registry,
            gossip_peers,
            gossip_conversations_active,
            gossip_frames_received_total,
            gossip_frames_sent_total,
            gossip_dial_failures_total,
            supervisor_queue_depth,
            supervisor_checks_dispatched_total,
            supervisor_checks_failed_total,
        })
    }

    /// Encode all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer).map_err(|_| MetricsError::Prom)?;
        String::from_utf8(buffer).map_err(|_| MetricsError::Prom)
    }
}
