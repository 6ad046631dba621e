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

//! A decentralized gossip overlay of mutually-authenticated "babblers" that
//! replicate a signed membership table, plus a loosely-coupled supervisor that
//! polls services from a document store on a pluggable per-protocol basis.
//!
//! This repository provides:
//! - A length-prefixed frame codec and a signed, monotonic Contact record
//! - Mutually-authenticated TLS conversations between babblers (§4.C)
//! - Babblemouth: the peer table, transport, and membership propagation glue
//! - A min-heap service scheduler with pluggable probes (an HTTP reference probe)
//! - A `sled`-backed store adapter implementing the membership/watch-list/
//!   results document contract
//! - Monitoring via Prometheus metrics and structured JSON logging

/// Node configuration (the `self` document of the membership store).
pub mod config;
/// Gossip engine: framing, signed membership, conversations, and Babblemouth.
pub mod gossip;
/// Observability (metrics, structured logging helpers).
pub mod monitoring;
/// Document-store adapter contract.
pub mod store;
/// Service scheduling and pluggable liveness probes.
pub mod supervisor;
