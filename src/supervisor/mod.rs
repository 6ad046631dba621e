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

//! Supervisor subsystem: scheduling driver + reconciliation glue.

pub mod http_probe;
pub mod probe;
pub mod queue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::ServiceListDocument;
use crate::store::{Database, DocumentChangeHandler};
use queue::Supervisor;

/// Default poll interval when the queue is empty.
const IDLE_POLL: Duration = Duration::from_secs(30);

/// Apply one peer's (or our own) service-list document to the queue: queue
/// every entry under `<document>/<key>`, then sweep anything not re-seen.
/// `document` is the enclosing document's id (`self`, or a peer's
/// identifier) — the reconciliation group, per §4.E/§6.1.
pub fn reconcile(supervisor: &Supervisor, document: &str, doc: &ServiceListDocument) {
    for (key, entry) in doc.services.iter() {
        let uid = format!("{document}/{key}");
        // Pattern 200, interval 180s: the reference probe's fixed defaults,
        // matching the original service-update handler's hardcoded values.
        supervisor.queueservice(&uid, &entry.proto, &entry.ipv4, entry.port, entry.timeout, 200, 180);
    }
    supervisor.removeobsoleteservices(document);
}

/// The scheduling driver (§4.E): pop due checks, otherwise publish a results
/// snapshot and sleep until the next one is due.
pub async fn run_supervisor_loop(supervisor: Arc<Supervisor>, results: Database, shutdown: Arc<AtomicBool>) {
    info!("supervisor driver loop starting");
    while !shutdown.load(Ordering::Relaxed) {
        if supervisor.is_empty() {
            tokio::time::sleep(IDLE_POLL).await;
            continue;
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let next = supervisor.getnextschedule();

        if next <= now {
            supervisor.checkservice();
            continue;
        }

        let wait = next - now;
        let snapshot = supervisor.getresults();
        if let Err(e) = results.write("results", &snapshot).await {
            debug!(error = ?e, "failed to publish supervisor results snapshot");
        }
        tokio::time::sleep(Duration::from_secs(wait)).await;
    }
    info!("supervisor driver loop stopped");
}

/// Bridges the watch-list store's change feed to [`reconcile`]: each changed
/// document id is treated as a reconciliation group within itself.
pub struct WatchlistChangeHandler {
    supervisor: Arc<Supervisor>,
    watchlist: Database,
}

impl WatchlistChangeHandler {
    /// Build a handler bound to `supervisor` and the watch-list database.
    pub fn new(supervisor: Arc<Supervisor>, watchlist: Database) -> Self {
        Self { supervisor, watchlist }
    }

    /// Read `id`'s document and reconcile it under `id` as the group, so
    /// distinct documents never collide in the scheduler's namespace.
    pub fn reconcile_document(&self, id: &str) {
        let doc = match self.watchlist.read(id) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(%id, error = ?e, "failed to read watch-list document");
                return;
            }
        };
        let Ok(doc) = serde_json::from_value::<ServiceListDocument>(doc) else {
            warn!(%id, "malformed service-list document, skipping reconciliation");
            return;
        };
        reconcile(&self.supervisor, id, &doc);
    }
}

#[async_trait]
impl DocumentChangeHandler for WatchlistChangeHandler {
    async fn on_change(&self, id: &str) {
        self.reconcile_document(id);
    }
}
