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

//! Store adapter contract (§4.G / §6.1), implemented over `sled`.
//!
//! Three logical databases live as separate [`sled::Tree`]s inside one shared
//! [`sled::Db`]: the membership store (`gossip_crackertable`), the watch-list
//! store (`gossip_watchlist`), and the results store (`gossip_watchresults`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("db open")]
    DbOpen,
    #[error("db io")]
    DbIo,
    #[error("document is not valid JSON")]
    BadDocument,
}

/// Opens the three logical databases over one on-disk `sled` instance.
#[derive(Clone)]
pub struct Store {
    db: sled::Db,
}

/// The canonical database names (§6.1); overridable at construction for tests.
pub const MEMBERSHIP_DB: &str = "gossip_crackertable";
/// Watch-list database name.
pub const WATCHLIST_DB: &str = "gossip_watchlist";
/// Results database name.
pub const RESULTS_DB: &str = "gossip_watchresults";

impl Store {
    /// Open (or create) the store at `path`.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|_| StoreError::DbOpen)?;
        Ok(Self { db })
    }

    /// Open a named logical database.
    pub fn database(&self, name: &str) -> Result<Database, StoreError> {
        let tree = self.db.open_tree(name).map_err(|_| StoreError::DbIo)?;
        Ok(Database { tree })
    }
}

/// One logical document database (a `sled::Tree`).
#[derive(Clone)]
pub struct Database {
    tree: sled::Tree,
}

impl Database {
    /// Read a document by id; returns an empty JSON object if absent, per contract.
    pub fn read(&self, id: &str) -> Result<serde_json::Value, StoreError> {
        match self.tree.get(id).map_err(|_| StoreError::DbIo)? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|_| StoreError::BadDocument),
            None => Ok(serde_json::json!({})),
        }
    }

    /// Upsert a document, retrying indefinitely on a compare-and-swap conflict
    /// (last-writer-wins semantics per §7 item 6).
    pub async fn write(&self, id: &str, doc: &serde_json::Value) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(doc).map_err(|_| StoreError::BadDocument)?;
        loop {
            let current = self.tree.get(id).map_err(|_| StoreError::DbIo)?;
            match self
                .tree
                .compare_and_swap(id, current, Some(bytes.clone()))
                .map_err(|_| StoreError::DbIo)?
            {
                Ok(()) => return Ok(()),
                Err(_conflict) => {
                    tokio::task::yield_now().await;
                    continue;
                }
            }
        }
    }

    /// All document ids currently present.
    pub fn document_list(&self) -> Result<Vec<String>, StoreError> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (key, _) = item.map_err(|_| StoreError::DbIo)?;
            if let Ok(id) = std::str::from_utf8(&key) {
                out.push(id.to_string());
            }
        }
        Ok(out)
    }

    /// Start a background worker that consumes the continuous change feed and
    /// invokes `handler` for each changed document id, filtered by `documents`
    /// (or "everything except `self`" when `None`). Returns a shutdown flag the
    /// caller can set to stop the worker.
    pub fn watch(
        &self,
        handler: Arc<dyn DocumentChangeHandler>,
        documents: Option<Vec<String>>,
    ) -> Arc<AtomicBool> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_for_task = shutdown.clone();
        let tree = self.tree.clone();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

        tokio::task::spawn_blocking(move || {
            let mut subscriber = tree.watch_prefix(vec![]);
            while !shutdown_for_task.load(Ordering::Relaxed) {
                match subscriber.next_timeout(Duration::from_secs(1)) {
                    Ok(event) => {
                        let key = match event {
                            sled::Event::Insert { key, .. } => key,
                            sled::Event::Remove { key } => key,
                        };
                        if let Ok(id) = std::str::from_utf8(&key) {
                            if tx.send(id.to_string()).is_err() {
                                break;
                            }
                        }
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("store watch worker stopped");
        });

        tokio::spawn(async move {
            while let Some(id) = rx.recv().await {
                let passes_filter = match &documents {
                    Some(allowed) => allowed.contains(&id),
                    None => id != "self",
                };
                if !passes_filter {
                    continue;
                }
                handler.on_change(&id).await;
            }
        });

        shutdown
    }
}

/// Invoked for each document id reported by the change feed.
#[async_trait]
pub trait DocumentChangeHandler: Send + Sync {
    /// Handle one changed document id.
    async fn on_change(&self, id: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_missing_document_is_empty_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().to_str().unwrap()).unwrap();
        let db = store.database(MEMBERSHIP_DB).unwrap();
        assert_eq!(db.read("nope").unwrap(), serde_json::json!({}));
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().to_str().unwrap()).unwrap();
        let db = store.database(WATCHLIST_DB).unwrap();
        let doc = serde_json::json!({"services": {}});
        db.write("self", &doc).await.unwrap();
        assert_eq!(db.read("self").unwrap(), doc);
    }

    #[tokio::test]
    async fn document_list_reflects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().to_str().unwrap()).unwrap();
        let db = store.database(MEMBERSHIP_DB).unwrap();
        db.write("peer-a", &serde_json::json!({})).await.unwrap();
        db.write("peer-b", &serde_json::json!({})).await.unwrap();
        let mut ids = db.document_list().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["peer-a".to_string(), "peer-b".to_string()]);
    }
}
