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

//! Babblemouth (§4.D): peer table, transport, and membership propagation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::GossipConfig;
use crate::gossip::contact::{Contact, ContactSigner};
use crate::gossip::conversation::{
    Conversation, ConversationHandle, ConversationState, FrameHandler, HandlerError, HandlerLookup,
};
use crate::gossip::tls::TlsMaterial;
use crate::monitoring::metrics::Metrics;
use crate::store::{DocumentChangeHandler, Store, MEMBERSHIP_DB, WATCHLIST_DB};

/// Babblemouth errors.
#[derive(Debug, Error)]
pub enum BabblemouthError {
    #[error("store: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("tls: {0}")]
    Tls(#[from] crate::gossip::tls::TlsSetupError),
    #[error("contact: {0}")]
    Contact(#[from] crate::gossip::contact::ContactError),
    #[error("io")]
    Io,
}

/// Interval between supervision-loop scans of ENDED peer-table entries.
const REDIAL_INTERVAL: Duration = Duration::from_secs(60);
/// How long the listener's accept call waits before re-checking shutdown.
const ACCEPT_POLL: Duration = Duration::from_secs(60);

struct PeerTable {
    conversations: HashMap<String, Arc<Conversation>>,
}

/// A gossip peer: owns the TLS transport, the peer table, and the per-type
/// frame-handler registry.
pub struct Babblemouth {
    id: String,
    config: GossipConfig,
    store: Arc<Store>,
    tls: Arc<TlsMaterial>,
    signer: Arc<ContactSigner>,
    my_cert_der: Vec<u8>,
    cert_dir: PathBuf,
    table: Mutex<PeerTable>,
    handlers: RwLock<HashMap<String, Arc<dyn FrameHandler>>>,
    my_version: AtomicU64,
    metrics: Arc<Metrics>,
    shutdown: Arc<AtomicBool>,
    self_weak: Weak<Babblemouth>,
}

impl Babblemouth {
    /// Construct a Babblemouth. `id` is this babbler's Common Name, derived
    /// from its own certificate by the caller (see `tls::TlsMaterial`/
    /// `contact::common_name_from_cert`).
    pub fn new(
        id: String,
        config: GossipConfig,
        store: Arc<Store>,
        tls: Arc<TlsMaterial>,
        signer: Arc<ContactSigner>,
        my_cert_der: Vec<u8>,
        cert_dir: PathBuf,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let version = config.version;
        Arc::new_cyclic(|self_weak| Self {
            id,
            config,
            store,
            tls,
            signer,
            my_cert_der,
            cert_dir,
            table: Mutex::new(PeerTable { conversations: HashMap::new() }),
            handlers: RwLock::new(HashMap::new()),
            my_version: AtomicU64::new(version),
            metrics,
            shutdown: Arc::new(AtomicBool::new(false)),
            self_weak: self_weak.clone(),
        })
    }

    /// This babbler's own identifier (its certificate's Common Name).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Signal all background loops to stop at their next poll.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Register a handler for an uppercase frame type (`META`/`SREQ`/`SUPD`, or
    /// an embedder-defined extension).
    pub fn addhandler(&self, frame_type: &str, handler: Arc<dyn FrameHandler>) {
        self.handlers.write().expect("handlers lock poisoned").insert(frame_type.to_uppercase(), handler);
    }

    /// Register the built-in META/SREQ/SUPD handlers.
    pub fn register_default_handlers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.addhandler("META", Arc::new(MetaHandler(weak.clone())));
        self.addhandler("SREQ", Arc::new(SreqHandler(weak.clone())));
        self.addhandler("SUPD", Arc::new(SupdHandler(weak)));
    }

    /// Load membership from the store at startup, then start a supervision loop
    /// that re-dials any ENDED entry every 60 seconds, and a TLS listener per
    /// configured `(host, port)`.
    pub async fn start_gossip(self: &Arc<Self>) -> Result<(), BabblemouthError> {
        self.load_babblers_from_store().await?;

        for (host, port) in self.config.host.iter().zip(self.config.port.iter()) {
            self.spawn_listener(host.clone(), *port);
        }

        self.spawn_supervision_loop();
        self.spawn_service_broadcast_watch()?;
        Ok(())
    }

    /// Watch the watch-list store's own `self` document: whenever the local
    /// service list is altered, push a `SUPD` to every live conversation (§2,
    /// original `application.py`'s `startgossip`/`processserviceupdate`).
    fn spawn_service_broadcast_watch(self: &Arc<Self>) -> Result<(), BabblemouthError> {
        let watchlist = self.store.database(WATCHLIST_DB)?;
        let handler: Arc<dyn DocumentChangeHandler> = Arc::new(SelfServiceChangeHandler(Arc::downgrade(self)));
        watchlist.watch(handler, Some(vec!["self".to_string()]));
        Ok(())
    }

    /// Read the local service list and push it as `SUPD` to every GOING_ON
    /// conversation.
    async fn broadcast_own_services(&self) {
        let db = match self.store.database(WATCHLIST_DB) {
            Ok(db) => db,
            Err(e) => {
                warn!(error = ?e, "failed to open watch-list database for broadcast");
                return;
            }
        };
        let doc = match db.read("self") {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = ?e, "failed to read own service list");
                return;
            }
        };
        let Ok(bytes) = serde_json::to_vec(&doc) else { return };

        let table = self.table.lock().await;
        for conv in table.conversations.values() {
            if conv.state().await == ConversationState::GoingOn {
                conv.senddata(b"SUPD", bytes.clone()).await;
            }
        }
    }

    fn spawn_supervision_loop(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            while !this.shutdown.load(Ordering::Relaxed) {
                tokio::time::sleep(REDIAL_INTERVAL).await;
                let ended: Vec<String> = {
                    let table = this.table.lock().await;
                    let mut ids = Vec::new();
                    for (id, conv) in table.conversations.iter() {
                        if conv.state().await == ConversationState::Ended {
                            ids.push(id.clone());
                        }
                    }
                    ids
                };
                for id in ended {
                    this.talktobabbler(&id).await;
                }
            }
        });
    }

    fn spawn_listener(self: &Arc<Self>, host: String, port: u16) {
        let this = self.clone();
        tokio::spawn(async move {
            let addr = format!("{host}:{port}");
            let listener = match TcpListener::bind(&addr).await {
                Ok(l) => l,
                Err(e) => {
                    warn!(%addr, error = %e, "failed to bind gossip listener");
                    return;
                }
            };
            info!(%addr, "gossip listener bound");

            while !this.shutdown.load(Ordering::Relaxed) {
                let accepted = tokio::time::timeout(ACCEPT_POLL, listener.accept()).await;
                let (tcp, peer_addr) = match accepted {
                    Ok(Ok(pair)) => pair,
                    Ok(Err(e)) => {
                        debug!(error = %e, "accept failed");
                        continue;
                    }
                    Err(_timeout) => continue,
                };

                let this = this.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.handle_inbound(tcp, peer_addr).await {
                        debug!(error = %e, %peer_addr, "inbound handshake failed");
                    }
                });
            }
        });
    }

    async fn handle_inbound(
        self: &Arc<Self>,
        tcp: tokio::net::TcpStream,
        peer_addr: std::net::SocketAddr,
    ) -> Result<(), BabblemouthError> {
        let acceptor = self.tls.acceptor()?;
        let tls_stream = acceptor.accept(tcp).await.map_err(|_| BabblemouthError::Io)?;

        let peer_cert = {
            let (_, conn) = tls_stream.get_ref();
            conn.peer_certificates()
                .and_then(|c| c.first())
                .map(|c| c.as_ref().to_vec())
                .ok_or(BabblemouthError::Io)?
        };
        let peer_id = crate::gossip::contact::common_name_from_cert(&peer_cert)?;

        let mut table = self.table.lock().await;
        if let Some(existing) = table.conversations.get(&peer_id) {
            if existing.state().await != ConversationState::Ended {
                debug!(%peer_id, "duplicate inbound connection, dropping");
                return Ok(());
            }
            existing.set_inbound_socket(tls_stream, peer_id.clone(), peer_cert).await.map_err(|_| BabblemouthError::Io)?;
            existing.start().map_err(|_| BabblemouthError::Io)?;
        } else {
            let contact = Contact::new(vec![peer_addr.ip().to_string()], vec![peer_addr.port()])?;
            let conv: Arc<Conversation> = Conversation::new(contact, self.self_weak.clone());
            conv.set_inbound_socket(tls_stream, peer_id.clone(), peer_cert).await.map_err(|_| BabblemouthError::Io)?;
            conv.start().map_err(|_| BabblemouthError::Io)?;
            table.conversations.insert(peer_id.clone(), conv);
        }
        self.metrics.gossip_peers.set(table.conversations.len() as i64);
        Ok(())
    }

    /// Dial `id`'s current endpoint if its conversation is ENDED.
    pub async fn talktobabbler(self: &Arc<Self>, id: &str) {
        let conv = {
            let table = self.table.lock().await;
            table.conversations.get(id).cloned()
        };
        let Some(conv) = conv else { return };
        if conv.state().await != ConversationState::Ended {
            return;
        }
        let Ok(connector) = self.tls.connector() else { return };
        if let Err(e) = conv.build_tls(&connector).await {
            debug!(%id, error = %e, "dial failed");
            return;
        }
        let _ = conv.start();
    }

    /// Five-case update per §4.D: decides how a gossiped/loaded Contact update
    /// for `id` is applied to the peer table.
    pub async fn addbabbler(
        self: &Arc<Self>,
        id: &str,
        props: Contact,
        cert: Option<Vec<u8>>,
    ) -> Result<(), BabblemouthError> {
        if id == self.id {
            // Case 1/2: a description of myself arrived from elsewhere.
            if props.c_version.is_none() {
                return Ok(()); // case 1: unsigned, ignore
            }
            // case 2: signed self-description -> self-defence rule
            let next = crate::gossip::contact::self_defence_next_version(
                self.my_version.load(Ordering::SeqCst),
                &props,
                &self.my_cert_der,
            );
            self.my_version.store(next, Ordering::SeqCst);
            return Ok(());
        }

        let mut table = self.table.lock().await;
        match table.conversations.get(id).cloned() {
            None => {
                // Case 3: unknown third-party identifier.
                if self.config.maxconv != 0 && table.conversations.len() as u32 >= self.config.maxconv {
                    debug!(%id, "maxconv reached, dropping unknown peer");
                    return Ok(());
                }
                let conv: Arc<Conversation> = Conversation::new(props.clone(), self.self_weak.clone());
                table.conversations.insert(id.to_string(), conv);
                drop(table);
                self.persist_contact(id, &props).await?;
                if let Some(cert) = cert {
                    self.persist_cert(id, &cert)?;
                }
            }
            Some(conv) => {
                drop(table);
                let prior = conv.contact_snapshot().await;
                // A certificate may not have been presented on this particular
                // update (e.g. third-party gossip about `id` relayed by some
                // other peer), but if one is already known on disk from a
                // previous direct contact, it must still gate this update —
                // otherwise an unverified relay can clobber a verified entry.
                let resolved_cert = cert.or_else(|| self.load_known_cert(id));
                match resolved_cert {
                    Some(peer_cert) => {
                        // Case 5: a certificate is known (presented directly, or
                        // already on disk); verify before accepting.
                        let pubkey = crate::gossip::contact::public_key_der_from_cert(&peer_cert)?;
                        if Contact::accepts_update(Some(&prior), &props, Some(&pubkey)) {
                            conv.set_contact(props.clone()).await;
                            self.persist_contact(id, &props).await?;
                            self.persist_cert(id, &peer_cert)?;
                        }
                    }
                    None => {
                        // Case 4: known id, genuinely no certificate known yet;
                        // overwrite unconditionally.
                        conv.set_contact(props.clone()).await;
                        self.persist_contact(id, &props).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// §4.D `loadbabbler`: selects which certificate to pass to [`addbabbler`]
    /// based on provenance, then applies the update.
    pub async fn loadbabbler(
        self: &Arc<Self>,
        id: &str,
        props: Contact,
        from_conv: Option<&ConversationHandle>,
    ) -> Result<(), BabblemouthError> {
        let cert = match from_conv {
            None => self.load_known_cert(id),
            Some(handle) if handle.peer_id() == Some(id) => handle.peer_cert().map(|c| c.to_vec()),
            Some(_) if id == self.id => Some(self.my_cert_der.clone()),
            Some(_) => None,
        };
        self.addbabbler(id, props, cert).await
    }

    async fn load_babblers_from_store(self: &Arc<Self>) -> Result<(), BabblemouthError> {
        let db = self.store.database(MEMBERSHIP_DB)?;
        for doc_id in db.document_list()? {
            if doc_id == "self" {
                continue;
            }
            let doc = db.read(&doc_id)?;
            let Ok(contact) = serde_json::from_value::<Contact>(doc) else {
                warn!(id = %doc_id, "skipping malformed Contact document on disk");
                continue;
            };
            self.loadbabbler(&doc_id, contact, None).await?;
        }
        Ok(())
    }

    async fn persist_contact(&self, id: &str, contact: &Contact) -> Result<(), BabblemouthError> {
        let db = self.store.database(MEMBERSHIP_DB)?;
        let doc = serde_json::to_value(contact).map_err(|_| BabblemouthError::Io)?;
        db.write(id, &doc).await?;
        Ok(())
    }

    fn persist_cert(&self, id: &str, cert_der: &[u8]) -> Result<(), BabblemouthError> {
        std::fs::create_dir_all(&self.cert_dir).map_err(|_| BabblemouthError::Io)?;
        let path = self.cert_dir.join(format!("{id}.pem"));
        let b64 = base64::engine::general_purpose::STANDARD.encode(cert_der);
        let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
        for chunk in b64.as_bytes().chunks(64) {
            pem.push_str(std::str::from_utf8(chunk).expect("base64 is ASCII"));
            pem.push('\n');
        }
        pem.push_str("-----END CERTIFICATE-----\n");
        std::fs::write(path, pem).map_err(|_| BabblemouthError::Io)
    }

    fn load_known_cert(&self, id: &str) -> Option<Vec<u8>> {
        let path = self.cert_dir.join(format!("{id}.pem"));
        let pem = std::fs::read(path).ok()?;
        let mut reader = std::io::BufReader::new(pem.as_slice());
        rustls_pemfile::certs(&mut reader).next()?.ok().map(|c| c.as_ref().to_vec())
    }

    /// My own Contact, freshly signed, for inclusion in `babblerstojson`.
    async fn own_contact(&self) -> Contact {
        let version = self.my_version.load(Ordering::SeqCst);
        let c_version = self.signer.sign_version(version).ok();
        Contact {
            hosts: self.config.host.clone(),
            ports: self.config.port.clone(),
            version: Some(version),
            c_version,
        }
    }

    /// The full membership table as JSON: my own entry first, then every known
    /// peer's Contact, verified or not (§9 open question 1).
    pub async fn babblerstojson(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        let own = self.own_contact().await;
        map.insert(self.id.clone(), serde_json::to_value(&own).unwrap_or(serde_json::Value::Null));

        let table = self.table.lock().await;
        for (id, conv) in table.conversations.iter() {
            let contact = conv.contact_snapshot().await;
            map.insert(id.clone(), serde_json::to_value(&contact).unwrap_or(serde_json::Value::Null));
        }
        serde_json::Value::Object(map)
    }
}

#[async_trait]
impl HandlerLookup for Babblemouth {
    fn handler_for(&self, frame_type: &str) -> Option<Arc<dyn FrameHandler>> {
        self.handlers.read().expect("handlers lock poisoned").get(frame_type).cloned()
    }

    async fn membership_snapshot(&self) -> Vec<u8> {
        serde_json::to_vec(&self.babblerstojson().await).unwrap_or_default()
    }
}

struct SelfServiceChangeHandler(Weak<Babblemouth>);

#[async_trait]
impl DocumentChangeHandler for SelfServiceChangeHandler {
    async fn on_change(&self, _id: &str) {
        if let Some(babblemouth) = self.0.upgrade() {
            babblemouth.broadcast_own_services().await;
        }
    }
}

struct MetaHandler(Weak<Babblemouth>);

#[async_trait]
impl FrameHandler for MetaHandler {
    async fn handle(&self, payload: &[u8], ctx: &ConversationHandle) -> Result<(), HandlerError> {
        let Some(babblemouth) = self.0.upgrade() else { return Ok(()) };
        let table: serde_json::Map<String, serde_json::Value> =
            serde_json::from_slice(payload).map_err(|e| HandlerError(e.to_string()))?;

        for (id, value) in table {
            let Ok(contact) = serde_json::from_value::<Contact>(value) else {
                continue; // malformed entry: ignore, don't tear down the conversation
            };
            if !contact.is_well_formed() {
                continue;
            }
            babblemouth
                .loadbabbler(&id, contact, Some(ctx))
                .await
                .map_err(|e| HandlerError(e.to_string()))?;
        }

        ctx.send(b"SREQ", Vec::new()).await;
        Ok(())
    }
}

struct SreqHandler(Weak<Babblemouth>);

#[async_trait]
impl FrameHandler for SreqHandler {
    async fn handle(&self, _payload: &[u8], ctx: &ConversationHandle) -> Result<(), HandlerError> {
        let Some(babblemouth) = self.0.upgrade() else { return Ok(()) };
        let db = babblemouth.store.database(WATCHLIST_DB).map_err(|e| HandlerError(e.to_string()))?;
        let doc = db.read("self").map_err(|e| HandlerError(e.to_string()))?;
        let bytes = serde_json::to_vec(&doc).map_err(|e| HandlerError(e.to_string()))?;
        ctx.send(b"SUPD", bytes).await;
        Ok(())
    }
}

struct SupdHandler(Weak<Babblemouth>);

#[async_trait]
impl FrameHandler for SupdHandler {
    async fn handle(&self, payload: &[u8], ctx: &ConversationHandle) -> Result<(), HandlerError> {
        let Some(babblemouth) = self.0.upgrade() else { return Ok(()) };
        let Some(peer_id) = ctx.peer_id() else { return Ok(()) };
        if peer_id == babblemouth.id {
            return Ok(());
        }
        let doc: serde_json::Value =
            serde_json::from_slice(payload).map_err(|e| HandlerError(e.to_string()))?;
        let db = babblemouth.store.database(WATCHLIST_DB).map_err(|e| HandlerError(e.to_string()))?;
        db.write(peer_id, &doc).await.map_err(|e| HandlerError(e.to_string()))?;
        Ok(())
    }
}
