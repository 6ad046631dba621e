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

//! Conversation (§4.C): one long-lived mutually-authenticated TLS session.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::gossip::codec::{self, CodecError, Frame};
use crate::gossip::contact::Contact;

/// Idle timeout: a conversation with no successful read in this long tears down.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Per-read timeout; a timeout alone is not fatal, it just triggers a heartbeat check.
const READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Sleep between heartbeats once a read times out with nothing else to send.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Conversation errors.
#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("conversation is not ENDED")]
    NotEnded,
    #[error("no socket available to start")]
    NoSocket,
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
}

/// Errors a frame handler may report; any `Err` tears the conversation down but
/// never panics the task (§5 failure isolation).
#[derive(Debug, Error)]
#[error("handler failed: {0}")]
pub struct HandlerError(pub String);

/// State machine per §4.C.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversationState {
    /// Not running; may be (re)started.
    Ended,
    /// Actively reading/writing frames.
    GoingOn,
    /// Tearing down; queue cleared, socket about to close.
    Dismissing,
}

/// Either half of a mutually-authenticated TLS connection, so a Conversation
/// can be driven identically whether it dialed out or was accepted.
pub enum TlsSocket {
    /// We dialed the peer.
    Client(tokio_rustls::client::TlsStream<TcpStream>),
    /// The peer dialed us.
    Server(tokio_rustls::server::TlsStream<TcpStream>),
}

impl AsyncRead for TlsSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TlsSocket::Client(s) => Pin::new(s).poll_read(cx, buf),
            TlsSocket::Server(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TlsSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            TlsSocket::Client(s) => Pin::new(s).poll_write(cx, buf),
            TlsSocket::Server(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TlsSocket::Client(s) => Pin::new(s).poll_flush(cx),
            TlsSocket::Server(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TlsSocket::Client(s) => Pin::new(s).poll_shutdown(cx),
            TlsSocket::Server(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A handle passed to frame handlers: enough to reply and to identify the
/// sender, without granting ownership of the Conversation itself.
#[derive(Clone)]
pub struct ConversationHandle {
    peer_id: Option<String>,
    peer_cert: Option<Vec<u8>>,
    conv: Arc<Conversation>,
}

impl ConversationHandle {
    /// The peer's identifier, if the handshake has completed.
    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    /// The peer's DER-encoded certificate, if the handshake has completed.
    pub fn peer_cert(&self) -> Option<&[u8]> {
        self.peer_cert.as_deref()
    }

    /// Enqueue a frame to be sent back to the peer on this conversation.
    pub async fn send(&self, frame_type: &[u8; 4], payload: Vec<u8>) {
        self.conv.senddata(frame_type, payload).await;
    }
}

/// Dispatches a named frame type to application logic (`META`/`SREQ`/`SUPD`, or
/// any embedder-registered extension).
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// Handle one decoded frame payload.
    async fn handle(&self, payload: &[u8], ctx: &ConversationHandle) -> Result<(), HandlerError>;
}

struct Inner {
    state: ConversationState,
    outbox: VecDeque<Frame>,
    last_message_at: Instant,
}

/// One peer session: transport, send queue, and lifecycle state.
pub struct Conversation {
    contact: Mutex<Contact>,
    inner: Mutex<Inner>,
    socket: Mutex<Option<TlsSocket>>,
    peer_id: Mutex<Option<String>>,
    peer_cert: Mutex<Option<Vec<u8>>>,
    dial_attempts: AtomicUsize,
    msgseq: AtomicI32,
    handlers: Weak<dyn HandlerLookup>,
    self_weak: Weak<Conversation>,
}

/// Supplies the frame-type -> handler mapping and outbound membership/service
/// data; implemented by Babblemouth. Kept as a narrow trait so Conversation
/// doesn't need to know Babblemouth's full shape (the non-owning back-reference
/// design note of §9).
#[async_trait]
pub trait HandlerLookup: Send + Sync {
    /// Look up the handler registered for an uppercase frame type.
    fn handler_for(&self, frame_type: &str) -> Option<Arc<dyn FrameHandler>>;
    /// This babbler's current membership announcement, sent as the first `META`.
    async fn membership_snapshot(&self) -> Vec<u8>;
}

impl Conversation {
    /// Construct a not-yet-started conversation for `contact`, wired to the
    /// owning Babblemouth's handler registry via a non-owning reference.
    pub fn new(contact: Contact, handlers: Weak<dyn HandlerLookup>) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            contact: Mutex::new(contact),
            inner: Mutex::new(Inner {
                state: ConversationState::Ended,
                outbox: VecDeque::new(),
                last_message_at: Instant::now(),
            }),
            socket: Mutex::new(None),
            peer_id: Mutex::new(None),
            peer_cert: Mutex::new(None),
            dial_attempts: AtomicUsize::new(0),
            msgseq: AtomicI32::new(0),
            handlers,
            self_weak: self_weak.clone(),
        })
    }

    /// Current state.
    pub async fn state(&self) -> ConversationState {
        self.inner.lock().await.state
    }

    /// Peer identifier, if known.
    pub async fn peer_id(&self) -> Option<String> {
        self.peer_id.lock().await.clone()
    }

    /// Peer's DER-encoded certificate, if the handshake has completed.
    pub async fn peer_cert(&self) -> Option<Vec<u8>> {
        self.peer_cert.lock().await.clone()
    }

    /// A snapshot of this conversation's Contact record.
    pub async fn contact_snapshot(&self) -> Contact {
        self.contact.lock().await.clone()
    }

    /// Replace this conversation's Contact record (used by `addbabbler` once an
    /// update has been accepted).
    pub async fn set_contact(&self, contact: Contact) {
        *self.contact.lock().await = contact;
    }

    /// Splice an already-handshaken inbound socket into this (ENDED) conversation.
    pub async fn set_inbound_socket(
        &self,
        socket: tokio_rustls::server::TlsStream<TcpStream>,
        peer_id: String,
        peer_cert: Vec<u8>,
    ) -> Result<(), ConversationError> {
        if self.inner.lock().await.state != ConversationState::Ended {
            return Err(ConversationError::NotEnded);
        }
        *self.socket.lock().await = Some(TlsSocket::Server(socket));
        *self.peer_id.lock().await = Some(peer_id);
        *self.peer_cert.lock().await = Some(peer_cert);
        Ok(())
    }

    /// Dial the peer's current endpoint over TLS (§4.C `build_tls`). Rotates the
    /// endpoint index on failure, generalized to any transport failure (§9 open
    /// question 3).
    pub async fn build_tls(
        self: &Arc<Self>,
        connector: &tokio_rustls::TlsConnector,
    ) -> Result<(), ConversationError> {
        if self.inner.lock().await.state != ConversationState::Ended {
            return Err(ConversationError::NotEnded);
        }

        let attempt = self.dial_attempts.load(Ordering::SeqCst);
        let (host, port) = {
            let contact = self.contact.lock().await;
            let (h, p) = contact.endpoint(attempt);
            (h.to_string(), p)
        };

        let dial_result: Result<(), ConversationError> = async {
            let tcp = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(|e| ConversationError::Dial(e.to_string()))?;
            let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|e| ConversationError::Dial(e.to_string()))?
                .to_owned();
            let tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| ConversationError::Dial(e.to_string()))?;

            let peer_cert = {
                let (_, conn) = tls.get_ref();
                conn.peer_certificates()
                    .and_then(|c| c.first())
                    .map(|c| c.as_ref().to_vec())
                    .ok_or_else(|| ConversationError::Dial("peer presented no certificate".into()))?
            };
            let peer_id = crate::gossip::contact::common_name_from_cert(&peer_cert)
                .map_err(|e| ConversationError::Dial(e.to_string()))?;

            *self.socket.lock().await = Some(TlsSocket::Client(tls));
            *self.peer_id.lock().await = Some(peer_id);
            *self.peer_cert.lock().await = Some(peer_cert);
            Ok(())
        }
        .await;

        if dial_result.is_err() {
            self.dial_attempts.store(attempt + 1, Ordering::SeqCst);
        }
        dial_result
    }

    /// Enqueue a frame; a no-op unless the conversation is GOING_ON.
    pub async fn senddata(&self, frame_type: &[u8; 4], payload: Vec<u8>) {
        let mut inner = self.inner.lock().await;
        if inner.state != ConversationState::GoingOn {
            return;
        }
        let seq = self.msgseq.fetch_add(1, Ordering::SeqCst);
        inner.outbox.push_back(Frame::new(frame_type, seq, payload));
    }

    /// Transition GOING_ON -> DISMISSING, discarding any queued-but-unsent frames.
    pub async fn end(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == ConversationState::GoingOn {
            inner.state = ConversationState::Dismissing;
            inner.outbox.clear();
        }
    }

    /// Start the conversation: requires ENDED and a socket already set via
    /// [`build_tls`] or [`set_inbound_socket`]. Spawns the run loop task.
    pub fn start(self: &Arc<Self>) -> Result<(), ConversationError> {
        let this = self.clone();
        tokio::spawn(async move {
            {
                let mut inner = this.inner.lock().await;
                if inner.state != ConversationState::Ended {
                    return;
                }
                if this.socket.lock().await.is_none() {
                    warn!("conversation start() with no socket set");
                    return;
                }
                inner.state = ConversationState::GoingOn;
                inner.last_message_at = Instant::now();
            }
            this.run().await;
        });
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        if let Some(handlers) = self.handlers.upgrade() {
            let membership = handlers.membership_snapshot().await;
            self.senddata(b"META", membership).await;
            self.flush_outbox().await;
        }

        loop {
            if self.state().await != ConversationState::GoingOn {
                break;
            }

            let read = {
                let mut socket_guard = self.socket.lock().await;
                let Some(socket) = socket_guard.as_mut() else { break };
                tokio::time::timeout(READ_TIMEOUT, codec::read_frame(socket)).await
            };

            match read {
                Ok(Ok(frame)) => {
                    self.inner.lock().await.last_message_at = Instant::now();
                    self.dispatch(frame).await;
                    self.flush_outbox().await;
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "conversation read error, tearing down");
                    break;
                }
                Err(_timeout) => {
                    let idle = self.inner.lock().await.last_message_at.elapsed();
                    if idle >= IDLE_TIMEOUT || self.state().await != ConversationState::GoingOn {
                        break;
                    }
                    let queue_empty = self.inner.lock().await.outbox.is_empty();
                    if queue_empty {
                        self.senddata(b"HRTB", Vec::new()).await;
                    }
                    self.flush_outbox().await;
                    tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                }
            }
        }

        self.teardown().await;
    }

    async fn dispatch(&self, frame: Frame) {
        let Some(handlers) = self.handlers.upgrade() else { return };
        let Some(handler) = handlers.handler_for(frame.type_str()) else {
            debug!(frame_type = frame.type_str(), "no handler registered, dropping frame");
            return;
        };
        drop(handlers);

        let Some(conv) = self.self_weak.upgrade() else { return };
        let handle = ConversationHandle {
            peer_id: self.peer_id.lock().await.clone(),
            peer_cert: self.peer_cert.lock().await.clone(),
            conv,
        };
        if let Err(e) = handler.handle(&frame.payload, &handle).await {
            warn!(error = %e.0, "frame handler failed, tearing down conversation");
            self.end().await;
        }
    }

    async fn flush_outbox(&self) {
        let frames: Vec<Frame> = {
            let mut inner = self.inner.lock().await;
            inner.outbox.drain(..).collect()
        };
        if frames.is_empty() {
            return;
        }
        let mut socket_guard = self.socket.lock().await;
        let Some(socket) = socket_guard.as_mut() else { return };
        for frame in frames {
            if let Err(e) = codec::write_frame(socket, &frame).await {
                debug!(error = %e, "write failed during flush");
                break;
            }
        }
    }

    async fn teardown(&self) {
        let mut socket = self.socket.lock().await.take();
        if let Some(s) = socket.as_mut() {
            // §4.C step 4: if closing throws, advance the endpoint index so the
            // next dial attempt rotates away from a possibly-bad address.
            if let Err(e) = s.shutdown().await {
                debug!(error = %e, "socket shutdown failed, rotating endpoint");
                self.dial_attempts.fetch_add(1, Ordering::SeqCst);
            }
        }
        let mut inner = self.inner.lock().await;
        inner.state = ConversationState::Ended;
        inner.outbox.clear();
    }
}
