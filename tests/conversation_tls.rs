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

//! End-to-end Conversation test over a real mutually-authenticated TLS socket
//! pair (§8, scenarios S1/S4). Certificates are ephemeral self-signed ECDSA
//! leaves pinned directly as each side's CA bundle, generated with `rcgen`
//! rather than a real CA hierarchy.
//!
//! This deliberately stays below the `Babblemouth` layer: wiring two full
//! babblers together would require a valid RSA `ContactSigner`, and this
//! environment has no way to mint one by hand.

use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use tokio::net::TcpListener;

use gossip_babbler::gossip::contact::{common_name_from_cert, Contact};
use gossip_babbler::gossip::conversation::{
    Conversation, ConversationHandle, ConversationState, FrameHandler, HandlerError, HandlerLookup,
};
use gossip_babbler::gossip::tls::TlsMaterial;

fn write_identity(dir: &Path, name: &str) -> (String, String) {
    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, name);
    params.distinguished_name = dn;
    params.subject_alt_names = vec![SanType::IpAddress(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST))];
    let cert = params.self_signed(&key_pair).unwrap();

    let cert_path = dir.join(format!("{name}-cert.pem"));
    let key_path = dir.join(format!("{name}-key.pem"));
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();
    (cert_path.to_string_lossy().into_owned(), key_path.to_string_lossy().into_owned())
}

/// Records every payload handed to it, keyed by no particular frame type (the
/// test registers one instance per frame type it cares about).
struct RecordingHandler {
    received: Arc<StdMutex<Vec<Vec<u8>>>>,
}

#[async_trait]
impl FrameHandler for RecordingHandler {
    async fn handle(&self, payload: &[u8], _ctx: &ConversationHandle) -> Result<(), HandlerError> {
        self.received.lock().unwrap().push(payload.to_vec());
        Ok(())
    }
}

struct TestLookup {
    meta_handler: Arc<dyn FrameHandler>,
    snapshot: Vec<u8>,
}

#[async_trait]
impl HandlerLookup for TestLookup {
    fn handler_for(&self, frame_type: &str) -> Option<Arc<dyn FrameHandler>> {
        (frame_type == "META").then(|| self.meta_handler.clone())
    }

    async fn membership_snapshot(&self) -> Vec<u8> {
        self.snapshot.clone()
    }
}

async fn wait_for<F: Fn() -> bool>(check: F, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn handshake_dispatches_initial_meta_both_ways() {
    let dir = tempfile::tempdir().unwrap();
    let (alice_cert, alice_key) = write_identity(dir.path(), "alice");
    let (bob_cert, bob_key) = write_identity(dir.path(), "bob");

    // Each side trusts only the other's leaf certificate directly.
    let alice_tls = TlsMaterial::load(&alice_cert, &alice_key, &bob_cert).unwrap();
    let bob_tls = TlsMaterial::load(&bob_cert, &bob_key, &alice_cert).unwrap();

    let alice_received = Arc::new(StdMutex::new(Vec::new()));
    let bob_received = Arc::new(StdMutex::new(Vec::new()));

    let alice_lookup = Arc::new(TestLookup {
        meta_handler: Arc::new(RecordingHandler { received: alice_received.clone() }),
        snapshot: b"alice-membership".to_vec(),
    });
    let bob_lookup = Arc::new(TestLookup {
        meta_handler: Arc::new(RecordingHandler { received: bob_received.clone() }),
        snapshot: b"bob-membership".to_vec(),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = alice_tls.acceptor().unwrap();
    let alice_lookup_weak: std::sync::Weak<dyn HandlerLookup> = Arc::downgrade(&alice_lookup);

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let tls = acceptor.accept(tcp).await.unwrap();
        let peer_cert = {
            let (_, conn) = tls.get_ref();
            conn.peer_certificates().unwrap().first().unwrap().as_ref().to_vec()
        };
        let peer_id = common_name_from_cert(&peer_cert).unwrap();
        let contact = Contact::new(vec!["127.0.0.1".into()], vec![0]).unwrap();
        let conv = Conversation::new(contact, alice_lookup_weak);
        conv.set_inbound_socket(tls, peer_id, peer_cert).await.unwrap();
        conv.start().unwrap();
        // Keep this task (and so the accepted socket) alive for the duration
        // of the test; the run loop itself is driven by the inner spawn in
        // Conversation::start.
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let connector = bob_tls.connector().unwrap();
    let contact = Contact::new(vec!["127.0.0.1".into()], vec![addr.port()]).unwrap();
    let bob_lookup_weak: std::sync::Weak<dyn HandlerLookup> = Arc::downgrade(&bob_lookup);
    let conv_bob = Conversation::new(contact, bob_lookup_weak);
    conv_bob.build_tls(&connector).await.unwrap();
    conv_bob.start().unwrap();

    wait_for(|| !alice_received.lock().unwrap().is_empty(), Duration::from_secs(3)).await;
    wait_for(|| !bob_received.lock().unwrap().is_empty(), Duration::from_secs(3)).await;

    assert_eq!(alice_received.lock().unwrap()[0], b"bob-membership".to_vec());
    assert_eq!(bob_received.lock().unwrap()[0], b"alice-membership".to_vec());

    assert_eq!(conv_bob.peer_id().await.as_deref(), Some("alice"));
    assert_eq!(conv_bob.state().await, ConversationState::GoingOn);
}

#[tokio::test]
async fn conversation_stays_going_on_while_idle_below_read_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let (alice_cert, alice_key) = write_identity(dir.path(), "alice2");
    let (bob_cert, bob_key) = write_identity(dir.path(), "bob2");

    let alice_tls = TlsMaterial::load(&alice_cert, &alice_key, &bob_cert).unwrap();
    let bob_tls = TlsMaterial::load(&bob_cert, &bob_key, &alice_cert).unwrap();

    let alice_lookup = Arc::new(TestLookup {
        meta_handler: Arc::new(RecordingHandler { received: Arc::new(StdMutex::new(Vec::new())) }),
        snapshot: Vec::new(),
    });
    let bob_lookup = Arc::new(TestLookup {
        meta_handler: Arc::new(RecordingHandler { received: Arc::new(StdMutex::new(Vec::new())) }),
        snapshot: Vec::new(),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = alice_tls.acceptor().unwrap();
    let alice_lookup_weak: std::sync::Weak<dyn HandlerLookup> = Arc::downgrade(&alice_lookup);

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let tls = acceptor.accept(tcp).await.unwrap();
        let peer_cert = {
            let (_, conn) = tls.get_ref();
            conn.peer_certificates().unwrap().first().unwrap().as_ref().to_vec()
        };
        let peer_id = common_name_from_cert(&peer_cert).unwrap();
        let contact = Contact::new(vec!["127.0.0.1".into()], vec![0]).unwrap();
        let conv = Conversation::new(contact, alice_lookup_weak);
        conv.set_inbound_socket(tls, peer_id, peer_cert).await.unwrap();
        conv.start().unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let connector = bob_tls.connector().unwrap();
    let contact = Contact::new(vec!["127.0.0.1".into()], vec![addr.port()]).unwrap();
    let bob_lookup_weak: std::sync::Weak<dyn HandlerLookup> = Arc::downgrade(&bob_lookup);
    let conv_bob = Conversation::new(contact, bob_lookup_weak);
    conv_bob.build_tls(&connector).await.unwrap();
    conv_bob.start().unwrap();

    // No traffic is sent by either side beyond the initial (empty) META; the
    // conversation must still be GOING_ON well short of the idle timeout.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(conv_bob.state().await, ConversationState::GoingOn);
}
