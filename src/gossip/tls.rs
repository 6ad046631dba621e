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

//! Mutual-TLS transport setup (§6.2): both sides present and verify a certificate.

use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// TLS setup errors.
#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("io")]
    Io,
    #[error("no certificate found in PEM file")]
    NoCertificate,
    #[error("no private key found in PEM file")]
    NoPrivateKey,
    #[error("rustls configuration")]
    Rustls,
}

/// Certificate + key material loaded from disk, used to build both the listener
/// and the dialer (the same identity is presented either way).
pub struct TlsMaterial {
    /// Full chain, leaf first.
    pub certs: Vec<CertificateDer<'static>>,
    /// Leaf private key.
    pub key: PrivateKeyDer<'static>,
    /// Trusted CA bundle, used to verify the peer's certificate on both ends.
    pub roots: RootCertStore,
}

impl TlsMaterial {
    /// Load certificate chain, private key, and CA bundle from PEM files.
    pub fn load(cert_path: &str, key_path: &str, ca_path: &str) -> Result<Self, TlsSetupError> {
        let cert_file = std::fs::read(cert_path).map_err(|_| TlsSetupError::Io)?;
        let key_file = std::fs::read(key_path).map_err(|_| TlsSetupError::Io)?;
        let ca_file = std::fs::read(ca_path).map_err(|_| TlsSetupError::Io)?;

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(cert_file.as_slice()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| TlsSetupError::NoCertificate)?;
        if certs.is_empty() {
            return Err(TlsSetupError::NoCertificate);
        }

        let key = rustls_pemfile::private_key(&mut BufReader::new(key_file.as_slice()))
            .map_err(|_| TlsSetupError::NoPrivateKey)?
            .ok_or(TlsSetupError::NoPrivateKey)?;

        let mut roots = RootCertStore::empty();
        let ca_certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(ca_file.as_slice()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| TlsSetupError::NoCertificate)?;
        for ca in ca_certs {
            roots.add(ca).map_err(|_| TlsSetupError::Rustls)?;
        }

        Ok(Self { certs, key, roots })
    }

    /// Build a server (listener) TLS acceptor that requires the client to
    /// present a certificate signed by our CA bundle.
    pub fn acceptor(&self) -> Result<TlsAcceptor, TlsSetupError> {
        let roots = Arc::new(self.roots.clone());
        let verifier = WebPkiClientVerifier::builder(roots)
            .build()
            .map_err(|_| TlsSetupError::Rustls)?;

        let config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.certs.clone(), self.key.clone_key())
            .map_err(|_| TlsSetupError::Rustls)?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// Build a client (dialer) TLS connector that presents our certificate and
    /// verifies the server's certificate against our CA bundle.
    pub fn connector(&self) -> Result<TlsConnector, TlsSetupError> {
        let config = ClientConfig::builder()
            .with_root_certificates(self.roots.clone())
            .with_client_auth_cert(self.certs.clone(), self.key.clone_key())
            .map_err(|_| TlsSetupError::Rustls)?;

        Ok(TlsConnector::from(Arc::new(config)))
    }
}
