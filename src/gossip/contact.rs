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

//! Contact & signed-version model (§4.B / §3).
//!
//! A Contact pairs an identifier's reachable endpoints with a monotonically
//! increasing `version`, authenticated by an RSA (PKCS#1 v1.5) signature over
//! its decimal representation.

use ring::rand::SystemRandom;
use ring::signature::{self, KeyPair, RsaKeyPair};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Contact errors.
#[derive(Debug, Error)]
pub enum ContactError {
    #[error("host and port lists must be non-empty and of equal length")]
    Malformed,
    #[error("signature does not verify")]
    BadSignature,
    #[error("io")]
    Io,
    #[error("invalid RSA PKCS#8 key material")]
    InvalidKey,
    #[error("signing failed")]
    SigningFailed,
    #[error("invalid certificate")]
    InvalidCertificate,
}

/// An endpoint + signed-version record for one identifier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Hosts, paired positionally with `ports`.
    pub hosts: Vec<String>,
    /// Ports, paired positionally with `hosts`.
    pub ports: Vec<u16>,
    /// Monotonic version, signed by the owning identifier's private key.
    #[serde(default)]
    pub version: Option<u64>,
    /// Hex-encoded RSA PKCS#1v1.5 signature over `version`'s decimal string.
    #[serde(default)]
    pub c_version: Option<String>,
}

impl Contact {
    /// Build an unsigned Contact (used for freshly-accepted inbound peers whose
    /// certificate isn't known yet).
    pub fn new(hosts: Vec<String>, ports: Vec<u16>) -> Result<Self, ContactError> {
        if hosts.is_empty() || hosts.len() != ports.len() {
            return Err(ContactError::Malformed);
        }
        Ok(Self { hosts, ports, version: None, c_version: None })
    }

    /// Check the basic well-formedness invariant (§8, invariant 1).
    pub fn is_well_formed(&self) -> bool {
        !self.hosts.is_empty() && self.hosts.len() == self.ports.len()
    }

    /// Current endpoint, rotating through `hosts`/`ports` by the given dial
    /// attempt count (§8 boundary: endpoint rotation).
    pub fn endpoint(&self, attempt: usize) -> (&str, u16) {
        let idx = attempt % self.hosts.len();
        (self.hosts[idx].as_str(), self.ports[idx])
    }

    /// Verify `c_version` against `pubkey_der` (an RSA `RSAPublicKey` DER blob,
    /// as extracted from an X.509 SubjectPublicKeyInfo). Returns the verified
    /// version on success.
    pub fn verify(&self, pubkey_der: &[u8]) -> Result<u64, ContactError> {
        let version = self.version.ok_or(ContactError::BadSignature)?;
        let sig_hex = self.c_version.as_deref().ok_or(ContactError::BadSignature)?;
        let sig = hex::decode(sig_hex).map_err(|_| ContactError::BadSignature)?;
        let msg = version.to_string();
        let pk = signature::UnparsedPublicKey::new(
            &signature::RSA_PKCS1_2048_8192_SHA256,
            pubkey_der,
        );
        pk.verify(msg.as_bytes(), &sig).map_err(|_| ContactError::BadSignature)?;
        Ok(version)
    }

    /// Accept-or-reject a candidate update against the current Contact, per §4.B.
    ///
    /// `pubkey_der` is `None` when the identifier's certificate isn't known yet
    /// (case 3/4 of `addbabbler`): any candidate is accepted, unverified.
    pub fn accepts_update(prior: Option<&Contact>, candidate: &Contact, pubkey_der: Option<&[u8]>) -> bool {
        let Some(prior) = prior else {
            return true;
        };
        let Some(pk) = pubkey_der else {
            // No certificate yet: can't verify, so any gossiped update is accepted
            // unverified (Open Question 1 — kept as specified).
            return true;
        };
        let Ok(new_version) = candidate.verify(pk) else {
            return false;
        };
        match prior.version {
            Some(prior_version) => new_version > prior_version,
            None => true,
        }
    }
}

/// A loaded RSA signing key, used to produce `c_version` for this babbler's own
/// Contact announcements.
pub struct ContactSigner {
    keypair: RsaKeyPair,
}

impl ContactSigner {
    /// Load an RSA PKCS#8 private key from a PEM (or raw DER) file on disk. This
    /// crate never generates RSA keys: the key is assumed bound to an externally
    /// provisioned X.509 certificate (certificate issuance is out of scope).
    pub fn load(path: &Path) -> Result<Self, ContactError> {
        let raw = std::fs::read(path).map_err(|_| ContactError::Io)?;
        let der = if raw.starts_with(b"-----BEGIN") {
            let mut cursor = std::io::Cursor::new(raw);
            let mut keys = rustls_pemfile::pkcs8_private_keys(&mut cursor);
            let first = keys
                .next()
                .ok_or(ContactError::InvalidKey)?
                .map_err(|_| ContactError::InvalidKey)?;
            first.secret_pkcs8_der().to_vec()
        } else {
            raw
        };
        let keypair = RsaKeyPair::from_pkcs8(&der).map_err(|_| ContactError::InvalidKey)?;
        Ok(Self { keypair })
    }

    /// Sign `version`'s decimal representation, returning the hex-encoded
    /// PKCS#1v1.5/SHA-256 signature.
    pub fn sign_version(&self, version: u64) -> Result<String, ContactError> {
        let msg = version.to_string();
        let mut sig = vec![0u8; self.keypair.public().modulus_len()];
        let rng = SystemRandom::new();
        self.keypair
            .sign(&signature::RSA_PKCS1_SHA256, &rng, msg.as_bytes(), &mut sig)
            .map_err(|_| ContactError::SigningFailed)?;
        Ok(hex::encode(sig))
    }
}

/// Extract the RSA `RSAPublicKey` DER blob from an X.509 certificate (DER-encoded),
/// suitable for passing to [`Contact::verify`].
pub fn public_key_der_from_cert(cert_der: &[u8]) -> Result<Vec<u8>, ContactError> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|_| ContactError::InvalidCertificate)?;
    Ok(cert.public_key().subject_public_key.data.to_vec())
}

/// Extract the Common Name from an X.509 certificate (DER-encoded); this is the
/// canonical babbler identifier (§3).
pub fn common_name_from_cert(cert_der: &[u8]) -> Result<String, ContactError> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|_| ContactError::InvalidCertificate)?;
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string())
        .ok_or(ContactError::InvalidCertificate)
}

/// Apply the self-defence rule (§4.B): when a third party gossips data under my
/// own identifier with a version higher than mine, adopt the integer but keep my
/// own hosts/ports, and return the version my *next* announcement must use.
pub fn self_defence_next_version(my_version: u64, observed: &Contact, pubkey_der: &[u8]) -> u64 {
    match observed.verify(pubkey_der) {
        Ok(observed_version) => std::cmp::max(observed_version, my_version) + 1,
        Err(_) => my_version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_contact() {
        assert!(Contact::new(vec![], vec![]).is_err());
        assert!(Contact::new(vec!["a".into()], vec![1, 2]).is_err());
    }

    #[test]
    fn endpoint_rotates_through_hosts() {
        let c = Contact::new(vec!["a".into(), "b".into(), "c".into()], vec![1, 2, 3]).unwrap();
        assert_eq!(c.endpoint(0), ("a", 1));
        assert_eq!(c.endpoint(3), ("a", 1));
        assert_eq!(c.endpoint(4), ("b", 2));
    }

    #[test]
    fn unknown_certificate_accepts_any_update() {
        let prior = Contact::new(vec!["a".into()], vec![1]).unwrap();
        let candidate = Contact::new(vec!["b".into()], vec![2]).unwrap();
        assert!(Contact::accepts_update(Some(&prior), &candidate, None));
    }

    #[test]
    fn no_prior_contact_always_accepted() {
        let candidate = Contact::new(vec!["a".into()], vec![1]).unwrap();
        assert!(Contact::accepts_update(None, &candidate, None));
    }

    #[test]
    fn self_defence_with_unverifiable_signature_leaves_version_unchanged() {
        let mut observed = Contact::new(vec!["attacker".into()], vec![1]).unwrap();
        observed.version = Some(99);
        observed.c_version = Some(hex::encode(b"not a real signature"));
        let garbage_pubkey = b"not a real RSA public key";
        assert_eq!(self_defence_next_version(5, &observed, garbage_pubkey), 5);
    }

    #[test]
    fn verify_rejects_unparseable_signature_hex() {
        let mut c = Contact::new(vec!["a".into()], vec![1]).unwrap();
        c.version = Some(1);
        c.c_version = Some("not hex".into());
        assert!(matches!(c.verify(b"irrelevant"), Err(ContactError::BadSignature)));
    }
}
