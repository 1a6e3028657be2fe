//! Keystore: PEM key loading, public-material digests, digest lookup.
//!
//! A key's wire identity is SHA-256 over the DER encoding of its RSA
//! public modulus, or over the SEC1 uncompressed encoding of its EC
//! public point. Storage is a flat list scanned linearly; stores hold
//! tens of keys, not thousands.

use std::fs;
use std::path::Path;

use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};

use crate::KeyStoreError;

/// SHA-256 digest identifying a key on the wire.
pub type KeyDigest = [u8; 32];

/// A loaded private key.
#[derive(Debug)]
pub enum PrivateKey {
    Rsa(RsaPrivateKey),
    EcP256(p256::ecdsa::SigningKey),
    EcP384(p384::ecdsa::SigningKey),
}

impl PrivateKey {
    pub fn is_rsa(&self) -> bool {
        matches!(self, PrivateKey::Rsa(_))
    }

    pub fn is_ec(&self) -> bool {
        matches!(self, PrivateKey::EcP256(_) | PrivateKey::EcP384(_))
    }

    /// Compute this key's wire digest from its public material.
    pub fn digest(&self) -> KeyDigest {
        let mut hasher = Sha256::new();
        match self {
            PrivateKey::Rsa(key) => {
                hasher.update(der_integer(&key.n().to_bytes_be()));
            }
            PrivateKey::EcP256(key) => {
                hasher.update(key.verifying_key().to_encoded_point(false).as_bytes());
            }
            PrivateKey::EcP384(key) => {
                hasher.update(key.verifying_key().to_encoded_point(false).as_bytes());
            }
        }
        hasher.finalize().into()
    }

    fn type_name(&self) -> &'static str {
        match self {
            PrivateKey::Rsa(_) => "rsa",
            PrivateKey::EcP256(_) => "ec-p256",
            PrivateKey::EcP384(_) => "ec-p384",
        }
    }
}

struct KeyRecord {
    digest: KeyDigest,
    key: PrivateKey,
}

/// Immutable set of private keys, addressable by public-material digest.
pub struct KeyStore {
    keys: Vec<KeyRecord>,
}

impl KeyStore {
    /// Build a store from already-parsed keys.
    pub fn from_keys(keys: Vec<PrivateKey>) -> Self {
        let keys = keys
            .into_iter()
            .map(|key| KeyRecord {
                digest: key.digest(),
                key,
            })
            .collect();
        Self { keys }
    }

    /// Load every `*.key` PEM file in `dir`. Other extensions are ignored.
    ///
    /// An unparseable key file is an error, as is a directory yielding no
    /// keys at all: a server with nothing to serve is misconfigured.
    pub fn load_dir(dir: &Path) -> Result<Self, KeyStoreError> {
        let entries = fs::read_dir(dir).map_err(|source| KeyStoreError::Read {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths: Vec<_> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "key"))
            .collect();
        paths.sort();

        let mut keys = Vec::with_capacity(paths.len());
        for path in paths {
            let pem = fs::read_to_string(&path).map_err(|source| KeyStoreError::Read {
                path: path.clone(),
                source,
            })?;
            let key = parse_private_key(&pem, &path)?;
            tracing::debug!(
                file = %path.display(),
                key_type = key.type_name(),
                digest = %hex::encode(key.digest()),
                "loaded private key"
            );
            keys.push(key);
        }

        if keys.is_empty() {
            return Err(KeyStoreError::Empty(dir.to_path_buf()));
        }
        Ok(Self::from_keys(keys))
    }

    /// Resolve a wire KEY_ID to a key handle.
    pub fn lookup(&self, digest: &[u8]) -> Option<&PrivateKey> {
        self.keys
            .iter()
            .find(|record| record.digest[..] == *digest)
            .map(|record| &record.key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

fn parse_private_key(pem: &str, path: &Path) -> Result<PrivateKey, KeyStoreError> {
    use rsa::pkcs1::DecodeRsaPrivateKey;
    use rsa::pkcs8::DecodePrivateKey;

    if pem.contains("BEGIN RSA PRIVATE KEY") {
        return RsaPrivateKey::from_pkcs1_pem(pem)
            .map(PrivateKey::Rsa)
            .map_err(|_| KeyStoreError::Parse(path.to_path_buf()));
    }

    if pem.contains("BEGIN EC PRIVATE KEY") {
        if let Ok(key) = p256::SecretKey::from_sec1_pem(pem) {
            return Ok(PrivateKey::EcP256(key.into()));
        }
        if let Ok(key) = p384::SecretKey::from_sec1_pem(pem) {
            return Ok(PrivateKey::EcP384(key.into()));
        }
        return Err(KeyStoreError::UnsupportedCurve(path.to_path_buf()));
    }

    if pem.contains("BEGIN PRIVATE KEY") {
        if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(pem) {
            return Ok(PrivateKey::Rsa(key));
        }
        if let Ok(key) = p256::SecretKey::from_pkcs8_pem(pem) {
            return Ok(PrivateKey::EcP256(key.into()));
        }
        if let Ok(key) = p384::SecretKey::from_pkcs8_pem(pem) {
            return Ok(PrivateKey::EcP384(key.into()));
        }
    }

    Err(KeyStoreError::Parse(path.to_path_buf()))
}

/// DER encoding of an unsigned big-endian integer (ASN.1 INTEGER).
///
/// Strips redundant leading zeros, then prepends one zero octet when the
/// high bit is set so the value stays non-negative.
fn der_integer(be: &[u8]) -> Vec<u8> {
    let mut start = 0;
    while start + 1 < be.len() && be[start] == 0 {
        start += 1;
    }
    let magnitude = if be.is_empty() { &[0u8][..] } else { &be[start..] };
    let pad = magnitude[0] & 0x80 != 0;

    let content_len = magnitude.len() + usize::from(pad);
    let mut out = Vec::with_capacity(content_len + 4);
    out.push(0x02);
    if content_len < 0x80 {
        out.push(content_len as u8);
    } else {
        let len_be: Vec<u8> = content_len
            .to_be_bytes()
            .into_iter()
            .skip_while(|b| *b == 0)
            .collect();
        out.push(0x80 | len_be.len() as u8);
        out.extend_from_slice(&len_be);
    }
    if pad {
        out.push(0x00);
    }
    out.extend_from_slice(magnitude);
    out
}
