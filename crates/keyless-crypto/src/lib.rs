//! Keyless Crypto -- private keystore and operation dispatch.
//!
//! Keys are loaded once at startup from a directory of PEM files and are
//! immutable afterwards. Each key is addressed on the wire by a SHA-256
//! digest over its public material. The dispatcher executes a requested
//! operation against a resolved key and maps every failure onto a wire
//! error code; it performs no I/O and never mutates the store.

use std::path::PathBuf;

pub mod keystore;
pub mod ops;

pub use keystore::{KeyDigest, KeyStore, PrivateKey};
pub use ops::dispatch;

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("no private keys (*.key) found in {0}")]
    Empty(PathBuf),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unrecognized private key format in {0}")]
    Parse(PathBuf),
    #[error("unsupported EC curve in {0} (P-256 and P-384 are supported)")]
    UnsupportedCurve(PathBuf),
}
