//! TLS setup: server identity, mandatory client verification, cipher
//! selection.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};

/// Build the server's TLS configuration.
///
/// Client certificates are required and verified against `ca_file`
/// (direct issuance, i.e. verification depth 1). Only TLS 1.2 is
/// offered, restricted to the suites named in `cipher_list`: a
/// colon-separated list of IANA names such as
/// `TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256`. Unknown names are skipped
/// with a warning; an empty selection is an error.
pub fn build_server_config(
    server_cert: &Path,
    server_key: &Path,
    ca_file: &Path,
    cipher_list: &str,
) -> anyhow::Result<Arc<ServerConfig>> {
    let provider = provider_with_ciphers(cipher_list)?;

    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_file)? {
        roots.add(cert).context("invalid CA certificate")?;
    }
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .context("building client certificate verifier")?;

    let certs = load_certs(server_cert)?;
    let key = load_key(server_key)?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12])
        .context("TLS 1.2 unavailable with the selected cipher suites")?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .context("server certificate and private key do not match")?;

    Ok(Arc::new(config))
}

/// The ring provider restricted to the requested cipher suites.
fn provider_with_ciphers(cipher_list: &str) -> anyhow::Result<Arc<CryptoProvider>> {
    let base = rustls::crypto::ring::default_provider();
    let mut suites = Vec::new();
    for name in cipher_list.split(':').filter(|s| !s.is_empty()) {
        match base
            .cipher_suites
            .iter()
            .find(|s| format!("{:?}", s.suite()).eq_ignore_ascii_case(name))
        {
            Some(suite) => suites.push(*suite),
            None => tracing::warn!(suite = name, "unknown cipher suite, skipping"),
        }
    }
    anyhow::ensure!(
        !suites.is_empty(),
        "no usable cipher suites in {cipher_list:?}"
    );
    Ok(Arc::new(CryptoProvider {
        cipher_suites: suites,
        ..base
    }))
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .with_context(|| format!("parsing certificates from {}", path.display()))?;
    anyhow::ensure!(!certs.is_empty(), "no certificates found in {}", path.display());
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("parsing private key from {}", path.display()))?
        .with_context(|| format!("no private key found in {}", path.display()))
}
