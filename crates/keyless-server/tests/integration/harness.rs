//! Test harness: a real in-process server over loopback mTLS.
//!
//! Mints a throwaway CA plus server and client certificates, writes RSA
//! and EC private keys into a temporary key directory, and starts the
//! server on an ephemeral port. The client side speaks the frame
//! protocol over tokio-rustls.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use keyless_crypto::{KeyStore, PrivateKey};
use keyless_protocol::{Frame, Header, Items, Opcode, HEADER_SIZE};
use keyless_server::server::Server;
use keyless_server::tls;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::RsaPrivateKey;
use rustls::pki_types::{PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

pub const RSA_2048: &str = include_str!("../../testdata/rsa2048.key");
pub const EC_P256: &str = include_str!("../../testdata/ecp256.key");

const CIPHER_LIST: &str =
    "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256:TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384";

/// A running in-process server plus everything a client needs to reach it.
pub struct TestServer {
    pub addr: SocketAddr,
    pub rsa_digest: [u8; 32],
    pub ec_digest: [u8; 32],
    shutdown_tx: broadcast::Sender<()>,
    server_task: tokio::task::JoinHandle<()>,
    client_config: Arc<rustls::ClientConfig>,
    ca_der: rustls::pki_types::CertificateDer<'static>,
    _tempdir: tempfile::TempDir,
}

impl TestServer {
    pub async fn start() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;

        // Throwaway PKI: CA signs one server and one client certificate.
        let ca_key = rcgen::KeyPair::generate()?;
        let mut ca_params = rcgen::CertificateParams::new(Vec::new())?;
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key)?;

        let server_key = rcgen::KeyPair::generate()?;
        let mut server_params = rcgen::CertificateParams::new(vec!["localhost".into()])?;
        server_params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
        let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key)?;

        let client_key = rcgen::KeyPair::generate()?;
        let mut client_params = rcgen::CertificateParams::new(vec!["keyless-client".into()])?;
        client_params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];
        let client_cert = client_params.signed_by(&client_key, &ca_cert, &ca_key)?;

        let ca_path = dir.path().join("ca.pem");
        let cert_path = dir.path().join("server.pem");
        let key_path = dir.path().join("server-key.pem");
        std::fs::write(&ca_path, ca_cert.pem())?;
        std::fs::write(&cert_path, server_cert.pem())?;
        std::fs::write(&key_path, server_key.serialize_pem())?;

        // Served private keys.
        let keys_dir = dir.path().join("keys");
        std::fs::create_dir(&keys_dir)?;
        std::fs::write(keys_dir.join("rsa2048.key"), RSA_2048)?;
        std::fs::write(keys_dir.join("ecp256.key"), EC_P256)?;

        let tls_config = tls::build_server_config(&cert_path, &key_path, &ca_path, CIPHER_LIST)?;
        let keystore = Arc::new(KeyStore::load_dir(&keys_dir)?);

        let server = Server::bind("127.0.0.1:0".parse()?, tls_config, keystore).await?;
        let addr = server.local_addr()?;
        let shutdown_tx = server.shutdown_handle();
        let server_task = tokio::spawn(server.run());

        let client_config = Arc::new(
            client_config_builder(ca_cert.der().clone())?
                .with_client_auth_cert(
                    vec![client_cert.der().clone()],
                    PrivateKeyDer::try_from(client_key.serialize_der())
                        .map_err(|e| anyhow::anyhow!("client key: {e}"))?,
                )?,
        );

        Ok(Self {
            addr,
            rsa_digest: rsa_key_digest(),
            ec_digest: ec_key_digest(),
            shutdown_tx,
            server_task,
            client_config,
            ca_der: ca_cert.der().clone(),
            _tempdir: dir,
        })
    }

    /// Open an mTLS connection with the provisioned client certificate.
    pub async fn connect(&self) -> anyhow::Result<TlsStream<TcpStream>> {
        let connector = TlsConnector::from(self.client_config.clone());
        let tcp = TcpStream::connect(self.addr).await?;
        let stream = connector
            .connect(ServerName::try_from("localhost")?, tcp)
            .await?;
        Ok(stream)
    }

    /// Open a TLS connection that presents no client certificate. The
    /// server must refuse to serve it.
    pub async fn connect_without_client_cert(&self) -> anyhow::Result<TlsStream<TcpStream>> {
        let config = Arc::new(client_config_builder(self.ca_der.clone())?.with_no_client_auth());
        let connector = TlsConnector::from(config);
        let tcp = TcpStream::connect(self.addr).await?;
        let stream = connector
            .connect(ServerName::try_from("localhost")?, tcp)
            .await?;
        Ok(stream)
    }

    /// Request shutdown and wait for the server task to drain.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(());
        tokio::time::timeout(Duration::from_secs(10), self.server_task)
            .await
            .map_err(|_| anyhow::anyhow!("server did not shut down within 10s"))??;
        Ok(())
    }
}

fn client_config_builder(
    ca: rustls::pki_types::CertificateDer<'static>,
) -> anyhow::Result<rustls::ConfigBuilder<rustls::ClientConfig, rustls::client::WantsClientCert>> {
    let mut roots = RootCertStore::empty();
    roots.add(ca)?;
    Ok(rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots))
}

/// Wire digest of the served RSA test key.
pub fn rsa_key_digest() -> [u8; 32] {
    let key = RsaPrivateKey::from_pkcs1_pem(RSA_2048).unwrap();
    PrivateKey::Rsa(key).digest()
}

/// Wire digest of the served P-256 test key.
pub fn ec_key_digest() -> [u8; 32] {
    let key = p256::SecretKey::from_sec1_pem(EC_P256).unwrap();
    PrivateKey::EcP256(key.into()).digest()
}

// ============================================================================
// Frame I/O helpers
// ============================================================================

/// Write one frame to the stream.
pub async fn send_frame<S>(stream: &mut S, frame: &Frame) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut wire = Vec::with_capacity(HEADER_SIZE + frame.payload.len());
    wire.push(frame.header.version_major);
    wire.push(frame.header.version_minor);
    wire.extend_from_slice(&frame.header.length.to_be_bytes());
    wire.extend_from_slice(&frame.header.id.to_be_bytes());
    wire.extend_from_slice(&frame.payload);
    stream.write_all(&wire).await?;
    stream.flush().await?;
    Ok(())
}

/// Write a frame whose items are handed over as raw body bytes. Used for
/// malformed and unknown-opcode requests the typed builders refuse.
pub async fn send_raw_frame<S>(
    stream: &mut S,
    version_major: u8,
    id: u32,
    body: &[u8],
) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut wire = Vec::with_capacity(HEADER_SIZE + body.len());
    wire.push(version_major);
    wire.push(0);
    wire.extend_from_slice(&(body.len() as u16).to_be_bytes());
    wire.extend_from_slice(&id.to_be_bytes());
    wire.extend_from_slice(body);
    stream.write_all(&wire).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one response frame and decode its items.
pub async fn read_response<S>(stream: &mut S) -> anyhow::Result<(Header, Items)>
where
    S: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header_buf).await?;
    let header = Header::parse(&header_buf)?;

    let mut payload = vec![0u8; header.length as usize];
    stream.read_exact(&mut payload).await?;
    let items = Items::parse(&payload)?;
    Ok((header, items))
}

/// Build a request frame; panics only on oversized bodies, which tests
/// never produce.
pub fn request(id: u32, opcode: Opcode, key_id: Option<&[u8]>, payload: Option<&[u8]>) -> Frame {
    Frame::request(id, opcode, key_id, payload).expect("test request fits a frame")
}

/// Encode a single TLV item.
pub fn item(tag: u8, data: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
    out
}
