//! keyless-server -- performs private-key operations on behalf of remote
//! clients that hold the certificate but not the key.
//!
//! Usage:
//!   keyless-server --port 2407 \
//!       --server-cert server.pem --server-key server-key.pem \
//!       --ca-file ca.pem --private-key-directory /etc/keyless/keys \
//!       --cipher-list TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use keyless_crypto::KeyStore;
use keyless_server::server::Server;
use keyless_server::tls;

#[derive(Parser)]
#[command(name = "keyless-server", about = "Private-key operation server over mTLS")]
struct Cli {
    /// Port to listen on.
    #[arg(long)]
    port: u16,

    /// The server's TLS certificate (PEM).
    #[arg(long)]
    server_cert: PathBuf,

    /// The server's TLS private key (PEM).
    #[arg(long)]
    server_key: PathBuf,

    /// Directory of *.key PEM private keys to serve.
    #[arg(long)]
    private_key_directory: PathBuf,

    /// Colon-separated cipher suites to offer (IANA names).
    #[arg(long)]
    cipher_list: String,

    /// CA bundle that client certificates must chain to.
    #[arg(long)]
    ca_file: PathBuf,

    /// Number of runtime worker threads.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=32))]
    num_workers: u8,

    /// Write the process id here after binding.
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Suppress all logging below error level.
    #[arg(long)]
    silent: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.silent {
        "error"
    } else {
        "keyless_server=info,keyless_crypto=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cli.num_workers as usize)
        .enable_all()
        .build()
        .context("building runtime")?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let tls_config = tls::build_server_config(
        &cli.server_cert,
        &cli.server_key,
        &cli.ca_file,
        &cli.cipher_list,
    )?;

    let keystore = Arc::new(KeyStore::load_dir(&cli.private_key_directory)?);
    tracing::info!(
        keys = keystore.len(),
        dir = %cli.private_key_directory.display(),
        "keystore loaded"
    );

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, cli.port));
    let server = Server::bind(addr, tls_config, keystore)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(
        addr = %server.local_addr()?,
        workers = cli.num_workers,
        version = env!("CARGO_PKG_VERSION"),
        "listening"
    );

    if let Some(path) = &cli.pid_file {
        std::fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("writing pid file {}", path.display()))?;
    }

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("termination signal received");
        let _ = shutdown.send(());
    });

    server.run().await;

    if let Some(path) = &cli.pid_file {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!(path = %path.display(), "failed to remove pid file: {e}");
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(e) => {
            tracing::error!("failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
