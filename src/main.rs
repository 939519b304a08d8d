//! rawhttp proxy daemon.
//!
//! ```text
//!  client ──▶ Listener ──▶ TransparentProxy ──sniff──▶ TLS accept (per-SNI cert)
//!                              │
//!                              ├─ forward: first request replayed, then byte splice
//!                              └─ hijack:  every exchange parsed, rewritten, mirrored
//!                              ▼
//!                           Dialer (DNS cache, TLS client) ──▶ origin
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use rawhttp::config::loader::load_config;
use rawhttp::config::EngineConfig;
use rawhttp::lifecycle::{wait_for_shutdown_signal, Shutdown};
use rawhttp::net::{tls, ClientProfiles, Dialer, Listener, Resolver, StaticCertificate};
use rawhttp::observability::{init_logging, init_metrics};
use rawhttp::proxy::TransparentProxy;

#[derive(Parser)]
#[command(name = "rawhttp", version, about = "Transparent TLS-intercepting HTTP proxy")]
struct Args {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// How long open connections get to finish after shutdown starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => EngineConfig::default(),
    };
    init_logging(&config.observability);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.listener.bind_address,
        mode = ?config.proxy.mode,
        "rawhttp starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let config = Arc::new(config);
    let dialer = Arc::new(Dialer::new(Resolver::system(&config.dns), ClientProfiles::new()?));
    let mut proxy = TransparentProxy::new(Arc::clone(&config), dialer);
    if let Some(tls_config) = &config.tls {
        let source = StaticCertificate::from_pem_files(
            Path::new(&tls_config.cert_path),
            Path::new(&tls_config.key_path),
        )?;
        proxy = proxy.with_tls(tls::server_config(Arc::new(source))?);
        tracing::info!(cert = %tls_config.cert_path, "TLS interception enabled");
    }
    let proxy = Arc::new(proxy);

    let listener = Listener::bind(&config.listener).await?;
    let shutdown = Shutdown::new();
    let server = tokio::spawn(Arc::clone(&proxy).run(listener, shutdown.clone()));

    wait_for_shutdown_signal().await;
    shutdown.trigger();
    server.await??;

    if tokio::time::timeout(DRAIN_TIMEOUT, proxy.tracker().wait_for_drain())
        .await
        .is_err()
    {
        tracing::warn!(active = proxy.tracker().active_count(), "Drain timed out");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}
