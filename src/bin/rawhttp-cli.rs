use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;

use rawhttp::config::loader::load_config;
use rawhttp::config::EngineConfig;
use rawhttp::net::ProxyHop;
use rawhttp::normalize::framing::{decode_response_body, fix_framing};
use rawhttp::normalize::message::parse;
use rawhttp::observability::init_logging;
use rawhttp::pool::{Client, ConnectionKey, ConnectionPool, HttpScheme};
use rawhttp::proxy::destination::split_authority;
use rawhttp::Shutdown;

#[derive(Parser)]
#[command(name = "rawhttp-cli")]
#[command(about = "Send, normalize and decode raw HTTP messages", long_about = None)]
struct Cli {
    /// TOML configuration file for pool, DNS and timeout settings.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a raw request file through the connection pool
    Send {
        /// Request file, or `-` for stdin
        file: PathBuf,
        /// Destination as host:port
        #[arg(short, long)]
        target: String,
        #[arg(long)]
        https: bool,
        /// Try HTTP/2, falling back to HTTP/1.1
        #[arg(long)]
        http2: bool,
        /// TLS 1.2-only client profile
        #[arg(long)]
        alt_tls: bool,
        /// CONNECT proxy hop (http://[user:pass@]host:port); repeat for a chain
        #[arg(long = "proxy")]
        proxies: Vec<String>,
        /// Send the bytes exactly as given
        #[arg(long)]
        raw: bool,
        #[arg(long)]
        preserve_length: bool,
        #[arg(long)]
        json: bool,
    },
    /// Print the framing-normalized message
    Fix {
        file: PathBuf,
        #[arg(long)]
        preserve_length: bool,
    },
    /// Print a response with chunking and content encoding removed
    Decode { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => EngineConfig::default(),
    };
    init_logging(&config.observability);

    match cli.command {
        Commands::Send {
            file,
            target,
            https,
            http2,
            alt_tls,
            proxies,
            raw,
            preserve_length,
            json,
        } => {
            let request = read_input(&file)?;
            let default_port = if https { 443 } else { 80 };
            let (host, port) = split_authority(&target, default_port)
                .ok_or_else(|| format!("invalid target {target:?}"))?;
            let proxies = proxies
                .iter()
                .map(|p| ProxyHop::parse(p))
                .collect::<Result<Vec<_>, _>>()?;
            let scheme = if http2 { HttpScheme::H2 } else { HttpScheme::Http11 };
            let key = ConnectionKey::new(host, port, https)
                .with_scheme(scheme)
                .with_proxies(proxies)
                .with_alt_tls(alt_tls);

            let pool = Arc::new(ConnectionPool::from_config(&config)?);
            let shutdown = Shutdown::new();
            let reaper = tokio::spawn(Arc::clone(&pool).run_idle_reaper(shutdown.subscribe()));
            let mut client = Client::new(Arc::clone(&pool)).preserve_length(preserve_length);
            if raw {
                client = client.raw();
            }
            let response = client.send(&key, &request, None).await;
            shutdown.trigger();
            let _ = reaper.await;
            pool.shutdown();
            let response = response?;

            if json {
                let status = parse(&response.bytes).and_then(|m| m.status());
                let out = json!({
                    "target": key.to_string(),
                    "status": status,
                    "time_to_first_byte_ms": response.timing.time_to_first_byte.as_secs_f64() * 1000.0,
                    "total_ms": response.timing.total.as_secs_f64() * 1000.0,
                    "response": String::from_utf8_lossy(&response.bytes),
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                std::io::stdout().write_all(&response.bytes)?;
            }
        }
        Commands::Fix {
            file,
            preserve_length,
        } => {
            let message = read_input(&file)?;
            std::io::stdout().write_all(&fix_framing(&message, preserve_length))?;
        }
        Commands::Decode { file } => {
            let message = read_input(&file)?;
            std::io::stdout().write_all(&decode_response_body(&message))?;
        }
    }

    Ok(())
}

fn read_input(path: &Path) -> std::io::Result<Vec<u8>> {
    if path == Path::new("-") {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf)?;
        Ok(buf)
    } else {
        std::fs::read(path)
    }
}
