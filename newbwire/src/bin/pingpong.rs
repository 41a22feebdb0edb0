//! Counter ping-pong over the plaintext reference engine.
//!
//! ```text
//! pingpong --server --dev-keys          # terminal 1
//! pingpong --messages 10000             # terminal 2, prints the elapsed time
//! ```

use std::net::{Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use newbmux::config::DEFAULT_PORT;
use newbmux::{
    Acceptor, AcceptorConfig, BasicNewb, Dialer, DialerConfig, Driver, InterestSet, KeyMaterial,
    NewbError, NewbPool, Result, TransportPolicy,
};
use newbwire::pingpong::{counter_policy, PingClient, PingMonitor, PingServer};
use newbwire::PlainEngine;

#[derive(Parser, Debug)]
#[command(author, version, about = "Counter ping-pong over newbmux", long_about = None)]
struct Cli {
    /// Port the server listens on or the client connects to
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Host to bind (server) or connect to (client)
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Run as server
    #[arg(long)]
    server: bool,

    /// Number of counters the client exchanges
    #[arg(long, short = 'm', default_value_t = 10)]
    messages: u32,

    /// TOML file with an acceptor (server) or dialer (client) config;
    /// --host and --port override it
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Server only: use a random in-memory key instead of loading key files
    #[arg(long)]
    dev_keys: bool,
}

fn read_config(path: &Option<PathBuf>) -> Result<Option<String>> {
    match path {
        Some(path) => Ok(Some(std::fs::read_to_string(path)?)),
        None => Ok(None),
    }
}

async fn run_server(cli: Cli) -> Result<()> {
    let mut config = match read_config(&cli.config)? {
        Some(text) => AcceptorConfig::from_toml_str(&text)?,
        None => AcceptorConfig::default(),
    };
    config.host = cli.host;
    config.port = cli.port;
    config.receive_policy = counter_policy();

    let keys = if cli.dev_keys {
        let secret: [u8; 32] = rand::random();
        KeyMaterial::from_pem(Vec::new(), secret.to_vec())
    } else {
        KeyMaterial::load(&config.key_material)?
    };

    let pool = Arc::new(Mutex::new(NewbPool::new(|transport: TransportPolicy<PlainEngine>| {
        Ok(BasicNewb::spawn(transport, PingServer::new()))
    })));
    let acceptor = Acceptor::bind_with_keys(
        config,
        PlainEngine::new(),
        &keys,
        pool.clone(),
        tokio::net::UdpSocket::from_std,
    )?;
    println!("listening on {}", acceptor.local_addr());

    let mut driver = Driver::new(acceptor);
    driver
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    let (mut acceptor, mut interest) = driver.into_parts();
    acceptor.shutdown(&mut interest);
    let reaped = pool.lock().reap();
    tracing::info!(reaped, "server stopped");
    Ok(())
}

async fn run_client(cli: Cli) -> Result<()> {
    let mut config = match read_config(&cli.config)? {
        Some(text) => DialerConfig::from_toml_str(&text)?,
        None => DialerConfig::default(),
    };
    config.host = cli.host;
    config.port = cli.port;
    config.receive_policy = counter_policy();

    let server = tokio::net::lookup_host((config.host.as_str(), config.port))
        .await?
        .next()
        .ok_or_else(|| NewbError::Config(format!("cannot resolve {}", config.host)))?;
    let local: SocketAddr = if server.is_ipv6() {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from(([0, 0, 0, 0], 0))
    };
    let socket = tokio::net::UdpSocket::bind(local).await?;

    let monitor = PingMonitor::new();
    let client_monitor = monitor.clone();
    let messages = cli.messages;
    let mut pool = NewbPool::new(move |transport: TransportPolicy<PlainEngine>| {
        Ok(BasicNewb::spawn(
            transport,
            PingClient::new(messages, client_monitor.clone()),
        ))
    });

    let mut interest = InterestSet::new();
    let dialer = Dialer::connect(
        config,
        PlainEngine::new(),
        socket,
        server,
        &mut pool,
        &mut interest,
    )?;
    let mut driver = Driver::with_interest(dialer, interest);
    driver.run_until(monitor.finished()).await?;

    let progress = monitor.progress();
    match progress.elapsed {
        Some(elapsed) => {
            println!("{}ms", elapsed.as_millis());
            Ok(())
        }
        None => {
            let reason = progress
                .error
                .unwrap_or_else(|| "connection closed early".into());
            eprintln!(
                "exchange incomplete after {} of {} messages: {reason}",
                progress.received, messages
            );
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if cli.server {
        run_server(cli).await
    } else {
        run_client(cli).await
    }
}
