use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use iroh::{Endpoint, EndpointId};
use prometheus_client::registry::Registry;
use rand::RngCore;
use rend_client::Client;
use rend_core::{AddrEntry, EndpointRecord};
use rend_server::{PromMetrics, Server, ServerConfig, start_metrics_server};
use rend_store::RecordStore;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_enum, default_value_t = Verbosity::Info)]
    verbosity: Verbosity,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
enum Verbosity {
    Crit,
    Error,
    Warn,
    Info,
    Debug,
}

impl Verbosity {
    fn level(self) -> LevelFilter {
        match self {
            // tracing has no critical level; crit maps to error too.
            Verbosity::Crit | Verbosity::Error => LevelFilter::ERROR,
            Verbosity::Warn => LevelFilter::WARN,
            Verbosity::Info => LevelFilter::INFO,
            Verbosity::Debug => LevelFilter::DEBUG,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the rendezvous server
    Serve(ServeArgs),
    /// Advertise a record under a topic on a running server
    Register {
        /// Endpoint id of the server
        #[arg(short, long, value_name = "ID")]
        server: String,

        #[arg(short, long)]
        topic: String,

        /// Socket addresses to advertise in the record
        #[arg(long, value_name = "IP:PORT")]
        addr: Vec<SocketAddr>,

        /// Lifetime of the registration in seconds
        #[arg(long, value_name = "SECS", default_value_t = 5)]
        ttl: u64,
    },
    /// Sample records registered under a topic on a running server
    Discover {
        /// Endpoint id of the server
        #[arg(short, long, value_name = "ID")]
        server: String,

        #[arg(short, long)]
        topic: String,

        #[arg(short, long, default_value_t = 5)]
        limit: u64,
    },
}

#[derive(clap::Args)]
struct ServeArgs {
    /// UDP port to listen on
    #[arg(short, long, default_value_t = 9090)]
    port: u16,

    /// IPv4 address to bind
    #[arg(short, long, default_value = "0.0.0.0")]
    address: Ipv4Addr,

    /// Directory for persistent record storage
    #[arg(short, long, value_name = "PATH", default_value = "rendezvous_data")]
    data: PathBuf,

    /// File holding the server identity (hex or 32 raw bytes)
    #[arg(long, value_name = "PATH")]
    keypath: Option<PathBuf>,

    /// Server identity as a hex string
    #[arg(long, value_name = "HEX")]
    keyhex: Option<String>,

    /// Print a fresh identity and exit
    #[arg(long)]
    generate: bool,

    /// Serve prometheus metrics on this address
    #[arg(long, value_name = "HOST:PORT")]
    metrics_address: Option<SocketAddr>,
}

mod identity;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity.level())
        .init();

    match cli.cmd {
        Commands::Serve(args) => serve(args).await,
        Commands::Register {
            server,
            topic,
            addr,
            ttl,
        } => register(&server, &topic, addr, ttl).await,
        Commands::Discover {
            server,
            topic,
            limit,
        } => discover(&server, &topic, limit).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    if args.generate {
        let (secret_hex, id) = identity::generate();
        println!("secret key: {secret_hex}");
        println!("endpoint id: {id}");
        return Ok(());
    }

    let secret_key = identity::load(args.keyhex.as_deref(), args.keypath.as_deref())?;
    let store = RecordStore::open(&args.data)
        .with_context(|| format!("failed to open record store at {:?}", args.data))?;

    let mut config = ServerConfig {
        bind_addr: Some(SocketAddrV4::new(args.address, args.port)),
        secret_key,
        ..ServerConfig::default()
    };
    if let Some(addr) = args.metrics_address {
        let mut registry = Registry::default();
        config.metrics = Arc::new(PromMetrics::new(&mut registry));
        start_metrics_server(registry, addr)?;
    }

    let mut server = Server::start(config, store).await?;
    server.endpoint().online().await;
    info!("endpoint id: {}", server.id());
    info!("endpoint addr: {:?}", server.addr());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.stop().await?;
    Ok(())
}

async fn register(server: &str, topic: &str, addrs: Vec<SocketAddr>, ttl: u64) -> anyhow::Result<()> {
    // The endpoint must outlive the connection.
    let (_endpoint, client) = connect(server).await?;

    let mut seed = [0u8; 32];
    rand::rng().fill_bytes(&mut seed);
    let key = SigningKey::from_bytes(&seed);
    let record = EndpointRecord::signed(1, addrs.into_iter().map(AddrEntry::from).collect(), &key)?;

    client
        .register(topic, &record, Duration::from_secs(ttl))
        .await?;
    info!(topic, "registered {}", hex::encode(record.node_address()));
    Ok(())
}

async fn discover(server: &str, topic: &str, limit: u64) -> anyhow::Result<()> {
    let (_endpoint, client) = connect(server).await?;
    let records = client.discover(topic, limit).await?;
    info!(topic, "found {} records", records.len());
    for record in records {
        let addrs: Vec<_> = record
            .addrs
            .iter()
            .filter_map(AddrEntry::socket_addr)
            .collect();
        println!(
            "{} seq={} addrs={addrs:?}",
            hex::encode(record.node_address()),
            record.seq
        );
    }
    Ok(())
}

async fn connect(server: &str) -> anyhow::Result<(Endpoint, Client)> {
    let id = EndpointId::from_str(server).map_err(|e| anyhow!("invalid server id: {e}"))?;
    let endpoint = Endpoint::builder().bind().await?;
    let client = Client::connect(&endpoint, id).await?;
    Ok((endpoint, client))
}
