//! veildns - DNS resolution and interception for circumvention proxies

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;

use veildns::{
    Config, DirectDialer, DnsCache, DohServer, HintFlags, Resolver, TcpDnsServer, UdpDnsServer,
    VirtualAddressTable,
};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser)]
#[command(name = "veildns")]
#[command(version, long_version = LONG_VERSION)]
#[command(about = "DNS resolution and interception engine", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "VEILDNS_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured DNS listeners
    Serve,

    /// Resolve one name and print the result
    Lookup {
        /// Name to resolve
        name: String,

        /// Upstream URL, e.g. udp://8.8.8.8:53 or https://dns.google/dns-query
        #[arg(short, long, default_value = "udp://8.8.8.8:53")]
        dns: String,

        /// Ask for AAAA instead of A
        #[arg(long)]
        ipv6: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    let config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::default(),
    };
    config.validate().map_err(anyhow::Error::msg)?;

    let resolver = Arc::new(Resolver::new(
        Arc::new(DnsCache::new(config.resolver.subdomain_depth)),
        Arc::new(VirtualAddressTable::new()),
        Arc::new(config.policy_table()),
        Arc::new(DirectDialer),
        config.resolver.settings(),
    ));

    match cli.command {
        Commands::Serve => serve(&config, resolver).await?,
        Commands::Lookup { name, dns, ipv6 } => lookup(&resolver, &name, &dns, ipv6).await?,
    }

    Ok(())
}

async fn serve(config: &Config, resolver: Arc<Resolver>) -> Result<()> {
    if config.listen.is_empty() {
        anyhow::bail!("No listeners configured, set [listen] tcp, udp or doh");
    }
    info!(
        "Starting veildns {} with {} policies",
        veildns::VERSION,
        config.policies.len()
    );

    let mut tasks = tokio::task::JoinSet::new();
    if let Some(addr) = config.listen.tcp {
        let server = TcpDnsServer::bind(addr, Arc::clone(&resolver))
            .await
            .with_context(|| format!("Failed to bind TCP listener on {}", addr))?;
        tasks.spawn(server.listen());
    }
    if let Some(addr) = config.listen.udp {
        let server = UdpDnsServer::bind(addr, Arc::clone(&resolver))
            .await
            .with_context(|| format!("Failed to bind UDP listener on {}", addr))?;
        tasks.spawn(server.listen());
    }
    if let Some(addr) = config.listen.doh {
        let server = DohServer::bind(addr, Arc::clone(&resolver))
            .await
            .with_context(|| format!("Failed to bind DoH listener on {}", addr))?;
        tasks.spawn(server.listen());
    }

    tokio::select! {
        Some(finished) = tasks.join_next() => {
            finished.context("Listener task panicked")?.context("Listener stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}

async fn lookup(resolver: &Resolver, name: &str, dns: &str, ipv6: bool) -> Result<()> {
    let hint = if ipv6 { HintFlags::IPV6 } else { HintFlags::NONE };
    let (index, addresses) = resolver
        .ns_lookup(name, hint, dns)
        .await
        .with_context(|| format!("Lookup of {} via {} failed", name, dns))?;

    if index > 0 {
        warn!("{} is mapped to virtual index {}", name, index);
    }
    if addresses.is_empty() {
        println!("{}: no addresses", name);
    }
    for address in addresses {
        println!("{}\t{}", name, address);
    }
    Ok(())
}
