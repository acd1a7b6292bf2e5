//! fos-ippctl: IP protection dry run
//!
//! Loads a configuration and a server list, builds the proxy descriptor
//! chain for the default location and prints the routing decision for each
//! URL given on the command line. No tunnel is opened.
//!
//! ```text
//! fos-ippctl [-c config.toml] [-s servers.json] [--private] [--tracker] URL...
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use fos_ipp::{
    FileSource, FilterChain, IppConfig, RequestRouter, RouteRequest, Routing, ServerDirectory,
    ServerList,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Placeholder credential, the descriptor is only printed
const DRY_RUN_TOKEN: &str = "Bearer dry-run";

/// fos-ippctl - IP protection dry run
#[derive(Parser, Debug)]
#[command(name = "fos-ippctl")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server list, overrides `server_list` from the config
    #[arg(short, long)]
    servers: Option<PathBuf>,

    /// Treat requests as private browsing
    #[arg(long = "private")]
    private_browsing: bool,

    /// Treat requests as tracker loads
    #[arg(long)]
    tracker: bool,

    /// URLs to route
    urls: Vec<String>,
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => IppConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => IppConfig::default(),
    };
    init_logging(config.log);
    config.validate()?;
    debug!("Config: {:?}", config);

    let list_path = args
        .servers
        .clone()
        .or_else(|| config.server_list.clone())
        .context("no server list, pass --servers or set server_list")?;
    let servers = ServerList::new(FileSource::new(&list_path));
    servers.maybe_fetch_list(true).await?;

    let location = servers
        .default_location()
        .context("server list has no US city with servers")?;
    let server = servers
        .select_server(Some(&location.city))
        .context("every server in the default city is quarantined")?;
    info!("Selected {} in {}", server.hostname, location.city.name);

    let host = Arc::new(FilterChain::new());
    let router = Arc::new(RequestRouter::from_config(&config, host.clone()));
    router.start();
    let descriptor = router.initialize(DRY_RUN_TOKEN, &server)?;

    println!(
        "Server:        {} ({}, {})",
        server.hostname, location.city.name, location.country.name
    );
    println!("Mode:          {}", config.mode);
    println!("Isolation key: {}", descriptor.isolation_key);
    for (i, entry) in descriptor.chain().enumerate() {
        println!(
            "  {}. {}://{}:{} (failover {}s)",
            i + 1,
            entry.kind.name(),
            entry.host,
            entry.port,
            entry.failover_timeout_secs
        );
    }

    for url in &args.urls {
        let mut request = RouteRequest::new(url.as_str());
        if args.private_browsing {
            request = request.private_browsing();
        }
        if args.tracker {
            request = request.tracker();
        }

        let verdict = match host.route(request) {
            Routing::Direct => "DIRECT".to_string(),
            Routing::Proxy(descriptor) => format!("PROXY  {}", descriptor),
            Routing::Queued(_) => "QUEUED".to_string(),
        };
        println!("{:<8} {}", url, verdict);
    }

    router.stop();
    Ok(())
}
