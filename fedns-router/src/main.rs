use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use fedns_common::{
    retry_if, FedNsError, HealthChecker, OperationKind, RemoteLocation, RouterConfig,
    ShutdownCoordinator,
};
use fedns_router::{
    DestinationOrder, MountEntry, MountTableCache, RequestContext, Resolver, RouterMetrics,
    SharedSledMountStore, SledMountStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/fedns/router.toml")]
    config: PathBuf,

    /// Mount store directory override
    #[arg(short, long)]
    store_path: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Keep the mount table in sync and report health until interrupted
    Serve {
        /// Seconds between health reports
        #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
        health_interval: u64,
    },
    /// Resolve a path and print the result as JSON
    Resolve {
        path: String,
        #[arg(long, default_value = "read")]
        op: OperationKind,
        /// Subcluster colocated with the caller
        #[arg(long)]
        locality: Option<String>,
    },
    /// Add or replace a mount entry
    Add {
        source: String,
        /// Destinations as <subcluster>:<remote path>
        #[arg(required = true)]
        destinations: Vec<String>,
        #[arg(long, default_value = "HASH")]
        order: DestinationOrder,
        #[arg(long)]
        read_only: bool,
        #[arg(long)]
        fault_tolerant: bool,
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        group: Option<String>,
    },
    /// Remove a mount entry
    Remove { source: String },
    /// List mount entries
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.json_logs);

    let mut config = RouterConfig::load(&args.config)
        .with_context(|| format!("loading configuration from {:?}", args.config))?;
    if let Some(store_path) = args.store_path {
        config.store_path = store_path;
    }

    match args.command {
        Command::Serve { health_interval } => {
            let store = Arc::new(SharedSledMountStore::new(&config.store_path));
            serve(store, config, Duration::from_secs(health_interval)).await
        }
        Command::Resolve { path, op, locality } => {
            let store = Arc::new(SharedSledMountStore::new(&config.store_path));
            let cache = Arc::new(MountTableCache::new(store, config));
            cache.start().await?;
            let resolver = Resolver::new(cache);

            let mut ctx = RequestContext::new();
            if let Some(locality) = locality {
                ctx = ctx.with_locality(locality);
            }
            let result = resolver.resolve(&path, op, &ctx).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Command::Add {
            source,
            destinations,
            order,
            read_only,
            fault_tolerant,
            owner,
            group,
        } => {
            let destinations = destinations
                .iter()
                .map(|d| parse_destination(d))
                .collect::<Result<Vec<_>>>()?;
            let mut entry = MountEntry::new(source, destinations)
                .with_order(order)
                .with_read_only(read_only)
                .with_fault_tolerant(fault_tolerant);
            entry.owner = owner.unwrap_or_default();
            entry.group = group.unwrap_or_default();

            // Reject entries that could never become part of a table
            fedns_router::MountTable::build([entry.clone()])?;
            let source = entry.source_path.clone();
            let store = open_for_admin(&config).await?;
            store.upsert(entry)?;
            store.flush()?;
            info!("Saved mount entry {}", source);
            Ok(())
        }
        Command::Remove { source } => {
            let store = open_for_admin(&config).await?;
            if store.remove(&source)? {
                store.flush()?;
                info!("Removed mount entry {}", source);
                Ok(())
            } else {
                Err(anyhow!("no mount entry at {}", source))
            }
        }
        Command::List => {
            let store = open_for_admin(&config).await?;
            for entry in store.entries()? {
                let destinations: Vec<String> =
                    entry.destinations.iter().map(|d| d.to_string()).collect();
                println!(
                    "{}\t{}\t{}{}{}",
                    entry.source_path,
                    destinations.join(","),
                    entry.order,
                    if entry.read_only { "\tread-only" } else { "" },
                    if entry.fault_tolerant { "\tfault-tolerant" } else { "" },
                );
            }
            Ok(())
        }
    }
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Open the store for a mutation, waiting out a running router's fetch
async fn open_for_admin(config: &RouterConfig) -> Result<SledMountStore> {
    let store = retry_if(
        config.retry(),
        || async { SledMountStore::open(&config.store_path) },
        FedNsError::is_retriable,
    )
    .await
    .with_context(|| format!("opening mount store at {:?}", config.store_path))?;
    Ok(store)
}

/// Parse `<subcluster>:<remote path>`
fn parse_destination(value: &str) -> Result<RemoteLocation> {
    let (subcluster, remote_path) = value
        .split_once(':')
        .ok_or_else(|| anyhow!("destination {:?} is not <subcluster>:<path>", value))?;
    if subcluster.is_empty() || remote_path.is_empty() {
        return Err(anyhow!("destination {:?} is not <subcluster>:<path>", value));
    }
    Ok(RemoteLocation::new(subcluster, remote_path))
}

async fn serve(store: Arc<SharedSledMountStore>, config: RouterConfig, health_interval: Duration) -> Result<()> {
    info!("Starting FedNS router v{}", fedns_common::FEDNS_VERSION);
    info!("Mount store: {:?}", config.store_path);
    match config.effective_default() {
        Some(ns) => info!("Default subcluster: {}", ns),
        None => info!("No default subcluster; unmatched paths are unresolved"),
    }

    let metrics = Arc::new(RouterMetrics::new()?);
    let cache = Arc::new(MountTableCache::new_with_metrics(
        store,
        config,
        Some(metrics.clone()),
    ));
    cache.start().await?;

    let coordinator = ShutdownCoordinator::new();
    let refresh = cache.clone().spawn_refresh_task(coordinator.shutdown_signal());
    coordinator.register_task("mount_table_refresh", refresh).await;

    let health = tokio::spawn(report_health(
        cache.clone(),
        metrics,
        health_interval,
        coordinator.shutdown_signal(),
    ));
    coordinator.register_task("health_reporter", health).await;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    match coordinator.shutdown(Duration::from_secs(10)).await {
        Ok(()) => {
            info!("Router shut down gracefully");
            Ok(())
        }
        Err(e) => {
            error!("Router shutdown error: {}", e);
            Err(e)
        }
    }
}

async fn report_health(
    cache: Arc<MountTableCache>,
    metrics: Arc<RouterMetrics>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                let result = cache.check_health().await?;
                if result.status.is_serving() {
                    info!("{}: {:?} {} {:?}", result.component, result.status, result.message, result.metrics);
                } else {
                    warn!("{}: {:?} {} {:?}", result.component, result.status, result.message, result.recommendations);
                }
                tracing::debug!("metrics:\n{}", metrics.export()?);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_interval_must_be_positive() {
        assert!(Args::try_parse_from(["fedns-router", "serve", "--health-interval", "0"]).is_err());
        let args = Args::try_parse_from(["fedns-router", "serve", "--health-interval", "5"]).unwrap();
        assert!(matches!(args.command, Command::Serve { health_interval: 5 }));
    }

    #[test]
    fn test_parse_destination() {
        assert_eq!(
            parse_destination("ns1:/data").unwrap(),
            RemoteLocation::new("ns1", "/data")
        );
        assert!(parse_destination("ns1").is_err());
        assert!(parse_destination(":/data").is_err());
    }
}
