use anyhow::Context;
use clap::Parser;
use dotenv::dotenv;
use std::{sync::Arc, time::Duration};
use tokio::signal;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{discovery_request, BackupAction, CacheAction, Cli, Command};
use mailmesh::{
    backup::{BackupCoordinator, BackupOptions, BackupSettings, RestoreOptions},
    config::ConfigStore,
    discovery::{DiscoveryCache, DiscoveryCoordinator, JsonSeedDirectory, NetworkProbe},
    models::{ConfiguredPeer, DiscoveryOutcome, ServiceState},
    service::{ServiceHost, TcpEngineFactory},
};

const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize environment
    dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Arc::new(
        ConfigStore::open(&cli.config)
            .with_context(|| format!("failed to load {}", cli.config.display()))?,
    );

    match cli.command.clone() {
        Command::Discover {
            protocols,
            region,
            max_rtt,
            use_cache,
            save,
        } => {
            let request = discovery_request(&protocols, region.as_deref(), max_rtt);
            let outcome = discover(&cli, &config, request, use_cache).await?;
            print_outcome(&outcome);

            if save && !outcome.peers.is_empty() {
                config.update(|config| {
                    config.peers = outcome
                        .peers
                        .iter()
                        .map(|peer| ConfiguredPeer::enabled(peer.address.clone()))
                        .collect();
                })?;
                tracing::info!("Saved {} peers to {}", outcome.peers.len(), cli.config.display());
            }
        }
        Command::Cache { action } => {
            let cache = DiscoveryCache::new(cli.cache_path());
            match action {
                CacheAction::Show => match cache.load()? {
                    Some(cached) => {
                        println!(
                            "{} peers cached at {} ({} minutes ago)",
                            cached.peers.len(),
                            cached.timestamp,
                            cached.age().num_minutes()
                        );
                        for peer in &cached.peers {
                            println!("{:>6} ms  {}", peer.rtt_ms, peer.address);
                        }
                    }
                    None => println!("No cached discovery result"),
                },
                CacheAction::Clear => {
                    cache.clear()?;
                    println!("Discovery cache cleared");
                }
            }
        }
        Command::Backup { action } => {
            let host = Arc::new(ServiceHost::new(config.clone(), Arc::new(TcpEngineFactory)));
            let backups = BackupCoordinator::new(host, BackupSettings::default());
            match action {
                BackupAction::Create {
                    path,
                    include_database,
                    password,
                } => {
                    let report = backups
                        .create_backup(BackupOptions {
                            path,
                            password,
                            include_database,
                        })
                        .await?;
                    println!(
                        "Backup written to {} ({} bytes)",
                        report.path.display(),
                        report.bytes_written
                    );
                    if let Some(warning) = report.warning {
                        println!("Warning: {}", warning);
                    }
                }
                BackupAction::Restore { path, password } => {
                    let report = backups
                        .restore_backup(RestoreOptions { path, password })
                        .await?;
                    println!(
                        "Restored backup taken at {} (storage included: {})",
                        report.created_at, report.restored_database
                    );
                    if let Some(warning) = report.warning {
                        println!("Warning: {}", warning);
                    }
                }
            }
        }
        Command::Run => run(config).await?,
    }

    Ok(())
}

async fn discover(
    cli: &Cli,
    config: &ConfigStore,
    request: mailmesh::discovery::DiscoveryRequest,
    use_cache: bool,
) -> anyhow::Result<DiscoveryOutcome> {
    let settings = config.snapshot().discovery;
    let probe = NetworkProbe::new(settings.probe_timeout())?;
    let coordinator = DiscoveryCoordinator::new(
        Arc::new(JsonSeedDirectory::new(&cli.seeds)),
        Arc::new(probe),
        Arc::new(DiscoveryCache::new(cli.cache_path())),
        settings,
    );

    let mut progress = coordinator.subscribe_progress();
    let reporter = tokio::spawn(async move {
        while let Some(update) = progress.recv().await {
            tracing::info!(
                "Probed {}/{} candidates, {} available",
                update.current,
                update.total,
                update.available_count
            );
        }
    });

    let scan = async {
        if use_cache {
            coordinator.discover_or_cached(&request, None).await
        } else {
            coordinator.find_available_peers(&request).await
        }
    };
    tokio::pin!(scan);

    let outcome = tokio::select! {
        outcome = &mut scan => outcome,
        _ = signal::ctrl_c() => {
            tracing::info!("Received interrupt, cancelling discovery...");
            coordinator.cancel();
            scan.await
        }
    };
    reporter.abort();
    Ok(outcome?)
}

fn print_outcome(outcome: &DiscoveryOutcome) {
    println!(
        "{} of {} candidates available{}{}",
        outcome.available,
        outcome.total,
        if outcome.from_cache { " (cached)" } else { "" },
        if outcome.cancelled { " (cancelled)" } else { "" },
    );
    for peer in &outcome.peers {
        println!(
            "{:>6} ms  {}  {}",
            peer.rtt_ms,
            peer.address,
            peer.region.as_deref().unwrap_or("-")
        );
    }
}

async fn run(config: Arc<ConfigStore>) -> anyhow::Result<()> {
    let host = ServiceHost::new(config, Arc::new(TcpEngineFactory));
    let mut status = host.subscribe_status();
    let manager = host.launch().await.context("failed to start service")?;
    tracing::info!("Service running, press Ctrl+C to stop");

    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Received shutdown signal, beginning graceful shutdown...");
                break;
            }
            update = status.recv() => {
                if let Some(update) = update {
                    if update.state == ServiceState::Error {
                        tracing::error!(
                            "Service failed: {}",
                            update.error.unwrap_or_default()
                        );
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                for stats in manager.peer_stats().await {
                    tracing::info!(
                        "{} enabled={} connected={} latency={:?}ms rx={}B tx={}B{}",
                        stats.address,
                        stats.enabled,
                        stats.connected,
                        stats.latency_ms,
                        stats.rx_bytes,
                        stats.tx_bytes,
                        stats
                            .last_error
                            .map(|e| format!(" error={}", e))
                            .unwrap_or_default()
                    );
                }
            }
        }
    }

    if manager.status() == ServiceState::Running {
        manager.soft_stop().await?;
    }
    manager.close().await?;
    tracing::info!("Shutdown complete");
    Ok(())
}
