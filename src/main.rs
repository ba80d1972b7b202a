use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

mod config;
mod db;
mod error;
mod fetch;
mod gateway;
mod models;
mod notify;
mod poller;
mod report;
mod risk;

use config::{AppConfig, ObservationSource};
use db::Cache;
use fetch::{Fetcher, FrostClient, MetNoClient};
use gateway::RiskGateway;
use models::ContentKey;
use notify::{Broker, DangerTier, MqttBroker, Notifier};
use poller::{Poller, PollerHandle, PollerSettings};
use risk::MoistureModel;

#[derive(Parser)]
#[command(name = "frcm-worker")]
#[command(about = "Scheduled fire risk harvester with cached computation and MQTT alerts", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults apply when it does not exist
    #[arg(long, global = true, default_value = "frcm.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the cache schema
    InitDb,
    /// Poll every configured location until interrupted
    Run,
    /// Run a single polling cycle and exit
    Once,
    /// Compute fire risk for observations in a CSV file
    Compute {
        #[arg(long)]
        csv: PathBuf,
        /// Skip the cache and always recompute
        #[arg(long)]
        no_cache: bool,
    },
    /// Summarize a cached observation set and its risk series
    Show { key: String },
    /// Print cache row counts
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "frcm_worker=info".into()),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    let cache = open_cache(&cfg)
        .await
        .with_context(|| format!("failed to open cache at {}", cfg.database_path.display()))?;

    let outcome = match cli.command {
        Commands::InitDb => {
            cache.init_db().await?;
            println!("Schema ready at {}.", cfg.database_path.display());
            Ok(())
        }
        Commands::Run => run_scheduled(&cfg, cache.clone(), true).await,
        Commands::Once => run_scheduled(&cfg, cache.clone(), false).await,
        Commands::Compute { csv, no_cache } => {
            compute_csv(&cfg, cache.clone(), &csv, !no_cache).await
        }
        Commands::Show { key } => show(&cache, key).await,
        Commands::Stats => {
            let stats = cache.stats().await?;
            println!(
                "{} observation sets, {} risk series",
                stats.observation_sets, stats.risk_series
            );
            Ok(())
        }
    };

    cache.close().await;
    outcome
}

async fn open_cache(cfg: &AppConfig) -> error::Result<Cache> {
    match cfg.database_path.to_str() {
        Some(url) if url.starts_with("sqlite:") => Cache::connect(url).await,
        _ => Cache::open(&cfg.database_path).await,
    }
}

fn build_notifier(cfg: &AppConfig) -> (Notifier, Option<Arc<MqttBroker>>) {
    if !cfg.notification.enabled {
        return (Notifier::disabled(), None);
    }

    let broker = Arc::new(MqttBroker::connect(&cfg.notification));
    info!(
        broker = format!(
            "{}:{}",
            cfg.notification.broker_host, cfg.notification.broker_port
        ),
        topic = %cfg.notification.topic,
        "notifications enabled"
    );
    let notifier = Notifier::new(broker.clone(), cfg.notification.topic.clone());
    (notifier, Some(broker))
}

fn spawn_shutdown_listener(handle: PollerHandle) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut terminate) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = terminate.recv() => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "SIGTERM handler unavailable, listening for ctrl-c only");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        info!("received shutdown signal, stopping after the current cycle");
        handle.stop();
    });
}

async fn run_scheduled(cfg: &AppConfig, cache: Cache, continuous: bool) -> anyhow::Result<()> {
    let locations = config::load_locations(&cfg.locations_file).with_context(|| {
        format!(
            "failed to load locations from {}",
            cfg.locations_file.display()
        )
    })?;
    info!(
        count = locations.len(),
        file = %cfg.locations_file.display(),
        source = ?cfg.source,
        "loaded locations"
    );

    match cfg.source {
        ObservationSource::Forecast => {
            let fetcher = MetNoClient::new(&cfg.met_user_agent)?;
            poll(cfg, fetcher, cache, locations, continuous).await
        }
        ObservationSource::Frost => {
            let client_id = cfg.frost_client_id.as_deref().unwrap_or_default();
            let fetcher = FrostClient::new(client_id, &cfg.met_user_agent)?;
            poll(cfg, fetcher, cache, locations, continuous).await
        }
    }
}

async fn poll<F: Fetcher>(
    cfg: &AppConfig,
    fetcher: F,
    cache: Cache,
    locations: Vec<models::Location>,
    continuous: bool,
) -> anyhow::Result<()> {
    let gateway = RiskGateway::new(cache, MoistureModel::default());
    let (notifier, broker) = build_notifier(cfg);
    let settings = PollerSettings {
        interval: Duration::from_secs(cfg.update_interval_secs),
        horizon_hours: cfg.horizon_hours,
        use_cache: cfg.use_cache,
        output_dir: cfg.output_dir.clone(),
    };
    let mut poller = Poller::new(fetcher, gateway, locations, &notifier, settings);

    let result = if continuous {
        spawn_shutdown_listener(poller.handle());
        poller.run().await;
        Ok(())
    } else {
        poller.run_cycle().await.map(|report| {
            for (name, outcome) in &report.succeeded {
                let latest = match (outcome.latest_ttf, outcome.tier) {
                    (Some(ttf), Some(tier)) => format!("{ttf:.2} min ({tier})"),
                    _ => "no risk points".to_string(),
                };
                println!("- {name}: {} points, latest ttf {latest}", outcome.points);
                if let Some(transition) = outcome.transition {
                    println!("  danger tier changed to {transition}");
                }
            }
            for (name, err) in &report.failed {
                println!("- {name}: failed ({err})");
            }
        })
    };

    if let Some(broker) = broker {
        if let Err(e) = broker.disconnect().await {
            error!(error = %e, "failed to disconnect from MQTT broker");
        }
    }

    result.map_err(Into::into)
}

async fn compute_csv(
    cfg: &AppConfig,
    cache: Cache,
    csv: &std::path::Path,
    use_cache: bool,
) -> anyhow::Result<()> {
    let (set, dropped) = report::import_observations_csv(csv)
        .with_context(|| format!("failed to read {}", csv.display()))?;
    if dropped > 0 {
        warn!(dropped, "dropped observations with missing measurements");
    }
    anyhow::ensure!(
        !set.is_empty(),
        "{} contains no complete observations",
        csv.display()
    );

    let gateway = RiskGateway::new(cache, MoistureModel::default());
    let series = gateway.compute(&set, use_cache).await?;

    if use_cache {
        let stats = gateway.cache().stats().await?;
        println!(
            "Key {} ({} observation sets cached)",
            set.fingerprint(),
            stats.observation_sets
        );
    }
    if series.is_empty() {
        println!("Model returned no risk points.");
    }
    for point in &series.points {
        println!(
            "{} ttf {:.2} min {}",
            point.timestamp.to_rfc3339(),
            point.ttf,
            DangerTier::classify(point.ttf)
        );
    }

    if let Some(dir) = &cfg.output_dir {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("firerisk.csv");
        report::write_risk_csv(&path, &series)?;
        println!("Risk series written to {}.", path.display());
    }

    Ok(())
}

async fn show(cache: &Cache, key: String) -> anyhow::Result<()> {
    let key = ContentKey::from(key.trim().to_lowercase());
    let Some(set) = cache.get_observations(&key).await? else {
        anyhow::bail!("no observation set cached under {key}");
    };
    let series = cache.get_risk(&key).await?;
    print!("{}", report::build_summary(&key, &set, series.as_ref()));
    Ok(())
}
