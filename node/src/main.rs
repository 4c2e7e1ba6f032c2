use anyhow::{Context, Result};
use arbor_network::{metrics as network_metrics, HttpPeerTransport, Node, PeerTransport};
use arbor_rpc::{bind_listener, serve, AppState};
use arbor_storage::Database;
use arbor_types::create_address;
use clap::{value_parser, Arg, ArgAction, Command};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod settings;
mod version;

use settings::{AppConfig, LogFormat, LoggingConfig, MetricsConfig, StorageBackend};
use version::{version_line, ARBOR_VERSION};

fn build_cli() -> Command {
    Command::new("arbor-node")
        .version(ARBOR_VERSION)
        .about("Self-organizing peer network node")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .value_name("DIR")
                .value_parser(value_parser!(PathBuf))
                .help("Data directory"),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOST")
                .help("Host other nodes reach this node at"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .value_parser(value_parser!(u16))
                .help("HTTP port"),
        )
        .arg(
            Arg::new("initial-address")
                .short('i')
                .long("initial-address")
                .value_name("HOST:PORT")
                .action(ArgAction::Append)
                .help("Address asked for registration candidates (repeatable)"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Override the log filter"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(value_parser!(LogFormat))
                .help("Select log output format"),
        )
        .arg(
            Arg::new("memory-storage")
                .long("memory-storage")
                .action(ArgAction::SetTrue)
                .help("Keep all state in memory"),
        )
        .arg(
            Arg::new("print-config")
                .long("print-config")
                .action(ArgAction::SetTrue)
                .help("Print the effective configuration as TOML and exit"),
        )
}

fn apply_overrides(matches: &clap::ArgMatches, config: &mut AppConfig) {
    if let Some(data_dir) = matches.get_one::<PathBuf>("data-dir") {
        config.data_dir = data_dir.clone();
    }

    if let Some(host) = matches.get_one::<String>("host") {
        config.network.host = host.clone();
    }

    if let Some(port) = matches.get_one::<u16>("port") {
        config.network.port = *port;
    }

    if let Some(addresses) = matches.get_many::<String>("initial-address") {
        config.network.initial_addresses = addresses.cloned().collect();
    }

    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.logging.level = log_level.clone();
    }

    if let Some(log_format) = matches.get_one::<LogFormat>("log-format") {
        config.logging.format = *log_format;
    }

    if matches.get_flag("memory-storage") {
        config.storage.backend = StorageBackend::Memory;
    }
}

fn load_config_with_overrides(matches: &clap::ArgMatches) -> Result<AppConfig> {
    let config_path = matches.get_one::<PathBuf>("config");
    let mut config = AppConfig::load(config_path.map(PathBuf::as_path))?;
    apply_overrides(matches, &mut config);
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    let config = load_config_with_overrides(&matches)?;

    if matches.get_flag("print-config") {
        println!(
            "{}",
            toml::to_string_pretty(&config).context("failed to render configuration")?
        );
        return Ok(());
    }

    init_logging(&config.logging)?;
    info!("Starting {}", version_line());
    let metrics = init_metrics(&config.metrics);

    let storage = config
        .storage_config()
        .open()
        .context("failed to open storage")?;
    let transport: Arc<dyn PeerTransport> = Arc::new(HttpPeerTransport::new(
        config.network.request_timeout,
        config.network.auth.clone(),
    )?);
    let node = Arc::new(Node::new(config.node_config(), Database::new(storage), transport)?);
    node.init()?;
    info!(
        "Node {} ready ({} initial addresses)",
        node.address(),
        config.network.initial_addresses.len()
    );

    let bind_addr = create_address(&config.network.host, config.network.port);
    let listener = bind_listener(&bind_addr).await?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let sync_task = spawn_periodic("sync", config.network.sync_interval, stop_rx.clone(), {
        let node = node.clone();
        move || {
            let node = node.clone();
            async move {
                if let Err(err) = node.sync().await {
                    warn!("Sync failed: {}", err);
                }
            }
        }
    });
    let normalize_task = spawn_periodic(
        "normalize",
        config.storage.normalize_interval,
        stop_rx,
        {
            let node = node.clone();
            move || {
                let node = node.clone();
                async move { node.normalize() }
            }
        },
    );

    let state = AppState {
        node: node.clone(),
        metrics,
    };
    let served = serve(state, listener, shutdown_signal()).await;
    if let Err(err) = &served {
        error!("HTTP server failed: {:#}", err);
    }

    info!("Shutting down");
    let _ = stop_tx.send(true);
    for task in [sync_task, normalize_task] {
        if let Err(err) = task.await {
            warn!("Background task ended abnormally: {}", err);
        }
    }
    node.deregister()?;
    node.deinit()?;
    served
}

/// Run `task` every `period` until `stop` flips.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut stop: watch::Receiver<bool>,
    task: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => task().await,
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("{} task stopped", name);
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn init_metrics(config: &MetricsConfig) -> Option<PrometheusHandle> {
    if !config.enabled {
        info!("Prometheus metrics exporter disabled via configuration");
        return None;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            info!("Prometheus metrics exporter registered");
            network_metrics::describe();
            Some(handle)
        }
        Err(err) => {
            warn!("Failed to install Prometheus metrics exporter: {}", err);
            None
        }
    }
}

fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init(),
    }
    .context("failed to initialise logging")
}
