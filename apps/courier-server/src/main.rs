//! Courier CDC producer daemon.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use courier_bus::{KafkaBusProducer, RECONNECT_BACKOFF};
use courier_connector::{
    ldap::{LdapConfig, LdapDatasource},
    sql::{PostgresConfig, PostgresDatasource},
    DatasourceRegistry, DriverKind, FilterRegistry,
};
use courier_core::{Alerter, CacheDir};
use courier_producer::ProducerEngine;

mod config;

use config::ServerConfig;
use courier_core::ctl::{self, CtlRequest, CtlResponse};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "courier-server", version, about = "Courier CDC producer")]
struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the producer daemon.
    Run,
    /// Send a command to a running daemon's control socket.
    Ctl {
        /// Command words, e.g. `status` or `pause`.
        #[arg(required = true)]
        words: Vec<String>,
    },
}

fn init_logging(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.courier.log_level.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

fn build_registry(config: &ServerConfig) -> anyhow::Result<DatasourceRegistry> {
    let mut registry = DatasourceRegistry::new();
    for (name, datasource) in &config.courier.datasources {
        match datasource.driver {
            DriverKind::Postgresql => {
                let settings: PostgresConfig =
                    serde_yaml::from_value(datasource.settings.clone())
                        .map_err(|e| anyhow::anyhow!("datasource '{name}': {e}"))?;
                registry.register(name.clone(), Arc::new(PostgresDatasource::new(&settings)?));
            }
            DriverKind::Ldap => {
                let settings: LdapConfig = serde_yaml::from_value(datasource.settings.clone())
                    .map_err(|e| anyhow::anyhow!("datasource '{name}': {e}"))?;
                registry.register(name.clone(), Arc::new(LdapDatasource::new(settings)?));
            }
        }
        info!(%name, driver = datasource.driver.as_str(), "datasource registered");
    }
    Ok(registry)
}

async fn run(config: ServerConfig) -> anyhow::Result<()> {
    info!("starting courier-server v{VERSION}");

    let registry = build_registry(&config)?;
    let bus = Arc::new(KafkaBusProducer::new(&config.courier.bus.kafka)?);
    let cache_dir = CacheDir::open(&config.courier.cache_dir)?
        .with_backup_count(config.courier.cache.backup_count)
        .with_compression(config.courier.cache.compress);
    let alerter = Alerter::new(config.courier.mail.clone());

    let mut engine = ProducerEngine::new(
        &config.server.datamodel,
        &registry,
        Arc::new(FilterRegistry::builtin()),
        bus,
        cache_dir,
        alerter,
    )?;

    // Reconcile pending schema changes before the first tick; transient
    // failures retry with the fixed bus backoff.
    loop {
        match engine.reconcile_schema().await {
            Ok(()) => break,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "schema reconciliation failed, retrying");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
            Err(e) => return Err(e.into()),
        }
    }

    let (ctl_tx, mut ctl_rx) = mpsc::channel(8);
    if let Some(path) = config.courier.cli_socket.clone() {
        tokio::spawn(async move {
            if let Err(e) = ctl::serve(path, ctl_tx).await {
                error!(error = %e, "control socket failed");
            }
        });
    }

    let interval = Duration::from_secs(config.server.update_interval_secs);
    let mut next_update = Instant::now();
    let mut paused = false;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, terminating");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, terminating");
                break;
            }
            Some((request, reply)) = ctl_rx.recv() => {
                let mut stop = false;
                let response = handle_ctl(&mut engine, &mut paused, &mut stop, request).await;
                let _ = reply.send(response);
                if stop {
                    break;
                }
            }
            _ = tokio::time::sleep_until(next_update) => {
                next_update += interval;
                if paused {
                    continue;
                }
                match engine.tick().await {
                    Ok(report) => {
                        if !report.skipped_types.is_empty() {
                            warn!(types = ?report.skipped_types, "types skipped this tick");
                        }
                    }
                    Err(e) if e.is_transient() => {
                        warn!(error = %e, "tick failed, will retry");
                        next_update = Instant::now() + RECONNECT_BACKOFF;
                    }
                    Err(e) => {
                        error!(error = %e, "fatal error, exiting");
                        return Err(e.into());
                    }
                }
            }
        }
    }

    info!("courier-server stopped");
    Ok(())
}

async fn handle_ctl(
    engine: &mut ProducerEngine,
    paused: &mut bool,
    stop: &mut bool,
    request: CtlRequest,
) -> CtlResponse {
    match request {
        CtlRequest::Status => {
            let status = engine.status();
            match serde_json::to_string_pretty(&status) {
                Ok(json) => CtlResponse::ok(json),
                Err(e) => CtlResponse::error(e.to_string()),
            }
        }
        CtlRequest::Pause => {
            if *paused {
                CtlResponse::error("already paused")
            } else {
                *paused = true;
                info!("processing paused");
                CtlResponse::ok("")
            }
        }
        CtlRequest::Resume => {
            if *paused {
                *paused = false;
                info!("processing resumed");
                CtlResponse::ok("")
            } else {
                CtlResponse::error("not paused")
            }
        }
        CtlRequest::Reinit => match engine.initsync().await {
            Ok(count) => CtlResponse::ok(format!("initsync sequence sent ({count} objects)")),
            Err(e) => CtlResponse::error(e.to_string()),
        },
        CtlRequest::Quit => {
            *stop = true;
            CtlResponse::ok("")
        }
        CtlRequest::FlushErrorQueue | CtlRequest::Inspect { .. } => {
            CtlResponse::error("command is only available on courier-client")
        }
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    let path = ServerConfig::resolve_path(cli.config.clone());

    match cli.command {
        Command::Run => {
            let config = match ServerConfig::from_file(&path) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("{e}");
                    return std::process::ExitCode::from(2);
                }
            };
            init_logging(&config);
            match run(config).await {
                Ok(()) => std::process::ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = %e, "courier-server failed");
                    std::process::ExitCode::from(2)
                }
            }
        }
        Command::Ctl { words } => {
            let config = match ServerConfig::from_file(&path) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("{e}");
                    return std::process::ExitCode::from(2);
                }
            };
            let Some(socket_path) = config.courier.cli_socket else {
                eprintln!("no cli_socket configured");
                return std::process::ExitCode::from(2);
            };
            let command = words.join(" ");
            let retcode = ctl::send_command(&socket_path, &command).await;
            std::process::ExitCode::from(retcode.clamp(0, 255) as u8)
        }
    }
}
