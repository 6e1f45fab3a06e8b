//! Courier CDC consumer daemon.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use courier_bus::{BusConsumer, KafkaBusConsumer, RECONNECT_BACKOFF};
use courier_consumer::{
    find_initsync_window, run_initsync, Applier, BoxedTarget, ConsumerState, NullTarget,
};
use courier_core::ctl::{self, CtlRequest, CtlResponse};
use courier_core::{Alerter, CacheDir, Pkey, Value};

mod config;

use config::{ClientConfig, TargetKind};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "courier-client", version, about = "Courier CDC consumer")]
struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the consumer daemon.
    Run,
    /// Send a command to a running daemon's control socket.
    Ctl {
        /// Command words, e.g. `status` or `flush-errorqueue`.
        #[arg(required = true)]
        words: Vec<String>,
    },
}

fn init_logging(config: &ClientConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.courier.log_level.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

fn build_target(kind: TargetKind) -> BoxedTarget {
    match kind {
        TargetKind::Null => Arc::new(NullTarget),
    }
}

async fn run(config: ClientConfig) -> anyhow::Result<()> {
    info!("starting courier-client v{VERSION}");

    let cache_dir = CacheDir::open(&config.courier.cache_dir)?
        .with_backup_count(config.courier.cache.backup_count)
        .with_compression(config.courier.cache.compress);
    let state = ConsumerState::load(cache_dir)?;
    let alerter = Alerter::new(config.courier.mail.clone());
    let target = build_target(config.client.target);
    let settings = config.client.settings.clone();
    let mut applier = Applier::new(state, target, settings.clone(), alerter)?;

    let consumer = KafkaBusConsumer::new(&config.courier.bus.kafka)?;
    let poll_timeout = Duration::from_secs(settings.update_interval_secs);

    // A consumer with no applied initsync bootstraps from a sequence on
    // the bus before processing deltas.
    while !applier.state.has_initialized() {
        info!("no completed initsync yet, scanning the bus");
        match find_initsync_window(
            &consumer,
            settings.use_first_initsync_sequence,
            poll_timeout,
        )
        .await
        {
            Ok(Some(window)) => {
                match run_initsync(&mut applier, &consumer, window, poll_timeout).await {
                    Ok(()) => break,
                    Err(e) if e.is_transient() => {
                        warn!(error = %e, "initsync replay failed, rescanning");
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(None) => {
                info!("no initsync sequence available on the bus, retrying");
                tokio::time::sleep(poll_timeout).await;
            }
            Err(e) => {
                warn!(error = %e, "bus scan failed, retrying");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
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

    // Resume deltas from the persisted offset.
    if let Some(next) = applier.state.offsets.next {
        consumer.seek(next).await?;
    }

    let retry_period = Duration::from_secs(settings.error_queue_retry_interval_mins.max(1) * 60);
    let purge_period = Duration::from_secs(settings.trashbin_purge_interval_mins.max(1) * 60);
    let mut retry_tick = interval_at(Instant::now() + retry_period, retry_period);
    let mut purge_tick = interval_at(Instant::now() + purge_period, purge_period);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut paused = false;
    let mut dirty = false;

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
                let response = handle_ctl(&mut applier, &mut paused, &mut stop, request).await;
                let _ = reply.send(response);
                if stop {
                    break;
                }
            }
            _ = retry_tick.tick() => {
                if !paused && !applier.queue.is_empty() {
                    match applier.retry_queue().await {
                        Ok(drained) => {
                            if drained > 0 {
                                info!(drained, "error queue retry pass completed");
                            }
                            dirty = true;
                        }
                        Err(e) => warn!(error = %e, "error queue retry pass failed"),
                    }
                }
            }
            _ = purge_tick.tick() => {
                if !paused {
                    match applier.purge_trashbin().await {
                        Ok(purged) => {
                            if purged > 0 {
                                info!(purged, "trashbin purge completed");
                                dirty = true;
                            }
                        }
                        Err(e) => warn!(error = %e, "trashbin purge failed"),
                    }
                }
            }
            polled = consumer.poll(poll_timeout), if !paused => {
                match polled {
                    Ok(Some(message)) => {
                        if let Err(e) = applier.handle_message(&message, false).await {
                            if e.is_transient() {
                                warn!(error = %e, "apply failed, re-polling after backoff");
                                tokio::time::sleep(RECONNECT_BACKOFF).await;
                            } else {
                                error!(error = %e, "fatal apply error, exiting");
                                applier.save().await?;
                                return Err(e.into());
                            }
                        } else {
                            dirty = true;
                        }
                    }
                    Ok(None) => {
                        // Bus idle: persist accumulated changes.
                        if dirty {
                            applier.save().await?;
                            dirty = false;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "bus poll failed, backing off");
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                    }
                }
            }
        }
    }

    // Finish by persisting everything we have applied.
    applier.save().await?;
    info!("courier-client stopped");
    Ok(())
}

async fn handle_ctl(
    applier: &mut Applier,
    paused: &mut bool,
    stop: &mut bool,
    request: CtlRequest,
) -> CtlResponse {
    match request {
        CtlRequest::Status => {
            let status = serde_json::json!({
                "initialized": applier.state.has_initialized(),
                "next_offset": applier.state.offsets.next,
                "errorqueue": applier.queue.counts_by_type(),
                "errorqueue_total": applier.queue.len(),
                "trashbin": applier
                    .state
                    .trashbin
                    .iter()
                    .map(|(entity, bin)| (entity.clone(), bin.len()))
                    .collect::<std::collections::BTreeMap<_, _>>(),
            });
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
        CtlRequest::FlushErrorQueue => match applier.retry_queue().await {
            Ok(drained) => CtlResponse::ok(format!("{drained} queued events drained")),
            Err(e) => CtlResponse::error(e.to_string()),
        },
        CtlRequest::Inspect { entity, pkey } => {
            let key = parse_pkey(&pkey);
            match applier.state.object_or_trashed(&entity, &key) {
                Some(obj) => match serde_json::to_string_pretty(&obj) {
                    Ok(json) => CtlResponse::ok(json),
                    Err(e) => CtlResponse::error(e.to_string()),
                },
                None => CtlResponse::error(format!("{entity}[{pkey}] not found")),
            }
        }
        CtlRequest::Reinit => {
            CtlResponse::error("command is only available on courier-server")
        }
        CtlRequest::Quit => {
            *stop = true;
            CtlResponse::ok("")
        }
    }
}

/// Interpret a pkey argument: integer when it parses, string otherwise.
fn parse_pkey(raw: &str) -> Pkey {
    match raw.parse::<i64>() {
        Ok(int) => Pkey::Single(Value::Integer(int)),
        Err(_) => Pkey::Single(Value::String(raw.to_string())),
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    let path = ClientConfig::resolve_path(cli.config.clone());

    let config = match ClientConfig::from_file(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return std::process::ExitCode::from(2);
        }
    };

    match cli.command {
        Command::Run => {
            init_logging(&config);
            match run(config).await {
                Ok(()) => std::process::ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = %e, "courier-client failed");
                    std::process::ExitCode::from(2)
                }
            }
        }
        Command::Ctl { words } => {
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
