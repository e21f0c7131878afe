// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use edge_relay::config::{CliArgs, ConnConfig};
use edge_relay::core::{DestinationGate, Server, SourceGate};
use edge_relay::lists::{ListsConfig, LiveLists};
use edge_relay::logger::{self, log};
use edge_relay::server_runner;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse_args();
    cli.validate()?;

    logger::init_logger(&cli.log_mode);

    log::info!(
        address = %cli.listen_addr(),
        lists_file = ?cli.lists_file,
        "Starting edge relay"
    );

    let lists = ListsConfig::load_or_builtin(cli.lists_file.as_deref())?;
    let live = LiveLists::new(&lists);

    let source_gate = SourceGate::new(live.allowed_sources.clone());
    let destination_gate = DestinationGate::new(live.blocked_destinations.clone())
        .with_resolve_timeout(cli.resolve_timeout)
        .with_block_unresolved(cli.block_unresolved);

    let shutdown = CancellationToken::new();

    let server = Arc::new(
        Server::builder()
            .source_gate(source_gate)
            .destination_gate(destination_gate)
            .shared_target_policy(live.target_policy.clone())
            .conn_config(ConnConfig::from_cli(&cli))
            .shutdown(shutdown.clone())
            .build(),
    );

    spawn_signal_handlers(shutdown, live, cli.lists_file.clone());

    server_runner::run_server(server, &cli.listen_addr()).await
}

/// SIGINT/SIGTERM cancel `shutdown`; SIGHUP reloads the lists file
fn spawn_signal_handlers(shutdown: CancellationToken, live: LiveLists, lists_file: Option<PathBuf>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        tokio::spawn(async move {
            let (mut sigint, mut sigterm, mut sighup) = match (
                signal(SignalKind::interrupt()),
                signal(SignalKind::terminate()),
                signal(SignalKind::hangup()),
            ) {
                (Ok(int), Ok(term), Ok(hup)) => (int, term, hup),
                _ => {
                    log::error!("Failed to install signal handlers");
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = sigint.recv() => {
                        log::info!("SIGINT received, shutting down...");
                        break;
                    }
                    _ = sigterm.recv() => {
                        log::info!("SIGTERM received, shutting down...");
                        break;
                    }
                    _ = sighup.recv() => match &lists_file {
                        Some(path) => match live.reload(path) {
                            Ok(()) => log::info!(file = %path.display(), "Lists reloaded"),
                            Err(e) => log::warn!(error = %e, "Lists reload failed, keeping current lists"),
                        },
                        None => log::info!("SIGHUP received but no lists file configured"),
                    },
                }
            }

            shutdown.cancel();
        });
    }

    #[cfg(not(unix))]
    {
        let _ = (live, lists_file);
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            log::info!("Shutdown signal received...");
            shutdown.cancel();
        });
    }
}
