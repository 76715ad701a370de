use std::{net::SocketAddr, process::ExitCode};

use args::Args;
use clap::Parser;
use config::Config;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

mod args;
mod logger;

const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:8484";

const EXIT_INIT_FAILURE: u8 = 1;
const EXIT_RUNTIME_FAILURE: u8 = 2;

fn main() -> ExitCode {
    let args = Args::parse();

    logger::init(&args.log);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("failed to start async runtime: {e}");
            return ExitCode::from(EXIT_INIT_FAILURE);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Init(e)) => {
            log::error!("initialization failed: {e:#}");
            ExitCode::from(EXIT_INIT_FAILURE)
        }
        Err(RunError::Runtime(e)) => {
            log::error!("fatal runtime error: {e:#}");
            ExitCode::from(EXIT_RUNTIME_FAILURE)
        }
    }
}

enum RunError {
    /// Configuration or startup failure (exit code 1).
    Init(anyhow::Error),
    /// Failure after the server was up (exit code 2).
    Runtime(anyhow::Error),
}

async fn run(args: Args) -> Result<(), RunError> {
    let config = Config::load(&args.config).map_err(RunError::Init)?;

    let listen_address: SocketAddr = args
        .listen
        .or(config.server.listen_address)
        .unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.parse().expect("default listen address is valid"));

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let server = llm::build_server(&config, shutdown.clone())
        .await
        .map_err(RunError::Init)?;

    let app = llm::router(server.clone(), &config.server.health);

    let listener = TcpListener::bind(listen_address)
        .await
        .map_err(|e| RunError::Init(anyhow::anyhow!("failed to bind to {listen_address}: {e}")))?;

    log::info!("Prism {} listening on http://{listen_address}", env!("CARGO_PKG_VERSION"));
    log::info!("work mode: {}", config.llm.work_mode);

    let result = tokio::select! {
        result = axum::serve(listener, app) => result.map_err(|e| RunError::Runtime(e.into())),
        _ = shutdown.cancelled() => {
            log::info!("received shutdown signal, shutting down gracefully");
            Ok(())
        }
    };

    // Stop background tasks and drain the usage ledger before exiting.
    shutdown.cancel();
    server.shutdown().await;

    result
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("failed to listen for ctrl-c: {e}");
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => log::error!("failed to listen for SIGTERM: {e}"),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }

        shutdown.cancel();
    });
}
