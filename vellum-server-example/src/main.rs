use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::Context as _;
use tokio_util::sync::CancellationToken;
use vellum_server::config::CollabServiceConfig;
use vellum_server::storage::postgres::PostgresStorage;
use vellum_server::storage::StorageService;
use vellum_server::CollabServiceBuilder;

/// The configuration for the example collaboration server.
///
/// It can be configured via environment variables or command line arguments
/// using `clap`.
#[derive(Parser, Debug)]
pub struct ExampleServerConfig {
    /// The bind addr of the AXUM server.
    #[clap(long, env = "VELLUM_BIND_ADDR", default_value = "0.0.0.0:4330")]
    pub bind_addr: SocketAddr,

    /// Max wait time the service waits for the final flush during shutdown.
    #[clap(
        long,
        env = "VELLUM_MAX_WAIT_TIME_SHUTDOWN",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub max_wait_time_shutdown: Duration,

    /// The collaboration service config.
    #[clap(flatten)]
    pub service_config: CollabServiceConfig,
}

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vellum_server_example=debug,vellum_server=debug,info".into()),
        )
        .init();

    let config = ExampleServerConfig::parse();
    tracing::info!(
        "{} {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    tracing::info!("init postgres storage..");
    let storage: StorageService = Arc::new(
        PostgresStorage::init(
            &config.service_config.db_connection_string,
            config.service_config.db_max_connections,
        )
        .await
        .context("while starting postgres storage")?,
    );

    match start_service(config, storage).await {
        Ok(()) => {
            tracing::info!("good night!");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            // we don't want to double print the error therefore we just return FAILURE
            tracing::error!("{err:?}");
            Ok(ExitCode::FAILURE)
        }
    }
}

pub async fn start_service(
    config: ExampleServerConfig,
    storage: StorageService,
) -> eyre::Result<()> {
    let cancellation_token = CancellationToken::new();
    spawn_shutdown_task(cancellation_token.clone());

    tracing::info!("init collaboration service..");
    let (router, hooks) = CollabServiceBuilder::init(
        config.service_config,
        storage,
        cancellation_token.clone(),
    )
    .build();

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .context("while binding listener")?;
    tracing::info!(
        "starting axum server on {}",
        listener
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or(String::from("invalid addr"))
    );
    let axum_shutdown_token = cancellation_token.clone();
    let server = tokio::spawn(async move {
        let axum_result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { axum_shutdown_token.cancelled().await })
        .await;
        tracing::info!("axum server shutdown");
        if let Err(err) = axum_result {
            tracing::error!("got error from axum: {err:?}");
        }
    });

    tracing::info!("everything started successfully - now waiting for shutdown...");
    cancellation_token.cancelled().await;

    tracing::info!(
        "waiting for shutdown of services (max wait time {:?})..",
        config.max_wait_time_shutdown
    );
    match tokio::time::timeout(config.max_wait_time_shutdown, async move {
        let _ = server.await;
        hooks.shutdown().await;
    })
    .await
    {
        Ok(()) => tracing::info!("successfully finished shutdown in time"),
        Err(_) => tracing::warn!("could not finish shutdown in time"),
    }
    Ok(())
}

/// Cancels the token on SIGINT or SIGTERM.
fn spawn_shutdown_task(cancellation_token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("could not install ctrl-c handler: {err:?}");
            }
        };
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(err) => tracing::error!("could not install SIGTERM handler: {err:?}"),
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
        tracing::info!("shutdown signal received");
        cancellation_token.cancel();
    });
}
