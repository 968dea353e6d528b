use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum_server::Handle;
use blob_store::Backends;
use file_repo::{migrations, FileRepo};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::{self, signal};
use tracing::{error, info};

use crate::{
    config::ServerConfig,
    routes::{create_routes, RouteState},
};

#[derive(Clone)]
pub struct Service {
    pub config: ServerConfig,
    pub repo: FileRepo,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let repo = open_repo(&config).await?;
        Ok(Self { config, repo })
    }

    pub async fn start(&self) -> Result<()> {
        let route_state = RouteState {
            repo: self.repo.clone(),
        };

        let handle = Handle::new();
        let handle_sh = handle.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!(
            backends = ?self.repo.backends().names(),
            default_backend = self.repo.backends().default_name(),
            "server api listening on {}",
            self.config.listen_addr
        );
        axum_server::bind(addr)
            .handle(handle)
            .serve(create_routes(route_state).into_make_service())
            .await?;

        Ok(())
    }
}

pub async fn connect_db(config: &ServerConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_db_connections)
        .connect(&config.database_url)
        .await
        .context("error connecting to database")
}

/// Connects, brings the schema up to date and builds the configured
/// backends. Shared by the server and the maintenance commands.
pub async fn open_repo(config: &ServerConfig) -> Result<FileRepo> {
    let pool = connect_db(config).await?;
    migrations::run(&pool)
        .await
        .context("error running schema migrations")?;
    let backends = Backends::from_configs(config.backend_configs()?, &config.default_backend)
        .await
        .context("error initializing backends")?;
    Ok(FileRepo::new(pool, backends))
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install signal handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.graceful_shutdown(None);
    info!("signal received, shutting down server gracefully");
}
