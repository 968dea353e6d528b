use std::{path::PathBuf, process::ExitCode};

use ::tracing::{error, info, info_span, Instrument};
use clap::{Parser, Subcommand};
use service::Service;

mod cleanup;
mod config;
mod http_objects;
mod integration_test;
mod migrator;
mod routes;
mod service;
mod tracing;
use tracing::setup_tracing;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API (the default)
    Serve,
    /// Move every file outside the default backend into it
    Migrate {
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
        /// Delete the source object of each migrated file
        #[arg(long)]
        delete: bool,
        /// Only migrate files whose name starts with this prefix
        #[arg(long, default_value = "")]
        prefix: String,
    },
    /// Delete the external objects of deleted files
    Cleanup {
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },
}

async fn run(command: Command, config: config::ServerConfig) -> anyhow::Result<ExitCode> {
    match command {
        Command::Serve => {
            let service = Service::new(config).await?;
            service.start().await?;
        }
        Command::Migrate {
            concurrency,
            delete,
            prefix,
        } => {
            let repo = service::open_repo(&config).await?;
            let report = migrator::Migrator::new(repo, concurrency, delete, &prefix)
                .run()
                .await?;
            if report.errors > 0 {
                error!(errors = report.errors, "migration finished with errors");
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Cleanup { concurrency } => {
            let repo = service::open_repo(&config).await?;
            let report = cleanup::run(&repo, concurrency).await?;
            info!(deleted = report.deleted, failed = report.failed, "cleanup done");
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match config::ServerConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error loading config: {:?}", err);
            return ExitCode::FAILURE;
        }
    };

    let tracing_provider = match setup_tracing(&config) {
        Ok(provider) => provider,
        Err(err) => {
            eprintln!("Error setting up tracing: {:?}", err);
            return ExitCode::FAILURE;
        }
    };

    let command = cli.command.unwrap_or(Command::Serve);
    let root_span = info_span!("blobstore", listen_addr = %config.listen_addr);
    let code = match run(command, config).instrument(root_span).await {
        Ok(code) => code,
        Err(err) => {
            error!("Error running blobstore: {:?}", err);
            ExitCode::FAILURE
        }
    };

    // export traces before shutdown
    if let Some(tracer_provider) = tracing_provider {
        if let Err(err) = tracer_provider.force_flush() {
            error!("Error flushing traces: {:?}", err);
        }
        if let Err(err) = tracer_provider.shutdown() {
            error!("Error shutting down tracer provider: {:?}", err);
        }
    }
    code
}
