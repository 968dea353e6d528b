use std::{fmt::Debug, net::SocketAddr, path::Path};

use anyhow::{anyhow, Context, Result};
use blob_store::{parse_backend_env, BackendConfig};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Keys that may be overridden from the environment.
const ENV_KEYS: [&str; 5] = [
    "listen_addr",
    "database_url",
    "max_db_connections",
    "default_backend",
    "structured_logging",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    // Export spans over OTLP.
    pub enable_tracing: bool,
    // OTLP collector endpoint, the exporter default when unset.
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub database_url: String,
    pub max_db_connections: u32,
    pub default_backend: String,
    pub structured_logging: bool,
    pub telemetry: TelemetryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: "0.0.0.0:3001".to_string(),
            database_url: "postgres://localhost/blobstore".to_string(),
            max_db_connections: 20,
            default_backend: data_model::POSTGRES_BACKEND.to_string(),
            structured_logging: false,
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults, then the YAML file at `path`, then the environment.
    pub fn load(path: Option<&Path>) -> Result<ServerConfig> {
        let mut figment = Figment::from(Serialized::defaults(ServerConfig::default()));
        if let Some(path) = path {
            let config_str = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            figment = figment.merge(Yaml::string(&config_str));
        }
        let config: ServerConfig = figment
            .merge(Env::raw().only(&ENV_KEYS))
            .extract()
            .context("parsing configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!("invalid listen address: {}", self.listen_addr));
        }
        if self.database_url.is_empty() {
            return Err(anyhow!("database_url must be set"));
        }
        if self.max_db_connections == 0 {
            return Err(anyhow!("max_db_connections must be at least 1"));
        }
        if self.default_backend.is_empty() {
            return Err(anyhow!("default_backend must be set"));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.structured_logging
    }

    /// Backend definitions from the `BACKEND_*` environment entries.
    pub fn backend_configs(&self) -> Result<Vec<BackendConfig>> {
        parse_backend_env(std::env::vars()).context("parsing BACKEND_* entries")
    }
}
