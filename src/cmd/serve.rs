//! Server commands: `iac-runner serve` and `iac-runner init-db`.

use anyhow::Result;
use std::path::PathBuf;

use iac_runner::config::AppConfig;
use iac_runner::jobs::server::{self, ServerConfig};
use iac_runner::jobs::service::JobService;

pub async fn cmd_serve(
    mut config: AppConfig,
    port: Option<u16>,
    host: Option<String>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(db_path) = db_path {
        config.database.path = db_path;
    }
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    let mut server_config = ServerConfig::from(&config);
    server_config.permissive_cors = dev;
    server::start_server(&config, server_config).await
}

pub fn cmd_init_db(mut config: AppConfig, db_path: Option<PathBuf>) -> Result<()> {
    if let Some(db_path) = db_path {
        config.database.path = db_path;
    }
    JobService::from_config(&config)?;
    println!("Job database initialized at {}", config.database.path.display());
    Ok(())
}
