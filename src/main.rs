//!
//! irods-mcp-gate binary
//! ---------------------
//! Starts the gate on the local channel (default) or over HTTP (`--remote`).
//! Configuration comes from defaults, `IRODS_MCP_SVR_*`/`IRODS_*` environment variables,
//! an optional JSON file (`--config`) and flags, in that order.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use irods_mcp_gate::backend::MemoryConnector;
use irods_mcp_gate::config::GateConfig;
use irods_mcp_gate::paths::shared_path;

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
        if let Some(v) = args[i].strip_prefix(&format!("{}=", flag)) {
            return Some(v.to_string());
        }
        i += 1;
    }
    None
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn load_config(args: &[String]) -> Result<GateConfig> {
    let mut config = GateConfig::from_env(GateConfig::default())?;
    if let Some(path) = arg_value(args, "--config") {
        config = GateConfig::from_json_file(config, &path)?;
    }
    if has_flag(args, "--remote") {
        config.remote = true;
    }
    if has_flag(args, "--debug") {
        config.debug = true;
    }
    if let Some(p) = arg_value(args, "--log_path") {
        config.log_path = Some(p);
    }
    Ok(config)
}

/// Logs go to stderr (stdout carries the local channel) and, with `log_path`, to that file.
fn init_logging(config: &GateConfig) -> Result<()> {
    let default_level = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;

    let file_layer = match config.log_path.as_deref().filter(|p| !p.is_empty()) {
        Some(path) => {
            if let Some(dir) = std::path::Path::new(path).parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir).with_context(|| format!("failed to create log dir {:?}", dir))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {:?}", path))?;
            Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = load_config(&args)?;
    init_logging(&config)?;

    info!(
        remote = config.remote,
        service_url = %config.service_url,
        zone = %config.backend.zone,
        proxy_auth = config.backend.proxy_auth,
        oauth2 = config.oauth2_enabled(),
        "irods-mcp-gate starting"
    );

    warn!("no storage wire protocol is linked in; serving the in-memory backend");
    let connector = MemoryConnector::new()
        .with_directory(&shared_path(&config.backend.zone, &config.backend.shared_dir_name));

    irods_mcp_gate::server::run(config, Arc::new(connector)).await
}
