mod cache;
mod config;
mod controller;
mod datastore;
mod errors;
mod ids;
mod media;
mod processor;
mod response;
mod routes;
mod startup;
mod storage;
mod store;
mod thumbnail;
mod utils;

#[cfg(test)]
mod tests;

#[macro_use]
extern crate tracing;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use mimalloc::MiMalloc;
use poem::listener::TcpListener;
use poem::Server;
use tracing_subscriber::filter::LevelFilter;

use crate::config::RuntimeConfig;
use crate::errors::TracingReporter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Debug, Parser)]
#[clap(author, version, about)]
pub struct ServerConfig {
    #[clap(short, long, default_value = "127.0.0.1", env = "HOST")]
    /// The binding host address of the server.
    host: String,

    #[clap(short, long, default_value = "8000", env = "PORT")]
    port: u16,

    #[clap(long, default_value = "http://127.0.0.1:8000", env = "DOCS_URL")]
    /// The external URL the server is reachable at, used for the API docs.
    docs_url: String,

    #[clap(long, default_value = "info", env = "LOG_LEVEL")]
    /// The log level filter, any logs that are above this level wont
    /// be displayed.
    log_level: LevelFilter,

    #[clap(long, env = "CONFIG_FILE")]
    /// The file path to a given config file.
    ///
    /// This can be either a JSON formatted config or YAML.
    config_file: PathBuf,

    #[clap(long, env = "MACHINE_ID")]
    /// Overrides the `machine_id` set in the config file.
    machine_id: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: ServerConfig = ServerConfig::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    let mut cfg = RuntimeConfig::from_file(&args.config_file)?;
    if let Some(machine_id) = args.machine_id {
        cfg.machine_id = machine_id;
    }

    let controller = match startup::bootstrap(cfg, Arc::new(TracingReporter)).await {
        Ok(controller) => controller,
        Err(e) => {
            error!("Startup aborted: {}", e);
            return Err(e.into());
        },
    };

    let app = routes::build_app(controller, &args.docs_url);

    let bind = format!("{}:{}", args.host, args.port);
    info!("Media repository is listening on {}", bind);

    Server::new(TcpListener::bind(bind))
        .run_with_graceful_shutdown(
            app,
            async move {
                let _ = wait_for_signal().await;
            },
            Some(Duration::from_secs(2)),
        )
        .await?;

    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Shutting down, waiting for in-flight requests");
    Ok(())
}
