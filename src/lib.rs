pub mod backend;
pub mod config;
pub mod critic;
pub mod dispatcher;
pub mod error;
pub mod extractor;
pub mod io_struct;
pub mod recorder;
pub mod renderer;
pub mod routing;
pub mod server;
pub mod upstream;

use anyhow::Context;
use config::AppConfig;
use dispatcher::Dispatcher;
use std::time::Duration;
use tokio::signal;

/// Builds the dispatcher from `config` and serves until the server stops or Ctrl+C.
pub fn start(config: AppConfig) -> anyhow::Result<()> {
    config.validate().context("invalid configuration")?;
    server::init_logging(&config.server.log_level);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.server.timeout_secs))
        .build()
        .context("failed to build HTTP client")?;
    let dispatcher = Dispatcher::from_config(config.clone(), client);

    actix_web::rt::System::new().block_on(async move {
        tokio::select! {
            res = server::startup(config, dispatcher) => {
                res.context("server stopped")
            }
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down");
                Ok(())
            }
        }
    })
}
