pub mod config;
pub mod error;
pub mod executor;
pub mod models;
pub mod pagination;
pub mod pipeline;
pub mod progress;
pub mod query;
pub mod rules;
pub mod server;
pub mod single_flight;
pub mod state;
pub mod telemetry;

use crate::{config::AppConfig, server::Server};

/// Bootstraps the query compiler service using environment configuration.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    Server::new(config).await?.run().await
}
