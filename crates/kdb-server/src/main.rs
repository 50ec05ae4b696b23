mod config;
mod kernel;
mod shutdown;

use anyhow::Context;
use clap::Parser;
use config::{Config, LogFormat};
use kdb_net::TcpTransport;
use kernel::{Kernel, KernelOptions};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_logging(config.log_format);
    info!(
        path = %config.db_path.display(),
        port = config.port,
        crypto = ?config.crypto,
        service = ?config.service,
        "kdb server starting"
    );

    let crypto = config.crypto_provider()?;
    let transport = Arc::new(TcpTransport::listening_on(config.bind));
    let mut kernel = Kernel::new(
        config.db_path.clone(),
        crypto,
        transport,
        config.storage_service(),
    )
    .with_options(KernelOptions {
        per_connection_tasks: config.per_connection_tasks,
    });

    kernel
        .try_online()
        .with_context(|| format!("bringing up {}", config.db_path.display()))?;
    if let Some(header) = kernel.header() {
        info!(created_at = header.created_at, "database header loaded");
    }

    let cancel = CancellationToken::new();
    shutdown::cancel_on_signal(cancel.clone());

    kernel.serve(config.port, cancel).await?;
    info!("kdb server stopped");
    Ok(())
}

fn init_logging(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().flatten_event(true))
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init(),
    }
}
