use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use skiff::config::{loader, Config};
use skiff::{admin, ServiceRegistry};

/// A dynamically reconfigurable TCP/UDP reverse proxy and load balancer.
#[derive(Parser)]
#[command(name = "skiff", version)]
struct Args {
    /// Address for the admin control surface.
    #[arg(long, default_value = "127.0.0.1:9090")]
    admin: String,

    /// Default configuration file applied at startup.
    #[arg(long)]
    config: Option<PathBuf>,

    /// File where the running configuration is persisted across restarts.
    #[arg(long)]
    state: Option<PathBuf>,

    /// Redirect non-https requests to https on all services.
    #[arg(long)]
    https_redirect: bool,

    /// Log at debug level.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let default_filter = if args.debug { "skiff=debug" } else { "skiff=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "skiff starting");

    let mut registry = ServiceRegistry::new().with_admin_addr(&args.admin);
    if let Some(state) = &args.state {
        registry = registry.with_state_file(state.clone());
    }
    let registry = Arc::new(registry);

    if args.https_redirect {
        // becomes a global default inherited by every configured service
        registry
            .update_config(Config {
                https_redirect: true,
                ..Default::default()
            })
            .await?;
    }

    loader::load_into(
        &registry,
        &[args.state.as_deref(), args.config.as_deref()],
    )
    .await;

    let listener = TcpListener::bind(&args.admin).await?;
    tracing::info!(address = %args.admin, "admin server listening");

    axum::serve(listener, admin::router(registry))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutdown complete");
    Ok(())
}

/// Wait for ctrl-c.
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "installing ctrl-c handler");
    }
    tracing::info!("shutdown signal received");
}
