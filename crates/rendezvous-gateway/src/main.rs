#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use rendezvous_common::init_tracing_with_default;
use rendezvous_gateway::{web, Args, Gateway};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    init_tracing_with_default(&format!(
        "rendezvous_gateway={0},rendezvous_common={0},tower_http=info",
        args.log_level
    ));

    args.check_public_bind_allowed()?;
    let config = args.gateway_config();
    info!(
        max_sessions = config.max_sessions,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "starting rendezvous gateway"
    );

    let gateway = Gateway::new(config);
    let sweeper = gateway.spawn_sweeper();

    let listener = TcpListener::bind(args.listen).await?;
    let bound = listener.local_addr()?;
    info!("gateway listening on http://{}", bound);
    info!("signaling endpoint ws://{}/ws", bound);

    web::serve(listener, gateway, shutdown_signal()).await?;

    sweeper.abort();
    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
