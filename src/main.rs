mod controllers;
mod dispatch;
mod error;
mod lifecycle;
mod matcher;
mod models;
mod rating;
mod state;

use crate::dispatch::Registry;
use crate::state::Brokerage;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ridepool=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting ridepool (commute ride-share broker)");

    // Load configuration
    dotenv::dotenv().ok();
    let addr = std::env::var("RIDEPOOL_ADDR").unwrap_or_else(|_| "0.0.0.0:12345".to_string());
    let data_dir_str =
        std::env::var("RIDEPOOL_DATA_DIR").unwrap_or_else(|_| "ridepool_data".to_string());
    let data_dir = std::path::Path::new(&data_dir_str);

    let state = Brokerage::new(data_dir)?;
    let registry = Arc::new(Registry::new());

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("listening on {}", addr);

    // One task per connection: read one command, write one response, close.
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!("New connection from {}", peer);
                        let state = state.clone();
                        let registry = registry.clone();
                        tokio::spawn(dispatch::handle_connection(stream, state, registry));
                    }
                    Err(e) => tracing::warn!("accept failed: {}", e),
                }
            }
        }
    }

    // Flush the persist pipeline before exit. In-flight connection tasks
    // finish first; the worker joins once the last sender clone is gone.
    drop(listener);
    tokio::task::spawn_blocking(move || state.shutdown()).await?;

    Ok(())
}
