mod cli;
mod error;
mod formats;
mod pipeline;
mod store;
mod web;

use anyhow::Result;
use cli::Args;
use std::sync::Arc;
use web::server::{run_server, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse_args();
    tracing::info!("Serving data from {}", args.data_root.display());

    let state = Arc::new(AppState::from_args(&args)?);
    run_server(args.host, args.port, state).await?;

    Ok(())
}
