use anyhow::Result;
use axum::Router;
use catalog_core::SyncConfig;
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};
use server::build_app;
use tokio::net::TcpListener;

#[derive(Parser)]
struct Args {
    /// Local store directory
    #[arg(long, default_value = "./catalog")]
    store: String,
    /// Paginated endpoint used by POST /sync
    #[arg(long)]
    source_url: String,
    /// Records requested per page
    #[arg(long, default_value_t = 50)]
    page_size: usize,
    /// Pause between page requests in milliseconds
    #[arg(long, default_value_t = 200)]
    delay_ms: u64,
    /// Host to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Port to bind
    #[arg(long, default_value_t = 8080)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();
    let config = SyncConfig { page_size: args.page_size, page_delay: Duration::from_millis(args.delay_ms), ..SyncConfig::default() };
    let app: Router = build_app(&args.store, &args.source_url, config)?;

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
