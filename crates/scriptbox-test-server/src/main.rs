//! Standalone test server, for poking at scripts by hand.
//!
//! `scriptbox-test-server [ADDR]` (default `127.0.0.1:8787`).

use scriptbox_test_server::TestServer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8787".to_string());
    let server = TestServer::bind(&addr).await?;
    tracing::info!(addr = %server.addr(), "test server listening");

    tokio::signal::ctrl_c().await?;
    server.shutdown().await;
    Ok(())
}
