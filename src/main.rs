//! Mindmap agent server
//!
//! Entry point for the run execution and streaming backend.

use mimalloc::MiMalloc;
use mindmap_agent::{config::AppConfig, server, telemetry};
use std::sync::Arc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env first so RUST_LOG and friends apply to telemetry
    let _ = dotenvy::dotenv();
    telemetry::init();

    let config = Arc::new(AppConfig::load()?);
    tracing::debug!(
        provider = %config.persistence.provider,
        jwt_required = config.security.jwt_required,
        "configuration loaded"
    );

    server::start_server(config).await
}
