use axum::{Router, extract::DefaultBodyLimit, routing::get};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::AppState;
use crate::agent::GraphRegistry;
use crate::agent::llm::DiagramOrchestrator;
use crate::api;
use crate::config::{AppConfig, load_llm_settings};
use crate::persistence::PersistenceLayer;
use crate::persistence::providers::{memory::MemoryProvider, postgres::PostgresProvider};
use crate::rag::embedding::FastEmbedder;
use crate::rag::retrieval::{DocumentContextAugmenter, RetrievalConfig};
use crate::runs::manager::RunManager;
use crate::security::middleware::auth_middleware;

async fn connect_persistence(config: &AppConfig) -> anyhow::Result<Arc<dyn PersistenceLayer>> {
    let persistence = &config.persistence;
    match persistence.provider.as_str() {
        "postgres" => {
            let provider =
                PostgresProvider::new(&persistence.database_url, persistence.max_connections)
                    .await?;
            info!(name: "persistence.ready", provider = "postgres", "Persistence ready");
            Ok(Arc::new(provider))
        }
        "memory" => {
            tracing::warn!("using in-memory persistence; threads and runs are lost on restart");
            Ok(Arc::new(MemoryProvider::new()))
        }
        other => anyhow::bail!("unknown persistence provider '{other}'"),
    }
}

/// Wire persistence, agent graphs and the run manager from configuration.
pub async fn build_state(config: Arc<AppConfig>) -> anyhow::Result<AppState> {
    let db = connect_persistence(&config).await?;

    let mut graphs = GraphRegistry::new();
    match load_llm_settings() {
        Some(settings) => {
            info!(
                name: "llm.config.loaded",
                base_url = %settings.base_url,
                model = %settings.model,
                "LLM configuration loaded"
            );
            graphs.register(Arc::new(DiagramOrchestrator::from_settings(settings)));
        }
        None => tracing::warn!("LLM_BASE_URL / LLM_MODEL not set; no agent graph registered"),
    }

    let mut run_manager = RunManager::new(
        Arc::clone(&db),
        graphs,
        config.streaming.run_manager_config(),
    );
    if config.rag.enabled {
        let augmenter = DocumentContextAugmenter::new(
            Arc::clone(&db),
            Arc::new(FastEmbedder::new()),
            RetrievalConfig::from(&config.rag),
        );
        run_manager = run_manager.with_augmenter(Arc::new(augmenter));
        info!("Document retrieval enabled.");
    }
    run_manager.seed_assistants().await?;

    Ok(AppState {
        run_manager: Arc::new(run_manager),
        config,
    })
}

pub fn build_router(state: AppState) -> Router {
    let api = api::routes::router().layer(axum::middleware::from_fn_with_state(
        state.clone(),
        auth_middleware,
    ));

    Router::new()
        .route("/health", get(api::routes::health))
        .nest("/api", api)
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the Axum server with the provided configuration.
pub async fn start_server(config: Arc<AppConfig>) -> anyhow::Result<()> {
    let state = build_state(Arc::clone(&config)).await?;
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!(name: "server.shutdown", "Shutdown signal received");
}
