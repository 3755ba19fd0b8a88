use crate::agent::llm::LlmSettings;
use crate::domain::events::StreamMode;
use crate::rag::retrieval::RetrievalConfig;
use crate::runs::manager::RunManagerConfig;
use crate::runs::retry::RetryPolicy;
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Prefix of environment variables mapped onto config keys, e.g.
/// `MINDMAP_SERVER__PORT=8000`.
pub const ENV_PREFIX: &str = "MINDMAP";

const CWD_CONFIG_FILE: &str = "config.yaml";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Require JWT authentication
    #[arg(long, env = "JWT_REQUIRED")]
    pub jwt_required: Option<bool>,

    /// Persistence provider (memory or postgres)
    #[arg(long, env = "PERSISTENCE_PROVIDER")]
    pub persistence_provider: Option<String>,

    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub persistence: PersistenceConfig,
    pub streaming: StreamingConfig,
    pub rag: RagConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecurityConfig {
    pub jwt_required: bool,
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceConfig {
    /// `memory` or `postgres`.
    pub provider: String,
    pub database_url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamingConfig {
    pub default_stream_modes: Vec<StreamMode>,
    pub keep_alive_secs: u64,
    pub replay_page_size: usize,
    pub broker_tombstone_capacity: usize,
    pub cancel_settle_timeout_ms: u64,
    pub store_retry_attempts: u32,
    pub store_retry_delay_ms: u64,
    /// Graph new threads run against when they do not name one.
    pub default_graph_id: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RagConfig {
    pub enabled: bool,
    pub top_k: usize,
    pub similarity_threshold: f32,
}

impl StreamingConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(1))
    }

    pub fn run_manager_config(&self) -> RunManagerConfig {
        RunManagerConfig {
            default_stream_modes: self.default_stream_modes.clone(),
            settle_timeout: Duration::from_millis(self.cancel_settle_timeout_ms),
            retry: RetryPolicy::new(
                self.store_retry_attempts,
                Duration::from_millis(self.store_retry_delay_ms),
            ),
            replay_page_size: self.replay_page_size,
            tombstone_capacity: self.broker_tombstone_capacity,
            default_graph_id: self.default_graph_id.clone(),
        }
    }
}

impl From<&RagConfig> for RetrievalConfig {
    fn from(rag: &RagConfig) -> Self {
        Self {
            top_k: rag.top_k,
            similarity_threshold: rag.similarity_threshold,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    /// Layering, lowest to highest: defaults, config file, `MINDMAP_` env
    /// vars, CLI flags (and their env fallbacks).
    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let mut builder = Config::builder()
            .set_default("server.port", 8000)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("security.jwt_required", false)?
            .set_default("security.jwt_secret", "")?
            .set_default("persistence.provider", "memory")?
            .set_default("persistence.database_url", "")?
            .set_default("persistence.max_connections", 10)?
            .set_default("streaming.default_stream_modes", vec!["values"])?
            .set_default("streaming.keep_alive_secs", 15)?
            .set_default("streaming.replay_page_size", 500)?
            .set_default("streaming.broker_tombstone_capacity", 1024)?
            .set_default("streaming.cancel_settle_timeout_ms", 5000)?
            .set_default("streaming.store_retry_attempts", 3)?
            .set_default("streaming.store_retry_delay_ms", 100)?
            .set_default("rag.enabled", true)?
            .set_default("rag.top_k", 5)?
            .set_default("rag.similarity_threshold", 0.3)?;

        if let Some(path) = config_file(cli.config.as_deref()) {
            tracing::debug!(path = %path.display(), "loading config file");
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("streaming.default_stream_modes")
                .try_parsing(true),
        );

        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(required) = cli.jwt_required {
            builder = builder.set_override("security.jwt_required", required)?;
        }
        if let Some(provider) = cli.persistence_provider {
            builder = builder.set_override("persistence.provider", provider)?;
        }
        if let Some(url) = cli.database_url {
            builder = builder.set_override("persistence.database_url", url)?;
        }

        builder.build()?.try_deserialize()
    }
}

/// An explicit path wins; otherwise `./config.yaml` is used when present.
fn config_file(explicit: Option<&str>) -> Option<PathBuf> {
    match explicit.filter(|p| !p.trim().is_empty()) {
        Some(path) => Some(PathBuf::from(path)),
        None => {
            let cwd = PathBuf::from(CWD_CONFIG_FILE);
            cwd.exists().then_some(cwd)
        }
    }
}

/// LLM endpoint settings from `LLM_BASE_URL`, `LLM_MODEL` and `LLM_API_KEY`.
/// `None` when the endpoint or model is not configured.
pub fn load_llm_settings() -> Option<LlmSettings> {
    let non_empty = |key: &str| std::env::var(key).ok().filter(|s| !s.trim().is_empty());

    let base_url = non_empty("LLM_BASE_URL")?;
    let model = non_empty("LLM_MODEL")?;
    Some(LlmSettings {
        base_url,
        api_key: non_empty("LLM_API_KEY"),
        model,
    })
}
