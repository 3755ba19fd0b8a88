//! Mindmap agent backend
//!
//! Executes LLM agent runs for a diagram-chat application and streams their
//! events to clients, durably and resumably.
//!
//! # Architecture
//!
//! - **Server**: Axum HTTP API with SSE streaming and JWT auth
//! - **Runs**: executor, broker, event store and streaming gateway
//! - **Agent**: pluggable agent runtimes keyed by graph id
//! - **RAG**: document context retrieved from a thread's uploaded files
//!
//! # Modules
//!
//! - [`agent`]: agent runtime trait and implementations
//! - [`domain`]: threads, runs, events and file chunks
//! - [`persistence`]: storage trait with Postgres and in-memory providers
//! - [`runs`]: run execution and streaming
//! - [`api`]: HTTP routes and SSE framing

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod agent;
pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod rag;
pub mod runs;
pub mod security;
pub mod server;
pub mod telemetry;

use crate::config::AppConfig;
use runs::manager::RunManager;
use std::sync::Arc;

/// Application state shared across all handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    pub run_manager: Arc<RunManager>,
    pub config: Arc<AppConfig>,
}
