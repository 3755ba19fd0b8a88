//! Run execution and streaming.
//!
//! - [`store`]: durable, replayable event log
//! - [`broker`]: in-memory per-run fan-out
//! - [`executor`]: drives one agent run to a terminal status
//! - [`registry`]: run id to background task
//! - [`gateway`]: replay-then-live event streams for clients
//! - [`manager`]: service facade used by the HTTP layer

pub mod broker;
pub mod executor;
pub mod gateway;
pub mod manager;
pub mod registry;
pub mod retry;
pub mod serialize;
pub mod store;

/// Errors surfaced by run operations.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    /// Well-formed request with out-of-range values.
    #[error("{0}")]
    Invalid(String),

    /// The run was cancelled before it finished.
    #[error("run cancelled")]
    Cancelled,

    /// The agent stream raised. Carries the error text stored on the run.
    #[error("{0}")]
    Agent(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] anyhow::Error),
}
