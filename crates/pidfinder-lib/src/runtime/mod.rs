//! Container runtime access
//!
//! The observation loop only needs two calls from a runtime: list container
//! ids and inspect one container. [`ContainerRuntime`] captures that so the
//! loop can run against Docker in production and a scripted runtime in tests.

mod docker;

pub use docker::DockerRuntime;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors from the container runtime. All of them are transient for the loop.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime API error: {0}")]
    Api(#[from] bollard::errors::Error),

    #[error("inspecting container {id} timed out after {after:?}")]
    Timeout { id: String, after: Duration },

    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
}

/// State of one container as reported by an inspect call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InspectedContainer {
    pub id: String,
    /// Init process id, 0 when not reported
    pub pid: i64,
    pub created: String,
    pub started_at: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
}

/// Minimal container runtime interface
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List container ids; stopped containers are included when `include_stopped` is set
    async fn list(&self, include_stopped: bool) -> Result<Vec<String>, RuntimeError>;

    /// Inspect a single container
    async fn inspect(&self, id: &str) -> Result<InspectedContainer, RuntimeError>;
}
