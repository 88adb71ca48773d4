//! Docker Engine API runtime

use super::{ContainerRuntime, InspectedContainer, RuntimeError};
use async_trait::async_trait;
use bollard::models::ContainerInspectResponse;
use bollard::query_parameters::{InspectContainerOptions, ListContainersOptionsBuilder};
use bollard::Docker;
use tracing::{debug, info};

/// [`ContainerRuntime`] backed by the Docker Engine API
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` when set, the local unix socket otherwise
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    /// Check that the daemon answers
    pub async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        info!("Connected to container runtime");
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list(&self, include_stopped: bool) -> Result<Vec<String>, RuntimeError> {
        let options = ListContainersOptionsBuilder::default()
            .all(include_stopped)
            .build();

        let containers = self.docker.list_containers(Some(options)).await?;
        debug!(count = containers.len(), include_stopped, "Listed containers");

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn inspect(&self, id: &str) -> Result<InspectedContainer, RuntimeError> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;

        Ok(into_inspected(id, inspect))
    }
}

fn into_inspected(id: &str, inspect: ContainerInspectResponse) -> InspectedContainer {
    let state = inspect.state.unwrap_or_default();
    let labels = inspect
        .config
        .and_then(|cfg| cfg.labels)
        .unwrap_or_default();

    InspectedContainer {
        id: inspect.id.unwrap_or_else(|| id.to_string()),
        pid: state.pid.unwrap_or_default(),
        created: inspect.created.unwrap_or_default(),
        started_at: state.started_at.unwrap_or_default(),
        image: inspect.image.unwrap_or_default(),
        labels,
        running: state.running.unwrap_or(false),
    }
}
