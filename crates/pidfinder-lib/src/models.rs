//! Core data models for pidfinder

use serde::{Deserialize, Serialize};

/// Workload identity derived from a container's orchestration labels
///
/// Every field is an empty string when the corresponding label is absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadIdentity {
    pub pod_name: String,
    pub container_name: String,
    pub pod_namespace: String,
    pub app_label: String,
    pub run_name: String,
    pub process_name: String,
    pub session_id: String,
    pub task_name: String,
}

/// A live container as seen at inspection time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerObservation {
    /// Process id of the container's init process, 0 when the runtime reports none
    pub pid: i64,
    pub created_at: String,
    pub started_at: String,
    pub image: String,
    pub identity: WorkloadIdentity,
}

impl ContainerObservation {
    /// Key used to decide whether two observations are the same container instance
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey {
            pid: self.pid,
            pod_name: self.identity.pod_name.clone(),
            container_name: self.identity.container_name.clone(),
        }
    }
}

/// Deduplication key: pid plus pod and container name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub pid: i64,
    pub pod_name: String,
    pub container_name: String,
}
