//! Workload identity extraction from container labels
//!
//! Kubelet stamps pod metadata onto every container it creates. Nextflow
//! adds its own run/process/task labels, either namespaced under
//! `nextflow.io/` or as bare keys depending on how the pipeline was
//! launched. A [`LabelSchema`] names the label key for each identity field
//! so both layouts go through the same extraction path.

use crate::models::WorkloadIdentity;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;

const POD_NAME: &str = "io.kubernetes.pod.name";
const CONTAINER_NAME: &str = "io.kubernetes.container.name";
const POD_NAMESPACE: &str = "io.kubernetes.pod.namespace";

/// Selects one of the built-in label layouts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaKind {
    /// Kubernetes pod labels with `nextflow.io/*` workflow labels
    #[default]
    Kubernetes,
    /// Kubernetes pod labels with un-prefixed workflow labels
    Bare,
}

impl fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaKind::Kubernetes => f.write_str("kubernetes"),
            SchemaKind::Bare => f.write_str("bare"),
        }
    }
}

/// Label key for each [`WorkloadIdentity`] field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSchema {
    pub pod_name: String,
    pub container_name: String,
    pub pod_namespace: String,
    pub app_label: String,
    pub run_name: String,
    pub process_name: String,
    pub session_id: String,
    pub task_name: String,
}

impl LabelSchema {
    pub fn kubernetes() -> Self {
        Self::with_workflow_prefix("nextflow.io/")
    }

    pub fn bare() -> Self {
        Self::with_workflow_prefix("")
    }

    fn with_workflow_prefix(prefix: &str) -> Self {
        Self {
            pod_name: POD_NAME.to_string(),
            container_name: CONTAINER_NAME.to_string(),
            pod_namespace: POD_NAMESPACE.to_string(),
            app_label: format!("{prefix}app"),
            run_name: format!("{prefix}runName"),
            process_name: format!("{prefix}processName"),
            session_id: format!("{prefix}sessionId"),
            task_name: format!("{prefix}taskName"),
        }
    }

    /// Map a raw label dictionary to a workload identity.
    ///
    /// Missing keys resolve to empty strings; this never fails.
    pub fn extract(&self, labels: &HashMap<String, String>) -> WorkloadIdentity {
        let get = |key: &str| labels.get(key).cloned().unwrap_or_default();

        WorkloadIdentity {
            pod_name: get(&self.pod_name),
            container_name: get(&self.container_name),
            pod_namespace: get(&self.pod_namespace),
            app_label: get(&self.app_label),
            run_name: get(&self.run_name),
            process_name: get(&self.process_name),
            session_id: get(&self.session_id),
            task_name: get(&self.task_name),
        }
    }
}

impl Default for LabelSchema {
    fn default() -> Self {
        Self::kubernetes()
    }
}

impl From<SchemaKind> for LabelSchema {
    fn from(kind: SchemaKind) -> Self {
        match kind {
            SchemaKind::Kubernetes => Self::kubernetes(),
            SchemaKind::Bare => Self::bare(),
        }
    }
}

/// Free-function form of [`LabelSchema::extract`]
pub fn extract(labels: &HashMap<String, String>, schema: &LabelSchema) -> WorkloadIdentity {
    schema.extract(labels)
}
