//! Library for recording which workload owned which process id
//!
//! This crate provides the core functionality for:
//! - Workload identity extraction from container labels
//! - A deduplicated, append-only record of observed containers
//! - Full-rewrite CSV persistence of that record
//! - The polling loop that keeps the record current
//! - Metrics and structured logging

pub mod labels;
pub mod models;
pub mod observability;
pub mod observer;
pub mod runtime;
pub mod store;

pub use labels::{extract, LabelSchema, SchemaKind};
pub use models::*;
pub use observability::{ObserverMetrics, StructuredLogger};
pub use observer::{CycleReport, ObservationLoop, ObservationLoopBuilder, ObserverConfig};
pub use runtime::{ContainerRuntime, DockerRuntime, InspectedContainer, RuntimeError};
pub use store::{CsvStore, KnownSet, RetryPolicy, StoreError};
