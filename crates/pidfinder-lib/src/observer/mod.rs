//! Container observation
//!
//! Periodically lists and inspects containers from the runtime, turns each
//! running container into a [`ContainerObservation`] and records the ones
//! not seen before, rewriting the record file once per cycle that found
//! something new.

mod r#loop;

#[cfg(test)]
mod tests;

pub use r#loop::{CycleReport, ObservationLoop, ObservationLoopBuilder, ObserverConfig};

use crate::labels::LabelSchema;
use crate::models::ContainerObservation;
use crate::runtime::InspectedContainer;

/// Build an observation from inspected container state
pub fn build_observation(
    container: InspectedContainer,
    schema: &LabelSchema,
) -> ContainerObservation {
    let identity = schema.extract(&container.labels);

    ContainerObservation {
        pid: container.pid,
        created_at: container.created,
        started_at: container.started_at,
        image: container.image,
        identity,
    }
}
