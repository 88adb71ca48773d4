//! In-memory set of every container instance observed so far

use crate::models::{ContainerObservation, IdentityKey};
use std::collections::HashSet;

/// Ordered, append-only record of observations
///
/// Order is first-seen order and matches the row order of the persisted
/// file. Membership is answered from an index of identity keys so lookups
/// stay constant-time as history grows.
#[derive(Debug, Clone, Default)]
pub struct KnownSet {
    observations: Vec<ContainerObservation>,
    index: HashSet<IdentityKey>,
}

impl KnownSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an observation with the same identity key is already recorded
    pub fn contains(&self, observation: &ContainerObservation) -> bool {
        self.index.contains(&observation.identity_key())
    }

    /// Append an observation.
    ///
    /// Does not check for duplicates: callers check [`KnownSet::contains`]
    /// first and only add when it returns false.
    pub fn add(&mut self, observation: ContainerObservation) {
        self.index.insert(observation.identity_key());
        self.observations.push(observation);
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContainerObservation> {
        self.observations.iter()
    }

    pub fn as_slice(&self) -> &[ContainerObservation] {
        &self.observations
    }
}

impl FromIterator<ContainerObservation> for KnownSet {
    fn from_iter<I: IntoIterator<Item = ContainerObservation>>(iter: I) -> Self {
        let mut set = KnownSet::new();
        for observation in iter {
            set.add(observation);
        }
        set
    }
}
