//! Weighted random version selection

use crate::registry::{ServiceDefinition, Weight, TOTAL_WEIGHT};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("service has no active version")]
    NoActiveVersion,
}

/// Picks a version id from a traffic split.
///
/// A draw `r` is taken uniformly from `0..=100`; weights are subtracted
/// from it in listed order and the first version that brings `r` to zero
/// or below wins. A split whose weights sum to 100 therefore always
/// resolves, with the first entry getting one extra slot out of 101.
pub struct VersionSelector {
    rng: Mutex<StdRng>,
}

impl VersionSelector {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic selector for tests
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Choose a version from the service's active split
    pub fn choose(&self, service: &ServiceDefinition) -> Result<u64, SelectError> {
        let split = service.active_weights().ok_or(SelectError::NoActiveVersion)?;
        self.select(&split.weights)
    }

    pub fn select(&self, weights: &[Weight]) -> Result<u64, SelectError> {
        if weights.is_empty() {
            return Err(SelectError::NoActiveVersion);
        }
        let draw = self.rng.lock().gen_range(0..=TOTAL_WEIGHT);
        pick(weights, draw).ok_or(SelectError::NoActiveVersion)
    }
}

impl Default for VersionSelector {
    fn default() -> Self {
        Self::new()
    }
}

fn pick(weights: &[Weight], draw: u32) -> Option<u64> {
    let mut remaining = i64::from(draw);
    for w in weights {
        remaining -= i64::from(w.weight);
        if remaining <= 0 {
            return Some(w.version_id);
        }
    }
    None
}
