//! Weighted random selection of the next task a user runs.
//!
//! Each [`UserBehavior`](../behavior/struct.UserBehavior.html) builds a
//! [`WeightedSampler`] from the weights of its tasks. Every cycle of a simulated user
//! draws one index from it, so a task is picked with probability
//! `weight / total_weight`, independent of any earlier draw. Tasks with a weight of 0
//! are never picked.

use rand::distr::weighted::{Error as WeightError, WeightedIndex};
use rand::distr::Distribution;
use rand::Rng;

use crate::FlockError;

/// Picks task indexes in proportion to their weights.
///
/// # Example
/// ```rust
/// use flock::sampler::WeightedSampler;
///
/// let sampler = WeightedSampler::new(&[5, 0, 3]).unwrap();
/// assert_eq!(sampler.total_weight(), 8);
///
/// let index = sampler.sample(&mut rand::rng());
/// assert!(index == 0 || index == 2);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct WeightedSampler {
    index: WeightedIndex<usize>,
}
impl WeightedSampler {
    /// Build a sampler from per-task weights, in task order.
    ///
    /// Returns [`FlockError::InvalidWeight`] if the weights add up to 0 (including
    /// when there are no weights at all), or if they overflow.
    pub fn new(weights: &[usize]) -> Result<Self, FlockError> {
        let index = WeightedIndex::new(weights).map_err(|e| match e {
            WeightError::InvalidInput | WeightError::InsufficientNonZero => {
                FlockError::InvalidWeight {
                    weight: 0,
                    detail: "Total task weight must be greater than 0.".to_string(),
                }
            }
            _ => FlockError::InvalidWeight {
                weight: weights.iter().copied().max().unwrap_or(0),
                detail: format!("Invalid task weights {:?}: {}.", weights, e),
            },
        })?;

        Ok(WeightedSampler { index })
    }

    /// The sum of all weights.
    pub fn total_weight(&self) -> usize {
        self.index.total_weight()
    }

    /// Draw the index of the next task.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        self.index.sample(rng)
    }
}
