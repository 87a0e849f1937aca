//! # Mode selection
//!
//! Reproducible draws of the spectral modes to perturb and of the sign of
//! each member's perturbation. A run owns exactly one [`EnsembleRng`];
//! all mode draws happen before any sign draw, and signs are drawn in
//! member order, so the same seed always yields the same assignment.
//!
//! ```rust
//! use ifs_ensemble::modes::EnsembleRng;
//!
//! let mut a = EnsembleRng::new(42);
//! let mut b = EnsembleRng::new(42);
//! assert_eq!(a.select_modes(100, 3).unwrap(), b.select_modes(100, 3).unwrap());
//! ```

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::error::{EnsembleError, Result};

/// Seeded generator for one ensemble run.
#[derive(Debug, Clone)]
pub struct EnsembleRng {
    seed: u64,
    rng: ChaCha20Rng,
}

impl EnsembleRng {
    pub fn new(seed: u64) -> Self {
        EnsembleRng {
            seed,
            rng: ChaCha20Rng::seed_from_u64(seed),
        }
    }

    /// Use `seed` if given, otherwise draw one from OS entropy.
    pub fn from_optional_seed(seed: Option<u64>) -> Self {
        Self::new(seed.unwrap_or_else(rand::random::<u64>))
    }

    /// The seed this generator was built from.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Draw `members` distinct even mode positions from `[0, total_modes)`.
    ///
    /// Member `i` (1-based) is assigned `modes[i - 1]`.
    pub fn select_modes(&mut self, total_modes: usize, members: usize) -> Result<Vec<usize>> {
        let mut pool: Vec<usize> = (0..total_modes).step_by(2).collect();
        if members > pool.len() {
            return Err(EnsembleError::InvalidArgument(format!(
                "{members} members requested but only {} even modes available out of {total_modes}",
                pool.len()
            )));
        }
        let (chosen, _) = pool.partial_shuffle(&mut self.rng, members);
        Ok(chosen.to_vec())
    }

    /// Draw a sign for each of `members` members, in member order.
    pub fn draw_signs(&mut self, members: usize) -> Vec<f64> {
        (0..members)
            .map(|_| if self.rng.gen_bool(0.5) { 1.0 } else { -1.0 })
            .collect()
    }
}
