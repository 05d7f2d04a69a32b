use rand::{rngs::StdRng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Explicit seed root handed to every component that needs randomness.
///
/// Nothing here reads the environment: the run seed arrives from the caller
/// (usually the CLI `--seed` flag) and every layer, loader and split derives its
/// own stream from a stable label.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SeedSource {
    base_seed: u64,
}

impl SeedSource {
    pub const fn new(base_seed: u64) -> Self {
        Self { base_seed }
    }

    /// Returns the seed the source was created with.
    pub fn base_seed(&self) -> u64 {
        self.base_seed
    }

    /// Derives a deterministic seed for a given component label.
    pub fn seed_for<L: Hash + ?Sized>(&self, label: &L) -> u64 {
        seed_for(self.base_seed, label)
    }

    /// Returns a RNG dedicated to `label`.
    pub fn rng_for<L: Hash + ?Sized>(&self, label: &L) -> StdRng {
        StdRng::seed_from_u64(self.seed_for(label))
    }

    /// Returns a nested source whose labels do not collide with the parent's.
    pub fn child<L: Hash + ?Sized>(&self, label: &L) -> SeedSource {
        SeedSource::new(self.seed_for(label))
    }
}

impl Default for SeedSource {
    fn default() -> Self {
        Self::new(42)
    }
}

/// Hashes `label` together with `base_seed` into a component seed.
pub fn seed_for<L: Hash + ?Sized>(base_seed: u64, label: &L) -> u64 {
    let mut hasher = DefaultHasher::new();
    base_seed.hash(&mut hasher);
    label.hash(&mut hasher);
    hasher.finish()
}

/// Returns a RNG seeded from an optional explicit seed. Without a seed the RNG
/// is drawn from operating system entropy.
pub fn rng_from_optional(seed: Option<u64>) -> StdRng {
    match seed {
        Some(value) => StdRng::seed_from_u64(value),
        None => StdRng::from_entropy(),
    }
}
