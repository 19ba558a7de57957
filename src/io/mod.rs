//! Randomness abstraction shared by production code and simulation.
//!
//! Everything that makes a random decision (fault injection, synthetic
//! workloads, queue reordering) goes through [`Rng`] so a simulation run can
//! be replayed from its seed.

pub mod simulation;

pub use simulation::SimulatedRng;

/// Source of randomness
pub trait Rng: Send + 'static {
    fn next_u64(&mut self) -> u64;

    /// Uniform value in `min..max`; returns `min` when the range is empty
    fn gen_range(&mut self, min: u64, max: u64) -> u64;
}

pub mod production {
    use super::Rng;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// OS-seeded RNG for production paths
    pub struct ProductionRng {
        inner: StdRng,
    }

    impl ProductionRng {
        pub fn new() -> Self {
            ProductionRng {
                inner: StdRng::from_entropy(),
            }
        }
    }

    impl Default for ProductionRng {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Rng for ProductionRng {
        fn next_u64(&mut self) -> u64 {
            use rand::RngCore;
            self.inner.next_u64()
        }

        fn gen_range(&mut self, min: u64, max: u64) -> u64 {
            use rand::Rng;
            if min >= max {
                return min;
            }
            self.inner.gen_range(min..max)
        }
    }
}
