//! Process-wide seeded random source.
//!
//! The simulation consumes one RNG stream in task-interleaved order; because
//! the executor polls tasks deterministically, a fixed seed reproduces a run
//! bit for bit. Per-node independent streams would lose that property the
//! moment node counts or schedules change, so everything draws from here.

use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Exp;
use std::sync::{Mutex, OnceLock};

static RNG: OnceLock<Mutex<StdRng>> = OnceLock::new();

const DEFAULT_SEED: u64 = 12345;

fn rng() -> &'static Mutex<StdRng> {
    RNG.get_or_init(|| Mutex::new(StdRng::seed_from_u64(DEFAULT_SEED)))
}

/// Reseed the stream. Called once at the start of every run.
pub(crate) fn seed(seed: u64) {
    *rng().lock().unwrap() = StdRng::seed_from_u64(seed);
}

/// Uniform integer in `[low, high]`, both ends included.
pub(crate) fn range_inclusive(low: u32, high: u32) -> u32 {
    rng().lock().unwrap().gen_range(low..=high)
}

/// Uniform float in `[low, high)`.
pub(crate) fn uniform(low: f64, high: f64) -> f64 {
    rng().lock().unwrap().gen_range(low..high)
}

/// Exponentially distributed wait with the given mean.
pub(crate) fn expovariate(mean: f64) -> f64 {
    let exp = Exp::new(1.0 / mean).expect("exponential mean must be positive");
    exp.sample(&mut *rng().lock().unwrap())
}

/// Uniform choice from a non-empty slice.
pub(crate) fn pick<T: Copy>(choices: &[T]) -> T {
    *choices
        .choose(&mut *rng().lock().unwrap())
        .expect("choice slice must not be empty")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeding_reproduces_the_stream() {
        // The stream is process-global; keep concurrent tests off it.
        let _guard = crate::time_driver::sim_lock();
        seed(7);
        let a: Vec<u32> = (0..8).map(|_| range_inclusive(0, 100)).collect();
        seed(7);
        let b: Vec<u32> = (0..8).map(|_| range_inclusive(0, 100)).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn expovariate_has_roughly_the_requested_mean() {
        let _guard = crate::time_driver::sim_lock();
        seed(42);
        let n = 20_000;
        let sum: f64 = (0..n).map(|_| expovariate(20_000.0)).sum();
        let mean = sum / n as f64;
        assert!((mean - 20_000.0).abs() < 1_000.0, "mean was {mean}");
    }
}
