//! Test utility only supposed for testing and benchmarking.
#![doc(hidden)]

use std::time::Instant as WallInstant;

use rand::prelude::*;
use runtime::{Executor, Instant};

use crate::{LINE_SIZE, MemoryTimingModel};

/// Number of reads kept in flight by the workloads.
const PACER: usize = 64;

fn drive(model: &mut dyn MemoryTimingModel, offsets: impl Iterator<Item = u64>) -> Instant {
    let mut executor = Executor::new();
    let mut outstanding = 0;

    let start = WallInstant::now();
    for offset in offsets {
        if outstanding == PACER {
            executor.pop();
            outstanding -= 1;
        }
        let done = model.read(executor.now(), offset);
        executor.schedule(done, ());
        outstanding += 1;
    }
    while executor.pop().is_some() {}

    let elapsed = start.elapsed();
    eprintln!(
        "Simulation completed. Last instance {:?}. Wall clock time {:?}",
        executor.now(),
        elapsed
    );
    executor.now()
}

pub fn sequential(model: &mut dyn MemoryTimingModel, size: u64) -> Instant {
    drive(model, (0..size).step_by(LINE_SIZE as usize))
}

pub fn sequential_1m(model: &mut dyn MemoryTimingModel) -> Instant {
    sequential(model, 1024 * 1024)
}

pub fn random(model: &mut dyn MemoryTimingModel, size: u64) -> Instant {
    // Use a fixed seed RNG for same sequence across runs.
    let mut rng = rand::rngs::SmallRng::seed_from_u64(42);
    let lines = size / LINE_SIZE;
    drive(model, (0..lines).map(move |_| rng.random_range(0..lines) * LINE_SIZE))
}

pub fn random_1m(model: &mut dyn MemoryTimingModel) -> Instant {
    random(model, 1024 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NaiveTiming, SimpleTiming};

    #[test]
    fn random_is_reproducible() {
        let a = random(&mut SimpleTiming::preset_ddr4_2400p(2), 64 * 1024);
        let b = random(&mut SimpleTiming::preset_ddr4_2400p(2), 64 * 1024);
        assert_eq!(a, b);
    }

    #[test]
    fn naive_ignores_locality() {
        let seq = sequential_1m(&mut NaiveTiming::preset_ddr4_2400p(1));
        let rand = random_1m(&mut NaiveTiming::preset_ddr4_2400p(1));
        assert_eq!(seq, rand);
        assert!(seq > Instant::INIT);
    }
}
