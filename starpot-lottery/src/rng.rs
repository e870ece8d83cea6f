use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;

/// Source of the winning index for a draw.
pub trait RandomSource: Send + Sync {
    /// Uniform index in `0..len`. Never called with `len == 0`.
    fn pick_index(&self, len: usize) -> usize;
}

/// Process-wide OS-seeded generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn pick_index(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(0..len)
    }
}

/// Reproducible generator for simulations.
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn pick_index(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        self.rng.lock().gen_range(0..len)
    }
}

/// Replays a fixed sequence of indices, then repeats the last one.
#[derive(Debug)]
pub struct ScriptedRandom {
    script: Mutex<VecDeque<usize>>,
    last: Mutex<usize>,
}

impl ScriptedRandom {
    pub fn new(indices: impl IntoIterator<Item = usize>) -> Self {
        Self {
            script: Mutex::new(indices.into_iter().collect()),
            last: Mutex::new(0),
        }
    }
}

impl RandomSource for ScriptedRandom {
    fn pick_index(&self, _len: usize) -> usize {
        let mut last = self.last.lock();
        if let Some(next) = self.script.lock().pop_front() {
            *last = next;
        }
        *last
    }
}
