use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Source of uniform random numbers consumed by the transport events.
pub trait UniformSource {
    /// Uniform value in `[0, 1)`.
    fn uniform(&mut self) -> f32;

    /// Uniform value in `[a, b)`.
    fn uniform_range(&mut self, a: f32, b: f32) -> f32 {
        a + (b - a) * self.uniform()
    }

    /// Non-negative integer.
    fn integer(&mut self) -> u32;
}

impl<R: Rng + ?Sized> UniformSource for R {
    #[inline]
    fn uniform(&mut self) -> f32 {
        self.gen::<f32>()
    }

    #[inline]
    fn integer(&mut self) -> u32 {
        self.gen::<u32>()
    }
}

/// Independent stream for one parallel task of one simulation step.
///
/// The same `(seed, step, task)` always yields the same stream, regardless
/// of which worker thread runs the task.
pub fn task_rng(seed: u64, step: u64, task: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(step.wrapping_mul(0x9E37_79B9_7F4A_7C15)));
    rng.set_stream(task);
    rng
}
