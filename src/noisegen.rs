use crate::field::{GridField, Lattice};
use glam::Vec2;
use noise::{NoiseFn, Perlin};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Fractal brownian motion settings for seeding vegetation or hardness.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq)]
pub struct Opts {
    /// Number of times to sample the noise
    pub octaves: usize,
    /// How smooth the noise should be (sensible values are around 0.5-1)
    pub hurst_exponent: f32,
    /// Frequency ratio between successive octaves
    pub lacunarity: f32,
    /// Maximum value
    pub max: f32,
    /// Minumum value
    pub min: f32,
    /// Scales points before sampling
    pub sample_scale: f32,
    /// Seeds the noise permutation table
    pub seed: u32,
    #[serde(default)]
    /// Offsets the noise sampling
    pub offset: Vec2,
}

impl Opts {
    fn gain(&self) -> f64 {
        (-self.hurst_exponent as f64).exp2()
    }

    fn scaled(&self, p: Vec2) -> [f64; 2] {
        let q = p * self.sample_scale + self.offset;
        [q.x as f64, q.y as f64]
    }
}

/// Samples fBm at every point, then rescales the result onto `[min, max]`.
pub fn sample_all_noise(points: &[Vec2], opts: Opts) -> Vec<f32> {
    let noise = Perlin::new(opts.seed);
    let gain = opts.gain();

    let mut samples = points
        .par_iter()
        .map(|&p| {
            let sample = fbm(
                opts.octaves,
                gain,
                opts.lacunarity as f64,
                opts.scaled(p),
                &noise,
                |x| x,
            );
            sample as f32
        })
        .collect::<Vec<_>>();

    let (min, max) = samples
        .par_iter()
        .fold(
            || (f32::INFINITY, f32::NEG_INFINITY),
            |(min, max), &x| (min.min(x), max.max(x)),
        )
        .reduce(
            || (f32::INFINITY, f32::NEG_INFINITY),
            |(min, max), (omin, omax)| (min.min(omin), max.max(omax)),
        );

    if !(max > min) {
        samples.fill(opts.min);
        return samples;
    }

    let slope = (opts.max - opts.min) / (max - min);
    let offset = opts.min - slope * min;
    for item in samples.iter_mut() {
        *item = *item * slope + offset;
    }
    samples
}

/// A whole field of rescaled fBm, sampled at the grid vertices.
pub fn noise_field(lattice: Lattice, opts: Opts) -> GridField {
    let points = (0..lattice.len())
        .map(|index| {
            let (i, j) = lattice.index_2d(index);
            lattice.vertex(i, j)
        })
        .collect::<Vec<_>>();
    let values = sample_all_noise(&points, opts);
    GridField::from_fn(lattice, |i, j| values[lattice.index(i, j)])
}

/// Normalized fBm; `shape` is applied to every octave's raw sample.
fn fbm(
    octaves: usize,
    gain: f64,
    lacunarity: f64,
    point: [f64; 2],
    noise: &Perlin,
    shape: impl Fn(f64) -> f64,
) -> f64 {
    let mut result = 0.0;
    let mut frequency = 1.0;
    let mut amplitude = 1.0;
    let mut scale = 0.0;
    for _ in 0..octaves {
        result += shape(noise.get([point[0] * frequency, point[1] * frequency])) * amplitude;
        scale += amplitude;
        frequency *= lacunarity;
        amplitude *= gain;
    }
    if scale > 0.0 {
        result / scale
    } else {
        0.0
    }
}

/// Point-wise turbulence (fBm of absolute noise) mapped onto `[min, max]`.
///
/// Used as a procedural bedrock hardness during abrasion.
#[derive(Clone)]
pub struct Turbulence {
    noise: Perlin,
    opts: Opts,
}

impl Turbulence {
    pub fn new(opts: Opts) -> Self {
        Self {
            noise: Perlin::new(opts.seed),
            opts,
        }
    }

    pub fn sample(&self, p: Vec2) -> f32 {
        let t = fbm(
            self.opts.octaves,
            self.opts.gain(),
            self.opts.lacunarity as f64,
            self.opts.scaled(p),
            &self.noise,
            f64::abs,
        );
        self.opts.min + (self.opts.max - self.opts.min) * t.clamp(0.0, 1.0) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Box2;

    fn opts() -> Opts {
        Opts {
            octaves: 5,
            hurst_exponent: 1.0,
            lacunarity: 2.0,
            max: 1.0,
            min: 0.0,
            sample_scale: 0.05,
            seed: 3,
            offset: Vec2::ZERO,
        }
    }

    #[test]
    fn noise_field_spans_the_requested_range() {
        let lattice = Lattice::new(32, 32, Box2::new(Vec2::ZERO, Vec2::splat(128.0))).unwrap();
        let field = noise_field(lattice, opts());
        assert!((field.min() - 0.0).abs() < 1e-5);
        assert!((field.max() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn noise_is_deterministic_per_seed() {
        let points = [Vec2::new(1.5, 2.5), Vec2::new(40.0, 3.0), Vec2::new(7.0, 90.0)];
        assert_eq!(sample_all_noise(&points, opts()), sample_all_noise(&points, opts()));
    }

    #[test]
    fn turbulence_stays_in_range() {
        let turbulence = Turbulence::new(Opts {
            min: 0.2,
            max: 0.6,
            ..opts()
        });
        for k in 0..200 {
            let h = turbulence.sample(Vec2::new(k as f32 * 1.7, k as f32 * 0.3));
            assert!((0.2..=0.6).contains(&h), "{h}");
        }
    }

    #[test]
    fn turbulence_folds_octaves_into_positive_noise() {
        let opts = opts();
        let turbulence = Turbulence::new(opts);
        let noise = Perlin::new(opts.seed);
        for p in [Vec2::new(13.0, 7.5), Vec2::new(-4.0, 61.25)] {
            let point = opts.scaled(p);
            let folded = fbm(opts.octaves, opts.gain(), 2.0, point, &noise, f64::abs);
            let signed = fbm(opts.octaves, opts.gain(), 2.0, point, &noise, |x| x);
            assert!((turbulence.sample(p) - folded.clamp(0.0, 1.0) as f32).abs() < 1e-6);
            assert!(folded + 1e-9 >= signed.abs());
        }
    }
}
