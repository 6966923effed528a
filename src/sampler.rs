//! Random numbers and sample warping used by every Monte Carlo estimator of the baker.
//!
//! Direction samplers produce vectors in a local frame where +Z is the surface normal, use
//! [`tangent_to_world`] to bring them into world space.

use nalgebra::{Vector2, Vector3};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{
    cell::RefCell,
    f32::consts::{FRAC_PI_4, PI},
};

/// Golden angle in radians, `pi * (3 - sqrt(5))`.
const GOLDEN_ANGLE: f32 = 2.399_963_2;

/// Per-thread pseudo-random generator producing uniform floats in `[0; 1)`.
///
/// Samplers are never shared between threads, every worker owns its own one (see
/// [`with_thread_sampler`]).
#[derive(Clone, Debug)]
pub struct Sampler {
    rng: SmallRng,
}

impl Sampler {
    /// Creates a sampler seeded from the OS entropy source.
    pub fn from_entropy() -> Self {
        Self {
            rng: SmallRng::from_entropy(),
        }
    }

    /// Creates a deterministic sampler.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Returns next uniform number in `[0; 1)`.
    #[inline]
    pub fn next(&mut self) -> f32 {
        // `gen::<f32>` is in [0; 1), but keep the guarantee explicit for downstream code
        // that divides by `1 - u`.
        self.rng.gen::<f32>().min(1.0 - f32::EPSILON)
    }

    /// Returns a pair of uniform numbers.
    #[inline]
    pub fn next_2d(&mut self) -> (f32, f32) {
        (self.next(), self.next())
    }
}

thread_local! {
    static THREAD_SAMPLER: RefCell<Sampler> = RefCell::new(Sampler::from_entropy());
}

/// Runs `func` with the sampler of the current thread. The sampler is seeded on first use
/// on each thread.
pub fn with_thread_sampler<R>(func: impl FnOnce(&mut Sampler) -> R) -> R {
    THREAD_SAMPLER.with(|sampler| func(&mut sampler.borrow_mut()))
}

/// Maps unit square onto unit disk preserving relative areas (Shirley-Chiu concentric mapping).
pub fn concentric_disk(u1: f32, u2: f32) -> Vector2<f32> {
    let a = 2.0 * u1 - 1.0;
    let b = 2.0 * u2 - 1.0;

    let (r, phi) = if a > -b {
        if a > b {
            (a, FRAC_PI_4 * (b / a))
        } else {
            (b, FRAC_PI_4 * (2.0 - a / b))
        }
    } else if a < b {
        (-a, FRAC_PI_4 * (4.0 + b / a))
    } else if b != 0.0 {
        (-b, FRAC_PI_4 * (6.0 - a / b))
    } else {
        (-b, 0.0)
    };

    Vector2::new(r * phi.cos(), r * phi.sin())
}

/// Malley's method: project a concentric disk sample up onto the hemisphere. The pdf is
/// `cos(theta) / pi`, so the cosine term cancels in a lambertian estimator.
pub fn sample_cosine_weighted_hemisphere(u1: f32, u2: f32) -> Vector3<f32> {
    let d = concentric_disk(u1, u2);
    let z = (1.0 - d.x * d.x - d.y * d.y).max(0.0).sqrt();
    Vector3::new(d.x, d.y, z)
}

/// Jittered stratified variant of [`sample_cosine_weighted_hemisphere`]: the unit square is
/// split into `sqrt_sample_count x sqrt_sample_count` cells, sample `index` is jittered inside
/// its own cell.
pub fn sample_stratified_cosine_weighted_hemisphere(
    index: u32,
    sqrt_sample_count: u32,
    u1: f32,
    u2: f32,
) -> Vector3<f32> {
    let n = sqrt_sample_count.max(1);
    let cell_x = index % n;
    let cell_y = (index / n) % n;
    let inv = 1.0 / n as f32;
    sample_cosine_weighted_hemisphere((cell_x as f32 + u1) * inv, (cell_y as f32 + u2) * inv)
}

/// Uniform direction on the +Z hemisphere.
pub fn sample_direction_hemisphere(u1: f32, u2: f32) -> Vector3<f32> {
    let z = u1;
    let r = (1.0 - z * z).max(0.0).sqrt();
    let phi = 2.0 * PI * u2;
    Vector3::new(r * phi.cos(), r * phi.sin(), z)
}

/// Uniform direction on the unit sphere.
pub fn sample_direction_sphere(u1: f32, u2: f32) -> Vector3<f32> {
    let z = 1.0 - 2.0 * u1;
    let r = (1.0 - z * z).max(0.0).sqrt();
    let phi = 2.0 * PI * u2;
    Vector3::new(r * phi.cos(), r * phi.sin(), z)
}

/// Point `index` of a Fibonacci sphere with `count` points (golden angle spiral).
pub fn sample_sphere(index: u32, count: u32) -> Vector3<f32> {
    let count = count.max(1) as f32;
    let z = 1.0 - 2.0 * (index as f32 + 0.5) / count;
    let r = (1.0 - z * z).max(0.0).sqrt();
    let theta = GOLDEN_ANGLE * index as f32;
    Vector3::new(r * theta.cos(), r * theta.sin(), z)
}

/// Point `index` of a Vogel disk with `count` points rotated by `phi`. Result lies in the unit
/// disk.
pub fn sample_vogel_disk(index: u32, count: u32, phi: f32) -> Vector2<f32> {
    let r = ((index as f32 + 0.5) / count.max(1) as f32).sqrt();
    let theta = index as f32 * GOLDEN_ANGLE + phi;
    Vector2::new(r * theta.cos(), r * theta.sin())
}

/// Builds an orthonormal basis around `normal` (Duff et al. 2017).
pub fn orthonormal_basis(normal: &Vector3<f32>) -> (Vector3<f32>, Vector3<f32>) {
    let sign = 1.0f32.copysign(normal.z);
    let a = -1.0 / (sign + normal.z);
    let b = normal.x * normal.y * a;
    let tangent = Vector3::new(1.0 + sign * normal.x * normal.x * a, sign * b, -sign * normal.x);
    let bitangent = Vector3::new(b, sign + normal.y * normal.y * a, -normal.y);
    (tangent, bitangent)
}

/// Transforms a direction from the local frame (+Z is the normal) into world space.
pub fn tangent_to_world(normal: &Vector3<f32>, local: &Vector3<f32>) -> Vector3<f32> {
    let (tangent, bitangent) = orthonormal_basis(normal);
    tangent.scale(local.x) + bitangent.scale(local.y) + normal.scale(local.z)
}

#[cfg(test)]
mod test {
    use super::*;

    const EPS: f32 = 1.0e-4;

    #[test]
    fn cosine_hemisphere_samples_are_upper_unit_vectors() {
        let mut sampler = Sampler::with_seed(1);
        for _ in 0..10_000 {
            let (u1, u2) = sampler.next_2d();
            let d = sample_cosine_weighted_hemisphere(u1, u2);
            assert!(d.z >= 0.0);
            assert!(d.norm() <= 1.0 + EPS);
            assert!((d.norm() - 1.0).abs() < EPS);
        }
    }

    #[test]
    fn stratified_samples_are_upper_unit_vectors() {
        let mut sampler = Sampler::with_seed(2);
        for index in 0..4096 {
            let (u1, u2) = sampler.next_2d();
            let d = sample_stratified_cosine_weighted_hemisphere(index, 8, u1, u2);
            assert!(d.z >= 0.0);
            assert!(d.norm() <= 1.0 + EPS);
        }
    }

    #[test]
    fn concentric_disk_corner_cases() {
        assert_eq!(concentric_disk(0.5, 0.5), Vector2::new(0.0, 0.0));
        for &(u1, u2) in &[(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0), (0.5, 0.0)] {
            let d = concentric_disk(u1, u2);
            assert!(d.x.is_finite() && d.y.is_finite());
            assert!(d.norm() <= 1.0 + EPS);
        }
        // Right edge maps to the +X axis.
        let d = concentric_disk(1.0, 0.5);
        assert!((d.x - 1.0).abs() < EPS && d.y.abs() < EPS);
    }

    #[test]
    fn uniform_directions_are_unit_length() {
        let mut sampler = Sampler::with_seed(3);
        for _ in 0..1000 {
            let (u1, u2) = sampler.next_2d();
            let h = sample_direction_hemisphere(u1, u2);
            assert!(h.z >= 0.0);
            assert!((h.norm() - 1.0).abs() < EPS);
            let s = sample_direction_sphere(u1, u2);
            assert!((s.norm() - 1.0).abs() < EPS);
        }
    }

    #[test]
    fn fibonacci_sphere_is_balanced() {
        let count = 256;
        let mut sum = Vector3::zeros();
        for i in 0..count {
            let d = sample_sphere(i, count);
            assert!((d.norm() - 1.0).abs() < EPS);
            sum += d;
        }
        assert!(sum.scale(1.0 / count as f32).norm() < 0.05);
    }

    #[test]
    fn vogel_disk_stays_inside_unit_disk() {
        for i in 0..64 {
            assert!(sample_vogel_disk(i, 64, 1.3).norm() <= 1.0 + EPS);
        }
    }

    #[test]
    fn tangent_frame_is_orthonormal() {
        for n in [
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.0, 0.0, -1.0),
            Vector3::new(1.0, 2.0, 3.0).normalize(),
        ] {
            let (t, b) = orthonormal_basis(&n);
            assert!(t.dot(&b).abs() < EPS);
            assert!(t.dot(&n).abs() < EPS);
            assert!(b.dot(&n).abs() < EPS);
            let up = tangent_to_world(&n, &Vector3::new(0.0, 0.0, 1.0));
            assert!((up - n).norm() < EPS);
        }
    }

    #[test]
    fn samplers_are_in_unit_interval() {
        let mut sampler = Sampler::from_entropy();
        for _ in 0..10_000 {
            let u = sampler.next();
            assert!((0.0..1.0).contains(&u));
        }
    }
}
