//! Weight initialization helpers

use aprender::autograd::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Standard deviation used for embedding tables
pub(crate) const EMBEDDING_INIT_STD: f32 = 0.02;

/// Sample a normally distributed weight tensor
///
/// Uses the Box-Muller transform over `StdRng` so that a given seed always
/// produces the same weights.
///
/// # Arguments
/// * `shape` - Tensor shape
/// * `std` - Standard deviation of the distribution (mean is zero)
/// * `seed` - Optional random seed (None = entropy-seeded)
pub(crate) fn init_normal(shape: &[usize], std: f32, seed: Option<u64>) -> Tensor {
    let numel: usize = shape.iter().product();
    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };

    let data: Vec<f32> = (0..numel)
        .map(|_| {
            let u1: f32 = rng.gen_range(0.0001_f32..1.0_f32);
            let u2: f32 = rng.gen_range(0.0_f32..1.0_f32);
            let z = (-2.0_f32 * u1.ln()).sqrt() * (2.0_f32 * std::f32::consts::PI * u2).cos();
            std * z
        })
        .collect();

    Tensor::new(&data, shape)
}

/// Derive a distinct sub-seed for a component of the model
///
/// Keeps initialization reproducible while avoiding identical weights in
/// sibling layers.
pub(crate) fn derive_seed(seed: Option<u64>, salt: u64) -> Option<u64> {
    seed.map(|s| s.wrapping_mul(6364136223846793005).wrapping_add(salt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_normal_shape() {
        let w = init_normal(&[20, 10], 0.02, Some(42));
        assert_eq!(w.shape(), &[20, 10]);
    }

    #[test]
    fn test_init_normal_reproducible() {
        let a = init_normal(&[8, 8], 0.02, Some(123));
        let b = init_normal(&[8, 8], 0.02, Some(123));
        assert_eq!(a.data(), b.data());
    }

    #[test]
    fn test_init_normal_std() {
        let w = init_normal(&[100, 100], 0.5, Some(7));
        let data = w.data();
        let mean: f32 = data.iter().sum::<f32>() / data.len() as f32;
        let var: f32 = data.iter().map(|&x| (x - mean).powi(2)).sum::<f32>() / data.len() as f32;
        let std = var.sqrt();
        assert!((std - 0.5).abs() < 0.1, "std {std} too far from 0.5");
    }

    #[test]
    fn test_derive_seed_distinct_salts() {
        assert_ne!(derive_seed(Some(1), 0), derive_seed(Some(1), 1));
        assert_eq!(derive_seed(None, 3), None);
    }
}
