//! Numerical stability checks

use anyhow::Result;
use aprender::autograd::Tensor;

/// Check if a tensor contains any NaN values
pub fn has_nan(tensor: &Tensor) -> bool {
    tensor.data().iter().any(|&x| x.is_nan())
}

/// Check if a tensor contains any Inf values
pub fn has_inf(tensor: &Tensor) -> bool {
    tensor.data().iter().any(|&x| x.is_infinite())
}

/// True when every value in the slice is finite
pub fn all_finite(values: &[f32]) -> bool {
    values.iter().all(|v| v.is_finite())
}

/// Validate that a tensor contains neither NaN nor Inf values
///
/// # Arguments
/// * `tensor` - Tensor to validate
/// * `name` - Name used in the error message
pub fn validate_tensor(tensor: &Tensor, name: &str) -> Result<()> {
    if has_nan(tensor) {
        anyhow::bail!("tensor '{}' contains NaN values", name);
    }
    if has_inf(tensor) {
        anyhow::bail!("tensor '{}' contains Inf values", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_finite_tensor() {
        let tensor = Tensor::ones(&[2, 3]);
        assert!(validate_tensor(&tensor, "test").is_ok());
    }

    #[test]
    fn test_detects_nan() {
        let tensor = Tensor::new(&[1.0, f32::NAN], &[2]);
        assert!(has_nan(&tensor));
        assert!(validate_tensor(&tensor, "bad").is_err());
    }

    #[test]
    fn test_detects_inf() {
        let tensor = Tensor::new(&[1.0, f32::INFINITY], &[2]);
        assert!(has_inf(&tensor));
        assert!(!has_nan(&tensor));
    }

    #[test]
    fn test_all_finite_slice() {
        assert!(all_finite(&[0.0, -1.0, 2.5]));
        assert!(!all_finite(&[0.0, f32::NEG_INFINITY]));
    }
}
