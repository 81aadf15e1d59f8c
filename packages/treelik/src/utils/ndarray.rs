use eyre::Report;
use ndarray::{Array, Array1, Array2, Dimension, Ix2};
use num_traits::real::Real;

// Calculates outer product of 2 vectors
pub fn outer<T: 'static + Real>(a: &Array1<T>, b: &Array1<T>) -> Result<Array2<T>, Report> {
  let a = a.to_shape((a.len(), 1))?.into_dimensionality::<Ix2>()?;
  let b = b.to_shape((1, b.len()))?.into_dimensionality::<Ix2>()?;
  Ok(a.dot(&b))
}

/// Clamp each element to at least `lower`
pub fn clamp_min<T: Copy + PartialOrd, D: Dimension>(a: &Array<T, D>, lower: T) -> Array<T, D> {
  a.mapv(|x| num_traits::clamp_min(x, lower))
}

/// Log of the sum of exponentials, stabilized by the maximum element.
/// Returns -inf for an empty input or when every element is -inf.
pub fn log_sum_exp(a: &Array1<f64>) -> f64 {
  let max = a.iter().copied().fold(f64::NEG_INFINITY, f64::max);
  if !max.is_finite() {
    return max;
  }
  max + a.mapv(|x| (x - max).exp()).sum().ln()
}
