use crate::constants::SINGULAR_EIGENVALUE;
use crate::make_error;
use eyre::{Report, WrapErr};
use ndarray::prelude::*;
use ndarray_linalg::Eigh;
use ndarray_linalg::UPLO::Lower;

#[derive(Clone, Debug)]
struct Decomposition {
  eigvals: Array1<f64>,
  eigvecs: Array2<f64>,
  inverse: Array2<f64>,
}

/// Lazily maintained eigendecomposition of a symmetric source matrix.
///
/// Derived quantities (eigenvalues, inverse, log-determinant,
/// positive-definiteness) are valid only while the cache is clean. `touch`
/// invalidates without computing; the next derived read recomputes exactly
/// once. Eigen-solver non-convergence surfaces as a catchable error at the
/// read site; a non-positive spectrum is not an error here, callers treat
/// the affected quantities as log-probability -inf.
#[derive(Clone, Debug)]
pub struct DecomposedMatrix {
  source: Array2<f64>,
  decomposition: Option<Decomposition>,
  n_recomputations: u64,
}

impl DecomposedMatrix {
  pub fn new(source: Array2<f64>) -> Result<Self, Report> {
    if !source.is_square() {
      return make_error!(
        "Expected a square matrix, but got shape {:?}",
        source.shape()
      );
    }
    Ok(Self {
      source,
      decomposition: None,
      n_recomputations: 0,
    })
  }

  pub fn source(&self) -> &Array2<f64> {
    &self.source
  }

  pub fn dim(&self) -> usize {
    self.source.nrows()
  }

  /// Marks the derived quantities stale. Never computes, never fails.
  pub fn touch(&mut self) {
    self.decomposition = None;
  }

  /// Replaces the source matrix and invalidates the derived quantities.
  pub fn set_source(&mut self, source: Array2<f64>) -> Result<(), Report> {
    if source.shape() != self.source.shape() {
      return make_error!(
        "Expected the replacement matrix to have shape {:?}, but got {:?}",
        self.source.shape(),
        source.shape()
      );
    }
    self.source = source;
    self.touch();
    Ok(())
  }

  pub fn is_clean(&self) -> bool {
    self.decomposition.is_some()
  }

  /// Number of eigendecompositions performed so far. One per touch, at most.
  pub fn n_recomputations(&self) -> u64 {
    self.n_recomputations
  }

  fn ensure_clean(&mut self) -> Result<&Decomposition, Report> {
    if self.decomposition.is_none() {
      let (eigvals, eigvecs) = self
        .source
        .eigh(Lower)
        .wrap_err("When computing eigendecomposition of a symmetric matrix")?;

      // inverse = V diag(1/lambda) V^T; singular directions become non-finite,
      // callers check the spectrum before reading the inverse
      let inv_lambda = eigvals.mapv(|lambda| {
        if lambda.abs() < SINGULAR_EIGENVALUE {
          f64::INFINITY
        } else {
          1.0 / lambda
        }
      });
      let inverse = eigvecs.dot(&Array2::from_diag(&inv_lambda)).dot(&eigvecs.t());

      self.decomposition = Some(Decomposition {
        eigvals,
        eigvecs,
        inverse,
      });
      self.n_recomputations += 1;
    }

    Ok(self.decomposition.as_ref().expect("decomposition was just computed"))
  }

  pub fn eigenvalues(&mut self) -> Result<&Array1<f64>, Report> {
    Ok(&self.ensure_clean()?.eigvals)
  }

  /// Orthonormal eigenvectors, one per column, in the order of `eigenvalues`.
  pub fn eigenvectors(&mut self) -> Result<&Array2<f64>, Report> {
    Ok(&self.ensure_clean()?.eigvecs)
  }

  pub fn inverse(&mut self) -> Result<&Array2<f64>, Report> {
    Ok(&self.ensure_clean()?.inverse)
  }

  pub fn is_positive_definite(&mut self) -> Result<bool, Report> {
    let decomposition = self.ensure_clean()?;
    Ok(decomposition.eigvals.iter().all(|&lambda| lambda > 0.0))
  }

  /// Sum of log-eigenvalues. `None` if any eigenvalue is not strictly
  /// positive: the log-determinant is then undefined and the caller must
  /// treat the model density as log-probability -inf, never as a crash.
  pub fn log_determinant(&mut self) -> Result<Option<f64>, Report> {
    let decomposition = self.ensure_clean()?;
    if decomposition.eigvals.iter().any(|&lambda| lambda <= 0.0) {
      return Ok(None);
    }
    Ok(Some(decomposition.eigvals.mapv(f64::ln).sum()))
  }
}
