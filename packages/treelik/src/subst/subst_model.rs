use crate::make_error;
use crate::utils::ndarray::{clamp_min, outer};
use eyre::{Report, WrapErr};
use ndarray::prelude::*;
use ndarray_linalg::Eigh;
use ndarray_linalg::UPLO::Lower;

/// Average transition rate of the chain at equilibrium: pi' W pi.
/// Used to normalize the model so that time is measured in expected
/// substitutions per site.
fn avg_transition(W: &Array2<f64>, pi: &Array1<f64>) -> f64 {
  pi.dot(&W.dot(pi))
}

/// Eigendecomposition of the rate matrix, performed in the space symmetrized
/// by sqrt(pi). The left and right eigenvector matrices convert likelihood
/// profiles to the eigenspace and back, which reduces every transition-matrix
/// evaluation to scaling by exp(lambda_i mu t).
/// NOTE: this assumes the diagonal of W is all zeros.
#[allow(clippy::type_complexity)]
fn eig_symmetrized(W: &Array2<f64>, pi: &Array1<f64>) -> Result<(Array1<f64>, Array2<f64>, Array2<f64>), Report> {
  debug_assert!(W.diag().sum().abs() < 1e-10);

  let sqrt_pi: Array1<f64> = pi.mapv(f64::sqrt);
  let mut sym_Q: Array2<f64> = W * outer(&sqrt_pi, &sqrt_pi)?;

  let diag = -(W * pi).sum_axis(Axis(1));
  sym_Q.diag_mut().assign(&diag);

  let (eigvals, eigvecs) = sym_Q
    .eigh(Lower)
    .wrap_err("When computing eigendecomposition of the symmetrized rate matrix")?;

  let tmp_v: Array2<f64> = eigvecs.t().to_owned() * sqrt_pi.to_owned();
  let one_norm: Array1<f64> = tmp_v.mapv(f64::abs).sum_axis(Axis(1));

  let v = tmp_v.t().to_owned() / &one_norm;
  let v_inv = (eigvecs * one_norm).t().to_owned() / sqrt_pi;

  Ok((eigvals, v, v_inv))
}

#[derive(Clone, Debug)]
struct SubstEig {
  eigvals: Array1<f64>,
  v: Array2<f64>,
  v_inv: Array2<f64>,
  mu_scaled: f64,
}

#[derive(Clone, Debug)]
pub struct SubstParams {
  pub mu: f64,
  pub W: Array2<f64>,
  pub pi: Array1<f64>,
}

/// General time-reversible model of character substitution: a symmetric
/// exchangeability matrix `W` and stationary frequencies `pi`, normalized so
/// that `mu` is the expected substitution rate at equilibrium.
///
/// The eigendecomposition backing `transition_matrix` follows the lazy cache
/// discipline: `set_rates`/`set_frequencies`/`set_mu` only mark it stale, and
/// the next read recomputes exactly once.
#[derive(Clone, Debug)]
pub struct SubstModel {
  n_states: usize,
  mu: f64,
  W: Array2<f64>,
  pi: Array1<f64>,
  eig: Option<SubstEig>,
  n_decompositions: u64,
}

impl SubstModel {
  pub fn new(SubstParams { mu, W, pi }: SubstParams) -> Result<Self, Report> {
    let n_states = pi.len();
    if n_states < 2 {
      return make_error!("Substitution model requires at least 2 states, but got {n_states}");
    }
    if W.nrows() != n_states || W.ncols() != n_states {
      return make_error!(
        "Dimensions of the exchangeability matrix {:?} don't match the number of states {n_states}",
        W.shape()
      );
    }
    if pi.iter().any(|&p| p < 0.0) || pi.sum() <= 0.0 {
      return make_error!("Stationary frequencies must be non-negative and sum to a positive value");
    }
    Ok(Self {
      n_states,
      mu,
      W,
      pi,
      eig: None,
      n_decompositions: 0,
    })
  }

  pub fn n_states(&self) -> usize {
    self.n_states
  }

  /// Normalized stationary frequencies.
  pub fn pi(&self) -> Array1<f64> {
    &self.pi / self.pi.sum()
  }

  pub fn n_decompositions(&self) -> u64 {
    self.n_decompositions
  }

  /// Marks the cached decomposition stale. Never computes.
  pub fn touch(&mut self) {
    self.eig = None;
  }

  pub fn set_rates(&mut self, W: Array2<f64>) -> Result<(), Report> {
    if W.nrows() != self.n_states || W.ncols() != self.n_states {
      return make_error!(
        "Dimensions of the exchangeability matrix {:?} don't match the number of states {}",
        W.shape(),
        self.n_states
      );
    }
    self.W = W;
    self.touch();
    Ok(())
  }

  pub fn set_frequencies(&mut self, pi: Array1<f64>) -> Result<(), Report> {
    if pi.len() != self.n_states {
      return make_error!(
        "Length of the frequency vector {} doesn't match the number of states {}",
        pi.len(),
        self.n_states
      );
    }
    if pi.iter().any(|&p| p < 0.0) || pi.sum() <= 0.0 {
      return make_error!("Stationary frequencies must be non-negative and sum to a positive value");
    }
    self.pi = pi;
    self.touch();
    Ok(())
  }

  pub fn set_mu(&mut self, mu: f64) {
    self.mu = mu;
    self.touch();
  }

  fn ensure_clean(&mut self) -> Result<&SubstEig, Report> {
    if self.eig.is_none() {
      let W = {
        let mut W = 0.5 * (&self.W.view() + &self.W.t());
        W.diag_mut().fill(0.0);
        W
      };

      let pi = self.pi();

      let average_rate = avg_transition(&W, &pi);
      if average_rate <= 0.0 {
        return make_error!("Average transition rate must be positive, but is {average_rate}");
      }

      let mu_scaled = self.mu * average_rate;
      let W = W / average_rate;

      let (eigvals, v, v_inv) = eig_symmetrized(&W, &pi)?;

      self.eig = Some(SubstEig {
        eigvals,
        v,
        v_inv,
        mu_scaled,
      });
      self.n_decompositions += 1;
    }

    Ok(self.eig.as_ref().expect("decomposition was just computed"))
  }

  /// Matrix exponential exp(Q t): the matrix of transition probabilities
  /// after time t, clamped to non-negative entries.
  pub fn transition_matrix(&mut self, t: f64) -> Result<Array2<f64>, Report> {
    let eig = self.ensure_clean()?;
    let e_lambda_t: Array2<f64> = Array2::from_diag(&(eig.mu_scaled * t * &eig.eigvals).mapv(f64::exp));
    let Qt: Array2<f64> = eig.v.dot(&e_lambda_t.dot(&eig.v_inv));
    Ok(clamp_min(&Qt, 0.0))
  }
}

#[cfg(test)]
mod tests {
  #![allow(clippy::excessive_precision)]

  use super::*;
  use approx::assert_ulps_eq;
  use eyre::Report;
  use lazy_static::lazy_static;
  use ndarray::array;
  use rstest::rstest;

  lazy_static! {
    static ref FIVE_STATE_PI: Array1<f64> = array![0.1, 0.15, 0.3, 0.4, 0.05];
  }

  fn two_state_symmetric() -> Result<SubstModel, Report> {
    SubstModel::new(SubstParams {
      mu: 1.0,
      W: array![[0.0, 1.0], [1.0, 0.0]],
      pi: array![0.5, 0.5],
    })
  }

  #[rstest]
  fn avg_transition_of_uniform_chain() {
    let pi = array![1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0];
    let W: Array2<f64> = array![
      [0.0, 4.0 / 3.0, 4.0 / 3.0],
      [4.0 / 3.0, 0.0, 4.0 / 3.0],
      [4.0 / 3.0, 4.0 / 3.0, 0.0],
    ];
    assert_ulps_eq!(avg_transition(&W, &pi), 8.0 / 9.0, epsilon = 1e-14);
  }

  #[rstest]
  fn transition_matrix_matches_two_state_closed_form() -> Result<(), Report> {
    let mut model = two_state_symmetric()?;

    // For the normalized symmetric two-state chain, P_stay(t) = (1 + e^-t)/2
    for t in [0.0, 0.1, 0.5, 2.0] {
      let P = model.transition_matrix(t)?;
      let p_stay = 0.5 * (1.0 + (-t).exp());
      let p_move = 0.5 * (1.0 - (-t).exp());
      assert_ulps_eq!(P[[0, 0]], p_stay, epsilon = 1e-12);
      assert_ulps_eq!(P[[1, 1]], p_stay, epsilon = 1e-12);
      assert_ulps_eq!(P[[0, 1]], p_move, epsilon = 1e-12);
      assert_ulps_eq!(P[[1, 0]], p_move, epsilon = 1e-12);
    }
    Ok(())
  }

  #[rstest]
  fn transition_matrix_rows_sum_to_one_and_tend_to_pi() -> Result<(), Report> {
    let pi = FIVE_STATE_PI.clone();
    let W = {
      let W = array![
        [0.0, 0.2, 0.5, 0.2, 0.1],
        [0.0, 0.0, 0.3, 0.5, 0.1],
        [0.0, 0.0, 0.0, 0.1, 0.1],
        [0.0, 0.0, 0.0, 0.0, 0.1],
        [0.0, 0.0, 0.0, 0.0, 0.0]
      ];
      &W + &W.t()
    };
    let mut model = SubstModel::new(SubstParams { mu: 1.0, W, pi: pi.clone() })?;

    let P = model.transition_matrix(0.37)?;
    for row in P.rows() {
      assert_ulps_eq!(row.sum(), 1.0, epsilon = 1e-12);
    }

    // propagating far into the future gives the equilibrium frequencies
    let P_distant = model.transition_matrix(1000.0)?;
    for row in P_distant.rows() {
      assert_ulps_eq!(row.to_owned(), pi, epsilon = 1e-12);
    }
    Ok(())
  }

  #[rstest]
  fn parameter_updates_recompute_lazily_and_once() -> Result<(), Report> {
    let mut model = two_state_symmetric()?;
    assert_eq!(model.n_decompositions(), 0);

    model.transition_matrix(0.1)?;
    model.transition_matrix(0.2)?;
    assert_eq!(model.n_decompositions(), 1);

    model.set_mu(2.0);
    assert_eq!(model.n_decompositions(), 1);
    let P = model.transition_matrix(0.1)?;
    assert_eq!(model.n_decompositions(), 2);

    // doubling mu halves the time to the same transition matrix
    let mut reference = two_state_symmetric()?;
    assert_ulps_eq!(P, reference.transition_matrix(0.2)?, epsilon = 1e-12);

    model.set_frequencies(array![0.3, 0.7])?;
    model.set_rates(array![[0.0, 2.0], [2.0, 0.0]])?;
    model.transition_matrix(0.1)?;
    assert_eq!(model.n_decompositions(), 3);

    Ok(())
  }

  #[rstest]
  fn rejects_malformed_parameters() {
    assert!(SubstModel::new(SubstParams {
      mu: 1.0,
      W: Array2::zeros((3, 3)),
      pi: array![0.5, 0.5],
    })
    .is_err());

    assert!(SubstModel::new(SubstParams {
      mu: 1.0,
      W: array![[0.0, 1.0], [1.0, 0.0]],
      pi: array![-0.5, 1.5],
    })
    .is_err());
  }
}
