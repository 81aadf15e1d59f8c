use crate::cache::decomposition::DecomposedMatrix;
use crate::kernel::kernel::{ChildContribution, KernelError, LikelihoodKernel};
use crate::kernel::rates::BranchRates;
use crate::tree::tree::{NodeIndex, Tree};
use crate::{make_error, make_internal_report};
use eyre::Report;
use ndarray::prelude::*;

/// Per-node state of the multivariate contrasts recursion: the weighted trait
/// vector of the subtree, the propagated uncertainty, and the accumulated
/// log-likelihood of the contrasts below this node.
#[derive(Clone, Debug, Default)]
pub struct MultivariateValue {
  pub mu: Array1<f64>,
  pub uncertainty: f64,
  pub ln_partial: f64,
}

/// Multivariate Brownian-motion likelihood: like the single-trait contrasts
/// recursion, but each contrast is a vector scored under a zero-mean
/// multivariate normal with covariance `t * Sigma`, where `Sigma` is the
/// shared trait covariance held behind the lazy decomposition cache.
#[derive(Clone, Debug)]
pub struct MultivariateBrownianKernel {
  tip_values: Vec<Option<Array1<f64>>>,
  branch_rates: BranchRates,
  covariance: DecomposedMatrix,
  n_traits: usize,
}

impl MultivariateBrownianKernel {
  pub fn new(num_nodes: usize, branch_rates: BranchRates, covariance: DecomposedMatrix) -> Self {
    let n_traits = covariance.dim();
    Self {
      tip_values: vec![None; num_nodes],
      branch_rates,
      covariance,
      n_traits,
    }
  }

  pub fn set_tip_values(&mut self, node: NodeIndex, values: Array1<f64>) -> Result<(), Report> {
    if node.0 >= self.tip_values.len() {
      return make_error!("Node {node} is outside of the tree");
    }
    if values.len() != self.n_traits {
      return make_error!(
        "Expected {} trait values for node {node}, but got {}",
        self.n_traits,
        values.len()
      );
    }
    self.tip_values[node.0] = Some(values);
    Ok(())
  }

  /// The trait covariance cache, for proposals that perturb the covariance.
  /// Callers must touch the owning model afterwards.
  pub fn covariance_mut(&mut self) -> &mut DecomposedMatrix {
    &mut self.covariance
  }

  fn out_of_support(&self) -> MultivariateValue {
    MultivariateValue {
      mu: Array1::zeros(self.n_traits),
      uncertainty: 0.0,
      ln_partial: f64::NEG_INFINITY,
    }
  }
}

impl LikelihoodKernel for MultivariateBrownianKernel {
  type Value = MultivariateValue;

  fn validate(&self, tree: &Tree) -> Result<(), Report> {
    for node in (0..tree.num_nodes()).map(NodeIndex) {
      let has_values = self.tip_values[node.0].is_some();
      if tree.is_leaf(node) && !has_values {
        return Err(make_internal_report!("Tip {node} has no observed trait values"));
      }
      if !tree.is_leaf(node) {
        if has_values {
          return Err(make_internal_report!(
            "Node {node} has observed trait values attached but is not a tip"
          ));
        }
        if tree.children(node).len() != 2 {
          return Err(make_internal_report!(
            "The contrasts recursion requires a binary tree, but node {node} has {} children",
            tree.children(node).len()
          ));
        }
      }
    }
    Ok(())
  }

  fn leaf_value(&mut self, node: NodeIndex) -> Result<Self::Value, KernelError> {
    let mu = self.tip_values[node.0]
      .clone()
      .ok_or_else(|| KernelError::Structural(make_internal_report!("Tip {node} has no observed trait values")))?;
    Ok(MultivariateValue {
      mu,
      uncertainty: 0.0,
      ln_partial: 0.0,
    })
  }

  fn internal_value(
    &mut self,
    node: NodeIndex,
    children: &[ChildContribution<Self::Value>],
  ) -> Result<Self::Value, KernelError> {
    let [left, right] = children else {
      return Err(KernelError::Structural(make_internal_report!(
        "The contrasts recursion requires a binary tree, but node {node} has {} children",
        children.len()
      )));
    };

    let t_left = self.branch_rates.branch_time(left.node, left.branch_length) + left.value.uncertainty;
    let t_right = self.branch_rates.branch_time(right.node, right.branch_length) + right.value.uncertainty;
    let t_total = t_left + t_right;
    if !t_total.is_finite() || t_total <= 0.0 {
      return Ok(self.out_of_support());
    }

    // a covariance outside the cone of positive-definite matrices is a
    // proposal excursion, not an error
    let positive_definite = self
      .covariance
      .is_positive_definite()
      .map_err(KernelError::Decomposition)?;
    if !positive_definite {
      return Ok(self.out_of_support());
    }

    let log_det = self
      .covariance
      .log_determinant()
      .map_err(KernelError::Decomposition)?
      .expect("positive-definite matrix must have a log-determinant");
    let inverse = self.covariance.inverse().map_err(KernelError::Decomposition)?;

    let contrast = &left.value.mu - &right.value.mu;
    let mahalanobis = contrast.dot(&inverse.dot(&contrast));

    let k = self.n_traits as f64;
    let ln_2pi = (2.0 * std::f64::consts::PI).ln();
    let lnl = -0.5 * (k * ln_2pi + k * t_total.ln() + log_det + mahalanobis / t_total);

    let mu = (&left.value.mu * t_right + &right.value.mu * t_left) / t_total;

    Ok(MultivariateValue {
      mu,
      uncertainty: (t_left * t_right) / t_total,
      ln_partial: lnl + left.value.ln_partial + right.value.ln_partial,
    })
  }

  fn root_reduce(&mut self, _root: NodeIndex, value: &Self::Value) -> Result<f64, KernelError> {
    Ok(value.ln_partial)
  }
}
