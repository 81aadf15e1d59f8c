use crate::kernel::kernel::{ChildContribution, KernelError, LikelihoodKernel};
use crate::kernel::rates::{BranchRates, SiteRates};
use crate::tree::tree::{NodeIndex, Tree};
use crate::{make_error, make_internal_report};
use eyre::Report;
use ndarray::prelude::*;
use statrs::distribution::{Continuous, Normal};

/// Per-node state of the contrasts recursion: the weighted trait average of
/// the subtree, the uncertainty propagated from the subtree's branches, and
/// the per-site accumulated log-likelihood of the contrasts below this node.
#[derive(Clone, Debug, Default)]
pub struct BrownianValue {
  pub mu: Array1<f64>,
  pub uncertainty: f64,
  pub partial: Array1<f64>,
}

/// Brownian-motion likelihood of continuous traits via the REML contrasts
/// recursion: each internal node contributes the normal density of the
/// contrast between its two children, with variance given by the
/// rate-rescaled branch lengths plus the propagated uncertainties.
#[derive(Clone, Debug)]
pub struct BrownianKernel {
  tip_values: Vec<Option<Array1<f64>>>,
  branch_rates: BranchRates,
  site_rates: SiteRates,
  n_sites: usize,
}

impl BrownianKernel {
  pub fn new(num_nodes: usize, branch_rates: BranchRates, site_rates: SiteRates) -> Self {
    Self {
      tip_values: vec![None; num_nodes],
      branch_rates,
      site_rates,
      n_sites: 0,
    }
  }

  pub fn set_tip_values(&mut self, node: NodeIndex, values: Array1<f64>) -> Result<(), Report> {
    if node.0 >= self.tip_values.len() {
      return make_error!("Node {node} is outside of the tree");
    }
    if self.n_sites == 0 {
      self.n_sites = values.len();
    } else if values.len() != self.n_sites {
      return make_error!(
        "Expected {} trait values for node {node}, but got {}",
        self.n_sites,
        values.len()
      );
    }
    self.tip_values[node.0] = Some(values);
    Ok(())
  }

  pub fn n_sites(&self) -> usize {
    self.n_sites
  }

  pub fn set_branch_rates(&mut self, branch_rates: BranchRates) {
    self.branch_rates = branch_rates;
  }

  pub fn set_site_rates(&mut self, site_rates: SiteRates) {
    self.site_rates = site_rates;
  }

  fn out_of_support(&self) -> BrownianValue {
    BrownianValue {
      mu: Array1::zeros(self.n_sites),
      uncertainty: 0.0,
      partial: Array1::from_elem(self.n_sites, f64::NEG_INFINITY),
    }
  }
}

impl LikelihoodKernel for BrownianKernel {
  type Value = BrownianValue;

  fn validate(&self, tree: &Tree) -> Result<(), Report> {
    if self.n_sites == 0 {
      return Err(make_internal_report!("No tip values have been attached to the model"));
    }
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
    if let SiteRates::PerSite(rates) = &self.site_rates {
      if rates.len() != self.n_sites {
        return Err(make_internal_report!(
          "Expected {} site rates, but got {}",
          self.n_sites,
          rates.len()
        ));
      }
    }
    Ok(())
  }

  fn leaf_value(&mut self, node: NodeIndex) -> Result<Self::Value, KernelError> {
    let mu = self.tip_values[node.0]
      .clone()
      .ok_or_else(|| KernelError::Structural(make_internal_report!("Tip {node} has no observed trait values")))?;
    Ok(BrownianValue {
      mu,
      uncertainty: 0.0,
      partial: Array1::zeros(self.n_sites),
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

    // scaled branch lengths plus the propagated uncertainties
    let t_left = self.branch_rates.branch_time(left.node, left.branch_length) + left.value.uncertainty;
    let t_right = self.branch_rates.branch_time(right.node, right.branch_length) + right.value.uncertainty;
    let t_total = t_left + t_right;
    if !t_total.is_finite() || t_total <= 0.0 {
      return Ok(self.out_of_support());
    }

    let stdev = t_total.sqrt();
    let mut mu = Array1::zeros(self.n_sites);
    let mut partial = Array1::zeros(self.n_sites);
    for i in 0..self.n_sites {
      mu[i] = (left.value.mu[i] * t_right + right.value.mu[i] * t_left) / t_total;

      let contrast = left.value.mu[i] - right.value.mu[i];
      let sd = self.site_rates.rate(i) * stdev;
      let lnl = match Normal::new(0.0, sd) {
        Ok(normal) => normal.ln_pdf(contrast),
        Err(_) => f64::NEG_INFINITY,
      };
      partial[i] = lnl + left.value.partial[i] + right.value.partial[i];
    }

    Ok(BrownianValue {
      mu,
      uncertainty: (t_left * t_right) / t_total,
      partial,
    })
  }

  fn root_reduce(&mut self, _root: NodeIndex, value: &Self::Value) -> Result<f64, KernelError> {
    Ok(value.partial.sum())
  }
}
