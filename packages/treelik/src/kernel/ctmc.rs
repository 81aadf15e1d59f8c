use crate::constants::PROB_TOLERANCE;
use crate::kernel::kernel::{ChildContribution, KernelError, LikelihoodKernel};
use crate::kernel::rates::BranchRates;
use crate::subst::subst_model::SubstModel;
use crate::tree::tree::{NodeIndex, Tree};
use crate::utils::ndarray::log_sum_exp;
use crate::{make_error, make_internal_report};
use eyre::Report;
use ndarray::prelude::*;
use smart_default::SmartDefault;

/// Sampling scheme the observed characters were collected under.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AscertainmentBias {
  /// All site patterns were observable.
  #[default]
  None,
  /// Constant sites could not have been observed; the probability mass of
  /// the constant patterns is removed from the total in log space.
  VariableSitesOnly,
}

#[derive(Clone, Copy, Debug, SmartDefault)]
pub struct CtmcOptions {
  /// Rescale per-site likelihood vectors at every internal node and carry the
  /// log-correction alongside, to avoid underflow on deep trees.
  #[default = true]
  pub rescale_likelihoods: bool,
  pub ascertainment: AscertainmentBias,
}

/// Per-node state of the pruning recursion: conditional likelihoods of the
/// subtree below the node, one row per site pattern (observed patterns first,
/// then any virtual constant patterns used by the ascertainment correction),
/// plus the accumulated per-pattern log-scaling corrections.
#[derive(Clone, Debug, Default)]
pub struct CtmcValue {
  pub profile: Array2<f64>,
  pub log_scale: Array1<f64>,
}

/// Likelihood of discrete characters under a continuous-time Markov chain,
/// computed by the postorder pruning recursion: child profiles are propagated
/// through the branch transition matrices and multiplied elementwise; the
/// root reduction weights by the stationary frequencies.
#[derive(Clone, Debug)]
pub struct CtmcKernel {
  model: SubstModel,
  tip_profiles: Vec<Option<Array2<f64>>>,
  branch_rates: BranchRates,
  options: CtmcOptions,
  n_sites: usize,
}

impl CtmcKernel {
  pub fn new(num_nodes: usize, model: SubstModel, branch_rates: BranchRates, options: CtmcOptions) -> Self {
    Self {
      model,
      tip_profiles: vec![None; num_nodes],
      branch_rates,
      options,
      n_sites: 0,
    }
  }

  /// Attaches observed character states to a tip, one state index per site.
  pub fn set_tip_states(&mut self, node: NodeIndex, states: &[usize]) -> Result<(), Report> {
    if node.0 >= self.tip_profiles.len() {
      return make_error!("Node {node} is outside of the tree");
    }
    if self.n_sites == 0 {
      self.n_sites = states.len();
    } else if states.len() != self.n_sites {
      return make_error!(
        "Expected {} character states for node {node}, but got {}",
        self.n_sites,
        states.len()
      );
    }

    let n_states = self.model.n_states();
    let mut profile = Array2::zeros((self.n_patterns(), n_states));
    for (site, &state) in states.iter().enumerate() {
      if state >= n_states {
        return make_error!("Character state {state} at site {site} is outside of the {n_states}-state alphabet");
      }
      profile[[site, state]] = 1.0;
    }
    // virtual constant patterns share the partials machinery of the data
    for k in 0..self.n_virtual_patterns() {
      profile[[self.n_sites + k, k]] = 1.0;
    }

    self.tip_profiles[node.0] = Some(profile);
    Ok(())
  }

  pub fn n_sites(&self) -> usize {
    self.n_sites
  }

  fn n_virtual_patterns(&self) -> usize {
    match self.options.ascertainment {
      AscertainmentBias::None => 0,
      AscertainmentBias::VariableSitesOnly => self.model.n_states(),
    }
  }

  fn n_patterns(&self) -> usize {
    self.n_sites + self.n_virtual_patterns()
  }

  /// The substitution model, for proposals that perturb rates or frequencies.
  /// Callers must touch the owning likelihood model afterwards.
  pub fn model_mut(&mut self) -> &mut SubstModel {
    &mut self.model
  }

  fn out_of_support(&self) -> CtmcValue {
    CtmcValue {
      profile: Array2::ones((self.n_patterns(), self.model.n_states())),
      log_scale: Array1::from_elem(self.n_patterns(), f64::NEG_INFINITY),
    }
  }
}

impl LikelihoodKernel for CtmcKernel {
  type Value = CtmcValue;

  fn validate(&self, tree: &Tree) -> Result<(), Report> {
    if self.n_sites == 0 {
      return Err(make_internal_report!("No character data have been attached to the model"));
    }
    for node in (0..tree.num_nodes()).map(NodeIndex) {
      let has_profile = self.tip_profiles[node.0].is_some();
      if tree.is_leaf(node) && !has_profile {
        return Err(make_internal_report!("Tip {node} has no observed characters"));
      }
      if !tree.is_leaf(node) && has_profile {
        return Err(make_internal_report!(
          "Node {node} has observed characters attached but is not a tip"
        ));
      }
    }
    Ok(())
  }

  fn leaf_value(&mut self, node: NodeIndex) -> Result<Self::Value, KernelError> {
    let profile = self.tip_profiles[node.0]
      .clone()
      .ok_or_else(|| KernelError::Structural(make_internal_report!("Tip {node} has no observed characters")))?;
    Ok(CtmcValue {
      profile,
      log_scale: Array1::zeros(self.n_patterns()),
    })
  }

  fn internal_value(
    &mut self,
    node: NodeIndex,
    children: &[ChildContribution<Self::Value>],
  ) -> Result<Self::Value, KernelError> {
    if children.len() < 2 {
      return Err(KernelError::Structural(make_internal_report!(
        "Internal node {node} has {} children; at least 2 are required",
        children.len()
      )));
    }

    let n_patterns = self.n_patterns();
    let mut profile = Array2::ones((n_patterns, self.model.n_states()));
    let mut log_scale = Array1::zeros(n_patterns);

    for child in children {
      let t = self.branch_rates.branch_time(child.node, child.branch_length);
      if t.is_nan() {
        return Ok(self.out_of_support());
      }
      let P = self.model.transition_matrix(t).map_err(KernelError::Decomposition)?;
      if P.iter().any(|&p| p > 1.0 + PROB_TOLERANCE) {
        return Ok(self.out_of_support());
      }

      profile *= &child.value.profile.dot(&P);
      log_scale += &child.value.log_scale;
    }

    if self.options.rescale_likelihoods {
      for (i, mut row) in profile.outer_iter_mut().enumerate() {
        let norm = row.sum();
        if norm > 0.0 {
          row /= norm;
        }
        log_scale[i] += norm.ln();
      }
    }

    Ok(CtmcValue { profile, log_scale })
  }

  fn root_reduce(&mut self, _root: NodeIndex, value: &Self::Value) -> Result<f64, KernelError> {
    let pi = self.model.pi();

    let ln_patterns: Array1<f64> = value
      .profile
      .rows()
      .into_iter()
      .zip(value.log_scale.iter())
      .map(|(row, &log_scale)| row.dot(&pi).ln() + log_scale)
      .collect();

    let mut ln_prob: f64 = ln_patterns.slice(s![..self.n_sites]).sum();

    if self.options.ascertainment == AscertainmentBias::VariableSitesOnly {
      let ln_constant = log_sum_exp(&ln_patterns.slice(s![self.n_sites..]).to_owned());
      let p_constant = ln_constant.exp();
      if p_constant >= 1.0 {
        return Ok(f64::NEG_INFINITY);
      }
      ln_prob -= self.n_sites as f64 * (-p_constant).ln_1p();
    }

    Ok(ln_prob)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::engine::LikelihoodEngine;
  use crate::subst::subst_model::SubstParams;
  use approx::assert_ulps_eq;
  use eyre::Report;
  use ndarray::array;
  use rstest::rstest;

  fn two_state_model() -> Result<SubstModel, Report> {
    SubstModel::new(SubstParams {
      mu: 1.0,
      W: array![[0.0, 1.0], [1.0, 0.0]],
      pi: array![0.5, 0.5],
    })
  }

  fn two_tip_engine(
    states_a: &[usize],
    states_b: &[usize],
    t1: f64,
    t2: f64,
    options: CtmcOptions,
  ) -> Result<LikelihoodEngine<CtmcKernel>, Report> {
    let mut tree = Tree::new();
    let root = tree.add_root("R")?;
    let a = tree.add_child(root, "a", t1)?;
    let b = tree.add_child(root, "b", t2)?;

    let mut kernel = CtmcKernel::new(tree.num_nodes(), two_state_model()?, BranchRates::Homogeneous(1.0), options);
    kernel.set_tip_states(a, states_a)?;
    kernel.set_tip_states(b, states_b)?;

    LikelihoodEngine::new(tree, kernel)
  }

  /// For the normalized symmetric two-state chain, the likelihood of a pair of
  /// tips is (1 + e^-(t1+t2))/4 for matching states and (1 - e^-(t1+t2))/4 otherwise.
  fn two_tip_closed_form(same: bool, t1: f64, t2: f64) -> f64 {
    let p = (-(t1 + t2)).exp();
    if same {
      ((1.0 + p) / 4.0).ln()
    } else {
      ((1.0 - p) / 4.0).ln()
    }
  }

  #[rstest]
  fn two_tip_likelihood_matches_closed_form() -> Result<(), Report> {
    let mut engine = two_tip_engine(&[0, 0], &[0, 1], 0.3, 0.3, CtmcOptions::default())?;
    let ln_prob = engine.evaluate()?;
    let expected = two_tip_closed_form(true, 0.3, 0.3) + two_tip_closed_form(false, 0.3, 0.3);
    assert_ulps_eq!(ln_prob, expected, epsilon = 1e-12);
    Ok(())
  }

  #[rstest]
  fn rescaling_does_not_change_the_total() -> Result<(), Report> {
    let options_scaled = CtmcOptions {
      rescale_likelihoods: true,
      ..CtmcOptions::default()
    };
    let options_unscaled = CtmcOptions {
      rescale_likelihoods: false,
      ..CtmcOptions::default()
    };

    let mut tree = Tree::new();
    let root = tree.add_root("R")?;
    let a = tree.add_child(root, "A", 0.2)?;
    let b = tree.add_child(root, "B", 0.4)?;
    let t1 = tree.add_child(a, "1", 0.1)?;
    let t2 = tree.add_child(a, "2", 0.3)?;
    let t3 = tree.add_child(b, "3", 0.2)?;
    let t4 = tree.add_child(b, "4", 0.5)?;

    let mut totals = vec![];
    for options in [options_scaled, options_unscaled] {
      let mut kernel = CtmcKernel::new(tree.num_nodes(), two_state_model()?, BranchRates::Homogeneous(1.0), options);
      kernel.set_tip_states(t1, &[0, 1, 0])?;
      kernel.set_tip_states(t2, &[0, 0, 1])?;
      kernel.set_tip_states(t3, &[1, 0, 0])?;
      kernel.set_tip_states(t4, &[1, 1, 0])?;
      let mut engine = LikelihoodEngine::new(tree.clone(), kernel)?;
      totals.push(engine.evaluate()?);
    }
    assert_ulps_eq!(totals[0], totals[1], epsilon = 1e-12);
    Ok(())
  }

  #[rstest]
  fn ascertainment_correction_matches_closed_form() -> Result<(), Report> {
    let options = CtmcOptions {
      ascertainment: AscertainmentBias::VariableSitesOnly,
      ..CtmcOptions::default()
    };
    let (t1, t2) = (0.3, 0.5);
    let mut engine = two_tip_engine(&[0, 1], &[1, 0], t1, t2, options)?;
    let ln_prob = engine.evaluate()?;

    // p_const sums the two constant patterns; each has probability (1 + e^-t)/4
    let p_constant = 2.0 * ((1.0 + (-(t1 + t2)).exp()) / 4.0);
    let expected = 2.0 * two_tip_closed_form(false, t1, t2) - 2.0 * (1.0 - p_constant).ln();
    assert_ulps_eq!(ln_prob, expected, epsilon = 1e-12);
    Ok(())
  }

  #[rstest]
  fn trifurcating_root_is_supported() -> Result<(), Report> {
    let mut tree = Tree::new();
    let root = tree.add_root("R")?;
    let a = tree.add_child(root, "a", 0.1)?;
    let b = tree.add_child(root, "b", 0.2)?;
    let c = tree.add_child(root, "c", 0.3)?;

    let mut kernel = CtmcKernel::new(
      tree.num_nodes(),
      two_state_model()?,
      BranchRates::Homogeneous(1.0),
      CtmcOptions::default(),
    );
    kernel.set_tip_states(a, &[0])?;
    kernel.set_tip_states(b, &[1])?;
    kernel.set_tip_states(c, &[0])?;

    let mut engine = LikelihoodEngine::new(tree, kernel)?;
    let ln_prob = engine.evaluate()?;
    assert!(ln_prob.is_finite() && ln_prob < 0.0);

    // direct sum over the root state
    let p = |t: f64, same: bool| {
      if same {
        0.5 * (1.0 + (-t).exp())
      } else {
        0.5 * (1.0 - (-t).exp())
      }
    };
    let expected = (0.5 * (p(0.1, true) * p(0.2, false) * p(0.3, true) + p(0.1, false) * p(0.2, true) * p(0.3, false))).ln();
    assert_ulps_eq!(ln_prob, expected, epsilon = 1e-12);
    Ok(())
  }

  #[rstest]
  fn negative_branch_length_rejects_with_negative_infinity() -> Result<(), Report> {
    let mut engine = two_tip_engine(&[0], &[1], -0.2, 0.3, CtmcOptions::default())?;
    assert_eq!(engine.evaluate()?, f64::NEG_INFINITY);
    Ok(())
  }

  #[rstest]
  fn rejects_state_outside_alphabet() -> Result<(), Report> {
    let mut tree = Tree::new();
    let root = tree.add_root("R")?;
    let a = tree.add_child(root, "a", 0.1)?;
    tree.add_child(root, "b", 0.1)?;

    let mut kernel = CtmcKernel::new(
      tree.num_nodes(),
      two_state_model()?,
      BranchRates::Homogeneous(1.0),
      CtmcOptions::default(),
    );
    assert!(kernel.set_tip_states(a, &[2]).is_err());
    Ok(())
  }
}
