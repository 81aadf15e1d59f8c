use crate::kernel::rates::BranchRates;
use crate::tree::tree::Tree;
use crate::{make_error, make_report};
use eyre::Report;
use ndarray_rand::rand_distr::{Distribution, Normal};
use rand::Rng;

/// Draws one value per node under the Brownian model by a preorder walk:
/// each child is normal around its parent with variance given by the
/// rate-rescaled branch length.
///
/// The random source is an explicit parameter; there is no process-wide
/// generator. Returns values indexed by node.
pub fn redraw_brownian(
  tree: &Tree,
  root_value: f64,
  branch_rates: &BranchRates,
  rng: &mut impl Rng,
) -> Result<Vec<f64>, Report> {
  let mut values = vec![0.0; tree.num_nodes()];
  values[tree.root().0] = root_value;

  for node in tree.preorder() {
    if tree.is_root(node) {
      continue;
    }
    let branch_time = branch_rates.branch_time(node, tree.branch_length(node));
    if branch_time.is_nan() {
      return make_error!(
        "Cannot simulate along the branch above node {node}: branch length {} is outside of the support",
        tree.branch_length(node)
      );
    }
    let parent = tree.parent(node).expect("non-root node must have a parent");
    let normal = Normal::new(values[parent.0], branch_time.sqrt())
      .map_err(|e| make_report!("Cannot simulate along the branch above node {node}: {e}"))?;
    values[node.0] = normal.sample(rng);
  }

  Ok(values)
}
