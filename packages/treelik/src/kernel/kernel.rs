use crate::tree::tree::{NodeIndex, Tree};
use eyre::Report;
use std::fmt::{Debug, Display, Formatter};

/// Active-slot value of a child node together with the branch leading to it,
/// as seen by a parent during the postorder combine step.
pub struct ChildContribution<'a, V> {
  pub node: NodeIndex,
  pub branch_length: f64,
  pub value: &'a V,
}

/// Errors a kernel can raise during evaluation. Support violations are NOT
/// errors: kernels encode them as -inf inside the produced value, so that a
/// proposal that left the support is rejected rather than crashing the chain.
#[derive(Debug)]
pub enum KernelError {
  /// A required matrix decomposition did not converge. The evaluator
  /// translates this to log-probability -inf and reports it once.
  Decomposition(Report),
  /// Malformed topology or missing observations: a programming or input-data
  /// bug. Fatal, stops the run.
  Structural(Report),
}

impl Display for KernelError {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      KernelError::Decomposition(report) => write!(f, "Decomposition failure: {report}"),
      KernelError::Structural(report) => write!(f, "Structural error: {report}"),
    }
  }
}

impl std::error::Error for KernelError {}

/// Per-model-family computation plugged into the incremental evaluator:
/// how a tip value is formed, how child values combine at an internal node,
/// and how the root value reduces to the scalar total log-probability.
///
/// The kernel is chosen once at model-construction time; the evaluator calls
/// it only for dirty nodes. Methods take `&mut self` so that a kernel can
/// maintain its own lazy caches (e.g. a rate-matrix decomposition).
pub trait LikelihoodKernel {
  type Value: Clone + Debug + Default;

  /// Checks that the kernel's observations fit the topology (every tip has
  /// data, no data attached to internal nodes, arity constraints).
  fn validate(&self, tree: &Tree) -> Result<(), Report>;

  fn leaf_value(&mut self, node: NodeIndex) -> Result<Self::Value, KernelError>;

  fn internal_value(
    &mut self,
    node: NodeIndex,
    children: &[ChildContribution<Self::Value>],
  ) -> Result<Self::Value, KernelError>;

  fn root_reduce(&mut self, root: NodeIndex, value: &Self::Value) -> Result<f64, KernelError>;
}
