use crate::cache::value_buffer::NodeBuffers;
use crate::engine::dirty::mark_dirty_upward;
use crate::engine::evaluate::evaluate_subtree;
use crate::kernel::kernel::{KernelError, LikelihoodKernel};
use crate::tree::tree::{NodeIndex, Tree};
use crate::utils::error::report_to_string;
use eyre::Report;
use log::{debug, warn};

/// Lifecycle of one MCMC proposal as seen by the likelihood model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProposalState {
  /// No proposal outstanding; the cached state is the committed baseline.
  Clean,
  /// A proposal touched the model; `keep` or `restore` must follow before
  /// the next proposal.
  Pending,
}

/// The incremental likelihood model: a tree, a kernel, double-buffered
/// per-node values and the touch/evaluate/keep/restore coordinator driven by
/// the sampler around each MCMC step.
///
/// A freshly constructed engine is Pending with every node dirty, so the
/// first `evaluate` computes the full tree and the first `keep` commits it
/// as the baseline.
///
/// Parallel chains clone the whole engine; there is no shared state between
/// clones.
#[derive(Clone)]
pub struct LikelihoodEngine<K: LikelihoodKernel> {
  tree: Tree,
  kernel: K,
  buffers: NodeBuffers<K::Value>,
  dirty: Vec<bool>,
  n_recomputed: Vec<u64>,
  state: ProposalState,
  ln_prob: f64,
  stored_ln_prob: f64,
  warned_decomposition: bool,
}

impl<K: LikelihoodKernel> LikelihoodEngine<K> {
  pub fn new(tree: Tree, kernel: K) -> Result<Self, Report> {
    tree.validate()?;
    kernel.validate(&tree)?;

    let num_nodes = tree.num_nodes();
    let mut engine = Self {
      tree,
      kernel,
      buffers: NodeBuffers::new(num_nodes),
      dirty: vec![false; num_nodes],
      n_recomputed: vec![0; num_nodes],
      state: ProposalState::Clean,
      ln_prob: f64::NAN,
      stored_ln_prob: f64::NAN,
      warned_decomposition: false,
    };
    engine.touch_all();
    Ok(engine)
  }

  pub fn tree(&self) -> &Tree {
    &self.tree
  }

  pub fn kernel(&self) -> &K {
    &self.kernel
  }

  /// Mutable kernel access for proposals that perturb kernel parameters
  /// (rates, frequencies, covariances). The caller must `touch` the affected
  /// nodes, or `touch_all` for a shared parameter, before re-evaluating.
  pub fn kernel_mut(&mut self) -> &mut K {
    &mut self.kernel
  }

  pub fn state(&self) -> ProposalState {
    self.state
  }

  pub fn is_dirty(&self, node: NodeIndex) -> bool {
    self.dirty[node.0]
  }

  pub fn active(&self, node: NodeIndex) -> u8 {
    self.buffers.active(node)
  }

  /// How many times the kernel recomputed this node since construction.
  pub fn recompute_count(&self, node: NodeIndex) -> u64 {
    self.n_recomputed[node.0]
  }

  /// True iff `dirty(n) => dirty(parent(n))` for every non-root node.
  pub fn dirty_invariant_holds(&self) -> bool {
    (0..self.tree.num_nodes()).map(NodeIndex).all(|node| {
      !self.dirty[node.0]
        || self
          .tree
          .parent(node)
          .map_or(true, |parent| self.dirty[parent.0])
    })
  }

  fn begin_proposal(&mut self) {
    if self.state == ProposalState::Clean {
      self.stored_ln_prob = self.ln_prob;
      self.state = ProposalState::Pending;
    }
  }

  /// Notification that a value this node depends on changed: flags the node
  /// and its ancestors for recomputation.
  pub fn touch(&mut self, node: NodeIndex) {
    self.begin_proposal();
    mark_dirty_upward(&self.tree, node, &mut self.dirty, &mut self.buffers);
  }

  /// Notification that a shared parameter with no localized node changed:
  /// flags every node for recomputation.
  pub fn touch_all(&mut self) {
    self.begin_proposal();
    for node in (0..self.tree.num_nodes()).map(NodeIndex) {
      if !self.dirty[node.0] {
        self.dirty[node.0] = true;
        if !self.buffers.is_changed(node) {
          self.buffers.flip(node);
        }
      }
    }
  }

  /// Replaces the branch length of the edge above `node` and touches the node.
  pub fn set_branch_length(&mut self, node: NodeIndex, branch_length: f64) {
    self.tree.set_branch_length(node, branch_length);
    self.touch(node);
  }

  /// Total log-probability of the model. Recomputes only the dirty subgraph;
  /// repeatable with no side effects beyond memoization.
  ///
  /// Support violations and decomposition failures resolve as -inf (the
  /// proposal is rejected, the chain continues); structural errors are fatal.
  pub fn evaluate(&mut self) -> Result<f64, Report> {
    let root = self.tree.root();

    // only necessary if the root is actually dirty
    if self.dirty[root.0] {
      let result = evaluate_subtree(
        &self.tree,
        &mut self.kernel,
        &mut self.buffers,
        &mut self.dirty,
        &mut self.n_recomputed,
        root,
      );
      let result = match result {
        Ok(()) => self.kernel.root_reduce(root, self.buffers.get(root)),
        Err(error) => Err(error),
      };

      match result {
        Ok(ln_prob) => {
          self.ln_prob = ln_prob;
          debug!("Log likelihood: {ln_prob}");
        }
        Err(KernelError::Decomposition(report)) => {
          if !self.warned_decomposition {
            warn!(
              "Matrix decomposition failed; treating the proposal as rejected. Further failures of this model will not be reported. {}",
              report_to_string(&report)
            );
            self.warned_decomposition = true;
          }
          self.ln_prob = f64::NEG_INFINITY;
        }
        Err(KernelError::Structural(report)) => {
          return Err(report);
        }
      }
    }

    Ok(self.ln_prob)
  }

  /// Commits the pending proposal: the recomputed values become the baseline.
  /// O(k) in the number of touched nodes.
  pub fn keep(&mut self) {
    for i in 0..self.buffers.changed_members().len() {
      let node = self.buffers.changed_members()[i];
      self.dirty[node.0] = false;
    }
    self.buffers.commit_all();
    self.stored_ln_prob = self.ln_prob;
    self.state = ProposalState::Clean;
  }

  /// Rolls the pending proposal back to the committed baseline without
  /// recomputation: every flipped selector returns to the slot holding the
  /// last clean value. O(k) in the number of touched nodes.
  pub fn restore(&mut self) {
    for i in 0..self.buffers.changed_members().len() {
      let node = self.buffers.changed_members()[i];
      self.dirty[node.0] = false;
    }
    self.buffers.rollback_all();
    self.ln_prob = self.stored_ln_prob;
    self.state = ProposalState::Clean;
  }
}
