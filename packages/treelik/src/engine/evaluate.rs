use crate::cache::value_buffer::NodeBuffers;
use crate::kernel::kernel::{ChildContribution, KernelError, LikelihoodKernel};
use crate::tree::tree::{NodeIndex, Tree};
use itertools::Itertools;

/// Postorder recomputation of the dirty subgraph below `node`.
///
/// Clean nodes are memoized: their active slot already holds the correct
/// value, and by the propagation invariant nothing below them can be dirty.
/// Dirty nodes recompute via the kernel after their children, store the
/// result into the active slot and clear the flag.
pub(crate) fn evaluate_subtree<K: LikelihoodKernel>(
  tree: &Tree,
  kernel: &mut K,
  buffers: &mut NodeBuffers<K::Value>,
  dirty: &mut [bool],
  n_recomputed: &mut [u64],
  node: NodeIndex,
) -> Result<(), KernelError> {
  if !dirty[node.0] {
    return Ok(());
  }

  let value = if tree.is_leaf(node) {
    kernel.leaf_value(node)?
  } else {
    for &child in tree.children(node) {
      evaluate_subtree(tree, kernel, buffers, dirty, n_recomputed, child)?;
    }

    let children = tree
      .children(node)
      .iter()
      .map(|&child| ChildContribution {
        node: child,
        branch_length: tree.branch_length(child),
        value: buffers.get(child),
      })
      .collect_vec();
    kernel.internal_value(node, &children)?
  };

  buffers.set(node, value);
  dirty[node.0] = false;
  n_recomputed[node.0] += 1;

  Ok(())
}
