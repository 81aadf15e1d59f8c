use crate::cache::value_buffer::NodeBuffers;
use crate::tree::tree::{NodeIndex, Tree};

/// Flags the node and all of its ancestors for recomputation, flipping the
/// active buffer selector of every node it newly marks.
///
/// Already-dirty nodes are skipped: their ancestors are dirty by the
/// propagation invariant, so a proposal touching several disjoint nodes costs
/// O(distinct ancestors), not O(touches x tree height). Ancestors are marked
/// before descendants, which keeps the invariant intact under reentry.
pub fn mark_dirty_upward<T>(tree: &Tree, node: NodeIndex, dirty: &mut [bool], buffers: &mut NodeBuffers<T>) {
  if dirty[node.0] {
    return;
  }

  if let Some(parent) = tree.parent(node) {
    mark_dirty_upward(tree, parent, dirty, buffers);
  }

  dirty[node.0] = true;

  // at most one selector flip per node per pending proposal
  if !buffers.is_changed(node) {
    buffers.flip(node);
  }
}
