use crate::tree::tree::NodeIndex;

/// Journal of nodes whose active selector flipped since the last commit.
/// Cleared on commit; consumed (members flipped back) on rollback.
#[derive(Clone, Debug, Default)]
pub struct ChangedSet {
  members: Vec<NodeIndex>,
  flags: Vec<bool>,
}

impl ChangedSet {
  pub fn new(num_nodes: usize) -> Self {
    Self {
      members: vec![],
      flags: vec![false; num_nodes],
    }
  }

  pub fn contains(&self, node: NodeIndex) -> bool {
    self.flags[node.0]
  }

  pub fn members(&self) -> &[NodeIndex] {
    &self.members
  }

  fn record(&mut self, node: NodeIndex) {
    debug_assert!(!self.flags[node.0], "node {node} flipped twice in one proposal");
    self.flags[node.0] = true;
    self.members.push(node);
  }

  fn clear(&mut self) {
    for node in self.members.drain(..) {
      self.flags[node.0] = false;
    }
  }
}

/// Two value slots per node plus a 1-bit selector choosing the current one.
/// The inactive slot is either stale or holds the pre-proposal snapshot, which
/// makes rollback a selector flip rather than a recomputation.
#[derive(Clone, Debug)]
pub struct NodeBuffers<T> {
  slots: Vec<[T; 2]>,
  active: Vec<u8>,
  changed: ChangedSet,
}

impl<T: Clone + Default> NodeBuffers<T> {
  pub fn new(num_nodes: usize) -> Self {
    Self {
      slots: (0..num_nodes).map(|_| [T::default(), T::default()]).collect(),
      active: vec![0; num_nodes],
      changed: ChangedSet::new(num_nodes),
    }
  }
}

impl<T> NodeBuffers<T> {
  pub fn get(&self, node: NodeIndex) -> &T {
    &self.slots[node.0][self.active[node.0] as usize]
  }

  pub fn set(&mut self, node: NodeIndex, value: T) {
    self.slots[node.0][self.active[node.0] as usize] = value;
  }

  pub fn active(&self, node: NodeIndex) -> u8 {
    self.active[node.0]
  }

  pub fn is_changed(&self, node: NodeIndex) -> bool {
    self.changed.contains(node)
  }

  pub fn changed_members(&self) -> &[NodeIndex] {
    self.changed.members()
  }

  /// Toggles the active selector of the node and records the flip.
  /// The caller guarantees at most one flip per node per pending proposal.
  pub fn flip(&mut self, node: NodeIndex) {
    self.active[node.0] ^= 1;
    self.changed.record(node);
  }

  /// Commits the pending proposal: the flipped selectors stay, the journal is cleared.
  pub fn commit_all(&mut self) {
    self.changed.clear();
  }

  /// Rolls the pending proposal back: every journaled selector is flipped back
  /// to the slot holding the last committed computation. O(k) in flipped nodes.
  pub fn rollback_all(&mut self) {
    for i in 0..self.changed.members.len() {
      let node = self.changed.members[i];
      self.active[node.0] ^= 1;
    }
    self.changed.clear();
  }
}
