use crate::{make_error, make_internal_report};
use eyre::Report;
use std::fmt::{Display, Formatter};

/// Index of a node in the tree arena. Stable for the lifetime of the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeIndex(pub usize);

impl Display for NodeIndex {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Clone, Debug)]
struct TreeNode {
  parent: Option<NodeIndex>,
  children: Vec<NodeIndex>,
  branch_length: f64,
  name: Option<String>,
}

/// Rooted tree stored as an arena of nodes. Children are owned downward
/// (parent holds child indices), the upward reference is the parent index,
/// so there are no aliased pointers and no ownership cycles.
///
/// `branch_length` of a node is the length of the edge to its parent;
/// the value stored on the root is ignored.
#[derive(Clone, Debug, Default)]
pub struct Tree {
  nodes: Vec<TreeNode>,
  root: Option<NodeIndex>,
}

impl Tree {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_root(&mut self, name: impl Into<String>) -> Result<NodeIndex, Report> {
    if self.root.is_some() {
      return make_error!("Tree already has a root node");
    }
    let index = NodeIndex(self.nodes.len());
    self.nodes.push(TreeNode {
      parent: None,
      children: vec![],
      branch_length: 0.0,
      name: Some(name.into()),
    });
    self.root = Some(index);
    Ok(index)
  }

  pub fn add_child(
    &mut self,
    parent: NodeIndex,
    name: impl Into<String>,
    branch_length: f64,
  ) -> Result<NodeIndex, Report> {
    if parent.0 >= self.nodes.len() {
      return make_error!("Parent node {parent} does not exist");
    }
    let index = NodeIndex(self.nodes.len());
    self.nodes.push(TreeNode {
      parent: Some(parent),
      children: vec![],
      branch_length,
      name: Some(name.into()),
    });
    self.nodes[parent.0].children.push(index);
    Ok(index)
  }

  pub fn num_nodes(&self) -> usize {
    self.nodes.len()
  }

  pub fn root(&self) -> NodeIndex {
    self.root.expect("Tree has no root node")
  }

  pub fn parent(&self, node: NodeIndex) -> Option<NodeIndex> {
    self.nodes[node.0].parent
  }

  pub fn children(&self, node: NodeIndex) -> &[NodeIndex] {
    &self.nodes[node.0].children
  }

  pub fn branch_length(&self, node: NodeIndex) -> f64 {
    self.nodes[node.0].branch_length
  }

  pub fn set_branch_length(&mut self, node: NodeIndex, branch_length: f64) {
    self.nodes[node.0].branch_length = branch_length;
  }

  pub fn name(&self, node: NodeIndex) -> Option<&str> {
    self.nodes[node.0].name.as_deref()
  }

  pub fn is_leaf(&self, node: NodeIndex) -> bool {
    self.nodes[node.0].children.is_empty()
  }

  pub fn is_root(&self, node: NodeIndex) -> bool {
    self.root == Some(node)
  }

  pub fn leaves(&self) -> impl Iterator<Item = NodeIndex> + '_ {
    (0..self.nodes.len()).map(NodeIndex).filter(|&n| self.is_leaf(n))
  }

  /// Nodes in preorder: parents before children.
  pub fn preorder(&self) -> Vec<NodeIndex> {
    let mut order = Vec::with_capacity(self.nodes.len());
    let mut stack = vec![self.root()];
    while let Some(node) = stack.pop() {
      order.push(node);
      stack.extend(self.children(node).iter().rev());
    }
    order
  }

  /// Nodes in postorder: children before parents.
  pub fn postorder(&self) -> Vec<NodeIndex> {
    let mut order = self.preorder();
    order.reverse();
    order
  }

  /// Checks structural soundness of the topology. A malformed topology is a
  /// programming or input-data bug, not a proposal excursion, hence a hard error.
  pub fn validate(&self) -> Result<(), Report> {
    let root = self
      .root
      .ok_or_else(|| make_internal_report!("Tree has no root node"))?;

    let n_root_children = self.children(root).len();
    if n_root_children != 2 && n_root_children != 3 {
      return Err(make_internal_report!(
        "The root node has an unexpected number of children: {n_root_children}. Only 2 (for rooted trees) or 3 (for unrooted trees) are allowed"
      ));
    }

    for index in (0..self.nodes.len()).map(NodeIndex) {
      let n_children = self.children(index).len();
      if n_children == 1 {
        return Err(make_internal_report!(
          "Node {index} has exactly one child; unary nodes are not allowed"
        ));
      }
      for &child in self.children(index) {
        if self.parent(child) != Some(index) {
          return Err(make_internal_report!(
            "Parent back-reference of node {child} does not point to node {index}"
          ));
        }
      }
    }

    Ok(())
  }
}
