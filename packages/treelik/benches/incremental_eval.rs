use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::array;
use treelik::engine::engine::LikelihoodEngine;
use treelik::kernel::brownian::BrownianKernel;
use treelik::kernel::rates::{BranchRates, SiteRates};
use treelik::tree::tree::{NodeIndex, Tree};

/// Balanced binary tree with 2^depth tips, unit branch lengths.
fn balanced_engine(depth: u32) -> (LikelihoodEngine<BrownianKernel>, Vec<NodeIndex>) {
  let mut tree = Tree::new();
  let root = tree.add_root("root").unwrap();
  let mut frontier = vec![root];
  for level in 0..depth {
    let mut next = vec![];
    for (i, &node) in frontier.iter().enumerate() {
      for j in 0..2 {
        next.push(
          tree
            .add_child(node, format!("n{level}_{i}_{j}"), 1.0)
            .unwrap(),
        );
      }
    }
    frontier = next;
  }

  let mut kernel = BrownianKernel::new(tree.num_nodes(), BranchRates::Homogeneous(1.0), SiteRates::Homogeneous(1.0));
  for (i, &tip) in frontier.iter().enumerate() {
    kernel.set_tip_values(tip, array![i as f64]).unwrap();
  }

  let engine = LikelihoodEngine::new(tree, kernel).unwrap();
  (engine, frontier)
}

fn bench_incremental_vs_full(c: &mut Criterion) {
  let mut group = c.benchmark_group("evaluate");

  let (mut engine, tips) = balanced_engine(10);
  engine.evaluate().unwrap();
  engine.keep();

  group.bench_function("single_tip_touch", |b| {
    b.iter(|| {
      engine.touch(tips[0]);
      let ln_prob = engine.evaluate().unwrap();
      engine.restore();
      black_box(ln_prob)
    });
  });

  group.bench_function("touch_all", |b| {
    b.iter(|| {
      engine.touch_all();
      let ln_prob = engine.evaluate().unwrap();
      engine.restore();
      black_box(ln_prob)
    });
  });

  group.finish();
}

criterion_group!(benches, bench_incremental_vs_full);
criterion_main!(benches);
