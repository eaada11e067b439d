//! End-to-end training on Kuhn poker: scheduler, traversal and best response
//! wired together the way the `train-kuhn` command uses them.

use std::collections::BTreeMap;
use std::sync::Arc;

use gto_blueprint::abstraction::{KuhnMapper, KUHN_ABS_ID};
use gto_blueprint::dealer::KuhnDealer;
use gto_blueprint::exploit::{best_response, exploitability};
use gto_blueprint::mccfr::TraversalConfig;
use gto_blueprint::policy::Discount;
use gto_blueprint::scheduler::{train, CancelToken, RunConfig, Summary};
use gto_blueprint::table::GameParams;
use gto_blueprint::tree::{Node, NodeKind, Tree};
use rand::rngs::StdRng;
use rand::SeedableRng;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn kuhn_tree() -> Tree {
    Tree::new(GameParams::kuhn(), KUHN_ABS_ID).unwrap()
}

fn traversal() -> TraversalConfig {
    TraversalConfig {
        discount: Discount::CfrPlus,
        ..TraversalConfig::default()
    }
}

fn run(tree: &Tree, workers: usize, iterations: u64, seed: u64) -> Summary {
    let config = RunConfig {
        workers,
        iterations,
        batch_size: 100,
        epoch_size: 1_000 * workers as u64,
        seed,
        exploit_samples: 0,
    };
    train(
        tree,
        &KuhnDealer,
        &KuhnMapper,
        &traversal(),
        &config,
        &CancelToken::new(),
        &mut |_, _| Ok(()),
    )
    .unwrap()
}

type Infosets = BTreeMap<(Vec<usize>, u32), Vec<f64>>;

/// Average strategy of every infoset where `seat` acts, keyed by the action
/// indices leading to it and the cluster.
fn walk(node: &Arc<Node>, seat: u8, path: &mut Vec<usize>, out: &mut Infosets) {
    match &node.kind {
        NodeKind::Root(s) | NodeKind::Chance(s) => {
            if let Some(next) = s.next.get() {
                walk(next, seat, path, out);
            }
        }
        NodeKind::Player(p) => {
            if p.turn == seat {
                for (cluster, policy) in p.policies() {
                    out.insert((path.clone(), cluster), policy.lock().average_strategy());
                }
            }
            for (i, child) in p.children.iter().enumerate() {
                if let Some(child) = child.get() {
                    path.push(i);
                    walk(child, seat, path, out);
                    path.pop();
                }
            }
        }
        NodeKind::Terminal(_) | NodeKind::Reference(_) => {}
    }
}

fn infosets(tree: &Tree, seat: u8) -> Infosets {
    let mut out = Infosets::new();
    walk(&tree.root, seat, &mut Vec::new(), &mut out);
    out
}

fn exploit(tree: &Tree) -> f64 {
    let mut rng = StdRng::seed_from_u64(0);
    exploitability(tree, &mut KuhnDealer, &KuhnMapper, &mut rng, 0).unwrap()
}

// ---------------------------------------------------------------------------
// Convergence
// ---------------------------------------------------------------------------

#[test]
fn single_worker_converges() {
    let tree = kuhn_tree();
    let summary = run(&tree, 1, 50_000, 3);
    assert_eq!(summary.iterations, 50_000);
    let e = exploit(&tree);
    assert!(e < 0.03, "exploitability {:.5}", e);
}

#[test]
fn exploitability_falls_with_training() {
    let tree = kuhn_tree();
    let untrained = exploit(&tree);
    run(&tree, 1, 1_000, 5);
    let early = exploit(&tree);
    run(&tree, 1, 49_000, 6);
    let late = exploit(&tree);
    assert_eq!(tree.iteration(), 50_000);
    assert!(untrained > early, "{:.5} -> {:.5}", untrained, early);
    assert!(early > late, "{:.5} -> {:.5}", early, late);
}

#[test]
fn worker_count_does_not_change_the_answer() {
    let single = kuhn_tree();
    let one = run(&single, 1, 60_000, 9);
    let parallel = kuhn_tree();
    let four = run(&parallel, 4, 60_000, 9);

    // no batch lost or applied twice
    assert_eq!(one.iterations, 60_000);
    assert_eq!(four.iterations, 60_000);
    assert_eq!(single.iteration(), parallel.iteration());

    let (a, b) = (exploit(&single), exploit(&parallel));
    assert!(a < 0.03 && b < 0.03, "{:.5} / {:.5}", a, b);
    assert!((a - b).abs() < 0.03);

    // the second seat has a unique equilibrium strategy, so both runs must
    // agree on it infoset by infoset
    let (x, y) = (infosets(&single, 1), infosets(&parallel, 1));
    assert_eq!(x.len(), 6);
    assert_eq!(x.keys().collect::<Vec<_>>(), y.keys().collect::<Vec<_>>());
    for (key, s) in &x {
        let t = &y[key];
        for (p, q) in s.iter().zip(t) {
            assert!((p - q).abs() < 0.1, "{:?}: {:?} vs {:?}", key, s, t);
        }
    }
}

#[test]
fn first_seat_loses_about_one_eighteenth() {
    let tree = kuhn_tree();
    run(&tree, 2, 80_000, 21);
    let mut rng = StdRng::seed_from_u64(0);
    // a best response is never worth less than the game value of -1/18
    let br0 = best_response(&tree, &mut KuhnDealer, &KuhnMapper, &mut rng, 0, 0).unwrap();
    let br1 = best_response(&tree, &mut KuhnDealer, &KuhnMapper, &mut rng, 0, 1).unwrap();
    assert!(br0 > -1.0 / 18.0 - 1e-9);
    assert!(br1 > 1.0 / 18.0 - 1e-9);
    assert!((br0 + 1.0 / 18.0).abs() < 0.06, "seat 0 best response {:.5}", br0);
}
