//! Saving trained trees to disk and loading them back.

use std::path::PathBuf;
use std::sync::Arc;

use gto_blueprint::abstraction::{KuhnMapper, HAND_CLASS_ABS_ID, KUHN_ABS_ID};
use gto_blueprint::dealer::KuhnDealer;
use gto_blueprint::encoding::{load_tree, save_tree};
use gto_blueprint::error::SolverError;
use gto_blueprint::mccfr::{Runner, TraversalConfig};
use gto_blueprint::table::GameParams;
use gto_blueprint::tree::{Node, NodeKind, Tree};
use rand::rngs::StdRng;
use rand::SeedableRng;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("gto-{}-{}.bin", name, std::process::id()))
}

fn trained(tree: Tree, iterations: u64) -> Tree {
    let mut runner = Runner::new(TraversalConfig::default());
    let mut rng = StdRng::seed_from_u64(17);
    runner
        .run(&tree, &mut KuhnDealer, &KuhnMapper, iterations, &mut rng)
        .unwrap();
    tree
}

/// Average strategies of every materialised decision node, in preorder.
fn strategies(node: &Arc<Node>, out: &mut Vec<(u32, Vec<f64>)>) {
    match &node.kind {
        NodeKind::Root(s) | NodeKind::Chance(s) => {
            if let Some(next) = s.next.get() {
                strategies(next, out);
            }
        }
        NodeKind::Player(p) => {
            let mut policies = p.policies();
            policies.sort_by_key(|(cluster, _)| *cluster);
            for (cluster, policy) in policies {
                out.push((cluster, policy.lock().average_strategy()));
            }
            for child in p.children.iter().filter_map(|c| c.get()) {
                strategies(child, out);
            }
        }
        NodeKind::Terminal(_) | NodeKind::Reference(_) => {}
    }
}

fn collect(tree: &Tree) -> Vec<(u32, Vec<f64>)> {
    let mut out = Vec::new();
    strategies(&tree.root, &mut out);
    out
}

// ---------------------------------------------------------------------------
// Round trips
// ---------------------------------------------------------------------------

#[test]
fn trained_tree_survives_a_file_round_trip() {
    let tree = trained(Tree::new(GameParams::kuhn(), KUHN_ABS_ID).unwrap(), 2_000);
    let path = temp_path("kuhn");
    save_tree(&tree, &path).unwrap();
    let back = load_tree(&path, KUHN_ABS_ID).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(back.iteration(), 2_000);
    assert_eq!(back.nodes(), tree.nodes());
    assert_eq!(back.states(), tree.states());
    assert_eq!(back.params, tree.params);

    let (before, after) = (collect(&tree), collect(&back));
    assert!(!before.is_empty());
    assert_eq!(before, after);
}

#[test]
fn loaded_tree_keeps_training() {
    let tree = trained(Tree::new(GameParams::kuhn(), KUHN_ABS_ID).unwrap(), 500);
    let path = temp_path("resume");
    save_tree(&tree, &path).unwrap();
    let back = load_tree(&path, KUHN_ABS_ID).unwrap();
    std::fs::remove_file(&path).ok();

    let back = trained(back, 500);
    assert_eq!(back.iteration(), 1_000);
    assert!(back.nodes() >= tree.nodes());
}

#[test]
fn shared_subtrees_stay_shared() {
    let tree = Tree::new(GameParams::kuhn(), KUHN_ABS_ID)
        .unwrap()
        .with_shared_subtrees();
    let tree = trained(tree, 300);
    let path = temp_path("shared");
    save_tree(&tree, &path).unwrap();
    let back = load_tree(&path, KUHN_ABS_ID).unwrap();
    std::fs::remove_file(&path).ok();

    assert!(back.is_shared());
    assert_eq!(collect(&back), collect(&tree));
}

#[test]
fn other_abstraction_is_refused() {
    let tree = Tree::new(GameParams::kuhn(), KUHN_ABS_ID).unwrap();
    let path = temp_path("mismatch");
    save_tree(&tree, &path).unwrap();
    let err = load_tree(&path, HAND_CLASS_ABS_ID).unwrap_err();
    std::fs::remove_file(&path).ok();
    assert!(matches!(err, SolverError::AbstractionMismatch { .. }));
}

#[test]
fn truncated_file_is_an_error() {
    let tree = trained(Tree::new(GameParams::kuhn(), KUHN_ABS_ID).unwrap(), 100);
    let path = temp_path("truncated");
    save_tree(&tree, &path).unwrap();
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
    let result = load_tree(&path, KUHN_ABS_ID);
    std::fs::remove_file(&path).ok();
    assert!(result.is_err());
}
