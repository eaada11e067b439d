//! Real-time subgame resolving.
//!
//! A live hand is placed in the closest blueprint. Early streets use the
//! blueprint node directly. Later streets get a fresh subtree rooted at the
//! live state with the deep bet grid, trained against ranges rebuilt from the
//! blueprint's average strategy along the actions actually taken. The
//! subtree is only returned when at least one epoch finished before the
//! deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::abstraction::ClusterMapper;
use crate::cards::{format_cards, Card};
use crate::config::ResolveConfig;
use crate::dealer::RangeDealer;
use crate::error::{SolverError, SolverResult};
use crate::mccfr::TraversalConfig;
use crate::range::reconstruct;
use crate::scheduler::{train, CancelToken, Summary};
use crate::table::{bet_grid, Hand, BET_SIZES_DEEP};
use crate::translate::replay;
use crate::tree::{Node, Tree};

/// Where a live decision is answered from.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub tree: Arc<Tree>,
    /// Decision node for the seat on turn.
    pub node: Arc<Node>,
    /// Training summary when a subtree was solved.
    pub summary: Option<Summary>,
}

impl Resolution {
    pub fn resolved(&self) -> bool {
        self.summary.is_some()
    }
}

/// Blueprint node matching `hand`, without resolving.
pub fn locate(blueprints: &[Arc<Tree>], hand: &Hand) -> SolverResult<Resolution> {
    let turn = hand.latest().turn_pos;
    let tree = Tree::find_closest(blueprints, &hand.params, turn).ok_or_else(|| {
        SolverError::InvalidParams(format!("no blueprint for {} players", hand.params.num_players))
    })?;
    let (node, _) = replay(tree, hand)?;
    Ok(Resolution {
        tree: Arc::clone(tree),
        node,
        summary: None,
    })
}

/// Answer `hand` from the blueprint or from a freshly solved subtree.
pub fn resolve<M: ClusterMapper + ?Sized>(
    blueprints: &[Arc<Tree>],
    hand: &Hand,
    board: &[Card],
    mapper: &M,
    config: &ResolveConfig,
    cancel: &CancelToken,
) -> SolverResult<Resolution> {
    let state = hand.latest();
    let turn = state.turn_pos;
    let tree = Tree::find_closest(blueprints, &hand.params, turn).ok_or_else(|| {
        SolverError::InvalidParams(format!("no blueprint for {} players", hand.params.num_players))
    })?;
    if tree.abs_id != mapper.id() {
        return Err(SolverError::AbstractionMismatch {
            tree: tree.abs_id.to_string(),
            mapper: mapper.id().to_string(),
        });
    }
    let (node, path) = replay(tree, hand)?;

    if state.street <= config.trigger {
        debug!("{} is covered by the blueprint", state.street);
        return Ok(Resolution {
            tree: Arc::clone(tree),
            node,
            summary: None,
        });
    }
    if board.len() != state.street.board_len() {
        return Err(SolverError::InvalidBoardNotation(format!(
            "{} cards on the {}",
            board.len(),
            state.street
        )));
    }

    let started = Instant::now();
    let ranges = reconstruct(&path, hand.params.num_players as usize, board, mapper)?;
    let dealer =
        RangeDealer::new(ranges, board.to_vec())?.with_terminal(hand.params.terminal_street);

    let mut params = hand.params.clone();
    params.bet_sizes = bet_grid(BET_SIZES_DEEP);
    params.max_actions_per_round = config.max_actions_per_round;
    let sub = Tree::from_state(params, state.clone(), mapper.id());
    sub.expand_full(&sub.root)?;
    info!(
        "resolving {} on {}: {} nodes",
        state.street,
        format_cards(board),
        sub.nodes()
    );

    let traversal = TraversalConfig::simple(config.discount, config.baseline);
    let token = cancel.child(Duration::from_millis(config.budget_ms));
    let summary = train(
        &sub,
        &dealer,
        mapper,
        &traversal,
        &config.run_config(),
        &token,
        &mut |_, _| Ok(()),
    )?;
    if summary.epochs == 0 {
        return Err(SolverError::ResolveTimeout);
    }
    info!(
        "resolved in {:.2}s after {} iterations",
        started.elapsed().as_secs_f64(),
        summary.iterations
    );

    let node = sub.decision_point(&sub.root)?;
    Ok(Resolution {
        tree: Arc::new(sub),
        node,
        summary: Some(summary),
    })
}
