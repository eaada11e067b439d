//! Live actions onto the abstract action space.
//!
//! Fold, check, call and all-in match exactly. Bets and raises are converted
//! to a pot fraction and mapped onto one of the two bracketing tree fractions
//! with the pseudo-harmonic rule.

use std::sync::Arc;

use log::debug;

use crate::error::{SolverError, SolverResult};
use crate::table::{ActionAmount, ActionKind, Chips, DiscreteAction, GameParams, Hand, Street};
use crate::tree::{Node, NodeKind, Tree};

/// Threshold between fractions `a < b`: above it a bet maps to `b`.
#[inline]
pub fn pseudo_harmonic_threshold(a: f32, b: f32) -> f32 {
    (a + b + 2.0 * a * b) / (a + b + 2.0)
}

/// Map pot fraction `x` onto one of the sorted `fractions`, clamping
/// outside the grid.
pub fn pseudo_harmonic(x: f32, fractions: &[f32]) -> Option<f32> {
    let (&first, &last) = (fractions.first()?, fractions.last()?);
    if fractions.len() == 1 || x <= first {
        return Some(first);
    }
    if x >= last {
        return Some(last);
    }
    for w in fractions.windows(2) {
        let (a, b) = (w[0], w[1]);
        if x >= a && x < b {
            return Some(if x > pseudo_harmonic_threshold(a, b) { b } else { a });
        }
    }
    Some(last)
}

/// Index of the abstract action matching `action` taken into `pot`.
pub fn match_action(action: ActionAmount, actions: &[DiscreteAction], pot: Chips) -> SolverResult<usize> {
    let exact = match action.action {
        ActionKind::Fold => Some(DiscreteAction::FOLD),
        ActionKind::Call => Some(DiscreteAction::CALL),
        ActionKind::Check => Some(DiscreteAction::CHECK),
        ActionKind::AllIn => Some(DiscreteAction::ALL_IN),
        _ => None,
    };
    let no_match = || SolverError::NoMatchingAction(action.to_string());

    if let Some(target) = exact {
        return actions.iter().position(|a| *a == target).ok_or_else(no_match);
    }
    if !matches!(action.action, ActionKind::Bet | ActionKind::Raise) || !(pot > 0.0) {
        return Err(no_match());
    }

    let mut fractions: Vec<f32> = actions.iter().filter(|a| a.is_sized()).map(|a| a.0).collect();
    fractions.sort_by(|a, b| a.total_cmp(b));
    let x = action.amount / pot;
    let best = pseudo_harmonic(x, &fractions).ok_or_else(no_match)?;
    debug!("mapped {:.3} pot onto {:.3}", x, best);
    actions
        .iter()
        .position(|a| a.0 == best)
        .ok_or_else(no_match)
}

/// One blueprint decision taken while replaying a live hand.
#[derive(Debug, Clone)]
pub struct Step {
    pub node: Arc<Node>,
    pub index: usize,
    pub street: Street,
}

/// Replay a live hand through `tree` and return the decision node it
/// reaches. Amounts are rescaled by the ratio of small blinds (or antes) so
/// a tree trained at one stake serves another.
pub fn map_hand(tree: &Tree, hand: &Hand) -> SolverResult<Arc<Node>> {
    replay(tree, hand).map(|(node, _)| node)
}

/// [`map_hand`] together with every decision taken on the way.
pub fn replay(tree: &Tree, hand: &Hand) -> SolverResult<(Arc<Node>, Vec<Step>)> {
    let ratio = stake_ratio(&hand.params, &tree.params)?;
    let mut current = Arc::clone(&tree.root);
    let mut path = Vec::new();

    for (state, action) in hand.history() {
        if action.action.is_blind() {
            continue;
        }
        current = tree.decision_point(&current)?;
        let NodeKind::Player(player) = &current.kind else {
            return Err(SolverError::NoDecisionPointFound);
        };
        let scaled = ActionAmount::new(action.action, action.amount / ratio);
        let index = match_action(scaled, &player.actions, state.pot() / ratio)?;
        let next = tree.child(player, index)?;
        path.push(Step {
            node: Arc::clone(&current),
            index,
            street: state.street,
        });
        current = next;
    }
    Ok((tree.decision_point(&current)?, path))
}

fn stake_ratio(live: &GameParams, trained: &GameParams) -> SolverResult<Chips> {
    let unit = |p: &GameParams| if p.has_blinds() { p.sb_amount } else { p.ante };
    let (live, trained) = (unit(live), unit(trained));
    if !(trained > 0.0) || !(live > 0.0) {
        return Err(SolverError::InvalidParams("stakes must be positive".into()));
    }
    Ok(live / trained)
}
