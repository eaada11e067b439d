//! Hole-card range distributions.
//!
//! A [`Range`] is one weight per entry of [`COMBOS`]. Ranges are rebuilt for
//! the resolver by replaying the blueprint's average strategy along the
//! actions a player actually took: every combo is scaled by the probability
//! its cluster had of taking that action.

use log::{debug, warn};
use rand::Rng;

use crate::abstraction::ClusterMapper;
use crate::cards::{blocked, Card, COMBOS, NUM_COMBOS};
use crate::error::{SolverError, SolverResult};
use crate::sampler::sample_index;
use crate::translate::Step;
use crate::tree::NodeKind;

#[derive(Debug, Clone, PartialEq)]
pub struct Range {
    pub weights: Vec<f64>,
}

impl Range {
    /// Uniform over every combo not blocked by `known`.
    pub fn uniform(known: &[Card]) -> Range {
        let mut range = Range {
            weights: vec![1.0; NUM_COMBOS],
        };
        range.remove_blocked(known);
        range.normalize();
        range
    }

    pub fn from_weights(weights: Vec<f64>) -> SolverResult<Range> {
        if weights.len() != NUM_COMBOS {
            return Err(SolverError::Codec(format!(
                "range has {} entries, expected {}",
                weights.len(),
                NUM_COMBOS
            )));
        }
        if let Some(i) = weights.iter().position(|w| !w.is_finite() || *w < 0.0) {
            return Err(SolverError::Corrupted(format!("range[{}] = {}", i, weights[i])));
        }
        Ok(Range { weights })
    }

    #[inline]
    pub fn total(&self) -> f64 {
        self.weights.iter().sum()
    }

    /// Zero every combo sharing a card with `known`.
    pub fn remove_blocked(&mut self, known: &[Card]) {
        if known.is_empty() {
            return;
        }
        for (w, combo) in self.weights.iter_mut().zip(COMBOS.iter()) {
            if blocked(combo, known) {
                *w = 0.0;
            }
        }
    }

    /// Scale to unit mass. Returns false, leaving the range untouched, when
    /// there is no mass left.
    pub fn normalize(&mut self) -> bool {
        let total = self.total();
        if !(total > 0.0) {
            return false;
        }
        self.weights.iter_mut().for_each(|w| *w /= total);
        true
    }

    /// Draw a combo that shares no card with `dead`.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R, dead: &[Card]) -> Option<[Card; 2]> {
        for _ in 0..32 {
            let i = sample_index(rng, &self.weights);
            if self.weights[i] > 0.0 && !blocked(&COMBOS[i], dead) {
                return Some(COMBOS[i]);
            }
        }
        // Heavily blocked: draw from the live combos only.
        let live: Vec<f64> = self
            .weights
            .iter()
            .zip(COMBOS.iter())
            .map(|(w, c)| if blocked(c, dead) { 0.0 } else { *w })
            .collect();
        if !(live.iter().sum::<f64>() > 0.0) {
            return None;
        }
        Some(COMBOS[sample_index(rng, &live)])
    }

    /// Fold one observed action into the range: each combo not blocked by
    /// `board` is multiplied by its cluster's average probability of taking
    /// action `step.index`. Combos whose cluster has no policy at the node are
    /// left alone. Returns how many combos had no policy.
    pub fn apply_action<M: ClusterMapper + ?Sized>(
        &mut self,
        step: &Step,
        board: &[Card],
        mapper: &M,
    ) -> usize {
        let NodeKind::Player(player) = &step.node.kind else {
            return 0;
        };
        let mut missing = 0;
        let mut cards = Vec::with_capacity(2 + board.len());
        for (i, combo) in COMBOS.iter().enumerate() {
            if self.weights[i] == 0.0 || blocked(combo, board) {
                continue;
            }
            cards.clear();
            cards.extend_from_slice(combo);
            cards.extend_from_slice(board);
            match player.policy(mapper.map(&cards)) {
                Some(policy) => {
                    let avg = policy.lock().average_strategy();
                    self.weights[i] *= avg[step.index];
                }
                None => missing += 1,
            }
        }
        missing
    }
}

/// Per-player ranges implied by the blueprint decisions in `path`, with
/// `board` being the full known board.
pub fn reconstruct<M: ClusterMapper + ?Sized>(
    path: &[Step],
    num_players: usize,
    board: &[Card],
    mapper: &M,
) -> SolverResult<Vec<Range>> {
    let mut ranges = vec![Range::uniform(&[]); num_players];

    for step in path {
        let NodeKind::Player(player) = &step.node.kind else {
            continue;
        };
        let turn = player.turn as usize;
        let visible = &board[..step.street.board_len().min(board.len())];
        let range = ranges.get_mut(turn).ok_or_else(|| {
            SolverError::InvalidParams(format!("seat {} outside {} players", turn, num_players))
        })?;
        let missing = range.apply_action(step, visible, mapper);
        if missing * 2 > NUM_COMBOS {
            warn!(
                "{} of {} combos had no policy at node {}",
                missing, NUM_COMBOS, step.node.id
            );
        }
    }

    for (seat, range) in ranges.iter_mut().enumerate() {
        range.remove_blocked(board);
        if !range.normalize() {
            debug!("range of seat {} emptied, falling back to uniform", seat);
            *range = Range::uniform(board);
        }
    }
    Ok(ranges)
}
