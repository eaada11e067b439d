//! Live-play advice: blueprint or resolved policy in, one legal action out.

use std::sync::Arc;

use log::debug;
use rand::Rng;

use crate::abstraction::ClusterMapper;
use crate::cards::Card;
use crate::config::ResolveConfig;
use crate::error::{SolverError, SolverResult};
use crate::resolver::{locate, resolve, Resolution};
use crate::sampler::sample_index;
use crate::scheduler::CancelToken;
use crate::table::{legal_actions, ActionKind, DiscreteAction, GameParams, Hand, State};
use crate::tree::Tree;

/// Blueprints plus the abstraction they were trained with. Resolving is
/// skipped when `resolve` is `None`.
pub struct Advisor<M> {
    pub blueprints: Vec<Arc<Tree>>,
    pub mapper: M,
    pub resolve: Option<ResolveConfig>,
}

/// Average strategy of the seat on turn, per action of the decision node.
#[derive(Debug, Clone)]
pub struct Advice {
    pub actions: Vec<DiscreteAction>,
    pub strategy: Vec<f64>,
    pub resolved: bool,
}

impl<M: ClusterMapper> Advisor<M> {
    pub fn new(blueprints: Vec<Arc<Tree>>, mapper: M) -> Advisor<M> {
        Advisor {
            blueprints,
            mapper,
            resolve: None,
        }
    }

    pub fn with_resolve(mut self, config: ResolveConfig) -> Advisor<M> {
        self.resolve = Some(config);
        self
    }

    /// Strategy the seat on turn holding `hole` should follow.
    pub fn strategy(
        &self,
        hand: &Hand,
        hole: [Card; 2],
        board: &[Card],
        cancel: &CancelToken,
    ) -> SolverResult<Advice> {
        let resolution: Resolution = match &self.resolve {
            Some(config) => resolve(&self.blueprints, hand, board, &self.mapper, config, cancel)?,
            None => locate(&self.blueprints, hand)?,
        };
        let player = resolution
            .node
            .as_player()
            .ok_or(SolverError::NoDecisionPointFound)?;

        let mut cards = Vec::with_capacity(2 + board.len());
        cards.extend_from_slice(&hole);
        cards.extend_from_slice(board);
        let cluster = self.mapper.map(&cards);
        let policy = player.policy(cluster).ok_or(SolverError::NoPolicy(cluster))?;
        let strategy = policy.lock().average_strategy();

        for (action, p) in player.actions.iter().zip(&strategy) {
            debug!("{:<16} {:6.2}%", action.to_string(), p * 100.0);
        }
        Ok(Advice {
            actions: player.actions.clone(),
            strategy,
            resolved: resolution.resolved(),
        })
    }

    /// One action for the seat on turn.
    pub fn advise<R: Rng + ?Sized>(
        &self,
        hand: &Hand,
        hole: [Card; 2],
        board: &[Card],
        rng: &mut R,
        cancel: &CancelToken,
    ) -> SolverResult<DiscreteAction> {
        let advice = self.strategy(hand, hole, board, cancel)?;
        let action = sample_state(&hand.params, hand.latest(), &advice.actions, &advice.strategy, rng)?;
        debug!("chose {}", action);
        Ok(action)
    }
}

/// Draw one of `actions` from `strategy`, keeping only actions legal in
/// `state` and renormalising over them. A sized bet that would put in the
/// whole stack becomes all-in when all-in is legal.
pub fn sample_state<R: Rng + ?Sized>(
    params: &GameParams,
    state: &State,
    actions: &[DiscreteAction],
    strategy: &[f64],
    rng: &mut R,
) -> SolverResult<DiscreteAction> {
    let legal = legal_actions(params, state);
    let stack = state.stack(params);
    let all_in = legal.contains(ActionKind::AllIn);

    let mut kept = Vec::with_capacity(actions.len());
    let mut weights = Vec::with_capacity(actions.len());
    for (&action, &p) in actions.iter().zip(strategy) {
        let aa = action.resolve(params, state);
        let Some(min) = legal.get(aa.action) else {
            continue;
        };
        if aa.amount < min {
            continue;
        }
        let action = if action.is_sized() && aa.amount >= stack && all_in {
            DiscreteAction::ALL_IN
        } else {
            action
        };
        kept.push(action);
        weights.push(p);
    }

    let total: f64 = weights.iter().sum();
    if !(total > 0.0) {
        return Err(SolverError::NoMatchingAction(
            "no legal action has positive probability".into(),
        ));
    }
    weights.iter_mut().for_each(|w| *w /= total);
    Ok(kept[sample_index(rng, &weights)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abstraction::{KuhnMapper, KUHN_ABS_ID};
    use crate::dealer::{KuhnDealer, KUHN_CARDS};
    use crate::mccfr::{Runner, TraversalConfig};
    use crate::policy::Discount;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn illegal_actions_are_dropped_and_rest_renormalised() {
        let params = GameParams::new(2, 100.0, 0.5);
        let state = State::new(&params).unwrap();
        // a check is not legal facing the big blind
        let actions = [DiscreteAction::CHECK, DiscreteAction::FOLD];
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..20 {
            let a = sample_state(&params, &state, &actions, &[0.9, 0.1], &mut rng).unwrap();
            assert_eq!(a, DiscreteAction::FOLD);
        }
        assert!(sample_state(&params, &state, &actions, &[1.0, 0.0], &mut rng).is_err());
    }

    #[test]
    fn oversized_bets_become_all_in() {
        let params = GameParams::new(2, 3.0, 0.5);
        let state = State::new(&params).unwrap();
        // pot 1.5, a 2x pot raise puts in everything that is left
        let actions = [DiscreteAction(2.0)];
        let mut rng = StdRng::seed_from_u64(1);
        let a = sample_state(&params, &state, &actions, &[1.0], &mut rng).unwrap();
        assert_eq!(a, DiscreteAction::ALL_IN);
    }

    #[test]
    fn trained_kuhn_blueprint_gives_advice() {
        let tree = Arc::new(Tree::new(GameParams::kuhn(), KUHN_ABS_ID).unwrap());
        let mut runner = Runner::new(TraversalConfig {
            discount: Discount::CfrPlus,
            ..TraversalConfig::default()
        });
        let mut rng = StdRng::seed_from_u64(4);
        runner
            .run(&tree, &mut KuhnDealer, &KuhnMapper, 5_000, &mut rng)
            .unwrap();

        let advisor = Advisor::new(vec![tree], KuhnMapper);
        let mut hand = Hand::new(GameParams::kuhn()).unwrap();
        hand.act_discrete(DiscreteAction::CHECK).unwrap();
        hand.act_discrete(DiscreteAction::ALL_IN).unwrap();

        let king = [KUHN_CARDS[2], KUHN_CARDS[2]];
        let advice = advisor
            .strategy(&hand, king, &[], &CancelToken::new())
            .unwrap();
        assert_eq!(advice.actions, vec![DiscreteAction::FOLD, DiscreteAction::CALL]);
        assert!(!advice.resolved);

        let action = advisor
            .advise(&hand, king, &[], &mut rng, &CancelToken::new())
            .unwrap();
        assert!(action == DiscreteAction::CALL || action == DiscreteAction::FOLD);
    }

    #[test]
    fn unvisited_cluster_is_no_policy() {
        let tree = Arc::new(Tree::new(GameParams::kuhn(), KUHN_ABS_ID).unwrap());
        let advisor = Advisor::new(vec![tree], KuhnMapper);
        let hand = Hand::new(GameParams::kuhn()).unwrap();
        let jack = [KUHN_CARDS[0], KUHN_CARDS[0]];
        let err = advisor
            .strategy(&hand, jack, &[], &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, SolverError::NoPolicy(0)));
    }
}
