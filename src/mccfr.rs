//! Monte-Carlo CFR traversals.
//!
//! One iteration draws a deal, walks the tree for a single traversing seat and
//! finishes with one [`Policy::calculate`] per policy touched. Policies are
//! locked when first reached and stay locked in the [`UpdateBatch`] until the
//! iteration is processed, so no other worker observes a half-updated
//! policy. Without shared subtrees every iteration locks in node preorder,
//! which keeps concurrent workers deadlock free.
//!
//! Two variants exist:
//!   - [`Variant::Mc`]: configurable samplers on both sides, baseline
//!     corrected values, optional negative-regret pruning.
//!   - [`Variant::Simple`]: the traverser enumerates every action, the
//!     opponents follow their current strategy. Used by the resolver.

use std::collections::HashMap;
use std::ops::Index;
use std::sync::Arc;

use log::trace;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::RawMutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::abstraction::ClusterMapper;
use crate::dealer::{Deal, Dealer};
use crate::error::SolverResult;
use crate::policy::{BaselineRule, Discount, Policy};
use crate::pool::ScratchPool;
use crate::sampler::{sample_index, Sampler};
use crate::tree::{Node, NodeKind, PlayerNode, PolicyRef, Tree};

/// A policy locked for the rest of the iteration.
pub type PolicyGuard = ArcMutexGuard<RawMutex, Policy>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    #[default]
    Mc,
    Simple,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraversalConfig {
    pub variant: Variant,
    /// Sampler at the traversing seat's nodes.
    pub traversal: Sampler,
    /// Sampler at every other seat's nodes.
    pub opponent: Sampler,
    pub discount: Discount,
    pub baseline: BaselineRule,
    /// Actions with regret below this are skipped. Only negative values
    /// enable pruning.
    pub prune: f64,
    /// Every `prune_every`-th policy iteration visits pruned actions again.
    pub prune_every: u64,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        TraversalConfig {
            variant: Variant::Mc,
            traversal: Sampler::External,
            opponent: Sampler::Outcome { eps: 0.0 },
            discount: Discount::Dcfr {
                alpha: 1.5,
                beta: 0.0,
                gamma: 2.0,
            },
            baseline: BaselineRule::default(),
            prune: 0.0,
            prune_every: 10,
        }
    }
}

impl TraversalConfig {
    /// Settings the resolver trains subgames with.
    pub fn simple(discount: Discount, baseline: BaselineRule) -> TraversalConfig {
        TraversalConfig {
            variant: Variant::Simple,
            discount,
            baseline,
            ..TraversalConfig::default()
        }
    }

    #[inline]
    fn pruning(&self, policy: &Policy) -> bool {
        self.prune < 0.0 && self.prune_every > 0 && policy.iteration % self.prune_every != 0
    }
}

// ---------------------------------------------------------------------------
// Update batch
// ---------------------------------------------------------------------------

/// Policies touched during one iteration, each locked exactly once.
#[derive(Default)]
pub struct UpdateBatch {
    guards: Vec<PolicyGuard>,
    index: HashMap<usize, usize>,
}

impl UpdateBatch {
    pub fn new() -> UpdateBatch {
        UpdateBatch::default()
    }

    /// Lock `policy` unless this batch already holds it; returns its slot.
    pub fn acquire(&mut self, policy: &PolicyRef) -> usize {
        let key = Arc::as_ptr(policy) as usize;
        if let Some(&slot) = self.index.get(&key) {
            return slot;
        }
        let slot = self.guards.len();
        self.guards.push(policy.lock_arc());
        self.index.insert(key, slot);
        slot
    }

    #[inline]
    pub fn get_mut(&mut self, slot: usize) -> &mut Policy {
        &mut self.guards[slot]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// Finish global iteration `iter` on every held policy and unlock them.
    pub fn process(&mut self, iter: u64, discount: Discount) {
        for mut guard in self.guards.drain(..) {
            guard.calculate(iter, discount);
        }
        self.index.clear();
    }

    /// Unlock everything without applying the iteration.
    pub fn abandon(&mut self) {
        self.guards.clear();
        self.index.clear();
    }
}

impl Index<usize> for UpdateBatch {
    type Output = Policy;

    #[inline]
    fn index(&self, slot: usize) -> &Policy {
        &self.guards[slot]
    }
}

impl std::fmt::Debug for UpdateBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateBatch").field("held", &self.guards.len()).finish()
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Worker-local traversal state. Not shared between threads.
#[derive(Debug)]
pub struct Runner {
    pub config: TraversalConfig,
    pool: ScratchPool,
    batch: UpdateBatch,
    traversals: u64,
}

impl Runner {
    pub fn new(config: TraversalConfig) -> Runner {
        Runner {
            config,
            pool: ScratchPool::new(),
            batch: UpdateBatch::new(),
            traversals: 0,
        }
    }

    /// Run `iterations` traversals. Returns the mean traverser value and the
    /// number of policy updates performed.
    pub fn run<D, M, R>(
        &mut self,
        tree: &Tree,
        dealer: &mut D,
        mapper: &M,
        iterations: u64,
        rng: &mut R,
    ) -> SolverResult<(f64, u64)>
    where
        D: Dealer,
        M: ClusterMapper + ?Sized,
        R: Rng + ?Sized,
    {
        let players = u64::from(tree.params.num_players.max(1));
        let mut ev = 0.0;
        let mut updates = 0u64;

        for _ in 0..iterations {
            let mut deal = dealer.sample(rng)?;
            let traverser = (self.traversals % players) as u8;
            self.traversals += 1;

            let mut walk = Walk {
                tree,
                mapper,
                config: &self.config,
                pool: &self.pool,
                batch: &mut self.batch,
                rng: &mut *rng,
                traverser,
            };
            let value = match walk.node(&tree.root, &mut deal, 0, 1.0, 1.0) {
                Ok(v) => v,
                Err(e) => {
                    self.batch.abandon();
                    return Err(e);
                }
            };

            ev += value;
            updates += self.batch.len() as u64;
            let n = tree.iteration.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
            self.batch.process(n, self.config.discount);
            dealer.put(deal);
        }

        trace!("{} traversals, {} updates", iterations, updates);
        Ok((ev / iterations.max(1) as f64, updates))
    }
}

struct Walk<'a, M: ?Sized, R: ?Sized> {
    tree: &'a Tree,
    mapper: &'a M,
    config: &'a TraversalConfig,
    pool: &'a ScratchPool,
    batch: &'a mut UpdateBatch,
    rng: &'a mut R,
    traverser: u8,
}

impl<M, R> Walk<'_, M, R>
where
    M: ClusterMapper + ?Sized,
    R: Rng + ?Sized,
{
    fn node<T: Deal>(
        &mut self,
        node: &Arc<Node>,
        deal: &mut T,
        depth: u8,
        reach: f64,
        sample: f64,
    ) -> SolverResult<f64> {
        match &node.kind {
            NodeKind::Root(_) => {
                let next = self.tree.next(node)?;
                self.node(&next, deal, depth, reach, sample)
            }
            NodeKind::Chance(s) => {
                let previous = deal.street();
                deal.advance(s.state.street);
                let next = self.tree.next(node)?;
                let value = self.node(&next, deal, depth, reach, sample);
                deal.advance(previous);
                value
            }
            NodeKind::Reference(r) => self.node(&r.node, deal, depth, reach, sample),
            NodeKind::Terminal(t) => Ok(deal.utility(t, self.traverser)),
            NodeKind::Player(p) => match (self.config.variant, p.turn == self.traverser) {
                (Variant::Mc, true) => self.traverse(p, deal, depth, reach, sample),
                (Variant::Mc, false) => self.sample(p, deal, depth, reach, sample),
                (Variant::Simple, true) => self.enumerate(p, deal, depth, reach, sample),
                (Variant::Simple, false) => self.follow(p, deal, depth, reach, sample),
            },
        }
    }

    fn lock<T: Deal>(&mut self, player: &PlayerNode, deal: &T) -> usize {
        let cluster = deal.cluster(player.turn, self.mapper);
        let policy = self.tree.acquire_policy(player, cluster);
        self.batch.acquire(&policy)
    }

    /// Traverser node: regrets from sampled actions, baselines elsewhere.
    fn traverse<T: Deal>(
        &mut self,
        player: &PlayerNode,
        deal: &mut T,
        depth: u8,
        reach: f64,
        sample: f64,
    ) -> SolverResult<f64> {
        let slot = self.lock(player, deal);
        let n = player.num_actions();
        let pool = self.pool;
        let mut qs = pool.alloc(n);
        let mut regrets = pool.alloc(n);

        let global = self.tree.iteration();
        self.config
            .traversal
            .sample(self.rng, &self.batch[slot], global, depth, pool, &mut qs);
        let prune = self.config.pruning(&self.batch[slot]);

        for i in 0..n {
            let policy = &self.batch[slot];
            let baseline = policy.baseline[i];
            let q = qs[i];
            if q <= 0.0 || (prune && policy.regret_sum[i] < self.config.prune) {
                regrets[i] = baseline;
                continue;
            }
            let child = self.tree.child(player, i)?;
            let v = self.node(&child, deal, depth.saturating_add(1), reach, sample * q)?;
            regrets[i] = baseline + (v - baseline) / q;
            self.batch
                .get_mut(slot)
                .update_baseline(self.config.baseline, 1.0 / q, i, v);
        }

        let policy = self.batch.get_mut(slot);
        let cfv = dot(policy.strategy(), &regrets);
        regrets.iter_mut().for_each(|r| *r -= cfv);
        policy.add_regret(reach / sample, &regrets);
        Ok(cfv)
    }

    /// Opponent node: accumulate strategy weight and follow the sampled
    /// actions.
    fn sample<T: Deal>(
        &mut self,
        player: &PlayerNode,
        deal: &mut T,
        depth: u8,
        reach: f64,
        sample: f64,
    ) -> SolverResult<f64> {
        let slot = self.lock(player, deal);
        let n = player.num_actions();
        let pool = self.pool;
        let mut qs = pool.alloc(n);

        let policy = self.batch.get_mut(slot);
        if sample > 0.0 {
            policy.add_strategy_weight(1.0 / sample);
        }
        let strategy = pool.alloc_from(policy.strategy());
        let mut estimates = pool.alloc_from(&policy.baseline);

        let global = self.tree.iteration();
        self.config
            .opponent
            .sample(self.rng, &self.batch[slot], global, depth, pool, &mut qs);

        for i in 0..n {
            let q = qs[i];
            if q <= 0.0 {
                continue;
            }
            let child = self.tree.child(player, i)?;
            let v = self.node(
                &child,
                deal,
                depth.saturating_add(1),
                reach * strategy[i],
                sample * q,
            )?;
            let baseline = estimates[i];
            estimates[i] = baseline + (v - baseline) / q;
            self.batch
                .get_mut(slot)
                .update_baseline(self.config.baseline, 1.0 / q, i, v);
        }
        Ok(dot(&strategy, &estimates))
    }

    /// Traverser node of the simple variant: every action, weight one.
    fn enumerate<T: Deal>(
        &mut self,
        player: &PlayerNode,
        deal: &mut T,
        depth: u8,
        reach: f64,
        sample: f64,
    ) -> SolverResult<f64> {
        let slot = self.lock(player, deal);
        let n = player.num_actions();
        let mut regrets = self.pool.alloc(n);

        for i in 0..n {
            let child = self.tree.child(player, i)?;
            let v = self.node(&child, deal, depth.saturating_add(1), reach, sample)?;
            regrets[i] = v;
            self.batch
                .get_mut(slot)
                .update_baseline(self.config.baseline, 1.0, i, v);
        }

        let policy = self.batch.get_mut(slot);
        let cfv = dot(policy.strategy(), &regrets);
        regrets.iter_mut().for_each(|r| *r -= cfv);
        policy.add_regret(1.0, &regrets);
        Ok(cfv)
    }

    /// Opponent node of the simple variant: one action from the strategy.
    fn follow<T: Deal>(
        &mut self,
        player: &PlayerNode,
        deal: &mut T,
        depth: u8,
        reach: f64,
        sample: f64,
    ) -> SolverResult<f64> {
        let slot = self.lock(player, deal);
        let policy = self.batch.get_mut(slot);
        policy.add_strategy_weight(1.0);
        let i = sample_index(self.rng, policy.strategy());
        let p = policy.strategy()[i];

        let child = self.tree.child(player, i)?;
        self.node(&child, deal, depth.saturating_add(1), reach * p, sample * p)
    }
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abstraction::{KuhnMapper, KUHN_ABS_ID};
    use crate::dealer::KuhnDealer;
    use crate::table::{DiscreteAction, GameParams};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn kuhn_tree() -> Tree {
        Tree::new(GameParams::kuhn(), KUHN_ABS_ID).unwrap()
    }

    fn root_player(tree: &Tree) -> Arc<Node> {
        tree.decision_point(&tree.root).unwrap()
    }

    #[test]
    fn batch_locks_each_policy_once() {
        let a: PolicyRef = Arc::new(parking_lot::Mutex::new(Policy::new(2)));
        let b: PolicyRef = Arc::new(parking_lot::Mutex::new(Policy::new(2)));
        let mut batch = UpdateBatch::new();
        assert_eq!(batch.acquire(&a), 0);
        assert_eq!(batch.acquire(&b), 1);
        assert_eq!(batch.acquire(&a), 0);
        assert_eq!(batch.len(), 2);
        assert!(a.try_lock().is_none());

        batch.get_mut(0).add_strategy_weight(1.0);
        batch.process(1, Discount::None);
        assert!(batch.is_empty());
        let a = a.lock();
        assert_eq!(a.iteration, 1);
        assert_eq!(a.strategy_sum, vec![0.5, 0.5]);
    }

    #[test]
    fn abandon_releases_without_updating() {
        let a: PolicyRef = Arc::new(parking_lot::Mutex::new(Policy::new(3)));
        let mut batch = UpdateBatch::new();
        batch.acquire(&a);
        batch.abandon();
        assert_eq!(a.lock().iteration, 0);
    }

    #[test]
    fn iterations_advance_global_counter_and_release_locks() {
        let tree = kuhn_tree();
        let mut runner = Runner::new(TraversalConfig::default());
        let mut rng = StdRng::seed_from_u64(1);
        let (_, updates) = runner
            .run(&tree, &mut KuhnDealer, &KuhnMapper, 50, &mut rng)
            .unwrap();
        assert_eq!(tree.iteration(), 50);
        assert!(updates > 0);
        assert!(tree.states() > 0);
        assert!(runner.batch.is_empty());

        let root = root_player(&tree);
        for (_, policy) in root.as_player().unwrap().policies() {
            let p = policy.try_lock().expect("policy left locked");
            let sum: f64 = p.strategy().iter().sum();
            assert!((sum - 1.0).abs() < 1e-9, "strategy must stay on the simplex");
        }
    }

    #[test]
    fn kuhn_king_learns_to_call_a_bet() {
        let tree = kuhn_tree();
        let config = TraversalConfig {
            discount: Discount::CfrPlus,
            ..TraversalConfig::default()
        };
        let mut runner = Runner::new(config);
        let mut rng = StdRng::seed_from_u64(11);
        runner
            .run(&tree, &mut KuhnDealer, &KuhnMapper, 20_000, &mut rng)
            .unwrap();

        // seat 0 checks, seat 1 bets, seat 0 holding the king must call
        let root = root_player(&tree);
        let first = root.as_player().unwrap();
        let check = first.action_index(DiscreteAction::CHECK).unwrap();
        let after_check = tree.child(first, check).unwrap();
        let second = after_check.as_player().unwrap();
        let bet = second.action_index(DiscreteAction::ALL_IN).unwrap();
        let facing = tree.child(second, bet).unwrap();
        let facing = facing.as_player().unwrap();
        let call = facing.action_index(DiscreteAction::CALL).unwrap();

        let king = facing.policy(2).expect("king policy");
        let avg = king.lock().average_strategy();
        assert!(avg[call] > 0.95, "king calls, got {:?}", avg);
    }

    #[test]
    fn simple_variant_trains_every_seat() {
        let tree = kuhn_tree();
        let config = TraversalConfig::simple(Discount::CfrPlus, BaselineRule::Ema { rate: 0.25 });
        let mut runner = Runner::new(config);
        let mut rng = StdRng::seed_from_u64(2);
        runner
            .run(&tree, &mut KuhnDealer, &KuhnMapper, 200, &mut rng)
            .unwrap();

        let root = root_player(&tree);
        let player = root.as_player().unwrap();
        assert_eq!(player.num_policies(), 3);
        for (_, policy) in player.policies() {
            assert!(policy.lock().iteration > 0);
        }
    }

    #[test]
    fn pruning_only_with_negative_threshold() {
        let mut policy = Policy::new(2);
        policy.iteration = 3;
        let off = TraversalConfig::default();
        assert!(!off.pruning(&policy));
        let on = TraversalConfig {
            prune: -100.0,
            ..TraversalConfig::default()
        };
        assert!(on.pruning(&policy));
        policy.iteration = 20;
        assert!(!on.pruning(&policy));
    }
}
