//! Lazily expanded game tree.
//!
//! Nodes live in an append-only arena and are handed out as `Arc<Node>`.
//! Children are `OnceCell` slots: the first worker to reach a slot builds the
//! child, concurrent visitors wait for it, and a failed build leaves the slot
//! empty. Nothing is ever removed while a tree is alive.
//!
//! Decision nodes own one [`Policy`] per cluster, each behind its own mutex.
//! With subtree sharing enabled, chance nodes reached through different
//! betting lines with an identical state become [`NodeKind::Reference`]
//! aliases of the first one built.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};

use crate::abstraction::{AbsId, Cluster};
use crate::encoding::state_key;
use crate::error::{SolverError, SolverResult};
use crate::policy::Policy;
use crate::table::{self, Chips, DiscreteAction, GameParams, Seat, State, Street};

pub type NodeId = u32;

/// Shared handle to one information-set policy.
pub type PolicyRef = Arc<Mutex<Policy>>;

#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
}

#[derive(Debug)]
pub enum NodeKind {
    Root(Successor),
    Chance(Successor),
    Player(PlayerNode),
    Terminal(TerminalNode),
    Reference(ReferenceNode),
}

/// Root and chance nodes: one state, one lazily built successor.
#[derive(Debug)]
pub struct Successor {
    pub state: State,
    pub next: OnceCell<Arc<Node>>,
}

#[derive(Debug)]
pub struct PlayerNode {
    pub state: State,
    pub turn: u8,
    pub actions: Vec<DiscreteAction>,
    pub children: Vec<OnceCell<Arc<Node>>>,
    policies: RwLock<HashMap<Cluster, PolicyRef>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TerminalNode {
    pub players: Vec<Seat>,
    pub pot: Chips,
}

#[derive(Debug)]
pub struct ReferenceNode {
    pub target: NodeId,
    pub node: Arc<Node>,
}

impl Node {
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            NodeKind::Root(_) => "root",
            NodeKind::Chance(_) => "chance",
            NodeKind::Player(_) => "player",
            NodeKind::Terminal(_) => "terminal",
            NodeKind::Reference(_) => "reference",
        }
    }

    /// Follow a reference to the node it aliases.
    pub fn resolve(self: &Arc<Node>) -> Arc<Node> {
        match &self.kind {
            NodeKind::Reference(r) => r.node.resolve(),
            _ => Arc::clone(self),
        }
    }

    pub fn as_player(&self) -> Option<&PlayerNode> {
        match &self.kind {
            NodeKind::Player(p) => Some(p),
            _ => None,
        }
    }

    pub fn state(&self) -> Option<&State> {
        match &self.kind {
            NodeKind::Root(s) | NodeKind::Chance(s) => Some(&s.state),
            NodeKind::Player(p) => Some(&p.state),
            NodeKind::Terminal(_) => None,
            NodeKind::Reference(r) => r.node.state(),
        }
    }
}

impl PlayerNode {
    pub fn new(state: State, actions: Vec<DiscreteAction>) -> PlayerNode {
        let children = actions.iter().map(|_| OnceCell::new()).collect();
        PlayerNode {
            turn: state.turn_pos,
            state,
            actions,
            children,
            policies: RwLock::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn num_actions(&self) -> usize {
        self.actions.len()
    }

    pub fn action_index(&self, action: DiscreteAction) -> Option<usize> {
        self.actions.iter().position(|a| *a == action)
    }

    pub fn policy(&self, cluster: Cluster) -> Option<PolicyRef> {
        self.policies.read().get(&cluster).cloned()
    }

    /// Policy for `cluster`, created on first use. Returns whether it is new.
    pub fn policy_or_insert(&self, cluster: Cluster) -> (PolicyRef, bool) {
        if let Some(p) = self.policy(cluster) {
            return (p, false);
        }
        let mut map = self.policies.write();
        let mut created = false;
        let p = map
            .entry(cluster)
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(Policy::new(self.actions.len())))
            })
            .clone();
        (p, created)
    }

    pub fn insert_policy(&self, cluster: Cluster, policy: Policy) {
        self.policies.write().insert(cluster, Arc::new(Mutex::new(policy)));
    }

    /// `(cluster, policy)` pairs sorted by cluster.
    pub fn policies(&self) -> Vec<(Cluster, PolicyRef)> {
        let mut all: Vec<(Cluster, PolicyRef)> = self
            .policies
            .read()
            .iter()
            .map(|(c, p)| (*c, Arc::clone(p)))
            .collect();
        all.sort_by_key(|(c, _)| *c);
        all
    }

    pub fn num_policies(&self) -> usize {
        self.policies.read().len()
    }
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

pub struct Tree {
    pub params: GameParams,
    pub abs_id: AbsId,
    pub root: Arc<Node>,
    /// State the root was built from.
    pub state: State,
    /// Completed global iterations.
    pub iteration: AtomicU64,
    nodes: AtomicU32,
    states: AtomicU32,
    arena: RwLock<Vec<Arc<Node>>>,
    shared: Option<Mutex<HashMap<Vec<u8>, Arc<Node>>>>,
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("abs_id", &self.abs_id)
            .field("iteration", &self.iteration())
            .field("nodes", &self.nodes())
            .field("states", &self.states())
            .finish()
    }
}

impl Tree {
    /// Tree for a fresh hand with `params`.
    pub fn new(params: GameParams, abs_id: AbsId) -> SolverResult<Tree> {
        let state = State::new(&params)?;
        Ok(Tree::from_state(params, state, abs_id))
    }

    /// Tree rooted at an arbitrary state, as used by the resolver.
    pub fn from_state(params: GameParams, state: State, abs_id: AbsId) -> Tree {
        let root = Arc::new(Node {
            id: 0,
            kind: NodeKind::Root(Successor {
                state: state.clone(),
                next: OnceCell::new(),
            }),
        });
        Tree {
            params,
            abs_id,
            root: Arc::clone(&root),
            state,
            iteration: AtomicU64::new(0),
            nodes: AtomicU32::new(1),
            states: AtomicU32::new(0),
            arena: RwLock::new(vec![root]),
            shared: None,
        }
    }

    /// Alias chance nodes whose betting state is identical.
    pub fn with_shared_subtrees(mut self) -> Tree {
        self.shared = Some(Mutex::new(HashMap::new()));
        self
    }

    pub fn is_shared(&self) -> bool {
        self.shared.is_some()
    }

    /// Record a decoded chance node so later expansion keeps aliasing it.
    pub(crate) fn remember_shared(&self, key: Vec<u8>, node: Arc<Node>) {
        if let Some(shared) = &self.shared {
            shared.lock().entry(key).or_insert(node);
        }
    }

    #[inline]
    pub fn iteration(&self) -> u64 {
        self.iteration.load(Ordering::Relaxed)
    }

    /// Nodes materialised so far, root included.
    #[inline]
    pub fn nodes(&self) -> u32 {
        self.nodes.load(Ordering::Relaxed)
    }

    /// Policies created so far.
    #[inline]
    pub fn states(&self) -> u32 {
        self.states.load(Ordering::Relaxed)
    }

    pub(crate) fn set_counters(&self, iteration: u64, states: u32) {
        self.iteration.store(iteration, Ordering::Relaxed);
        self.states.store(states, Ordering::Relaxed);
    }

    pub fn node(&self, id: NodeId) -> Option<Arc<Node>> {
        self.arena.read().get(id as usize).cloned()
    }

    /// Add a node to the arena.
    pub(crate) fn register(&self, kind: NodeKind) -> Arc<Node> {
        let mut arena = self.arena.write();
        let node = Arc::new(Node {
            id: arena.len() as NodeId,
            kind,
        });
        arena.push(Arc::clone(&node));
        self.nodes.fetch_add(1, Ordering::Relaxed);
        node
    }

    /// Policy for `cluster` at `player`, counting newly created ones.
    pub fn acquire_policy(&self, player: &PlayerNode, cluster: Cluster) -> PolicyRef {
        let (policy, created) = player.policy_or_insert(cluster);
        if created {
            self.states.fetch_add(1, Ordering::Relaxed);
        }
        policy
    }

    // -----------------------------------------------------------------------
    // Expansion
    // -----------------------------------------------------------------------

    /// Successor of a root or chance node.
    pub fn next(&self, node: &Node) -> SolverResult<Arc<Node>> {
        match &node.kind {
            NodeKind::Root(s) => s
                .next
                .get_or_try_init(|| {
                    let kind = if s.state.voluntary_actions(&self.params) > 0 {
                        self.player_kind(s.state.clone())?
                    } else {
                        NodeKind::Chance(Successor {
                            state: s.state.clone(),
                            next: OnceCell::new(),
                        })
                    };
                    Ok(self.register(kind))
                })
                .cloned(),
            NodeKind::Chance(s) => s
                .next
                .get_or_try_init(|| {
                    let kind = self.player_kind(s.state.clone())?;
                    Ok(self.register(kind))
                })
                .cloned(),
            NodeKind::Reference(r) => self.next(&r.node),
            _ => Err(SolverError::expansion(SolverError::Rules(format!(
                "{} node has no successor",
                node.kind_name()
            )))),
        }
    }

    /// Child of `player` reached through action `index`.
    pub fn child(&self, player: &PlayerNode, index: usize) -> SolverResult<Arc<Node>> {
        let slot = player.children.get(index).ok_or_else(|| {
            SolverError::expansion(SolverError::Rules(format!("no action {}", index)))
        })?;
        slot.get_or_try_init(|| self.make_child(&player.state, player.actions[index]))
            .cloned()
    }

    fn player_kind(&self, state: State) -> SolverResult<NodeKind> {
        let actions: Vec<DiscreteAction> = table::discrete_legal_actions(&self.params, &state)
            .into_iter()
            .map(|(a, _)| a)
            .collect();
        if actions.is_empty() {
            return Err(SolverError::expansion(SolverError::Rules(format!(
                "no legal actions for player {} on {}",
                state.turn_pos, state.street
            ))));
        }
        Ok(NodeKind::Player(PlayerNode::new(state, actions)))
    }

    fn make_child(&self, state: &State, action: DiscreteAction) -> SolverResult<Arc<Node>> {
        let aa = action.resolve(&self.params, state);
        let acted = table::make_action(&self.params, state, aa).map_err(SolverError::expansion)?;
        let next = table::advance(&self.params, &acted).map_err(SolverError::expansion)?;

        if next.finished() {
            let pot = next.pot();
            return Ok(self.register(NodeKind::Terminal(TerminalNode {
                players: next.players,
                pot,
            })));
        }
        if next.street == state.street {
            return Ok(self.register(self.player_kind(next)?));
        }
        self.chance(next)
    }

    fn chance(&self, state: State) -> SolverResult<Arc<Node>> {
        let Some(shared) = &self.shared else {
            return Ok(self.register(NodeKind::Chance(Successor {
                state,
                next: OnceCell::new(),
            })));
        };

        let key = state_key(&state)?;
        let mut table = shared.lock();
        if let Some(existing) = table.get(&key) {
            let existing = Arc::clone(existing);
            drop(table);
            debug!("sharing chance node {} on {}", existing.id, state.street);
            return Ok(self.register(NodeKind::Reference(ReferenceNode {
                target: existing.id,
                node: existing,
            })));
        }
        let node = self.register(NodeKind::Chance(Successor {
            state,
            next: OnceCell::new(),
        }));
        table.insert(key, Arc::clone(&node));
        Ok(node)
    }

    /// Materialise every direct child of `node`. Terminal and reference
    /// nodes have nothing to expand.
    pub fn expand(&self, node: &Node) -> SolverResult<()> {
        match &node.kind {
            NodeKind::Root(_) | NodeKind::Chance(_) => self.next(node).map(|_| ()),
            NodeKind::Player(p) => (0..p.num_actions()).try_for_each(|i| self.child(p, i).map(|_| ())),
            NodeKind::Terminal(_) | NodeKind::Reference(_) => Ok(()),
        }
    }

    /// Expand the whole tree below `from`.
    pub fn expand_full(&self, from: &Arc<Node>) -> SolverResult<()> {
        let mut stack = vec![Arc::clone(from)];
        while let Some(node) = stack.pop() {
            self.expand(&node)?;
            match &node.kind {
                NodeKind::Root(s) | NodeKind::Chance(s) => stack.extend(s.next.get().cloned()),
                NodeKind::Player(p) => {
                    stack.extend(p.children.iter().filter_map(|c| c.get().cloned()))
                }
                NodeKind::Terminal(_) | NodeKind::Reference(_) => {}
            }
        }
        Ok(())
    }

    /// Closest tree to the live parameters by effective stack in big blinds.
    pub fn find_closest<'a>(trees: &'a [Arc<Tree>], params: &GameParams, turn: u8) -> Option<&'a Arc<Tree>> {
        let depth = |p: &GameParams| p.effective_stack(turn) / p.big_blind().max(1e-6);
        let live = depth(params);
        trees
            .iter()
            .filter(|t| t.params.num_players == params.num_players)
            .min_by(|a, b| {
                let da = (depth(&a.params) - live).abs();
                let db = (depth(&b.params) - live).abs();
                da.total_cmp(&db)
            })
    }

    /// Decision node reached from `node` without taking any action.
    pub fn decision_point(&self, node: &Arc<Node>) -> SolverResult<Arc<Node>> {
        let mut current = node.resolve();
        loop {
            let next = match &current.kind {
                NodeKind::Player(_) => None,
                NodeKind::Root(_) | NodeKind::Chance(_) => Some(self.next(&current)?.resolve()),
                _ => return Err(SolverError::NoDecisionPointFound),
            };
            match next {
                Some(n) => current = n,
                None => return Ok(current),
            }
        }
    }
}

/// Street of the node's state, if it has one.
pub fn street_of(node: &Node) -> Option<Street> {
    node.state().map(|s| s.street)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abstraction::KUHN_ABS_ID;

    fn kuhn_tree() -> Tree {
        Tree::new(GameParams::kuhn(), KUHN_ABS_ID).unwrap()
    }

    #[test]
    fn kuhn_tree_has_expected_shape() {
        let tree = kuhn_tree();
        tree.expand_full(&tree.root).unwrap();
        // root, chance, p1, {all-in -> p2 {fold, call}}, {check -> p2 {all-in -> p1 {fold, call}, check}}
        assert_eq!(tree.nodes(), 11);

        let first = tree.decision_point(&tree.root).unwrap();
        let p = first.as_player().unwrap();
        assert_eq!(p.actions, vec![DiscreteAction::ALL_IN, DiscreteAction::CHECK]);
        assert_eq!(p.turn, 0);
    }

    #[test]
    fn expansion_is_idempotent() {
        let tree = kuhn_tree();
        let a = tree.next(&tree.root).unwrap();
        let b = tree.next(&tree.root).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let before = tree.nodes();
        tree.expand(&tree.root).unwrap();
        assert_eq!(tree.nodes(), before);
    }

    #[test]
    fn terminal_and_reference_do_not_expand() {
        let tree = kuhn_tree();
        let node = Node {
            id: 99,
            kind: NodeKind::Terminal(TerminalNode {
                players: Vec::new(),
                pot: 0.0,
            }),
        };
        tree.expand(&node).unwrap();
        assert!(tree.next(&node).is_err());
    }

    #[test]
    fn identical_builds_are_structurally_equal() {
        let a = kuhn_tree();
        let b = kuhn_tree();
        a.expand_full(&a.root).unwrap();
        b.expand_full(&b.root).unwrap();
        assert_eq!(a.nodes(), b.nodes());
        let pa = a.decision_point(&a.root).unwrap();
        let pb = b.decision_point(&b.root).unwrap();
        assert_eq!(pa.as_player().unwrap().actions, pb.as_player().unwrap().actions);
    }

    #[test]
    fn policies_are_created_once_per_cluster() {
        let tree = kuhn_tree();
        let node = tree.decision_point(&tree.root).unwrap();
        let p = node.as_player().unwrap();
        let a = tree.acquire_policy(p, 2);
        let b = tree.acquire_policy(p, 2);
        assert!(Arc::ptr_eq(&a, &b));
        tree.acquire_policy(p, 0);
        assert_eq!(tree.states(), 2);
        assert_eq!(p.policies().iter().map(|(c, _)| *c).collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn shared_subtrees_alias_identical_flops() {
        // raise-call and limp-bet-call both reach the flop with 4 chips each
        let mut params = GameParams::new(2, 100.0, 1.0);
        params.terminal_street = Street::Flop;
        params.limp = true;
        params.max_actions_per_round = 3;
        params.bet_sizes = vec![vec![0.5, 1.0]];
        let tree = Tree::new(params, AbsId::default()).unwrap().with_shared_subtrees();
        tree.expand_full(&tree.root).unwrap();
        let arena = tree.arena.read();
        let refs = arena
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Reference(_)))
            .count();
        assert!(refs > 0, "expected at least one shared flop");
    }
}
