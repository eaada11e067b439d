//! Best-response exploitability.
//!
//! For every seat the tree is walked once with a batch of weighted deals.
//! Other seats play their average strategy (uniform where no policy exists
//! yet); the responding seat picks, per cluster, the action with the highest
//! summed value. The reported figure is the mean best-response value over
//! seats, which is zero at equilibrium in a two-seat zero-sum game.

use std::sync::Arc;

use log::debug;
use rand::Rng;

use crate::abstraction::{Cluster, ClusterMapper};
use crate::dealer::{Deal, Dealer};
use crate::error::SolverResult;
use crate::policy::uniform;
use crate::tree::{Node, NodeKind, PlayerNode, Tree};

/// Slices handed down the walk are always in `id` order.
struct Item<T> {
    id: usize,
    deal: T,
    reach: f64,
    cluster: Cluster,
}

/// Mean best-response value over every seat.
pub fn exploitability<D, M, R>(
    tree: &Tree,
    dealer: &mut D,
    mapper: &M,
    rng: &mut R,
    samples: usize,
) -> SolverResult<f64>
where
    D: Dealer,
    M: ClusterMapper + ?Sized,
    R: Rng + ?Sized,
{
    let players = tree.params.num_players;
    let mut total = 0.0;
    for responder in 0..players {
        let br = best_response(tree, dealer, mapper, rng, samples, responder)?;
        debug!("best response of seat {}: {:.5}", responder, br);
        total += br;
    }
    Ok(total / f64::from(players.max(1)))
}

/// Value `responder` earns by best-responding to everybody's average
/// strategy.
pub fn best_response<D, M, R>(
    tree: &Tree,
    dealer: &mut D,
    mapper: &M,
    rng: &mut R,
    samples: usize,
    responder: u8,
) -> SolverResult<f64>
where
    D: Dealer,
    M: ClusterMapper + ?Sized,
    R: Rng + ?Sized,
{
    let mut items: Vec<Item<D::Deal>> = dealer
        .best_response_deals(rng, samples)?
        .into_iter()
        .enumerate()
        .map(|(id, (deal, reach))| Item {
            id,
            deal,
            reach,
            cluster: 0,
        })
        .collect();
    if items.is_empty() {
        return Ok(0.0);
    }
    let mass: f64 = items.iter().map(|i| i.reach).sum();
    let walk = Responder {
        tree,
        mapper,
        responder,
    };
    let value = walk.node(&tree.root, &mut items)?;
    for item in items {
        dealer.put(item.deal);
    }
    Ok(if mass > 0.0 { value / mass } else { 0.0 })
}

struct Responder<'a, M: ?Sized> {
    tree: &'a Tree,
    mapper: &'a M,
    responder: u8,
}

impl<M: ClusterMapper + ?Sized> Responder<'_, M> {
    /// Reach-weighted value summed over `items`.
    fn node<T: Deal>(&self, node: &Arc<Node>, items: &mut [Item<T>]) -> SolverResult<f64> {
        match &node.kind {
            NodeKind::Root(_) => self.node(&self.tree.next(node)?, items),
            NodeKind::Reference(r) => self.node(&r.node, items),
            NodeKind::Chance(s) => {
                let next = self.tree.next(node)?;
                let previous: Vec<_> = items.iter().map(|i| i.deal.street()).collect();
                items.iter_mut().for_each(|i| i.deal.advance(s.state.street));
                let value = self.node(&next, items);
                for (item, street) in items.iter_mut().zip(previous) {
                    item.deal.advance(street);
                }
                value
            }
            NodeKind::Terminal(t) => Ok(items
                .iter()
                .map(|i| i.reach * i.deal.utility(t, self.responder))
                .sum()),
            NodeKind::Player(p) if p.turn == self.responder => self.respond(p, items),
            NodeKind::Player(p) => self.follow(p, items),
        }
    }

    fn follow<T: Deal>(&self, player: &PlayerNode, items: &mut [Item<T>]) -> SolverResult<f64> {
        let n = player.num_actions();
        let strategies: Vec<Vec<f64>> = items
            .iter()
            .map(|i| {
                let cluster = i.deal.cluster(player.turn, self.mapper);
                match player.policy(cluster) {
                    Some(policy) => policy.lock().average_strategy(),
                    None => uniform(n),
                }
            })
            .collect();
        let reach: Vec<f64> = items.iter().map(|i| i.reach).collect();

        let mut value = 0.0;
        for a in 0..n {
            let mut live = false;
            for ((item, s), r) in items.iter_mut().zip(&strategies).zip(&reach) {
                item.reach = r * s[a];
                live |= item.reach > 0.0;
            }
            if live {
                let child = self.tree.child(player, a)?;
                value += self.node(&child, items)?;
            }
        }
        for (item, r) in items.iter_mut().zip(reach) {
            item.reach = r;
        }
        Ok(value)
    }

    fn respond<T: Deal>(&self, player: &PlayerNode, items: &mut [Item<T>]) -> SolverResult<f64> {
        for item in items.iter_mut() {
            item.cluster = item.deal.cluster(player.turn, self.mapper);
        }
        items.sort_by_key(|i| i.cluster);

        let children = (0..player.num_actions())
            .map(|a| self.tree.child(player, a))
            .collect::<SolverResult<Vec<_>>>()?;

        let mut value = 0.0;
        let mut start = 0;
        while start < items.len() {
            let cluster = items[start].cluster;
            let end = start + items[start..].iter().take_while(|i| i.cluster == cluster).count();
            let group = &mut items[start..end];

            let mut best = f64::NEG_INFINITY;
            for child in &children {
                best = best.max(self.node(child, group)?);
            }
            value += best;
            start = end;
        }
        items.sort_by_key(|i| i.id);
        Ok(value)
    }
}
