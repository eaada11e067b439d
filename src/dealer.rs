//! Deal generation and terminal payoffs.
//!
//! A [`Dealer`] draws one concrete deal per traversal. The deal reveals board
//! cards as the traversal crosses chance nodes, maps the acting seat's cards
//! to a cluster, and scores terminal nodes for any seat. Each worker owns its
//! own dealer clone, so dealers keep a free list of spent deals instead of
//! synchronising.

use rand::seq::index;
use rand::Rng;

use crate::abstraction::{Cluster, ClusterMapper};
use crate::cards::{Card, Rank, Suit};
use crate::error::{SolverError, SolverResult};
use crate::hand_evaluator::evaluate;
use crate::range::Range;
use crate::table::{Seat, Status, Street};
use crate::tree::TerminalNode;

pub trait Deal: Send {
    /// Street whose board cards are currently visible.
    fn street(&self) -> Street;

    /// Reveal the board up to `street`. Setting an earlier street hides the
    /// later cards again without redrawing them.
    fn advance(&mut self, street: Street);

    fn cluster<M: ClusterMapper + ?Sized>(&self, turn: u8, mapper: &M) -> Cluster;

    /// Net chips won by `player` at `terminal`.
    fn utility(&self, terminal: &TerminalNode, player: u8) -> f64;
}

pub trait Dealer: Clone + Send + Sync {
    type Deal: Deal;

    fn sample<R: Rng + ?Sized>(&mut self, rng: &mut R) -> SolverResult<Self::Deal>;

    /// Hand a spent deal back for reuse.
    fn put(&mut self, _deal: Self::Deal) {}

    /// Weighted deals for a best-response pass; sampled uniformly unless the
    /// game is small enough to enumerate.
    fn best_response_deals<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        samples: usize,
    ) -> SolverResult<Vec<(Self::Deal, f64)>> {
        let weight = 1.0 / samples.max(1) as f64;
        (0..samples)
            .map(|_| self.sample(rng).map(|d| (d, weight)))
            .collect()
    }
}

/// Net result of every seat. `strength[i]` is `None` for seats that folded;
/// higher strength wins. Contributions are layered into side pots so a
/// short all-in only wins what it covered, and tied seats split a layer.
pub fn payoffs<S: Ord + Copy>(players: &[Seat], strength: &[Option<S>]) -> Vec<f64> {
    let paid: Vec<f64> = players.iter().map(|p| p.paid as f64).collect();
    let mut net: Vec<f64> = paid.iter().map(|p| -p).collect();

    let mut levels = paid.clone();
    levels.sort_by(|a, b| a.total_cmp(b));
    levels.dedup();

    let mut prev = 0.0;
    for level in levels {
        if level <= prev {
            continue;
        }
        let layer: f64 = paid.iter().map(|p| p.min(level) - p.min(prev)).sum();
        let covered: Vec<usize> = (0..paid.len()).filter(|&i| paid[i] >= level).collect();
        let best = covered.iter().filter_map(|&i| strength[i]).max();
        let winners: Vec<usize> = match best {
            Some(best) => covered
                .into_iter()
                .filter(|&i| strength[i] == Some(best))
                .collect(),
            // every seat that covered this layer folded: it goes back to them
            None => covered,
        };
        let share = layer / winners.len() as f64;
        for w in winners {
            net[w] += share;
        }
        prev = level;
    }
    net
}

fn fast_utility(players: &[Seat], player: usize, pot: f64) -> Option<f64> {
    let seat = players.get(player)?;
    if seat.status == Status::Folded {
        return Some(-(seat.paid as f64));
    }
    let alive = players.iter().filter(|p| p.status != Status::Folded).count();
    if alive == 1 {
        return Some(pot - seat.paid as f64);
    }
    None
}

// ---------------------------------------------------------------------------
// Kuhn
// ---------------------------------------------------------------------------

pub const KUHN_CARDS: [Card; 3] = [
    Card {
        rank: Rank::Jack,
        suit: Suit::Spades,
    },
    Card {
        rank: Rank::Queen,
        suit: Suit::Spades,
    },
    Card {
        rank: Rank::King,
        suit: Suit::Spades,
    },
];

/// Every ordered pair of distinct Kuhn cards.
const KUHN_DEALS: [[usize; 2]; 6] = [[0, 1], [1, 0], [0, 2], [2, 0], [1, 2], [2, 1]];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KuhnDeal {
    pub cards: [Card; 2],
}

impl Deal for KuhnDeal {
    fn street(&self) -> Street {
        Street::Preflop
    }

    fn advance(&mut self, _street: Street) {}

    #[inline]
    fn cluster<M: ClusterMapper + ?Sized>(&self, turn: u8, mapper: &M) -> Cluster {
        mapper.map(&self.cards[turn as usize..turn as usize + 1])
    }

    fn utility(&self, terminal: &TerminalNode, player: u8) -> f64 {
        let p = player as usize;
        if let Some(u) = fast_utility(&terminal.players, p, terminal.pot as f64) {
            return u;
        }
        let strength: Vec<Option<Rank>> = terminal
            .players
            .iter()
            .zip(self.cards.iter())
            .map(|(s, c)| (s.status != Status::Folded).then_some(c.rank))
            .collect();
        payoffs(&terminal.players, &strength)[p]
    }
}

/// Uniform over the six Kuhn deals.
#[derive(Debug, Clone, Copy, Default)]
pub struct KuhnDealer;

impl KuhnDealer {
    pub fn all_deals() -> Vec<KuhnDeal> {
        KUHN_DEALS
            .iter()
            .map(|[a, b]| KuhnDeal {
                cards: [KUHN_CARDS[*a], KUHN_CARDS[*b]],
            })
            .collect()
    }
}

impl Dealer for KuhnDealer {
    type Deal = KuhnDeal;

    fn sample<R: Rng + ?Sized>(&mut self, rng: &mut R) -> SolverResult<KuhnDeal> {
        let [a, b] = KUHN_DEALS[rng.gen_range(0..KUHN_DEALS.len())];
        Ok(KuhnDeal {
            cards: [KUHN_CARDS[a], KUHN_CARDS[b]],
        })
    }

    fn best_response_deals<R: Rng + ?Sized>(
        &mut self,
        _rng: &mut R,
        _samples: usize,
    ) -> SolverResult<Vec<(KuhnDeal, f64)>> {
        let weight = 1.0 / KUHN_DEALS.len() as f64;
        Ok(KuhnDealer::all_deals().into_iter().map(|d| (d, weight)).collect())
    }
}

// ---------------------------------------------------------------------------
// Hold'em
// ---------------------------------------------------------------------------

/// Hole cards for every seat plus a full five-card board, revealed 3/1/1.
/// Showdowns only see the board up to `terminal`.
#[derive(Debug, Clone, PartialEq)]
pub struct HoldemDeal {
    pub hands: Vec<[Card; 2]>,
    pub board: [Card; 5],
    street: Street,
    terminal: Street,
}

impl HoldemDeal {
    pub fn new(hands: Vec<[Card; 2]>, board: [Card; 5], street: Street) -> HoldemDeal {
        HoldemDeal {
            hands,
            board,
            street,
            terminal: Street::River,
        }
    }

    /// Last street of the game; the showdown ignores later board cards.
    pub fn with_terminal(mut self, terminal: Street) -> HoldemDeal {
        self.terminal = terminal;
        self
    }

    /// Board cards visible right now.
    pub fn visible_board(&self) -> &[Card] {
        &self.board[..self.street.board_len()]
    }
}

impl Deal for HoldemDeal {
    #[inline]
    fn street(&self) -> Street {
        self.street
    }

    #[inline]
    fn advance(&mut self, street: Street) {
        self.street = street;
    }

    fn cluster<M: ClusterMapper + ?Sized>(&self, turn: u8, mapper: &M) -> Cluster {
        let hole = self.hands[turn as usize];
        let mut cards = [hole[0]; 7];
        cards[1] = hole[1];
        cards[2..].copy_from_slice(&self.board);
        mapper.map(&cards[..2 + self.street.board_len()])
    }

    fn utility(&self, terminal: &TerminalNode, player: u8) -> f64 {
        let p = player as usize;
        if let Some(u) = fast_utility(&terminal.players, p, terminal.pot as f64) {
            return u;
        }
        let shown = 2 + self.terminal.board_len();
        let mut cards = [self.board[0]; 7];
        cards[2..].copy_from_slice(&self.board);
        let strength: Vec<_> = terminal
            .players
            .iter()
            .zip(self.hands.iter())
            .map(|(seat, hole)| {
                if seat.status == Status::Folded {
                    return None;
                }
                cards[0] = hole[0];
                cards[1] = hole[1];
                Some(evaluate(&cards[..shown]))
            })
            .collect();
        payoffs(&terminal.players, &strength)[p]
    }
}

fn cards_from_indices(indices: impl Iterator<Item = usize>, pool: &[Card]) -> Vec<Card> {
    indices.map(|i| pool[i]).collect()
}

fn board_array(cards: &[Card]) -> SolverResult<[Card; 5]> {
    cards
        .try_into()
        .map_err(|_| SolverError::InvalidBoardNotation(format!("{} board cards", cards.len())))
}

/// Uniform random hold'em deals.
#[derive(Debug, Clone)]
pub struct HoldemDealer {
    num_players: usize,
    terminal: Street,
    deck: Vec<Card>,
    free: Vec<HoldemDeal>,
}

impl HoldemDealer {
    pub fn new(num_players: u8) -> HoldemDealer {
        HoldemDealer {
            num_players: num_players as usize,
            terminal: Street::River,
            deck: crate::cards::Deck::new(None).cards,
            free: Vec::new(),
        }
    }

    pub fn with_terminal(mut self, terminal: Street) -> HoldemDealer {
        self.terminal = terminal;
        self
    }
}

impl Dealer for HoldemDealer {
    type Deal = HoldemDeal;

    fn sample<R: Rng + ?Sized>(&mut self, rng: &mut R) -> SolverResult<HoldemDeal> {
        let needed = self.num_players * 2 + 5;
        if needed > self.deck.len() {
            return Err(SolverError::NotEnoughDeck {
                requested: needed,
                available: self.deck.len(),
            });
        }
        let drawn = cards_from_indices(index::sample(rng, self.deck.len(), needed).into_iter(), &self.deck);
        let board = board_array(&drawn[..5])?;

        let mut deal = self.free.pop().unwrap_or_else(|| HoldemDeal {
            hands: Vec::with_capacity(self.num_players),
            board,
            street: Street::Preflop,
            terminal: self.terminal,
        });
        deal.hands.clear();
        deal.hands.extend(drawn[5..].chunks_exact(2).map(|c| [c[0], c[1]]));
        deal.board = board;
        deal.street = Street::Preflop;
        deal.terminal = self.terminal;
        Ok(deal)
    }

    fn put(&mut self, deal: HoldemDeal) {
        if self.free.len() < 64 {
            self.free.push(deal);
        }
    }
}

// ---------------------------------------------------------------------------
// Range weighted
// ---------------------------------------------------------------------------

/// Hole cards drawn from per-seat ranges around a fixed known board; the rest
/// of the board is random.
#[derive(Debug, Clone)]
pub struct RangeDealer {
    ranges: Vec<Range>,
    board: Vec<Card>,
    street: Street,
    terminal: Street,
}

impl RangeDealer {
    pub fn new(ranges: Vec<Range>, board: Vec<Card>) -> SolverResult<RangeDealer> {
        let street = match board.len() {
            0 => Street::Preflop,
            3 => Street::Flop,
            4 => Street::Turn,
            5 => Street::River,
            n => {
                return Err(SolverError::InvalidBoardNotation(format!(
                    "cannot resolve with {} board cards",
                    n
                )))
            }
        };
        let mut ranges = ranges;
        for (seat, range) in ranges.iter_mut().enumerate() {
            range.remove_blocked(&board);
            if !range.normalize() {
                return Err(SolverError::InvalidParams(format!(
                    "range of seat {} is empty on this board",
                    seat
                )));
            }
        }
        Ok(RangeDealer {
            ranges,
            board,
            street,
            terminal: Street::River,
        })
    }

    pub fn with_terminal(mut self, terminal: Street) -> RangeDealer {
        self.terminal = terminal;
        self
    }

    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }
}

impl Dealer for RangeDealer {
    type Deal = HoldemDeal;

    fn sample<R: Rng + ?Sized>(&mut self, rng: &mut R) -> SolverResult<HoldemDeal> {
        let mut dead = self.board.clone();
        let mut hands = Vec::with_capacity(self.ranges.len());
        for (seat, range) in self.ranges.iter().enumerate() {
            let combo = range.sample(rng, &dead).ok_or_else(|| {
                SolverError::InvalidParams(format!("range of seat {} is fully blocked", seat))
            })?;
            dead.extend_from_slice(&combo);
            hands.push(combo);
        }

        let rest = crate::cards::Deck::new(Some(&dead)).cards;
        let missing = 5 - self.board.len();
        let mut board = self.board.clone();
        board.extend(cards_from_indices(index::sample(rng, rest.len(), missing).into_iter(), &rest));
        let board = board_array(&board)?;
        Ok(HoldemDeal::new(hands, board, self.street).with_terminal(self.terminal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abstraction::{HandClassMapper, KuhnMapper};
    use crate::cards::{blocked, parse_board, parse_card};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn seat(paid: f32, status: Status) -> Seat {
        Seat { paid, status }
    }

    fn terminal(players: Vec<Seat>) -> TerminalNode {
        let pot = players.iter().map(|p| p.paid).sum();
        TerminalNode { players, pot }
    }

    #[test]
    fn kuhn_showdown_and_fold() {
        let deal = KuhnDeal {
            cards: [KUHN_CARDS[2], KUHN_CARDS[1]],
        };
        let showdown = terminal(vec![seat(2.0, Status::AllIn), seat(2.0, Status::AllIn)]);
        assert_eq!(deal.utility(&showdown, 0), 2.0);
        assert_eq!(deal.utility(&showdown, 1), -2.0);

        let folded = terminal(vec![seat(2.0, Status::AllIn), seat(1.0, Status::Folded)]);
        assert_eq!(deal.utility(&folded, 0), 1.0);
        assert_eq!(deal.utility(&folded, 1), -1.0);

        assert_eq!(deal.cluster(0, &KuhnMapper), 2);
        assert_eq!(deal.cluster(1, &KuhnMapper), 1);
    }

    #[test]
    fn kuhn_enumeration_is_uniform() {
        let deals = KuhnDealer.best_response_deals(&mut StdRng::seed_from_u64(0), 0).unwrap();
        assert_eq!(deals.len(), 6);
        let total: f64 = deals.iter().map(|(_, w)| w).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn ties_split_and_side_pots_cap_short_stacks() {
        let players = vec![seat(10.0, Status::AllIn), seat(10.0, Status::AllIn)];
        assert_eq!(payoffs(&players, &[Some(5), Some(5)]), vec![0.0, 0.0]);

        // short stack wins the main pot, the covering player takes the rest back
        let players = vec![seat(50.0, Status::AllIn), seat(100.0, Status::AllIn)];
        assert_eq!(payoffs(&players, &[Some(9), Some(1)]), vec![50.0, -50.0]);

        let players = vec![
            seat(100.0, Status::AllIn),
            seat(50.0, Status::AllIn),
            seat(10.0, Status::Folded),
        ];
        let net = payoffs(&players, &[Some(1), Some(9), None]);
        assert_eq!(net, vec![-50.0, 60.0, -10.0]);
        assert_eq!(net.iter().sum::<f64>(), 0.0);
    }

    #[test]
    fn holdem_deals_are_disjoint_and_reveal_by_street() {
        let mut dealer = HoldemDealer::new(3);
        let mut rng = StdRng::seed_from_u64(3);
        let mut deal = dealer.sample(&mut rng).unwrap();
        let mut all: Vec<Card> = deal.hands.iter().flatten().copied().collect();
        all.extend_from_slice(&deal.board);
        let mut dedup = all.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), all.len());

        assert!(deal.visible_board().is_empty());
        let preflop = deal.cluster(0, &HandClassMapper);
        deal.advance(Street::Turn);
        assert_eq!(deal.visible_board().len(), 4);
        assert_ne!(deal.cluster(0, &HandClassMapper), preflop);
        deal.advance(Street::Preflop);
        assert_eq!(deal.cluster(0, &HandClassMapper), preflop);
        dealer.put(deal);
        assert_eq!(dealer.free.len(), 1);
    }

    #[test]
    fn showdown_ignores_cards_past_the_last_street() {
        let hands = vec![
            [parse_card("Ah").unwrap(), parse_card("Kh").unwrap()],
            [parse_card("2c").unwrap(), parse_card("2d").unwrap()],
        ];
        let board = board_array(&parse_board("Kd7s3c2s9h").unwrap()).unwrap();
        let showdown = terminal(vec![seat(10.0, Status::AllIn), seat(10.0, Status::AllIn)]);

        // kings on the flop, trip deuces once the turn lands
        let river = HoldemDeal::new(hands.clone(), board, Street::River);
        assert_eq!(river.utility(&showdown, 0), -10.0);
        let flop = HoldemDeal::new(hands, board, Street::Flop).with_terminal(Street::Flop);
        assert_eq!(flop.utility(&showdown, 0), 10.0);
        assert_eq!(flop.utility(&showdown, 1), -10.0);

        let mut dealer = HoldemDealer::new(2).with_terminal(Street::Flop);
        let deal = dealer.sample(&mut StdRng::seed_from_u64(4)).unwrap();
        assert_eq!(deal.terminal, Street::Flop);
    }

    #[test]
    fn range_dealer_respects_board_and_ranges() {
        let board = parse_board("AhKd2c").unwrap();
        let mut only_aces = Range::uniform(&[]);
        for (w, combo) in only_aces.weights.iter_mut().zip(crate::cards::COMBOS.iter()) {
            if combo[0].rank != Rank::Ace || combo[1].rank != Rank::Ace {
                *w = 0.0;
            }
        }
        let mut dealer =
            RangeDealer::new(vec![only_aces, Range::uniform(&[])], board.clone()).unwrap();
        let mut rng = StdRng::seed_from_u64(8);
        for _ in 0..50 {
            let deal = dealer.sample(&mut rng).unwrap();
            assert_eq!(&deal.board[..3], &board[..]);
            assert_eq!(deal.street(), Street::Flop);
            assert!(deal.hands[0].iter().all(|c| c.rank == Rank::Ace));
            assert!(!blocked(&deal.hands[0], &board));
            assert!(!blocked(&deal.hands[1], &deal.board));
        }
    }
}
