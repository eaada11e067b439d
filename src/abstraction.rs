//! Card abstraction boundary.
//!
//! The solver never looks at cards directly: a [`ClusterMapper`] turns hole
//! cards plus the visible board into a [`Cluster`], and every decision node
//! keeps one policy per cluster. Mappers carry an [`AbsId`] that is stamped on
//! the tree root so a saved blueprint is only reused with the same abstraction.

use std::fmt;

use crate::cards::{Card, Rank};
use crate::hand_evaluator::evaluate;

/// Abstraction bucket id.
pub type Cluster = u32;

/// Fixed-size identifier of an abstraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AbsId(pub [u8; 16]);

impl AbsId {
    /// Identifier derived from a short name, zero padded.
    pub const fn from_name(name: &str) -> AbsId {
        let bytes = name.as_bytes();
        let mut id = [0u8; 16];
        let mut i = 0;
        while i < bytes.len() && i < 16 {
            id[i] = bytes[i];
            i += 1;
        }
        AbsId(id)
    }
}

impl fmt::Display for AbsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Maps hole cards followed by the visible board to a cluster.
///
/// Implementations must be pure and callable from every worker at once.
pub trait ClusterMapper: Send + Sync {
    fn map(&self, cards: &[Card]) -> Cluster;

    fn id(&self) -> AbsId;
}

// ---------------------------------------------------------------------------
// Kuhn
// ---------------------------------------------------------------------------

/// Kuhn poker: the single private card is the information set.
#[derive(Debug, Clone, Copy, Default)]
pub struct KuhnMapper;

pub const KUHN_ABS_ID: AbsId = AbsId::from_name("kuhn");

impl ClusterMapper for KuhnMapper {
    #[inline]
    fn map(&self, cards: &[Card]) -> Cluster {
        match cards.first().map(|c| c.rank) {
            Some(Rank::Jack) => 0,
            Some(Rank::Queen) => 1,
            Some(Rank::King) => 2,
            _ => 3,
        }
    }

    fn id(&self) -> AbsId {
        KUHN_ABS_ID
    }
}

// ---------------------------------------------------------------------------
// Hand classes
// ---------------------------------------------------------------------------

/// The 13 ranks in grid order: A, K, Q, J, T, 9, 8, 7, 6, 5, 4, 3, 2.
const GRID_RANKS: [char; 13] = [
    'A', 'K', 'Q', 'J', 'T', '9', '8', '7', '6', '5', '4', '3', '2',
];

/// Number of canonical preflop hands (13x13 grid).
pub const NUM_HAND_CLASSES: u32 = 169;

/// Clusters per postflop street: made-hand category x highest hole rank.
const POSTFLOP_CLUSTERS: u32 = 9 * 13;

#[inline]
fn grid_index(rank: Rank) -> usize {
    12 - rank.offset()
}

/// Bucket (0-168) of two hole cards in the 13x13 grid.
///
/// Grid layout:
///   - Diagonal (row == col): pairs (AA, KK, ...)
///   - Above diagonal (row < col): suited hands (AKs, AQs, ...)
///   - Below diagonal (row > col): offsuit hands (AKo, AQo, ...)
pub fn hand_class(a: Card, b: Card) -> u32 {
    let (i, j) = (grid_index(a.rank), grid_index(b.rank));
    let (hi, lo) = (i.min(j), i.max(j));
    let (row, col) = if i == j || a.suit == b.suit { (hi, lo) } else { (lo, hi) };
    (row * 13 + col) as u32
}

/// Canonical notation ("AA", "AKs", "72o") of a grid bucket.
pub fn hand_class_name(bucket: u32) -> String {
    let row = bucket as usize / 13;
    let col = bucket as usize % 13;
    if row == col {
        format!("{}{}", GRID_RANKS[row], GRID_RANKS[col])
    } else if row < col {
        format!("{}{}s", GRID_RANKS[row], GRID_RANKS[col])
    } else {
        format!("{}{}o", GRID_RANKS[col], GRID_RANKS[row])
    }
}

/// Lossy hold'em abstraction: the 169 preflop classes, then per street the
/// made-hand category combined with the highest hole card.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandClassMapper;

pub const HAND_CLASS_ABS_ID: AbsId = AbsId::from_name("hand-class-v1");

impl ClusterMapper for HandClassMapper {
    fn map(&self, cards: &[Card]) -> Cluster {
        if cards.len() < 2 {
            return 0;
        }
        let (a, b) = (cards[0], cards[1]);
        let board = cards.len() - 2;
        if board < 3 {
            return hand_class(a, b);
        }

        let street = (board.min(5) - 3) as u32;
        let category = evaluate(cards).category() as u32;
        let top = a.rank.max(b.rank).offset() as u32;
        NUM_HAND_CLASSES + street * POSTFLOP_CLUSTERS + category * 13 + top
    }

    fn id(&self) -> AbsId {
        HAND_CLASS_ABS_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cards::{parse_board, parse_card};

    #[test]
    fn hand_class_grid_layout() {
        let aa = hand_class(parse_card("Ah").unwrap(), parse_card("As").unwrap());
        let aks = hand_class(parse_card("Kh").unwrap(), parse_card("Ah").unwrap());
        let ako = hand_class(parse_card("Ad").unwrap(), parse_card("Kc").unwrap());
        let two = hand_class(parse_card("2d").unwrap(), parse_card("2c").unwrap());
        assert_eq!(aa, 0);
        assert_eq!(aks, 1);
        assert_eq!(ako, 13);
        assert_eq!(two, 168);
        assert_eq!(hand_class_name(aks), "AKs");
        assert_eq!(hand_class_name(ako), "AKo");
    }

    #[test]
    fn all_classes_reachable() {
        let mut seen = std::collections::HashSet::new();
        for combo in crate::cards::COMBOS.iter() {
            seen.insert(hand_class(combo[0], combo[1]));
        }
        assert_eq!(seen.len(), NUM_HAND_CLASSES as usize);
    }

    #[test]
    fn postflop_clusters_differ_by_street() {
        let m = HandClassMapper;
        let flop = parse_board("AhAd2c7s9d").unwrap();
        let turn = parse_board("AhAd2c7s9dKs").unwrap();
        assert!(m.map(&flop) >= NUM_HAND_CLASSES);
        assert_ne!(m.map(&flop), m.map(&turn));
    }

    #[test]
    fn kuhn_maps_ranks() {
        let m = KuhnMapper;
        assert_eq!(m.map(&[parse_card("Js").unwrap()]), 0);
        assert_eq!(m.map(&[parse_card("Ks").unwrap()]), 2);
        assert_ne!(m.id(), HandClassMapper.id());
    }
}
