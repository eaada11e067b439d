//! Showdown evaluation.
//!
//! Hands are scored as a packed `u32`: the category in the top bits followed by
//! up to five 4-bit tie-break values. Higher is better, equal scores split.

use std::fmt;

use itertools::Itertools;

use crate::cards::Card;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandCategory {
    HighCard = 0,
    OnePair = 1,
    TwoPair = 2,
    ThreeOfAKind = 3,
    Straight = 4,
    Flush = 5,
    FullHouse = 6,
    FourOfAKind = 7,
    StraightFlush = 8,
}

pub const ALL_CATEGORIES: [HandCategory; 9] = [
    HandCategory::HighCard,
    HandCategory::OnePair,
    HandCategory::TwoPair,
    HandCategory::ThreeOfAKind,
    HandCategory::Straight,
    HandCategory::Flush,
    HandCategory::FullHouse,
    HandCategory::FourOfAKind,
    HandCategory::StraightFlush,
];

impl fmt::Display for HandCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandCategory::HighCard => "High Card",
            HandCategory::OnePair => "One Pair",
            HandCategory::TwoPair => "Two Pair",
            HandCategory::ThreeOfAKind => "Three of a Kind",
            HandCategory::Straight => "Straight",
            HandCategory::Flush => "Flush",
            HandCategory::FullHouse => "Full House",
            HandCategory::FourOfAKind => "Four of a Kind",
            HandCategory::StraightFlush => "Straight Flush",
        };
        write!(f, "{}", name)
    }
}

/// Packed hand strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandRank(pub u32);

impl HandRank {
    fn pack(category: HandCategory, kickers: &[u8]) -> HandRank {
        let mut score = category as u32;
        for i in 0..5 {
            score = (score << 4) | kickers.get(i).copied().unwrap_or(0) as u32;
        }
        HandRank(score)
    }

    pub fn category(&self) -> HandCategory {
        ALL_CATEGORIES[((self.0 >> 20) as usize).min(8)]
    }
}

/// Highest card of a straight contained in the rank mask, if any.
fn straight_high(mask: u16) -> Option<u8> {
    for high in (5..=14u8).rev() {
        let run = if high == 5 {
            // A-2-3-4-5
            (1u16 << 14) | (0b1111 << 2)
        } else {
            0b11111 << (high - 4)
        };
        if mask & run == run {
            return Some(high);
        }
    }
    None
}

fn evaluate_five(cards: &[Card]) -> HandRank {
    let mut values: Vec<u8> = cards.iter().map(|c| c.value()).collect();
    values.sort_unstable_by(|a, b| b.cmp(a));

    let flush = cards.len() == 5 && cards.iter().all(|c| c.suit == cards[0].suit);
    let mask = values.iter().fold(0u16, |m, &v| m | (1 << v));
    let straight = if mask.count_ones() == 5 { straight_high(mask) } else { None };

    if let (true, Some(high)) = (flush, straight) {
        return HandRank::pack(HandCategory::StraightFlush, &[high]);
    }

    // (count, value) sorted by count desc, then value desc
    let groups: Vec<(usize, u8)> = values
        .iter()
        .copied()
        .dedup_with_count()
        .sorted_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)))
        .collect();
    let ordered: Vec<u8> = groups.iter().map(|g| g.1).collect();

    let category = match (groups[0].0, groups.get(1).map(|g| g.0)) {
        (4, _) => HandCategory::FourOfAKind,
        (3, Some(2)) => HandCategory::FullHouse,
        _ if flush => return HandRank::pack(HandCategory::Flush, &values),
        _ if straight.is_some() => {
            return HandRank::pack(HandCategory::Straight, &[straight.unwrap_or(0)])
        }
        (3, _) => HandCategory::ThreeOfAKind,
        (2, Some(2)) => HandCategory::TwoPair,
        (2, _) => HandCategory::OnePair,
        _ => HandCategory::HighCard,
    };
    HandRank::pack(category, &ordered)
}

/// Best five-card score from up to 7 cards. Fewer than five cards only make
/// pairs, trips and quads.
pub fn evaluate(cards: &[Card]) -> HandRank {
    if cards.len() <= 5 {
        return evaluate_five(cards);
    }
    cards
        .iter()
        .copied()
        .combinations(5)
        .map(|five| evaluate_five(&five))
        .max()
        .unwrap_or(HandRank(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cards::parse_board;

    fn rank_of(s: &str) -> HandRank {
        evaluate(&parse_board(s).unwrap())
    }

    #[test]
    fn categories_are_detected() {
        assert_eq!(rank_of("AsKsQsJsTs").category(), HandCategory::StraightFlush);
        assert_eq!(rank_of("9h9d9s9c2h").category(), HandCategory::FourOfAKind);
        assert_eq!(rank_of("9h9d9s2c2h").category(), HandCategory::FullHouse);
        assert_eq!(rank_of("Ah9h7h4h2h").category(), HandCategory::Flush);
        assert_eq!(rank_of("As2d3h4c5s").category(), HandCategory::Straight);
        assert_eq!(rank_of("7h7d7s2c3h").category(), HandCategory::ThreeOfAKind);
        assert_eq!(rank_of("7h7d3s3c2h").category(), HandCategory::TwoPair);
        assert_eq!(rank_of("7h7d4s3c2h").category(), HandCategory::OnePair);
        assert_eq!(rank_of("Kh9d4s3c2h").category(), HandCategory::HighCard);
    }

    #[test]
    fn wheel_loses_to_six_high_straight() {
        assert!(rank_of("As2d3h4c5s") < rank_of("2d3h4c5s6h"));
    }

    #[test]
    fn best_of_seven_uses_board() {
        let r = rank_of("2c7dAhAdAsKhKc");
        assert_eq!(r.category(), HandCategory::FullHouse);
    }

    #[test]
    fn short_hands_never_flush() {
        assert_eq!(rank_of("AhKh").category(), HandCategory::HighCard);
        assert_eq!(rank_of("AhKhQh").category(), HandCategory::HighCard);
        assert!(rank_of("2c2d") > rank_of("AhKh"));
    }

    #[test]
    fn kickers_break_ties() {
        assert!(rank_of("AhAdKs7c2h") > rank_of("AcAsQs7d2d"));
        assert_eq!(rank_of("AhAdKs7c2h"), rank_of("AcAsKd7d2d"));
    }
}
