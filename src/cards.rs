//! Cards, decks and two-card hole combinations.
//!
//! Every card has a dense index in `0..52` (`rank_offset * 4 + suit`), which is
//! what the dealers, ranges and the binary codec work with. The 1326 hole-card
//! combinations are enumerated once in a fixed order so that a range can be a
//! flat vector indexed by combo.

use std::fmt;

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{SolverError, SolverResult};

pub const RANKS_STR: &str = "23456789TJQKA";
pub const SUITS_STR: &str = "shdc";

/// Number of distinct two-card hole combinations.
pub const NUM_COMBOS: usize = 1326;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Rank {
    Two = 2,
    Three = 3,
    Four = 4,
    Five = 5,
    Six = 6,
    Seven = 7,
    Eight = 8,
    Nine = 9,
    Ten = 10,
    Jack = 11,
    Queen = 12,
    King = 13,
    Ace = 14,
}

impl Rank {
    pub fn from_char(c: char) -> SolverResult<Rank> {
        match RANKS_STR.find(c.to_ascii_uppercase()) {
            Some(i) => Ok(ALL_RANKS[i]),
            None => Err(SolverError::InvalidRank(c)),
        }
    }

    pub fn to_char(self) -> char {
        RANKS_STR.as_bytes()[self.offset()] as char
    }

    pub fn value(self) -> u8 {
        self as u8
    }

    /// Zero-based position: Two = 0, Ace = 12.
    #[inline]
    pub fn offset(self) -> usize {
        self as usize - 2
    }
}

pub const ALL_RANKS: [Rank; 13] = [
    Rank::Two,
    Rank::Three,
    Rank::Four,
    Rank::Five,
    Rank::Six,
    Rank::Seven,
    Rank::Eight,
    Rank::Nine,
    Rank::Ten,
    Rank::Jack,
    Rank::Queen,
    Rank::King,
    Rank::Ace,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Suit {
    Spades = 0,
    Hearts = 1,
    Diamonds = 2,
    Clubs = 3,
}

impl Suit {
    pub fn from_char(c: char) -> SolverResult<Suit> {
        match SUITS_STR.find(c.to_ascii_lowercase()) {
            Some(i) => Ok(ALL_SUITS[i]),
            None => Err(SolverError::InvalidSuit(c)),
        }
    }

    pub fn to_char(self) -> char {
        SUITS_STR.as_bytes()[self as usize] as char
    }
}

pub const ALL_SUITS: [Suit; 4] = [Suit::Spades, Suit::Hearts, Suit::Diamonds, Suit::Clubs];

/// A playing card. Ordered by rank first, then suit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Card {
    pub rank: Rank,
    pub suit: Suit,
}

impl Card {
    pub fn new(rank: Rank, suit: Suit) -> Card {
        Card { rank, suit }
    }

    pub fn value(&self) -> u8 {
        self.rank.value()
    }

    /// Dense index in `0..52`.
    #[inline]
    pub fn index(&self) -> u8 {
        (self.rank.offset() * 4 + self.suit as usize) as u8
    }

    pub fn from_index(index: u8) -> SolverResult<Card> {
        if index >= 52 {
            return Err(SolverError::Codec(format!("card index {} out of range", index)));
        }
        let i = index as usize;
        Ok(Card::new(ALL_RANKS[i / 4], ALL_SUITS[i % 4]))
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.rank.to_char(), self.suit.to_char())
    }
}

/// A shuffled stack of cards dealt from the back.
#[derive(Debug, Clone)]
pub struct Deck {
    pub cards: Vec<Card>,
}

impl Deck {
    pub fn new(exclude: Option<&[Card]>) -> Deck {
        let excluded = exclude.unwrap_or(&[]);
        let cards = ALL_RANKS
            .iter()
            .flat_map(|&r| ALL_SUITS.iter().map(move |&s| Card::new(r, s)))
            .filter(|c| !excluded.contains(c))
            .collect();
        Deck { cards }
    }

    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) -> &mut Self {
        self.cards.shuffle(rng);
        self
    }

    pub fn deal(&mut self, n: usize) -> SolverResult<Vec<Card>> {
        if n > self.cards.len() {
            return Err(SolverError::NotEnoughDeck {
                requested: n,
                available: self.cards.len(),
            });
        }
        let at = self.cards.len() - n;
        Ok(self.cards.split_off(at))
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

pub fn parse_card(notation: &str) -> SolverResult<Card> {
    let notation = notation.trim();
    let chars: Vec<char> = notation.chars().collect();
    if chars.len() != 2 {
        return Err(SolverError::InvalidCardNotation(notation.to_string()));
    }
    let rank = Rank::from_char(chars[0])?;
    let suit = Suit::from_char(chars[1])?;
    Ok(Card::new(rank, suit))
}

pub fn parse_board(notation: &str) -> SolverResult<Vec<Card>> {
    let notation = notation.trim().replace([' ', ','], "");
    if notation.len() % 2 != 0 {
        return Err(SolverError::InvalidBoardNotation(notation));
    }
    let chars: Vec<char> = notation.chars().collect();
    chars
        .chunks(2)
        .map(|pair| parse_card(&pair.iter().collect::<String>()))
        .collect()
}

pub fn format_cards(cards: &[Card]) -> String {
    cards.iter().map(|c| c.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Hole-card combinations
// ---------------------------------------------------------------------------

/// All 1326 two-card combinations, `(low, high)` by card index.
pub static COMBOS: Lazy<Vec<[Card; 2]>> = Lazy::new(|| {
    let mut combos = Vec::with_capacity(NUM_COMBOS);
    for hi in 1..52u8 {
        for lo in 0..hi {
            // Indices are in range by construction.
            if let (Ok(a), Ok(b)) = (Card::from_index(lo), Card::from_index(hi)) {
                combos.push([a, b]);
            }
        }
    }
    combos
});

/// Position of a two-card combination in [`COMBOS`].
pub fn combo_index(a: Card, b: Card) -> usize {
    let (lo, hi) = if a.index() < b.index() {
        (a.index() as usize, b.index() as usize)
    } else {
        (b.index() as usize, a.index() as usize)
    };
    hi * (hi - 1) / 2 + lo
}

/// True when either card of the combo appears in `known`.
#[inline]
pub fn blocked(combo: &[Card; 2], known: &[Card]) -> bool {
    known.iter().any(|k| *k == combo[0] || *k == combo[1])
}
