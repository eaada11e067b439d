//! Monte-Carlo CFR blueprint solver for no-limit poker.
//!
//! Training builds a lazily expanded game tree and fills it with one
//! regret-matching policy per (decision node, cluster). Live play maps a hand
//! onto the closest blueprint, optionally resolves the current street and
//! samples a legal action from the average strategy.

pub mod abstraction;
pub mod advisor;
pub mod cards;
pub mod cli;
pub mod config;
pub mod dealer;
pub mod display;
pub mod encoding;
pub mod error;
pub mod exploit;
pub mod hand_evaluator;
pub mod mccfr;
pub mod policy;
pub mod pool;
pub mod range;
pub mod resolver;
pub mod sampler;
pub mod scheduler;
pub mod table;
pub mod translate;
pub mod tree;
