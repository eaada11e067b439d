//! Information-set policy: regret matching with discounting and baselines.
//!
//! One [`Policy`] exists per (decision node, cluster). Traversals accumulate
//! regret and strategy weight into it while holding its lock; the end of the
//! iteration calls [`Policy::calculate`] exactly once, which discounts the
//! accumulators, folds the iteration's strategy weight into the average and
//! rebuilds the current strategy.

use serde::{Deserialize, Serialize};

/// Multipliers applied to the accumulators at the end of an iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiscountFactors {
    pub positive_regret: f64,
    pub negative_regret: f64,
    pub strategy_sum: f64,
}

impl DiscountFactors {
    pub const NONE: DiscountFactors = DiscountFactors {
        positive_regret: 1.0,
        negative_regret: 1.0,
        strategy_sum: 1.0,
    };
}

/// Largest power of four not above `iter`; 0 for 0.
pub fn msb_even(iter: u64) -> u64 {
    if iter == 0 {
        return 0;
    }
    let mut pos = 63 - iter.leading_zeros();
    if pos % 2 != 0 {
        pos -= 1;
    }
    1 << pos
}

/// Iteration-indexed discounting schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discount {
    /// Vanilla CFR.
    None,
    /// Negative regret floored, average restarted at every power-of-four block.
    CfrPlus,
    /// Linear averaging.
    Linear,
    /// Discounted CFR with exponents for positive regret, negative regret and
    /// the strategy sum.
    Dcfr { alpha: f64, beta: f64, gamma: f64 },
}

impl Discount {
    pub fn factors(&self, iter: u64) -> DiscountFactors {
        let block_start = iter - msb_even(iter) == 0;
        match *self {
            Discount::None => DiscountFactors::NONE,
            Discount::CfrPlus => DiscountFactors {
                positive_regret: 1.0,
                negative_regret: 0.0,
                strategy_sum: if block_start { 0.0 } else { 1.0 },
            },
            Discount::Linear => DiscountFactors {
                positive_regret: 1.0,
                negative_regret: 0.0,
                strategy_sum: iter as f64 / (iter as f64 + 1.0),
            },
            Discount::Dcfr { alpha, beta, gamma } => {
                let t = iter as f64;
                let ratio = |e: f64| {
                    let p = t.powf(e);
                    p / (p + 1.0)
                };
                DiscountFactors {
                    positive_regret: ratio(alpha),
                    negative_regret: ratio(beta),
                    strategy_sum: if block_start { 0.0 } else { ratio(gamma) },
                }
            }
        }
    }
}

/// Control-variate update rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BaselineRule {
    /// `b += rate · w · (v − b)`
    Ema { rate: f64 },
    /// Same as `Ema` with the step clamped to `±clamp`.
    EmaClamped { rate: f64, clamp: f64 },
    /// Rate ramps linearly from `min` to `max` over `horizon` policy iterations.
    Ramped { min: f64, max: f64, horizon: f64 },
    /// Running mean over policy iterations.
    Mean,
}

impl Default for BaselineRule {
    fn default() -> Self {
        BaselineRule::Ema { rate: 0.01 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub iteration: u64,
    pub strategy: Vec<f64>,
    #[serde(skip)]
    pub strategy_weight: f64,
    pub regret_sum: Vec<f64>,
    pub strategy_sum: Vec<f64>,
    pub baseline: Vec<f64>,
}

impl Policy {
    pub fn new(actions: usize) -> Policy {
        Policy {
            iteration: 0,
            strategy: uniform(actions),
            strategy_weight: 0.0,
            regret_sum: vec![0.0; actions],
            strategy_sum: vec![0.0; actions],
            baseline: vec![0.0; actions],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.strategy.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.strategy.is_empty()
    }

    /// Current regret-matching strategy.
    #[inline]
    pub fn strategy(&self) -> &[f64] {
        &self.strategy
    }

    /// `regret_sum += weight · deltas`
    pub fn add_regret(&mut self, weight: f64, deltas: &[f64]) {
        for (r, d) in self.regret_sum.iter_mut().zip(deltas) {
            *r += weight * d;
        }
    }

    /// Weight of the current strategy in this iteration's average.
    #[inline]
    pub fn add_strategy_weight(&mut self, weight: f64) {
        self.strategy_weight += weight;
    }

    pub fn update_baseline(&mut self, rule: BaselineRule, weight: f64, action: usize, value: f64) -> f64 {
        let b = &mut self.baseline[action];
        match rule {
            BaselineRule::Ema { rate } => {
                *b += rate * weight * (value - *b);
            }
            BaselineRule::EmaClamped { rate, clamp } => {
                *b += (rate * weight * (value - *b)).clamp(-clamp, clamp);
            }
            BaselineRule::Ramped { min, max, horizon } => {
                let progress = (self.iteration as f64 / horizon.max(1.0)).min(1.0);
                let rate = min + (max - min) * progress;
                *b += rate * weight * (value - *b);
            }
            BaselineRule::Mean => {
                let n = self.iteration as f64 + 1.0;
                *b = (*b * (n - 1.0) + weight * value) / n;
            }
        }
        *b
    }

    /// Normalised strategy sum, uniform when nothing was accumulated.
    pub fn average_strategy(&self) -> Vec<f64> {
        let total: f64 = self.strategy_sum.iter().sum();
        if total > 0.0 {
            self.strategy_sum.iter().map(|s| s / total).collect()
        } else {
            uniform(self.len())
        }
    }

    /// Regret matching: positive regret normalised, uniform if none.
    pub fn build_strategy(&mut self) {
        let mut total = 0.0;
        for (s, r) in self.strategy.iter_mut().zip(&self.regret_sum) {
            *s = r.max(0.0);
            total += *s;
        }
        if total > 0.0 {
            let inv = 1.0 / total;
            self.strategy.iter_mut().for_each(|s| *s *= inv);
        } else {
            let u = 1.0 / self.len() as f64;
            self.strategy.iter_mut().for_each(|s| *s = u);
        }
    }

    /// End-of-iteration update for global iteration `iter`.
    pub fn calculate(&mut self, iter: u64, discount: Discount) {
        let d = discount.factors(iter);
        self.iteration += 1;

        if d.strategy_sum != 1.0 {
            self.strategy_sum.iter_mut().for_each(|s| *s *= d.strategy_sum);
        }
        let w = self.strategy_weight;
        for (s, p) in self.strategy_sum.iter_mut().zip(&self.strategy) {
            *s += w * p;
        }
        for r in self.regret_sum.iter_mut() {
            *r *= if *r > 0.0 { d.positive_regret } else { d.negative_regret };
        }
        self.build_strategy();
        self.strategy_weight = 0.0;
    }

    /// First non-finite accumulator, if any.
    pub fn find_corruption(&self) -> Option<String> {
        let fields: [(&str, &[f64]); 3] = [
            ("regret_sum", &self.regret_sum),
            ("strategy_sum", &self.strategy_sum),
            ("baseline", &self.baseline),
        ];
        fields.iter().find_map(|(name, values)| {
            values
                .iter()
                .position(|v| !v.is_finite())
                .map(|i| format!("{}[{}] = {}", name, i, values[i]))
        })
    }
}

pub fn uniform(n: usize) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    vec![1.0 / n as f64; n]
}
