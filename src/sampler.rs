//! Action samplers.
//!
//! A sampler fills one entry per action with the probability that the action
//! is traversed this iteration; zero means skip. Non-zero entries are never
//! below the real inclusion probability, so `1/q` importance weights stay
//! unbiased.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::policy::Policy;
use crate::pool::ScratchPool;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Sampler {
    /// Every action, probability 1.
    External,
    /// One action from the strategy mixed with `eps`-uniform exploration.
    Outcome { eps: f64 },
    /// `Outcome` with `eps` decaying linearly over `horizon` policy iterations.
    OutcomeDecay { eps_max: f64, eps_min: f64, horizon: u64 },
    /// `k` actions uniformly at random.
    Robust { k: usize },
    /// `k` distinct actions drawn from the strategy plus an exploration floor.
    MultiOutcome { k: usize, eps: f64 },
    /// Actions favoured by the average strategy.
    AverageStrategy { eps: f64, tau: f64, beta: f64 },
    /// `early` before global iteration `switch_at`, `late` from then on.
    ByIteration {
        early: Box<Sampler>,
        late: Box<Sampler>,
        switch_at: u64,
    },
    /// `shallow` above tree depth `depth`, `deep` at or below it.
    ByDepth {
        shallow: Box<Sampler>,
        deep: Box<Sampler>,
        depth: u8,
    },
}

impl Sampler {
    pub fn sample<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        policy: &Policy,
        global_iter: u64,
        depth: u8,
        pool: &ScratchPool,
        qs: &mut [f64],
    ) {
        let n = qs.len();
        match self {
            Sampler::External => qs.fill(1.0),

            Sampler::Outcome { eps } => outcome(rng, policy, *eps, qs),

            Sampler::OutcomeDecay {
                eps_max,
                eps_min,
                horizon,
            } => {
                let progress = (policy.iteration as f64 / (*horizon).max(1) as f64).min(1.0);
                let eps = eps_max - progress * (eps_max - eps_min);
                outcome(rng, policy, eps, qs);
            }

            Sampler::Robust { k } => {
                if n <= *k {
                    qs.fill(1.0);
                    return;
                }
                qs.fill(0.0);
                let q = *k as f64 / n as f64;
                qs[..*k].fill(q);
                qs.shuffle(rng);
            }

            Sampler::MultiOutcome { k, eps } => {
                if n <= *k {
                    qs.fill(1.0);
                    return;
                }
                qs.fill(0.0);

                let mut q = pool.alloc_from(&policy.strategy);
                let floor = eps / n as f64;
                q.iter_mut().for_each(|x| *x += floor);
                normalize(&mut q);

                let mut inclusion = pool.alloc(n);
                for j in 0..n {
                    inclusion[j] = draw_at_least_once(pool, &q, j, *k);
                }

                for _ in 0..*k {
                    // strategy mass ran out before k draws
                    if !(q.iter().sum::<f64>() > 0.0) {
                        break;
                    }
                    let picked = sample_index(rng, &q);
                    qs[picked] = inclusion[picked];
                    let mass = q[picked];
                    q[picked] = 0.0;
                    if mass < 1.0 {
                        q.iter_mut().for_each(|x| *x /= 1.0 - mass);
                    }
                }
            }

            Sampler::AverageStrategy { eps, tau, beta } => {
                let x: f64 = rng.gen();
                let total: f64 = policy.strategy_sum.iter().sum();
                for (q, s) in qs.iter_mut().zip(&policy.strategy_sum) {
                    let rho = ((beta + tau * s) / (beta + total)).max(*eps);
                    *q = if x < rho { rho.min(1.0) } else { 0.0 };
                }
            }

            Sampler::ByIteration {
                early,
                late,
                switch_at,
            } => {
                let s = if global_iter < *switch_at { early } else { late };
                s.sample(rng, policy, global_iter, depth, pool, qs);
            }

            Sampler::ByDepth {
                shallow,
                deep,
                depth: limit,
            } => {
                let s = if depth < *limit { shallow } else { deep };
                s.sample(rng, policy, global_iter, depth, pool, qs);
            }
        }
    }
}

fn outcome<R: Rng + ?Sized>(rng: &mut R, policy: &Policy, eps: f64, qs: &mut [f64]) {
    let n = qs.len();
    let selected = if rng.gen::<f64>() < eps {
        rng.gen_range(0..n)
    } else {
        sample_index(rng, &policy.strategy)
    };
    qs.fill(0.0);
    qs[selected] = eps / n as f64 + (1.0 - eps) * policy.strategy[selected];
}

fn normalize(v: &mut [f64]) {
    let total: f64 = v.iter().sum();
    if total > 0.0 {
        v.iter_mut().for_each(|x| *x /= total);
    }
}

/// Probability that `j` is among `k` draws without replacement from `p`.
fn draw_at_least_once(pool: &ScratchPool, p: &[f64], j: usize, k: usize) -> f64 {
    if k == 1 {
        return p[j];
    }
    let mut later = 0.0;
    for i in 0..p.len() {
        if i == j || p[i] <= 0.0 || p[i] >= 1.0 {
            continue;
        }
        let mut rest = pool.alloc_from(p);
        rest[i] = 0.0;
        rest.iter_mut().for_each(|x| *x /= 1.0 - p[i]);
        later += p[i] * draw_at_least_once(pool, &rest, j, k - 1);
    }
    p[j] + later
}

/// Index drawn proportionally to `weights`; zero-weight entries are never
/// returned unless every weight is zero.
pub fn sample_index<R: Rng + ?Sized>(rng: &mut R, weights: &[f64]) -> usize {
    let total: f64 = weights.iter().sum();
    if !(total > 0.0) {
        return rng.gen_range(0..weights.len());
    }
    let mut x = rng.gen::<f64>() * total;
    let mut last = 0;
    for (i, &w) in weights.iter().enumerate() {
        if w <= 0.0 {
            continue;
        }
        if x < w {
            return i;
        }
        x -= w;
        last = i;
    }
    last
}
