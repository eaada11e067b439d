//! Training scheduler.
//!
//! A dedicated rayon pool runs `workers` traversal loops. Each worker owns a
//! dealer clone, a [`Runner`] and an RNG stream derived from the seed, claims
//! `batch_size` iterations at a time and reports its EV and update count
//! into its own slot. Claims never cross the next epoch boundary, so once
//! `epoch_size` iterations have landed every worker is parked and the tree
//! is quiet. The coordinator then folds the slots into a [`Stats`] line,
//! estimates exploitability and calls the checkpoint hook before moving the
//! boundary and waking the workers. Stopping (token, deadline or iteration
//! budget) lets workers finish their batch, then the coordinator runs one
//! last pass with `final = true`. The coordinator runs on the calling
//! thread.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info};
use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::abstraction::ClusterMapper;
use crate::dealer::Dealer;
use crate::error::{SolverError, SolverResult};
use crate::exploit::exploitability;
use crate::mccfr::{Runner, TraversalConfig};
use crate::tree::Tree;

const EV_WINDOW: usize = 10;
const EXPLOIT_WINDOW: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub workers: usize,
    /// Total iterations; 0 runs until cancelled.
    pub iterations: u64,
    pub batch_size: u64,
    pub epoch_size: u64,
    pub seed: u64,
    /// Deals per best-response pass. Games that enumerate ignore it; 0
    /// disables the pass for the others.
    pub exploit_samples: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            workers: 1,
            iterations: 0,
            batch_size: 100,
            epoch_size: 10_000,
            seed: 42,
            exploit_samples: 0,
        }
    }
}

impl RunConfig {
    pub fn validate(&self, tree: &Tree) -> SolverResult<()> {
        if self.workers == 0 {
            return Err(SolverError::InvalidParams("at least one worker is required".into()));
        }
        if self.batch_size == 0 || self.epoch_size == 0 {
            return Err(SolverError::InvalidParams(
                "batch and epoch sizes must be positive".into(),
            ));
        }
        if self.batch_size * self.workers as u64 > self.epoch_size {
            return Err(SolverError::InvalidParams(format!(
                "batch {} x workers {} exceeds epoch {}",
                self.batch_size, self.workers, self.epoch_size
            )));
        }
        if tree.is_shared() && self.workers > 1 {
            return Err(SolverError::InvalidParams(
                "trees with shared subtrees train on a single worker".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Shared stop flag with an optional deadline. Children stop with their
/// parent and may carry a tighter deadline of their own.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn with_deadline(timeout: Duration) -> CancelToken {
        CancelToken {
            deadline: Some(Instant::now() + timeout),
            ..CancelToken::default()
        }
    }

    pub fn child(&self, timeout: Duration) -> CancelToken {
        let own = Instant::now() + timeout;
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::clone(&self.flag)),
            deadline: Some(self.deadline.map_or(own, |d| d.min(own))),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
            || self.parent.as_ref().is_some_and(|p| p.load(Ordering::Relaxed))
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stats {
    pub epoch: u64,
    pub iterations: u64,
    pub iterations_per_sec: f64,
    pub updates_per_sec: f64,
    pub states: u32,
    pub nodes: u32,
    /// Rolling mean over the last epochs.
    pub exploitability: f64,
    /// Rolling mean of the traverser's value.
    pub ev: f64,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ep: {} | it: {} | it/s: {:.0} | up/s: {:.0} | sts: {} | nodes: {} | exp: {:.5} | ev: {:.5}",
            self.epoch,
            self.iterations,
            self.iterations_per_sec,
            self.updates_per_sec,
            self.states,
            self.nodes,
            self.exploitability,
            self.ev
        )
    }
}

#[derive(Debug)]
struct Window {
    values: VecDeque<f64>,
    cap: usize,
}

impl Window {
    fn new(cap: usize) -> Window {
        Window {
            values: VecDeque::with_capacity(cap.min(64)),
            cap,
        }
    }

    fn push(&mut self, v: f64) -> f64 {
        if self.values.len() == self.cap {
            self.values.pop_front();
        }
        self.values.push_back(v);
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }
}

/// Outcome of a training run.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    /// Epoch boundaries crossed, not counting the final pass.
    pub epochs: u64,
    pub iterations: u64,
    /// One entry per epoch plus the final pass.
    pub history: Vec<Stats>,
}

impl Summary {
    pub fn last(&self) -> Option<&Stats> {
        self.history.last()
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Slot {
    ev: f64,
    batches: u64,
    updates: u64,
}

#[derive(Debug)]
struct Progress {
    /// Iterations finished and reported.
    iterations: u64,
    /// Iterations handed out, finished or not.
    claimed: u64,
    /// No claim reaches past this until the coordinator has checkpointed.
    boundary: u64,
    slots: Vec<Slot>,
    active: usize,
    error: Option<SolverError>,
}

impl Progress {
    /// Iterations granted for the next batch, 0 while parked at the
    /// boundary. `None` once the budget is spent.
    fn grant(&mut self, batch: u64, budget: u64) -> Option<u64> {
        let mut room = self.boundary.saturating_sub(self.claimed);
        if budget > 0 {
            let left = budget.saturating_sub(self.claimed);
            if left == 0 {
                return None;
            }
            room = room.min(left);
        }
        let n = room.min(batch);
        self.claimed += n;
        Some(n)
    }

    /// Every claimed batch up to the boundary has been reported.
    fn at_boundary(&self) -> bool {
        self.iterations >= self.boundary
    }
}

struct Shared<'a> {
    progress: Mutex<Progress>,
    wake: Condvar,
    stop: AtomicBool,
    cancel: &'a CancelToken,
    budget: u64,
}

impl Shared<'_> {
    fn halted(&self) -> bool {
        self.stop.load(Ordering::Relaxed) || self.cancel.is_cancelled()
    }

    /// Blocks while the epoch boundary is reached; 0 means stop.
    fn claim(&self, batch: u64) -> u64 {
        let mut p = self.progress.lock();
        loop {
            if self.halted() {
                return 0;
            }
            match p.grant(batch, self.budget) {
                None => return 0,
                Some(0) => {
                    self.wake.wait_for(&mut p, Duration::from_millis(50));
                }
                Some(n) => return n,
            }
        }
    }
}

/// Train `tree` until the budget is spent or `cancel` fires.
pub fn train<D, M>(
    tree: &Tree,
    dealer: &D,
    mapper: &M,
    traversal: &TraversalConfig,
    config: &RunConfig,
    cancel: &CancelToken,
    checkpoint: &mut dyn FnMut(u64, bool) -> SolverResult<()>,
) -> SolverResult<Summary>
where
    D: Dealer,
    M: ClusterMapper + ?Sized,
{
    config.validate(tree)?;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .thread_name(|i| format!("mccfr-{}", i))
        .build()
        .map_err(|e| SolverError::Worker(e.to_string()))?;

    let shared = Shared {
        progress: Mutex::new(Progress {
            iterations: 0,
            claimed: 0,
            boundary: config.epoch_size,
            slots: (0..config.workers).map(|_| Slot::default()).collect(),
            active: config.workers,
            error: None,
        }),
        wake: Condvar::new(),
        stop: AtomicBool::new(false),
        cancel,
        budget: config.iterations,
    };

    let result = pool.in_place_scope(|s| {
        for w in 0..config.workers {
            let shared = &shared;
            let mut dealer = dealer.clone();
            s.spawn(move |_| worker(w, tree, &mut dealer, mapper, traversal, config, shared));
        }
        let outcome = coordinate(tree, dealer, mapper, config, &shared, checkpoint);
        shared.stop.store(true, Ordering::Relaxed);
        outcome
    });

    if let Some(e) = shared.progress.lock().error.take() {
        return Err(e);
    }
    result
}

fn worker<D, M>(
    w: usize,
    tree: &Tree,
    dealer: &mut D,
    mapper: &M,
    traversal: &TraversalConfig,
    config: &RunConfig,
    shared: &Shared<'_>,
) where
    D: Dealer,
    M: ClusterMapper + ?Sized,
{
    let mut runner = Runner::new(traversal.clone());
    let seed = config.seed ^ (w as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    let mut rng = StdRng::seed_from_u64(seed);

    loop {
        let n = shared.claim(config.batch_size);
        if n == 0 {
            break;
        }
        match runner.run(tree, dealer, mapper, n, &mut rng) {
            Ok((ev, updates)) => {
                let mut p = shared.progress.lock();
                p.iterations += n;
                let slot = &mut p.slots[w];
                slot.ev += ev;
                slot.batches += 1;
                slot.updates += updates;
                shared.wake.notify_all();
            }
            Err(e) => {
                error!("worker {} failed: {}", w, e);
                shared.stop.store(true, Ordering::Relaxed);
                shared.progress.lock().error.get_or_insert(e);
                break;
            }
        }
    }

    let mut p = shared.progress.lock();
    p.active -= 1;
    shared.wake.notify_all();
}

struct Epoch<D> {
    dealer: D,
    rng: StdRng,
    evs: Window,
    exploits: Window,
    last_iterations: u64,
    last_time: Instant,
}

fn coordinate<D, M>(
    tree: &Tree,
    dealer: &D,
    mapper: &M,
    config: &RunConfig,
    shared: &Shared<'_>,
    checkpoint: &mut dyn FnMut(u64, bool) -> SolverResult<()>,
) -> SolverResult<Summary>
where
    D: Dealer,
    M: ClusterMapper + ?Sized,
{
    let mut epoch = Epoch {
        dealer: dealer.clone(),
        rng: StdRng::seed_from_u64(config.seed),
        evs: Window::new(EV_WINDOW),
        exploits: Window::new(EXPLOIT_WINDOW),
        last_iterations: 0,
        last_time: Instant::now(),
    };
    let mut summary = Summary::default();

    loop {
        let mut p = shared.progress.lock();
        while !p.at_boundary() && p.active > 0 && !shared.halted() {
            shared.wake.wait_for(&mut p, Duration::from_millis(50));
        }
        if p.error.is_some() {
            return Ok(summary);
        }
        if !p.at_boundary() {
            // stopped or budget spent between boundaries
            if p.active > 0 {
                shared.stop.store(true, Ordering::Relaxed);
                while p.active > 0 {
                    shared.wake.wait_for(&mut p, Duration::from_millis(50));
                }
                if p.error.is_some() {
                    return Ok(summary);
                }
            }
            let stats = report(tree, mapper, config, &mut epoch, &mut p, summary.epochs)?;
            drop(p);
            summary.iterations = stats.iterations;
            summary.history.push(stats);
            checkpoint(summary.epochs, true)?;
            return Ok(summary);
        }

        // workers are parked until the boundary moves
        summary.epochs += 1;
        let stats = report(tree, mapper, config, &mut epoch, &mut p, summary.epochs)?;
        drop(p);
        summary.iterations = stats.iterations;
        summary.history.push(stats);
        checkpoint(summary.epochs, false)?;

        shared.progress.lock().boundary += config.epoch_size;
        shared.wake.notify_all();
    }
}

fn report<D, M>(
    tree: &Tree,
    mapper: &M,
    config: &RunConfig,
    epoch: &mut Epoch<D>,
    progress: &mut Progress,
    number: u64,
) -> SolverResult<Stats>
where
    D: Dealer,
    M: ClusterMapper + ?Sized,
{
    let (mut ev, mut batches, mut updates) = (0.0, 0u64, 0u64);
    for slot in progress.slots.iter_mut() {
        ev += slot.ev;
        batches += slot.batches;
        updates += slot.updates;
        *slot = Slot::default();
    }
    let iterations = progress.iterations;

    let exploit = exploitability(
        tree,
        &mut epoch.dealer,
        mapper,
        &mut epoch.rng,
        config.exploit_samples,
    )?;

    let now = Instant::now();
    let secs = now.duration_since(epoch.last_time).as_secs_f64().max(1e-9);
    let stats = Stats {
        epoch: number,
        iterations,
        iterations_per_sec: (iterations - epoch.last_iterations) as f64 / secs,
        updates_per_sec: updates as f64 / secs,
        states: tree.states(),
        nodes: tree.nodes(),
        exploitability: epoch.exploits.push(exploit),
        ev: if batches > 0 {
            epoch.evs.push(ev / batches as f64)
        } else {
            epoch.evs.push(0.0)
        },
    };
    epoch.last_iterations = iterations;
    epoch.last_time = now;
    info!("{}", stats);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abstraction::{KuhnMapper, KUHN_ABS_ID};
    use crate::dealer::KuhnDealer;
    use crate::table::GameParams;

    fn kuhn() -> Tree {
        Tree::new(GameParams::kuhn(), KUHN_ABS_ID).unwrap()
    }

    #[test]
    fn rejects_batches_larger_than_an_epoch() {
        let config = RunConfig {
            workers: 4,
            batch_size: 100,
            epoch_size: 300,
            ..RunConfig::default()
        };
        assert!(matches!(config.validate(&kuhn()), Err(SolverError::InvalidParams(_))));
        let config = RunConfig {
            workers: 0,
            ..RunConfig::default()
        };
        assert!(config.validate(&kuhn()).is_err());
    }

    #[test]
    fn shared_trees_need_a_single_worker() {
        let tree = kuhn().with_shared_subtrees();
        let config = RunConfig {
            workers: 2,
            batch_size: 10,
            epoch_size: 100,
            ..RunConfig::default()
        };
        assert!(config.validate(&tree).is_err());
    }

    #[test]
    fn budget_runs_every_epoch_then_a_final_pass() {
        let tree = kuhn();
        let config = RunConfig {
            workers: 2,
            iterations: 1_000,
            batch_size: 50,
            epoch_size: 200,
            ..RunConfig::default()
        };
        let mut calls = Vec::new();
        let summary = train(
            &tree,
            &KuhnDealer,
            &KuhnMapper,
            &TraversalConfig::default(),
            &config,
            &CancelToken::new(),
            &mut |epoch, last| {
                calls.push((epoch, last));
                Ok(())
            },
        )
        .unwrap();

        assert_eq!(tree.iteration(), 1_000);
        assert_eq!(summary.iterations, 1_000);
        assert_eq!(summary.epochs, 5);
        assert_eq!(calls.last(), Some(&(5, true)));
        assert_eq!(calls.iter().filter(|(_, last)| !last).count(), 5);
    }

    #[test]
    fn checkpoints_see_the_tree_at_the_epoch_boundary() {
        let tree = kuhn();
        let config = RunConfig {
            workers: 4,
            iterations: 3_000,
            batch_size: 30,
            epoch_size: 500,
            ..RunConfig::default()
        };
        let path = std::env::temp_dir().join(format!("gto-epoch-{}.bin", std::process::id()));
        let mut seen = Vec::new();
        train(
            &tree,
            &KuhnDealer,
            &KuhnMapper,
            &TraversalConfig::default(),
            &config,
            &CancelToken::new(),
            &mut |epoch, last| {
                crate::encoding::save_tree(&tree, &path)?;
                let saved = crate::encoding::load_tree(&path, KUHN_ABS_ID)?;
                seen.push((epoch, last, saved.iteration(), tree.iteration()));
                Ok(())
            },
        )
        .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(seen.len(), 7);
        for &(epoch, last, saved, live) in &seen {
            assert_eq!(saved, live);
            if !last {
                assert_eq!(saved, epoch * config.epoch_size);
            }
        }
        assert_eq!(seen.last(), Some(&(6, true, 3_000, 3_000)));
    }

    #[test]
    fn parked_workers_wait_for_the_boundary() {
        let mut p = Progress {
            iterations: 0,
            claimed: 0,
            boundary: 100,
            slots: Vec::new(),
            active: 1,
            error: None,
        };
        assert_eq!(p.grant(60, 0), Some(60));
        assert_eq!(p.grant(60, 0), Some(40));
        assert_eq!(p.grant(60, 0), Some(0));
        p.iterations = 100;
        assert!(p.at_boundary());
        p.boundary = 200;
        assert_eq!(p.grant(60, 150), Some(50));
        assert_eq!(p.grant(60, 150), None);
    }

    #[test]
    fn cancelled_token_still_checkpoints_once() {
        let tree = kuhn();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut finals = 0;
        let summary = train(
            &tree,
            &KuhnDealer,
            &KuhnMapper,
            &TraversalConfig::default(),
            &RunConfig::default(),
            &cancel,
            &mut |_, last| {
                finals += usize::from(last);
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(finals, 1);
        assert_eq!(summary.epochs, 0);
    }

    #[test]
    fn checkpoint_errors_stop_training() {
        let tree = kuhn();
        let config = RunConfig {
            iterations: 10_000,
            batch_size: 10,
            epoch_size: 100,
            ..RunConfig::default()
        };
        let result = train(
            &tree,
            &KuhnDealer,
            &KuhnMapper,
            &TraversalConfig::default(),
            &config,
            &CancelToken::new(),
            &mut |_, _| Err(SolverError::Worker("disk full".into())),
        );
        assert!(result.is_err());
        assert!(tree.iteration() < 10_000);
    }

    #[test]
    fn child_token_follows_parent() {
        let parent = CancelToken::new();
        let child = parent.child(Duration::from_secs(60));
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
        let expired = CancelToken::new().child(Duration::ZERO);
        assert!(expired.is_cancelled());
    }

    #[test]
    fn window_keeps_rolling_mean() {
        let mut w = Window::new(2);
        assert_eq!(w.push(1.0), 1.0);
        assert_eq!(w.push(3.0), 2.0);
        assert_eq!(w.push(5.0), 4.0);
    }
}
