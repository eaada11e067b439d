//! Training and resolving settings.
//!
//! Everything has a default; a JSON file may override any subset of fields
//! and the CLI overrides individual values on top of that.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::SolverResult;
use crate::mccfr::TraversalConfig;
use crate::policy::{BaselineRule, Discount};
use crate::scheduler::RunConfig;
use crate::table::{Chips, GameParams, Street};

/// Read a JSON config file; missing fields keep their defaults.
pub fn load<T: DeserializeOwned>(path: &Path) -> SolverResult<T> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub players: u8,
    /// Starting stack of every seat, in chips.
    pub stack: Chips,
    pub small_blind: Chips,
    /// Share chance subtrees between identical betting states. Forces a
    /// single worker.
    pub shared_subtrees: bool,
    pub run: RunConfig,
    pub traversal: TraversalConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            players: 2,
            stack: 20.0,
            small_blind: 0.5,
            shared_subtrees: false,
            run: RunConfig::default(),
            traversal: TraversalConfig::default(),
        }
    }
}

impl TrainConfig {
    pub fn from_file(path: &Path) -> SolverResult<TrainConfig> {
        load(path)
    }

    pub fn game_params(&self) -> SolverResult<GameParams> {
        let params = GameParams::new(self.players, self.stack, self.small_blind);
        params.validate()?;
        Ok(params)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolveConfig {
    /// Decisions on this street or earlier use the blueprint as is.
    pub trigger: Street,
    /// Wall-clock budget of one resolve.
    pub budget_ms: u64,
    pub workers: usize,
    pub batch_size: u64,
    pub epoch_size: u64,
    pub max_actions_per_round: u8,
    pub discount: Discount,
    pub baseline: BaselineRule,
    pub seed: u64,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        ResolveConfig {
            trigger: Street::Turn,
            budget_ms: 7_000,
            workers: default_workers(),
            batch_size: 500,
            epoch_size: 500,
            max_actions_per_round: 3,
            discount: Discount::CfrPlus,
            baseline: BaselineRule::Ema { rate: 0.25 },
            seed: 7,
        }
    }
}

impl ResolveConfig {
    pub fn from_file(path: &Path) -> SolverResult<ResolveConfig> {
        load(path)
    }

    /// Scheduler settings for one resolve; the epoch is widened so every
    /// worker fits one batch into it.
    pub fn run_config(&self) -> RunConfig {
        let workers = self.workers.max(1);
        RunConfig {
            workers,
            iterations: 0,
            batch_size: self.batch_size.max(1),
            epoch_size: self.epoch_size.max(self.batch_size.max(1) * workers as u64),
            seed: self.seed,
            exploit_samples: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::Sampler;
    use std::io::Write;

    #[test]
    fn partial_json_keeps_defaults() {
        let json = r#"{
            "stack": 40.0,
            "run": { "workers": 3, "iterations": 5000 },
            "traversal": {
                "opponent": { "kind": "outcome", "eps": 0.1 },
                "discount": { "kind": "cfr_plus" },
                "prune": -300.0
            }
        }"#;
        let config: TrainConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.players, 2);
        assert_eq!(config.stack, 40.0);
        assert_eq!(config.run.workers, 3);
        assert_eq!(config.run.batch_size, RunConfig::default().batch_size);
        assert_eq!(config.traversal.opponent, Sampler::Outcome { eps: 0.1 });
        assert_eq!(config.traversal.discount, Discount::CfrPlus);
        assert_eq!(config.traversal.prune_every, 10);
    }

    #[test]
    fn resolve_config_loads_from_file() {
        let path = std::env::temp_dir().join(format!("gto-resolve-{}.json", std::process::id()));
        let mut f = File::create(&path).unwrap();
        writeln!(f, r#"{{ "trigger": "flop", "budget_ms": 250, "workers": 2 }}"#).unwrap();
        drop(f);

        let config = ResolveConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.trigger, Street::Flop);
        assert_eq!(config.budget_ms, 250);
        assert_eq!(config.max_actions_per_round, 3);

        let run = config.run_config();
        assert_eq!(run.epoch_size, 1_000);
        assert_eq!(run.iterations, 0);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = TrainConfig::from_file(Path::new("/nonexistent/train.json")).unwrap_err();
        assert!(matches!(err, crate::error::SolverError::Io(_)));
    }
}
