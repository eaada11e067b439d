use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::abstraction::{
    hand_class_name, AbsId, Cluster, ClusterMapper, HandClassMapper, KuhnMapper,
};
use crate::advisor::Advisor;
use crate::config::TrainConfig;
use crate::dealer::{Dealer, HoldemDealer, KuhnDealer, KUHN_CARDS};
use crate::display::{
    params_table, print_error, print_section, print_success, stats_table, strategy_table,
    styled_action, StrategyRow,
};
use crate::encoding::{load_tree, save_tree};
use crate::error::{SolverError, SolverResult};
use crate::policy::Discount;
use crate::scheduler::{train, CancelToken, Summary};
use crate::table::{ActionAmount, ActionKind, DiscreteAction, GameParams, Hand};
use crate::translate::{match_action, pseudo_harmonic_threshold};
use crate::tree::{Node, NodeKind, Tree};

/// Epochs between intermediate checkpoints.
const CHECKPOINT_EVERY: u64 = 10;

#[derive(Parser)]
#[command(name = "gto", version, about = "MCCFR blueprint solver: train, inspect and query poker strategies.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum DiscountArg {
    None,
    CfrPlus,
    Linear,
    Dcfr,
}

impl DiscountArg {
    fn discount(self) -> Discount {
        match self {
            DiscountArg::None => Discount::None,
            DiscountArg::CfrPlus => Discount::CfrPlus,
            DiscountArg::Linear => Discount::Linear,
            DiscountArg::Dcfr => Discount::Dcfr {
                alpha: 1.5,
                beta: 0.0,
                gamma: 2.0,
            },
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum AbsArg {
    Kuhn,
    HandClass,
}

impl AbsArg {
    fn id(self) -> AbsId {
        match self {
            AbsArg::Kuhn => KuhnMapper.id(),
            AbsArg::HandClass => HandClassMapper.id(),
        }
    }

    fn cluster_name(self, cluster: Cluster) -> String {
        match self {
            AbsArg::Kuhn => KUHN_CARDS
                .get(cluster as usize)
                .map_or_else(|| "?".into(), |c| c.rank.to_char().to_string()),
            AbsArg::HandClass => hand_class_name(cluster),
        }
    }
}

/// Scheduler flags shared by the training commands.
#[derive(clap::Args)]
struct RunArgs {
    /// JSON file with a full or partial training config
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    iterations: Option<u64>,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    batch: Option<u64>,
    #[arg(long)]
    epoch: Option<u64>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, value_enum)]
    discount: Option<DiscountArg>,
    /// Stop after this many seconds
    #[arg(long)]
    seconds: Option<u64>,
    /// Save the tree here at checkpoints and at the end
    #[arg(long)]
    out: Option<PathBuf>,
}

impl RunArgs {
    fn config(&self) -> SolverResult<TrainConfig> {
        let mut config = match &self.config {
            Some(path) => TrainConfig::from_file(path)?,
            None => TrainConfig::default(),
        };
        let run = &mut config.run;
        if let Some(v) = self.iterations {
            run.iterations = v;
        }
        if let Some(v) = self.workers {
            run.workers = v;
        }
        if let Some(v) = self.batch {
            run.batch_size = v;
        }
        if let Some(v) = self.epoch {
            run.epoch_size = v;
        }
        if let Some(v) = self.seed {
            run.seed = v;
        }
        if let Some(d) = self.discount {
            config.traversal.discount = d.discount();
        }
        Ok(config)
    }

    fn cancel(&self) -> CancelToken {
        match self.seconds {
            Some(s) => CancelToken::with_deadline(Duration::from_secs(s)),
            None => CancelToken::new(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Train Kuhn poker and print the average strategy
    TrainKuhn {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Train a no-limit hold'em blueprint with the hand-class abstraction
    TrainHoldem {
        #[command(flatten)]
        run: RunArgs,
        #[arg(long)]
        players: Option<u8>,
        /// Starting stack in chips
        #[arg(long)]
        stack: Option<f32>,
        #[arg(long)]
        sb: Option<f32>,
        /// Deals per exploitability estimate (0 disables)
        #[arg(long)]
        exploit_samples: Option<usize>,
        /// Share identical chance subtrees (single worker only)
        #[arg(long)]
        shared: bool,
    },
    /// Map a live bet onto the abstract bet sizes
    Translate {
        /// Bet or raise amount in chips
        #[arg(long)]
        amount: f32,
        /// Pot before the bet
        #[arg(long)]
        pot: f32,
        /// Abstract sizes as pot fractions
        #[arg(long, value_delimiter = ',', default_values_t = vec![0.5, 1.0, 2.0])]
        sizes: Vec<f32>,
    },
    /// Show a saved tree and the strategy at its first decision
    Inspect {
        path: PathBuf,
        #[arg(long, value_enum, default_value = "kuhn")]
        abs: AbsArg,
    },
    /// Advise a Kuhn decision from a saved blueprint
    AdviseKuhn {
        path: PathBuf,
        /// J, Q or K
        #[arg(long)]
        card: char,
        /// Actions so far: k(check) b(bet) c(call) f(fold)
        #[arg(long, default_value = "")]
        history: String,
        #[arg(long, default_value_t = 1)]
        seed: u64,
    },
}

pub fn run() {
    let cli = Cli::parse();
    dispatch(cli);
}

fn dispatch(cli: Cli) {
    let result = match cli.command {
        Commands::TrainKuhn { run } => cmd_train_kuhn(&run),
        Commands::TrainHoldem {
            run,
            players,
            stack,
            sb,
            exploit_samples,
            shared,
        } => cmd_train_holdem(&run, players, stack, sb, exploit_samples, shared),
        Commands::Translate { amount, pot, sizes } => cmd_translate(amount, pot, sizes),
        Commands::Inspect { path, abs } => cmd_inspect(&path, abs),
        Commands::AdviseKuhn {
            path,
            card,
            history,
            seed,
        } => cmd_advise_kuhn(&path, card, &history, seed),
    };
    if let Err(e) = result {
        print_error(&e.to_string());
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// Training
// ---------------------------------------------------------------------------

fn run_training<D: Dealer, M: ClusterMapper>(
    tree: &Tree,
    dealer: &D,
    mapper: &M,
    config: &TrainConfig,
    args: &RunArgs,
) -> SolverResult<Summary> {
    let out = args.out.as_deref();
    let mut checkpoint = |epoch: u64, last: bool| -> SolverResult<()> {
        if let Some(path) = out {
            if last || epoch % CHECKPOINT_EVERY == 0 {
                save_tree(tree, path)?;
                info!("checkpoint {} written to {}", epoch, path.display());
            }
        }
        Ok(())
    };
    train(
        tree,
        dealer,
        mapper,
        &config.traversal,
        &config.run,
        &args.cancel(),
        &mut checkpoint,
    )
}

fn cmd_train_kuhn(args: &RunArgs) -> SolverResult<()> {
    let mut config = args.config()?;
    if args.iterations.is_none() && config.run.iterations == 0 && args.seconds.is_none() {
        config.run.iterations = 100_000;
    }
    let tree = Tree::new(GameParams::kuhn(), KuhnMapper.id())?;

    println!();
    println!(
        "  {} Kuhn poker | {} iterations | {} workers",
        "MCCFR".bold(),
        config.run.iterations,
        config.run.workers
    );

    let summary = run_training(&tree, &KuhnDealer, &KuhnMapper, &config, args)?;
    print_section("Training", &stats_table(&summary.history));

    tree.expand_full(&tree.root)?;
    let mut groups: Vec<(Vec<DiscreteAction>, Vec<StrategyRow>)> = Vec::new();
    collect_rows(&tree.root, "", AbsArg::Kuhn, &mut groups);
    for (actions, rows) in &groups {
        println!("\n{}", strategy_table(actions, rows));
    }
    if let Some(s) = summary.last() {
        print_success(&format!("\n  Exploitability: {:.5}", s.exploitability));
    }
    Ok(())
}

fn cmd_train_holdem(
    args: &RunArgs,
    players: Option<u8>,
    stack: Option<f32>,
    sb: Option<f32>,
    exploit_samples: Option<usize>,
    shared: bool,
) -> SolverResult<()> {
    let mut config = args.config()?;
    if let Some(p) = players {
        config.players = p;
    }
    if let Some(s) = stack {
        config.stack = s;
    }
    if let Some(s) = sb {
        config.small_blind = s;
    }
    if let Some(n) = exploit_samples {
        config.run.exploit_samples = n;
    }
    config.shared_subtrees |= shared;
    if config.run.iterations == 0 && args.seconds.is_none() {
        return Err(SolverError::InvalidParams(
            "give --iterations or --seconds for hold'em training".into(),
        ));
    }

    let params = config.game_params()?;
    let mut tree = Tree::new(params, HandClassMapper.id())?;
    if config.shared_subtrees {
        tree = tree.with_shared_subtrees();
    }

    println!();
    println!(
        "  {} {}-max hold'em | {:.0}bb | {} workers",
        "MCCFR".bold(),
        config.players,
        config.stack / (config.small_blind * 2.0),
        config.run.workers
    );

    let dealer = HoldemDealer::new(config.players).with_terminal(tree.params.terminal_street);
    let summary = run_training(&tree, &dealer, &HandClassMapper, &config, args)?;
    print_section("Training", &stats_table(&summary.history));

    let root = tree.decision_point(&tree.root)?;
    print_root(&root, AbsArg::HandClass)
}

/// Walk every expanded decision node, grouping rows by action list.
fn collect_rows(
    node: &Arc<Node>,
    path: &str,
    abs: AbsArg,
    groups: &mut Vec<(Vec<DiscreteAction>, Vec<StrategyRow>)>,
) {
    match &node.kind {
        NodeKind::Root(s) | NodeKind::Chance(s) => {
            if let Some(next) = s.next.get() {
                collect_rows(next, path, abs, groups);
            }
        }
        NodeKind::Player(p) => {
            let mut policies = p.policies();
            policies.sort_by_key(|(c, _)| *c);
            let rows = policies.into_iter().map(|(cluster, policy)| {
                let mut label = abs.cluster_name(cluster);
                if !path.is_empty() {
                    label = format!("{} | {}", label, path);
                }
                StrategyRow {
                    label,
                    seat: p.turn,
                    probabilities: policy.lock().average_strategy(),
                }
            });
            match groups.iter_mut().find(|(actions, _)| *actions == p.actions) {
                Some((_, group)) => group.extend(rows),
                None => groups.push((p.actions.clone(), rows.collect())),
            }
            for (action, child) in p.actions.iter().zip(&p.children) {
                if let Some(child) = child.get() {
                    collect_rows(child, &format!("{}{}", path, action.short()), abs, groups);
                }
            }
        }
        NodeKind::Terminal(_) | NodeKind::Reference(_) => {}
    }
}

fn print_root(root: &Arc<Node>, abs: AbsArg) -> SolverResult<()> {
    let player = root.as_player().ok_or(SolverError::NoDecisionPointFound)?;
    let mut policies = player.policies();
    policies.sort_by_key(|(c, _)| *c);
    let rows: Vec<StrategyRow> = policies
        .into_iter()
        .map(|(cluster, policy)| StrategyRow {
            label: abs.cluster_name(cluster),
            seat: player.turn,
            probabilities: policy.lock().average_strategy(),
        })
        .collect();
    print_section("First decision", &strategy_table(&player.actions, &rows));
    Ok(())
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

fn cmd_translate(amount: f32, pot: f32, mut sizes: Vec<f32>) -> SolverResult<()> {
    if !(pot > 0.0) || sizes.is_empty() {
        return Err(SolverError::InvalidParams("pot and sizes must be positive".into()));
    }
    sizes.sort_by(|a, b| a.total_cmp(b));
    let actions: Vec<DiscreteAction> = sizes.iter().map(|s| DiscreteAction(*s)).collect();
    let index = match_action(ActionAmount::new(ActionKind::Bet, amount), &actions, pot)?;
    let x = amount / pot;

    println!();
    println!("  Bet {:.2} into {:.2} = {:.3} pot", amount, pot, x);
    for w in sizes.windows(2) {
        println!(
            "  {:.2} | {:.2}  threshold {:.3}",
            w[0],
            w[1],
            pseudo_harmonic_threshold(w[0], w[1])
        );
    }
    println!("  Maps to {}", styled_action(actions[index]));
    Ok(())
}

fn cmd_inspect(path: &Path, abs: AbsArg) -> SolverResult<()> {
    let tree = load_tree(path, abs.id())?;
    let rows = [
        ("Iteration", tree.iteration().to_string()),
        ("Nodes", tree.nodes().to_string()),
        ("States", tree.states().to_string()),
        ("Shared subtrees", tree.is_shared().to_string()),
        ("Abstraction", tree.abs_id.to_string()),
    ];
    print_section(&format!("{}", path.display()), &params_table(&tree.params, &rows));
    let root = tree.decision_point(&tree.root)?;
    print_root(&root, abs)
}

fn cmd_advise_kuhn(path: &Path, card: char, history: &str, seed: u64) -> SolverResult<()> {
    let card = KUHN_CARDS
        .iter()
        .find(|c| c.rank.to_char() == card.to_ascii_uppercase())
        .copied()
        .ok_or_else(|| SolverError::InvalidCardNotation(card.to_string()))?;
    let tree = load_tree(path, KuhnMapper.id())?;

    let mut hand = Hand::new(GameParams::kuhn())?;
    for c in history.chars().filter(|c| !c.is_whitespace() && *c != ',') {
        let action = match c.to_ascii_lowercase() {
            'k' => DiscreteAction::CHECK,
            'b' | 'a' => DiscreteAction::ALL_IN,
            'c' => DiscreteAction::CALL,
            'f' => DiscreteAction::FOLD,
            other => return Err(SolverError::NoMatchingAction(other.to_string())),
        };
        hand.act_discrete(action)?;
    }

    let advisor = Advisor::new(vec![Arc::new(tree)], KuhnMapper);
    let cancel = CancelToken::new();
    let advice = advisor.strategy(&hand, [card, card], &[], &cancel)?;
    let row = StrategyRow {
        label: format!("{} | {}", card.rank.to_char(), if history.is_empty() { "-" } else { history }),
        seat: hand.latest().turn_pos,
        probabilities: advice.strategy.clone(),
    };
    print_section("Strategy", &strategy_table(&advice.actions, &[row]));

    let mut rng = StdRng::seed_from_u64(seed);
    let action = advisor.advise(&hand, [card, card], &[], &mut rng, &cancel)?;
    println!("\n  Play: {}", styled_action(action));
    Ok(())
}
