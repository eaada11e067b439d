//! No-limit betting rules.
//!
//! The solver only needs a narrow view of the game: which discrete actions are
//! legal in a state, what state follows an action, and when the hand is over.
//! Chips are `f32` with bet amounts rounded to two decimals.
//!
//! A hand is a sequence of [`State`]s. [`make_action`] applies one action and
//! [`advance`] moves the turn, the street or finishes the hand.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{SolverError, SolverResult};

pub type Chips = f32;

const CHIP_EPS: Chips = 1e-4;

#[inline]
fn round2(x: Chips) -> Chips {
    (x * 100.0).round() / 100.0
}

#[inline]
fn chips_eq(a: Chips, b: Chips) -> bool {
    (a - b).abs() < CHIP_EPS
}

// ---------------------------------------------------------------------------
// Streets and actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Street {
    NoStreet = 0,
    Preflop = 1,
    Flop = 2,
    Turn = 3,
    River = 4,
    Finished = 5,
}

impl Street {
    pub fn from_u8(v: u8) -> SolverResult<Street> {
        Ok(match v {
            0 => Street::NoStreet,
            1 => Street::Preflop,
            2 => Street::Flop,
            3 => Street::Turn,
            4 => Street::River,
            5 => Street::Finished,
            _ => return Err(SolverError::Codec(format!("unknown street {}", v))),
        })
    }

    pub fn next(self) -> Street {
        match self {
            Street::NoStreet => Street::Preflop,
            Street::Preflop => Street::Flop,
            Street::Flop => Street::Turn,
            Street::Turn => Street::River,
            Street::River | Street::Finished => Street::Finished,
        }
    }

    /// Board cards visible on this street.
    pub fn board_len(self) -> usize {
        match self {
            Street::NoStreet | Street::Preflop => 0,
            Street::Flop => 3,
            Street::Turn => 4,
            Street::River | Street::Finished => 5,
        }
    }
}

impl fmt::Display for Street {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Street::NoStreet => "no street",
            Street::Preflop => "preflop",
            Street::Flop => "flop",
            Street::Turn => "turn",
            Street::River => "river",
            Street::Finished => "finished",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    NoAction = 0,
    Bet = 1,
    SmallBlind = 2,
    BigBlind = 3,
    Fold = 4,
    Check = 5,
    Call = 6,
    Raise = 7,
    AllIn = 8,
}

impl ActionKind {
    pub fn from_u8(v: u8) -> SolverResult<ActionKind> {
        Ok(match v {
            0 => ActionKind::NoAction,
            1 => ActionKind::Bet,
            2 => ActionKind::SmallBlind,
            3 => ActionKind::BigBlind,
            4 => ActionKind::Fold,
            5 => ActionKind::Check,
            6 => ActionKind::Call,
            7 => ActionKind::Raise,
            8 => ActionKind::AllIn,
            _ => return Err(SolverError::Codec(format!("unknown action kind {}", v))),
        })
    }

    /// Bet or blind.
    pub fn is_bet(self) -> bool {
        matches!(self, ActionKind::Bet | ActionKind::SmallBlind | ActionKind::BigBlind)
    }

    pub fn is_blind(self) -> bool {
        matches!(self, ActionKind::SmallBlind | ActionKind::BigBlind)
    }

    /// Raise or all-in.
    pub fn is_raise(self) -> bool {
        matches!(self, ActionKind::Raise | ActionKind::AllIn)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::NoAction => "no action",
            ActionKind::Bet => "bet",
            ActionKind::SmallBlind => "sb",
            ActionKind::BigBlind => "bb",
            ActionKind::Fold => "fold",
            ActionKind::Check => "check",
            ActionKind::Call => "call",
            ActionKind::Raise => "raise",
            ActionKind::AllIn => "allin",
        };
        write!(f, "{}", s)
    }
}

/// A concrete action with its chip amount.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActionAmount {
    pub action: ActionKind,
    pub amount: Chips,
}

impl ActionAmount {
    pub fn new(action: ActionKind, amount: Chips) -> ActionAmount {
        ActionAmount { action, amount }
    }
}

impl fmt::Display for ActionAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:.2}", self.action, self.amount)
    }
}

/// Action in the abstract action space. Positive values are pot multiples.
///
/// - `-4` all-in
/// - `-3` fold
/// - `-2` call
/// - `-1` check
/// - `0`  no action
/// - `>0` bet/raise of that many pots
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct DiscreteAction(pub f32);

impl DiscreteAction {
    pub const ALL_IN: DiscreteAction = DiscreteAction(-4.0);
    pub const FOLD: DiscreteAction = DiscreteAction(-3.0);
    pub const CALL: DiscreteAction = DiscreteAction(-2.0);
    pub const CHECK: DiscreteAction = DiscreteAction(-1.0);
    pub const NONE: DiscreteAction = DiscreteAction(0.0);

    /// A bet or raise expressed as a pot fraction.
    #[inline]
    pub fn is_sized(self) -> bool {
        self.0 > 0.0
    }

    pub fn is_raise(self) -> bool {
        self.is_sized() || self == DiscreteAction::ALL_IN
    }

    /// Integer code of the non-sized actions.
    #[inline]
    fn code(self) -> Option<i8> {
        if self.is_sized() {
            None
        } else {
            Some(self.0 as i8)
        }
    }

    /// Concrete action for the player on turn.
    pub fn resolve(self, params: &GameParams, state: &State) -> ActionAmount {
        let turn = state.turn_pos as usize;
        match self.code() {
            Some(-3) => ActionAmount::new(ActionKind::Fold, 0.0),
            Some(-1) => ActionAmount::new(ActionKind::Check, 0.0),
            Some(-2) => ActionAmount::new(ActionKind::Call, state.call_amount),
            Some(-4) => ActionAmount::new(
                ActionKind::AllIn,
                params.initial_stacks[turn] - state.players[turn].paid,
            ),
            Some(_) => ActionAmount::new(ActionKind::NoAction, 0.0),
            None => {
                let amount = round2(state.pot() * self.0);
                if chips_eq(state.call_amount, 0.0) {
                    ActionAmount::new(ActionKind::Bet, amount)
                } else {
                    ActionAmount::new(ActionKind::Raise, amount)
                }
            }
        }
    }

    pub fn short(self) -> String {
        match self.code() {
            Some(-3) => "f".to_string(),
            Some(-1) => "k".to_string(),
            Some(-2) => "c".to_string(),
            Some(-4) => "a".to_string(),
            Some(_) => "-".to_string(),
            None => format!("b{:.2}", self.0),
        }
    }
}

impl fmt::Display for DiscreteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code() {
            Some(-3) => write!(f, "Fold"),
            Some(-1) => write!(f, "Check"),
            Some(-2) => write!(f, "Call"),
            Some(-4) => write!(f, "All In"),
            Some(_) => write!(f, "No Action"),
            None => write!(f, "Raise {:.2} POT", self.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

pub const BET_SIZES_DEEP: &[&[f32]] = &[
    &[0.5, 1.0, 1.5, 3.0, 9.0, 15.0, 25.0, 50.0],
    &[0.5, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0],
    &[0.5, 1.0, 3.0, 8.0],
    &[1.0, 3.0],
    &[1.0],
];

pub const BET_SIZES_MEDIUM: &[&[f32]] = &[
    &[0.5, 0.75, 1.0, 1.5, 2.0, 3.0, 5.0, 8.0, 16.0, 32.0],
    &[0.5, 0.75, 1.0, 1.5, 2.0, 3.0, 5.0, 8.0],
    &[0.5, 1.0, 2.0, 4.0],
    &[1.0, 2.0],
    &[1.0],
];

pub const BET_SIZES_SHALLOW: &[&[f32]] = &[
    &[0.25, 0.5, 0.75, 1.0, 2.0, 3.0, 4.0, 6.0, 8.0, 12.0, 16.0],
    &[0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 16.0],
    &[0.25, 0.5, 1.0, 2.0, 4.0, 8.0],
    &[0.5, 1.0, 2.0, 4.0, 8.0],
];

pub fn bet_grid(sizes: &[&[f32]]) -> Vec<Vec<f32>> {
    sizes.iter().map(|s| s.to_vec()).collect()
}

/// Immutable per-hand configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameParams {
    pub num_players: u8,
    pub max_actions_per_round: u8,
    pub btn_pos: u8,
    pub sb_amount: Chips,
    #[serde(default)]
    pub ante: Chips,
    /// Pot fractions per raise level; the last level repeats.
    pub bet_sizes: Vec<Vec<f32>>,
    pub initial_stacks: Vec<Chips>,
    pub terminal_street: Street,
    #[serde(default)]
    pub min_bet: bool,
    #[serde(default)]
    pub limp: bool,
}

impl GameParams {
    /// Equal stacks, blinds of `sb`/`2·sb`, bet grid picked by stack depth.
    pub fn new(num_players: u8, stack: Chips, sb: Chips) -> GameParams {
        let mut params = GameParams {
            num_players,
            max_actions_per_round: num_players * 3,
            btn_pos: 0,
            sb_amount: sb,
            ante: 0.0,
            bet_sizes: Vec::new(),
            initial_stacks: vec![stack; num_players as usize],
            terminal_street: Street::River,
            min_bet: false,
            limp: false,
        };
        params.set_bet_sizes();
        params
    }

    /// Kuhn poker: ante 1, one betting round, the only bet is the 1-chip
    /// all-in and nobody can re-raise.
    pub fn kuhn() -> GameParams {
        GameParams {
            num_players: 2,
            max_actions_per_round: 3,
            btn_pos: 0,
            sb_amount: 0.0,
            ante: 1.0,
            bet_sizes: Vec::new(),
            initial_stacks: vec![2.0, 2.0],
            terminal_street: Street::Preflop,
            min_bet: false,
            limp: false,
        }
    }

    pub fn set_bet_sizes(&mut self) {
        let bb = self.big_blind().max(CHIP_EPS);
        let min_stack = self.initial_stacks.iter().copied().fold(Chips::INFINITY, Chips::min);
        let depth = min_stack / bb;
        self.bet_sizes = if depth >= 200.0 {
            bet_grid(BET_SIZES_DEEP)
        } else if depth >= 100.0 {
            bet_grid(BET_SIZES_MEDIUM)
        } else {
            bet_grid(BET_SIZES_SHALLOW)
        };
    }

    #[inline]
    pub fn big_blind(&self) -> Chips {
        self.sb_amount * 2.0
    }

    #[inline]
    pub fn has_blinds(&self) -> bool {
        self.sb_amount > 0.0
    }

    /// Smaller of the player's stack and the second largest stack.
    pub fn effective_stack(&self, player: u8) -> Chips {
        match self.initial_stacks.len() {
            0 => 0.0,
            1 => self.initial_stacks[0],
            n => {
                let mut sorted = self.initial_stacks.clone();
                sorted.sort_by(|a, b| a.total_cmp(b));
                sorted[n - 2].min(self.initial_stacks[player as usize])
            }
        }
    }

    pub fn validate(&self) -> SolverResult<()> {
        if self.num_players < 2 {
            return Err(SolverError::InvalidParams("need at least 2 players".into()));
        }
        if self.initial_stacks.len() != self.num_players as usize {
            return Err(SolverError::InvalidParams(format!(
                "{} stacks for {} players",
                self.initial_stacks.len(),
                self.num_players
            )));
        }
        if self.btn_pos >= self.num_players {
            return Err(SolverError::InvalidParams("button out of range".into()));
        }
        if self.max_actions_per_round == 0 {
            return Err(SolverError::InvalidParams("max actions per round is 0".into()));
        }
        if self.bet_sizes.iter().flatten().any(|s| !(*s > 0.0) || !s.is_finite()) {
            return Err(SolverError::InvalidParams("bet sizes must be positive".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Active = 0,
    Folded = 1,
    AllIn = 2,
}

impl Status {
    pub fn from_u8(v: u8) -> SolverResult<Status> {
        match v {
            0 => Ok(Status::Active),
            1 => Ok(Status::Folded),
            2 => Ok(Status::AllIn),
            _ => Err(SolverError::Codec(format!("unknown status {}", v))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Seat {
    pub paid: Chips,
    pub status: Status,
}

/// Biggest commitment on the current street.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Commitment {
    pub amount: Chips,
    pub addition: Chips,
    pub action: ActionKind,
}

impl Default for Commitment {
    fn default() -> Self {
        Commitment {
            amount: 0.0,
            addition: 0.0,
            action: ActionKind::NoAction,
        }
    }
}

/// Betting state at one decision point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub players: Vec<Seat>,
    pub street: Street,
    pub turn_pos: u8,
    pub btn_pos: u8,
    /// Bets and raises on this street, indexes the bet grid.
    pub bet_action: u8,
    /// All actions on this street, blinds included.
    pub street_action: u8,
    pub call_amount: Chips,
    pub bsc: Commitment,
    /// Per-seat commitment on this street.
    pub psc: Vec<Chips>,
    /// Per-seat action count on this street.
    pub psac: Vec<u8>,
    /// Per-seat last action on this street.
    pub psla: Vec<ActionKind>,
}

impl State {
    /// Seats filled, antes and blinds not yet posted.
    fn empty(params: &GameParams) -> State {
        let n = params.num_players as usize;
        State {
            players: vec![
                Seat {
                    paid: 0.0,
                    status: Status::Active,
                };
                n
            ],
            street: Street::Preflop,
            turn_pos: params.btn_pos,
            btn_pos: params.btn_pos,
            bet_action: 0,
            street_action: 0,
            call_amount: 0.0,
            bsc: Commitment::default(),
            psc: vec![0.0; n],
            psac: vec![0; n],
            psla: vec![ActionKind::NoAction; n],
        }
    }

    /// Start of a hand: antes collected, blinds posted, first player on turn.
    pub fn new(params: &GameParams) -> SolverResult<State> {
        params.validate()?;
        let mut state = State::empty(params);
        if params.ante > 0.0 {
            for seat in state.players.iter_mut() {
                seat.paid += params.ante;
            }
        }
        if !params.has_blinds() {
            return Ok(state);
        }

        let (_, sb, _) = positions(&state);
        state.turn_pos = sb;
        state = make_action(
            params,
            &state,
            ActionAmount::new(ActionKind::SmallBlind, params.sb_amount),
        )?;
        shift_turn(params, &mut state)?;
        state = make_action(
            params,
            &state,
            ActionAmount::new(ActionKind::BigBlind, params.big_blind()),
        )?;
        shift_turn(params, &mut state)?;
        Ok(state)
    }

    #[inline]
    pub fn pot(&self) -> Chips {
        self.players.iter().map(|p| p.paid).sum()
    }

    pub fn finished(&self) -> bool {
        self.street == Street::Finished
    }

    /// Remaining stack of the player on turn.
    pub fn stack(&self, params: &GameParams) -> Chips {
        let turn = self.turn_pos as usize;
        params.initial_stacks[turn] - self.players[turn].paid
    }

    /// Street actions excluding the posted blinds.
    pub fn voluntary_actions(&self, params: &GameParams) -> u8 {
        if self.street == Street::Preflop && params.has_blinds() {
            self.street_action.saturating_sub(2)
        } else {
            self.street_action
        }
    }

    /// True when `player` is the only one not folded.
    pub fn last_alive(&self, player: usize) -> bool {
        self.players[player].status != Status::Folded
            && self
                .players
                .iter()
                .enumerate()
                .all(|(i, p)| i == player || p.status == Status::Folded)
    }

    fn count(&self, f: impl Fn(&Seat) -> bool) -> usize {
        self.players.iter().filter(|p| f(p)).count()
    }

    /// Next seat at or after `start` that can still act.
    fn find_waiting(&self, start: usize) -> Option<usize> {
        let n = self.players.len();
        (0..n)
            .map(|i| (start + i) % n)
            .find(|&i| self.players[i].status == Status::Active)
    }
}

/// Button, small blind and big blind seats.
pub fn positions(state: &State) -> (u8, u8, u8) {
    let n = state.players.len() as u8;
    let btn = state.btn_pos % n;
    let sb = if n == 2 { btn } else { (btn + 1) % n };
    let bb = (sb + 1) % n;
    (btn, sb, bb)
}

// ---------------------------------------------------------------------------
// Legal actions
// ---------------------------------------------------------------------------

/// Legal action kinds with the minimum chips each needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegalActions(pub Vec<(ActionKind, Chips)>);

impl LegalActions {
    pub fn get(&self, kind: ActionKind) -> Option<Chips> {
        self.0.iter().find(|(k, _)| *k == kind).map(|(_, c)| *c)
    }

    pub fn contains(&self, kind: ActionKind) -> bool {
        self.get(kind).is_some()
    }

    fn put(&mut self, kind: ActionKind, chips: Chips) {
        self.0.push((kind, chips));
    }
}

pub fn legal_actions(params: &GameParams, state: &State) -> LegalActions {
    let mut actions = LegalActions::default();
    if state.street > params.terminal_street {
        return actions;
    }

    let turn = state.turn_pos as usize;
    let stack = state.stack(params);
    let call_amount = state.call_amount;

    let mut max = params.max_actions_per_round as u16;
    if state.street == Street::Preflop && params.has_blinds() {
        max += 2;
    }
    let reached_max = state.street_action as u16 + 1 >= max;

    if chips_eq(call_amount, 0.0) {
        actions.put(ActionKind::Check, 0.0);
        if !reached_max {
            let bb = params.big_blind();
            if stack > bb {
                actions.put(ActionKind::Bet, bb);
            }
            actions.put(ActionKind::AllIn, stack);
        }
        return actions;
    }

    actions.put(ActionKind::Fold, 0.0);

    if reached_max || stack < call_amount {
        actions.put(ActionKind::Call, call_amount.min(stack));
        return actions;
    }

    let mut min_raise = call_amount;
    if state.bsc.amount > 0.0 {
        if state.bsc.action.is_bet() {
            min_raise += state.bsc.amount;
        }
        if state.bsc.action.is_raise() {
            min_raise = state.bsc.addition + state.bsc.amount;
        }
    }

    let rest = params
        .initial_stacks
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != turn)
        .map(|(i, s)| s - state.players[i].paid)
        .fold(0.0, Chips::max);
    let others_can_act = rest > 0.0;

    if min_raise < stack && others_can_act {
        actions.put(ActionKind::Raise, min_raise);
    }
    actions.put(ActionKind::Call, call_amount);
    if call_amount < stack && others_can_act {
        actions.put(ActionKind::AllIn, stack);
    }
    actions
}

/// Legal discrete actions with their exact chip amounts, sorted by action.
pub fn discrete_legal_actions(params: &GameParams, state: &State) -> Vec<(DiscreteAction, Chips)> {
    let legal = legal_actions(params, state);
    let mut actions: Vec<(DiscreteAction, Chips)> = Vec::new();

    if legal.contains(ActionKind::Fold) {
        actions.push((DiscreteAction::FOLD, 0.0));
    }
    if legal.contains(ActionKind::Check) {
        actions.push((DiscreteAction::CHECK, 0.0));
    }

    let open_action =
        params.has_blinds() && state.street == Street::Preflop && state.street_action == 2;
    if let Some(call) = legal.get(ActionKind::Call) {
        if !open_action || params.limp {
            actions.push((DiscreteAction::CALL, call));
        }
    }
    if let Some(stack) = legal.get(ActionKind::AllIn) {
        actions.push((DiscreteAction::ALL_IN, stack));
    }

    let min_raise = legal.get(ActionKind::Bet).or_else(|| legal.get(ActionKind::Raise));
    if let (Some(min_raise), false) = (min_raise, params.bet_sizes.is_empty()) {
        let pot = state.pot();
        let stack = state.stack(params);
        let level = (state.bet_action as usize).min(params.bet_sizes.len() - 1);

        if params.min_bet && pot > 0.0 {
            actions.push((DiscreteAction(min_raise / pot), min_raise));
        }
        for &fraction in &params.bet_sizes[level] {
            let amount = round2(pot * fraction);
            if amount < min_raise || amount > stack {
                continue;
            }
            actions.push((DiscreteAction(fraction), amount));
        }
    }

    actions.sort_by(|a, b| a.0 .0.total_cmp(&b.0 .0));
    actions.dedup_by(|a, b| a.0 == b.0);
    actions
}

fn validate_action(params: &GameParams, state: &State, aa: ActionAmount) -> SolverResult<()> {
    let turn = state.turn_pos;
    let legal = legal_actions(params, state);
    let stack = state.stack(params);
    let ActionAmount { action, amount } = aa;
    let illegal = |msg: String| Err(SolverError::Rules(format!("{}: {}", turn, msg)));

    let Some(min) = legal.get(action) else {
        return illegal(format!("illegal action {}", action));
    };
    match action {
        ActionKind::Check | ActionKind::Fold if !chips_eq(amount, 0.0) => {
            illegal(format!("illegal {} amount", action))
        }
        ActionKind::Call if !chips_eq(amount, min) => {
            illegal(format!("illegal call amount {:.2}, must be {:.2}", amount, min))
        }
        ActionKind::Bet | ActionKind::Raise if amount + CHIP_EPS < min => {
            illegal(format!("illegal {} amount {:.2} < {:.2}", action, amount, min))
        }
        ActionKind::AllIn if !chips_eq(amount, stack) => {
            illegal(format!("illegal all-in amount {:.2} != {:.2}", amount, stack))
        }
        _ if amount > stack + CHIP_EPS => {
            illegal(format!("illegal {} amount {:.2} > {:.2}", action, amount, stack))
        }
        _ => Ok(()),
    }
}

/// Apply one action for the player on turn. Does not move the turn.
pub fn make_action(params: &GameParams, state: &State, aa: ActionAmount) -> SolverResult<State> {
    let (action, mut amount) = match aa.action {
        ActionKind::Raise | ActionKind::Bet => (aa.action, round2(aa.amount)),
        ActionKind::Call => (aa.action, state.call_amount),
        ActionKind::Check | ActionKind::Fold => (aa.action, 0.0),
        _ => (aa.action, aa.amount),
    };

    if state.street > params.terminal_street {
        return Err(SolverError::Rules(format!("cannot act on street {}", state.street)));
    }
    if !action.is_blind() {
        validate_action(params, state, ActionAmount::new(action, amount))?;
    }

    let turn = state.turn_pos as usize;
    let stack = state.stack(params);
    let mut seat = state.players[turn];

    if action == ActionKind::AllIn || amount >= stack - CHIP_EPS {
        amount = stack;
        seat.status = Status::AllIn;
    }
    if action == ActionKind::Fold {
        seat.status = Status::Folded;
    }
    seat.paid += amount;

    let mut next = state.clone();
    next.players[turn] = seat;
    next.street_action += 1;
    next.psc[turn] += amount;
    next.psac[turn] += 1;
    next.psla[turn] = action;

    if amount > state.bsc.amount {
        next.bsc = Commitment {
            amount,
            addition: amount - state.bsc.amount,
            action,
        };
    }
    if matches!(action, ActionKind::Bet | ActionKind::Raise) {
        next.bet_action += 1;
    }
    Ok(next)
}

// ---------------------------------------------------------------------------
// Turn and street movement
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    ShiftTurn,
    ShiftStreet,
    ShiftStreetUntilEnd,
    Finish,
}

/// Players who still owe an action on this street.
fn have_to_act(state: &State) -> usize {
    if state.count(|p| p.status != Status::Folded) == 1 {
        return 0;
    }
    let max_psc = state.psc.iter().copied().fold(0.0, Chips::max);
    state
        .players
        .iter()
        .enumerate()
        .filter(|(i, p)| {
            p.status == Status::Active
                && (state.psc[*i] < max_psc - CHIP_EPS
                    || state.psac[*i] == 0
                    || (state.street == Street::Preflop
                        && state.psac[*i] == 1
                        && state.psla[*i] == ActionKind::BigBlind))
        })
        .count()
}

pub fn rule(params: &GameParams, state: &State) -> RuleKind {
    let h2a = have_to_act(state);
    let acted: u32 = state.psac.iter().map(|&x| x as u32).sum();

    if h2a > 1 || (h2a == 1 && acted > 0) {
        return RuleKind::ShiftTurn;
    }
    if state.count(|p| p.status == Status::Active) > 1 {
        if state.street >= params.terminal_street {
            return RuleKind::Finish;
        }
        return RuleKind::ShiftStreet;
    }
    if state.count(|p| p.status != Status::Folded) <= 1 {
        return RuleKind::Finish;
    }
    if state.street < params.terminal_street {
        return RuleKind::ShiftStreetUntilEnd;
    }
    RuleKind::Finish
}

/// Move the hand forward after an action: next player, next street or end.
pub fn advance(params: &GameParams, state: &State) -> SolverResult<State> {
    let mut next = state.clone();
    match rule(params, state) {
        RuleKind::ShiftTurn => shift_turn(params, &mut next)?,
        RuleKind::ShiftStreet => shift_street(&mut next),
        RuleKind::ShiftStreetUntilEnd => {
            shift_street(&mut next);
            return advance(params, &next);
        }
        RuleKind::Finish => next.street = Street::Finished,
    }
    Ok(next)
}

fn shift_turn(params: &GameParams, state: &mut State) -> SolverResult<()> {
    let next = state
        .find_waiting(state.turn_pos as usize + 1)
        .ok_or_else(|| SolverError::Rules("could not find next player".into()))?;
    state.turn_pos = next as u8;

    let max_psc = state.psc.iter().copied().fold(0.0, Chips::max);
    let owed = (max_psc - state.psc[next]).max(0.0);
    state.call_amount = owed.min(state.stack(params));
    Ok(())
}

fn shift_street(state: &mut State) {
    state.street = state.street.next();
    if state.finished() {
        return;
    }

    let (btn, sb, bb) = positions(state);
    if state.players.len() == 2 {
        state.turn_pos = if state.street == Street::Preflop { sb } else { bb };
    } else {
        let start = if state.street == Street::Preflop { btn } else { bb };
        if let Some(pos) = state.find_waiting(start as usize + 1) {
            state.turn_pos = pos as u8;
        }
    }

    let n = state.players.len();
    state.street_action = 0;
    state.bet_action = 0;
    state.psc = vec![0.0; n];
    state.psac = vec![0; n];
    state.psla = vec![ActionKind::NoAction; n];
    state.bsc = Commitment::default();
    state.call_amount = 0.0;
}

// ---------------------------------------------------------------------------
// Live hand
// ---------------------------------------------------------------------------

/// A hand in progress with every intermediate state kept.
#[derive(Debug, Clone)]
pub struct Hand {
    pub params: GameParams,
    states: Vec<State>,
    actions: Vec<ActionAmount>,
}

impl Hand {
    pub fn new(params: GameParams) -> SolverResult<Hand> {
        let state = State::new(&params)?;
        Ok(Hand {
            params,
            states: vec![state],
            actions: Vec::new(),
        })
    }

    pub fn latest(&self) -> &State {
        // A hand always holds its initial state.
        &self.states[self.states.len() - 1]
    }

    pub fn act(&mut self, action: ActionAmount) -> SolverResult<()> {
        let acted = make_action(&self.params, self.latest(), action)?;
        let next = advance(&self.params, &acted)?;
        self.actions.push(action);
        self.states.push(next);
        Ok(())
    }

    pub fn act_discrete(&mut self, action: DiscreteAction) -> SolverResult<()> {
        let aa = action.resolve(&self.params, self.latest());
        self.act(aa)
    }

    /// Each action paired with the state it was taken in.
    pub fn history(&self) -> impl Iterator<Item = (&State, &ActionAmount)> {
        self.states.iter().zip(self.actions.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(actions: &[(DiscreteAction, Chips)]) -> Vec<DiscreteAction> {
        actions.iter().map(|a| a.0).collect()
    }

    #[test]
    fn kuhn_first_player_checks_or_shoves() {
        let params = GameParams::kuhn();
        let state = State::new(&params).unwrap();
        assert_eq!(state.pot(), 2.0);
        assert_eq!(state.turn_pos, 0);
        let actions = discrete_legal_actions(&params, &state);
        assert_eq!(kinds(&actions), vec![DiscreteAction::ALL_IN, DiscreteAction::CHECK]);
    }

    #[test]
    fn kuhn_check_bet_call_reaches_showdown() {
        let mut hand = Hand::new(GameParams::kuhn()).unwrap();
        hand.act_discrete(DiscreteAction::CHECK).unwrap();
        assert_eq!(hand.latest().turn_pos, 1);
        hand.act_discrete(DiscreteAction::ALL_IN).unwrap();
        assert_eq!(hand.latest().turn_pos, 0);
        let actions = discrete_legal_actions(&hand.params, hand.latest());
        assert_eq!(kinds(&actions), vec![DiscreteAction::FOLD, DiscreteAction::CALL]);
        hand.act_discrete(DiscreteAction::CALL).unwrap();
        assert!(hand.latest().finished());
        assert_eq!(hand.latest().pot(), 4.0);
    }

    #[test]
    fn kuhn_check_check_finishes() {
        let mut hand = Hand::new(GameParams::kuhn()).unwrap();
        hand.act_discrete(DiscreteAction::CHECK).unwrap();
        hand.act_discrete(DiscreteAction::CHECK).unwrap();
        assert!(hand.latest().finished());
        assert_eq!(hand.history().count(), 2);
    }

    #[test]
    fn heads_up_blinds_and_preflop_order() {
        let params = GameParams::new(2, 200.0, 1.0);
        let state = State::new(&params).unwrap();
        assert_eq!(state.pot(), 3.0);
        assert_eq!(state.turn_pos, 0, "small blind acts first heads-up");
        assert_eq!(state.call_amount, 1.0);

        let actions = discrete_legal_actions(&params, &state);
        assert!(actions.iter().any(|a| a.0 == DiscreteAction::FOLD));
        assert!(
            !actions.iter().any(|a| a.0 == DiscreteAction::CALL),
            "limping disabled by default"
        );
        assert!(actions.iter().any(|a| a.0.is_sized()));
    }

    #[test]
    fn call_then_check_moves_to_flop_with_bb_first() {
        let mut params = GameParams::new(2, 200.0, 1.0);
        params.limp = true;
        let mut hand = Hand::new(params).unwrap();
        hand.act_discrete(DiscreteAction::CALL).unwrap();
        assert_eq!(hand.latest().street, Street::Preflop, "big blind keeps the option");
        assert_eq!(hand.latest().turn_pos, 1);
        hand.act_discrete(DiscreteAction::CHECK).unwrap();
        assert_eq!(hand.latest().street, Street::Flop);
        assert_eq!(hand.latest().turn_pos, 1);
    }

    #[test]
    fn all_in_and_call_runs_out_the_board() {
        let mut hand = Hand::new(GameParams::new(2, 20.0, 1.0)).unwrap();
        hand.act_discrete(DiscreteAction::ALL_IN).unwrap();
        hand.act_discrete(DiscreteAction::CALL).unwrap();
        assert!(hand.latest().finished());
        assert_eq!(hand.latest().pot(), 40.0);
    }

    #[test]
    fn undersized_raise_is_rejected() {
        let params = GameParams::new(2, 200.0, 1.0);
        let state = State::new(&params).unwrap();
        let err = make_action(&params, &state, ActionAmount::new(ActionKind::Raise, 1.5));
        assert!(err.is_err());
    }

    #[test]
    fn effective_stack_uses_second_largest() {
        let mut params = GameParams::new(3, 100.0, 1.0);
        params.initial_stacks = vec![50.0, 300.0, 200.0];
        assert_eq!(params.effective_stack(1), 200.0);
        assert_eq!(params.effective_stack(0), 50.0);
    }
}
