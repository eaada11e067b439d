use colored::Colorize;
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table};

use crate::cards::{Card, Suit};
use crate::scheduler::Stats;
use crate::table::{DiscreteAction, GameParams};

/// One row of a strategy table: a label for the information set and the
/// probability of each action.
pub struct StrategyRow {
    pub label: String,
    pub seat: u8,
    pub probabilities: Vec<f64>,
}

pub fn board_display(cards: &[Card]) -> String {
    cards
        .iter()
        .map(|card| {
            let text = card.to_string();
            match card.suit {
                Suit::Spades => text.white().to_string(),
                Suit::Hearts => text.red().to_string(),
                Suit::Diamonds => text.blue().to_string(),
                Suit::Clubs => text.green().to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn styled_action(action: DiscreteAction) -> String {
    let text = action.to_string();
    if action == DiscreteAction::FOLD {
        text.dimmed().bold().to_string()
    } else if action == DiscreteAction::CALL {
        text.green().bold().to_string()
    } else if action == DiscreteAction::CHECK {
        text.yellow().bold().to_string()
    } else {
        text.red().bold().to_string()
    }
}

fn probability_cell(p: f64) -> Cell {
    let pct = format!("{:.1}%", p * 100.0);
    let text = if p >= 0.6 {
        pct.green().to_string()
    } else if p >= 0.2 {
        pct.yellow().to_string()
    } else {
        pct.dimmed().to_string()
    };
    Cell::new(text).set_alignment(CellAlignment::Right)
}

/// Table of strategies sharing one action list.
pub fn strategy_table(actions: &[DiscreteAction], rows: &[StrategyRow]) -> String {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    let mut header = vec![Cell::new("Info set".bold().to_string()), Cell::new("Seat")];
    for &a in actions {
        header.push(Cell::new(styled_action(a)).set_alignment(CellAlignment::Right));
    }
    table.set_header(header);

    for row in rows {
        let mut cells = vec![
            Cell::new(&row.label),
            Cell::new(row.seat).set_alignment(CellAlignment::Center),
        ];
        cells.extend(row.probabilities.iter().map(|p| probability_cell(*p)));
        table.add_row(cells);
    }
    table.to_string()
}

pub fn stats_table(history: &[Stats]) -> String {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Epoch"),
        Cell::new("Iterations").set_alignment(CellAlignment::Right),
        Cell::new("it/s").set_alignment(CellAlignment::Right),
        Cell::new("States").set_alignment(CellAlignment::Right),
        Cell::new("Nodes").set_alignment(CellAlignment::Right),
        Cell::new("Exploitability").set_alignment(CellAlignment::Right),
        Cell::new("EV").set_alignment(CellAlignment::Right),
    ]);
    for s in history {
        table.add_row(vec![
            Cell::new(s.epoch),
            Cell::new(s.iterations).set_alignment(CellAlignment::Right),
            Cell::new(format!("{:.0}", s.iterations_per_sec)).set_alignment(CellAlignment::Right),
            Cell::new(s.states).set_alignment(CellAlignment::Right),
            Cell::new(s.nodes).set_alignment(CellAlignment::Right),
            Cell::new(format!("{:.5}", s.exploitability)).set_alignment(CellAlignment::Right),
            Cell::new(format!("{:.4}", s.ev)).set_alignment(CellAlignment::Right),
        ]);
    }
    table.to_string()
}

pub fn params_table(params: &GameParams, rows: &[(&str, String)]) -> String {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Field").set_alignment(CellAlignment::Left),
        Cell::new("Value").set_alignment(CellAlignment::Right),
    ]);

    let stacks = params
        .initial_stacks
        .iter()
        .map(|s| format!("{:.1}", s))
        .collect::<Vec<_>>()
        .join(" / ");
    let mut add = |name: &str, value: String| {
        table.add_row(vec![
            Cell::new(name.bold().to_string()),
            Cell::new(value).set_alignment(CellAlignment::Right),
        ]);
    };
    add("Players", params.num_players.to_string());
    add("Stacks", stacks);
    add("Small blind", format!("{:.2}", params.sb_amount));
    add("Ante", format!("{:.2}", params.ante));
    add("Max actions/round", params.max_actions_per_round.to_string());
    for (name, value) in rows {
        add(name, value.clone());
    }
    table.to_string()
}

pub fn print_section(title: &str, content: &str) {
    println!("\n{}", title.cyan().bold());
    println!("{}", content);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "Error:".red().bold(), msg);
}

pub fn print_success(msg: &str) {
    println!("{}", msg.green().bold());
}
