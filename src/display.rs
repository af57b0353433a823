//! Console output: live summary table, per-round history table and the
//! waterfall of individual outcomes.

use std::collections::VecDeque;
use std::io::{self, Write};

use chrono::Local;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color, ContentArrangement, Table};
use crossterm::cursor::MoveTo;
use crossterm::execute;
use crossterm::style::Stylize;
use crossterm::terminal::{Clear, ClearType};
use tracing::{info, warn};

use crate::config::{ProbeConfig, ProbeType, ShowMode};
use crate::executor::Reporter;
use crate::stats::{StatsSnapshot, fail_percent};

pub const HISTORY_ROWS: usize = 20;
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn now() -> String {
    Local::now().format(TIME_FORMAT).to_string()
}

pub fn clear_screen() -> io::Result<()> {
    execute!(io::stdout(), Clear(ClearType::All), MoveTo(0, 0))
}

/// One line of waterfall output for a single probe outcome.
pub fn waterfall_line(label: &str, success: bool, totals: (u64, u64)) -> String {
    let (ok, failed) = totals;
    let status = if success {
        "success".green().to_string()
    } else {
        "fail".red().to_string()
    };
    format!(
        "{}\t{}\tfail rate {:.2}%\tfailed {}\ttotal {}",
        label,
        status,
        fail_percent(ok, failed),
        failed,
        ok + failed
    )
}

/// Running totals of a finite run against the planned task count.
pub fn summary_table(snapshot: &StatsSnapshot, planned: usize, instance: &str, probe_type: ProbeType) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["ID", "Time", "Target", "Type", "Failed", "Sent", "Planned", "Fail %"]);
    table.add_row(vec![
        Cell::new("Total"),
        Cell::new(now()),
        Cell::new(instance),
        Cell::new(probe_type),
        Cell::new(snapshot.fail).fg(Color::Red),
        Cell::new(snapshot.total()),
        Cell::new(planned),
        Cell::new(format!("{:.2}%", snapshot.fail_percent())),
    ]);
    table
}

/// First changed key, with `,...` appended when there are more.
pub fn format_changed(snapshot: &StatsSnapshot) -> String {
    let changed = snapshot.changed();
    let mut keys = changed.iter();
    match keys.next() {
        None => String::new(),
        Some(first) if changed.len() > 1 => format!("{first},..."),
        Some(first) => first.clone(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoundRow {
    pub id: u64,
    pub time: String,
    pub success: u64,
    pub fail: u64,
    pub total: u64,
    pub fail_percent: f64,
    pub changed_count: usize,
    pub changed: String,
}

/// Rolling per-round history for continuous runs; keeps the newest
/// [`HISTORY_ROWS`] rows.
#[derive(Debug, Default)]
pub struct RoundHistory {
    rows: VecDeque<RoundRow>,
    next_id: u64,
}

impl RoundHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, snapshot: &StatsSnapshot) -> &RoundRow {
        self.next_id += 1;
        let row = RoundRow {
            id: self.next_id,
            time: now(),
            success: snapshot.success,
            fail: snapshot.fail,
            total: snapshot.total(),
            fail_percent: snapshot.fail_percent(),
            changed_count: snapshot.changed().len(),
            changed: format_changed(snapshot),
        };
        info!(
            round = row.id,
            success = row.success,
            fail = row.fail,
            total = row.total,
            fail_percent = %format!("{:.2}", row.fail_percent),
            changed_count = row.changed_count,
            changed = %row.changed,
            "round finished"
        );

        if self.rows.len() == HISTORY_ROWS {
            self.rows.pop_front();
        }
        self.rows.push_back(row);
        &self.rows[self.rows.len() - 1]
    }

    pub fn rows(&self) -> impl Iterator<Item = &RoundRow> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn table(&self, instance: &str, probe_type: ProbeType) -> Table {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                "Round", "Time", "Target", "Type", "Success", "Failed", "Total", "Fail %", "Changed", "Changed keys",
            ]);
        for row in &self.rows {
            table.add_row(vec![
                Cell::new(row.id),
                Cell::new(&row.time),
                Cell::new(instance),
                Cell::new(probe_type),
                Cell::new(row.success).fg(Color::Green),
                Cell::new(row.fail).fg(Color::Red),
                Cell::new(row.total),
                Cell::new(format!("{:.2}%", row.fail_percent)),
                Cell::new(row.changed_count),
                Cell::new(&row.changed),
            ]);
        }
        table
    }
}

/// Writes live results to stdout according to the configured show mode.
pub struct ConsoleReporter {
    instance: String,
    probe_type: ProbeType,
    waterfall: bool,
    continuous: bool,
}

impl ConsoleReporter {
    pub fn new(config: &ProbeConfig) -> Self {
        let continuous = config.is_continuous();
        Self {
            instance: config.instance_name(),
            probe_type: config.probe_type,
            waterfall: config.show_mode == ShowMode::Waterfall && !continuous,
            continuous,
        }
    }

    fn print_table(&self, table: &Table) {
        if let Err(err) = clear_screen() {
            warn!(error = %err, "failed to clear terminal");
        }
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "{table}");
    }
}

impl Reporter for ConsoleReporter {
    fn outcome(&self, label: &str, success: bool, totals: (u64, u64)) {
        if self.waterfall {
            println!("{}", waterfall_line(label, success, totals));
        }
    }

    fn progress(&self, snapshot: &StatsSnapshot, planned: usize) {
        if self.waterfall || self.continuous {
            return;
        }
        self.print_table(&summary_table(snapshot, planned, &self.instance, self.probe_type));
    }

    fn round(&self, history: &RoundHistory) {
        self.print_table(&history.table(&self.instance, self.probe_type));
    }
}
