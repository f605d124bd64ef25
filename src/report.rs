//! Rendering of a [`UsageReport`] into message-sized text blocks.

use colored::Colorize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::aggregate::{DataQuality, UsageReport, UsageRow};

#[derive(Tabled)]
struct TableRow {
    account: String,
    user: String,
    #[tabled(rename = "gpus")]
    gpu_count: u32,
    #[tabled(rename = "avg power")]
    average_power: String,
    #[tabled(rename = "efficiency")]
    efficiency: String,
}

impl TableRow {
    fn from_row(row: &UsageRow) -> Self {
        let efficiency = format!("{}%", row.efficiency);
        let efficiency = match row.efficiency {
            0..=24 => efficiency.red().to_string(),
            25..=59 => efficiency.yellow().to_string(),
            _ => efficiency.green().to_string(),
        };
        Self {
            account: row.account.clone(),
            user: row.user.clone(),
            gpu_count: row.gpu_count,
            average_power: format!("{:.0} W", row.average_power),
            efficiency,
        }
    }
}

fn table(title: &str, rows: &[UsageRow]) -> String {
    if rows.is_empty() {
        return format!("{title}:\n(none)\n");
    }
    let mut table = Table::new(rows.iter().map(TableRow::from_row));
    table.with(Style::psql());
    format!("{title}:\n{table}\n")
}

fn counters(report: &UsageReport) -> String {
    let c = &report.counters;
    let mut text = String::new();
    text += &format!("Idle: {} gpus\n", c.idle);
    text += &format!("Pending count: {} gpus\n", c.pending);
    text += &format!(
        "Preemptible count (these jobs will be killed if needed by non preemptible): {} gpus\n",
        c.preemptible
    );
    text += &format!("Non preemptible count: {} gpus\n", c.non_preemptible);
    text += &format!("Broken: {} gpus\n", c.broken);
    text += &format!("Total available: {} gpus\n", c.total_available);
    text
}

fn quality(quality: &DataQuality) -> String {
    let s = &quality.sampling;
    let mut text = format!(
        "Power sampled from {}/{} hosts ({} failed, {} timed out)\n",
        s.responded, s.targeted, s.failed, s.timed_out
    );
    if s.targeted > 0 && s.responded == 0 {
        text += &"No power samples collected: power and efficiency read 0\n"
            .yellow()
            .to_string();
    }
    if quality.unparsable_jobs > 0 {
        text += &format!("{} jobs skipped: unparsable allocation\n", quality.unparsable_jobs);
    }
    if quality.degraded_jobs > 0 {
        text += &format!(
            "{} jobs estimated from CPU share without power\n",
            quality.degraded_jobs
        );
    }
    if quality.unparsable_nodes > 0 {
        text += &format!(
            "{} nodes left out of idle count: unreadable GRES\n",
            quality.unparsable_nodes
        );
    }
    if quality.is_approximate() {
        text += "Figures above are approximate\n";
    }
    text
}

/// Sections of the report, each later chunked on its own.
pub fn render_sections(report: &UsageReport) -> Vec<String> {
    vec![
        table("Pending", &report.pending) + "\n" + &table("Preemptible", &report.preemptible),
        table("Non-preemptible", &report.non_preemptible),
        counters(report),
        quality(&report.quality),
    ]
}

/// Splits text into fenced blocks of at most `lines` lines.
pub fn chunk(text: &str, lines: usize) -> Vec<String> {
    let all: Vec<&str> = text.lines().collect();
    all.chunks(lines.max(1))
        .map(|block| format!("```\n{}\n```", block.join("\n")))
        .collect()
}

pub fn render_chunks(report: &UsageReport, lines: usize) -> Vec<String> {
    render_sections(report)
        .iter()
        .flat_map(|section| chunk(section, lines))
        .collect()
}

pub fn render_json(report: &UsageReport) -> serde_json::Result<String> {
    serde_json::to_string_pretty(report)
}
