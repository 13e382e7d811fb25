/// Output formatting: terminal tables and JSON.
use std::fmt::Write;

use pairpoll_core::{AbilityStatus, RankingCondition, RankingReport, SingularReason, ValidationWarning, WarningKind};
use serde::Serialize;

use crate::driver::DriverSummary;
use crate::queue::QueueStats;

#[derive(Serialize)]
struct JsonReport<'a> {
    log: &'a str,
    #[serde(flatten)]
    report: &'a RankingReport,
}

fn status_label(status: AbilityStatus) -> &'static str {
    match status {
        AbilityStatus::Estimated => "",
        AbilityStatus::NoWins => "no wins",
        AbilityStatus::NeverCompared => "never compared",
    }
}

pub fn describe_condition(condition: &RankingCondition) -> String {
    match condition {
        RankingCondition::NotConverged { iterations, max_change } => format!(
            "did not converge after {iterations} iterations (last change {max_change:.3e}); abilities may be inaccurate"
        ),
        RankingCondition::SingularCovariance { options, reason } => {
            let why = match reason {
                SingularReason::ZeroAbility => "zero ability",
                SingularReason::DisconnectedGraph => "comparison graph is disconnected",
                SingularReason::NotInvertible => "information matrix is singular",
            };
            format!("intervals not computable ({why}): {}", options.join(", "))
        }
    }
}

pub fn describe_warning(warning: &ValidationWarning) -> String {
    let row = warning.row + 1;
    match &warning.kind {
        WarningKind::AnswerMatchesNeither { answer } => format!(
            "row {row}: answer {answer:?} matches neither {:?} nor {:?}",
            warning.option_a, warning.option_b
        ),
        WarningKind::SelfComparison => format!("row {row}: {:?} compared with itself", warning.option_a),
    }
}

pub fn render_report_table(report: &RankingReport) -> String {
    let name_width = report
        .rankings
        .iter()
        .map(|r| r.option.chars().count())
        .max()
        .unwrap_or(6)
        .max(6); // at least "Option"

    let mut out = String::new();
    let _ = writeln!(
        out,
        " # | {:<name_width$} | Ability |    Beta |     SE | 95% CI Low | 95% CI High | Wins/Contests",
        "Option"
    );
    let _ = writeln!(
        out,
        "---|-{}-|---------|---------|--------|------------|-------------|--------------",
        "-".repeat(name_width)
    );

    for (i, r) in report.rankings.iter().enumerate() {
        let beta = r.beta.map_or_else(|| "-".to_string(), |b| format!("{b:.3}"));
        let (se, low, high) = match r.interval {
            Some(ci) => (
                format!("{:.3}", ci.standard_error),
                format!("{:.4}", ci.ability_lower),
                format!("{:.4}", ci.ability_upper),
            ),
            None => ("-".to_string(), "-".to_string(), "-".to_string()),
        };
        let mut note = status_label(r.status).to_string();
        if r.is_reference {
            note = "reference".to_string();
        }
        let _ = writeln!(
            out,
            "{:>2} | {:<name_width$} | {:>7.4} | {:>7} | {:>6} | {:>10} | {:>11} | {:>6}/{:<6} {}",
            i + 1,
            r.option,
            r.ability,
            beta,
            se,
            low,
            high,
            r.wins,
            r.contests,
            note,
        );
    }

    let _ = writeln!(
        out,
        "\n{} options, {} contests, {} valid wins, {} iterations",
        report.rankings.len(),
        report.total_contests,
        report.total_wins,
        report.iterations,
    );
    if !report.warnings.is_empty() {
        let _ = writeln!(out, "{} rows did not count as a win (see `pairpoll validate`)", report.warnings.len());
    }
    for condition in &report.conditions {
        let _ = writeln!(out, "Note: {}", describe_condition(condition));
    }
    out
}

/// Print one report per log as a formatted terminal table.
pub fn print_tables(reports: &[(String, RankingReport)]) {
    for (i, (label, report)) in reports.iter().enumerate() {
        if reports.len() > 1 {
            if i > 0 {
                println!();
            }
            println!("== {label} ==");
        }
        print!("{}", render_report_table(report));
    }
}

/// Print all reports as one JSON array.
pub fn print_json(reports: &[(String, RankingReport)]) -> serde_json::Result<()> {
    let output: Vec<JsonReport> = reports
        .iter()
        .map(|(log, report)| JsonReport { log, report })
        .collect();
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Options down the side, one ability column per log. Rows sorted by mean ability.
pub fn render_cross_table(reports: &[(String, RankingReport)]) -> String {
    let mut options: Vec<(String, f64)> = Vec::new();
    for (_, report) in reports {
        for r in &report.rankings {
            if !options.iter().any(|(name, _)| *name == r.option) {
                options.push((r.option.clone(), 0.0));
            }
        }
    }
    for entry in &mut options {
        let total: f64 = reports
            .iter()
            .filter_map(|(_, report)| report.get(&entry.0).map(|r| r.ability))
            .sum();
        entry.1 = total / reports.len().max(1) as f64;
    }
    options.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let name_width = options.iter().map(|(name, _)| name.chars().count()).max().unwrap_or(6).max(6);
    let widths: Vec<usize> = reports.iter().map(|(label, _)| label.chars().count().max(7)).collect();

    let mut out = String::new();
    let _ = write!(out, "{:<name_width$}", "Option");
    for ((label, _), width) in reports.iter().zip(widths.iter().copied()) {
        let _ = write!(out, " | {label:>width$}");
    }
    let _ = writeln!(out, " |    Mean");

    for (name, mean) in &options {
        let _ = write!(out, "{name:<name_width$}");
        for ((_, report), width) in reports.iter().zip(widths.iter().copied()) {
            let cell = report
                .get(name)
                .map_or_else(|| "-".to_string(), |r| format!("{:.4}", r.ability));
            let _ = write!(out, " | {cell:>width$}");
        }
        let _ = writeln!(out, " | {mean:>7.4}");
    }
    out
}

pub fn print_stats(stats: &[(String, QueueStats)]) {
    let name_width = stats.iter().map(|(name, _)| name.chars().count()).max().unwrap_or(9).max(9);
    println!("{:<name_width$} | Unprocessed | Claimed | Answered | Total", "Responder");
    println!("{}-|-------------|---------|----------|------", "-".repeat(name_width));
    for (name, s) in stats {
        println!(
            "{:<name_width$} | {:>11} | {:>7} | {:>8} | {:>5}",
            name,
            s.unprocessed,
            s.claimed,
            s.answered,
            s.total()
        );
    }
}

pub fn print_run_summary(summaries: &[DriverSummary]) {
    for s in summaries {
        let stopped = if s.cancelled { " (cancelled)" } else { "" };
        println!("{}: {} answered, {} left claimed{}", s.responder, s.answered, s.failed, stopped);
    }
}
