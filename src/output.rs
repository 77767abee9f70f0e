//! Terminal output for apply progress and the final summary.

use std::time::Duration;

use colored::Colorize;

use crate::backup::BackupArtifact;
use crate::error::CcupError;
use crate::phase::Phase;
use crate::runner::{ApplyReport, PhaseStatus};

/// Print the header shown before a phase runs or is skipped.
pub fn print_phase_header(index: usize, phase: Phase, skipped: bool) {
    println!();
    println!("{}", phase_header(index, phase, skipped).cyan().bold());
}

fn phase_header(index: usize, phase: Phase, skipped: bool) -> String {
    let status = if skipped { " [SKIPPED]" } else { "" };
    format!(
        "=== Phase [{}/{}]: {}{} ===",
        index,
        Phase::ALL.len(),
        phase.title(),
        status
    )
}

/// Print per-phase results of a successful apply.
pub fn print_summary(report: &ApplyReport) {
    println!();
    println!("{}", "=".repeat(60));
    println!("{}", "Apply Summary".bold());
    println!("{}", "─".repeat(60).dimmed());

    for outcome in &report.outcomes {
        let line = format!(
            "  {:<24} {:<10} {}",
            outcome.phase.title(),
            status_label(outcome.status),
            match outcome.status {
                PhaseStatus::Completed => format_duration(outcome.duration),
                PhaseStatus::Skipped => "-".to_string(),
            }
        );
        match outcome.status {
            PhaseStatus::Completed => println!("{}", line),
            PhaseStatus::Skipped => println!("{}", line.dimmed()),
        }
    }

    if let Some(backup) = &report.backup {
        println!();
        println!("  {} {}", "→".cyan(), backup_line(backup));
        if backup.is_partial() {
            println!(
                "  {} {}",
                "!".yellow(),
                format!(
                    "Custom resources not exported for: {}",
                    backup.skipped_versions.join(", ")
                )
                .yellow()
            );
        }
    }

    let ran = report.completed().count();
    let cluster = &report.state.cluster_values.cluster_id;
    let message = if cluster.is_empty() {
        format!("Apply complete: {} of {} phases ran", ran, Phase::ALL.len())
    } else {
        format!(
            "Apply complete: {} of {} phases ran on cluster {}",
            ran,
            Phase::ALL.len(),
            cluster
        )
    };
    println!("{}", "=".repeat(60));
    println!("{}", message.green().bold());
    println!("{}", "=".repeat(60));
}

/// Print a failed apply, naming the phase that aborted it.
pub fn print_failure(err: &CcupError) {
    println!();
    match err.failed_phase() {
        Some(phase) => println!(
            "{} {}",
            "✗".red(),
            format!("Apply aborted in phase {}", phase.title()).red().bold()
        ),
        None => println!("{} {}", "✗".red(), "Apply aborted".red().bold()),
    }
    if err.is_backup_failure() {
        println!(
            "  {} No Helm release was changed; the backup did not complete.",
            "→".cyan()
        );
    }
}

fn backup_line(backup: &BackupArtifact) -> String {
    let contents = match (backup.includes_crds, backup.is_partial()) {
        (false, _) => "charts",
        (true, false) => "charts, CRDs, custom resources",
        (true, true) => "charts, CRDs, partial custom resources",
    };
    format!("Backup: {} ({})", backup.path.display(), contents)
}

fn status_label(status: PhaseStatus) -> &'static str {
    match status {
        PhaseStatus::Completed => "COMPLETED",
        PhaseStatus::Skipped => "SKIPPED",
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
