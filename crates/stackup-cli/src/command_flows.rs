use std::time::Duration;

use anyhow::{Context, Result};
use stackup_core::{ExitCode, RunMode};
use stackup_installer::{
    process_alive, ComponentRecord, LockManager, LockRecord, RunStatus, StateDocument, StateLayout,
    StateStore,
};

use crate::orchestrator::{Orchestrator, Outcome, RunReport, RunRequest, SilentObserver, ORCHESTRATOR_LOCK};
use crate::render::{format_component_line, render_section_header, OutputStyle, TerminalRenderer};

const STATUS_HISTORY_ROWS: usize = 5;
const NO_RUN_TO_RESUME: &str = "No interrupted run to resume";

pub(crate) fn run_status_command(
    layout: &StateLayout,
    json: bool,
    renderer: TerminalRenderer,
) -> Result<ExitCode> {
    let locks = LockManager::new(layout.locks_dir(), Duration::ZERO, Duration::from_millis(10));
    let store = StateStore::new(layout, locks.clone());
    let document = store.load()?;

    if json {
        let rendered = serde_json::to_string_pretty(&document)
            .context("failed to serialize state document")?;
        println!("{rendered}");
        return Ok(ExitCode::Success);
    }

    let owner = locks
        .owner(ORCHESTRATOR_LOCK)?
        .filter(|record| process_alive(record.pid));
    renderer.print_lines(&format_status_lines(renderer.style(), &document, owner.as_ref()));
    Ok(ExitCode::Success)
}

pub(crate) fn run_upgrade_command(
    orchestrator: &Orchestrator,
    request: &RunRequest,
    renderer: TerminalRenderer,
) -> Result<ExitCode> {
    let mut observer = renderer.start_run();
    let result = orchestrator.run(request, &mut observer);
    observer.finish();
    let report = result?;

    let (status, message) = format_run_summary(&report);
    renderer.print_status(status, &message);
    Ok(report.exit_code())
}

pub(crate) fn run_resume_command(
    orchestrator: &Orchestrator,
    request: &RunRequest,
    renderer: TerminalRenderer,
) -> Result<ExitCode> {
    let document = orchestrator.store().load()?;
    if document.status != RunStatus::InProgress {
        println!("{NO_RUN_TO_RESUME}");
        return Ok(ExitCode::NoOp);
    }
    let report = orchestrator.run(request, &mut SilentObserver)?;
    if report.run_id.is_none() {
        // Another process finished the run between the check and the lock.
        println!("{NO_RUN_TO_RESUME}");
        return Ok(ExitCode::NoOp);
    }
    renderer.print_lines(&format_report_lines(renderer.style(), &report));
    let (status, message) = format_run_summary(&report);
    renderer.print_status(status, &message);
    Ok(report.exit_code())
}

pub(crate) fn run_rollback_command(
    orchestrator: &Orchestrator,
    renderer: TerminalRenderer,
) -> Result<ExitCode> {
    let rollback = orchestrator.rollback_run("rollback requested by operator")?;
    let Some(run_id) = rollback.run_id.as_deref() else {
        println!("No run to roll back");
        return Ok(rollback.exit_code());
    };

    for component in &rollback.reverted {
        renderer.print_status("ok", &format!("{component}: reverted"));
    }
    for failure in &rollback.failures {
        renderer.print_status("fail", failure);
    }
    if rollback.failures.is_empty() {
        renderer.print_status(
            "ok",
            &format!("run {run_id} rolled back ({} component(s) reverted)", rollback.reverted.len()),
        );
    } else {
        renderer.print_status(
            "fail",
            &format!(
                "run {run_id} rollback incomplete: {} step(s) failed",
                rollback.failures.len()
            ),
        );
    }
    Ok(rollback.exit_code())
}

pub(crate) fn format_run_summary(report: &RunReport) -> (&'static str, String) {
    let skipped = report
        .components
        .iter()
        .filter(|entry| {
            matches!(
                entry.outcome,
                Outcome::Skipped { .. } | Outcome::Satisfied { .. } | Outcome::Settled { .. }
            )
        })
        .count();
    let changed = report.changed();
    let failed = report.failed();

    if report.mode == RunMode::DryRun {
        return (
            "plan",
            format!("dry run: {changed} to upgrade, {skipped} up to date, {failed} unresolved"),
        );
    }

    let run = report.run_id.as_deref().unwrap_or("run");
    let verb = if report.resumed { "resumed" } else { "finished" };
    let message = format!("{run} {verb}: {changed} upgraded, {skipped} skipped, {failed} failed");
    if failed > 0 || report.aborted {
        let message = if report.aborted {
            format!("{message} (aborted)")
        } else {
            message
        };
        ("fail", message)
    } else if changed == 0 {
        ("ok", format!("{message} (nothing to do)"))
    } else {
        ("ok", message)
    }
}

fn format_report_lines(style: OutputStyle, report: &RunReport) -> Vec<String> {
    report
        .components
        .iter()
        .map(|entry| format_component_line(style, entry))
        .collect()
}

pub(crate) fn format_status_lines(
    style: OutputStyle,
    document: &StateDocument,
    lock_owner: Option<&LockRecord>,
) -> Vec<String> {
    let mut lines = Vec::new();
    let Some(run_id) = document.run_id.as_deref() else {
        lines.push("No runs recorded".to_string());
        if let Some(owner) = lock_owner {
            lines.push(format!("lock: held by pid {}", owner.pid));
        }
        return lines;
    };

    if let Some(header) = render_section_header(style, "current run") {
        lines.push(header);
    }
    lines.push(format!(
        "run {run_id}: {} (mode {})",
        document.status.as_str(),
        document.mode.unwrap_or_default().as_str()
    ));
    lines.push(format!("scope: {}", document.scope));
    if let Some(started_at) = document.started_at {
        lines.push(format!("started: {started_at}"));
    }
    if let Some(finished_at) = document.finished_at {
        lines.push(format!("finished: {finished_at}"));
    }
    if let Some(phase) = document.current_phase.as_deref() {
        lines.push(format!("phase: {phase}"));
    }
    if let Some(component) = document.current_component.as_deref() {
        lines.push(format!("component: {component}"));
    }
    if let Some(error) = document.error.as_deref() {
        lines.push(format!("error: {error}"));
    }
    match lock_owner {
        Some(owner) => lines.push(format!(
            "lock: held by pid {} since {}",
            owner.pid, owner.acquired_at_unix
        )),
        None if document.status == RunStatus::InProgress => {
            lines.push("lock: free (run interrupted; resume with --resume)".to_string())
        }
        None => {}
    }

    if !document.components.is_empty() {
        if let Some(header) = render_section_header(style, "components") {
            lines.push(header);
        }
        for (name, record) in &document.components {
            lines.push(format_component_record(name, record));
        }
    }

    if !document.history.is_empty() {
        if let Some(header) = render_section_header(style, "history") {
            lines.push(header);
        }
        for run in document.history.iter().rev().take(STATUS_HISTORY_ROWS) {
            lines.push(format!(
                "{}: {} (mode {}, {} component(s))",
                run.run_id,
                run.status.as_str(),
                run.mode.as_str(),
                run.components.len()
            ));
        }
        let hidden = document.history.len().saturating_sub(STATUS_HISTORY_ROWS);
        if hidden > 0 {
            lines.push(format!("... {hidden} older run(s)"));
        }
    }
    lines
}

fn format_component_record(name: &str, record: &ComponentRecord) -> String {
    let mut line = format!("  {name}: {}", record.status.as_str());
    if let Some(to) = record.to_version.as_deref() {
        line.push_str(&format!(
            " {} -> {to}",
            record.from_version.as_deref().unwrap_or("none")
        ));
    }
    if record.reverted {
        line.push_str(" (reverted)");
    }
    if let Some(error) = record.error.as_deref() {
        line.push_str(&format!(": {error}"));
    }
    line
}
