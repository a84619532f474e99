use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{HumanCount, ProgressBar, ProgressStyle};
use stackup_core::PhaseConfig;

use crate::orchestrator::{ComponentReport, Outcome, RunObserver};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

/// Rich output needs a terminal on stdout and no `NO_COLOR`.
pub(crate) fn current_output_style() -> OutputStyle {
    let no_color = std::env::var_os("NO_COLOR").is_some_and(|value| !value.is_empty());
    output_style_for(no_color, std::io::stdout().is_terminal())
}

fn output_style_for(no_color: bool, is_terminal: bool) -> OutputStyle {
    if no_color || !is_terminal {
        OutputStyle::Plain
    } else {
        OutputStyle::Rich
    }
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
}

impl TerminalRenderer {
    pub(crate) fn from_style(style: OutputStyle) -> Self {
        Self { style }
    }

    pub(crate) fn current() -> Self {
        Self::from_style(current_output_style())
    }

    pub(crate) fn style(self) -> OutputStyle {
        self.style
    }

    pub(crate) fn print_status(self, status: &str, message: &str) {
        println!("{}", render_status_line(self.style, status, message));
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }

    pub(crate) fn start_run(self) -> TerminalObserver {
        TerminalObserver {
            style: self.style,
            progress_bar: None,
            started_at: Instant::now(),
        }
    }
}

/// Streams per-component lines while a run executes; in rich mode a
/// progress bar tracks the planned components.
pub(crate) struct TerminalObserver {
    style: OutputStyle,
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
}

impl TerminalObserver {
    fn emit(&self, line: String) {
        match &self.progress_bar {
            Some(progress_bar) => progress_bar.println(line),
            None => println!("{line}"),
        }
    }

    pub(crate) fn finish(mut self) {
        let Some(progress_bar) = self.progress_bar.take() else {
            return;
        };
        let total = progress_bar.length().unwrap_or_default();
        let current = progress_bar.position();
        progress_bar.finish_and_clear();
        if let Some(line) = render_progress_line(
            self.style,
            "upgrade",
            current,
            total,
            Some(self.started_at.elapsed()),
        ) {
            println!("{line}");
        }
    }
}

impl RunObserver for TerminalObserver {
    fn planned(&mut self, total: usize) {
        if self.style != OutputStyle::Rich || total == 0 {
            return;
        }
        let progress_bar = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.cyan.bold} {msg:<12} [{bar:20.cyan/blue}] {pos:>3}/{len:3} {elapsed_precise}",
        ) {
            progress_bar.set_style(style.tick_chars("-=~* ").progress_chars("=>-"));
        }
        progress_bar.set_message("upgrade");
        progress_bar.enable_steady_tick(Duration::from_millis(80));
        self.started_at = Instant::now();
        self.progress_bar = Some(progress_bar);
    }

    fn phase_started(&mut self, phase: &PhaseConfig) {
        if let Some(line) = render_section_header(self.style, &phase_title(phase)) {
            self.emit(line);
        }
    }

    fn component_finished(&mut self, report: &ComponentReport) {
        self.emit(format_component_line(self.style, report));
        if let Some(progress_bar) = &self.progress_bar {
            progress_bar.inc(1);
        }
    }
}

fn phase_title(phase: &PhaseConfig) -> String {
    format!(
        "phase {} (risk {}, on failure {})",
        phase.name,
        phase.risk.as_str(),
        phase.on_failure.as_str()
    )
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("[{}] {message}", status.to_ascii_uppercase()),
    }
}

pub(crate) fn format_component_line(style: OutputStyle, report: &ComponentReport) -> String {
    let name = &report.component;
    let (status, message) = match &report.outcome {
        Outcome::Planned { from, to, origin } => (
            "plan",
            format!("{name}: {} -> {to} ({origin})", from.as_deref().unwrap_or("none")),
        ),
        Outcome::Satisfied { version } => ("skip", format!("{name}: already at {version}")),
        Outcome::Skipped { version } => ("skip", format!("{name}: already at {version}, skipped")),
        Outcome::Settled { status } => (
            "skip",
            format!("{name}: already {} in this run", status.as_str()),
        ),
        Outcome::Upgraded { from, to, .. } => (
            "ok",
            format!("{name}: upgraded {} -> {to}", from.as_deref().unwrap_or("none")),
        ),
        Outcome::Failed {
            error,
            partial_rollback,
        } => (
            "fail",
            if *partial_rollback {
                format!("{name}: failed: {error} (rollback incomplete)")
            } else {
                format!("{name}: failed: {error} (rolled back)")
            },
        ),
        Outcome::NotReached => ("skip", format!("{name}: not reached, run aborted")),
    };
    render_status_line(style, status, &message)
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn progress_label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn progress_bar_style() -> Style {
    Style::new().fg_color(Some(AnsiColor::BrightBlue.into()))
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

pub(crate) fn render_section_header(style: OutputStyle, title: &str) -> Option<String> {
    match style {
        OutputStyle::Plain => None,
        OutputStyle::Rich => Some(colorize(section_style(), &format!("== {title} =="))),
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn render_progress_line(
    style: OutputStyle,
    label: &str,
    current: u64,
    total: u64,
    elapsed: Option<Duration>,
) -> Option<String> {
    if style == OutputStyle::Plain {
        return None;
    }

    let width = 18_usize;
    let safe_total = total.max(1);
    let bounded_current = current.min(safe_total);
    let filled = ((bounded_current as usize) * width) / (safe_total as usize);
    let bar = format!(
        "{}{}",
        "=".repeat(filled),
        "-".repeat(width.saturating_sub(filled))
    );
    let percent = (bounded_current * 100) / safe_total;
    let counts = format!("{}/{}", HumanCount(current), HumanCount(total));
    let suffix = elapsed
        .map(|value| format!(" complete in {}", format_elapsed(value)))
        .unwrap_or_default();

    Some(format!(
        "{} [{}] {:>3}% {}{}",
        colorize(progress_label_style(), label),
        colorize(progress_bar_style(), &bar),
        percent,
        counts,
        suffix
    ))
}
