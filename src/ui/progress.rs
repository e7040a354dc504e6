//! Progress indicators with CI fallback

use super::context::UiContext;
use crate::builder::{BuildEvent, StepStatus};
use crate::layer::LayerId;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;

/// Spinner for short cache operations, plain lines in CI
pub struct TaskSpinner {
    spinner: Option<cliclack::ProgressBar>,
    interactive: bool,
}

impl TaskSpinner {
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            spinner: None,
            interactive: ctx.use_fancy_output(),
        }
    }

    pub fn start(&mut self, message: &str) {
        if self.interactive {
            let spinner = cliclack::spinner();
            spinner.start(message);
            self.spinner = Some(spinner);
        } else {
            println!("{} {}", style("...").dim(), message);
        }
    }

    /// Stop with success message
    pub fn stop(&mut self, message: &str) {
        match self.spinner.take() {
            Some(spinner) => spinner.stop(message),
            None => println!("{} {}", style("[OK]").green(), message),
        }
    }

    /// Stop with error message
    pub fn stop_error(&mut self, message: &str) {
        match self.spinner.take() {
            Some(spinner) => spinner.error(message),
            None => eprintln!("{} {}", style("[FAIL]").red(), message),
        }
    }
}

/// Progress display for `strata build`.
///
/// Shows an indicatif bar over the descriptor steps in interactive mode and
/// plain lines in CI. Every finished step prints one line with its marker.
pub struct BuildProgress {
    bar: Option<ProgressBar>,
    current: Mutex<String>,
}

impl BuildProgress {
    /// Create a new build progress indicator.
    pub fn new(ctx: &UiContext, label: &str) -> Self {
        let bar = if ctx.use_fancy_output() {
            let bar = ProgressBar::new(0);
            if let Ok(template) = ProgressStyle::default_bar()
                .template("  {spinner:.cyan} Building {prefix}  {bar:20.cyan/dim} {pos}/{len} {msg:.dim}  {elapsed:.dim}")
            {
                bar.set_style(
                    template
                        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
                        .progress_chars("━╸─"),
                );
            }
            bar.set_prefix(label.to_string());
            bar.enable_steady_tick(std::time::Duration::from_millis(120));
            Some(bar)
        } else {
            println!("Building {}...", label);
            None
        };
        Self {
            bar,
            current: Mutex::new(String::new()),
        }
    }

    /// Process one build event
    pub fn on_event(&self, event: BuildEvent) {
        match event {
            BuildEvent::StepStarted {
                index,
                total,
                instruction,
            } => {
                if let Some(ref bar) = self.bar {
                    bar.set_length(total as u64);
                    bar.set_position(index as u64 - 1);
                    bar.set_message(instruction.clone());
                }
                *self.current.lock() = format!("Step {}/{}: {}", index, total, instruction);
            }
            BuildEvent::StepFinished { status, layer, .. } => {
                let line = step_line(&self.current.lock(), status, layer.as_ref());
                match self.bar {
                    Some(ref bar) => {
                        bar.println(line);
                        bar.inc(1);
                    }
                    None => println!("{}", line),
                }
            }
            BuildEvent::Output(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    return;
                }
                match self.bar {
                    Some(ref bar) => bar.set_message(truncate(trimmed, 60)),
                    None => println!("  {} {}", style("|").dim(), trimmed),
                }
            }
        }
    }

    /// Finish and clear the progress bar.
    pub fn finish(&self) {
        if let Some(ref bar) = self.bar {
            bar.disable_steady_tick();
            bar.finish_and_clear();
        }
    }
}

/// `Step N/M: INSTRUCTION` followed by the step marker and layer id
fn step_line(step: &str, status: StepStatus, layer: Option<&LayerId>) -> String {
    let marker = match status {
        StepStatus::CacheHit => style(status.to_string()).green(),
        StepStatus::Built => style(status.to_string()).yellow(),
        StepStatus::Base | StepStatus::Metadata => style(status.to_string()).dim(),
    };
    match layer {
        Some(id) => format!("  {} {}  {}", marker, step, style(id.short()).dim()),
        None => format!("  {} {}", marker, step),
    }
}

/// Cut `line` to `max` characters, ending in `...` when shortened
pub(crate) fn truncate(line: &str, max: usize) -> String {
    if line.chars().count() <= max {
        return line.to_string();
    }
    let head: String = line.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", head)
}
