//! Progress indicators with CI fallback

use super::context::UiContext;
use super::theme::Mark;
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

/// A task spinner with CI fallback
///
/// Spinners live across await points inside spawned build tasks, so the
/// state is an `indicatif` bar, which is `Send`.
pub struct TaskSpinner {
    spinner: Option<ProgressBar>,
    interactive: bool,
    quiet: bool,
}

impl TaskSpinner {
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            spinner: None,
            interactive: ctx.use_fancy_output() && ctx.bar().is_none(),
            quiet: ctx.is_quiet(),
        }
    }

    /// Start the spinner with a message
    pub fn start(&mut self, message: &str) {
        if self.quiet {
            return;
        }
        if self.interactive {
            let spinner = ProgressBar::new_spinner();
            if let Ok(spinner_style) = ProgressStyle::default_spinner().template("{spinner:.magenta} {msg}") {
                spinner.set_style(spinner_style.tick_chars("◒◐◓◑◇"));
            }
            spinner.set_message(message.to_string());
            spinner.enable_steady_tick(Duration::from_millis(100));
            self.spinner = Some(spinner);
        } else {
            eprintln!("{} {}", style("...").dim(), message);
        }
    }

    /// Stop with success message
    pub fn stop(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
            cliclack::log::success(message).ok();
        } else if !self.quiet && !self.interactive {
            eprintln!("{} {}", Mark::Done.render(false), message);
        }
    }

    /// Stop with error message
    pub fn stop_error(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
            cliclack::log::error(message).ok();
        } else if !self.quiet {
            eprintln!("{} {}", Mark::Failed.render(false), message);
        }
    }
}

impl Drop for TaskSpinner {
    fn drop(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
    }
}

/// One spinner line per concurrent build
///
/// Each build's step lines become its bar's message. Without a terminal the
/// bars are hidden and only the final result lines are printed.
pub struct BuildProgress {
    multi: MultiProgress,
    interactive: bool,
}

impl BuildProgress {
    pub fn new(ctx: &UiContext) -> Self {
        let interactive = ctx.use_fancy_output();
        let target = if interactive {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        Self {
            multi: MultiProgress::with_draw_target(target),
            interactive,
        }
    }

    /// Add a bar for a build labelled `label`
    pub fn add(&self, label: &str) -> ProgressBar {
        let bar = self.multi.add(ProgressBar::new_spinner());
        if let Ok(spinner_style) = ProgressStyle::default_spinner()
            .template("  {spinner:.cyan} {prefix:.bold}  {msg:.dim}  {elapsed:.dim}")
        {
            bar.set_style(spinner_style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "));
        }
        bar.set_prefix(label.to_string());
        if self.interactive {
            bar.enable_steady_tick(Duration::from_millis(120));
        }
        bar
    }

    /// Finish a bar with its outcome
    pub fn finish(&self, bar: &ProgressBar, ok: bool, message: &str) {
        let mark = (if ok { Mark::Done } else { Mark::Failed }).render(true);
        bar.disable_steady_tick();
        bar.finish_with_message(format!("{} {}", mark, message));
    }
}
