//! Output functions for consistent CLI formatting
//!
//! Build output goes to stderr so stdout carries only results such as the
//! final image id.

use super::context::UiContext;
use super::theme::{self, Mark};
use console::style;

/// Display intro banner
pub fn intro(ctx: &UiContext, title: &str) {
    if ctx.is_quiet() {
        return;
    }
    if ctx.use_fancy_output() {
        cliclack::intro(theme::brand().bold().apply_to(title)).ok();
    } else {
        eprintln!("{}", style(title).bold());
    }
}

/// Display success outro
pub fn outro_success(ctx: &UiContext, message: &str) {
    if ctx.is_quiet() {
        return;
    }
    if ctx.use_fancy_output() {
        cliclack::outro(Mark::Done.style().bold().apply_to(message)).ok();
    } else {
        eprintln!("{} {}", Mark::Done.render(false), message);
    }
}

/// Display error outro
pub fn outro_error(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        cliclack::outro(Mark::Failed.style().bold().apply_to(message)).ok();
    } else {
        eprintln!("{} {}", Mark::Failed.render(false), message);
    }
}

/// The `[verb] args` line printed before each verb runs
pub fn build_step(ctx: &UiContext, verb: &str, args: &[String]) {
    if ctx.is_quiet() {
        return;
    }
    let line = format!("{} {}", theme::verb().apply_to(format!("[{}]", verb)), args.join(", "));
    match ctx.bar() {
        Some(bar) => bar.set_message(format!("{} {}", verb, args.join(", "))),
        None => eprintln!("{}", line.trim_end()),
    }
}

/// Report that a step was replayed from the cache
pub fn cache_hit(ctx: &UiContext, id: &str) {
    if ctx.is_quiet() || ctx.bar().is_some() {
        return;
    }
    let short = &id[..12.min(id.len())];
    let mark = Mark::Cached;
    eprintln!(
        "  {} {}",
        mark.render(ctx.use_fancy_output()),
        mark.style().apply_to(format!("cache hit {}", short))
    );
}

/// Display a success step
pub fn step_ok(ctx: &UiContext, message: &str) {
    if ctx.is_quiet() {
        return;
    }
    if ctx.use_fancy_output() {
        cliclack::log::success(message).ok();
    } else {
        eprintln!("  {} {}", Mark::Done.render(false), message);
    }
}

/// Display an error step
pub fn step_error(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        cliclack::log::error(message).ok();
    } else {
        eprintln!("  {} {}", Mark::Failed.render(false), message);
    }
}

/// Display a remark/hint
pub fn remark(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        cliclack::log::remark(message).ok();
    } else {
        eprintln!("  {}", style(message).dim());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_non_interactive() {
        let ctx = UiContext::non_interactive();
        intro(&ctx, "kiln build");
        build_step(&ctx, "run", &["make".to_string()]);
        cache_hit(&ctx, "0123456789abcdef");
        step_ok(&ctx, "Step completed");
        step_error(&ctx, "Error");
        outro_success(&ctx, "Done");
    }

    #[test]
    fn steps_update_the_bar() {
        let bar = indicatif::ProgressBar::hidden();
        let ctx = UiContext::non_interactive().with_bar(bar.clone());
        build_step(&ctx, "copy", &["src".to_string(), "/app".to_string()]);
        assert_eq!(bar.message(), "copy src, /app");
    }
}
