//! Repl command - evaluate statements line by line
//!
//! Lines accumulate while the input is incomplete (an open block, string or
//! bracket), so multi-line statements can be typed naturally. Errors are
//! reported and the session continues with the state built so far.

use super::{vars, Context};
use crate::cli::args::ReplArgs;
use crate::error::{KilnError, KilnResult};
use crate::multi::BuildPlan;
use crate::script::Evaluator;
use console::style;
use std::io::{IsTerminal, Write};
use tokio::io::{AsyncBufReadExt, BufReader};

const PROMPT: &str = "kiln> ";
const CONTINUE_PROMPT: &str = "kiln*> ";

/// Execute the repl command
pub async fn execute(args: ReplArgs, ctx: &Context) -> KilnResult<()> {
    let mut globals = ctx.globals(&args.switches);
    globals.cache = false;
    ctx.signals.set_ignore_runners(true);

    let plan = BuildPlan {
        file_name: "<repl>".to_string(),
        source: String::new(),
        build_dir: std::env::current_dir().map_err(|e| KilnError::io("getting current directory", e))?,
        vars: vars(&args.switches),
    };
    let builder = ctx.builder(globals).await?;
    let mut evaluator = builder.evaluator(&plan, ctx.ui.clone());

    let interactive = std::io::stdin().is_terminal();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending = String::new();

    loop {
        if interactive {
            prompt(if pending.is_empty() { PROMPT } else { CONTINUE_PROMPT });
        }

        let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| KilnError::io("reading from stdin", e))?
        else {
            break;
        };

        if pending.is_empty() && matches!(line.trim(), "quit" | "exit") {
            break;
        }
        if !pending.is_empty() {
            pending.push('\n');
        }
        pending.push_str(&line);
        if pending.trim().is_empty() {
            pending.clear();
            continue;
        }

        step(&mut evaluator, &mut pending).await;
    }

    if interactive {
        eprintln!();
    }
    Ok(())
}

/// Evaluate the pending input unless it needs more lines
async fn step(evaluator: &mut Evaluator, pending: &mut String) {
    let code = evaluator.run_code(pending).await;
    if code.incomplete {
        return;
    }
    pending.clear();

    match code.result.outcome {
        Ok(value) => println!("{}", value),
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
        }
    }
}

fn prompt(text: &str) {
    let mut stderr = std::io::stderr();
    let _ = write!(stderr, "{}", style(text).cyan());
    let _ = stderr.flush();
}
