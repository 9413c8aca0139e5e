//! Multi command - build several scripts at once

use super::{vars, Context};
use crate::cli::args::MultiArgs;
use crate::error::KilnResult;
use crate::multi::{self, BuildPlan};
use crate::ui::{self, Mark};

/// Execute the multi command
pub async fn execute(args: MultiArgs, ctx: &Context) -> KilnResult<()> {
    let vars = vars(&args.switches);
    let mut plans = Vec::with_capacity(args.files.len());
    for file in &args.files {
        plans.push(BuildPlan::from_file(file, vars.clone()).await?);
    }

    ui::intro(&ctx.ui, &format!("kiln multi ({} scripts)", plans.len()));

    let results = ctx
        .builder(ctx.globals(&args.switches))
        .await?
        .build_all(plans)
        .await;

    for result in &results {
        match &result.outcome {
            Ok(id) => println!("{}\t{}", result.file_name, id),
            Err(e) => eprintln!("{} {}: {}", Mark::Failed.render(false), result.file_name, e),
        }
    }

    match multi::check(&results) {
        Ok(()) => {
            ui::outro_success(&ctx.ui, &format!("Built {} images", results.len()));
            Ok(())
        }
        Err(e) => {
            ui::outro_error(&ctx.ui, &e.to_string());
            Err(e)
        }
    }
}
