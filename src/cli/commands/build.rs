//! Build command - run one script

use super::{vars, Context};
use crate::cli::args::BuildArgs;
use crate::error::{KilnError, KilnResult};
use crate::multi::BuildPlan;
use crate::ui;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::info;

/// Execute the build command
pub async fn execute(args: BuildArgs, ctx: &Context) -> KilnResult<()> {
    let plan = match args.file.as_deref() {
        Some(path) if path != Path::new("-") => BuildPlan::from_file(path, vars(&args.switches)).await?,
        _ => {
            let mut source = String::new();
            tokio::io::stdin()
                .read_to_string(&mut source)
                .await
                .map_err(|e| KilnError::io("reading script from stdin", e))?;
            let build_dir = std::env::current_dir()
                .map_err(|e| KilnError::io("getting current directory", e))?;
            BuildPlan {
                file_name: "<stdin>".to_string(),
                source,
                build_dir,
                vars: vars(&args.switches),
            }
        }
    };

    ui::intro(&ctx.ui, &format!("kiln build {}", plan.file_name));

    let builder = ctx.builder(ctx.globals(&args.switches)).await?;
    let result = builder.build(&plan).await;
    let id = match result.outcome {
        Ok(id) => id,
        Err(e) => {
            ui::outro_error(&ctx.ui, &format!("{} failed", result.file_name));
            return Err(e);
        }
    };

    if let Some(tag) = &args.tag {
        builder.engine().tag(&id, tag).await?;
        info!("Tagged {} as {}", id, tag);
    }

    ui::outro_success(&ctx.ui, &format!("Built {}", short(&id)));
    println!("{}", id);
    Ok(())
}

fn short(id: &str) -> &str {
    &id[..12.min(id.len())]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_ids() {
        assert_eq!(short("0123456789abcdef"), "0123456789ab");
        assert_eq!(short("abc"), "abc");
    }
}
