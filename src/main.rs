//! Kiln - cache-keyed container image builder
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use kiln::cli::commands::{self, Context};
use kiln::cli::{Cli, Commands};
use kiln::config::ConfigManager;
use kiln::error::{KilnError, KilnResult};
use kiln::signal::CancellationRegistry;
use kiln::ui::{self, UiContext};
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> KilnResult<()> {
    let cli = Cli::parse();

    let config_manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    // 0 = warn (spinners only), 1 = info, 2+ = debug; RUST_LOG wins
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match cli.verbose {
        0 => EnvFilter::new("kiln=warn"),
        1 => EnvFilter::new("kiln=info"),
        _ => EnvFilter::new("kiln=debug"),
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if config.general.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.without_time().init();
    }
    debug!("Loaded configuration from {}", config_manager.path().display());

    ui::init_theme();

    let signals = CancellationRegistry::new();
    signals.set_ignore_runners(config.signal.ignore_runners);
    signals
        .install()
        .map_err(|e| KilnError::io("installing signal handlers", e))?;

    let ctx = Context {
        engine: cli.engine.unwrap_or(config.build.engine),
        ui: UiContext::detect().with_quiet(cli.quiet),
        signals,
        config,
    };

    match cli.command {
        Commands::Build(args) => commands::build(args, &ctx).await,
        Commands::Multi(args) => commands::multi(args, &ctx).await,
        Commands::Repl(args) => commands::repl(args, &ctx).await,
        Commands::Store(args) => commands::store(args, &ctx).await,
    }
}
