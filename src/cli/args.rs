//! CLI argument definitions using clap derive

use crate::engine::EngineKind;
use crate::store::archive::ArchiveFormat;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Kiln - cache-keyed container image builder
///
/// Runs build scripts against a container engine, replaying unchanged
/// steps from the image history.
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "KILN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Container engine: podman or memory
    #[arg(long, global = true, value_parser = parse_engine)]
    pub engine: Option<EngineKind>,

    /// Suppress step lines and banners
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build one script and print the final image id
    Build(BuildArgs),

    /// Build several scripts concurrently
    Multi(MultiArgs),

    /// Evaluate statements interactively
    Repl(ReplArgs),

    /// Work with the local layer store
    Store(StoreArgs),
}

/// Switches shared by every command that builds
#[derive(Args, Debug, Default, Clone)]
pub struct BuildSwitches {
    /// Do not consult or record the build cache
    #[arg(long)]
    pub no_cache: bool,

    /// Do not give build containers a terminal
    #[arg(long)]
    pub no_tty: bool,

    /// Verbs and funcs to disable (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub omit: Vec<String>,

    /// Build variable read by `var` (KEY=VALUE)
    #[arg(long = "var", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Script to build; stdin when absent or `-`
    pub file: Option<PathBuf>,

    /// Tag the final image
    #[arg(short, long)]
    pub tag: Option<String>,

    #[command(flatten)]
    pub switches: BuildSwitches,
}

/// Arguments for the multi command
#[derive(Parser, Debug)]
pub struct MultiArgs {
    /// Scripts to build
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    #[command(flatten)]
    pub switches: BuildSwitches,
}

/// Arguments for the repl command
#[derive(Parser, Debug)]
pub struct ReplArgs {
    #[command(flatten)]
    pub switches: BuildSwitches,
}

/// Arguments for the store command
#[derive(Parser, Debug)]
pub struct StoreArgs {
    /// Subcommand for store
    #[command(subcommand)]
    pub action: StoreAction,
}

/// Store subcommands
#[derive(Subcommand, Debug)]
pub enum StoreAction {
    /// Write a tagged image to an archive
    Export {
        /// Tag to export
        tag: String,

        /// Archive file to write
        #[arg(short, long)]
        out: PathBuf,

        /// Archive format
        #[arg(short, long, default_value = "docker")]
        format: ExportFormat,
    },

    /// Load a docker archive into the store
    Import {
        /// Archive file to read
        file: PathBuf,

        /// Tag the imported image
        #[arg(short, long)]
        tag: Option<String>,
    },

    /// List tags
    Tags,
}

/// Archive format for store export
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ExportFormat {
    /// manifest.json with one directory per layer
    Docker,
    /// Content-addressed OCI layout
    Oci,
}

impl From<ExportFormat> for ArchiveFormat {
    fn from(format: ExportFormat) -> Self {
        match format {
            ExportFormat::Docker => ArchiveFormat::Docker,
            ExportFormat::Oci => ArchiveFormat::Oci,
        }
    }
}

fn parse_engine(s: &str) -> Result<EngineKind, String> {
    s.parse().map_err(|e: crate::error::KilnError| e.to_string())
}

/// Parse a build variable in KEY=VALUE format
fn parse_var(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE format: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}
