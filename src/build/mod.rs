//! Cache-keyed build pipeline
//!
//! The interpreter turns verbs into configuration changes and commits,
//! consulting the engine's image history before doing any work.

pub mod cache_key;
pub mod configuration;
pub mod copy;
pub mod interpreter;
pub mod ledger;

pub use configuration::Configuration;
pub use interpreter::Interpreter;
pub use ledger::LayerLedger;

use tokio_util::sync::CancellationToken;

/// Build-wide switches handed to each evaluator
#[derive(Debug, Clone)]
pub struct Globals {
    /// Consult and record the build cache
    pub cache: bool,
    /// Give containers a pseudo-terminal
    pub tty: bool,
    /// Show `run` output
    pub show_run: bool,
    /// Verbs and funcs removed from the dispatch table
    pub omit: Vec<String>,
    /// Shell used by `debug` when none is given
    pub shell: String,
    pub cancel: CancellationToken,
}

impl Default for Globals {
    fn default() -> Self {
        Self {
            cache: true,
            tty: false,
            show_run: true,
            omit: Vec::new(),
            shell: "/bin/bash".to_string(),
            cancel: CancellationToken::new(),
        }
    }
}
