//! CLI command implementations

pub mod build;
pub mod multi;
pub mod repl;
pub mod store;

pub use build::execute as build;
pub use multi::execute as multi;
pub use repl::execute as repl;
pub use store::execute as store;

use crate::build::Globals;
use crate::cli::args::BuildSwitches;
use crate::config::Config;
use crate::engine::{create_engine, EngineKind};
use crate::error::{KilnError, KilnResult};
use crate::multi::Builder;
use crate::signal::CancellationRegistry;
use crate::ui::UiContext;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Everything a command needs from `main`
pub struct Context {
    pub config: Config,
    pub engine: EngineKind,
    pub ui: UiContext,
    pub signals: Arc<CancellationRegistry>,
}

impl Context {
    /// Build switches after file, environment and flags
    pub fn globals(&self, switches: &BuildSwitches) -> Globals {
        let build = &self.config.build;
        let mut omit = build.omit.clone();
        omit.extend(switches.omit.iter().cloned());

        Globals {
            cache: build.cache && !switches.no_cache,
            tty: build.tty && !switches.no_tty,
            show_run: build.show_run,
            omit,
            shell: build.shell.clone(),
            ..Globals::default()
        }
    }

    /// A builder on the selected engine, once the engine is usable
    pub async fn builder(&self, globals: Globals) -> KilnResult<Builder> {
        let engine = create_engine(self.engine);
        if !engine.is_available().await? {
            return Err(KilnError::EngineUnavailable(self.engine.name().to_string()));
        }
        debug!("Using {} engine", engine.name());
        Ok(Builder::new(
            engine,
            Arc::clone(&self.signals),
            globals,
            self.ui.clone(),
        ))
    }
}

fn vars(switches: &BuildSwitches) -> HashMap<String, String> {
    switches.vars.iter().cloned().collect()
}
