//! Configuration schema for kiln
//!
//! Configuration is stored at `~/.config/kiln/config.toml`

use crate::engine::EngineKind;
use crate::error::KilnResult;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Build switches
    pub build: BuildConfig,

    /// Layer store settings
    pub store: StoreConfig,

    /// Signal handling
    pub signal: SignalConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Consult and record the build cache
    pub cache: bool,

    /// Give build containers a pseudo-terminal
    pub tty: bool,

    /// Show `run` output
    pub show_run: bool,

    /// Verbs and funcs to remove from scripts
    pub omit: Vec<String>,

    /// Shell for `debug` when none is given
    pub shell: String,

    /// Container engine backend
    pub engine: EngineKind,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            cache: true,
            tty: true,
            show_run: true,
            omit: vec![],
            shell: "/bin/bash".to_string(),
            engine: EngineKind::default(),
        }
    }
}

/// Layer store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base directory; defaults to `<state dir>/kiln/store`
    pub path: Option<PathBuf>,
}

/// Signal handling configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Do not wait for builds to unwind after SIGINT or SIGTERM
    pub ignore_runners: bool,
}

fn set(value: Option<String>) -> bool {
    value.is_some_and(|v| !v.is_empty())
}

impl Config {
    /// Apply `NO_CACHE`, `NO_TTY`, `KILN_OMIT` and `KILN_ENGINE`
    pub fn apply_env(&mut self) -> KilnResult<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply environment overrides read through `lookup`
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> KilnResult<()> {
        if set(lookup("NO_CACHE")) {
            self.build.cache = false;
        }
        if set(lookup("NO_TTY")) {
            self.build.tty = false;
        }
        if let Some(omit) = lookup("KILN_OMIT") {
            self.build.omit.extend(split_list(&omit));
        }
        if let Some(engine) = lookup("KILN_ENGINE").filter(|e| !e.is_empty()) {
            self.build.engine = engine.parse()?;
        }
        Ok(())
    }
}

/// Comma-separated names, trimmed, empties dropped
pub fn split_list(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
