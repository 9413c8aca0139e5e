//! Pending container configuration for one build
//!
//! Scoped fields carry two values: the image value, which is what a commit
//! records, and a temporary value set for the extent of a single verb or
//! block. The effective value is the temporary one when set.

use crate::engine::ContainerSpec;
use crate::store::ImageConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DEFAULT_USER: &str = "root";
const DEFAULT_WORKDIR: &str = "/";
const DEFAULT_SHELL: &str = "/bin/sh";

/// A string field with image and temporary values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringState {
    pub image: String,
    pub temporary: String,
}

impl StringState {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            temporary: String::new(),
        }
    }

    pub fn effective(&self) -> &str {
        if self.temporary.is_empty() {
            &self.image
        } else {
            &self.temporary
        }
    }
}

/// A list field with image and temporary values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListState {
    pub image: Vec<String>,
    pub temporary: Vec<String>,
}

impl ListState {
    pub fn new(image: Vec<String>) -> Self {
        Self {
            image,
            temporary: Vec::new(),
        }
    }

    pub fn effective(&self) -> &[String] {
        if self.temporary.is_empty() {
            &self.image
        } else {
            &self.temporary
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Current image id; empty until `from` runs
    pub image: String,
    pub user: StringState,
    pub workdir: StringState,
    pub cmd: ListState,
    pub entrypoint: ListState,
    /// `K=V` entries, unique by key
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            image: String::new(),
            user: StringState::new(DEFAULT_USER),
            workdir: StringState::new(DEFAULT_WORKDIR),
            cmd: ListState::new(vec![DEFAULT_SHELL.to_string()]),
            entrypoint: ListState::default(),
            env: Vec::new(),
            labels: BTreeMap::new(),
        }
    }
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a command for this step only
    ///
    /// An empty entrypoint still overrides the image entrypoint, so the
    /// temporary command always wins while it is set.
    pub fn temporary_command(&mut self, entrypoint: Vec<String>, cmd: Vec<String>) {
        self.entrypoint.temporary = entrypoint;
        self.cmd.temporary = cmd;
    }

    pub fn clear_temporary_command(&mut self) {
        self.entrypoint.temporary.clear();
        self.cmd.temporary.clear();
    }

    fn has_temporary_command(&self) -> bool {
        !self.cmd.temporary.is_empty()
    }

    /// Whether any scoped override is active
    pub fn has_temporaries(&self) -> bool {
        !self.user.temporary.is_empty()
            || !self.workdir.temporary.is_empty()
            || !self.cmd.temporary.is_empty()
            || !self.entrypoint.temporary.is_empty()
    }

    /// Merge `K=V` pairs into the environment, rebuilt sorted by key
    pub fn merge_env<'a>(&mut self, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) {
        let mut merged: BTreeMap<String, String> = self
            .env
            .iter()
            .map(|entry| match entry.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (entry.clone(), String::new()),
            })
            .collect();

        for (key, value) in pairs {
            merged.insert(key.to_string(), value.to_string());
        }

        self.env = merged
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
    }

    /// What a container for the current step runs with
    pub fn container_spec(&self, tty: bool, stdin: bool) -> ContainerSpec {
        let entrypoint = if self.has_temporary_command() {
            self.entrypoint.temporary.clone()
        } else {
            self.entrypoint.image.clone()
        };

        ContainerSpec {
            image: self.image.clone(),
            user: self.user.effective().to_string(),
            workdir: self.workdir.effective().to_string(),
            entrypoint,
            cmd: self.cmd.effective().to_vec(),
            env: self.env.clone(),
            tty,
            stdin,
        }
    }

    /// The configuration a commit records; temporaries never leak into it
    pub fn image_config(&self) -> ImageConfig {
        ImageConfig {
            user: self.user.image.clone(),
            working_dir: self.workdir.image.clone(),
            cmd: self.cmd.image.clone(),
            entrypoint: self.entrypoint.image.clone(),
            env: self.env.clone(),
            labels: self.labels.clone(),
            ..Default::default()
        }
    }

    /// Adopt an image and its recorded configuration
    ///
    /// Temporary values are left alone; they belong to the running step.
    pub fn load_image(&mut self, id: &str, config: &ImageConfig) {
        self.image = id.to_string();
        self.user.image = config.user.clone();
        self.workdir.image = config.working_dir.clone();
        self.cmd.image = config.cmd.clone();
        self.entrypoint.image = config.entrypoint.clone();
        self.env = config.env.clone();
        self.labels = config.labels.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Configuration::new();
        assert_eq!(config.user.effective(), "root");
        assert_eq!(config.workdir.effective(), "/");
        assert_eq!(config.cmd.effective(), ["/bin/sh"]);
        assert!(config.entrypoint.effective().is_empty());
        assert!(config.image.is_empty());
    }

    #[test]
    fn temporary_wins_while_set() {
        let mut config = Configuration::new();
        config.user.temporary = "nobody".into();
        assert_eq!(config.user.effective(), "nobody");
        config.user.temporary.clear();
        assert_eq!(config.user.effective(), "root");
    }

    #[test]
    fn temporary_command_overrides_entrypoint() {
        let mut config = Configuration::new();
        config.entrypoint.image = vec!["/entry".into()];
        config.temporary_command(vec![], vec!["/bin/bash".into()]);

        let spec = config.container_spec(false, true);
        assert!(spec.entrypoint.is_empty());
        assert_eq!(spec.cmd, vec!["/bin/bash"]);
        assert!(spec.stdin);

        let recorded = config.image_config();
        assert_eq!(recorded.entrypoint, vec!["/entry"]);
        assert_eq!(recorded.cmd, vec!["/bin/sh"]);

        config.clear_temporary_command();
        assert!(!config.has_temporaries());
    }

    #[test]
    fn merge_env_replaces_and_sorts() {
        let mut config = Configuration::new();
        config.env = vec!["PATH=/bin".into(), "B=1".into()];
        config.merge_env([("A", "x"), ("B", "2")]);
        assert_eq!(config.env, vec!["A=x", "B=2", "PATH=/bin"]);
    }

    #[test]
    fn load_image_keeps_temporaries() {
        let mut config = Configuration::new();
        config.workdir.temporary = "/tmp".into();
        let recorded = ImageConfig {
            user: "app".into(),
            working_dir: "/srv".into(),
            ..Default::default()
        };
        config.load_image("abc", &recorded);
        assert_eq!(config.image, "abc");
        assert_eq!(config.user.effective(), "app");
        assert_eq!(config.workdir.effective(), "/tmp");
    }
}
