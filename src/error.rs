//! Error types for kiln
//!
//! All modules use `KilnResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for kiln operations
pub type KilnResult<T> = Result<T, KilnError>;

/// All errors that can occur in kiln
#[derive(Error, Debug)]
pub enum KilnError {
    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Unknown engine: {0}")]
    UnknownEngine(String),

    // Script errors
    #[error("parse error on line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("{verb}: {message}")]
    Script { verb: String, message: String },

    #[error("{verb} (line {line}): {source}")]
    Step {
        verb: String,
        line: usize,
        #[source]
        source: Box<KilnError>,
    },

    #[error("no image base specified: from has not been called")]
    NoImage,

    #[error("value for key {0:?} does not exist")]
    VarMissing(String),

    // Build integrity errors
    #[error("layer count would be 0 after edits")]
    EmptyLayerEdit,

    #[error("layer {0} appears more than once in the chain; refusing to edit")]
    DuplicateLayerDigest(String),

    #[error("top layer doesn't appear to exist")]
    TopLayerMissing,

    #[error("invalid chain id in archive: {0:?}")]
    InvalidChainId(String),

    #[error("some builds contained errors")]
    BuildsFailed { failed: Vec<String> },

    #[error("build cancelled")]
    Cancelled,

    // Layer store errors
    #[error("parent not mounted, cannot continue: {0}")]
    ParentNotMounted(String),

    #[error("mount failed: {0}")]
    MountFailed(String),

    #[error("unmount failed: {0}")]
    UnmountFailed(String),

    #[error("mount cannot proceed: {0}")]
    MountCannotProceed(String),

    #[error("image cannot be composed: {0}")]
    ImageCannotBeComposed(String),

    #[error("invalid asset: {0}")]
    InvalidAsset(String),

    #[error("invalid layer: {0}")]
    InvalidLayer(String),

    #[error("layer already exists: {0}")]
    LayerExists(String),

    #[error("mount already exists: {0}")]
    MountExists(String),

    #[error("tag does not exist: {0}")]
    TagDoesNotExist(String),

    #[error("lock is held by another process: {}", path.display())]
    LockContention { path: PathBuf },

    // Engine errors
    #[error("Container engine not available: {0}")]
    EngineUnavailable(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Image pull failed: {image}: {reason}")]
    ImagePull { image: String, reason: String },

    #[error("Command {command:?} exited with code {code}")]
    RunFailed { command: String, code: i32 },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("Invalid path: {path}: {reason}")]
    PathInvalid { path: PathBuf, reason: String },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KilnError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a script-level error attributed to a verb
    pub fn script(verb: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Script {
            verb: verb.into(),
            message: message.into(),
        }
    }

    /// Attribute an error to the script step that raised it
    ///
    /// Cancellation, parse errors and errors already attributed to an inner
    /// step pass through unchanged.
    pub fn at_step(self, verb: &str, line: usize) -> Self {
        match self {
            Self::Cancelled | Self::Parse { .. } | Self::Step { .. } => self,
            other => Self::Step {
                verb: verb.to_string(),
                line,
                source: Box::new(other),
            },
        }
    }

    /// The error without step attribution
    pub fn root(&self) -> &KilnError {
        match self {
            Self::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if the error is a cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Self::Cancelled)
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self.root() {
            Self::EngineUnavailable(_) => {
                Some("Install podman, or pass --engine memory for a dry run")
            }
            Self::NoImage => Some("Start the script with: from \"<image>\""),
            Self::LockContention { .. } => {
                Some("Another kiln process is using the store; retry when it finishes")
            }
            Self::UnknownEngine(_) => Some("Valid engines are: podman, memory"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = KilnError::script("workdir", "path \"foo\" is not absolute");
        assert_eq!(err.to_string(), "workdir: path \"foo\" is not absolute");
    }

    #[test]
    fn error_hint() {
        assert!(KilnError::NoImage.hint().is_some());
        assert_eq!(KilnError::Internal("x".into()).hint(), None);
    }

    #[test]
    fn step_attribution() {
        let err = KilnError::RunFailed {
            command: "/bin/sh -c false".into(),
            code: 1,
        }
        .at_step("run", 3);
        assert_eq!(
            err.to_string(),
            "run (line 3): Command \"/bin/sh -c false\" exited with code 1"
        );
        assert!(matches!(err.root(), KilnError::RunFailed { .. }));

        let nested = err.at_step("with_user", 2);
        assert!(matches!(nested, KilnError::Step { line: 3, .. }));
        assert!(KilnError::Cancelled.at_step("run", 1).is_cancelled());
        assert!(KilnError::NoImage.at_step("user", 1).hint().is_some());
    }

    #[test]
    fn cancellation_is_distinguished() {
        assert!(KilnError::Cancelled.is_cancelled());
        assert!(!KilnError::TopLayerMissing.is_cancelled());
    }
}
