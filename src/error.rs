//! Error taxonomy for the generator.
//!
//! Structural errors (conflicts, missing dependencies, function collisions)
//! always abort the build. Host capability probes that can only be settled at
//! boot report through [`Outcome`] instead.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// What kind of reference a [`Error::MissingDependency`] failed to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    Module,
    Binary,
    Hook,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyKind::Module => write!(f, "module"),
            DependencyKind::Binary => write!(f, "binary"),
            DependencyKind::Hook => write!(f, "hook"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("config conflict at '{key}': {reason}")]
    Conflict { key: String, reason: String },

    #[error("{required_by} requires {kind} '{name}', which is not available")]
    MissingDependency {
        kind: DependencyKind,
        name: String,
        required_by: String,
    },

    #[error("function name collides with a declared binary: {0}")]
    NameCollision(String),

    #[error("function '{0}' has already been registered")]
    DuplicateFunction(String),

    #[error("invalid parameter '{parameter}' for {context}")]
    InvalidParameter { parameter: String, context: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("autodetection failed: {0}")]
    Autodetect(String),

    #[error("command '{program}' failed: {message}")]
    Command { program: String, message: String },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn conflict(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Conflict {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_parameter(parameter: impl Into<String>, context: impl Into<String>) -> Self {
        Error::InvalidParameter {
            parameter: parameter.into(),
            context: context.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub fn autodetect(message: impl Into<String>) -> Self {
        Error::Autodetect(message.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result of a soft host-capability detection.
///
/// `Warned` and `Failed` are logged by the caller and never abort the build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Warned(String),
    Failed(String),
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok)
    }

    /// Log the outcome under the given detection name.
    pub fn log(&self, what: &str) {
        match self {
            Outcome::Ok => tracing::debug!(detection = what, "detection succeeded"),
            Outcome::Warned(msg) => tracing::warn!(detection = what, "{}", msg),
            Outcome::Failed(msg) => tracing::error!(detection = what, "{}", msg),
        }
    }
}
