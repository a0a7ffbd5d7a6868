//! Crate-wide error types.
//!
//! Errors carry a reference to captured output (a [`Detail`]) instead of the
//! output itself; `Display` only names the detail.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::runtime::ExitInfo;
use crate::sink::Detail;
use crate::supervisor::SupervisorState;

/// Why the OS refused to start the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchErrorKind {
    /// The executable does not exist or is not on `PATH`.
    NotFound,
    PermissionDenied,
    /// Exists, but is a directory, lacks exec bits or has a bad format.
    NotExecutable,
    BadWorkingDir,
    /// Any other spawn-level OS failure.
    Spawn,
}

impl fmt::Display for LaunchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LaunchErrorKind::NotFound => "executable not found",
            LaunchErrorKind::PermissionDenied => "permission denied",
            LaunchErrorKind::NotExecutable => "not executable",
            LaunchErrorKind::BadWorkingDir => "working directory unusable",
            LaunchErrorKind::Spawn => "spawn failed",
        };
        f.write_str(s)
    }
}

/// When a crash was observed relative to readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPhase {
    BeforeReady,
    /// The probe was satisfied but the process died inside the minimum-uptime window.
    WithinMinUptime,
}

impl fmt::Display for CrashPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrashPhase::BeforeReady => f.write_str("before becoming ready"),
            CrashPhase::WithinMinUptime => f.write_str("within its minimum uptime"),
        }
    }
}

#[derive(Error, Debug)]
pub enum FixtureError {
    #[error("failed to launch `{program}`: {kind}")]
    Launch {
        program: String,
        kind: LaunchErrorKind,
        #[source]
        source: io::Error,
    },

    #[error("`{service}` did not become ready within {timeout:?}; see detail \"{}\"", .detail.name())]
    Timeout {
        service: String,
        timeout: Duration,
        detail: Detail,
    },

    #[error("`{service}` hung: no output and not ready within {timeout:?}; see detail \"{}\"", .detail.name())]
    Hung {
        service: String,
        timeout: Duration,
        detail: Detail,
    },

    #[error("`{service}` exited ({exit}) {phase}; see detail \"{}\"", .detail.name())]
    Crashed {
        service: String,
        exit: ExitInfo,
        phase: CrashPhase,
        detail: Detail,
    },

    #[error("readiness probe for `{service}` failed: {reason}; see detail \"{}\"", .detail.name())]
    ProbeFailed {
        service: String,
        reason: String,
        detail: Detail,
    },

    #[error("cannot {op} while {state}")]
    InvalidState {
        op: &'static str,
        state: SupervisorState,
    },

    #[error("event loop: {0}")]
    EventLoop(#[from] LoopError),

    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
}

impl FixtureError {
    pub fn is_launch(&self) -> bool {
        matches!(self, FixtureError::Launch { .. })
    }

    /// `Hung` counts as a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, FixtureError::Timeout { .. } | FixtureError::Hung { .. })
    }

    pub fn is_crash(&self) -> bool {
        matches!(self, FixtureError::Crashed { .. })
    }

    /// The captured-output attachment this error refers to, if any.
    pub fn detail(&self) -> Option<&Detail> {
        match self {
            FixtureError::Timeout { detail, .. }
            | FixtureError::Hung { detail, .. }
            | FixtureError::Crashed { detail, .. }
            | FixtureError::ProbeFailed { detail, .. } => Some(detail),
            _ => None,
        }
    }
}

/// Failures of the event-loop runner and its cross-thread futures.
#[derive(Error, Debug)]
pub enum LoopError {
    #[error("event loop `{0}` is not running")]
    NotStarted(String),

    #[error("event loop `{0}` has been stopped")]
    Stopped(String),

    #[error("result has not fired yet")]
    NotFired,

    #[error("result was already taken")]
    AlreadyTaken,

    #[error("no result within {0:?}")]
    WaitTimedOut(Duration),

    #[error("scheduled work was cancelled")]
    Cancelled,

    #[error("scheduled work panicked: {0}")]
    Panicked(String),

    #[error("failed to start event loop thread: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid duration '{value}': {reason}")]
    Duration { value: String, reason: String },

    #[error("invalid readiness pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("unknown stop signal '{0}'")]
    Signal(String),

    #[error("invalid service spec: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, FixtureError>;
