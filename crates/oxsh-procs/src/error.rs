//! Error taxonomy for the pipeline engine.
//!
//! Build-time errors (redirect conflicts, unknown commands, alias cycles)
//! are raised strictly before any process is spawned, so a failed build
//! never leaves orphans behind. Runtime drain errors are collected on the
//! pipeline instead of aborting shutdown. Signal-induced death is not an
//! error at all; it travels as [`SignalInfo`](oxsh_types::SignalInfo) data
//! on the process handle.

use thiserror::Error;

/// Result type for engine operations.
pub type ProcsResult<T> = Result<T, ProcsError>;

/// Errors produced while building, launching, or observing a pipeline.
#[derive(Debug, Clone, Error)]
pub enum ProcsError {
    /// A stage had no tokens at all.
    #[error("empty subprocess command")]
    EmptyCommand,
    /// No alias and no executable on PATH matched the command word.
    #[error("command not found: {0}")]
    CommandNotFound(String),
    /// The path exists but is not executable by us.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// A redirect tried to reassign an already-assigned stream slot.
    #[error("multiple redirections for {stream} in {cmd:?}")]
    MultipleRedirect { stream: String, cmd: Vec<String> },
    /// A token looked like a redirect but did not parse as one.
    #[error("unrecognized redirection: {0:?}")]
    UnrecognizedRedirect(String),
    /// Alias expansion revisited a name already on the expansion stack.
    #[error("recursive alias expansion for {0:?}")]
    AliasCycle(String),
    /// A `|` / `&` sentinel appeared somewhere it is not allowed.
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),
    /// The OS refused to start the process.
    #[error("failed to launch {cmd:?}: {message}")]
    LaunchFailure { cmd: Vec<String>, message: String },
    /// Policy-gated error raised when the caller observes a failed result.
    #[error("{cmd:?} failed with exit code {code}")]
    NonZeroExit {
        cmd: Vec<String>,
        code: i32,
        output: String,
    },
    /// Anything else from the OS.
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ProcsError {
    fn from(err: std::io::Error) -> Self {
        ProcsError::Io(err.to_string())
    }
}

impl From<nix::Error> for ProcsError {
    fn from(err: nix::Error) -> Self {
        ProcsError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offender() {
        let err = ProcsError::CommandNotFound("frobnicate".into());
        assert_eq!(err.to_string(), "command not found: frobnicate");

        let err = ProcsError::MultipleRedirect {
            stream: "stdout".into(),
            cmd: vec!["echo".into(), "hi".into()],
        };
        assert!(err.to_string().contains("stdout"));
        assert!(err.to_string().contains("echo"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: ProcsError = io.into();
        assert!(matches!(err, ProcsError::Io(_)));
    }
}
