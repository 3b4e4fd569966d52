use std::io;

use thiserror::Error;

pub type Result<T, E = self::Error> = std::result::Result<T, E>;

/// Errors produced by the lifecycle engine.
///
/// Every variant is a machine-readable kind; wrapped OS errors keep their
/// original cause so callers can still inspect `raw_os_error`.
#[derive(Debug, Error)]
pub enum Error {
    /// An underlying kernel or OS call failed (clone, socketpair, setns,
    /// cgroup write, rename, kill, wait, ...).
    #[error("{context}: {source}")]
    System {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The operation requires the destroyed state but the container is
    /// still alive.
    #[error("container is not stopped")]
    NotStopped,

    /// The child reported a structured init error during the handshake.
    #[error("container init failed: {message}")]
    InitFailed { message: String },

    /// The configuration requires a capability the namespace set cannot
    /// provide (e.g. networks without a network namespace).
    #[error("configuration mismatch: {message}")]
    ConfigMismatch { message: String },

    /// The operation's contract is defined but its implementation is
    /// incomplete.
    #[error("operation not implemented: {operation}")]
    NotImplemented { operation: &'static str },
}

impl Error {
    /// Wrap a failed OS call with a short description of what was attempted.
    pub fn system(context: impl Into<String>, source: impl Into<io::Error>) -> Self {
        Self::System {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn init_failed(message: impl Into<String>) -> Self {
        Self::InitFailed {
            message: message.into(),
        }
    }

    pub fn mismatch(message: impl Into<String>) -> Self {
        Self::ConfigMismatch {
            message: message.into(),
        }
    }

    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::NotStopped => "not-stopped",
            Self::InitFailed { .. } => "init-failed",
            Self::ConfigMismatch { .. } => "config-mismatch",
            Self::NotImplemented { .. } => "not-implemented",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_error_preserves_cause() {
        let err = Error::system("open control pipe", io::Error::from_raw_os_error(libc::EMFILE));
        match &err {
            Error::System { source, .. } => {
                assert_eq!(source.raw_os_error(), Some(libc::EMFILE));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
        assert!(err.to_string().starts_with("open control pipe: "));
    }

    #[test]
    fn errno_converts_into_system_source() {
        let err = Error::system("kill container init", nix::errno::Errno::ESRCH);
        match err {
            Error::System { source, .. } => {
                assert_eq!(source.raw_os_error(), Some(libc::ESRCH));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(Error::NotStopped.kind(), "not-stopped");
        assert_eq!(Error::init_failed("x").kind(), "init-failed");
        assert_eq!(Error::mismatch("x").kind(), "config-mismatch");
        assert_eq!(
            Error::NotImplemented { operation: "oom" }.kind(),
            "not-implemented"
        );
    }
}
