use nix::unistd::Pid;
use thiserror::Error;

/// Result type used throughout the core.
pub type Result<T> = std::result::Result<T, TracerError>;

/// The closed error surface of the tracer core.
#[derive(Debug, Error)]
pub enum TracerError {
    /// Expected: a tracee died. Handlers catch this and convert it into a DEAD
    /// transition; it should not usually escape to a facade caller.
    #[error("tracee {pid} died")]
    TraceeDied { pid: Pid },

    /// The event stream is inconsistent (external interference, a kernel bug,
    /// or a tracer bug). The offending pid is dropped from the registry.
    #[error("bad trace for {pid}: {msg}")]
    BadTrace { pid: Pid, msg: String },

    /// A syscall against the kernel failed with an errno.
    #[error("system error during {context}: {source}")]
    SystemError {
        context: &'static str,
        #[source]
        source: nix::Error,
    },

    /// An invariant was violated outside the ptrace stream (e.g. the
    /// executable passed to `start` could not be found or exec'd, or a
    /// leader died before its first exec completed).
    #[error("runtime error: {0}")]
    RuntimeError(String),
}

impl TracerError {
    pub fn bad_trace(pid: Pid, msg: impl Into<String>) -> Self {
        TracerError::BadTrace {
            pid,
            msg: msg.into(),
        }
    }

    pub fn system(context: &'static str, source: nix::Error) -> Self {
        TracerError::SystemError { context, source }
    }

    /// `true` for errors that are pid-local and do not corrupt the rest of
    /// the fleet's state machine.
    pub fn is_pid_local(&self) -> bool {
        matches!(
            self,
            TracerError::TraceeDied { .. } | TracerError::BadTrace { .. }
        )
    }
}
