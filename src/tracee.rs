//! Per-pid tracee record and the tiny leader record.

use std::sync::Arc;

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::blocking::BlockingCall;
use crate::process_model::Process;

/// How a reaped tracee finished, recorded for any parent blocked on a
/// wait-family call targeting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(Signal),
}

/// A syscall number, or the "none" sentinel meaning "not currently between
/// an entry-stop and an exit-stop".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Syscall(Option<i64>);

impl Syscall {
    pub const NONE: Syscall = Syscall(None);

    pub fn of(sysno: i64) -> Self {
        Syscall(Some(sysno))
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    pub fn get(&self) -> Option<i64> {
        self.0
    }
}

impl Default for Syscall {
    fn default() -> Self {
        Syscall::NONE
    }
}

/// Lifecycle state of a tracee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceeState {
    Running,
    Stopped,
    Dead,
}

/// One record per live or zombie pid in the fleet.
///
/// Tracks the dispatcher-facing state machine (state, syscall-in-flight,
/// pending signal, blocking call), not any path-translation bookkeeping.
#[derive(Debug)]
pub struct Tracee {
    pub pid: Pid,
    pub state: TraceeState,
    /// Non-sentinel only while stopped at an entry- or exit-stop.
    pub syscall: Syscall,
    /// Signal number to inject on next resume, or `None`. Cleared on resume.
    pub pending_signal: Option<nix::sys::signal::Signal>,
    /// Shared handle on the external `Process` tree node.
    pub process: Arc<dyn Process>,
    /// In-flight blocking call, if the tracee is stopped at the entry of one.
    pub blocking_call: Option<BlockingCall>,
    /// `argv` captured at an `execve`/`execveat` entry-stop, while the old
    /// address space is still mapped; consumed once the matching
    /// `PTRACE_EVENT_EXEC` event-stop arrives (the new image's memory no
    /// longer holds the original argument strings by then).
    pub pending_exec_argv: Option<Vec<Vec<u8>>>,
    /// How this tracee finished, set the moment it transitions to DEAD.
    /// A waiting parent's `wait4`/`waitid` reads this instead of a
    /// fabricated status.
    pub exit_status: Option<ExitStatus>,
}

impl Tracee {
    /// A freshly `fork`ed/attached tracee always starts STOPPED: the kernel
    /// stops a new tracee before its first resume.
    pub fn new(pid: Pid, process: Arc<dyn Process>) -> Self {
        Tracee {
            pid,
            state: TraceeState::Stopped,
            syscall: Syscall::NONE,
            pending_signal: None,
            process,
            blocking_call: None,
            pending_exec_argv: None,
            exit_status: None,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.state == TraceeState::Dead
    }

    pub fn is_running(&self) -> bool {
        self.state == TraceeState::Running
    }

    pub fn is_stopped(&self) -> bool {
        self.state == TraceeState::Stopped
    }

    /// Clears the pending signal, returning whatever was pending so the
    /// caller can inject it into the next resume call.
    pub fn take_pending_signal(&mut self) -> Option<nix::sys::signal::Signal> {
        self.pending_signal.take()
    }

    /// Checks that `blocking_call` set implies a non-sentinel syscall and
    /// a STOPPED state. Used by tests and by debug assertions at
    /// transition points.
    pub fn upholds_blocking_call_invariant(&self) -> bool {
        match &self.blocking_call {
            Some(_) => !self.syscall.is_none() && self.is_stopped(),
            None => true,
        }
    }
}

/// One record per top-level traced process.
#[derive(Debug, Clone, Copy)]
pub struct Leader {
    /// `true` once the initial `exec` event has fired for this leader.
    pub execed: bool,
}

impl Leader {
    pub fn new() -> Self {
        Leader { execed: false }
    }
}

impl Default for Leader {
    fn default() -> Self {
        Self::new()
    }
}
