//! The `Process` trait: the external process-tree collaborator.
//!
//! This core never implements the tree itself — the tree, its parent/child
//! edges, and any rendering on top of it are owned by the embedding
//! application. This module only defines the narrow, outbound-only
//! interface the dispatcher calls into.

use std::fmt::Debug;
use std::sync::Arc;

use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// Outbound calls the tracer core makes into the (external) process-tree
/// model. Object-safe and `Arc`-shared because a tracee's `Process` handle
/// is also referenced by the tree's own parent/child edges.
pub trait Process: Debug + Send + Sync {
    /// Allocates the tree node for a newly forked/cloned child of this
    /// process, so the dispatcher can register it before announcing the
    /// fork. Node construction is the tree model's own concern — this
    /// core only ever asks for one.
    fn spawn_child(&self, child_pid: Pid) -> Arc<dyn Process>;

    /// A fork/clone event fired on this process's tracee; `child` is the
    /// already-constructed node for the new pid.
    fn on_fork(&self, child: Arc<dyn Process>);

    /// The tracee successfully exec'd `argv[0]` with the given arguments.
    fn on_exec(&self, argv: &[Vec<u8>]);

    /// Post-exec entry point or loaded-library event.
    fn on_new_location(&self, addr: u64, file: &str, symbol: &str);

    /// The tracee was reaped after a normal exit.
    fn on_exit(&self, status: i32);

    /// The tracee was reaped after being killed by a signal.
    fn on_killed(&self, signal: Signal);

    /// The tracee received a non-fatal signal-delivery-stop.
    fn on_signal(&self, signal: Signal);
}

/// A `Process` that also knows its own pid, used internally so the tracer
/// can log against a stable identity without depending on the tree's own
/// bookkeeping.
pub trait NamedProcess: Process {
    fn pid(&self) -> Pid;
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// A `Process` recorder used by the test suite in place of the real
    /// (out-of-scope) process-tree model.
    #[derive(Debug, Default)]
    pub struct RecordingProcess {
        pub forks: Mutex<Vec<()>>,
        pub execs: Mutex<Vec<Vec<Vec<u8>>>>,
        pub exits: Mutex<Vec<i32>>,
        pub killed: Mutex<Vec<Signal>>,
        pub signals: Mutex<Vec<Signal>>,
    }

    impl Process for RecordingProcess {
        fn spawn_child(&self, _child_pid: Pid) -> Arc<dyn Process> {
            Arc::new(RecordingProcess::default())
        }

        fn on_fork(&self, _child: Arc<dyn Process>) {
            self.forks.lock().push(());
        }

        fn on_exec(&self, argv: &[Vec<u8>]) {
            self.execs.lock().push(argv.to_vec());
        }

        fn on_new_location(&self, _addr: u64, _file: &str, _symbol: &str) {}

        fn on_exit(&self, status: i32) {
            self.exits.lock().push(status);
        }

        fn on_killed(&self, signal: Signal) {
            self.killed.lock().push(signal);
        }

        fn on_signal(&self, signal: Signal) {
            self.signals.lock().push(signal);
        }
    }
}
