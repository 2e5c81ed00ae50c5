//! The tracer facade: the crate's public, thread-safe entry points.
//!
//! The fork/traceme/execvp launch sequence and the step loop shape here
//! follow the same pattern as any ptrace-based supervisor loop, split
//! across a dispatcher/registry/orphan-reconciler instead of one
//! monolithic event handler, with a locking discipline that keeps the
//! kernel adapter outside any lock the facade holds.

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvp, fork, getpid, ForkResult, Pid};
use parking_lot::Mutex;

use crate::dispatch::Dispatcher;
use crate::errors::{Result, TracerError};
use crate::kernel::{KernelAdapter, PtraceAdapter};
use crate::orphan::OrphanReconciler;
use crate::process_model::Process;
use crate::registry::Registry;

struct FacadeState {
    registry: Registry,
    dispatcher: Dispatcher,
    orphans: OrphanReconciler,
}

/// The public tracer. Cheap to share: every public operation takes `&self`
/// and does its own internal locking, so a `Tracer` is typically held
/// behind an `Arc` and handed to a reaper thread and a signal handler
/// alongside the main stepping thread.
pub struct Tracer {
    adapter: Arc<dyn KernelAdapter + Send + Sync>,
    /// The heavy lock: registry, leaders, recycled-PID log, dispatcher
    /// state. Held for the duration of `step`, including its blocking
    /// wait — nothing else needs it while a step is in flight.
    state: Mutex<FacadeState>,
    /// Lock-free producer handle for `notify_orphan`; reads happen only
    /// inside `step`, via the matching receiver owned by `state.orphans`.
    orphan_tx: crossbeam_channel::Sender<Pid>,
    /// Flipped by `nuke`; consulted at the top of every `step` iteration.
    kill_flag: AtomicBool,
    /// A best-effort mirror of the registry's pid set, refreshed once per
    /// `step` call, so `nuke` can fan out `SIGKILL` without contending for
    /// the heavy lock.
    live_pids: Mutex<Vec<Pid>>,
}

impl Tracer {
    /// A tracer backed by the real kernel.
    pub fn new() -> Self {
        Self::with_adapter(PtraceAdapter::new())
    }

    /// A tracer backed by a caller-supplied `KernelAdapter`, primarily for
    /// tests that want to drive the dispatcher against a `MockAdapter`
    /// instead of real `ptrace`.
    pub fn with_adapter(adapter: impl KernelAdapter + Send + Sync + 'static) -> Self {
        let orphans = OrphanReconciler::new();
        let orphan_tx = orphans.sender();
        Tracer {
            adapter: Arc::new(adapter),
            state: Mutex::new(FacadeState {
                registry: Registry::new(),
                dispatcher: Dispatcher::new(),
                orphans,
            }),
            orphan_tx,
            kill_flag: AtomicBool::new(false),
            live_pids: Mutex::new(Vec::new()),
        }
    }

    /// Launches a new leader: forks, has the child mark itself traceable
    /// and `exec`, attaches from the parent side, and registers it as both
    /// a tracee and a leader.
    pub fn start(&self, path: &str, argv: &[String], process: Arc<dyn Process>) -> Result<Arc<dyn Process>> {
        let program = CString::new(path)
            .map_err(|_| TracerError::RuntimeError(format!("path {:?} contains an interior NUL", path)))?;
        let mut args = Vec::with_capacity(argv.len() + 1);
        args.push(program.clone());
        for arg in argv {
            args.push(
                CString::new(arg.as_str())
                    .map_err(|_| TracerError::RuntimeError(format!("argument {:?} contains an interior NUL", arg)))?,
            );
        }

        // Safety: the child performs only async-signal-safe calls
        // (`ptrace::traceme`, `kill`, `execvp`) before either exec'ing or
        // exiting; it never returns into the rest of this function.
        match unsafe { fork() }.map_err(|e| TracerError::system("fork", e))? {
            ForkResult::Child => {
                // Stop immediately so the parent can safely call
                // `PTRACE_SETOPTIONS` (which requires the tracee to
                // already be stopped) before the child reaches `execvp`.
                if ptrace::traceme().is_err() || kill(getpid(), Signal::SIGSTOP).is_err() {
                    std::process::exit(127);
                }
                let _ = execvp(&program, &args);
                std::process::exit(127);
            }
            ForkResult::Parent { child } => {
                self.wait_for_launch_stop(child)?;
                self.adapter.attach(child)?;
                // PTRACE_SYSCALL, not PTRACE_CONT: the leader's very first
                // `execve` needs to stop at syscall-entry so its argv is
                // captured before the exec event fires.
                self.adapter.resume_to_syscall(child, None)?;

                let mut state = self.state.lock();
                state.registry.add(child, process.clone())?;
                state.registry.register_leader(child);
                self.sync_live_pids(&state.registry);
                Ok(process)
            }
        }
    }

    fn wait_for_launch_stop(&self, child: Pid) -> Result<()> {
        loop {
            match waitpid(child, None) {
                Ok(WaitStatus::Stopped(pid, Signal::SIGSTOP)) if pid == child => return Ok(()),
                Ok(_) => continue,
                Err(nix::Error::EINTR) => continue,
                Err(e) => return Err(TracerError::system("waitpid for launch synchronisation", e)),
            }
        }
    }

    /// Advances the fleet by one kernel notification, returning `true` iff
    /// any tracee remains afterwards.
    pub fn step(&self) -> Result<bool> {
        let mut state = self.state.lock();

        {
            let FacadeState { registry, dispatcher, orphans } = &mut *state;
            orphans.reconcile(registry, dispatcher, self.adapter.as_ref())?;
        }
        self.sync_live_pids(&state.registry);

        if state.registry.leaders_drained() {
            return Ok(false);
        }
        if self.kill_flag.load(Ordering::SeqCst) && state.registry.is_empty() {
            return Ok(false);
        }

        let notification = self.adapter.wait()?;
        let FacadeState { registry, dispatcher, .. } = &mut *state;
        let outcome = dispatcher.dispatch(registry, self.adapter.as_ref(), notification);
        self.sync_live_pids(registry);

        match outcome {
            Ok(()) => {}
            Err(err) if err.is_pid_local() => {
                warn!("dropping pid-local trace error: {}", err);
            }
            Err(err) => return Err(err),
        }

        Ok(!state.registry.leaders_drained())
    }

    /// Enqueues an orphan notification. Safe from any thread, never blocks
    /// on the facade lock — a signal handler or reaper thread may call this
    /// with the heavy lock already held by the main step loop.
    pub fn notify_orphan(&self, pid: Pid) {
        if self.orphan_tx.send(pid).is_err() {
            warn!("orphan queue receiver is gone; dropping notification for {}", pid);
        }
    }

    /// Best-effort force-kill of every known tracee. Safe from any thread;
    /// never takes the heavy facade lock.
    pub fn nuke(&self) {
        self.kill_flag.store(true, Ordering::SeqCst);
        let pids = self.live_pids.lock().clone();
        for pid in pids {
            match self.adapter.kill(pid) {
                Ok(()) | Err(TracerError::TraceeDied { .. }) => {}
                Err(err) => warn!("nuke: failed to signal {}: {}", pid, err),
            }
        }
    }

    /// Writes a read-only snapshot of tracees and leaders to the diagnostic
    /// sink.
    pub fn print_list(&self) {
        let state = self.state.lock();
        info!("tracer fleet: {} tracee(s)", state.registry.len());
        for tracee in state.registry.iter() {
            info!(
                "  pid={} state={:?} leader={}",
                tracee.pid,
                tracee.state,
                state.registry.is_leader(tracee.pid)
            );
        }
    }

    fn sync_live_pids(&self, registry: &Registry) {
        *self.live_pids.lock() = registry.iter().map(|t| t.pid).collect();
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        self.nuke();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::MockAdapter;

    fn pid(n: i32) -> Pid {
        Pid::from_raw(n)
    }

    #[test]
    fn step_on_empty_fleet_returns_false() {
        let tracer = Tracer::with_adapter(MockAdapter::new());
        assert!(!tracer.step().unwrap());
    }

    #[test]
    fn nuke_signals_every_live_pid() {
        let adapter = MockAdapter::new();
        let tracer = Tracer::with_adapter(adapter);
        // Drive a fake tracee into the live_pids mirror via a round of step()
        // would require a real fork; exercise nuke's fan-out directly
        // against an empty fleet instead, and assert it never panics.
        tracer.nuke();
    }

    #[test]
    fn notify_orphan_is_non_blocking_and_processed_on_next_step() {
        let adapter = MockAdapter::new();
        let tracer = Tracer::with_adapter(adapter);
        tracer.notify_orphan(pid(123));
        // An orphan notification for a pid we never saw alive is dropped
        // silently by the reconciler; step should not error.
        assert!(!tracer.step().unwrap());
    }

    #[test]
    fn drop_runs_nuke_without_panicking() {
        let adapter = MockAdapter::new();
        let tracer = Tracer::with_adapter(adapter);
        drop(tracer);
    }
}
