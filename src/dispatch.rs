//! The event dispatcher: classifies every kernel notification and drives
//! the per-tracee state machine.
//!
//! Matches on `WaitStatus`, decoding `PTRACE_EVENT_*` out of the status
//! word's high byte, then routes to a fork/exec/exit/signal handler
//! keyed off the tracee's current state rather than any path-translation
//! concerns.

use std::collections::HashMap;

use log::{debug, warn};
use nix::sys::ptrace::Event;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitPidFlag;
use nix::unistd::Pid;

use crate::blocking::{BlockingCall, DispatchContext, WaitCall, WaitOutcome, WaitTarget};
use crate::errors::{Result, TracerError};
use crate::kernel::{KernelAdapter, Registers, WaitNotification};
use crate::registry::Registry;
use crate::tracee::{ExitStatus, Syscall, TraceeState};

/// The syscalls this core instruments; everything else is resumed
/// transparently at entry.
const SYS_WAIT: &[i64] = &[libc::SYS_wait4, libc::SYS_waitid];
const SYS_FORK: &[i64] = &[libc::SYS_fork, libc::SYS_vfork, libc::SYS_clone, libc::SYS_clone3];
const SYS_EXEC: &[i64] = &[libc::SYS_execve, libc::SYS_execveat];
const SYS_EXIT: &[i64] = &[libc::SYS_exit, libc::SYS_exit_group];

fn is_instrumented(sysno: i64) -> bool {
    SYS_WAIT.contains(&sysno) || SYS_FORK.contains(&sysno) || SYS_EXEC.contains(&sysno) || SYS_EXIT.contains(&sysno)
}

fn notification_pid(notification: &WaitNotification) -> Pid {
    use nix::sys::wait::WaitStatus::*;
    match *notification {
        Exited(pid, _) => pid,
        Signaled(pid, _, _) => pid,
        Stopped(pid, _) => pid,
        PtraceEvent(pid, _, _) => pid,
        PtraceSyscall(pid) => pid,
        Continued(pid) => pid,
        StillAlive => Pid::from_raw(-1),
    }
}

/// Decodes a `wait4`/`waitid` entry-stop's registers into the already-parsed
/// target/flags/output-pointer triple the blocking-call machinery expects.
/// Full argument marshalling belongs to the out-of-scope syscall-argument
/// decoder; this is the minimal amount the core itself needs to drive its
/// own wait-family emulation.
fn decode_wait_call(regs: &Registers) -> WaitCall {
    if regs.sysno == libc::SYS_waitid {
        let idtype = regs.args[0] as i32;
        let id = regs.args[1] as i32;
        let target = match idtype {
            1 => WaitTarget::Pid(Pid::from_raw(id)),
            2 => WaitTarget::ProcessGroup(Pid::from_raw(id)),
            _ => WaitTarget::AnyChild,
        };
        let flags = WaitPidFlag::from_bits_truncate(regs.args[3] as i32);
        WaitCall::prepare(regs.pid, target, flags, None)
    } else {
        let raw_pid = regs.args[0] as i64;
        let target = if raw_pid < -1 {
            WaitTarget::ProcessGroup(Pid::from_raw(-raw_pid as i32))
        } else if raw_pid == -1 || raw_pid == 0 {
            WaitTarget::AnyChild
        } else {
            WaitTarget::Pid(Pid::from_raw(raw_pid as i32))
        };
        let flags = WaitPidFlag::from_bits_truncate(regs.args[2] as i32);
        let status_addr = if regs.args[1] == 0 {
            None
        } else {
            Some(regs.args[1])
        };
        WaitCall::prepare(regs.pid, target, flags, status_addr)
    }
}

/// Owns the pending-child stash across `step` calls. Stateless otherwise:
/// all tracee-durable state lives in the registry.
#[derive(Debug, Default)]
pub struct Dispatcher {
    pending: HashMap<Pid, WaitNotification>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            pending: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn has_pending(&self, pid: Pid) -> bool {
        self.pending.contains_key(&pid)
    }

    /// Handles one kernel notification to completion: updates the registry,
    /// calls into the external `Process` collaborator, and resumes the
    /// tracee (or leaves it stopped awaiting a fleet-wide event).
    pub fn dispatch(
        &mut self,
        registry: &mut Registry,
        adapter: &dyn KernelAdapter,
        notification: WaitNotification,
    ) -> Result<()> {
        let pid = notification_pid(&notification);
        if !registry.contains(pid) {
            debug!("stashing notification for not-yet-registered pid {}", pid);
            self.pending.insert(pid, notification);
            return Ok(());
        }
        self.dispatch_known(registry, adapter, notification)
    }

    fn dispatch_known(
        &mut self,
        registry: &mut Registry,
        adapter: &dyn KernelAdapter,
        notification: WaitNotification,
    ) -> Result<()> {
        use nix::sys::wait::WaitStatus::*;
        match notification {
            Exited(pid, code) => self.reap(registry, adapter, pid, ReapReason::Exited(code)),
            Signaled(pid, signal, _) => self.reap(registry, adapter, pid, ReapReason::Signaled(signal)),
            Stopped(pid, signal) => self.handle_signal_stop(registry, adapter, pid, signal),
            PtraceEvent(pid, _signal, raw_event) => self.handle_ptrace_event(registry, adapter, pid, raw_event),
            PtraceSyscall(pid) => self.handle_syscall_stop(registry, adapter, pid),
            Continued(_) | StillAlive => Ok(()),
        }
    }

    // -- Death & cascade ------------------------------------------------

    fn reap(
        &mut self,
        registry: &mut Registry,
        adapter: &dyn KernelAdapter,
        pid: Pid,
        reason: ReapReason,
    ) -> Result<()> {
        let is_leader = registry.is_leader(pid);
        let leader_execed = registry.leader(pid).map(|l| l.execed).unwrap_or(true);
        {
            let tracee = registry
                .find_mut(pid)
                .ok_or_else(|| TracerError::bad_trace(pid, "death of an unregistered tracee"))?;
            tracee.state = TraceeState::Dead;
            tracee.blocking_call = None;
            match reason {
                ReapReason::Exited(code) => {
                    tracee.exit_status = Some(ExitStatus::Exited(code));
                    tracee.process.on_exit(code);
                }
                ReapReason::Signaled(signal) => {
                    tracee.exit_status = Some(ExitStatus::Signaled(signal));
                    tracee.process.on_killed(signal);
                }
            }
        }

        if is_leader {
            // Nothing in-fleet ever `wait`s on a leader (it has no traced
            // parent); its zombie was already consumed by the adapter's own
            // `waitpid`, so the registry entry is removed immediately
            // rather than waiting on a cascade that will never come.
            registry.remove(pid);
            if !leader_execed {
                return Err(TracerError::RuntimeError(format!(
                    "leader {} died before completing its initial exec",
                    pid
                )));
            }
            return Ok(());
        }

        self.cascade(registry, adapter)
    }

    /// Re-evaluates every tracee with an in-flight wait-family call after a
    /// state change that might satisfy it: re-invokes `finalise` the next
    /// time any of the caller's children changes state. Called both from
    /// `reap` (a child died via the ordinary event stream) and from the
    /// orphan reconciler (a child died via an external reaper).
    pub(crate) fn cascade(&mut self, registry: &mut Registry, adapter: &dyn KernelAdapter) -> Result<()> {
        let waiters: Vec<(Pid, WaitCall)> = registry
            .iter()
            .filter_map(|t| match &t.blocking_call {
                Some(BlockingCall::Wait(call)) => Some((t.pid, call.clone())),
                None => None,
            })
            .collect();

        for (waiter_pid, call) in waiters {
            let outcome = {
                let mut ctx = DispatchContext::new(registry, adapter);
                call.finalise(&mut ctx)?
            };
            if matches!(outcome, WaitOutcome::Reaped { .. } | WaitOutcome::Reported { .. }) {
                if let Some(tracee) = registry.find_mut(waiter_pid) {
                    tracee.blocking_call = None;
                    tracee.syscall = Syscall::NONE;
                    tracee.state = TraceeState::Running;
                    let signal = tracee.take_pending_signal();
                    adapter.resume_to_syscall(waiter_pid, signal)?;
                }
            }
        }
        Ok(())
    }

    // -- Signal-delivery-stop --------------------------------------------

    fn handle_signal_stop(
        &mut self,
        registry: &mut Registry,
        adapter: &dyn KernelAdapter,
        pid: Pid,
        signal: Signal,
    ) -> Result<()> {
        let tracee = registry
            .find_mut(pid)
            .ok_or_else(|| TracerError::bad_trace(pid, "signal stop for an unregistered tracee"))?;
        if tracee.is_dead() {
            return Err(TracerError::bad_trace(pid, "signal stop delivered to a dead tracee"));
        }
        tracee.state = TraceeState::Stopped;
        tracee.process.on_signal(signal);
        // Forwarded transparently: this core neither suppresses nor
        // rewrites signals (that policy belongs to an embedding layer, not
        // the core's event dispatcher).
        tracee.state = TraceeState::Running;
        adapter.resume_to_syscall(pid, Some(signal))
    }

    // -- Event-stops (fork/clone/exec/exit) ------------------------------

    fn handle_ptrace_event(
        &mut self,
        registry: &mut Registry,
        adapter: &dyn KernelAdapter,
        pid: Pid,
        raw_event: i32,
    ) -> Result<()> {
        if raw_event == Event::PTRACE_EVENT_FORK as i32
            || raw_event == Event::PTRACE_EVENT_VFORK as i32
            || raw_event == Event::PTRACE_EVENT_CLONE as i32
        {
            self.handle_fork(registry, adapter, pid)
        } else if raw_event == Event::PTRACE_EVENT_EXEC as i32 {
            self.handle_exec(registry, adapter, pid)
        } else if raw_event == Event::PTRACE_EVENT_VFORK_DONE as i32 {
            let tracee = registry
                .find_mut(pid)
                .ok_or_else(|| TracerError::bad_trace(pid, "vfork-done for an unregistered tracee"))?;
            tracee.state = TraceeState::Running;
            adapter.resume_to_syscall(pid, None)
        } else if raw_event == Event::PTRACE_EVENT_EXIT as i32 {
            // The tracee is about to die; the authoritative DEAD transition
            // happens on the `Exited`/`Signaled` notification that follows.
            adapter.resume_to_syscall(pid, None)
        } else {
            warn!("unrecognised ptrace event {} for pid {}", raw_event, pid);
            Err(TracerError::bad_trace(pid, format!("unrecognised ptrace event {}", raw_event)))
        }
    }

    fn handle_fork(&mut self, registry: &mut Registry, adapter: &dyn KernelAdapter, parent_pid: Pid) -> Result<()> {
        let child_pid = adapter.get_event_pid(parent_pid)?;
        let parent_process = registry
            .find(parent_pid)
            .ok_or_else(|| TracerError::bad_trace(parent_pid, "fork event for an unregistered parent"))?
            .process
            .clone();

        let child_process = parent_process.spawn_child(child_pid);
        registry.add(child_pid, child_process.clone())?;
        parent_process.on_fork(child_process);

        let parent = registry.find_mut(parent_pid).expect("just looked up above");
        parent.state = TraceeState::Running;
        let signal = parent.take_pending_signal();
        adapter.resume_to_syscall(parent_pid, signal)?;

        if let Some(stashed) = self.pending.remove(&child_pid) {
            debug!("re-delivering stashed notification for newly forked pid {}", child_pid);
            self.dispatch_known(registry, adapter, stashed)?;
        }
        Ok(())
    }

    fn handle_exec(&mut self, registry: &mut Registry, adapter: &dyn KernelAdapter, pid: Pid) -> Result<()> {
        let (argv, process) = {
            let tracee = registry
                .find_mut(pid)
                .ok_or_else(|| TracerError::bad_trace(pid, "exec event for an unregistered tracee"))?;
            (tracee.pending_exec_argv.take().unwrap_or_default(), tracee.process.clone())
        };
        if registry.is_leader(pid) {
            if let Some(leader) = registry.leader_mut(pid) {
                leader.execed = true;
            }
        }
        process.on_exec(&argv);

        let tracee = registry.find_mut(pid).expect("just looked up above");
        tracee.state = TraceeState::Running;
        let signal = tracee.take_pending_signal();
        adapter.resume_to_syscall(pid, signal)
    }

    // -- Syscall entry/exit toggle ----------------------------------------

    fn handle_syscall_stop(&mut self, registry: &mut Registry, adapter: &dyn KernelAdapter, pid: Pid) -> Result<()> {
        let entering = {
            let tracee = registry
                .find(pid)
                .ok_or_else(|| TracerError::bad_trace(pid, "syscall stop for an unregistered tracee"))?;
            if tracee.is_dead() {
                return Err(TracerError::bad_trace(pid, "syscall stop delivered to a dead tracee"));
            }
            tracee.syscall.is_none()
        };
        if entering {
            self.handle_syscall_entry(registry, adapter, pid)
        } else {
            self.handle_syscall_exit(registry, adapter, pid)
        }
    }

    fn handle_syscall_entry(&mut self, registry: &mut Registry, adapter: &dyn KernelAdapter, pid: Pid) -> Result<()> {
        let regs = adapter.read_regs(pid)?;

        if !is_instrumented(regs.sysno) {
            let tracee = registry.find_mut(pid).expect("checked present in handle_syscall_stop");
            tracee.state = TraceeState::Running;
            let signal = tracee.take_pending_signal();
            return adapter.resume_to_syscall(pid, signal);
        }

        let tracee = registry.find_mut(pid).expect("checked present in handle_syscall_stop");
        tracee.syscall = Syscall::of(regs.sysno);

        if SYS_EXEC.contains(&regs.sysno) {
            let argv = adapter.read_cstring_array(pid, regs.args[1])?;
            registry.find_mut(pid).expect("just mutated above").pending_exec_argv = Some(argv);
            let tracee = registry.find_mut(pid).unwrap();
            tracee.state = TraceeState::Running;
            let signal = tracee.take_pending_signal();
            return adapter.resume_to_syscall(pid, signal);
        }

        if SYS_WAIT.contains(&regs.sysno) {
            let call = decode_wait_call(&regs);
            let outcome = {
                let mut ctx = DispatchContext::new(registry, adapter);
                call.finalise(&mut ctx)?
            };
            let tracee = registry.find_mut(pid).unwrap();
            match outcome {
                WaitOutcome::Pending => {
                    tracee.blocking_call = Some(BlockingCall::Wait(call));
                    tracee.state = TraceeState::Stopped;
                    Ok(())
                }
                WaitOutcome::Reaped { .. } | WaitOutcome::Reported { .. } | WaitOutcome::WouldBlock => {
                    tracee.state = TraceeState::Running;
                    let signal = tracee.take_pending_signal();
                    adapter.resume_to_syscall(pid, signal)
                }
            }
        } else {
            // fork/clone/exit family: let the kernel run the syscall; the
            // authoritative transition happens on the event-stop or the
            // death notification that follows, not here.
            let tracee = registry.find_mut(pid).unwrap();
            tracee.state = TraceeState::Running;
            let signal = tracee.take_pending_signal();
            adapter.resume_to_syscall(pid, signal)
        }
    }

    fn handle_syscall_exit(&mut self, registry: &mut Registry, adapter: &dyn KernelAdapter, pid: Pid) -> Result<()> {
        let tracee = registry.find_mut(pid).expect("checked present in handle_syscall_stop");
        tracee.syscall = Syscall::NONE;
        if let Some(call) = tracee.blocking_call.take() {
            let outcome = {
                let mut ctx = DispatchContext::new(registry, adapter);
                call.finalise(&mut ctx)?
            };
            debug!("blocking call for {} resolved at syscall-exit: {:?}", pid, outcome);
        }
        let tracee = registry.find_mut(pid).unwrap();
        tracee.state = TraceeState::Running;
        let signal = tracee.take_pending_signal();
        adapter.resume_to_syscall(pid, signal)
    }
}

#[derive(Debug, Clone, Copy)]
enum ReapReason {
    Exited(i32),
    Signaled(Signal),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::MockAdapter;
    use crate::process_model::tests::RecordingProcess;
    use nix::sys::wait::WaitStatus;
    use std::sync::Arc;

    fn pid(n: i32) -> Pid {
        Pid::from_raw(n)
    }

    fn recording() -> Arc<dyn crate::process_model::Process> {
        Arc::new(RecordingProcess::default())
    }

    #[test]
    fn unknown_pid_is_stashed_not_dispatched() {
        let mut registry = Registry::new();
        let adapter = MockAdapter::new();
        let mut dispatcher = Dispatcher::new();

        dispatcher
            .dispatch(&mut registry, &adapter, WaitStatus::Stopped(pid(99), Signal::SIGTRAP))
            .unwrap();

        assert!(dispatcher.has_pending(pid(99)));
        assert!(!registry.contains(pid(99)));
    }

    #[test]
    fn leader_exit_is_removed_and_reported() {
        let mut registry = Registry::new();
        let process = Arc::new(RecordingProcess::default());
        registry.add(pid(1), process.clone()).unwrap();
        registry.register_leader(pid(1));
        registry.leader_mut(pid(1)).unwrap().execed = true;

        let adapter = MockAdapter::new();
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .dispatch(&mut registry, &adapter, WaitStatus::Exited(pid(1), 0))
            .unwrap();

        assert!(!registry.contains(pid(1)));
        assert_eq!(process.exits.lock().as_slice(), &[0]);
    }

    #[test]
    fn leader_exit_before_exec_surfaces_runtime_error() {
        let mut registry = Registry::new();
        registry.add(pid(1), recording()).unwrap();
        registry.register_leader(pid(1));

        let adapter = MockAdapter::new();
        let mut dispatcher = Dispatcher::new();
        let err = dispatcher
            .dispatch(&mut registry, &adapter, WaitStatus::Exited(pid(1), 127))
            .unwrap_err();

        assert!(matches!(err, TracerError::RuntimeError(_)));
        assert!(!registry.contains(pid(1)));
    }

    #[test]
    fn signal_stop_for_dead_tracee_is_bad_trace() {
        let mut registry = Registry::new();
        registry.add(pid(1), recording()).unwrap();
        registry.find_mut(pid(1)).unwrap().state = TraceeState::Dead;

        let adapter = MockAdapter::new();
        let mut dispatcher = Dispatcher::new();
        let err = dispatcher
            .dispatch(&mut registry, &adapter, WaitStatus::Stopped(pid(1), Signal::SIGTRAP))
            .unwrap_err();
        assert!(matches!(err, TracerError::BadTrace { .. }));
    }

    #[test]
    fn fork_event_creates_child_and_replays_stashed_notification() {
        let mut registry = Registry::new();
        let parent_process = Arc::new(RecordingProcess::default());
        registry.add(pid(1), parent_process.clone()).unwrap();

        let adapter = MockAdapter::new();
        adapter.set_event_pid(pid(1), pid(2));
        let mut dispatcher = Dispatcher::new();

        // The child's first stop races ahead of the parent's fork event.
        dispatcher
            .dispatch(&mut registry, &adapter, WaitStatus::Stopped(pid(2), Signal::SIGSTOP))
            .unwrap();
        assert!(dispatcher.has_pending(pid(2)));

        dispatcher
            .dispatch(
                &mut registry,
                &adapter,
                WaitStatus::PtraceEvent(pid(1), Signal::SIGTRAP, Event::PTRACE_EVENT_FORK as i32),
            )
            .unwrap();

        assert_eq!(parent_process.forks.lock().len(), 1);
        assert!(registry.contains(pid(2)));
        assert!(!dispatcher.has_pending(pid(2)));
    }

    #[test]
    fn cascaded_reap_reports_the_childs_real_exit_code() {
        use crate::blocking::{BlockingCall, WaitTarget};
        use nix::sys::wait::WaitPidFlag;

        let mut registry = Registry::new();
        registry.add(pid(1), recording()).unwrap();
        registry.add(pid(2), recording()).unwrap();
        let status_addr = 0x4000u64;
        registry.find_mut(pid(1)).unwrap().blocking_call = Some(BlockingCall::prepare_wait(
            pid(1),
            WaitTarget::AnyChild,
            WaitPidFlag::empty(),
            Some(status_addr),
        ));
        registry.find_mut(pid(1)).unwrap().state = TraceeState::Stopped;
        registry.find_mut(pid(1)).unwrap().syscall = Syscall::of(libc::SYS_wait4);

        let adapter = MockAdapter::new();
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .dispatch(&mut registry, &adapter, WaitStatus::Exited(pid(2), 42))
            .unwrap();

        let written = adapter.written();
        let (_, addr, bytes) = written.last().expect("status word written to parent");
        assert_eq!(*addr, status_addr);
        let status = i32::from_ne_bytes(bytes.as_slice().try_into().unwrap());
        assert_eq!((status >> 8) & 0xff, 42);
        assert_eq!(status & 0x7f, 0);
    }
}
