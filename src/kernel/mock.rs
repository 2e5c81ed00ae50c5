//! `MockAdapter`: an in-memory `KernelAdapter` double used by the dispatcher,
//! blocking-call, and facade unit tests so the state-machine logic can be
//! exercised without real `ptrace` privileges.

use std::collections::{HashMap, VecDeque};

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use parking_lot::Mutex;

use crate::errors::{Result, TracerError};
use crate::kernel::adapter::{KernelAdapter, WaitNotification};
use crate::kernel::regs::Registers;

#[derive(Debug, Default)]
struct State {
    notifications: VecDeque<WaitNotification>,
    regs: HashMap<Pid, Registers>,
    cstrings: HashMap<(Pid, u64), Vec<u8>>,
    cstring_arrays: HashMap<(Pid, u64), Vec<Vec<u8>>>,
    event_pids: HashMap<Pid, Pid>,
    written: Vec<(Pid, u64, Vec<u8>)>,
    killed: Vec<Pid>,
    detached: Vec<Pid>,
    attached: Vec<Pid>,
    resumes: Vec<(Pid, &'static str, Option<Signal>)>,
}

/// A scriptable `KernelAdapter`: the test queues up notifications with
/// [`MockAdapter::push_notification`] and pre-seeds register/memory reads,
/// then hands the adapter to a `Dispatcher` exactly like `PtraceAdapter`
/// would be.
#[derive(Debug, Default)]
pub struct MockAdapter {
    state: Mutex<State>,
}

impl MockAdapter {
    pub fn new() -> Self {
        MockAdapter {
            state: Mutex::new(State::default()),
        }
    }

    pub fn push_notification(&self, notification: WaitNotification) {
        self.state.lock().notifications.push_back(notification);
    }

    pub fn set_regs(&self, pid: Pid, regs: Registers) {
        self.state.lock().regs.insert(pid, regs);
    }

    pub fn set_cstring(&self, pid: Pid, addr: u64, value: impl Into<Vec<u8>>) {
        self.state.lock().cstrings.insert((pid, addr), value.into());
    }

    pub fn set_cstring_array(&self, pid: Pid, addr: u64, value: Vec<Vec<u8>>) {
        self.state
            .lock()
            .cstring_arrays
            .insert((pid, addr), value);
    }

    pub fn set_event_pid(&self, pid: Pid, child: Pid) {
        self.state.lock().event_pids.insert(pid, child);
    }

    pub fn written(&self) -> Vec<(Pid, u64, Vec<u8>)> {
        self.state.lock().written.clone()
    }

    pub fn killed(&self) -> Vec<Pid> {
        self.state.lock().killed.clone()
    }

    pub fn resumes(&self) -> Vec<(Pid, &'static str, Option<Signal>)> {
        self.state.lock().resumes.clone()
    }
}

impl KernelAdapter for MockAdapter {
    fn attach(&self, pid: Pid) -> Result<()> {
        self.state.lock().attached.push(pid);
        Ok(())
    }

    fn wait(&self) -> Result<WaitNotification> {
        self.state
            .lock()
            .notifications
            .pop_front()
            .ok_or_else(|| TracerError::RuntimeError("MockAdapter: no notification queued".into()))
    }

    fn resume_continue(&self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        self.state.lock().resumes.push((pid, "continue", signal));
        Ok(())
    }

    fn resume_to_syscall(&self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        self.state.lock().resumes.push((pid, "syscall", signal));
        Ok(())
    }

    fn resume_singlestep(&self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        self.state.lock().resumes.push((pid, "singlestep", signal));
        Ok(())
    }

    fn read_regs(&self, pid: Pid) -> Result<Registers> {
        self.state
            .lock()
            .regs
            .get(&pid)
            .copied()
            .ok_or(TracerError::TraceeDied { pid })
    }

    fn read_cstring(&self, pid: Pid, addr: u64) -> Result<Vec<u8>> {
        Ok(self
            .state
            .lock()
            .cstrings
            .get(&(pid, addr))
            .cloned()
            .unwrap_or_default())
    }

    fn read_cstring_array(&self, pid: Pid, addr: u64) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .state
            .lock()
            .cstring_arrays
            .get(&(pid, addr))
            .cloned()
            .unwrap_or_default())
    }

    fn write_words(&self, pid: Pid, addr: u64, data: &[u8]) -> Result<()> {
        self.state.lock().written.push((pid, addr, data.to_vec()));
        Ok(())
    }

    fn get_event_pid(&self, pid: Pid) -> Result<Pid> {
        self.state
            .lock()
            .event_pids
            .get(&pid)
            .copied()
            .ok_or_else(|| TracerError::RuntimeError(format!("no event pid staged for {}", pid)))
    }

    fn detach(&self, pid: Pid) -> Result<()> {
        self.state.lock().detached.push(pid);
        Ok(())
    }

    fn kill(&self, pid: Pid) -> Result<()> {
        self.state.lock().killed.push(pid);
        Ok(())
    }
}
