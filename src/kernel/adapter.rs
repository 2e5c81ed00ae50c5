//! `KernelAdapter`: the trait seam isolating every real `ptrace` call
//! behind a single interface, plus its real-kernel implementation
//! `PtraceAdapter`.

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;

use crate::errors::{Result, TracerError};
use crate::kernel::mem;
use crate::kernel::regs::Registers;

/// A raw kernel notification. `nix::sys::wait::WaitStatus` already has
/// exactly the shape the event dispatcher needs to classify; wrapping it
/// would only add a translation step both the real adapter and the mock
/// adapter would have to agree on, so it's reused directly.
pub type WaitNotification = nix::sys::wait::WaitStatus;

/// The ptrace options requested once at attach time.
fn attach_options() -> ptrace::Options {
    ptrace::Options::PTRACE_O_TRACESYSGOOD
        | ptrace::Options::PTRACE_O_TRACEFORK
        | ptrace::Options::PTRACE_O_TRACEVFORK
        | ptrace::Options::PTRACE_O_TRACEVFORKDONE
        | ptrace::Options::PTRACE_O_TRACECLONE
        | ptrace::Options::PTRACE_O_TRACEEXEC
        | ptrace::Options::PTRACE_O_TRACEEXIT
        | ptrace::Options::PTRACE_O_EXITKILL
}

/// The longest string this core will read out of a tracee before giving up
/// (guards against a corrupt/adversarial tracee with no NUL terminator).
const MAX_CSTRING_LEN: usize = 4096;
const MAX_ARGV_ENTRIES: usize = 4096;

/// The narrow interface the blocking-call machinery and the event
/// dispatcher see into the kernel. Exactly one production implementation
/// (`PtraceAdapter`) and one test double (`MockAdapter`, behind
/// `#[cfg(test)]`) exist; no other type may call into `nix::sys::ptrace`
/// directly.
pub trait KernelAdapter {
    /// Requests the ambient option set for a newly-attached pid.
    fn attach(&self, pid: Pid) -> Result<()>;

    /// Blocks for the next notification from any tracee (`waitpid(-1, ...)`).
    fn wait(&self) -> Result<WaitNotification>;

    /// Resumes without re-entering the exit stage (`PTRACE_CONT`).
    fn resume_continue(&self, pid: Pid, signal: Option<Signal>) -> Result<()>;

    /// Resumes to the next syscall-stop (`PTRACE_SYSCALL`).
    fn resume_to_syscall(&self, pid: Pid, signal: Option<Signal>) -> Result<()>;

    /// Resumes for exactly one instruction (`PTRACE_SINGLESTEP`).
    fn resume_singlestep(&self, pid: Pid, signal: Option<Signal>) -> Result<()>;

    /// Reads the general-purpose register file.
    fn read_regs(&self, pid: Pid) -> Result<Registers>;

    /// Reads a NUL-terminated string out of the tracee's address space.
    fn read_cstring(&self, pid: Pid, addr: u64) -> Result<Vec<u8>>;

    /// Reads a NULL-pointer-terminated array of strings (e.g. `argv`).
    fn read_cstring_array(&self, pid: Pid, addr: u64) -> Result<Vec<Vec<u8>>>;

    /// Writes raw bytes into the tracee's address space (used by
    /// `BlockingCall::finalise` to poke `wait4`/`waitid` output buffers).
    fn write_words(&self, pid: Pid, addr: u64, data: &[u8]) -> Result<()>;

    /// `PTRACE_GETEVENTMSG` after a fork/clone/vfork event-stop: the new
    /// child's pid.
    fn get_event_pid(&self, pid: Pid) -> Result<Pid>;

    fn detach(&self, pid: Pid) -> Result<()>;

    fn kill(&self, pid: Pid) -> Result<()>;
}

/// Classifies a `nix::Error`: `ESRCH` means the tracee is already gone
/// (the caller should treat this as a death, not propagate it as a hard
/// failure); everything else is fatal and propagates as `SystemError`.
fn classify(pid: Pid, context: &'static str, err: nix::Error) -> TracerError {
    if err == nix::Error::ESRCH {
        TracerError::TraceeDied { pid }
    } else {
        TracerError::system(context, err)
    }
}

/// The real-kernel `KernelAdapter`, backed by `nix::sys::ptrace` and
/// `nix::sys::wait`.
#[derive(Debug, Default)]
pub struct PtraceAdapter;

impl PtraceAdapter {
    pub fn new() -> Self {
        PtraceAdapter
    }
}

impl KernelAdapter for PtraceAdapter {
    fn attach(&self, pid: Pid) -> Result<()> {
        ptrace::setoptions(pid, attach_options()).map_err(|e| classify(pid, "ptrace setoptions", e))
    }

    fn wait(&self) -> Result<WaitNotification> {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
                Ok(status) => return Ok(status),
                Err(nix::Error::EINTR) => continue,
                Err(e) => return Err(TracerError::system("waitpid", e)),
            }
        }
    }

    fn resume_continue(&self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        ptrace::cont(pid, signal).map_err(|e| classify(pid, "ptrace cont", e))
    }

    fn resume_to_syscall(&self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        ptrace::syscall(pid, signal).map_err(|e| classify(pid, "ptrace syscall", e))
    }

    fn resume_singlestep(&self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        ptrace::step(pid, signal).map_err(|e| classify(pid, "ptrace singlestep", e))
    }

    // Other architectures' register layouts are out of scope; this core
    // targets linux/x86_64 only.
    fn read_regs(&self, pid: Pid) -> Result<Registers> {
        let raw = ptrace::getregs(pid).map_err(|e| classify(pid, "ptrace getregs", e))?;
        Ok(Registers::from_raw(pid, raw))
    }

    fn read_cstring(&self, pid: Pid, addr: u64) -> Result<Vec<u8>> {
        mem::read_cstring(pid, addr as usize, MAX_CSTRING_LEN)
    }

    fn read_cstring_array(&self, pid: Pid, addr: u64) -> Result<Vec<Vec<u8>>> {
        mem::read_cstring_array(pid, addr as usize, MAX_ARGV_ENTRIES, MAX_CSTRING_LEN)
    }

    fn write_words(&self, pid: Pid, addr: u64, data: &[u8]) -> Result<()> {
        mem::write_words(pid, addr as usize, data)
    }

    fn get_event_pid(&self, pid: Pid) -> Result<Pid> {
        let raw = ptrace::getevent(pid).map_err(|e| classify(pid, "ptrace geteventmsg", e))?;
        Ok(Pid::from_raw(raw as i32))
    }

    fn detach(&self, pid: Pid) -> Result<()> {
        ptrace::detach(pid, None).map_err(|e| classify(pid, "ptrace detach", e))
    }

    fn kill(&self, pid: Pid) -> Result<()> {
        nix::sys::signal::kill(pid, Signal::SIGKILL).map_err(|e| classify(pid, "kill", e))
    }
}
