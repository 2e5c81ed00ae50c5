//! Wires OS signals into the facade's `nuke`/`print_list` entry points.
//!
//! Iterates `Signal::iterator()` and dispatches by signal group: job-control
//! and `SIGCHLD` keep their default disposition, termination signals drain
//! the fleet, and `SIGUSR1` dumps the tracee list.

use std::sync::Arc;

use lazy_static::lazy_static;
use libc::{c_int, c_void, pid_t, siginfo_t};
use log::warn;
use nix::sys::signal::Signal::*;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use parking_lot::Mutex;

use crate::facade::Tracer;

lazy_static! {
    /// The tracer the installed handlers act on. A signal handler has no
    /// way to receive arguments, so this is the only channel available;
    /// `bind_tracer` is expected to run once, before `install_sigactions`.
    static ref ACTIVE_TRACER: Mutex<Option<Arc<Tracer>>> = Mutex::new(None);
}

/// Registers `tracer` as the target of the signal handlers installed by
/// `install_sigactions`. Installing a second tracer replaces the first.
pub fn bind_tracer(tracer: Arc<Tracer>) {
    *ACTIVE_TRACER.lock() = Some(tracer);
}

extern "C" fn nuke_on_signal(_: c_int, _: *mut siginfo_t, _: *mut c_void) {
    if let Some(tracer) = ACTIVE_TRACER.lock().as_ref() {
        tracer.nuke();
    }
}

extern "C" fn print_list_on_signal(_: pid_t) {
    if let Some(tracer) = ACTIVE_TRACER.lock().as_ref() {
        tracer.print_list();
    }
}

/// Configures the actions associated with the signals this core cares
/// about. All signals are blocked while a handler runs. Termination
/// signals drive `Tracer::nuke`; `SIGUSR1` drives `Tracer::print_list`;
/// everything else keeps its default disposition.
pub fn install_sigactions() {
    let signal_set: SigSet = SigSet::all();
    let sa_flags: SaFlags = SaFlags::SA_SIGINFO | SaFlags::SA_RESTART;

    for signal in Signal::iterator() {
        let handler = match signal {
            SIGQUIT | SIGTERM | SIGINT | SIGHUP => SigHandler::SigAction(nuke_on_signal),
            SIGUSR1 => SigHandler::Handler(print_list_on_signal),
            SIGCHLD | SIGCONT | SIGTSTP | SIGTTIN | SIGTTOU | SIGSTOP | SIGKILL => continue,
            _ => continue,
        };

        let signal_action = SigAction::new(handler, sa_flags, signal_set);
        if let Err(err) = unsafe { sigaction(signal, &signal_action) } {
            warn!("sigaction failed for signal {:?}: {:?}", signal, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::MockAdapter;

    #[test]
    fn install_sigactions_does_not_panic() {
        install_sigactions();
    }

    #[test]
    fn bound_tracer_receives_print_list_calls() {
        let tracer = Arc::new(Tracer::with_adapter(MockAdapter::new()));
        bind_tracer(tracer);
        print_list_on_signal(0);
    }
}
