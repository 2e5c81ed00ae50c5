//! A ptrace-driven process tracer core: follows `fork`/`clone`/`exec`/
//! `exit`/signal events across one or more traced process trees and
//! maintains a causally-ordered lifecycle model of each tracee.
//!
//! This crate is deliberately narrow. It owns the tracee registry, the
//! event dispatcher, the blocking-call machinery, and the orphan
//! reconciliation protocol; it does not model the process tree itself, does
//! not decode or rewrite syscall arguments, and ships no CLI or rendering
//! layer. Those are the embedding application's job, reached only through
//! [`Process`] and the [`Tracer`] facade.

pub mod blocking;
pub mod dispatch;
pub mod errors;
pub mod kernel;
pub mod orphan;
pub mod process_model;
pub mod registry;
pub mod sigactions;
pub mod tracee;

mod facade;

pub use blocking::{BlockingCall, DispatchContext, WaitCall, WaitOutcome, WaitTarget};
pub use dispatch::Dispatcher;
pub use errors::{Result, TracerError};
pub use facade::Tracer;
pub use kernel::{KernelAdapter, PtraceAdapter, Registers};
pub use orphan::OrphanReconciler;
pub use process_model::{NamedProcess, Process};
pub use registry::Registry;
pub use tracee::{Leader, Syscall, Tracee, TraceeState};
