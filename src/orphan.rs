//! Orphan reconciliation and the recycled-PID log.
//!
//! A reaper or signal thread outside the main step loop may learn that a
//! pid has exited before the dispatcher does; it reports the pid through
//! a lock-free queue rather than touching the registry directly.
//! `crossbeam_channel` gives those threads a non-blocking producer side,
//! the step loop is the sole consumer.

use std::collections::VecDeque;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::warn;
use nix::unistd::Pid;

use crate::dispatch::Dispatcher;
use crate::errors::{Result, TracerError};
use crate::kernel::KernelAdapter;
use crate::registry::Registry;
use crate::tracee::TraceeState;

/// How many `step` generations a recycled-pid entry survives before
/// compaction discards it.
pub const RECYCLED_LOG_HORIZON: u64 = 64;

struct RecycledEntry {
    pid: Pid,
    generation: u64,
}

/// Multi-producer orphan queue plus the recycled-PID log it cross-checks
/// against. Owned by the facade; `sender()` is cloned out to reaper/signal
/// threads, everything else is only ever touched from the `step` thread.
pub struct OrphanReconciler {
    sender: Sender<Pid>,
    receiver: Receiver<Pid>,
    recycled: VecDeque<RecycledEntry>,
    generation: u64,
}

impl OrphanReconciler {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        OrphanReconciler {
            sender,
            receiver,
            recycled: VecDeque::new(),
            generation: 0,
        }
    }

    /// A cloneable, non-blocking producer handle safe to hand to a reaper
    /// thread or a signal handler.
    pub fn sender(&self) -> Sender<Pid> {
        self.sender.clone()
    }

    /// Records a pid whose zombie has been reaped and that should never be
    /// mistaken for a still-live tracee again, even if the kernel later
    /// recycles the number.
    pub fn mark_recycled(&mut self, pid: Pid) {
        self.recycled.push_back(RecycledEntry {
            pid,
            generation: self.generation,
        });
    }

    /// Drains the orphan queue and applies the four-step reconciliation
    /// algorithm to each pid, then compacts the recycled-PID log. Called
    /// at the top of every `step`. `dispatcher`/`adapter` are needed to
    /// cascade a reaped pid into any parent's in-flight blocking wait, the
    /// same way the ordinary event-stream reap path does.
    pub fn reconcile(&mut self, registry: &mut Registry, dispatcher: &mut Dispatcher, adapter: &dyn KernelAdapter) -> Result<()> {
        self.generation += 1;

        while let Ok(pid) = self.receiver.try_recv() {
            self.reconcile_one(registry, dispatcher, adapter, pid)?;
        }

        let horizon = self.generation.saturating_sub(RECYCLED_LOG_HORIZON);
        self.recycled.retain(|entry| entry.generation >= horizon);

        Ok(())
    }

    fn reconcile_one(
        &mut self,
        registry: &mut Registry,
        dispatcher: &mut Dispatcher,
        adapter: &dyn KernelAdapter,
        pid: Pid,
    ) -> Result<()> {
        if self.recycled.iter().any(|entry| entry.pid == pid) {
            // The reaper is reporting a previous incarnation of this pid.
            return Ok(());
        }

        match registry.find(pid).map(|t| t.state) {
            Some(TraceeState::Dead) => {
                registry.remove(pid);
                self.mark_recycled(pid);
                dispatcher.cascade(registry, adapter)
            }
            Some(TraceeState::Running) | Some(TraceeState::Stopped) => {
                warn!("orphan notification for still-live tracee {}", pid);
                Err(TracerError::bad_trace(pid, "reaper reported a live tracee as orphaned"))
            }
            None => {
                // A pid we never saw alive: an edge race between the
                // reaper and our own bookkeeping. Drop it.
                Ok(())
            }
        }
    }
}

impl Default for OrphanReconciler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::MockAdapter;
    use crate::process_model::tests::RecordingProcess;
    use std::sync::Arc;

    fn pid(n: i32) -> Pid {
        Pid::from_raw(n)
    }

    #[test]
    fn dead_orphan_is_removed_and_recycled() {
        let mut registry = Registry::new();
        registry.add(pid(5), Arc::new(RecordingProcess::default())).unwrap();
        registry.find_mut(pid(5)).unwrap().state = TraceeState::Dead;

        let mut orphans = OrphanReconciler::new();
        orphans.sender().send(pid(5)).unwrap();
        let mut dispatcher = Dispatcher::new();
        let adapter = MockAdapter::new();
        orphans.reconcile(&mut registry, &mut dispatcher, &adapter).unwrap();

        assert!(!registry.contains(pid(5)));
        assert!(orphans.recycled.iter().any(|e| e.pid == pid(5)));
    }

    #[test]
    fn live_orphan_notification_is_bad_trace() {
        let mut registry = Registry::new();
        registry.add(pid(5), Arc::new(RecordingProcess::default())).unwrap();
        registry.find_mut(pid(5)).unwrap().state = TraceeState::Running;

        let mut orphans = OrphanReconciler::new();
        orphans.sender().send(pid(5)).unwrap();
        let mut dispatcher = Dispatcher::new();
        let adapter = MockAdapter::new();
        let err = orphans
            .reconcile(&mut registry, &mut dispatcher, &adapter)
            .unwrap_err();
        assert!(matches!(err, TracerError::BadTrace { .. }));
    }

    #[test]
    fn unknown_pid_orphan_is_dropped_silently() {
        let mut registry = Registry::new();
        let mut orphans = OrphanReconciler::new();
        orphans.sender().send(pid(404)).unwrap();
        let mut dispatcher = Dispatcher::new();
        let adapter = MockAdapter::new();
        assert!(orphans.reconcile(&mut registry, &mut dispatcher, &adapter).is_ok());
    }

    #[test]
    fn recycled_pid_reported_again_has_no_effect() {
        let mut registry = Registry::new();
        let mut orphans = OrphanReconciler::new();
        orphans.mark_recycled(pid(7));

        orphans.sender().send(pid(7)).unwrap();
        let mut dispatcher = Dispatcher::new();
        let adapter = MockAdapter::new();
        orphans.reconcile(&mut registry, &mut dispatcher, &adapter).unwrap();
        assert!(!registry.contains(pid(7)));
    }

    #[test]
    fn compaction_drops_entries_past_the_horizon() {
        let mut registry = Registry::new();
        let mut orphans = OrphanReconciler::new();
        orphans.mark_recycled(pid(1));
        let mut dispatcher = Dispatcher::new();
        let adapter = MockAdapter::new();

        for _ in 0..(RECYCLED_LOG_HORIZON + 2) {
            orphans.reconcile(&mut registry, &mut dispatcher, &adapter).unwrap();
        }

        assert!(orphans.recycled.iter().all(|e| e.pid != pid(1)));
    }
}
