//! The tracee registry and leader map: the single source of truth for
//! which pids are currently being traced.

use std::collections::HashMap;
use std::sync::Arc;

use nix::unistd::Pid;

use crate::errors::{Result, TracerError};
use crate::process_model::Process;
use crate::tracee::{Leader, Tracee};
#[cfg(test)]
use crate::tracee::TraceeState;

/// Mapping pid → Tracee, plus the pid → Leader map it always travels with.
/// Both maps are mutated exclusively under the facade lock; this type
/// itself performs no locking of its own, matching "the registry is the
/// single source of truth for liveness" without prescribing how it's
/// synchronized.
#[derive(Debug, Default)]
pub struct Registry {
    tracees: HashMap<Pid, Tracee>,
    leaders: HashMap<Pid, Leader>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            tracees: HashMap::new(),
            leaders: HashMap::new(),
        }
    }

    /// Adds a new live tracee. Fails if `pid` is already present and not
    /// DEAD — a pid may only be re-added after a full `remove`.
    pub fn add(&mut self, pid: Pid, process: Arc<dyn Process>) -> Result<&mut Tracee> {
        if let Some(existing) = self.tracees.get(&pid) {
            if !existing.is_dead() {
                return Err(TracerError::RuntimeError(format!(
                    "tracee {} already present in registry",
                    pid
                )));
            }
        }
        self.tracees.insert(pid, Tracee::new(pid, process));
        Ok(self.tracees.get_mut(&pid).expect("just inserted"))
    }

    pub fn find(&self, pid: Pid) -> Option<&Tracee> {
        self.tracees.get(&pid)
    }

    pub fn find_mut(&mut self, pid: Pid) -> Option<&mut Tracee> {
        self.tracees.get_mut(&pid)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.tracees.contains_key(&pid)
    }

    /// Idempotent for DEAD tracees and for pids that were never present.
    pub fn remove(&mut self, pid: Pid) -> Option<Tracee> {
        self.leaders.remove(&pid);
        self.tracees.remove(&pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tracee> {
        self.tracees.values()
    }

    pub fn len(&self) -> usize {
        self.tracees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracees.is_empty()
    }

    pub fn any_running(&self) -> bool {
        self.tracees.values().any(Tracee::is_running)
    }

    pub fn all_dead(&self) -> bool {
        self.tracees.values().all(Tracee::is_dead)
    }

    /// All direct children of `parent_pid` currently in the registry,
    /// ordered by ascending pid as the wait-family tie-break rule requires.
    /// "Children" here is determined by the caller passing in
    /// a predicate because the registry itself does not model parentage —
    /// that belongs to the (out-of-scope) process tree; the dispatcher
    /// tracks parent pid separately via `Tracee::process`.
    pub fn children_of<'a>(
        &'a self,
        is_child: impl Fn(&Tracee) -> bool + 'a,
    ) -> impl Iterator<Item = &'a Tracee> {
        let mut matches: Vec<&Tracee> = self.tracees.values().filter(|t| is_child(t)).collect();
        matches.sort_by_key(|t| t.pid.as_raw());
        matches.into_iter()
    }

    // -- Leader bookkeeping (C7) --------------------------------------

    pub fn register_leader(&mut self, pid: Pid) {
        self.leaders.insert(pid, Leader::new());
    }

    pub fn leader(&self, pid: Pid) -> Option<&Leader> {
        self.leaders.get(&pid)
    }

    pub fn leader_mut(&mut self, pid: Pid) -> Option<&mut Leader> {
        self.leaders.get_mut(&pid)
    }

    pub fn is_leader(&self, pid: Pid) -> bool {
        self.leaders.contains_key(&pid)
    }

    pub fn leaders_drained(&self) -> bool {
        self.leaders.is_empty() && self.tracees.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_model::tests::RecordingProcess;

    fn pid(n: i32) -> Pid {
        Pid::from_raw(n)
    }

    fn recording() -> Arc<dyn Process> {
        Arc::new(RecordingProcess::default())
    }

    #[test]
    fn add_then_find() {
        let mut reg = Registry::new();
        reg.add(pid(10), recording()).unwrap();
        assert!(reg.find(pid(10)).is_some());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn add_live_twice_fails() {
        let mut reg = Registry::new();
        reg.add(pid(10), recording()).unwrap();
        let err = reg.add(pid(10), recording()).unwrap_err();
        assert!(matches!(err, TracerError::RuntimeError(_)));
    }

    #[test]
    fn add_after_dead_and_removed_succeeds() {
        let mut reg = Registry::new();
        reg.add(pid(10), recording()).unwrap();
        reg.find_mut(pid(10)).unwrap().state = TraceeState::Dead;
        reg.remove(pid(10));
        assert!(reg.add(pid(10), recording()).is_ok());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut reg = Registry::new();
        reg.add(pid(10), recording()).unwrap();
        assert!(reg.remove(pid(10)).is_some());
        assert!(reg.remove(pid(10)).is_none());
    }

    #[test]
    fn any_running_and_all_dead() {
        let mut reg = Registry::new();
        reg.add(pid(1), recording()).unwrap();
        reg.add(pid(2), recording()).unwrap();
        assert!(!reg.any_running());
        assert!(!reg.all_dead());

        reg.find_mut(pid(1)).unwrap().state = TraceeState::Running;
        assert!(reg.any_running());

        reg.find_mut(pid(1)).unwrap().state = TraceeState::Dead;
        reg.find_mut(pid(2)).unwrap().state = TraceeState::Dead;
        assert!(reg.all_dead());
        assert!(!reg.any_running());
    }

    #[test]
    fn children_of_sorted_by_pid_ascending() {
        let mut reg = Registry::new();
        for n in [30, 10, 20] {
            reg.add(pid(n), recording()).unwrap();
        }
        let pids: Vec<i32> = reg.children_of(|_| true).map(|t| t.pid.as_raw()).collect();
        assert_eq!(pids, vec![10, 20, 30]);
    }

    #[test]
    fn leader_bookkeeping_drains_with_registry() {
        let mut reg = Registry::new();
        reg.add(pid(1), recording()).unwrap();
        reg.register_leader(pid(1));
        assert!(reg.is_leader(pid(1)));
        assert!(!reg.leaders_drained());

        reg.remove(pid(1));
        assert!(reg.leaders_drained());
    }
}
