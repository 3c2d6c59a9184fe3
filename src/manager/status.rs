//! Shared view of manager progress
//!
//! Cloned into the probe server so `/readyz` can report whether the manager
//! has started, and into tests to observe which runnables are running.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::runnable::RunnableState;

#[derive(Debug, Default)]
struct StatusInner {
    started: AtomicBool,
    elected: AtomicBool,
    runnables: RwLock<BTreeMap<String, RunnableState>>,
}

/// Cheaply cloneable handle on manager state
#[derive(Clone, Debug, Default)]
pub struct ManagerStatus {
    inner: Arc<StatusInner>,
}

impl ManagerStatus {
    /// Whether `Manager::start` has begun
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Whether leader-gated runnables have been released
    pub fn is_elected(&self) -> bool {
        self.inner.elected.load(Ordering::SeqCst)
    }

    /// State of the named runnable, if registered
    pub fn runnable_state(&self, name: &str) -> Option<RunnableState> {
        self.inner.runnables.read().get(name).copied()
    }

    /// Names of runnables currently in `Running`
    pub fn running(&self) -> Vec<String> {
        self.inner
            .runnables
            .read()
            .iter()
            .filter(|(_, state)| **state == RunnableState::Running)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub(crate) fn mark_started(&self) {
        self.inner.started.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_elected(&self) {
        self.inner.elected.store(true, Ordering::SeqCst);
    }

    /// Register `name` as `Idle`; returns false if already present
    pub(crate) fn register(&self, name: &str) -> bool {
        let mut runnables = self.inner.runnables.write();
        if runnables.contains_key(name) {
            return false;
        }
        runnables.insert(name.to_string(), RunnableState::Idle);
        true
    }

    pub(crate) fn set_state(&self, name: &str, state: RunnableState) {
        self.inner.runnables.write().insert(name.to_string(), state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let status = ManagerStatus::default();
        let observer = status.clone();
        assert!(!observer.is_started());

        status.mark_started();
        assert!(observer.is_started());
        assert!(!observer.is_elected());
    }

    #[test]
    fn registration_is_unique_and_starts_idle() {
        let status = ManagerStatus::default();
        assert!(status.register("a"));
        assert!(!status.register("a"));
        assert_eq!(status.runnable_state("a"), Some(RunnableState::Idle));
        assert_eq!(status.runnable_state("missing"), None);
    }

    #[test]
    fn running_lists_only_running() {
        let status = ManagerStatus::default();
        status.register("a");
        status.register("b");
        status.register("c");
        status.set_state("a", RunnableState::Running);
        status.set_state("b", RunnableState::Stopped);
        assert_eq!(status.running(), vec!["a".to_string()]);
    }
}
