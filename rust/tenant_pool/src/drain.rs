use crate::block::Name;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

/// Holds the current drainage and shutdown state for the `Pool`.
#[derive(Default, Debug)]
pub struct Drain {
    drain_all: AtomicUsize,
    drain: Mutex<HashMap<Name, usize>>,
    shutdown: AtomicBool,
}

impl Drain {
    fn targets(&self) -> MutexGuard<'_, HashMap<Name, usize>> {
        self.drain.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enter shutdown. Returns false if we were already shut down.
    pub fn shutdown(&self) -> bool {
        !self.shutdown.swap(true, Ordering::AcqRel)
    }

    pub fn in_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Lock all targets for draining.
    pub fn lock_all(&self) -> DrainLock<'_> {
        self.drain_all.fetch_add(1, Ordering::AcqRel);
        DrainLock {
            target: None,
            drain: self,
        }
    }

    /// Lock a specific target for draining.
    pub fn lock(&self, target: Name) -> DrainLock<'_> {
        *self.targets().entry(target.clone()).or_default() += 1;
        DrainLock {
            target: Some(target),
            drain: self,
        }
    }

    /// Is this target draining?
    pub fn is_draining(&self, target: &str) -> bool {
        self.drain_all.load(Ordering::Acquire) > 0
            || self.in_shutdown()
            || self.targets().contains_key(target)
    }

    /// Are any targets draining?
    pub fn are_any_draining(&self) -> bool {
        self.drain_all.load(Ordering::Acquire) > 0
            || self.in_shutdown()
            || !self.targets().is_empty()
    }
}

/// Provides a RAII lock for a target- or whole-pool drain operation.
pub struct DrainLock<'a> {
    target: Option<Name>,
    drain: &'a Drain,
}

impl Drop for DrainLock<'_> {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            let mut targets = self.drain.targets();
            if let Some(count) = targets.get_mut(&target) {
                *count -= 1;
                if *count == 0 {
                    targets.remove(&target);
                }
            }
        } else {
            self.drain.drain_all.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
