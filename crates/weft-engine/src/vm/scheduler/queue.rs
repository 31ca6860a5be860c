//! Shared run queue

use super::fiber::{Fiber, FiberId};
use crossbeam_deque::{Injector, Steal};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Runnable fibers plus the table of live ones
pub(crate) struct RunQueue {
    injector: Injector<Arc<Fiber>>,
    fibers: RwLock<FxHashMap<FiberId, Arc<Fiber>>>,
    running: AtomicUsize,
    spawned: AtomicU64,
    completed: AtomicU64,
}

impl RunQueue {
    pub(crate) fn new() -> Self {
        Self {
            injector: Injector::new(),
            fibers: RwLock::new(FxHashMap::default()),
            running: AtomicUsize::new(0),
            spawned: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// Track a new fiber and queue it
    pub(crate) fn register(&self, fiber: Arc<Fiber>) {
        self.fibers.write().insert(fiber.id(), fiber.clone());
        self.spawned.fetch_add(1, Ordering::Relaxed);
        self.injector.push(fiber);
    }

    /// Queue a known fiber again
    pub(crate) fn push(&self, fiber: Arc<Fiber>) {
        self.injector.push(fiber);
    }

    pub(crate) fn pop(&self) -> Option<Arc<Fiber>> {
        loop {
            match self.injector.steal() {
                Steal::Success(fiber) => return Some(fiber),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    /// Forget a terminated fiber
    pub(crate) fn retire(&self, id: FiberId) {
        if self.fibers.write().remove(&id).is_some() {
            self.completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn get(&self, id: FiberId) -> Option<Arc<Fiber>> {
        self.fibers.read().get(&id).cloned()
    }

    pub(crate) fn live_count(&self) -> usize {
        self.fibers.read().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.injector.is_empty()
    }

    pub(crate) fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    pub(crate) fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Mark a worker busy
    pub(crate) fn enter(&self) {
        self.running.fetch_add(1, Ordering::AcqRel);
    }

    /// Mark a worker idle; returns the number still busy
    pub(crate) fn leave(&self) -> usize {
        self.running.fetch_sub(1, Ordering::AcqRel) - 1
    }
}
