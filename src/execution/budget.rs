//! Resource Budget
//!
//! The global memory and thread budget shared by all running tasks.
//! A task is admitted only if its request fits into what is left; the
//! returned [`Allocation`] gives the resources back when dropped.

use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use once_cell::sync::Lazy;
use sysinfo::System;

use super::retry::Resources;

/// Memory assumed when the system reports none.
const FALLBACK_MEMORY_MB: u64 = 4096;

/// Total physical memory in megabytes, read once.
static SYSTEM_MEMORY_MB: Lazy<u64> = Lazy::new(|| {
    let mut system = System::new();
    system.refresh_memory();
    match system.total_memory() / (1024 * 1024) {
        0 => FALLBACK_MEMORY_MB,
        mb => mb,
    }
});

/// Memory and threads available to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub mem_mb: u64,
    pub threads: usize,
}

impl Capacity {
    pub fn new(mem_mb: u64, threads: usize) -> Self {
        Self { mem_mb, threads }
    }

    /// All CPUs and all physical memory of this machine.
    pub fn system() -> Self {
        Self {
            mem_mb: *SYSTEM_MEMORY_MB,
            threads: num_cpus::get(),
        }
    }

    fn fits(&self, request: &Resources) -> bool {
        request.mem_mb <= self.mem_mb && request.threads <= self.threads
    }
}

/// Shared, mutex-guarded resource counter.
#[derive(Debug)]
pub struct ResourceBudget {
    capacity: Capacity,
    available: Mutex<Capacity>,
}

impl ResourceBudget {
    pub fn new(capacity: Capacity) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            available: Mutex::new(capacity),
        })
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    /// Currently unallocated resources.
    pub fn available(&self) -> Capacity {
        *self.lock()
    }

    /// Caps a request at the whole budget, so that oversized tasks can
    /// still run once everything else has finished.
    pub fn clamp(&self, request: Resources) -> Resources {
        Resources {
            mem_mb: request.mem_mb.min(self.capacity.mem_mb),
            threads: request.threads.min(self.capacity.threads).max(1),
            runtime: request.runtime,
        }
    }

    /// Reserves `request` if it fits into what is left.
    ///
    /// Returns `None` when the task has to wait.
    pub fn try_acquire(self: &Arc<Self>, request: Resources) -> Option<Allocation> {
        let mut available = self.lock();
        if !available.fits(&request) {
            return None;
        }
        available.mem_mb -= request.mem_mb;
        available.threads -= request.threads;
        debug!(
            "Allocated {} MB / {} threads ({} MB / {} threads left)",
            request.mem_mb, request.threads, available.mem_mb, available.threads
        );
        drop(available);

        Some(Allocation {
            budget: Arc::clone(self),
            resources: request,
        })
    }

    fn release(&self, resources: &Resources) {
        let mut available = self.lock();
        available.mem_mb = (available.mem_mb + resources.mem_mb).min(self.capacity.mem_mb);
        available.threads = (available.threads + resources.threads).min(self.capacity.threads);
    }

    fn lock(&self) -> MutexGuard<'_, Capacity> {
        // The counter stays consistent even if a holder panicked.
        self.available
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Resources held by one running task. Released on drop.
#[derive(Debug)]
pub struct Allocation {
    budget: Arc<ResourceBudget>,
    resources: Resources,
}

impl Allocation {
    pub fn resources(&self) -> Resources {
        self.resources
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.budget.release(&self.resources);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn request(mem_mb: u64, threads: usize) -> Resources {
        Resources {
            mem_mb,
            runtime: 1,
            threads,
        }
    }

    #[test]
    fn test_acquire_and_release() {
        let budget = ResourceBudget::new(Capacity::new(1000, 4));

        let first = budget.try_acquire(request(600, 2)).unwrap();
        assert_eq!(budget.available(), Capacity::new(400, 2));

        assert!(budget.try_acquire(request(600, 1)).is_none());
        assert!(budget.try_acquire(request(100, 3)).is_none());

        drop(first);
        assert_eq!(budget.available(), Capacity::new(1000, 4));
        assert!(budget.try_acquire(request(600, 1)).is_some());
    }

    #[test]
    fn test_clamp_oversized_request() {
        let budget = ResourceBudget::new(Capacity::new(1000, 4));
        let clamped = budget.clamp(request(5000, 16));
        assert_eq!(clamped.mem_mb, 1000);
        assert_eq!(clamped.threads, 4);
        assert!(budget.try_acquire(clamped).is_some());
    }

    #[test]
    fn test_release_from_worker_thread() {
        let budget = ResourceBudget::new(Capacity::new(1000, 4));
        let allocation = budget.try_acquire(request(1000, 4)).unwrap();

        thread::spawn(move || drop(allocation)).join().unwrap();
        assert_eq!(budget.available(), budget.capacity());
    }

    #[test]
    fn test_system_capacity() {
        let capacity = Capacity::system();
        assert!(capacity.mem_mb > 0);
        assert!(capacity.threads > 0);
    }
}
