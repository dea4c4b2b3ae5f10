//! Per-target concurrency bookkeeping (spec §4.2).
//!
//! Each target exposes a number of cores; activation/deactivation jobs
//! for mappings on that target draw on this pool before a process is
//! spawned. Acquisition is non-blocking by design — the caller round-robins
//! across all ready targets rather than waiting on one, so this is a plain
//! counter behind a `Mutex` rather than `tokio::sync::Semaphore` (whose
//! `acquire` is a blocking-wait primitive tied to one resource).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::manifest::Target;

/// Tracks how many of a target's cores are currently in use.
#[derive(Debug)]
pub struct TargetHandle {
    pub name: String,
    total_cores: u32,
    available: Mutex<u32>,
}

impl TargetHandle {
    pub fn new(target: &Target) -> Self {
        Self {
            name: target.name.clone(),
            total_cores: target.num_of_cores.max(1),
            available: Mutex::new(target.num_of_cores.max(1)),
        }
    }

    /// Attempt to reserve one core. Returns `false` without blocking if
    /// none are free.
    pub fn try_acquire(&self) -> bool {
        let mut available = self.available.lock().expect("target handle lock poisoned");
        if *available > 0 {
            *available -= 1;
            true
        } else {
            false
        }
    }

    /// Release a previously acquired core.
    pub fn release(&self) {
        let mut available = self.available.lock().expect("target handle lock poisoned");
        if *available < self.total_cores {
            *available += 1;
        }
    }

    pub fn available_cores(&self) -> u32 {
        *self.available.lock().expect("target handle lock poisoned")
    }

    pub fn total_cores(&self) -> u32 {
        self.total_cores
    }
}

/// A registry of `TargetHandle`s keyed by target name, built once from a
/// manifest's infrastructure table and shared across a transition.
#[derive(Debug, Default)]
pub struct TargetPool {
    handles: HashMap<String, TargetHandle>,
}

impl TargetPool {
    pub fn from_targets<'a>(targets: impl IntoIterator<Item = &'a Target>) -> Self {
        let handles = targets
            .into_iter()
            .map(|t| (t.name.clone(), TargetHandle::new(t)))
            .collect();
        Self { handles }
    }

    pub fn get(&self, name: &str) -> Option<&TargetHandle> {
        self.handles.get(name)
    }
}
