// WorkerRegistry: live instance name -> the job it runs and the pool slot
// it holds. A slot is released by removing its entry, which drops the
// permit, so each slot can be released at most once.

use crate::job_event::JobEvent;

use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Notify, OwnedSemaphorePermit};

/// How many released names are remembered to recognise duplicate events.
const RELEASED_HISTORY: usize = 256;

/// Where a registered worker is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    /// The lifecycle task is still running.
    Launching,
    /// The lifecycle task has finished; the entry now waits for the
    /// instance's deletion.
    Settled,
}

struct WorkerEntry {
    job: JobEvent,
    phase: WorkerPhase,
    _permit: OwnedSemaphorePermit,
}

/// Result of a release attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The entry existed and its slot was returned.
    Released,
    /// The name was released earlier; nothing to do.
    AlreadyReleased,
    /// The name was never registered.
    Unknown,
}

/// `register` found a live entry under the job's instance name. Both the
/// job and its permit are handed back untouched.
#[derive(Debug)]
pub struct NameTaken {
    pub job: JobEvent,
    pub permit: OwnedSemaphorePermit,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<String, WorkerEntry>,
    released: VecDeque<String>,
}

/// Shared between the dispatch path and the pool tracker.
pub struct WorkerRegistry {
    inner: Mutex<RegistryInner>,
    released_signal: Arc<Notify>,
}

impl WorkerRegistry {
    /// `released_signal` is notified after every successful release so the
    /// dispatch loop can reuse the slot without waiting for its next poll.
    pub fn new(released_signal: Arc<Notify>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            released_signal,
        }
    }

    /// Notified after every release.
    pub fn released_signal(&self) -> Arc<Notify> {
        self.released_signal.clone()
    }

    /// Record a worker holding `permit`. The entry starts in `Launching`.
    /// A live entry with the same name is never replaced.
    pub fn register(&self, job: JobEvent, permit: OwnedSemaphorePermit) -> Result<(), NameTaken> {
        let mut inner = self.inner.lock();
        match inner.entries.entry(job.instance_name.clone()) {
            Entry::Occupied(_) => Err(NameTaken { job, permit }),
            Entry::Vacant(slot) => {
                slot.insert(WorkerEntry {
                    job,
                    phase: WorkerPhase::Launching,
                    _permit: permit,
                });
                Ok(())
            }
        }
    }

    /// Mark the lifecycle task of `name` as finished.
    pub fn mark_settled(&self, name: &str) {
        if let Some(entry) = self.inner.lock().entries.get_mut(name) {
            entry.phase = WorkerPhase::Settled;
        }
    }

    /// Remove `name` and return its slot.
    pub fn release(&self, name: &str) -> ReleaseOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            match inner.entries.remove(name) {
                Some(entry) => {
                    drop(entry);
                    inner.released.push_back(name.to_string());
                    if inner.released.len() > RELEASED_HISTORY {
                        inner.released.pop_front();
                    }
                    ReleaseOutcome::Released
                }
                None if inner.released.iter().any(|n| n == name) => {
                    ReleaseOutcome::AlreadyReleased
                }
                None => ReleaseOutcome::Unknown,
            }
        };
        if outcome == ReleaseOutcome::Released {
            self.released_signal.notify_one();
        }
        outcome
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().entries.contains_key(name)
    }

    pub fn phase(&self, name: &str) -> Option<WorkerPhase> {
        self.inner.lock().entries.get(name).map(|e| e.phase)
    }

    /// Names of entries whose lifecycle task has finished.
    pub fn settled_names(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut names: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.phase == WorkerPhase::Settled)
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    /// Live worker count.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live worker count per configuration name.
    pub fn counts_by_config(&self) -> BTreeMap<String, usize> {
        let inner = self.inner.lock();
        let mut counts = BTreeMap::new();
        for entry in inner.entries.values() {
            *counts.entry(entry.job.config.name().to_string()).or_insert(0) += 1;
        }
        counts
    }
}
