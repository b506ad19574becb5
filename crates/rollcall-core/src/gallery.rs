//! Per-group signature gallery cache.
//!
//! Galleries are built lazily from a [`GallerySource`] and shared as
//! `Arc<Gallery>`, so a rebuild swaps the whole value and readers holding the
//! previous one are never disturbed. At most one build per group runs at a
//! time; concurrent callers either receive the previous gallery or block on
//! the in-flight build. Failed builds are not cached.

use crate::types::Gallery;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GalleryError {
    #[error("gallery build failed for group {group}: {reason}")]
    Build { group: String, reason: String },
}

/// Supplies the enrolled signatures of a group.
pub trait GallerySource: Send + Sync {
    fn build(&self, group: &str) -> Result<Gallery, GalleryError>;
}

/// Completion slot shared between the building thread and its waiters.
#[derive(Default)]
struct Build {
    result: Mutex<Option<Result<Arc<Gallery>, GalleryError>>>,
    ready: Condvar,
}

impl Build {
    fn complete(&self, result: Result<Arc<Gallery>, GalleryError>) {
        *lock(&self.result) = Some(result);
        self.ready.notify_all();
    }

    fn wait(&self) -> Result<Arc<Gallery>, GalleryError> {
        let mut guard = lock(&self.result);
        loop {
            if let Some(result) = guard.as_ref() {
                return result.clone();
            }
            guard = self
                .ready
                .wait(guard)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

#[derive(Default)]
struct Slot {
    current: Option<Arc<Gallery>>,
    /// Set by `invalidate`; the next `load` rebuilds.
    stale: bool,
    /// Bumped by `invalidate` so a build that straddles it stays stale.
    generation: u64,
    building: Option<Arc<Build>>,
}

enum Role {
    Builder(Arc<Build>, u64),
    Waiter(Arc<Build>),
}

/// Lazily built, atomically swapped gallery cache keyed by group.
pub struct SignatureGallery {
    source: Arc<dyn GallerySource>,
    slots: Mutex<HashMap<String, Slot>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl SignatureGallery {
    pub fn new(source: Arc<dyn GallerySource>) -> Self {
        Self {
            source,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Return the gallery for `group`, building it if absent or invalidated.
    pub fn load(&self, group: &str) -> Result<Arc<Gallery>, GalleryError> {
        let role = {
            let mut slots = lock(&self.slots);
            let slot = slots.entry(group.to_string()).or_default();

            if let Some(current) = &slot.current {
                // Fresh, or a rebuild is already under way: serve what we have.
                if !slot.stale || slot.building.is_some() {
                    return Ok(Arc::clone(current));
                }
            }

            match &slot.building {
                Some(build) => Role::Waiter(Arc::clone(build)),
                None => {
                    let build = Arc::new(Build::default());
                    slot.building = Some(Arc::clone(&build));
                    Role::Builder(build, slot.generation)
                }
            }
        };

        match role {
            Role::Waiter(build) => build.wait(),
            Role::Builder(build, generation) => self.run_build(group, build, generation),
        }
    }

    /// Mark the group's gallery stale. Readers keep whatever `Arc` they hold.
    pub fn invalidate(&self, group: &str) {
        let mut slots = lock(&self.slots);
        if let Some(slot) = slots.get_mut(group) {
            slot.stale = true;
            slot.generation += 1;
            tracing::debug!(group, generation = slot.generation, "gallery invalidated");
        }
    }

    #[cfg(test)]
    fn cached(&self, group: &str) -> Option<Arc<Gallery>> {
        lock(&self.slots).get(group).and_then(|s| s.current.clone())
    }

    fn run_build(
        &self,
        group: &str,
        build: Arc<Build>,
        generation: u64,
    ) -> Result<Arc<Gallery>, GalleryError> {
        tracing::debug!(group, "building gallery");
        let source = Arc::clone(&self.source);
        let result = panic::catch_unwind(AssertUnwindSafe(|| source.build(group)))
            .unwrap_or_else(|_| {
                Err(GalleryError::Build {
                    group: group.to_string(),
                    reason: "gallery source panicked".into(),
                })
            })
            .map(Arc::new);

        {
            let mut slots = lock(&self.slots);
            let slot = slots.entry(group.to_string()).or_default();
            if slot
                .building
                .as_ref()
                .is_some_and(|b| Arc::ptr_eq(b, &build))
            {
                slot.building = None;
            }
            match &result {
                Ok(gallery) => {
                    slot.current = Some(Arc::clone(gallery));
                    slot.stale = slot.generation != generation;
                    tracing::info!(group, signatures = gallery.len(), "gallery loaded");
                }
                Err(e) => {
                    tracing::error!(group, error = %e, "gallery build failed");
                }
            }
        }

        build.complete(result.clone());
        result
    }
}
