//! In-flight job registry.
//!
//! Process-wide map of chunk id to the active job, guarded by the
//! dispatcher mutex and mutated only from the worker thread. Enforces
//! at-most-one job per chunk and drives pre-emption: a new request for a
//! chunk cancels whatever job currently holds the slot.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use super::bridge::RouteId;
use super::job::JobId;
use super::metrics::JobPath;
use super::op::ChunkId;

/// One-way cancellation latch shared between a job and its registry
/// handle.
///
/// `cancelled` is the job-level latch every handler checks; recovery
/// jobs additionally latch `pending_cancel` so a cancel crossing to the
/// owning client thread is enqueued once and duplicates are suppressed.
#[derive(Debug, Default)]
pub(crate) struct CancelCell {
    cancelled: AtomicBool,
    pending_cancel: AtomicBool,
}

impl CancelCell {
    pub fn set_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Latches the pending-cancel flag; returns true when this call set
    /// it (the caller should enqueue the cancel, duplicates back off).
    pub fn latch_pending(&self) -> bool {
        !self.pending_cancel.swap(true, Ordering::AcqRel)
    }

    pub fn pending(&self) -> bool {
        self.pending_cancel.load(Ordering::Acquire)
    }
}

/// Cross-thread view of an active job held in the registry.
#[derive(Debug, Clone)]
pub(crate) struct JobHandle {
    pub job_id: JobId,
    pub chunk_id: ChunkId,
    pub path: JobPath,
    pub target_version: i64,
    /// Mirror of the job's current chunk version; replication updates it
    /// when the source metadata arrives.
    pub chunk_version: Arc<AtomicI64>,
    pub cancel: Arc<CancelCell>,
    /// Thread currently owning the job; updated when a recovery job
    /// migrates to its client thread.
    pub route: RouteId,
}

impl JobHandle {
    /// The version this job is replicating toward: the explicit target
    /// when one was requested, else the current chunk version.
    fn effective_target_version(&self) -> i64 {
        if self.target_version >= 0 {
            self.target_version
        } else {
            self.chunk_version.load(Ordering::Acquire)
        }
    }
}

pub(crate) enum InsertOutcome {
    Fresh,
    /// The slot was held by another job; the caller must cancel it and
    /// then [`InFlightRegistry::finish_insert`] its own handle.
    Preempted(JobHandle),
}

#[derive(Default)]
pub(crate) struct InFlightRegistry {
    map: HashMap<ChunkId, JobHandle>,
}

impl InFlightRegistry {
    /// First phase of insertion. A vacant slot is claimed immediately.
    /// An occupied slot keeps its holder, which is returned for
    /// cancellation; re-running insertion for the same job is a
    /// programming error.
    pub fn begin_insert(&mut self, handle: &JobHandle) -> InsertOutcome {
        match self.map.get(&handle.chunk_id) {
            None => {
                self.map.insert(handle.chunk_id, handle.clone());
                InsertOutcome::Fresh
            }
            Some(prior) if prior.job_id == handle.job_id => {
                panic!(
                    "attempt to restart replication for chunk {}",
                    handle.chunk_id
                );
            }
            Some(prior) => InsertOutcome::Preempted(prior.clone()),
        }
    }

    /// Second phase after pre-emption: the prior job's cancel may have
    /// torn it down synchronously and vacated (or re-populated) the
    /// slot, so the new handle overwrites whatever is there.
    pub fn finish_insert(&mut self, handle: JobHandle) {
        self.map.insert(handle.chunk_id, handle);
    }

    /// Removes the entry only if it still belongs to `job_id`; a
    /// pre-empting successor must not lose its slot to its victim's
    /// teardown.
    pub fn remove_if(&mut self, chunk_id: ChunkId, job_id: JobId) {
        if let Some(handle) = self.map.get(&chunk_id)
            && handle.job_id == job_id
        {
            self.map.remove(&chunk_id);
        }
    }

    /// Takes every live entry; later inserts land in the fresh map.
    pub fn take_all(&mut self) -> Vec<JobHandle> {
        self.map.drain().map(|(_, handle)| handle).collect()
    }

    /// Detaches the entry for `chunk_id` when its effective target
    /// version matches, handing it back for cancellation. A negative
    /// `target_version` matches any job.
    pub fn find_for_cancel(&mut self, chunk_id: ChunkId, target_version: i64) -> Option<JobHandle> {
        let handle = self.map.get(&chunk_id)?;
        if target_version >= 0 && handle.effective_target_version() != target_version {
            return None;
        }
        self.map.remove(&chunk_id)
    }

    pub fn set_route(&mut self, chunk_id: ChunkId, job_id: JobId, route: RouteId) {
        if let Some(handle) = self.map.get_mut(&chunk_id)
            && handle.job_id == job_id
        {
            handle.route = route;
        }
    }

    pub fn get(&self, chunk_id: ChunkId) -> Option<&JobHandle> {
        self.map.get(&chunk_id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}
