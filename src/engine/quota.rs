//! Buffer-quota admission gate.
//!
//! Before any I/O a job must reserve its buffer budget from the disk-I/O
//! buffer manager. The manager itself is an external collaborator: it
//! either grants synchronously, parks the waiter for a later
//! [`QuotaWaiter::granted`] callback, or the engine refuses up front when
//! the request would exceed the per-client quota.

use super::bridge::EventSender;
use super::job::{JobEvent, JobId};

/// Reservation floor; covers the chunk header that is staged alongside
/// the first data block.
pub const MIN_BUFFER_RESERVE: i64 = 16 << 10;

/// Disk-I/O buffer manager admission interface.
pub trait BufferManager: Send + Sync {
    /// Largest reservation a single client may hold.
    fn max_client_quota(&self) -> i64;

    /// Whether reserving `bytes` would exceed the per-client quota.
    fn over_quota(&self, bytes: i64) -> bool;

    /// Attempts to reserve `bytes`. Returns true when granted
    /// synchronously; otherwise the waiter is parked and resumed later
    /// through [`QuotaWaiter::granted`].
    fn try_reserve(&self, waiter: QuotaWaiter, bytes: i64) -> bool;

    /// Removes a parked waiter; returns whether one was removed.
    fn cancel_wait(&self, job: JobId) -> bool;

    /// Returns a previous reservation.
    fn release(&self, job: JobId, bytes: i64);
}

/// Handle the buffer manager uses to resume a parked job.
#[derive(Debug, Clone)]
pub struct QuotaWaiter {
    events: EventSender,
}

impl QuotaWaiter {
    pub(crate) fn new(events: EventSender) -> Self {
        Self { events }
    }

    pub fn job(&self) -> JobId {
        self.events.job()
    }

    /// Delivers the deferred grant; the job resumes on its owning
    /// thread.
    pub fn granted(&self, bytes: i64) {
        self.events.send(JobEvent::Granted(bytes));
    }
}
