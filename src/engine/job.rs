//! Shared job state machine: the read/write shell, the aligned write
//! split, and the single finalization point.
//!
//! Replication (`replicate`) and recovery (`recover`) both run inside a
//! [`Job`]: one shared core carrying identity, progress, and pending
//! ops, plus a path-specific part. All transitions are driven by
//! [`JobEvent`]s delivered on the job's owning thread.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use bytes::Bytes;

use crate::error::EngineError;

use super::bridge::{RouteId, ThreadCtx};
use super::metrics::{JobOutcome, JobPath};
use super::op::{ChunkId, FileId, ReplicateChunkOp};
use super::peer::{ChunkMeta, PeerReadReply};
use super::recover::RecoverJob;
use super::registry::{CancelCell, JobHandle};
use super::replicate::ReplicateJob;
use super::store::{AllocChunkRequest, ChunkFileHandle, WriteRequest};
use super::striper::StripedReadCompletion;
use super::{CHECKSUM_BLOCK_SIZE, CHUNK_SIZE, recover, replicate};

/// Unique identity of one job; the sequence number distinguishes
/// successive jobs for the same chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId {
    pub chunk: ChunkId,
    pub seq: u64,
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chunk, self.seq)
    }
}

/// Completion delivered to a job on its owning thread.
#[derive(Debug)]
pub enum JobEvent {
    /// Deferred buffer-quota grant.
    Granted(i64),
    /// Peer metadata RPC finished.
    MetaDone(Result<ChunkMeta, EngineError>),
    /// Peer read RPC finished.
    ReadDone(Result<PeerReadReply, EngineError>),
    /// Local chunk write finished with the byte count.
    WriteDone(Result<i64, EngineError>),
    /// Final version change landed on disk.
    VersionChangeDone(Result<(), EngineError>),
    /// Striped read finished.
    StripedReadDone(StripedReadCompletion),
}

/// What the owning thread does with the job after a handler ran.
pub(crate) enum Step {
    Park(Box<Job>),
    Done,
}

/// Pending peer/striped read; between the read and its write this also
/// carries the sub-block tail held back for the terminal write.
#[derive(Debug, Default)]
pub(crate) struct ReadOp {
    pub offset: i64,
    pub num_bytes: i64,
    pub data: Bytes,
    pub checksums: Vec<u32>,
}

#[derive(Debug, Default)]
pub(crate) struct WriteOp {
    pub offset: i64,
    pub num_bytes: i64,
}

pub(crate) struct JobCore {
    pub id: JobId,
    pub path: JobPath,
    pub file_id: FileId,
    pub chunk_id: ChunkId,
    /// Current chunk version; replication overwrites it with the
    /// source's authoritative value.
    pub chunk_version: i64,
    /// Cross-thread mirror of `chunk_version` for cancel-by-version.
    pub shared_version: Arc<AtomicI64>,
    /// Learned from the source (replication) or discovered at the end
    /// of the striped read (recovery); -1 until known.
    pub chunk_size: i64,
    /// Next byte to write; non-decreasing, checksum-block aligned except
    /// for the terminal tail write.
    pub offset: i64,
    pub owner: Option<Box<ReplicateChunkOp>>,
    pub done: bool,
    pub cancel: Arc<CancelCell>,
    pub file_handle: Option<ChunkFileHandle>,
    pub read_op: ReadOp,
    pub write_op: WriteOp,
    pub write_in_flight: bool,
    pub finalizing: bool,
    pub waiting_quota: bool,
    pub reserved_bytes: i64,
    /// Thread this job is pinned to once started.
    pub pinned: RouteId,
}

pub(crate) enum JobKind {
    Replicate(ReplicateJob),
    Recover(Box<RecoverJob>),
}

pub(crate) struct Job {
    pub core: JobCore,
    pub kind: JobKind,
}

impl Job {
    pub fn peer_name(&self) -> String {
        match &self.kind {
            JobKind::Replicate(r) => r.peer.location().to_string(),
            JobKind::Recover(_) => "none".to_string(),
        }
    }

    pub fn replicate_mut(&mut self) -> &mut ReplicateJob {
        match &mut self.kind {
            JobKind::Replicate(r) => r,
            JobKind::Recover(_) => panic!("not a replication job"),
        }
    }

    pub fn recover_mut(&mut self) -> &mut RecoverJob {
        match &mut self.kind {
            JobKind::Recover(r) => r,
            JobKind::Replicate(_) => panic!("not a recovery job"),
        }
    }

    pub fn make_handle(&self) -> JobHandle {
        JobHandle {
            job_id: self.core.id,
            chunk_id: self.core.chunk_id,
            path: self.core.path,
            target_version: self
                .core
                .owner
                .as_ref()
                .map(|op| op.target_version)
                .unwrap_or(-1),
            chunk_version: self.core.shared_version.clone(),
            cancel: self.core.cancel.clone(),
            route: RouteId::Worker,
        }
    }
}

/// Routes one completion event into the state machine.
pub(crate) fn on_event(ctx: &ThreadCtx, job: Box<Job>, event: JobEvent) -> Step {
    match event {
        JobEvent::Granted(_) => {
            if !job.core.waiting_quota {
                return terminate(
                    ctx,
                    job,
                    Err(EngineError::Fault("unexpected buffer grant".to_string())),
                );
            }
            start(ctx, job)
        }
        JobEvent::MetaDone(res) => match &job.kind {
            JobKind::Replicate(_) => replicate::meta_done(ctx, job, res),
            JobKind::Recover(_) => terminate(
                ctx,
                job,
                Err(EngineError::Fault(
                    "unexpected metadata completion".to_string(),
                )),
            ),
        },
        JobEvent::ReadDone(res) => match &job.kind {
            JobKind::Replicate(_) => replicate::read_done(ctx, job, res),
            JobKind::Recover(_) => terminate(
                ctx,
                job,
                Err(EngineError::Fault("unexpected peer read completion".to_string())),
            ),
        },
        JobEvent::StripedReadDone(completion) => match &job.kind {
            JobKind::Recover(_) => recover::striped_read_done(ctx, job, completion),
            JobKind::Replicate(_) => terminate(
                ctx,
                job,
                Err(EngineError::Fault(
                    "unexpected striped read completion".to_string(),
                )),
            ),
        },
        JobEvent::WriteDone(res) => write_done(ctx, job, res),
        JobEvent::VersionChangeDone(res) => version_change_done(ctx, job, res),
    }
}

/// Buffer quota is held; hand control to the path state machine.
pub(crate) fn start(ctx: &ThreadCtx, mut job: Box<Job>) -> Step {
    job.core.waiting_quota = false;
    if job.core.cancel.is_cancelled() {
        return terminate(ctx, job, Err(EngineError::Cancelled));
    }
    if job.core.cancel.pending() {
        tracing::debug!(chunk = %job.core.chunk_id, "ignoring start, cancel pending");
        return Step::Park(job);
    }
    match &job.kind {
        JobKind::Replicate(_) => replicate::start(ctx, job),
        JobKind::Recover(_) => recover::start(ctx, job),
    }
}

/// Shared metadata completion: record the authoritative size/version,
/// allocate the local chunk at version 0, and enter the read loop.
pub(crate) fn meta_done(
    ctx: &ThreadCtx,
    mut job: Box<Job>,
    res: Result<ChunkMeta, EngineError>,
) -> Step {
    if job.core.cancel.is_cancelled() {
        return terminate(ctx, job, Err(EngineError::Cancelled));
    }
    let meta = match res {
        Err(err) => {
            tracing::info!(
                chunk = %job.core.chunk_id,
                peer = %job.peer_name(),
                %err,
                "get chunk meta data failed",
            );
            return terminate(ctx, job, Err(err));
        }
        Ok(meta) => meta,
    };
    if meta.size < 0 || meta.size > CHUNK_SIZE {
        tracing::info!(chunk = %job.core.chunk_id, size = meta.size, "invalid chunk size");
        return terminate(
            ctx,
            job,
            Err(EngineError::InvalidArgument(format!(
                "invalid chunk size: {}",
                meta.size
            ))),
        );
    }
    job.core.chunk_size = meta.size;
    job.core.chunk_version = meta.version;
    job.core.shared_version.store(meta.version, Ordering::Release);

    let Some(owner) = job.core.owner.as_ref() else {
        return terminate(
            ctx,
            job,
            Err(EngineError::Fault("owner op missing before alloc".to_string())),
        );
    };
    let req = AllocChunkRequest {
        file_id: job.core.file_id,
        chunk_id: job.core.chunk_id,
        // Version 0 marks the replica incomplete so a restart discards it.
        chunk_version: 0,
        min_storage_tier: owner.min_storage_tier,
        being_replicated: true,
        target_version: owner.effective_target_version(job.core.chunk_version),
    };
    match ctx.deps().store.alloc_chunk(&req) {
        Err(err) => terminate(ctx, job, Err(err)),
        Ok(handle) => {
            job.core.file_handle = Some(handle);
            tracing::info!(
                chunk = %job.core.chunk_id,
                peer = %job.peer_name(),
                size = job.core.chunk_size,
                "replication: starting",
            );
            next_read(ctx, job)
        }
    }
}

/// End-of-loop check, then the next path-specific read.
pub(crate) fn next_read(ctx: &ThreadCtx, mut job: Box<Job>) -> Step {
    if job.core.cancel.is_cancelled() {
        return terminate(ctx, job, Err(EngineError::Cancelled));
    }
    if job.core.offset >= job.core.chunk_size {
        job.core.done = job.core.offset == job.core.chunk_size;
        if job.core.done {
            tracing::info!(
                chunk = %job.core.chunk_id,
                peer = %job.peer_name(),
                position = job.core.offset,
                size = job.core.chunk_size,
                "transfer done",
            );
            return terminate(ctx, job, Ok(()));
        }
        tracing::error!(
            chunk = %job.core.chunk_id,
            position = job.core.offset,
            size = job.core.chunk_size,
            "offset past end of chunk",
        );
        return terminate(
            ctx,
            job,
            Err(EngineError::Fault("offset past end of chunk".to_string())),
        );
    }
    match &job.kind {
        JobKind::Replicate(_) => replicate::issue_read(ctx, job),
        JobKind::Recover(_) => recover::enqueue_read(ctx, job),
    }
}

/// Issues the local write for the data sitting in the read op, holding
/// back any sub-block tail.
///
/// The chunk store only accepts checksum-block aligned writes, except
/// for a final write ending exactly at the chunk size. A read that ends
/// at the chunk size with a sub-block remainder is therefore written in
/// two steps: the aligned prefix now, and the tail (with its checksum
/// moved over from the read op) when the prefix write completes.
pub(crate) fn stage_write_from_read(ctx: &ThreadCtx, mut job: Box<Job>) -> Step {
    let num_rd = job.core.read_op.data.len() as i64;
    let tail_len = num_rd % CHECKSUM_BLOCK_SIZE;
    if num_rd > CHECKSUM_BLOCK_SIZE
        && tail_len != 0
        && job.core.offset + num_rd != job.core.chunk_size
    {
        return terminate(
            ctx,
            job,
            Err(EngineError::Fault(
                "unaligned write before end of chunk".to_string(),
            )),
        );
    }

    let mut checksums = std::mem::take(&mut job.core.read_op.checksums);
    let data = if num_rd > CHECKSUM_BLOCK_SIZE && tail_len != 0 {
        let num_bytes = num_rd - tail_len;
        let prefix = job.core.read_op.data.split_to(num_bytes as usize);
        // The read op keeps the tail; the write completion resumes it.
        job.core.read_op.offset = job.core.offset + num_bytes;
        job.core.read_op.num_bytes = tail_len;
        if let Some(last) = checksums.pop() {
            job.core.read_op.checksums = vec![last];
        }
        prefix
    } else {
        std::mem::take(&mut job.core.read_op.data)
    };

    job.core.write_op.offset = job.core.offset;
    job.core.write_op.num_bytes = data.len() as i64;
    let req = WriteRequest {
        chunk_id: job.core.chunk_id,
        chunk_version: 0,
        offset: job.core.offset,
        data,
        checksums,
    };
    let done = ctx.sender_for(job.core.id);
    let Some(handle) = job.core.file_handle.take() else {
        return terminate(
            ctx,
            job,
            Err(EngineError::Fault("missing file handle for write".to_string())),
        );
    };
    let res = ctx.deps().store.write_chunk(req, &handle, done);
    job.core.file_handle = Some(handle);
    match res {
        Ok(()) => {
            job.core.write_in_flight = true;
            Step::Park(job)
        }
        Err(err) => terminate(ctx, job, Err(err)),
    }
}

pub(crate) fn write_done(ctx: &ThreadCtx, mut job: Box<Job>, res: Result<i64, EngineError>) -> Step {
    job.core.write_in_flight = false;
    let written = match res {
        Err(err) => {
            tracing::error!(
                chunk = %job.core.chunk_id,
                peer = %job.peer_name(),
                %err,
                "write failed",
            );
            let status = if job.core.cancel.is_cancelled() {
                EngineError::Cancelled
            } else {
                err
            };
            return terminate(ctx, job, Err(status));
        }
        Ok(written) => written,
    };
    if job.core.cancel.is_cancelled() {
        return terminate(ctx, job, Err(EngineError::Cancelled));
    }
    if written != job.core.write_op.num_bytes {
        let expected = job.core.write_op.num_bytes;
        return terminate(
            ctx,
            job,
            Err(EngineError::Fault(format!(
                "short write: {} of {}",
                written, expected
            ))),
        );
    }
    job.core.offset += written;
    if job.core.read_op.offset == job.core.offset && !job.core.read_op.data.is_empty() {
        debug_assert!(job.core.read_op.data.len() < CHECKSUM_BLOCK_SIZE as usize);
        return stage_write_from_read(ctx, job);
    }
    next_read(ctx, job)
}

/// Begins finalization. On success the final version change is
/// requested first and the job finishes when it lands; every other path
/// finishes immediately.
pub(crate) fn terminate(ctx: &ThreadCtx, mut job: Box<Job>, status: Result<(), EngineError>) -> Step {
    let cancelled = job.core.cancel.is_cancelled();
    if job.core.done && !cancelled && status.is_ok() {
        tracing::info!(
            chunk = %job.core.chunk_id,
            version = job.core.chunk_version,
            peer = %job.peer_name(),
            "finished",
        );
        let Some(handle) = job.core.file_handle.take() else {
            return finish(
                ctx,
                job,
                Err(EngineError::Fault(
                    "missing file handle at version change".to_string(),
                )),
            );
        };
        let done = ctx.sender_for(job.core.id);
        let res = ctx.deps().store.change_chunk_vers(
            job.core.chunk_id,
            job.core.chunk_version,
            true,
            &handle,
            done,
        );
        job.core.file_handle = Some(handle);
        match res {
            Ok(()) => {
                job.core.finalizing = true;
                Step::Park(job)
            }
            Err(err) => finish(ctx, job, Err(err)),
        }
    } else {
        let status = match status {
            Ok(()) if !job.core.done => {
                Err(EngineError::Fault("terminated before completion".to_string()))
            }
            other => other,
        };
        finish(ctx, job, status)
    }
}

pub(crate) fn version_change_done(
    ctx: &ThreadCtx,
    job: Box<Job>,
    res: Result<(), EngineError>,
) -> Step {
    if !job.core.finalizing {
        return finish(
            ctx,
            job,
            Err(EngineError::Fault(
                "unexpected version change completion".to_string(),
            )),
        );
    }
    finish(ctx, job, res)
}

/// The unique completion point: records the outcome on the owner op,
/// returns the file handle to the chunk store, removes the registry
/// entry, updates counters, releases the buffer reservation, and hands
/// the owner op back to the response queue.
fn finish(ctx: &ThreadCtx, mut job: Box<Job>, status: Result<(), EngineError>) -> Step {
    let cancelled = job.core.cancel.is_cancelled();
    let status = if cancelled {
        Err(EngineError::Cancelled)
    } else {
        status
    };

    let mut owner = job
        .core
        .owner
        .take()
        .expect("owner op present at finalization");
    match &status {
        Ok(()) => {
            let chunk_size = ctx
                .deps()
                .store
                .get_chunk_info(job.core.chunk_id)
                .map(|info| info.size)
                .unwrap_or(-1);
            tracing::info!(
                chunk = %job.core.chunk_id,
                version = job.core.chunk_version,
                chunk_size,
                "replication done",
            );
        }
        Err(err) if err.is_cancelled() => {
            tracing::info!(
                chunk = %job.core.chunk_id,
                version = job.core.chunk_version,
                peer = %job.peer_name(),
                "canceled",
            );
        }
        Err(err) => {
            tracing::error!(
                chunk = %job.core.chunk_id,
                version = job.core.chunk_version,
                peer = %job.peer_name(),
                %err,
                "failed",
            );
        }
    }

    owner.chunk_version = if status.is_ok() {
        job.core.chunk_version
    } else {
        -1
    };
    owner.status = status.clone().err();
    if let Some(handle) = job.core.file_handle.take() {
        ctx.deps()
            .store
            .replication_done(job.core.chunk_id, status.clone(), handle);
    }
    {
        let mut shared = ctx.core.shared.lock().expect("dispatcher lock poisoned");
        shared.registry.remove_if(job.core.chunk_id, job.core.id);
    }
    let outcome = match &status {
        Ok(()) => JobOutcome::Success,
        Err(err) if err.is_cancelled() => JobOutcome::Cancelled,
        Err(_) => JobOutcome::Error,
    };
    ctx.core.counters.finished(job.core.path, outcome);
    ctx.core.counters.job_dropped();
    if job.core.reserved_bytes > 0 {
        ctx.deps().buffers.release(job.core.id, job.core.reserved_bytes);
    }
    ctx.deps().responses.submit(owner);
    Step::Done
}

/// Marks the job cancelled and returns the chunk file early so the
/// store can discard the partial replica without waiting for pending
/// I/O to drain.
pub(crate) fn mark_cancelled(ctx: &ThreadCtx, job: &mut Job) {
    job.core.cancel.set_cancelled();
    if let Some(handle) = job.core.file_handle.take() {
        ctx.deps()
            .store
            .replication_done(job.core.chunk_id, Err(EngineError::Cancelled), handle);
    }
}

/// Same-thread cancellation of a replication job. A job parked on the
/// buffer-quota wait list dies here; one with an RPC or write in flight
/// terminates when that completion observes the latch.
pub(crate) fn cancel_replicate(ctx: &ThreadCtx, mut job: Box<Job>) -> Step {
    mark_cancelled(ctx, &mut job);
    if job.core.waiting_quota {
        job.core.waiting_quota = false;
        ctx.deps().buffers.cancel_wait(job.core.id);
        return terminate(ctx, job, Err(EngineError::Cancelled));
    }
    Step::Park(job)
}
