//! Single-source replication: size from the peer, then a read/write
//! loop in checksum-block aligned steps.

use std::sync::Arc;

use crate::error::EngineError;

use super::bridge::ThreadCtx;
use super::job::{self, Job, Step};
use super::peer::{ChunkMeta, PeerClient, PeerReadReply, PeerReadRequest};
use super::{CHECKSUM_BLOCK_SIZE, DEFAULT_REPLICATION_READ_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplicatePhase {
    Meta,
    Transfer,
}

pub(crate) struct ReplicateJob {
    pub peer: Arc<dyn PeerClient>,
    pub phase: ReplicatePhase,
    /// Whether the next aligned read may skip the source's disk
    /// checksum verification. Cleared for good by the one automatic
    /// retry after the source reports a bad checksum.
    pub skip_verify: bool,
}

/// Quota granted: ask the peer for the chunk size and version.
pub(crate) fn start(ctx: &ThreadCtx, mut job: Box<Job>) -> Step {
    let skip_verify = ctx.config().replicator.read_skip_disk_verify;
    let state = job.replicate_mut();
    state.phase = ReplicatePhase::Meta;
    state.skip_verify = skip_verify;
    let peer = state.peer.clone();
    let done = ctx.sender_for(job.core.id);
    peer.get_chunk_metadata(job.core.chunk_id, false, done);
    Step::Park(job)
}

pub(crate) fn meta_done(
    ctx: &ThreadCtx,
    mut job: Box<Job>,
    res: Result<ChunkMeta, EngineError>,
) -> Step {
    if job.replicate_mut().phase != ReplicatePhase::Meta {
        return job::terminate(
            ctx,
            job,
            Err(EngineError::Fault(
                "metadata completion outside the metadata phase".to_string(),
            )),
        );
    }
    job.replicate_mut().phase = ReplicatePhase::Transfer;
    job::meta_done(ctx, job, res)
}

/// Issues the next peer read at the current offset.
pub(crate) fn issue_read(ctx: &ThreadCtx, mut job: Box<Job>) -> Step {
    let offset = job.core.offset;
    let num_bytes = (job.core.chunk_size - offset).min(DEFAULT_REPLICATION_READ_SIZE);
    let state = job.replicate_mut();
    if offset % CHECKSUM_BLOCK_SIZE != 0 {
        state.skip_verify = false;
    }
    let skip_verify = state.skip_verify;
    let peer = state.peer.clone();

    job.core.read_op.offset = offset;
    job.core.read_op.num_bytes = num_bytes;
    job.core.read_op.data = bytes::Bytes::new();
    job.core.read_op.checksums.clear();

    let req = PeerReadRequest {
        chunk_id: job.core.chunk_id,
        chunk_version: job.core.chunk_version,
        offset,
        num_bytes,
        skip_verify_disk_checksum: skip_verify,
    };
    let done = ctx.sender_for(job.core.id);
    peer.read(req, done);
    Step::Park(job)
}

pub(crate) fn read_done(
    ctx: &ThreadCtx,
    mut job: Box<Job>,
    res: Result<PeerReadReply, EngineError>,
) -> Step {
    if job.core.cancel.is_cancelled() {
        return job::terminate(ctx, job, Err(EngineError::Cancelled));
    }
    let reply = match res {
        Err(err) => {
            tracing::info!(
                chunk = %job.core.chunk_id,
                peer = %job.peer_name(),
                %err,
                "read failed",
            );
            let retry = job.replicate_mut().skip_verify
                && matches!(err, EngineError::BadChecksum(_));
            if retry {
                // One automatic retry at the same offset with the
                // source's disk checksum verification turned back on.
                tracing::info!(
                    chunk = %job.core.chunk_id,
                    peer = %job.peer_name(),
                    offset = job.core.offset,
                    "retrying read with disk checksum verify",
                );
                job.replicate_mut().skip_verify = false;
                return issue_read(ctx, job);
            }
            return job::terminate(ctx, job, Err(err));
        }
        Ok(reply) => reply,
    };

    let num_rd = reply.data.len() as i64;
    if num_rd < job.core.read_op.num_bytes && job.core.offset + num_rd < job.core.chunk_size {
        let offset = job.core.offset;
        let expected = job.core.read_op.num_bytes;
        tracing::error!(
            chunk = %job.core.chunk_id,
            peer = %job.peer_name(),
            got = num_rd,
            expected,
            "short read",
        );
        return job::terminate(
            ctx,
            job,
            Err(EngineError::ShortRead {
                offset,
                got: num_rd,
                expected,
            }),
        );
    }
    if job.core.offset % CHECKSUM_BLOCK_SIZE != 0 {
        return job::terminate(
            ctx,
            job,
            Err(EngineError::Fault("read completion at unaligned offset".to_string())),
        );
    }
    let expected_blocks =
        ((num_rd + CHECKSUM_BLOCK_SIZE - 1) / CHECKSUM_BLOCK_SIZE) as usize;
    if reply.checksums.len() != expected_blocks {
        return job::terminate(
            ctx,
            job,
            Err(EngineError::Fault(format!(
                "bad checksum count: {} blocks for {} bytes",
                reply.checksums.len(),
                num_rd
            ))),
        );
    }

    job.core.read_op.data = reply.data;
    job.core.read_op.checksums = reply.checksums;
    job::stage_write_from_read(ctx, job)
}

#[cfg(test)]
mod tests {
    use crate::engine::harness::{TestRig, replication_op};
    use crate::engine::{CHECKSUM_BLOCK_SIZE, ChunkId};
    use crate::error::EngineError;
    use crate::test_harness::WriteFailure;

    #[test]
    fn happy_replication_single_read_and_write() {
        let mut rig = TestRig::new();
        rig.peer.set_chunk(ChunkId(10), 7, 1 << 20);

        rig.submit(replication_op(10, 7));
        let op = rig.response();

        assert_eq!(op.status, None);
        assert_eq!(op.chunk_version, 7);
        assert_eq!(rig.peer.read_requests().len(), 1);
        let writes = rig.store.writes(ChunkId(10));
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].data.len(), 1 << 20);
        assert_eq!(rig.store.replicated_size(ChunkId(10)), Some(1 << 20));
        assert_eq!(rig.store.stable_version(ChunkId(10)), Some(7));

        let snap = rig.counters();
        assert_eq!(snap.replication_total, 1);
        assert_eq!(snap.replication_error, 0);
        assert_eq!(snap.active_jobs, 0);
    }

    #[test]
    fn terminal_tail_splits_last_write() {
        // 1.5 MiB + 100 bytes: one full read, then a second read whose
        // write is split into an aligned prefix and a 100 byte tail.
        let size = (3 << 19) + 100;
        let mut rig = TestRig::new();
        rig.peer.set_chunk(ChunkId(11), 3, size);

        rig.submit(replication_op(11, 3));
        let op = rig.response();
        assert_eq!(op.status, None);

        assert_eq!(rig.peer.read_requests().len(), 2);
        let writes = rig.store.writes(ChunkId(11));
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[0].data.len() as i64, 1 << 20);
        // Aligned prefix of the second read, then the 100 byte tail.
        assert_eq!(writes[1].offset, 1 << 20);
        assert_eq!(writes[1].data.len() as i64, size - (1 << 20) - 100);
        assert_eq!(writes[1].checksums.len(), 8);
        assert_eq!(writes[2].offset, size - 100);
        assert_eq!(writes[2].data.len(), 100);
        assert_eq!(writes[2].checksums.len(), 1);
        assert_eq!(rig.store.replicated_size(ChunkId(11)), Some(size));
    }

    #[test]
    fn bad_checksum_retries_once_with_verify_on() {
        let mut rig = TestRig::new();
        rig.peer.set_chunk(ChunkId(12), 2, 1 << 20);
        rig.peer
            .fail_next_read(EngineError::BadChecksum("block 3".to_string()));

        rig.submit(replication_op(12, 2));
        let op = rig.response();
        assert_eq!(op.status, None);

        let reads = rig.peer.read_requests();
        assert_eq!(reads.len(), 2);
        assert!(reads[0].skip_verify_disk_checksum);
        assert!(!reads[1].skip_verify_disk_checksum);
        assert_eq!(reads[0].offset, reads[1].offset);

        let snap = rig.counters();
        assert_eq!(snap.replication_total, 1);
        assert_eq!(snap.replication_error, 0);
    }

    #[test]
    fn bad_checksum_with_verify_on_is_fatal() {
        let mut rig = TestRig::new();
        rig.peer.set_chunk(ChunkId(13), 2, 1 << 20);
        rig.peer
            .fail_next_read(EngineError::BadChecksum("block 0".to_string()));
        rig.peer
            .fail_next_read(EngineError::BadChecksum("block 0".to_string()));

        rig.submit(replication_op(13, 2));
        let op = rig.response();
        assert!(matches!(op.status, Some(EngineError::BadChecksum(_))));
        assert_eq!(op.chunk_version, -1);
        assert_eq!(rig.counters().replication_error, 1);
        // The failed replica went back to the store for discard.
        assert_eq!(rig.store.done_status(ChunkId(13)), Some(false));
    }

    #[test]
    fn short_read_before_eof_fails_without_retry() {
        let mut rig = TestRig::new();
        rig.peer.set_chunk(ChunkId(14), 2, 2 << 20);
        rig.peer.truncate_next_read(512 << 10);

        rig.submit(replication_op(14, 2));
        let op = rig.response();

        assert!(matches!(op.status, Some(EngineError::ShortRead { .. })));
        assert_eq!(rig.peer.read_requests().len(), 1);
        assert_eq!(rig.counters().replication_error, 1);
        assert_eq!(rig.store.done_status(ChunkId(14)), Some(false));
    }

    #[test]
    fn wrong_checksum_count_is_a_fault() {
        let mut rig = TestRig::new();
        rig.peer.set_chunk(ChunkId(15), 2, 1 << 20);
        rig.peer.drop_checksums_on_next_read();

        rig.submit(replication_op(15, 2));
        let op = rig.response();
        assert!(matches!(op.status, Some(EngineError::Fault(_))));
        assert_eq!(rig.counters().replication_error, 1);
    }

    #[test]
    fn oversized_source_chunk_rejected() {
        let mut rig = TestRig::new();
        rig.peer
            .set_chunk_meta_only(ChunkId(16), 2, crate::engine::CHUNK_SIZE + 1);

        rig.submit(replication_op(16, 2));
        let op = rig.response();
        assert!(matches!(op.status, Some(EngineError::InvalidArgument(_))));
        // Failed before allocation: nothing to hand back to the store.
        assert_eq!(rig.store.done_status(ChunkId(16)), None);
    }

    #[test]
    fn local_write_failure_fails_job() {
        let mut rig = TestRig::new();
        rig.peer.set_chunk(ChunkId(18), 2, 1 << 20);
        rig.store.fail_next_write(WriteFailure::Sync(EngineError::Store(
            "disk full".to_string(),
        )));

        rig.submit(replication_op(18, 2));
        let op = rig.response();
        assert!(matches!(op.status, Some(EngineError::Store(_))));
        assert_eq!(rig.store.done_status(ChunkId(18)), Some(false));
        assert_eq!(rig.counters().replication_error, 1);
    }

    #[test]
    fn async_write_failure_fails_job() {
        let mut rig = TestRig::new();
        rig.peer.set_chunk(ChunkId(19), 2, 1 << 20);
        rig.store.fail_next_write(WriteFailure::Async(EngineError::Store(
            "io error".to_string(),
        )));

        rig.submit(replication_op(19, 2));
        let op = rig.response();
        assert!(matches!(op.status, Some(EngineError::Store(_))));
        assert_eq!(rig.store.done_status(ChunkId(19)), Some(false));
    }

    #[test]
    fn exact_block_chunk_has_no_tail_write() {
        let mut rig = TestRig::new();
        let size = 4 * CHECKSUM_BLOCK_SIZE;
        rig.peer.set_chunk(ChunkId(17), 5, size);

        rig.submit(replication_op(17, 5));
        let op = rig.response();
        assert_eq!(op.status, None);
        let writes = rig.store.writes(ChunkId(17));
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].checksums.len(), 4);
    }
}
