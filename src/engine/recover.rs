//! Reed-Solomon recovery: rebuild a chunk by reading the surviving
//! stripes of its stripe group through the striped reader.
//!
//! The reader does the actual reconstruction; this module owns the
//! per-job read sizing, the checksum-block alignment of the write
//! stream (carrying an unaligned remainder across reads), and the
//! invalid-stripe reporting back to the metadata server.

use std::fmt::Write as _;

use bytes::{Buf, Bytes, BytesMut};

use crate::error::EngineError;

use super::bridge::{BridgeState, NextState, ThreadCtx};
use super::job::{self, Job, Step};
use super::op::ServerLocation;
use super::peer::ChunkMeta;
use super::striper::{StripedOpenSpec, StripedReadCompletion, StripedReader};
use super::{CHECKSUM_BLOCK_SIZE, CHUNK_SIZE, IO_BUFFER_SIZE};

pub(crate) struct RecoverJob {
    pub reader: Option<Box<dyn StripedReader>>,
    /// Sub-block remainder carried from the previous striped read.
    pub read_tail: Bytes,
    pub read_size: i64,
    pub read_in_flight: bool,
    /// The reader was closed but is still draining.
    pub pending_close: bool,
    pub bridge_state: BridgeState,
    /// Whether this job carried credentials and must refresh the meta
    /// client's authentication parameters before opening the reader.
    pub refresh_auth: bool,
    pub meta_location: ServerLocation,
    pub initial_seq: i64,
}

/// Picks the per-job striped read size: aligned up to a checksum block,
/// capped by the configured maximum and by an even share of the buffer
/// quota, and when it spans more than one stripe, rounded to a whole
/// number of stripes.
pub(crate) fn read_size_for(
    stripe_size: i64,
    num_stripes: i64,
    max_read_size: i64,
    max_client_quota: i64,
) -> i64 {
    let block = CHECKSUM_BLOCK_SIZE;
    debug_assert!(max_read_size >= block && max_read_size % block == 0);
    debug_assert!(stripe_size > 0 && block % IO_BUFFER_SIZE == 0);

    let share = max_client_quota / (num_stripes + 1).max(1) / block * block;
    let size = block.max(max_read_size.min(share));
    if size <= stripe_size {
        tracing::debug!(stripe_size, read_size = size, "large stripe");
        return size;
    }
    let mut step = lcm(block, stripe_size);
    if step > size {
        step = lcm(IO_BUFFER_SIZE, stripe_size);
        if step > size {
            tracing::warn!(
                max_read_size,
                io_buffer_size = IO_BUFFER_SIZE,
                stripe_size,
                read_size = step,
                "invalid read parameters",
            );
            return step;
        }
    }
    size / step * step
}

fn gcd(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

fn lcm(a: i64, b: i64) -> i64 {
    if a == 0 || b == 0 { 0 } else { a / gcd(a, b) * b }
}

/// One crc32c per checksum block of `data`.
pub(crate) fn block_checksums(data: &[u8]) -> Vec<u32> {
    data.chunks(CHECKSUM_BLOCK_SIZE as usize)
        .map(crc32c::crc32c)
        .collect()
}

/// Quota granted: validate the metadata server location and cross to
/// the owning client thread.
pub(crate) fn start(ctx: &ThreadCtx, mut job: Box<Job>) -> Step {
    let port = job
        .core
        .owner
        .as_ref()
        .map(|op| op.location.port)
        .unwrap_or(0);
    let location = ServerLocation::new(ctx.deps().meta_server_host.clone(), port);
    if !location.is_valid() {
        return job::meta_done(
            ctx,
            job,
            Err(EngineError::InvalidArgument(format!(
                "invalid meta server location: {location}"
            ))),
        );
    }
    job.recover_mut().meta_location = location;
    super::bridge::enqueue_owned(ctx, job, NextState::Start)
}

/// Runs on the owning client thread: refresh authentication, point the
/// meta client at the right server, open the striped reader, then feed
/// the outcome into the shared metadata handler.
pub(crate) fn handle_start(ctx: &ThreadCtx, mut job: Box<Job>) -> Step {
    job.recover_mut().bridge_state = BridgeState::None;
    let res = open_reader(ctx, &mut job);
    let meta = res.map(|()| ChunkMeta {
        // The true size is discovered when the striped read reaches the
        // end of the chunk.
        size: CHUNK_SIZE,
        version: job.core.chunk_version,
    });
    job::meta_done(ctx, job, meta)
}

fn open_reader(ctx: &ThreadCtx, job: &mut Job) -> Result<(), EngineError> {
    if job.recover_mut().refresh_auth {
        let (params, update_count) = {
            let shared = ctx.core.shared.lock().expect("dispatcher lock poisoned");
            (shared.auth.props.clone(), shared.auth.update_count)
        };
        if ctx.auth_seen.get() != update_count {
            tracing::debug!(
                seen = ctx.auth_seen.get(),
                current = update_count,
                "updating authentication context",
            );
            ctx.meta.borrow_mut().set_auth_params(&params)?;
            ctx.auth_seen.set(update_count);
        }
    }

    let target = job.recover_mut().meta_location.clone();
    {
        let mut meta = ctx.meta.borrow_mut();
        let current = meta.server_location();
        if current != target {
            if current.is_valid() {
                tracing::info!(
                    from = %current,
                    to = %target,
                    "meta server client address has changed",
                );
            }
            if let Err(err) = meta.set_server(&target, true) {
                return Err(EngineError::HostUnreachable(format!("{target}: {err}")));
            }
        }
    }

    let initial_seq = job.recover_mut().initial_seq;
    let Some(owner) = job.core.owner.as_ref() else {
        return Err(EngineError::Fault("owner op missing before open".to_string()));
    };
    let spec = StripedOpenSpec {
        file_id: job.core.file_id,
        path: owner.path_name.clone(),
        file_size: owner.file_size,
        stripe_size: owner.stripe_size,
        num_stripes: owner.num_stripes,
        num_recovery_stripes: owner.num_recovery_stripes,
        skip_holes: true,
        chunk_offset: owner.chunk_offset,
        initial_seq,
    };
    let config = ctx.config().rs_reader.clone();
    let reader = {
        let mut meta = ctx.meta.borrow_mut();
        ctx.deps().readers.open(&mut **meta, &spec, &config)?
    };
    job.recover_mut().reader = Some(reader);
    Ok(())
}

pub(crate) fn enqueue_read(ctx: &ThreadCtx, job: Box<Job>) -> Step {
    super::bridge::enqueue_owned(ctx, job, NextState::Read)
}

/// Issues the next striped read past whatever tail is carried over.
pub(crate) fn handle_read(ctx: &ThreadCtx, mut job: Box<Job>) -> Step {
    let read_size = job.recover_mut().read_size;
    let tail_len = job.recover_mut().read_tail.len() as i64;
    job.core.read_op.offset = job.core.offset;
    job.core.read_op.num_bytes = read_size;
    job.core.read_op.data = Bytes::new();
    job.core.read_op.checksums.clear();

    let request_id = job.core.id.seq;
    let offset = job.core.offset + tail_len;
    let done = ctx.sender_for(job.core.id);
    let Some(mut reader) = job.recover_mut().reader.take() else {
        return job::terminate(
            ctx,
            job,
            Err(EngineError::Fault("striped reader missing".to_string())),
        );
    };
    {
        let state = job.recover_mut();
        state.bridge_state = BridgeState::Read;
        state.read_in_flight = true;
    }
    let res = reader.read(read_size, offset, request_id, done);
    job.recover_mut().reader = Some(reader);
    match res {
        Ok(()) => Step::Park(job),
        Err(err) => {
            let state = job.recover_mut();
            state.read_in_flight = false;
            state.bridge_state = BridgeState::None;
            job::terminate(ctx, job, Err(err))
        }
    }
}

pub(crate) fn striped_read_done(
    ctx: &ThreadCtx,
    mut job: Box<Job>,
    completion: StripedReadCompletion,
) -> Step {
    if job.recover_mut().pending_close {
        let active = job
            .recover_mut()
            .reader
            .as_ref()
            .map(|reader| reader.is_active())
            .unwrap_or(false);
        if !active {
            tracing::debug!(chunk = %job.core.chunk_id, "chunk reader closed");
            job.recover_mut().pending_close = false;
        }
        return Step::Park(job);
    }
    if job.core.cancel.pending() {
        // The queued cancel will run; drop the completion.
        return Step::Park(job);
    }
    if !job.recover_mut().read_in_flight {
        return job::terminate(
            ctx,
            job,
            Err(EngineError::Fault(
                "striped read completion with no read in flight".to_string(),
            )),
        );
    }
    {
        let state = job.recover_mut();
        state.read_in_flight = false;
        state.bridge_state = BridgeState::None;
    }
    if completion.request_id != job.core.id.seq {
        return job::terminate(
            ctx,
            job,
            Err(EngineError::Fault("foreign striped read completion".to_string())),
        );
    }
    if completion.size > job.core.read_op.num_bytes {
        return job::terminate(
            ctx,
            job,
            Err(EngineError::Fault(
                "striped read returned more than requested".to_string(),
            )),
        );
    }

    if let Err(err) = completion.status {
        if !completion.data.is_empty() {
            report_invalid_stripes(ctx, &mut job, &completion.data);
        }
        return job::terminate(ctx, job, Err(err));
    }

    let tail_len = job.recover_mut().read_tail.len() as i64;
    let got = completion.data.len() as i64;
    let max_recover = ctx.config().rs_reader.max_recover_chunk_size;
    if job.core.offset + tail_len + got > max_recover {
        panic!(
            "recovery: file {} chunk {} position {} + {} + {} exceeds {}",
            job.core.file_id, job.core.chunk_id, job.core.offset, tail_len, got, max_recover
        );
    }
    if completion.offset != job.core.offset + tail_len {
        return job::terminate(
            ctx,
            job,
            Err(EngineError::Fault(
                "striped read completion at wrong offset".to_string(),
            )),
        );
    }

    let read_size = job.recover_mut().read_size;
    let end_of_chunk =
        got < read_size || job.core.offset + tail_len + read_size >= job.core.chunk_size;
    if end_of_chunk {
        let all = take_combined(job.recover_mut(), &completion.data);
        job.core.chunk_size = job.core.offset + all.len() as i64;
        {
            let state = job.recover_mut();
            if let Some(reader) = state.reader.as_mut() {
                reader.close();
                if reader.is_active() {
                    state.pending_close = true;
                }
            }
        }
        stage_assembled(ctx, &mut job, all);
        return job::stage_write_from_read(ctx, job);
    }

    let total = tail_len + got;
    let aligned = total / CHECKSUM_BLOCK_SIZE * CHECKSUM_BLOCK_SIZE;
    if aligned == 0 {
        let all = take_combined(job.recover_mut(), &completion.data);
        job.recover_mut().read_tail = all;
        return handle_read(ctx, job);
    }
    let mut all = take_combined(job.recover_mut(), &completion.data);
    let write = all.split_to(aligned as usize);
    job.recover_mut().read_tail = all;
    stage_assembled(ctx, &mut job, write);
    job::stage_write_from_read(ctx, job)
}

/// Joins the carried tail with the new read data.
fn take_combined(state: &mut RecoverJob, data: &Bytes) -> Bytes {
    if state.read_tail.is_empty() {
        return data.clone();
    }
    let mut all = BytesMut::with_capacity(state.read_tail.len() + data.len());
    all.extend_from_slice(&state.read_tail);
    all.extend_from_slice(data);
    state.read_tail = Bytes::new();
    all.freeze()
}

/// Loads assembled bytes into the read op with fresh block checksums;
/// recovered data has no source checksums to reuse.
fn stage_assembled(_ctx: &ThreadCtx, job: &mut Job, data: Bytes) {
    let num_bytes = data.len() as i64;
    job.core.read_op.offset = job.core.offset;
    job.core.read_op.num_bytes = num_bytes;
    job.core.read_op.checksums = if num_bytes > 0
        && job.core.offset % CHECKSUM_BLOCK_SIZE == 0
        && num_bytes % CHECKSUM_BLOCK_SIZE == 0
    {
        block_checksums(&data)
    } else {
        Vec::new()
    };
    job.core.read_op.data = data;
}

fn report_invalid_stripes(ctx: &ThreadCtx, job: &mut Job, data: &Bytes) {
    let Some(owner) = job.core.owner.as_mut() else {
        return;
    };
    let max_stripes = owner.num_stripes + owner.num_recovery_stripes;
    match parse_invalid_stripes(data, max_stripes) {
        Err(err) => {
            tracing::error!(chunk = %job.core.chunk_id, %err, "malformed invalid stripe report");
        }
        Ok(report) if !report.is_empty() => {
            tracing::error!(
                chunk = %job.core.chunk_id,
                invalid_stripes = %report,
                file_size = owner.file_size,
                "recovery: invalid stripes",
            );
            owner.invalid_stripe_idx = report;
            if ctx.config().rs_reader.panic_on_invalid_chunk && owner.file_size > 0 {
                panic!(
                    "recovery: invalid chunk(s) detected: {}",
                    owner.invalid_stripe_idx
                );
            }
        }
        Ok(_) => {}
    }
}

/// Decodes the reader's invalid-stripe report: little-endian
/// `(i32 index, i64 chunk-id, i64 version)` triples.
fn parse_invalid_stripes(data: &Bytes, max_stripes: i64) -> Result<String, EngineError> {
    let mut buf = &data[..];
    let mut report = String::new();
    let mut count = 0i64;
    while buf.remaining() > 0 {
        if count >= max_stripes {
            return Err(EngineError::Fault("invalid number of bad stripes".to_string()));
        }
        if buf.remaining() < 20 {
            return Err(EngineError::Fault("truncated invalid stripe report".to_string()));
        }
        let index = buf.get_i32_le();
        let chunk_id = buf.get_i64_le();
        let chunk_version = buf.get_i64_le();
        if index < 0 || i64::from(index) >= max_stripes {
            return Err(EngineError::Fault("invalid bad stripe index".to_string()));
        }
        if count > 0 {
            report.push(' ');
        }
        let _ = write!(report, "{index} {chunk_id} {chunk_version}");
        count += 1;
    }
    Ok(report)
}

/// Cancellation on the owning thread. The reader is shut down first so
/// no further completions arrive, then the shared teardown runs and any
/// op left in flight is resolved as cancelled.
pub(crate) fn cancel_recover(ctx: &ThreadCtx, mut job: Box<Job>) -> Step {
    if let Some(mut reader) = job.recover_mut().reader.take() {
        reader.close();
    }
    job::mark_cancelled(ctx, &mut job);
    if job.core.waiting_quota {
        job.core.waiting_quota = false;
        ctx.deps().buffers.cancel_wait(job.core.id);
        return job::terminate(ctx, job, Err(EngineError::Cancelled));
    }
    {
        let state = job.recover_mut();
        if state.read_in_flight || state.bridge_state == BridgeState::Start {
            state.read_in_flight = false;
            state.bridge_state = BridgeState::None;
            return job::terminate(ctx, job, Err(EngineError::Cancelled));
        }
    }
    if job.core.write_in_flight || job.core.finalizing {
        return Step::Park(job);
    }
    job::terminate(ctx, job, Err(EngineError::Cancelled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::ChunkId;
    use crate::engine::harness::{TestRig, recovery_op};
    use crate::error::EngineError;

    #[test]
    fn read_size_prefers_max_read_size() {
        // Stripe divides the read size: one megabyte stays.
        let size = read_size_for(64 << 10, 3, 1 << 20, i64::MAX / 8);
        assert_eq!(size, 1 << 20);
    }

    #[test]
    fn read_size_large_stripe_keeps_block_cap() {
        let size = read_size_for(2 << 20, 3, 1 << 20, i64::MAX / 8);
        assert_eq!(size, 1 << 20);
    }

    #[test]
    fn read_size_respects_quota_share() {
        // Four-way share of 640 KiB leaves two checksum blocks.
        let size = read_size_for(64 << 10, 3, 1 << 20, 640 << 10);
        assert_eq!(size, 2 * CHECKSUM_BLOCK_SIZE);
    }

    #[test]
    fn read_size_never_below_one_block() {
        let size = read_size_for(64 << 10, 63, 1 << 20, 64 << 10);
        assert_eq!(size, CHECKSUM_BLOCK_SIZE);
    }

    #[test]
    fn read_size_rounds_to_stripe_multiple() {
        // 256 KiB stripes: the megabyte cap is already a multiple.
        let size = read_size_for(256 << 10, 3, 1 << 20, i64::MAX / 8);
        assert_eq!(size, 1 << 20);
        assert_eq!(size % (256 << 10), 0);
    }

    #[test]
    fn invalid_stripe_triples_parse() {
        let mut data = Vec::new();
        data.extend_from_slice(&2i32.to_le_bytes());
        data.extend_from_slice(&42i64.to_le_bytes());
        data.extend_from_slice(&7i64.to_le_bytes());
        let report = parse_invalid_stripes(&Bytes::from(data), 6).unwrap();
        assert_eq!(report, "2 42 7");
    }

    #[test]
    fn invalid_stripe_report_rejects_bad_index() {
        let mut data = Vec::new();
        data.extend_from_slice(&9i32.to_le_bytes());
        data.extend_from_slice(&42i64.to_le_bytes());
        data.extend_from_slice(&7i64.to_le_bytes());
        assert!(parse_invalid_stripes(&Bytes::from(data), 6).is_err());
        assert!(parse_invalid_stripes(&Bytes::from(vec![1u8, 2]), 6).is_err());
    }

    #[test]
    fn block_checksums_one_per_block() {
        let data = vec![7u8; (CHECKSUM_BLOCK_SIZE + 100) as usize];
        let sums = block_checksums(&data);
        assert_eq!(sums.len(), 2);
        assert_eq!(sums[0], crc32c::crc32c(&data[..CHECKSUM_BLOCK_SIZE as usize]));
        assert_eq!(sums[1], crc32c::crc32c(&data[CHECKSUM_BLOCK_SIZE as usize..]));
    }

    #[test]
    fn happy_recovery_single_round() {
        let mut rig = TestRig::new();
        let size = (200 << 10) + 100;
        rig.readers.set_recovered_data(size);

        rig.submit(recovery_op(20, 5));
        let op = rig.response();
        assert_eq!(op.status, None);
        assert_eq!(op.chunk_version, 5);
        assert_eq!(rig.store.replicated_size(ChunkId(20)), Some(size as i64));
        assert_eq!(rig.store.stable_version(ChunkId(20)), Some(5));

        let snap = rig.counters();
        assert_eq!(snap.recovery_total, 1);
        assert_eq!(snap.recovery_error, 0);
        assert_eq!(snap.active_jobs, 0);
    }

    #[test]
    fn recovery_loops_until_short_read() {
        let mut rig = TestRig::new();
        // Cap the quota so the read size drops to one checksum block,
        // forcing several rounds before the terminal short read.
        rig.buffers.set_quota(4 * CHECKSUM_BLOCK_SIZE);
        let size = (3 * CHECKSUM_BLOCK_SIZE + 4196) as usize;
        rig.readers.set_recovered_data(size);

        rig.submit(recovery_op(21, 2));
        let op = rig.response();
        assert_eq!(op.status, None);
        assert_eq!(rig.store.replicated_size(ChunkId(21)), Some(size as i64));
        // Three aligned writes, then the unaligned terminal write.
        let writes = rig.store.writes(ChunkId(21));
        assert_eq!(writes.len(), 4);
        assert_eq!(writes[0].checksums.len(), 1);
        assert!(writes[3].checksums.is_empty());
        assert_eq!(writes[3].data.len(), 4196);
    }

    #[test]
    fn recovered_blocks_carry_fresh_checksums() {
        let mut rig = TestRig::new();
        let size = (2 * CHECKSUM_BLOCK_SIZE) as usize;
        rig.readers.set_recovered_data(size);

        rig.submit(recovery_op(22, 2));
        let op = rig.response();
        assert_eq!(op.status, None);
        let writes = rig.store.writes(ChunkId(22));
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].checksums, block_checksums(&writes[0].data));
    }

    #[test]
    fn invalid_stripes_reported_to_owner() {
        let mut rig = TestRig::new();
        let mut report = Vec::new();
        report.extend_from_slice(&2i32.to_le_bytes());
        report.extend_from_slice(&42i64.to_le_bytes());
        report.extend_from_slice(&7i64.to_le_bytes());
        rig.readers.fail_with_invalid_stripes(
            EngineError::Fault("invalid stripes".to_string()),
            report,
        );

        rig.submit(recovery_op(23, 2));
        let op = rig.response();
        assert!(op.status.is_some());
        assert_eq!(op.invalid_stripe_idx, "2 42 7");
        assert_eq!(op.chunk_version, -1);
        assert_eq!(rig.counters().recovery_error, 1);
        // The partial replica went back for discard.
        assert_eq!(rig.store.done_status(ChunkId(23)), Some(false));
    }

    #[test]
    #[should_panic(expected = "invalid chunk")]
    fn panic_on_invalid_chunk_aborts() {
        let mut config = Config::default();
        config.rs_reader.panic_on_invalid_chunk = true;
        let mut rig = TestRig::with_config(config);
        let mut report = Vec::new();
        report.extend_from_slice(&1i32.to_le_bytes());
        report.extend_from_slice(&5i64.to_le_bytes());
        report.extend_from_slice(&3i64.to_le_bytes());
        rig.readers.fail_with_invalid_stripes(
            EngineError::Fault("invalid stripes".to_string()),
            report,
        );
        // The op carries a positive file size, so a bad stripe report
        // is treated as data loss and aborts.
        rig.submit(recovery_op(26, 2));
    }

    #[test]
    fn meta_address_reset_and_open_recorded() {
        let mut rig = TestRig::new();
        rig.readers.set_recovered_data(1000);

        rig.submit(recovery_op(24, 2));
        let op = rig.response();
        assert_eq!(op.status, None);
        // The meta client was pointed at the configured host and the
        // port carried by the op before the reader opened.
        let servers = rig.readers.meta_servers_set();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].host, "meta.example");
        assert_eq!(servers[0].port, 30000);
        let opens = rig.readers.opens();
        assert_eq!(opens.len(), 1);
        assert!(opens[0].skip_holes);
        assert_eq!(opens[0].chunk_offset, CHUNK_SIZE);
    }

    #[test]
    fn unreachable_meta_server_fails_job() {
        let mut rig = TestRig::new();
        rig.readers.fail_set_server();

        rig.submit(recovery_op(25, 2));
        let op = rig.response();
        assert!(matches!(op.status, Some(EngineError::HostUnreachable(_))));
        assert_eq!(rig.counters().recovery_error, 1);
    }
}
