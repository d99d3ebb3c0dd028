//! Request dispatch: access-header parsing, path selection, geometry
//! validation, registry insertion with pre-emption, and quota
//! admission.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use bytes::Bytes;
use rand::Rng;

use crate::error::EngineError;

use super::bridge::{BridgeState, Command, Jobs, NextState, RouteId, ThreadCtx, step};
use super::job::{self, Job, JobCore, JobId, JobKind, ReadOp, WriteOp};
use super::metrics::{JobOutcome, JobPath};
use super::op::{ChunkId, ReplicateChunkOp, ServerLocation, StriperType};
use super::peer::PeerAccess;
use super::quota::{MIN_BUFFER_RESERVE, QuotaWaiter};
use super::recover::{self, RecoverJob};
use super::registry::{CancelCell, InsertOutcome, JobHandle};
use super::replicate::{ReplicateJob, ReplicatePhase};
use super::{
    CHUNK_SIZE, DEFAULT_REPLICATION_READ_SIZE, MAX_STRIPE_SIZE, MIN_STRIPE_SIZE, STRIPE_ALIGNMENT,
};

/// Entry point on the worker thread for a replicate-chunk op.
pub(crate) fn handle_submit(ctx: &ThreadCtx, jobs: &mut Jobs, op: Box<ReplicateChunkOp>) {
    if let Some(job) = prepare_job(ctx, op) {
        run_job(ctx, jobs, job);
    }
}

/// Validates the op and builds the job, or responds with the rejection.
pub(crate) fn prepare_job(ctx: &ThreadCtx, op: Box<ReplicateChunkOp>) -> Option<Box<Job>> {
    tracing::debug!(
        chunk = %op.chunk_id,
        file = %op.file_id,
        recovery = op.is_recovery(),
        "replicate chunk request",
    );
    let path = if op.is_recovery() {
        JobPath::Recovery
    } else {
        JobPath::Replication
    };
    ctx.core.counters.started(path);

    let access = match parse_chunk_server_access(&op.chunk_server_access) {
        Err(err) => {
            reject(ctx, op, path, err);
            return None;
        }
        Ok(access) => access,
    };

    if path == JobPath::Replication {
        let peer_access = PeerAccess {
            token: access.as_ref().map(|(t, _)| t.clone()).unwrap_or_default(),
            key: access.as_ref().map(|(_, k)| k.clone()).unwrap_or_default(),
            chunk_access: op.chunk_access.clone(),
            allow_clear_text: op.allow_clear_text,
        };
        let pooled = ctx.config().replicator.use_connection_pool;
        let peer = match ctx.deps().peers.resolve(&op.location, &peer_access, pooled) {
            Err(err) => {
                tracing::error!(peer = %op.location, %err, "unable to find peer");
                reject(ctx, op, path, err);
                return None;
            }
            Ok(peer) => peer,
        };
        let core = new_job_core(ctx, op, path, RouteId::Worker);
        return Some(Box::new(Job {
            core,
            kind: JobKind::Replicate(ReplicateJob {
                peer,
                phase: ReplicatePhase::Meta,
                skip_verify: false,
            }),
        }));
    }

    if let Err(err) = validate_recovery_geometry(&op) {
        tracing::error!(chunk = %op.chunk_id, %err, "invalid recovery request");
        reject(ctx, op, path, err);
        return None;
    }
    let refresh_auth = access.is_some();
    if let Some((token, key)) = access {
        let mut shared = ctx.core.shared.lock().expect("dispatcher lock poisoned");
        let mut changed = false;
        if shared.auth.props.get("psk.keyId") != Some(token.as_str()) {
            shared.auth.props.set("psk.keyId", token);
            changed = true;
        }
        if shared.auth.props.get("psk.key") != Some(key.as_str()) {
            shared.auth.props.set("psk.key", key);
            changed = true;
        }
        if changed {
            shared.auth.update_count += 1;
        }
    }

    let read_size = recover::read_size_for(
        op.stripe_size,
        op.num_stripes,
        ctx.config().rs_reader.max_read_size,
        ctx.deps().buffers.max_client_quota(),
    );
    let pinned = pick_recovery_route(ctx);
    let initial_seq = i64::from(rand::thread_rng().r#gen::<u32>());
    let core = new_job_core(ctx, op, path, pinned);
    Some(Box::new(Job {
        core,
        kind: JobKind::Recover(Box::new(RecoverJob {
            reader: None,
            read_tail: Bytes::new(),
            read_size,
            read_in_flight: false,
            pending_close: false,
            bridge_state: BridgeState::None,
            refresh_auth,
            meta_location: ServerLocation::default(),
            initial_seq,
        })),
    }))
}

/// Registers the job (pre-empting any active job for the chunk), then
/// passes the buffer-quota gate and starts it.
pub(crate) fn run_job(ctx: &ThreadCtx, jobs: &mut Jobs, mut job: Box<Job>) {
    ctx.core.counters.job_created();
    let handle = job.make_handle();
    let outcome = {
        let mut shared = ctx.core.shared.lock().expect("dispatcher lock poisoned");
        shared.registry.begin_insert(&handle)
    };
    if let InsertOutcome::Preempted(prior) = outcome {
        tracing::info!(
            chunk = %handle.chunk_id,
            peer = %job.peer_name(),
            prior_cancelled = prior.cancel.is_cancelled(),
            "canceling active replication, restarting",
        );
        cancel_handle(ctx, jobs, prior);
        // The prior job's teardown may have vacated or re-filled the
        // slot; either way this job owns it now.
        {
            let mut shared = ctx.core.shared.lock().expect("dispatcher lock poisoned");
            shared.registry.finish_insert(handle.clone());
        }
        if job.core.cancel.is_cancelled() {
            step(jobs, job::terminate(ctx, job, Err(EngineError::Cancelled)));
            return;
        }
    }

    let budget = buffer_budget(&job);
    if ctx.deps().buffers.over_quota(budget) {
        tracing::error!(
            chunk = %job.core.chunk_id,
            peer = %job.peer_name(),
            bytes = budget,
            quota = ctx.deps().buffers.max_client_quota(),
            "over buffer quota",
        );
        step(
            jobs,
            job::terminate(
                ctx,
                job,
                Err(EngineError::OutOfMemory(format!("{budget} bytes"))),
            ),
        );
        return;
    }
    job.core.reserved_bytes = budget;
    let waiter = QuotaWaiter::new(ctx.sender_for(job.core.id));
    if ctx.deps().buffers.try_reserve(waiter, budget) {
        step(jobs, job::start(ctx, job));
    } else {
        tracing::info!(
            chunk = %job.core.chunk_id,
            peer = %job.peer_name(),
            bytes = budget,
            "waiting for buffers",
        );
        job.core.waiting_quota = true;
        jobs.insert(job.core.id, job);
    }
}

fn buffer_budget(job: &Job) -> i64 {
    let required = match &job.kind {
        JobKind::Replicate(_) => DEFAULT_REPLICATION_READ_SIZE,
        JobKind::Recover(state) => {
            let num_stripes = job
                .core
                .owner
                .as_ref()
                .map(|op| op.num_stripes)
                .unwrap_or(0);
            state.read_size * (num_stripes + 1)
        }
    };
    required.max(MIN_BUFFER_RESERVE)
}

/// Cancels the job a registry handle points at, inline when this
/// thread owns it.
pub(crate) fn cancel_handle(ctx: &ThreadCtx, jobs: &mut Jobs, handle: JobHandle) {
    match handle.path {
        JobPath::Replication => {
            debug_assert_eq!(ctx.route, RouteId::Worker);
            if let Some(job) = jobs.remove(&handle.job_id) {
                step(jobs, job::cancel_replicate(ctx, job));
            } else {
                handle.cancel.set_cancelled();
            }
        }
        JobPath::Recovery => {
            if !handle.cancel.latch_pending() {
                return;
            }
            if handle.route == ctx.route {
                if let Some(job) = jobs.remove(&handle.job_id) {
                    step(jobs, recover::cancel_recover(ctx, job));
                }
            } else {
                ctx.send_to(
                    handle.route,
                    Command::Bridge {
                        job: handle.job_id,
                        next: NextState::Cancel,
                    },
                );
            }
        }
    }
}

/// Takes the whole registry and cancels every live entry.
pub(crate) fn cancel_all(ctx: &ThreadCtx, jobs: &mut Jobs) {
    let handles = {
        let mut shared = ctx.core.shared.lock().expect("dispatcher lock poisoned");
        shared.registry.take_all()
    };
    for handle in handles {
        cancel_handle(ctx, jobs, handle);
    }
}

/// Cancels the active job for `chunk_id` when its effective target
/// version matches; returns whether a cancellation was issued.
pub(crate) fn cancel_by_version(
    ctx: &ThreadCtx,
    jobs: &mut Jobs,
    chunk_id: ChunkId,
    target_version: i64,
) -> bool {
    let handle = {
        let mut shared = ctx.core.shared.lock().expect("dispatcher lock poisoned");
        shared.registry.find_for_cancel(chunk_id, target_version)
    };
    match handle {
        None => false,
        Some(handle) => {
            cancel_handle(ctx, jobs, handle);
            true
        }
    }
}

fn reject(ctx: &ThreadCtx, mut op: Box<ReplicateChunkOp>, path: JobPath, err: EngineError) {
    tracing::error!(
        chunk = %op.chunk_id,
        recovery = op.is_recovery(),
        %err,
        "rejecting replicate chunk request",
    );
    ctx.core.counters.finished(path, JobOutcome::Error);
    op.status = Some(err);
    op.chunk_version = -1;
    ctx.deps().responses.submit(op);
}

fn new_job_core(
    ctx: &ThreadCtx,
    op: Box<ReplicateChunkOp>,
    path: JobPath,
    pinned: RouteId,
) -> JobCore {
    let seq = ctx.core.next_job_seq.fetch_add(1, Ordering::Relaxed) + 1;
    JobCore {
        id: JobId {
            chunk: op.chunk_id,
            seq,
        },
        path,
        file_id: op.file_id,
        chunk_id: op.chunk_id,
        chunk_version: op.chunk_version,
        shared_version: Arc::new(AtomicI64::new(op.chunk_version)),
        chunk_size: -1,
        offset: 0,
        owner: Some(op),
        done: false,
        cancel: Arc::new(CancelCell::default()),
        file_handle: None,
        read_op: ReadOp::default(),
        write_op: WriteOp::default(),
        write_in_flight: false,
        finalizing: false,
        waiting_quota: false,
        reserved_bytes: 0,
        pinned,
    }
}

/// Pins a new recovery job to a thread, round-robin over the client
/// threads (slot 0 is the worker thread itself, used only when no
/// client thread is available or recovery threads are disabled).
fn pick_recovery_route(ctx: &ThreadCtx) -> RouteId {
    let count = ctx.core.routes().clients.len() + 1;
    let max_threads = ctx.config().rs_reader.max_recovery_threads;
    let mut shared = ctx.core.shared.lock().expect("dispatcher lock poisoned");
    let mut idx = shared.last_recovery_idx + 1;
    if max_threads.min(count) <= idx {
        idx = if count <= 1 || max_threads == 0 { 0 } else { 1 };
    }
    shared.last_recovery_idx = idx;
    if idx == 0 {
        RouteId::Worker
    } else {
        RouteId::Client(idx - 1)
    }
}

/// Splits the whitespace-delimited `token key` pair; both present or
/// both absent.
fn parse_chunk_server_access(raw: &str) -> Result<Option<(String, String)>, EngineError> {
    let mut parts = raw.split(|c: char| c <= ' ').filter(|part| !part.is_empty());
    match (parts.next(), parts.next()) {
        (None, _) => Ok(None),
        (Some(token), Some(key)) => Ok(Some((token.to_string(), key.to_string()))),
        (Some(_), None) => Err(EngineError::InvalidArgument(
            "malformed chunk access header value".to_string(),
        )),
    }
}

fn validate_recovery_geometry(op: &ReplicateChunkOp) -> Result<(), EngineError> {
    let valid = op.chunk_offset >= 0
        && op.chunk_offset % CHUNK_SIZE == 0
        && op.striper_type == StriperType::Rs
        && op.num_stripes > 0
        && op.num_recovery_stripes > 0
        && op.stripe_size >= MIN_STRIPE_SIZE
        && op.stripe_size <= MAX_STRIPE_SIZE
        && CHUNK_SIZE % op.stripe_size == 0
        && op.stripe_size % STRIPE_ALIGNMENT == 0
        && op.location.port != 0;
    if valid {
        Ok(())
    } else {
        Err(EngineError::InvalidArgument(
            "invalid recovery request geometry".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::harness::{TestRig, recovery_op, replication_op};

    #[test]
    fn access_header_pairs() {
        assert_eq!(parse_chunk_server_access("").unwrap(), None);
        assert_eq!(parse_chunk_server_access("  \t ").unwrap(), None);
        assert_eq!(
            parse_chunk_server_access("tok key").unwrap(),
            Some(("tok".to_string(), "key".to_string()))
        );
        assert_eq!(
            parse_chunk_server_access("  tok \n key  extra").unwrap(),
            Some(("tok".to_string(), "key".to_string()))
        );
        assert!(parse_chunk_server_access("only-token").is_err());
    }

    #[test]
    fn recovery_geometry_checks() {
        let good = recovery_op(1, 2);
        assert!(validate_recovery_geometry(&good).is_ok());

        let mut bad = recovery_op(1, 2);
        bad.stripe_size = CHUNK_SIZE - 1;
        assert!(validate_recovery_geometry(&bad).is_err());

        let mut bad = recovery_op(1, 2);
        bad.chunk_offset = CHUNK_SIZE / 2;
        assert!(validate_recovery_geometry(&bad).is_err());

        let mut bad = recovery_op(1, 2);
        bad.num_recovery_stripes = 0;
        assert!(validate_recovery_geometry(&bad).is_err());

        let mut bad = recovery_op(1, 2);
        bad.striper_type = StriperType::None;
        bad.location.port = 0;
        assert!(validate_recovery_geometry(&bad).is_err());
    }

    #[test]
    fn malformed_access_header_rejected_before_any_job() {
        let mut rig = TestRig::new();
        let mut op = replication_op(30, 2);
        op.chunk_server_access = "token-without-key".to_string();

        rig.submit(op);
        let response = rig.response();
        assert!(matches!(
            response.status,
            Some(EngineError::InvalidArgument(_))
        ));
        let snap = rig.counters();
        assert_eq!(snap.replication_total, 1);
        assert_eq!(snap.replication_error, 1);
        assert_eq!(snap.active_jobs, 0);
        assert!(rig.store.writes(ChunkId(30)).is_empty());
    }

    #[test]
    fn bad_geometry_bumps_recovery_error() {
        let mut rig = TestRig::new();
        let mut op = recovery_op(31, 2);
        op.num_stripes = 0;

        rig.submit(op);
        let response = rig.response();
        assert!(matches!(
            response.status,
            Some(EngineError::InvalidArgument(_))
        ));
        let snap = rig.counters();
        assert_eq!(snap.recovery_total, 1);
        assert_eq!(snap.recovery_error, 1);
    }

    #[test]
    fn over_quota_request_fails_with_out_of_memory() {
        let mut rig = TestRig::new();
        rig.buffers.set_quota(MIN_BUFFER_RESERVE);
        rig.peer.set_chunk(ChunkId(32), 2, 1 << 20);

        rig.submit(replication_op(32, 2));
        let response = rig.response();
        assert!(matches!(response.status, Some(EngineError::OutOfMemory(_))));
        assert_eq!(rig.counters().replication_error, 1);
    }

    #[test]
    fn deferred_grant_resumes_job() {
        let mut rig = TestRig::new();
        rig.buffers.set_defer(true);
        rig.peer.set_chunk(ChunkId(33), 2, 1 << 20);

        rig.submit(replication_op(33, 2));
        assert!(rig.try_response().is_none());
        assert_eq!(rig.buffers.parked_count(), 1);

        rig.buffers.grant_all();
        rig.pump();
        let response = rig.response();
        assert_eq!(response.status, None);
        assert_eq!(rig.store.replicated_size(ChunkId(33)), Some(1 << 20));
    }

    #[test]
    fn preemption_cancels_quota_parked_job() {
        let mut rig = TestRig::new();
        rig.peer.set_chunk(ChunkId(34), 2, 1 << 20);
        rig.buffers.set_defer(true);

        rig.submit(replication_op(34, 2));
        assert_eq!(rig.active(), 1);

        // Second request for the same chunk pre-empts the parked job.
        rig.buffers.set_defer(false);
        rig.submit(replication_op(34, 2));

        let first = rig.response();
        assert_eq!(first.status, Some(EngineError::Cancelled));
        assert_eq!(first.chunk_version, -1);
        let second = rig.response();
        assert_eq!(second.status, None);

        let snap = rig.counters();
        assert_eq!(snap.replication_total, 2);
        assert_eq!(snap.replication_cancel, 1);
        assert_eq!(snap.replication_error, 0);
        assert_eq!(snap.active_jobs, 0);
        // The parked quota wait was withdrawn from the buffer manager.
        assert_eq!(rig.buffers.cancelled_waits().len(), 1);
    }

    #[test]
    fn preemption_cancels_mid_transfer_job() {
        let mut rig = TestRig::new();
        rig.peer.set_chunk(ChunkId(35), 2, 1 << 20);
        rig.peer.hold_meta(true);

        rig.submit(replication_op(35, 2));
        assert!(rig.try_response().is_none());

        rig.peer.hold_meta(false);
        rig.submit(replication_op(35, 2));
        // The new job ran to completion; the held metadata completion
        // now terminates the pre-empted one.
        let second = rig.response();
        assert_eq!(second.status, None);
        rig.peer.release_held();
        rig.pump();
        let first = rig.response();
        assert_eq!(first.status, Some(EngineError::Cancelled));
        assert_eq!(rig.store.replicated_size(ChunkId(35)), Some(1 << 20));
        assert_eq!(rig.counters().replication_cancel, 1);
    }

    #[test]
    fn new_job_cancelled_during_preemption_dies_without_io() {
        let mut rig = TestRig::new();
        rig.peer.set_chunk(ChunkId(36), 2, 1 << 20);
        rig.peer.hold_meta(true);
        rig.submit(replication_op(36, 2));
        let reads_before = rig.peer.read_requests().len();
        let allocs_before = rig.store.alloc_count();

        // Simulate a cancel hitting the new job while the prior one is
        // being torn down: its latch is set before run_job re-inserts.
        rig.peer.hold_meta(false);
        rig.submit_prepared(replication_op(36, 2), |job| {
            job.core.cancel.set_cancelled();
        });
        rig.peer.release_held();
        rig.pump();

        let first = rig.response();
        assert_eq!(first.status, Some(EngineError::Cancelled));
        let second = rig.response();
        assert_eq!(second.status, Some(EngineError::Cancelled));
        // The pre-empted-and-cancelled newcomer did no I/O at all.
        assert_eq!(rig.peer.read_requests().len(), reads_before);
        assert_eq!(rig.store.alloc_count(), allocs_before);
        assert_eq!(rig.counters().replication_cancel, 2);
        assert_eq!(rig.active(), 0);
    }

    #[test]
    fn cancel_by_version_matches_effective_target() {
        let mut rig = TestRig::new();
        rig.peer.set_chunk(ChunkId(37), 4, 1 << 20);
        rig.peer.hold_meta(true);
        rig.submit(replication_op(37, 4));

        assert!(!rig.cancel(ChunkId(37), 9));
        assert!(rig.cancel(ChunkId(37), 4));
        assert!(!rig.cancel(ChunkId(37), 4));

        rig.peer.release_held();
        rig.pump();
        let op = rig.response();
        assert_eq!(op.status, Some(EngineError::Cancelled));
        assert_eq!(rig.counters().replication_cancel, 1);
    }

    #[test]
    fn cancel_all_takes_every_job() {
        let mut rig = TestRig::new();
        rig.peer.set_chunk(ChunkId(38), 2, 1 << 20);
        rig.peer.set_chunk(ChunkId(39), 2, 1 << 20);
        rig.peer.hold_meta(true);
        rig.submit(replication_op(38, 2));
        rig.submit(replication_op(39, 2));
        assert_eq!(rig.active(), 2);

        rig.cancel_all();
        assert_eq!(rig.active(), 0);
        rig.peer.release_held();
        rig.pump();
        assert_eq!(rig.response().status, Some(EngineError::Cancelled));
        assert_eq!(rig.response().status, Some(EngineError::Cancelled));
        assert_eq!(rig.counters().replication_cancel, 2);
    }

    #[test]
    fn every_alloc_pairs_with_exactly_one_replication_done() {
        let mut rig = TestRig::new();
        rig.peer.set_chunk(ChunkId(40), 2, (1 << 20) + 100);
        rig.submit(replication_op(40, 2));
        let _ = rig.response();

        rig.peer.set_chunk(ChunkId(41), 2, 1 << 20);
        rig.peer
            .fail_next_read(EngineError::Timeout("peer".to_string()));
        rig.submit(replication_op(41, 2));
        let _ = rig.response();

        assert_eq!(rig.store.alloc_count(), rig.store.done_count());
        assert!(rig.store.no_outstanding_handles());
    }
}
