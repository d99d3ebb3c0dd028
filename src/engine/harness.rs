//! Single-threaded engine rig for deterministic state machine tests.
//!
//! Runs the worker loop by hand: commands queue on one channel and
//! `pump` drains it on the test thread, so every schedule is explicit
//! and repeatable. The collaborator fakes come from `test_harness`.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::Arc;

use crossbeam::channel::{Receiver, unbounded};

use crate::config::Config;
use crate::test_harness::{
    TestBufferManager, TestChunkStore, TestPeer, TestPeerResolver, TestResponseSink,
    TestStripedFactory, test_deps,
};

use super::bridge::{self, Command, RouteId, ThreadCtx};
use super::core::{EngineCore, Routes};
use super::dispatch;
use super::job::Job;
use super::metrics::CountersSnapshot;
use super::op::{ChunkId, ReplicateChunkOp, ServerLocation, StriperType};
use super::{CHECKSUM_BLOCK_SIZE, CHUNK_SIZE};

pub(crate) struct TestRig {
    pub ctx: ThreadCtx,
    pub rx: Receiver<Command>,
    pub jobs: bridge::Jobs,
    pub store: Arc<TestChunkStore>,
    pub buffers: Arc<TestBufferManager>,
    pub peer: Arc<TestPeer>,
    pub resolver: Arc<TestPeerResolver>,
    pub readers: Arc<TestStripedFactory>,
    pub responses: Arc<TestResponseSink>,
}

impl TestRig {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let (deps, fakes) = test_deps();
        let core = Arc::new(EngineCore::new(deps, config));
        let (tx, rx) = unbounded();
        core.routes
            .set(Routes {
                worker: tx.clone(),
                clients: Vec::new(),
            })
            .unwrap_or_else(|_| unreachable!("routes set once"));
        let meta = {
            let config = core.config.read().expect("config lock poisoned");
            core.deps.readers.create_meta_client(&config.rs_reader.meta)
        };
        let ctx = ThreadCtx {
            core,
            route: RouteId::Worker,
            tx,
            meta: RefCell::new(meta),
            auth_seen: Cell::new(0),
        };
        Self {
            ctx,
            rx,
            jobs: HashMap::new(),
            store: fakes.store,
            buffers: fakes.buffers,
            peer: fakes.peer,
            resolver: fakes.resolver,
            readers: fakes.readers,
            responses: fakes.responses,
        }
    }

    pub fn submit(&mut self, op: ReplicateChunkOp) {
        dispatch::handle_submit(&self.ctx, &mut self.jobs, Box::new(op));
        self.pump();
    }

    /// Builds the job like `submit` would, lets the test poke at it,
    /// then runs it.
    pub fn submit_prepared(&mut self, op: ReplicateChunkOp, prepare: impl FnOnce(&mut Job)) {
        if let Some(mut job) = dispatch::prepare_job(&self.ctx, Box::new(op)) {
            prepare(&mut job);
            dispatch::run_job(&self.ctx, &mut self.jobs, job);
        }
        self.pump();
    }

    /// Drains queued commands until the loop is idle.
    pub fn pump(&mut self) {
        while let Ok(cmd) = self.rx.try_recv() {
            bridge::handle_command(&self.ctx, &mut self.jobs, cmd);
        }
    }

    pub fn response(&mut self) -> Box<ReplicateChunkOp> {
        self.pump();
        self.responses.try_take().expect("no response ready")
    }

    pub fn try_response(&mut self) -> Option<Box<ReplicateChunkOp>> {
        self.pump();
        self.responses.try_take()
    }

    pub fn cancel(&mut self, chunk: ChunkId, target_version: i64) -> bool {
        let hit = dispatch::cancel_by_version(&self.ctx, &mut self.jobs, chunk, target_version);
        self.pump();
        hit
    }

    pub fn cancel_all(&mut self) {
        dispatch::cancel_all(&self.ctx, &mut self.jobs);
        self.pump();
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.ctx.core.counters.snapshot()
    }

    /// Registered jobs, per the in-flight registry.
    pub fn active(&self) -> usize {
        self.ctx
            .core
            .shared
            .lock()
            .expect("dispatcher lock poisoned")
            .registry
            .len()
    }
}

pub(crate) fn replication_op(chunk: i64, version: i64) -> ReplicateChunkOp {
    ReplicateChunkOp {
        file_id: super::FileId(chunk * 100),
        chunk_id: ChunkId(chunk),
        chunk_version: version,
        target_version: -1,
        location: ServerLocation::new("peer.example", 20000),
        ..ReplicateChunkOp::default()
    }
}

pub(crate) fn recovery_op(chunk: i64, version: i64) -> ReplicateChunkOp {
    ReplicateChunkOp {
        file_id: super::FileId(chunk * 100),
        chunk_id: ChunkId(chunk),
        chunk_version: version,
        target_version: -1,
        // Invalid host selects recovery; the port names the metadata
        // server port.
        location: ServerLocation::new("", 30000),
        path_name: format!("/data/file-{chunk}"),
        file_size: 1 << 30,
        chunk_offset: CHUNK_SIZE,
        striper_type: StriperType::Rs,
        stripe_size: CHECKSUM_BLOCK_SIZE,
        num_stripes: 3,
        num_recovery_stripes: 2,
        ..ReplicateChunkOp::default()
    }
}
