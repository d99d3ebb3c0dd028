//! Deterministic collaborator fakes for engine tests.
//!
//! Each fake implements one external interface and answers
//! synchronously by posting the completion event back to the
//! requesting job's thread, so a test drives an entire job by pumping
//! one command queue. Failure injection is per-call and one-shot.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, unbounded};

use crate::config::{MetaClientConfig, Properties, RsReaderConfig};
use crate::engine::{
    AllocChunkRequest, BufferManager, ChunkFileHandle, ChunkId, ChunkInfo, ChunkMeta, ChunkStore,
    EngineDeps, EventSender, JobEvent, JobId, MetaClient, PeerAccess, PeerClient, PeerReadReply,
    PeerReadRequest, PeerResolver, QuotaWaiter, ReplicateChunkOp, ResponseSink, ServerLocation,
    StripedOpenSpec, StripedReadCompletion, StripedReader, StripedReaderFactory, WriteRequest,
};
use crate::error::EngineError;

fn pattern_data(seed: i64, len: usize) -> Bytes {
    (0..len)
        .map(|i| ((i as i64).wrapping_mul(131).wrapping_add(seed * 17) % 251) as u8)
        .collect::<Vec<u8>>()
        .into()
}

fn block_checksums(data: &[u8]) -> Vec<u32> {
    data.chunks(crate::engine::CHECKSUM_BLOCK_SIZE as usize)
        .map(crc32c::crc32c)
        .collect()
}

/// How an injected chunk store write fails.
#[derive(Debug, Clone)]
pub enum WriteFailure {
    /// `write_chunk` itself returns the error.
    Sync(EngineError),
    /// The write is accepted and the completion carries the error.
    Async(EngineError),
}

#[derive(Default)]
struct StoreState {
    next_handle: u64,
    allocs: Vec<AllocChunkRequest>,
    outstanding: HashSet<u64>,
    writes: HashMap<i64, Vec<WriteRequest>>,
    version_changes: Vec<(i64, i64, bool)>,
    done_calls: Vec<(i64, bool, u64)>,
    stable: HashMap<i64, ChunkInfo>,
    fail_alloc: Option<EngineError>,
    fail_write: Option<WriteFailure>,
}

/// In-memory chunk store recording every interaction.
#[derive(Default)]
pub struct TestChunkStore {
    state: Mutex<StoreState>,
}

impl TestChunkStore {
    pub fn fail_next_alloc(&self, err: EngineError) {
        self.state.lock().expect("store lock").fail_alloc = Some(err);
    }

    pub fn fail_next_write(&self, failure: WriteFailure) {
        self.state.lock().expect("store lock").fail_write = Some(failure);
    }

    pub fn writes(&self, chunk: ChunkId) -> Vec<WriteRequest> {
        self.state
            .lock()
            .expect("store lock")
            .writes
            .get(&chunk.0)
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_written(&self, chunk: ChunkId) -> i64 {
        self.writes(chunk)
            .iter()
            .map(|req| req.data.len() as i64)
            .sum()
    }

    /// Size of the chunk once its version change made it stable.
    pub fn replicated_size(&self, chunk: ChunkId) -> Option<i64> {
        self.state
            .lock()
            .expect("store lock")
            .stable
            .get(&chunk.0)
            .map(|info| info.size)
    }

    pub fn stable_version(&self, chunk: ChunkId) -> Option<i64> {
        self.state
            .lock()
            .expect("store lock")
            .stable
            .get(&chunk.0)
            .map(|info| info.version)
    }

    /// Whether the last `replication_done` for the chunk was a success.
    pub fn done_status(&self, chunk: ChunkId) -> Option<bool> {
        self.state
            .lock()
            .expect("store lock")
            .done_calls
            .iter()
            .rev()
            .find(|(id, _, _)| *id == chunk.0)
            .map(|(_, ok, _)| *ok)
    }

    pub fn alloc_count(&self) -> usize {
        self.state.lock().expect("store lock").allocs.len()
    }

    pub fn done_count(&self) -> usize {
        self.state.lock().expect("store lock").done_calls.len()
    }

    pub fn no_outstanding_handles(&self) -> bool {
        self.state.lock().expect("store lock").outstanding.is_empty()
    }
}

impl ChunkStore for TestChunkStore {
    fn alloc_chunk(&self, req: &AllocChunkRequest) -> Result<ChunkFileHandle, EngineError> {
        let mut state = self.state.lock().expect("store lock");
        if let Some(err) = state.fail_alloc.take() {
            return Err(err);
        }
        state.allocs.push(req.clone());
        state.next_handle += 1;
        let id = state.next_handle;
        state.outstanding.insert(id);
        Ok(ChunkFileHandle::new(id))
    }

    fn write_chunk(
        &self,
        req: WriteRequest,
        _handle: &ChunkFileHandle,
        done: EventSender,
    ) -> Result<(), EngineError> {
        let failure = {
            let mut state = self.state.lock().expect("store lock");
            state.fail_write.take()
        };
        match failure {
            Some(WriteFailure::Sync(err)) => return Err(err),
            Some(WriteFailure::Async(err)) => {
                done.send(JobEvent::WriteDone(Err(err)));
                return Ok(());
            }
            None => {}
        }
        let len = req.data.len() as i64;
        self.state
            .lock()
            .expect("store lock")
            .writes
            .entry(req.chunk_id.0)
            .or_default()
            .push(req);
        done.send(JobEvent::WriteDone(Ok(len)));
        Ok(())
    }

    fn change_chunk_vers(
        &self,
        chunk_id: ChunkId,
        chunk_version: i64,
        stable: bool,
        _handle: &ChunkFileHandle,
        done: EventSender,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().expect("store lock");
        state.version_changes.push((chunk_id.0, chunk_version, stable));
        let size = state
            .writes
            .get(&chunk_id.0)
            .map(|writes| {
                writes
                    .iter()
                    .map(|req| req.offset + req.data.len() as i64)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        state.stable.insert(
            chunk_id.0,
            ChunkInfo {
                size,
                version: chunk_version,
            },
        );
        drop(state);
        done.send(JobEvent::VersionChangeDone(Ok(())));
        Ok(())
    }

    fn replication_done(
        &self,
        chunk_id: ChunkId,
        status: Result<(), EngineError>,
        handle: ChunkFileHandle,
    ) {
        let mut state = self.state.lock().expect("store lock");
        state.outstanding.remove(&handle.id());
        state.done_calls.push((chunk_id.0, status.is_ok(), handle.id()));
        if status.is_err() {
            state.stable.remove(&chunk_id.0);
        }
    }

    fn get_chunk_info(&self, chunk_id: ChunkId) -> Option<ChunkInfo> {
        self.state
            .lock()
            .expect("store lock")
            .stable
            .get(&chunk_id.0)
            .copied()
    }
}

#[derive(Default)]
struct BufState {
    quota: i64,
    defer: bool,
    parked: Vec<(QuotaWaiter, i64)>,
    released: Vec<(JobId, i64)>,
    cancelled: Vec<JobId>,
}

/// Buffer manager fake: grants synchronously by default, or parks
/// waiters for a later `grant_all`.
pub struct TestBufferManager {
    state: Mutex<BufState>,
}

impl Default for TestBufferManager {
    fn default() -> Self {
        Self {
            state: Mutex::new(BufState {
                quota: 1 << 40,
                ..BufState::default()
            }),
        }
    }
}

impl TestBufferManager {
    pub fn set_quota(&self, quota: i64) {
        self.state.lock().expect("buffer lock").quota = quota;
    }

    pub fn set_defer(&self, defer: bool) {
        self.state.lock().expect("buffer lock").defer = defer;
    }

    pub fn parked_count(&self) -> usize {
        self.state.lock().expect("buffer lock").parked.len()
    }

    /// Resumes every parked waiter.
    pub fn grant_all(&self) {
        let parked = {
            let mut state = self.state.lock().expect("buffer lock");
            std::mem::take(&mut state.parked)
        };
        for (waiter, bytes) in parked {
            waiter.granted(bytes);
        }
    }

    pub fn cancelled_waits(&self) -> Vec<JobId> {
        self.state.lock().expect("buffer lock").cancelled.clone()
    }

    pub fn releases(&self) -> Vec<(JobId, i64)> {
        self.state.lock().expect("buffer lock").released.clone()
    }
}

impl BufferManager for TestBufferManager {
    fn max_client_quota(&self) -> i64 {
        self.state.lock().expect("buffer lock").quota
    }

    fn over_quota(&self, bytes: i64) -> bool {
        bytes > self.state.lock().expect("buffer lock").quota
    }

    fn try_reserve(&self, waiter: QuotaWaiter, bytes: i64) -> bool {
        let mut state = self.state.lock().expect("buffer lock");
        if state.defer {
            state.parked.push((waiter, bytes));
            false
        } else {
            true
        }
    }

    fn cancel_wait(&self, job: JobId) -> bool {
        let mut state = self.state.lock().expect("buffer lock");
        let before = state.parked.len();
        state.parked.retain(|(waiter, _)| waiter.job() != job);
        state.cancelled.push(job);
        state.parked.len() != before
    }

    fn release(&self, job: JobId, bytes: i64) {
        self.state
            .lock()
            .expect("buffer lock")
            .released
            .push((job, bytes));
    }
}

struct PeerChunk {
    version: i64,
    data: Option<Bytes>,
    size: i64,
}

#[derive(Default)]
struct PeerState {
    chunks: HashMap<i64, PeerChunk>,
    meta_requests: Vec<(ChunkId, bool)>,
    read_requests: Vec<PeerReadRequest>,
    fail_meta: Option<EngineError>,
    fail_reads: VecDeque<EngineError>,
    truncate_next: Option<i64>,
    drop_checksums_next: bool,
    hold_meta: bool,
    held_meta: Vec<(ChunkId, EventSender)>,
}

/// Source storage node fake serving deterministic chunk data.
#[derive(Default)]
pub struct TestPeer {
    state: Mutex<PeerState>,
}

impl TestPeer {
    /// Serves `size` bytes of deterministic data for the chunk.
    pub fn set_chunk(&self, chunk: ChunkId, version: i64, size: i64) {
        self.state.lock().expect("peer lock").chunks.insert(
            chunk.0,
            PeerChunk {
                version,
                data: Some(pattern_data(chunk.0, size as usize)),
                size,
            },
        );
    }

    /// Metadata answers, but any read would find no data; for requests
    /// expected to fail before reading.
    pub fn set_chunk_meta_only(&self, chunk: ChunkId, version: i64, size: i64) {
        self.state.lock().expect("peer lock").chunks.insert(
            chunk.0,
            PeerChunk {
                version,
                data: None,
                size,
            },
        );
    }

    pub fn fail_next_meta(&self, err: EngineError) {
        self.state.lock().expect("peer lock").fail_meta = Some(err);
    }

    pub fn fail_next_read(&self, err: EngineError) {
        self.state.lock().expect("peer lock").fail_reads.push_back(err);
    }

    pub fn truncate_next_read(&self, len: i64) {
        self.state.lock().expect("peer lock").truncate_next = Some(len);
    }

    pub fn drop_checksums_on_next_read(&self) {
        self.state.lock().expect("peer lock").drop_checksums_next = true;
    }

    /// Parks metadata requests instead of answering, keeping their
    /// jobs in flight until `release_held`.
    pub fn hold_meta(&self, hold: bool) {
        self.state.lock().expect("peer lock").hold_meta = hold;
    }

    pub fn release_held(&self) {
        let held = {
            let mut state = self.state.lock().expect("peer lock");
            std::mem::take(&mut state.held_meta)
        };
        for (chunk, done) in held {
            self.answer_meta(chunk, done);
        }
    }

    pub fn read_requests(&self) -> Vec<PeerReadRequest> {
        self.state.lock().expect("peer lock").read_requests.clone()
    }

    pub fn meta_request_count(&self) -> usize {
        self.state.lock().expect("peer lock").meta_requests.len()
    }

    pub fn chunk_data(&self, chunk: ChunkId) -> Option<Bytes> {
        self.state
            .lock()
            .expect("peer lock")
            .chunks
            .get(&chunk.0)
            .and_then(|c| c.data.clone())
    }

    fn answer_meta(&self, chunk: ChunkId, done: EventSender) {
        let reply = {
            let mut state = self.state.lock().expect("peer lock");
            if let Some(err) = state.fail_meta.take() {
                Err(err)
            } else {
                match state.chunks.get(&chunk.0) {
                    None => Err(EngineError::Peer(format!("no such chunk: {chunk}"))),
                    Some(entry) => Ok(ChunkMeta {
                        size: entry.size,
                        version: entry.version,
                    }),
                }
            }
        };
        done.send(JobEvent::MetaDone(reply));
    }
}

impl PeerClient for TestPeer {
    fn location(&self) -> ServerLocation {
        ServerLocation::new("peer.example", 20000)
    }

    fn get_chunk_metadata(&self, chunk_id: ChunkId, read_verify: bool, done: EventSender) {
        {
            let mut state = self.state.lock().expect("peer lock");
            state.meta_requests.push((chunk_id, read_verify));
            if state.hold_meta {
                state.held_meta.push((chunk_id, done));
                return;
            }
        }
        self.answer_meta(chunk_id, done);
    }

    fn read(&self, req: PeerReadRequest, done: EventSender) {
        let reply = {
            let mut state = self.state.lock().expect("peer lock");
            state.read_requests.push(req.clone());
            if let Some(err) = state.fail_reads.pop_front() {
                Err(err)
            } else {
                let truncate = state.truncate_next.take();
                let drop_checksums = std::mem::take(&mut state.drop_checksums_next);
                match state.chunks.get(&req.chunk_id.0).and_then(|c| c.data.as_ref()) {
                    None => Err(EngineError::Peer(format!(
                        "no data for chunk: {}",
                        req.chunk_id
                    ))),
                    Some(data) => {
                        let start = (req.offset.max(0) as usize).min(data.len());
                        let mut end = (start + req.num_bytes as usize).min(data.len());
                        if let Some(limit) = truncate {
                            end = end.min(start + limit as usize);
                        }
                        let slice = data.slice(start..end);
                        let checksums = if drop_checksums {
                            Vec::new()
                        } else {
                            block_checksums(&slice)
                        };
                        Ok(PeerReadReply {
                            data: slice,
                            checksums,
                        })
                    }
                }
            }
        };
        done.send(JobEvent::ReadDone(reply));
    }
}

/// Resolver handing out one shared [`TestPeer`].
pub struct TestPeerResolver {
    peer: Arc<TestPeer>,
    state: Mutex<ResolverState>,
}

#[derive(Default)]
struct ResolverState {
    fail: Option<EngineError>,
    resolutions: Vec<(ServerLocation, bool)>,
}

impl TestPeerResolver {
    pub fn new(peer: Arc<TestPeer>) -> Self {
        Self {
            peer,
            state: Mutex::new(ResolverState::default()),
        }
    }

    pub fn fail_next(&self, err: EngineError) {
        self.state.lock().expect("resolver lock").fail = Some(err);
    }

    pub fn resolutions(&self) -> Vec<(ServerLocation, bool)> {
        self.state.lock().expect("resolver lock").resolutions.clone()
    }
}

impl PeerResolver for TestPeerResolver {
    fn resolve(
        &self,
        location: &ServerLocation,
        _access: &PeerAccess,
        pooled: bool,
    ) -> Result<Arc<dyn PeerClient>, EngineError> {
        let mut state = self.state.lock().expect("resolver lock");
        state.resolutions.push((location.clone(), pooled));
        if let Some(err) = state.fail.take() {
            return Err(err);
        }
        Ok(self.peer.clone())
    }
}

#[derive(Default)]
struct StriperState {
    recovered: Bytes,
    fail_open: Option<EngineError>,
    fail_set_server: bool,
    fail_read: Option<(EngineError, Vec<u8>)>,
    opens: Vec<StripedOpenSpec>,
    set_servers: Vec<ServerLocation>,
    auth_params: Vec<Properties>,
    reads: Vec<(i64, i64)>,
}

/// Striped reader stack fake: the "reconstructed" chunk content is
/// preloaded and served back read by read.
#[derive(Default)]
pub struct TestStripedFactory {
    state: Arc<Mutex<StriperState>>,
}

impl TestStripedFactory {
    pub fn set_recovered_data(&self, len: usize) {
        self.state.lock().expect("striper lock").recovered = pattern_data(7, len);
    }

    pub fn set_recovered_bytes(&self, data: Bytes) {
        self.state.lock().expect("striper lock").recovered = data;
    }

    pub fn fail_open(&self, err: EngineError) {
        self.state.lock().expect("striper lock").fail_open = Some(err);
    }

    pub fn fail_set_server(&self) {
        self.state.lock().expect("striper lock").fail_set_server = true;
    }

    /// The next read fails with `err` and a buffer carrying the
    /// invalid-stripe report.
    pub fn fail_with_invalid_stripes(&self, err: EngineError, report: Vec<u8>) {
        self.state.lock().expect("striper lock").fail_read = Some((err, report));
    }

    pub fn opens(&self) -> Vec<StripedOpenSpec> {
        self.state.lock().expect("striper lock").opens.clone()
    }

    pub fn meta_servers_set(&self) -> Vec<ServerLocation> {
        self.state.lock().expect("striper lock").set_servers.clone()
    }

    pub fn auth_params_seen(&self) -> Vec<Properties> {
        self.state.lock().expect("striper lock").auth_params.clone()
    }

    pub fn read_count(&self) -> usize {
        self.state.lock().expect("striper lock").reads.len()
    }
}

struct TestMetaClient {
    state: Arc<Mutex<StriperState>>,
    location: ServerLocation,
}

impl MetaClient for TestMetaClient {
    fn server_location(&self) -> ServerLocation {
        self.location.clone()
    }

    fn set_server(
        &mut self,
        location: &ServerLocation,
        _cancel_pending_ops: bool,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().expect("striper lock");
        state.set_servers.push(location.clone());
        if state.fail_set_server {
            return Err(EngineError::Timeout("connect refused".to_string()));
        }
        self.location = location.clone();
        Ok(())
    }

    fn set_auth_params(&mut self, params: &Properties) -> Result<(), EngineError> {
        self.state
            .lock()
            .expect("striper lock")
            .auth_params
            .push(params.clone());
        Ok(())
    }
}

struct TestStripedReader {
    state: Arc<Mutex<StriperState>>,
    active: bool,
}

impl StripedReader for TestStripedReader {
    fn read(
        &mut self,
        num_bytes: i64,
        offset: i64,
        request_id: u64,
        done: EventSender,
    ) -> Result<(), EngineError> {
        let completion = {
            let mut state = self.state.lock().expect("striper lock");
            state.reads.push((num_bytes, offset));
            if let Some((err, report)) = state.fail_read.take() {
                StripedReadCompletion {
                    status: Err(err),
                    offset,
                    size: 0,
                    data: Bytes::from(report),
                    request_id,
                }
            } else {
                let start = (offset.max(0) as usize).min(state.recovered.len());
                let end = (start + num_bytes as usize).min(state.recovered.len());
                let data = state.recovered.slice(start..end);
                StripedReadCompletion {
                    status: Ok(()),
                    offset,
                    size: data.len() as i64,
                    data,
                    request_id,
                }
            }
        };
        done.send(JobEvent::StripedReadDone(completion));
        Ok(())
    }

    fn close(&mut self) {
        self.active = false;
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

impl StripedReaderFactory for TestStripedFactory {
    fn create_meta_client(&self, _config: &MetaClientConfig) -> Box<dyn MetaClient> {
        Box::new(TestMetaClient {
            state: self.state.clone(),
            location: ServerLocation::default(),
        })
    }

    fn open(
        &self,
        _meta: &mut dyn MetaClient,
        spec: &StripedOpenSpec,
        _config: &RsReaderConfig,
    ) -> Result<Box<dyn StripedReader>, EngineError> {
        let mut state = self.state.lock().expect("striper lock");
        state.opens.push(spec.clone());
        if let Some(err) = state.fail_open.take() {
            return Err(err);
        }
        Ok(Box::new(TestStripedReader {
            state: self.state.clone(),
            active: true,
        }))
    }
}

/// Response queue fake over a channel, so threaded tests can block on
/// the next response.
pub struct TestResponseSink {
    tx: Sender<Box<ReplicateChunkOp>>,
    rx: Receiver<Box<ReplicateChunkOp>>,
}

impl Default for TestResponseSink {
    fn default() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }
}

impl TestResponseSink {
    pub fn try_take(&self) -> Option<Box<ReplicateChunkOp>> {
        self.rx.try_recv().ok()
    }

    pub fn wait(&self, timeout: Duration) -> Option<Box<ReplicateChunkOp>> {
        self.rx.recv_timeout(timeout).ok()
    }
}

impl ResponseSink for TestResponseSink {
    fn submit(&self, op: Box<ReplicateChunkOp>) {
        let _ = self.tx.send(op);
    }
}

/// Every fake wired into one [`EngineDeps`].
pub struct Fakes {
    pub store: Arc<TestChunkStore>,
    pub buffers: Arc<TestBufferManager>,
    pub peer: Arc<TestPeer>,
    pub resolver: Arc<TestPeerResolver>,
    pub readers: Arc<TestStripedFactory>,
    pub responses: Arc<TestResponseSink>,
}

pub fn test_deps() -> (EngineDeps, Fakes) {
    let store = Arc::new(TestChunkStore::default());
    let buffers = Arc::new(TestBufferManager::default());
    let peer = Arc::new(TestPeer::default());
    let resolver = Arc::new(TestPeerResolver::new(peer.clone()));
    let readers = Arc::new(TestStripedFactory::default());
    let responses = Arc::new(TestResponseSink::default());
    let deps = EngineDeps {
        store: store.clone(),
        buffers: buffers.clone(),
        peers: resolver.clone(),
        readers: readers.clone(),
        responses: responses.clone(),
        meta_server_host: "meta.example".to_string(),
    };
    (
        deps,
        Fakes {
            store,
            buffers,
            peer,
            resolver,
            readers,
            responses,
        },
    )
}
