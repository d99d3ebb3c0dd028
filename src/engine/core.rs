//! The engine object: shared state, worker and client threads, and the
//! public control surface.
//!
//! One engine instance runs per storage node. All global mutable state
//! (the in-flight registry, the authentication parameter block, the
//! round-robin thread cursor) lives behind one dispatcher mutex on an
//! explicit object, so tests instantiate a fresh engine.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::thread::JoinHandle;

use crossbeam::channel::{Sender, bounded, unbounded};

use crate::config::{Config, Properties};
use crate::error::EngineError;

use super::bridge::{Command, RouteId, run_thread};
use super::metrics::{Counters, CountersSnapshot};
use super::op::{ChunkId, ReplicateChunkOp, ResponseSink};
use super::peer::PeerResolver;
use super::quota::BufferManager;
use super::registry::InFlightRegistry;
use super::store::ChunkStore;
use super::striper::StripedReaderFactory;

/// External collaborators the engine drives.
pub struct EngineDeps {
    pub store: Arc<dyn ChunkStore>,
    pub buffers: Arc<dyn BufferManager>,
    pub peers: Arc<dyn PeerResolver>,
    pub readers: Arc<dyn StripedReaderFactory>,
    pub responses: Arc<dyn ResponseSink>,
    /// Hostname of the metadata server this node is registered with;
    /// recovery jobs point their meta client at it.
    pub meta_server_host: String,
}

/// Authentication parameters for the striped reader's metadata client.
/// The update count is monotone; client threads that observed an older
/// value refresh before their next reader open.
#[derive(Default)]
pub(crate) struct AuthParams {
    pub props: Properties,
    pub update_count: u64,
}

/// State behind the dispatcher mutex.
#[derive(Default)]
pub(crate) struct Shared {
    pub registry: InFlightRegistry,
    pub auth: AuthParams,
    pub last_recovery_idx: usize,
}

pub(crate) struct Routes {
    pub worker: Sender<Command>,
    pub clients: Vec<Sender<Command>>,
}

pub(crate) struct EngineCore {
    pub shared: Mutex<Shared>,
    pub counters: Counters,
    pub config: RwLock<Config>,
    pub deps: EngineDeps,
    pub routes: OnceLock<Routes>,
    pub next_job_seq: AtomicU64,
}

impl EngineCore {
    pub fn new(deps: EngineDeps, config: Config) -> Self {
        Self {
            shared: Mutex::new(Shared::default()),
            counters: Counters::default(),
            config: RwLock::new(config),
            deps,
            routes: OnceLock::new(),
            next_job_seq: AtomicU64::new(0),
        }
    }

    pub fn routes(&self) -> &Routes {
        self.routes.get().expect("engine routes initialized")
    }
}

/// Chunk replication and recovery engine.
///
/// `submit` hands a replicate-chunk op to the worker thread; the op
/// comes back through the [`ResponseSink`] exactly once. Recovery jobs
/// are spread round-robin over `client_threads` dedicated threads.
pub struct Engine {
    core: Arc<EngineCore>,
    threads: Vec<JoinHandle<()>>,
}

impl Engine {
    pub fn new(deps: EngineDeps, config: Config, client_threads: usize) -> Engine {
        let core = Arc::new(EngineCore::new(deps, config));
        let (worker_tx, worker_rx) = unbounded();
        let mut client_txs = Vec::with_capacity(client_threads);
        let mut client_rxs = Vec::with_capacity(client_threads);
        for _ in 0..client_threads {
            let (tx, rx) = unbounded();
            client_txs.push(tx);
            client_rxs.push(rx);
        }
        core.routes
            .set(Routes {
                worker: worker_tx,
                clients: client_txs,
            })
            .unwrap_or_else(|_| unreachable!("routes set once"));

        let mut threads = Vec::with_capacity(client_threads + 1);
        let worker_core = core.clone();
        threads.push(
            std::thread::Builder::new()
                .name("chunkrepl-worker".to_string())
                .spawn(move || run_thread(worker_core, RouteId::Worker, worker_rx))
                .expect("spawn worker thread"),
        );
        for (i, rx) in client_rxs.into_iter().enumerate() {
            let client_core = core.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("chunkrepl-client-{i}"))
                    .spawn(move || run_thread(client_core, RouteId::Client(i), rx))
                    .expect("spawn client thread"),
            );
        }
        Engine { core, threads }
    }

    /// Queues a replicate-chunk op. After shutdown the op is returned
    /// immediately as cancelled.
    pub fn submit(&self, op: Box<ReplicateChunkOp>) {
        if let Err(err) = self.core.routes().worker.send(Command::Submit(op))
            && let Command::Submit(mut op) = err.0
        {
            op.status = Some(EngineError::Cancelled);
            op.chunk_version = -1;
            self.core.deps.responses.submit(op);
        }
    }

    /// Cancels the active job for `chunk_id` when its effective target
    /// version matches `target_version` (negative matches any).
    /// Returns whether a cancellation was issued.
    pub fn cancel(&self, chunk_id: ChunkId, target_version: i64) -> bool {
        let (done, rx) = bounded(1);
        if self
            .core
            .routes()
            .worker
            .send(Command::CancelByVersion {
                chunk: chunk_id,
                target_version,
                done,
            })
            .is_err()
        {
            return false;
        }
        rx.recv().unwrap_or(false)
    }

    /// Cancels every active job.
    pub fn cancel_all(&self) {
        let (done, rx) = bounded(1);
        if self
            .core
            .routes()
            .worker
            .send(Command::CancelAll { done })
            .is_ok()
        {
            let _ = rx.recv();
        }
    }

    /// Folds a live property batch into the configuration.
    /// `rsReader.auth.*` keys update the authentication parameter block
    /// and bump its update counter.
    pub fn set_parameters(&self, props: &Properties) {
        {
            let mut config = self.core.config.write().expect("config lock poisoned");
            config.apply_properties(props);
        }
        let auth = props.with_prefix("rsReader.auth.");
        if !auth.is_empty() {
            let mut shared = self.core.shared.lock().expect("dispatcher lock poisoned");
            shared.auth.props.merge_from(&auth);
            shared.auth.update_count += 1;
        }
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.core.counters.snapshot()
    }

    /// Number of jobs currently registered.
    pub fn active_replications(&self) -> usize {
        self.core
            .shared
            .lock()
            .expect("dispatcher lock poisoned")
            .registry
            .len()
    }

    /// Cancels everything and stops the worker and client threads.
    pub fn shutdown(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.cancel_all();
        let routes = self.core.routes();
        let _ = routes.worker.send(Command::Shutdown);
        for client in &routes.clients {
            let _ = client.send(Command::Shutdown);
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_properties_bump_update_counter() {
        let core = EngineCore::new(crate::test_harness::test_deps().0, Config::default());
        let engine = Engine {
            core: Arc::new(core),
            threads: Vec::new(),
        };
        engine
            .core
            .routes
            .set(Routes {
                worker: unbounded().0,
                clients: Vec::new(),
            })
            .unwrap_or_else(|_| unreachable!());

        let mut props = Properties::new();
        props.set("rsReader.maxRetryCount", "5");
        engine.set_parameters(&props);
        assert_eq!(
            engine.core.shared.lock().unwrap().auth.update_count,
            0,
            "non-auth keys must not bump the auth counter"
        );
        assert_eq!(
            engine.core.config.read().unwrap().rs_reader.max_retry_count,
            5
        );

        props.set("rsReader.auth.psk.keyId", "k1");
        engine.set_parameters(&props);
        let shared = engine.core.shared.lock().unwrap();
        assert_eq!(shared.auth.update_count, 1);
        assert_eq!(shared.auth.props.get("psk.keyId"), Some("k1"));
    }
}
