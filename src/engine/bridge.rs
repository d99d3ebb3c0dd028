//! Cross-thread job execution.
//!
//! Every job is owned by exactly one thread at a time: the worker
//! thread (which also owns registry mutation and all replication jobs)
//! or one of the recovery client threads. Threads run the same command
//! loop over a crossbeam channel; completions enter as [`JobEvent`]s
//! addressed to a job id, and recovery state transitions cross threads
//! as bridge commands. A recovery job migrates from the worker thread
//! to its pinned client thread exactly once, at start.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLockReadGuard;

use crossbeam::channel::{Receiver, Sender};

use crate::config::Config;

use super::core::{EngineCore, EngineDeps};
use super::job::{self, Job, JobEvent, JobId, Step};
use super::op::ChunkId;
use super::{dispatch, recover};

/// Identifies an owning thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RouteId {
    Worker,
    Client(usize),
}

/// Recovery bridge transition. `None -> Start` and `None -> Read` are
/// the only legal forward transitions; `Cancel` is legal from any
/// state and may be posted repeatedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NextState {
    Start,
    Read,
    Cancel,
}

/// Bridge state a recovery job is currently in on its owning thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum BridgeState {
    #[default]
    None,
    Start,
    Read,
}

pub(crate) enum Command {
    Submit(Box<super::op::ReplicateChunkOp>),
    Event { job: JobId, event: JobEvent },
    Bridge { job: JobId, next: NextState },
    Adopt(Box<Job>),
    CancelAll { done: Sender<()> },
    CancelByVersion {
        chunk: ChunkId,
        target_version: i64,
        done: Sender<bool>,
    },
    Shutdown,
}

/// Posts completion events to the owning thread of one job. Handed to
/// collaborators when an asynchronous operation is issued.
#[derive(Debug, Clone)]
pub struct EventSender {
    job: JobId,
    tx: Sender<Command>,
}

impl EventSender {
    pub fn job(&self) -> JobId {
        self.job
    }

    /// Delivers a completion; silently dropped when the engine has shut
    /// down.
    pub fn send(&self, event: JobEvent) {
        let _ = self.tx.send(Command::Event {
            job: self.job,
            event,
        });
    }
}

pub(crate) type Jobs = HashMap<JobId, Box<Job>>;

/// Per-thread execution context.
pub(crate) struct ThreadCtx {
    pub core: Arc<EngineCore>,
    pub route: RouteId,
    pub tx: Sender<Command>,
    /// Metadata server client owned by this thread, shared by the
    /// recovery jobs pinned here.
    pub meta: RefCell<Box<dyn super::striper::MetaClient>>,
    /// Authentication parameter version the meta client has seen.
    pub auth_seen: Cell<u64>,
}

impl ThreadCtx {
    pub fn deps(&self) -> &EngineDeps {
        &self.core.deps
    }

    pub fn config(&self) -> RwLockReadGuard<'_, Config> {
        self.core.config.read().expect("config lock poisoned")
    }

    pub fn sender_for(&self, job: JobId) -> EventSender {
        EventSender {
            job,
            tx: self.tx.clone(),
        }
    }

    pub fn send_to(&self, route: RouteId, cmd: Command) {
        let routes = self.core.routes();
        let tx = match route {
            RouteId::Worker => &routes.worker,
            RouteId::Client(i) => &routes.clients[i],
        };
        let _ = tx.send(cmd);
    }
}

/// Parks the job again unless the handler finished or released it.
pub(crate) fn step(jobs: &mut Jobs, step: Step) {
    if let Step::Park(job) = step {
        jobs.insert(job.core.id, job);
    }
}

/// The command loop run by the worker thread and every client thread.
pub(crate) fn run_thread(core: Arc<EngineCore>, route: RouteId, rx: Receiver<Command>) {
    let meta = {
        let config = core.config.read().expect("config lock poisoned");
        core.deps.readers.create_meta_client(&config.rs_reader.meta)
    };
    let tx = {
        let routes = core.routes();
        match route {
            RouteId::Worker => routes.worker.clone(),
            RouteId::Client(i) => routes.clients[i].clone(),
        }
    };
    let ctx = ThreadCtx {
        core,
        route,
        tx,
        meta: RefCell::new(meta),
        auth_seen: Cell::new(0),
    };
    let mut jobs: Jobs = HashMap::new();
    while let Ok(cmd) = rx.recv() {
        if !handle_command(&ctx, &mut jobs, cmd) {
            break;
        }
    }
}

/// Handles one command; returns false on shutdown.
pub(crate) fn handle_command(ctx: &ThreadCtx, jobs: &mut Jobs, cmd: Command) -> bool {
    match cmd {
        Command::Submit(op) => {
            debug_assert_eq!(ctx.route, RouteId::Worker, "submit outside the worker thread");
            dispatch::handle_submit(ctx, jobs, op);
            true
        }
        Command::Event { job, event } => {
            if let Some(job) = jobs.remove(&job) {
                step(jobs, job::on_event(ctx, job, event));
            }
            true
        }
        Command::Bridge { job, next } => {
            handle_bridge_command(ctx, jobs, job, next);
            true
        }
        Command::Adopt(job) => {
            debug_assert_eq!(job.core.pinned, ctx.route, "job adopted by the wrong thread");
            step(jobs, handle_bridge(ctx, job));
            true
        }
        Command::CancelAll { done } => {
            dispatch::cancel_all(ctx, jobs);
            let _ = done.send(());
            true
        }
        Command::CancelByVersion {
            chunk,
            target_version,
            done,
        } => {
            let _ = done.send(dispatch::cancel_by_version(ctx, jobs, chunk, target_version));
            true
        }
        Command::Shutdown => false,
    }
}

fn handle_bridge_command(ctx: &ThreadCtx, jobs: &mut Jobs, job_id: JobId, next: NextState) {
    match next {
        NextState::Cancel => {
            // Cancels may be posted repeatedly and may outlive the job.
            if let Some(job) = jobs.remove(&job_id) {
                step(jobs, recover::cancel_recover(ctx, job));
            }
        }
        NextState::Start | NextState::Read => {
            panic!("recovery: unexpected cross-thread transition to {next:?}");
        }
    }
}

/// Moves a recovery job into `next`, running inline when this thread
/// already owns it, otherwise migrating the job to its pinned client
/// thread.
pub(crate) fn enqueue_owned(ctx: &ThreadCtx, mut job: Box<Job>, next: NextState) -> Step {
    if job.core.cancel.pending() {
        let state = job.recover_mut().bridge_state;
        tracing::debug!(
            chunk = %job.core.chunk_id,
            ?state,
            "ignoring transition, cancel pending",
        );
        return Step::Park(job);
    }
    let state = job.recover_mut().bridge_state;
    let target = match next {
        NextState::Start => BridgeState::Start,
        NextState::Read => BridgeState::Read,
        NextState::Cancel => {
            panic!("recovery: cancel must go through the registry handle");
        }
    };
    if state != BridgeState::None {
        panic!("recovery: invalid state transition from {state:?} to {next:?}");
    }
    job.recover_mut().bridge_state = target;

    if job.core.pinned == ctx.route {
        return handle_bridge(ctx, job);
    }
    {
        let mut shared = ctx.core.shared.lock().expect("dispatcher lock poisoned");
        shared
            .registry
            .set_route(job.core.chunk_id, job.core.id, job.core.pinned);
    }
    let pinned = job.core.pinned;
    ctx.send_to(pinned, Command::Adopt(job));
    Step::Done
}

/// Dispatches a recovery job on its owning thread: a latched cancel
/// wins over whatever state was queued.
pub(crate) fn handle_bridge(ctx: &ThreadCtx, mut job: Box<Job>) -> Step {
    if job.core.cancel.pending() {
        return recover::cancel_recover(ctx, job);
    }
    match job.recover_mut().bridge_state {
        BridgeState::Start => recover::handle_start(ctx, job),
        BridgeState::Read => recover::handle_read(ctx, job),
        BridgeState::None => panic!("recovery: invalid state"),
    }
}
