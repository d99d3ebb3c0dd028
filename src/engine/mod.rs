//! The replication and recovery engine.
//!
//! Submodules:
//! - `registry` - at-most-one active job per chunk, pre-emption
//! - `quota` - buffer-quota admission gate
//! - `replicate` - single-source replication state machine
//! - `recover` - Reed-Solomon recovery state machine
//! - `bridge` - thread loops and cross-thread job migration
//! - `job` - shared job shell, write alignment, finalization
//! - `dispatch` - request validation and path selection
//! - `metrics` - counters and metric emission

pub(crate) mod bridge;
pub(crate) mod core;
pub(crate) mod dispatch;
#[cfg(test)]
pub(crate) mod harness;
pub(crate) mod job;
pub(crate) mod metrics;
pub(crate) mod op;
pub(crate) mod peer;
pub(crate) mod quota;
pub(crate) mod recover;
pub(crate) mod registry;
pub(crate) mod replicate;
pub(crate) mod store;
pub(crate) mod striper;

pub use bridge::EventSender;
pub use self::core::{Engine, EngineDeps};
pub use job::{JobEvent, JobId};
pub use metrics::{
    CountersSnapshot, JobOutcome, JobPath, MetricEvent, MetricSink, MetricValue, set_sink,
};
pub use op::{ChunkId, FileId, ReplicateChunkOp, ResponseSink, ServerLocation, StriperType};
pub use peer::{ChunkMeta, PeerAccess, PeerClient, PeerReadReply, PeerReadRequest, PeerResolver};
pub use quota::{BufferManager, MIN_BUFFER_RESERVE, QuotaWaiter};
pub use store::{AllocChunkRequest, ChunkFileHandle, ChunkInfo, ChunkStore, WriteRequest};
pub use striper::{
    MetaClient, StripedOpenSpec, StripedReadCompletion, StripedReader, StripedReaderFactory,
};

/// Fixed chunk size of the file system.
pub const CHUNK_SIZE: i64 = 64 << 20;

/// Unit over which block checksums are computed; all aligned I/O runs
/// in multiples of this, except a terminal tail.
pub const CHECKSUM_BLOCK_SIZE: i64 = 64 << 10;

/// Default peer read size: one megabyte, aligned up to the checksum
/// block.
pub const DEFAULT_REPLICATION_READ_SIZE: i64 =
    ((1 << 20) + CHECKSUM_BLOCK_SIZE - 1) / CHECKSUM_BLOCK_SIZE * CHECKSUM_BLOCK_SIZE;

pub const MIN_STRIPE_SIZE: i64 = 4 << 10;
pub const MAX_STRIPE_SIZE: i64 = CHUNK_SIZE;
pub const STRIPE_ALIGNMENT: i64 = 4 << 10;

/// Allocation unit of the disk I/O buffer pool.
pub const IO_BUFFER_SIZE: i64 = 4 << 10;
