#![forbid(unsafe_code)]

//! Chunk replication and recovery engine for a distributed file system
//! storage node.
//!
//! The metadata server instructs a storage node to materialise a local
//! replica of a chunk either by copying it from a designated peer node
//! (replication) or by reading the surviving stripes of a Reed-Solomon
//! stripe group and reconstructing the missing chunk (recovery). This
//! crate owns the in-flight job registry, the buffer-quota admission
//! gate, both transfer state machines, and the completion/cancellation
//! protocol; the chunk store, disk I/O buffer manager, peer RPC client,
//! and striped reader are external collaborators expressed as traits.

pub mod config;
pub mod engine;
pub mod error;

pub mod test_harness;

pub use config::{Config, Properties};
pub use engine::{
    CHECKSUM_BLOCK_SIZE, CHUNK_SIZE, ChunkFileHandle, ChunkId, CountersSnapshot, Engine,
    EngineDeps, FileId, JobEvent, JobId, ReplicateChunkOp, ServerLocation, StriperType,
};
pub use error::EngineError;

pub type Result<T> = std::result::Result<T, EngineError>;
