//! Local chunk store interface.
//!
//! The store owns the node's chunk table and dirty directory. A replica
//! under construction is allocated at version 0 and stays out of the
//! chunk table until the final version bump; on restart the store
//! discards version-0 chunks, which is what makes a crash mid-job safe.

use bytes::Bytes;

use crate::error::EngineError;

use super::bridge::EventSender;
use super::op::{ChunkId, FileId};

/// Exclusive handle to an allocated chunk file. Held by the job from
/// `alloc_chunk` until ownership transfers back through
/// [`ChunkStore::replication_done`].
#[derive(Debug, PartialEq, Eq)]
pub struct ChunkFileHandle(u64);

impl ChunkFileHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct AllocChunkRequest {
    pub file_id: FileId,
    pub chunk_id: ChunkId,
    /// Always 0 for a replica under construction.
    pub chunk_version: i64,
    pub min_storage_tier: u8,
    pub being_replicated: bool,
    pub target_version: i64,
}

#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub chunk_id: ChunkId,
    pub chunk_version: i64,
    pub offset: i64,
    pub data: Bytes,
    /// One crc32c per checksum block; empty for the terminal unaligned
    /// write, which the store checksums itself.
    pub checksums: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub size: i64,
    pub version: i64,
}

pub trait ChunkStore: Send + Sync {
    /// Allocates a local chunk for the replica. `AlreadyExists` means a
    /// readable chunk at the target version is already present.
    fn alloc_chunk(&self, req: &AllocChunkRequest) -> Result<ChunkFileHandle, EngineError>;

    /// Queues a write; completion arrives as `JobEvent::WriteDone` with
    /// the byte count. An immediate error means nothing was queued.
    fn write_chunk(
        &self,
        req: WriteRequest,
        handle: &ChunkFileHandle,
        done: EventSender,
    ) -> Result<(), EngineError>;

    /// Makes the replica durable at its final version; completion
    /// arrives as `JobEvent::VersionChangeDone` once the version change
    /// lands on disk.
    fn change_chunk_vers(
        &self,
        chunk_id: ChunkId,
        chunk_version: i64,
        stable: bool,
        handle: &ChunkFileHandle,
        done: EventSender,
    ) -> Result<(), EngineError>;

    /// Ends the job's ownership of the chunk file: on success the store
    /// registers the chunk, on failure it discards the partial replica.
    fn replication_done(
        &self,
        chunk_id: ChunkId,
        status: Result<(), EngineError>,
        handle: ChunkFileHandle,
    );

    fn get_chunk_info(&self, chunk_id: ChunkId) -> Option<ChunkInfo>;
}
