//! Peer storage node RPC interface for single-source replication.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::EngineError;

use super::bridge::EventSender;
use super::op::{ChunkId, ServerLocation};

/// Size and version of a chunk as reported by the source node. The
/// source is authoritative for both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMeta {
    pub size: i64,
    pub version: i64,
}

#[derive(Debug, Clone)]
pub struct PeerReadRequest {
    pub chunk_id: ChunkId,
    pub chunk_version: i64,
    pub offset: i64,
    pub num_bytes: i64,
    /// Ask the source to serve the read without re-verifying its disk
    /// checksums. Only set for checksum-block aligned reads.
    pub skip_verify_disk_checksum: bool,
}

#[derive(Debug, Clone)]
pub struct PeerReadReply {
    pub data: Bytes,
    /// One crc32c per checksum block covered by `data`.
    pub checksums: Vec<u32>,
}

/// RPC client bound to one peer. Completions are posted back to the
/// requesting job as `JobEvent::MetaDone` / `JobEvent::ReadDone`.
pub trait PeerClient: Send + Sync {
    fn location(&self) -> ServerLocation;

    fn get_chunk_metadata(&self, chunk_id: ChunkId, read_verify: bool, done: EventSender);

    fn read(&self, req: PeerReadRequest, done: EventSender);
}

/// Credentials forwarded when connecting to the peer.
#[derive(Debug, Clone, Default)]
pub struct PeerAccess {
    pub token: String,
    pub key: String,
    pub chunk_access: String,
    pub allow_clear_text: bool,
}

/// Finds or creates the connection to a peer; `pooled` selects the
/// node's shared connection pool over a dedicated connection.
pub trait PeerResolver: Send + Sync {
    fn resolve(
        &self,
        location: &ServerLocation,
        access: &PeerAccess,
        pooled: bool,
    ) -> Result<Arc<dyn PeerClient>, EngineError>;
}
