//! Striped reader interface for Reed-Solomon recovery.
//!
//! The reader is backed by a metadata server client owned by the job's
//! client thread; all calls into a reader happen on that thread and its
//! completions are delivered there.

use bytes::Bytes;

use crate::config::{MetaClientConfig, Properties, RsReaderConfig};
use crate::error::EngineError;

use super::bridge::EventSender;
use super::op::{FileId, ServerLocation};

#[derive(Debug, Clone)]
pub struct StripedOpenSpec {
    pub file_id: FileId,
    pub path: String,
    pub file_size: i64,
    pub stripe_size: i64,
    pub num_stripes: i64,
    pub num_recovery_stripes: i64,
    /// Missing stripes read as zeros instead of failing the read.
    pub skip_holes: bool,
    /// Byte offset of the chunk being rebuilt within the file.
    pub chunk_offset: i64,
    /// Starting RPC sequence number for this reader.
    pub initial_seq: i64,
}

/// Completion of one striped read, posted as
/// `JobEvent::StripedReadDone`.
///
/// `offset` echoes the chunk-relative offset of the request. On failure
/// `data` may instead carry the stripes the reader found invalid,
/// encoded as little-endian `(i32 index, i64 chunk-id, i64 version)`
/// triples.
#[derive(Debug, Clone)]
pub struct StripedReadCompletion {
    pub status: Result<(), EngineError>,
    pub offset: i64,
    pub size: i64,
    pub data: Bytes,
    pub request_id: u64,
}

pub trait StripedReader: Send {
    /// Issues a read of `num_bytes` at the chunk-relative `offset`. An
    /// immediate error means no completion will be delivered.
    fn read(
        &mut self,
        num_bytes: i64,
        offset: i64,
        request_id: u64,
        done: EventSender,
    ) -> Result<(), EngineError>;

    /// Starts closing the reader; it may stay active while buffered
    /// reads drain.
    fn close(&mut self);

    fn is_active(&self) -> bool;
}

/// Metadata server client owned by one client thread and shared by the
/// recovery jobs pinned there.
pub trait MetaClient: Send {
    fn server_location(&self) -> ServerLocation;

    /// Points the client at `location`, optionally failing pending ops.
    fn set_server(
        &mut self,
        location: &ServerLocation,
        cancel_pending_ops: bool,
    ) -> Result<(), EngineError>;

    /// Installs refreshed authentication parameters.
    fn set_auth_params(&mut self, params: &Properties) -> Result<(), EngineError>;
}

pub trait StripedReaderFactory: Send + Sync {
    fn create_meta_client(&self, config: &MetaClientConfig) -> Box<dyn MetaClient>;

    fn open(
        &self,
        meta: &mut dyn MetaClient,
        spec: &StripedOpenSpec,
        config: &RsReaderConfig,
    ) -> Result<Box<dyn StripedReader>, EngineError>;
}
