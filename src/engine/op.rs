//! Inbound replicate-chunk operation and identity types.

use std::fmt;

use crate::error::EngineError;

/// File identifier assigned by the metadata server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FileId(pub i64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chunk identifier; at most one replication or recovery job may be
/// active per chunk id at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ChunkId(pub i64);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network endpoint of a storage node.
///
/// A request with a valid location replicates from that peer; an invalid
/// location selects Reed-Solomon recovery instead, with `port` naming
/// the metadata server port the striped reader should use.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerLocation {
    pub host: String,
    pub port: u16,
}

impl ServerLocation {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }
}

impl fmt::Display for ServerLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Striping layout of the file a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StriperType {
    #[default]
    None,
    Rs,
}

/// The replicate-chunk request from the metadata server; doubles as the
/// response carrier. The engine fills `status`, `chunk_version`, and for
/// failed recoveries `invalid_stripe_idx`, then hands the op back
/// through the [`ResponseSink`] exactly once.
#[derive(Debug, Clone, Default)]
pub struct ReplicateChunkOp {
    pub file_id: FileId,
    pub chunk_id: ChunkId,
    pub chunk_version: i64,
    /// Version the replica should end up at; `-1` means "use the source
    /// version".
    pub target_version: i64,
    pub location: ServerLocation,
    /// Opaque per-chunk credential forwarded to the peer.
    pub chunk_access: String,
    /// Whitespace-delimited `token key` pair authenticating this node to
    /// the peer; both present or both absent.
    pub chunk_server_access: String,
    pub allow_clear_text: bool,
    pub min_storage_tier: u8,

    // Recovery geometry.
    pub path_name: String,
    pub file_size: i64,
    pub chunk_offset: i64,
    pub striper_type: StriperType,
    pub stripe_size: i64,
    pub num_stripes: i64,
    pub num_recovery_stripes: i64,

    /// Terminal status; `None` is success.
    pub status: Option<EngineError>,
    /// Stripes the reader flagged as invalid, as space separated
    /// `index chunk-id version` triples for the metadata server.
    pub invalid_stripe_idx: String,
}

impl ReplicateChunkOp {
    pub fn is_recovery(&self) -> bool {
        !self.location.is_valid()
    }

    /// The version the finished replica must carry: the explicit target
    /// when one was requested, otherwise `current`.
    pub fn effective_target_version(&self, current: i64) -> i64 {
        if self.target_version >= 0 {
            self.target_version
        } else {
            current
        }
    }
}

/// Operation response queue; receives each submitted op exactly once.
pub trait ResponseSink: Send + Sync {
    fn submit(&self, op: Box<ReplicateChunkOp>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_validity() {
        assert!(ServerLocation::new("peer1", 2000).is_valid());
        assert!(!ServerLocation::new("", 2000).is_valid());
        assert!(!ServerLocation::new("peer1", 0).is_valid());
    }

    #[test]
    fn effective_target_version_prefers_explicit() {
        let mut op = ReplicateChunkOp::default();
        op.target_version = 7;
        assert_eq!(op.effective_target_version(3), 7);
        op.target_version = -1;
        assert_eq!(op.effective_target_version(3), 3);
    }
}
