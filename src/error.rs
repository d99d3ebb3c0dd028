//! Engine error kinds and terminal status classification.

use thiserror::Error;

/// Terminal error for a replication or recovery job.
///
/// Every job finishes through exactly one finalization; the owner op sees
/// at most one of these. Collaborator failures (chunk store, peer RPC,
/// striped reader) are carried in the `Store` and `Peer` variants with
/// the collaborator's message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("buffer quota exceeded: {0}")]
    OutOfMemory(String),

    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    #[error("bad checksum: {0}")]
    BadChecksum(String),

    #[error("short read: got {got} of {expected} at offset {offset}")]
    ShortRead { offset: i64, got: i64, expected: i64 },

    #[error("fault: {0}")]
    Fault(String),

    #[error("canceled")]
    Cancelled,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("readable chunk with target version already exists")]
    AlreadyExists,

    #[error("chunk store: {0}")]
    Store(String),

    #[error("peer: {0}")]
    Peer(String),
}

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }

    /// Short label for log fields and metric dimensions.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidArgument(_) => "invalid_argument",
            EngineError::OutOfMemory(_) => "out_of_memory",
            EngineError::HostUnreachable(_) => "host_unreachable",
            EngineError::BadChecksum(_) => "bad_checksum",
            EngineError::ShortRead { .. } => "short_read",
            EngineError::Fault(_) => "fault",
            EngineError::Cancelled => "canceled",
            EngineError::Timeout(_) => "timeout",
            EngineError::AlreadyExists => "already_exists",
            EngineError::Store(_) => "store",
            EngineError::Peer(_) => "peer",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_classifies() {
        assert!(EngineError::Cancelled.is_cancelled());
        assert!(!EngineError::Fault("boom".to_string()).is_cancelled());
    }

    #[test]
    fn short_read_formats_fields() {
        let err = EngineError::ShortRead {
            offset: 65536,
            got: 100,
            expected: 1024,
        };
        let text = err.to_string();
        assert!(text.contains("100"));
        assert!(text.contains("65536"));
    }
}
