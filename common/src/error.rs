//! Error kinds the core surfaces (spec.md §7).

/// Error kinds the write-path and replication/recovery pipelines surface.
///
/// Propagation: `PeerInactive` and single-slave `Transport` failures are
/// absorbed by the replication pipeline (§4.F) — the client call still
/// succeeds once the remaining active quorum acks. `Invalid`/`Overflow`
/// are returned to the client. `Invalid`/index-corruption style errors at
/// the recovery/storage layer halt the owning component rather than
/// panicking the process.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("overflow: {0}")]
    Overflow(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("peer inactive: {0}")]
    PeerInactive(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this class is absorbed by the replication pipeline instead
    /// of being returned to the client (spec.md §7 "Propagation").
    pub fn is_recoverable_in_replication(&self) -> bool {
        matches!(self, Error::PeerInactive(_) | Error::Transport(_))
    }
}
