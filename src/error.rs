use thiserror::Error;

use crate::fabric::FabricError;
use crate::buffers::slot_pool::SlotIndex;

/// Per-operation failures. Setup failures (configuration, provider discovery) are reported
///  through `anyhow` by [crate::engine::Engine::new] instead.
///
/// NB: 'deferred' is not an error - a post that could not be handed to the fabric right away
///  is reported as [crate::request::PostOutcome::Deferred], and a connection that is not
///  established yet as [crate::engine::Progress::Deferred].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// No request slot (or pending entry slot) is free right now - retry later
    #[error("request pool exhausted ({capacity} slots in use)")]
    PoolExhausted { capacity: usize },
    #[error("tag space exhausted: {max_tag} stream tags issued")]
    TagSpaceExhausted { max_tag: u64 },
    #[error("fabric operation failed permanently: {0}")]
    FabricPermanent(FabricError),
    /// An internal invariant was broken (unknown completion context, double release etc.).
    ///  This implies corruption elsewhere and poisons the engine.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("engine is poisoned after a protocol violation")]
    EndpointPoisoned,
    #[error("unknown device {dev}")]
    UnknownDevice { dev: u32 },
    #[error("listener with tag {tag:#x} has already accepted a connection")]
    AlreadyAccepted { tag: u64 },
    #[error("communicator still has {outstanding} outstanding fabric operations")]
    CommBusy { outstanding: usize },
    #[error("invalid connection handle: {0}")]
    InvalidHandle(String),
}

impl EngineError {
    pub(crate) fn double_release(slot: SlotIndex) -> EngineError {
        EngineError::ProtocolViolation(format!("slot {} released while not in use", slot))
    }

    /// Recoverable errors leave the engine usable; everything else is either terminal for one
    ///  request or for the whole engine
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::PoolExhausted { .. })
    }
}

/// Returned by the `close_*` operations when a communicator can not be closed yet. The
///  communicator is handed back so the caller can drive its requests to completion and retry.
#[derive(Debug)]
pub struct CloseError<C> {
    pub error: EngineError,
    pub comm: C,
}
