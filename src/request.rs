use std::fmt::{Debug, Formatter};

use tracing::trace;

use crate::buffers::slot_pool::SlotIndex;
use crate::comm::CommKey;
use crate::config::DeviceId;
use crate::error::EngineError;
use crate::fabric::Context;
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// Lifecycle of a request:
///
/// ```ascii
/// Created --post accepted--> Pending --completion--> Completed
///    |  \                       \
///    |   (parked for retry,      --error completion--> Error
///    |    stays Created)
///    +--permanent post failure--> Error
/// ```
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum RequestState {
    #[default]
    Created,
    Pending,
    Completed,
    Error,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Error)
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Direction {
    #[default]
    Send,
    Recv,
}

/// The communicator a request belongs to. This is fixed when the request is created.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Owner {
    Listen(CommKey),
    Send(CommKey),
    Recv(CommKey),
}

impl Owner {
    pub fn comm_key(&self) -> CommKey {
        match self {
            Owner::Listen(key) | Owner::Send(key) | Owner::Recv(key) => *key,
        }
    }
}

/// The engine side of a request, living in its communicator's request pool
#[derive(Clone, Debug, Default)]
pub(crate) struct RequestSlot {
    pub state: RequestState,
    pub direction: Direction,
    pub dev: DeviceId,
    /// length of the buffer the request was posted with
    pub posted_len: usize,
    /// number of bytes transferred, valid once the request is completed
    pub size: usize,
    /// provider error code for requests in state Error
    pub error_code: Option<i32>,
}

impl RequestSlot {
    /// Created -> Pending, when the fabric accepted the post
    pub fn mark_posted(&mut self) -> Result<(), EngineError> {
        match self.state {
            RequestState::Created => {
                self.state = RequestState::Pending;
                Ok(())
            }
            other => Err(EngineError::ProtocolViolation(format!("request posted in state {:?}", other))),
        }
    }

    /// Applies a completion event. Only pending requests can complete, and each of them
    ///  exactly once.
    pub fn complete(&mut self, len: usize, error_code: Option<i32>) -> Result<(), EngineError> {
        if self.state != RequestState::Pending {
            return Err(EngineError::ProtocolViolation(format!("completion for request in state {:?}", self.state)));
        }

        match error_code {
            None => {
                self.size = match self.direction {
                    Direction::Send => self.posted_len,
                    Direction::Recv => len,
                };
                self.state = RequestState::Completed;
            }
            Some(code) => {
                self.error_code = Some(code);
                self.state = RequestState::Error;
            }
        }
        trace!("request completed: {:?}", self);
        Ok(())
    }

    /// for permanent post failures, from Created
    pub fn fail(&mut self, code: i32) {
        debug_assert!(!self.state.is_terminal());
        self.error_code = Some(code);
        self.state = RequestState::Error;
    }

    pub fn status(&self) -> RequestStatus {
        match self.state {
            RequestState::Created | RequestState::Pending => RequestStatus::Pending,
            RequestState::Completed => RequestStatus::Completed { bytes: self.size },
            RequestState::Error => RequestStatus::Error { code: self.error_code.unwrap_or_default() },
        }
    }
}

/// Locates a request inside the engine: its communicator and its slot in that communicator's
///  request pool. This is packed into the context that is passed to the fabric with every post,
///  so that a completion leads back to its request without any lookup structure.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct RequestKey {
    pub comm: CommKey,
    pub slot: SlotIndex,
}

impl RequestKey {
    pub fn to_context(&self) -> Context {
        let comm: u64 = self.comm.to_raw().safe_cast();
        let slot: u64 = self.slot.to_raw().safe_cast();
        Context::from_raw((comm << 32) | slot)
    }

    pub fn from_context(context: Context) -> RequestKey {
        let raw = context.to_raw();
        let comm: u32 = (raw >> 32).prechecked_cast();
        RequestKey {
            comm: CommKey::from_raw(comm.safe_cast()),
            slot: SlotIndex::from_raw((raw & u32::MAX as u64).prechecked_cast()),
        }
    }
}

/// The caller's handle for an asynchronous send or receive. It is consumed when the request's
///  terminal state is observed through [crate::engine::Engine::test], which also releases its
///  slot.
pub struct Request {
    pub(crate) owner: Owner,
    pub(crate) slot: SlotIndex,
    pub(crate) context: Context,
    pub(crate) dev: DeviceId,
    pub(crate) direction: Direction,
}

impl Debug for Request {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Request{{{:?}, slot:{}, {:?}}}", self.owner, self.slot, self.direction)
    }
}

impl Request {
    pub(crate) fn key(&self) -> RequestKey {
        RequestKey {
            comm: self.owner.comm_key(),
            slot: self.slot,
        }
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn slot(&self) -> SlotIndex {
        self.slot
    }

    pub fn context(&self) -> Context {
        self.context
    }

    pub fn dev(&self) -> DeviceId {
        self.dev
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

/// A request's state as seen by the caller. Requests that are parked for retry are reported as
///  pending.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RequestStatus {
    Pending,
    Completed { bytes: usize },
    Error { code: i32 },
}

#[derive(Debug)]
pub enum PostOutcome {
    /// the fabric accepted the operation
    Posted(Request),
    /// the fabric was out of resources, and the operation is queued for retry. This is not a
    ///  failure - the request completes like any other.
    Deferred(Request),
}

impl PostOutcome {
    pub fn is_deferred(&self) -> bool {
        matches!(self, PostOutcome::Deferred(_))
    }

    pub fn request(&self) -> &Request {
        match self {
            PostOutcome::Posted(r) | PostOutcome::Deferred(r) => r,
        }
    }

    pub fn into_request(self) -> Request {
        match self {
            PostOutcome::Posted(r) | PostOutcome::Deferred(r) => r,
        }
    }
}

#[derive(Debug)]
pub enum TestOutcome {
    /// not done yet - the request is handed back for testing again later
    Pending(Request),
    Done { bytes: usize },
}
