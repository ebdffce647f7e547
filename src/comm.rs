//! Communicators: the caller-facing handles for one logical stream, and the engine-side state
//!  behind them.
//!
//! A listening communicator only waits for one incoming connection. Sending and receiving
//!  communicators are the data path, each bound to one remote endpoint and one stream tag, and
//!  each owning a pool of request slots.

use std::fmt::{Debug, Formatter};

use crate::buffers::slot_pool::{SlotIndex, SlotPool};
use crate::config::{DeviceId, EngineConfig};
use crate::fabric::{FabricAddr, MAX_EP_ADDR};
use crate::request::{Owner, RequestSlot};
use crate::tag::Tag;

/// Identifies a communicator's state inside the engine
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct CommKey(usize);

impl Debug for CommKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "comm#{}", self.0)
    }
}

impl CommKey {
    pub fn from_raw(value: usize) -> CommKey {
        CommKey(value)
    }

    pub fn to_raw(&self) -> usize {
        self.0
    }
}

pub(crate) type HandshakeBuf = Box<[u8; MAX_EP_ADDR]>;

pub(crate) struct ListenState {
    pub tag: Tag,
    pub dev: DeviceId,
    pub accepted: bool,
    /// a single slot for the handshake receive
    pub requests: SlotPool<RequestSlot>,
    pub accept_request: Option<SlotIndex>,
    /// receives the connecting peer's endpoint name
    pub handshake: HandshakeBuf,
}

impl ListenState {
    pub fn new(tag: Tag, dev: DeviceId) -> ListenState {
        ListenState {
            tag,
            dev,
            accepted: false,
            requests: SlotPool::new(1),
            accept_request: None,
            handshake: Box::new([0; MAX_EP_ADDR]),
        }
    }
}

pub(crate) struct SendState {
    pub tag: Tag,
    pub dev: DeviceId,
    pub remote: FabricAddr,
    pub num_inflight: usize,
    pub requests: SlotPool<RequestSlot>,
    /// bounds the number of this communicator's sends parked in the retry queue
    pub pending_entries: SlotPool<()>,
    pub connect_request: Option<SlotIndex>,
    /// our own endpoint name, sent to the peer's listener
    pub handshake: HandshakeBuf,
}

impl SendState {
    pub fn new(tag: Tag, dev: DeviceId, remote: FabricAddr, config: &EngineConfig, local_ep_name: &[u8]) -> SendState {
        let mut handshake = Box::new([0; MAX_EP_ADDR]);
        let len = local_ep_name.len().min(MAX_EP_ADDR);
        handshake[..len].copy_from_slice(&local_ep_name[..len]);

        SendState {
            tag,
            dev,
            remote,
            num_inflight: 0,
            requests: SlotPool::new(config.max_requests),
            pending_entries: SlotPool::new(config.max_pending_sends),
            connect_request: None,
            handshake,
        }
    }
}

pub(crate) struct RecvState {
    pub tag: Tag,
    pub dev: DeviceId,
    pub remote: FabricAddr,
    pub num_inflight: usize,
    pub requests: SlotPool<RequestSlot>,
}

impl RecvState {
    pub fn new(tag: Tag, dev: DeviceId, remote: FabricAddr, config: &EngineConfig) -> RecvState {
        RecvState {
            tag,
            dev,
            remote,
            num_inflight: 0,
            requests: SlotPool::new(config.max_requests),
        }
    }
}

pub(crate) enum CommState {
    Listen(ListenState),
    Send(SendState),
    Recv(RecvState),
}

impl CommState {
    pub fn requests(&self) -> &SlotPool<RequestSlot> {
        match self {
            CommState::Listen(s) => &s.requests,
            CommState::Send(s) => &s.requests,
            CommState::Recv(s) => &s.requests,
        }
    }

    pub fn requests_mut(&mut self) -> &mut SlotPool<RequestSlot> {
        match self {
            CommState::Listen(s) => &mut s.requests,
            CommState::Send(s) => &mut s.requests,
            CommState::Recv(s) => &mut s.requests,
        }
    }

    /// Requests that hold a slot, i.e. were not yet observed in a terminal state. A
    ///  communicator can only be closed when this is zero.
    pub fn num_unreleased(&self) -> usize {
        self.requests().num_in_use()
    }

    /// `None` for listeners, which have no data path
    pub fn num_inflight_mut(&mut self) -> Option<&mut usize> {
        match self {
            CommState::Listen(_) => None,
            CommState::Send(s) => Some(&mut s.num_inflight),
            CommState::Recv(s) => Some(&mut s.num_inflight),
        }
    }

    pub fn is_owned_by(&self, owner: Owner) -> bool {
        matches!((self, owner),
            (CommState::Listen(_), Owner::Listen(_)) |
            (CommState::Send(_), Owner::Send(_)) |
            (CommState::Recv(_), Owner::Recv(_)))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CommState::Listen(_) => "listen",
            CommState::Send(_) => "send",
            CommState::Recv(_) => "recv",
        }
    }
}

/// Waits for a single incoming connection, see [crate::engine::Engine::accept]
#[derive(Debug)]
pub struct ListenComm {
    pub(crate) key: CommKey,
    pub(crate) tag: Tag,
    pub(crate) dev: DeviceId,
}

#[derive(Debug)]
pub struct SendComm {
    pub(crate) key: CommKey,
    pub(crate) tag: Tag,
    pub(crate) dev: DeviceId,
}

#[derive(Debug)]
pub struct RecvComm {
    pub(crate) key: CommKey,
    pub(crate) tag: Tag,
    pub(crate) dev: DeviceId,
}

macro_rules! comm_accessors {
    ($($t:ty),*) => {
        $(
            impl $t {
                pub fn key(&self) -> CommKey {
                    self.key
                }

                pub fn tag(&self) -> Tag {
                    self.tag
                }

                pub fn dev(&self) -> DeviceId {
                    self.dev
                }
            }
        )*
    }
}
comm_accessors!(ListenComm, SendComm, RecvComm);
