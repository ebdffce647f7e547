//! The connection handle a listener publishes and a connecting peer consumes. It travels
//!  between processes through some external rendezvous channel and is opaque to callers.
//!
//! ```ascii
//!  0: endpoint name (56 bytes, zero padded)
//! 56: stream tag (u64 BE)
//! ```

use bytes::{Buf, BufMut};

use crate::comm::SendComm;
use crate::error::EngineError;
use crate::fabric::MAX_EP_ADDR;
use crate::tag::Tag;

pub const HANDLE_SIZE: usize = 64;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionHandle {
    ep_name: [u8; MAX_EP_ADDR],
    tag: Tag,
}

impl ConnectionHandle {
    pub fn new(ep_name: &[u8], tag: Tag) -> Result<ConnectionHandle, EngineError> {
        if ep_name.len() > MAX_EP_ADDR {
            return Err(EngineError::InvalidHandle(format!("endpoint name of {} bytes exceeds {} bytes", ep_name.len(), MAX_EP_ADDR)));
        }

        let mut padded = [0; MAX_EP_ADDR];
        padded[..ep_name.len()].copy_from_slice(ep_name);
        Ok(ConnectionHandle {
            ep_name: padded,
            tag,
        })
    }

    pub fn ep_name(&self) -> &[u8] {
        &self.ep_name
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.ep_name);
        buf.put_u64(self.tag.to_raw());
    }

    pub fn deser(buf: &mut impl Buf) -> Result<ConnectionHandle, EngineError> {
        if buf.remaining() < HANDLE_SIZE {
            return Err(EngineError::InvalidHandle(format!("expected {} bytes, got {}", HANDLE_SIZE, buf.remaining())));
        }

        let mut ep_name = [0; MAX_EP_ADDR];
        buf.copy_to_slice(&mut ep_name);
        let tag = buf.try_get_u64()
            .map_err(|e| EngineError::InvalidHandle(e.to_string()))?;

        Ok(ConnectionHandle {
            ep_name,
            tag: Tag::from_raw(tag),
        })
    }

    pub fn to_bytes(&self) -> [u8; HANDLE_SIZE] {
        let mut result = [0; HANDLE_SIZE];
        self.ser(&mut &mut result[..]);
        result
    }
}

/// The connecting side's view of a peer's handle. Connecting may take several calls, and the
///  half-established communicator is kept here in between.
#[derive(Debug)]
pub struct ConnectHandle {
    pub(crate) peer: ConnectionHandle,
    pub(crate) stage: Option<SendComm>,
}

impl ConnectHandle {
    pub fn new(peer: ConnectionHandle) -> ConnectHandle {
        ConnectHandle {
            peer,
            stage: None,
        }
    }

    pub fn from_bytes(mut buf: &[u8]) -> Result<ConnectHandle, EngineError> {
        Ok(ConnectHandle::new(ConnectionHandle::deser(&mut buf)?))
    }

    pub fn peer(&self) -> &ConnectionHandle {
        &self.peer
    }

    /// true while a connection attempt is under way
    pub fn is_connecting(&self) -> bool {
        self.stage.is_some()
    }
}
