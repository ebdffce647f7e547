//! The engine's view of a fabric provider: tagged post-send / post-receive, a completion queue
//!  and an address vector. Everything else (fabric / domain setup, connection management,
//!  address resolution) is the provider's business.

pub mod loopback;

use std::fmt::{Display, Formatter};

use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::tag::Tag;

/// Maximum length of an endpoint name - a connection handle is 64 bytes, and the remaining 8
///  bytes carry the tag
pub const MAX_EP_ADDR: usize = 56;

/// Errors reported by provider primitives
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FabricError {
    /// The provider can not accept the operation right now (e.g. a full submission queue), or
    ///  there is nothing to read from the completion queue. The operation should be retried.
    Again,
    /// The operation failed for good, with a provider specific error code
    Failed(i32),
}

impl Display for FabricError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FabricError::Again => write!(f, "resource temporarily unavailable"),
            FabricError::Failed(code) => write!(f, "provider error {}", code),
        }
    }
}

/// An entry in the provider's address vector
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct FabricAddr(u64);

impl FabricAddr {
    /// wildcard source for receives
    pub const UNSPEC: FabricAddr = FabricAddr(u64::MAX);

    pub fn from_raw(value: u64) -> FabricAddr {
        FabricAddr(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }
}

/// The opaque value a posted operation carries through the fabric and that comes back with its
///  completion event
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Context(u64);

impl Context {
    pub fn from_raw(value: u64) -> Context {
        Context(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }
}

/// Describes a caller-owned memory region (host or device memory) for a send or receive. The
///  engine passes descriptors on to the provider without ever touching the memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DataDesc {
    addr: usize,
    len: usize,
}

impl DataDesc {
    /// # Safety
    ///
    /// The region `[ptr, ptr+len)` must stay valid (and, for receives, writable and otherwise
    ///  unused) until the request it is posted with reaches a terminal state.
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> DataDesc {
        DataDesc {
            addr: ptr as usize,
            len,
        }
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompletionEvent {
    pub context: Context,
    /// number of bytes transferred
    pub len: usize,
    pub tag: Tag,
    /// provider error code if the operation failed
    pub error: Option<i32>,
}

/// This is an abstraction for the fabric provider's endpoint, introduced to facilitate mocking
///  the I/O part away for testing
#[cfg_attr(test, automock)]
pub trait FabricProvider: Send + 'static {
    fn name(&self) -> String;

    /// The address of this endpoint as peers need it for [FabricProvider::av_insert]
    fn endpoint_name(&self) -> Bytes;

    /// The tag bits supported by the endpoint, leading zero bits being reserved by the provider
    fn tag_format(&self) -> u64;

    fn av_insert(&mut self, address: &[u8]) -> Result<FabricAddr, FabricError>;

    fn post_send(&mut self, dest: FabricAddr, tag: Tag, data: DataDesc, context: Context) -> Result<(), FabricError>;

    /// Posts a receive matching all messages from `src` (or any source for
    ///  [FabricAddr::UNSPEC]) whose tag equals `tag` in all bits not set in `ignore`
    fn post_recv(&mut self, src: FabricAddr, tag: Tag, ignore: u64, data: DataDesc, context: Context) -> Result<(), FabricError>;

    /// Appends up to `max` completion events to `out`, returning the number of appended events.
    ///  [FabricError::Again] signals an empty completion queue.
    fn read_completions(&mut self, max: usize, out: &mut Vec<CompletionEvent>) -> Result<usize, FabricError>;
}
