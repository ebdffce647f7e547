//! A userspace fabric for use inside a single process, e.g. for tests or for running without
//!  network hardware. All endpoints opened from one [LoopbackFabric] share a 'wire' and can
//!  address each other.
//!
//! Matching follows tagged messaging semantics: a send is delivered to the oldest posted
//!  receive whose source filter and (masked) tag match. Sends that find no matching receive are
//!  copied eagerly into an unexpected message queue at the destination, so sends always complete
//!  immediately.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::fabric::{CompletionEvent, Context, DataDesc, FabricAddr, FabricError, FabricProvider};
use crate::tag::Tag;

pub const LOOPBACK_PROVIDER_NAME: &str = "loopback";

pub const FI_EINVAL: i32 = 22;
pub const FI_EHOSTUNREACH: i32 = 113;
pub const FI_ETRUNC: i32 = 265;

struct PostedRecv {
    src: Option<u64>,
    tag: Tag,
    ignore: u64,
    data: DataDesc,
    context: Context,
}
impl PostedRecv {
    fn matches(&self, from: u64, tag: Tag) -> bool {
        let src_matches = self.src.map(|src| src == from).unwrap_or(true);
        src_matches && (tag.to_raw() & !self.ignore) == (self.tag.to_raw() & !self.ignore)
    }
}

struct UnexpectedMessage {
    from: u64,
    tag: Tag,
    payload: Vec<u8>,
}

#[derive(Default)]
struct Inbox {
    posted: VecDeque<PostedRecv>,
    unexpected: VecDeque<UnexpectedMessage>,
    completions: VecDeque<CompletionEvent>,
}

#[derive(Default)]
struct Wire {
    next_addr: u64,
    inboxes: FxHashMap<u64, Inbox>,
}

#[derive(Default)]
struct Faults {
    transient_posts: usize,
    permanent: Option<i32>,
}

/// Makes an endpoint's posts fail, see [LoopbackEndpoint::fault_injector]
#[derive(Clone)]
pub struct FaultInjector {
    faults: Arc<Mutex<Faults>>,
}
impl FaultInjector {
    /// the next `n` posts return [FabricError::Again]
    pub fn inject_transient(&self, n: usize) {
        self.faults.lock().expect("fault lock poisoned").transient_posts += n;
    }

    /// the next post (after any injected transient failures) fails with `code`
    pub fn inject_permanent(&self, code: i32) {
        self.faults.lock().expect("fault lock poisoned").permanent = Some(code);
    }

    fn check(&self) -> Result<(), FabricError> {
        let mut faults = self.faults.lock().expect("fault lock poisoned");
        if faults.transient_posts > 0 {
            faults.transient_posts -= 1;
            return Err(FabricError::Again);
        }
        match faults.permanent.take() {
            Some(code) => Err(FabricError::Failed(code)),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Default)]
pub struct LoopbackFabric {
    wire: Arc<Mutex<Wire>>,
}

impl LoopbackFabric {
    pub fn new() -> LoopbackFabric {
        Default::default()
    }

    pub fn open_endpoint(&self) -> LoopbackEndpoint {
        let mut wire = self.wire.lock().expect("loopback wire lock poisoned");
        wire.next_addr += 1;
        let addr = wire.next_addr;
        wire.inboxes.insert(addr, Inbox::default());
        debug!("opened loopback endpoint {}", addr);

        LoopbackEndpoint {
            addr,
            wire: self.wire.clone(),
            av: Vec::new(),
            tag_format: u64::MAX,
            faults: FaultInjector { faults: Default::default() },
        }
    }
}

pub struct LoopbackEndpoint {
    addr: u64,
    wire: Arc<Mutex<Wire>>,
    av: Vec<u64>,
    tag_format: u64,
    faults: FaultInjector,
}

impl LoopbackEndpoint {
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// simulates a provider that reserves high tag bits
    pub fn set_tag_format(&mut self, tag_format: u64) {
        self.tag_format = tag_format;
    }

    /// a handle for injecting failures that stays usable after the endpoint was handed to an
    ///  engine
    pub fn fault_injector(&self) -> FaultInjector {
        self.faults.clone()
    }

    fn resolve(&self, addr: FabricAddr) -> Result<u64, FabricError> {
        usize::try_from(addr.to_raw()).ok()
            .and_then(|idx| self.av.get(idx))
            .copied()
            .ok_or(FabricError::Failed(FI_EINVAL))
    }

    /// copies the message into the receive buffer, returning the completion for the receive
    fn deliver(recv: &PostedRecv, tag: Tag, payload: &[u8]) -> CompletionEvent {
        let len = payload.len().min(recv.data.len());
        if len > 0 {
            // SAFETY: the poster of the receive guarantees the region is valid and writable
            //  until the receive completes, which is not before this event is read
            unsafe { std::ptr::copy_nonoverlapping(payload.as_ptr(), recv.data.as_ptr(), len); }
        }

        CompletionEvent {
            context: recv.context,
            len,
            tag,
            error: if payload.len() > recv.data.len() { Some(FI_ETRUNC) } else { None },
        }
    }
}

impl Drop for LoopbackEndpoint {
    fn drop(&mut self) {
        if let Ok(mut wire) = self.wire.lock() {
            wire.inboxes.remove(&self.addr);
        }
    }
}

impl FabricProvider for LoopbackEndpoint {
    fn name(&self) -> String {
        LOOPBACK_PROVIDER_NAME.to_string()
    }

    fn endpoint_name(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(size_of::<u64>());
        buf.put_u64(self.addr);
        buf.freeze()
    }

    fn tag_format(&self) -> u64 {
        self.tag_format
    }

    fn av_insert(&mut self, mut address: &[u8]) -> Result<FabricAddr, FabricError> {
        let addr = address.try_get_u64()
            .map_err(|_| FabricError::Failed(FI_EINVAL))?;
        self.av.push(addr);
        Ok(FabricAddr::from_raw((self.av.len() - 1) as u64))
    }

    fn post_send(&mut self, dest: FabricAddr, tag: Tag, data: DataDesc, context: Context) -> Result<(), FabricError> {
        self.faults.check()?;
        let dest = self.resolve(dest)?;

        let payload = if data.is_empty() {
            Vec::new()
        }
        else {
            // SAFETY: the poster guarantees the region is valid until the send completes
            unsafe { std::slice::from_raw_parts(data.as_ptr(), data.len()) }.to_vec()
        };

        let mut wire = self.wire.lock().expect("loopback wire lock poisoned");
        let inbox = wire.inboxes.get_mut(&dest)
            .ok_or(FabricError::Failed(FI_EHOSTUNREACH))?;

        match inbox.posted.iter().position(|r| r.matches(self.addr, tag)) {
            Some(pos) => {
                if let Some(recv) = inbox.posted.remove(pos) {
                    trace!("loopback {} -> {}: delivering {} bytes with tag {} to posted receive", self.addr, dest, payload.len(), tag);
                    let completion = Self::deliver(&recv, tag, &payload);
                    inbox.completions.push_back(completion);
                }
            }
            None => {
                trace!("loopback {} -> {}: buffering {} bytes with tag {} as unexpected", self.addr, dest, payload.len(), tag);
                inbox.unexpected.push_back(UnexpectedMessage { from: self.addr, tag, payload });
            }
        }

        if let Some(own) = wire.inboxes.get_mut(&self.addr) {
            own.completions.push_back(CompletionEvent {
                context,
                len: data.len(),
                tag,
                error: None,
            });
        }
        Ok(())
    }

    fn post_recv(&mut self, src: FabricAddr, tag: Tag, ignore: u64, data: DataDesc, context: Context) -> Result<(), FabricError> {
        self.faults.check()?;
        let src = if src == FabricAddr::UNSPEC {
            None
        }
        else {
            Some(self.resolve(src)?)
        };
        let recv = PostedRecv { src, tag, ignore, data, context };

        let mut wire = self.wire.lock().expect("loopback wire lock poisoned");
        let inbox = wire.inboxes.get_mut(&self.addr)
            .ok_or(FabricError::Failed(FI_EHOSTUNREACH))?;

        match inbox.unexpected.iter().position(|m| recv.matches(m.from, m.tag)) {
            Some(pos) => {
                if let Some(msg) = inbox.unexpected.remove(pos) {
                    trace!("loopback {}: matched receive with unexpected message from {}", self.addr, msg.from);
                    let completion = Self::deliver(&recv, msg.tag, &msg.payload);
                    inbox.completions.push_back(completion);
                }
            }
            None => inbox.posted.push_back(recv),
        }
        Ok(())
    }

    fn read_completions(&mut self, max: usize, out: &mut Vec<CompletionEvent>) -> Result<usize, FabricError> {
        let mut wire = self.wire.lock().expect("loopback wire lock poisoned");
        let inbox = wire.inboxes.get_mut(&self.addr)
            .ok_or(FabricError::Failed(FI_EHOSTUNREACH))?;

        if inbox.completions.is_empty() {
            return Err(FabricError::Again);
        }

        let n = max.min(inbox.completions.len());
        out.extend(inbox.completions.drain(..n));
        Ok(n)
    }
}
