//! The engine multiplexes any number of communicators over a single fabric endpoint and its
//!  completion queue.
//!
//! All state lives behind one mutex owned by the [Engine] instance, and every operation holds it
//!  for its whole (short, non-blocking) duration. The engine has no threads of its own: progress
//!  is made inside whichever caller invokes [Engine::poll_progress] or [Engine::test], and
//!  operations that can not be completed right away return a 'deferred' outcome instead of
//!  blocking.
//!
//! Posting an operation works like this:
//!
//! ```ascii
//! create request (slot from the communicator's pool)
//!   |
//! drain the retry queue
//!   |
//! queue still non-empty? --yes--> park behind the queued posts (Deferred)
//!   | no
//! post to the fabric --transient--> park (Deferred)
//!   |               \--permanent--> release slot, FabricPermanent
//! Posted
//! ```
//!
//! A request's context is its communicator key and slot index packed into 64 bits, so a
//!  completion event leads back to its request without any lookup structure. An event that does
//!  not lead to a pending request means the engine's bookkeeping is broken; the engine then
//!  poisons itself and refuses all further operations except closing communicators.

use std::sync::{Mutex, MutexGuard};

use anyhow::bail;
use bytes::Bytes;
use slab::Slab;
use tracing::{debug, error, info, trace, warn};

use crate::buffers::slot_pool::{SlotIndex, SlotPool};
use crate::comm::{CommKey, CommState, ListenComm, ListenState, RecvComm, RecvState, SendComm, SendState};
use crate::config::{DeviceId, EngineConfig};
use crate::error::{CloseError, EngineError};
use crate::fabric::{CompletionEvent, Context, DataDesc, FabricAddr, FabricError, FabricProvider, MAX_EP_ADDR};
use crate::handle::{ConnectHandle, ConnectionHandle};
use crate::pending_queue::{PendingEntry, PendingOp, PendingQueue};
use crate::request::{Direction, Owner, PostOutcome, Request, RequestKey, RequestSlot, RequestStatus, TestOutcome};
use crate::tag::{Tag, TagAllocator, TagLayout};

/// The result of an operation that may need several calls to complete
#[derive(Debug)]
pub enum Progress<T> {
    Ready(T),
    /// not there yet - call again later
    Deferred,
}

impl<T> Progress<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Progress::Ready(_))
    }

    pub fn ready(self) -> Option<T> {
        match self {
            Progress::Ready(value) => Some(value),
            Progress::Deferred => None,
        }
    }
}

pub struct Engine {
    config: EngineConfig,
    provider_name: String,
    endpoint_name: Bytes,
    layout: TagLayout,
    state: Mutex<EngineState>,
}

impl Engine {
    pub fn new(config: EngineConfig, provider: Box<dyn FabricProvider>) -> anyhow::Result<Engine> {
        config.validate()?;

        let layout = TagLayout::from_tag_format(provider.tag_format())?;
        let endpoint_name = provider.endpoint_name();
        if endpoint_name.len() > MAX_EP_ADDR {
            bail!("endpoint name of provider {} has {} bytes, at most {} are supported", provider.name(), endpoint_name.len(), MAX_EP_ADDR);
        }
        let provider_name = provider.name();

        info!("initialized engine for device {} with provider {}: {} usable tag bits, completion batch size {}",
            config.device, provider_name, layout.usable_bits(), config.completion_batch_size);

        Ok(Engine {
            state: Mutex::new(EngineState {
                provider,
                tags: TagAllocator::new(layout),
                comms: Slab::new(),
                pending: PendingQueue::default(),
                completions: Vec::with_capacity(config.completion_batch_size),
                poisoned: false,
            }),
            config,
            provider_name,
            endpoint_name,
            layout,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub fn layout(&self) -> &TagLayout {
        &self.layout
    }

    pub fn is_poisoned(&self) -> bool {
        self.state.lock().expect("engine lock poisoned").poisoned
    }

    /// number of posts currently parked for retry
    pub fn num_pending(&self) -> usize {
        self.state.lock().expect("engine lock poisoned").pending.len()
    }

    /// Creates a listening communicator with a fresh stream tag. The returned handle must be
    ///  delivered to the connecting peer through some external channel.
    pub fn listen(&self, dev: DeviceId) -> Result<(ConnectionHandle, ListenComm), EngineError> {
        self.check_dev(dev)?;
        self.with_state(|state| {
            let tag = state.tags.allocate_tag()?;
            let handle = ConnectionHandle::new(&self.endpoint_name, tag)?;
            let key = state.insert_comm(CommState::Listen(ListenState::new(tag, dev)))?;

            debug!("listening on {:?} with tag {}", key, tag);
            Ok((handle, ListenComm { key, tag, dev }))
        })
    }

    /// Connects to a listening peer. The first call sends our endpoint name to the peer's
    ///  listener; the connection is established once that handshake send completed, which may
    ///  take several calls with the same `handle`.
    pub fn connect(&self, dev: DeviceId, handle: &mut ConnectHandle) -> Result<Progress<SendComm>, EngineError> {
        self.check_dev(dev)?;
        self.with_state(|state| {
            let comm = match handle.stage.take() {
                Some(comm) => comm,
                None => match self.start_connect(state, dev, handle.peer())? {
                    Some(comm) => comm,
                    None => return Ok(Progress::Deferred),
                },
            };

            match self.finish_connect(state, &comm) {
                Ok(true) => {
                    debug!("connected {:?} to peer with tag {}", comm.key, comm.tag);
                    Ok(Progress::Ready(comm))
                }
                Ok(false) => {
                    handle.stage = Some(comm);
                    Ok(Progress::Deferred)
                }
                Err(e) => {
                    if state.comms.contains(comm.key.to_raw()) {
                        handle.stage = Some(comm);
                    }
                    Err(e)
                }
            }
        })
    }

    /// returns `None` if the peer's address can not be resolved right now
    fn start_connect(&self, state: &mut EngineState, dev: DeviceId, peer: &ConnectionHandle) -> Result<Option<SendComm>, EngineError> {
        let tag = peer.tag();
        if tag.to_raw() == 0 || self.layout.is_control(tag) {
            return Err(EngineError::InvalidHandle(format!("{} is not a stream tag", tag)));
        }

        let remote = match state.provider.av_insert(peer.ep_name()) {
            Ok(remote) => remote,
            Err(FabricError::Again) => {
                debug!("address vector insert deferred for peer with tag {}", tag);
                return Ok(None);
            }
            Err(e) => return Err(EngineError::FabricPermanent(e)),
        };

        let send = SendState::new(tag, dev, remote, &self.config, &self.endpoint_name);
        let key = state.insert_comm(CommState::Send(send))?;

        let result = self.post_connect_handshake(state, key, tag, dev, remote);
        if let Err(e) = result {
            state.comms.try_remove(key.to_raw());
            return Err(e);
        }

        trace!("{:?}: handshake to peer {:?} posted", key, remote);
        Ok(Some(SendComm { key, tag, dev }))
    }

    fn post_connect_handshake(&self, state: &mut EngineState, key: CommKey, tag: Tag, dev: DeviceId, remote: FabricAddr) -> Result<(), EngineError> {
        let slot = state.create_request(Owner::Send(key), Direction::Send, dev, MAX_EP_ADDR, self.config.max_requests)?;

        let send = state.send_state(key)?;
        send.connect_request = Some(slot);
        // SAFETY: the buffer is boxed and lives as long as the communicator, which can not be
        //  closed while the request holds its slot
        let data = unsafe { DataDesc::from_raw_parts(send.handshake.as_mut_ptr(), MAX_EP_ADDR) };

        let control_tag = state.tags.control_tag_for(tag);
        state.submit(RequestKey { comm: key, slot }, control_tag, data, PendingOp::Send { dest: remote })?;
        Ok(())
    }

    /// true if the handshake send completed
    fn finish_connect(&self, state: &mut EngineState, comm: &SendComm) -> Result<bool, EngineError> {
        self.progress(state)?;

        let send = state.send_state(comm.key)?;
        let slot = send.connect_request
            .ok_or_else(|| EngineError::ProtocolViolation(format!("{:?} has no connect request", comm.key)))?;
        let status = request_status(&send.requests, slot)?;

        match status {
            RequestStatus::Pending => Ok(false),
            RequestStatus::Completed { .. } => {
                send.connect_request = None;
                state.release_request(RequestKey { comm: comm.key, slot })?;
                Ok(true)
            }
            RequestStatus::Error { code } => {
                warn!("handshake send for {:?} failed with provider error {}", comm.key, code);
                state.release_request(RequestKey { comm: comm.key, slot })?;
                state.comms.try_remove(comm.key.to_raw());
                Err(EngineError::FabricPermanent(FabricError::Failed(code)))
            }
        }
    }

    /// Waits for a peer to connect. The first call posts a receive for the peer's handshake,
    ///  subsequent calls check for its completion. Each listener accepts a single connection.
    pub fn accept(&self, listen_comm: &ListenComm) -> Result<Progress<RecvComm>, EngineError> {
        self.check_dev(listen_comm.dev)?;
        self.with_state(|state| {
            let key = listen_comm.key;
            let listen = state.listen_state(key)?;
            if listen.accepted {
                return Err(EngineError::AlreadyAccepted { tag: listen_comm.tag.to_raw() });
            }

            if listen.accept_request.is_none() {
                self.post_accept_handshake(state, listen_comm)?;
            }

            self.progress(state)?;
            self.finish_accept(state, listen_comm)
        })
    }

    fn post_accept_handshake(&self, state: &mut EngineState, listen_comm: &ListenComm) -> Result<(), EngineError> {
        let key = listen_comm.key;
        let slot = state.create_request(Owner::Listen(key), Direction::Recv, listen_comm.dev, MAX_EP_ADDR, self.config.max_requests)?;

        let listen = state.listen_state(key)?;
        listen.accept_request = Some(slot);
        // SAFETY: the buffer is boxed and lives as long as the communicator, which can not be
        //  closed while the request holds its slot
        let data = unsafe { DataDesc::from_raw_parts(listen.handshake.as_mut_ptr(), MAX_EP_ADDR) };

        let op = PendingOp::Recv { src: FabricAddr::UNSPEC, ignore: 0 };
        let control_tag = state.tags.control_tag_for(listen_comm.tag);
        if let Err(e) = state.submit(RequestKey { comm: key, slot }, control_tag, data, op) {
            // a permanent failure released the slot, so a later accept can start over
            if let Ok(listen) = state.listen_state(key) {
                listen.accept_request = None;
            }
            return Err(e);
        }

        trace!("{:?}: waiting for handshake", key);
        Ok(())
    }

    fn finish_accept(&self, state: &mut EngineState, listen_comm: &ListenComm) -> Result<Progress<RecvComm>, EngineError> {
        let key = listen_comm.key;
        let listen = state.listen_state(key)?;
        let slot = listen.accept_request
            .ok_or_else(|| EngineError::ProtocolViolation(format!("{:?} has no accept request", key)))?;
        let request_key = RequestKey { comm: key, slot };

        match request_status(&listen.requests, slot)? {
            RequestStatus::Pending => Ok(Progress::Deferred),
            RequestStatus::Error { code } => {
                warn!("handshake receive for {:?} failed with provider error {}", key, code);
                listen.accept_request = None;
                state.release_request(request_key)?;
                Err(EngineError::FabricPermanent(FabricError::Failed(code)))
            }
            RequestStatus::Completed { .. } => {
                let peer_name = *listen.handshake;

                // the handshake stays in place until the peer's address is resolved
                let remote = match state.provider.av_insert(&peer_name) {
                    Ok(remote) => remote,
                    Err(FabricError::Again) => {
                        debug!("{:?}: address vector insert deferred", key);
                        return Ok(Progress::Deferred);
                    }
                    Err(e) => {
                        state.listen_state(key)?.accept_request = None;
                        state.release_request(request_key)?;
                        return Err(EngineError::FabricPermanent(e));
                    }
                };

                let listen = state.listen_state(key)?;
                listen.accept_request = None;
                listen.accepted = true;
                state.release_request(request_key)?;

                let recv_key = state.insert_comm(CommState::Recv(RecvState::new(listen_comm.tag, listen_comm.dev, remote, &self.config)))?;
                debug!("{:?} accepted connection from {:?} as {:?}", key, remote, recv_key);
                Ok(Progress::Ready(RecvComm {
                    key: recv_key,
                    tag: listen_comm.tag,
                    dev: listen_comm.dev,
                }))
            }
        }
    }

    /// Sends `data` on a connected communicator. The returned request must be driven to
    ///  completion through [Engine::test], and `data` must stay valid until then.
    pub fn isend(&self, comm: &SendComm, data: DataDesc) -> Result<PostOutcome, EngineError> {
        self.check_dev(comm.dev)?;
        self.with_state(|state| {
            let dest = state.send_state(comm.key)?.remote;
            self.post(state, Owner::Send(comm.key), comm.tag, comm.dev, data, PendingOp::Send { dest })
        })
    }

    /// Receives into `data` on a connected communicator, see [Engine::isend]
    pub fn irecv(&self, comm: &RecvComm, data: DataDesc) -> Result<PostOutcome, EngineError> {
        self.check_dev(comm.dev)?;
        self.with_state(|state| {
            let src = state.recv_state(comm.key)?.remote;
            self.post(state, Owner::Recv(comm.key), comm.tag, comm.dev, data, PendingOp::Recv { src, ignore: 0 })
        })
    }

    fn post(&self, state: &mut EngineState, owner: Owner, tag: Tag, dev: DeviceId, data: DataDesc, op: PendingOp) -> Result<PostOutcome, EngineError> {
        let direction = match op {
            PendingOp::Send { .. } => Direction::Send,
            PendingOp::Recv { .. } => Direction::Recv,
        };
        let slot = state.create_request(owner, direction, dev, data.len(), self.config.max_requests)?;
        let key = RequestKey { comm: owner.comm_key(), slot };

        let request = Request {
            owner,
            slot,
            context: key.to_context(),
            dev,
            direction,
        };

        if state.submit(key, tag, data, op)? {
            Ok(PostOutcome::Deferred(request))
        }
        else {
            Ok(PostOutcome::Posted(request))
        }
    }

    /// Makes progress on all communicators: retries parked posts oldest first, then reads one
    ///  batch of completion events and applies them to their requests. This never blocks.
    ///
    /// Returns the number of reposted operations plus the number of applied completions, so 0
    ///  means that nothing happened.
    pub fn poll_progress(&self) -> Result<usize, EngineError> {
        self.with_state(|state| self.progress(state))
    }

    fn progress(&self, state: &mut EngineState) -> Result<usize, EngineError> {
        let num_reposted = state.drain_pending()?;
        let num_completed = state.read_completions(self.config.completion_batch_size)?;
        Ok(num_reposted + num_completed)
    }

    /// Observes a request's state without driving progress
    pub fn poll_request(&self, request: &Request) -> Result<RequestStatus, EngineError> {
        self.with_state(|state| Ok(state.request_mut(request.key())?.status()))
    }

    /// Drives progress once and then checks the request. A request that reached a terminal
    ///  state is consumed and its slot released; a pending request is handed back.
    ///
    /// Failures to drive progress are returned as well, since they mean that no request on
    ///  this engine will ever complete.
    pub fn test(&self, request: Request) -> Result<TestOutcome, EngineError> {
        self.with_state(|state| {
            self.progress(state)?;

            let key = request.key();
            match state.request_mut(key)?.status() {
                RequestStatus::Pending => Ok(TestOutcome::Pending(request)),
                RequestStatus::Completed { bytes } => {
                    state.release_request(key)?;
                    trace!("{:?} done: {} bytes", request, bytes);
                    Ok(TestOutcome::Done { bytes })
                }
                RequestStatus::Error { code } => {
                    state.release_request(key)?;
                    debug!("{:?} failed with provider error {}", request, code);
                    Err(EngineError::FabricPermanent(FabricError::Failed(code)))
                }
            }
        })
    }

    pub fn close_listen(&self, comm: ListenComm) -> Result<(), CloseError<ListenComm>> {
        self.close(comm.key).map_err(|error| CloseError { error, comm })
    }

    pub fn close_send(&self, comm: SendComm) -> Result<(), CloseError<SendComm>> {
        self.close(comm.key).map_err(|error| CloseError { error, comm })
    }

    pub fn close_recv(&self, comm: RecvComm) -> Result<(), CloseError<RecvComm>> {
        self.close(comm.key).map_err(|error| CloseError { error, comm })
    }

    /// Closing is allowed on a poisoned engine so that callers can tear down cleanly
    fn close(&self, key: CommKey) -> Result<(), EngineError> {
        let mut state = self.state.lock().expect("engine lock poisoned");

        let comm = state.comm_mut(key)?;
        let outstanding = comm.num_unreleased();
        if outstanding > 0 {
            let unreleased = comm.requests().iter_in_use()
                .map(|(slot, request)| format!("{}:{:?}", slot, request.state))
                .collect::<Vec<_>>();
            debug!("can not close {} communicator {:?}: {} requests outstanding {:?}", comm.kind(), key, outstanding, unreleased);
            return Err(EngineError::CommBusy { outstanding });
        }

        if let Some(comm) = state.comms.try_remove(key.to_raw()) {
            debug!("closed {} communicator {:?}", comm.kind(), key);
        }
        Ok(())
    }

    fn check_dev(&self, dev: DeviceId) -> Result<(), EngineError> {
        if dev != self.config.device {
            return Err(EngineError::UnknownDevice { dev });
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, EngineState>, EngineError> {
        let state = self.state.lock().expect("engine lock poisoned");
        if state.poisoned {
            return Err(EngineError::EndpointPoisoned);
        }
        Ok(state)
    }

    /// Runs `f` under the engine lock. A protocol violation poisons the engine.
    fn with_state<T>(&self, f: impl FnOnce(&mut EngineState) -> Result<T, EngineError>) -> Result<T, EngineError> {
        let mut state = self.lock()?;
        let result = f(&mut state);
        if let Err(EngineError::ProtocolViolation(msg)) = &result {
            error!("protocol violation, engine for device {} is unusable from now on: {}", self.config.device, msg);
            state.poisoned = true;
        }
        result
    }
}

fn request_status(requests: &SlotPool<RequestSlot>, slot: SlotIndex) -> Result<RequestStatus, EngineError> {
    requests.get(slot)
        .map(|r| r.status())
        .ok_or_else(|| EngineError::ProtocolViolation(format!("request slot {} is not in use", slot)))
}

fn comm_in(comms: &mut Slab<CommState>, key: CommKey) -> Result<&mut CommState, EngineError> {
    comms.get_mut(key.to_raw())
        .ok_or_else(|| EngineError::ProtocolViolation(format!("unknown communicator {:?}", key)))
}

fn post_op(provider: &mut dyn FabricProvider, op: PendingOp, tag: Tag, data: DataDesc, context: Context) -> Result<(), FabricError> {
    match op {
        PendingOp::Send { dest } => provider.post_send(dest, tag, data, context),
        PendingOp::Recv { src, ignore } => provider.post_recv(src, tag, ignore, data, context),
    }
}

/// applies the outcome of a repost to the entry's request
fn finish_pending(comms: &mut Slab<CommState>, entry: PendingEntry, result: Result<(), i32>) -> Result<(), EngineError> {
    let comm = comm_in(comms, entry.request.comm)?;
    if let (Some(pending_slot), CommState::Send(send)) = (entry.pending_slot, &mut *comm) {
        send.pending_entries.release(pending_slot)?;
    }

    let request = comm.requests_mut().get_mut(entry.request.slot)
        .ok_or_else(|| EngineError::ProtocolViolation(format!("pending entry for released request {:?}", entry.request)))?;
    match result {
        Ok(()) => request.mark_posted(),
        Err(code) => {
            warn!("repost for {:?} failed with provider error {}", entry.request, code);
            request.fail(code);
            Ok(())
        }
    }
}

struct EngineState {
    provider: Box<dyn FabricProvider>,
    tags: TagAllocator,
    comms: Slab<CommState>,
    pending: PendingQueue,
    /// reused buffer for reading completion events
    completions: Vec<CompletionEvent>,
    poisoned: bool,
}

impl EngineState {
    fn insert_comm(&mut self, comm: CommState) -> Result<CommKey, EngineError> {
        let entry = self.comms.vacant_entry();
        // keys must fit into the upper half of a request context
        if entry.key() > u32::MAX as usize {
            return Err(EngineError::PoolExhausted { capacity: u32::MAX as usize });
        }
        let key = CommKey::from_raw(entry.key());
        entry.insert(comm);
        Ok(key)
    }

    fn comm_mut(&mut self, key: CommKey) -> Result<&mut CommState, EngineError> {
        comm_in(&mut self.comms, key)
    }

    fn listen_state(&mut self, key: CommKey) -> Result<&mut ListenState, EngineError> {
        match self.comm_mut(key)? {
            CommState::Listen(listen) => Ok(listen),
            other => Err(EngineError::ProtocolViolation(format!("{:?} is a {} communicator, expected listen", key, other.kind()))),
        }
    }

    fn send_state(&mut self, key: CommKey) -> Result<&mut SendState, EngineError> {
        match self.comm_mut(key)? {
            CommState::Send(send) => Ok(send),
            other => Err(EngineError::ProtocolViolation(format!("{:?} is a {} communicator, expected send", key, other.kind()))),
        }
    }

    fn recv_state(&mut self, key: CommKey) -> Result<&mut RecvState, EngineError> {
        match self.comm_mut(key)? {
            CommState::Recv(recv) => Ok(recv),
            other => Err(EngineError::ProtocolViolation(format!("{:?} is a {} communicator, expected recv", key, other.kind()))),
        }
    }

    fn request_mut(&mut self, key: RequestKey) -> Result<&mut RequestSlot, EngineError> {
        self.comm_mut(key.comm)?
            .requests_mut()
            .get_mut(key.slot)
            .ok_or_else(|| EngineError::ProtocolViolation(format!("no live request for {:?}", key)))
    }

    /// Acquires a request slot from the owner's pool. Fails with [EngineError::PoolExhausted]
    ///  if the owner is at its inflight ceiling or its pool is empty; the caller may retry
    ///  after some requests were completed.
    fn create_request(&mut self, owner: Owner, direction: Direction, dev: DeviceId, posted_len: usize, max_inflight: usize) -> Result<SlotIndex, EngineError> {
        let comm = self.comm_mut(owner.comm_key())?;
        if !comm.is_owned_by(owner) {
            return Err(EngineError::ProtocolViolation(format!("{:?} does not match a {} communicator", owner, comm.kind())));
        }

        if let Some(&mut num_inflight) = comm.num_inflight_mut() {
            if num_inflight >= max_inflight {
                debug!("{:?} is at its inflight ceiling of {}", owner, max_inflight);
                return Err(EngineError::PoolExhausted { capacity: max_inflight });
            }
        }

        let requests = comm.requests_mut();
        let capacity = requests.capacity();
        let Some(slot) = requests.acquire()
        else {
            debug!("request pool of {:?} exhausted", owner);
            return Err(EngineError::PoolExhausted { capacity });
        };

        if let Some(request) = requests.get_mut(slot) {
            *request = RequestSlot {
                direction,
                dev,
                posted_len,
                ..Default::default()
            };
        }
        if let Some(num_inflight) = comm.num_inflight_mut() {
            *num_inflight += 1;
        }

        trace!("{:?}: acquired request slot {}", owner, slot);
        Ok(slot)
    }

    fn release_request(&mut self, key: RequestKey) -> Result<(), EngineError> {
        let comm = self.comm_mut(key.comm)?;
        comm.requests_mut().release(key.slot)?;

        if let Some(num_inflight) = comm.num_inflight_mut() {
            *num_inflight = num_inflight.checked_sub(1)
                .ok_or_else(|| EngineError::ProtocolViolation(format!("inflight counter underflow for {:?}", key)))?;
        }
        trace!("released request slot {:?}", key);
        Ok(())
    }

    /// Hands a freshly created request to the fabric, returning `true` if it was parked for
    ///  retry. Earlier parked posts are retried first, and if any of them is still blocked the
    ///  new post is parked behind it without being attempted.
    fn submit(&mut self, key: RequestKey, tag: Tag, data: DataDesc, op: PendingOp) -> Result<bool, EngineError> {
        self.drain_pending()?;

        let result = if self.pending.is_empty() {
            post_op(&mut *self.provider, op, tag, data, key.to_context())
        }
        else {
            Err(FabricError::Again)
        };

        match result {
            Ok(()) => {
                trace!("posted {:?} with tag {}, {} bytes", key, tag, data.len());
                self.request_mut(key)?.mark_posted()?;
                Ok(false)
            }
            Err(FabricError::Again) => {
                self.park(key, tag, data, op)?;
                Ok(true)
            }
            Err(FabricError::Failed(code)) => {
                debug!("post for {:?} failed with provider error {}", key, code);
                self.request_mut(key)?.fail(code);
                self.release_request(key)?;
                Err(EngineError::FabricPermanent(FabricError::Failed(code)))
            }
        }
    }

    fn park(&mut self, key: RequestKey, tag: Tag, data: DataDesc, op: PendingOp) -> Result<(), EngineError> {
        let pending_slot = match self.comm_mut(key.comm)? {
            CommState::Send(send) => match send.pending_entries.acquire() {
                Some(slot) => Some(slot),
                None => {
                    let capacity = send.pending_entries.capacity();
                    debug!("pending entry pool of {:?} exhausted, dropping the post", key.comm);
                    self.release_request(key)?;
                    return Err(EngineError::PoolExhausted { capacity });
                }
            },
            _ => None,
        };

        self.pending.enqueue(PendingEntry {
            request: key,
            pending_slot,
            tag,
            data,
            op,
        });
        Ok(())
    }

    /// returns the number of entries that left the queue
    fn drain_pending(&mut self) -> Result<usize, EngineError> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        let EngineState { provider, comms, pending, .. } = self;
        let mut violation = None;
        let num_done = pending.drain_once(
            |entry| post_op(&mut **provider, entry.op, entry.tag, entry.data, entry.request.to_context()),
            |entry, result| {
                if let Err(e) = finish_pending(comms, entry, result) {
                    violation.get_or_insert(e);
                }
            },
        );

        match violation {
            Some(e) => Err(e),
            None => Ok(num_done),
        }
    }

    fn read_completions(&mut self, max: usize) -> Result<usize, EngineError> {
        let mut events = std::mem::take(&mut self.completions);
        events.clear();

        let result = match self.provider.read_completions(max, &mut events) {
            Ok(_) => events.iter()
                .try_for_each(|event| self.apply_completion(event))
                .map(|_| events.len()),
            Err(FabricError::Again) => Ok(0),
            Err(e) => {
                // no completion can be delivered from here on
                error!("reading the completion queue failed: {}, engine is unusable from now on", e);
                self.poisoned = true;
                Err(EngineError::FabricPermanent(e))
            }
        };

        self.completions = events;
        result
    }

    fn apply_completion(&mut self, event: &CompletionEvent) -> Result<(), EngineError> {
        let key = RequestKey::from_context(event.context);
        trace!("completion for {:?}: {} bytes, stream {}, error {:?}", key, event.len, self.tags.layout().stream_id(event.tag), event.error);

        let request = self.request_mut(key)
            .map_err(|_| EngineError::ProtocolViolation(format!("completion with unknown context {:?}", event.context)))?;
        request.complete(event.len, event.error)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use rstest::rstest;

    use super::*;
    use crate::fabric::loopback::{LoopbackFabric, FI_ETRUNC};
    use crate::fabric::MockFabricProvider;
    use crate::request::RequestState;
    use crate::test_util::{connect_comms, connected_pair, wait_for};

    #[derive(Default)]
    struct Script {
        /// results for consecutive posts, `Ok` when exhausted
        post_results: VecDeque<Result<(), FabricError>>,
        completions: VecDeque<CompletionEvent>,
        /// contexts of all post attempts
        attempts: Vec<Context>,
        /// if set, every completion queue read fails with this code
        failed_reads: Option<i32>,
    }

    impl Script {
        fn next_post(&mut self, context: Context) -> Result<(), FabricError> {
            self.attempts.push(context);
            self.post_results.pop_front().unwrap_or(Ok(()))
        }
    }

    fn mock_provider(script: Arc<Mutex<Script>>, tag_format: u64) -> MockFabricProvider {
        let mut provider = MockFabricProvider::new();
        provider.expect_name().returning(|| "mock".to_string());
        provider.expect_endpoint_name().returning(|| Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]));
        provider.expect_tag_format().return_const(tag_format);
        provider.expect_av_insert().returning(|_| Ok(FabricAddr::from_raw(0)));

        let s = script.clone();
        provider.expect_post_send()
            .returning(move |_, _, _, context| s.lock().unwrap().next_post(context));
        let s = script.clone();
        provider.expect_post_recv()
            .returning(move |_, _, _, _, context| s.lock().unwrap().next_post(context));
        provider.expect_read_completions()
            .returning(move |max, out| {
                let mut script = script.lock().unwrap();
                if let Some(code) = script.failed_reads {
                    return Err(FabricError::Failed(code));
                }
                if script.completions.is_empty() {
                    return Err(FabricError::Again);
                }
                let n = max.min(script.completions.len());
                out.extend(script.completions.drain(..n));
                Ok(n)
            });
        provider
    }

    fn mock_engine(config: EngineConfig) -> (Engine, Arc<Mutex<Script>>) {
        let script = Arc::new(Mutex::new(Script::default()));
        let engine = Engine::new(config, Box::new(mock_provider(script.clone(), u64::MAX))).unwrap();
        (engine, script)
    }

    fn send_comm(engine: &Engine) -> SendComm {
        let mut state = engine.state.lock().unwrap();
        let tag = state.tags.allocate_tag().unwrap();
        let key = state.insert_comm(CommState::Send(SendState::new(tag, 0, FabricAddr::from_raw(0), &engine.config, &[]))).unwrap();
        SendComm { key, tag, dev: 0 }
    }

    fn recv_comm(engine: &Engine) -> RecvComm {
        let mut state = engine.state.lock().unwrap();
        let tag = state.tags.allocate_tag().unwrap();
        let key = state.insert_comm(CommState::Recv(RecvState::new(tag, 0, FabricAddr::from_raw(0), &engine.config))).unwrap();
        RecvComm { key, tag, dev: 0 }
    }

    fn request_state(engine: &Engine, request: &Request) -> RequestState {
        engine.state.lock().unwrap().request_mut(request.key()).unwrap().state
    }

    fn completion(request: &Request, len: usize) -> CompletionEvent {
        CompletionEvent {
            context: request.context(),
            len,
            tag: Tag::from_raw(1),
            error: None,
        }
    }

    fn desc(buf: &mut [u8]) -> DataDesc {
        unsafe { DataDesc::from_raw_parts(buf.as_mut_ptr(), buf.len()) }
    }

    #[rstest]
    #[case::too_few_tag_bits(EngineConfig::default(), u64::MAX >> 32)]
    #[case::no_tag_bits(EngineConfig::default(), 0)]
    #[case::invalid_config(EngineConfig { max_requests: 0, ..Default::default() }, u64::MAX)]
    fn test_init_failure(#[case] config: EngineConfig, #[case] tag_format: u64) {
        let script = Arc::new(Mutex::new(Script::default()));
        assert!(Engine::new(config, Box::new(mock_provider(script, tag_format))).is_err());
    }

    #[test]
    fn test_init_endpoint_name_too_long() {
        let mut provider = MockFabricProvider::new();
        provider.expect_name().returning(|| "mock".to_string());
        provider.expect_endpoint_name().returning(|| Bytes::from(vec![0u8; MAX_EP_ADDR + 1]));
        provider.expect_tag_format().return_const(u64::MAX);
        assert!(Engine::new(EngineConfig::default(), Box::new(provider)).is_err());
    }

    #[test]
    fn test_unknown_device() {
        let (engine, _) = mock_engine(EngineConfig::default());
        assert_eq!(engine.listen(5).unwrap_err(), EngineError::UnknownDevice { dev: 5 });
    }

    #[test]
    fn test_listen_allocates_distinct_tags() {
        let (engine, _) = mock_engine(EngineConfig::default());
        let (handle_1, listen_1) = engine.listen(0).unwrap();
        let (handle_2, listen_2) = engine.listen(0).unwrap();

        assert_eq!(handle_1.tag(), listen_1.tag());
        assert_ne!(listen_1.tag(), listen_2.tag());
        assert_eq!(&handle_2.ep_name()[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_pool_exhaustion_and_reuse() {
        let (engine, script) = mock_engine(EngineConfig { max_requests: 4, ..Default::default() });
        let comm = send_comm(&engine);
        let mut buf = vec![0u8; 16];

        let mut requests = Vec::new();
        for _ in 0..4 {
            requests.push(engine.isend(&comm, desc(&mut buf)).unwrap().into_request());
        }
        assert_eq!(engine.isend(&comm, desc(&mut buf)).unwrap_err(), EngineError::PoolExhausted { capacity: 4 });

        let first = requests.remove(0);
        script.lock().unwrap().completions.push_back(completion(&first, 16));
        assert!(matches!(engine.test(first).unwrap(), TestOutcome::Done { bytes: 16 }));

        let outcome = engine.isend(&comm, desc(&mut buf)).unwrap();
        assert!(!outcome.is_deferred());
    }

    #[test]
    fn test_transient_post_is_deferred() {
        let (engine, script) = mock_engine(EngineConfig::default());
        let comm = send_comm(&engine);
        let mut buf = vec![0u8; 10];
        script.lock().unwrap().post_results.extend([Err(FabricError::Again), Err(FabricError::Again)]);

        let outcome = engine.isend(&comm, desc(&mut buf)).unwrap();
        assert!(outcome.is_deferred());
        let request = outcome.into_request();
        assert_eq!(request_state(&engine, &request), RequestState::Created);
        assert_eq!(engine.poll_request(&request).unwrap(), RequestStatus::Pending);

        // the first retry is rejected again
        assert_eq!(engine.poll_progress().unwrap(), 0);
        assert_eq!(request_state(&engine, &request), RequestState::Created);
        assert_eq!(engine.num_pending(), 1);

        assert_eq!(engine.poll_progress().unwrap(), 1);
        assert_eq!(request_state(&engine, &request), RequestState::Pending);
        assert_eq!(engine.num_pending(), 0);

        script.lock().unwrap().completions.push_back(completion(&request, 10));
        assert!(matches!(engine.test(request).unwrap(), TestOutcome::Done { bytes: 10 }));
        assert_eq!(script.lock().unwrap().attempts.len(), 3);
    }

    #[test]
    fn test_posts_do_not_overtake_parked_posts() {
        let (engine, script) = mock_engine(EngineConfig::default());
        let comm = send_comm(&engine);
        let mut buf = vec![0u8; 10];
        script.lock().unwrap().post_results.extend([Err(FabricError::Again), Err(FabricError::Again)]);

        let first = engine.isend(&comm, desc(&mut buf)).unwrap();
        let second = engine.isend(&comm, desc(&mut buf)).unwrap();
        assert!(first.is_deferred());
        assert!(second.is_deferred());
        assert_eq!(engine.num_pending(), 2);

        // the second post was never attempted while the first was blocked
        let first_context = first.request().context();
        assert_eq!(script.lock().unwrap().attempts, vec![first_context, first_context]);

        assert_eq!(engine.poll_progress().unwrap(), 2);
        assert_eq!(script.lock().unwrap().attempts[2..], [first_context, second.request().context()]);
    }

    #[test]
    fn test_reverse_order_completions() {
        let (engine, script) = mock_engine(EngineConfig::default());
        let comm = recv_comm(&engine);
        let mut buf_1 = vec![0u8; 100];
        let mut buf_2 = vec![0u8; 100];

        let r1 = engine.irecv(&comm, desc(&mut buf_1)).unwrap().into_request();
        let r2 = engine.irecv(&comm, desc(&mut buf_2)).unwrap().into_request();
        assert_ne!(r1.context(), r2.context());

        script.lock().unwrap().completions.extend([completion(&r2, 20), completion(&r1, 10)]);
        assert_eq!(engine.poll_progress().unwrap(), 2);

        assert_eq!(engine.poll_request(&r1).unwrap(), RequestStatus::Completed { bytes: 10 });
        assert_eq!(engine.poll_request(&r2).unwrap(), RequestStatus::Completed { bytes: 20 });
        assert!(matches!(engine.test(r2).unwrap(), TestOutcome::Done { bytes: 20 }));
        assert!(matches!(engine.test(r1).unwrap(), TestOutcome::Done { bytes: 10 }));
    }

    #[test]
    fn test_send_reports_posted_length() {
        let (engine, script) = mock_engine(EngineConfig::default());
        let comm = send_comm(&engine);
        let mut buf = vec![0u8; 42];

        let request = engine.isend(&comm, desc(&mut buf)).unwrap().into_request();
        script.lock().unwrap().completions.push_back(completion(&request, 0));
        assert!(matches!(engine.test(request).unwrap(), TestOutcome::Done { bytes: 42 }));
    }

    #[test]
    fn test_completion_batch_is_bounded() {
        let (engine, script) = mock_engine(EngineConfig { completion_batch_size: 2, ..Default::default() });
        let comm = recv_comm(&engine);
        let mut buf = vec![0u8; 8];

        let requests = (0..3)
            .map(|_| engine.irecv(&comm, desc(&mut buf)).unwrap().into_request())
            .collect::<Vec<_>>();
        script.lock().unwrap().completions.extend(requests.iter().map(|r| completion(r, 8)));

        assert_eq!(engine.poll_progress().unwrap(), 2);
        assert_eq!(engine.poll_request(&requests[2]).unwrap(), RequestStatus::Pending);
        assert_eq!(engine.poll_progress().unwrap(), 1);
        assert_eq!(engine.poll_request(&requests[2]).unwrap(), RequestStatus::Completed { bytes: 8 });
        assert_eq!(engine.poll_progress().unwrap(), 0);
    }

    #[test]
    fn test_permanent_post_failure() {
        let (engine, script) = mock_engine(EngineConfig::default());
        let comm = send_comm(&engine);
        let mut buf = vec![0u8; 10];
        script.lock().unwrap().post_results.push_back(Err(FabricError::Failed(5)));

        assert_eq!(engine.isend(&comm, desc(&mut buf)).unwrap_err(), EngineError::FabricPermanent(FabricError::Failed(5)));
        assert!(!engine.is_poisoned());
        assert!(engine.close_send(comm).is_ok());
    }

    #[test]
    fn test_permanent_failure_on_repost() {
        let (engine, script) = mock_engine(EngineConfig::default());
        let comm = send_comm(&engine);
        let mut buf = vec![0u8; 10];
        script.lock().unwrap().post_results.extend([Err(FabricError::Again), Err(FabricError::Failed(7))]);

        let request = engine.isend(&comm, desc(&mut buf)).unwrap().into_request();
        assert_eq!(engine.test(request).unwrap_err(), EngineError::FabricPermanent(FabricError::Failed(7)));
        assert_eq!(engine.num_pending(), 0);
        assert!(engine.close_send(comm).is_ok());
    }

    #[test]
    fn test_error_completion() {
        let (engine, script) = mock_engine(EngineConfig::default());
        let comm = recv_comm(&engine);
        let mut buf = vec![0u8; 10];

        let request = engine.irecv(&comm, desc(&mut buf)).unwrap().into_request();
        script.lock().unwrap().completions.push_back(CompletionEvent { error: Some(FI_ETRUNC), ..completion(&request, 10) });

        assert_eq!(engine.test(request).unwrap_err(), EngineError::FabricPermanent(FabricError::Failed(FI_ETRUNC)));
        assert!(!engine.is_poisoned());
    }

    #[test]
    fn test_dead_completion_queue_ends_test_loop() {
        let (engine, script) = mock_engine(EngineConfig::default());
        let comm = recv_comm(&engine);
        let mut buf = vec![0u8; 10];

        let request = engine.irecv(&comm, desc(&mut buf)).unwrap().into_request();
        script.lock().unwrap().failed_reads = Some(5);

        assert_eq!(engine.test(request).unwrap_err(), EngineError::FabricPermanent(FabricError::Failed(5)));
        assert!(engine.is_poisoned());
        assert_eq!(engine.poll_progress().unwrap_err(), EngineError::EndpointPoisoned);
    }

    #[test]
    fn test_pending_pool_exhausted() {
        let (engine, script) = mock_engine(EngineConfig { max_pending_sends: 1, ..Default::default() });
        let comm = send_comm(&engine);
        let mut buf = vec![0u8; 10];
        script.lock().unwrap().post_results.extend([Err(FabricError::Again), Err(FabricError::Again)]);

        assert!(engine.isend(&comm, desc(&mut buf)).unwrap().is_deferred());
        assert_eq!(engine.isend(&comm, desc(&mut buf)).unwrap_err(), EngineError::PoolExhausted { capacity: 1 });

        let state = engine.state.lock().unwrap();
        assert_eq!(state.comms[comm.key.to_raw()].num_unreleased(), 1);
        assert_eq!(state.pending.len(), 1);
    }

    #[test]
    fn test_test_hands_back_pending_request() {
        let (engine, _) = mock_engine(EngineConfig::default());
        let comm = recv_comm(&engine);
        let mut buf = vec![0u8; 10];

        let request = engine.irecv(&comm, desc(&mut buf)).unwrap().into_request();
        let context = request.context();
        match engine.test(request).unwrap() {
            TestOutcome::Pending(r) => assert_eq!(r.context(), context),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[rstest]
    #[case::unknown_comm(Context::from_raw(17 << 32))]
    #[case::unused_slot(Context::from_raw(5))]
    fn test_unknown_context_poisons(#[case] context: Context) {
        let (engine, script) = mock_engine(EngineConfig::default());
        let comm = send_comm(&engine);
        let mut buf = vec![0u8; 10];
        script.lock().unwrap().completions.push_back(CompletionEvent { context, len: 0, tag: Tag::from_raw(1), error: None });

        assert!(matches!(engine.poll_progress(), Err(EngineError::ProtocolViolation(_))));
        assert!(engine.is_poisoned());
        assert_eq!(engine.isend(&comm, desc(&mut buf)).unwrap_err(), EngineError::EndpointPoisoned);
        assert_eq!(engine.poll_progress().unwrap_err(), EngineError::EndpointPoisoned);
        assert!(engine.close_send(comm).is_ok());
    }

    #[test]
    fn test_completion_for_parked_request_poisons() {
        let (engine, script) = mock_engine(EngineConfig::default());
        let comm = send_comm(&engine);
        let mut buf = vec![0u8; 10];
        script.lock().unwrap().post_results.extend([Err(FabricError::Again), Err(FabricError::Again)]);

        let request = engine.isend(&comm, desc(&mut buf)).unwrap().into_request();
        script.lock().unwrap().completions.push_back(completion(&request, 10));

        assert!(matches!(engine.test(request), Err(EngineError::ProtocolViolation(_))));
        assert!(engine.is_poisoned());
    }

    #[test]
    fn test_duplicate_completion_poisons() {
        let (engine, script) = mock_engine(EngineConfig::default());
        let comm = recv_comm(&engine);
        let mut buf = vec![0u8; 10];

        let request = engine.irecv(&comm, desc(&mut buf)).unwrap().into_request();
        script.lock().unwrap().completions.extend([completion(&request, 10), completion(&request, 10)]);

        assert!(matches!(engine.poll_progress(), Err(EngineError::ProtocolViolation(_))));
        assert_eq!(engine.poll_request(&request).unwrap_err(), EngineError::EndpointPoisoned);
    }

    #[test]
    fn test_close_busy_communicator() {
        let (engine, script) = mock_engine(EngineConfig::default());
        let comm = send_comm(&engine);
        let mut buf = vec![0u8; 10];

        let request = engine.isend(&comm, desc(&mut buf)).unwrap().into_request();
        let CloseError { error, comm } = engine.close_send(comm).unwrap_err();
        assert_eq!(error, EngineError::CommBusy { outstanding: 1 });

        script.lock().unwrap().completions.push_back(completion(&request, 10));
        assert!(matches!(engine.test(request).unwrap(), TestOutcome::Done { .. }));
        assert!(engine.close_send(comm).is_ok());
    }

    #[test]
    fn test_accept_posts_handshake_receive_once() {
        let (engine, script) = mock_engine(EngineConfig::default());
        let (_, listen) = engine.listen(0).unwrap();

        assert!(!engine.accept(&listen).unwrap().is_ready());
        assert!(!engine.accept(&listen).unwrap().is_ready());
        assert_eq!(script.lock().unwrap().attempts.len(), 1);

        let CloseError { error, .. } = engine.close_listen(listen).unwrap_err();
        assert_eq!(error, EngineError::CommBusy { outstanding: 1 });
    }

    #[test]
    fn test_connect_rejects_control_tag() {
        let (engine, _) = mock_engine(EngineConfig::default());
        let peer = ConnectionHandle::new(&[1], Tag::from_raw(engine.layout().control_bit() | 1)).unwrap();
        let mut handle = ConnectHandle::new(peer);

        assert!(matches!(engine.connect(0, &mut handle), Err(EngineError::InvalidHandle(_))));
        assert!(!handle.is_connecting());
    }

    #[test]
    fn test_loopback_connect_and_transfer() {
        let fabric = LoopbackFabric::new();
        let (engine_a, send, engine_b, recv) = connected_pair(&fabric, EngineConfig::default()).unwrap();
        assert_eq!(send.tag(), recv.tag());

        let mut payload = b"hello, fabric".to_vec();
        let mut target = vec![0u8; 64];

        let recv_request = engine_b.irecv(&recv, desc(&mut target)).unwrap().into_request();
        let send_request = engine_a.isend(&send, desc(&mut payload)).unwrap().into_request();

        assert_eq!(wait_for(&engine_a, send_request).unwrap(), payload.len());
        assert_eq!(wait_for(&engine_b, recv_request).unwrap(), payload.len());
        assert_eq!(&target[..payload.len()], payload.as_slice());

        assert!(engine_a.close_send(send).is_ok());
        assert!(engine_b.close_recv(recv).is_ok());
    }

    #[test]
    fn test_loopback_message_order_with_transient_failures() {
        let fabric = LoopbackFabric::new();
        let endpoint_a = fabric.open_endpoint();
        let faults = endpoint_a.fault_injector();
        let (engine_a, send, engine_b, recv) = crate::test_util::connect_endpoints(endpoint_a, fabric.open_endpoint(), EngineConfig::default()).unwrap();

        faults.inject_transient(4);
        let mut messages = (0..4u8).map(|n| vec![n; 8]).collect::<Vec<_>>();
        let send_requests = messages.iter_mut()
            .map(|m| engine_a.isend(&send, desc(m)).unwrap().into_request())
            .collect::<Vec<_>>();
        assert_eq!(engine_a.num_pending(), 4);

        let mut targets = vec![vec![0u8; 8]; 4];
        let recv_requests = targets.iter_mut()
            .map(|t| engine_b.irecv(&recv, desc(t)).unwrap().into_request())
            .collect::<Vec<_>>();

        for request in send_requests {
            assert_eq!(wait_for(&engine_a, request).unwrap(), 8);
        }
        for request in recv_requests {
            assert_eq!(wait_for(&engine_b, request).unwrap(), 8);
        }
        for (n, target) in targets.iter().enumerate() {
            assert_eq!(target, &vec![n as u8; 8]);
        }
    }

    #[test]
    fn test_loopback_threads_share_engines() {
        const NUM_THREADS: usize = 4;
        const NUM_MESSAGES: usize = 50;

        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Engine>();

        let fabric = LoopbackFabric::new();
        let (engine_a, send, engine_b, recv) = connected_pair(&fabric, EngineConfig::default()).unwrap();
        let engine_a = Arc::new(engine_a);
        let engine_b = Arc::new(engine_b);

        let mut pairs = vec![(send, recv)];
        for _ in 1..NUM_THREADS {
            pairs.push(connect_comms(&engine_a, &engine_b).unwrap());
        }

        let threads = pairs.into_iter()
            .enumerate()
            .map(|(t, (send, recv))| {
                let engine_a = engine_a.clone();
                let engine_b = engine_b.clone();
                std::thread::spawn(move || {
                    for n in 0..NUM_MESSAGES {
                        let len = 1 + (t * NUM_MESSAGES + n) % 64;
                        let mut payload = vec![t as u8; len];
                        payload[0] = n as u8;
                        let mut target = vec![0u8; 64];

                        let recv_request = engine_b.irecv(&recv, desc(&mut target)).unwrap().into_request();
                        let send_request = engine_a.isend(&send, desc(&mut payload)).unwrap().into_request();

                        assert_eq!(wait_for(&engine_a, send_request).unwrap(), len);
                        assert_eq!(wait_for(&engine_b, recv_request).unwrap(), len);
                        assert_eq!(&target[..len], payload.as_slice());
                    }
                    (send, recv)
                })
            })
            .collect::<Vec<_>>();

        for thread in threads {
            let (send, recv) = thread.join().unwrap();
            // every request slot was released exactly once, or closing would fail
            assert!(engine_a.close_send(send).is_ok());
            assert!(engine_b.close_recv(recv).is_ok());
        }
        assert!(!engine_a.is_poisoned());
        assert!(!engine_b.is_poisoned());
        assert_eq!(engine_a.num_pending(), 0);
    }

    #[test]
    fn test_loopback_accept_twice() {
        let fabric = LoopbackFabric::new();
        let engine_a = Engine::new(EngineConfig::default(), Box::new(fabric.open_endpoint())).unwrap();
        let engine_b = Engine::new(EngineConfig::default(), Box::new(fabric.open_endpoint())).unwrap();

        let (handle, listen) = engine_b.listen(0).unwrap();
        let mut connect = ConnectHandle::from_bytes(&handle.to_bytes()).unwrap();
        let send = engine_a.connect(0, &mut connect).unwrap().ready().unwrap();
        let recv = engine_b.accept(&listen).unwrap().ready().unwrap();

        assert_eq!(engine_b.accept(&listen).unwrap_err(), EngineError::AlreadyAccepted { tag: listen.tag().to_raw() });
        assert!(engine_b.close_listen(listen).is_ok());
        assert!(engine_b.close_recv(recv).is_ok());
        assert!(engine_a.close_send(send).is_ok());
    }

    #[test]
    fn test_loopback_truncation() {
        let fabric = LoopbackFabric::new();
        let (engine_a, send, engine_b, recv) = connected_pair(&fabric, EngineConfig::default()).unwrap();

        let mut payload = vec![1u8; 32];
        let mut target = vec![0u8; 16];
        let recv_request = engine_b.irecv(&recv, desc(&mut target)).unwrap().into_request();
        let send_request = engine_a.isend(&send, desc(&mut payload)).unwrap().into_request();

        assert_eq!(wait_for(&engine_a, send_request).unwrap(), 32);
        assert_eq!(wait_for(&engine_b, recv_request).unwrap_err(), EngineError::FabricPermanent(FabricError::Failed(FI_ETRUNC)));
    }

    #[test]
    fn test_loopback_reserved_tag_bits() {
        let fabric = LoopbackFabric::new();
        let mut endpoint = fabric.open_endpoint();
        endpoint.set_tag_format(u64::MAX >> 8);
        let engine = Engine::new(EngineConfig::default(), Box::new(endpoint)).unwrap();

        assert_eq!(engine.layout().control_bit(), 1 << 55);
        let (handle, _) = engine.listen(0).unwrap();
        assert!(!engine.layout().is_control(handle.tag()));
    }
}
