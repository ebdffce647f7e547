//! An asynchronous, non-blocking transport engine that multiplexes many point-to-point data
//!  streams over a single fabric endpoint and its completion queue. It is built for moving bulk
//!  data between distributed compute peers (e.g. GPUs) through RDMA style fabrics, where the
//!  provider offers tagged send / receive and reports finished operations through a completion
//!  queue.
//!
//! ## Design goals
//!
//! * The engine never blocks. Every operation either completes right away or returns a
//!   'deferred' outcome, and callers drive progress from their own polling loop
//!   * there are no threads or timers inside the engine
//!   * timeouts and cancellation are the caller's business
//! * Bounded resources: every communicator has a fixed-capacity request pool, and running out of
//!   slots is reported as a retryable condition rather than growing
//! * Transient provider back pressure is absorbed: a post the fabric can not accept right now is
//!   parked in a retry queue and reposted later, strictly in submission order
//! * Zero silent request loss: each request reaches exactly one terminal state, and its slot is
//!   released only after the caller observed that state
//! * Broken invariants (unknown completion contexts, double release) are never ignored. They
//!   poison the engine, which then refuses further operations.
//!
//! ## Tags
//!
//! All streams share one endpoint and are told apart by their tag. The provider announces the
//!  tag bits it supports, and the engine partitions them as follows:
//!
//! ```ascii
//!  63 ..  N   N-1        N-2 .. 0
//! [reserved] [control]  [stream id]
//! ```
//!
//! At least 33 usable bits are required (2^32 stream ids plus the control bit), otherwise the
//!  engine refuses to start. Stream tags are issued from 1 upwards and never reused. The control
//!  bit marks connection handshake messages.
//!
//! ## Connection handle
//!
//! Listeners publish a 64 byte handle, which the caller delivers to the peer out of band:
//!
//! ```ascii
//!  0: endpoint name (56 bytes, zero padded)
//! 56: stream tag (u64 BE)
//! ```
//!
//! ## Connection establishment
//!
//! ```ascii
//! connector                              listener
//!   connect: av_insert(peer name)
//!            send own name        ---->  accept: receive on (tag | control bit)
//!   ... until the send completed            ... until the receive completed
//!   -> SendComm                             av_insert(peer name) -> RecvComm
//! ```
//!
//! Both sides return [engine::Progress::Deferred] until their part of the handshake is done.
//!
//! ## Requests
//!
//! ```ascii
//! Created --post accepted--> Pending --completion--> Completed
//!    |                          \--error completion--> Error
//!    +--permanent post failure--> Error
//! ```
//!
//! A request that was parked for retry stays `Created` until its repost succeeds. The request's
//!  context handed to the provider is `(communicator key << 32) | slot index`, so completion
//!  events are matched to requests by indexing rather than searching.

pub mod buffers;
pub mod comm;
pub mod config;
pub mod engine;
pub mod error;
pub mod fabric;
pub mod handle;
mod pending_queue;
pub mod request;
pub mod safe_converter;
pub mod tag;
pub mod test_util;
