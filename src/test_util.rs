//! Helpers for tests that need connected engines. They run over the in-process loopback fabric
//!  and are exported so that tests of code built on top of this crate can use them as well.

use anyhow::bail;

use crate::comm::{RecvComm, SendComm};
use crate::config::EngineConfig;
use crate::engine::{Engine, Progress};
use crate::error::EngineError;
use crate::fabric::loopback::{LoopbackEndpoint, LoopbackFabric};
use crate::handle::ConnectHandle;
use crate::request::{Request, TestOutcome};

/// upper bound for polling loops, so that a broken test fails instead of hanging
pub const MAX_POLL_ITERATIONS: usize = 10_000;

/// Two engines on fresh endpoints of `fabric`, the first one connected to the second
pub fn connected_pair(fabric: &LoopbackFabric, config: EngineConfig) -> anyhow::Result<(Engine, SendComm, Engine, RecvComm)> {
    connect_endpoints(fabric.open_endpoint(), fabric.open_endpoint(), config)
}

/// Creates an engine for each endpoint and connects `sender` to a listener on `receiver`
pub fn connect_endpoints(sender: LoopbackEndpoint, receiver: LoopbackEndpoint, config: EngineConfig) -> anyhow::Result<(Engine, SendComm, Engine, RecvComm)> {
    let engine_send = Engine::new(config.clone(), Box::new(sender))?;
    let engine_recv = Engine::new(config, Box::new(receiver))?;

    let (send, recv) = connect_comms(&engine_send, &engine_recv)?;
    Ok((engine_send, send, engine_recv, recv))
}

/// Opens one more stream between two engines, alternating between connecting and accepting
///  until both sides are established
pub fn connect_comms(engine_send: &Engine, engine_recv: &Engine) -> anyhow::Result<(SendComm, RecvComm)> {
    let dev = engine_recv.config().device;
    let (handle, listen) = engine_recv.listen(dev)?;
    let mut connect = ConnectHandle::from_bytes(&handle.to_bytes())?;

    let mut send = None;
    let mut recv = None;
    for _ in 0..MAX_POLL_ITERATIONS {
        if send.is_none() {
            if let Progress::Ready(comm) = engine_send.connect(engine_send.config().device, &mut connect)? {
                send = Some(comm);
            }
        }
        if recv.is_none() {
            if let Progress::Ready(comm) = engine_recv.accept(&listen)? {
                recv = Some(comm);
            }
        }

        if let (Some(_), Some(_)) = (&send, &recv) {
            break;
        }
    }

    let (Some(send), Some(recv)) = (send, recv)
    else {
        bail!("connection not established after {} iterations", MAX_POLL_ITERATIONS);
    };

    if let Err(e) = engine_recv.close_listen(listen) {
        bail!("closing the listener failed: {}", e.error);
    }
    Ok((send, recv))
}

/// Tests `request` until it reached a terminal state, returning the number of transferred bytes
pub fn wait_for(engine: &Engine, mut request: Request) -> Result<usize, EngineError> {
    for _ in 0..MAX_POLL_ITERATIONS {
        match engine.test(request)? {
            TestOutcome::Done { bytes } => return Ok(bytes),
            TestOutcome::Pending(r) => request = r,
        }
    }
    panic!("request {:?} did not complete after {} iterations", request, MAX_POLL_ITERATIONS);
}
