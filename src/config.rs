use anyhow::bail;
use tracing::debug;

pub type DeviceId = u32;

/// This is the reference sizing: twice the number of requests a collective library keeps in
///  flight at most, leaving headroom for requests parked in the retry queue
pub const DEFAULT_MAX_REQUESTS: usize = 256;

pub const DEFAULT_COMPLETION_BATCH_SIZE: usize = 128;

const MAX_COMPLETION_BATCH_SIZE: usize = 4096;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// The device this engine instance drives. Operations for other devices are rejected.
    pub device: DeviceId,

    /// Capacity of each communicator's request pool, which is also the ceiling for the number
    ///  of requests a communicator has in flight at any given time.
    ///
    /// Requests hold their slot until the caller observed their terminal state, so this must
    ///  cover the caller's own maximum number of outstanding operations plus the time requests
    ///  spend in the retry queue.
    pub max_requests: usize,

    /// Capacity of a sending communicator's pending entry pool, i.e. the maximum number of its
    ///  sends that can be parked for retry at the same time.
    pub max_pending_sends: usize,

    /// This is the maximum number of completion events read from the completion queue in a
    ///  single progress call
    pub completion_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            device: 0,
            max_requests: DEFAULT_MAX_REQUESTS,
            max_pending_sends: DEFAULT_MAX_REQUESTS,
            completion_batch_size: DEFAULT_COMPLETION_BATCH_SIZE,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_requests == 0 {
            bail!("max_requests must be at least 1");
        }
        if self.max_requests > u32::MAX as usize {
            bail!("max_requests must fit into 32 bits");
        }
        if self.max_pending_sends == 0 {
            bail!("max_pending_sends must be at least 1");
        }
        if self.max_pending_sends > u32::MAX as usize {
            bail!("max_pending_sends must fit into 32 bits");
        }
        if self.completion_batch_size == 0 || self.completion_batch_size > MAX_COMPLETION_BATCH_SIZE {
            bail!("completion_batch_size must be between 1 and {}", MAX_COMPLETION_BATCH_SIZE);
        }

        if self.max_pending_sends > self.max_requests {
            // every pending entry pins a request, so the surplus can never be used
            debug!("max_pending_sends {} exceeds max_requests {}", self.max_pending_sends, self.max_requests);
        }

        Ok(())
    }
}
