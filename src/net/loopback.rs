//! In-process loopback transport.
//!
//! The reference implementation of `Transport`. Every endpoint has a queue
//! on a shared bus; `send` JSON-encodes the message once and appends it to
//! every other endpoint's queue. `recv` waits on a condition variable for
//! at most the requested timeout.
//!
//! Use this transport for:
//! - Tests that drive several devices from one thread
//! - Embedding devices that only talk to each other in one process

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

use super::{Message, Transport};
use crate::{Error, Result};

// ============================================================================
// LoopbackBus
// ============================================================================

/// Shared medium. Cheap to clone.
#[derive(Clone, Default)]
pub struct LoopbackBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    state: Mutex<BusState>,
    arrived: Condvar,
}

#[derive(Default)]
struct BusState {
    queues: HashMap<u64, VecDeque<Vec<u8>>>,
    /// Last ordinal handed out per device name.
    ordinals: HashMap<String, u32>,
    next_endpoint: u64,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint.
    pub fn endpoint(&self) -> LoopbackTransport {
        let mut state = self.inner.state.lock();
        state.next_endpoint += 1;
        let id = state.next_endpoint;
        state.queues.insert(id, VecDeque::new());
        LoopbackTransport { bus: self.inner.clone(), endpoint: id, bound: false }
    }

    pub fn num_endpoints(&self) -> usize {
        self.inner.state.lock().queues.len()
    }
}

impl std::fmt::Debug for LoopbackBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackBus").field("endpoints", &self.num_endpoints()).finish()
    }
}

// ============================================================================
// LoopbackTransport
// ============================================================================

pub struct LoopbackTransport {
    bus: Arc<BusInner>,
    endpoint: u64,
    bound: bool,
}

impl LoopbackTransport {
    pub fn endpoint_id(&self) -> u64 {
        self.endpoint
    }
}

impl Transport for LoopbackTransport {
    fn bind(&mut self, name: &str) -> Result<u32> {
        if self.bound {
            return Err(Error::Transport(format!("endpoint {} is already bound", self.endpoint)));
        }
        let mut state = self.bus.state.lock();
        let ordinal = state.ordinals.entry(name.to_owned()).or_insert(0);
        *ordinal += 1;
        self.bound = true;
        tracing::debug!(endpoint = self.endpoint, name, ordinal = *ordinal, "loopback endpoint bound");
        Ok(*ordinal)
    }

    fn send(&mut self, message: &Message) -> Result<()> {
        if !self.bound {
            return Err(Error::Transport(format!("endpoint {} is not bound", self.endpoint)));
        }
        let bytes = serde_json::to_vec(message)?;
        let mut state = self.bus.state.lock();
        for (id, queue) in state.queues.iter_mut() {
            if *id != self.endpoint {
                queue.push_back(bytes.clone());
            }
        }
        drop(state);
        self.bus.arrived.notify_all();
        tracing::trace!(endpoint = self.endpoint, bytes = bytes.len(), "loopback send");
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Vec<Message>> {
        let mut state = self.bus.state.lock();
        let empty = state.queues.get(&self.endpoint).is_none_or(VecDeque::is_empty);
        if empty && !timeout.is_zero() {
            self.bus.arrived.wait_for(&mut state, timeout);
        }
        let raw: Vec<Vec<u8>> = match state.queues.get_mut(&self.endpoint) {
            Some(queue) => queue.drain(..).collect(),
            None => return Err(Error::Transport(format!("endpoint {} is detached", self.endpoint))),
        };
        drop(state);

        let mut out = Vec::with_capacity(raw.len());
        for bytes in raw {
            match serde_json::from_slice::<Message>(&bytes) {
                Ok(msg) => out.push(msg),
                Err(e) => tracing::warn!(endpoint = self.endpoint, error = %e, "dropping undecodable message"),
            }
        }
        Ok(out)
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.bus.state.lock().queues.remove(&self.endpoint);
    }
}
