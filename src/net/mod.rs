//! # Transport Trait
//!
//! This is the contract between a `Device` and whatever carries its
//! messages: discovery announcements, value updates and map negotiation.
//! Every operation the device engine needs from the network is here.
//!
//! ## Implementations
//!
//! | Transport | Module | Description |
//! |-----------|--------|-------------|
//! | `LoopbackTransport` | `loopback` | In-process bus for testing/embedding |
//!
//! The encoding is up to the transport. Messages derive serde so any
//! serde format can carry them.

pub mod loopback;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::instance::InstanceId;
use crate::model::{DeviceId, MapId, ObjRef, Property, SignalId, Time, Value};
use crate::Result;

pub use loopback::{LoopbackBus, LoopbackTransport};

// ============================================================================
// Messages
// ============================================================================

/// A value (or release) for one instance of a source signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueUpdate {
    pub signal: SignalId,
    pub instance: InstanceId,
    /// `None` releases the instance downstream.
    pub value: Option<Value>,
    pub time: Time,
}

/// A map proposal, sent by whichever device pushes a staged map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub map: MapId,
    pub sources: Vec<SignalId>,
    pub destination: SignalId,
    pub props: Vec<Property>,
}

/// An endpoint device's answer to a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Accept,
    Conflict(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Negotiation {
    Propose(Proposal),
    Ack { map: MapId, from: DeviceId, verdict: Verdict },
    /// Property changes on an agreed map.
    Modify { map: MapId, props: Vec<Property> },
    /// The destination wrote its first value through the map.
    Activated { map: MapId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Full or partial record of a device or signal, from its owner.
    Announce { object: ObjRef, props: Vec<Property> },
    /// The object is gone. For maps this is an unmap.
    Withdraw { object: ObjRef },
    Value(ValueUpdate),
    Negotiate(Negotiation),
}

// ============================================================================
// The Trait
// ============================================================================

/// Broadcast transport between devices.
///
/// A transport never delivers a device's own messages back to it.
pub trait Transport: Send {
    /// Bind a listening endpoint for a device named `name`. Returns the
    /// ordinal that makes the full name (`name.ordinal`) unique.
    fn bind(&mut self, name: &str) -> Result<u32>;

    /// Send a message to every other device.
    fn send(&mut self, message: &Message) -> Result<()>;

    /// Wait up to `timeout` for inbound messages and return all pending
    /// ones, oldest first. A zero timeout never blocks.
    fn recv(&mut self, timeout: Duration) -> Result<Vec<Message>>;

    fn announce(&mut self, object: ObjRef, props: Vec<Property>) -> Result<()> {
        self.send(&Message::Announce { object, props })
    }

    fn withdraw(&mut self, object: ObjRef) -> Result<()> {
        self.send(&Message::Withdraw { object })
    }

    fn deliver(&mut self, update: ValueUpdate) -> Result<()> {
        self.send(&Message::Value(update))
    }

    fn negotiate(&mut self, negotiation: Negotiation) -> Result<()> {
        self.send(&Message::Negotiate(negotiation))
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn bind(&mut self, name: &str) -> Result<u32> {
        (**self).bind(name)
    }

    fn send(&mut self, message: &Message) -> Result<()> {
        (**self).send(message)
    }

    fn recv(&mut self, timeout: Duration) -> Result<Vec<Message>> {
        (**self).recv(timeout)
    }
}
