//! # libmapper-rs — Distributed Signal Mapping
//!
//! Devices advertise named, typed, vector-valued signals and negotiate
//! directional maps between them. Values flow along active maps, optionally
//! transformed by an expression, and every process keeps an eventually
//! consistent view of the network in its own graph.
//!
//! ## Design Principles
//!
//! 1. **Trait-first**: `Transport` is the contract between the device engine and the network
//! 2. **Pure data model**: `Value`, `PropertyStore` and the object records carry no I/O
//! 3. **Expressions own nothing**: text → compiled `Program` is a pure function
//! 4. **Poll-driven**: all progress happens inside `Device::poll`; no hidden threads
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use mapper::{Device, Direction, EventMask, Handler, LoopbackBus, MapSpec, SignalSpec, Type};
//!
//! # fn example() -> mapper::Result<()> {
//! let bus = LoopbackBus::new();
//! let mut synth = Device::new("synth", bus.endpoint())?;
//! let mut ctrl = Device::new("ctrl", bus.endpoint())?;
//!
//! let freq = synth.add_signal(SignalSpec::new(Direction::Incoming, "freq", 1, Type::Float))?;
//! let knob = ctrl.add_signal(SignalSpec::new(Direction::Outgoing, "knob", 1, Type::Float))?;
//! synth.set_handler(freq, Handler::signal(|u: &mapper::SignalUpdate<f32>| {
//!     println!("freq = {:?}", u.value);
//! }), EventMask::UPDATE)?;
//!
//! for _ in 0..4 {
//!     synth.poll(Duration::from_millis(10))?;
//!     ctrl.poll(Duration::from_millis(10))?;
//! }
//!
//! let map = ctrl.map(MapSpec::from_expression("%y=%x*440", &[freq, knob])?)?;
//! ctrl.push(map)?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod model;
pub mod instance;
pub mod dispatch;
pub mod expr;
pub mod graph;
pub mod negotiate;
pub mod route;
pub mod net;
pub mod device;
pub mod config;
#[cfg(feature = "tokio")]
pub mod runtime;

// ============================================================================
// Re-exports: Model (the data types)
// ============================================================================

pub use model::{
    DeviceId, DeviceRecord, Direction, FromValue, KindMask, Location, MapId, MapRecord,
    ObjRef, Object, ObjectKind, Prop, PropKey, Property, PropertyStore, Protocol, Shaped,
    SignalId, SignalRecord, SignalSpec, Status, Time, Type, Value,
};

// ============================================================================
// Re-exports: Engine
// ============================================================================

pub use config::DeviceConfig;
pub use device::{Device, InstanceMut};
pub use dispatch::{Event, EventMask, Handler, SignalUpdate};
pub use graph::{Graph, GraphEvent};
pub use instance::{InstanceId, InstanceStatus, Stealing};
pub use negotiate::MapSpec;
pub use net::{LoopbackBus, LoopbackTransport, Message, Transport};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("Invalid map: {0}")]
    InvalidMapSpec(String),

    #[error("Invalid instance {instance} on signal {signal}")]
    InvalidInstance { signal: model::SignalId, instance: u64 },

    #[error("Stale object: {0}")]
    StaleObject(String),

    #[error("Read-only: {0}")]
    ReadOnly(String),

    #[error("Expression error at position {position}: {message}")]
    Expression { position: usize, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
