//! EventDispatcher — routes value updates and instance lifecycle events to
//! the one handler registered on each signal.
//!
//! Handlers are a closed variant over the numeric element types, chosen at
//! registration and never reinterpreted. Registering a handler whose element
//! type differs from the signal's type fails with `TypeMismatch` and leaves
//! any previous handler in place.
//!
//! Delivery is synchronous, on the thread calling `Device::poll` (or the
//! local write that produced the event), in the order events were produced.

use std::fmt;

use hashbrown::HashMap;

use crate::instance::InstanceId;
use crate::model::{Scalar, SignalId, Time, Type, Value};
use crate::{Error, Result};

/// Signal event kinds. Bits match the wire event flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    NewInstance,
    UpstreamRelease,
    DownstreamRelease,
    Overflow,
    Update,
}

impl Event {
    pub fn bit(self) -> u8 {
        match self {
            Event::NewInstance => 0x01,
            Event::UpstreamRelease => 0x02,
            Event::DownstreamRelease => 0x04,
            Event::Overflow => 0x08,
            Event::Update => 0x10,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Event::NewInstance => "new_instance",
            Event::UpstreamRelease => "upstream_release",
            Event::DownstreamRelease => "downstream_release",
            Event::Overflow => "overflow",
            Event::Update => "update",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventMask(pub u8);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const NEW_INSTANCE: EventMask = EventMask(0x01);
    pub const UPSTREAM_RELEASE: EventMask = EventMask(0x02);
    pub const DOWNSTREAM_RELEASE: EventMask = EventMask(0x04);
    pub const RELEASE: EventMask = EventMask(0x06);
    pub const OVERFLOW: EventMask = EventMask(0x08);
    pub const UPDATE: EventMask = EventMask(0x10);
    pub const ALL: EventMask = EventMask(0x1F);

    pub fn contains(self, event: Event) -> bool {
        self.0 & event.bit() != 0
    }
}

impl std::ops::BitOr for EventMask {
    type Output = EventMask;
    fn bitor(self, rhs: EventMask) -> EventMask { EventMask(self.0 | rhs.0) }
}

/// What a handler receives.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalUpdate<T> {
    pub signal: SignalId,
    /// `None` for whole-signal handlers and for `Overflow`.
    pub instance: Option<InstanceId>,
    pub event: Event,
    /// The new value for `Update`; `None` for lifecycle events.
    pub value: Option<Vec<T>>,
    pub time: Time,
}

pub type Callback<T> = Box<dyn FnMut(&SignalUpdate<T>) + Send>;

/// A callback specialized to one element type.
pub enum TypedCallback {
    Int32(Callback<i32>),
    Int64(Callback<i64>),
    Float(Callback<f32>),
    Double(Callback<f64>),
}

impl TypedCallback {
    pub fn value_type(&self) -> Type {
        match self {
            TypedCallback::Int32(_) => Type::Int32,
            TypedCallback::Int64(_) => Type::Int64,
            TypedCallback::Float(_) => Type::Float,
            TypedCallback::Double(_) => Type::Double,
        }
    }
}

/// Element types a handler may be declared for.
pub trait HandlerType: Scalar {
    fn callback(cb: Callback<Self>) -> TypedCallback;
}

impl HandlerType for i32 {
    fn callback(cb: Callback<Self>) -> TypedCallback { TypedCallback::Int32(cb) }
}
impl HandlerType for i64 {
    fn callback(cb: Callback<Self>) -> TypedCallback { TypedCallback::Int64(cb) }
}
impl HandlerType for f32 {
    fn callback(cb: Callback<Self>) -> TypedCallback { TypedCallback::Float(cb) }
}
impl HandlerType for f64 {
    fn callback(cb: Callback<Self>) -> TypedCallback { TypedCallback::Double(cb) }
}

/// A signal handler, scoped to the whole signal or to individual instances.
pub enum Handler {
    /// Ignores instance ids.
    Signal(TypedCallback),
    /// Receives the instance id with every event.
    Instance(TypedCallback),
}

impl Handler {
    pub fn signal<T, F>(f: F) -> Handler
    where
        T: HandlerType,
        F: FnMut(&SignalUpdate<T>) + Send + 'static,
    {
        Handler::Signal(T::callback(Box::new(f)))
    }

    pub fn instance<T, F>(f: F) -> Handler
    where
        T: HandlerType,
        F: FnMut(&SignalUpdate<T>) + Send + 'static,
    {
        Handler::Instance(T::callback(Box::new(f)))
    }

    pub fn value_type(&self) -> Type {
        match self {
            Handler::Signal(cb) | Handler::Instance(cb) => cb.value_type(),
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Signal(cb) => write!(f, "Handler::Signal({})", cb.value_type()),
            Handler::Instance(cb) => write!(f, "Handler::Instance({})", cb.value_type()),
        }
    }
}

struct Registration {
    handler: Handler,
    mask: EventMask,
}

fn invoke<T: Scalar>(
    cb: &mut Callback<T>,
    signal: SignalId,
    instance: Option<InstanceId>,
    event: Event,
    value: Option<&Value>,
    time: Time,
) {
    let value = value.and_then(T::slice).map(<[T]>::to_vec);
    cb(&SignalUpdate { signal, instance, event, value, time });
}

#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<SignalId, Registration>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handler` on `signal`, replacing any previous one.
    pub fn register(&mut self, signal: SignalId, signal_type: Type, handler: Handler, mask: EventMask) -> Result<()> {
        if handler.value_type() != signal_type {
            return Err(Error::TypeMismatch {
                expected: signal_type.name().into(),
                got: format!("handler for {}", handler.value_type().name()),
            });
        }
        tracing::debug!(%signal, ?handler, mask = mask.0, "handler registered");
        self.handlers.insert(signal, Registration { handler, mask });
        Ok(())
    }

    pub fn unregister(&mut self, signal: SignalId) -> bool {
        self.handlers.remove(&signal).is_some()
    }

    pub fn has_handler(&self, signal: SignalId) -> bool {
        self.handlers.contains_key(&signal)
    }

    /// Deliver one event. Returns whether a handler was invoked.
    pub fn dispatch(
        &mut self,
        signal: SignalId,
        event: Event,
        instance: Option<InstanceId>,
        value: Option<&Value>,
        time: Time,
    ) -> bool {
        let Some(reg) = self.handlers.get_mut(&signal) else { return false };
        if !reg.mask.contains(event) {
            return false;
        }
        let (cb, instance) = match &mut reg.handler {
            Handler::Signal(cb) => (cb, None),
            Handler::Instance(cb) => (cb, instance),
        };
        match cb {
            TypedCallback::Int32(f) => invoke(f, signal, instance, event, value, time),
            TypedCallback::Int64(f) => invoke(f, signal, instance, event, value, time),
            TypedCallback::Float(f) => invoke(f, signal, instance, event, value, time),
            TypedCallback::Double(f) => invoke(f, signal, instance, event, value, time),
        }
        true
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher").field("handlers", &self.handlers.len()).finish()
    }
}
