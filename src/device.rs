//! # Device — the local engine
//!
//! A `Device` owns its signals, a `Graph` view of the network, the handler
//! table and the map negotiator. Nothing happens in the background: every
//! inbound message is handled, and every periodic duty performed, inside
//! [`Device::poll`]. Local writes (`set_value`, instance releases) route
//! synchronously to maps whose destination is local and hand one update to
//! the transport for the rest.
//!
//! ## Lifecycle
//!
//! ```text
//! new() ── bind ──▶ Staged ── first poll: announce device + signals ──▶ Ready
//!                                                                        │
//!                                    free() / drop: withdraw ◀───────────┘
//! ```

use std::time::Duration;

use hashbrown::HashMap;

use crate::config::DeviceConfig;
use crate::dispatch::{EventDispatcher, EventMask, Handler};
use crate::graph::{Graph, GraphEvent};
use crate::instance::{Allocation, InstanceEvent, InstanceId, InstanceManager, InstanceStatus, Origin};
use crate::model::object::name_hash;
use crate::model::{
    DeviceId, DeviceRecord, GraphId, KindMask, Location, MapId, ObjRef, Object, PropKey, Property,
    SignalId, SignalRecord, SignalSpec, Status, Time, Value,
};
use crate::negotiate::{MapNegotiator, MapSpec, Transition};
use crate::net::{Message, Negotiation, Transport, ValueUpdate};
use crate::route::Route;
use crate::{Error, Result};

pub struct Device {
    id: DeviceId,
    config: DeviceConfig,
    transport: Box<dyn Transport>,
    graph: Graph,
    dispatcher: EventDispatcher,
    negotiator: MapNegotiator,
    routes: HashMap<MapId, Route>,
    next_signal: u64,
    last_sync: Time,
    freed: bool,
}

impl Device {
    /// Create a device named `name` with the default configuration and bind
    /// it on `transport`.
    pub fn new<T: Transport + 'static>(name: &str, transport: T) -> Result<Self> {
        Self::with_config(name, transport, DeviceConfig::default())
    }

    pub fn with_config<T: Transport + 'static>(name: &str, transport: T, config: DeviceConfig) -> Result<Self> {
        config.validate()?;
        if name.is_empty() || name.contains(|c: char| c == '.' || c == '/' || c.is_whitespace()) {
            return Err(Error::Config(format!("invalid device name '{name}'")));
        }
        let mut transport: Box<dyn Transport> = Box::new(transport);
        let ordinal = transport.bind(name)?;
        let full = format!("{name}.{ordinal}");
        let id = DeviceId(u64::from(name_hash(&full)) << 32);

        let mut graph = Graph::new(GraphId(id.0));
        graph.insert_device(DeviceRecord::new(id, name, ordinal, true, graph.id()));
        tracing::debug!(device = %full, %id, "device bound");

        Ok(Self {
            id,
            negotiator: MapNegotiator::new(id),
            config,
            transport,
            graph,
            dispatcher: EventDispatcher::new(),
            routes: HashMap::new(),
            next_signal: 0,
            last_sync: Time::now(),
            freed: false,
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Full name, `<name>.<ordinal>`.
    pub fn name(&self) -> &str {
        self.record().map(DeviceRecord::name).unwrap_or_default()
    }

    pub fn ordinal(&self) -> u32 {
        self.record().map(DeviceRecord::ordinal).unwrap_or_default()
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn record(&self) -> Result<&DeviceRecord> {
        self.graph.device(self.id)
    }

    /// Whether the device has announced itself.
    pub fn is_ready(&self) -> bool {
        self.record().is_ok_and(|d| d.status().is_ready())
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Register a callback for graph changes on objects selected by `mask`.
    pub fn add_graph_callback<F>(&mut self, mask: KindMask, f: F)
    where
        F: FnMut(ObjRef, GraphEvent) + Send + 'static,
    {
        self.graph.add_callback(mask, f);
    }

    // ========================================================================
    // Signals
    // ========================================================================

    /// Add a signal. Adding a name that already exists returns the existing
    /// signal. The signal is announced on the next `poll`.
    pub fn add_signal(&mut self, spec: SignalSpec) -> Result<SignalId> {
        spec.validate(self.config.max_instances)?;
        if let Some(existing) = self.graph.signal_by_name(self.id, &spec.name) {
            return Ok(existing.id());
        }
        self.next_signal += 1;
        let id = SignalId(self.id.0 | self.next_signal);
        let stealing = spec.stealing.unwrap_or(self.config.default_stealing);
        let record = SignalRecord::new_local(id, &spec, stealing, self.graph.id());
        tracing::debug!(signal = %id, name = %spec.name, direction = ?spec.direction, "signal added");
        self.graph.insert_signal(record);
        Ok(id)
    }

    /// Remove a local signal. Maps touching it expire.
    pub fn remove_signal(&mut self, signal: SignalId) -> Result<()> {
        self.owned(signal)?;
        let announced = self.graph.signal(signal)?.status().is_ready();
        let expired = self.graph.remove_signal(signal, GraphEvent::Removed);
        self.drop_routes(&expired);
        self.dispatcher.unregister(signal);
        if announced {
            self.transport.withdraw(ObjRef::Signal(signal))?;
        }
        Ok(())
    }

    pub fn signal(&self, signal: SignalId) -> Result<&SignalRecord> {
        self.graph.signal(signal)
    }

    /// Local signals, in creation order.
    pub fn signals(&self) -> Vec<&SignalRecord> {
        self.graph.signals_of(self.id, None)
    }

    /// Ok for an existing local signal; `ReadOnly` for a remote one.
    fn owned(&self, signal: SignalId) -> Result<()> {
        let record = self.graph.signal(signal)?;
        if !record.is_local() {
            return Err(Error::ReadOnly(format!("signal {signal} belongs to another device")));
        }
        Ok(())
    }

    fn pool(&self, signal: SignalId) -> Result<&InstanceManager> {
        self.graph.signal(signal)?
            .instances
            .as_ref()
            .ok_or_else(|| Error::ReadOnly(format!("signal {signal} belongs to another device")))
    }

    // ========================================================================
    // Properties
    // ========================================================================

    pub fn property(&self, object: impl Into<ObjRef>, key: impl Into<PropKey>) -> Result<Option<&Property>> {
        Ok(self.graph.object(object.into())?.props().get(key))
    }

    /// Set a published property on a local device or signal, or on a map.
    /// Takes effect on the network at the next `push`.
    pub fn set_property(&mut self, object: impl Into<ObjRef>, key: impl Into<PropKey>, value: impl Into<Value>) -> Result<bool> {
        self.write_property(object.into(), key.into(), value.into(), true)
    }

    /// Like `set_property`, but the property is never announced.
    pub fn set_property_local(&mut self, object: impl Into<ObjRef>, key: impl Into<PropKey>, value: impl Into<Value>) -> Result<bool> {
        self.write_property(object.into(), key.into(), value.into(), false)
    }

    fn write_property(&mut self, object: ObjRef, key: PropKey, value: Value, publish: bool) -> Result<bool> {
        match object {
            ObjRef::Device(id) => self.graph.device_mut(id)?.set_property_with(key, value, publish),
            ObjRef::Signal(id) => self.graph.signal_mut(id)?.set_property_with(key, value, publish),
            ObjRef::Map(id) => self.graph.map_mut(id)?.set_property_with(key, value, publish),
        }
    }

    pub fn remove_property(&mut self, object: impl Into<ObjRef>, key: impl Into<PropKey>) -> Result<bool> {
        match object.into() {
            ObjRef::Device(id) => self.graph.device_mut(id)?.remove_property(key),
            ObjRef::Signal(id) => self.graph.signal_mut(id)?.remove_property(key),
            ObjRef::Map(id) => self.graph.map_mut(id)?.remove_property(key),
        }
    }

    pub fn status(&self, object: impl Into<ObjRef>) -> Result<Status> {
        Ok(self.graph.object(object.into())?.status())
    }

    /// Flush pending changes of an object to the network.
    ///
    /// For a device or signal this announces the modified published
    /// properties; for a staged map it sends the proposal (once); for an
    /// agreed map it sends the modified properties. Returns `false` when
    /// there was nothing to send.
    pub fn push(&mut self, object: impl Into<ObjRef>) -> Result<bool> {
        let object = object.into();
        let props = match object {
            ObjRef::Map(id) => return self.push_map(id),
            ObjRef::Device(id) => {
                let dev = self.graph.device_mut(id)?;
                dev.check_writable()?;
                let announced = dev.status().is_ready();
                (dev.header_mut().props.take_modified(), announced)
            }
            ObjRef::Signal(id) => {
                let sig = self.graph.signal_mut(id)?;
                sig.check_writable()?;
                let announced = sig.status().is_ready();
                (sig.header_mut().props.take_modified(), announced)
            }
        };
        match props {
            (props, true) if !props.is_empty() => {
                tracing::trace!(%object, count = props.len(), "pushing properties");
                self.transport.announce(object, props)?;
                Ok(true)
            }
            // Not announced yet: the first full announcement carries everything.
            _ => Ok(false),
        }
    }

    fn push_map(&mut self, id: MapId) -> Result<bool> {
        let status = self.graph.map(id)?.status();
        match status {
            Status::Expired => Err(Error::StaleObject(format!("map {id} has expired"))),
            Status::Staged | Status::Reserved => {
                if self.negotiator.was_proposed(id) {
                    return Ok(false);
                }
                let mut out = Vec::new();
                let transition = self.negotiator.propose(&mut self.graph, id, Time::now(), &mut out)?;
                self.graph.map_mut(id)?.header_mut().props.take_modified();
                self.send_all(out)?;
                if let Some(t) = transition {
                    self.on_transition(t);
                }
                Ok(true)
            }
            Status::Ready | Status::Active => {
                let props = self.graph.map_mut(id)?.header_mut().props.take_modified();
                if props.is_empty() {
                    return Ok(false);
                }
                if props.iter().any(|p| p.key == crate::model::Prop::Expression.into()) {
                    self.recompile_route(id);
                }
                self.transport.negotiate(Negotiation::Modify { map: id, props })?;
                Ok(true)
            }
        }
    }

    // ========================================================================
    // Values and instances
    // ========================================================================

    /// Write instance 0 of a local signal. Returns `Ok(false)` when the
    /// instance pool overflowed and nothing was written.
    pub fn set_value(&mut self, signal: SignalId, value: impl Into<Value>) -> Result<bool> {
        self.write_instance(signal, 0, value.into())
    }

    /// A handle on one instance of a local signal.
    pub fn instance(&mut self, signal: SignalId, id: InstanceId) -> Result<InstanceMut<'_>> {
        self.owned(signal)?;
        Ok(InstanceMut { device: self, signal, id })
    }

    pub fn release_instance(&mut self, signal: SignalId, id: InstanceId) -> Result<()> {
        self.owned(signal)?;
        let now = Time::now();
        let mut events = Vec::new();
        self.pool_mut(signal)?.release(id, Origin::Local, now, &mut events)?;
        fire(&self.graph, &mut self.dispatcher, signal, &events);
        self.propagate(signal, id, None, now)
    }

    /// Release (if active) and forget an instance. Returns whether it existed.
    pub fn remove_instance(&mut self, signal: SignalId, id: InstanceId) -> Result<bool> {
        self.owned(signal)?;
        let now = Time::now();
        let was_active = self.pool(signal)?.is_active(id);
        let mut events = Vec::new();
        let removed = self.pool_mut(signal)?.remove(id, now, &mut events);
        fire(&self.graph, &mut self.dispatcher, signal, &events);
        if was_active {
            self.propagate(signal, id, None, now)?;
        }
        Ok(removed)
    }

    /// Grow a local signal's pool by `count` slots, bounded by
    /// `max_instances`. Returns the new capacity.
    pub fn reserve_instances(&mut self, signal: SignalId, count: usize) -> Result<usize> {
        self.owned(signal)?;
        let max = self.config.max_instances;
        let capacity = self.pool_mut(signal)?.reserve(count, max);
        self.graph.signal_mut(signal)?.sync_capacity();
        Ok(capacity)
    }

    pub fn num_active_instances(&self, signal: SignalId) -> Result<usize> {
        Ok(self.pool(signal)?.num_active())
    }

    pub fn oldest_active_instance(&self, signal: SignalId) -> Result<Option<InstanceId>> {
        Ok(self.pool(signal)?.oldest_active())
    }

    pub fn newest_active_instance(&self, signal: SignalId) -> Result<Option<InstanceId>> {
        Ok(self.pool(signal)?.newest_active())
    }

    pub fn instance_value(&self, signal: SignalId, id: InstanceId) -> Result<Option<(&Value, Time)>> {
        Ok(self.pool(signal)?.value(id))
    }

    pub fn instance_status(&self, signal: SignalId, id: InstanceId) -> Result<InstanceStatus> {
        Ok(self.pool(signal)?.status(id))
    }

    fn pool_mut(&mut self, signal: SignalId) -> Result<&mut InstanceManager> {
        self.graph.signal_mut(signal)?
            .instances
            .as_mut()
            .ok_or_else(|| Error::ReadOnly(format!("signal {signal} belongs to another device")))
    }

    fn write_instance(&mut self, signal: SignalId, instance: InstanceId, value: Value) -> Result<bool> {
        self.owned(signal)?;
        self.graph.signal(signal)?.check_value(&value)?;
        let now = Time::now();
        let mut events = Vec::new();
        let pool = self.pool_mut(signal)?;
        let allocation = pool.allocate(instance, Origin::Local, now, &mut events);
        if allocation.is_bound() {
            // Local writes do not notify the writer's own handler.
            pool.update(instance, value.clone(), now, &mut Vec::new())?;
        }
        fire(&self.graph, &mut self.dispatcher, signal, &events);

        match allocation {
            Allocation::Refused => return Ok(false),
            Allocation::Stole { victim } => self.propagate(signal, victim, None, now)?,
            Allocation::Existing | Allocation::Activated => {}
        }
        self.propagate(signal, instance, Some(value), now)?;
        Ok(true)
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    /// Install the handler for a local signal, replacing any previous one.
    pub fn set_handler(&mut self, signal: SignalId, handler: Handler, mask: EventMask) -> Result<()> {
        self.owned(signal)?;
        let ty = self.graph.signal(signal)?.value_type();
        self.dispatcher.register(signal, ty, handler, mask)
    }

    pub fn clear_handler(&mut self, signal: SignalId) -> bool {
        self.dispatcher.unregister(signal)
    }

    // ========================================================================
    // Maps
    // ========================================================================

    /// Stage a map. It is proposed to its endpoint devices on `push`.
    pub fn map(&mut self, spec: MapSpec) -> Result<MapId> {
        self.negotiator.stage(&mut self.graph, &spec)
    }

    /// Remove a map here and on every other device.
    pub fn unmap(&mut self, map: MapId) -> Result<()> {
        self.graph.map(map)?;
        self.drop_map(map);
        if self.is_ready() {
            self.transport.withdraw(ObjRef::Map(map))?;
        }
        tracing::debug!(map = %map, "map removed");
        Ok(())
    }

    pub fn map_status(&self, map: MapId) -> Result<Status> {
        Ok(self.graph.map(map)?.status())
    }

    /// Whether the map is agreed by all its endpoint devices.
    pub fn map_is_ready(&self, map: MapId) -> bool {
        self.graph.map(map).is_ok_and(|m| m.status().is_ready())
    }

    fn drop_map(&mut self, map: MapId) {
        self.routes.remove(&map);
        self.negotiator.forget(map);
        self.graph.remove_map(map);
    }

    fn drop_routes(&mut self, maps: &[MapId]) {
        for map in maps {
            self.routes.remove(map);
            self.negotiator.forget(*map);
        }
    }

    fn on_transition(&mut self, transition: Transition) {
        let Transition::Ready(map) = transition else { return };
        let Ok(record) = self.graph.map(map) else { return };
        if record.destination().device() != self.id {
            return;
        }
        match Route::new(record) {
            Ok(route) => {
                self.routes.insert(map, route);
                tracing::debug!(map = %map, "route installed");
            }
            Err(e) => self.diagnose(map, &e),
        }
    }

    fn recompile_route(&mut self, map: MapId) {
        let Some(route) = self.routes.get_mut(&map) else { return };
        let expression = self.graph.map(map).ok().and_then(|m| m.expression().map(str::to_owned));
        match route.recompile(expression.as_deref()) {
            Ok(()) => {
                if let Ok(record) = self.graph.map_mut(map) {
                    record.set_diagnostics(None);
                }
            }
            Err(e) => self.diagnose(map, &e),
        }
    }

    fn diagnose(&mut self, map: MapId, error: &Error) {
        tracing::warn!(map = %map, error = %error, "map cannot be evaluated");
        if let Ok(record) = self.graph.map_mut(map) {
            record.set_diagnostics(Some(&error.to_string()));
        }
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Send a local source update along every agreed, unmuted map.
    fn propagate(&mut self, signal: SignalId, instance: InstanceId, value: Option<Value>, now: Time) -> Result<()> {
        let maps: Vec<(MapId, SignalId)> = self.graph.maps_of(signal, Location::Source)
            .into_iter()
            .filter(|m| m.status().is_ready() && !m.is_muted())
            .map(|m| (m.id(), m.destination()))
            .collect();
        if maps.is_empty() {
            return Ok(());
        }
        if maps.iter().any(|(_, dst)| dst.device() != self.id) {
            tracing::trace!(%signal, instance, release = value.is_none(), "sending value");
            self.transport.deliver(ValueUpdate { signal, instance, value: value.clone(), time: now })?;
        }
        for (map, dst) in maps {
            if dst.device() == self.id {
                self.route_inbound(map, signal, instance, value.as_ref(), now);
            }
        }
        Ok(())
    }

    fn on_value(&mut self, update: ValueUpdate) {
        let mut maps: Vec<MapId> = self.graph.maps_of(update.signal, Location::Source)
            .into_iter()
            .filter(|m| m.destination().device() == self.id && m.status().is_ready() && !m.is_muted())
            .map(|m| m.id())
            .collect();
        maps.sort_unstable();
        for map in maps {
            self.route_inbound(map, update.signal, update.instance, update.value.as_ref(), update.time);
        }
    }

    /// Apply one source update to the destination of a local route.
    fn route_inbound(&mut self, map: MapId, source: SignalId, instance: InstanceId, value: Option<&Value>, time: Time) {
        let Some(route) = self.routes.get_mut(&map) else { return };
        let Ok(record) = self.graph.map(map) else { return };
        let destination = record.destination();
        let target = route.target_instance(instance);
        let Ok(dst) = self.graph.signal(destination) else { return };
        let (ty, len) = (dst.value_type(), dst.length());

        let mut events: Vec<InstanceEvent> = Vec::new();
        let Some(value) = value else {
            route.release(target);
            if let Ok(pool) = self.pool_mut(destination) {
                if pool.is_active(target) {
                    let _ = pool.release(target, Origin::Upstream, time, &mut events);
                }
            }
            fire(&self.graph, &mut self.dispatcher, destination, &events);
            return;
        };

        let out = match route.feed(source, instance, value, ty, len) {
            Ok(Some(out)) => out,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(map = %map, error = %e, "dropping value");
                return;
            }
        };
        let Ok(pool) = self.pool_mut(destination) else { return };
        let written = pool.allocate(target, Origin::Upstream, time, &mut events).is_bound()
            && pool.update(target, out, time, &mut events).is_ok();
        fire(&self.graph, &mut self.dispatcher, destination, &events);
        if written {
            self.activate(map);
        }
    }

    /// Ready -> Active. The destination tells remote sources once it has
    /// written a value through the map.
    fn activate(&mut self, map: MapId) {
        let Ok(record) = self.graph.map_mut(map) else { return };
        if record.status() != Status::Ready {
            return;
        }
        let notify_sources = record.destination().device() == self.id
            && record.sources().iter().any(|s| s.device() != self.id);
        record.header_mut().set_status(Status::Active);
        tracing::debug!(map = %map, "map active");
        self.graph.notify(ObjRef::Map(map), GraphEvent::Modified);
        if notify_sources {
            if let Err(e) = self.transport.negotiate(Negotiation::Activated { map }) {
                tracing::warn!(map = %map, error = %e, "cannot report map activation");
            }
        }
    }

    // ========================================================================
    // Progress
    // ========================================================================

    /// Drive the device: announce, receive and handle messages for at most
    /// `timeout`, then run periodic housekeeping. Returns the number of
    /// messages handled.
    pub fn poll(&mut self, timeout: Duration) -> Result<usize> {
        self.announce_pending()?;
        let messages = self.transport.recv(timeout)?;
        let count = messages.len();
        for message in messages {
            if let Err(e) = self.handle(message) {
                tracing::warn!(device = %self.id, error = %e, "dropping message");
            }
        }
        self.housekeeping(Time::now())?;
        Ok(count)
    }

    fn announce_pending(&mut self) -> Result<()> {
        if !self.is_ready() {
            self.announce_all()?;
            if let Ok(dev) = self.graph.device_mut(self.id) {
                dev.header_mut().set_status(Status::Ready);
            }
            self.last_sync = Time::now();
            tracing::debug!(device = %self.name(), "device ready");
            return Ok(());
        }
        let staged: Vec<SignalId> = self.graph.signals_of(self.id, None)
            .into_iter()
            .filter(|s| s.status() == Status::Staged)
            .map(SignalRecord::id)
            .collect();
        for id in staged {
            self.announce_signal(id)?;
        }
        Ok(())
    }

    /// Announce the full record of the device and all its signals.
    fn announce_all(&mut self) -> Result<()> {
        let dev = self.graph.device_mut(self.id)?;
        dev.header_mut().props.take_modified();
        let props: Vec<Property> = dev.props().published().cloned().collect();
        self.transport.announce(ObjRef::Device(self.id), props)?;
        let signals: Vec<SignalId> = self.graph.signals_of(self.id, None).iter().map(|s| s.id()).collect();
        for id in signals {
            self.announce_signal(id)?;
        }
        Ok(())
    }

    fn announce_signal(&mut self, id: SignalId) -> Result<()> {
        let sig = self.graph.signal_mut(id)?;
        sig.header_mut().props.take_modified();
        sig.header_mut().set_status(Status::Ready);
        let props: Vec<Property> = sig.props().published().cloned().collect();
        self.transport.announce(ObjRef::Signal(id), props)
    }

    fn handle(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Announce { object, props } => self.on_announce(object, &props),
            Message::Withdraw { object } => {
                self.on_withdraw(object);
                Ok(())
            }
            Message::Value(update) => {
                self.on_value(update);
                Ok(())
            }
            Message::Negotiate(negotiation) => self.on_negotiate(negotiation),
        }
    }

    fn on_announce(&mut self, object: ObjRef, props: &[Property]) -> Result<()> {
        match object {
            ObjRef::Device(id) if id != self.id => {
                if self.graph.apply_device(id, props)? == Some(GraphEvent::New) {
                    tracing::debug!(device = %id, "discovered device");
                    // Introduce ourselves to the newcomer.
                    self.announce_all()?;
                }
            }
            ObjRef::Signal(id) if id.device() != self.id => {
                self.graph.apply_signal(id, props)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn on_withdraw(&mut self, object: ObjRef) {
        match object {
            ObjRef::Device(id) if id != self.id => {
                tracing::debug!(device = %id, "device withdrawn");
                let expired = self.graph.remove_device(id, GraphEvent::Removed);
                self.drop_routes(&expired);
            }
            ObjRef::Signal(id) if id.device() != self.id => {
                let expired = self.graph.remove_signal(id, GraphEvent::Removed);
                self.drop_routes(&expired);
            }
            ObjRef::Map(id) => {
                if self.graph.contains(object) {
                    tracing::debug!(map = %id, "map withdrawn by peer");
                }
                self.drop_map(id);
            }
            _ => {}
        }
    }

    fn on_negotiate(&mut self, negotiation: Negotiation) -> Result<()> {
        let mut out = Vec::new();
        let transition = match negotiation {
            Negotiation::Propose(proposal) => self.negotiator.on_proposal(&mut self.graph, &proposal, &mut out)?,
            Negotiation::Ack { map, from, verdict } => self.negotiator.on_ack(&mut self.graph, map, from, verdict),
            Negotiation::Modify { map, props } => {
                if self.graph.map(map).is_ok() && MapNegotiator::on_modify(&mut self.graph, map, &props)? {
                    self.recompile_route(map);
                }
                None
            }
            Negotiation::Activated { map } => {
                self.activate(map);
                None
            }
        };
        self.send_all(out)?;
        if let Some(t) = transition {
            self.on_transition(t);
        }
        Ok(())
    }

    fn send_all(&mut self, out: Vec<Negotiation>) -> Result<()> {
        for negotiation in out {
            self.transport.negotiate(negotiation)?;
        }
        Ok(())
    }

    fn housekeeping(&mut self, now: Time) -> Result<()> {
        if now.since(self.last_sync) >= self.config.sync_interval {
            let props: Vec<Property> = self.record()?.props().published().cloned().collect();
            self.transport.announce(ObjRef::Device(self.id), props)?;
            self.last_sync = now;
        }

        for id in self.graph.silent_devices(now, self.config.expire_after) {
            tracing::debug!(device = %id, "device timed out");
            let expired = self.graph.remove_device(id, GraphEvent::Expired);
            self.drop_routes(&expired);
        }

        let mut out = Vec::new();
        let transitions = self.negotiator.retry(&mut self.graph, now, self.config.retry_interval, &mut out);
        self.send_all(out)?;
        for t in transitions {
            self.on_transition(t);
        }
        Ok(())
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Withdraw the device from the network and release it.
    pub fn free(mut self) -> Result<()> {
        self.withdraw()
    }

    fn withdraw(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.freed, true) || !self.is_ready() {
            return Ok(());
        }
        tracing::debug!(device = %self.name(), "device withdrawn");
        self.transport.withdraw(ObjRef::Device(self.id))
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.withdraw() {
            tracing::warn!(device = %self.id, error = %e, "withdraw on drop failed");
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("graph", &self.graph)
            .field("routes", &self.routes.len())
            .finish()
    }
}

/// Deliver instance events to the signal's handler, attaching the current
/// value to `Update` events.
fn fire(graph: &Graph, dispatcher: &mut EventDispatcher, signal: SignalId, events: &[InstanceEvent]) {
    let pool = graph.signal(signal).ok().and_then(|s| s.instances.as_ref());
    for ev in events {
        let value = match (ev.event, ev.instance, pool) {
            (crate::dispatch::Event::Update, Some(id), Some(pool)) => pool.value(id).map(|(v, _)| v),
            _ => None,
        };
        dispatcher.dispatch(signal, ev.event, ev.instance, value, ev.time);
    }
}

// ============================================================================
// InstanceMut
// ============================================================================

/// One instance of a local signal, borrowed from its device.
pub struct InstanceMut<'a> {
    device: &'a mut Device,
    signal: SignalId,
    id: InstanceId,
}

impl InstanceMut<'_> {
    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn signal(&self) -> SignalId {
        self.signal
    }

    /// Write this instance, activating it if needed. `Ok(false)` on overflow.
    pub fn set_value(&mut self, value: impl Into<Value>) -> Result<bool> {
        self.device.write_instance(self.signal, self.id, value.into())
    }

    pub fn release(&mut self) -> Result<()> {
        self.device.release_instance(self.signal, self.id)
    }

    pub fn value(&self) -> Option<&Value> {
        self.device.instance_value(self.signal, self.id).ok().flatten().map(|(v, _)| v)
    }

    pub fn status(&self) -> InstanceStatus {
        self.device.instance_status(self.signal, self.id).unwrap_or(InstanceStatus::Unused)
    }
}
