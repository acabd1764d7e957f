//! Graph — this process's directory of known devices, signals and maps.
//!
//! Records are held in arenas keyed by id. Local records are authoritative;
//! remote records are mirrors updated only by the owning `Device` when it
//! applies messages from the transport. Handles are plain ids, so an id
//! whose record is gone resolves to `StaleObject` rather than dangling.

use std::fmt;

use hashbrown::HashMap;

use crate::model::{
    DeviceId, DeviceRecord, Direction, GraphId, KindMask, Location, MapId, MapRecord, ObjRef,
    Object, Property, SignalId, SignalRecord, Status, Time,
};
use crate::{Error, Result};

/// Graph-level change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphEvent {
    New,
    Modified,
    Removed,
    Expired,
}

pub type GraphCallback = Box<dyn FnMut(ObjRef, GraphEvent) + Send>;

pub struct Graph {
    id: GraphId,
    devices: HashMap<DeviceId, DeviceRecord>,
    signals: HashMap<SignalId, SignalRecord>,
    maps: HashMap<MapId, MapRecord>,
    callbacks: Vec<(KindMask, GraphCallback)>,
}

impl Graph {
    pub fn new(id: GraphId) -> Self {
        Self {
            id,
            devices: HashMap::new(),
            signals: HashMap::new(),
            maps: HashMap::new(),
            callbacks: Vec::new(),
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    pub fn device(&self, id: DeviceId) -> Result<&DeviceRecord> {
        self.devices.get(&id).ok_or_else(|| Error::StaleObject(format!("unknown device {id}")))
    }

    pub fn signal(&self, id: SignalId) -> Result<&SignalRecord> {
        self.signals.get(&id).ok_or_else(|| Error::StaleObject(format!("unknown signal {id}")))
    }

    pub fn map(&self, id: MapId) -> Result<&MapRecord> {
        self.maps.get(&id).ok_or_else(|| Error::StaleObject(format!("unknown map {id}")))
    }

    pub(crate) fn device_mut(&mut self, id: DeviceId) -> Result<&mut DeviceRecord> {
        self.devices.get_mut(&id).ok_or_else(|| Error::StaleObject(format!("unknown device {id}")))
    }

    pub(crate) fn signal_mut(&mut self, id: SignalId) -> Result<&mut SignalRecord> {
        self.signals.get_mut(&id).ok_or_else(|| Error::StaleObject(format!("unknown signal {id}")))
    }

    pub(crate) fn map_mut(&mut self, id: MapId) -> Result<&mut MapRecord> {
        self.maps.get_mut(&id).ok_or_else(|| Error::StaleObject(format!("unknown map {id}")))
    }

    pub fn contains(&self, obj: ObjRef) -> bool {
        match obj {
            ObjRef::Device(id) => self.devices.contains_key(&id),
            ObjRef::Signal(id) => self.signals.contains_key(&id),
            ObjRef::Map(id) => self.maps.contains_key(&id),
        }
    }

    /// Type-erased access for operations common to every object kind.
    pub fn object(&self, obj: ObjRef) -> Result<&dyn Object> {
        Ok(match obj {
            ObjRef::Device(id) => self.device(id)? as &dyn Object,
            ObjRef::Signal(id) => self.signal(id)? as &dyn Object,
            ObjRef::Map(id) => self.map(id)? as &dyn Object,
        })
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceRecord> + '_ {
        self.devices.values()
    }

    pub fn signals(&self) -> impl Iterator<Item = &SignalRecord> + '_ {
        self.signals.values()
    }

    pub fn maps(&self) -> impl Iterator<Item = &MapRecord> + '_ {
        self.maps.values()
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn num_signals(&self) -> usize {
        self.signals.len()
    }

    pub fn num_maps(&self) -> usize {
        self.maps.len()
    }

    /// Look up a device by full name (`prefix.ordinal`).
    pub fn device_by_name(&self, name: &str) -> Option<&DeviceRecord> {
        self.devices.values().find(|d| d.name() == name)
    }

    /// Signals of `device`, optionally filtered by direction, sorted by id.
    pub fn signals_of(&self, device: DeviceId, direction: Option<Direction>) -> Vec<&SignalRecord> {
        let mut out: Vec<&SignalRecord> = self.signals.values()
            .filter(|s| s.device() == device)
            .filter(|s| direction.is_none_or(|d| s.direction() == d))
            .collect();
        out.sort_by_key(|s| s.id());
        out
    }

    pub fn signal_by_name(&self, device: DeviceId, name: &str) -> Option<&SignalRecord> {
        self.signals.values().find(|s| s.device() == device && s.name() == name)
    }

    /// Maps with `signal` at the given end.
    pub fn maps_of(&self, signal: SignalId, location: Location) -> Vec<&MapRecord> {
        let mut out: Vec<&MapRecord> = self.maps.values()
            .filter(|m| match location {
                Location::Source => m.sources().contains(&signal),
                Location::Destination => m.destination() == signal,
                Location::Any => m.touches(signal),
            })
            .collect();
        out.sort_by_key(|m| m.id());
        out
    }

    // ========================================================================
    // Callbacks
    // ========================================================================

    /// Register a callback for changes to objects selected by `mask`.
    pub fn add_callback<F>(&mut self, mask: KindMask, f: F)
    where
        F: FnMut(ObjRef, GraphEvent) + Send + 'static,
    {
        self.callbacks.push((mask, Box::new(f)));
    }

    pub fn clear_callbacks(&mut self) {
        self.callbacks.clear();
    }

    fn mask_bits(&self, obj: ObjRef) -> KindMask {
        match obj {
            ObjRef::Device(_) => KindMask::DEVICE,
            ObjRef::Signal(id) => match self.signals.get(&id).map(SignalRecord::direction) {
                Some(Direction::Incoming) => KindMask::SIGNAL_IN,
                Some(Direction::Outgoing) => KindMask::SIGNAL_OUT,
                None => KindMask::SIGNAL,
            },
            ObjRef::Map(_) => KindMask::MAP,
        }
    }

    pub(crate) fn notify(&mut self, obj: ObjRef, event: GraphEvent) {
        let bits = self.mask_bits(obj);
        tracing::trace!(%obj, ?event, "graph event");
        for (mask, cb) in &mut self.callbacks {
            if mask.0 & bits.0 != 0 {
                cb(obj, event);
            }
        }
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    pub(crate) fn insert_device(&mut self, record: DeviceRecord) {
        let id = record.id();
        self.devices.insert(id, record);
        self.notify(ObjRef::Device(id), GraphEvent::New);
    }

    pub(crate) fn insert_signal(&mut self, record: SignalRecord) {
        let id = record.id();
        self.signals.insert(id, record);
        self.notify(ObjRef::Signal(id), GraphEvent::New);
    }

    pub(crate) fn insert_map(&mut self, record: MapRecord) {
        let id = record.id();
        self.maps.insert(id, record);
        self.notify(ObjRef::Map(id), GraphEvent::New);
    }

    /// Apply a device announcement from its owner. Returns the resulting
    /// event, or `None` when nothing changed.
    pub(crate) fn apply_device(&mut self, id: DeviceId, props: &[Property]) -> Result<Option<GraphEvent>> {
        let event = match self.devices.get_mut(&id) {
            Some(dev) => {
                dev.synced = Time::now();
                if dev.header_mut().props.apply_remote(props) == 0 {
                    return Ok(None);
                }
                GraphEvent::Modified
            }
            None => {
                let dev = DeviceRecord::from_announcement(id, props, self.id)?;
                self.devices.insert(id, dev);
                GraphEvent::New
            }
        };
        self.notify(ObjRef::Device(id), event);
        Ok(Some(event))
    }

    /// Apply a signal announcement. The owning device must already be known.
    pub(crate) fn apply_signal(&mut self, id: SignalId, props: &[Property]) -> Result<Option<GraphEvent>> {
        let device = self.device_mut(id.device())?;
        device.synced = Time::now();
        let event = match self.signals.get_mut(&id) {
            Some(sig) => {
                if sig.header_mut().props.apply_remote(props) == 0 {
                    return Ok(None);
                }
                GraphEvent::Modified
            }
            None => {
                let mut sig = SignalRecord::from_announcement(id, props, self.id)?;
                sig.header_mut().set_status(Status::Ready);
                self.signals.insert(id, sig);
                GraphEvent::New
            }
        };
        self.notify(ObjRef::Signal(id), event);
        Ok(Some(event))
    }

    /// Mark every map touching `signals` as expired. Returns the affected ids.
    fn expire_maps_touching(&mut self, signals: &[SignalId]) -> Vec<MapId> {
        let mut expired: Vec<MapId> = self.maps.values()
            .filter(|m| m.status() != Status::Expired)
            .filter(|m| signals.iter().any(|s| m.touches(*s)))
            .map(MapRecord::id)
            .collect();
        expired.sort_unstable();
        for id in &expired {
            if let Some(map) = self.maps.get_mut(id) {
                map.header_mut().set_status(Status::Expired);
                tracing::debug!(map = %id, "map expired");
            }
            self.notify(ObjRef::Map(*id), GraphEvent::Expired);
        }
        expired
    }

    /// Remove a signal record; maps touching it expire.
    pub(crate) fn remove_signal(&mut self, id: SignalId, event: GraphEvent) -> Vec<MapId> {
        let expired = self.expire_maps_touching(&[id]);
        if self.signals.contains_key(&id) {
            self.notify(ObjRef::Signal(id), event);
            self.signals.remove(&id);
        }
        expired
    }

    /// Remove a device with all its signals; dependent maps expire.
    pub(crate) fn remove_device(&mut self, id: DeviceId, event: GraphEvent) -> Vec<MapId> {
        let signals: Vec<SignalId> = self.signals.keys().copied().filter(|s| s.device() == id).collect();
        let expired = self.expire_maps_touching(&signals);
        for sig in signals {
            self.notify(ObjRef::Signal(sig), event);
            self.signals.remove(&sig);
        }
        if self.devices.contains_key(&id) {
            if let Some(dev) = self.devices.get_mut(&id) {
                dev.header_mut().set_status(Status::Expired);
            }
            self.notify(ObjRef::Device(id), event);
            self.devices.remove(&id);
        }
        expired
    }

    pub(crate) fn remove_map(&mut self, id: MapId) -> bool {
        if !self.maps.contains_key(&id) {
            return false;
        }
        self.notify(ObjRef::Map(id), GraphEvent::Removed);
        self.maps.remove(&id).is_some()
    }

    /// Remote devices not heard from within `window` seconds of `now`.
    pub(crate) fn silent_devices(&self, now: Time, window: f64) -> Vec<DeviceId> {
        let mut out: Vec<DeviceId> = self.devices.values()
            .filter(|d| !d.is_local() && now.since(d.synced()) > window)
            .map(DeviceRecord::id)
            .collect();
        out.sort_unstable();
        out
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("devices", &self.devices.len())
            .field("signals", &self.signals.len())
            .field("maps", &self.maps.len())
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use crate::instance::Stealing;
    use crate::model::{Prop, SignalSpec, Type};

    const DEV: DeviceId = DeviceId(0xAA << 32);

    fn announced_device(name: &str) -> Vec<Property> {
        vec![Property::new(Prop::Name, name), Property::new(Prop::Ordinal, 1i32)]
    }

    fn announced_signal(id: SignalId, direction: Direction) -> Vec<Property> {
        let spec = SignalSpec::new(direction, "sig", 1, Type::Float);
        let rec = SignalRecord::new_local(id, &spec, Stealing::None, GraphId(0));
        rec.props().published().cloned().collect()
    }

    #[test]
    fn test_apply_announcements() {
        let mut g = Graph::new(GraphId(1));
        assert_eq!(g.apply_device(DEV, &announced_device("a.1")).unwrap(), Some(GraphEvent::New));
        assert_eq!(g.apply_device(DEV, &announced_device("a.1")).unwrap(), None);

        let sig = SignalId(DEV.0 | 1);
        assert_eq!(g.apply_signal(sig, &announced_signal(sig, Direction::Outgoing)).unwrap(), Some(GraphEvent::New));
        assert_eq!(g.signals_of(DEV, Some(Direction::Outgoing)).len(), 1);
        assert!(g.signals_of(DEV, Some(Direction::Incoming)).is_empty());
        assert!(g.device_by_name("a.1").is_some());
    }

    #[test]
    fn test_signal_requires_known_device() {
        let mut g = Graph::new(GraphId(1));
        let sig = SignalId(DEV.0 | 1);
        assert!(matches!(g.apply_signal(sig, &announced_signal(sig, Direction::Outgoing)), Err(Error::StaleObject(_))));
    }

    #[test]
    fn test_remove_device_expires_maps() {
        let mut g = Graph::new(GraphId(1));
        g.apply_device(DEV, &announced_device("a.1")).unwrap();
        let src = SignalId(DEV.0 | 1);
        g.apply_signal(src, &announced_signal(src, Direction::Outgoing)).unwrap();
        let dst = SignalId((0xBB << 32) | 1);
        let map = MapRecord::new(vec![src], dst, None, true, GraphId(1));
        let map_id = map.id();
        g.insert_map(map);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        g.add_callback(KindMask::MAP | KindMask::DEVICE, move |obj, ev| sink.lock().push((obj, ev)));

        assert_eq!(g.remove_device(DEV, GraphEvent::Expired), vec![map_id]);
        assert_eq!(g.map(map_id).unwrap().status(), Status::Expired);
        assert_eq!(g.num_signals(), 0);
        assert!(g.device(DEV).is_err());
        assert_eq!(*events.lock(), vec![
            (ObjRef::Map(map_id), GraphEvent::Expired),
            (ObjRef::Device(DEV), GraphEvent::Expired),
        ]);
    }

    #[test]
    fn test_callback_mask_by_direction() {
        let mut g = Graph::new(GraphId(1));
        g.apply_device(DEV, &announced_device("a.1")).unwrap();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        g.add_callback(KindMask::SIGNAL_IN, move |_, _| *c.lock() += 1);

        let out = SignalId(DEV.0 | 1);
        g.apply_signal(out, &announced_signal(out, Direction::Outgoing)).unwrap();
        let inp = SignalId(DEV.0 | 2);
        g.apply_signal(inp, &announced_signal(inp, Direction::Incoming)).unwrap();
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_maps_of_location() {
        let mut g = Graph::new(GraphId(1));
        let a = SignalId(DEV.0 | 1);
        let b = SignalId(DEV.0 | 2);
        g.insert_map(MapRecord::new(vec![a], b, None, true, GraphId(1)));
        assert_eq!(g.maps_of(a, Location::Source).len(), 1);
        assert!(g.maps_of(a, Location::Destination).is_empty());
        assert_eq!(g.maps_of(b, Location::Any).len(), 1);
    }
}
