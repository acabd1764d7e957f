//! The polymorphic object model: identity, kind, status and properties.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::property_store::{Access, PropertyStore};
use super::{Prop, PropKey, Property, Value};
use crate::{Error, Result};

macro_rules! object_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#018x}", self.0)
            }
        }
    };
}

object_id!(
    /// Device identifier: name hash in the high 32 bits.
    DeviceId
);
object_id!(
    /// Signal identifier: owning device id plus a per-device counter.
    SignalId
);
object_id!(
    /// Map identifier, derived from the map's endpoints and expression so
    /// that independently staged copies agree.
    MapId
);
object_id!(
    /// Identifier of the graph that tracks an object.
    GraphId
);

impl SignalId {
    pub fn device(self) -> DeviceId {
        DeviceId(self.0 & 0xFFFF_FFFF_0000_0000)
    }
}

/// A reference to any object tracked by a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjRef {
    Device(DeviceId),
    Signal(SignalId),
    Map(MapId),
}

impl From<DeviceId> for ObjRef {
    fn from(id: DeviceId) -> Self { ObjRef::Device(id) }
}
impl From<SignalId> for ObjRef {
    fn from(id: SignalId) -> Self { ObjRef::Signal(id) }
}
impl From<MapId> for ObjRef {
    fn from(id: MapId) -> Self { ObjRef::Map(id) }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjRef::Device(id) => write!(f, "device {id}"),
            ObjRef::Signal(id) => write!(f, "signal {id}"),
            ObjRef::Map(id) => write!(f, "map {id}"),
        }
    }
}

/// Object kind. Codes match the wire type flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Device,
    Signal,
    Map,
    Graph,
}

impl ObjectKind {
    pub fn code(self) -> u8 {
        match self {
            ObjectKind::Device => 0x01,
            ObjectKind::Signal => 0x06,
            ObjectKind::Map => 0x18,
            ObjectKind::Graph => 0x41,
        }
    }
}

/// Bit mask over object kinds, used to filter graph callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KindMask(pub u8);

impl KindMask {
    pub const DEVICE: KindMask = KindMask(0x01);
    pub const SIGNAL_IN: KindMask = KindMask(0x02);
    pub const SIGNAL_OUT: KindMask = KindMask(0x04);
    pub const SIGNAL: KindMask = KindMask(0x06);
    pub const MAP: KindMask = KindMask(0x18);
    pub const OBJECT: KindMask = KindMask(0x1F);

    pub fn contains(self, kind: ObjectKind) -> bool {
        self.0 & kind.code() != 0
    }
}

impl std::ops::BitOr for KindMask {
    type Output = KindMask;
    fn bitor(self, rhs: KindMask) -> KindMask { KindMask(self.0 | rhs.0) }
}

/// Object lifecycle status. Codes match the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Expired,
    Staged,
    Ready,
    Active,
    Reserved,
}

impl Status {
    pub fn code(self) -> i32 {
        match self {
            Status::Expired => 0x01,
            Status::Staged => 0x02,
            Status::Ready => 0x3E,
            Status::Active => 0x7E,
            Status::Reserved => 0x80,
        }
    }

    /// Ready or beyond (but not expired).
    pub fn is_ready(self) -> bool {
        matches!(self, Status::Ready | Status::Active)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Expired => "expired",
            Status::Staged => "staged",
            Status::Ready => "ready",
            Status::Active => "active",
            Status::Reserved => "reserved",
        };
        f.write_str(s)
    }
}

/// State shared by every object kind.
#[derive(Debug, Clone)]
pub struct ObjectHeader {
    id: u64,
    kind: ObjectKind,
    status: Status,
    is_local: bool,
    graph: GraphId,
    pub(crate) props: PropertyStore,
}

impl ObjectHeader {
    pub(crate) fn new(id: u64, kind: ObjectKind, is_local: bool, graph: GraphId) -> Self {
        let mut props = PropertyStore::new();
        props.init(Prop::Id, id as i64, Access::Static);
        props.init_local(Prop::IsLocal, is_local);
        props.init_local(Prop::Status, Status::Staged.code());
        Self { id, kind, status: Status::Staged, is_local, graph, props }
    }

    pub(crate) fn set_status(&mut self, status: Status) -> bool {
        if self.status == status {
            return false;
        }
        self.status = status;
        self.props.set_internal(Prop::Status, status.code());
        true
    }
}

/// Operations common to devices, signals, maps and graphs.
pub trait Object {
    fn header(&self) -> &ObjectHeader;
    fn header_mut(&mut self) -> &mut ObjectHeader;

    fn kind(&self) -> ObjectKind { self.header().kind }
    fn raw_id(&self) -> u64 { self.header().id }
    fn status(&self) -> Status { self.header().status }
    fn is_local(&self) -> bool { self.header().is_local }

    /// Non-owning back-reference to the tracking graph.
    fn graph(&self) -> GraphId { self.header().graph }

    fn props(&self) -> &PropertyStore { &self.header().props }

    fn num_properties(&self) -> usize { self.props().len() }

    fn property(&self, key: impl Into<PropKey>) -> Option<&Property>
    where
        Self: Sized,
    {
        self.props().get(key)
    }

    /// Set a published property.
    fn set_property(&mut self, key: impl Into<PropKey>, value: impl Into<Value>) -> Result<bool>
    where
        Self: Sized,
    {
        self.set_property_with(key, value, true)
    }

    /// Set a property; `publish = false` keeps it out of announcements.
    fn set_property_with(&mut self, key: impl Into<PropKey>, value: impl Into<Value>, publish: bool) -> Result<bool>
    where
        Self: Sized,
    {
        self.check_writable()?;
        self.header_mut().props.set(key, value, publish)
    }

    fn remove_property(&mut self, key: impl Into<PropKey>) -> Result<bool>
    where
        Self: Sized,
    {
        self.check_writable()?;
        self.header_mut().props.remove(key)
    }

    /// Expired objects are stale; remote devices and signals are owned by
    /// their peer and read-only here.
    fn check_writable(&self) -> Result<()> {
        let h = self.header();
        if h.status == Status::Expired {
            return Err(Error::StaleObject(format!("{:?} {:#x} has expired", h.kind, h.id)));
        }
        if !h.is_local && matches!(h.kind, ObjectKind::Device | ObjectKind::Signal) {
            return Err(Error::ReadOnly(format!("{:?} {:#x} is owned by a remote peer", h.kind, h.id)));
        }
        Ok(())
    }
}

/// 32-bit FNV-1a, used to derive device ids from names.
pub(crate) fn name_hash(s: &str) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for b in s.bytes() {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

/// 64-bit FNV-1a over a sequence of words and a trailing string.
pub(crate) fn key_hash(words: &[u64], text: &str) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    let mut feed = |b: u8| {
        h ^= b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    };
    for w in words {
        for b in w.to_le_bytes() {
            feed(b);
        }
    }
    for b in text.bytes() {
        feed(b);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(ObjectHeader);

    impl Object for Dummy {
        fn header(&self) -> &ObjectHeader { &self.0 }
        fn header_mut(&mut self) -> &mut ObjectHeader { &mut self.0 }
    }

    #[test]
    fn test_header_seeds_properties() {
        let d = Dummy(ObjectHeader::new(42, ObjectKind::Map, true, GraphId(1)));
        assert_eq!(d.status(), Status::Staged);
        assert_eq!(d.property(Prop::Id).map(|p| p.value.clone()), Some(Value::from(42i64)));
        assert_eq!(d.num_properties(), 3);
        assert_eq!(d.graph(), GraphId(1));
    }

    #[test]
    fn test_expired_object_is_stale() {
        let mut d = Dummy(ObjectHeader::new(1, ObjectKind::Map, true, GraphId(1)));
        d.header_mut().set_status(Status::Expired);
        assert!(matches!(d.set_property("x", 1i32), Err(Error::StaleObject(_))));
    }

    #[test]
    fn test_remote_signal_is_read_only() {
        let mut d = Dummy(ObjectHeader::new(1, ObjectKind::Signal, false, GraphId(1)));
        assert!(matches!(d.set_property("x", 1i32), Err(Error::ReadOnly(_))));
    }

    #[test]
    fn test_status_not_published() {
        let mut d = Dummy(ObjectHeader::new(1, ObjectKind::Map, true, GraphId(1)));
        assert!(d.header_mut().set_status(Status::Ready));
        assert!(!d.header_mut().props.has_modified());
        assert_eq!(d.props().get_as::<i32>(Prop::Status).unwrap(), Some(0x3E));
    }

    #[test]
    fn test_signal_id_device_bits() {
        let sig = SignalId(0xABCD_0000_0000_0007);
        assert_eq!(sig.device(), DeviceId(0xABCD_0000_0000_0000));
    }
}
