//! Map record: a route from one or more source signals to a destination.

use serde::{Deserialize, Serialize};

use super::object::{key_hash, DeviceId, GraphId, MapId, Object, ObjectHeader, ObjectKind, SignalId};
use super::property_store::Access;
use super::{Prop, Property, Value};

/// Where a map's expression is evaluated, or which end of a map a signal
/// sits on when querying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Location {
    Source,
    Destination,
    Any,
}

impl Location {
    pub fn code(self) -> i32 {
        match self {
            Location::Source => 1,
            Location::Destination => 2,
            Location::Any => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[default]
    Udp,
    Tcp,
}

impl Protocol {
    pub fn code(self) -> i32 {
        match self {
            Protocol::Udp => 1,
            Protocol::Tcp => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Protocol> {
        match code {
            1 => Some(Protocol::Udp),
            2 => Some(Protocol::Tcp),
            _ => None,
        }
    }
}

/// Derive the identity of a map from its endpoints and expression text.
///
/// Sources are sorted first, so two devices staging the same route with
/// the same expression compute the same id.
pub fn map_id(sources: &[SignalId], destination: SignalId, expression: Option<&str>) -> MapId {
    let mut words: Vec<u64> = sources.iter().map(|s| s.0).collect();
    words.sort_unstable();
    words.push(u64::MAX);
    words.push(destination.0);
    MapId(key_hash(&words, expression.unwrap_or("")))
}

#[derive(Debug, Clone)]
pub struct MapRecord {
    header: ObjectHeader,
    sources: Vec<SignalId>,
    destination: SignalId,
}

impl MapRecord {
    pub(crate) fn new(
        sources: Vec<SignalId>,
        destination: SignalId,
        expression: Option<&str>,
        is_local: bool,
        graph: GraphId,
    ) -> Self {
        let id = map_id(&sources, destination, expression);
        let mut header = ObjectHeader::new(id.0, ObjectKind::Map, is_local, graph);
        let props = &mut header.props;
        if let Some(expr) = expression {
            props.init(Prop::Expression, expr, Access::ReadWrite);
        }
        props.init(Prop::Muted, false, Access::ReadWrite);
        props.init(Prop::Protocol, Protocol::Udp.code(), Access::ReadWrite);
        props.init(Prop::ProcessingLocation, Location::Destination.code(), Access::Static);
        props.init(Prop::NumSigsIn, sources.len() as i32, Access::Static);
        Self { header, sources, destination }
    }

    pub fn id(&self) -> MapId {
        MapId(self.raw_id())
    }

    /// Source signals in slot order (`x$0`, `x$1`, ...).
    pub fn sources(&self) -> &[SignalId] {
        &self.sources
    }

    pub fn destination(&self) -> SignalId {
        self.destination
    }

    pub fn expression(&self) -> Option<&str> {
        self.props().value(Prop::Expression).and_then(Value::as_str)
    }

    pub fn is_muted(&self) -> bool {
        self.props().value(Prop::Muted).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn use_instances(&self) -> bool {
        self.props().value(Prop::UseInstances).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn protocol(&self) -> Protocol {
        self.props()
            .value(Prop::Protocol)
            .and_then(Value::as_i64)
            .and_then(|c| Protocol::from_code(c as i32))
            .unwrap_or_default()
    }

    pub fn diagnostics(&self) -> Option<&str> {
        self.props().value(Prop::Diagnostics).and_then(Value::as_str)
    }

    /// Devices owning an endpoint, deduplicated, in id order.
    pub fn participants(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self.sources.iter()
            .chain(std::iter::once(&self.destination))
            .map(|s| s.device())
            .collect();
        devices.sort_unstable();
        devices.dedup();
        devices
    }

    pub fn touches(&self, signal: SignalId) -> bool {
        self.destination == signal || self.sources.contains(&signal)
    }

    pub fn source_index(&self, signal: SignalId) -> Option<usize> {
        self.sources.iter().position(|s| *s == signal)
    }

    pub(crate) fn set_use_instances(&mut self, on: bool) {
        self.header.props.init(Prop::UseInstances, on, Access::Static);
    }

    /// Record (or clear, with `None`) the local negotiation diagnostic.
    /// Returns whether it changed.
    pub(crate) fn set_diagnostics(&mut self, text: Option<&str>) -> bool {
        if self.diagnostics() == text {
            return false;
        }
        self.header.props.init_local(Prop::Diagnostics, Value::from(text));
        true
    }

    /// Properties carried by a proposal.
    pub(crate) fn proposal_props(&self) -> Vec<Property> {
        self.props().published().cloned().collect()
    }
}

impl Object for MapRecord {
    fn header(&self) -> &ObjectHeader { &self.header }
    fn header_mut(&mut self) -> &mut ObjectHeader { &mut self.header }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Status;

    fn sig(dev: u64, n: u64) -> SignalId {
        SignalId((dev << 32) | n)
    }

    #[test]
    fn test_id_ignores_source_order() {
        let a = map_id(&[sig(1, 1), sig(2, 1)], sig(3, 1), Some("y=x$0+x$1"));
        let b = map_id(&[sig(2, 1), sig(1, 1)], sig(3, 1), Some("y=x$0+x$1"));
        assert_eq!(a, b);
        assert_ne!(a, map_id(&[sig(1, 1), sig(2, 1)], sig(3, 1), Some("y=x$0-x$1")));
        assert_ne!(a, map_id(&[sig(1, 1), sig(2, 1)], sig(3, 2), Some("y=x$0+x$1")));
    }

    #[test]
    fn test_participants_dedup() {
        let map = MapRecord::new(vec![sig(1, 1), sig(1, 2)], sig(2, 1), None, true, GraphId(1));
        assert_eq!(map.participants(), vec![DeviceId(1 << 32), DeviceId(2 << 32)]);
        assert_eq!(map.status(), Status::Staged);
        assert!(map.touches(sig(1, 2)));
        assert_eq!(map.source_index(sig(1, 2)), Some(1));
    }

    #[test]
    fn test_diagnostics_are_local() {
        let mut map = MapRecord::new(vec![sig(1, 1)], sig(2, 1), None, true, GraphId(1));
        assert!(map.set_diagnostics(Some("length mismatch")));
        assert!(!map.set_diagnostics(Some("length mismatch")));
        assert_eq!(map.diagnostics(), Some("length mismatch"));
        assert!(map.proposal_props().iter().all(|p| p.key != Prop::Diagnostics.into()));
        assert!(map.set_diagnostics(None));
        assert_eq!(map.diagnostics(), None);
    }

    #[test]
    fn test_map_props_are_writable() {
        let mut map = MapRecord::new(vec![sig(1, 1)], sig(2, 1), Some("y=x"), false, GraphId(1));
        assert!(map.set_property(Prop::Muted, true).unwrap());
        assert!(map.is_muted());
        assert_eq!(map.expression(), Some("y=x"));
    }
}
