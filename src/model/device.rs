//! Device record — local or mirrored from a peer announcement.

use super::object::{DeviceId, GraphId, Object, ObjectHeader, ObjectKind};
use super::property_store::Access;
use super::{Prop, Property, Time};
use crate::{Error, Result};

/// Library version announced with every device.
pub const LIB_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct DeviceRecord {
    header: ObjectHeader,
    name: String,
    ordinal: u32,
    /// Last time the owner was heard from.
    pub(crate) synced: Time,
}

impl DeviceRecord {
    pub(crate) fn new(id: DeviceId, prefix: &str, ordinal: u32, is_local: bool, graph: GraphId) -> Self {
        let name = format!("{prefix}.{ordinal}");
        let mut header = ObjectHeader::new(id.0, ObjectKind::Device, is_local, graph);
        header.props.init(Prop::Name, name.as_str(), Access::Static);
        header.props.init(Prop::Ordinal, ordinal as i32, Access::Static);
        header.props.init(Prop::LibVersion, LIB_VERSION, Access::Static);
        Self { header, name, ordinal, synced: Time::now() }
    }

    /// Build a mirror from an announced record.
    pub(crate) fn from_announcement(id: DeviceId, props: &[Property], graph: GraphId) -> Result<Self> {
        let name = props.iter()
            .find(|p| p.key == Prop::Name.into())
            .and_then(|p| p.value.as_str())
            .ok_or_else(|| Error::Transport(format!("device {id} announced without a name")))?
            .to_owned();
        let ordinal = props.iter()
            .find(|p| p.key == Prop::Ordinal.into())
            .and_then(|p| p.value.as_i64())
            .unwrap_or(0) as u32;
        let mut header = ObjectHeader::new(id.0, ObjectKind::Device, false, graph);
        header.props.init(Prop::Name, name.as_str(), Access::Static);
        header.props.init(Prop::Ordinal, ordinal as i32, Access::Static);
        header.props.apply_remote(props);
        Ok(Self { header, name, ordinal, synced: Time::now() })
    }

    pub fn id(&self) -> DeviceId {
        DeviceId(self.raw_id())
    }

    /// Full name, `<prefix>.<ordinal>`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn synced(&self) -> Time {
        self.synced
    }
}

impl Object for DeviceRecord {
    fn header(&self) -> &ObjectHeader { &self.header }
    fn header_mut(&mut self) -> &mut ObjectHeader { &mut self.header }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Value;

    #[test]
    fn test_full_name_and_static_props() {
        let mut dev = DeviceRecord::new(DeviceId(1 << 32), "synth", 3, true, GraphId(1));
        assert_eq!(dev.name(), "synth.3");
        assert_eq!(dev.property(Prop::Name).map(|p| p.value.clone()), Some(Value::from("synth.3")));
        assert!(dev.set_property(Prop::Name, "other").is_err());
        assert!(dev.set_property("location", "stage left").unwrap());
    }

    #[test]
    fn test_mirror_requires_name() {
        assert!(DeviceRecord::from_announcement(DeviceId(1), &[], GraphId(2)).is_err());
        let props = vec![Property::new(Prop::Name, "synth.1"), Property::new("colour", "red")];
        let dev = DeviceRecord::from_announcement(DeviceId(1), &props, GraphId(2)).unwrap();
        assert!(!dev.is_local());
        assert_eq!(dev.props().value("colour"), Some(&Value::from("red")));
    }
}
