//! Signal record and the builder used to declare local signals.

use serde::{Deserialize, Serialize};

use super::object::{DeviceId, GraphId, Object, ObjectHeader, ObjectKind, SignalId};
use super::property_store::Access;
use super::{Prop, PropKey, Property, Type, Value};
use crate::instance::{InstanceManager, Stealing};
use crate::{Error, Result};

/// Signal direction. Codes match the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn code(self) -> i32 {
        match self {
            Direction::Incoming => 1,
            Direction::Outgoing => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Direction> {
        match code {
            1 => Some(Direction::Incoming),
            2 => Some(Direction::Outgoing),
            _ => None,
        }
    }
}

/// Declaration of a local signal, consumed by `Device::add_signal`.
#[derive(Debug, Clone)]
pub struct SignalSpec {
    pub direction: Direction,
    pub name: String,
    pub length: usize,
    pub ty: Type,
    pub unit: Option<String>,
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub num_instances: usize,
    pub stealing: Option<Stealing>,
}

impl SignalSpec {
    pub fn new(direction: Direction, name: impl Into<String>, length: usize, ty: Type) -> Self {
        Self {
            direction,
            name: name.into(),
            length,
            ty,
            unit: None,
            min: None,
            max: None,
            num_instances: 1,
            stealing: None,
        }
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn min(mut self, min: impl Into<Value>) -> Self {
        self.min = Some(min.into());
        self
    }

    pub fn max(mut self, max: impl Into<Value>) -> Self {
        self.max = Some(max.into());
        self
    }

    pub fn num_instances(mut self, n: usize) -> Self {
        self.num_instances = n;
        self
    }

    pub fn stealing(mut self, mode: Stealing) -> Self {
        self.stealing = Some(mode);
        self
    }

    pub(crate) fn validate(&self, max_instances: usize) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::TypeMismatch { expected: "non-empty signal name".into(), got: "\"\"".into() });
        }
        if self.length == 0 {
            return Err(Error::TypeMismatch { expected: "length >= 1".into(), got: "0".into() });
        }
        if matches!(self.ty, Type::Null | Type::Pointer) {
            return Err(Error::TypeMismatch { expected: "signal value type".into(), got: self.ty.name().into() });
        }
        if self.num_instances == 0 || self.num_instances > max_instances {
            return Err(Error::TypeMismatch {
                expected: format!("1..={max_instances} instances"),
                got: self.num_instances.to_string(),
            });
        }
        for bound in [&self.min, &self.max].into_iter().flatten() {
            if bound.type_of() != self.ty || bound.len() != self.length {
                return Err(Error::TypeMismatch {
                    expected: format!("{}[{}]", self.ty.name(), self.length),
                    got: format!("{}[{}]", bound.type_name(), bound.len()),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SignalRecord {
    header: ObjectHeader,
    device: DeviceId,
    name: String,
    direction: Direction,
    length: usize,
    ty: Type,
    /// Present only on the owning device.
    pub(crate) instances: Option<InstanceManager>,
}

impl SignalRecord {
    pub(crate) fn new_local(id: SignalId, spec: &SignalSpec, stealing: Stealing, graph: GraphId) -> Self {
        let mut header = ObjectHeader::new(id.0, ObjectKind::Signal, true, graph);
        let props = &mut header.props;
        props.init(Prop::Name, spec.name.as_str(), Access::Static);
        props.init(Prop::Device, id.device().0 as i64, Access::Static);
        props.init(Prop::Direction, spec.direction.code(), Access::Static);
        props.init(Prop::Length, spec.length as i32, Access::Static);
        props.init(Prop::Type, spec.ty, Access::Static);
        props.init(Prop::NumInstances, spec.num_instances as i32, Access::Static);
        props.init(Prop::StealingMode, stealing.code(), Access::ReadWrite);
        props.init(Prop::Ephemeral, spec.num_instances > 1, Access::ReadWrite);
        if let Some(unit) = &spec.unit {
            props.init(Prop::Unit, unit.as_str(), Access::ReadWrite);
        }
        if let Some(min) = &spec.min {
            props.init(Prop::Min, min.clone(), Access::ReadWrite);
        }
        if let Some(max) = &spec.max {
            props.init(Prop::Max, max.clone(), Access::ReadWrite);
        }
        Self {
            header,
            device: id.device(),
            name: spec.name.clone(),
            direction: spec.direction,
            length: spec.length,
            ty: spec.ty,
            instances: Some(InstanceManager::new(id, spec.num_instances, stealing)),
        }
    }

    /// Build a mirror from an announced record. The structural properties
    /// (name, direction, length, type) are required.
    pub(crate) fn from_announcement(id: SignalId, props: &[Property], graph: GraphId) -> Result<Self> {
        let find = |prop: Prop| props.iter().find(|p| p.key == PropKey::Known(prop)).map(|p| &p.value);
        let missing = |prop: Prop| Error::Transport(format!("signal {id} announced without '{prop}'"));

        let name = find(Prop::Name).and_then(Value::as_str).ok_or_else(|| missing(Prop::Name))?.to_owned();
        let direction = find(Prop::Direction)
            .and_then(Value::as_i64)
            .and_then(|c| Direction::from_code(c as i32))
            .ok_or_else(|| missing(Prop::Direction))?;
        let length = find(Prop::Length).and_then(Value::as_i64).ok_or_else(|| missing(Prop::Length))? as usize;
        let ty = match find(Prop::Type) {
            Some(Value::Type(t)) if t.len() == 1 => t[0],
            _ => return Err(missing(Prop::Type)),
        };

        let mut header = ObjectHeader::new(id.0, ObjectKind::Signal, false, graph);
        for prop in [Prop::Name, Prop::Device, Prop::Direction, Prop::Length, Prop::Type] {
            if let Some(v) = find(prop) {
                header.props.init(prop, v.clone(), Access::Static);
            }
        }
        header.props.apply_remote(props);
        Ok(Self { header, device: id.device(), name, direction, length, ty, instances: None })
    }

    pub fn id(&self) -> SignalId {
        SignalId(self.raw_id())
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn value_type(&self) -> Type {
        self.ty
    }

    pub fn num_instances(&self) -> usize {
        match &self.instances {
            Some(pool) => pool.capacity(),
            None => self.props().get_as::<i32>(Prop::NumInstances).ok().flatten().unwrap_or(1).max(1) as usize,
        }
    }

    /// A signal with more than one instance slot.
    pub fn is_instanced(&self) -> bool {
        self.num_instances() > 1
    }

    pub fn stealing(&self) -> Stealing {
        self.props()
            .get_as::<i32>(Prop::StealingMode)
            .ok()
            .flatten()
            .and_then(Stealing::from_code)
            .unwrap_or_default()
    }

    /// Check a value against this signal's declared type and length.
    pub fn check_value(&self, value: &Value) -> Result<()> {
        if value.type_of() != self.ty || value.len() != self.length {
            return Err(Error::TypeMismatch {
                expected: format!("{}[{}]", self.ty.name(), self.length),
                got: format!("{}[{}]", value.type_name(), value.len()),
            });
        }
        Ok(())
    }

    pub(crate) fn sync_capacity(&mut self) {
        if let Some(pool) = &self.instances {
            let n = pool.capacity() as i32;
            self.header.props.set_internal(Prop::NumInstances, n);
        }
    }
}

impl Object for SignalRecord {
    fn header(&self) -> &ObjectHeader { &self.header }
    fn header_mut(&mut self) -> &mut ObjectHeader { &mut self.header }

    fn set_property_with(&mut self, key: impl Into<PropKey>, value: impl Into<Value>, publish: bool) -> Result<bool>
    where
        Self: Sized,
    {
        self.check_writable()?;
        let key = key.into();
        let value = value.into().normalized();
        let mut stealing = None;
        match key.as_known() {
            Some(Prop::StealingMode) => {
                let mode = value.as_i64()
                    .and_then(|c| Stealing::from_code(c as i32))
                    .ok_or_else(|| Error::TypeMismatch { expected: "stealing code 0..=2".into(), got: value.to_string() })?;
                stealing = Some(mode);
            }
            // Bounds share the signal's own shape.
            Some(Prop::Min | Prop::Max) if !value.is_null() => self.check_value(&value)?,
            _ => {}
        }
        let changed = self.header.props.set(key, value, publish)?;
        if let (Some(mode), Some(pool)) = (stealing, &mut self.instances) {
            pool.set_stealing(mode);
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(spec: SignalSpec) -> SignalRecord {
        SignalRecord::new_local(SignalId((1 << 32) | 1), &spec, Stealing::None, GraphId(1))
    }

    #[test]
    fn test_spec_validation() {
        let ok = SignalSpec::new(Direction::Outgoing, "freq", 1, Type::Float).unit("Hz");
        assert!(ok.validate(128).is_ok());
        assert!(SignalSpec::new(Direction::Outgoing, "x", 0, Type::Float).validate(128).is_err());
        assert!(SignalSpec::new(Direction::Outgoing, "x", 1, Type::Float).num_instances(200).validate(128).is_err());
        assert!(SignalSpec::new(Direction::Outgoing, "x", 2, Type::Float).min(0.0f32).validate(128).is_err());
    }

    #[test]
    fn test_structural_props_are_static() {
        let mut sig = local(SignalSpec::new(Direction::Incoming, "gain", 2, Type::Double));
        assert_eq!(sig.props().get_as::<i32>(Prop::Length).unwrap(), Some(2));
        assert!(matches!(sig.set_property(Prop::Length, 3i32), Err(Error::ReadOnly(_))));
        assert!(sig.set_property(Prop::Unit, "dB").unwrap());
    }

    #[test]
    fn test_stealing_property_reaches_pool() {
        let mut sig = local(SignalSpec::new(Direction::Incoming, "voice", 1, Type::Float).num_instances(4));
        sig.set_property(Prop::StealingMode, Stealing::Oldest.code()).unwrap();
        assert_eq!(sig.stealing(), Stealing::Oldest);
        assert_eq!(sig.instances.as_ref().map(|p| p.stealing()), Some(Stealing::Oldest));
        assert!(sig.set_property(Prop::StealingMode, 9i32).is_err());
        assert!(sig.is_instanced());
    }

    #[test]
    fn test_bounds_match_signal_shape() {
        let mut sig = local(SignalSpec::new(Direction::Incoming, "gain", 1, Type::Float));
        assert!(matches!(sig.set_property(Prop::Min, "abc"), Err(Error::TypeMismatch { .. })));
        assert!(matches!(sig.set_property(Prop::Max, vec![1.0f32, 2.0]), Err(Error::TypeMismatch { .. })));
        assert!(matches!(sig.set_property(Prop::Max, 1.0f64), Err(Error::TypeMismatch { .. })));
        assert!(sig.props().get(Prop::Min).is_none());

        assert!(sig.set_property(Prop::Min, 0.0f32).unwrap());
        assert!(sig.set_property(Prop::Max, 1.0f32).unwrap());
        assert!(matches!(sig.set_property(Prop::Rate, vec![1i32, 2, 3]), Err(Error::TypeMismatch { .. })));
    }

    #[test]
    fn test_stealing_code_type_is_checked_before_pool_changes() {
        let mut sig = local(SignalSpec::new(Direction::Incoming, "voice", 1, Type::Float).num_instances(2));
        assert!(matches!(sig.set_property(Prop::StealingMode, 1i64), Err(Error::TypeMismatch { .. })));
        assert_eq!(sig.instances.as_ref().map(|p| p.stealing()), Some(Stealing::None));
    }

    #[test]
    fn test_check_value_shape() {
        let sig = local(SignalSpec::new(Direction::Outgoing, "pos", 2, Type::Float));
        assert!(sig.check_value(&Value::from(vec![1.0f32, 2.0])).is_ok());
        assert!(sig.check_value(&Value::from(1.0f32)).is_err());
        assert!(sig.check_value(&Value::from(vec![1.0f64, 2.0])).is_err());
    }

    #[test]
    fn test_mirror_from_announcement() {
        let source = local(SignalSpec::new(Direction::Outgoing, "pos", 2, Type::Float).num_instances(3));
        let props: Vec<Property> = source.props().published().cloned().collect();
        let mirror = SignalRecord::from_announcement(source.id(), &props, GraphId(9)).unwrap();
        assert_eq!(mirror.name(), "pos");
        assert_eq!(mirror.length(), 2);
        assert_eq!(mirror.value_type(), Type::Float);
        assert_eq!(mirror.num_instances(), 3);
        assert!(!mirror.is_local());
        assert!(mirror.instances.is_none());
    }
}
