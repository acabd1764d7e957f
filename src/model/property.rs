//! Property keys: a fixed enumeration plus an open string namespace.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Type, Value};

/// Enumerated property keys. Discriminants are the wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum Prop {
    Bundle = 0x0100,
    Data = 0x0200,
    Device = 0x0300,
    Direction = 0x0400,
    Ephemeral = 0x0500,
    Expression = 0x0600,
    Host = 0x0700,
    Id = 0x0800,
    IsLocal = 0x0900,
    Jitter = 0x0A00,
    Length = 0x0B00,
    LibVersion = 0x0C00,
    Linked = 0x0D00,
    Max = 0x0E00,
    Min = 0x0F00,
    Muted = 0x1000,
    Name = 0x1100,
    NumInstances = 0x1200,
    NumMaps = 0x1300,
    NumMapsIn = 0x1400,
    NumMapsOut = 0x1500,
    NumSigsIn = 0x1600,
    NumSigsOut = 0x1700,
    Ordinal = 0x1800,
    Period = 0x1900,
    Port = 0x1A00,
    ProcessingLocation = 0x1B00,
    Protocol = 0x1C00,
    Rate = 0x1D00,
    Scope = 0x1E00,
    Signal = 0x1F00,
    Status = 0x2100,
    StealingMode = 0x2200,
    Synced = 0x2300,
    Type = 0x2400,
    Unit = 0x2500,
    UseInstances = 0x2600,
    Version = 0x2700,
    Diagnostics = 0x2800,
}

const ALL_PROPS: [Prop; 39] = [
    Prop::Bundle, Prop::Data, Prop::Device, Prop::Direction, Prop::Ephemeral,
    Prop::Expression, Prop::Host, Prop::Id, Prop::IsLocal, Prop::Jitter,
    Prop::Length, Prop::LibVersion, Prop::Linked, Prop::Max, Prop::Min,
    Prop::Muted, Prop::Name, Prop::NumInstances, Prop::NumMaps, Prop::NumMapsIn,
    Prop::NumMapsOut, Prop::NumSigsIn, Prop::NumSigsOut, Prop::Ordinal, Prop::Period,
    Prop::Port, Prop::ProcessingLocation, Prop::Protocol, Prop::Rate, Prop::Scope,
    Prop::Signal, Prop::Status, Prop::StealingMode, Prop::Synced, Prop::Type,
    Prop::Unit, Prop::UseInstances, Prop::Version, Prop::Diagnostics,
];

impl Prop {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Prop> {
        ALL_PROPS.iter().copied().find(|p| p.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            Prop::Bundle => "bundle",
            Prop::Data => "data",
            Prop::Device => "device",
            Prop::Direction => "direction",
            Prop::Ephemeral => "ephemeral",
            Prop::Expression => "expr",
            Prop::Host => "host",
            Prop::Id => "id",
            Prop::IsLocal => "is_local",
            Prop::Jitter => "jitter",
            Prop::Length => "length",
            Prop::LibVersion => "lib_version",
            Prop::Linked => "linked",
            Prop::Max => "max",
            Prop::Min => "min",
            Prop::Muted => "muted",
            Prop::Name => "name",
            Prop::NumInstances => "num_inst",
            Prop::NumMaps => "num_maps",
            Prop::NumMapsIn => "num_maps_in",
            Prop::NumMapsOut => "num_maps_out",
            Prop::NumSigsIn => "num_sigs_in",
            Prop::NumSigsOut => "num_sigs_out",
            Prop::Ordinal => "ordinal",
            Prop::Period => "period",
            Prop::Port => "port",
            Prop::ProcessingLocation => "process_loc",
            Prop::Protocol => "protocol",
            Prop::Rate => "rate",
            Prop::Scope => "scope",
            Prop::Signal => "signal",
            Prop::Status => "status",
            Prop::StealingMode => "stealing",
            Prop::Synced => "synced",
            Prop::Type => "type",
            Prop::Unit => "unit",
            Prop::UseInstances => "use_inst",
            Prop::Version => "version",
            Prop::Diagnostics => "diagnostics",
        }
    }

    /// Element type and, where fixed, length a value for this key must have.
    /// `None` for keys whose shape depends on the owning object (`min`,
    /// `max`) or that carry opaque data.
    pub fn shape(self) -> Option<(Type, Option<usize>)> {
        let (ty, len) = match self {
            Prop::Ephemeral | Prop::IsLocal | Prop::Muted | Prop::UseInstances => (Type::Bool, Some(1)),
            Prop::Expression | Prop::Host | Prop::LibVersion | Prop::Name | Prop::Unit | Prop::Diagnostics => {
                (Type::String, Some(1))
            }
            Prop::Direction | Prop::Length | Prop::NumInstances | Prop::NumMaps | Prop::NumMapsIn
            | Prop::NumMapsOut | Prop::NumSigsIn | Prop::NumSigsOut | Prop::Ordinal | Prop::Port
            | Prop::ProcessingLocation | Prop::Protocol | Prop::Status | Prop::StealingMode | Prop::Version => {
                (Type::Int32, Some(1))
            }
            Prop::Id | Prop::Device => (Type::Int64, Some(1)),
            Prop::Jitter | Prop::Period | Prop::Rate => (Type::Float, Some(1)),
            Prop::Synced => (Type::Time, Some(1)),
            Prop::Type => (Type::Type, None),
            Prop::Bundle | Prop::Data | Prop::Linked | Prop::Max | Prop::Min | Prop::Scope | Prop::Signal => {
                return None;
            }
        };
        Some((ty, len))
    }

    /// Look up an enumerated key by its textual name. A leading `@` is ignored.
    pub fn from_name(name: &str) -> Option<Prop> {
        let name = name.strip_prefix('@').unwrap_or(name);
        ALL_PROPS.iter().copied().find(|p| p.name() == name)
    }
}

impl fmt::Display for Prop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A property key. Enumerated keys always win over user keys with the same
/// text: `PropKey::from("name")` is `Known(Prop::Name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropKey {
    Known(Prop),
    Extra(String),
}

impl PropKey {
    pub fn parse(name: &str) -> PropKey {
        match Prop::from_name(name) {
            Some(p) => PropKey::Known(p),
            None => PropKey::Extra(name.to_owned()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            PropKey::Known(p) => p.name(),
            PropKey::Extra(s) => s,
        }
    }

    pub fn as_known(&self) -> Option<Prop> {
        match self {
            PropKey::Known(p) => Some(*p),
            PropKey::Extra(_) => None,
        }
    }
}

impl From<Prop> for PropKey {
    fn from(p: Prop) -> Self { PropKey::Known(p) }
}

impl From<&str> for PropKey {
    fn from(s: &str) -> Self { PropKey::parse(s) }
}

impl From<String> for PropKey {
    fn from(s: String) -> Self {
        match Prop::from_name(&s) {
            Some(p) => PropKey::Known(p),
            None => PropKey::Extra(s),
        }
    }
}

impl From<&PropKey> for PropKey {
    fn from(k: &PropKey) -> Self { k.clone() }
}

impl fmt::Display for PropKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A keyed value attached to an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub key: PropKey,
    pub value: Value,
    /// `false` keeps the property local: it is never announced.
    pub publish: bool,
}

impl Property {
    pub fn new(key: impl Into<PropKey>, value: impl Into<Value>) -> Self {
        Self { key: key.into(), value: value.into(), publish: true }
    }

    pub fn local(key: impl Into<PropKey>, value: impl Into<Value>) -> Self {
        Self { key: key.into(), value: value.into(), publish: false }
    }
}
