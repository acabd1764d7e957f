//! # Object Model
//!
//! Values, properties and the four object kinds (device, signal, map,
//! graph) that every other layer passes around.
//!
//! Design rule: this module is pure data. No transport, no callbacks,
//! no clocks beyond stamping `Time::now()`.

pub mod device;
pub mod map;
pub mod object;
pub mod property;
pub mod property_store;
pub mod signal;
pub mod time;
pub mod value;

pub use device::DeviceRecord;
pub use map::{map_id, Location, MapRecord, Protocol};
pub use object::{
    DeviceId, GraphId, KindMask, MapId, ObjRef, Object, ObjectHeader, ObjectKind, SignalId, Status,
};
pub use property::{Prop, PropKey, Property};
pub use property_store::{Access, PropertyStore};
pub use signal::{Direction, SignalRecord, SignalSpec};
pub use time::Time;
pub use value::{FromValue, Scalar, Shaped, Type, Value, Vector};
