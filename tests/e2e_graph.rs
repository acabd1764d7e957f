//! Graph view: discovery, queries, callbacks and housekeeping.

use std::sync::Arc;
use std::time::Duration;

use mapper::{
    Device, DeviceConfig, Direction, GraphEvent, KindMask, Location, LoopbackBus, MapSpec, ObjRef,
    Object, SignalSpec, Status, Type,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

fn pump(devices: &mut [&mut Device]) {
    for _ in 0..4 {
        for dev in devices.iter_mut() {
            dev.poll(Duration::ZERO).unwrap();
        }
    }
}

#[test]
fn test_discovery_and_queries() {
    let bus = LoopbackBus::new();
    let mut a = Device::new("synth", bus.endpoint()).unwrap();
    let mut b = Device::new("ctrl", bus.endpoint()).unwrap();
    let freq = a.add_signal(SignalSpec::new(Direction::Incoming, "freq", 1, Type::Float).unit("Hz")).unwrap();
    let gain = a.add_signal(SignalSpec::new(Direction::Incoming, "gain", 1, Type::Float)).unwrap();
    let env = a.add_signal(SignalSpec::new(Direction::Outgoing, "env", 1, Type::Float)).unwrap();
    let knob = b.add_signal(SignalSpec::new(Direction::Outgoing, "knob", 1, Type::Float)).unwrap();
    pump(&mut [&mut a, &mut b]);

    let g = b.graph();
    assert_eq!(g.num_devices(), 2);
    let synth = g.device_by_name("synth.1").unwrap();
    assert_eq!(synth.id(), a.id());
    let inputs: Vec<_> = g.signals_of(a.id(), Some(Direction::Incoming)).iter().map(|s| s.id()).collect();
    assert_eq!(inputs, vec![freq, gain]);
    assert_eq!(g.signal_by_name(a.id(), "env").map(|s| s.id()), Some(env));
    assert!(!g.signal(freq).unwrap().is_local());

    let map = b.map(MapSpec::new(&[knob], &[freq]).unwrap()).unwrap();
    b.push(map).unwrap();
    pump(&mut [&mut a, &mut b]);
    let g = a.graph();
    assert_eq!(g.maps_of(freq, Location::Destination).len(), 1);
    assert_eq!(g.maps_of(knob, Location::Source).len(), 1);
    assert!(g.maps_of(gain, Location::Any).is_empty());
}

#[test]
fn test_graph_callbacks_by_kind() {
    let bus = LoopbackBus::new();
    let mut a = Device::new("a", bus.endpoint()).unwrap();
    let mut b = Device::new("b", bus.endpoint()).unwrap();
    let seen: Arc<Mutex<Vec<(ObjRef, GraphEvent)>>> = Arc::default();
    let log = seen.clone();
    b.add_graph_callback(KindMask::DEVICE | KindMask::SIGNAL_OUT, move |obj, ev| log.lock().push((obj, ev)));

    let out = a.add_signal(SignalSpec::new(Direction::Outgoing, "out", 1, Type::Int32)).unwrap();
    a.add_signal(SignalSpec::new(Direction::Incoming, "in", 1, Type::Int32)).unwrap();
    pump(&mut [&mut a, &mut b]);

    let events = seen.lock().clone();
    assert!(events.contains(&(ObjRef::Device(a.id()), GraphEvent::New)));
    assert!(events.contains(&(ObjRef::Signal(out), GraphEvent::New)));
    assert!(events.iter().all(|(obj, _)| !matches!(obj, ObjRef::Signal(s) if *s != out)));

    seen.lock().clear();
    a.free().unwrap();
    b.poll(Duration::ZERO).unwrap();
    let events = seen.lock().clone();
    assert!(events.contains(&(ObjRef::Signal(out), GraphEvent::Removed)));
    assert!(matches!(events.last(), Some((ObjRef::Device(_), GraphEvent::Removed))));
}

#[test]
fn test_silent_device_expires() {
    let bus = LoopbackBus::new();
    let quick = DeviceConfig { sync_interval: 0.02, expire_after: 0.1, ..DeviceConfig::default() };
    let mut a = Device::new("a", bus.endpoint()).unwrap();
    let mut b = Device::with_config("b", bus.endpoint(), quick).unwrap();
    let out = a.add_signal(SignalSpec::new(Direction::Outgoing, "out", 1, Type::Float)).unwrap();
    let input = b.add_signal(SignalSpec::new(Direction::Incoming, "in", 1, Type::Float)).unwrap();
    pump(&mut [&mut a, &mut b]);
    let map = b.map(MapSpec::new(&[out], &[input]).unwrap()).unwrap();
    b.push(map).unwrap();
    pump(&mut [&mut a, &mut b]);
    assert!(b.map_is_ready(map));

    // `a` stops polling and goes quiet.
    std::thread::sleep(Duration::from_millis(200));
    b.poll(Duration::ZERO).unwrap();

    assert!(b.graph().device(a.id()).is_err());
    assert_eq!(b.map_status(map).unwrap(), Status::Expired);
}

#[test]
fn test_invalid_config_is_rejected() {
    let bus = LoopbackBus::new();
    let bad = DeviceConfig { expire_after: 1.0, sync_interval: 5.0, ..DeviceConfig::default() };
    assert!(matches!(Device::with_config("x", bus.endpoint(), bad), Err(mapper::Error::Config(_))));
}
