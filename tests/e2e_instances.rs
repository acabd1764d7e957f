//! Instance pool behaviour through the public `Device` API.

use std::sync::Arc;

use mapper::{
    Device, Direction, Event, EventMask, Handler, InstanceId, InstanceStatus, LoopbackBus, SignalId,
    SignalSpec, SignalUpdate, Stealing, Type,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

type Events = Arc<Mutex<Vec<(Event, Option<InstanceId>)>>>;

fn voiced(bus: &LoopbackBus, voices: usize, stealing: Stealing) -> (Device, SignalId, Events) {
    let mut dev = Device::new("poly", bus.endpoint()).unwrap();
    let sig = dev
        .add_signal(SignalSpec::new(Direction::Outgoing, "note", 1, Type::Int32).num_instances(voices).stealing(stealing))
        .unwrap();
    let events = Events::default();
    let log = events.clone();
    dev.set_handler(sig, Handler::instance(move |u: &SignalUpdate<i32>| log.lock().push((u.event, u.instance))), EventMask::ALL)
        .unwrap();
    (dev, sig, events)
}

#[test]
fn test_overflow_writes_nothing() {
    let bus = LoopbackBus::new();
    let (mut dev, sig, events) = voiced(&bus, 2, Stealing::None);

    assert!(dev.instance(sig, 1).unwrap().set_value(60).unwrap());
    assert!(dev.instance(sig, 2).unwrap().set_value(64).unwrap());
    assert!(!dev.instance(sig, 3).unwrap().set_value(67).unwrap());

    assert_eq!(dev.num_active_instances(sig).unwrap(), 2);
    assert_eq!(dev.instance_value(sig, 3).unwrap(), None);
    assert_eq!(
        *events.lock(),
        vec![(Event::NewInstance, Some(1)), (Event::NewInstance, Some(2)), (Event::Overflow, None)]
    );
}

#[test]
fn test_oldest_stealing_evicts_first_activated() {
    let bus = LoopbackBus::new();
    let (mut dev, sig, events) = voiced(&bus, 2, Stealing::Oldest);

    dev.instance(sig, 10).unwrap().set_value(1).unwrap();
    dev.instance(sig, 20).unwrap().set_value(2).unwrap();
    // Updating 10 does not make it younger.
    dev.instance(sig, 10).unwrap().set_value(3).unwrap();
    events.lock().clear();

    assert!(dev.instance(sig, 30).unwrap().set_value(4).unwrap());
    assert_eq!(*events.lock(), vec![(Event::DownstreamRelease, Some(10)), (Event::NewInstance, Some(30))]);
    assert_eq!(dev.instance_status(sig, 10).unwrap(), InstanceStatus::Released);
    assert_eq!(dev.oldest_active_instance(sig).unwrap(), Some(20));
    assert_eq!(dev.newest_active_instance(sig).unwrap(), Some(30));
}

#[test]
fn test_newest_stealing_evicts_last_activated() {
    let bus = LoopbackBus::new();
    let (mut dev, sig, _events) = voiced(&bus, 2, Stealing::Newest);

    dev.instance(sig, 10).unwrap().set_value(1).unwrap();
    dev.instance(sig, 20).unwrap().set_value(2).unwrap();
    dev.instance(sig, 30).unwrap().set_value(3).unwrap();

    assert_eq!(dev.instance_status(sig, 20).unwrap(), InstanceStatus::Released);
    assert_eq!(dev.instance_status(sig, 10).unwrap(), InstanceStatus::Active);
    assert_eq!(dev.instance_status(sig, 30).unwrap(), InstanceStatus::Active);
}

#[test]
fn test_stealing_mode_is_a_property() {
    let bus = LoopbackBus::new();
    let (mut dev, sig, _events) = voiced(&bus, 1, Stealing::None);
    dev.instance(sig, 1).unwrap().set_value(1).unwrap();
    assert!(!dev.instance(sig, 2).unwrap().set_value(2).unwrap());

    dev.set_property(sig, mapper::Prop::StealingMode, Stealing::Oldest.code()).unwrap();
    assert_eq!(dev.signal(sig).unwrap().stealing(), Stealing::Oldest);
    assert!(dev.instance(sig, 2).unwrap().set_value(2).unwrap());
    assert!(matches!(
        dev.set_property(sig, mapper::Prop::StealingMode, 7),
        Err(mapper::Error::TypeMismatch { .. })
    ));
}

#[test]
fn test_remove_and_reserve() {
    let bus = LoopbackBus::new();
    let (mut dev, sig, _events) = voiced(&bus, 1, Stealing::None);
    dev.instance(sig, 5).unwrap().set_value(1).unwrap();
    assert!(dev.remove_instance(sig, 5).unwrap());
    assert!(!dev.remove_instance(sig, 5).unwrap());
    assert_eq!(dev.instance_status(sig, 5).unwrap(), InstanceStatus::Unused);

    assert_eq!(dev.reserve_instances(sig, 1000).unwrap(), dev.config().max_instances);
}

proptest! {
    #[test]
    fn prop_pool_never_exceeds_capacity(voices in 1usize..6, ids in proptest::collection::vec(0u64..20, 1..40)) {
        let bus = LoopbackBus::new();
        let (mut dev, sig, _events) = voiced(&bus, voices, Stealing::None);
        for id in ids {
            let was_active = dev.instance_status(sig, id).unwrap() == InstanceStatus::Active;
            let full = dev.num_active_instances(sig).unwrap() == voices;
            let written = dev.instance(sig, id).unwrap().set_value(1).unwrap();
            prop_assert_eq!(written, was_active || !full);
            prop_assert!(dev.num_active_instances(sig).unwrap() <= voices);
        }
    }

    #[test]
    fn prop_oldest_evicts_earliest(voices in 1usize..5, extra in 1u64..6) {
        let bus = LoopbackBus::new();
        let (mut dev, sig, _events) = voiced(&bus, voices, Stealing::Oldest);
        let total = voices as u64 + extra;
        for id in 0..total {
            let expected_victim = if id >= voices as u64 { dev.oldest_active_instance(sig).unwrap() } else { None };
            dev.instance(sig, id).unwrap().set_value(id as i32).unwrap();
            if let Some(victim) = expected_victim {
                prop_assert_eq!(victim, id - voices as u64);
                prop_assert_eq!(dev.instance_status(sig, victim).unwrap(), InstanceStatus::Released);
            }
        }
        prop_assert_eq!(dev.num_active_instances(sig).unwrap(), voices);
    }
}
