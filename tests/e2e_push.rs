//! Push idempotence, observed through a recording transport.

use std::sync::Arc;
use std::time::Duration;

use mapper::net::Negotiation;
use mapper::{
    Device, DeviceId, Direction, MapSpec, Message, ObjRef, Prop, Property, Result, SignalId, SignalSpec,
    Status, Transport, Type,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

/// Records everything sent; `recv` drains an inbox the test fills.
#[derive(Clone, Default)]
struct Recorder {
    sent: Arc<Mutex<Vec<Message>>>,
    inbox: Arc<Mutex<Vec<Message>>>,
}

impl Recorder {
    fn take(&self) -> Vec<Message> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl Transport for Recorder {
    fn bind(&mut self, _name: &str) -> Result<u32> {
        Ok(1)
    }

    fn send(&mut self, message: &Message) -> Result<()> {
        self.sent.lock().push(message.clone());
        Ok(())
    }

    fn recv(&mut self, _timeout: Duration) -> Result<Vec<Message>> {
        Ok(std::mem::take(&mut *self.inbox.lock()))
    }
}

const PEER: DeviceId = DeviceId(0xBEEF << 32);
const PEER_IN: SignalId = SignalId((0xBEEF << 32) | 1);

fn introduce_peer(rec: &Recorder) {
    let mut inbox = rec.inbox.lock();
    inbox.push(Message::Announce {
        object: ObjRef::Device(PEER),
        props: vec![Property::new(Prop::Name, "peer.1"), Property::new(Prop::Ordinal, 1)],
    });
    inbox.push(Message::Announce {
        object: ObjRef::Signal(PEER_IN),
        props: vec![
            Property::new(Prop::Name, "in"),
            Property::new(Prop::Direction, Direction::Incoming.code()),
            Property::new(Prop::Length, 1),
            Property::new(Prop::Type, Type::Float),
        ],
    });
}

fn started(rec: &Recorder) -> (Device, SignalId) {
    let mut dev = Device::new("rec", rec.clone()).unwrap();
    let sig = dev.add_signal(SignalSpec::new(Direction::Outgoing, "out", 1, Type::Float)).unwrap();
    dev.poll(Duration::ZERO).unwrap();
    let first = rec.take();
    assert_eq!(first.len(), 2);
    assert!(matches!(&first[0], Message::Announce { object: ObjRef::Device(_), .. }));
    (dev, sig)
}

#[test]
fn test_device_push_is_idempotent() {
    let rec = Recorder::default();
    let (mut dev, _) = started(&rec);
    let id = dev.id();

    assert!(!dev.push(id).unwrap());
    assert!(dev.set_property(id, "usr_room", "kitchen").unwrap());
    assert!(dev.push(id).unwrap());
    assert!(!dev.push(id).unwrap());

    let sent = rec.take();
    assert_eq!(sent, vec![Message::Announce {
        object: ObjRef::Device(id),
        props: vec![Property::new("usr_room", "kitchen")],
    }]);

    // Same value again: no change, nothing to push.
    assert!(!dev.set_property(id, "usr_room", "kitchen").unwrap());
    assert!(!dev.push(id).unwrap());
    assert!(rec.take().is_empty());
}

#[test]
fn test_push_before_first_poll_is_deferred() {
    let rec = Recorder::default();
    let mut dev = Device::new("rec", rec.clone()).unwrap();
    let sig = dev.add_signal(SignalSpec::new(Direction::Outgoing, "out", 1, Type::Float)).unwrap();
    dev.set_property(sig, Prop::Unit, "Hz").unwrap();
    assert!(!dev.push(sig).unwrap());
    assert!(rec.take().is_empty());

    dev.poll(Duration::ZERO).unwrap();
    let sent = rec.take();
    let Message::Announce { props, .. } = &sent[1] else { panic!("expected signal announcement") };
    assert!(props.contains(&Property::new(Prop::Unit, "Hz")));
}

#[test]
fn test_staged_map_is_proposed_once() {
    let rec = Recorder::default();
    let (mut dev, out) = started(&rec);
    introduce_peer(&rec);
    dev.poll(Duration::ZERO).unwrap();
    rec.take();

    let map = dev.map(MapSpec::new(&[out], &[PEER_IN]).unwrap()).unwrap();
    assert!(dev.push(map).unwrap());
    let sent = rec.take();
    assert_eq!(sent.len(), 2);
    assert!(matches!(&sent[0], Message::Negotiate(Negotiation::Propose(p)) if p.map == map));

    assert!(!dev.push(map).unwrap());
    assert!(rec.take().is_empty());
    assert_eq!(dev.map_status(map).unwrap(), Status::Staged);
}

#[test]
fn test_ready_map_pushes_only_changes() {
    let rec = Recorder::default();
    let (mut dev, out) = started(&rec);
    let dst = dev.add_signal(SignalSpec::new(Direction::Incoming, "in", 1, Type::Float)).unwrap();
    let map = dev.map(MapSpec::new(&[out], &[dst]).unwrap()).unwrap();
    dev.push(map).unwrap();
    assert!(dev.map_is_ready(map));
    rec.take();

    assert!(!dev.push(map).unwrap());
    dev.set_property(map, Prop::Muted, true).unwrap();
    assert!(dev.push(map).unwrap());
    assert!(!dev.push(map).unwrap());
    assert_eq!(rec.take(), vec![Message::Negotiate(Negotiation::Modify {
        map,
        props: vec![Property::new(Prop::Muted, true)],
    })]);
}
