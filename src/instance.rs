//! InstanceManager — the bounded pool of "voices" owned by a local signal.
//!
//! Slots are bound to opaque 64-bit instance ids on `allocate`. When the
//! pool is full the stealing policy decides: refuse (`Overflow`), or
//! forcibly release the oldest/newest activated instance and reuse its slot.
//! A stolen id keeps reading back as `Released` until it is allocated again.
//!
//! Activation order is tracked with a monotonically increasing sequence
//! number rather than wall-clock time, so "oldest" is exact even when two
//! instances are activated within the same clock tick.
//!
//! The manager never calls user code. Every operation returns the lifecycle
//! events it produced, in order, and the owning device hands them to the
//! dispatcher.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::dispatch::Event;
use crate::model::{SignalId, Time, Value};
use crate::{Error, Result};

/// Opaque instance identifier.
pub type InstanceId = u64;

/// Instance stealing policy applied when the pool is exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stealing {
    #[default]
    None,
    Oldest,
    Newest,
}

impl Stealing {
    pub fn code(self) -> i32 {
        match self {
            Stealing::None => 0,
            Stealing::Oldest => 1,
            Stealing::Newest => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Stealing> {
        match code {
            0 => Some(Stealing::None),
            1 => Some(Stealing::Oldest),
            2 => Some(Stealing::Newest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    Unused,
    Active,
    Released,
}

/// Which side of a map caused an allocation or release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Local code writing to its own signal.
    Local,
    /// A value or release arriving from a source signal.
    Upstream,
}

/// A lifecycle event produced by the manager.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceEvent {
    pub event: Event,
    /// `None` for `Overflow`, which concerns the pool rather than one instance.
    pub instance: Option<InstanceId>,
    pub time: Time,
}

/// Outcome of `allocate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allocation {
    /// The id was already bound.
    Existing,
    /// A free slot was bound.
    Activated,
    /// The pool was full; `victim` was released to make room.
    Stole { victim: InstanceId },
    /// The pool was full and stealing is disabled. Nothing was written.
    Refused,
}

impl Allocation {
    pub fn is_bound(&self) -> bool {
        !matches!(self, Allocation::Refused)
    }
}

#[derive(Debug, Clone)]
struct Slot {
    id: Option<InstanceId>,
    value: Option<Value>,
    status: InstanceStatus,
    activated: u64,
    origin: Origin,
    time: Time,
}

impl Slot {
    fn unused() -> Self {
        Self {
            id: None,
            value: None,
            status: InstanceStatus::Unused,
            activated: 0,
            origin: Origin::Local,
            time: Time::default(),
        }
    }

    fn is_active(&self) -> bool {
        self.status == InstanceStatus::Active
    }
}

#[derive(Debug, Clone)]
pub struct InstanceManager {
    signal: SignalId,
    slots: Vec<Slot>,
    stealing: Stealing,
    next_seq: u64,
    /// Released ids whose slot has since been rebound, newest last.
    /// Holds at most `capacity` ids; older ones read back as `Unused`.
    released: VecDeque<InstanceId>,
}

impl InstanceManager {
    pub fn new(signal: SignalId, capacity: usize, stealing: Stealing) -> Self {
        Self {
            signal,
            slots: (0..capacity.max(1)).map(|_| Slot::unused()).collect(),
            stealing,
            next_seq: 1,
            released: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn stealing(&self) -> Stealing {
        self.stealing
    }

    pub fn set_stealing(&mut self, stealing: Stealing) {
        self.stealing = stealing;
    }

    /// Grow the pool by `count` unused slots, never beyond `max`.
    /// Returns the new capacity.
    pub fn reserve(&mut self, count: usize, max: usize) -> usize {
        let target = (self.slots.len() + count).min(max.max(1));
        while self.slots.len() < target {
            self.slots.push(Slot::unused());
        }
        self.slots.len()
    }

    fn find_active(&self, id: InstanceId) -> Option<usize> {
        self.slots.iter().position(|s| s.is_active() && s.id == Some(id))
    }

    fn find_free(&self) -> Option<usize> {
        self.slots.iter().position(|s| !s.is_active())
    }

    fn pick_victim(&self) -> Option<usize> {
        let active = self.slots.iter().enumerate().filter(|(_, s)| s.is_active());
        match self.stealing {
            Stealing::None => None,
            Stealing::Oldest => active.min_by_key(|(_, s)| s.activated).map(|(i, _)| i),
            Stealing::Newest => active.max_by_key(|(_, s)| s.activated).map(|(i, _)| i),
        }
    }

    fn bind(&mut self, index: usize, id: InstanceId, origin: Origin, time: Time) {
        let previous = &self.slots[index];
        if let (InstanceStatus::Released, Some(old)) = (previous.status, previous.id) {
            if old != id {
                self.released.push_back(old);
                while self.released.len() > self.slots.len() {
                    self.released.pop_front();
                }
            }
        }
        self.released.retain(|r| *r != id);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots[index] = Slot {
            id: Some(id),
            value: None,
            status: InstanceStatus::Active,
            activated: seq,
            origin,
            time,
        };
    }

    fn release_event(origin: Origin) -> Event {
        match origin {
            Origin::Upstream => Event::UpstreamRelease,
            Origin::Local => Event::DownstreamRelease,
        }
    }

    /// Bind `id` to a slot, stealing if the policy allows.
    pub fn allocate(&mut self, id: InstanceId, origin: Origin, time: Time, events: &mut Vec<InstanceEvent>) -> Allocation {
        if self.find_active(id).is_some() {
            return Allocation::Existing;
        }
        if let Some(index) = self.find_free() {
            self.bind(index, id, origin, time);
            events.push(InstanceEvent { event: Event::NewInstance, instance: Some(id), time });
            return Allocation::Activated;
        }
        let Some(index) = self.pick_victim() else {
            tracing::debug!(signal = %self.signal, instance = id, "instance pool exhausted");
            events.push(InstanceEvent { event: Event::Overflow, instance: None, time });
            return Allocation::Refused;
        };
        let victim = self.slots[index].id.unwrap_or_default();
        let victim_origin = self.slots[index].origin;
        tracing::debug!(signal = %self.signal, victim, instance = id, mode = ?self.stealing, "stealing instance");
        self.slots[index].status = InstanceStatus::Released;
        self.slots[index].value = None;
        events.push(InstanceEvent { event: Self::release_event(victim_origin), instance: Some(victim), time });
        self.bind(index, id, origin, time);
        events.push(InstanceEvent { event: Event::NewInstance, instance: Some(id), time });
        Allocation::Stole { victim }
    }

    /// Release an active instance and free its slot.
    pub fn release(&mut self, id: InstanceId, origin: Origin, time: Time, events: &mut Vec<InstanceEvent>) -> Result<()> {
        let index = self.find_active(id)
            .ok_or(Error::InvalidInstance { signal: self.signal, instance: id })?;
        let slot = &mut self.slots[index];
        slot.status = InstanceStatus::Released;
        slot.value = None;
        slot.time = time;
        events.push(InstanceEvent { event: Self::release_event(origin), instance: Some(id), time });
        Ok(())
    }

    /// Write a value to an active instance.
    pub fn update(&mut self, id: InstanceId, value: Value, time: Time, events: &mut Vec<InstanceEvent>) -> Result<()> {
        let index = self.find_active(id)
            .ok_or(Error::InvalidInstance { signal: self.signal, instance: id })?;
        let slot = &mut self.slots[index];
        slot.value = Some(value);
        slot.time = time;
        events.push(InstanceEvent { event: Event::Update, instance: Some(id), time });
        Ok(())
    }

    /// Release (if active) and forget an instance id; the slot returns to `Unused`.
    pub fn remove(&mut self, id: InstanceId, time: Time, events: &mut Vec<InstanceEvent>) -> bool {
        self.released.retain(|r| *r != id);
        let Some(index) = self.slots.iter().position(|s| s.id == Some(id)) else { return false };
        if self.slots[index].is_active() {
            events.push(InstanceEvent { event: Event::DownstreamRelease, instance: Some(id), time });
        }
        self.slots[index] = Slot::unused();
        true
    }

    pub fn status(&self, id: InstanceId) -> InstanceStatus {
        if self.find_active(id).is_some() {
            return InstanceStatus::Active;
        }
        if self.released.contains(&id)
            || self.slots.iter().any(|s| s.id == Some(id) && s.status == InstanceStatus::Released)
        {
            return InstanceStatus::Released;
        }
        InstanceStatus::Unused
    }

    pub fn is_active(&self, id: InstanceId) -> bool {
        self.find_active(id).is_some()
    }

    pub fn value(&self, id: InstanceId) -> Option<(&Value, Time)> {
        self.find_active(id)
            .and_then(|i| self.slots[i].value.as_ref().map(|v| (v, self.slots[i].time)))
    }

    pub fn num_active(&self) -> usize {
        self.slots.iter().filter(|s| s.is_active()).count()
    }

    /// Active instance ids in activation order.
    pub fn active_ids(&self) -> Vec<InstanceId> {
        let mut active: Vec<&Slot> = self.slots.iter().filter(|s| s.is_active()).collect();
        active.sort_by_key(|s| s.activated);
        active.iter().filter_map(|s| s.id).collect()
    }

    pub fn oldest_active(&self) -> Option<InstanceId> {
        self.active_ids().first().copied()
    }

    pub fn newest_active(&self) -> Option<InstanceId> {
        self.active_ids().last().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pool(n: usize, stealing: Stealing) -> InstanceManager {
        InstanceManager::new(SignalId(7), n, stealing)
    }

    fn kinds(events: &[InstanceEvent]) -> Vec<(Event, Option<InstanceId>)> {
        events.iter().map(|e| (e.event, e.instance)).collect()
    }

    #[test]
    fn test_allocate_until_full_then_overflow() {
        let mut m = pool(2, Stealing::None);
        let mut ev = Vec::new();
        assert_eq!(m.allocate(10, Origin::Local, Time::now(), &mut ev), Allocation::Activated);
        assert_eq!(m.allocate(11, Origin::Local, Time::now(), &mut ev), Allocation::Activated);
        assert_eq!(m.allocate(10, Origin::Local, Time::now(), &mut ev), Allocation::Existing);
        assert_eq!(m.allocate(12, Origin::Local, Time::now(), &mut ev), Allocation::Refused);

        assert_eq!(kinds(&ev), vec![
            (Event::NewInstance, Some(10)),
            (Event::NewInstance, Some(11)),
            (Event::Overflow, None),
        ]);
        assert_eq!(m.num_active(), 2);
        assert!(!m.is_active(12));
    }

    #[test]
    fn test_steal_oldest() {
        let mut m = pool(3, Stealing::Oldest);
        let mut ev = Vec::new();
        for id in [5, 3, 9] {
            m.allocate(id, Origin::Upstream, Time::now(), &mut ev);
        }
        ev.clear();
        assert_eq!(m.allocate(1, Origin::Upstream, Time::now(), &mut ev), Allocation::Stole { victim: 5 });
        assert_eq!(kinds(&ev), vec![(Event::UpstreamRelease, Some(5)), (Event::NewInstance, Some(1))]);
        assert_eq!(m.active_ids(), vec![3, 9, 1]);
        assert_eq!(m.status(5), InstanceStatus::Released);
    }

    #[test]
    fn test_victim_event_follows_victim_origin() {
        let mut m = pool(1, Stealing::Oldest);
        let mut ev = Vec::new();
        m.allocate(1, Origin::Upstream, Time::now(), &mut ev);
        ev.clear();
        m.allocate(2, Origin::Local, Time::now(), &mut ev);
        assert_eq!(kinds(&ev), vec![(Event::UpstreamRelease, Some(1)), (Event::NewInstance, Some(2))]);
    }

    #[test]
    fn test_stolen_id_stays_released_until_reallocated() {
        let mut m = pool(1, Stealing::Newest);
        let mut ev = Vec::new();
        m.allocate(1, Origin::Local, Time::now(), &mut ev);
        m.allocate(2, Origin::Local, Time::now(), &mut ev);
        assert_eq!(m.status(1), InstanceStatus::Released);
        m.allocate(3, Origin::Local, Time::now(), &mut ev);
        assert_eq!(m.status(2), InstanceStatus::Released);
        // Only `capacity` stolen ids are remembered.
        assert_eq!(m.status(1), InstanceStatus::Unused);

        m.allocate(2, Origin::Local, Time::now(), &mut ev);
        assert_eq!(m.status(2), InstanceStatus::Active);
        assert_eq!(m.status(3), InstanceStatus::Released);
        assert!(!m.remove(3, Time::now(), &mut ev));
        assert_eq!(m.status(3), InstanceStatus::Unused);
    }

    #[test]
    fn test_steal_newest() {
        let mut m = pool(2, Stealing::Newest);
        let mut ev = Vec::new();
        m.allocate(1, Origin::Local, Time::now(), &mut ev);
        m.allocate(2, Origin::Local, Time::now(), &mut ev);
        ev.clear();
        assert_eq!(m.allocate(3, Origin::Local, Time::now(), &mut ev), Allocation::Stole { victim: 2 });
        assert_eq!(ev[0].event, Event::DownstreamRelease);
        assert_eq!(m.oldest_active(), Some(1));
        assert_eq!(m.newest_active(), Some(3));
    }

    #[test]
    fn test_update_requires_active() {
        let mut m = pool(1, Stealing::None);
        let mut ev = Vec::new();
        assert!(matches!(
            m.update(4, Value::from(1.0f32), Time::now(), &mut ev),
            Err(Error::InvalidInstance { instance: 4, .. })
        ));
        m.allocate(4, Origin::Local, Time::now(), &mut ev);
        m.update(4, Value::from(1.0f32), Time::now(), &mut ev).unwrap();
        assert_eq!(m.value(4).map(|(v, _)| v.clone()), Some(Value::from(1.0f32)));
    }

    #[test]
    fn test_release_frees_slot_without_rebinding() {
        let mut m = pool(1, Stealing::None);
        let mut ev = Vec::new();
        m.allocate(4, Origin::Local, Time::now(), &mut ev);
        m.release(4, Origin::Upstream, Time::now(), &mut ev).unwrap();
        assert_eq!(m.status(4), InstanceStatus::Released);
        assert!(m.update(4, Value::from(1.0f32), Time::now(), &mut ev).is_err());
        assert!(m.release(4, Origin::Local, Time::now(), &mut ev).is_err());

        assert_eq!(m.allocate(8, Origin::Local, Time::now(), &mut ev), Allocation::Activated);
    }

    #[test]
    fn test_reserve_is_capped() {
        let mut m = pool(1, Stealing::None);
        assert_eq!(m.reserve(10, 4), 4);
        assert_eq!(m.capacity(), 4);
    }

    #[test]
    fn test_remove_forgets_id() {
        let mut m = pool(1, Stealing::None);
        let mut ev = Vec::new();
        m.allocate(4, Origin::Local, Time::now(), &mut ev);
        ev.clear();
        assert!(m.remove(4, Time::now(), &mut ev));
        assert_eq!(m.status(4), InstanceStatus::Unused);
        assert_eq!(kinds(&ev), vec![(Event::DownstreamRelease, Some(4))]);
    }
}
