//! MapNegotiator — drives a map from `Staged` to `Ready`.
//!
//! ```text
//!            push / proposal            all endpoint devices Accept
//!  (request) ───────────────▶ Staged ─────────────────────────────▶ Ready ──first write───▶ Active
//!                               │  ▲                                   │                     │
//!                     Conflict  │  │ re-proposed every retry_interval  │                     │
//!                     recorded  ▼  │ while acks are missing            ▼                     ▼
//!                          diagnostics                         endpoint device gone ──▶ Expired
//! ```
//!
//! Every device that owns an endpoint signal judges the proposal against
//! its own view of the endpoints (type and length compatibility, expression
//! validity) and broadcasts a verdict. Every device, participant or not,
//! collects verdicts; a map becomes `Ready` once each participant accepted.
//!
//! Map identity is derived from (sorted sources, destination, expression),
//! so two devices staging the same route independently end up with one map.
//!
//! The negotiator never touches the transport. Its operations append the
//! negotiation messages to send to an `out` buffer and report transitions
//! for the device engine to act on.

use hashbrown::HashMap;

use crate::expr::{self, Slot, MAX_SIGNALS};
use crate::graph::Graph;
use crate::model::{map_id, DeviceId, MapId, MapRecord, Object, Prop, SignalId, Status, Time, Value};
use crate::net::{Negotiation, Proposal, Verdict};
use crate::{Error, Result};

// ============================================================================
// MapSpec
// ============================================================================

/// A validated map request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapSpec {
    sources: Vec<SignalId>,
    destination: SignalId,
    /// Internal form, `y = ...` over `x$<n>`.
    expression: Option<String>,
}

impl MapSpec {
    /// A direct map: identity transfer from each source to the destination.
    pub fn new(sources: &[SignalId], destinations: &[SignalId]) -> Result<Self> {
        let [destination] = destinations else {
            return Err(Error::InvalidMapSpec(format!(
                "a map needs exactly one destination, got {}", destinations.len()
            )));
        };
        Self::build(sources.to_vec(), *destination, None)
    }

    /// A map built from an expression with `%x` / `%y` placeholders, bound
    /// left to right against `signals`.
    ///
    /// ```
    /// use mapper::{MapSpec, SignalId};
    /// let (dst, src) = (SignalId(0x2_0000_0001), SignalId(0x1_0000_0001));
    /// let spec = MapSpec::from_expression("%y=%x*1000", &[dst, src]).unwrap();
    /// assert_eq!(spec.expression(), Some("y=x$0*1000"));
    /// assert_eq!(spec.sources(), &[src]);
    /// ```
    pub fn from_expression(text: &str, signals: &[SignalId]) -> Result<Self> {
        if signals.len() > MAX_SIGNALS {
            return Err(Error::InvalidMapSpec(format!(
                "an expression may reference at most {MAX_SIGNALS} signals, got {}", signals.len()
            )));
        }
        let (internal, slots) = expr::substitute(text);
        if slots.len() != signals.len() {
            return Err(Error::InvalidMapSpec(format!(
                "expression has {} placeholders but {} signals were given", slots.len(), signals.len()
            )));
        }
        let mut sources = Vec::new();
        let mut destination: Option<SignalId> = None;
        for (slot, sig) in slots.iter().zip(signals) {
            match slot {
                Slot::Source(_) => sources.push(*sig),
                Slot::Destination => match destination {
                    Some(d) if d != *sig => {
                        return Err(Error::InvalidMapSpec("a map needs exactly one destination, got 2".into()));
                    }
                    _ => destination = Some(*sig),
                },
            }
        }
        let destination = destination
            .ok_or_else(|| Error::InvalidMapSpec("a map needs exactly one destination, got 0".into()))?;
        Self::build(sources, destination, Some(internal))
    }

    fn build(sources: Vec<SignalId>, destination: SignalId, expression: Option<String>) -> Result<Self> {
        if sources.is_empty() {
            return Err(Error::InvalidMapSpec("a map needs at least one source".into()));
        }
        if sources.len() + 1 > MAX_SIGNALS {
            return Err(Error::InvalidMapSpec(format!("a map may connect at most {MAX_SIGNALS} signals")));
        }
        if sources.contains(&destination) {
            return Err(Error::InvalidMapSpec(format!("signal {destination} is both source and destination")));
        }
        for (i, s) in sources.iter().enumerate() {
            if sources[..i].contains(s) {
                return Err(Error::InvalidMapSpec(format!("signal {s} appears twice as a source")));
            }
        }
        if let Some(text) = &expression {
            expr::compile(text, sources.len()).map_err(|e| Error::InvalidMapSpec(e.to_string()))?;
        }
        Ok(Self { sources, destination, expression })
    }

    pub fn sources(&self) -> &[SignalId] {
        &self.sources
    }

    pub fn destination(&self) -> SignalId {
        self.destination
    }

    pub fn expression(&self) -> Option<&str> {
        self.expression.as_deref()
    }

    pub fn id(&self) -> MapId {
        map_id(&self.sources, self.destination, self.expression())
    }
}

// ============================================================================
// MapNegotiator
// ============================================================================

/// A state change the device engine must act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Every participant accepted.
    Ready(MapId),
    /// A participant rejected; the reason is in the map's diagnostics.
    Conflict(MapId),
}

#[derive(Debug, Default)]
struct Pending {
    acks: HashMap<DeviceId, Verdict>,
    /// When this device last proposed the map, if it ever did.
    proposed_at: Option<Time>,
}

#[derive(Debug)]
pub struct MapNegotiator {
    device: DeviceId,
    pending: HashMap<MapId, Pending>,
}

impl MapNegotiator {
    pub fn new(device: DeviceId) -> Self {
        Self { device, pending: HashMap::new() }
    }

    pub fn is_pending(&self, map: MapId) -> bool {
        self.pending.contains_key(&map)
    }

    /// Whether this device already sent a proposal for `map`.
    pub fn was_proposed(&self, map: MapId) -> bool {
        self.pending.get(&map).is_some_and(|p| p.proposed_at.is_some())
    }

    pub fn forget(&mut self, map: MapId) {
        self.pending.remove(&map);
    }

    fn owns_endpoint(&self, sources: &[SignalId], destination: SignalId) -> bool {
        sources.iter().chain(std::iter::once(&destination)).any(|s| s.device() == self.device)
    }

    /// Create the local `Staged` record for a request. A request matching a
    /// live map collapses into it.
    pub fn stage(&mut self, graph: &mut Graph, spec: &MapSpec) -> Result<MapId> {
        let id = spec.id();
        if let Ok(existing) = graph.map(id) {
            if existing.status() != Status::Expired {
                tracing::debug!(map = %id, "map request collapsed into existing map");
                return Ok(id);
            }
            graph.remove_map(id);
        }
        let mut use_instances = true;
        for sig in spec.sources().iter().chain(std::iter::once(&spec.destination())) {
            use_instances &= graph.signal(*sig)?.is_instanced();
        }
        let local = self.owns_endpoint(spec.sources(), spec.destination());
        let mut record = MapRecord::new(
            spec.sources().to_vec(),
            spec.destination(),
            spec.expression(),
            local,
            graph.id(),
        );
        record.set_use_instances(use_instances);
        graph.insert_map(record);
        self.pending.insert(id, Pending::default());
        tracing::debug!(map = %id, use_instances, "map staged");
        Ok(id)
    }

    /// Judge a map against this device's view of its endpoints. `None` when
    /// an endpoint is not known yet.
    pub fn check(graph: &Graph, map: &MapRecord) -> Option<Verdict> {
        let dst = graph.signal(map.destination()).ok()?;
        let mut sources = Vec::with_capacity(map.sources().len());
        for s in map.sources() {
            sources.push(graph.signal(*s).ok()?);
        }
        if let Some(text) = map.expression() {
            for sig in sources.iter().chain(std::iter::once(&dst)) {
                if !sig.value_type().is_numeric() {
                    return Some(Verdict::Conflict(format!(
                        "expression maps need numeric signals; '{}' is {}", sig.name(), sig.value_type()
                    )));
                }
            }
            if let Err(e) = expr::compile(text, sources.len()) {
                return Some(Verdict::Conflict(e.to_string()));
            }
            return Some(Verdict::Accept);
        }
        for src in &sources {
            if src.length() != dst.length() {
                return Some(Verdict::Conflict(format!(
                    "length mismatch: source '{}' has {}, destination '{}' has {}",
                    src.name(), src.length(), dst.name(), dst.length()
                )));
            }
            let (a, b) = (src.value_type(), dst.value_type());
            if a != b && !(a.is_numeric() && b.is_numeric()) {
                return Some(Verdict::Conflict(format!(
                    "type mismatch: source '{}' is {a}, destination '{}' is {b}", src.name(), dst.name()
                )));
            }
        }
        Some(Verdict::Accept)
    }

    fn own_verdict(&mut self, graph: &Graph, map: MapId, out: &mut Vec<Negotiation>) {
        let Ok(record) = graph.map(map) else { return };
        if !record.participants().contains(&self.device) {
            return;
        }
        if let Some(verdict) = Self::check(graph, record) {
            self.pending.entry(map).or_default().acks.insert(self.device, verdict.clone());
            out.push(Negotiation::Ack { map, from: self.device, verdict });
        }
    }

    /// Send (or re-send) the proposal for a staged map, with this device's
    /// own verdict if it is a participant.
    pub fn propose(&mut self, graph: &mut Graph, map: MapId, now: Time, out: &mut Vec<Negotiation>) -> Result<Option<Transition>> {
        let record = graph.map(map)?;
        if record.status() == Status::Expired {
            return Err(Error::StaleObject(format!("map {map} has expired")));
        }
        out.push(Negotiation::Propose(Proposal {
            map,
            sources: record.sources().to_vec(),
            destination: record.destination(),
            props: record.proposal_props(),
        }));
        tracing::debug!(map = %map, "map proposed");
        self.pending.entry(map).or_default().proposed_at = Some(now);
        self.own_verdict(graph, map, out);
        Ok(self.settle(graph, map))
    }

    /// Handle a proposal from a peer.
    pub fn on_proposal(&mut self, graph: &mut Graph, proposal: &Proposal, out: &mut Vec<Negotiation>) -> Result<Option<Transition>> {
        let expression = proposal.props.iter()
            .find(|p| p.key == Prop::Expression.into())
            .and_then(|p| p.value.as_str())
            .map(str::to_owned);
        let id = map_id(&proposal.sources, proposal.destination, expression.as_deref());
        if id != proposal.map {
            return Err(Error::Transport(format!("proposal for {} does not match its endpoints", proposal.map)));
        }

        let known = graph.map(id).ok().map(|m| m.status());
        match known {
            Some(Status::Expired) => {
                graph.remove_map(id);
            }
            Some(status) if status.is_ready() => {
                self.own_verdict(graph, id, out);
                return Ok(None);
            }
            _ => {}
        }
        if !graph.contains(id.into()) {
            let local = self.owns_endpoint(&proposal.sources, proposal.destination);
            let mut record = MapRecord::new(
                proposal.sources.clone(),
                proposal.destination,
                expression.as_deref(),
                local,
                graph.id(),
            );
            record.header_mut().props.apply_remote(&proposal.props);
            graph.insert_map(record);
            tracing::debug!(map = %id, local, "map staged by peer");
        }
        self.pending.entry(id).or_default();
        self.own_verdict(graph, id, out);
        Ok(self.settle(graph, id))
    }

    /// Handle a verdict from an endpoint device. Verdicts for maps this
    /// device does not hold, or that are no longer staged, are ignored.
    pub fn on_ack(&mut self, graph: &mut Graph, map: MapId, from: DeviceId, verdict: Verdict) -> Option<Transition> {
        if !graph.map(map).is_ok_and(|m| m.status() == Status::Staged) {
            return None;
        }
        self.pending.entry(map).or_default().acks.insert(from, verdict);
        self.settle(graph, map)
    }

    fn settle(&mut self, graph: &mut Graph, map: MapId) -> Option<Transition> {
        let record = graph.map_mut(map).ok()?;
        if record.status() != Status::Staged {
            return None;
        }
        let pending = self.pending.get(&map)?;
        let participants = record.participants();

        let conflicts: Vec<&str> = participants.iter()
            .filter_map(|d| match pending.acks.get(d) {
                Some(Verdict::Conflict(reason)) => Some(reason.as_str()),
                _ => None,
            })
            .collect();
        if !conflicts.is_empty() {
            let text = conflicts.join("; ");
            // A conflicted map is never retried; the diagnostics carry the state.
            self.pending.remove(&map);
            if record.set_diagnostics(Some(&text)) {
                tracing::warn!(map = %map, reason = %text, "map negotiation conflict");
                return Some(Transition::Conflict(map));
            }
            return None;
        }
        if participants.iter().all(|d| pending.acks.get(d) == Some(&Verdict::Accept)) {
            record.set_diagnostics(None);
            record.header_mut().set_status(Status::Ready);
            self.pending.remove(&map);
            tracing::debug!(map = %map, "map ready");
            return Some(Transition::Ready(map));
        }
        None
    }

    /// Re-propose maps this device proposed whose acknowledgements are still
    /// missing after `interval` seconds.
    pub fn retry(&mut self, graph: &mut Graph, now: Time, interval: f64, out: &mut Vec<Negotiation>) -> Vec<Transition> {
        let mut due: Vec<MapId> = self.pending.iter()
            .filter(|(_, p)| p.proposed_at.is_some_and(|t| now.since(t) >= interval))
            .map(|(id, _)| *id)
            .collect();
        due.sort_unstable();

        let mut transitions = Vec::new();
        for id in due {
            if !graph.map(id).is_ok_and(|m| m.status() == Status::Staged) {
                self.pending.remove(&id);
                continue;
            }
            tracing::debug!(map = %id, "re-proposing map");
            match self.propose(graph, id, now, out) {
                Ok(Some(t)) => transitions.push(t),
                Ok(None) => {}
                Err(e) => tracing::warn!(map = %id, error = %e, "re-proposal failed"),
            }
        }
        transitions
    }

    /// Apply property changes on an agreed map. Returns whether the
    /// expression changed.
    pub fn on_modify(graph: &mut Graph, map: MapId, props: &[crate::model::Property]) -> Result<bool> {
        let record = graph.map_mut(map)?;
        let before: Option<Value> = record.props().value(Prop::Expression).cloned();
        let changed = record.header_mut().props.apply_remote(props);
        let after = record.props().value(Prop::Expression).cloned();
        Ok(changed > 0 && before != after)
    }
}
