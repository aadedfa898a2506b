//! Neurons
//!
//! Stationary units. Every variant shares [`NeuronCore`] through the
//! [`NeuronCommon`] trait; behaviour specific to a variant is reached by
//! matching on [`Neuron`].

use std::time::{Duration, Instant};

use serde::{Serialize, Deserialize};

use crate::core::Position;
use crate::game::costs::{
    swarm_cap, UnitKind, ACTIVATOR_RECHARGE_MS, ACTIVATOR_SLOWDOWN, DEF_SPEED_STEP_MS,
    NEURON_MAX_VOLTAGE, NUCLEUS_MAX_VOLTAGE,
};
use crate::game::resource::ResourceKind;

/// Fields every neuron has.
#[derive(Clone, Debug)]
pub struct NeuronCore {
    /// Cell
    pub pos: Position,
    /// Damage taken
    pub voltage: i32,
    /// Destroyed when `voltage >= max_voltage`
    pub max_voltage: i32,
    /// Blocked by an enemy IPSP
    pub blocked: bool,
    /// Last time this neuron acted
    pub last_action: Instant,
}

impl NeuronCore {
    fn new(pos: Position, max_voltage: i32, now: Instant) -> Self {
        Self {
            pos,
            voltage: 0,
            max_voltage,
            blocked: false,
            last_action: now,
        }
    }
}

/// Shared accessors.
pub trait NeuronCommon {
    /// Shared fields.
    fn core(&self) -> &NeuronCore;
    /// Shared fields, mutable.
    fn core_mut(&mut self) -> &mut NeuronCore;
    /// Kind tag.
    fn kind(&self) -> UnitKind;

    /// Cell.
    fn pos(&self) -> Position {
        self.core().pos
    }

    /// Damage taken.
    fn voltage(&self) -> i32 {
        self.core().voltage
    }

    /// Destroy threshold.
    fn max_voltage(&self) -> i32 {
        self.core().max_voltage
    }

    /// Blocked by an IPSP?
    fn blocked(&self) -> bool {
        self.core().blocked
    }

    /// Block or unblock; idempotent.
    fn set_blocked(&mut self, blocked: bool) {
        self.core_mut().blocked = blocked;
    }

    /// Add damage. Returns true when the neuron is destroyed.
    fn increase_voltage(&mut self, amount: i32) -> bool {
        let core = self.core_mut();
        core.voltage += amount;
        core.voltage >= core.max_voltage
    }
}

// =============================================================================
// VARIANTS
// =============================================================================

/// Root neuron.
#[derive(Clone, Debug)]
pub struct Nucleus {
    core: NeuronCore,
}

/// Defensive neuron.
#[derive(Clone, Debug)]
pub struct ActivatedNeuron {
    core: NeuronCore,
    /// Amount subtracted from an enemy potential per shot
    pub slowdown: i32,
    /// Time between shots
    pub recharge: Duration,
}

impl ActivatedNeuron {
    /// Ready to fire at `now` (scaled by `time_scale`).
    pub fn ready(&self, now: Instant, time_scale: f64) -> bool {
        !self.core.blocked && elapsed_over(self.core.last_action, now, self.recharge, time_scale)
    }
}

/// Potential launcher.
#[derive(Clone, Debug)]
pub struct Synapse {
    core: NeuronCore,
    /// Swarm mode on
    pub swarm: bool,
    /// EPSPs stored while swarming
    pub stored: usize,
    /// Stored EPSPs released at once
    pub max_stored: usize,
    /// Intermediate anchors, in insertion order
    pub way_points: Vec<Position>,
    /// Where EPSPs go
    pub epsp_target: Option<Position>,
    /// Where IPSPs go
    pub ipsp_target: Option<Position>,
    /// Way-points allowed (WAY level)
    pub available_ways: usize,
}

impl Synapse {
    /// Count one EPSP launch and return how many EPSPs leave now.
    pub fn add_epsp(&mut self) -> usize {
        if !self.swarm {
            return 1;
        }
        self.stored += 1;
        if self.stored >= self.max_stored {
            let released = self.stored;
            self.stored = 0;
            released
        } else {
            0
        }
    }

    /// Target for a potential kind.
    pub fn target(&self, kind: UnitKind) -> Option<Position> {
        match kind {
            UnitKind::Ipsp => self.ipsp_target,
            _ => self.epsp_target,
        }
    }

    /// Way-points followed by the target for `kind`.
    pub fn way_points_for(&self, kind: UnitKind) -> Option<Vec<Position>> {
        let target = self.target(kind)?;
        let mut points = self.way_points.clone();
        points.push(target);
        Some(points)
    }

    /// Set the IPSP target unless one is set.
    pub fn update_ipsp_target_if_unset(&mut self, target: Option<Position>) {
        if self.ipsp_target.is_none() {
            self.ipsp_target = target;
        }
    }
}

/// Passive collector on an activated resource's cell.
#[derive(Clone, Debug)]
pub struct ResourceNeuron {
    core: NeuronCore,
    /// Resource it produces
    pub resource: ResourceKind,
}

// =============================================================================
// NEURON
// =============================================================================

/// A neuron of any kind.
#[derive(Clone, Debug)]
pub enum Neuron {
    /// Root neuron
    Nucleus(Nucleus),
    /// Defensive neuron
    Activated(ActivatedNeuron),
    /// Launcher
    Synapse(Synapse),
    /// Resource collector
    Resource(ResourceNeuron),
}

impl Neuron {
    /// New nucleus.
    pub fn nucleus(pos: Position, now: Instant) -> Self {
        Neuron::Nucleus(Nucleus { core: NeuronCore::new(pos, NUCLEUS_MAX_VOLTAGE, now) })
    }

    /// New activated neuron with DEF_POTENTIAL / DEF_SPEED levels applied.
    pub fn activated(pos: Position, def_potential: u8, def_speed: u8, now: Instant) -> Self {
        let recharge = ACTIVATOR_RECHARGE_MS.saturating_sub(DEF_SPEED_STEP_MS * def_speed as u64);
        Neuron::Activated(ActivatedNeuron {
            core: NeuronCore::new(pos, NEURON_MAX_VOLTAGE, now),
            slowdown: ACTIVATOR_SLOWDOWN + def_potential as i32,
            recharge: Duration::from_millis(recharge),
        })
    }

    /// New synapse with SWARM / WAY levels applied.
    pub fn synapse(
        pos: Position,
        swarm_level: u8,
        way_level: u8,
        epsp_target: Option<Position>,
        ipsp_target: Option<Position>,
        now: Instant,
    ) -> Self {
        Neuron::Synapse(Synapse {
            core: NeuronCore::new(pos, NEURON_MAX_VOLTAGE, now),
            swarm: false,
            stored: 0,
            max_stored: swarm_cap(swarm_level),
            way_points: Vec::new(),
            epsp_target,
            ipsp_target,
            available_ways: way_level as usize,
        })
    }

    /// New resource neuron.
    pub fn resource(pos: Position, resource: ResourceKind, now: Instant) -> Self {
        Neuron::Resource(ResourceNeuron {
            core: NeuronCore::new(pos, NEURON_MAX_VOLTAGE, now),
            resource,
        })
    }

    /// Synapse data if this is one.
    pub fn as_synapse(&self) -> Option<&Synapse> {
        match self {
            Neuron::Synapse(s) => Some(s),
            _ => None,
        }
    }

    /// Mutable synapse data if this is one.
    pub fn as_synapse_mut(&mut self) -> Option<&mut Synapse> {
        match self {
            Neuron::Synapse(s) => Some(s),
            _ => None,
        }
    }

    /// Activator data if this is one.
    pub fn as_activated(&self) -> Option<&ActivatedNeuron> {
        match self {
            Neuron::Activated(a) => Some(a),
            _ => None,
        }
    }

    /// Resource produced, for resource neurons.
    pub fn resource_kind(&self) -> Option<ResourceKind> {
        match self {
            Neuron::Resource(r) => Some(r.resource),
            _ => None,
        }
    }
}

impl NeuronCommon for Neuron {
    fn core(&self) -> &NeuronCore {
        match self {
            Neuron::Nucleus(n) => &n.core,
            Neuron::Activated(n) => &n.core,
            Neuron::Synapse(n) => &n.core,
            Neuron::Resource(n) => &n.core,
        }
    }

    fn core_mut(&mut self) -> &mut NeuronCore {
        match self {
            Neuron::Nucleus(n) => &mut n.core,
            Neuron::Activated(n) => &mut n.core,
            Neuron::Synapse(n) => &mut n.core,
            Neuron::Resource(n) => &mut n.core,
        }
    }

    fn kind(&self) -> UnitKind {
        match self {
            Neuron::Nucleus(_) => UnitKind::Nucleus,
            Neuron::Activated(_) => UnitKind::ActivatedNeuron,
            Neuron::Synapse(_) => UnitKind::Synapse,
            Neuron::Resource(_) => UnitKind::ResourceNeuron,
        }
    }
}

/// Position and kind of a neuron, as sent to views.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NeuronInfo {
    /// Cell
    pub pos: Position,
    /// Kind
    pub unit: UnitKind,
}

impl From<&Neuron> for NeuronInfo {
    fn from(n: &Neuron) -> Self {
        Self { pos: n.pos(), unit: n.kind() }
    }
}

/// `now - since > period / time_scale`
pub(crate) fn elapsed_over(since: Instant, now: Instant, period: Duration, time_scale: f64) -> bool {
    let scale = if time_scale > 0.0 { time_scale } else { 1.0 };
    now.saturating_duration_since(since) > period.div_f64(scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voltage_destroys_at_max() {
        let now = Instant::now();
        let mut n = Neuron::nucleus(Position::new(1, 1), now);
        assert!(!n.increase_voltage(16));
        assert!(n.increase_voltage(1));
        assert_eq!(n.kind(), UnitKind::Nucleus);
    }

    #[test]
    fn test_swarm_release() {
        let now = Instant::now();
        let mut n = Neuron::synapse(Position::new(0, 0), 1, 0, None, None, now);
        let s = n.as_synapse_mut().unwrap();
        assert_eq!(s.add_epsp(), 1);
        s.swarm = true;
        assert_eq!(s.max_stored, 4);
        assert_eq!(s.add_epsp(), 0);
        assert_eq!(s.add_epsp(), 0);
        assert_eq!(s.add_epsp(), 0);
        assert_eq!(s.add_epsp(), 4);
        assert_eq!(s.stored, 0);
    }

    #[test]
    fn test_block_idempotent() {
        let mut n = Neuron::resource(Position::new(2, 2), ResourceKind::Potassium, Instant::now());
        n.set_blocked(true);
        n.set_blocked(true);
        assert!(n.blocked());
        n.set_blocked(false);
        n.set_blocked(false);
        assert!(!n.blocked());
    }

    #[test]
    fn test_activator_recharge() {
        let t0 = Instant::now();
        let n = Neuron::activated(Position::new(0, 0), 1, 2, t0);
        let a = n.as_activated().unwrap();
        assert_eq!(a.slowdown, 2);
        assert_eq!(a.recharge, Duration::from_millis(620));
        assert!(!a.ready(t0 + Duration::from_millis(600), 1.0));
        assert!(a.ready(t0 + Duration::from_millis(621), 1.0));
        assert!(a.ready(t0 + Duration::from_millis(320), 2.0));
    }

    #[test]
    fn test_way_points_for_target() {
        let mut n = Neuron::synapse(Position::new(0, 0), 0, 1, Some(Position::new(9, 9)), None, Instant::now());
        let s = n.as_synapse_mut().unwrap();
        s.way_points.push(Position::new(3, 3));
        assert_eq!(
            s.way_points_for(UnitKind::Epsp),
            Some(vec![Position::new(3, 3), Position::new(9, 9)])
        );
        assert_eq!(s.way_points_for(UnitKind::Ipsp), None);
        s.update_ipsp_target_if_unset(Some(Position::new(5, 5)));
        s.update_ipsp_target_if_unset(Some(Position::new(6, 6)));
        assert_eq!(s.ipsp_target, Some(Position::new(5, 5)));
    }
}
