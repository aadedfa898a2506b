//! Potentials
//!
//! Projectiles launched by synapses. An EPSP deals its potential as damage
//! on arrival; an IPSP blocks its target for a duration.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};

use crate::core::Position;
use crate::game::costs::{PotentialParams, UnitKind};
use crate::game::neuron::elapsed_over;

/// EPSP or IPSP.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PotentialKind {
    /// Offensive
    Epsp,
    /// Blocking
    Ipsp,
}

impl PotentialKind {
    /// Unit kind used for costs.
    pub fn unit(self) -> UnitKind {
        match self {
            PotentialKind::Epsp => UnitKind::Epsp,
            PotentialKind::Ipsp => UnitKind::Ipsp,
        }
    }

    /// From a unit kind.
    pub fn from_unit(unit: UnitKind) -> Option<Self> {
        match unit {
            UnitKind::Epsp => Some(PotentialKind::Epsp),
            UnitKind::Ipsp => Some(PotentialKind::Ipsp),
            _ => None,
        }
    }
}

/// Potential id: per-player sequence plus kind.
///
/// Ordered by sequence, so a map keyed by id iterates in launch order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PotentialId {
    /// Launch sequence number
    pub seq: u64,
    /// Kind
    pub kind: PotentialKind,
}

impl fmt::Display for PotentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.kind {
            PotentialKind::Epsp => "epsp",
            PotentialKind::Ipsp => "ipsp",
        };
        write!(f, "{prefix}-{}", self.seq)
    }
}

impl Serialize for PotentialId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A potential in flight.
#[derive(Clone, Debug)]
pub struct Potential {
    /// Id
    pub id: PotentialId,
    /// Current cell
    pub pos: Position,
    /// Remaining cells to the target
    pub way: Vec<Position>,
    /// Damage (EPSP) or strength (IPSP)
    pub potential: i32,
    /// Time per step
    pub speed: Duration,
    /// Last move
    pub last_action: Instant,
    /// Block duration (IPSP)
    pub duration: Duration,
    /// When an IPSP reached its target
    pub arrived_at: Option<Instant>,
}

/// What happened to a potential during one move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PotentialStep {
    /// Still travelling or waiting
    Idle,
    /// Moved one cell
    Moved,
    /// EPSP reached its target
    Hit {
        /// Target cell
        pos: Position,
        /// Damage
        amount: i32,
    },
    /// IPSP is at its target and blocks it
    Block(Position),
    /// IPSP duration is over
    Release(Position),
}

impl Potential {
    /// New potential at `start`; `way` excludes `start`.
    pub fn new(id: PotentialId, start: Position, way: Vec<Position>, params: PotentialParams, now: Instant) -> Self {
        Self {
            id,
            pos: start,
            way,
            potential: params.potential,
            speed: Duration::from_millis(params.speed_ms),
            last_action: now,
            duration: Duration::from_secs(params.duration_s),
            arrived_at: None,
        }
    }

    /// Kind of this potential.
    pub fn kind(&self) -> PotentialKind {
        self.id.kind
    }

    /// Remaining path is empty.
    pub fn arrived(&self) -> bool {
        self.way.is_empty()
    }

    /// Advance one step if due, and report arrival effects.
    pub fn step(&mut self, now: Instant, time_scale: f64) -> PotentialStep {
        let mut moved = false;
        if !self.way.is_empty() && elapsed_over(self.last_action, now, self.speed, time_scale) {
            self.pos = self.way.remove(0);
            self.last_action = now;
            moved = true;
        }
        if !self.way.is_empty() {
            return if moved { PotentialStep::Moved } else { PotentialStep::Idle };
        }
        match self.kind() {
            PotentialKind::Epsp => PotentialStep::Hit { pos: self.pos, amount: self.potential },
            PotentialKind::Ipsp => {
                let arrived_at = *self.arrived_at.get_or_insert(now);
                if elapsed_over(arrived_at, now, self.duration, time_scale) {
                    PotentialStep::Release(self.pos)
                } else {
                    PotentialStep::Block(self.pos)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epsp(way: Vec<Position>, now: Instant) -> Potential {
        let id = PotentialId { seq: 1, kind: PotentialKind::Epsp };
        Potential::new(id, Position::new(0, 0), way, PotentialParams::epsp(0, 0), now)
    }

    #[test]
    fn test_id_display_and_order() {
        let a = PotentialId { seq: 2, kind: PotentialKind::Ipsp };
        let b = PotentialId { seq: 10, kind: PotentialKind::Epsp };
        assert_eq!(a.to_string(), "ipsp-2");
        assert!(a < b);
        assert_eq!(serde_json::to_string(&b).unwrap(), "\"epsp-10\"");
    }

    #[test]
    fn test_epsp_walks_then_hits() {
        let t0 = Instant::now();
        let mut p = epsp(vec![Position::new(0, 1), Position::new(0, 2)], t0);
        assert_eq!(p.step(t0 + Duration::from_millis(100), 1.0), PotentialStep::Idle);
        assert_eq!(p.step(t0 + Duration::from_millis(371), 1.0), PotentialStep::Moved);
        assert_eq!(p.pos, Position::new(0, 1));
        let t2 = t0 + Duration::from_millis(742);
        assert_eq!(p.step(t2, 1.0), PotentialStep::Hit { pos: Position::new(0, 2), amount: 2 });
    }

    #[test]
    fn test_time_scale_speeds_up() {
        let t0 = Instant::now();
        let mut p = epsp(vec![Position::new(0, 1), Position::new(0, 2)], t0);
        assert_eq!(p.step(t0 + Duration::from_millis(200), 2.0), PotentialStep::Moved);
    }

    #[test]
    fn test_ipsp_blocks_then_releases() {
        let t0 = Instant::now();
        let id = PotentialId { seq: 3, kind: PotentialKind::Ipsp };
        let mut p = Potential::new(id, Position::new(0, 0), vec![Position::new(0, 1)], PotentialParams::ipsp(0, 0, 0), t0);
        let t1 = t0 + Duration::from_millis(421);
        assert_eq!(p.step(t1, 1.0), PotentialStep::Block(Position::new(0, 1)));
        assert_eq!(p.arrived_at, Some(t1));
        assert_eq!(p.step(t1 + Duration::from_secs(2), 1.0), PotentialStep::Block(Position::new(0, 1)));
        assert_eq!(
            p.step(t1 + Duration::from_millis(3001), 1.0),
            PotentialStep::Release(Position::new(0, 1))
        );
    }
}
