//! Costs & Unit Tables
//!
//! Static catalog of what every unit and technology costs, and the
//! parameters units are created with.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Serialize, Deserialize};

use crate::game::resource::ResourceKind;
use crate::game::technology::TechKind;

/// Resource amounts keyed by kind.
pub type Costs = BTreeMap<ResourceKind, f64>;

// =============================================================================
// UNIT KINDS
// =============================================================================

/// Everything a player can build or launch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// Root neuron
    Nucleus,
    /// Defensive neuron
    ActivatedNeuron,
    /// Potential launcher
    Synapse,
    /// Passive collector on a resource cell
    ResourceNeuron,
    /// Offensive potential
    Epsp,
    /// Blocking potential
    Ipsp,
}

impl UnitKind {
    /// Neuron kinds a player may place by hand.
    pub const BUILDABLE: [UnitKind; 3] = [
        UnitKind::ActivatedNeuron,
        UnitKind::Synapse,
        UnitKind::Nucleus,
    ];

    /// Whether this is a neuron (not a potential).
    pub fn is_neuron(self) -> bool {
        !matches!(self, UnitKind::Epsp | UnitKind::Ipsp)
    }

    /// Field symbol written when a neuron of this kind is placed.
    ///
    /// Resource neurons keep their resource symbol, potentials are overlays.
    pub fn field_symbol(self) -> Option<char> {
        match self {
            UnitKind::Nucleus => Some(SYMBOL_NUCLEUS),
            UnitKind::ActivatedNeuron => Some(SYMBOL_ACTIVATOR),
            UnitKind::Synapse => Some(SYMBOL_SYNAPSE),
            _ => None,
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitKind::Nucleus => "nucleus",
            UnitKind::ActivatedNeuron => "activated neuron",
            UnitKind::Synapse => "synapse",
            UnitKind::ResourceNeuron => "resource neuron",
            UnitKind::Epsp => "epsp",
            UnitKind::Ipsp => "ipsp",
        };
        f.write_str(name)
    }
}

// =============================================================================
// FIELD SYMBOLS
// =============================================================================

/// Free cell
pub const SYMBOL_FREE: char = '.';
/// Impassable cell
pub const SYMBOL_HILL: char = '^';
/// Nucleus
pub const SYMBOL_NUCLEUS: char = 'D';
/// Activated neuron
pub const SYMBOL_ACTIVATOR: char = 'T';
/// Synapse
pub const SYMBOL_SYNAPSE: char = 'S';

// =============================================================================
// COST CATALOG
// =============================================================================

use ResourceKind::*;

const ACTIVATED_NEURON_COSTS: &[(ResourceKind, f64)] = &[(Oxygen, 8.9), (Glutamate, 19.1)];
const SYNAPSE_COSTS: &[(ResourceKind, f64)] = &[(Oxygen, 13.4), (Potassium, 6.6)];
const NUCLEUS_COSTS: &[(ResourceKind, f64)] = &[
    (Oxygen, 25.0),
    (Potassium, 15.0),
    (Chloride, 15.0),
    (Glutamate, 25.0),
    (Dopamine, 10.0),
    (Serotonin, 10.0),
];
const EPSP_COSTS: &[(ResourceKind, f64)] = &[(Potassium, 4.4)];
const IPSP_COSTS: &[(ResourceKind, f64)] = &[(Potassium, 3.4), (Chloride, 6.8)];

/// Base cost of one unit.
pub fn unit_cost_table(kind: UnitKind) -> &'static [(ResourceKind, f64)] {
    match kind {
        UnitKind::Nucleus => NUCLEUS_COSTS,
        UnitKind::ActivatedNeuron => ACTIVATED_NEURON_COSTS,
        UnitKind::Synapse => SYNAPSE_COSTS,
        UnitKind::ResourceNeuron => &[],
        UnitKind::Epsp => EPSP_COSTS,
        UnitKind::Ipsp => IPSP_COSTS,
    }
}

/// Base cost of one technology level; multiplied by the level being bought.
pub fn tech_cost_table(kind: TechKind) -> &'static [(ResourceKind, f64)] {
    match kind {
        TechKind::Way => &[(Dopamine, 7.7)],
        TechKind::Swarm => &[(Dopamine, 9.9)],
        TechKind::Target => &[(Dopamine, 6.5)],
        TechKind::TotalOxygen => &[(Dopamine, 7.5), (Serotonin, 8.9)],
        TechKind::TotalResource => &[(Dopamine, 8.5), (Serotonin, 7.9)],
        TechKind::Curve => &[(Dopamine, 11.0), (Serotonin, 11.2)],
        TechKind::AtkPotential => &[(Dopamine, 5.0), (Serotonin, 11.2)],
        TechKind::AtkSpeed => &[(Dopamine, 3.0), (Serotonin, 11.2)],
        TechKind::AtkDuration => &[(Dopamine, 2.5), (Serotonin, 11.2)],
        TechKind::DefPotential => &[(Dopamine, 5.0), (Serotonin, 11.2)],
        TechKind::DefSpeed => &[(Dopamine, 3.0), (Serotonin, 11.2)],
        TechKind::NucleusRange => &[(Dopamine, 10.0), (Serotonin, 10.0)],
    }
}

/// Unit costs as a map.
pub fn unit_costs(kind: UnitKind) -> Costs {
    unit_cost_table(kind).iter().copied().collect()
}

/// Technology costs for one level as a map.
pub fn tech_costs(kind: TechKind) -> Costs {
    tech_cost_table(kind).iter().copied().collect()
}

/// Whether building this unit binds the spent resources.
pub fn binds_resources(kind: UnitKind) -> bool {
    kind.is_neuron()
}

// =============================================================================
// UNIT PARAMETERS
// =============================================================================

/// Voltage at which a nucleus is destroyed.
pub const NUCLEUS_MAX_VOLTAGE: i32 = 17;
/// Voltage at which any other neuron is destroyed.
pub const NEURON_MAX_VOLTAGE: i32 = 5;

/// Base damage of an EPSP.
pub const EPSP_POTENTIAL: i32 = 2;
/// Base ms per step of an EPSP.
pub const EPSP_SPEED_MS: u64 = 370;
/// Base blocking strength of an IPSP.
pub const IPSP_POTENTIAL: i32 = 3;
/// Base ms per step of an IPSP.
pub const IPSP_SPEED_MS: u64 = 420;
/// Base seconds an IPSP blocks its target.
pub const IPSP_DURATION_S: u64 = 3;
/// ms faster per ATK_SPEED level.
pub const ATK_SPEED_STEP_MS: u64 = 50;

/// Base neutralization per activator shot.
pub const ACTIVATOR_SLOWDOWN: i32 = 1;
/// Base activator recharge in ms.
pub const ACTIVATOR_RECHARGE_MS: u64 = 700;
/// ms faster per DEF_SPEED level.
pub const DEF_SPEED_STEP_MS: u64 = 40;
/// Activator detection radius (Chebyshev, exclusive).
pub const ACTIVATOR_RADIUS: i32 = 3;

/// Cells around a nucleus in which neurons may be placed, before research.
pub const BASE_RANGE: i32 = 4;
/// Resource curve slowdown before research.
pub const BASE_CURVE_SLOWDOWN: i32 = 3;
/// EPSPs a synapse stores per SWARM level.
pub const SWARM_STEP: usize = 3;

/// Parameters for a new potential given the attack technologies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PotentialParams {
    /// Damage or block strength
    pub potential: i32,
    /// ms per step
    pub speed_ms: u64,
    /// Block duration (IPSP only)
    pub duration_s: u64,
}

impl PotentialParams {
    /// EPSP parameters.
    pub fn epsp(atk_potential: u8, atk_speed: u8) -> Self {
        Self {
            potential: EPSP_POTENTIAL + atk_potential as i32,
            speed_ms: EPSP_SPEED_MS.saturating_sub(ATK_SPEED_STEP_MS * atk_speed as u64),
            duration_s: 0,
        }
    }

    /// IPSP parameters.
    pub fn ipsp(atk_potential: u8, atk_speed: u8, atk_duration: u8) -> Self {
        Self {
            potential: IPSP_POTENTIAL + atk_potential as i32,
            speed_ms: IPSP_SPEED_MS.saturating_sub(ATK_SPEED_STEP_MS * atk_speed as u64),
            duration_s: IPSP_DURATION_S + atk_duration as u64,
        }
    }
}

/// Stored-EPSP cap of a synapse at a SWARM level.
pub fn swarm_cap(swarm_level: u8) -> usize {
    swarm_level as usize * SWARM_STEP + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_values() {
        let costs = unit_costs(UnitKind::Synapse);
        assert_eq!(costs.get(&Oxygen), Some(&13.4));
        assert_eq!(costs.get(&Potassium), Some(&6.6));
        assert!(unit_costs(UnitKind::ResourceNeuron).is_empty());
        assert_eq!(tech_costs(TechKind::Curve).len(), 2);
    }

    #[test]
    fn test_potential_params_scale_with_tech() {
        let base = PotentialParams::epsp(0, 0);
        let fast = PotentialParams::epsp(1, 2);
        assert_eq!(base.potential, 2);
        assert_eq!(fast.potential, 3);
        assert_eq!(fast.speed_ms, 270);
        assert_eq!(PotentialParams::ipsp(0, 0, 2).duration_s, 5);
        assert_eq!(swarm_cap(0), 1);
        assert_eq!(swarm_cap(3), 10);
    }

    #[test]
    fn test_only_neurons_bind() {
        assert!(binds_resources(UnitKind::Synapse));
        assert!(!binds_resources(UnitKind::Epsp));
    }
}
