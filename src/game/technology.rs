//! Technologies
//!
//! Research levels per player. Costs live in `costs`, side effects are
//! applied by the player when a level is bought.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Serialize, Deserialize};

use crate::game::error::{GameError, GameResult};

/// Researchable technologies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TechKind {
    /// Way-points per synapse
    Way,
    /// Stored-EPSP cap per synapse
    Swarm,
    /// Choose IPSP (level 1) and EPSP (level 2) targets
    Target,
    /// Oxygen limit +20%
    TotalOxygen,
    /// All limits +20%
    TotalResource,
    /// Resource curve slowdown -1
    Curve,
    /// Potential strength
    AtkPotential,
    /// Potential speed
    AtkSpeed,
    /// IPSP block duration
    AtkDuration,
    /// Activator neutralization
    DefPotential,
    /// Activator recharge
    DefSpeed,
    /// Placement range around nuclei
    NucleusRange,
}

impl TechKind {
    /// All technologies.
    pub const ALL: [TechKind; 12] = [
        TechKind::Way,
        TechKind::Swarm,
        TechKind::Target,
        TechKind::TotalOxygen,
        TechKind::TotalResource,
        TechKind::Curve,
        TechKind::AtkPotential,
        TechKind::AtkSpeed,
        TechKind::AtkDuration,
        TechKind::DefPotential,
        TechKind::DefSpeed,
        TechKind::NucleusRange,
    ];

    /// Highest level.
    pub fn max_level(self) -> u8 {
        match self {
            TechKind::Target | TechKind::Curve => 2,
            _ => 3,
        }
    }
}

impl fmt::Display for TechKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TechKind::Way => "way",
            TechKind::Swarm => "swarm",
            TechKind::Target => "target",
            TechKind::TotalOxygen => "total oxygen",
            TechKind::TotalResource => "total resource",
            TechKind::Curve => "curve",
            TechKind::AtkPotential => "attack potential",
            TechKind::AtkSpeed => "attack speed",
            TechKind::AtkDuration => "attack duration",
            TechKind::DefPotential => "defence potential",
            TechKind::DefSpeed => "defence speed",
            TechKind::NucleusRange => "nucleus range",
        };
        f.write_str(name)
    }
}

/// Current and max level of one technology.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechLevel {
    /// Researched level
    pub level: u8,
    /// Highest level
    pub max: u8,
}

/// All technologies of a player.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechBook {
    levels: BTreeMap<TechKind, TechLevel>,
}

impl Default for TechBook {
    fn default() -> Self {
        let levels = TechKind::ALL
            .into_iter()
            .map(|k| (k, TechLevel { level: 0, max: k.max_level() }))
            .collect();
        Self { levels }
    }
}

impl TechBook {
    /// Researched level of `kind`.
    pub fn level(&self, kind: TechKind) -> u8 {
        self.levels.get(&kind).map_or(0, |t| t.level)
    }

    /// Level and max of `kind`.
    pub fn get(&self, kind: TechKind) -> TechLevel {
        self.levels
            .get(&kind)
            .copied()
            .unwrap_or(TechLevel { level: 0, max: kind.max_level() })
    }

    /// Whether another level can be bought.
    pub fn can_advance(&self, kind: TechKind) -> bool {
        let t = self.get(kind);
        t.level < t.max
    }

    /// Level the next purchase would reach.
    pub fn next_level(&self, kind: TechKind) -> GameResult<u8> {
        if !self.can_advance(kind) {
            return Err(GameError::MaxLevelReached(kind));
        }
        Ok(self.level(kind) + 1)
    }

    /// Raise by one level, returning the new level.
    pub fn advance(&mut self, kind: TechKind) -> GameResult<u8> {
        let next = self.next_level(kind)?;
        self.levels.insert(kind, TechLevel { level: next, max: kind.max_level() });
        Ok(next)
    }

    /// Fail unless `kind` is at least `level`.
    pub fn require(&self, kind: TechKind, level: u8) -> GameResult<()> {
        if self.level(kind) >= level {
            Ok(())
        } else {
            Err(GameError::TechnologyLocked(kind, level))
        }
    }

    /// Iterate in kind order.
    pub fn iter(&self) -> impl Iterator<Item = (TechKind, TechLevel)> + '_ {
        self.levels.iter().map(|(k, t)| (*k, *t))
    }
}
