//! Resources
//!
//! Per-player resource amounts, the audio-driven regeneration curve and
//! iron distribution.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Serialize, Deserialize};
use tracing::debug;

use crate::core::Position;
use crate::game::costs::Costs;
use crate::game::error::{GameError, GameResult};

// =============================================================================
// RESOURCE KIND
// =============================================================================

/// The seven resources.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Distributed to activate and boost other resources
    Iron,
    /// Drives the gain of every other resource
    Oxygen,
    /// Synapses and potentials
    Potassium,
    /// IPSPs
    Chloride,
    /// Activated neurons
    Glutamate,
    /// Technologies
    Dopamine,
    /// Technologies
    Serotonin,
}

impl ResourceKind {
    /// All kinds in display order.
    pub const ALL: [ResourceKind; 7] = [
        ResourceKind::Iron,
        ResourceKind::Oxygen,
        ResourceKind::Potassium,
        ResourceKind::Chloride,
        ResourceKind::Glutamate,
        ResourceKind::Dopamine,
        ResourceKind::Serotonin,
    ];

    /// Kinds that sit on a field cell next to a nucleus.
    pub const ON_FIELD: [ResourceKind; 5] = [
        ResourceKind::Potassium,
        ResourceKind::Chloride,
        ResourceKind::Glutamate,
        ResourceKind::Dopamine,
        ResourceKind::Serotonin,
    ];

    /// Field symbol of the resource cell.
    pub fn symbol(self) -> Option<char> {
        match self {
            ResourceKind::Potassium => Some('k'),
            ResourceKind::Chloride => Some('c'),
            ResourceKind::Glutamate => Some('g'),
            ResourceKind::Dopamine => Some('d'),
            ResourceKind::Serotonin => Some('s'),
            ResourceKind::Iron | ResourceKind::Oxygen => None,
        }
    }

    /// Reverse of [`ResourceKind::symbol`].
    pub fn from_symbol(symbol: char) -> Option<Self> {
        Self::ON_FIELD.into_iter().find(|k| k.symbol() == Some(symbol))
    }

    /// Lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            ResourceKind::Iron => "iron",
            ResourceKind::Oxygen => "oxygen",
            ResourceKind::Potassium => "potassium",
            ResourceKind::Chloride => "chloride",
            ResourceKind::Glutamate => "glutamate",
            ResourceKind::Dopamine => "dopamine",
            ResourceKind::Serotonin => "serotonin",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// RESOURCE
// =============================================================================

/// One resource of one player.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Spendable amount
    pub cur: f64,
    /// Amount locked in buildings (or distributed iron)
    pub bound: f64,
    /// Maximum of `cur + bound`
    pub limit: f64,
    /// Iron distributed to this resource
    pub boost: u32,
    /// Gains each beat
    pub active: bool,
    /// Resource neuron blocked by an IPSP
    pub blocked: bool,
    /// Cell of the producing resource neuron
    pub pos: Option<Position>,
}

impl Resource {
    fn new(cur: f64, limit: f64, active: bool) -> Self {
        Self {
            cur,
            bound: 0.0,
            limit,
            boost: 0,
            active,
            blocked: false,
            pos: None,
        }
    }

    /// Add one beat's gain, never exceeding `limit - bound`.
    pub fn increase(&mut self, gain: f64, curve_slowdown: i32) {
        let slowdown = curve_slowdown.max(1) as f64;
        let boosted = gain / slowdown * (1.0 + 0.2 * self.boost as f64);
        let ceiling = (self.limit - self.bound).max(0.0);
        self.cur = (self.cur + boosted).min(ceiling);
    }

    /// `cur+bound/limit`
    pub fn print(&self) -> String {
        format!("{:.1}+{:.1}/{:.1}", self.cur, self.bound, self.limit)
    }
}

/// Outcome of an iron distribution or removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IronChange {
    /// Only the boost changed
    Boosted,
    /// Resource became active; neuron appears at the cell (if any)
    Activated(Option<Position>),
    /// Resource became inactive; neuron at the cell (if any) is hidden
    Deactivated(Option<Position>),
}

// =============================================================================
// RESOURCE BOOK
// =============================================================================

/// All resources of a player plus the regeneration curve.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceBook {
    resources: BTreeMap<ResourceKind, Resource>,
    curve_slowdown: i32,
}

impl Default for ResourceBook {
    fn default() -> Self {
        Self::new(crate::game::costs::BASE_CURVE_SLOWDOWN)
    }
}

impl ResourceBook {
    /// Starting resources.
    pub fn new(curve_slowdown: i32) -> Self {
        let resources = BTreeMap::from([
            (ResourceKind::Iron, Resource::new(3.0, 22.0, true)),
            (ResourceKind::Oxygen, Resource::new(5.5, 100.0, true)),
            (ResourceKind::Potassium, Resource::new(0.0, 100.0, false)),
            (ResourceKind::Chloride, Resource::new(0.0, 100.0, false)),
            (ResourceKind::Glutamate, Resource::new(0.0, 150.0, false)),
            (ResourceKind::Dopamine, Resource::new(0.0, 70.0, false)),
            (ResourceKind::Serotonin, Resource::new(0.0, 70.0, false)),
        ]);
        Self {
            resources,
            curve_slowdown,
        }
    }

    /// Look up one resource.
    pub fn get(&self, kind: ResourceKind) -> &Resource {
        // Every kind is inserted in `new` and never removed.
        &self.resources[&kind]
    }

    fn get_mut(&mut self, kind: ResourceKind) -> &mut Resource {
        self.resources.entry(kind).or_insert_with(|| Resource::new(0.0, 0.0, false))
    }

    /// Iterate in kind order.
    pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, &Resource)> {
        self.resources.iter().map(|(k, r)| (*k, r))
    }

    /// Current curve slowdown.
    pub fn curve_slowdown(&self) -> i32 {
        self.curve_slowdown
    }

    /// Lower the curve slowdown by one (CURVE research).
    pub fn relax_curve(&mut self) {
        self.curve_slowdown = (self.curve_slowdown - 1).max(1);
    }

    /// Record where a resource's neuron would stand.
    pub fn set_position(&mut self, kind: ResourceKind, pos: Position) {
        self.get_mut(kind).pos = Some(pos);
    }

    /// Overwrite the spendable amount, capped at `limit - bound`.
    pub fn set_current(&mut self, kind: ResourceKind, cur: f64) {
        let res = self.get_mut(kind);
        res.cur = cur.clamp(0.0, (res.limit - res.bound).max(0.0));
    }

    /// Block or unblock gaining.
    pub fn set_blocked(&mut self, kind: ResourceKind, blocked: bool) {
        self.get_mut(kind).blocked = blocked;
    }

    /// Turn a resource off (its neuron was destroyed).
    pub fn deactivate(&mut self, kind: ResourceKind) {
        if kind != ResourceKind::Iron && kind != ResourceKind::Oxygen {
            self.get_mut(kind).active = false;
        }
    }

    /// One beat of regeneration.
    ///
    /// Gain is `|ln(oxygen + 0.5)|`; iron only gains when `inc_iron` is set.
    pub fn increase(&mut self, inc_iron: bool) {
        let gain = (self.get(ResourceKind::Oxygen).cur + 0.5).ln().abs();
        let curve = self.curve_slowdown;
        for (kind, res) in self.resources.iter_mut() {
            if res.active && !res.blocked && (*kind != ResourceKind::Iron || inc_iron) {
                res.increase(gain, curve);
            }
        }
    }

    /// Deficit per resource for `costs` multiplied by `boost`.
    pub fn missing(&self, costs: &Costs, boost: u32) -> Costs {
        let boost = boost.max(1) as f64;
        costs
            .iter()
            .filter_map(|(kind, amount)| {
                let needed = amount * boost;
                let cur = self.get(*kind).cur;
                (cur < needed).then(|| (*kind, needed - cur))
            })
            .collect()
    }

    /// Spend `costs * boost`; optionally bind the spent amount.
    pub fn take(&mut self, costs: &Costs, bind: bool, boost: u32) -> GameResult<()> {
        let missing = self.missing(costs, boost);
        if !missing.is_empty() {
            return Err(GameError::InsufficientResources(missing));
        }
        let boost = boost.max(1) as f64;
        for (kind, amount) in costs {
            let res = self.get_mut(*kind);
            res.cur = (res.cur - amount * boost).max(0.0);
            if bind {
                res.bound += amount * boost;
            }
        }
        Ok(())
    }

    /// Move one iron from current to bound and boost `kind`.
    pub fn distribute_iron(&mut self, kind: ResourceKind) -> GameResult<IronChange> {
        if kind == ResourceKind::Iron {
            return Err(GameError::InvalidResource(kind));
        }
        if self.get(ResourceKind::Iron).cur < 1.0 {
            return Err(GameError::NotEnoughIron);
        }
        let iron = self.get_mut(ResourceKind::Iron);
        iron.cur -= 1.0;
        iron.bound += 1.0;

        let res = self.get_mut(kind);
        res.boost += 1;
        debug!(resource = %kind, boost = res.boost, "iron distributed");
        if res.boost == 2 && !res.active {
            res.active = true;
            return Ok(IronChange::Activated(res.pos));
        }
        Ok(IronChange::Boosted)
    }

    /// Reverse of [`ResourceBook::distribute_iron`].
    pub fn remove_iron(&mut self, kind: ResourceKind) -> GameResult<IronChange> {
        if kind == ResourceKind::Iron {
            return Err(GameError::InvalidResource(kind));
        }
        if self.get(kind).boost == 0 {
            return Err(GameError::NoDistribution(kind));
        }
        let res = self.get_mut(kind);
        res.boost -= 1;
        let boost = res.boost;
        let pos = res.pos;
        let iron = self.get_mut(ResourceKind::Iron);
        iron.bound -= 1.0;
        iron.cur += 1.0;

        if boost == 1 && kind != ResourceKind::Oxygen {
            self.get_mut(kind).active = false;
            return Ok(IronChange::Deactivated(pos));
        }
        Ok(IronChange::Boosted)
    }

    /// `limit += limit * factor` for every resource; shrinking clamps `cur`
    /// and stops at `bound`.
    pub fn update_limits(&mut self, factor: f64) {
        for res in self.resources.values_mut() {
            scale_limit(res, factor);
        }
    }

    /// `limit += limit * factor` for one resource.
    pub fn update_limit(&mut self, kind: ResourceKind, factor: f64) {
        scale_limit(self.get_mut(kind), factor);
    }

    /// Status summary, one line per resource.
    pub fn status_lines(&self) -> Vec<String> {
        let mut lines = vec![format!("slowdown: {}", self.curve_slowdown)];
        for (kind, res) in self.iter() {
            let mut line = format!("{kind}: {}", res.print());
            if kind != ResourceKind::Iron {
                line.push_str(&format!(" ++{}", res.boost));
            }
            lines.push(line);
        }
        lines
    }
}

// A shrinking limit never drops below what is bound.
fn scale_limit(res: &mut Resource, factor: f64) {
    res.limit = (res.limit + res.limit * factor).max(res.bound);
    let ceiling = (res.limit - res.bound).max(0.0);
    if res.cur > ceiling {
        res.cur = ceiling;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn costs(items: &[(ResourceKind, f64)]) -> Costs {
        items.iter().copied().collect()
    }

    #[test]
    fn test_initial_state() {
        let book = ResourceBook::default();
        assert_eq!(book.get(ResourceKind::Iron).cur, 3.0);
        assert_eq!(book.get(ResourceKind::Iron).limit, 22.0);
        assert!(book.get(ResourceKind::Oxygen).active);
        assert!(!book.get(ResourceKind::Potassium).active);
        assert_eq!(book.curve_slowdown(), 3);
    }

    #[test]
    fn test_distribute_activates_on_second_iron() {
        let mut book = ResourceBook::default();
        book.set_position(ResourceKind::Potassium, Position::new(3, 4));
        assert_eq!(book.distribute_iron(ResourceKind::Potassium), Ok(IronChange::Boosted));
        assert_eq!(
            book.distribute_iron(ResourceKind::Potassium),
            Ok(IronChange::Activated(Some(Position::new(3, 4))))
        );
        assert_eq!(book.get(ResourceKind::Iron).cur, 1.0);
        assert_eq!(book.get(ResourceKind::Iron).bound, 2.0);
        assert!(book.get(ResourceKind::Potassium).active);
    }

    #[test]
    fn test_distribute_then_remove_restores_totals() {
        let mut book = ResourceBook::default();
        let before = book.clone();
        book.distribute_iron(ResourceKind::Oxygen).unwrap();
        book.remove_iron(ResourceKind::Oxygen).unwrap();
        assert_eq!(book.get(ResourceKind::Iron), before.get(ResourceKind::Iron));
        assert_eq!(book.get(ResourceKind::Oxygen), before.get(ResourceKind::Oxygen));
    }

    #[test]
    fn test_iron_errors() {
        let mut book = ResourceBook::default();
        assert_eq!(
            book.distribute_iron(ResourceKind::Iron),
            Err(GameError::InvalidResource(ResourceKind::Iron))
        );
        assert_eq!(
            book.remove_iron(ResourceKind::Chloride),
            Err(GameError::NoDistribution(ResourceKind::Chloride))
        );
        for _ in 0..3 {
            book.distribute_iron(ResourceKind::Oxygen).unwrap();
        }
        assert_eq!(book.distribute_iron(ResourceKind::Oxygen), Err(GameError::NotEnoughIron));
    }

    #[test]
    fn test_remove_to_one_deactivates() {
        let mut book = ResourceBook::default();
        book.distribute_iron(ResourceKind::Glutamate).unwrap();
        book.distribute_iron(ResourceKind::Glutamate).unwrap();
        assert_eq!(
            book.remove_iron(ResourceKind::Glutamate),
            Ok(IronChange::Deactivated(None))
        );
        assert!(!book.get(ResourceKind::Glutamate).active);
    }

    #[test]
    fn test_increase_respects_iron_flag_and_limit() {
        let mut book = ResourceBook::default();
        let oxygen_before = book.get(ResourceKind::Oxygen).cur;
        book.increase(false);
        assert_eq!(book.get(ResourceKind::Iron).cur, 3.0);
        let gain = (oxygen_before + 0.5f64).ln().abs() / 3.0;
        assert!((book.get(ResourceKind::Oxygen).cur - (oxygen_before + gain)).abs() < 1e-9);

        book.increase(true);
        assert!(book.get(ResourceKind::Iron).cur > 3.0);

        for _ in 0..10_000 {
            book.increase(true);
        }
        for (_, res) in book.iter() {
            assert!(res.cur <= res.limit - res.bound + 1e-9);
        }
    }

    #[test]
    fn test_take_and_missing() {
        let mut book = ResourceBook::default();
        let synapse = costs(&[(ResourceKind::Oxygen, 13.4), (ResourceKind::Potassium, 6.6)]);
        let missing = book.missing(&synapse, 1);
        assert!((missing[&ResourceKind::Oxygen] - 7.9).abs() < 1e-9);
        assert!(matches!(book.take(&synapse, true, 1), Err(GameError::InsufficientResources(_))));
        assert_eq!(book.get(ResourceKind::Oxygen).cur, 5.5);

        let cheap = costs(&[(ResourceKind::Oxygen, 2.0)]);
        book.take(&cheap, true, 2).unwrap();
        assert_eq!(book.get(ResourceKind::Oxygen).cur, 1.5);
        assert_eq!(book.get(ResourceKind::Oxygen).bound, 4.0);
    }

    #[test]
    fn test_limits_shrink_clamps_current() {
        let mut book = ResourceBook::default();
        book.update_limits(0.1);
        assert!((book.get(ResourceKind::Oxygen).limit - 110.0).abs() < 1e-9);
        book.update_limit(ResourceKind::Iron, -0.9);
        assert!(book.get(ResourceKind::Iron).cur <= book.get(ResourceKind::Iron).limit);
    }

    #[test]
    fn test_limits_shrink_stops_at_bound() {
        let mut book = ResourceBook::new(3);
        book.set_current(ResourceKind::Glutamate, 150.0);
        let bind = costs(&[(ResourceKind::Glutamate, 145.0)]);
        book.take(&bind, true, 1).unwrap();

        book.update_limits(-0.1);
        let glutamate = book.get(ResourceKind::Glutamate);
        assert_eq!(glutamate.bound, 145.0);
        assert_eq!(glutamate.limit, 145.0);
        assert_eq!(glutamate.cur, 0.0);

        // Resources without bound amounts shrink normally.
        assert!((book.get(ResourceKind::Oxygen).limit - 90.0).abs() < 1e-9);
    }
}
