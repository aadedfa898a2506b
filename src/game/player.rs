//! Player
//!
//! One participant's complete state: resources, technologies, neurons and
//! potentials in flight, each behind its own lock (see `core::sync` for the
//! order). Every operation that affects an enemy first collects what it
//! needs under its own locks, releases them, then calls into the enemy.
//!
//! Time-dependent operations take `now` and a `time_scale` (1.0 for humans,
//! the AI speed for AIs) so callers, and tests, own the clock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;

use serde::{Serialize, Deserialize};
use tracing::{debug, info, instrument, warn};

use crate::audio::RandomGenerator;
use crate::core::Position;
use crate::core::sync::{lock, read, write};
use crate::game::costs::{
    binds_resources, swarm_cap, tech_costs, unit_costs, Costs, PotentialParams, UnitKind,
    ACTIVATOR_RADIUS, BASE_RANGE,
};
use crate::game::error::{GameError, GameResult};
use crate::game::events::GameEventData;
use crate::game::field::Field;
use crate::game::neuron::{Neuron, NeuronCommon, NeuronInfo, Synapse};
use crate::game::potential::{Potential, PotentialId, PotentialKind, PotentialStep};
use crate::game::resource::{IronChange, ResourceBook, ResourceKind};
use crate::game::technology::{TechBook, TechKind};

/// Limit change when a nucleus is built (or lost, negated).
const NUCLEUS_LIMIT_FACTOR: f64 = 0.1;
/// Limit change per TOTAL_RESOURCE / TOTAL_OXYGEN level.
const TECH_LIMIT_FACTOR: f64 = 0.2;

// =============================================================================
// STATISTICS
// =============================================================================

/// Per-player counters, logged at game end.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    /// Neurons built, by kind
    pub neurons_built: BTreeMap<UnitKind, u32>,
    /// Potentials launched, by kind
    pub potentials_launched: BTreeMap<UnitKind, u32>,
    /// Enemy EPSPs swallowed by own IPSPs
    pub epsps_swallowed: u32,
    /// Technology levels bought
    pub technologies_researched: u32,
    /// Enemy neurons destroyed
    pub enemy_neurons_destroyed: u32,
}

impl Statistics {
    /// One-line summary for the log.
    pub fn summary(&self) -> String {
        let built: u32 = self.neurons_built.values().sum();
        let launched: u32 = self.potentials_launched.values().sum();
        format!(
            "neurons built: {built}, potentials launched: {launched}, epsps swallowed: {}, \
             technologies: {}, enemy neurons destroyed: {}",
            self.epsps_swallowed, self.technologies_researched, self.enemy_neurons_destroyed
        )
    }
}

/// Snapshot of a potential for enemies and views.
#[derive(Clone, Debug, PartialEq)]
pub struct PotentialView {
    /// Id
    pub id: PotentialId,
    /// Current cell
    pub pos: Position,
    /// Remaining path
    pub way: Vec<Position>,
    /// Remaining amount
    pub potential: i32,
}

/// One entry of the synapse menu.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynapseOption {
    /// Menu number
    pub num: u8,
    /// Label
    pub label: String,
    /// Selectable now
    pub available: bool,
}

// =============================================================================
// PLAYER
// =============================================================================

/// A participant.
#[derive(Debug)]
pub struct Player {
    name: String,
    color: i32,
    field: Arc<Field>,
    rng: Arc<Mutex<RandomGenerator>>,
    neurons: RwLock<BTreeMap<Position, Neuron>>,
    nucleus: RwLock<Position>,
    potentials: RwLock<BTreeMap<PotentialId, Potential>>,
    resources: RwLock<ResourceBook>,
    technologies: RwLock<TechBook>,
    enemies: RwLock<Vec<Weak<Player>>>,
    next_seq: AtomicU64,
    resigned: AtomicBool,
    statistics: Mutex<Statistics>,
    new_dead_neurons: Mutex<Vec<NeuronInfo>>,
    new_neurons: Mutex<Vec<NeuronInfo>>,
}

impl Player {
    /// New player with one nucleus at `nucleus_pos`.
    pub fn new(
        name: impl Into<String>,
        color: i32,
        nucleus_pos: Position,
        field: Arc<Field>,
        rng: Arc<Mutex<RandomGenerator>>,
        now: Instant,
    ) -> Self {
        let mut resources = ResourceBook::default();
        for cell in field.all_in_range(nucleus_pos, 4.0, 2.0, false) {
            if let Some(kind) = field.resource_at(cell) {
                resources.set_position(kind, cell);
            }
        }
        let neurons = BTreeMap::from([(nucleus_pos, Neuron::nucleus(nucleus_pos, now))]);
        Self {
            name: name.into(),
            color,
            field,
            rng,
            neurons: RwLock::new(neurons),
            nucleus: RwLock::new(nucleus_pos),
            potentials: RwLock::new(BTreeMap::new()),
            resources: RwLock::new(resources),
            technologies: RwLock::new(TechBook::default()),
            enemies: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(1),
            resigned: AtomicBool::new(false),
            statistics: Mutex::new(Statistics::default()),
            new_dead_neurons: Mutex::new(Vec::new()),
            new_neurons: Mutex::new(Vec::new()),
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// Player name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Color tag.
    pub fn color(&self) -> i32 {
        self.color
    }

    /// Shared field.
    pub fn field(&self) -> &Arc<Field> {
        &self.field
    }

    /// Main nucleus position (display and AI targeting).
    pub fn nucleus_pos(&self) -> Position {
        *read(&self.nucleus)
    }

    /// Placement range around nuclei.
    pub fn cur_range(&self) -> i32 {
        BASE_RANGE + read(&self.technologies).level(TechKind::NucleusRange) as i32
    }

    /// Copy of the resources.
    pub fn resources(&self) -> ResourceBook {
        read(&self.resources).clone()
    }

    /// Copy of the technologies.
    pub fn technologies(&self) -> TechBook {
        read(&self.technologies).clone()
    }

    /// Copy of the statistics.
    pub fn statistics(&self) -> Statistics {
        lock(&self.statistics).clone()
    }

    /// Set the enemy list.
    pub fn set_enemies(&self, enemies: Vec<Weak<Player>>) {
        *write(&self.enemies) = enemies;
    }

    /// Living enemies.
    pub fn enemies(&self) -> Vec<Arc<Player>> {
        read(&self.enemies).iter().filter_map(Weak::upgrade).collect()
    }

    /// Give up.
    pub fn resign(&self) {
        info!(player = %self.name, "resigned");
        self.resigned.store(true, Ordering::SeqCst);
    }

    /// Resigned, or no nucleus left.
    pub fn has_lost(&self) -> bool {
        if self.resigned.load(Ordering::SeqCst) {
            return true;
        }
        !read(&self.neurons).values().any(|n| n.kind() == UnitKind::Nucleus)
    }

    /// `voltage / max` of the main nucleus, or `0 / 0` when it is gone.
    pub fn nucleus_live(&self) -> String {
        let main = self.nucleus_pos();
        match read(&self.neurons).get(&main) {
            Some(n) => format!("{} / {}", n.voltage(), n.max_voltage()),
            None => "0 / 0".to_string(),
        }
    }

    /// Status summary for the view.
    pub fn status_lines(&self) -> Vec<String> {
        let live = self.nucleus_live();
        let mut lines = read(&self.resources).status_lines();
        lines.push(format!("nucleus potential: {live}"));
        lines
    }

    // =========================================================================
    // NEURON QUERIES
    // =========================================================================

    /// Positions of neurons of `kind` (all kinds when `None`).
    pub fn positions_of_neurons(&self, kind: Option<UnitKind>) -> Vec<Position> {
        read(&self.neurons)
            .values()
            .filter(|n| kind.map_or(true, |k| n.kind() == k))
            .map(|n| n.pos())
            .collect()
    }

    /// Every neuron as (pos, kind).
    pub fn neuron_infos(&self) -> Vec<NeuronInfo> {
        read(&self.neurons).values().map(NeuronInfo::from).collect()
    }

    /// Kind of neuron at `pos`.
    pub fn neuron_kind_at(&self, pos: Position) -> Option<UnitKind> {
        read(&self.neurons).get(&pos).map(|n| n.kind())
    }

    /// Copy of the neuron at `pos`.
    pub fn neuron(&self, pos: Position) -> Option<Neuron> {
        read(&self.neurons).get(&pos).cloned()
    }

    /// Copy of the synapse at `pos`.
    pub fn synapse(&self, pos: Position) -> Option<Synapse> {
        read(&self.neurons).get(&pos).and_then(|n| n.as_synapse()).cloned()
    }

    /// Is the neuron at `pos` blocked?
    pub fn is_neuron_blocked(&self, pos: Position) -> bool {
        read(&self.neurons).get(&pos).map_or(false, |n| n.blocked())
    }

    /// Closest neuron of `kind` to `pos`.
    pub fn closest_neuron(&self, pos: Position, kind: UnitKind) -> Option<Position> {
        read(&self.neurons)
            .values()
            .filter(|n| n.kind() == kind)
            .map(|n| n.pos())
            .min_by(|a, b| a.distance(pos).total_cmp(&b.distance(pos)))
    }

    /// A random neuron of this player.
    pub fn random_neuron(&self) -> Option<Position> {
        let positions = self.positions_of_neurons(None);
        if positions.len() <= 1 {
            return positions.first().copied();
        }
        lock(&self.rng).choose(&positions).copied()
    }

    /// Neurons within range of the nucleus at `nucleus`.
    pub fn neurons_in_range(&self, nucleus: Position) -> Vec<NeuronInfo> {
        let neurons = read(&self.neurons);
        let range = self.cur_range() as f64;
        neurons
            .values()
            .filter(|n| n.pos().distance(nucleus) <= range)
            .map(NeuronInfo::from)
            .collect()
    }

    /// Neurons destroyed since the last call.
    pub fn take_new_dead_neurons(&self) -> Vec<NeuronInfo> {
        std::mem::take(&mut *lock(&self.new_dead_neurons))
    }

    /// Neurons built since the last call.
    pub fn take_new_neurons(&self) -> Vec<NeuronInfo> {
        std::mem::take(&mut *lock(&self.new_neurons))
    }

    // =========================================================================
    // POTENTIAL QUERIES
    // =========================================================================

    /// Snapshot of every potential in flight, in launch order.
    pub fn potentials(&self) -> Vec<PotentialView> {
        read(&self.potentials)
            .values()
            .map(|p| PotentialView {
                id: p.id,
                pos: p.pos,
                way: p.way.clone(),
                potential: p.potential,
            })
            .collect()
    }

    /// Lowest id of a potential at `pos`, optionally of one kind.
    pub fn potential_id_at(&self, pos: Position, kind: Option<PotentialKind>) -> Option<PotentialId> {
        read(&self.potentials)
            .values()
            .find(|p| p.pos == pos && kind.map_or(true, |k| p.kind() == k))
            .map(|p| p.id)
    }

    /// Number of (EPSP, IPSP) per occupied cell.
    pub fn potential_counts(&self) -> BTreeMap<Position, (usize, usize)> {
        let mut counts: BTreeMap<Position, (usize, usize)> = BTreeMap::new();
        for p in read(&self.potentials).values() {
            let entry = counts.entry(p.pos).or_default();
            match p.kind() {
                PotentialKind::Epsp => entry.0 += 1,
                PotentialKind::Ipsp => entry.1 += 1,
            }
        }
        counts
    }

    /// Amount left on a potential.
    pub fn potential_amount(&self, id: PotentialId) -> Option<i32> {
        read(&self.potentials).get(&id).map(|p| p.potential)
    }

    // =========================================================================
    // RESOURCES
    // =========================================================================

    /// One beat of resource regeneration.
    pub fn increase_resources(&self, inc_iron: bool) {
        write(&self.resources).increase(inc_iron);
    }

    /// Distribute one iron to `kind`.
    #[instrument(skip(self, now), fields(player = %self.name))]
    pub fn distribute_iron(&self, kind: ResourceKind, now: Instant) -> GameResult<IronChange> {
        let mut neurons = write(&self.neurons);
        let change = write(&self.resources).distribute_iron(kind)?;
        if let IronChange::Activated(Some(pos)) = change {
            let neuron = Neuron::resource(pos, kind, now);
            lock(&self.new_neurons).push(NeuronInfo::from(&neuron));
            neurons.insert(pos, neuron);
            info!(resource = %kind, %pos, "resource activated");
        }
        Ok(change)
    }

    /// Take one iron back from `kind`.
    #[instrument(skip(self), fields(player = %self.name))]
    pub fn remove_iron(&self, kind: ResourceKind) -> GameResult<IronChange> {
        let mut neurons = write(&self.neurons);
        let change = write(&self.resources).remove_iron(kind)?;
        if let IronChange::Deactivated(Some(pos)) = change {
            if neurons.get(&pos).and_then(Neuron::resource_kind) == Some(kind) {
                if let Some(neuron) = neurons.remove(&pos) {
                    lock(&self.new_dead_neurons).push(NeuronInfo::from(&neuron));
                }
            }
            info!(resource = %kind, %pos, "resource deactivated");
        }
        Ok(change)
    }

    /// Deficit per resource for `costs * boost`.
    pub fn missing_resources(&self, costs: &Costs, boost: u32) -> Costs {
        read(&self.resources).missing(costs, boost)
    }

    /// Deficit for one unit.
    pub fn missing_for_unit(&self, unit: UnitKind) -> Costs {
        self.missing_resources(&unit_costs(unit), 1)
    }

    /// Deficit for the next level of a technology.
    pub fn missing_for_technology(&self, tech: TechKind) -> Costs {
        let next = read(&self.technologies).level(tech) as u32 + 1;
        self.missing_resources(&tech_costs(tech), next)
    }

    /// Overwrite the spendable amount of one resource (scenario setup).
    pub fn set_resource(&self, kind: ResourceKind, cur: f64) {
        write(&self.resources).set_current(kind, cur);
    }

    /// Spend `costs * boost`, binding them when `bind` is set.
    pub fn take_resources(&self, costs: &Costs, bind: bool, boost: u32) -> GameResult<()> {
        write(&self.resources).take(costs, bind, boost)
    }

    // =========================================================================
    // BUILDING
    // =========================================================================

    /// Check a cell for a new neuron: free, walkable and within range of a
    /// nucleus.
    fn check_placement(&self, neurons: &BTreeMap<Position, Neuron>, pos: Position, range: i32) -> GameResult<()> {
        if neurons.contains_key(&pos) || !self.field.graph().contains(pos) || !self.field.is_free(pos) {
            return Err(GameError::InvalidPlacement(pos));
        }
        let in_range = neurons
            .values()
            .filter(|n| n.kind() == UnitKind::Nucleus)
            .any(|n| n.pos().distance(pos) <= range as f64);
        if !in_range {
            return Err(GameError::InvalidPlacement(pos));
        }
        Ok(())
    }

    /// Build a neuron at `pos`.
    #[instrument(skip(self, now), fields(player = %self.name))]
    pub fn add_neuron(
        &self,
        pos: Position,
        kind: UnitKind,
        epsp_target: Option<Position>,
        ipsp_target: Option<Position>,
        now: Instant,
    ) -> GameResult<()> {
        if !UnitKind::BUILDABLE.contains(&kind) {
            return Err(GameError::InvalidPlacement(pos));
        }
        let mut neurons = write(&self.neurons);
        let techs = self.technologies();
        let range = BASE_RANGE + techs.level(TechKind::NucleusRange) as i32;
        self.check_placement(&neurons, pos, range)?;

        {
            let mut resources = write(&self.resources);
            resources.take(&unit_costs(kind), binds_resources(kind), 1)?;
            if kind == UnitKind::Nucleus {
                resources.update_limits(NUCLEUS_LIMIT_FACTOR);
            }
        }

        let neuron = match kind {
            UnitKind::ActivatedNeuron => Neuron::activated(
                pos,
                techs.level(TechKind::DefPotential),
                techs.level(TechKind::DefSpeed),
                now,
            ),
            UnitKind::Synapse => Neuron::synapse(
                pos,
                techs.level(TechKind::Swarm),
                techs.level(TechKind::Way),
                epsp_target,
                ipsp_target,
                now,
            ),
            _ => Neuron::nucleus(pos, now),
        };
        lock(&self.new_neurons).push(NeuronInfo::from(&neuron));
        neurons.insert(pos, neuron);
        self.field.add_new_unit_to_pos(pos, kind);
        drop(neurons);

        *lock(&self.statistics).neurons_built.entry(kind).or_default() += 1;
        info!(unit = %kind, %pos, "neuron built");
        Ok(())
    }

    /// Launch a potential from the synapse at `synapse_pos`.
    ///
    /// Returns how many potentials left the synapse (0 while a swarm is
    /// still filling up). Fails without side effects when the synapse is
    /// missing or blocked, no path exists or resources are short.
    #[instrument(skip(self, now), fields(player = %self.name))]
    pub fn add_potential(&self, synapse_pos: Position, kind: PotentialKind, now: Instant) -> GameResult<usize> {
        let fallback_target = self.enemies().iter().find_map(|e| e.random_neuron());

        let mut neurons = write(&self.neurons);
        let neuron = neurons
            .get_mut(&synapse_pos)
            .filter(|n| n.kind() == UnitKind::Synapse)
            .ok_or(GameError::NoNeuron(synapse_pos, UnitKind::Synapse))?;
        if neuron.blocked() {
            return Err(GameError::SynapseBlocked(synapse_pos));
        }
        let synapse = neuron
            .as_synapse_mut()
            .ok_or(GameError::NoNeuron(synapse_pos, UnitKind::Synapse))?;
        synapse.update_ipsp_target_if_unset(fallback_target);
        let way_points = synapse
            .way_points_for(kind.unit())
            .ok_or(GameError::NoPath(synapse_pos, synapse_pos))?;
        let way = self.field.get_way_for_soldier(synapse_pos, &way_points)?;

        let mut potentials = write(&self.potentials);
        write(&self.resources).take(&unit_costs(kind.unit()), false, 1)?;
        let techs = self.technologies();

        let (count, params) = match kind {
            PotentialKind::Epsp => (
                synapse.add_epsp(),
                PotentialParams::epsp(techs.level(TechKind::AtkPotential), techs.level(TechKind::AtkSpeed)),
            ),
            PotentialKind::Ipsp => (
                1,
                PotentialParams::ipsp(
                    techs.level(TechKind::AtkPotential),
                    techs.level(TechKind::AtkSpeed),
                    techs.level(TechKind::AtkDuration),
                ),
            ),
        };
        let path: Vec<Position> = way.into_iter().skip(1).collect();
        for _ in 0..count {
            let id = PotentialId { seq: self.next_seq.fetch_add(1, Ordering::SeqCst), kind };
            potentials.insert(id, Potential::new(id, synapse_pos, path.clone(), params, now));
        }
        drop(potentials);
        drop(neurons);

        if count > 0 {
            *lock(&self.statistics).potentials_launched.entry(kind.unit()).or_default() += count as u32;
            debug!(count, ?kind, steps = path.len(), "potentials launched");
        }
        Ok(count)
    }

    /// Research the next level of `tech`.
    #[instrument(skip(self), fields(player = %self.name))]
    pub fn add_technology(&self, tech: TechKind) -> GameResult<u8> {
        let mut neurons = write(&self.neurons);
        let mut resources = write(&self.resources);
        let mut technologies = write(&self.technologies);

        let next = technologies.next_level(tech)?;
        resources.take(&tech_costs(tech), false, next as u32)?;
        let level = technologies.advance(tech)?;

        match tech {
            TechKind::Way => {
                for s in neurons.values_mut().filter_map(Neuron::as_synapse_mut) {
                    s.available_ways = level as usize;
                }
            }
            TechKind::Swarm => {
                for s in neurons.values_mut().filter_map(Neuron::as_synapse_mut) {
                    s.max_stored = swarm_cap(level);
                }
            }
            TechKind::TotalResource => resources.update_limits(TECH_LIMIT_FACTOR),
            TechKind::TotalOxygen => resources.update_limit(ResourceKind::Oxygen, TECH_LIMIT_FACTOR),
            TechKind::Curve => resources.relax_curve(),
            _ => {}
        }
        drop(technologies);
        drop(resources);
        drop(neurons);

        lock(&self.statistics).technologies_researched += 1;
        info!(technology = %tech, level, "technology researched");
        Ok(level)
    }

    // =========================================================================
    // SYNAPSE CONFIGURATION
    // =========================================================================

    fn with_synapse<T>(&self, pos: Position, f: impl FnOnce(&mut Synapse, &TechBook) -> GameResult<T>) -> GameResult<T> {
        let mut neurons = write(&self.neurons);
        let techs = self.technologies();
        let synapse = neurons
            .get_mut(&pos)
            .and_then(Neuron::as_synapse_mut)
            .ok_or(GameError::NoNeuron(pos, UnitKind::Synapse))?;
        f(synapse, &techs)
    }

    /// Replace all way-points with `way_point`.
    pub fn reset_way_for_synapse(&self, pos: Position, way_point: Position) -> GameResult<()> {
        self.with_synapse(pos, |s, techs| {
            techs.require(TechKind::Way, 1)?;
            s.way_points = vec![way_point];
            Ok(())
        })
    }

    /// Append a way-point; returns the new count.
    pub fn add_way_pos_for_synapse(&self, pos: Position, way_point: Position) -> GameResult<usize> {
        self.with_synapse(pos, |s, _| {
            if s.way_points.len() >= s.available_ways {
                return Err(GameError::TechnologyLocked(TechKind::Way, s.way_points.len() as u8 + 1));
            }
            s.way_points.push(way_point);
            Ok(s.way_points.len())
        })
    }

    /// Toggle swarm mode; returns the new state.
    pub fn switch_swarm_attack(&self, pos: Position) -> GameResult<bool> {
        self.with_synapse(pos, |s, _| {
            s.swarm = !s.swarm;
            Ok(s.swarm)
        })
    }

    /// Set where IPSPs go (needs TARGET 1).
    pub fn change_ipsp_target(&self, pos: Position, target: Position) -> GameResult<()> {
        self.with_synapse(pos, |s, techs| {
            techs.require(TechKind::Target, 1)?;
            s.ipsp_target = Some(target);
            Ok(())
        })
    }

    /// Set where EPSPs go (needs TARGET 2).
    pub fn change_epsp_target(&self, pos: Position, target: Position) -> GameResult<()> {
        self.with_synapse(pos, |s, techs| {
            techs.require(TechKind::Target, 2)?;
            s.epsp_target = Some(target);
            Ok(())
        })
    }

    /// Point a synapse at `target` without the TARGET requirement (AI).
    pub(crate) fn aim_synapse(&self, pos: Position, kind: PotentialKind, target: Position) -> GameResult<()> {
        self.with_synapse(pos, |s, _| {
            match kind {
                PotentialKind::Epsp => s.epsp_target = Some(target),
                PotentialKind::Ipsp => s.ipsp_target = Some(target),
            }
            Ok(())
        })
    }

    /// Target of a synapse for a potential kind.
    pub fn synapse_target(&self, pos: Position, kind: PotentialKind) -> Option<Position> {
        self.synapse(pos).and_then(|s| s.target(kind.unit()))
    }

    /// Way-points of a synapse, with the target of `kind` appended if given.
    pub fn synapse_way_points(&self, pos: Position, kind: Option<PotentialKind>) -> Vec<Position> {
        let Some(s) = self.synapse(pos) else {
            return Vec::new();
        };
        match kind {
            Some(k) => s.way_points_for(k.unit()).unwrap_or_default(),
            None => s.way_points,
        }
    }

    /// Menu for a synapse.
    pub fn synapse_options(&self, pos: Position) -> GameResult<Vec<SynapseOption>> {
        let s = self.synapse(pos).ok_or(GameError::NoNeuron(pos, UnitKind::Synapse))?;
        let techs = self.technologies();
        let option = |num, label: &str, available| SynapseOption { num, label: label.to_string(), available };
        Ok(vec![
            option(1, "(Re-)set way.", techs.level(TechKind::Way) > 0),
            option(2, "Add way-point.", s.way_points.len() < s.available_ways),
            option(3, "Select target for ipsp.", techs.level(TechKind::Target) > 0),
            option(4, "Select target for epsp.", techs.level(TechKind::Target) > 1),
            option(
                5,
                if s.swarm { "Turn swarm-attack off" } else { "Turn swarm-attack on" },
                techs.level(TechKind::Swarm) > 0,
            ),
        ])
    }

    /// Which units are affordable now.
    pub fn build_options(&self) -> BTreeMap<UnitKind, bool> {
        let resources = read(&self.resources);
        [
            UnitKind::ActivatedNeuron,
            UnitKind::Synapse,
            UnitKind::Nucleus,
            UnitKind::Epsp,
            UnitKind::Ipsp,
        ]
        .into_iter()
        .map(|k| (k, resources.missing(&unit_costs(k), 1).is_empty()))
        .collect()
    }

    // =========================================================================
    // COMBAT
    // =========================================================================

    /// Move every potential that is due and apply arrivals to the enemies.
    pub fn move_potentials(&self, now: Instant, time_scale: f64) -> Vec<GameEventData> {
        let mut hits = Vec::new();
        let mut blocks = Vec::new();
        let mut releases = Vec::new();
        {
            let mut potentials = write(&self.potentials);
            let mut done = Vec::new();
            for (id, p) in potentials.iter_mut() {
                match p.step(now, time_scale) {
                    PotentialStep::Hit { pos, amount } => {
                        hits.push((pos, amount));
                        done.push(*id);
                    }
                    PotentialStep::Block(pos) => blocks.push(pos),
                    PotentialStep::Release(pos) => {
                        releases.push(pos);
                        done.push(*id);
                    }
                    PotentialStep::Idle | PotentialStep::Moved => {}
                }
            }
            for id in done {
                potentials.remove(&id);
            }
        }

        let mut events = Vec::new();
        for enemy in self.enemies() {
            for &pos in &blocks {
                enemy.set_block_for_neuron(pos, true);
            }
            for &pos in &releases {
                enemy.set_block_for_neuron(pos, false);
            }
            for &(pos, amount) in &hits {
                let destroyed = enemy.add_potential_to_neuron(pos, amount);
                if !destroyed.is_empty() {
                    lock(&self.statistics).enemy_neurons_destroyed += destroyed.len() as u32;
                }
                events.extend(destroyed.into_iter().map(|n| GameEventData::NeuronDestroyed {
                    player: enemy.name().to_string(),
                    pos: n.pos,
                    unit: n.unit,
                }));
            }
        }
        for (pos, amount) in hits {
            events.push(GameEventData::PotentialArrived { player: self.name.clone(), pos, amount });
        }
        events
    }

    /// Block or unblock the neuron at `pos`; idempotent.
    pub fn set_block_for_neuron(&self, pos: Position, blocked: bool) {
        let mut neurons = write(&self.neurons);
        if let Some(n) = neurons.get_mut(&pos) {
            n.set_blocked(blocked);
            if let Some(kind) = n.resource_kind() {
                write(&self.resources).set_blocked(kind, blocked);
            }
        }
    }

    /// Let every ready activator neutralize one nearby enemy potential.
    pub fn handle_def(&self, now: Instant, time_scale: f64) -> Vec<GameEventData> {
        let ready: Vec<(Position, i32)> = read(&self.neurons)
            .values()
            .filter_map(|n| n.as_activated().map(|a| (n.pos(), a)))
            .filter(|(_, a)| a.ready(now, time_scale))
            .map(|(pos, a)| (pos, a.slowdown))
            .collect();
        if ready.is_empty() {
            return Vec::new();
        }

        let mut fired = Vec::new();
        let mut events = Vec::new();
        for enemy in self.enemies() {
            let mut incoming = enemy.potentials();
            for &(pos, slowdown) in &ready {
                if fired.contains(&pos) {
                    continue;
                }
                let Some(idx) = incoming.iter().position(|p| p.pos.chebyshev(pos) < ACTIVATOR_RADIUS) else {
                    continue;
                };
                let target = incoming[idx].id;
                if enemy.neutralize_potential(target, slowdown) {
                    incoming.remove(idx);
                }
                fired.push(pos);
                events.push(GameEventData::PotentialNeutralized {
                    player: self.name.clone(),
                    pos,
                    target: target.to_string(),
                });
            }
        }

        if !fired.is_empty() {
            let mut neurons = write(&self.neurons);
            for pos in &fired {
                if let Some(n) = neurons.get_mut(pos) {
                    n.core_mut().last_action = now;
                }
            }
        }
        events
    }

    /// Subtract `amount` (negative heals). Removes the potential if it drops
    /// to zero before arriving. Returns whether it was removed.
    pub fn neutralize_potential(&self, id: PotentialId, amount: i32) -> bool {
        let mut potentials = write(&self.potentials);
        let Some(p) = potentials.get_mut(&id) else {
            return false;
        };
        p.potential -= amount;
        if p.potential <= 0 && !p.arrived() {
            potentials.remove(&id);
            debug!(player = %self.name, %id, "potential neutralized");
            return true;
        }
        false
    }

    /// Add damage to the neuron at `pos`. Returns every neuron lost as a
    /// result: the target, and after a nucleus falls, all neurons left out
    /// of range.
    pub fn add_potential_to_neuron(&self, pos: Position, amount: i32) -> Vec<NeuronInfo> {
        let mut neurons = write(&self.neurons);
        let mut main = write(&self.nucleus);

        let destroyed = match neurons.get_mut(&pos) {
            Some(n) => n.increase_voltage(amount),
            None => return Vec::new(),
        };
        if !destroyed {
            return Vec::new();
        }
        let mut lost = Vec::new();
        if let Some(n) = neurons.remove(&pos) {
            lost.push(NeuronInfo::from(&n));
        }

        let nucleus_fell = lost.first().map_or(false, |n| n.unit == UnitKind::Nucleus);
        let mut resources = write(&self.resources);
        if nucleus_fell {
            if *main == pos {
                if let Some(next) = neurons
                    .values()
                    .filter(|n| n.kind() == UnitKind::Nucleus)
                    .map(|n| n.pos())
                    .min_by(|a, b| a.distance(pos).total_cmp(&b.distance(pos)))
                {
                    *main = next;
                }
            }
            let range = BASE_RANGE + read(&self.technologies).level(TechKind::NucleusRange) as i32;
            lost.extend(prune_out_of_range(&mut neurons, range));
            resources.update_limits(-NUCLEUS_LIMIT_FACTOR);
            warn!(player = %self.name, %pos, "nucleus destroyed");
        }
        for info in &lost {
            if info.unit == UnitKind::ResourceNeuron {
                if let Some(kind) = self.field.resource_at(info.pos) {
                    resources.deactivate(kind);
                }
            }
        }
        drop(resources);
        drop(main);
        drop(neurons);

        for info in &lost {
            self.field.remove_unit_at(info.pos);
        }
        lock(&self.new_dead_neurons).extend(lost.iter().copied());
        lost
    }

    /// Swallow enemy EPSPs with own IPSPs on the same cell.
    ///
    /// For each own IPSP and each enemy with an EPSP on that cell, the IPSP
    /// gains 1 and the enemy's lowest-id EPSP there loses 1.
    pub fn swallow_epsps(&self) -> Vec<GameEventData> {
        let ipsps: Vec<(PotentialId, Position)> = read(&self.potentials)
            .values()
            .filter(|p| p.kind() == PotentialKind::Ipsp)
            .map(|p| (p.id, p.pos))
            .collect();
        let mut events = Vec::new();
        for enemy in self.enemies() {
            for &(ipsp, pos) in &ipsps {
                let Some(epsp) = enemy.potential_id_at(pos, Some(PotentialKind::Epsp)) else {
                    continue;
                };
                self.neutralize_potential(ipsp, -1);
                let removed = enemy.neutralize_potential(epsp, 1);
                lock(&self.statistics).epsps_swallowed += 1;
                info!(player = %self.name, %pos, "ipsp swallowed epsp");
                events.push(GameEventData::EpspSwallowed {
                    player: self.name.clone(),
                    pos,
                    removed,
                });
            }
        }
        events
    }
}

/// Remove every non-nucleus neuron that is out of `range` of all nuclei.
fn prune_out_of_range(neurons: &mut BTreeMap<Position, Neuron>, range: i32) -> Vec<NeuronInfo> {
    let nuclei: Vec<Position> = neurons
        .values()
        .filter(|n| n.kind() == UnitKind::Nucleus)
        .map(|n| n.pos())
        .collect();
    let out: Vec<Position> = neurons
        .values()
        .filter(|n| n.kind() != UnitKind::Nucleus)
        .filter(|n| !nuclei.iter().any(|c| n.pos().distance(*c) <= range as f64))
        .map(|n| n.pos())
        .collect();
    out.into_iter()
        .filter_map(|p| neurons.remove(&p))
        .map(|n| NeuronInfo::from(&n))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::audio::{AnalyzedAudio, BeatFrame, RandomMode};

    const ALICE_NUCLEUS: Position = Position { row: 5, col: 3 };
    const BOB_NUCLEUS: Position = Position { row: 5, col: 26 };

    fn rng() -> Arc<Mutex<RandomGenerator>> {
        let beats = (0..16)
            .map(|i| BeatFrame {
                time: i * 500,
                bpm: 120.0,
                level: 0.5,
                notes: vec![(60 + i) as u8],
                off_note: false,
                minor: false,
            })
            .collect();
        let audio = AnalyzedAudio::from_frames("player-test.mp3", beats).unwrap();
        Arc::new(Mutex::new(audio.generator(RandomMode::Note)))
    }

    /// Open 11x30 field, alice left, bob right, potassium next to alice.
    fn duel() -> (Arc<Player>, Arc<Player>, Instant) {
        let mut rows = vec![".".repeat(30); 11];
        rows[5].replace_range(3..4, "D");
        rows[5].replace_range(26..27, "D");
        rows[3].replace_range(3..4, "k");
        let rows: Vec<&str> = rows.iter().map(String::as_str).collect();
        let field = Arc::new(Field::from_rows(&rows));
        let now = Instant::now();
        let ran = rng();
        let alice = Arc::new(Player::new("alice", 1, ALICE_NUCLEUS, field.clone(), ran.clone(), now));
        let bob = Arc::new(Player::new("bob", 2, BOB_NUCLEUS, field, ran, now));
        alice.set_enemies(vec![Arc::downgrade(&bob)]);
        bob.set_enemies(vec![Arc::downgrade(&alice)]);
        (alice, bob, now)
    }

    fn rich(player: &Player) {
        for kind in ResourceKind::ALL {
            player.set_resource(kind, 60.0);
        }
    }

    #[test]
    fn test_build_needs_resources() {
        let (alice, _, now) = duel();
        let pos = Position::new(5, 5);
        let err = alice.add_neuron(pos, UnitKind::Synapse, None, None, now).unwrap_err();
        assert!(matches!(err, GameError::InsufficientResources(_)));
        assert_eq!(alice.neuron_kind_at(pos), None);

        alice.set_resource(ResourceKind::Oxygen, 20.0);
        alice.set_resource(ResourceKind::Potassium, 10.0);
        alice.add_neuron(pos, UnitKind::Synapse, Some(BOB_NUCLEUS), None, now).unwrap();
        assert_eq!(alice.neuron_kind_at(pos), Some(UnitKind::Synapse));
        assert_eq!(alice.field().symbol_at(pos), Some('S'));
        let oxygen = alice.resources().get(ResourceKind::Oxygen).clone();
        assert!((oxygen.cur - 6.6).abs() < 1e-9);
        assert!((oxygen.bound - 13.4).abs() < 1e-9);
    }

    #[test]
    fn test_placement_rules() {
        let (alice, _, now) = duel();
        rich(&alice);
        assert_eq!(
            alice.add_neuron(Position::new(5, 12), UnitKind::Synapse, None, None, now),
            Err(GameError::InvalidPlacement(Position::new(5, 12)))
        );
        assert_eq!(
            alice.add_neuron(ALICE_NUCLEUS, UnitKind::Synapse, None, None, now),
            Err(GameError::InvalidPlacement(ALICE_NUCLEUS))
        );
        assert_eq!(
            alice.add_neuron(Position::new(3, 3), UnitKind::ActivatedNeuron, None, None, now),
            Err(GameError::InvalidPlacement(Position::new(3, 3)))
        );
        assert!(alice.add_neuron(Position::new(7, 5), UnitKind::ActivatedNeuron, None, None, now).is_ok());
    }

    #[test]
    fn test_second_iron_activates_resource() {
        let (alice, _, now) = duel();
        assert_eq!(alice.distribute_iron(ResourceKind::Potassium, now), Ok(IronChange::Boosted));
        assert_eq!(
            alice.distribute_iron(ResourceKind::Potassium, now),
            Ok(IronChange::Activated(Some(Position::new(3, 3))))
        );
        assert_eq!(alice.neuron_kind_at(Position::new(3, 3)), Some(UnitKind::ResourceNeuron));
        assert_eq!(alice.take_new_neurons().len(), 1);

        assert_eq!(
            alice.remove_iron(ResourceKind::Potassium),
            Ok(IronChange::Deactivated(Some(Position::new(3, 3))))
        );
        assert_eq!(alice.neuron_kind_at(Position::new(3, 3)), None);
        assert!(!alice.resources().get(ResourceKind::Potassium).active);
        assert_eq!(
            alice.take_new_dead_neurons(),
            vec![NeuronInfo { pos: Position::new(3, 3), unit: UnitKind::ResourceNeuron }]
        );
    }

    #[test]
    fn test_epsp_travels_and_hits_nucleus() {
        let (alice, bob, mut now) = duel();
        rich(&alice);
        let synapse = Position::new(5, 5);
        alice.add_neuron(synapse, UnitKind::Synapse, Some(BOB_NUCLEUS), None, now).unwrap();
        let k_before = alice.resources().get(ResourceKind::Potassium).cur;
        assert_eq!(alice.add_potential(synapse, PotentialKind::Epsp, now), Ok(1));
        let k_after = alice.resources().get(ResourceKind::Potassium).cur;
        assert!((k_before - k_after - 4.4).abs() < 1e-9);

        let steps = alice.potentials()[0].way.len();
        assert_eq!(steps, 21);
        let mut events = Vec::new();
        for _ in 0..steps {
            now += Duration::from_millis(371);
            events.extend(alice.move_potentials(now, 1.0));
        }
        assert!(alice.potentials().is_empty());
        assert_eq!(bob.nucleus_live(), "2 / 17");
        assert!(events
            .iter()
            .any(|e| matches!(e, GameEventData::PotentialArrived { pos, amount: 2, .. } if *pos == BOB_NUCLEUS)));
    }

    #[test]
    fn test_blocked_synapse_refuses_without_cost() {
        let (alice, _, now) = duel();
        rich(&alice);
        let synapse = Position::new(5, 5);
        alice.add_neuron(synapse, UnitKind::Synapse, Some(BOB_NUCLEUS), None, now).unwrap();
        alice.set_block_for_neuron(synapse, true);
        let before = alice.resources().get(ResourceKind::Potassium).cur;
        assert_eq!(
            alice.add_potential(synapse, PotentialKind::Epsp, now),
            Err(GameError::SynapseBlocked(synapse))
        );
        assert_eq!(alice.resources().get(ResourceKind::Potassium).cur, before);
        assert!(alice.potentials().is_empty());
    }

    #[test]
    fn test_ipsp_falls_back_to_random_enemy_neuron() {
        let (alice, _, now) = duel();
        rich(&alice);
        let synapse = Position::new(5, 5);
        alice.add_neuron(synapse, UnitKind::Synapse, Some(BOB_NUCLEUS), None, now).unwrap();
        assert_eq!(alice.add_potential(synapse, PotentialKind::Ipsp, now), Ok(1));
        assert_eq!(alice.synapse_target(synapse, PotentialKind::Ipsp), Some(BOB_NUCLEUS));
    }

    #[test]
    fn test_nucleus_loss_prunes_and_loses() {
        let (_, bob, now) = duel();
        rich(&bob);
        bob.add_neuron(Position::new(5, 24), UnitKind::ActivatedNeuron, None, None, now).unwrap();
        let limit_before = bob.resources().get(ResourceKind::Oxygen).limit;

        assert!(bob.add_potential_to_neuron(BOB_NUCLEUS, 16).is_empty());
        let lost = bob.add_potential_to_neuron(BOB_NUCLEUS, 1);
        assert_eq!(lost.len(), 2);
        assert_eq!(lost[0].unit, UnitKind::Nucleus);
        assert!(bob.has_lost());
        assert_eq!(bob.field().symbol_at(Position::new(5, 24)), Some('.'));
        assert_eq!(bob.take_new_dead_neurons().len(), 2);
        let limit_after = bob.resources().get(ResourceKind::Oxygen).limit;
        assert!(limit_after < limit_before);
    }

    #[test]
    fn test_activator_neutralizes_epsp() {
        let (alice, bob, now) = duel();
        rich(&alice);
        rich(&bob);
        bob.add_neuron(Position::new(5, 23), UnitKind::ActivatedNeuron, None, None, now).unwrap();
        let id = PotentialId { seq: 99, kind: PotentialKind::Epsp };
        let params = PotentialParams::epsp(0, 0);
        let epsp = Potential::new(id, Position::new(5, 21), vec![Position::new(5, 22)], params, now);
        write(&alice.potentials).insert(id, epsp);

        assert!(bob.handle_def(now + Duration::from_millis(500), 1.0).is_empty());
        let t1 = now + Duration::from_millis(701);
        assert_eq!(bob.handle_def(t1, 1.0).len(), 1);
        assert_eq!(alice.potential_amount(id), Some(1));
        assert!(bob.handle_def(t1 + Duration::from_millis(100), 1.0).is_empty());
        bob.handle_def(t1 + Duration::from_millis(702), 1.0);
        assert_eq!(alice.potential_amount(id), None);
    }

    #[test]
    fn test_ipsp_swallows_epsp() {
        let (alice, bob, now) = duel();
        let cell = Position::new(5, 15);
        let ipsp = PotentialId { seq: 1, kind: PotentialKind::Ipsp };
        write(&alice.potentials).insert(
            ipsp,
            Potential::new(ipsp, cell, vec![Position::new(5, 16)], PotentialParams::ipsp(0, 0, 0), now),
        );
        let epsp = PotentialId { seq: 1, kind: PotentialKind::Epsp };
        write(&bob.potentials).insert(
            epsp,
            Potential::new(epsp, cell, vec![Position::new(5, 14)], PotentialParams::epsp(0, 0), now),
        );

        let events = alice.swallow_epsps();
        assert_eq!(events.len(), 1);
        assert_eq!(alice.potential_amount(ipsp), Some(4));
        assert_eq!(bob.potential_amount(epsp), Some(1));
        assert_eq!(alice.statistics().epsps_swallowed, 1);
    }

    #[test]
    fn test_technology_effects() {
        let (alice, _, now) = duel();
        rich(&alice);
        let synapse = Position::new(5, 5);
        alice.add_neuron(synapse, UnitKind::Synapse, Some(BOB_NUCLEUS), None, now).unwrap();
        assert_eq!(
            alice.reset_way_for_synapse(synapse, Position::new(0, 10)),
            Err(GameError::TechnologyLocked(TechKind::Way, 1))
        );
        assert_eq!(alice.add_technology(TechKind::Way), Ok(1));
        assert_eq!(alice.synapse(synapse).unwrap().available_ways, 1);
        alice.reset_way_for_synapse(synapse, Position::new(0, 10)).unwrap();
        assert!(alice.add_way_pos_for_synapse(synapse, Position::new(10, 10)).is_err());

        let before = alice.resources().get(ResourceKind::Oxygen).limit;
        alice.add_technology(TechKind::TotalOxygen).unwrap();
        let after = alice.resources().get(ResourceKind::Oxygen).limit;
        assert!((after - before * 1.2).abs() < 1e-9);

        alice.set_resource(ResourceKind::Dopamine, 60.0);
        alice.set_resource(ResourceKind::Serotonin, 60.0);
        alice.add_technology(TechKind::Curve).unwrap();
        alice.set_resource(ResourceKind::Dopamine, 60.0);
        alice.set_resource(ResourceKind::Serotonin, 60.0);
        alice.add_technology(TechKind::Curve).unwrap();
        assert_eq!(alice.add_technology(TechKind::Curve), Err(GameError::MaxLevelReached(TechKind::Curve)));
        assert_eq!(alice.resources().curve_slowdown(), 1);
    }

    #[test]
    fn test_targets_need_research() {
        let (alice, _, now) = duel();
        rich(&alice);
        let synapse = Position::new(5, 5);
        alice.add_neuron(synapse, UnitKind::Synapse, Some(BOB_NUCLEUS), None, now).unwrap();
        let target = Position::new(2, 20);
        assert!(alice.change_ipsp_target(synapse, target).is_err());
        alice.add_technology(TechKind::Target).unwrap();
        alice.change_ipsp_target(synapse, target).unwrap();
        assert!(alice.change_epsp_target(synapse, target).is_err());
        let options = alice.synapse_options(synapse).unwrap();
        assert!(options[2].available);
        assert!(!options[3].available);
    }
}
