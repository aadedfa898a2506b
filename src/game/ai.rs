//! Audio AI
//!
//! An opponent that plays from its own track. Loud stretches of the track
//! trigger attacks, a change between minor and major intervals switches
//! between battle and economy tactics, and every random choice it makes is
//! drawn from the track, so the same song always plays the same way.
//!
//! The AI owns no game state. It drives its `Player` through the same
//! operations a human's commands use, with one exception: it may aim a
//! synapse without having researched TARGET.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Serialize, Deserialize};
use tracing::{debug, info, instrument};

use crate::audio::{AnalyzedAudio, BeatFrame, RandomGenerator, RandomMode};
use crate::core::Position;
use crate::game::costs::{PotentialParams, UnitKind, ACTIVATOR_RADIUS};
use crate::game::events::GameEventData;
use crate::game::player::{Player, PotentialView};
use crate::game::potential::PotentialKind;
use crate::game::resource::{IronChange, ResourceKind};
use crate::game::technology::TechKind;

/// Above-average beats needed before an attack.
const ATTACK_BUFFER: usize = 4;
/// Gap between two launches of one attack.
const LAUNCH_SPACING_MS: i64 = 110;
/// IPSPs should land this long before the EPSPs.
const SYNC_MARGIN_MS: i64 = 100;
/// Bound above which a resource counts as stuck.
const HIGH_BOUND: f64 = 70.0;
/// Same for oxygen.
const HIGH_BOUND_OXYGEN: f64 = 65.0;
/// An active resource above this may give its iron away.
const PLENTIFUL: f64 = 40.0;
/// Most EPSPs in one attack.
const MAX_EPSPS_PER_ATTACK: usize = 12;
/// Most IPSPs in one attack.
const MAX_IPSPS_PER_ATTACK: usize = 3;
/// Activators built per defense.
const MAX_EXTRA_ACTIVATORS: usize = 2;
/// Enemy EPSPs aimed this far beyond the own range still count as a threat.
const THREAT_MARGIN: f64 = 4.0;

// =============================================================================
// STRATEGIES
// =============================================================================

/// What EPSP attacks aim at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpspTarget {
    /// Main nucleus
    Nucleus,
    /// Activated neurons
    Activator,
    /// Synapses
    Synapse,
    /// Resource neurons
    Resource,
}

impl EpspTarget {
    const ALL: [EpspTarget; 4] = [
        EpspTarget::Nucleus,
        EpspTarget::Activator,
        EpspTarget::Synapse,
        EpspTarget::Resource,
    ];

    fn unit(self) -> UnitKind {
        match self {
            EpspTarget::Nucleus => UnitKind::Nucleus,
            EpspTarget::Activator => UnitKind::ActivatedNeuron,
            EpspTarget::Synapse => UnitKind::Synapse,
            EpspTarget::Resource => UnitKind::ResourceNeuron,
        }
    }
}

/// What IPSPs block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpspTarget {
    /// Activators along the attack path
    Activator,
    /// Synapses
    Synapse,
    /// Resource neurons
    Resource,
}

impl IpspTarget {
    const ALL: [IpspTarget; 3] = [IpspTarget::Activator, IpspTarget::Synapse, IpspTarget::Resource];
}

/// Where to concentrate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Focus {
    /// Toward the enemy
    Front,
    /// Spread around the nucleus
    Surround,
}

impl Focus {
    const ALL: [Focus; 2] = [Focus::Front, Focus::Surround];
}

/// Weighted strategy pools.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Strategies {
    /// EPSP targets
    pub epsp_targets: BTreeMap<EpspTarget, u32>,
    /// IPSP targets
    pub ipsp_targets: BTreeMap<IpspTarget, u32>,
    /// Front attacks vs. attacks from the side
    pub ipsp_epsp: BTreeMap<Focus, u32>,
    /// Activator placement
    pub activated_neurons: BTreeMap<Focus, u32>,
    /// Defense: IPSPs first (front) or activators first (surround)
    pub defence: BTreeMap<Focus, u32>,
}

impl Strategies {
    fn draw(ran: &mut RandomGenerator) -> Self {
        fn weights<K: Copy + Ord>(keys: &[K], ran: &mut RandomGenerator) -> BTreeMap<K, u32> {
            keys.iter().map(|&k| (k, ran.random_int(1, 11) as u32)).collect()
        }
        Self {
            epsp_targets: weights(&EpspTarget::ALL, ran),
            ipsp_targets: weights(&IpspTarget::ALL, ran),
            ipsp_epsp: weights(&Focus::ALL, ran),
            activated_neurons: weights(&Focus::ALL, ran),
            defence: weights(&Focus::ALL, ran),
        }
    }
}

/// Strategies by descending weight; equal weights keep key order.
pub fn sort_strategy<K: Copy + Ord>(strategies: &BTreeMap<K, u32>) -> Vec<K> {
    let mut sorted: Vec<(K, u32)> = strategies.iter().map(|(&k, &w)| (k, w)).collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1));
    sorted.into_iter().map(|(k, _)| k).collect()
}

/// Heaviest strategy.
pub fn top_strategy<K: Copy + Ord>(strategies: &BTreeMap<K, u32>) -> Option<K> {
    sort_strategy(strategies).first().copied()
}

fn pick_strategy<K: Copy + Ord>(ran: &mut RandomGenerator, strategies: &BTreeMap<K, u32>) -> Option<K> {
    let keys: Vec<K> = strategies.keys().copied().collect();
    let weights: Vec<u32> = strategies.values().copied().collect();
    ran.pick_weighted(&weights).and_then(|i| keys.get(i).copied())
}

/// Launch delays `(ipsp, epsp)` in ms so the IPSPs land just before the EPSPs.
pub fn synch_attacks(epsp_len: usize, epsp_speed_ms: u64, ipsp_len: usize, ipsp_speed_ms: u64) -> (i64, i64) {
    let ipsp_arrival = ipsp_len as i64 * ipsp_speed_ms as i64;
    let epsp_arrival = epsp_len as i64 * epsp_speed_ms as i64;
    let diff = ipsp_arrival + SYNC_MARGIN_MS - epsp_arrival;
    if diff >= 0 {
        (0, diff)
    } else {
        (-diff, 0)
    }
}

/// Neurons within activator reach of any cell of `way`.
pub fn activated_neurons_on_way(neurons: &[Position], way: &[Position]) -> Vec<Position> {
    neurons
        .iter()
        .copied()
        .filter(|n| way.iter().any(|w| w.chebyshev(*n) < ACTIVATOR_RADIUS))
        .collect()
}

fn sort_by_distance(from: Position, mut positions: Vec<Position>) -> Vec<Position> {
    positions.sort_by(|a, b| a.distance(from).total_cmp(&b.distance(from)));
    positions
}

// =============================================================================
// AUDIO KI
// =============================================================================

#[derive(Clone, Debug)]
struct PendingLaunch {
    at: Instant,
    synapse: Position,
    kind: PotentialKind,
    target: Position,
}

/// AI controlling one player.
#[derive(Debug)]
pub struct AudioKi {
    player: Arc<Player>,
    audio: AnalyzedAudio,
    ran: RandomGenerator,
    time_scale: f64,
    average_level: f64,
    max_activated_neurons: usize,
    minor: Option<bool>,
    economy: bool,
    above_average: Vec<BeatFrame>,
    strategies: Strategies,
    resource_tactics: VecDeque<ResourceKind>,
    resources_activated: BTreeSet<ResourceKind>,
    technology_tactics: VecDeque<TechKind>,
    building_tactics: BTreeMap<UnitKind, u32>,
    pending: Vec<PendingLaunch>,
}

impl AudioKi {
    /// Create an AI for `player` playing from `audio`.
    ///
    /// `time_scale` is the AI speed; delays between launches shrink with it.
    pub fn new(player: Arc<Player>, audio: AnalyzedAudio, time_scale: f64) -> Self {
        let mut ran = audio.generator(RandomMode::Note);
        let beats = audio.beats();
        let avg_bpm = beats.iter().map(|b| b.bpm).sum::<f64>() / beats.len().max(1) as f64;
        let minor_share = beats.iter().filter(|b| b.minor).count() as f64 / beats.len().max(1) as f64;
        let strategies = Strategies::draw(&mut ran);
        let mut ki = Self {
            player,
            average_level: audio.average_level(),
            audio,
            ran,
            time_scale: if time_scale > 0.0 { time_scale } else { 1.0 },
            max_activated_neurons: ((avg_bpm / 20.0).round() as usize).clamp(3, 12),
            minor: None,
            economy: minor_share > 0.5,
            above_average: Vec::new(),
            strategies,
            resource_tactics: VecDeque::new(),
            resources_activated: BTreeSet::new(),
            technology_tactics: VecDeque::new(),
            building_tactics: BTreeMap::new(),
            pending: Vec::new(),
        };
        ki.set_up_tactics();
        info!(
            player = %ki.player.name(),
            economy = ki.economy,
            max_activated = ki.max_activated_neurons,
            "ai ready"
        );
        ki
    }

    /// Controlled player.
    pub fn player(&self) -> &Arc<Player> {
        &self.player
    }

    /// Track the AI plays from.
    pub fn audio(&self) -> &AnalyzedAudio {
        &self.audio
    }

    /// Current strategy weights.
    pub fn strategies(&self) -> &Strategies {
        &self.strategies
    }

    /// Playing economy tactics (else battle tactics).
    pub fn is_economy(&self) -> bool {
        self.economy
    }

    /// Activator cap, from the track's tempo.
    pub fn max_activated_neurons(&self) -> usize {
        self.max_activated_neurons
    }

    /// Launches queued but not yet due.
    pub fn pending_launches(&self) -> usize {
        self.pending.len()
    }

    /// Next resources to activate, in order.
    pub fn resource_tactics(&self) -> Vec<ResourceKind> {
        self.resource_tactics.iter().copied().collect()
    }

    /// Next technologies to research, in order.
    pub fn technology_tactics(&self) -> Vec<TechKind> {
        self.technology_tactics.iter().copied().collect()
    }

    fn set_up_tactics(&mut self) {
        if self.economy {
            self.set_economy_tactics();
        } else {
            self.set_battle_tactics();
        }
    }

    fn set_battle_tactics(&mut self) {
        use ResourceKind::*;
        use TechKind::*;
        self.set_resource_tactics(&[Potassium, Glutamate, Chloride, Dopamine, Serotonin]);
        self.technology_tactics = [Swarm, AtkPotential, AtkSpeed, Target, Way, AtkPotential, Target, AtkDuration, Swarm, DefSpeed, NucleusRange]
            .into_iter()
            .collect();
        self.building_tactics = BTreeMap::from([(UnitKind::Synapse, 3), (UnitKind::ActivatedNeuron, 2)]);
    }

    fn set_economy_tactics(&mut self) {
        use ResourceKind::*;
        use TechKind::*;
        self.set_resource_tactics(&[Potassium, Chloride, Glutamate, Serotonin, Dopamine]);
        self.technology_tactics = [TotalResource, Curve, DefPotential, DefSpeed, TotalOxygen, NucleusRange, Way, Target, AtkPotential, Curve, TotalResource]
            .into_iter()
            .collect();
        self.building_tactics = BTreeMap::from([(UnitKind::Synapse, 1), (UnitKind::ActivatedNeuron, 3)]);
    }

    fn set_resource_tactics(&mut self, order: &[ResourceKind]) {
        let activated = &self.resources_activated;
        self.resource_tactics = order.iter().copied().filter(|r| !activated.contains(r)).collect();
    }

    // =========================================================================
    // BEAT
    // =========================================================================

    /// Decide on one beat of the AI's track.
    #[instrument(skip(self, frame), fields(player = %self.player.name()))]
    pub fn do_action(&mut self, frame: &BeatFrame, now: Instant) -> Vec<GameEventData> {
        let mut events = Vec::new();
        if self.player.has_lost() {
            return events;
        }

        if self.minor.is_some_and(|m| m != frame.minor) && frame.minor != self.economy {
            self.economy = frame.minor;
            self.set_up_tactics();
            debug!(economy = self.economy, "tactics rebalanced");
        }
        self.minor = Some(frame.minor);

        if frame.level > self.average_level {
            self.above_average.push(frame.clone());
            if self.above_average.len() >= ATTACK_BUFFER {
                self.launch_attack(now);
                self.above_average.clear();
            }
        }

        events.extend(self.handle_iron(now));
        events.extend(self.new_technology());
        let building = pick_strategy(&mut self.ran, &self.building_tactics);
        events.extend(self.create_synapses(building, now));
        events.extend(self.create_activated_neuron(building, now));
        events.extend(self.defend(now));
        events.extend(self.handle_high_bound(now));
        events
    }

    /// Fire every queued launch that is due. Returns the potentials launched.
    pub fn launch_due(&mut self, now: Instant) -> usize {
        let (due, later): (Vec<_>, Vec<_>) = self.pending.drain(..).partition(|p| p.at <= now);
        self.pending = later;
        let mut launched = 0;
        for launch in due {
            let result = self
                .player
                .aim_synapse(launch.synapse, launch.kind, launch.target)
                .and_then(|_| self.player.add_potential(launch.synapse, launch.kind, now));
            match result {
                Ok(n) => launched += n,
                Err(e) => debug!(synapse = %launch.synapse, error = %e, "launch dropped"),
            }
        }
        launched
    }

    fn delay(&self, ms: i64) -> Duration {
        Duration::from_secs_f64(ms.max(0) as f64 / 1000.0 / self.time_scale)
    }

    fn enemy(&self) -> Option<Arc<Player>> {
        self.player.enemies().into_iter().find(|e| !e.has_lost())
    }

    fn free_synapses(&self) -> Vec<Position> {
        self.player
            .positions_of_neurons(Some(UnitKind::Synapse))
            .into_iter()
            .filter(|p| !self.player.is_neuron_blocked(*p))
            .collect()
    }

    // =========================================================================
    // ECONOMY
    // =========================================================================

    fn handle_iron(&mut self, now: Instant) -> Vec<GameEventData> {
        let resources = self.player.resources();
        while let Some(&next) = self.resource_tactics.front() {
            if !resources.get(next).active {
                break;
            }
            self.resources_activated.insert(next);
            self.resource_tactics.pop_front();
        }
        let Some(&next) = self.resource_tactics.front() else {
            return Vec::new();
        };
        if resources.get(ResourceKind::Iron).cur < 1.0 {
            return self.low_iron_resource_distribution(next, now);
        }
        self.distribute_iron(next, now)
    }

    fn distribute_iron(&mut self, kind: ResourceKind, now: Instant) -> Vec<GameEventData> {
        match self.player.distribute_iron(kind, now) {
            Ok(IronChange::Activated(pos)) => {
                debug!(resource = kind.name(), "resource activated");
                self.resources_activated.insert(kind);
                if self.resource_tactics.front() == Some(&kind) {
                    self.resource_tactics.pop_front();
                }
                pos.map(|pos| GameEventData::NeuronBuilt {
                    player: self.player.name().to_string(),
                    pos,
                    unit: UnitKind::ResourceNeuron,
                })
                .into_iter()
                .collect()
            }
            Ok(_) => Vec::new(),
            Err(e) => {
                debug!(resource = kind.name(), error = %e, "iron not distributed");
                Vec::new()
            }
        }
    }

    /// Out of iron: free the iron of a well-stocked resource for `next`.
    fn low_iron_resource_distribution(&mut self, next: ResourceKind, now: Instant) -> Vec<GameEventData> {
        let resources = self.player.resources();
        if resources.get(next).cur > PLENTIFUL {
            return Vec::new();
        }
        let donor = resources
            .iter()
            .filter(|(k, _)| *k != ResourceKind::Oxygen && *k != ResourceKind::Iron && *k != next)
            .filter(|(_, r)| r.active && r.boost >= 2 && r.cur > PLENTIFUL)
            .max_by(|a, b| a.1.cur.total_cmp(&b.1.cur))
            .map(|(k, _)| k);
        let Some(donor) = donor else {
            return Vec::new();
        };
        match self.player.remove_iron(donor) {
            Ok(_) => {
                info!(from = donor.name(), to = next.name(), "iron moved");
                self.resources_activated.remove(&donor);
                let at = self.resource_tactics.len().min(1);
                self.resource_tactics.insert(at, donor);
                self.distribute_iron(next, now)
            }
            Err(e) => {
                debug!(error = %e, "iron not removed");
                Vec::new()
            }
        }
    }

    fn new_technology(&mut self) -> Vec<GameEventData> {
        let techs = self.player.technologies();
        while let Some(&tech) = self.technology_tactics.front() {
            if techs.can_advance(tech) {
                break;
            }
            self.technology_tactics.pop_front();
        }
        let Some(&tech) = self.technology_tactics.front() else {
            return Vec::new();
        };
        if !self.player.missing_for_technology(tech).is_empty() {
            return Vec::new();
        }
        match self.player.add_technology(tech) {
            Ok(level) => {
                self.technology_tactics.pop_front();
                vec![GameEventData::TechnologyResearched {
                    player: self.player.name().to_string(),
                    technology: tech,
                    level,
                }]
            }
            Err(e) => {
                debug!(?tech, error = %e, "technology not researched");
                Vec::new()
            }
        }
    }

    // =========================================================================
    // BUILDING
    // =========================================================================

    fn build(&mut self, pos: Position, unit: UnitKind, now: Instant) -> Option<GameEventData> {
        let enemy_nucleus = self.enemy().map(|e| e.nucleus_pos());
        let ipsp_target = self.enemy().and_then(|e| e.random_neuron());
        match self.player.add_neuron(pos, unit, enemy_nucleus, ipsp_target, now) {
            Ok(()) => Some(GameEventData::NeuronBuilt {
                player: self.player.name().to_string(),
                pos,
                unit,
            }),
            Err(e) => {
                debug!(%pos, ?unit, error = %e, "not built");
                None
            }
        }
    }

    /// Free cell in range of the main nucleus for a new neuron.
    fn build_position(&mut self, focus: Focus, near: Option<Position>) -> Option<Position> {
        let nucleus = self.player.nucleus_pos();
        let candidates = self
            .player
            .field()
            .all_in_range(nucleus, self.player.cur_range() as f64, 1.0, true);
        if candidates.is_empty() {
            return None;
        }
        match focus {
            Focus::Front => {
                let toward = near.or_else(|| self.enemy().map(|e| e.nucleus_pos()))?;
                sort_by_distance(toward, candidates).first().copied()
            }
            Focus::Surround => {
                let own = self.player.positions_of_neurons(Some(UnitKind::ActivatedNeuron));
                if own.is_empty() {
                    return self.ran.choose(&candidates).copied();
                }
                let spread = |p: &Position| own.iter().map(|o| o.distance(*p)).fold(f64::MAX, f64::min);
                candidates.iter().copied().max_by(|a, b| spread(a).total_cmp(&spread(b)))
            }
        }
    }

    fn create_synapses(&mut self, building: Option<UnitKind>, now: Instant) -> Vec<GameEventData> {
        let synapses = self.player.positions_of_neurons(Some(UnitKind::Synapse)).len();
        let max_synapses = (self.max_activated_neurons / 3).max(1);
        let wanted = synapses == 0 || (building == Some(UnitKind::Synapse) && synapses < max_synapses);
        if !wanted || !self.player.missing_for_unit(UnitKind::Synapse).is_empty() {
            return Vec::new();
        }
        let focus = top_strategy(&self.strategies.ipsp_epsp).unwrap_or(Focus::Front);
        let Some(pos) = self.build_position(focus, None) else {
            return Vec::new();
        };
        self.build(pos, UnitKind::Synapse, now).into_iter().collect()
    }

    fn create_activated_neuron(&mut self, building: Option<UnitKind>, now: Instant) -> Vec<GameEventData> {
        let activators = self.player.positions_of_neurons(Some(UnitKind::ActivatedNeuron)).len();
        if building != Some(UnitKind::ActivatedNeuron)
            || activators >= self.max_activated_neurons
            || !self.player.missing_for_unit(UnitKind::ActivatedNeuron).is_empty()
        {
            return Vec::new();
        }
        let focus = top_strategy(&self.strategies.activated_neurons).unwrap_or(Focus::Surround);
        let Some(pos) = self.build_position(focus, None) else {
            return Vec::new();
        };
        self.build(pos, UnitKind::ActivatedNeuron, now).into_iter().collect()
    }

    // =========================================================================
    // ATTACK
    // =========================================================================

    /// IPSPs affordable now.
    pub fn available_ipsps(&self) -> usize {
        let r = self.player.resources();
        let by_potassium = r.get(ResourceKind::Potassium).cur / 3.4;
        let by_chloride = r.get(ResourceKind::Chloride).cur / 6.8;
        (by_potassium.min(by_chloride).max(0.0) as usize).min(MAX_IPSPS_PER_ATTACK)
    }

    /// EPSPs affordable once `ipsps` IPSPs are paid for.
    pub fn available_epsps(&self, ipsps: usize) -> usize {
        let potassium = self.player.resources().get(ResourceKind::Potassium).cur - ipsps as f64 * 3.4;
        ((potassium / 4.4).max(0.0) as usize).min(MAX_EPSPS_PER_ATTACK)
    }

    /// Enemy cells for an EPSP attack, best first.
    fn epsp_targets(&self, enemy: &Player, kind: EpspTarget, from: Position) -> Vec<Position> {
        if kind == EpspTarget::Nucleus {
            return vec![enemy.nucleus_pos()];
        }
        let activators = enemy.positions_of_neurons(Some(UnitKind::ActivatedNeuron));
        let mut targets = sort_by_distance(from, enemy.positions_of_neurons(Some(kind.unit())));
        if kind != EpspTarget::Activator {
            // least defended first
            targets.sort_by_key(|t| activated_neurons_on_way(&activators, &[*t]).len());
        }
        targets
    }

    /// Enemy cell for the IPSPs covering an attack along `way`.
    fn ipsp_target(&mut self, enemy: &Player, from: Position, way: &[Position]) -> Option<Position> {
        let first = pick_strategy(&mut self.ran, &self.strategies.ipsp_targets);
        let order = first
            .into_iter()
            .chain(sort_strategy(&self.strategies.ipsp_targets))
            .collect::<Vec<_>>();
        for kind in order {
            let found = match kind {
                IpspTarget::Activator => {
                    let activators = enemy.positions_of_neurons(Some(UnitKind::ActivatedNeuron));
                    sort_by_distance(from, activated_neurons_on_way(&activators, way))
                        .first()
                        .copied()
                }
                IpspTarget::Synapse => enemy.closest_neuron(from, UnitKind::Synapse),
                IpspTarget::Resource => enemy.closest_neuron(from, UnitKind::ResourceNeuron),
            };
            if found.is_some() {
                return found;
            }
        }
        None
    }

    /// EPSPs needed to destroy the neuron at `target`.
    fn epsps_needed(&self, enemy: &Player, target: Position) -> usize {
        let techs = self.player.technologies();
        let damage = PotentialParams::epsp(techs.level(TechKind::AtkPotential), 0).potential.max(1);
        enemy
            .neuron(target)
            .map(|n| {
                use crate::game::neuron::NeuronCommon;
                let left = (n.max_voltage() - n.voltage()).max(1);
                ((left + damage - 1) / damage) as usize
            })
            .unwrap_or(MAX_EPSPS_PER_ATTACK)
    }

    /// Way-point through the section center with the fewest enemy activators.
    fn find_best_way_points(&self, enemy: &Player, synapse: Position, target: Position, direct: &[Position]) {
        if self.player.technologies().level(TechKind::Way) == 0 {
            return;
        }
        let activators = enemy.positions_of_neurons(Some(UnitKind::ActivatedNeuron));
        let field = self.player.field();
        let mut best = (activated_neurons_on_way(&activators, direct).len(), direct.len(), None);
        for center in field.center_positions_of_sections() {
            let Ok(way) = field.get_way_for_soldier(synapse, &[center, target]) else {
                continue;
            };
            let score = (activated_neurons_on_way(&activators, &way).len(), way.len(), Some(center));
            if (score.0, score.1) < (best.0, best.1) {
                best = score;
            }
        }
        if let Some(center) = best.2 {
            if let Err(e) = self.player.reset_way_for_synapse(synapse, center) {
                debug!(error = %e, "way-point not set");
            }
        }
    }

    /// Queue an attack on the best target reachable from a free synapse.
    fn launch_attack(&mut self, now: Instant) {
        let Some(enemy) = self.enemy() else {
            return;
        };
        let synapses = self.free_synapses();
        if synapses.is_empty() {
            return;
        }
        let kind = pick_strategy(&mut self.ran, &self.strategies.epsp_targets).unwrap_or(EpspTarget::Nucleus);
        let mut targets = self.epsp_targets(&enemy, kind, synapses[0]);
        targets.push(enemy.nucleus_pos());

        let field = self.player.field().clone();
        let mut choice: Option<(Position, Position, Vec<Position>)> = None;
        for target in targets {
            for &synapse in &synapses {
                let Ok(way) = field.get_way_for_soldier(synapse, &[target]) else {
                    continue;
                };
                if choice.as_ref().map_or(true, |c| way.len() < c.2.len()) {
                    choice = Some((synapse, target, way));
                }
            }
            if choice.is_some() {
                break;
            }
        }
        let Some((synapse, target, way)) = choice else {
            return;
        };

        let mut ipsps = self.available_ipsps();
        let ipsp_target = if ipsps > 0 { self.ipsp_target(&enemy, synapse, &way) } else { None };
        if ipsp_target.is_none() {
            ipsps = 0;
        }
        let epsps = self.available_epsps(ipsps).min(self.epsps_needed(&enemy, target));
        if epsps == 0 {
            return;
        }

        self.find_best_way_points(&enemy, synapse, target, &way);
        let mut anchors = self.player.synapse_way_points(synapse, None);
        anchors.push(target);
        let epsp_len = field
            .get_way_for_soldier(synapse, &anchors)
            .map_or(way.len(), |w| w.len())
            .saturating_sub(1);
        let ipsp_len = ipsp_target
            .and_then(|t| field.get_way_for_soldier(synapse, &[t]).ok())
            .map_or(0, |w| w.len().saturating_sub(1));

        // swarm releases the whole attack at once
        if let Some(s) = self.player.synapse(synapse) {
            let want_swarm = s.max_stored > 1 && epsps >= s.max_stored;
            if want_swarm != s.swarm {
                if let Err(e) = self.player.switch_swarm_attack(synapse) {
                    debug!(%synapse, error = %e, "swarm not switched");
                }
            }
        }

        let techs = self.player.technologies();
        let epsp_speed = PotentialParams::epsp(0, techs.level(TechKind::AtkSpeed)).speed_ms;
        let ipsp_speed = PotentialParams::ipsp(0, techs.level(TechKind::AtkSpeed), 0).speed_ms;
        let (ipsp_delay, epsp_delay) = synch_attacks(epsp_len, epsp_speed, ipsp_len, ipsp_speed);

        if let Some(ipsp_target) = ipsp_target {
            for i in 0..ipsps {
                self.pending.push(PendingLaunch {
                    at: now + self.delay(ipsp_delay + i as i64 * LAUNCH_SPACING_MS),
                    synapse,
                    kind: PotentialKind::Ipsp,
                    target: ipsp_target,
                });
            }
        }
        for i in 0..epsps {
            self.pending.push(PendingLaunch {
                at: now + self.delay(epsp_delay + i as i64 * LAUNCH_SPACING_MS),
                synapse,
                kind: PotentialKind::Epsp,
                target,
            });
        }
        info!(%synapse, %target, ?kind, epsps, ipsps, "attack queued");
    }

    // =========================================================================
    // DEFENSE
    // =========================================================================

    /// Enemy EPSPs heading for the own territory.
    fn incoming(&self, enemy: &Player) -> Vec<PotentialView> {
        let nucleus = self.player.nucleus_pos();
        let radius = self.player.cur_range() as f64 + THREAT_MARGIN;
        enemy
            .potentials()
            .into_iter()
            .filter(|p| p.id.kind == PotentialKind::Epsp)
            .filter(|p| p.way.last().copied().unwrap_or(p.pos).distance(nucleus) <= radius)
            .collect()
    }

    fn defend(&mut self, now: Instant) -> Vec<GameEventData> {
        let Some(enemy) = self.enemy() else {
            return Vec::new();
        };
        let incoming = self.incoming(&enemy);
        let Some(threat) = self.ran.choose(&incoming).cloned() else {
            return Vec::new();
        };
        let mut way = vec![threat.pos];
        way.extend(threat.way.iter().copied());
        let activators = self.player.positions_of_neurons(Some(UnitKind::ActivatedNeuron));
        let covered = activated_neurons_on_way(&activators, &way).len();
        let missing = incoming.len().saturating_sub(covered * 2);
        if missing == 0 {
            return Vec::new();
        }
        debug!(incoming = incoming.len(), covered, "under attack");

        match top_strategy(&self.strategies.defence).unwrap_or(Focus::Front) {
            Focus::Front => {
                if self.ipsp_def(&enemy, missing, threat.pos, now) {
                    Vec::new()
                } else {
                    self.create_extra_activated_neurons(missing, &way, now)
                }
            }
            Focus::Surround => {
                let built = self.create_extra_activated_neurons(missing, &way, now);
                if built.is_empty() {
                    self.ipsp_def(&enemy, missing, threat.pos, now);
                }
                built
            }
        }
    }

    /// Block the enemy synapse closest to an incoming EPSP.
    fn ipsp_def(&mut self, enemy: &Player, count: usize, threat: Position, now: Instant) -> bool {
        let Some(target) = enemy.closest_neuron(threat, UnitKind::Synapse) else {
            return false;
        };
        let Some(&synapse) = sort_by_distance(target, self.free_synapses()).first() else {
            return false;
        };
        let n = count.min(self.available_ipsps());
        for i in 0..n {
            self.pending.push(PendingLaunch {
                at: now + self.delay(i as i64 * LAUNCH_SPACING_MS),
                synapse,
                kind: PotentialKind::Ipsp,
                target,
            });
        }
        n > 0
    }

    /// Build activators next to the path of an incoming EPSP.
    fn create_extra_activated_neurons(&mut self, count: usize, way: &[Position], now: Instant) -> Vec<GameEventData> {
        let mut events = Vec::new();
        for _ in 0..count.min(MAX_EXTRA_ACTIVATORS) {
            if !self.player.missing_for_unit(UnitKind::ActivatedNeuron).is_empty() {
                break;
            }
            let nucleus = self.player.nucleus_pos();
            let candidates = self
                .player
                .field()
                .all_in_range(nucleus, self.player.cur_range() as f64, 1.0, true);
            let closest = candidates.into_iter().min_by(|a, b| {
                let da = way.iter().map(|w| w.distance(*a)).fold(f64::MAX, f64::min);
                let db = way.iter().map(|w| w.distance(*b)).fold(f64::MAX, f64::min);
                da.total_cmp(&db)
            });
            let Some(pos) = closest else {
                break;
            };
            match self.build(pos, UnitKind::ActivatedNeuron, now) {
                Some(event) => events.push(event),
                None => break,
            }
        }
        events
    }

    // =========================================================================
    // HIGH BOUND
    // =========================================================================

    /// A resource is stuck at its limit: raise limits, move iron, or attack.
    fn handle_high_bound(&mut self, now: Instant) -> Vec<GameEventData> {
        let resources = self.player.resources();
        let stuck = if resources.get(ResourceKind::Oxygen).bound > HIGH_BOUND_OXYGEN {
            Some(ResourceKind::Oxygen)
        } else {
            resources
                .iter()
                .filter(|(k, r)| *k != ResourceKind::Oxygen && r.bound > HIGH_BOUND)
                .max_by(|a, b| a.1.bound.total_cmp(&b.1.bound))
                .map(|(k, _)| k)
        };
        let Some(kind) = stuck else {
            return Vec::new();
        };

        if self.player.missing_for_technology(TechKind::TotalResource).is_empty() {
            if let Ok(level) = self.player.add_technology(TechKind::TotalResource) {
                return vec![GameEventData::TechnologyResearched {
                    player: self.player.name().to_string(),
                    technology: TechKind::TotalResource,
                    level,
                }];
            }
        }
        if resources.get(kind).boost > 0 && self.player.remove_iron(kind).is_ok() {
            debug!(resource = kind.name(), "iron removed from stuck resource");
            return Vec::new();
        }

        let Some(enemy) = self.enemy() else {
            return Vec::new();
        };
        let Some(&synapse) = self.free_synapses().first() else {
            return Vec::new();
        };
        let Some(target) = enemy.closest_neuron(synapse, UnitKind::Synapse) else {
            return Vec::new();
        };
        for i in 0..self.available_epsps(0) {
            self.pending.push(PendingLaunch {
                at: now + self.delay(i as i64 * LAUNCH_SPACING_MS),
                synapse,
                kind: PotentialKind::Epsp,
                target,
            });
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::game::field::Field;

    fn beat(time: u64, level: f64, minor: bool) -> BeatFrame {
        BeatFrame { time, bpm: 120.0, level, notes: vec![60, 64], off_note: true, minor }
    }

    fn track(minor: bool) -> AnalyzedAudio {
        let beats = (0..16).map(|i| beat(i * 500, if i % 2 == 0 { 0.2 } else { 0.8 }, minor)).collect();
        AnalyzedAudio::from_frames("ai-test.mp3", beats).unwrap()
    }

    /// AI at (5,3) against a human at (5,26).
    fn duel(minor: bool) -> (AudioKi, Arc<Player>) {
        let audio = track(minor);
        let ran = Arc::new(Mutex::new(audio.generator(RandomMode::Note)));
        let mut rows = vec![".".repeat(30); 11];
        rows[5].replace_range(3..4, "D");
        rows[5].replace_range(26..27, "D");
        rows[3].replace_range(3..4, "k");
        let rows: Vec<&str> = rows.iter().map(String::as_str).collect();
        let field = Arc::new(Field::from_rows(&rows));
        let now = Instant::now();
        let ai = Arc::new(Player::new("AI (ai-test)", 1, Position::new(5, 3), field.clone(), ran.clone(), now));
        let human = Arc::new(Player::new("bob", 2, Position::new(5, 26), field, ran, now));
        ai.set_enemies(vec![Arc::downgrade(&human)]);
        human.set_enemies(vec![Arc::downgrade(&ai)]);
        (AudioKi::new(ai, audio, 1.0), human)
    }

    fn rich(player: &Player) {
        for kind in ResourceKind::ALL {
            player.set_resource(kind, 60.0);
        }
    }

    #[test]
    fn test_sort_strategy() {
        let m = BTreeMap::from([(Focus::Front, 2), (Focus::Surround, 7)]);
        assert_eq!(sort_strategy(&m), vec![Focus::Surround, Focus::Front]);
        assert_eq!(top_strategy(&m), Some(Focus::Surround));
        let tie = BTreeMap::from([(Focus::Front, 3), (Focus::Surround, 3)]);
        assert_eq!(top_strategy(&tie), Some(Focus::Front));
        assert_eq!(top_strategy::<Focus>(&BTreeMap::new()), None);
    }

    #[test]
    fn test_synch_attacks() {
        // IPSP slower: hold the EPSPs back
        assert_eq!(synch_attacks(10, 370, 10, 420), (0, 600));
        // EPSPs far slower: hold the IPSPs back
        assert_eq!(synch_attacks(20, 370, 2, 420), (6460, 0));
    }

    #[test]
    fn test_activated_neurons_on_way() {
        let way = [Position::new(0, 0), Position::new(0, 1), Position::new(0, 2)];
        let neurons = [Position::new(2, 2), Position::new(3, 0), Position::new(0, 5)];
        assert_eq!(activated_neurons_on_way(&neurons, &way), vec![Position::new(2, 2)]);
    }

    #[test]
    fn test_tactics_follow_interval() {
        let (battle, _) = duel(false);
        assert!(!battle.is_economy());
        assert_eq!(battle.technology_tactics()[0], TechKind::Swarm);
        let (economy, _) = duel(true);
        assert!(economy.is_economy());
        assert_eq!(economy.technology_tactics()[0], TechKind::TotalResource);
        assert_eq!(economy.max_activated_neurons(), 6);
    }

    #[test]
    fn test_interval_change_rebalances() {
        let (mut ki, _) = duel(false);
        let now = Instant::now();
        ki.do_action(&beat(0, 0.1, false), now);
        assert!(!ki.is_economy());
        ki.do_action(&beat(500, 0.1, true), now);
        assert!(ki.is_economy());
    }

    #[test]
    fn test_first_iron_goes_to_potassium() {
        let (mut ki, _) = duel(false);
        let now = Instant::now();
        let ai = ki.player().clone();
        ai.set_resource(ResourceKind::Iron, 2.0);
        let mut events = ki.do_action(&beat(0, 0.1, false), now);
        assert_eq!(ai.resources().get(ResourceKind::Potassium).boost, 1);
        events.extend(ki.do_action(&beat(500, 0.1, false), now));
        let potassium = ai.resources().get(ResourceKind::Potassium).clone();
        assert!(potassium.active);
        assert_eq!(potassium.boost, 2);
        assert!(events.iter().any(|e| matches!(e, GameEventData::NeuronBuilt { unit: UnitKind::ResourceNeuron, .. })));
        assert_eq!(ki.resource_tactics()[0], ResourceKind::Glutamate);
    }

    #[test]
    fn test_builds_first_synapse() {
        let (mut ki, _) = duel(false);
        let now = Instant::now();
        let ai = ki.player().clone();
        rich(&ai);
        ki.do_action(&beat(0, 0.1, false), now);
        let synapses = ai.positions_of_neurons(Some(UnitKind::Synapse));
        assert_eq!(synapses.len(), 1);
        assert!(synapses[0].distance(ai.nucleus_pos()) <= ai.cur_range() as f64);
    }

    #[test]
    fn test_loud_beats_launch_attack() {
        let (mut ki, human) = duel(false);
        let now = Instant::now();
        let ai = ki.player().clone();
        rich(&ai);
        ki.do_action(&beat(0, 0.1, false), now);
        assert!(!ai.positions_of_neurons(Some(UnitKind::Synapse)).is_empty());

        for i in 1..=ATTACK_BUFFER as u64 {
            ki.do_action(&beat(i * 500, 0.9, false), now);
        }
        assert!(ki.pending_launches() > 0);
        let launched = ki.launch_due(now + Duration::from_secs(30));
        assert!(launched > 0);
        assert_eq!(ki.pending_launches(), 0);
        assert!(!ai.potentials().is_empty());
        assert!(!human.has_lost());
    }

    #[test]
    fn test_swarm_only_on_storing_synapses() {
        let (mut ki, _) = duel(false);
        let now = Instant::now();
        let ai = ki.player().clone();
        rich(&ai);
        ki.do_action(&beat(0, 0.1, false), now);
        for i in 1..=ATTACK_BUFFER as u64 {
            rich(&ai);
            ki.do_action(&beat(i * 500, 0.9, false), now);
        }
        let synapses = ai.positions_of_neurons(Some(UnitKind::Synapse));
        assert!(!synapses.is_empty());
        for pos in synapses {
            let s = ai.synapse(pos).unwrap();
            assert!(!s.swarm || s.max_stored > 1);
        }
    }

    #[test]
    fn test_researches_planned_technology() {
        let (mut ki, _) = duel(false);
        let ai = ki.player().clone();
        rich(&ai);
        let events = ki.do_action(&beat(0, 0.1, false), Instant::now());
        assert_eq!(ai.technologies().level(TechKind::Swarm), 1);
        assert!(events.iter().any(|e| matches!(e, GameEventData::TechnologyResearched { technology: TechKind::Swarm, .. })));
        assert_eq!(ki.technology_tactics()[0], TechKind::AtkPotential);
    }

    #[test]
    fn test_lost_player_does_nothing() {
        let (mut ki, _) = duel(false);
        let ai = ki.player().clone();
        rich(&ai);
        ai.resign();
        assert!(ki.do_action(&beat(0, 0.9, false), Instant::now()).is_empty());
        assert!(ai.positions_of_neurons(Some(UnitKind::Synapse)).is_empty());
    }
}
