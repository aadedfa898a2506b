//! Game Events
//!
//! Events produced by the beat and render steps, for logging and for the
//! views. A step returns its events sorted so the order is reproducible.

use serde::{Serialize, Deserialize};

use crate::core::Position;
use crate::game::costs::UnitKind;
use crate::game::technology::TechKind;

/// Priority for event processing order.
///
/// Lower value = processed first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventPriority {
    /// Player losses processed first
    PlayerLoss = 0,
    /// Then destroyed neurons
    NeuronLoss = 1,
    /// Then potential collisions
    Collision = 2,
    /// Then activator shots
    Defense = 3,
    /// Then arrivals
    Arrival = 4,
    /// Lowest priority
    Other = 255,
}

/// Game event data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GameEventData {
    /// Player has lost
    PlayerLost {
        /// Loser
        player: String,
        /// Message sent to the player
        reason: String,
    },

    /// A neuron was destroyed (or pruned after its nucleus fell)
    NeuronDestroyed {
        /// Owner
        player: String,
        /// Cell
        pos: Position,
        /// Kind
        unit: UnitKind,
    },

    /// An IPSP swallowed one point of an enemy EPSP
    EpspSwallowed {
        /// Owner of the IPSP
        player: String,
        /// Cell
        pos: Position,
        /// The EPSP was used up
        removed: bool,
    },

    /// An activator fired at an enemy potential
    PotentialNeutralized {
        /// Owner of the activator
        player: String,
        /// Activator cell
        pos: Position,
        /// Potential hit
        target: String,
    },

    /// An EPSP reached its target
    PotentialArrived {
        /// Owner of the EPSP
        player: String,
        /// Target cell
        pos: Position,
        /// Damage dealt
        amount: i32,
    },

    /// A neuron was built
    NeuronBuilt {
        /// Owner
        player: String,
        /// Cell
        pos: Position,
        /// Kind
        unit: UnitKind,
    },

    /// A technology level was bought
    TechnologyResearched {
        /// Buyer
        player: String,
        /// Technology
        technology: TechKind,
        /// New level
        level: u8,
    },

    /// Game status changed
    StatusChanged {
        /// Previous status
        old_status: String,
        /// New status
        new_status: String,
    },

    /// Game ended
    GameEnded {
        /// Last player standing, if any
        winner: Option<String>,
        /// Render steps run
        duration_ticks: u64,
    },
}

impl GameEventData {
    /// Priority class of this event.
    pub fn priority(&self) -> EventPriority {
        match self {
            GameEventData::PlayerLost { .. } => EventPriority::PlayerLoss,
            GameEventData::NeuronDestroyed { .. } => EventPriority::NeuronLoss,
            GameEventData::EpspSwallowed { .. } => EventPriority::Collision,
            GameEventData::PotentialNeutralized { .. } => EventPriority::Defense,
            GameEventData::PotentialArrived { .. } => EventPriority::Arrival,
            _ => EventPriority::Other,
        }
    }

    /// Player the event is about.
    pub fn player(&self) -> Option<&str> {
        match self {
            GameEventData::PlayerLost { player, .. }
            | GameEventData::NeuronDestroyed { player, .. }
            | GameEventData::EpspSwallowed { player, .. }
            | GameEventData::PotentialNeutralized { player, .. }
            | GameEventData::PotentialArrived { player, .. }
            | GameEventData::NeuronBuilt { player, .. }
            | GameEventData::TechnologyResearched { player, .. } => Some(player),
            GameEventData::GameEnded { winner, .. } => winner.as_deref(),
            GameEventData::StatusChanged { .. } => None,
        }
    }
}

/// A game event with timing and priority.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GameEvent {
    /// Render step when the event occurred
    pub tick: u64,

    /// Processing priority
    pub priority: EventPriority,

    /// Player involved (for tie-breaking)
    pub player: Option<String>,

    /// Event data
    pub data: GameEventData,
}

impl GameEvent {
    /// Create a new event; priority and player come from the data.
    pub fn new(tick: u64, data: GameEventData) -> Self {
        Self {
            tick,
            priority: data.priority(),
            player: data.player().map(str::to_string),
            data,
        }
    }

    /// Create player lost event.
    pub fn player_lost(tick: u64, player: &str, reason: &str) -> Self {
        Self::new(
            tick,
            GameEventData::PlayerLost {
                player: player.to_string(),
                reason: reason.to_string(),
            },
        )
    }

    /// Create status changed event.
    pub fn status_changed(tick: u64, old_status: impl ToString, new_status: impl ToString) -> Self {
        Self::new(
            tick,
            GameEventData::StatusChanged {
                old_status: old_status.to_string(),
                new_status: new_status.to_string(),
            },
        )
    }

    /// Create game ended event.
    pub fn game_ended(tick: u64, winner: Option<String>) -> Self {
        Self::new(tick, GameEventData::GameEnded { winner, duration_ticks: tick })
    }
}

impl PartialEq for GameEvent {
    fn eq(&self, other: &Self) -> bool {
        self.tick == other.tick && self.priority == other.priority && self.player == other.player
    }
}

impl Eq for GameEvent {}

impl PartialOrd for GameEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GameEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.tick
            .cmp(&other.tick)
            .then(self.priority.cmp(&other.priority))
            .then(self.player.cmp(&other.player))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_ordering() {
        let lost = GameEvent::player_lost(5, "bob", "YOU LOST");
        let arrived = GameEvent::new(
            5,
            GameEventData::PotentialArrived { player: "alice".into(), pos: Position::new(1, 1), amount: 2 },
        );
        let earlier = GameEvent::game_ended(4, None);

        let mut events = vec![arrived.clone(), lost.clone(), earlier.clone()];
        events.sort();
        assert_eq!(events[0].tick, 4);
        assert_eq!(events[1].priority, EventPriority::PlayerLoss);
        assert_eq!(events[2].priority, EventPriority::Arrival);
    }

    #[test]
    fn test_player_from_data() {
        let e = GameEvent::game_ended(9, Some("alice".into()));
        assert_eq!(e.player.as_deref(), Some("alice"));
        let e = GameEvent::status_changed(1, "RUNNING", "CLOSING");
        assert_eq!(e.player, None);
        let json = serde_json::to_string(&e.data).unwrap();
        assert!(json.contains("\"event\":\"status_changed\""));
    }
}
