//! Game Errors
//!
//! Every failure a player action can produce. None of these end the game
//! except `UnplayableMap` during setup; the rest are reported back to the
//! player as advisory messages.

use thiserror::Error;

use crate::core::Position;
use crate::game::costs::{Costs, UnitKind};
use crate::game::resource::ResourceKind;
use crate::game::technology::TechKind;

/// Errors from player and field operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GameError {
    /// Not enough resources for a build or research.
    #[error("Not enough resource! missing: {}", describe_missing(.0))]
    InsufficientResources(Costs),

    /// Cell is occupied, off-graph or outside range.
    #[error("invalid placement at {0}")]
    InvalidPlacement(Position),

    /// Player owns no synapse.
    #[error("No synapse!")]
    NoSynapse,

    /// Iron cannot be distributed to this resource.
    #[error("invalid resource: {0}")]
    InvalidResource(ResourceKind),

    /// Iron current is below one.
    #[error("Distribute iron: not enough iron!")]
    NotEnoughIron,

    /// Nothing distributed to this resource.
    #[error("Remove iron: no iron distributed to {0}!")]
    NoDistribution(ResourceKind),

    /// Field construction exhausted the denseness retries.
    #[error("Game cannot be played with this song, as map is unplayable.")]
    UnplayableMap,

    /// Section had no candidate cell for a nucleus.
    #[error("no free cell in section {0}")]
    EmptySection(usize),

    /// Analyzed audio stream is empty.
    #[error("audio unavailable")]
    AudioUnavailable,

    /// Player name not in this game.
    #[error("unknown player: {0}")]
    UnknownPlayer(String),

    /// No neuron (of the wanted kind) at a position.
    #[error("no {1} at {0}")]
    NoNeuron(Position, UnitKind),

    /// Synapse is blocked by an enemy IPSP.
    #[error("synapse at {0} is blocked")]
    SynapseBlocked(Position),

    /// No path between two cells.
    #[error("no path from {0} to {1}")]
    NoPath(Position, Position),

    /// Technology already fully researched.
    #[error("{0} already at max level")]
    MaxLevelReached(TechKind),

    /// Technology required for this action is missing.
    #[error("requires {0} level {1}")]
    TechnologyLocked(TechKind, u8),
}

/// Result alias for game operations.
pub type GameResult<T> = Result<T, GameError>;

/// Human readable missing-cost summary.
pub fn describe_missing(missing: &Costs) -> String {
    missing
        .iter()
        .map(|(kind, amount)| format!("Missing {amount:.1} {kind}!"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_message() {
        let mut missing = Costs::new();
        missing.insert(ResourceKind::Oxygen, 2.5);
        missing.insert(ResourceKind::Potassium, 6.6);
        let err = GameError::InsufficientResources(missing);
        assert_eq!(
            err.to_string(),
            "Not enough resource! missing: Missing 2.5 oxygen! Missing 6.6 potassium!"
        );
    }
}
