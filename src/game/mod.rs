//! Game Logic Module
//!
//! The simulation core. Nothing in here sleeps or touches the network;
//! every time-dependent operation takes `now` explicitly.
//!
//! ## Module Structure
//!
//! - `error`: Error taxonomy of player operations
//! - `costs`: Static cost catalog and unit parameters
//! - `resource`: Resource curve and iron distribution
//! - `technology`: Technology levels
//! - `graph`: Walkable graph and shortest paths
//! - `field`: Grid, hills, nuclei placement and overlays
//! - `neuron`: Neuron variants
//! - `potential`: EPSPs and IPSPs in flight
//! - `player`: Per-player state and operations
//! - `collision`: IPSP/EPSP encounters and stacked symbols
//! - `ai`: Audio-driven AI player
//! - `events`: Events produced by simulation steps
//! - `state`: Game status, mode and seat roster
//! - `tick`: Beat and render steps

pub mod error;
pub mod costs;
pub mod resource;
pub mod technology;
pub mod graph;
pub mod field;
pub mod neuron;
pub mod potential;
pub mod player;
pub mod collision;
pub mod ai;
pub mod events;
pub mod state;
pub mod tick;

// Re-export key types
pub use error::{GameError, GameResult};
pub use costs::UnitKind;
pub use resource::ResourceKind;
pub use technology::TechKind;
pub use field::Field;
pub use potential::PotentialKind;
pub use player::Player;
pub use ai::AudioKi;
pub use events::{GameEvent, GameEventData};
pub use state::{GameMode, GameState, GameStatus};
pub use tick::TickResult;
