//! Protocol Messages
//!
//! Wire format between views and the server. Every message is a JSON
//! object `{command, data}`; inbound messages also carry the `username`
//! of the sending view.
//!
//! ```json
//! {"command": "add_iron", "username": "alice", "data": {"resource": "potassium"}}
//! {"command": "set_msg", "data": {"msg": "Distribute iron: done!"}}
//! ```

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Serialize, Deserialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::Position;
use crate::game::collision::stacked_potentials;
use crate::game::costs::UnitKind;
use crate::game::neuron::NeuronInfo;
use crate::game::player::{Player, SynapseOption};
use crate::game::resource::{Resource, ResourceKind};
use crate::game::state::{GameMode, GameState};
use crate::game::technology::{TechKind, TechLevel};

/// Color tag of cells owned by nobody.
pub const COLOR_DEFAULT: i32 = 0;
/// Color tag of active resource neurons.
pub const COLOR_RESOURCES: i32 = 3;

/// Errors decoding inbound messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Not a command object.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// `data` does not fit the command.
    #[error("invalid data for {command}: {source}")]
    InvalidData {
        /// Command name
        command: String,
        /// Decoding error
        #[source]
        source: serde_json::Error,
    },

    /// A field the command needs is absent.
    #[error("missing field {field} for {command}")]
    MissingField {
        /// Command name
        command: String,
        /// Field name
        field: &'static str,
    },

    /// No handler for the command.
    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

// =============================================================================
// VIEW -> SERVER
// =============================================================================

/// A command sent by a view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command name, e.g. `add_iron`
    pub command: String,
    /// Sending user
    #[serde(default)]
    pub username: String,
    /// Command payload
    #[serde(default)]
    pub data: Value,
}

impl Command {
    /// Create a command.
    pub fn new(command: impl Into<String>, username: impl Into<String>, data: Value) -> Self {
        Self {
            command: command.into(),
            username: username.into(),
            data,
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Decode `data` as the payload type of this command.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        T::deserialize(&self.data).map_err(|source| ProtocolError::InvalidData {
            command: self.command.clone(),
            source,
        })
    }

    /// Error for an absent optional field.
    pub fn missing(&self, field: &'static str) -> ProtocolError {
        ProtocolError::MissingField {
            command: self.command.clone(),
            field,
        }
    }
}

/// `initialize_game`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeGame {
    /// Map audio
    pub source_path: String,
    /// Base directory for analysis files
    #[serde(default)]
    pub base_path: Option<String>,
    /// Audio of the AI players
    #[serde(default)]
    pub ais: Vec<String>,
    /// How the game is played
    #[serde(default)]
    pub mode: GameMode,
    /// Field rows
    #[serde(default)]
    pub lines: Option<i32>,
    /// Field columns
    #[serde(default)]
    pub cols: Option<i32>,
    /// Seats of a multiplayer game
    #[serde(default)]
    pub num_players: Option<usize>,
}

/// `add_iron`, `remove_iron`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Target resource
    pub resource: ResourceKind,
}

/// `add_technology`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechnologyRequest {
    /// Technology to research
    pub technology: TechKind,
}

fn one() -> usize {
    1
}

/// `check_build_neuron`, `check_build_potential`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Unit to build
    pub unit: UnitKind,
    /// Number of potentials to launch
    #[serde(default = "one")]
    pub num: usize,
    /// Synapse to launch from
    #[serde(default)]
    pub start_pos: Option<Position>,
}

/// `build_neuron`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceNeuron {
    /// Neuron kind
    pub unit: UnitKind,
    /// Cell
    pub pos: Position,
}

/// One entry of `get_positions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PositionRequest {
    /// Own neurons (of one kind)
    Player {
        /// Kind filter
        #[serde(default)]
        unit: Option<UnitKind>,
    },
    /// Enemy neurons (of one kind)
    Enemy {
        /// Kind filter
        #[serde(default)]
        unit: Option<UnitKind>,
    },
    /// Centers of the field sections
    Center,
    /// Current target of a synapse
    Targets {
        /// Synapse
        pos: Position,
        /// `epsp` or `ipsp`
        unit: UnitKind,
    },
    /// Paths of both potential kinds from a synapse
    CurrentWay {
        /// Synapse
        pos: Position,
    },
    /// Way-points of a synapse
    CurrentWayPoints {
        /// Synapse
        pos: Position,
    },
}

/// `get_positions`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionsQuery {
    /// Requests, answered in order
    pub position_requests: Vec<PositionRequest>,
    /// Command name of the answer
    pub return_cmd: String,
}

/// `toggle_swarm_attack`, `set_way_point`, `set_ipsp_target`, `set_epsp_target`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynapseCommand {
    /// Synapse
    pub synapse_pos: Position,
    /// Way-point or target
    #[serde(default)]
    pub pos: Option<Position>,
    /// Way-point number (1 resets the way)
    #[serde(default)]
    pub num: Option<i32>,
}

// =============================================================================
// SERVER -> VIEW
// =============================================================================

/// A text for the view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    /// Text
    pub msg: String,
}

/// One neuron added or changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitUpdate {
    /// Kind
    pub unit: UnitKind,
    /// Cell
    pub pos: Position,
    /// Owner color
    pub color: i32,
}

/// Bulk neuron update (scouting, observers).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitsUpdate {
    /// Neurons
    pub neurons: Vec<NeuronInfo>,
    /// Owner color
    pub color: i32,
}

/// Answer to `set_way_point`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WayPointUpdate {
    /// Text
    pub msg: String,
    /// Synapse
    pub synapse_pos: Position,
    /// Next way-point number, or -1 after the last one
    pub num: i32,
}

/// Ask the view for the cell of a new neuron.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildNeuronPrompt {
    /// Neuron kind
    pub unit: UnitKind,
    /// The only nucleus, if there is exactly one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_pos: Option<Position>,
    /// All nuclei to pick from otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub positions: Option<Vec<Position>>,
    /// Build range around a nucleus
    pub range: i32,
}

/// Ask the view which synapse to launch from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPotentialPrompt {
    /// `epsp` or `ipsp`
    pub unit: UnitKind,
    /// Synapses
    pub positions: Vec<Position>,
    /// Potentials to launch
    pub num: usize,
}

/// Messages sent from server to view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full snapshot at game start
    InitGame(Transfer),
    /// Snapshot after each render step
    UpdateGame(Transfer),
    /// One neuron
    SetUnit(UnitUpdate),
    /// Several neurons of one owner
    SetUnits(UnitsUpdate),
    /// Advisory text
    SetMsg(Notice),
    /// Way-point progress
    SetWps(WayPointUpdate),
    /// Solicit a neuron position
    BuildNeuron(BuildNeuronPrompt),
    /// Solicit a synapse
    BuildPotential(BuildPotentialPrompt),
    /// Modal text
    PrintMsg(Notice),
    /// Terminal text
    GameEnd(Notice),
    /// Answer to `get_positions`, sent under the requested command name
    #[serde(skip)]
    Positions {
        /// Command name of the answer
        return_cmd: String,
        /// One list per request
        positions: Vec<Vec<Position>>,
    },
}

impl ServerMessage {
    /// `set_msg`
    pub fn set_msg(msg: impl Into<String>) -> Self {
        ServerMessage::SetMsg(Notice { msg: msg.into() })
    }

    /// `print_msg`
    pub fn print_msg(msg: impl Into<String>) -> Self {
        ServerMessage::PrintMsg(Notice { msg: msg.into() })
    }

    /// `game_end`
    pub fn game_end(msg: impl Into<String>) -> Self {
        ServerMessage::GameEnd(Notice { msg: msg.into() })
    }

    /// `set_unit`
    pub fn set_unit(unit: UnitKind, pos: Position, color: i32) -> Self {
        ServerMessage::SetUnit(UnitUpdate { unit, pos, color })
    }

    /// Command name on the wire.
    pub fn command(&self) -> &str {
        match self {
            ServerMessage::InitGame(_) => "init_game",
            ServerMessage::UpdateGame(_) => "update_game",
            ServerMessage::SetUnit(_) => "set_unit",
            ServerMessage::SetUnits(_) => "set_units",
            ServerMessage::SetMsg(_) => "set_msg",
            ServerMessage::SetWps(_) => "set_wps",
            ServerMessage::BuildNeuron(_) => "build_neuron",
            ServerMessage::BuildPotential(_) => "build_potential",
            ServerMessage::PrintMsg(_) => "print_msg",
            ServerMessage::GameEnd(_) => "game_end",
            ServerMessage::Positions { return_cmd, .. } => return_cmd,
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            ServerMessage::Positions { return_cmd, positions } => serde_json::to_string(&serde_json::json!({
                "command": return_cmd,
                "data": { "positions": positions },
            })),
            other => serde_json::to_string(other),
        }
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

// =============================================================================
// TRANSFER
// =============================================================================

/// Nucleus voltage and color of one player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerStatus {
    /// `voltage/max` of the main nucleus
    pub live: String,
    /// Color tag
    pub color: i32,
}

/// Stacked potentials on one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PotentialCell {
    /// Cell
    pub pos: Position,
    /// Stack symbol
    pub symbol: char,
    /// Owner color
    pub color: i32,
}

/// Menu of one synapse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynapseMenu {
    /// Synapse
    pub pos: Position,
    /// Options
    pub options: Vec<SynapseOption>,
}

/// Snapshot sent to the views after a render step.
///
/// The shared part is built once per step; [`Transfer::with_player`] adds
/// the viewing player's own resources, technologies and menus.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    /// Status per player name
    pub players: BTreeMap<String, PlayerStatus>,
    /// Neurons destroyed since the previous transfer
    pub new_dead_neurons: Vec<NeuronInfo>,
    /// Consumed share of the map audio
    pub audio_played: f64,
    /// Exported field rows (`init_game` only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<Vec<String>>,
    /// Walkable cells (`init_game` only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub graph_positions: Vec<Position>,
    /// Stacked potentials
    #[serde(default)]
    pub potentials: Vec<PotentialCell>,
    /// Own resources
    #[serde(default)]
    pub resources: BTreeMap<ResourceKind, Resource>,
    /// Own technologies
    #[serde(default)]
    pub technologies: BTreeMap<TechKind, TechLevel>,
    /// Which units are affordable
    #[serde(default)]
    pub build_options: BTreeMap<UnitKind, bool>,
    /// Menu per own synapse
    #[serde(default)]
    pub synapse_options: Vec<SynapseMenu>,
}

impl Transfer {
    /// Player-agnostic part of a snapshot.
    ///
    /// Drains every player's dead-neuron delta. `full` adds the field and
    /// the graph positions for `init_game`.
    pub fn shared(state: &GameState, audio_played: f64, full: bool) -> Self {
        let players = state.players();
        let mut transfer = Transfer {
            audio_played,
            ..Default::default()
        };
        for seat in state.seats() {
            transfer.players.insert(
                seat.name.clone(),
                PlayerStatus {
                    live: seat.player.nucleus_live(),
                    color: seat.player.color(),
                },
            );
            transfer.new_dead_neurons.extend(seat.player.take_new_dead_neurons());
        }
        transfer.potentials = stacked_potentials(&players)
            .into_iter()
            .map(|(pos, s)| PotentialCell { pos, symbol: s.symbol, color: s.color })
            .collect();
        if full {
            transfer.field = Some(state.field().export());
            transfer.graph_positions = state.field().graph_positions();
        }
        transfer
    }

    /// Add the data only `player` may see.
    pub fn with_player(mut self, player: &Player) -> Self {
        self.resources = player
            .resources()
            .iter()
            .map(|(kind, r)| (kind, r.clone()))
            .collect();
        self.technologies = player.technologies().iter().collect();
        self.build_options = player.build_options();
        self.synapse_options = player
            .positions_of_neurons(Some(UnitKind::Synapse))
            .into_iter()
            .filter_map(|pos| {
                player
                    .synapse_options(pos)
                    .ok()
                    .map(|options| SynapseMenu { pos, options })
            })
            .collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_roundtrip() {
        let cmd = Command::new("add_iron", "alice", json!({"resource": "potassium"}));
        let json = cmd.to_json().unwrap();
        let parsed = Command::from_json(&json).unwrap();
        assert_eq!(parsed, cmd);
        let req: ResourceRequest = parsed.payload().unwrap();
        assert_eq!(req.resource, ResourceKind::Potassium);
    }

    #[test]
    fn test_command_without_data() {
        let cmd = Command::from_json(r#"{"command": "resign", "username": "bob"}"#).unwrap();
        assert_eq!(cmd.command, "resign");
        assert!(cmd.data.is_null());
    }

    #[test]
    fn test_bad_payload() {
        let cmd = Command::new("add_technology", "alice", json!({"technology": "warp_drive"}));
        let err = cmd.payload::<TechnologyRequest>().unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidData { .. }));
        assert!(err.to_string().contains("add_technology"));
        assert!(Command::from_json("not json").is_err());
    }

    #[test]
    fn test_initialize_defaults() {
        let cmd = Command::new("initialize_game", "host", json!({"source_path": "song.mp3"}));
        let init: InitializeGame = cmd.payload().unwrap();
        assert_eq!(init.mode, GameMode::SinglePlayer);
        assert!(init.ais.is_empty());
        assert_eq!(init.lines, None);

        let cmd = Command::new(
            "initialize_game",
            "host",
            json!({"source_path": "a.mp3", "mode": "observer", "ais": ["b.mp3", "c.mp3"], "lines": 40, "cols": 80}),
        );
        let init: InitializeGame = cmd.payload().unwrap();
        assert_eq!(init.mode, GameMode::Observer);
        assert_eq!(init.ais.len(), 2);
        assert_eq!(init.cols, Some(80));
    }

    #[test]
    fn test_build_request_defaults_to_one() {
        let cmd = Command::new("check_build_potential", "a", json!({"unit": "epsp"}));
        let req: BuildRequest = cmd.payload().unwrap();
        assert_eq!(req.num, 1);
        assert_eq!(req.start_pos, None);

        let cmd = Command::new("check_build_potential", "a", json!({"unit": "ipsp", "num": 4, "start_pos": [3, 7]}));
        let req: BuildRequest = cmd.payload().unwrap();
        assert_eq!(req.num, 4);
        assert_eq!(req.start_pos, Some(Position::new(3, 7)));
    }

    #[test]
    fn test_position_requests() {
        let cmd = Command::new(
            "get_positions",
            "a",
            json!({
                "return_cmd": "select_target",
                "position_requests": [
                    {"type": "player", "unit": "synapse"},
                    {"type": "center"},
                    {"type": "targets", "pos": [1, 2], "unit": "ipsp"},
                    {"type": "current_way_points", "pos": [1, 2]}
                ]
            }),
        );
        let query: PositionsQuery = cmd.payload().unwrap();
        assert_eq!(query.position_requests.len(), 4);
        assert_eq!(query.position_requests[0], PositionRequest::Player { unit: Some(UnitKind::Synapse) });
        assert_eq!(query.position_requests[1], PositionRequest::Center);
    }

    #[test]
    fn test_server_message_format() {
        let json = ServerMessage::set_msg("No synapse!").to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value, json!({"command": "set_msg", "data": {"msg": "No synapse!"}}));

        let msg = ServerMessage::set_unit(UnitKind::Synapse, Position::new(4, 9), 10);
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["command"], "set_unit");
        assert_eq!(value["data"]["unit"], "synapse");
        assert_eq!(value["data"]["pos"], json!([4, 9]));
        assert_eq!(ServerMessage::from_json(&msg.to_json().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_positions_use_return_cmd() {
        let msg = ServerMessage::Positions {
            return_cmd: "select_way_point".to_string(),
            positions: vec![vec![Position::new(0, 1)], vec![]],
        };
        assert_eq!(msg.command(), "select_way_point");
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"command": "select_way_point", "data": {"positions": [[[0, 1]], []]}}));
    }

    #[test]
    fn test_build_neuron_prompt_omits_unused() {
        let msg = ServerMessage::BuildNeuron(BuildNeuronPrompt {
            unit: UnitKind::ActivatedNeuron,
            start_pos: Some(Position::new(5, 5)),
            positions: None,
            range: 4,
        });
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["data"]["unit"], "activated_neuron");
        assert!(value["data"].get("positions").is_none());
        assert_eq!(value["data"]["range"], 4);
    }

    #[test]
    fn test_transfer_map_keys() {
        let mut transfer = Transfer::default();
        transfer.build_options.insert(UnitKind::Synapse, true);
        transfer.technologies.insert(TechKind::AtkSpeed, TechLevel { level: 1, max: 3 });
        let json = ServerMessage::UpdateGame(transfer).to_json().unwrap();
        assert!(json.contains("\"synapse\":true"));
        assert!(json.contains("\"atk_speed\""));
        assert!(!json.contains("\"field\""));
    }
}
