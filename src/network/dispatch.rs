//! Command Dispatch
//!
//! Maps an inbound command name to its handler. Handlers run synchronously
//! against the shared game state and return a [`Reply`]; anything that
//! needs to wait (staggered launches) or to reach other users is carried
//! out by the session.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use tracing::debug;

use crate::core::Position;
use crate::game::costs::UnitKind;
use crate::game::error::GameError;
use crate::game::player::Player;
use crate::game::potential::PotentialKind;
use crate::game::resource::IronChange;
use crate::game::state::GameState;
use crate::game::technology::TechKind;
use crate::network::protocol::{
    BuildNeuronPrompt, BuildPotentialPrompt, BuildRequest, Command, PlaceNeuron, PositionRequest,
    PositionsQuery, ProtocolError, ResourceRequest, ServerMessage, SynapseCommand, TechnologyRequest,
    WayPointUpdate, COLOR_DEFAULT, COLOR_RESOURCES,
};

/// Generic failure text.
pub const MSG_FAILED: &str = "Failed!";
/// Staggered launch finished.
pub const MSG_SUCCESS: &str = "Success!";

/// Everything a handler may touch.
pub struct HandlerContext<'a> {
    /// Running game
    pub state: &'a GameState,
    /// Sending player
    pub player: &'a Arc<Player>,
    /// Time of arrival
    pub now: Instant,
}

/// What the session does after a handler ran.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Messages for the sender
    Send(Vec<ServerMessage>),
    /// Launch `num` potentials from `synapse`, spaced out
    Launch {
        /// Synapse
        synapse: Position,
        /// Potential kind
        kind: PotentialKind,
        /// Count
        num: usize,
    },
    /// The sender gave up
    Resign,
}

impl Reply {
    fn one(msg: ServerMessage) -> Self {
        Reply::Send(vec![msg])
    }

    fn msg(text: impl Into<String>) -> Self {
        Reply::one(ServerMessage::set_msg(text))
    }
}

/// Signature of every handler.
pub type Handler = fn(&HandlerContext<'_>, &Command) -> Result<Reply, ProtocolError>;

/// The handler table.
pub fn handlers() -> &'static BTreeMap<&'static str, Handler> {
    static HANDLERS: OnceLock<BTreeMap<&'static str, Handler>> = OnceLock::new();
    HANDLERS.get_or_init(|| {
        let table: [(&'static str, Handler); 12] = [
            ("add_iron", add_iron),
            ("remove_iron", remove_iron),
            ("add_technology", add_technology),
            ("resign", resign),
            ("check_build_neuron", check_build_neuron),
            ("check_build_potential", check_build_potential),
            ("build_neuron", build_neuron),
            ("get_positions", get_positions),
            ("toggle_swarm_attack", toggle_swarm_attack),
            ("set_way_point", set_way_point),
            ("set_ipsp_target", set_ipsp_target),
            ("set_epsp_target", set_epsp_target),
        ];
        table.into_iter().collect()
    })
}

/// Run the handler registered for `cmd.command`.
pub fn dispatch(ctx: &HandlerContext<'_>, cmd: &Command) -> Result<Reply, ProtocolError> {
    let handler = handlers()
        .get(cmd.command.as_str())
        .ok_or_else(|| ProtocolError::UnknownCommand(cmd.command.clone()))?;
    debug!(command = %cmd.command, player = %ctx.player.name(), "dispatching");
    handler(ctx, cmd)
}

// =============================================================================
// RESOURCES AND TECHNOLOGIES
// =============================================================================

fn add_iron(ctx: &HandlerContext<'_>, cmd: &Command) -> Result<Reply, ProtocolError> {
    let req: ResourceRequest = cmd.payload()?;
    let reply = match ctx.player.distribute_iron(req.resource, ctx.now) {
        Ok(change) => {
            let mut msgs = vec![ServerMessage::set_msg("Distribute iron: done!")];
            if let IronChange::Activated(Some(pos)) = change {
                msgs.push(ServerMessage::set_unit(UnitKind::ResourceNeuron, pos, COLOR_RESOURCES));
            }
            Reply::Send(msgs)
        }
        Err(e) => Reply::msg(e.to_string()),
    };
    Ok(reply)
}

fn remove_iron(ctx: &HandlerContext<'_>, cmd: &Command) -> Result<Reply, ProtocolError> {
    let req: ResourceRequest = cmd.payload()?;
    let reply = match ctx.player.remove_iron(req.resource) {
        Ok(change) => {
            let mut msgs = vec![ServerMessage::set_msg("Remove iron: done!")];
            if let IronChange::Deactivated(Some(pos)) = change {
                msgs.push(ServerMessage::set_unit(UnitKind::ResourceNeuron, pos, COLOR_DEFAULT));
            }
            Reply::Send(msgs)
        }
        Err(e) => {
            debug!(error = %e, "remove iron failed");
            Reply::msg("Remove iron: not enough iron!")
        }
    };
    Ok(reply)
}

fn add_technology(ctx: &HandlerContext<'_>, cmd: &Command) -> Result<Reply, ProtocolError> {
    let req: TechnologyRequest = cmd.payload()?;
    let reply = match ctx.player.add_technology(req.technology) {
        Ok(_) => Reply::msg("Add technology: done!"),
        Err(GameError::InsufficientResources(_)) => Reply::msg("Add technology: probably not enough resources!"),
        Err(e) => Reply::msg(e.to_string()),
    };
    Ok(reply)
}

fn resign(_ctx: &HandlerContext<'_>, _cmd: &Command) -> Result<Reply, ProtocolError> {
    Ok(Reply::Resign)
}

// =============================================================================
// BUILDING
// =============================================================================

fn check_build_neuron(ctx: &HandlerContext<'_>, cmd: &Command) -> Result<Reply, ProtocolError> {
    let req: BuildRequest = cmd.payload()?;
    let missing = ctx.player.missing_for_unit(req.unit);
    if !missing.is_empty() {
        return Ok(Reply::msg(GameError::InsufficientResources(missing).to_string()));
    }
    let nuclei = ctx.player.positions_of_neurons(Some(UnitKind::Nucleus));
    let (start_pos, positions) = match nuclei.as_slice() {
        [only] => (Some(*only), None),
        _ => (None, Some(nuclei)),
    };
    Ok(Reply::one(ServerMessage::BuildNeuron(BuildNeuronPrompt {
        unit: req.unit,
        start_pos,
        positions,
        range: ctx.player.cur_range(),
    })))
}

fn check_build_potential(ctx: &HandlerContext<'_>, cmd: &Command) -> Result<Reply, ProtocolError> {
    let req: BuildRequest = cmd.payload()?;
    let Some(kind) = PotentialKind::from_unit(req.unit) else {
        return Ok(Reply::msg(MSG_FAILED));
    };
    let missing = ctx.player.missing_for_unit(req.unit);
    if !missing.is_empty() {
        return Ok(Reply::msg(GameError::InsufficientResources(missing).to_string()));
    }
    let synapses = ctx.player.positions_of_neurons(Some(UnitKind::Synapse));
    let synapse = match (synapses.as_slice(), req.start_pos) {
        ([], _) => return Ok(Reply::msg(GameError::NoSynapse.to_string())),
        ([only], _) => *only,
        (_, Some(pos)) => pos,
        _ => {
            return Ok(Reply::one(ServerMessage::BuildPotential(BuildPotentialPrompt {
                unit: req.unit,
                positions: synapses,
                num: req.num,
            })))
        }
    };
    Ok(Reply::Launch { synapse, kind, num: req.num })
}

fn build_neuron(ctx: &HandlerContext<'_>, cmd: &Command) -> Result<Reply, ProtocolError> {
    let req: PlaceNeuron = cmd.payload()?;
    let (epsp_target, ipsp_target) = if req.unit == UnitKind::Synapse {
        let enemy = ctx.player.enemies().into_iter().find(|e| !e.has_lost());
        (
            enemy.as_ref().map(|e| e.nucleus_pos()),
            enemy.as_ref().and_then(|e| e.random_neuron()),
        )
    } else {
        (None, None)
    };
    let reply = match ctx.player.add_neuron(req.pos, req.unit, epsp_target, ipsp_target, ctx.now) {
        Ok(()) => Reply::one(ServerMessage::set_unit(req.unit, req.pos, ctx.player.color())),
        Err(e) => {
            debug!(error = %e, "build neuron failed");
            Reply::msg(MSG_FAILED)
        }
    };
    Ok(reply)
}

// =============================================================================
// QUERIES
// =============================================================================

fn get_positions(ctx: &HandlerContext<'_>, cmd: &Command) -> Result<Reply, ProtocolError> {
    let query: PositionsQuery = cmd.payload()?;
    let positions = query
        .position_requests
        .iter()
        .map(|req| positions_for(ctx, *req))
        .collect();
    Ok(Reply::one(ServerMessage::Positions {
        return_cmd: query.return_cmd,
        positions,
    }))
}

fn positions_for(ctx: &HandlerContext<'_>, req: PositionRequest) -> Vec<Position> {
    let player = ctx.player;
    match req {
        PositionRequest::Player { unit } => player.positions_of_neurons(unit),
        PositionRequest::Enemy { unit } => player
            .enemies()
            .iter()
            .flat_map(|e| e.positions_of_neurons(unit))
            .collect(),
        PositionRequest::Center => ctx.state.field().center_positions_of_sections(),
        PositionRequest::Targets { pos, unit } => PotentialKind::from_unit(unit)
            .and_then(|kind| player.synapse_target(pos, kind))
            .into_iter()
            .collect(),
        PositionRequest::CurrentWay { pos } => {
            let field = ctx.state.field();
            [PotentialKind::Ipsp, PotentialKind::Epsp]
                .into_iter()
                .flat_map(|kind| {
                    let way_points = player.synapse_way_points(pos, Some(kind));
                    field.get_way_for_soldier(pos, &way_points).unwrap_or_default()
                })
                .collect()
        }
        PositionRequest::CurrentWayPoints { pos } => player.synapse_way_points(pos, None),
    }
}

// =============================================================================
// SYNAPSES
// =============================================================================

fn toggle_swarm_attack(ctx: &HandlerContext<'_>, cmd: &Command) -> Result<Reply, ProtocolError> {
    let req: SynapseCommand = cmd.payload()?;
    let reply = match ctx.player.switch_swarm_attack(req.synapse_pos) {
        Ok(on) => Reply::msg(format!(
            "Toggle swarm-attack successful. Swarm attack {}",
            if on { "on" } else { "off" }
        )),
        Err(e) => Reply::msg(e.to_string()),
    };
    Ok(reply)
}

fn set_way_point(ctx: &HandlerContext<'_>, cmd: &Command) -> Result<Reply, ProtocolError> {
    let req: SynapseCommand = cmd.payload()?;
    let pos = req.pos.ok_or_else(|| cmd.missing("pos"))?;
    let num = req.num.ok_or_else(|| cmd.missing("num"))?;
    let tech = i32::from(ctx.player.technologies().level(TechKind::Way));
    let result = if num <= 1 {
        ctx.player.reset_way_for_synapse(req.synapse_pos, pos)
    } else {
        ctx.player.add_way_pos_for_synapse(req.synapse_pos, pos).map(|_| ())
    };
    let reply = match result {
        Ok(()) => Reply::one(ServerMessage::SetWps(WayPointUpdate {
            msg: format!("New way-point added: {num}/{tech}"),
            synapse_pos: req.synapse_pos,
            num: if num < tech { num + 1 } else { -1 },
        })),
        Err(e) => Reply::msg(e.to_string()),
    };
    Ok(reply)
}

fn set_ipsp_target(ctx: &HandlerContext<'_>, cmd: &Command) -> Result<Reply, ProtocolError> {
    let req: SynapseCommand = cmd.payload()?;
    let pos = req.pos.ok_or_else(|| cmd.missing("pos"))?;
    let reply = match ctx.player.change_ipsp_target(req.synapse_pos, pos) {
        Ok(()) => Reply::msg("Ipsp target for this synapse set"),
        Err(e) => Reply::msg(e.to_string()),
    };
    Ok(reply)
}

fn set_epsp_target(ctx: &HandlerContext<'_>, cmd: &Command) -> Result<Reply, ProtocolError> {
    let req: SynapseCommand = cmd.payload()?;
    let pos = req.pos.ok_or_else(|| cmd.missing("pos"))?;
    let reply = match ctx.player.change_epsp_target(req.synapse_pos, pos) {
        Ok(()) => Reply::msg("Epsp target for this synapse set"),
        Err(e) => Reply::msg(e.to_string()),
    };
    Ok(reply)
}
