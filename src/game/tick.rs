//! Simulation Steps
//!
//! The work done on each clock edge. The beat clock regenerates resources;
//! the render clock moves potentials, resolves collisions, runs defenders
//! and detects losses. Steps take `now` explicitly and never sleep, so the
//! loops in `network::session` own all timing.

use std::time::Instant;

use tracing::{debug, info};

use crate::audio::BeatFrame;
use crate::game::collision::resolve_collisions;
use crate::game::costs::UnitKind;
use crate::game::events::GameEvent;
use crate::game::neuron::NeuronInfo;
use crate::game::player::Player;
use crate::game::state::{GameState, GameStatus, LossCheck};

/// Message for a player who lost.
pub const MSG_LOST: &str = "YOU LOST";
/// Message for everyone when the map audio runs out.
pub const MSG_TIME_UP: &str = "YOU LOST - times up";
/// Message for the opponents of a resigning player.
pub const MSG_OPPONENT_RESIGNED: &str = "YOU WON - opponent resigned";

/// Result of a step.
#[derive(Debug, Default)]
pub struct TickResult {
    /// Events generated this step, sorted
    pub events: Vec<GameEvent>,
    /// Players who lost during this step
    pub lost: Vec<String>,
    /// Whether the game ended this step
    pub match_ended: bool,
    /// Winner (if the game ended with one)
    pub winner: Option<String>,
}

impl TickResult {
    /// Message for the winner.
    pub fn win_message(&self) -> Option<String> {
        self.winner.as_ref().map(|w| format!("{w} WON"))
    }
}

/// Beat edge for human players: one regeneration each.
///
/// AIs regenerate in their own loops.
pub fn beat_step(state: &GameState, frame: &BeatFrame, more_off_notes: bool) {
    for seat in state.humans() {
        seat.player.increase_resources(more_off_notes);
    }
    debug!(time = frame.time, bpm = frame.bpm, inc_iron = more_off_notes, "beat");
}

/// Render edge of the game loop.
///
/// Human potentials move, then all same-cell collisions resolve, then human
/// activators fire, then losses are detected.
pub fn render_step(state: &GameState, now: Instant) -> TickResult {
    let tick = state.advance_tick();
    let mut events = Vec::new();

    for seat in state.humans() {
        events.extend(seat.player.move_potentials(now, 1.0));
    }
    events.extend(resolve_collisions(&state.players()));
    for seat in state.humans() {
        events.extend(seat.player.handle_def(now, 1.0));
    }

    let events = events.into_iter().map(|data| GameEvent::new(tick, data)).collect();
    finish(state, tick, events, state.check_losses())
}

/// Render edge of one AI loop, scaled by the AI speed.
pub fn ai_render_step(state: &GameState, ai: &Player, now: Instant, ai_speed: f64) -> TickResult {
    let tick = state.tick();
    let mut events = ai.move_potentials(now, ai_speed);
    events.extend(ai.handle_def(now, ai_speed));
    let events = events.into_iter().map(|data| GameEvent::new(tick, data)).collect();
    finish(state, tick, events, state.check_losses())
}

/// The map audio ran out: everyone loses.
pub fn time_up_step(state: &GameState) -> TickResult {
    let tick = state.tick();
    let lost = state.time_up();
    let mut events: Vec<GameEvent> = lost
        .iter()
        .map(|name| GameEvent::player_lost(tick, name, MSG_TIME_UP))
        .collect();
    events.extend(state.set_status(GameStatus::Closing));
    events.push(GameEvent::game_ended(tick, None));
    info!(game_id = %state.game_id(), "time is up");
    TickResult {
        events,
        lost,
        match_ended: true,
        winner: None,
    }
}

/// A player gave up. Reports the loss and, when it decides the game, the
/// winner. `None` if `name` has no seat.
pub fn resign_step(state: &GameState, name: &str) -> Option<TickResult> {
    let player = state.player(name)?;
    player.resign();
    Some(finish(state, state.tick(), Vec::new(), state.check_losses()))
}

fn finish(state: &GameState, tick: u64, mut events: Vec<GameEvent>, check: LossCheck) -> TickResult {
    for name in &check.newly_lost {
        info!(player = %name, "player lost");
        events.push(GameEvent::player_lost(tick, name, MSG_LOST));
    }
    // Only the first step to see the end reports it.
    let mut match_ended = false;
    if check.ended {
        if let Some(changed) = state.set_status(GameStatus::Closing) {
            match_ended = true;
            events.push(changed);
            events.push(GameEvent::game_ended(tick, check.winner.clone()));
            if let Some(winner) = &check.winner {
                info!(%winner, tick, "game won");
            }
        }
    }
    events.sort();
    TickResult {
        events,
        lost: check.newly_lost,
        match_ended,
        winner: if match_ended { check.winner } else { None },
    }
}

/// Enemy neurons a player currently scouts.
///
/// A potential closer than an enemy's range to one of that enemy's nuclei
/// reveals every neuron of the enemy in range of that nucleus. Returns
/// `(enemy color, neurons)` per revealed nucleus.
pub fn scouted_neurons(player: &Player) -> Vec<(i32, Vec<NeuronInfo>)> {
    let potentials = player.potentials();
    if potentials.is_empty() {
        return Vec::new();
    }
    let mut scouted = Vec::new();
    for enemy in player.enemies() {
        let range = enemy.cur_range() as f64;
        for nucleus in enemy.positions_of_neurons(Some(UnitKind::Nucleus)) {
            if potentials.iter().any(|p| p.pos.distance(nucleus) < range) {
                scouted.push((enemy.color(), enemy.neurons_in_range(nucleus)));
            }
        }
    }
    scouted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use uuid::Uuid;

    use crate::audio::{AnalyzedAudio, RandomMode};
    use crate::core::Position;
    use crate::game::events::GameEventData;
    use crate::game::field::Field;
    use crate::game::potential::PotentialKind;
    use crate::game::resource::ResourceKind;
    use crate::game::state::{GameMode, Seat};

    fn frame() -> BeatFrame {
        BeatFrame { time: 0, bpm: 120.0, level: 0.4, notes: vec![60], off_note: true, minor: false }
    }

    fn duel(now: Instant) -> GameState {
        let audio = AnalyzedAudio::from_frames("tick-test.mp3", vec![frame()]).unwrap();
        let ran = Arc::new(Mutex::new(audio.generator(RandomMode::Note)));
        let mut rows = vec![".".repeat(20); 7];
        rows[3].replace_range(2..3, "D");
        rows[3].replace_range(17..18, "D");
        let rows: Vec<&str> = rows.iter().map(String::as_str).collect();
        let field = Arc::new(Field::from_rows(&rows));
        let seats = [("alice", Position::new(3, 2)), ("bob", Position::new(3, 17))]
            .into_iter()
            .enumerate()
            .map(|(i, (name, pos))| Seat {
                name: name.to_string(),
                player: Arc::new(Player::new(name, 10 + i as i32, pos, field.clone(), ran.clone(), now)),
                ai: false,
            })
            .collect();
        GameState::new(Uuid::new_v4(), GameMode::MultiPlayer, field, seats)
    }

    #[test]
    fn test_beat_step_regenerates_humans() {
        let now = Instant::now();
        let state = duel(now);
        let before = state.player("alice").unwrap().resources().get(ResourceKind::Oxygen).cur;
        beat_step(&state, &frame(), true);
        let alice = state.player("alice").unwrap();
        assert!(alice.resources().get(ResourceKind::Oxygen).cur > before);
        assert!(alice.resources().get(ResourceKind::Iron).cur > 3.0);
    }

    #[test]
    fn test_render_step_counts_ticks() {
        let now = Instant::now();
        let state = duel(now);
        let result = render_step(&state, now);
        assert_eq!(state.tick(), 1);
        assert!(!result.match_ended);
        assert!(result.events.is_empty());
    }

    #[test]
    fn test_end_reported_once() {
        let now = Instant::now();
        let state = duel(now);
        state.set_status(GameStatus::Running);
        state.player("bob").unwrap().resign();
        let result = render_step(&state, now);
        assert!(result.match_ended);
        assert_eq!(result.winner.as_deref(), Some("alice"));
        assert_eq!(result.win_message().as_deref(), Some("alice WON"));
        assert_eq!(state.status(), GameStatus::Closing);
        assert_eq!(result.events[0].priority, crate::game::events::EventPriority::PlayerLoss);

        let again = render_step(&state, now);
        assert!(!again.match_ended);
    }

    #[test]
    fn test_resign_reports_winner() {
        let now = Instant::now();
        let state = duel(now);
        state.set_status(GameStatus::Running);
        assert!(resign_step(&state, "carol").is_none());

        let result = resign_step(&state, "bob").unwrap();
        assert_eq!(result.lost, vec!["bob".to_string()]);
        assert!(result.match_ended);
        assert_eq!(result.winner.as_deref(), Some("alice"));
        assert!(result.events.iter().any(|e| matches!(
            &e.data,
            GameEventData::GameEnded { winner: Some(w), .. } if w == "alice"
        )));
        assert_eq!(state.status(), GameStatus::Closing);

        // the render loop does not report it a second time
        assert!(!render_step(&state, now).match_ended);
    }

    #[test]
    fn test_time_up() {
        let state = duel(Instant::now());
        let result = time_up_step(&state);
        assert_eq!(result.lost.len(), 2);
        assert!(result.match_ended);
        assert!(result.winner.is_none());
        assert!(state.is_closing());
    }

    #[test]
    fn test_scouting_reveals_enemy_neurons() {
        let now = Instant::now();
        let state = duel(now);
        let alice = state.player("alice").unwrap();
        for kind in ResourceKind::ALL {
            alice.set_resource(kind, 50.0);
        }
        let synapse = Position::new(3, 4);
        alice
            .add_neuron(synapse, UnitKind::Synapse, Some(Position::new(3, 17)), None, now)
            .unwrap();
        alice.add_potential(synapse, PotentialKind::Epsp, now).unwrap();
        assert!(scouted_neurons(&alice).is_empty());

        let mut t = now;
        for _ in 0..10 {
            t += Duration::from_millis(371);
            render_step(&state, t);
        }
        let scouted = scouted_neurons(&alice);
        assert_eq!(scouted.len(), 1);
        assert_eq!(scouted[0].0, 11);
        assert!(scouted[0].1.iter().any(|n| n.unit == UnitKind::Nucleus));
    }
}
