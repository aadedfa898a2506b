//! Game State Definitions
//!
//! Lifecycle status, game mode and the seat roster of one running game.
//! Seats keep their join order; every per-tick loop iterates them in that
//! order.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Serialize, Deserialize};
use tracing::info;
use uuid::Uuid;

use crate::core::sync::{lock, read, write};
use crate::game::events::GameEvent;
use crate::game::field::Field;
use crate::game::player::Player;

// =============================================================================
// STATUS
// =============================================================================

/// Lifecycle of a game. Only ever moves forward.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum GameStatus {
    /// Created, host not yet initialized
    #[default]
    Waiting = 0,
    /// Multiplayer host waiting for the other seats
    WaitingForPlayers = 1,
    /// Field built, loops starting
    SettingUp = 2,
    /// Loops running
    Running = 3,
    /// Loops exit at their next scheduling point
    Closing = 4,
    /// Field and players released
    Closed = 5,
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GameStatus::Waiting => "WAITING",
            GameStatus::WaitingForPlayers => "WAITING_FOR_PLAYERS",
            GameStatus::SettingUp => "SETTING_UP",
            GameStatus::Running => "RUNNING",
            GameStatus::Closing => "CLOSING",
            GameStatus::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

// =============================================================================
// MODE
// =============================================================================

/// How a game is played.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameMode {
    /// Host against one AI
    #[default]
    SinglePlayer,
    /// Host waiting for human opponents
    MultiPlayer,
    /// Joining a waiting multiplayer game
    MultiPlayerClient,
    /// Host watches two AIs
    Observer,
    /// Two AIs, no views
    AiGame,
}

impl GameMode {
    /// Does the host take a seat?
    pub fn host_plays(self) -> bool {
        matches!(self, GameMode::SinglePlayer | GameMode::MultiPlayer | GameMode::MultiPlayerClient)
    }

    /// Number of AI seats this mode adds.
    pub fn ai_seats(self) -> usize {
        match self {
            GameMode::SinglePlayer => 1,
            GameMode::Observer | GameMode::AiGame => 2,
            GameMode::MultiPlayer | GameMode::MultiPlayerClient => 0,
        }
    }
}

// =============================================================================
// SEATS
// =============================================================================

/// Name used for an AI seat.
pub fn ai_name(audio_filename: &str) -> String {
    format!("AI ({audio_filename})")
}

/// Whether a seat name belongs to an AI.
pub fn is_ai(name: &str) -> bool {
    name.contains("AI")
}

/// One player of a game.
#[derive(Clone, Debug)]
pub struct Seat {
    /// Player name
    pub name: String,
    /// Player state
    pub player: Arc<Player>,
    /// Controlled by an AI loop
    pub ai: bool,
}

// =============================================================================
// GAME STATE
// =============================================================================

/// Everything the loops of one running game share.
#[derive(Debug)]
pub struct GameState {
    game_id: Uuid,
    mode: GameMode,
    field: Arc<Field>,
    seats: Vec<Seat>,
    status: RwLock<GameStatus>,
    dead_players: Mutex<BTreeSet<String>>,
    tick: AtomicU64,
}

/// Outcome of a loss check.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LossCheck {
    /// Players who lost since the previous check
    pub newly_lost: Vec<String>,
    /// Game is over
    pub ended: bool,
    /// Last player standing
    pub winner: Option<String>,
}

impl GameState {
    /// Create a game over `seats`; wires every player's enemies.
    pub fn new(game_id: Uuid, mode: GameMode, field: Arc<Field>, seats: Vec<Seat>) -> Self {
        for seat in &seats {
            let enemies = seats
                .iter()
                .filter(|other| other.name != seat.name)
                .map(|other| Arc::downgrade(&other.player))
                .collect();
            seat.player.set_enemies(enemies);
        }
        Self {
            game_id,
            mode,
            field,
            seats,
            status: RwLock::new(GameStatus::SettingUp),
            dead_players: Mutex::new(BTreeSet::new()),
            tick: AtomicU64::new(0),
        }
    }

    /// Game id.
    pub fn game_id(&self) -> Uuid {
        self.game_id
    }

    /// Mode.
    pub fn mode(&self) -> GameMode {
        self.mode
    }

    /// Shared field.
    pub fn field(&self) -> &Arc<Field> {
        &self.field
    }

    /// Seats in join order.
    pub fn seats(&self) -> &[Seat] {
        &self.seats
    }

    /// Every player in seat order.
    pub fn players(&self) -> Vec<Arc<Player>> {
        self.seats.iter().map(|s| s.player.clone()).collect()
    }

    /// Human seats.
    pub fn humans(&self) -> impl Iterator<Item = &Seat> {
        self.seats.iter().filter(|s| !s.ai)
    }

    /// AI seats.
    pub fn ais(&self) -> impl Iterator<Item = &Seat> {
        self.seats.iter().filter(|s| s.ai)
    }

    /// Player by name.
    pub fn player(&self, name: &str) -> Option<Arc<Player>> {
        self.seats.iter().find(|s| s.name == name).map(|s| s.player.clone())
    }

    /// Render steps run so far.
    pub fn tick(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    /// Count one render step; returns the new tick.
    pub fn advance_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Current status.
    pub fn status(&self) -> GameStatus {
        *read(&self.status)
    }

    /// Loops should stop.
    pub fn is_closing(&self) -> bool {
        self.status() >= GameStatus::Closing
    }

    /// Move to `status` if it is later than the current one.
    pub fn set_status(&self, status: GameStatus) -> Option<GameEvent> {
        let mut cur = write(&self.status);
        if status <= *cur {
            return None;
        }
        let old = std::mem::replace(&mut *cur, status);
        info!(game_id = %self.game_id, %old, new = %status, "status changed");
        Some(GameEvent::status_changed(self.tick(), old, status))
    }

    /// Names of players who have lost.
    pub fn dead_players(&self) -> BTreeSet<String> {
        lock(&self.dead_players).clone()
    }

    /// Record new losses and detect the end of the game.
    ///
    /// The game ends once at most one player is left; the survivor wins.
    pub fn check_losses(&self) -> LossCheck {
        let mut dead = lock(&self.dead_players);
        let mut check = LossCheck::default();
        for seat in &self.seats {
            if !dead.contains(&seat.name) && seat.player.has_lost() {
                dead.insert(seat.name.clone());
                check.newly_lost.push(seat.name.clone());
            }
        }
        if !self.seats.is_empty() && dead.len() + 1 >= self.seats.len() {
            check.ended = true;
            check.winner = self
                .seats
                .iter()
                .find(|s| !dead.contains(&s.name))
                .map(|s| s.name.clone());
        }
        check
    }

    /// Mark every remaining player as lost (audio ran out).
    pub fn time_up(&self) -> Vec<String> {
        let mut dead = lock(&self.dead_players);
        self.seats
            .iter()
            .filter(|s| dead.insert(s.name.clone()))
            .map(|s| s.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::audio::{AnalyzedAudio, BeatFrame, RandomMode};
    use crate::core::Position;

    fn game() -> GameState {
        let beats = vec![BeatFrame {
            time: 0,
            bpm: 90.0,
            level: 0.2,
            notes: vec![55],
            off_note: false,
            minor: true,
        }];
        let audio = AnalyzedAudio::from_frames("state-test.mp3", beats).unwrap();
        let ran = Arc::new(Mutex::new(audio.generator(RandomMode::Note)));
        let field = Arc::new(Field::from_rows(&["D......D"; 4]));
        let now = Instant::now();
        let seats = [("alice", Position::new(0, 0)), ("AI (song)", Position::new(0, 7))]
            .into_iter()
            .enumerate()
            .map(|(i, (name, pos))| Seat {
                name: name.to_string(),
                player: Arc::new(Player::new(name, 10 + i as i32, pos, field.clone(), ran.clone(), now)),
                ai: is_ai(name),
            })
            .collect();
        GameState::new(Uuid::new_v4(), GameMode::SinglePlayer, field, seats)
    }

    #[test]
    fn test_status_only_moves_forward() {
        let g = game();
        assert_eq!(g.status(), GameStatus::SettingUp);
        assert!(g.set_status(GameStatus::Running).is_some());
        assert!(g.set_status(GameStatus::SettingUp).is_none());
        assert!(!g.is_closing());
        g.set_status(GameStatus::Closing);
        assert!(g.is_closing());
        assert_eq!(GameStatus::WaitingForPlayers.to_string(), "WAITING_FOR_PLAYERS");
    }

    #[test]
    fn test_enemies_wired() {
        let g = game();
        let alice = g.player("alice").unwrap();
        assert_eq!(alice.enemies().len(), 1);
        assert_eq!(alice.enemies()[0].name(), "AI (song)");
        assert_eq!(g.humans().count(), 1);
        assert_eq!(g.ais().count(), 1);
    }

    #[test]
    fn test_resign_ends_game() {
        let g = game();
        assert_eq!(g.check_losses(), LossCheck::default());
        g.player("alice").unwrap().resign();
        let check = g.check_losses();
        assert_eq!(check.newly_lost, vec!["alice".to_string()]);
        assert!(check.ended);
        assert_eq!(check.winner.as_deref(), Some("AI (song)"));
        assert!(g.check_losses().newly_lost.is_empty());
    }

    #[test]
    fn test_time_up_has_no_winner() {
        let g = game();
        assert_eq!(g.time_up().len(), 2);
        let check = g.check_losses();
        assert!(check.ended);
        assert_eq!(check.winner, None);
    }

    #[test]
    fn test_mode_seats() {
        assert!(GameMode::MultiPlayerClient.host_plays());
        assert!(!GameMode::Observer.host_plays());
        assert_eq!(GameMode::AiGame.ai_seats(), 2);
        assert_eq!(serde_json::to_string(&GameMode::AiGame).unwrap(), "\"ai_game\"");
    }
}
