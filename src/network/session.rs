//! Game Sessions
//!
//! A [`GameSession`] owns one game from `initialize_game` until it is
//! closed. It gathers the seats, builds the field from the map audio, runs
//! the render loop and one loop per AI player, and routes messages to the
//! views of its users. [`SessionManager`] keeps every session of a server.
//!
//! Simulation state sits behind `std::sync` locks that are never held
//! across an `.await`; outbound messages go through per-user channels.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, RwLock as AsyncRwLock};
use tokio::time::sleep_until;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::audio::{AnalyzedAudio, AudioError, RandomMode};
use crate::core::sync::{lock, read, write};
use crate::core::Position;
use crate::game::ai::AudioKi;
use crate::game::costs::SYMBOL_NUCLEUS;
use crate::game::error::GameError;
use crate::game::field::{generate_field, Field};
use crate::game::player::Player;
use crate::game::potential::PotentialKind;
use crate::game::state::{ai_name, GameMode, GameState, GameStatus, Seat};
use crate::game::tick::{
    ai_render_step, beat_step, render_step, resign_step, scouted_neurons, time_up_step, TickResult,
    MSG_LOST, MSG_OPPONENT_RESIGNED, MSG_TIME_UP,
};
use crate::network::dispatch::{dispatch, HandlerContext, Reply, MSG_FAILED, MSG_SUCCESS};
use crate::network::protocol::{Command, InitializeGame, ServerMessage, Transfer, UnitsUpdate};

/// Shown to a multiplayer host until the seats are filled.
pub const MSG_WAITING: &str = "Waiting for players...";

/// Render period before the first beat.
const INITIAL_RENDER_MS: f64 = 40.0;

/// Spacing of potentials launched by one `check_build_potential`.
const LAUNCH_SPACING: Duration = Duration::from_millis(110);

// =============================================================================
// ERRORS
// =============================================================================

/// Session errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Audio could not be loaded.
    #[error("audio error: {0}")]
    Audio(#[from] AudioError),

    /// Game setup failed.
    #[error(transparent)]
    Game(#[from] GameError),

    /// Joining a game that is not waiting for players.
    #[error("game {0} is not waiting for players")]
    NotWaiting(Uuid),

    /// No game waits for players.
    #[error("no game is waiting for players")]
    NoWaitingGame,

    /// Name already seated.
    #[error("{0} already plays in this game")]
    NameTaken(String),

    /// Mode cannot host a game.
    #[error("mode {0:?} cannot host a game")]
    NotHostable(GameMode),

    /// Game is not running.
    #[error("game {0} is not running")]
    NotRunning(Uuid),

    /// User has no seat.
    #[error("{0} has no seat in this game")]
    UnknownUser(String),
}

// =============================================================================
// MAILBOXES
// =============================================================================

/// Outbound channel of one view.
pub type Outbox = mpsc::Sender<ServerMessage>;

/// Outbound channels of every connected user, shared by the server and
/// all sessions.
#[derive(Debug, Clone, Default)]
pub struct Mailboxes {
    boxes: Arc<AsyncRwLock<BTreeMap<String, Outbox>>>,
}

impl Mailboxes {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the channel of `user`.
    pub async fn register(&self, user: &str, outbox: Outbox) {
        self.boxes.write().await.insert(user.to_string(), outbox);
    }

    /// Forget the channel of `user`.
    pub async fn unregister(&self, user: &str) {
        self.boxes.write().await.remove(user);
    }

    /// Number of registered users.
    pub async fn len(&self) -> usize {
        self.boxes.read().await.len()
    }

    /// Whether no user is registered.
    pub async fn is_empty(&self) -> bool {
        self.boxes.read().await.is_empty()
    }

    async fn outbox(&self, user: &str) -> Option<Outbox> {
        self.boxes.read().await.get(user).cloned()
    }

    /// Deliver `msg`, waiting for room in the channel.
    pub async fn send(&self, user: &str, msg: ServerMessage) -> bool {
        match self.outbox(user).await {
            Some(tx) => tx.send(msg).await.is_ok(),
            None => {
                debug!(%user, command = msg.command(), "no mailbox");
                false
            }
        }
    }

    /// Deliver `msg` unless the channel is full. Used for snapshots, which
    /// the next render step supersedes.
    pub async fn post(&self, user: &str, msg: ServerMessage) -> bool {
        match self.outbox(user).await {
            Some(tx) => match tx.try_send(msg) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(msg)) => {
                    debug!(%user, command = msg.command(), "mailbox full, dropped");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            },
            None => false,
        }
    }
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Configuration for one game.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Field rows
    pub lines: i32,
    /// Field columns
    pub cols: i32,
    /// Seats of a multiplayer game
    pub num_players: usize,
    /// Pace of AI players relative to their audio
    pub ai_speed: f64,
    /// Base directory for analysis files
    pub base_path: PathBuf,
    /// Time between CLOSING and CLOSED
    pub linger: Duration,
    /// Fixed layout instead of an audio-generated one; nuclei sit on the
    /// `D` cells in row order
    pub preset_map: Option<Vec<String>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lines: 40,
            cols: 80,
            num_players: 2,
            ai_speed: 1.0,
            base_path: PathBuf::from("."),
            linger: Duration::from_secs(1),
            preset_map: None,
        }
    }
}

impl SessionConfig {
    /// Apply the overrides of an `initialize_game` request.
    pub fn with_request(mut self, request: &InitializeGame) -> Self {
        if let Some(lines) = request.lines {
            self.lines = lines;
        }
        if let Some(cols) = request.cols {
            self.cols = cols;
        }
        if let Some(num_players) = request.num_players {
            self.num_players = num_players.max(2);
        }
        if let Some(base_path) = &request.base_path {
            self.base_path = PathBuf::from(base_path);
        }
        self
    }
}

// =============================================================================
// GAME SESSION
// =============================================================================

/// Seats and observers gathered before the game starts.
#[derive(Debug)]
struct Lobby {
    status: GameStatus,
    players: Vec<String>,
    observers: Vec<String>,
    lines: i32,
    cols: i32,
}

/// One game.
#[derive(Debug)]
pub struct GameSession {
    id: Uuid,
    mode: GameMode,
    host: String,
    created_at: Instant,
    config: SessionConfig,
    audio: AnalyzedAudio,
    ai_audios: Vec<AnalyzedAudio>,
    lobby: Mutex<Lobby>,
    state: RwLock<Option<Arc<GameState>>>,
    winner: Mutex<Option<String>>,
    mailboxes: Mailboxes,
    closed_tx: watch::Sender<bool>,
}

impl GameSession {
    /// Create a session from analyzed audio.
    ///
    /// AI seats without their own audio play the map audio.
    pub fn new(
        host: impl Into<String>,
        mode: GameMode,
        audio: AnalyzedAudio,
        mut ai_audios: Vec<AnalyzedAudio>,
        config: SessionConfig,
        mailboxes: Mailboxes,
    ) -> Self {
        while ai_audios.len() < mode.ai_seats() {
            ai_audios.push(audio.clone());
        }
        let (closed_tx, _) = watch::channel(false);
        let id = Uuid::new_v4();
        info!(game_id = %id, ?mode, audio = %audio.source(), "game created");
        Self {
            id,
            mode,
            host: host.into(),
            created_at: Instant::now(),
            lobby: Mutex::new(Lobby {
                status: GameStatus::Waiting,
                players: Vec::new(),
                observers: Vec::new(),
                lines: config.lines,
                cols: config.cols,
            }),
            config,
            audio,
            ai_audios,
            state: RwLock::new(None),
            winner: Mutex::new(None),
            mailboxes,
            closed_tx,
        }
    }

    /// Create a session for an `initialize_game` request, loading the
    /// analyses of the map audio and the AI audio.
    pub fn load(
        host: impl Into<String>,
        request: &InitializeGame,
        config: SessionConfig,
        mailboxes: Mailboxes,
    ) -> Result<Self, SessionError> {
        let config = config.with_request(request);
        let audio = AnalyzedAudio::load(&request.source_path, &config.base_path)?;
        let ai_audios = request
            .ais
            .iter()
            .map(|path| AnalyzedAudio::load(path, &config.base_path))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(host, request.mode, audio, ai_audios, config, mailboxes))
    }

    /// Game id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Mode.
    pub fn mode(&self) -> GameMode {
        self.mode
    }

    /// User who created the game.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Creation time.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Map audio.
    pub fn audio(&self) -> &AnalyzedAudio {
        &self.audio
    }

    /// Running game, if any.
    pub fn state(&self) -> Option<Arc<GameState>> {
        read(&self.state).clone()
    }

    /// Current status.
    pub fn status(&self) -> GameStatus {
        match self.state() {
            Some(state) => state.status(),
            None => lock(&self.lobby).status,
        }
    }

    /// Human players in join order.
    pub fn players(&self) -> Vec<String> {
        lock(&self.lobby).players.clone()
    }

    /// Observers.
    pub fn observers(&self) -> Vec<String> {
        lock(&self.lobby).observers.clone()
    }

    /// Field size the game starts with.
    pub fn dimensions(&self) -> (i32, i32) {
        let lobby = lock(&self.lobby);
        (lobby.lines, lobby.cols)
    }

    /// Winner of a finished game.
    pub fn winner(&self) -> Option<String> {
        lock(&self.winner).clone()
    }

    /// Resolve once the game is closed.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Seat the host and start the game, or wait for more players.
    #[instrument(skip(self), fields(game_id = %self.id, mode = ?self.mode))]
    pub async fn initialize(self: &Arc<Self>) -> Result<(), SessionError> {
        {
            let mut lobby = lock(&self.lobby);
            match self.mode {
                GameMode::SinglePlayer | GameMode::MultiPlayer => lobby.players.push(self.host.clone()),
                GameMode::Observer => lobby.observers.push(self.host.clone()),
                GameMode::AiGame => {}
                GameMode::MultiPlayerClient => return Err(SessionError::NotHostable(self.mode)),
            }
        }
        if self.mode == GameMode::MultiPlayer {
            lock(&self.lobby).status = GameStatus::WaitingForPlayers;
            info!(host = %self.host, "waiting for players");
            self.mailboxes.send(&self.host, ServerMessage::print_msg(MSG_WAITING)).await;
            return Ok(());
        }
        self.start().await.map(|_| ())
    }

    /// Seat `username` in a waiting multiplayer game; starts the game once
    /// every seat is taken. The field shrinks to the smallest size asked for.
    #[instrument(skip(self), fields(game_id = %self.id))]
    pub async fn join(self: &Arc<Self>, username: &str, lines: Option<i32>, cols: Option<i32>) -> Result<(), SessionError> {
        let full = {
            let mut lobby = lock(&self.lobby);
            if lobby.status != GameStatus::WaitingForPlayers {
                return Err(SessionError::NotWaiting(self.id));
            }
            if lobby.players.iter().any(|p| p == username) {
                return Err(SessionError::NameTaken(username.to_string()));
            }
            lobby.players.push(username.to_string());
            if let Some(lines) = lines {
                lobby.lines = lobby.lines.min(lines);
            }
            if let Some(cols) = cols {
                lobby.cols = lobby.cols.min(cols);
            }
            lobby.players.len() >= self.config.num_players
        };
        info!(%username, "player joined");
        if full {
            self.start().await?;
        }
        Ok(())
    }

    /// Build the field and players, send `init_game` and spawn the loops.
    pub async fn start(self: &Arc<Self>) -> Result<Arc<GameState>, SessionError> {
        let (humans, observers, lines, cols) = {
            let mut lobby = lock(&self.lobby);
            lobby.status = GameStatus::SettingUp;
            (lobby.players.clone(), lobby.observers.clone(), lobby.lines, lobby.cols)
        };

        let mut names: Vec<(String, bool)> = humans.iter().map(|n| (n.clone(), false)).collect();
        for audio in self.ai_audios.iter().take(self.mode.ai_seats()) {
            let base = ai_name(&audio.filename(true));
            let mut name = base.clone();
            let mut n = 2;
            while names.iter().any(|(taken, _)| *taken == name) {
                name = format!("{base} #{n}");
                n += 1;
            }
            names.push((name, true));
        }

        let mut ran = self.audio.generator(RandomMode::Note);
        let (field, nuclei) = match self.build_field(lines, cols, names.len(), &mut ran) {
            Ok(built) => built,
            Err(e) => {
                error!(game_id = %self.id, error = %e, "field setup failed");
                for user in humans.iter().chain(&observers) {
                    self.mailboxes.send(user, ServerMessage::print_msg(e.to_string())).await;
                }
                self.mark_closed();
                return Err(e.into());
            }
        };

        let field = Arc::new(field);
        let ran = Arc::new(Mutex::new(ran));
        let now = Instant::now();
        let seats: Vec<Seat> = names
            .into_iter()
            .zip(nuclei)
            .enumerate()
            .map(|(i, ((name, ai), pos))| Seat {
                player: Arc::new(Player::new(name.clone(), (i % 4) as i32 + 10, pos, field.clone(), ran.clone(), now)),
                name,
                ai,
            })
            .collect();
        info!(game_id = %self.id, players = ?seats.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(), "players created");

        let state = Arc::new(GameState::new(self.id, self.mode, field, seats));
        *write(&self.state) = Some(state.clone());
        self.send_transfers(&state, 0.0, false).await;

        let mut ai_audios = self.ai_audios.iter();
        for seat in state.ais() {
            let audio = ai_audios.next().unwrap_or(&self.audio).clone();
            let ki = AudioKi::new(seat.player.clone(), audio, self.config.ai_speed);
            tokio::spawn(self.clone().run_ai_loop(state.clone(), ki));
        }
        state.set_status(GameStatus::Running);
        tokio::spawn(self.clone().run_render_loop(state.clone()));
        Ok(state)
    }

    fn build_field(
        &self,
        lines: i32,
        cols: i32,
        num_players: usize,
        ran: &mut crate::audio::RandomGenerator,
    ) -> Result<(Field, Vec<Position>), GameError> {
        if let Some(rows) = &self.config.preset_map {
            let rows: Vec<&str> = rows.iter().map(String::as_str).collect();
            let mut field = Field::from_rows(&rows);
            let placed: Vec<Position> = (0..field.lines())
                .flat_map(|l| (0..field.cols()).map(move |c| Position::new(l, c)))
                .filter(|pos| field.symbol_at(*pos) == Some(SYMBOL_NUCLEUS))
                .collect();
            let nuclei = field.finalize_graph(&placed);
            if nuclei.len() < num_players {
                return Err(GameError::UnplayableMap);
            }
            return Ok((field, nuclei));
        }
        let mut sign = self.audio.generator(RandomMode::MinorInterval);
        let mut magnitude = self.audio.generator(RandomMode::LevelPeaks);
        generate_field(lines, cols, num_players, ran, &mut sign, &mut magnitude)
    }

    /// Stop the game at the next scheduling point of its loops.
    pub fn shutdown(&self) {
        match self.state() {
            Some(state) => {
                state.set_status(GameStatus::Closing);
            }
            None => self.mark_closed(),
        }
    }

    /// A user disconnected.
    pub async fn leave(&self, username: &str) {
        match self.state() {
            Some(state) => {
                if !state.is_closing() && state.humans().any(|s| s.name == username) {
                    info!(game_id = %self.id, %username, "player left");
                    self.resign(&state, username).await;
                }
            }
            None => {
                let host_left = {
                    let mut lobby = lock(&self.lobby);
                    lobby.players.retain(|p| p != username);
                    lobby.observers.retain(|p| p != username);
                    username == self.host && lobby.status < GameStatus::SettingUp
                };
                if host_left {
                    self.mark_closed();
                }
            }
        }
    }

    fn mark_closed(&self) {
        lock(&self.lobby).status = GameStatus::Closed;
        self.closed_tx.send_replace(true);
        info!(game_id = %self.id, "game closed");
    }

    async fn close(&self, state: &GameState) {
        state.set_status(GameStatus::Closing);
        tokio::time::sleep(self.config.linger).await;
        for seat in state.seats() {
            info!(
                game_id = %self.id,
                player = %seat.name,
                stats = %seat.player.statistics().summary(),
                "final statistics"
            );
        }
        *write(&self.state) = None;
        self.mark_closed();
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    /// Run an inbound command of a seated player.
    #[instrument(skip(self, cmd), fields(game_id = %self.id, command = %cmd.command, user = %cmd.username))]
    pub async fn handle_command(self: &Arc<Self>, cmd: Command) -> Result<(), SessionError> {
        let state = self
            .state()
            .filter(|s| !s.is_closing())
            .ok_or(SessionError::NotRunning(self.id))?;
        let player = state
            .humans()
            .find(|s| s.name == cmd.username)
            .map(|s| s.player.clone())
            .ok_or_else(|| SessionError::UnknownUser(cmd.username.clone()))?;

        let reply = {
            let ctx = HandlerContext {
                state: &state,
                player: &player,
                now: Instant::now(),
            };
            dispatch(&ctx, &cmd)
        };
        match reply {
            Ok(Reply::Send(msgs)) => {
                for msg in msgs {
                    self.mailboxes.send(&cmd.username, msg).await;
                }
            }
            Ok(Reply::Launch { synapse, kind, num }) => {
                tokio::spawn(launch_potentials(
                    self.mailboxes.clone(),
                    player,
                    cmd.username.clone(),
                    synapse,
                    kind,
                    num,
                ));
            }
            Ok(Reply::Resign) => self.resign(&state, &cmd.username).await,
            Err(e) => {
                warn!(error = %e, "command rejected");
                self.mailboxes.send(&cmd.username, ServerMessage::set_msg(e.to_string())).await;
            }
        }
        Ok(())
    }

    async fn resign(&self, state: &GameState, username: &str) {
        let Some(result) = resign_step(state, username) else {
            return;
        };
        info!(game_id = %self.id, player = %username, "player resigned");
        log_events(&result);
        let others: Vec<String> = state
            .humans()
            .filter(|s| s.name != username)
            .map(|s| s.name.clone())
            .collect();
        for other in others {
            self.mailboxes.send(&other, ServerMessage::game_end(MSG_OPPONENT_RESIGNED)).await;
        }
        if !result.match_ended {
            return;
        }
        *lock(&self.winner) = result.winner.clone();
        if let Some(msg) = result.win_message() {
            for observer in self.observers() {
                self.mailboxes.send(&observer, ServerMessage::game_end(msg.clone())).await;
            }
        }
    }

    // =========================================================================
    // LOOPS
    // =========================================================================

    /// Beat and render clocks of the map audio.
    async fn run_render_loop(self: Arc<Self>, state: Arc<GameState>) {
        let beats = self.audio.shared_beats();
        let start = Instant::now();
        let mut next = 0;
        let mut period = period_from_ms(INITIAL_RENDER_MS, 1.0);
        let mut last_render = start;
        info!(game_id = %self.id, beats = beats.len(), "render loop started");

        while !state.is_closing() {
            let now = Instant::now();
            if let Some(frame) = beats.get(next) {
                if now.duration_since(start) >= Duration::from_millis(frame.time) {
                    period = period_from_ms(frame.render_period_ms(), 1.0);
                    beat_step(&state, frame, self.audio.more_off_notes(frame));
                    next += 1;
                }
            }
            if next >= beats.len() {
                let result = time_up_step(&state);
                log_events(&result);
                self.broadcast(&state, ServerMessage::game_end(MSG_TIME_UP)).await;
                break;
            }

            if now.duration_since(last_render) >= period {
                let result = render_step(&state, now);
                self.publish(&state, &result).await;
                self.send_scouted(&state).await;
                self.send_transfers(&state, next as f64 / beats.len() as f64, true).await;
                last_render = now;
            }

            let render_at = last_render + period;
            let deadline = beats
                .get(next)
                .map(|b| (start + Duration::from_millis(b.time)).min(render_at))
                .unwrap_or(render_at);
            sleep_until(deadline.into()).await;
        }
        info!(game_id = %self.id, tick = state.tick(), "render loop ended");
        self.close(&state).await;
    }

    /// Beat and render clocks of one AI player, scaled by the AI speed.
    async fn run_ai_loop(self: Arc<Self>, state: Arc<GameState>, mut ki: AudioKi) {
        let speed = if self.config.ai_speed > 0.0 { self.config.ai_speed } else { 1.0 };
        let beats = ki.audio().shared_beats();
        let mut start = Instant::now();
        let mut next = 0;
        let mut period = period_from_ms(INITIAL_RENDER_MS, speed);
        let mut last_render = start;
        info!(player = %ki.player().name(), beats = beats.len(), speed, "ai loop started");

        while !state.is_closing() && !ki.player().has_lost() {
            let now = Instant::now();
            if let Some(frame) = beats.get(next) {
                if now.duration_since(start) >= scaled_ms(frame.time, speed) {
                    for event in ki.do_action(frame, now) {
                        debug!(player = %ki.player().name(), ?event, "ai action");
                    }
                    let inc_iron = ki.audio().more_off_notes(frame);
                    ki.player().increase_resources(inc_iron);
                    ki.player().increase_resources(inc_iron);
                    period = period_from_ms(frame.render_period_ms(), speed);
                    next += 1;
                    if next >= beats.len() {
                        info!(player = %ki.player().name(), "ai audio done, restarting");
                        next = 0;
                        start = now;
                    }
                }
            }

            if now.duration_since(last_render) >= period {
                ki.launch_due(now);
                let result = ai_render_step(&state, ki.player(), now, speed);
                self.publish(&state, &result).await;
                last_render = now;
            }

            let render_at = last_render + period;
            let deadline = beats
                .get(next)
                .map(|b| (start + scaled_ms(b.time, speed)).min(render_at))
                .unwrap_or(render_at);
            sleep_until(deadline.into()).await;
        }
        info!(player = %ki.player().name(), lost = ki.player().has_lost(), "ai loop ended");
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    /// Every human player and observer.
    fn audience(&self, state: &GameState) -> Vec<String> {
        state
            .humans()
            .map(|s| s.name.clone())
            .chain(self.observers())
            .collect()
    }

    async fn broadcast(&self, state: &GameState, msg: ServerMessage) {
        for user in self.audience(state) {
            self.mailboxes.send(&user, msg.clone()).await;
        }
    }

    /// Report losses and the winner of a step.
    async fn publish(&self, state: &GameState, result: &TickResult) {
        log_events(result);
        for name in &result.lost {
            if state.humans().any(|s| s.name == *name) {
                self.mailboxes.send(name, ServerMessage::game_end(MSG_LOST)).await;
            }
        }
        if !result.match_ended {
            return;
        }
        *lock(&self.winner) = result.winner.clone();
        if let (Some(winner), Some(msg)) = (&result.winner, result.win_message()) {
            info!(game_id = %self.id, %winner, "game won");
            let mut recipients = self.observers();
            if state.humans().any(|s| s.name == *winner) {
                recipients.push(winner.clone());
            }
            for user in recipients {
                self.mailboxes.send(&user, ServerMessage::game_end(msg.clone())).await;
            }
        }
    }

    async fn send_scouted(&self, state: &GameState) {
        let scouted: Vec<(String, Vec<UnitsUpdate>)> = state
            .humans()
            .map(|s| {
                let updates = scouted_neurons(&s.player)
                    .into_iter()
                    .map(|(color, neurons)| UnitsUpdate { neurons, color })
                    .collect();
                (s.name.clone(), updates)
            })
            .collect();
        for (user, updates) in scouted {
            for update in updates {
                self.mailboxes.post(&user, ServerMessage::SetUnits(update)).await;
            }
        }
    }

    /// `init_game` (`update == false`) or `update_game` for every view.
    async fn send_transfers(&self, state: &GameState, audio_played: f64, update: bool) {
        let shared = Transfer::shared(state, audio_played, !update);
        let new_neurons: Vec<UnitsUpdate> = state
            .seats()
            .iter()
            .map(|s| UnitsUpdate {
                neurons: s.player.take_new_neurons(),
                color: s.player.color(),
            })
            .filter(|u| !u.neurons.is_empty())
            .collect();
        let wrap = |t: Transfer| {
            if update {
                ServerMessage::UpdateGame(t)
            } else {
                ServerMessage::InitGame(t)
            }
        };

        let personal: Vec<(String, ServerMessage)> = state
            .humans()
            .map(|s| (s.name.clone(), wrap(shared.clone().with_player(&s.player))))
            .collect();
        for (user, msg) in personal {
            if update {
                self.mailboxes.post(&user, msg).await;
            } else {
                self.mailboxes.send(&user, msg).await;
            }
        }
        for observer in self.observers() {
            if update {
                self.mailboxes.post(&observer, wrap(shared.clone())).await;
            } else {
                self.mailboxes.send(&observer, wrap(shared.clone())).await;
            }
            for units in &new_neurons {
                self.mailboxes.post(&observer, ServerMessage::SetUnits(units.clone())).await;
            }
        }
    }
}

/// Launch up to `num` potentials, spaced out, then report the outcome.
async fn launch_potentials(
    mailboxes: Mailboxes,
    player: Arc<Player>,
    username: String,
    synapse: Position,
    kind: PotentialKind,
    num: usize,
) {
    let mut success = false;
    for i in 0..num {
        if i > 0 {
            tokio::time::sleep(LAUNCH_SPACING).await;
        }
        match player.add_potential(synapse, kind, Instant::now()) {
            Ok(_) => success = true,
            Err(e) => {
                debug!(%synapse, error = %e, "launch failed");
                success = false;
                break;
            }
        }
    }
    let msg = if success { MSG_SUCCESS } else { MSG_FAILED };
    mailboxes.send(&username, ServerMessage::set_msg(msg)).await;
}

fn log_events(result: &TickResult) {
    for event in &result.events {
        debug!(tick = event.tick, priority = ?event.priority, data = ?event.data, "game event");
    }
}

/// `ms / speed` as a duration; falls back to the initial period.
fn period_from_ms(ms: f64, speed: f64) -> Duration {
    Duration::try_from_secs_f64(ms / 1000.0 / speed)
        .unwrap_or_else(|_| Duration::from_secs_f64(INITIAL_RENDER_MS / 1000.0))
}

fn scaled_ms(ms: u64, speed: f64) -> Duration {
    Duration::from_millis(ms).div_f64(speed)
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

/// All games of a server.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: AsyncRwLock<BTreeMap<Uuid, Arc<GameSession>>>,
    user_sessions: AsyncRwLock<BTreeMap<String, Uuid>>,
}

impl SessionManager {
    /// Create new session manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session.
    pub async fn insert(&self, session: Arc<GameSession>) -> Uuid {
        let id = session.id();
        self.sessions.write().await.insert(id, session);
        id
    }

    /// Get a session by id.
    pub async fn get(&self, id: &Uuid) -> Option<Arc<GameSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Session a user takes part in.
    pub async fn get_user_session(&self, user: &str) -> Option<Arc<GameSession>> {
        let id = self.user_sessions.read().await.get(user).copied()?;
        self.get(&id).await
    }

    /// Record that `user` takes part in session `id`.
    pub async fn register_user(&self, user: &str, id: Uuid) {
        self.user_sessions.write().await.insert(user.to_string(), id);
    }

    /// Forget the session of `user`.
    pub async fn unregister_user(&self, user: &str) {
        self.user_sessions.write().await.remove(user);
    }

    /// Remove a session.
    pub async fn remove(&self, id: &Uuid) {
        self.sessions.write().await.remove(id);
    }

    /// Number of sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Oldest game still waiting for players.
    pub async fn oldest_waiting(&self) -> Option<Arc<GameSession>> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.status() == GameStatus::WaitingForPlayers)
            .min_by_key(|s| s.created_at())
            .cloned()
    }

    /// Drop closed sessions and the users pointing at them.
    pub async fn cleanup(&self) {
        let closed: Vec<Uuid> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, s)| s.status() == GameStatus::Closed)
            .map(|(id, _)| *id)
            .collect();
        if closed.is_empty() {
            return;
        }
        {
            let mut sessions = self.sessions.write().await;
            for id in &closed {
                sessions.remove(id);
            }
        }
        self.user_sessions.write().await.retain(|_, id| !closed.contains(id));
        info!(removed = closed.len(), "closed games removed");
    }

    /// Stop every game.
    pub async fn shutdown_all(&self) {
        for session in self.sessions.read().await.values() {
            session.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::audio::BeatFrame;
    use crate::game::resource::ResourceKind;

    fn audio(name: &str, beats: u64, spacing_ms: u64) -> AnalyzedAudio {
        let frames = (0..beats)
            .map(|i| BeatFrame {
                time: i * spacing_ms,
                bpm: 120.0,
                level: (i % 5) as f64 / 5.0,
                notes: vec![(50 + i % 20) as u8],
                off_note: i % 2 == 0,
                minor: i % 3 == 0,
            })
            .collect();
        AnalyzedAudio::from_frames(name, frames).unwrap()
    }

    fn preset() -> Vec<String> {
        let mut rows = vec![".".repeat(30); 11];
        rows[5].replace_range(3..4, "D");
        rows[5].replace_range(26..27, "D");
        rows[3].replace_range(3..4, "k");
        rows
    }

    fn config() -> SessionConfig {
        SessionConfig {
            linger: Duration::ZERO,
            preset_map: Some(preset()),
            ..Default::default()
        }
    }

    async fn mailbox(mailboxes: &Mailboxes, user: &str) -> mpsc::Receiver<ServerMessage> {
        let (tx, rx) = mpsc::channel(1024);
        mailboxes.register(user, tx).await;
        rx
    }

    async fn expect<F>(rx: &mut mpsc::Receiver<ServerMessage>, pred: F) -> ServerMessage
    where
        F: Fn(&ServerMessage) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(msg) if pred(&msg) => return msg,
                    Some(_) => continue,
                    None => panic!("mailbox closed"),
                }
            }
        })
        .await
        .expect("expected message")
    }

    fn drain(mut rx: mpsc::Receiver<ServerMessage>) {
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
    }

    #[tokio::test]
    async fn test_single_player_starts() {
        let mailboxes = Mailboxes::new();
        let mut rx = mailbox(&mailboxes, "alice").await;
        let session = Arc::new(GameSession::new(
            "alice",
            GameMode::SinglePlayer,
            audio("song.mp3", 400, 500),
            Vec::new(),
            config(),
            mailboxes,
        ));
        session.initialize().await.unwrap();
        assert_eq!(session.status(), GameStatus::Running);

        let init = expect(&mut rx, |m| matches!(m, ServerMessage::InitGame(_))).await;
        let ServerMessage::InitGame(transfer) = init else { unreachable!() };
        assert!(transfer.players.contains_key("alice"));
        assert!(transfer.players.contains_key("AI (song)"));
        assert_eq!(transfer.field.as_ref().map(Vec::len), Some(11));
        assert_eq!(transfer.audio_played, 0.0);
        assert!(!transfer.resources.is_empty());

        expect(&mut rx, |m| matches!(m, ServerMessage::UpdateGame(_))).await;
        session.shutdown();
        drain(rx);
        tokio::time::timeout(Duration::from_secs(5), session.wait_closed()).await.unwrap();
        assert_eq!(session.status(), GameStatus::Closed);
        assert!(session.state().is_none());
    }

    #[tokio::test]
    async fn test_multiplayer_waits_for_seats() {
        let mailboxes = Mailboxes::new();
        let mut host_rx = mailbox(&mailboxes, "alice").await;
        let mut bob_rx = mailbox(&mailboxes, "bob").await;
        let manager = SessionManager::new();
        let session = Arc::new(GameSession::new(
            "alice",
            GameMode::MultiPlayer,
            audio("song.mp3", 400, 500),
            Vec::new(),
            config(),
            mailboxes,
        ));
        manager.insert(session.clone()).await;
        session.initialize().await.unwrap();
        assert_eq!(session.status(), GameStatus::WaitingForPlayers);
        let msg = expect(&mut host_rx, |m| matches!(m, ServerMessage::PrintMsg(_))).await;
        assert_eq!(msg, ServerMessage::print_msg(MSG_WAITING));

        let waiting = manager.oldest_waiting().await.unwrap();
        assert_eq!(waiting.id(), session.id());
        assert!(matches!(
            waiting.join("alice", None, None).await,
            Err(SessionError::NameTaken(_))
        ));
        waiting.join("bob", Some(30), None).await.unwrap();
        assert_eq!(session.dimensions(), (30, 80));
        assert_eq!(session.status(), GameStatus::Running);
        assert!(manager.oldest_waiting().await.is_none());
        expect(&mut bob_rx, |m| matches!(m, ServerMessage::InitGame(_))).await;

        // bob resigns: alice wins by resignation
        session
            .handle_command(Command::new("resign", "bob", json!(null)))
            .await
            .unwrap();
        let resigned = ServerMessage::game_end(MSG_OPPONENT_RESIGNED);
        let end = expect(&mut host_rx, |m| *m == resigned).await;
        assert_eq!(end, resigned);
        assert_eq!(session.winner().as_deref(), Some("alice"));
        drain(host_rx);
        drain(bob_rx);
        tokio::time::timeout(Duration::from_secs(5), session.wait_closed()).await.unwrap();
        manager.cleanup().await;
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_commands_reach_player() {
        let mailboxes = Mailboxes::new();
        let mut rx = mailbox(&mailboxes, "alice").await;
        let session = Arc::new(GameSession::new(
            "alice",
            GameMode::SinglePlayer,
            audio("song.mp3", 400, 500),
            Vec::new(),
            config(),
            mailboxes,
        ));
        session.initialize().await.unwrap();

        session
            .handle_command(Command::new("add_iron", "alice", json!({"resource": "potassium"})))
            .await
            .unwrap();
        let msg = expect(&mut rx, |m| matches!(m, ServerMessage::SetMsg(_))).await;
        assert_eq!(msg, ServerMessage::set_msg("Distribute iron: done!"));

        session
            .handle_command(Command::new("teleport", "alice", json!({})))
            .await
            .unwrap();
        let msg = expect(&mut rx, |m| matches!(m, ServerMessage::SetMsg(_))).await;
        assert_eq!(msg, ServerMessage::set_msg("unknown command: teleport"));

        let err = session
            .handle_command(Command::new("add_iron", "AI (song)", json!({"resource": "potassium"})))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::UnknownUser(_)));
        session.shutdown();
    }

    #[tokio::test]
    async fn test_staggered_launch_reports_success() {
        let mailboxes = Mailboxes::new();
        let mut rx = mailbox(&mailboxes, "alice").await;
        let session = Arc::new(GameSession::new(
            "alice",
            GameMode::SinglePlayer,
            audio("song.mp3", 400, 500),
            Vec::new(),
            config(),
            mailboxes,
        ));
        let state = session.start_for_test().await;
        let alice = state.player("alice").unwrap();
        for kind in ResourceKind::ALL {
            alice.set_resource(kind, 60.0);
        }
        session
            .handle_command(Command::new("build_neuron", "alice", json!({"unit": "synapse", "pos": [5, 5]})))
            .await
            .unwrap();
        expect(&mut rx, |m| matches!(m, ServerMessage::SetUnit(_))).await;
        session
            .handle_command(Command::new("check_build_potential", "alice", json!({"unit": "epsp", "num": 2})))
            .await
            .unwrap();
        let msg = expect(&mut rx, |m| matches!(m, ServerMessage::SetMsg(_))).await;
        assert_eq!(msg, ServerMessage::set_msg(MSG_SUCCESS));
        assert_eq!(alice.statistics().potentials_launched.get(&crate::game::costs::UnitKind::Epsp), Some(&2));
        session.shutdown();
    }

    #[tokio::test]
    async fn test_time_up_ends_game() {
        let mailboxes = Mailboxes::new();
        let mut rx = mailbox(&mailboxes, "watcher").await;
        let session = Arc::new(GameSession::new(
            "watcher",
            GameMode::Observer,
            audio("short.mp3", 4, 20),
            Vec::new(),
            config(),
            mailboxes,
        ));
        session.initialize().await.unwrap();
        let init = expect(&mut rx, |m| matches!(m, ServerMessage::InitGame(_))).await;
        let ServerMessage::InitGame(transfer) = init else { unreachable!() };
        assert!(transfer.players.contains_key("AI (short)"));
        assert!(transfer.players.contains_key("AI (short) #2"));
        assert!(transfer.resources.is_empty());

        let end = expect(&mut rx, |m| matches!(m, ServerMessage::GameEnd(_))).await;
        assert_eq!(end, ServerMessage::game_end(MSG_TIME_UP));
        drain(rx);
        tokio::time::timeout(Duration::from_secs(5), session.wait_closed()).await.unwrap();
        assert_eq!(session.winner(), None);
    }

    #[tokio::test]
    async fn test_unplayable_map_closes_game() {
        let mailboxes = Mailboxes::new();
        let mut rx = mailbox(&mailboxes, "alice").await;
        let config = SessionConfig {
            preset_map: Some(vec!["......".to_string(); 3]),
            ..config()
        };
        let session = Arc::new(GameSession::new(
            "alice",
            GameMode::SinglePlayer,
            audio("song.mp3", 10, 500),
            Vec::new(),
            config,
            mailboxes,
        ));
        let err = session.initialize().await.unwrap_err();
        assert!(matches!(err, SessionError::Game(GameError::UnplayableMap)));
        let msg = expect(&mut rx, |m| matches!(m, ServerMessage::PrintMsg(_))).await;
        assert_eq!(msg, ServerMessage::print_msg(GameError::UnplayableMap.to_string()));
        assert_eq!(session.status(), GameStatus::Closed);
    }

    #[tokio::test]
    async fn test_host_leaving_lobby_closes_game() {
        let session = Arc::new(GameSession::new(
            "alice",
            GameMode::MultiPlayer,
            audio("song.mp3", 10, 500),
            Vec::new(),
            config(),
            Mailboxes::new(),
        ));
        session.initialize().await.unwrap();
        session.leave("alice").await;
        assert_eq!(session.status(), GameStatus::Closed);
        assert!(matches!(session.join("bob", None, None).await, Err(SessionError::NotWaiting(_))));
    }

    #[tokio::test]
    async fn test_mailbox_post_drops_when_full() {
        let mailboxes = Mailboxes::new();
        let (tx, mut rx) = mpsc::channel(1);
        mailboxes.register("alice", tx).await;
        assert!(mailboxes.post("alice", ServerMessage::set_msg("one")).await);
        assert!(!mailboxes.post("alice", ServerMessage::set_msg("two")).await);
        assert!(!mailboxes.send("nobody", ServerMessage::set_msg("x")).await);
        assert_eq!(rx.recv().await, Some(ServerMessage::set_msg("one")));
        assert_eq!(mailboxes.len().await, 1);
    }

    #[test]
    fn test_period_helpers() {
        assert_eq!(period_from_ms(40.0, 2.0), Duration::from_millis(20));
        assert_eq!(period_from_ms(f64::INFINITY, 1.0), Duration::from_millis(40));
        assert_eq!(scaled_ms(500, 2.0), Duration::from_millis(250));
    }

    impl GameSession {
        async fn start_for_test(self: &Arc<Self>) -> Arc<GameState> {
            lock(&self.lobby).players.push(self.host.clone());
            self.start().await.unwrap()
        }
    }
}
