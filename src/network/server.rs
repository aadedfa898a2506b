//! WebSocket Game Server
//!
//! Async WebSocket server for the views. Every text frame carries one
//! [`Command`]; the first one names the user of the connection. Replies
//! and snapshots travel back through that user's mailbox.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::game::state::GameMode;
use crate::network::protocol::{Command, InitializeGame, ProtocolError, ServerMessage};
use crate::network::session::{GameSession, Mailboxes, SessionConfig, SessionError, SessionManager};
use crate::settings::{default_base_path, Settings};

/// Shown to a client when no multiplayer game waits.
pub const MSG_NO_WAITING_GAME: &str = "No game is waiting for players.";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Pace of AI players relative to their audio.
    pub ai_speed: f64,
    /// Field rows unless the request names them.
    pub default_lines: i32,
    /// Field columns unless the request names them.
    pub default_cols: i32,
    /// Base directory for analyses and settings.
    pub base_path: PathBuf,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 4444)),
            max_connections: 64,
            ai_speed: 1.0,
            default_lines: 40,
            default_cols: 80,
            base_path: default_base_path(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `DISSONANCE_BIND` and `DISSONANCE_AI_SPEED`.
    /// Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(bind) = std::env::var("DISSONANCE_BIND") {
            match bind.parse() {
                Ok(addr) => config.bind_addr = addr,
                Err(e) => warn!(%bind, error = %e, "ignoring DISSONANCE_BIND"),
            }
        }
        if let Ok(speed) = std::env::var("DISSONANCE_AI_SPEED") {
            match speed.parse::<f64>() {
                Ok(s) if s > 0.0 => config.ai_speed = s,
                _ => warn!(%speed, "ignoring DISSONANCE_AI_SPEED"),
            }
        }
        config
    }

    /// Per-game configuration derived from this one.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            lines: self.default_lines,
            cols: self.default_cols,
            ai_speed: self.ai_speed,
            base_path: self.base_path.clone(),
            ..SessionConfig::default()
        }
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection limit reached.
    #[error("Connection limit reached")]
    ConnectionLimitReached,

    /// Session error.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Malformed or unknown command.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Connected client state.
struct ConnectedClient {
    /// User named by the first command.
    username: Option<String>,
    /// Connection time.
    connected_at: Instant,
    /// Last inbound frame.
    last_activity: Instant,
}

// =============================================================================
// ROUTER
// =============================================================================

/// Routes commands of named users to their games.
#[derive(Clone)]
pub struct Router {
    sessions: Arc<SessionManager>,
    mailboxes: Mailboxes,
    session_config: SessionConfig,
    settings: Settings,
}

impl Router {
    /// Router creating games with `session_config`.
    pub fn new(session_config: SessionConfig) -> Self {
        let settings = Settings::new(session_config.base_path.clone());
        Self {
            sessions: Arc::new(SessionManager::new()),
            mailboxes: Mailboxes::new(),
            session_config,
            settings,
        }
    }

    /// All games.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Outbound channels.
    pub fn mailboxes(&self) -> &Mailboxes {
        &self.mailboxes
    }

    /// Handle one command. Failures are reported to the user as advisories.
    #[instrument(skip(self, cmd), fields(command = %cmd.command, user = %cmd.username))]
    pub async fn route(&self, cmd: Command) {
        let user = cmd.username.clone();
        let result = if cmd.command == "initialize_game" {
            self.initialize_game(cmd).await
        } else {
            self.forward(cmd).await
        };
        match result {
            Ok(()) => {}
            Err(GameServerError::Session(e @ (SessionError::Audio(_) | SessionError::Game(_)))) => {
                warn!(error = %e, "game setup failed");
                self.mailboxes.send(&user, ServerMessage::print_msg(e.to_string())).await;
            }
            Err(GameServerError::Session(SessionError::NoWaitingGame)) => {
                self.mailboxes.send(&user, ServerMessage::print_msg(MSG_NO_WAITING_GAME)).await;
            }
            Err(e) => {
                debug!(error = %e, "command rejected");
                self.mailboxes.send(&user, ServerMessage::set_msg(e.to_string())).await;
            }
        }
    }

    async fn initialize_game(&self, cmd: Command) -> Result<(), GameServerError> {
        let request: InitializeGame = cmd.payload()?;
        let user = cmd.username;

        if request.mode == GameMode::MultiPlayerClient {
            let session = self
                .sessions
                .oldest_waiting()
                .await
                .ok_or(SessionError::NoWaitingGame)?;
            self.sessions.register_user(&user, session.id()).await;
            if let Err(e) = session.join(&user, request.lines, request.cols).await {
                self.sessions.unregister_user(&user).await;
                return Err(e.into());
            }
            return Ok(());
        }

        if let Some(previous) = self.sessions.get_user_session(&user).await {
            previous.leave(&user).await;
        }
        let session = Arc::new(GameSession::load(
            user.clone(),
            &request,
            self.session_config.clone(),
            self.mailboxes.clone(),
        )?);
        let id = self.sessions.insert(session.clone()).await;
        self.sessions.register_user(&user, id).await;
        if let Err(e) = self.settings.add_recently_played(&request.source_path) {
            warn!(error = %e, "recently played not updated");
        }
        session.initialize().await?;
        Ok(())
    }

    async fn forward(&self, cmd: Command) -> Result<(), GameServerError> {
        let session = self
            .sessions
            .get_user_session(&cmd.username)
            .await
            .ok_or_else(|| SessionError::UnknownUser(cmd.username.clone()))?;
        session.handle_command(cmd).await?;
        Ok(())
    }

    /// A user's connection went away.
    pub async fn disconnect(&self, user: &str) {
        if let Some(session) = self.sessions.get_user_session(user).await {
            session.leave(user).await;
        }
        self.sessions.unregister_user(user).await;
        self.mailboxes.unregister(user).await;
    }
}

// =============================================================================
// SERVER
// =============================================================================

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Command routing and games.
    router: Router,
    /// Connected clients.
    clients: Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig) -> Self {
        let session_config = config.session_config();
        Self::with_session_config(config, session_config)
    }

    /// Create a server whose games use `session_config`.
    pub fn with_session_config(config: ServerConfig, session_config: SessionConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            router: Router::new(session_config),
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Command router.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Run the server.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!(
            addr = %listener.local_addr()?,
            version = %self.config.version,
            "Game server listening"
        );

        let cleanup_router = self.router.clone();
        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_router).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        cleanup_handle.abort();
        self.router.sessions.shutdown_all().await;

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let router = self.router.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);

            // Register client
            {
                let mut clients = clients.write().await;
                clients.insert(addr, ConnectedClient {
                    username: None,
                    connected_at: Instant::now(),
                    last_activity: Instant::now(),
                });
            }

            // Spawn message sender task
            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            let mut username: Option<String> = None;

            // Handle incoming messages
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let cmd = match Command::from_json(&text) {
                                    Ok(c) => c,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        let _ = msg_tx.send(ServerMessage::set_msg(e.to_string())).await;
                                        continue;
                                    }
                                };

                                if username.as_deref() != Some(cmd.username.as_str()) && !cmd.username.is_empty() {
                                    if let Some(old) = username.replace(cmd.username.clone()) {
                                        router.disconnect(&old).await;
                                    }
                                    router.mailboxes.register(&cmd.username, msg_tx.clone()).await;
                                    info!(%addr, user = %cmd.username, "user registered");
                                }

                                {
                                    let mut clients = clients.write().await;
                                    if let Some(client) = clients.get_mut(&addr) {
                                        client.last_activity = Instant::now();
                                        client.username = username.clone();
                                    }
                                }

                                router.route(cmd).await;
                            }
                            Some(Ok(Message::Ping(_))) => {
                                debug!("Ping from {}", addr);
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::print_msg("Server shutting down")).await;
                        break;
                    }
                }
            }

            // Cleanup
            sender_task.abort();
            if let Some(user) = &username {
                router.disconnect(user).await;
            }
            if let Some(client) = clients.write().await.remove(&addr) {
                info!(
                    "Client {} cleaned up after {:?}",
                    addr,
                    client.connected_at.elapsed()
                );
            }
        });
    }

    /// Drop closed games every few seconds.
    async fn run_cleanup_loop(router: Router) {
        let mut interval = interval(Duration::from_secs(5));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            router.sessions.cleanup().await;
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Get active session count.
    pub async fn session_count(&self) -> usize {
        self.router.sessions.session_count().await
    }

    /// Users named by their connections.
    pub async fn connected_users(&self) -> Vec<String> {
        self.clients
            .read()
            .await
            .values()
            .filter_map(|c| c.username.clone())
            .collect()
    }

    /// Time since the most recent inbound frame of any client.
    pub async fn idle_for(&self) -> Option<Duration> {
        self.clients
            .read()
            .await
            .values()
            .map(|c| c.last_activity.elapsed())
            .min()
    }
}
