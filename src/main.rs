//! Dissonance Game Server
//!
//! Runs the WebSocket server, or with `--only-ai` a headless game between
//! two AI players.

use std::fs::File;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dissonance::{
    network::{session::Mailboxes, protocol::InitializeGame},
    settings::default_base_path,
    GameMode, GameServer, GameSession, ServerConfig, Settings, VERSION,
};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
    /// Remove old log files before starting
    #[arg(short = 'c', long)]
    clear_log: bool,

    /// warn, info or debug
    #[arg(short = 'l', long, default_value = "warn")]
    log_level: String,

    /// Base directory for analyses, settings and logs
    #[arg(short = 'p', long)]
    base_path: Option<PathBuf>,

    /// Accept connections from other hosts
    #[arg(short = 'm', long)]
    multiplayer: bool,

    /// Run only the server
    #[arg(short = 's', long)]
    standalone: bool,

    /// Connect a view to a running server (ws://host:port)
    #[arg(short = 'z', long, value_name = "URL")]
    connect: Option<String>,

    /// Let two AI players play without views
    #[arg(long)]
    only_ai: bool,

    /// Map audio for --only-ai
    #[arg(long)]
    map_sound: Option<String>,

    /// Audio of the first AI
    #[arg(long)]
    ai1_sound: Option<String>,

    /// Audio of the second AI
    #[arg(long)]
    ai2_sound: Option<String>,

    /// Server port
    #[arg(long, default_value_t = 4444)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let base_path = args.base_path.clone().unwrap_or_else(default_base_path);
    let settings = Settings::new(&base_path);
    if args.clear_log {
        settings.clear_logs()?;
    }
    init_tracing(&settings, &args.log_level)?;
    info!("Dissonance Server v{}", VERSION);

    if let Some(url) = &args.connect {
        warn!(%url, "this binary has no view; connect a view to the server instead");
        return Ok(());
    }

    if args.only_ai {
        return run_ai_game(&args, base_path).await;
    }
    if !args.standalone {
        info!("no local view, running the server only");
    }

    let mut config = ServerConfig::from_env();
    config.base_path = base_path;
    let host = if args.multiplayer { [0, 0, 0, 0] } else { [127, 0, 0, 1] };
    config.bind_addr = SocketAddr::from((host, args.port));

    let server = Arc::new(GameServer::new(config));
    let ctrl_c = {
        let server = server.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted");
                server.shutdown();
            }
        })
    };
    server.run().await?;
    ctrl_c.abort();
    Ok(())
}

fn init_tracing(settings: &Settings, level: &str) -> Result<()> {
    let level = match level {
        "warn" | "info" | "debug" => level,
        other => bail!("unknown log level {other:?}, expected warn, info or debug"),
    };
    settings.ensure_dirs()?;
    let path = settings.log_file_path(chrono::Local::now());
    let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init()
        .map_err(|e| anyhow::anyhow!("installing log subscriber: {e}"))?;
    Ok(())
}

/// AI against AI on a 50x50 field.
async fn run_ai_game(args: &Args, base_path: PathBuf) -> Result<()> {
    let map_sound = args
        .map_sound
        .clone()
        .context("--only-ai needs --map-sound")?;
    let request = InitializeGame {
        source_path: map_sound,
        base_path: None,
        ais: [&args.ai1_sound, &args.ai2_sound].into_iter().flatten().cloned().collect(),
        mode: GameMode::AiGame,
        lines: Some(50),
        cols: Some(50),
        num_players: None,
    };
    let mut config = ServerConfig::from_env().session_config();
    config.base_path = base_path;

    let session = Arc::new(GameSession::load("ai-game", &request, config, Mailboxes::new())?);
    info!(game_id = %session.id(), audio = %session.audio().source(), "AI game");
    session.initialize().await?;
    session.wait_closed().await;
    match session.winner() {
        Some(winner) => info!(%winner, "AI game finished"),
        None => info!("AI game finished without a winner"),
    }
    Ok(())
}
