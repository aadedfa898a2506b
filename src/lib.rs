//! # Dissonance Game Server
//!
//! Authoritative server for Dissonance, a two-player real-time strategy game
//! whose field, economy and AI opponents are driven by an analyzed music track.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    DISSONANCE SERVER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Leaf primitives                           │
//! │  ├── position.rs - Grid positions and distances              │
//! │  ├── rng.rs      - Seeded Xorshift128+ PRNG                  │
//! │  └── sync.rs     - Lock helpers and lock order               │
//! │                                                              │
//! │  audio/          - Beat frames and audio-keyed randomness    │
//! │                                                              │
//! │  game/           - Simulation (no sleeping, no I/O)          │
//! │  ├── field.rs    - Grid, hills, nuclei, walkable graph       │
//! │  ├── player.rs   - Resources, neurons, potentials            │
//! │  ├── collision.rs- IPSP/EPSP encounters                      │
//! │  ├── ai.rs       - Audio-driven AI player                    │
//! │  └── tick.rs     - Beat and render steps                     │
//! │                                                              │
//! │  network/        - Views and game lifecycle                  │
//! │  ├── server.rs   - WebSocket server                          │
//! │  ├── protocol.rs - Command envelope and messages             │
//! │  ├── dispatch.rs - Command handlers                          │
//! │  └── session.rs  - Render loop, AI loops, lobby              │
//! │                                                              │
//! │  settings.rs     - Files under the base directory            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Time
//!
//! Simulation code never reads the clock itself: every time-dependent
//! operation takes `now` and a time scale, so tests drive the game with
//! synthetic instants. Only the session loops in `network/` sleep.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod audio;
pub mod core;
pub mod game;
pub mod network;
pub mod settings;

// Re-export commonly used types
pub use audio::{AnalyzedAudio, BeatFrame};
pub use core::Position;
pub use game::{GameMode, GameState, GameStatus, Player};
pub use network::{GameServer, GameSession, ServerConfig, SessionConfig};
pub use settings::Settings;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
