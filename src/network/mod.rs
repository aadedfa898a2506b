//! Network Layer
//!
//! WebSocket server for the views. Games run in sessions; the simulation
//! itself lives in `game/`.
//!
//! - `protocol`: Command envelope, payloads and outbound messages
//! - `dispatch`: Command handlers
//! - `session`: Game lifecycle, render and AI loops
//! - `server`: Connections and routing

pub mod protocol;
pub mod dispatch;
pub mod session;
pub mod server;

pub use protocol::{Command, ProtocolError, ServerMessage, Transfer};
pub use dispatch::{dispatch, HandlerContext, Reply};
pub use session::{GameSession, Mailboxes, SessionConfig, SessionError, SessionManager};
pub use server::{GameServer, GameServerError, Router, ServerConfig};
