//! Network Layer
//!
//! WebSocket transport for authoritative matches.
//! Game rules never run here directly; sessions drive them through `game::pipeline`.

pub mod protocol;
pub mod session;
pub mod client;
pub mod server;

pub use protocol::{ClientMessage, ErrorCode, MatchId, ProtocolError, ServerError, ServerMessage};
pub use session::{dispatch_all, Delivery, MatchSession, Outgoing, SessionConfig, SessionError, SessionManager};
pub use client::{connect, ChannelSink, ClientDriver, ClientError, Connection, DriverExit, DriverInput};
pub use server::{GameServer, GameServerError, ServerConfig};
