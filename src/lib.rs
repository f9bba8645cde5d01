//! Call-signaling relay: lets a client and a specialist exchange the
//! offer/answer/ICE handshake for a direct media session over WebSockets.

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod routes;
pub mod session;

pub use config::Config;
pub use error::{AuthError, ConfigError, RelayError};
pub use hub::{Hub, HubConfig, HubHandle, HubStats};
pub use protocol::{Role, SignalKind, SignalMessage, UserId};
pub use session::{CallSession, CallStatus};
