//! The Gateway (§4.4): terminates client WebSocket sessions, maintains the
//! per-gateway connection table, authenticates the handshake, forwards
//! uplink frames into the Logic Orchestrator, and pushes downlink events
//! back down the socket they belong to.

pub mod auth;
pub mod downlink;
pub mod handshake;
pub mod runtime;
pub mod server;
pub mod session;
pub mod state;
pub mod ws;

pub use auth::{SharedSecretAuthenticator, TokenAuthenticator};
pub use runtime::GatewayRuntime;
pub use server::build_router;
pub use state::GatewayState;
