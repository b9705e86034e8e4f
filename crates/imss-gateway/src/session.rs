use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

/// Per-session lifecycle (§4.4): `Handshake → Authenticated → Active ⇄ Idle →
/// Closing → Closed`. The message loop moves a client between `Active` and
/// `Idle` on frame traffic; a read error or missed-heartbeat threshold moves
/// it to `Closing`, after which the connection is torn down and the state
/// becomes terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshake,
    Authenticated,
    Active,
    Idle,
    Closing,
    Closed,
}

impl SessionState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

/// Builds the opaque connection id per §3's data model: unique per process,
/// not parsed by anything downstream.
#[must_use]
pub fn new_connection_id(user_id: i64, now_ns: u128) -> String {
    format!("conn-{user_id}-{now_ns}")
}

/// A client currently connected to this gateway instance.
pub struct ConnectedClient {
    pub conn_id: String,
    pub user_id: i64,
    pub state: SessionState,
    pub sender: mpsc::UnboundedSender<String>,
    pub connected_at: Instant,
    pub last_heartbeat: Instant,
    /// Cancels this connection's read loop (`handle_connection`'s uplink
    /// loop selects on this); set on eviction so a replaced socket actually
    /// stops, rather than merely becoming unreachable through the registry.
    pub cancel: CancellationToken,
    /// Aborts this connection's write-loop task, so an evicted socket's
    /// underlying TCP connection is torn down immediately instead of idling
    /// until the client notices or the heartbeat timeout fires.
    pub write_handle: AbortHandle,
}

impl ConnectedClient {
    /// Sends a pre-serialized wire frame to this client's write loop.
    /// Returns `false` if the write loop has already gone away.
    pub fn send(&self, frame: &str) -> bool {
        self.sender.send(frame.to_string()).is_ok()
    }

    /// Stops this connection's read and write tasks. Used when eviction
    /// replaces this client's registry entry with a new local session.
    pub fn evict(&self) {
        self.cancel.cancel();
        self.write_handle.abort();
    }

    pub fn touch_heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
        if self.state == SessionState::Idle {
            self.state = SessionState::Active;
        }
    }

    /// True once more than `threshold` has elapsed without a heartbeat —
    /// the Active→Closing trigger described in §4.4.
    #[must_use]
    pub fn heartbeat_expired(&self, threshold: std::time::Duration) -> bool {
        self.last_heartbeat.elapsed() > threshold
    }
}
