//! Container connection state machine.

use std::fmt;

/// Where a container is in its group session.
///
/// ```text
/// Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected
///                     |                                           ^
///                     +---------- failure / cancel ---------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Not in a group. The only state accepting `connect`.
    #[default]
    Disconnected,
    /// Join handshake in flight.
    Connecting,
    /// Member of a group.
    Connected,
    /// Leaving the group.
    Disconnecting,
}

impl ConnectionState {
    /// Check if a transition to `next` is valid.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }

    /// Whether group traffic is processed in this state.
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}
