use std::net::SocketAddr;

use crate::net::PlayerId;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    ClientAccepted {
        player: PlayerId,
        addr: Option<SocketAddr>,
    },
    JoinDenied {
        addr: Option<SocketAddr>,
        reason: String,
    },
    PlayerApproved {
        player: PlayerId,
        name: String,
    },
    PlayerRemoved {
        player: PlayerId,
        name: String,
        reason: DisconnectReason,
    },
    HostLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed its end of the connection.
    Graceful,
    Kicked,
    SendFailed,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Kicked => "kicked",
            DisconnectReason::SendFailed => "send failed",
        }
    }
}
