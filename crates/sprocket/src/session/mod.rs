mod client;
mod events;
mod host;

use std::collections::VecDeque;
use std::net::{SocketAddr, TcpListener};

pub use events::{DisconnectReason, SessionEvent};

use crate::config::NetConfig;
use crate::lobby::{Advertiser, DiscoveryError};
use crate::net::{
    Connection, Endpoint, FaultInjection, Frame, MAX_PLAYERS, Message, MessageCounter,
    MessageHeader, MessageKind, NetworkStats, OsErrorCode, PlayerId, SendError, SocketError,
    SocketHandle, TerminationReason,
};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("only the host can do that")]
    NotHosting,
    #[error("{0} is not a valid player")]
    InvalidPlayer(Endpoint),
    #[error("{0} is not awaiting a handshake")]
    BadState(PlayerId),
    #[error("expected a join request, got '{0}'")]
    NotJoinRequest(MessageKind),
    #[error("the host never sends to itself")]
    HostToHost,
    #[error("the host cannot kick itself")]
    KickHost,
    #[error("send to {to} failed: {source}")]
    Send { to: PlayerId, source: SendError },
    #[error("not connected to the host")]
    Disconnected,
}

impl SessionError {
    /// Programming errors rather than network conditions.
    pub fn is_invariant(&self) -> bool {
        matches!(
            self,
            SessionError::NotHosting
                | SessionError::InvalidPlayer(_)
                | SessionError::BadState(_)
                | SessionError::NotJoinRequest(_)
                | SessionError::HostToHost
                | SessionError::KickHost
                | SessionError::Send {
                    source: SendError::Codec(_),
                    ..
                }
        )
    }

    pub fn os_code(&self) -> Option<OsErrorCode> {
        match self {
            SessionError::Socket(e) => Some(e.os_code()),
            SessionError::Discovery(e) => e.os_code(),
            SessionError::Send {
                source: SendError::Io(e),
                ..
            } => Some(OsErrorCode::of(e)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Offline,
    AwaitingHandshake,
    ConnectedPeer,
    Me,
}

impl PlayerState {
    pub fn is_active(self) -> bool {
        matches!(self, PlayerState::Me | PlayerState::ConnectedPeer)
    }
}

#[derive(Debug)]
pub struct PlayerSlot {
    pub id: PlayerId,
    pub state: PlayerState,
    pub name: String,
    /// Host side only. Clients have no direct link to other players.
    connection: Option<Connection>,
}

impl PlayerSlot {
    fn new(id: PlayerId) -> Self {
        Self {
            id,
            state: PlayerState::Offline,
            name: String::new(),
            connection: None,
        }
    }

    fn reset(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
        self.state = PlayerState::Offline;
        self.name.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(Connection::is_open)
    }

    pub fn stats(&self) -> Option<&NetworkStats> {
        self.connection.as_ref().map(Connection::stats)
    }
}

/// One network game: the host's listener and per-player links, or a client's
/// single link to the host.
#[derive(Debug)]
pub struct Session {
    hosting: bool,
    my_id: Option<PlayerId>,
    players: [PlayerSlot; MAX_PLAYERS],
    listener: SocketHandle<TcpListener>,
    advertiser: Option<Advertiser>,
    upstream: Option<Connection>,
    counter: MessageCounter,
    inbox: VecDeque<Frame>,
    pending_events: VecDeque<SessionEvent>,
    config: NetConfig,
}

impl Session {
    fn alloc(hosting: bool, config: &NetConfig) -> Self {
        let players = std::array::from_fn(|slot| {
            PlayerSlot::new(PlayerId::new(slot).unwrap_or(PlayerId::HOST))
        });
        Self {
            hosting,
            my_id: None,
            players,
            listener: SocketHandle::closed(),
            advertiser: None,
            upstream: None,
            counter: MessageCounter::default(),
            inbox: VecDeque::new(),
            pending_events: VecDeque::new(),
            config: config.clone(),
        }
    }

    pub fn is_hosting(&self) -> bool {
        self.hosting
    }

    pub fn my_id(&self) -> Option<PlayerId> {
        self.my_id
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn players(&self) -> &[PlayerSlot] {
        &self.players
    }

    pub fn player(&self, id: PlayerId) -> &PlayerSlot {
        &self.players[id.slot()]
    }

    pub fn num_active_players(&self) -> usize {
        self.players.iter().filter(|p| p.state.is_active()).count()
    }

    /// The nth player, in slot order, that is either us or a connected peer.
    pub fn nth_active_player_id(&self, n: usize) -> Option<PlayerId> {
        self.players
            .iter()
            .filter(|p| p.state.is_active())
            .nth(n)
            .map(|p| p.id)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = SessionEvent> + '_ {
        self.pending_events.drain(..)
    }

    /// Builds a frame from us. The header is fully stamped and ready to send.
    pub fn new_frame(&mut self, to: Endpoint, message: Message) -> Frame {
        let mut header = MessageHeader::cleared(&mut self.counter);
        header.from = self.my_id.map_or(Endpoint::Unspecified, Endpoint::Player);
        header.to = to;
        Frame::stamp(&mut header, &message);
        Frame { header, message }
    }

    pub fn send(&mut self, frame: &Frame) -> Result<(), SessionError> {
        if self.hosting {
            self.host_send(frame)
        } else {
            self.client_send(frame)
        }
    }

    pub fn send_message(&mut self, to: Endpoint, message: Message) -> Result<(), SessionError> {
        let frame = self.new_frame(to, message);
        self.send(&frame)
    }

    /// Polls the network once and hands back the oldest pending frame.
    pub fn get(&mut self) -> Option<Frame> {
        if self.hosting {
            self.host_poll();
        } else {
            self.client_poll();
        }
        self.inbox.pop_front()
    }

    /// Traffic counters for the link to `id`. A client only has one, to the host.
    pub fn stats(&self, id: PlayerId) -> Option<&NetworkStats> {
        if self.hosting {
            self.players[id.slot()].stats()
        } else if id.is_host() {
            self.upstream.as_ref().map(Connection::stats)
        } else {
            None
        }
    }

    /// `id` is ignored on a client, whose only link is to the host.
    pub fn inject_faults(&mut self, id: PlayerId, faults: FaultInjection) -> bool {
        let connection = if self.hosting {
            self.players[id.slot()].connection.as_mut()
        } else {
            self.upstream.as_mut()
        };
        match connection {
            Some(connection) => {
                connection.set_faults(faults);
                true
            }
            None => false,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.get().and_then(|l| l.local_addr().ok())
    }

    /// Tears down every socket. A host with `force_terminate` first tells
    /// all players the game is over.
    pub fn dispose(&mut self, force_terminate: bool) {
        if self.hosting && force_terminate {
            let bye = self.new_frame(
                Endpoint::AllPlayers,
                Message::GameTerminated {
                    reason: TerminationReason::HostBailed,
                },
            );
            for slot in &mut self.players {
                if slot.state != PlayerState::ConnectedPeer {
                    continue;
                }
                if let Some(connection) = slot.connection.as_mut() {
                    if let Err(e) = connection.send(&bye) {
                        log::warn!("Could not tell {} the game ended: {}", slot.id, e);
                    }
                }
            }
        }

        if let Some(mut upstream) = self.upstream.take() {
            upstream.close();
        }
        if self.listener.close() {
            log::info!("Closed listening socket");
        }
        if let Some(mut advertiser) = self.advertiser.take() {
            advertiser.stop();
        }
        for slot in &mut self.players {
            slot.reset();
        }
        self.inbox.clear();
        self.my_id = None;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dispose(false);
    }
}
