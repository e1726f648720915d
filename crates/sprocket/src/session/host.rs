use std::collections::VecDeque;
use std::io;
use std::time::Instant;

use super::{DisconnectReason, PlayerState, Session, SessionError, SessionEvent};
use crate::config::NetConfig;
use crate::lobby::Advertiser;
use crate::net::socket::{configure_stream, is_would_block, listen_tcp};
use crate::net::{
    Connection, Endpoint, Frame, MAX_PLAYERS, Message, PLAYER_NAME_LENGTH, PlayerId, PollResult,
    SendError, SocketError, SocketHandle, TerminationReason, truncate_name,
};

const GAME_FULL: &str = "THE GAME IS FULL.";

impl Session {
    /// Opens the listening socket. The host always takes slot 0.
    pub fn host(config: &NetConfig) -> Result<Self, SessionError> {
        let listener = listen_tcp(config.listen_addr())?;

        let mut session = Session::alloc(true, config);
        session.listener = SocketHandle::new(listener);
        session.my_id = Some(PlayerId::HOST);

        let me = &mut session.players[PlayerId::HOST.slot()];
        me.state = PlayerState::Me;
        me.name = truncate_name(&config.player_name, PLAYER_NAME_LENGTH).to_string();
        log::info!("Hosting a game as '{}'", me.name);

        Ok(session)
    }

    pub fn num_clients(&self) -> usize {
        self.players
            .iter()
            .filter(|p| p.state == PlayerState::ConnectedPeer)
            .count()
    }

    fn connected_peers(&self) -> Vec<PlayerId> {
        self.players
            .iter()
            .filter(|p| p.state == PlayerState::ConnectedPeer)
            .map(|p| p.id)
            .collect()
    }

    /// Takes at most one pending connection. A full game gets a denial and
    /// no slot.
    pub fn accept_new_client(&mut self) -> Result<Option<PlayerId>, SessionError> {
        if !self.hosting {
            return Err(SessionError::NotHosting);
        }
        let Some(listener) = self.listener.get() else {
            return Ok(None);
        };

        let (stream, addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if is_would_block(&e) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => return Ok(None),
            Err(e) => return Err(SocketError::Io(e).into()),
        };
        configure_stream(&stream)?;
        let mut connection = Connection::new(stream, self.config.max_outbound_backlog);

        let Some(slot) = self
            .players
            .iter()
            .position(|p| p.state == PlayerState::Offline)
        else {
            log::warn!("{} wants to connect, but the game is full", addr);
            let denied = self.new_frame(
                Endpoint::Unspecified,
                Message::JoinDenied {
                    reason: GAME_FULL.to_string(),
                },
            );
            if let Err(e) = connection.send(&denied) {
                log::warn!("Could not deny {}: {}", addr, e);
            }
            connection.close();
            self.pending_events.push_back(SessionEvent::JoinDenied {
                addr: Some(addr),
                reason: GAME_FULL.to_string(),
            });
            return Ok(None);
        };

        let player = &mut self.players[slot];
        player.state = PlayerState::AwaitingHandshake;
        player.name = format!("PLAYER {}", slot);
        player.connection = Some(connection);
        let id = player.id;

        log::info!("Accepted client {} from {}", id, addr);
        self.pending_events.push_back(SessionEvent::ClientAccepted {
            player: id,
            addr: Some(addr),
        });
        Ok(Some(id))
    }

    /// Completes the handshake for a player that sent a join request.
    ///
    /// The joiner hears about every existing player before any of them hears
    /// about the joiner.
    pub fn ack_join_request(&mut self, frame: &Frame) -> Result<(), SessionError> {
        if !self.hosting {
            return Err(SessionError::NotHosting);
        }
        let Message::JoinRequest { name } = &frame.message else {
            return Err(SessionError::NotJoinRequest(frame.kind()));
        };
        let id = frame
            .header
            .from
            .player()
            .filter(|id| !id.is_host())
            .ok_or(SessionError::InvalidPlayer(frame.header.from))?;
        if self.players[id.slot()].state != PlayerState::AwaitingHandshake {
            return Err(SessionError::BadState(id));
        }

        self.players[id.slot()].name = truncate_name(name, PLAYER_NAME_LENGTH).to_string();

        let approved = self.new_frame(Endpoint::Player(id), Message::JoinApproved);
        self.host_send(&approved)?;

        let player_count = self.num_active_players() as u32 + 1;
        let roster: Vec<(PlayerId, String)> = self
            .players
            .iter()
            .filter(|p| p.state.is_active() && p.id != id)
            .map(|p| (p.id, p.name.clone()))
            .collect();
        for (player, name) in roster {
            let joined = self.new_frame(
                Endpoint::Player(id),
                Message::PlayerJoined {
                    player_count,
                    player,
                    name,
                },
            );
            self.host_send(&joined)?;
        }

        self.players[id.slot()].state = PlayerState::ConnectedPeer;
        let name = self.players[id.slot()].name.clone();
        let player_count = self.num_active_players() as u32;

        for peer in self.connected_peers() {
            if peer == id {
                continue;
            }
            let joined = self.new_frame(
                Endpoint::Player(peer),
                Message::PlayerJoined {
                    player_count,
                    player: id,
                    name: name.clone(),
                },
            );
            if let Err(e) = self.host_send(&joined) {
                log::warn!("Could not tell {} that {} joined: {}", peer, id, e);
            }
        }

        log::info!("'{}' joined as {} ({} players)", name, id, player_count);
        self.pending_events
            .push_back(SessionEvent::PlayerApproved { player: id, name });
        Ok(())
    }

    pub fn kick_client(&mut self, id: PlayerId) -> Result<(), SessionError> {
        if !self.hosting {
            return Err(SessionError::NotHosting);
        }
        if id.is_host() {
            return Err(SessionError::KickHost);
        }
        if self.players[id.slot()].state == PlayerState::Offline {
            return Err(SessionError::InvalidPlayer(Endpoint::Player(id)));
        }
        self.remove_players(id, DisconnectReason::Kicked);
        Ok(())
    }

    /// Frees the slot and tells everyone else. A failed notice queues that
    /// peer for removal too instead of recursing.
    pub(super) fn remove_players(&mut self, first: PlayerId, reason: DisconnectReason) {
        let mut worklist = VecDeque::from([(first, reason)]);

        while let Some((id, reason)) = worklist.pop_front() {
            let state = self.players[id.slot()].state;
            if state == PlayerState::Offline || state == PlayerState::Me {
                continue;
            }

            if reason != DisconnectReason::Graceful && self.players[id.slot()].is_connected() {
                let bye = self.new_frame(
                    Endpoint::Player(id),
                    Message::GameTerminated {
                        reason: TerminationReason::Kicked,
                    },
                );
                if let Some(connection) = self.players[id.slot()].connection.as_mut() {
                    if let Err(e) = connection.send(&bye) {
                        log::debug!("Kick notice to {} not delivered: {}", id, e);
                    }
                }
            }

            let name = std::mem::take(&mut self.players[id.slot()].name);
            self.players[id.slot()].reset();
            log::info!("Removed {} '{}' ({})", id, name, reason.as_str());
            self.pending_events.push_back(SessionEvent::PlayerRemoved {
                player: id,
                name: name.clone(),
                reason,
            });

            if state != PlayerState::ConnectedPeer {
                continue;
            }

            let player_count = self.num_active_players() as u32;
            let left = Message::PlayerLeft {
                player_count,
                player: id,
                name,
            };
            for peer in self.connected_peers() {
                let notice = self.new_frame(Endpoint::Player(peer), left.clone());
                let sent = match self.players[peer.slot()].connection.as_mut() {
                    Some(connection) => connection.send(&notice),
                    None => Err(SendError::Closed),
                };
                if let Err(e) = sent {
                    log::warn!("Could not tell {} that {} left: {}", peer, id, e);
                    worklist.push_back((peer, DisconnectReason::SendFailed));
                }
            }

            let local = self.new_frame(Endpoint::HOST, left);
            self.inbox.push_back(local);
        }
    }

    pub(super) fn host_send(&mut self, frame: &Frame) -> Result<(), SessionError> {
        match frame.header.to {
            Endpoint::AllPlayers => {
                let mut first_error = None;
                for peer in self.connected_peers() {
                    if frame.header.from == Endpoint::Player(peer)
                        || self.players[peer.slot()].state != PlayerState::ConnectedPeer
                    {
                        continue;
                    }
                    if let Err(e) = self.send_to_player(peer, frame) {
                        first_error.get_or_insert(e);
                    }
                }
                first_error.map_or(Ok(()), Err)
            }
            Endpoint::Player(id) if id.is_host() => Err(SessionError::HostToHost),
            Endpoint::Player(id) => self.send_to_player(id, frame),
            Endpoint::Unspecified => Err(SessionError::InvalidPlayer(Endpoint::Unspecified)),
        }
    }

    fn send_to_player(&mut self, id: PlayerId, frame: &Frame) -> Result<(), SessionError> {
        let slot = &mut self.players[id.slot()];
        let connection = match (slot.state, slot.connection.as_mut()) {
            (PlayerState::ConnectedPeer | PlayerState::AwaitingHandshake, Some(connection)) => {
                connection
            }
            _ => return Err(SessionError::InvalidPlayer(Endpoint::Player(id))),
        };

        match connection.send(frame) {
            Ok(()) => Ok(()),
            Err(source @ SendError::Codec(_)) => Err(SessionError::Send { to: id, source }),
            Err(source) => {
                log::warn!("Send of '{}' to {} failed: {}", frame.kind(), id, source);
                self.remove_players(id, DisconnectReason::SendFailed);
                Err(SessionError::Send { to: id, source })
            }
        }
    }

    /// Polls every player socket once. Broadcasts from peers are relayed to
    /// the others, and frames for another client are only forwarded.
    pub(super) fn host_poll(&mut self) {
        for slot in 0..MAX_PLAYERS {
            let id = self.players[slot].id;
            let Some(connection) = self.players[slot].connection.as_mut() else {
                continue;
            };
            let PollResult { frames, closed } = connection.poll();

            for mut frame in frames {
                let state = self.players[slot].state;
                if state == PlayerState::Offline {
                    break;
                }
                frame.header.from = Endpoint::Player(id);
                self.route_inbound(state, frame);
            }

            if closed && self.players[slot].state != PlayerState::Offline {
                log::info!("{} hung up", id);
                self.remove_players(id, DisconnectReason::Graceful);
            }
        }
    }

    fn route_inbound(&mut self, sender_state: PlayerState, frame: Frame) {
        if sender_state != PlayerState::ConnectedPeer {
            self.inbox.push_back(frame);
            return;
        }

        match frame.header.to {
            Endpoint::AllPlayers => {
                if let Err(e) = self.host_send(&frame) {
                    log::warn!(
                        "Relay of '{}' from {} incomplete: {}",
                        frame.kind(),
                        frame.header.from,
                        e
                    );
                }
                self.inbox.push_back(frame);
            }
            Endpoint::Player(target) if !target.is_host() => {
                if self.players[target.slot()].state != PlayerState::ConnectedPeer {
                    log::warn!(
                        "Dropping '{}' from {} for {}, who is not connected",
                        frame.kind(),
                        frame.header.from,
                        target
                    );
                } else if let Err(e) = self.send_to_player(target, &frame) {
                    log::warn!("Forward to {} failed: {}", target, e);
                }
            }
            _ => self.inbox.push_back(frame),
        }
    }

    pub fn start_advertising(&mut self) -> Result<(), SessionError> {
        if !self.hosting {
            return Err(SessionError::NotHosting);
        }
        if self.is_advertising() {
            return Ok(());
        }
        self.advertiser = Some(Advertiser::start(&self.config)?);
        Ok(())
    }

    pub fn stop_advertising(&mut self) -> bool {
        self.advertiser
            .take()
            .is_some_and(|mut advertiser| advertiser.stop())
    }

    pub fn is_advertising(&self) -> bool {
        self.advertiser.as_ref().is_some_and(Advertiser::is_active)
    }

    /// Sends an advertisement if one is due.
    pub fn advertise_tick(&mut self) -> Result<bool, SessionError> {
        match self.advertiser.as_mut() {
            Some(advertiser) => Ok(advertiser.tick(Instant::now())?),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::net::FaultInjection;

    static PORT_COUNTER: AtomicU16 = AtomicU16::new(46500);

    fn host_config() -> NetConfig {
        let port = PORT_COUNTER.fetch_add(2, Ordering::SeqCst);
        NetConfig {
            player_name: String::from("HOSTY"),
            ..NetConfig::loopback(port, port + 1)
        }
    }

    fn accept_one(host: &mut Session) -> PlayerId {
        for _ in 0..500 {
            if let Some(id) = host.accept_new_client().unwrap() {
                return id;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("nobody connected");
    }

    fn next_frame(host: &mut Session) -> Frame {
        for _ in 0..500 {
            if let Some(frame) = host.get() {
                return frame;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("no frame arrived");
    }

    #[test]
    fn test_host_takes_slot_zero() {
        let host = Session::host(&host_config()).unwrap();
        assert!(host.is_hosting());
        assert_eq!(host.my_id(), Some(PlayerId::HOST));
        assert_eq!(host.player(PlayerId::HOST).state, PlayerState::Me);
        assert_eq!(host.player(PlayerId::HOST).name, "HOSTY");
        assert_eq!(host.num_active_players(), 1);
        assert_eq!(host.num_clients(), 0);
    }

    #[test]
    fn test_host_refuses_to_message_itself() {
        let mut host = Session::host(&host_config()).unwrap();
        let err = host
            .send_message(Endpoint::HOST, Message::Null)
            .unwrap_err();
        assert!(matches!(err, SessionError::HostToHost));
        assert!(err.is_invariant());
    }

    #[test]
    fn test_accepted_client_awaits_handshake() {
        let config = host_config();
        let mut host = Session::host(&config).unwrap();
        let _raw = TcpStream::connect(config.listen_addr()).unwrap();

        let id = accept_one(&mut host);
        assert_eq!(id.slot(), 1);
        assert_eq!(host.player(id).state, PlayerState::AwaitingHandshake);
        assert_eq!(host.player(id).name, "PLAYER 1");
        assert_eq!(host.num_active_players(), 1);
        assert!(matches!(
            host.drain_events().next(),
            Some(SessionEvent::ClientAccepted { .. })
        ));
    }

    #[test]
    fn test_ack_rejects_wrong_kind_and_state() {
        let config = host_config();
        let mut host = Session::host(&config).unwrap();
        let _raw = TcpStream::connect(config.listen_addr()).unwrap();
        let id = accept_one(&mut host);

        let mut null = host.new_frame(Endpoint::HOST, Message::Null);
        null.header.from = Endpoint::Player(id);
        assert!(matches!(
            host.ack_join_request(&null),
            Err(SessionError::NotJoinRequest(_))
        ));

        let mut request = host.new_frame(
            Endpoint::HOST,
            Message::JoinRequest {
                name: String::from("LATE"),
            },
        );
        request.header.from = Endpoint::Player(PlayerId::new(2).unwrap());
        assert!(matches!(
            host.ack_join_request(&request),
            Err(SessionError::BadState(_))
        ));
    }

    #[test]
    fn test_kick_rejects_host_and_empty_slot() {
        let mut host = Session::host(&host_config()).unwrap();
        assert!(matches!(
            host.kick_client(PlayerId::HOST),
            Err(SessionError::KickHost)
        ));
        assert!(matches!(
            host.kick_client(PlayerId::new(3).unwrap()),
            Err(SessionError::InvalidPlayer(_))
        ));
    }

    #[test]
    fn test_failed_send_kicks_client() {
        let config = host_config();
        let mut host = Session::host(&config).unwrap();
        let mut client = Session::join(config.listen_addr(), &config).unwrap();

        let id = accept_one(&mut host);
        let request = next_frame(&mut host);
        host.ack_join_request(&request).unwrap();
        assert_eq!(host.num_clients(), 1);

        assert!(host.inject_faults(id, FaultInjection::failing_sends()));
        let err = host
            .send_message(Endpoint::Player(id), Message::Null)
            .unwrap_err();
        assert!(matches!(err, SessionError::Send { .. }));
        assert!(!err.is_invariant());
        assert_eq!(host.player(id).state, PlayerState::Offline);

        let left = next_frame(&mut host);
        assert!(matches!(left.message, Message::PlayerLeft { player, .. } if player == id));
        client.dispose(false);
    }

    #[test]
    fn test_advertising_toggles() {
        let mut host = Session::host(&host_config()).unwrap();
        assert!(!host.is_advertising());
        host.start_advertising().unwrap();
        assert!(host.is_advertising());
        assert!(host.advertise_tick().unwrap());
        assert!(host.stop_advertising());
        assert!(!host.stop_advertising());
        assert!(!host.advertise_tick().unwrap());
    }
}
